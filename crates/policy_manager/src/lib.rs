//! Policy manager.
//!
//! Maps the accepted regime to a parameter template, adapts a private copy
//! for the regime, and keeps it tuned to trailing performance.

pub mod adaptation;
pub mod manager;
pub mod templates;

pub use manager::{PolicyManager, RegimeInfo};
