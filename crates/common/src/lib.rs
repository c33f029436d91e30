//! Shared types, config, and error definitions for the adaptive control layer.

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use cache::TtlCache;
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::EngineConfig;
pub use error::Error;
pub use types::*;

/// Convenience Result alias.
pub type Result<T> = std::result::Result<T, Error>;
