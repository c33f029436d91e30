//! Signal outcome tracker.
//!
//! Durable log of every emitted signal and its realized result, plus the
//! aggregations the policy manager and risk engine learn from.

pub mod importance;
pub mod metrics;
pub mod tracker;

pub use metrics::{performance_score, PerformanceMetrics};
pub use tracker::{OutcomeTracker, ResolveStatus};
