//! Adaptive position sizing and circuit breakers.

pub mod adjustments;
pub mod breaker;
pub mod engine;
pub mod kelly;

pub use breaker::{BreakerTransition, TripCause};
pub use engine::{BREAKER_REASON, OpenPosition, RiskEngine, RiskMetrics, RiskState};
pub use kelly::KellyEstimate;
