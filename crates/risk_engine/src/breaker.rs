//! Circuit breaker state machine.
//!
//! `Normal -> Active` when any trip condition holds. The consecutive-loss
//! path also starts a cooling-off period. `Active -> Normal` only on a health
//! check, once cooling-off has elapsed and no condition holds any more.

use chrono::{DateTime, Duration, Utc};
use common::config::RiskConfig;
use serde::Serialize;

use crate::engine::RiskState;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum TripCause {
    DailyLoss { loss: f64, limit: f64 },
    ConsecutiveLosses { count: u32, limit: u32 },
    Drawdown { drawdown_pct: f64, limit: f64 },
}

impl TripCause {
    pub fn describe(&self) -> String {
        match self {
            Self::DailyLoss { loss, limit } => {
                format!("daily loss {loss:.2} >= limit {limit:.2}")
            }
            Self::ConsecutiveLosses { count, limit } => {
                format!("{count} consecutive losses >= limit {limit}")
            }
            Self::Drawdown {
                drawdown_pct,
                limit,
            } => format!(
                "drawdown {:.2}% >= limit {:.2}%",
                drawdown_pct * 100.0,
                limit * 100.0
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "transition", rename_all = "snake_case")]
pub enum BreakerTransition {
    Tripped { causes: Vec<TripCause> },
    Reset,
    Unchanged,
}

/// Every condition currently over its limit.
pub fn trip_causes(state: &RiskState, config: &RiskConfig) -> Vec<TripCause> {
    let mut causes = Vec::new();

    let loss = (-state.daily_pnl).max(0.0);
    if config.daily_loss_limit > 0.0 && loss >= config.daily_loss_limit {
        causes.push(TripCause::DailyLoss {
            loss,
            limit: config.daily_loss_limit,
        });
    }
    if config.max_consecutive_losses > 0
        && state.consecutive_losses >= config.max_consecutive_losses
    {
        causes.push(TripCause::ConsecutiveLosses {
            count: state.consecutive_losses,
            limit: config.max_consecutive_losses,
        });
    }
    let dd = state.drawdown_pct();
    if config.max_drawdown_pct > 0.0 && dd >= config.max_drawdown_pct {
        causes.push(TripCause::Drawdown {
            drawdown_pct: dd,
            limit: config.max_drawdown_pct,
        });
    }
    causes
}

/// Advances the state machine. Resets are only considered when
/// `allow_reset` is set (the periodic health check).
pub fn evaluate(
    state: &mut RiskState,
    config: &RiskConfig,
    now: DateTime<Utc>,
    allow_reset: bool,
) -> BreakerTransition {
    if allow_reset {
        if let Some(until) = state.cooling_off_until {
            if now >= until {
                // cooling-off served; the streak that caused it is discharged
                state.cooling_off_until = None;
                state.consecutive_losses = 0;
            }
        }
    }

    let causes = trip_causes(state, config);
    let consecutive = causes
        .iter()
        .any(|c| matches!(c, TripCause::ConsecutiveLosses { .. }));

    if !state.circuit_breakers_active {
        if causes.is_empty() {
            return BreakerTransition::Unchanged;
        }
        state.circuit_breakers_active = true;
        state.tripped_at = Some(now);
        state.trip_reason = Some(
            causes
                .iter()
                .map(TripCause::describe)
                .collect::<Vec<_>>()
                .join("; "),
        );
        if consecutive {
            state.cooling_off_until = Some(now + Duration::hours(config.cooling_off_hours));
        }
        return BreakerTransition::Tripped { causes };
    }

    if consecutive && state.cooling_off_until.is_none() {
        state.cooling_off_until = Some(now + Duration::hours(config.cooling_off_hours));
    }

    if allow_reset && causes.is_empty() && state.cooling_off_until.is_none() {
        state.circuit_breakers_active = false;
        state.trip_reason = None;
        state.tripped_at = None;
        return BreakerTransition::Reset;
    }
    BreakerTransition::Unchanged
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 15, 0, 0).unwrap()
    }

    fn state() -> RiskState {
        RiskState::new(100_000.0, now())
    }

    #[test]
    fn test_daily_loss_trip_has_no_cooling_off() {
        let cfg = RiskConfig::default();
        let mut s = state();
        s.daily_pnl = -2_000.0;

        let t = evaluate(&mut s, &cfg, now(), false);
        assert!(matches!(t, BreakerTransition::Tripped { .. }));
        assert!(s.circuit_breakers_active);
        assert_eq!(s.cooling_off_until, None);
    }

    #[test]
    fn test_consecutive_losses_start_cooling_off() {
        let cfg = RiskConfig::default();
        let mut s = state();
        s.consecutive_losses = 4;

        evaluate(&mut s, &cfg, now(), false);
        assert_eq!(s.cooling_off_until, Some(now() + Duration::hours(4)));

        // still cooling off
        let t = evaluate(&mut s, &cfg, now() + Duration::hours(3), true);
        assert_eq!(t, BreakerTransition::Unchanged);
        assert!(s.circuit_breakers_active);

        let t = evaluate(&mut s, &cfg, now() + Duration::hours(4), true);
        assert_eq!(t, BreakerTransition::Reset);
        assert_eq!(s.consecutive_losses, 0);
        assert_eq!(s.trip_reason, None);
    }

    #[test]
    fn test_reset_waits_for_conditions_to_clear() {
        let cfg = RiskConfig::default();
        let mut s = state();
        s.daily_pnl = -2_500.0;
        evaluate(&mut s, &cfg, now(), false);

        assert_eq!(evaluate(&mut s, &cfg, now(), true), BreakerTransition::Unchanged);
        s.daily_pnl = 0.0;
        // outcome updates never reset
        assert_eq!(evaluate(&mut s, &cfg, now(), false), BreakerTransition::Unchanged);
        assert_eq!(evaluate(&mut s, &cfg, now(), true), BreakerTransition::Reset);
    }

    #[test]
    fn test_drawdown_trip() {
        let cfg = RiskConfig::default();
        let mut s = state();
        s.equity = 85_000.0;
        let causes = trip_causes(&s, &cfg);
        assert_eq!(causes.len(), 1);
        assert!(causes[0].describe().starts_with("drawdown 15.00%"));
    }
}
