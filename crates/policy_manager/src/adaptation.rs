//! Multiplicative parameter adjustments. Every function returns a new copy.

use common::config::PolicyConfig;
use common::{PolicyParameters, RegimeType};

/// Regime-specific deltas applied on top of the chosen template.
pub fn adapt_for_regime(
    base: &PolicyParameters,
    regime: RegimeType,
    config: &PolicyConfig,
) -> PolicyParameters {
    let mut p = base.clone();
    match regime {
        RegimeType::HighVolatility => {
            p.max_position_size *= 0.6;
            p.stop_multiplier *= 1.3;
            p.min_confidence *= 1.1;
        }
        RegimeType::GammaSqueeze => {
            p.max_concurrent_trades = scale_count(p.max_concurrent_trades, 0.5);
            p.min_confidence *= 1.15;
            p.target_multiplier *= 1.2;
        }
        RegimeType::StrongTrend => {
            p.target_multiplier *= 1.2;
            p.trailing_stop = true;
        }
        RegimeType::Pinning => {
            p.target_multiplier *= 0.8;
            p.max_daily_trades = scale_count(p.max_daily_trades, 0.7);
        }
        RegimeType::MeanReversion => {
            p.stop_multiplier *= 0.9;
            p.target_multiplier *= 0.9;
        }
        RegimeType::WeakTrend | RegimeType::Normal => {}
    }
    clamp_to_ceilings(p, config)
}

/// Small step toward tighter or looser parameters from a trailing
/// performance score. `None` when the score sits between the thresholds.
pub fn nudge_for_performance(
    current: &PolicyParameters,
    performance_score: f64,
    config: &PolicyConfig,
) -> Option<PolicyParameters> {
    let mut p = current.clone();
    if performance_score <= config.poor_performance_score {
        p.min_confidence += config.confidence_nudge;
        p.max_position_size *= config.size_nudge_down;
    } else if performance_score >= config.good_performance_score {
        p.max_position_size *= config.size_nudge_up;
        p.max_concurrent_trades = p.max_concurrent_trades.saturating_add(1);
    } else {
        return None;
    }
    Some(clamp_to_ceilings(p, config))
}

/// Ceilings first, floors last: a misconfigured ceiling below its floor
/// yields the floor rather than a panic.
pub fn clamp_to_ceilings(mut p: PolicyParameters, config: &PolicyConfig) -> PolicyParameters {
    p.max_position_size = p
        .max_position_size
        .min(config.max_position_ceiling)
        .max(config.min_position_floor);
    p.max_concurrent_trades = p.max_concurrent_trades.min(config.max_concurrent_ceiling).max(1);
    p.max_daily_trades = p.max_daily_trades.max(1);
    p.min_confidence = p.min_confidence.min(config.min_confidence_ceiling).max(0.0);
    p
}

fn scale_count(n: u32, factor: f64) -> u32 {
    ((n as f64 * factor).round() as u32).max(1)
}
