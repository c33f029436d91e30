//! Independent multiplicative sizing factors. Each is clamped to its own range.

use common::config::RiskConfig;
use common::RegimeType;

/// Inverse to realized volatility relative to target. Unknown volatility is neutral.
pub fn volatility(realized: Option<f64>, config: &RiskConfig) -> f64 {
    match realized {
        Some(v) if v.is_finite() && v > 0.0 => (config.target_volatility / v)
            .powf(config.volatility_scaling)
            .clamp(0.3, 2.0),
        _ => 1.0,
    }
}

/// Per-regime multiplier scaled by how much of the hard ceiling the policy allows.
pub fn regime(regime: RegimeType, policy_max_size: f64, config: &RiskConfig) -> f64 {
    let multiplier = config.regime_multipliers.get(&regime).copied().unwrap_or(1.0);
    let ratio = if config.max_position_pct > 0.0 {
        (policy_max_size / config.max_position_pct).clamp(0.0, 1.0)
    } else {
        1.0
    };
    (multiplier * ratio).clamp(0.1, 2.0)
}

pub fn correlation_between(a: &str, b: &str, config: &RiskConfig) -> f64 {
    if a == b {
        return 1.0;
    }
    config
        .correlations
        .iter()
        .find(|p| (p.a == a && p.b == b) || (p.a == b && p.b == a))
        .map(|p| p.rho.abs())
        .unwrap_or(config.default_correlation)
}

/// Penalty of up to `max_correlation_penalty` once the strongest correlation
/// with an open position exceeds the ceiling.
pub fn correlation<'a>(
    instrument: &str,
    open_instruments: impl IntoIterator<Item = &'a str>,
    config: &RiskConfig,
) -> f64 {
    let strongest = open_instruments
        .into_iter()
        .map(|other| correlation_between(instrument, other, config))
        .fold(0.0, f64::max);
    if strongest <= config.correlation_ceiling || config.correlation_ceiling >= 1.0 {
        return 1.0;
    }
    let excess = (strongest - config.correlation_ceiling) / (1.0 - config.correlation_ceiling);
    (1.0 - config.max_correlation_penalty * excess.clamp(0.0, 1.0))
        .clamp(1.0 - config.max_correlation_penalty, 1.0)
}

/// Boost to 1.3x on a strong score, cut to 0.5x on a weak one. `None` when
/// history is too thin to judge.
pub fn performance(score: Option<f64>) -> f64 {
    match score {
        Some(s) if s >= 0.0 => (1.0 + 0.3 * s).clamp(0.5, 1.3),
        Some(s) => (1.0 + 0.5 * s).clamp(0.5, 1.3),
        None => 1.0,
    }
}

/// Linear cut from 1.0 at the reduction start to 0.2 at the drawdown limit.
pub fn drawdown(drawdown_pct: f64, config: &RiskConfig) -> f64 {
    let limit = config.max_drawdown_pct;
    let start = limit * config.drawdown_reduction_start;
    if drawdown_pct <= start || limit <= start {
        return 1.0;
    }
    let progress = ((drawdown_pct - start) / (limit - start)).clamp(0.0, 1.0);
    (1.0 - 0.8 * progress).clamp(0.2, 1.0)
}

pub fn confidence(signal_confidence: f64) -> f64 {
    let c = if signal_confidence.is_finite() {
        signal_confidence.clamp(0.0, 1.0)
    } else {
        0.0
    };
    0.2 + 1.3 * c
}
