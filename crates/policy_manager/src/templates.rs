//! Fixed regime → template table and the template parameter sets.

use std::collections::BTreeMap;

use common::{PolicyParameters, PolicyType, RegimeType};

pub fn template_for(regime: RegimeType) -> PolicyType {
    match regime {
        RegimeType::StrongTrend => PolicyType::AggressiveTrend,
        RegimeType::WeakTrend => PolicyType::ConservativeTrend,
        RegimeType::MeanReversion => PolicyType::MeanReversion,
        RegimeType::GammaSqueeze => PolicyType::GammaSqueeze,
        RegimeType::Pinning => PolicyType::RangeBound,
        RegimeType::HighVolatility => PolicyType::Defensive,
        RegimeType::Normal => PolicyType::ConservativeTrend,
    }
}

/// Next template down when a template has been performing poorly.
pub fn defensive_fallback(policy: PolicyType) -> PolicyType {
    match policy {
        PolicyType::AggressiveTrend => PolicyType::ConservativeTrend,
        _ => PolicyType::Defensive,
    }
}

fn weights(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
    pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

pub fn template(policy: PolicyType) -> PolicyParameters {
    let trend_timeframes = weights(&[("1m", 0.10), ("5m", 0.30), ("15m", 0.35), ("1h", 0.25)]);
    let fast_timeframes = weights(&[("1m", 0.35), ("5m", 0.40), ("15m", 0.20), ("1h", 0.05)]);

    match policy {
        PolicyType::AggressiveTrend => PolicyParameters {
            max_position_size: 0.03,
            risk_reward_min: 1.5,
            max_concurrent_trades: 5,
            max_daily_trades: 12,
            min_confidence: 0.55,
            confluence_required: 2,
            stop_multiplier: 1.0,
            target_multiplier: 2.5,
            trailing_stop: true,
            timeframe_weights: trend_timeframes,
            indicator_weights: weights(&[
                ("momentum", 0.35),
                ("trend", 0.35),
                ("volume_profile", 0.20),
                ("mean_reversion", 0.10),
            ]),
        },
        PolicyType::ConservativeTrend => PolicyParameters {
            max_position_size: 0.02,
            risk_reward_min: 2.0,
            max_concurrent_trades: 3,
            max_daily_trades: 8,
            min_confidence: 0.65,
            confluence_required: 3,
            stop_multiplier: 1.0,
            target_multiplier: 2.0,
            trailing_stop: true,
            timeframe_weights: trend_timeframes,
            indicator_weights: weights(&[
                ("momentum", 0.25),
                ("trend", 0.35),
                ("volume_profile", 0.25),
                ("mean_reversion", 0.15),
            ]),
        },
        PolicyType::MeanReversion => PolicyParameters {
            max_position_size: 0.015,
            risk_reward_min: 1.5,
            max_concurrent_trades: 4,
            max_daily_trades: 10,
            min_confidence: 0.6,
            confluence_required: 2,
            stop_multiplier: 0.8,
            target_multiplier: 1.5,
            trailing_stop: false,
            timeframe_weights: fast_timeframes,
            indicator_weights: weights(&[
                ("momentum", 0.10),
                ("trend", 0.10),
                ("volume_profile", 0.35),
                ("mean_reversion", 0.45),
            ]),
        },
        PolicyType::GammaSqueeze => PolicyParameters {
            max_position_size: 0.01,
            risk_reward_min: 2.0,
            max_concurrent_trades: 2,
            max_daily_trades: 6,
            min_confidence: 0.7,
            confluence_required: 3,
            stop_multiplier: 1.2,
            target_multiplier: 2.0,
            trailing_stop: true,
            timeframe_weights: fast_timeframes,
            indicator_weights: weights(&[
                ("momentum", 0.40),
                ("trend", 0.20),
                ("volume_profile", 0.30),
                ("mean_reversion", 0.10),
            ]),
        },
        PolicyType::RangeBound => PolicyParameters {
            max_position_size: 0.015,
            risk_reward_min: 1.5,
            max_concurrent_trades: 3,
            max_daily_trades: 8,
            min_confidence: 0.6,
            confluence_required: 2,
            stop_multiplier: 0.8,
            target_multiplier: 1.2,
            trailing_stop: false,
            timeframe_weights: fast_timeframes,
            indicator_weights: weights(&[
                ("momentum", 0.10),
                ("trend", 0.05),
                ("volume_profile", 0.50),
                ("mean_reversion", 0.35),
            ]),
        },
        PolicyType::Defensive => PolicyParameters {
            max_position_size: 0.0075,
            risk_reward_min: 2.5,
            max_concurrent_trades: 2,
            max_daily_trades: 4,
            min_confidence: 0.75,
            confluence_required: 4,
            stop_multiplier: 1.2,
            target_multiplier: 2.0,
            trailing_stop: false,
            timeframe_weights: trend_timeframes,
            indicator_weights: weights(&[
                ("momentum", 0.20),
                ("trend", 0.30),
                ("volume_profile", 0.30),
                ("mean_reversion", 0.20),
            ]),
        },
    }
}
