//! Per-regime weighted rule table.
//!
//! Each regime owns a list of named `(predicate, weight)` pairs. A regime's
//! score is the weight of the rules that fire divided by its total weight.

use common::config::RegimeConfig;
use common::{RegimeType, TradingSession};

use crate::features::RegimeFeatures;

pub type Predicate = fn(&RegimeFeatures, &RegimeConfig) -> bool;

#[derive(Clone, Copy)]
pub struct Rule {
    pub name: &'static str,
    pub weight: f64,
    pub predicate: Predicate,
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("weight", &self.weight)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct RuleSet {
    pub regime: RegimeType,
    pub rules: Vec<Rule>,
}

impl RuleSet {
    /// Normalized score in [0, 1] and the names of the rules that fired.
    pub fn evaluate(
        &self,
        features: &RegimeFeatures,
        config: &RegimeConfig,
    ) -> (f64, Vec<&'static str>) {
        let total: f64 = self.rules.iter().map(|r| r.weight).sum();
        if total <= 0.0 {
            return (0.0, Vec::new());
        }
        let mut fired = Vec::new();
        let mut score = 0.0;
        for rule in &self.rules {
            if (rule.predicate)(features, config) {
                score += rule.weight;
                fired.push(rule.name);
            }
        }
        ((score / total).clamp(0.0, 1.0), fired)
    }
}

fn rule(name: &'static str, weight: f64, predicate: Predicate) -> Rule {
    Rule {
        name,
        weight,
        predicate,
    }
}

fn majority(frac: f64) -> bool {
    frac >= 0.5
}

/// Rule sets for every regime except `Normal`, in `RegimeType::SCORED` order.
pub fn rule_table() -> Vec<RuleSet> {
    vec![
        RuleSet {
            regime: RegimeType::StrongTrend,
            rules: vec![
                rule("wide_value_areas", 0.25, |f, _| majority(f.wide_value_area_frac)),
                rule("high_volume_imbalance", 0.30, |f, c| {
                    f.avg_imbalance >= c.high_imbalance
                }),
                rule("low_0dte_share", 0.20, |f, c| f.zero_dte_share <= c.low_0dte_share),
                rule("trend_hint", 0.15, |f, _| f.hint == Some(RegimeType::StrongTrend)),
                rule("opening_drive", 0.10, |f, _| f.session == TradingSession::Opening),
            ],
        },
        RuleSet {
            regime: RegimeType::WeakTrend,
            rules: vec![
                rule("moderate_volume_imbalance", 0.35, |f, c| {
                    f.avg_imbalance >= c.moderate_imbalance && f.avg_imbalance < c.high_imbalance
                }),
                rule("average_value_areas", 0.25, |f, _| {
                    !majority(f.tight_value_area_frac) && !majority(f.wide_value_area_frac)
                }),
                rule("balanced_put_call", 0.15, |f, c| {
                    f.put_call_ratio > c.put_call_extreme_low
                        && f.put_call_ratio < c.put_call_extreme_high
                }),
                rule("moderate_0dte_share", 0.15, |f, c| {
                    f.zero_dte_share > c.low_0dte_share && f.zero_dte_share < c.high_0dte_share
                }),
                rule("weak_trend_hint", 0.10, |f, _| f.hint == Some(RegimeType::WeakTrend)),
            ],
        },
        RuleSet {
            regime: RegimeType::MeanReversion,
            rules: vec![
                rule("balanced_profile", 0.30, |f, c| f.avg_imbalance < c.moderate_imbalance),
                rule("dense_hvns", 0.25, |f, c| f.hvn_density >= c.hvn_density_high),
                rule("contained_value_areas", 0.15, |f, _| f.wide_value_area_frac < 1.0 / 3.0),
                rule("midday_session", 0.15, |f, _| f.session == TradingSession::Midday),
                rule("range_hint", 0.15, |f, _| f.hint == Some(RegimeType::MeanReversion)),
            ],
        },
        RuleSet {
            regime: RegimeType::GammaSqueeze,
            rules: vec![
                rule("very_high_0dte_share", 0.35, |f, c| {
                    f.zero_dte_share >= c.high_0dte_share
                }),
                rule("tight_value_areas", 0.25, |f, _| {
                    f.tight_value_area_frac >= 2.0 / 3.0
                }),
                rule("friday_expiry", 0.15, |f, _| f.is_friday),
                rule("no_put_skew", 0.10, |f, c| f.put_call_ratio < c.put_call_extreme_high),
                rule("high_gamma_concentration", 0.15, |f, c| {
                    f.gamma_concentration >= c.high_gamma_concentration
                }),
            ],
        },
        RuleSet {
            regime: RegimeType::Pinning,
            rules: vec![
                rule("pinning_gamma", 0.35, |f, c| {
                    f.gamma_concentration >= c.pinning_gamma_concentration
                }),
                rule("tight_value_areas", 0.20, |f, _| majority(f.tight_value_area_frac)),
                rule("dense_hvns", 0.15, |f, c| f.hvn_density >= c.hvn_density_high),
                rule("closing_session", 0.15, |f, _| f.session == TradingSession::Closing),
                rule("elevated_0dte_share", 0.15, |f, c| f.zero_dte_share >= c.low_0dte_share),
            ],
        },
        RuleSet {
            regime: RegimeType::HighVolatility,
            rules: vec![
                rule("wide_value_areas", 0.25, |f, _| majority(f.wide_value_area_frac)),
                rule("put_call_extreme", 0.25, |f, c| {
                    f.put_call_ratio >= c.put_call_extreme_high
                        || f.put_call_ratio <= c.put_call_extreme_low
                }),
                rule("thin_profile", 0.15, |f, _| f.lvn_density > f.hvn_density),
                rule("opening_session", 0.15, |f, _| f.session == TradingSession::Opening),
                rule("volatility_hint", 0.20, |f, _| {
                    f.hint == Some(RegimeType::HighVolatility)
                }),
            ],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features() -> RegimeFeatures {
        RegimeFeatures {
            zero_dte_share: 0.35,
            put_call_ratio: 1.0,
            gamma_concentration: 0.3,
            tight_value_area_frac: 0.0,
            wide_value_area_frac: 0.0,
            avg_value_area_pct: 0.01,
            avg_imbalance: 0.2,
            hvn_density: 1.0,
            lvn_density: 1.0,
            instruments: 3,
            is_friday: false,
            session: TradingSession::Midday,
            hour: 12,
            hint: None,
        }
    }

    fn set(regime: RegimeType) -> RuleSet {
        rule_table()
            .into_iter()
            .find(|s| s.regime == regime)
            .unwrap()
    }

    #[test]
    fn test_table_covers_scored_regimes_in_order() {
        let regimes: Vec<RegimeType> = rule_table().iter().map(|s| s.regime).collect();
        assert_eq!(regimes, RegimeType::SCORED.to_vec());
        for s in rule_table() {
            let total: f64 = s.rules.iter().map(|r| r.weight).sum();
            assert!((total - 1.0).abs() < 1e-9, "{} weights sum to {total}", s.regime);
        }
    }

    #[test]
    fn test_gamma_rules_fire_individually() {
        let cfg = RegimeConfig::default();
        let gamma = set(RegimeType::GammaSqueeze);

        let mut f = features();
        f.zero_dte_share = 0.7;
        let (score, fired) = gamma.evaluate(&f, &cfg);
        assert!(fired.contains(&"very_high_0dte_share"));
        assert!(fired.contains(&"no_put_skew"));
        assert!((score - 0.45).abs() < 1e-9);

        f.is_friday = true;
        f.tight_value_area_frac = 1.0;
        let (score, _) = gamma.evaluate(&f, &cfg);
        assert!((score - 0.85).abs() < 1e-9);
    }

    #[test]
    fn test_strong_trend_rewards_wide_imbalanced_profiles() {
        let cfg = RegimeConfig::default();
        let mut f = features();
        f.wide_value_area_frac = 1.0;
        f.avg_imbalance = 0.5;
        f.zero_dte_share = 0.2;
        let (score, fired) = set(RegimeType::StrongTrend).evaluate(&f, &cfg);
        assert!((score - 0.75).abs() < 1e-9);
        assert_eq!(
            fired,
            vec!["wide_value_areas", "high_volume_imbalance", "low_0dte_share"]
        );
    }

    #[test]
    fn test_pinning_needs_concentrated_gamma() {
        let cfg = RegimeConfig::default();
        let mut f = features();
        f.gamma_concentration = 0.8;
        f.session = TradingSession::Closing;
        f.tight_value_area_frac = 1.0;
        let (score, _) = set(RegimeType::Pinning).evaluate(&f, &cfg);
        assert!((score - 0.85).abs() < 1e-9);
    }
}
