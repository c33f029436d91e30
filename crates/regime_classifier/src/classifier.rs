use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use audit_store::SharedStore;
use chrono::{DateTime, Utc};
use common::config::RegimeConfig;
use common::{MarketContextFeatures, RegimeType, RegimeVerdict, SharedClock, VolumeProfileFeatures};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::features::RegimeFeatures;
use crate::rules::{rule_table, RuleSet};

pub const FALLBACK_FACTOR: &str = "fallback_detection";

pub struct RegimeClassifier {
    config: RegimeConfig,
    rules: Vec<RuleSet>,
    store: SharedStore,
    clock: SharedClock,
    history: RwLock<VecDeque<Arc<RegimeVerdict>>>,
    latest: RwLock<Option<Arc<RegimeVerdict>>>,
}

impl RegimeClassifier {
    /// Builds the classifier and warms its stability history from the store.
    pub fn new(config: RegimeConfig, store: SharedStore, clock: SharedClock) -> Self {
        let recent = store.recent_regimes(config.history_size);
        let history: VecDeque<Arc<RegimeVerdict>> = match recent {
            Ok(verdicts) => verdicts.into_iter().map(Arc::new).collect(),
            Err(e) => {
                warn!(error = %e, "failed to load regime history; starting cold");
                VecDeque::new()
            }
        };
        let latest = history.back().cloned();
        Self {
            config,
            rules: rule_table(),
            store,
            clock,
            history: RwLock::new(history),
            latest: RwLock::new(latest),
        }
    }

    /// Classifies the current market. Never fails: malformed inputs yield the
    /// fallback verdict.
    pub async fn detect(
        &self,
        context: &MarketContextFeatures,
        profiles: &[VolumeProfileFeatures],
    ) -> Arc<RegimeVerdict> {
        let now = self.clock.now();
        let mut history = self.history.write().await;

        let verdict = match RegimeFeatures::derive(context, profiles, &self.config) {
            Ok(features) => {
                self.classify(&features, history.back().map(|v| v.regime), &history, now)
            }
            Err(e) => {
                warn!(error = %e, "regime inputs rejected; using fallback verdict");
                self.fallback(now)
            }
        };
        let verdict = Arc::new(verdict);

        if let Err(e) = self.store.append_regime(&verdict) {
            warn!(error = %e, "failed to persist regime verdict");
        }
        history.push_back(Arc::clone(&verdict));
        while history.len() > self.config.history_size.max(1) {
            history.pop_front();
        }
        *self.latest.write().await = Some(Arc::clone(&verdict));
        drop(history);

        info!(
            regime = %verdict.regime,
            confidence = verdict.confidence,
            factors = ?verdict.contributing_factors,
            "regime detected"
        );
        verdict
    }

    /// Most recent completed verdict.
    pub async fn latest(&self) -> Option<Arc<RegimeVerdict>> {
        self.latest.read().await.clone()
    }

    /// In-memory history, oldest first.
    pub async fn history(&self) -> Vec<Arc<RegimeVerdict>> {
        self.history.read().await.iter().cloned().collect()
    }

    /// Raw per-regime scores, including `Normal`.
    pub fn score(
        &self,
        features: &RegimeFeatures,
    ) -> BTreeMap<RegimeType, (f64, Vec<&'static str>)> {
        let mut scores: BTreeMap<RegimeType, (f64, Vec<&'static str>)> = self
            .rules
            .iter()
            .map(|set| (set.regime, set.evaluate(features, &self.config)))
            .collect();
        let best_other = scores.values().map(|(s, _)| *s).fold(0.0, f64::max);
        let normal = self.config.normal_score_floor.max(1.0 - best_other);
        scores.insert(RegimeType::Normal, (normal, vec!["no_dominant_regime"]));
        scores
    }

    fn classify(
        &self,
        features: &RegimeFeatures,
        previous: Option<RegimeType>,
        history: &VecDeque<Arc<RegimeVerdict>>,
        now: DateTime<Utc>,
    ) -> RegimeVerdict {
        let scores = self.score(features);

        // argmax in declaration order, Normal last so real regimes win ties
        let mut winner = RegimeType::Normal;
        let mut best = f64::NEG_INFINITY;
        for regime in RegimeType::ALL {
            if let Some((score, _)) = scores.get(&regime) {
                if *score > best {
                    best = *score;
                    winner = regime;
                }
            }
        }
        let fired = scores
            .get(&winner)
            .map(|(_, f)| f.clone())
            .unwrap_or_default();

        let agreeing = RegimeType::SCORED
            .iter()
            .filter_map(|r| scores.get(r))
            .filter(|(s, _)| *s > self.config.agreement_threshold)
            .count();
        let streak = previous.map(|prev| {
            let n = history.iter().rev().take_while(|v| v.regime == prev).count();
            (prev, n)
        });

        let (confidence, adjustments) =
            shape_confidence(&self.config, best, winner, agreeing, streak);
        debug!(%winner, raw = best, confidence, agreeing, "regime scored");

        let mut contributing_factors: Vec<String> = fired.iter().map(|s| s.to_string()).collect();
        contributing_factors.extend(adjustments.iter().map(|s| s.to_string()));

        RegimeVerdict {
            regime: winner,
            confidence,
            detected_at: now,
            contributing_factors,
            component_scores: scores
                .iter()
                .map(|(r, (s, _))| (r.as_str().to_string(), *s))
                .collect(),
        }
    }

    fn fallback(&self, now: DateTime<Utc>) -> RegimeVerdict {
        RegimeVerdict {
            regime: RegimeType::Normal,
            confidence: self.config.fallback_confidence,
            detected_at: now,
            contributing_factors: vec![FALLBACK_FACTOR.to_string()],
            component_scores: BTreeMap::new(),
        }
    }
}

/// Applies agreement, single-signal and stability adjustments to the winning
/// score. `streak` is the previous regime and how many trailing verdicts it held.
pub fn shape_confidence(
    config: &RegimeConfig,
    raw: f64,
    winner: RegimeType,
    agreeing_regimes: usize,
    streak: Option<(RegimeType, usize)>,
) -> (f64, Vec<&'static str>) {
    let mut confidence = raw;
    let mut applied = Vec::new();

    if agreeing_regimes >= config.agreement_min_count {
        confidence = (confidence * (1.0 + config.agreement_boost)).min(1.0);
        applied.push("multi_signal_agreement");
    }
    if winner != RegimeType::Normal && agreeing_regimes == 1 {
        confidence *= 1.0 - config.single_signal_penalty;
        applied.push("single_signal");
    }
    if let Some((previous, held)) = streak {
        if previous != winner && held < config.min_consecutive_cycles {
            confidence *= config.stability_penalty;
            applied.push("stability_penalty");
        }
    }

    (confidence.clamp(0.0, 1.0), applied)
}
