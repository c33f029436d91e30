use std::sync::Arc;

use audit_store::SharedStore;
use chrono::{DateTime, Duration, Utc};
use common::config::PolicyConfig;
use common::{
    PolicyEvent, PolicyParameters, PolicyPerformance, PolicyRecord, PolicyState, PolicyType,
    RegimeType, RegimeVerdict, SharedClock,
};
use outcome_tracker::{performance_score, OutcomeTracker};
use regime_classifier::RegimeClassifier;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::adaptation::{adapt_for_regime, nudge_for_performance};
use crate::templates::{defensive_fallback, template, template_for};

/// Why a verdict did or did not move the active policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchDecision {
    Accept,
    LowConfidence,
    DwellTime,
    NoImprovement,
}

/// Regime currently driving the policy, plus the latest raw verdict.
#[derive(Debug, Clone, Serialize)]
pub struct RegimeInfo {
    pub regime: RegimeType,
    pub confidence: f64,
    pub regime_since: DateTime<Utc>,
    pub policy_type: PolicyType,
    pub active_since: DateTime<Utc>,
    pub latest_verdict: Option<RegimeVerdict>,
}

pub struct PolicyManager {
    config: PolicyConfig,
    classifier: Arc<RegimeClassifier>,
    tracker: Arc<OutcomeTracker>,
    store: SharedStore,
    clock: SharedClock,
    state: RwLock<PolicyState>,
}

/// Switch rule: confident verdicts only, no same-regime churn inside the
/// dwell window, and a same-regime re-activation needs a clear confidence gain.
pub fn evaluate_switch(
    config: &PolicyConfig,
    state: &PolicyState,
    verdict: &RegimeVerdict,
    now: DateTime<Utc>,
) -> SwitchDecision {
    if verdict.confidence < config.min_switch_confidence {
        return SwitchDecision::LowConfidence;
    }
    if verdict.regime == state.regime {
        if now - state.regime_since < Duration::minutes(config.min_regime_dwell_minutes) {
            return SwitchDecision::DwellTime;
        }
        if verdict.confidence - state.regime_confidence > config.confidence_improvement_threshold {
            return SwitchDecision::Accept;
        }
        return SwitchDecision::NoImprovement;
    }
    SwitchDecision::Accept
}

/// Trade-weighted blend of several performance windows.
fn blend<'a>(windows: impl IntoIterator<Item = &'a PolicyPerformance>) -> PolicyPerformance {
    let mut trades = 0u32;
    let mut wins = 0.0;
    let mut r_sum = 0.0;
    for w in windows {
        trades += w.trades;
        wins += w.win_rate * w.trades as f64;
        r_sum += w.avg_r_multiple * w.trades as f64;
    }
    if trades == 0 {
        return PolicyPerformance::default();
    }
    let win_rate = wins / trades as f64;
    let avg_r_multiple = r_sum / trades as f64;
    PolicyPerformance {
        trades,
        win_rate,
        avg_r_multiple,
        performance_score: performance_score(win_rate, avg_r_multiple),
    }
}

impl PolicyManager {
    /// Starts on the conservative template under a `Normal` regime.
    pub fn new(
        config: PolicyConfig,
        classifier: Arc<RegimeClassifier>,
        tracker: Arc<OutcomeTracker>,
        store: SharedStore,
        clock: SharedClock,
    ) -> Self {
        let now = clock.now();
        let policy_type = template_for(RegimeType::Normal);
        let state = PolicyState {
            policy_type,
            parameters: adapt_for_regime(&template(policy_type), RegimeType::Normal, &config),
            regime: RegimeType::Normal,
            regime_confidence: 0.0,
            regime_since: now,
            active_since: now,
            last_update: now,
            performance: PolicyPerformance::default(),
        };
        let manager = Self {
            config,
            classifier,
            tracker,
            store,
            clock,
            state: RwLock::new(state.clone()),
        };
        manager.persist(&activation_record(&state));
        manager
    }

    /// One policy cycle. Returns true when a new policy was activated.
    pub async fn update(&self) -> bool {
        let now = self.clock.now();
        let verdict = self.classifier.latest().await;
        let mut state = self.state.write().await;

        if let Some(verdict) = verdict.as_deref() {
            match evaluate_switch(&self.config, &state, verdict, now) {
                SwitchDecision::Accept => {
                    self.activate(&mut state, verdict, now);
                    return true;
                }
                decision => debug!(
                    regime = %verdict.regime,
                    confidence = verdict.confidence,
                    ?decision,
                    "policy switch rejected"
                ),
            }
        }

        self.adapt_continuously(&mut state, now);
        false
    }

    pub async fn current_parameters(&self) -> PolicyParameters {
        self.state.read().await.parameters.clone()
    }

    pub async fn current_state(&self) -> PolicyState {
        self.state.read().await.clone()
    }

    pub async fn current_regime_info(&self) -> RegimeInfo {
        let latest = self.classifier.latest().await;
        let state = self.state.read().await;
        RegimeInfo {
            regime: state.regime,
            confidence: state.regime_confidence,
            regime_since: state.regime_since,
            policy_type: state.policy_type,
            active_since: state.active_since,
            latest_verdict: latest.map(|v| (*v).clone()),
        }
    }

    /// Activation and finalization records over the trailing window.
    pub fn policy_history(&self, days_back: i64) -> Vec<PolicyRecord> {
        let since = self.clock.now() - Duration::days(days_back);
        self.store.policy_records_since(since).unwrap_or_else(|e| {
            warn!(error = %e, "failed to load policy history");
            Vec::new()
        })
    }

    fn activate(&self, state: &mut PolicyState, verdict: &RegimeVerdict, now: DateTime<Utc>) {
        let policy_type = self.select_template(verdict.regime, now);
        let parameters = adapt_for_regime(&template(policy_type), verdict.regime, &self.config);

        // close out the outgoing policy with what it actually delivered
        let realized = self
            .tracker
            .performance_between(state.active_since, now)
            .as_policy_performance();
        self.persist(&PolicyRecord {
            policy_type: state.policy_type,
            event: PolicyEvent::Finalized,
            regime: state.regime,
            regime_confidence: state.regime_confidence,
            parameters: state.parameters.clone(),
            started_at: state.active_since,
            ended_at: Some(now),
            performance: Some(realized),
        });

        let regime_since = if verdict.regime == state.regime {
            state.regime_since
        } else {
            verdict.detected_at
        };
        let previous = state.policy_type;
        *state = PolicyState {
            policy_type,
            parameters,
            regime: verdict.regime,
            regime_confidence: verdict.confidence,
            regime_since,
            active_since: now,
            last_update: now,
            performance: PolicyPerformance::default(),
        };
        self.persist(&activation_record(state));

        info!(
            from = %previous,
            to = %policy_type,
            regime = %verdict.regime,
            confidence = verdict.confidence,
            "policy switched"
        );
    }

    /// Preferred template for the regime, stepped down while its trailing
    /// finalized history is poor.
    fn select_template(&self, regime: RegimeType, now: DateTime<Utc>) -> PolicyType {
        let since = now - Duration::days(self.config.template_lookback_days);
        let records = self.store.policy_records_since(since).unwrap_or_else(|e| {
            warn!(error = %e, "failed to load policy history; using preferred template");
            Vec::new()
        });

        let mut candidate = template_for(regime);
        loop {
            let history = blend(
                records
                    .iter()
                    .filter(|r| r.policy_type == candidate && r.event == PolicyEvent::Finalized)
                    .filter_map(|r| r.performance.as_ref()),
            );
            let poor = history.trades >= self.config.min_trades_for_override
                && (history.win_rate < self.config.poor_win_rate
                    || history.avg_r_multiple < self.config.poor_avg_r);
            if !poor {
                return candidate;
            }
            let next = defensive_fallback(candidate);
            if next == candidate {
                return candidate;
            }
            info!(
                template = %candidate,
                fallback = %next,
                win_rate = history.win_rate,
                avg_r = history.avg_r_multiple,
                "template underperforming; stepping down"
            );
            candidate = next;
        }
    }

    fn adapt_continuously(&self, state: &mut PolicyState, now: DateTime<Utc>) {
        let live = self
            .tracker
            .performance_between(state.active_since, now)
            .as_policy_performance();

        let since = now - Duration::days(self.config.adaptation_lookback_days);
        let earlier = self.store.policy_records_since(since).unwrap_or_else(|e| {
            warn!(error = %e, "failed to load policy history for adaptation");
            Vec::new()
        });
        let trailing = blend(
            earlier
                .iter()
                .filter(|r| r.policy_type == state.policy_type && r.event == PolicyEvent::Finalized)
                .filter_map(|r| r.performance.as_ref())
                .chain(std::iter::once(&live)),
        );

        state.performance = live;
        state.last_update = now;

        if trailing.trades < self.config.min_trades_for_adaptation {
            return;
        }
        if let Some(adapted) =
            nudge_for_performance(&state.parameters, trailing.performance_score, &self.config)
        {
            if adapted != state.parameters {
                info!(
                    policy = %state.policy_type,
                    score = trailing.performance_score,
                    max_position_size = adapted.max_position_size,
                    min_confidence = adapted.min_confidence,
                    "policy parameters adapted"
                );
                state.parameters = adapted;
            }
        }
    }

    fn persist(&self, record: &PolicyRecord) {
        if let Err(e) = self.store.append_policy_record(record) {
            warn!(policy = %record.policy_type, error = %e, "failed to persist policy record");
        }
    }
}

fn activation_record(state: &PolicyState) -> PolicyRecord {
    PolicyRecord {
        policy_type: state.policy_type,
        event: PolicyEvent::Activated,
        regime: state.regime,
        regime_confidence: state.regime_confidence,
        parameters: state.parameters.clone(),
        started_at: state.active_since,
        ended_at: None,
        performance: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use audit_store::MemoryStore;
    use chrono::TimeZone;
    use common::config::{RegimeConfig, TrackerConfig};
    use common::{
        Clock, Direction, ManualClock, MarketContextFeatures, SignalFeatures, SignalOutcome,
        SignalSnapshot, VolumeProfileFeatures,
    };
    use std::collections::BTreeMap;

    struct Harness {
        manager: PolicyManager,
        classifier: Arc<RegimeClassifier>,
        tracker: Arc<OutcomeTracker>,
        store: SharedStore,
        clock: Arc<ManualClock>,
    }

    fn t0() -> DateTime<Utc> {
        // a Friday
        Utc.with_ymd_and_hms(2024, 3, 1, 17, 0, 0).unwrap()
    }

    fn harness() -> Harness {
        harness_on(Arc::new(MemoryStore::new()))
    }

    fn harness_on(store: SharedStore) -> Harness {
        let clock = Arc::new(ManualClock::new(t0()));
        let classifier = Arc::new(RegimeClassifier::new(
            RegimeConfig::default(),
            store.clone(),
            clock.clone(),
        ));
        let tracker = Arc::new(OutcomeTracker::new(
            store.clone(),
            clock.clone(),
            TrackerConfig::default(),
        ));
        let manager = PolicyManager::new(
            PolicyConfig::default(),
            classifier.clone(),
            tracker.clone(),
            store.clone(),
            clock.clone(),
        );
        Harness {
            manager,
            classifier,
            tracker,
            store,
            clock,
        }
    }

    fn tight_profiles() -> Vec<VolumeProfileFeatures> {
        ["ES", "NQ", "RTY"]
            .iter()
            .map(|i| VolumeProfileFeatures {
                instrument: i.to_string(),
                point_of_control: 5_000.0,
                value_area_high: 5_007.5,
                value_area_low: 4_992.5,
                high_volume_nodes: vec![],
                low_volume_nodes: vec![],
                total_volume: 100_000.0,
            })
            .collect()
    }

    async fn detect_gamma(h: &Harness) -> Arc<RegimeVerdict> {
        let mut ctx = MarketContextFeatures::neutral(h.clock.now());
        ctx.spx_0dte_share = 0.7;
        h.classifier.detect(&ctx, &tight_profiles()).await
    }

    fn state(regime: RegimeType, confidence: f64, since: DateTime<Utc>) -> PolicyState {
        PolicyState {
            policy_type: template_for(regime),
            parameters: template(template_for(regime)),
            regime,
            regime_confidence: confidence,
            regime_since: since,
            active_since: since,
            last_update: since,
            performance: PolicyPerformance::default(),
        }
    }

    fn verdict(regime: RegimeType, confidence: f64, at: DateTime<Utc>) -> RegimeVerdict {
        RegimeVerdict {
            regime,
            confidence,
            detected_at: at,
            contributing_factors: vec![],
            component_scores: BTreeMap::new(),
        }
    }

    #[test]
    fn test_switch_rules() {
        let cfg = PolicyConfig::default();
        let current = state(RegimeType::GammaSqueeze, 0.62, t0());
        let at = |m: i64| t0() + Duration::minutes(m);

        let low = verdict(RegimeType::StrongTrend, 0.55, at(30));
        assert_eq!(evaluate_switch(&cfg, &current, &low, at(30)), SwitchDecision::LowConfidence);

        let early = verdict(RegimeType::GammaSqueeze, 0.95, at(10));
        assert_eq!(evaluate_switch(&cfg, &current, &early, at(10)), SwitchDecision::DwellTime);

        let flat = verdict(RegimeType::GammaSqueeze, 0.7, at(20));
        assert_eq!(evaluate_switch(&cfg, &current, &flat, at(20)), SwitchDecision::NoImprovement);

        let stronger = verdict(RegimeType::GammaSqueeze, 0.85, at(20));
        assert_eq!(evaluate_switch(&cfg, &current, &stronger, at(20)), SwitchDecision::Accept);

        let different = verdict(RegimeType::StrongTrend, 0.65, at(1));
        assert_eq!(evaluate_switch(&cfg, &current, &different, at(1)), SwitchDecision::Accept);
    }

    #[tokio::test]
    async fn test_switches_while_store_rejects_writes() {
        let h = harness_on(Arc::new(audit_store::FailingStore::new()));
        let verdict = detect_gamma(&h).await;
        assert_eq!(verdict.regime, RegimeType::GammaSqueeze);

        assert!(h.manager.update().await);
        let state = h.manager.current_state().await;
        assert_eq!(state.policy_type, PolicyType::GammaSqueeze);
        assert!(h.manager.policy_history(1).is_empty());
    }

    #[tokio::test]
    async fn test_switches_on_confident_new_regime() {
        let h = harness();
        detect_gamma(&h).await;

        assert!(h.manager.update().await);
        let state = h.manager.current_state().await;
        assert_eq!(state.policy_type, PolicyType::GammaSqueeze);
        assert_eq!(state.regime, RegimeType::GammaSqueeze);
        assert_eq!(state.parameters.max_concurrent_trades, 1);

        let records = h.manager.policy_history(1);
        let events: Vec<(PolicyType, PolicyEvent)> =
            records.iter().map(|r| (r.policy_type, r.event)).collect();
        assert_eq!(
            events,
            vec![
                (PolicyType::ConservativeTrend, PolicyEvent::Activated),
                (PolicyType::ConservativeTrend, PolicyEvent::Finalized),
                (PolicyType::GammaSqueeze, PolicyEvent::Activated),
            ]
        );
    }

    #[tokio::test]
    async fn test_dwell_time_prevents_double_switch() {
        let h = harness();
        detect_gamma(&h).await;
        assert!(h.manager.update().await);

        h.clock.advance(Duration::minutes(5));
        detect_gamma(&h).await;
        assert!(!h.manager.update().await);

        h.clock.advance(Duration::minutes(20));
        detect_gamma(&h).await;
        assert!(!h.manager.update().await);

        let activations = h
            .manager
            .policy_history(1)
            .iter()
            .filter(|r| r.event == PolicyEvent::Activated)
            .count();
        assert_eq!(activations, 2);
    }

    #[tokio::test]
    async fn test_low_confidence_verdict_keeps_policy() {
        let h = harness();
        detect_gamma(&h).await;
        assert!(h.manager.update().await);

        h.clock.advance(Duration::minutes(30));
        // malformed inputs produce the 0.5 fallback verdict
        let ctx = MarketContextFeatures::neutral(h.clock.now());
        h.classifier.detect(&ctx, &[]).await;
        assert!(!h.manager.update().await);

        let info = h.manager.current_regime_info().await;
        assert_eq!(info.policy_type, PolicyType::GammaSqueeze);
        assert_eq!(
            info.latest_verdict.map(|v| v.regime),
            Some(RegimeType::Normal)
        );
    }

    #[tokio::test]
    async fn test_poor_template_history_steps_down() {
        let h = harness();
        h.store
            .append_policy_record(&PolicyRecord {
                policy_type: PolicyType::GammaSqueeze,
                event: PolicyEvent::Finalized,
                regime: RegimeType::GammaSqueeze,
                regime_confidence: 0.8,
                parameters: template(PolicyType::GammaSqueeze),
                started_at: t0() - Duration::days(3),
                ended_at: Some(t0() - Duration::days(2)),
                performance: Some(PolicyPerformance {
                    trades: 10,
                    win_rate: 0.2,
                    avg_r_multiple: -0.4,
                    performance_score: -0.7,
                }),
            })
            .unwrap();

        detect_gamma(&h).await;
        assert!(h.manager.update().await);

        let params = h.manager.current_parameters().await;
        let state = h.manager.current_state().await;
        assert_eq!(state.policy_type, PolicyType::Defensive);
        assert_eq!(params.max_concurrent_trades, 1);
        assert!((params.min_confidence - 0.8625).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_losing_streak_tightens_parameters() {
        let h = harness();
        detect_gamma(&h).await;
        assert!(h.manager.update().await);
        let before = h.manager.current_parameters().await;

        for i in 0..5 {
            let snap = SignalSnapshot {
                signal_id: format!("loss-{i}"),
                instrument: "ES".into(),
                direction: Direction::Buy,
                entry_price: 5_000.0,
                stop_loss: 4_990.0,
                target_price: 5_020.0,
                features: SignalFeatures::default(),
                rationale: String::new(),
                confidence: 0.8,
                source: "test".into(),
                regime: Some(RegimeType::GammaSqueeze),
                created_at: h.clock.now(),
            };
            h.tracker.track(&snap);
            h.tracker
                .resolve(&snap.signal_id, SignalOutcome::StopLossHit, None, "stop")
                .unwrap();
        }

        h.clock.advance(Duration::minutes(1));
        assert!(!h.manager.update().await);

        let after = h.manager.current_parameters().await;
        assert!((after.min_confidence - (before.min_confidence + 0.05)).abs() < 1e-9);
        assert!((after.max_position_size - before.max_position_size * 0.9).abs() < 1e-12);
        assert_eq!(h.manager.current_state().await.performance.trades, 5);
    }
}
