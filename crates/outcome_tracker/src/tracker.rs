use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use audit_store::SharedStore;
use chrono::{DateTime, Duration, Utc};
use common::config::TrackerConfig;
use common::{
    Error, RegimeType, Result, SharedClock, SignalOutcome, SignalOutcomeRecord, SignalSnapshot,
    TradeRecord, TtlCache,
};
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::importance::compute_importance;
use crate::metrics::PerformanceMetrics;

#[derive(Debug, Clone, PartialEq)]
pub enum ResolveStatus {
    Resolved(SignalOutcomeRecord),
    /// The record was already terminal; nothing changed.
    AlreadyTerminal(SignalOutcome),
    UnknownSignal,
}

#[derive(Debug, Clone, Copy)]
struct Excursion {
    high: f64,
    low: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MetricsKey {
    days_back: i64,
    instrument: Option<String>,
    regime: Option<RegimeType>,
}

pub struct OutcomeTracker {
    store: SharedStore,
    clock: SharedClock,
    config: TrackerConfig,
    metrics_cache: TtlCache<MetricsKey, PerformanceMetrics>,
    excursions: DashMap<String, Excursion>,
    importance: RwLock<BTreeMap<String, f64>>,
    resolved_since_refresh: AtomicUsize,
    refresh_in_flight: AtomicBool,
}

impl OutcomeTracker {
    pub fn new(store: SharedStore, clock: SharedClock, config: TrackerConfig) -> Self {
        let importance = match store.feature_importance() {
            Ok(scores) => scores,
            Err(e) => {
                warn!(error = %e, "failed to load feature importance; starting empty");
                BTreeMap::new()
            }
        };
        let ttl = Duration::minutes(config.metrics_cache_ttl_minutes.max(0));
        Self {
            metrics_cache: TtlCache::new(ttl, clock.clone()),
            store,
            clock,
            config,
            excursions: DashMap::new(),
            importance: RwLock::new(importance),
            resolved_since_refresh: AtomicUsize::new(0),
            refresh_in_flight: AtomicBool::new(false),
        }
    }

    /// Records a freshly emitted signal with a pending outcome.
    ///
    /// Idempotent per signal id. Storage failures are logged, never raised.
    pub fn track(&self, snapshot: &SignalSnapshot) {
        match self.store.insert_snapshot(snapshot) {
            Ok(true) => debug!(signal_id = %snapshot.signal_id, "tracking signal"),
            Ok(false) => debug!(signal_id = %snapshot.signal_id, "signal already tracked"),
            Err(e) => {
                warn!(signal_id = %snapshot.signal_id, error = %e, "failed to persist snapshot");
                return;
            }
        }
        if let Err(e) = self.store.insert_pending_outcome(&snapshot.signal_id) {
            warn!(signal_id = %snapshot.signal_id, error = %e, "failed to create pending outcome");
        }
    }

    /// Feeds an observed price for a pending signal into its excursion window.
    pub fn record_price(&self, signal_id: &str, price: f64) {
        if !price.is_finite() {
            return;
        }
        self.excursions
            .entry(signal_id.to_string())
            .and_modify(|x| {
                x.high = x.high.max(price);
                x.low = x.low.min(price);
            })
            .or_insert(Excursion {
                high: price,
                low: price,
            });
    }

    /// Moves a pending outcome to a terminal state exactly once.
    pub fn resolve(
        self: &Arc<Self>,
        signal_id: &str,
        outcome: SignalOutcome,
        exit_price: Option<f64>,
        reason: &str,
    ) -> Result<ResolveStatus> {
        if !outcome.is_terminal() {
            return Err(Error::InvalidInput(format!(
                "cannot resolve {signal_id} to pending"
            )));
        }

        let current = match self.store.outcome(signal_id)? {
            Some(record) => record,
            None => return Ok(ResolveStatus::UnknownSignal),
        };
        if current.outcome.is_terminal() {
            debug!(signal_id, outcome = current.outcome.as_str(), "already resolved");
            return Ok(ResolveStatus::AlreadyTerminal(current.outcome));
        }
        let snapshot = match self.store.snapshot(signal_id)? {
            Some(s) => s,
            None => return Ok(ResolveStatus::UnknownSignal),
        };

        let now = self.clock.now();
        let exit = exit_price
            .filter(|p| p.is_finite())
            .unwrap_or_else(|| default_exit_price(&snapshot, outcome));
        let excursion = self.excursions.get(signal_id).map(|e| *e);
        let record = build_record(&snapshot, outcome, exit, excursion, reason, now);

        if !self.store.finalize_outcome(&record)? {
            // lost a race with another resolver
            let outcome = self
                .store
                .outcome(signal_id)?
                .map(|r| r.outcome)
                .unwrap_or(outcome);
            return Ok(ResolveStatus::AlreadyTerminal(outcome));
        }
        self.excursions.remove(signal_id);

        info!(
            signal_id,
            instrument = %snapshot.instrument,
            outcome = outcome.as_str(),
            r_multiple = record.r_multiple.unwrap_or(0.0),
            "signal resolved"
        );

        if outcome != SignalOutcome::Cancelled {
            self.maybe_refresh_importance();
        }
        Ok(ResolveStatus::Resolved(record))
    }

    /// Aggregates over the trailing window, optionally for one instrument.
    pub fn performance_metrics(
        &self,
        days_back: i64,
        instrument: Option<&str>,
    ) -> PerformanceMetrics {
        self.cached_metrics(MetricsKey {
            days_back,
            instrument: instrument.map(str::to_string),
            regime: None,
        })
    }

    /// Trailing statistics for one instrument under one regime tag.
    pub fn trade_stats(
        &self,
        instrument: &str,
        regime: RegimeType,
        days_back: i64,
    ) -> PerformanceMetrics {
        self.cached_metrics(MetricsKey {
            days_back,
            instrument: Some(instrument.to_string()),
            regime: Some(regime),
        })
    }

    /// Uncached aggregate over trades that exited inside `[start, end]`.
    pub fn performance_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> PerformanceMetrics {
        match self.store.resolved_trades_between(start, end) {
            Ok(trades) => PerformanceMetrics::from_trades(&trades),
            Err(e) => {
                warn!(error = %e, "failed to load trades; reporting empty performance");
                PerformanceMetrics::default()
            }
        }
    }

    /// Breakdown by the regime each signal was emitted under.
    ///
    /// Signals without a regime tag are left out.
    pub fn regime_performance(&self) -> BTreeMap<RegimeType, PerformanceMetrics> {
        let trades = self.trailing_trades(self.config.regime_lookback_days);
        let mut grouped: BTreeMap<RegimeType, Vec<&TradeRecord>> = BTreeMap::new();
        for trade in &trades {
            if let Some(regime) = trade.snapshot.regime {
                grouped.entry(regime).or_default().push(trade);
            }
        }
        grouped
            .into_iter()
            .map(|(regime, group)| (regime, PerformanceMetrics::from_trades(group)))
            .collect()
    }

    pub fn feature_importance(&self) -> BTreeMap<String, f64> {
        self.importance
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Recomputes correlation of every feature with realized R and overwrites
    /// the stored scores. Returns the fresh scores.
    pub fn refresh_feature_importance(&self) -> Result<BTreeMap<String, f64>> {
        let end = self.clock.now();
        let start = end - Duration::days(self.config.importance_lookback_days);
        let trades = self.store.resolved_trades_between(start, end)?;
        let usable = trades
            .iter()
            .filter(|t| t.outcome.outcome != SignalOutcome::Cancelled)
            .count();
        if usable < self.config.importance_min_samples {
            debug!(usable, "not enough resolved trades for feature importance");
            return Ok(self.feature_importance());
        }

        let scores = compute_importance(&trades, self.config.importance_min_samples);
        if let Err(e) = self.store.save_feature_importance(&scores) {
            warn!(error = %e, "failed to persist feature importance");
        }
        {
            let mut current = self.importance.write().unwrap_or_else(|e| e.into_inner());
            for (feature, score) in &scores {
                current.insert(feature.clone(), *score);
            }
        }
        info!(features = scores.len(), trades = usable, "feature importance refreshed");
        Ok(scores)
    }

    pub fn pending_signals(&self) -> Vec<SignalSnapshot> {
        self.store.pending_snapshots().unwrap_or_else(|e| {
            warn!(error = %e, "failed to list pending signals");
            Vec::new()
        })
    }

    fn cached_metrics(&self, key: MetricsKey) -> PerformanceMetrics {
        if let Some(hit) = self.metrics_cache.get(&key) {
            return hit;
        }
        let end = self.clock.now();
        let start = end - Duration::days(key.days_back);
        let trades = match self.store.resolved_trades_between(start, end) {
            Ok(trades) => trades,
            Err(e) => {
                warn!(error = %e, "failed to load trades; reporting empty performance");
                return PerformanceMetrics::default();
            }
        };
        let metrics = PerformanceMetrics::from_trades(trades.iter().filter(|t| {
            key.instrument
                .as_deref()
                .map_or(true, |i| t.snapshot.instrument == i)
                && key.regime.map_or(true, |r| t.snapshot.regime == Some(r))
        }));
        self.metrics_cache.insert(key, metrics.clone());
        metrics
    }

    fn trailing_trades(&self, days_back: i64) -> Vec<TradeRecord> {
        let end = self.clock.now();
        let start = end - Duration::days(days_back);
        self.store
            .resolved_trades_between(start, end)
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to load trades");
                Vec::new()
            })
    }

    fn maybe_refresh_importance(self: &Arc<Self>) {
        let resolved = self.resolved_since_refresh.fetch_add(1, Ordering::SeqCst) + 1;
        if resolved < self.config.importance_refresh_after {
            return;
        }
        if self.refresh_in_flight.swap(true, Ordering::SeqCst) {
            return;
        }
        self.resolved_since_refresh.store(0, Ordering::SeqCst);

        let tracker = Arc::clone(self);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || tracker.run_importance_refresh());
            }
            Err(_) => tracker.run_importance_refresh(),
        }
    }

    fn run_importance_refresh(&self) {
        if let Err(e) = self.refresh_feature_importance() {
            warn!(error = %e, "feature importance refresh failed");
        }
        self.refresh_in_flight.store(false, Ordering::SeqCst);
    }
}

fn default_exit_price(snapshot: &SignalSnapshot, outcome: SignalOutcome) -> f64 {
    match outcome {
        SignalOutcome::TakeProfitHit => snapshot.target_price,
        SignalOutcome::StopLossHit => snapshot.stop_loss,
        _ => snapshot.entry_price,
    }
}

fn build_record(
    snapshot: &SignalSnapshot,
    outcome: SignalOutcome,
    exit_price: f64,
    excursion: Option<Excursion>,
    reason: &str,
    now: DateTime<Utc>,
) -> SignalOutcomeRecord {
    let risk = snapshot.risk_per_unit();
    let sign = snapshot.direction.sign();
    let to_r = |price: f64| {
        if risk > 0.0 {
            sign * (price - snapshot.entry_price) / risk
        } else {
            0.0
        }
    };

    let (r, mae, mfe) = if outcome == SignalOutcome::Cancelled {
        (0.0, 0.0, 0.0)
    } else {
        let r = to_r(exit_price);
        let (high, low) = match excursion {
            Some(x) => (x.high.max(exit_price), x.low.min(exit_price)),
            None => (exit_price, exit_price),
        };
        let (at_high, at_low) = (to_r(high), to_r(low));
        let mae = at_high.min(at_low).min(0.0);
        let mfe = at_high.max(at_low).max(0.0);
        (r, mae, mfe)
    };

    SignalOutcomeRecord {
        signal_id: snapshot.signal_id.clone(),
        outcome,
        exit_time: Some(now),
        exit_price: Some(exit_price),
        r_multiple: Some(r),
        mae: Some(mae),
        mfe: Some(mfe),
        holding_time_secs: Some((now - snapshot.created_at).num_seconds().max(0)),
        exit_reason: Some(reason.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use audit_store::MemoryStore;
    use chrono::TimeZone;
    use common::{Direction, ManualClock, SignalFeatures};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 15, 0, 0).unwrap()
    }

    fn setup() -> (Arc<OutcomeTracker>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(t0()));
        let store: SharedStore = Arc::new(MemoryStore::new());
        let tracker = OutcomeTracker::new(store, clock.clone(), TrackerConfig::default());
        (Arc::new(tracker), clock)
    }

    fn snapshot(id: &str, direction: Direction, created_at: DateTime<Utc>) -> SignalSnapshot {
        let (stop, target) = match direction {
            Direction::Buy => (98.0, 104.0),
            Direction::Sell => (102.0, 96.0),
        };
        SignalSnapshot {
            signal_id: id.to_string(),
            instrument: "ES".into(),
            direction,
            entry_price: 100.0,
            stop_loss: stop,
            target_price: target,
            features: SignalFeatures::default(),
            rationale: "breakout".into(),
            confidence: 0.7,
            source: "test".into(),
            regime: Some(RegimeType::StrongTrend),
            created_at,
        }
    }

    fn resolved(status: ResolveStatus) -> SignalOutcomeRecord {
        match status {
            ResolveStatus::Resolved(record) => record,
            other => panic!("expected resolution, got {other:?}"),
        }
    }

    #[test]
    fn test_track_is_idempotent_and_pending() {
        let (tracker, _) = setup();
        let snap = snapshot("a", Direction::Buy, t0());
        tracker.track(&snap);
        tracker.track(&snap);

        let pending = tracker.pending_signals();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].signal_id, "a");
    }

    #[test]
    fn test_rejecting_store_degrades_without_panicking() {
        let clock = Arc::new(ManualClock::new(t0()));
        let failing = Arc::new(audit_store::FailingStore::new());
        let store: SharedStore = failing.clone();
        let tracker = Arc::new(OutcomeTracker::new(store, clock, TrackerConfig::default()));

        tracker.track(&snapshot("a", Direction::Buy, t0()));
        tracker.record_price("a", 101.0);
        assert!(tracker.pending_signals().is_empty());
        assert_eq!(tracker.performance_metrics(30, None).total_trades, 0);
        assert!(tracker.feature_importance().is_empty());

        let err = tracker
            .resolve("a", SignalOutcome::TakeProfitHit, Some(104.0), "target")
            .unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
        assert!(failing.calls() >= 4);
    }

    #[test]
    fn test_buy_take_profit_has_positive_r() {
        let (tracker, clock) = setup();
        tracker.track(&snapshot("a", Direction::Buy, t0()));
        clock.advance(Duration::minutes(42));

        let record = resolved(
            tracker
                .resolve("a", SignalOutcome::TakeProfitHit, Some(103.0), "target")
                .unwrap(),
        );
        assert!(record.r_multiple.unwrap() > 0.0);
        assert!((record.r_multiple.unwrap() - 1.5).abs() < 1e-12);
        assert_eq!(record.holding_time_secs, Some(42 * 60));
        assert_eq!(record.exit_reason.as_deref(), Some("target"));
    }

    #[test]
    fn test_sell_r_multiple_is_signed_by_direction() {
        let (tracker, _) = setup();
        tracker.track(&snapshot("s", Direction::Sell, t0()));
        let record = resolved(
            tracker
                .resolve("s", SignalOutcome::StopLossHit, None, "stopped")
                .unwrap(),
        );
        // default exit is the stop, exactly one R against
        assert_eq!(record.exit_price, Some(102.0));
        assert!((record.r_multiple.unwrap() + 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_second_resolution_changes_nothing() {
        let (tracker, _) = setup();
        tracker.track(&snapshot("a", Direction::Buy, t0()));
        let first = resolved(
            tracker
                .resolve("a", SignalOutcome::TakeProfitHit, Some(104.0), "target")
                .unwrap(),
        );

        let second = tracker
            .resolve("a", SignalOutcome::StopLossHit, Some(98.0), "late stop")
            .unwrap();
        assert_eq!(
            second,
            ResolveStatus::AlreadyTerminal(SignalOutcome::TakeProfitHit)
        );
        let metrics =
            tracker.performance_between(t0() - Duration::days(1), t0() + Duration::days(1));
        assert_eq!(metrics.total_trades, 1);
        assert_eq!(metrics.best_r, first.r_multiple.unwrap());
    }

    #[test]
    fn test_unknown_signal_and_pending_target() {
        let (tracker, _) = setup();
        assert_eq!(
            tracker
                .resolve("ghost", SignalOutcome::ManualExit, None, "manual")
                .unwrap(),
            ResolveStatus::UnknownSignal
        );
        tracker.track(&snapshot("a", Direction::Buy, t0()));
        assert!(tracker
            .resolve("a", SignalOutcome::Pending, None, "noop")
            .is_err());
    }

    #[test]
    fn test_excursions_measured_in_r() {
        let (tracker, _) = setup();
        tracker.track(&snapshot("a", Direction::Buy, t0()));
        tracker.record_price("a", 99.0);
        tracker.record_price("a", 103.0);
        tracker.record_price("a", f64::NAN);

        let record = resolved(
            tracker
                .resolve("a", SignalOutcome::ManualExit, Some(101.0), "flatten")
                .unwrap(),
        );
        assert!((record.mae.unwrap() + 0.5).abs() < 1e-12);
        assert!((record.mfe.unwrap() - 1.5).abs() < 1e-12);
        assert!((record.r_multiple.unwrap() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_cancelled_is_terminal_but_not_counted() {
        let (tracker, _) = setup();
        tracker.track(&snapshot("a", Direction::Buy, t0()));
        let record = resolved(
            tracker
                .resolve("a", SignalOutcome::Cancelled, None, "withdrawn")
                .unwrap(),
        );
        assert_eq!(record.r_multiple, Some(0.0));
        assert!(tracker.pending_signals().is_empty());
        assert_eq!(tracker.performance_metrics(30, None).total_trades, 0);
    }

    #[test]
    fn test_metrics_cache_expires_with_clock() {
        let (tracker, clock) = setup();
        tracker.track(&snapshot("a", Direction::Buy, t0()));
        tracker
            .resolve("a", SignalOutcome::TakeProfitHit, None, "target")
            .unwrap();
        assert_eq!(tracker.performance_metrics(30, Some("ES")).total_trades, 1);

        tracker.track(&snapshot("b", Direction::Buy, t0()));
        tracker
            .resolve("b", SignalOutcome::StopLossHit, None, "stop")
            .unwrap();
        // served from cache until the TTL lapses
        assert_eq!(tracker.performance_metrics(30, Some("ES")).total_trades, 1);

        clock.advance(Duration::minutes(16));
        let fresh = tracker.performance_metrics(30, Some("ES"));
        assert_eq!(fresh.total_trades, 2);
        assert!((fresh.win_rate - 0.5).abs() < 1e-12);
        assert_eq!(tracker.performance_metrics(30, Some("NQ")).total_trades, 0);
    }

    #[test]
    fn test_regime_breakdown_groups_by_tag() {
        let (tracker, _) = setup();
        let mut trend = snapshot("a", Direction::Buy, t0());
        trend.regime = Some(RegimeType::StrongTrend);
        let mut pinned = snapshot("b", Direction::Buy, t0());
        pinned.regime = Some(RegimeType::Pinning);
        let mut untagged = snapshot("c", Direction::Buy, t0());
        untagged.regime = None;
        for s in [&trend, &pinned, &untagged] {
            tracker.track(s);
        }
        tracker.resolve("a", SignalOutcome::TakeProfitHit, None, "t").unwrap();
        tracker.resolve("b", SignalOutcome::StopLossHit, None, "s").unwrap();
        tracker.resolve("c", SignalOutcome::StopLossHit, None, "s").unwrap();

        let breakdown = tracker.regime_performance();
        assert_eq!(breakdown.len(), 2);
        assert_eq!(breakdown[&RegimeType::StrongTrend].wins, 1);
        assert_eq!(breakdown[&RegimeType::Pinning].losses, 1);
        assert_eq!(
            tracker.trade_stats("ES", RegimeType::Pinning, 30).total_trades,
            1
        );
    }

    #[test]
    fn test_importance_refresh_triggers_after_enough_resolutions() {
        let clock = Arc::new(ManualClock::new(t0()));
        let store: SharedStore = Arc::new(MemoryStore::new());
        let config = TrackerConfig {
            importance_min_samples: 4,
            importance_refresh_after: 4,
            ..TrackerConfig::default()
        };
        let tracker = Arc::new(OutcomeTracker::new(store.clone(), clock, config));

        for i in 0..4 {
            let mut snap = snapshot(&format!("sig-{i}"), Direction::Buy, t0());
            snap.features
                .technical
                .insert("momentum".into(), i as f64);
            tracker.track(&snap);
            // higher momentum, better exit
            let exit = 99.0 + i as f64;
            tracker
                .resolve(&snap.signal_id, SignalOutcome::ManualExit, Some(exit), "exit")
                .unwrap();
        }

        // no runtime here, so the refresh ran inline
        let scores = tracker.feature_importance();
        assert!((scores["technical.momentum"] - 1.0).abs() < 1e-9);
        assert_eq!(store.feature_importance().unwrap(), scores);
    }
}
