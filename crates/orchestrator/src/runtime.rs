use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use audit_store::{open_store, SharedStore};
use chrono::{DateTime, Utc};
use common::{
    EngineConfig, Error, MarketContextFeatures, PolicyParameters, PositionSizeDecision,
    RegimeVerdict, Result, SharedClock, SizingRequest,
};
use outcome_tracker::{OutcomeTracker, PerformanceMetrics, ResolveStatus};
use policy_manager::{PolicyManager, RegimeInfo};
use regime_classifier::RegimeClassifier;
use risk_engine::{BreakerTransition, RiskEngine, RiskMetrics};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::collaborators::{with_timeout, ExecutionOutcome, MarketDataSource, SignalSource};
use crate::health::{scan_alerts, AlertInputs, ComponentHealth, SystemHealth};
use crate::journal::{write_event, SharedJournal};
use crate::report::{
    recommendations, write_report, ComprehensiveReport, PerformanceSection, PolicySection,
    RegimeSection,
};
use crate::scheduler::{Scheduler, TaskRunStatus, TaskRunner};
use crate::tasks::{ScheduledTask, TaskKind};

/// External collaborators handed to [`Orchestrator::initialize`].
pub struct Collaborators {
    pub market: Arc<dyn MarketDataSource>,
    pub signals: Arc<dyn SignalSource>,
    pub journal: Option<SharedJournal>,
    /// Overrides the configured store.
    pub store: Option<SharedStore>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub running: bool,
    pub paused: bool,
    pub shut_down: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_secs: i64,
    pub regime: RegimeInfo,
    pub policy: PolicyParameters,
    pub risk: RiskMetrics,
    pub tasks: Vec<ScheduledTask>,
    pub health: SystemHealth,
    pub degraded: Vec<String>,
}

/// What one signal-loop iteration did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleSummary {
    pub outcomes: usize,
    pub signals: usize,
    pub committed: usize,
    pub delivered: usize,
}

/// Composition root. Owns every component and the four control loops.
pub struct Orchestrator {
    config: EngineConfig,
    clock: SharedClock,
    store: SharedStore,
    classifier: Arc<RegimeClassifier>,
    tracker: Arc<OutcomeTracker>,
    policy: Arc<PolicyManager>,
    risk: Arc<RiskEngine>,
    market: Arc<dyn MarketDataSource>,
    signals: Arc<dyn SignalSource>,
    journal: Option<SharedJournal>,
    scheduler: Scheduler,
    shutdown: CancellationToken,
    paused: AtomicBool,
    started: AtomicBool,
    stopped: AtomicBool,
    started_at: RwLock<Option<DateTime<Utc>>>,
    loops: Mutex<Vec<JoinHandle<()>>>,
    in_flight: Mutex<Vec<JoinHandle<TaskRunStatus>>>,
    components: RwLock<BTreeMap<String, ComponentHealth>>,
}

impl Orchestrator {
    /// Builds every component. Only a store that cannot be opened stops startup.
    pub async fn initialize(
        config: EngineConfig,
        collaborators: Collaborators,
        clock: SharedClock,
    ) -> Result<Arc<Self>> {
        let store = match collaborators.store {
            Some(store) => store,
            None => open_store(&config.storage)
                .map_err(|e| Error::Initialization(format!("audit store: {e}")))?,
        };

        let classifier = Arc::new(RegimeClassifier::new(
            config.regime.clone(),
            store.clone(),
            clock.clone(),
        ));
        let tracker = Arc::new(OutcomeTracker::new(
            store.clone(),
            clock.clone(),
            config.tracker.clone(),
        ));
        let policy = Arc::new(PolicyManager::new(
            config.policy.clone(),
            classifier.clone(),
            tracker.clone(),
            store.clone(),
            clock.clone(),
        ));
        let risk = Arc::new(RiskEngine::new(
            config.risk.clone(),
            policy.clone(),
            tracker.clone(),
            clock.clone(),
        ));
        let scheduler = Scheduler::new(&config.orchestrator, clock.clone());

        let now = clock.now();
        let components = [collaborators.market.name(), collaborators.signals.name()]
            .into_iter()
            .map(|name| {
                (
                    name.to_string(),
                    ComponentHealth {
                        name: name.to_string(),
                        healthy: true,
                        detail: None,
                        checked_at: now,
                        failures: 0,
                    },
                )
            })
            .collect();

        let orchestrator = Arc::new(Self {
            config,
            clock,
            store,
            classifier,
            tracker,
            policy,
            risk,
            market: collaborators.market,
            signals: collaborators.signals,
            journal: collaborators.journal,
            scheduler,
            shutdown: CancellationToken::new(),
            paused: AtomicBool::new(false),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            started_at: RwLock::new(None),
            loops: Mutex::new(Vec::new()),
            in_flight: Mutex::new(Vec::new()),
            components: RwLock::new(components),
        });

        let cfg = &orchestrator.config;
        orchestrator
            .journal_event(
                "engine_start",
                json!({
                    "market_data": orchestrator.market.name(),
                    "signal_source": orchestrator.signals.name(),
                    "risk": {
                        "account_equity": cfg.risk.account_equity,
                        "daily_loss_limit": cfg.risk.daily_loss_limit,
                        "max_consecutive_losses": cfg.risk.max_consecutive_losses,
                        "max_drawdown_pct": cfg.risk.max_drawdown_pct,
                        "daily_risk_budget_pct": cfg.risk.daily_risk_budget_pct
                    },
                    "loops": {
                        "main_secs": cfg.orchestrator.main_loop_secs,
                        "scheduler_secs": cfg.orchestrator.scheduler_loop_secs,
                        "health_secs": cfg.orchestrator.health_loop_secs,
                        "signal_secs": cfg.orchestrator.signal_loop_secs
                    }
                }),
            )
            .await;
        info!(
            market_data = orchestrator.market.name(),
            signal_source = orchestrator.signals.name(),
            "orchestrator initialized"
        );
        Ok(orchestrator)
    }

    /// Spawns the main, scheduler, health, and signal loops.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::Other("orchestrator already shut down".into()));
        }
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("orchestrator already started");
            return Ok(());
        }
        *self.started_at.write().await = Some(self.clock.now());

        let cfg = &self.config.orchestrator;
        let mut loops = self.loops.lock().await;

        // Loop 1: health snapshot and alert scan.
        let this = Arc::clone(self);
        loops.push(spawn_loop(
            "main",
            cfg.main_loop_secs,
            self.shutdown.clone(),
            move || {
                let this = Arc::clone(&this);
                async move {
                    let health = this.refresh_health().await;
                    this.heartbeat(&health).await;
                }
            },
        ));

        // Loop 2: scheduled tasks, one tracked spawn per due kind.
        let this = Arc::clone(self);
        loops.push(spawn_loop(
            "scheduler",
            cfg.scheduler_loop_secs,
            self.shutdown.clone(),
            move || {
                let this = Arc::clone(&this);
                async move {
                    this.spawn_due_tasks().await;
                }
            },
        ));

        // Loop 3: collaborator probes and recovery.
        let this = Arc::clone(self);
        loops.push(spawn_loop(
            "health",
            cfg.health_loop_secs,
            self.shutdown.clone(),
            move || {
                let this = Arc::clone(&this);
                async move {
                    this.health_cycle().await;
                }
            },
        ));

        // Loop 4: signal supervision.
        let this = Arc::clone(self);
        loops.push(spawn_loop(
            "signal",
            cfg.signal_loop_secs,
            self.shutdown.clone(),
            move || {
                let this = Arc::clone(&this);
                async move {
                    this.signal_cycle().await;
                }
            },
        ));

        info!(loops = loops.len(), "orchestrator started");
        Ok(())
    }

    /// Stops every loop and in-flight scheduled task within one grace period,
    /// then writes a final report and journals the shutdown. Safe to call
    /// more than once.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            debug!("shutdown already completed");
            return;
        }
        info!("orchestrator shutting down");
        self.shutdown.cancel();

        let grace = Duration::from_secs(self.config.orchestrator.shutdown_grace_secs);
        let deadline = tokio::time::Instant::now() + grace;
        let loops = std::mem::take(&mut *self.loops.lock().await);
        join_until("loops", deadline, loops).await;
        // The scheduler loop has stopped, so nothing is added after this take.
        let tasks = std::mem::take(&mut *self.in_flight.lock().await);
        join_until("scheduled tasks", deadline, tasks).await;

        let report = match self.write_report_now().await {
            Ok(path) => {
                info!(path = %path.display(), "final report written");
                Some(path.display().to_string())
            }
            Err(e) => {
                error!(error = %e, "failed to write final report");
                None
            }
        };
        self.journal_event("engine_shutdown", json!({ "final_report": report }))
            .await;
        info!("orchestrator shut down");
    }

    /// Best-effort status, annotated with degraded components.
    pub async fn status(&self) -> SystemStatus {
        let now = self.clock.now();
        let started_at = *self.started_at.read().await;
        let health = self.refresh_health().await;
        SystemStatus {
            running: self.started.load(Ordering::SeqCst) && !self.stopped.load(Ordering::SeqCst),
            paused: self.is_paused(),
            shut_down: self.stopped.load(Ordering::SeqCst),
            started_at,
            uptime_secs: started_at.map(|t| (now - t).num_seconds()).unwrap_or(0),
            regime: self.policy.current_regime_info().await,
            policy: self.policy.current_parameters().await,
            risk: self.risk.risk_metrics().await,
            tasks: self.scheduler.snapshot().await,
            degraded: health.degraded_components(),
            health,
        }
    }

    /// Suspends the signal loop only.
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            info!("signal loop paused");
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            info!("signal loop resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub async fn force_run(&self, kind: TaskKind) -> TaskRunStatus {
        let status = self.scheduler.run(kind, self, true).await;
        self.note_task_status(kind, &status).await;
        status
    }

    /// Spawns every due task and tracks it until `join_in_flight` or
    /// `shutdown` collects it. Returns how many were spawned.
    pub async fn spawn_due_tasks(self: &Arc<Self>) -> usize {
        let due = self.scheduler.due().await;
        let mut in_flight = self.in_flight.lock().await;
        if self.shutdown.is_cancelled() {
            return 0;
        }
        in_flight.retain(|h| !h.is_finished());
        for &kind in &due {
            let this = Arc::clone(self);
            in_flight.push(tokio::spawn(async move {
                let status = this.scheduler.run(kind, this.as_ref(), false).await;
                this.note_task_status(kind, &status).await;
                status
            }));
        }
        due.len()
    }

    /// Waits for every tracked scheduled task.
    pub async fn join_in_flight(&self) -> Vec<TaskRunStatus> {
        let handles = std::mem::take(&mut *self.in_flight.lock().await);
        futures::future::join_all(handles)
            .await
            .into_iter()
            .filter_map(|joined| joined.ok())
            .collect()
    }

    pub async fn in_flight_count(&self) -> usize {
        self.in_flight
            .lock()
            .await
            .iter()
            .filter(|h| !h.is_finished())
            .count()
    }

    /// One regime, risk, signal, and report pass without starting the loops.
    pub async fn run_once(&self) -> Result<PathBuf> {
        self.update_regime().await?;
        self.check_risk().await;
        let summary = self.signal_cycle().await;
        info!(
            outcomes = summary.outcomes,
            signals = summary.signals,
            delivered = summary.delivered,
            "single pass complete"
        );
        self.write_report_now().await
    }

    // ── Exposed queries ─────────────────────────────────────────────

    pub async fn current_policy_parameters(&self) -> PolicyParameters {
        self.policy.current_parameters().await
    }

    pub async fn current_regime_info(&self) -> RegimeInfo {
        self.policy.current_regime_info().await
    }

    pub async fn risk_metrics(&self) -> RiskMetrics {
        self.risk.risk_metrics().await
    }

    pub fn performance_summary(&self, days_back: i64) -> PerformanceMetrics {
        self.tracker.performance_metrics(days_back, None)
    }

    pub async fn calculate_size(&self, request: &SizingRequest) -> PositionSizeDecision {
        let decision = self.risk.calculate_size(request).await;
        self.journal_event(
            "sizing_decision",
            json!({
                "signal_id": &decision.signal_id,
                "instrument": &decision.instrument,
                "regime": decision.regime.as_str(),
                "recommended_size": decision.recommended_size,
                "max_allowed": decision.max_allowed,
                "risk_level": decision.risk_level,
                "kelly_raw": decision.kelly_raw,
                "factors": &decision.adjustment_factors,
                "reason": &decision.reason
            }),
        )
        .await;
        decision
    }

    pub fn tracker(&self) -> &Arc<OutcomeTracker> {
        &self.tracker
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    // ── Cycles ──────────────────────────────────────────────────────

    /// Pulls fresh features, classifies, and lets the policy manager react.
    /// Missing inputs fall back to neutral defaults.
    pub async fn update_regime(&self) -> Result<Arc<RegimeVerdict>> {
        let now = self.clock.now();
        let timeout = self.collaborator_timeout();
        let market_name = self.market.name().to_string();

        let context = with_timeout("market_context", timeout, self.market.market_context()).await;
        let context = match context {
            Ok(context) => context,
            Err(e) => {
                warn!(error = %e, "market context unavailable; using neutral defaults");
                self.mark_component(&market_name, Some(e.to_string())).await;
                MarketContextFeatures::neutral(now)
            }
        };
        let profiles =
            with_timeout("volume_profiles", timeout, self.market.volume_profiles()).await;
        let profiles = match profiles {
            Ok(profiles) => profiles,
            Err(e) => {
                warn!(error = %e, "volume profiles unavailable");
                self.mark_component(&market_name, Some(e.to_string())).await;
                Vec::new()
            }
        };
        let vols = with_timeout(
            "realized_volatility",
            timeout,
            self.market.realized_volatility(),
        )
        .await;
        match vols {
            Ok(vols) => {
                for (instrument, vol) in vols {
                    self.risk.update_volatility(&instrument, vol);
                }
            }
            Err(e) => debug!(error = %e, "realized volatility unavailable"),
        }

        let verdict = self.classifier.detect(&context, &profiles).await;
        self.journal_event(
            "regime_detected",
            json!({
                "regime": verdict.regime.as_str(),
                "confidence": verdict.confidence,
                "factors": &verdict.contributing_factors,
                "scores": &verdict.component_scores
            }),
        )
        .await;

        if self.policy.update().await {
            let state = self.policy.current_state().await;
            info!(
                policy = %state.policy_type,
                regime = %state.regime,
                confidence = state.regime_confidence,
                "policy switched"
            );
            self.journal_event(
                "policy_switched",
                json!({
                    "policy": state.policy_type.as_str(),
                    "regime": state.regime.as_str(),
                    "confidence": state.regime_confidence,
                    "parameters": &state.parameters
                }),
            )
            .await;
        }
        Ok(verdict)
    }

    pub async fn check_risk(&self) -> BreakerTransition {
        let transition = self.risk.check_circuit_breakers().await;
        self.journal_transition(&transition).await;
        transition
    }

    /// One supervised signal-loop iteration. Does nothing while paused.
    pub async fn signal_cycle(&self) -> CycleSummary {
        let mut summary = CycleSummary::default();
        if self.is_paused() {
            debug!("signal loop paused; skipping");
            return summary;
        }
        let timeout = self.collaborator_timeout();
        let source = self.signals.name().to_string();

        // 1. Outcomes first so released risk is available to new signals.
        match with_timeout("poll_outcomes", timeout, self.signals.poll_outcomes()).await {
            Ok(outcomes) => {
                for outcome in &outcomes {
                    self.on_trade_outcome(outcome).await;
                    summary.outcomes += 1;
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to poll outcomes");
                self.mark_component(&source, Some(e.to_string())).await;
            }
        }

        // 2. Excursions for whatever is still open.
        self.record_excursions().await;

        // 3. New signals: tag, track, size, deliver.
        let snapshots = with_timeout("poll_signals", timeout, self.signals.poll_signals()).await;
        let snapshots = match snapshots {
            Ok(snapshots) => snapshots,
            Err(e) => {
                warn!(error = %e, "failed to poll signals");
                self.mark_component(&source, Some(e.to_string())).await;
                return summary;
            }
        };
        let accepted_regime = self.policy.current_regime_info().await.regime;
        for mut snapshot in snapshots {
            let regime = *snapshot.regime.get_or_insert(accepted_regime);
            self.tracker.track(&snapshot);
            summary.signals += 1;

            let decision = self
                .calculate_size(&SizingRequest::from_snapshot(&snapshot, regime))
                .await;
            if self.risk.commit(&decision).await {
                summary.committed += 1;
            }
            match with_timeout("deliver", timeout, self.signals.deliver(&decision)).await {
                Ok(()) => summary.delivered += 1,
                Err(e) => warn!(
                    signal_id = %decision.signal_id,
                    error = %e,
                    "failed to deliver decision"
                ),
            }
        }
        summary
    }

    /// Books an execution result with the tracker and the risk engine.
    /// Duplicates and rejected outcomes never reach the risk state.
    pub async fn on_trade_outcome(&self, outcome: &ExecutionOutcome) -> BreakerTransition {
        let reason = outcome.reason.as_deref().unwrap_or(outcome.outcome.as_str());
        let book = match self
            .tracker
            .resolve(&outcome.signal_id, outcome.outcome, outcome.exit_price, reason)
        {
            Ok(ResolveStatus::Resolved(record)) => {
                debug!(
                    signal_id = %record.signal_id,
                    r_multiple = ?record.r_multiple,
                    "outcome resolved"
                );
                true
            }
            Ok(ResolveStatus::AlreadyTerminal(previous)) => {
                warn!(
                    signal_id = %outcome.signal_id,
                    previous = previous.as_str(),
                    "duplicate outcome ignored"
                );
                false
            }
            Ok(ResolveStatus::UnknownSignal) => {
                warn!(
                    signal_id = %outcome.signal_id,
                    "outcome for untracked signal; booking P&L only"
                );
                true
            }
            Err(e) => {
                warn!(signal_id = %outcome.signal_id, error = %e, "outcome rejected");
                false
            }
        };
        if !book {
            return BreakerTransition::Unchanged;
        }
        let transition = self
            .risk
            .update_outcome(&outcome.signal_id, outcome.outcome, outcome.pnl)
            .await;
        self.journal_transition(&transition).await;
        transition
    }

    /// Probes collaborators and re-initializes the ones that fail.
    pub async fn health_cycle(&self) {
        let timeout = self.collaborator_timeout();

        let market = with_timeout("market_health", timeout, self.market.health_check()).await;
        let market_name = self.market.name().to_string();
        match market {
            Ok(()) => self.mark_component(&market_name, None).await,
            Err(e) => {
                self.mark_component(&market_name, Some(e.to_string())).await;
                warn!(
                    component = %market_name,
                    error = %e,
                    "health check failed; re-initializing"
                );
                let reinit =
                    with_timeout("market_reinit", timeout, self.market.reinitialize()).await;
                if let Err(e) = reinit {
                    error!(component = %market_name, error = %e, "re-initialization failed");
                }
            }
        }

        let signals = with_timeout("signal_health", timeout, self.signals.health_check()).await;
        let signal_name = self.signals.name().to_string();
        match signals {
            Ok(()) => self.mark_component(&signal_name, None).await,
            Err(e) => {
                self.mark_component(&signal_name, Some(e.to_string())).await;
                warn!(
                    component = %signal_name,
                    error = %e,
                    "health check failed; re-initializing"
                );
                let reinit =
                    with_timeout("signal_reinit", timeout, self.signals.reinitialize()).await;
                if let Err(e) = reinit {
                    error!(component = %signal_name, error = %e, "re-initialization failed");
                }
            }
        }

        self.refresh_health().await;
    }

    pub async fn build_report(&self) -> ComprehensiveReport {
        let now = self.clock.now();
        let performance = PerformanceSection {
            last_7_days: self.tracker.performance_metrics(7, None),
            last_30_days: self.tracker.performance_metrics(30, None),
        };
        let risk = self.risk.risk_metrics().await;
        let current = self.policy.current_regime_info().await;
        let breakdown = self
            .tracker
            .regime_performance()
            .into_iter()
            .map(|(regime, metrics)| (regime.as_str().to_string(), metrics))
            .collect();
        let policy = PolicySection {
            current: self.policy.current_state().await,
            history: self.policy.policy_history(30),
        };
        let tasks = self.scheduler.snapshot().await;
        let alerts = self.refresh_health().await.alerts;
        let recommendations = recommendations(
            &performance,
            &risk,
            &current,
            &tasks,
            self.config.orchestrator.low_confidence_alert,
        );

        ComprehensiveReport {
            generated_at: now,
            performance,
            risk,
            regime: RegimeSection { current, breakdown },
            policy,
            feature_importance: self.tracker.feature_importance(),
            tasks,
            alerts,
            recommendations,
        }
    }

    pub async fn write_report_now(&self) -> Result<PathBuf> {
        let report = self.build_report().await;
        let path = write_report(Path::new(&self.config.orchestrator.report_dir), &report)?;
        info!(
            path = %path.display(),
            alerts = report.alerts.len(),
            "performance report written"
        );
        Ok(path)
    }

    // ── Internals ───────────────────────────────────────────────────

    async fn refresh_importance(&self) -> Result<()> {
        let tracker = Arc::clone(&self.tracker);
        let scores = tokio::task::spawn_blocking(move || tracker.refresh_feature_importance())
            .await
            .map_err(|e| Error::Other(format!("feature importance worker failed: {e}")))??;
        debug!(features = scores.len(), "feature importance task complete");
        Ok(())
    }

    async fn record_excursions(&self) {
        let pending = self.tracker.pending_signals();
        if pending.is_empty() {
            return;
        }
        let prices = with_timeout(
            "last_prices",
            self.collaborator_timeout(),
            self.market.last_prices(),
        )
        .await;
        let prices = match prices {
            Ok(prices) => prices,
            Err(e) => {
                debug!(error = %e, "last prices unavailable");
                return;
            }
        };
        for snapshot in &pending {
            if let Some(price) = prices.get(&snapshot.instrument) {
                self.tracker.record_price(&snapshot.signal_id, *price);
            }
        }
    }

    async fn refresh_health(&self) -> SystemHealth {
        let now = self.clock.now();
        let risk = self.risk.risk_metrics().await;
        let tasks = self.scheduler.snapshot().await;
        let latest = self.classifier.latest().await;
        let components: Vec<ComponentHealth> =
            self.components.read().await.values().cloned().collect();

        let alerts = scan_alerts(
            &AlertInputs {
                risk: &risk,
                tasks: &tasks,
                latest_verdict: latest.as_deref(),
                components: &components,
            },
            &self.config.orchestrator,
            now,
        );
        SystemHealth::new(components, alerts, now)
    }

    async fn heartbeat(&self, health: &SystemHealth) {
        let risk = self.risk.risk_metrics().await;
        let regime = self.policy.current_regime_info().await;
        info!(
            level = ?health.level,
            alerts = health.alerts.len(),
            regime = %regime.regime,
            policy = %regime.policy_type,
            open_positions = risk.open_positions,
            daily_pnl = risk.daily_pnl,
            breakers = risk.circuit_breakers_active,
            "HEARTBEAT"
        );
        self.journal_event(
            "heartbeat",
            json!({
                "level": health.level,
                "alerts": health.alerts.len(),
                "regime": regime.regime.as_str(),
                "policy": regime.policy_type.as_str(),
                "open_positions": risk.open_positions,
                "daily_pnl": risk.daily_pnl,
                "circuit_breakers_active": risk.circuit_breakers_active,
                "paused": self.is_paused()
            }),
        )
        .await;
    }

    async fn mark_component(&self, name: &str, failure: Option<String>) {
        let now = self.clock.now();
        let mut components = self.components.write().await;
        let entry = components
            .entry(name.to_string())
            .or_insert_with(|| ComponentHealth {
                name: name.to_string(),
                healthy: true,
                detail: None,
                checked_at: now,
                failures: 0,
            });
        entry.checked_at = now;
        match failure {
            Some(detail) => {
                entry.healthy = false;
                entry.failures = entry.failures.saturating_add(1);
                entry.detail = Some(detail);
            }
            None => {
                entry.healthy = true;
                entry.failures = 0;
                entry.detail = None;
            }
        }
    }

    async fn note_task_status(&self, kind: TaskKind, status: &TaskRunStatus) {
        if let TaskRunStatus::Failed {
            error,
            error_count,
            disabled,
        } = status
        {
            let event = if *disabled { "task_disabled" } else { "task_failed" };
            self.journal_event(
                event,
                json!({
                    "task": kind.as_str(),
                    "error": error,
                    "error_count": error_count
                }),
            )
            .await;
        }
    }

    async fn journal_transition(&self, transition: &BreakerTransition) {
        match transition {
            BreakerTransition::Tripped { causes } => {
                let state = self.risk.state().await;
                self.journal_event(
                    "circuit_breaker_tripped",
                    json!({
                        "causes": causes,
                        "reason": state.trip_reason,
                        "cooling_off_until": state.cooling_off_until,
                        "daily_pnl": state.daily_pnl,
                        "consecutive_losses": state.consecutive_losses
                    }),
                )
                .await;
            }
            BreakerTransition::Reset => {
                self.journal_event("circuit_breaker_reset", json!({})).await;
            }
            BreakerTransition::Unchanged => {}
        }
    }

    async fn journal_event(&self, kind: &str, fields: Value) {
        write_event(self.journal.as_ref(), kind, fields).await;
    }

    fn collaborator_timeout(&self) -> Duration {
        Duration::from_millis(self.config.orchestrator.collaborator_timeout_ms.max(1))
    }
}

#[async_trait]
impl TaskRunner for Orchestrator {
    async fn run_task(&self, kind: TaskKind) -> Result<()> {
        match kind {
            TaskKind::RegimeUpdate => self.update_regime().await.map(|_| ()),
            TaskKind::RiskCheck => {
                self.check_risk().await;
                Ok(())
            }
            TaskKind::PerformanceReport => self.write_report_now().await.map(|_| ()),
            TaskKind::FeatureImportance => self.refresh_importance().await,
        }
    }
}

/// Awaits `handles` until `deadline`, then aborts whatever is still running.
async fn join_until<T>(
    what: &'static str,
    deadline: tokio::time::Instant,
    handles: Vec<JoinHandle<T>>,
) {
    if handles.is_empty() {
        return;
    }
    let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
    if tokio::time::timeout_at(deadline, futures::future::join_all(handles))
        .await
        .is_err()
    {
        let pending = aborts.iter().filter(|a| !a.is_finished()).count();
        warn!(what, pending, "did not stop within the grace period; aborting");
        for abort in aborts {
            abort.abort();
        }
    }
}

/// Runs `cycle` every `period_secs` until the token is cancelled.
fn spawn_loop<F, Fut>(
    name: &'static str,
    period_secs: u64,
    token: CancellationToken,
    mut cycle: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(period_secs.max(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(loop_name = name, period_secs, "loop started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = cycle() => {}
                    }
                }
            }
        }
        debug!(loop_name = name, "loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use audit_store::MemoryStore;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use common::{
        Direction, ManualClock, PolicyType, RegimeType, SignalFeatures, SignalOutcome,
        SignalSnapshot, VolumeProfileFeatures,
    };
    use regime_classifier::classifier::FALLBACK_FACTOR;
    use std::sync::atomic::{AtomicU64, AtomicUsize};
    use std::sync::Mutex as StdMutex;

    use crate::journal::EventJournal;

    fn friday() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 17, 0, 0).unwrap()
    }

    fn temp_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("{tag}-{}", uuid::Uuid::new_v4()))
    }

    struct StubMarket {
        failing: AtomicBool,
        reinits: AtomicUsize,
        prices: StdMutex<BTreeMap<String, f64>>,
        context_delay_ms: AtomicU64,
        contexts_served: AtomicUsize,
    }

    impl StubMarket {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                failing: AtomicBool::new(false),
                reinits: AtomicUsize::new(0),
                prices: StdMutex::new(BTreeMap::new()),
                context_delay_ms: AtomicU64::new(0),
                contexts_served: AtomicUsize::new(0),
            })
        }

        fn check(&self) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(Error::Collaborator("feed offline".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl MarketDataSource for StubMarket {
        fn name(&self) -> &str {
            "stub_market"
        }

        async fn market_context(&self) -> Result<MarketContextFeatures> {
            self.check()?;
            let delay = self.context_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            self.contexts_served.fetch_add(1, Ordering::SeqCst);
            let mut ctx = MarketContextFeatures::neutral(friday());
            ctx.spx_0dte_share = 0.7;
            ctx.put_call_ratio = 1.0;
            Ok(ctx)
        }

        async fn volume_profiles(&self) -> Result<Vec<VolumeProfileFeatures>> {
            self.check()?;
            Ok(["ES", "NQ", "RTY"]
                .iter()
                .map(|i| VolumeProfileFeatures {
                    instrument: i.to_string(),
                    point_of_control: 5_000.0,
                    value_area_high: 5_007.5,
                    value_area_low: 4_992.5,
                    high_volume_nodes: vec![],
                    low_volume_nodes: vec![],
                    total_volume: 250_000.0,
                })
                .collect())
        }

        async fn last_prices(&self) -> Result<BTreeMap<String, f64>> {
            self.check()?;
            Ok(self.prices.lock().unwrap().clone())
        }

        async fn health_check(&self) -> Result<()> {
            self.check()
        }

        async fn reinitialize(&self) -> Result<()> {
            self.reinits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct StubSignals {
        signals: StdMutex<Vec<SignalSnapshot>>,
        outcomes: StdMutex<Vec<ExecutionOutcome>>,
        delivered: StdMutex<Vec<PositionSizeDecision>>,
    }

    impl StubSignals {
        fn push_signal(&self, id: &str) {
            self.signals.lock().unwrap().push(SignalSnapshot {
                signal_id: id.into(),
                instrument: "ES".into(),
                direction: Direction::Buy,
                entry_price: 5_000.0,
                stop_loss: 4_990.0,
                target_price: 5_020.0,
                features: SignalFeatures::default(),
                rationale: "breakout".into(),
                confidence: 0.7,
                source: "stub".into(),
                regime: None,
                created_at: friday(),
            });
        }

        fn push_outcome(&self, id: &str, outcome: SignalOutcome, pnl: f64) {
            self.outcomes.lock().unwrap().push(ExecutionOutcome {
                signal_id: id.into(),
                outcome,
                exit_price: None,
                pnl,
                reason: None,
            });
        }

        fn delivered(&self) -> Vec<PositionSizeDecision> {
            self.delivered.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SignalSource for StubSignals {
        fn name(&self) -> &str {
            "stub_signals"
        }

        async fn poll_signals(&self) -> Result<Vec<SignalSnapshot>> {
            Ok(std::mem::take(&mut *self.signals.lock().unwrap()))
        }

        async fn poll_outcomes(&self) -> Result<Vec<ExecutionOutcome>> {
            Ok(std::mem::take(&mut *self.outcomes.lock().unwrap()))
        }

        async fn deliver(&self, decision: &PositionSizeDecision) -> Result<()> {
            self.delivered.lock().unwrap().push(decision.clone());
            Ok(())
        }
    }

    struct Harness {
        orchestrator: Arc<Orchestrator>,
        market: Arc<StubMarket>,
        signals: Arc<StubSignals>,
        clock: Arc<ManualClock>,
        report_dir: PathBuf,
    }

    async fn harness_with(config: EngineConfig, journal: Option<SharedJournal>) -> Harness {
        harness_on(config, journal, Arc::new(MemoryStore::new())).await
    }

    async fn harness_on(
        config: EngineConfig,
        journal: Option<SharedJournal>,
        store: SharedStore,
    ) -> Harness {
        let market = StubMarket::new();
        let signals = Arc::new(StubSignals::default());
        let clock = Arc::new(ManualClock::new(friday()));
        let report_dir = PathBuf::from(&config.orchestrator.report_dir);
        let orchestrator = Orchestrator::initialize(
            config,
            Collaborators {
                market: market.clone(),
                signals: signals.clone(),
                journal,
                store: Some(store),
            },
            clock.clone(),
        )
        .await
        .unwrap();
        Harness {
            orchestrator,
            market,
            signals,
            clock,
            report_dir,
        }
    }

    fn config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.orchestrator.report_dir = temp_dir("reports").display().to_string();
        config
    }

    async fn harness() -> Harness {
        harness_with(config(), None).await
    }

    #[tokio::test]
    async fn test_regime_update_switches_policy() {
        let h = harness().await;
        let status = h.orchestrator.force_run(TaskKind::RegimeUpdate).await;
        assert!(matches!(status, TaskRunStatus::Completed { .. }));

        let info = h.orchestrator.current_regime_info().await;
        assert_eq!(info.regime, RegimeType::GammaSqueeze);
        assert_eq!(info.policy_type, PolicyType::GammaSqueeze);
        assert!(info.latest_verdict.unwrap().confidence >= 0.6);
        assert_eq!(h.orchestrator.policy.policy_history(1).len(), 3);
    }

    #[tokio::test]
    async fn test_market_failure_falls_back_to_normal() {
        let h = harness().await;
        h.market.failing.store(true, Ordering::SeqCst);

        let verdict = h.orchestrator.update_regime().await.unwrap();
        assert_eq!(verdict.regime, RegimeType::Normal);
        assert!(verdict
            .contributing_factors
            .contains(&FALLBACK_FACTOR.to_string()));

        let status = h.orchestrator.status().await;
        assert_eq!(status.degraded, vec!["stub_market".to_string()]);
        assert_eq!(status.regime.policy_type, PolicyType::ConservativeTrend);
    }

    #[tokio::test]
    async fn test_signal_cycle_sizes_tracks_and_books() {
        let h = harness().await;
        h.signals.push_signal("sig-1");

        let summary = h.orchestrator.signal_cycle().await;
        assert_eq!(
            summary,
            CycleSummary {
                outcomes: 0,
                signals: 1,
                committed: 1,
                delivered: 1
            }
        );
        let decision = &h.signals.delivered()[0];
        assert!(decision.recommended_size > 0.0);
        assert_eq!(decision.regime, RegimeType::Normal);
        let stored = h.orchestrator.store().snapshot("sig-1").unwrap().unwrap();
        assert_eq!(stored.regime, Some(RegimeType::Normal));
        assert_eq!(h.orchestrator.risk_metrics().await.open_positions, 1);

        // price dips before the stop is hit
        h.market.prices.lock().unwrap().insert("ES".into(), 4_985.0);
        h.orchestrator.signal_cycle().await;
        h.signals.push_outcome("sig-1", SignalOutcome::StopLossHit, -150.0);
        let summary = h.orchestrator.signal_cycle().await;
        assert_eq!(summary.outcomes, 1);

        let record = h.orchestrator.store().outcome("sig-1").unwrap().unwrap();
        assert_eq!(record.outcome, SignalOutcome::StopLossHit);
        assert!((record.r_multiple.unwrap() + 1.0).abs() < 1e-9);
        assert!((record.mae.unwrap() + 1.5).abs() < 1e-9);

        let risk = h.orchestrator.risk_metrics().await;
        assert_eq!(risk.open_positions, 0);
        assert_eq!(risk.consecutive_losses, 1);
        assert_eq!(risk.daily_pnl, -150.0);
    }

    #[tokio::test]
    async fn test_duplicate_outcome_is_booked_once() {
        let h = harness().await;
        h.signals.push_signal("sig-1");
        h.orchestrator.signal_cycle().await;

        h.signals.push_outcome("sig-1", SignalOutcome::StopLossHit, -150.0);
        h.signals.push_outcome("sig-1", SignalOutcome::StopLossHit, -150.0);
        h.orchestrator.signal_cycle().await;

        let risk = h.orchestrator.risk_metrics().await;
        assert_eq!(risk.daily_pnl, -150.0);
        assert_eq!(risk.consecutive_losses, 1);
    }

    #[tokio::test]
    async fn test_pause_only_stops_signal_loop() {
        let h = harness().await;
        h.signals.push_signal("sig-1");

        h.orchestrator.pause();
        assert_eq!(h.orchestrator.signal_cycle().await, CycleSummary::default());
        assert!(h.signals.delivered().is_empty());
        assert!(matches!(
            h.orchestrator.force_run(TaskKind::RiskCheck).await,
            TaskRunStatus::Completed { .. }
        ));
        assert!(h.orchestrator.status().await.paused);

        h.orchestrator.resume();
        assert_eq!(h.orchestrator.signal_cycle().await.delivered, 1);
    }

    #[tokio::test]
    async fn test_losing_streak_trips_breakers_and_zeroes_size() {
        let journal_dir = temp_dir("journal");
        let clock = Arc::new(ManualClock::new(friday()));
        let journal = EventJournal::open(journal_dir.clone(), clock).unwrap().shared();
        let h = harness_with(config(), Some(journal)).await;

        for i in 0..4 {
            h.signals.push_signal(&format!("sig-{i}"));
        }
        h.orchestrator.signal_cycle().await;
        for i in 0..4 {
            h.signals
                .push_outcome(&format!("sig-{i}"), SignalOutcome::StopLossHit, -100.0);
        }
        h.signals.push_signal("sig-next");
        h.orchestrator.signal_cycle().await;

        let last = h.signals.delivered().pop().unwrap();
        assert_eq!(last.signal_id, "sig-next");
        assert_eq!(last.recommended_size, 0.0);
        assert!(last.reason.starts_with(risk_engine::BREAKER_REASON));

        let risk = h.orchestrator.risk_metrics().await;
        assert!(risk.circuit_breakers_active);
        assert_eq!(risk.cooling_off_until, Some(friday() + ChronoDuration::hours(4)));

        let events = std::fs::read_to_string(journal_dir.join("events-2024-03-01.jsonl")).unwrap();
        assert!(events.contains("\"kind\":\"engine_start\""));
        assert!(events.contains("\"kind\":\"circuit_breaker_tripped\""));
        assert!(events.contains("\"kind\":\"sizing_decision\""));
        let _ = std::fs::remove_dir_all(journal_dir);
    }

    #[tokio::test]
    async fn test_health_cycle_reinitializes_failed_collaborator() {
        let h = harness().await;
        h.market.failing.store(true, Ordering::SeqCst);
        h.orchestrator.health_cycle().await;

        assert_eq!(h.market.reinits.load(Ordering::SeqCst), 1);
        let status = h.orchestrator.status().await;
        assert_eq!(status.degraded, vec!["stub_market".to_string()]);
        assert!(status
            .health
            .alerts
            .iter()
            .any(|a| a.kind == "component_degraded"));

        h.market.failing.store(false, Ordering::SeqCst);
        h.orchestrator.health_cycle().await;
        assert!(h.orchestrator.status().await.degraded.is_empty());
    }

    #[tokio::test]
    async fn test_failing_report_task_is_disabled_while_others_run() {
        let blocker = temp_dir("not-a-dir");
        std::fs::write(&blocker, b"occupied").unwrap();
        let mut config = config();
        config.orchestrator.report_dir = blocker.join("reports").display().to_string();
        let h = harness_with(config, None).await;

        for _ in 0..6 {
            let spawned = h.orchestrator.spawn_due_tasks().await;
            assert_eq!(h.orchestrator.join_in_flight().await.len(), spawned);
            h.clock.advance(ChronoDuration::minutes(60));
        }

        let tasks = h.orchestrator.status().await.tasks;
        let report = tasks
            .iter()
            .find(|t| t.kind == TaskKind::PerformanceReport)
            .unwrap();
        assert!(report.is_disabled());
        assert_eq!(report.runs, 5);

        let regime = tasks.iter().find(|t| t.kind == TaskKind::RegimeUpdate).unwrap();
        assert!(!regime.is_disabled());
        assert_eq!(regime.runs, 6);
        assert_eq!(regime.error_count, 0);
        let _ = std::fs::remove_file(blocker);
    }

    #[tokio::test]
    async fn test_start_then_shutdown_is_idempotent() {
        let mut config = config();
        config.orchestrator.main_loop_secs = 1;
        config.orchestrator.scheduler_loop_secs = 1;
        config.orchestrator.health_loop_secs = 1;
        config.orchestrator.signal_loop_secs = 1;
        let h = harness_with(config, None).await;

        h.orchestrator.start().await.unwrap();
        h.orchestrator.start().await.unwrap();
        assert!(h.orchestrator.status().await.running);
        tokio::time::sleep(Duration::from_millis(50)).await;

        h.orchestrator.shutdown().await;
        h.orchestrator.shutdown().await;

        let status = h.orchestrator.status().await;
        assert!(!status.running);
        assert!(status.shut_down);
        assert!(h.orchestrator.start().await.is_err());

        let reports: Vec<_> = std::fs::read_dir(&h.report_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("report_"))
            .collect();
        assert!(!reports.is_empty());
        let _ = std::fs::remove_dir_all(&h.report_dir);
    }

    #[tokio::test]
    async fn test_rejecting_store_keeps_engine_running() {
        let failing = Arc::new(audit_store::FailingStore::new());
        let h = harness_on(config(), None, failing.clone()).await;

        let verdict = h.orchestrator.update_regime().await.unwrap();
        assert_eq!(verdict.regime, RegimeType::GammaSqueeze);

        h.signals.push_signal("sig-1");
        let summary = h.orchestrator.signal_cycle().await;
        assert_eq!(summary.signals, 1);
        assert_eq!(summary.delivered, 1);
        assert!(failing.calls() > 0);

        h.orchestrator.start().await.unwrap();
        h.orchestrator.shutdown().await;
        assert!(h.orchestrator.status().await.shut_down);
        let _ = std::fs::remove_dir_all(&h.report_dir);
    }

    fn slow_market_config(grace_secs: u64) -> EngineConfig {
        let mut config = config();
        config.orchestrator.shutdown_grace_secs = grace_secs;
        config.orchestrator.collaborator_timeout_ms = 120_000;
        config
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_regime_update() {
        let h = harness_with(slow_market_config(10), None).await;
        h.market.context_delay_ms.store(200, Ordering::SeqCst);
        let served = h.market.contexts_served.load(Ordering::SeqCst);

        assert!(h.orchestrator.spawn_due_tasks().await > 0);
        assert!(h.orchestrator.in_flight_count().await > 0);
        h.orchestrator.shutdown().await;

        assert_eq!(h.market.contexts_served.load(Ordering::SeqCst), served + 1);
        assert_eq!(h.orchestrator.in_flight_count().await, 0);
        let regime = h
            .orchestrator
            .status()
            .await
            .tasks
            .into_iter()
            .find(|t| t.kind == TaskKind::RegimeUpdate)
            .unwrap();
        assert_eq!(regime.runs, 1);
        assert_eq!(h.orchestrator.spawn_due_tasks().await, 0);
        let _ = std::fs::remove_dir_all(&h.report_dir);
    }

    #[tokio::test]
    async fn test_shutdown_aborts_task_past_grace_period() {
        let h = harness_with(slow_market_config(1), None).await;
        h.market.context_delay_ms.store(60_000, Ordering::SeqCst);
        let served = h.market.contexts_served.load(Ordering::SeqCst);

        assert!(h.orchestrator.spawn_due_tasks().await > 0);
        let started = std::time::Instant::now();
        h.orchestrator.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(10));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.market.contexts_served.load(Ordering::SeqCst), served);
        assert_eq!(h.orchestrator.in_flight_count().await, 0);
        let _ = std::fs::remove_dir_all(&h.report_dir);
    }

    #[tokio::test]
    async fn test_run_once_writes_report() {
        let h = harness().await;
        h.signals.push_signal("sig-1");
        let path = h.orchestrator.run_once().await.unwrap();

        let body: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        for section in [
            "performance",
            "risk",
            "regime",
            "policy",
            "feature_importance",
            "tasks",
            "alerts",
            "recommendations",
        ] {
            assert!(body.get(section).is_some(), "missing {section}");
        }
        assert_eq!(body["regime"]["current"]["regime"], "gamma_squeeze");
        assert_eq!(h.signals.delivered().len(), 1);
        let _ = std::fs::remove_dir_all(&h.report_dir);
    }
}
