use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use common::config::RiskConfig;
use common::{
    PositionSizeDecision, RiskLevel, SharedClock, SignalOutcome, SizingRequest,
};
use dashmap::DashMap;
use outcome_tracker::OutcomeTracker;
use policy_manager::PolicyManager;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::adjustments;
use crate::breaker::{self, BreakerTransition};
use crate::kelly;

pub const BREAKER_REASON: &str = "circuit breakers active";

#[derive(Debug, Clone, Serialize)]
pub struct OpenPosition {
    pub instrument: String,
    /// Fraction of equity at risk.
    pub risk: f64,
    pub opened_at: DateTime<Utc>,
}

/// Process-wide risk state. Only the engine writes it.
#[derive(Debug, Clone, Serialize)]
pub struct RiskState {
    pub open_positions: BTreeMap<String, OpenPosition>,
    pub daily_pnl: f64,
    pub day: NaiveDate,
    pub consecutive_losses: u32,
    pub circuit_breakers_active: bool,
    pub cooling_off_until: Option<DateTime<Utc>>,
    pub trip_reason: Option<String>,
    pub tripped_at: Option<DateTime<Utc>>,
    pub equity: f64,
    pub peak_equity: f64,
}

impl RiskState {
    pub fn new(equity: f64, now: DateTime<Utc>) -> Self {
        Self {
            open_positions: BTreeMap::new(),
            daily_pnl: 0.0,
            day: now.date_naive(),
            consecutive_losses: 0,
            circuit_breakers_active: false,
            cooling_off_until: None,
            trip_reason: None,
            tripped_at: None,
            equity,
            peak_equity: equity,
        }
    }

    pub fn drawdown_pct(&self) -> f64 {
        if self.peak_equity <= 0.0 {
            return 0.0;
        }
        ((self.peak_equity - self.equity) / self.peak_equity).max(0.0)
    }

    pub fn committed_risk(&self) -> f64 {
        self.open_positions.values().map(|p| p.risk).sum()
    }

    fn rollover_if_needed(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if today != self.day {
            info!(
                previous = %self.day,
                daily_pnl = self.daily_pnl,
                "risk day rolled over"
            );
            self.day = today;
            self.daily_pnl = 0.0;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskMetrics {
    pub equity: f64,
    pub peak_equity: f64,
    pub drawdown_pct: f64,
    pub max_drawdown_pct: f64,
    pub daily_pnl: f64,
    pub daily_loss_limit: f64,
    pub consecutive_losses: u32,
    pub circuit_breakers_active: bool,
    pub cooling_off_until: Option<DateTime<Utc>>,
    pub trip_reason: Option<String>,
    pub open_positions: usize,
    pub committed_risk: f64,
    pub daily_risk_budget: f64,
    pub remaining_budget: f64,
    pub value_at_risk: f64,
    pub sector_exposure: BTreeMap<String, f64>,
}

pub struct RiskEngine {
    config: RiskConfig,
    policy: Arc<PolicyManager>,
    tracker: Arc<OutcomeTracker>,
    clock: SharedClock,
    state: RwLock<RiskState>,
    volatility: DashMap<String, f64>,
}

impl RiskEngine {
    pub fn new(
        config: RiskConfig,
        policy: Arc<PolicyManager>,
        tracker: Arc<OutcomeTracker>,
        clock: SharedClock,
    ) -> Self {
        let state = RiskState::new(config.account_equity, clock.now());
        Self {
            config,
            policy,
            tracker,
            clock,
            state: RwLock::new(state),
            volatility: DashMap::new(),
        }
    }

    /// Sizes one prospective trade. Every intermediate factor is recorded on
    /// the returned decision; a zero size always carries its reason.
    pub async fn calculate_size(&self, request: &SizingRequest) -> PositionSizeDecision {
        let now = self.clock.now();
        let params = self.policy.current_parameters().await;

        let (breakers_active, trip_reason, committed, drawdown_pct, open_instruments) = {
            let mut state = self.state.write().await;
            state.rollover_if_needed(now);
            (
                state.circuit_breakers_active,
                state.trip_reason.clone(),
                state.committed_risk(),
                state.drawdown_pct(),
                state
                    .open_positions
                    .values()
                    .map(|p| p.instrument.clone())
                    .collect::<Vec<_>>(),
            )
        };
        let budget = self.config.daily_risk_budget_pct;
        let used_pct = if budget > 0.0 {
            (committed / budget * 100.0).max(0.0)
        } else {
            100.0
        };
        let zero = |reason: String, kelly_raw: f64, factors: BTreeMap<String, f64>| {
            PositionSizeDecision {
                instrument: request.instrument.clone(),
                signal_id: request.signal_id.clone(),
                regime: request.regime,
                recommended_size: 0.0,
                max_allowed: 0.0,
                risk_level: RiskLevel::Critical,
                kelly_raw,
                kelly_adjusted: 0.0,
                adjustment_factors: factors,
                portfolio_risk_used_pct: used_pct,
                reason,
                decided_at: now,
            }
        };

        // 1. Breakers short-circuit everything.
        if breakers_active {
            let reason = match trip_reason {
                Some(why) => format!("{BREAKER_REASON}: {why}"),
                None => BREAKER_REASON.to_string(),
            };
            debug!(signal_id = %request.signal_id, "sizing refused: breakers active");
            return zero(reason, 0.0, BTreeMap::new());
        }
        if let Err(why) = validate(request) {
            warn!(signal_id = %request.signal_id, reason = %why, "sizing request rejected");
            return zero(format!("invalid request: {why}"), 0.0, BTreeMap::new());
        }

        // 2. Kelly from trailing instrument+regime stats.
        let stats = self.tracker.trade_stats(
            &request.instrument,
            request.regime,
            self.config.kelly_lookback_days,
        );
        let kelly = kelly::estimate(&stats, &self.config);

        // 3. Adjustment factors.
        let recent = self
            .tracker
            .performance_metrics(self.config.performance_lookback_days, None);
        let performance_score = (recent.total_trades >= self.config.min_trades_for_performance)
            .then_some(recent.performance_score);
        let realized_vol = self.volatility.get(&request.instrument).map(|v| *v);

        let mut factors = BTreeMap::new();
        factors.insert(
            "volatility".to_string(),
            adjustments::volatility(realized_vol, &self.config),
        );
        factors.insert(
            "regime".to_string(),
            adjustments::regime(request.regime, params.max_position_size, &self.config),
        );
        factors.insert(
            "correlation".to_string(),
            adjustments::correlation(
                &request.instrument,
                open_instruments.iter().map(String::as_str),
                &self.config,
            ),
        );
        factors.insert(
            "performance".to_string(),
            adjustments::performance(performance_score),
        );
        factors.insert(
            "drawdown".to_string(),
            adjustments::drawdown(drawdown_pct, &self.config),
        );
        factors.insert(
            "confidence".to_string(),
            adjustments::confidence(request.confidence),
        );
        let combined: f64 = factors.values().product();
        let kelly_adjusted = kelly.clamped * combined;
        factors.insert("kelly_clamped".to_string(), kelly.clamped);
        factors.insert("kelly_fraction".to_string(), self.config.kelly_fraction);

        // 4. Fractional Kelly against the policy and hard ceilings.
        let sized = (kelly_adjusted * self.config.kelly_fraction).max(0.0);
        let position_cap = params
            .max_position_size
            .min(self.config.max_position_pct)
            .max(0.0);

        // 5. Remaining daily budget.
        let remaining = (budget - committed).max(0.0);
        let budget_cap = remaining * self.config.remaining_budget_usage;
        let max_allowed = position_cap.min(budget_cap).max(0.0);
        let recommended = sized.min(max_allowed);

        if remaining <= 0.0 {
            return zero(
                "daily risk budget exhausted".to_string(),
                kelly.raw,
                factors,
            );
        }

        let projected = if budget > 0.0 {
            (committed + recommended) / budget
        } else {
            1.0
        };
        let risk_level = match projected {
            p if p < 0.25 => RiskLevel::Low,
            p if p < 0.5 => RiskLevel::Medium,
            p if p < 0.8 => RiskLevel::High,
            _ => RiskLevel::Critical,
        };

        let limiter = if sized <= max_allowed {
            "kelly"
        } else if budget_cap < position_cap {
            "daily budget"
        } else {
            "position cap"
        };
        let reason = format!(
            "{} kelly {:.4} x factors {:.3} x fraction {:.2} = {:.5}; limited by {}",
            if kelly.from_history { "historical" } else { "fallback" },
            kelly.clamped,
            combined,
            self.config.kelly_fraction,
            recommended,
            limiter,
        );

        debug!(
            signal_id = %request.signal_id,
            instrument = %request.instrument,
            recommended,
            max_allowed,
            "position sized"
        );

        PositionSizeDecision {
            instrument: request.instrument.clone(),
            signal_id: request.signal_id.clone(),
            regime: request.regime,
            recommended_size: recommended,
            max_allowed,
            risk_level,
            kelly_raw: kelly.raw,
            kelly_adjusted,
            adjustment_factors: factors,
            portfolio_risk_used_pct: used_pct,
            reason,
            decided_at: now,
        }
    }

    /// Registers an accepted decision's risk against the daily budget.
    /// Returns false for zero-size or already-committed signals.
    pub async fn commit(&self, decision: &PositionSizeDecision) -> bool {
        if decision.recommended_size <= 0.0 {
            return false;
        }
        let mut state = self.state.write().await;
        if state.open_positions.contains_key(&decision.signal_id) {
            return false;
        }
        state.open_positions.insert(
            decision.signal_id.clone(),
            OpenPosition {
                instrument: decision.instrument.clone(),
                risk: decision.recommended_size,
                opened_at: self.clock.now(),
            },
        );
        true
    }

    /// Books a realized result, then re-checks the trip conditions.
    pub async fn update_outcome(
        &self,
        signal_id: &str,
        outcome: SignalOutcome,
        pnl: f64,
    ) -> BreakerTransition {
        let now = self.clock.now();
        let mut state = self.state.write().await;
        state.rollover_if_needed(now);
        state.open_positions.remove(signal_id);

        let pnl = if pnl.is_finite() { pnl } else { 0.0 };
        if outcome != SignalOutcome::Cancelled {
            state.daily_pnl += pnl;
            state.equity += pnl;
            state.peak_equity = state.peak_equity.max(state.equity);
            if pnl < 0.0 {
                state.consecutive_losses = state.consecutive_losses.saturating_add(1);
            } else if pnl > 0.0 {
                state.consecutive_losses = 0;
            }
        }
        debug!(
            signal_id,
            outcome = outcome.as_str(),
            pnl,
            daily_pnl = state.daily_pnl,
            consecutive_losses = state.consecutive_losses,
            "outcome booked"
        );

        let transition = breaker::evaluate(&mut state, &self.config, now, false);
        log_transition(&transition, &state);
        transition
    }

    /// Periodic breaker check; the only path that can reset the breakers.
    pub async fn check_circuit_breakers(&self) -> BreakerTransition {
        let now = self.clock.now();
        let mut state = self.state.write().await;
        state.rollover_if_needed(now);
        let transition = breaker::evaluate(&mut state, &self.config, now, true);
        log_transition(&transition, &state);
        transition
    }

    /// Marks account equity from an external source, for drawdown tracking.
    pub async fn update_equity(&self, equity: f64) {
        if !equity.is_finite() {
            return;
        }
        let mut state = self.state.write().await;
        state.equity = equity;
        state.peak_equity = state.peak_equity.max(equity);
    }

    pub fn update_volatility(&self, instrument: &str, realized: f64) {
        if realized.is_finite() && realized > 0.0 {
            self.volatility.insert(instrument.to_string(), realized);
        }
    }

    pub async fn state(&self) -> RiskState {
        self.state.read().await.clone()
    }

    pub async fn risk_metrics(&self) -> RiskMetrics {
        let state = self.state.read().await;
        let committed = state.committed_risk();
        RiskMetrics {
            equity: state.equity,
            peak_equity: state.peak_equity,
            drawdown_pct: state.drawdown_pct(),
            max_drawdown_pct: self.config.max_drawdown_pct,
            daily_pnl: state.daily_pnl,
            daily_loss_limit: self.config.daily_loss_limit,
            consecutive_losses: state.consecutive_losses,
            circuit_breakers_active: state.circuit_breakers_active,
            cooling_off_until: state.cooling_off_until,
            trip_reason: state.trip_reason.clone(),
            open_positions: state.open_positions.len(),
            committed_risk: committed,
            daily_risk_budget: self.config.daily_risk_budget_pct,
            remaining_budget: (self.config.daily_risk_budget_pct - committed).max(0.0),
            value_at_risk: self.value_at_risk(),
            sector_exposure: self.sector_exposure(),
        }
    }

    /// Not implemented yet: always 0.0.
    pub fn value_at_risk(&self) -> f64 {
        0.0
    }

    /// Not implemented yet: always empty.
    pub fn sector_exposure(&self) -> BTreeMap<String, f64> {
        BTreeMap::new()
    }
}

fn validate(request: &SizingRequest) -> Result<(), String> {
    if !request.entry_price.is_finite() || request.entry_price <= 0.0 {
        return Err(format!("entry price {}", request.entry_price));
    }
    if !request.stop_loss.is_finite() || request.stop_loss <= 0.0 {
        return Err(format!("stop loss {}", request.stop_loss));
    }
    if (request.entry_price - request.stop_loss).abs() < f64::EPSILON {
        return Err("stop equals entry".to_string());
    }
    if !request.confidence.is_finite() {
        return Err("confidence is not a number".to_string());
    }
    Ok(())
}

fn log_transition(transition: &BreakerTransition, state: &RiskState) {
    match transition {
        BreakerTransition::Tripped { .. } => warn!(
            reason = state.trip_reason.as_deref().unwrap_or(""),
            cooling_off_until = ?state.cooling_off_until,
            "circuit breakers tripped"
        ),
        BreakerTransition::Reset => info!("circuit breakers reset"),
        BreakerTransition::Unchanged => {}
    }
}
