//! Engine configuration types.
//!
//! Every empirically chosen constant lives here as a named, overridable
//! field. All sections default, so an empty `config.toml` is valid.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::RegimeType;

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub regime: RegimeConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Regime classifier thresholds and confidence shaping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeConfig {
    /// Verdicts kept in memory for stability lookups.
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    /// Consecutive agreeing cycles before a flip is penalty-free.
    #[serde(default = "default_min_consecutive_cycles")]
    pub min_consecutive_cycles: usize,
    #[serde(default = "default_stability_penalty")]
    pub stability_penalty: f64,
    /// Score a regime needs to count as an agreeing signal.
    #[serde(default = "default_agreement_threshold")]
    pub agreement_threshold: f64,
    #[serde(default = "default_agreement_min_count")]
    pub agreement_min_count: usize,
    #[serde(default = "default_agreement_boost")]
    pub agreement_boost: f64,
    #[serde(default = "default_single_signal_penalty")]
    pub single_signal_penalty: f64,
    /// Normal scores `max(normal_score_floor, 1 - best_other)`.
    #[serde(default = "default_normal_score_floor")]
    pub normal_score_floor: f64,
    #[serde(default = "default_fallback_confidence")]
    pub fallback_confidence: f64,

    #[serde(default = "default_tight_value_area_pct")]
    pub tight_value_area_pct: f64,
    #[serde(default = "default_wide_value_area_pct")]
    pub wide_value_area_pct: f64,
    #[serde(default = "default_high_0dte_share")]
    pub high_0dte_share: f64,
    #[serde(default = "default_low_0dte_share")]
    pub low_0dte_share: f64,
    #[serde(default = "default_high_gamma_concentration")]
    pub high_gamma_concentration: f64,
    #[serde(default = "default_pinning_gamma_concentration")]
    pub pinning_gamma_concentration: f64,
    #[serde(default = "default_high_imbalance")]
    pub high_imbalance: f64,
    #[serde(default = "default_moderate_imbalance")]
    pub moderate_imbalance: f64,
    #[serde(default = "default_put_call_extreme_high")]
    pub put_call_extreme_high: f64,
    #[serde(default = "default_put_call_extreme_low")]
    pub put_call_extreme_low: f64,
    /// Average high-volume nodes per instrument considered dense.
    #[serde(default = "default_hvn_density_high")]
    pub hvn_density_high: f64,
}

/// Policy switching and continuous adaptation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_min_switch_confidence")]
    pub min_switch_confidence: f64,
    #[serde(default = "default_min_regime_dwell_minutes")]
    pub min_regime_dwell_minutes: i64,
    #[serde(default = "default_confidence_improvement")]
    pub confidence_improvement_threshold: f64,

    /// Lookback for the defensive-template override.
    #[serde(default = "default_template_lookback_days")]
    pub template_lookback_days: i64,
    #[serde(default = "default_poor_win_rate")]
    pub poor_win_rate: f64,
    #[serde(default = "default_poor_avg_r")]
    pub poor_avg_r: f64,
    #[serde(default = "default_min_trades_for_override")]
    pub min_trades_for_override: u32,

    #[serde(default = "default_adaptation_lookback_days")]
    pub adaptation_lookback_days: i64,
    #[serde(default = "default_poor_performance_score")]
    pub poor_performance_score: f64,
    #[serde(default = "default_good_performance_score")]
    pub good_performance_score: f64,
    #[serde(default = "default_min_trades_for_adaptation")]
    pub min_trades_for_adaptation: u32,
    #[serde(default = "default_confidence_nudge")]
    pub confidence_nudge: f64,
    #[serde(default = "default_size_nudge_down")]
    pub size_nudge_down: f64,
    #[serde(default = "default_size_nudge_up")]
    pub size_nudge_up: f64,

    /// Hard ceilings the upward nudges never cross.
    #[serde(default = "default_max_position_ceiling")]
    pub max_position_ceiling: f64,
    #[serde(default = "default_max_concurrent_ceiling")]
    pub max_concurrent_ceiling: u32,
    #[serde(default = "default_min_confidence_ceiling")]
    pub min_confidence_ceiling: f64,
    /// Downward size nudges stop here.
    #[serde(default = "default_min_position_floor")]
    pub min_position_floor: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationPair {
    pub a: String,
    pub b: String,
    pub rho: f64,
}

/// Position sizing and circuit breaker limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Equity the drawdown and loss limits are measured against.
    #[serde(default = "default_account_equity")]
    pub account_equity: f64,

    #[serde(default = "default_kelly_lookback_days")]
    pub kelly_lookback_days: i64,
    #[serde(default = "default_min_trades_for_kelly")]
    pub min_trades_for_kelly: usize,
    #[serde(default = "default_fallback_kelly")]
    pub fallback_kelly: f64,
    #[serde(default = "default_max_kelly")]
    pub max_kelly: f64,
    #[serde(default = "default_kelly_fraction")]
    pub kelly_fraction: f64,

    /// Hard per-position ceiling (fraction of equity).
    #[serde(default = "default_max_position_pct")]
    pub max_position_pct: f64,
    /// Hard daily ceiling on committed portfolio risk.
    #[serde(default = "default_daily_risk_budget_pct")]
    pub daily_risk_budget_pct: f64,
    /// Share of the remaining daily budget a single trade may use.
    #[serde(default = "default_remaining_budget_usage")]
    pub remaining_budget_usage: f64,

    #[serde(default = "default_target_volatility")]
    pub target_volatility: f64,
    #[serde(default = "default_volatility_scaling")]
    pub volatility_scaling: f64,

    #[serde(default = "default_correlation_ceiling")]
    pub correlation_ceiling: f64,
    #[serde(default = "default_max_correlation_penalty")]
    pub max_correlation_penalty: f64,
    #[serde(default = "default_correlation")]
    pub default_correlation: f64,
    #[serde(default)]
    pub correlations: Vec<CorrelationPair>,

    #[serde(default = "default_performance_lookback_days")]
    pub performance_lookback_days: i64,
    #[serde(default = "default_min_trades_for_performance")]
    pub min_trades_for_performance: usize,

    #[serde(default = "default_regime_multipliers")]
    pub regime_multipliers: BTreeMap<RegimeType, f64>,

    /// Realized daily loss (account currency) that trips the breakers.
    #[serde(default = "default_daily_loss_limit")]
    pub daily_loss_limit: f64,
    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: u32,
    #[serde(default = "default_max_drawdown_pct")]
    pub max_drawdown_pct: f64,
    /// Fraction of `max_drawdown_pct` where size reduction begins.
    #[serde(default = "default_drawdown_reduction_start")]
    pub drawdown_reduction_start: f64,
    #[serde(default = "default_cooling_off_hours")]
    pub cooling_off_hours: i64,
}

/// Outcome tracker caching and learning cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    #[serde(default = "default_metrics_cache_ttl_minutes")]
    pub metrics_cache_ttl_minutes: i64,
    #[serde(default = "default_importance_lookback_days")]
    pub importance_lookback_days: i64,
    #[serde(default = "default_importance_min_samples")]
    pub importance_min_samples: usize,
    /// Newly resolved trades that trigger a feature-importance refresh.
    #[serde(default = "default_importance_refresh_after")]
    pub importance_refresh_after: usize,
    #[serde(default = "default_regime_lookback_days")]
    pub regime_lookback_days: i64,
}

/// Loop cadences, task catalog intervals, and supervision limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_main_loop_secs")]
    pub main_loop_secs: u64,
    #[serde(default = "default_scheduler_loop_secs")]
    pub scheduler_loop_secs: u64,
    #[serde(default = "default_health_loop_secs")]
    pub health_loop_secs: u64,
    #[serde(default = "default_signal_loop_secs")]
    pub signal_loop_secs: u64,
    /// Upper bound on any single collaborator call.
    #[serde(default = "default_collaborator_timeout_ms")]
    pub collaborator_timeout_ms: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_max_task_errors")]
    pub max_task_errors: u32,

    #[serde(default = "default_regime_interval_minutes")]
    pub regime_interval_minutes: i64,
    #[serde(default = "default_risk_check_interval_minutes")]
    pub risk_check_interval_minutes: i64,
    #[serde(default = "default_report_interval_minutes")]
    pub report_interval_minutes: i64,
    #[serde(default = "default_importance_interval_minutes")]
    pub importance_interval_minutes: i64,

    #[serde(default = "default_report_dir")]
    pub report_dir: String,
    #[serde(default = "default_low_confidence_alert")]
    pub low_confidence_alert: f64,
    #[serde(default = "default_stale_regime_minutes")]
    pub stale_regime_minutes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database path; `:memory:` keeps everything in-process.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

// ── Defaults ──────────────────────────────────────────────────────────

fn default_history_size() -> usize {
    100
}
fn default_min_consecutive_cycles() -> usize {
    3
}
fn default_stability_penalty() -> f64 {
    0.8
}
fn default_agreement_threshold() -> f64 {
    0.5
}
fn default_agreement_min_count() -> usize {
    3
}
fn default_agreement_boost() -> f64 {
    0.10
}
fn default_single_signal_penalty() -> f64 {
    0.10
}
fn default_normal_score_floor() -> f64 {
    0.8
}
fn default_fallback_confidence() -> f64 {
    0.5
}
fn default_tight_value_area_pct() -> f64 {
    0.005
}
fn default_wide_value_area_pct() -> f64 {
    0.015
}
fn default_high_0dte_share() -> f64 {
    0.6
}
fn default_low_0dte_share() -> f64 {
    0.3
}
fn default_high_gamma_concentration() -> f64 {
    0.6
}
fn default_pinning_gamma_concentration() -> f64 {
    0.7
}
fn default_high_imbalance() -> f64 {
    0.3
}
fn default_moderate_imbalance() -> f64 {
    0.15
}
fn default_put_call_extreme_high() -> f64 {
    1.3
}
fn default_put_call_extreme_low() -> f64 {
    0.6
}
fn default_hvn_density_high() -> f64 {
    2.0
}

fn default_min_switch_confidence() -> f64 {
    0.6
}
fn default_min_regime_dwell_minutes() -> i64 {
    15
}
fn default_confidence_improvement() -> f64 {
    0.2
}
fn default_template_lookback_days() -> i64 {
    30
}
fn default_poor_win_rate() -> f64 {
    0.4
}
fn default_poor_avg_r() -> f64 {
    0.0
}
fn default_min_trades_for_override() -> u32 {
    5
}
fn default_adaptation_lookback_days() -> i64 {
    7
}
fn default_poor_performance_score() -> f64 {
    -0.3
}
fn default_good_performance_score() -> f64 {
    0.3
}
fn default_min_trades_for_adaptation() -> u32 {
    5
}
fn default_confidence_nudge() -> f64 {
    0.05
}
fn default_size_nudge_down() -> f64 {
    0.9
}
fn default_size_nudge_up() -> f64 {
    1.1
}
fn default_max_position_ceiling() -> f64 {
    0.03
}
fn default_max_concurrent_ceiling() -> u32 {
    10
}
fn default_min_position_floor() -> f64 {
    0.0025
}
fn default_min_confidence_ceiling() -> f64 {
    0.95
}

fn default_account_equity() -> f64 {
    100_000.0
}
fn default_kelly_lookback_days() -> i64 {
    30
}
fn default_min_trades_for_kelly() -> usize {
    10
}
fn default_fallback_kelly() -> f64 {
    0.01
}
fn default_max_kelly() -> f64 {
    0.10
}
fn default_kelly_fraction() -> f64 {
    0.25
}
fn default_max_position_pct() -> f64 {
    0.03
}
fn default_daily_risk_budget_pct() -> f64 {
    0.06
}
fn default_remaining_budget_usage() -> f64 {
    0.8
}
fn default_target_volatility() -> f64 {
    0.15
}
fn default_volatility_scaling() -> f64 {
    1.0
}
fn default_correlation_ceiling() -> f64 {
    0.7
}
fn default_max_correlation_penalty() -> f64 {
    0.5
}
fn default_correlation() -> f64 {
    0.3
}
fn default_performance_lookback_days() -> i64 {
    7
}
fn default_min_trades_for_performance() -> usize {
    5
}
fn default_regime_multipliers() -> BTreeMap<RegimeType, f64> {
    BTreeMap::from([
        (RegimeType::StrongTrend, 1.2),
        (RegimeType::WeakTrend, 1.0),
        (RegimeType::MeanReversion, 0.9),
        (RegimeType::GammaSqueeze, 0.5),
        (RegimeType::Pinning, 0.7),
        (RegimeType::HighVolatility, 0.6),
        (RegimeType::Normal, 1.0),
    ])
}
fn default_daily_loss_limit() -> f64 {
    2_000.0
}
fn default_max_consecutive_losses() -> u32 {
    4
}
fn default_max_drawdown_pct() -> f64 {
    0.15
}
fn default_drawdown_reduction_start() -> f64 {
    0.7
}
fn default_cooling_off_hours() -> i64 {
    4
}

fn default_metrics_cache_ttl_minutes() -> i64 {
    15
}
fn default_importance_lookback_days() -> i64 {
    30
}
fn default_importance_min_samples() -> usize {
    10
}
fn default_importance_refresh_after() -> usize {
    20
}
fn default_regime_lookback_days() -> i64 {
    30
}

fn default_main_loop_secs() -> u64 {
    30
}
fn default_scheduler_loop_secs() -> u64 {
    60
}
fn default_health_loop_secs() -> u64 {
    300
}
fn default_signal_loop_secs() -> u64 {
    60
}
fn default_collaborator_timeout_ms() -> u64 {
    10_000
}
fn default_shutdown_grace_secs() -> u64 {
    10
}
fn default_max_task_errors() -> u32 {
    5
}
fn default_regime_interval_minutes() -> i64 {
    15
}
fn default_risk_check_interval_minutes() -> i64 {
    5
}
fn default_report_interval_minutes() -> i64 {
    60
}
fn default_importance_interval_minutes() -> i64 {
    360
}
fn default_report_dir() -> String {
    "reports".into()
}
fn default_low_confidence_alert() -> f64 {
    0.5
}
fn default_stale_regime_minutes() -> i64 {
    45
}
fn default_db_path() -> String {
    "adaptive-control.db".into()
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            history_size: default_history_size(),
            min_consecutive_cycles: default_min_consecutive_cycles(),
            stability_penalty: default_stability_penalty(),
            agreement_threshold: default_agreement_threshold(),
            agreement_min_count: default_agreement_min_count(),
            agreement_boost: default_agreement_boost(),
            single_signal_penalty: default_single_signal_penalty(),
            normal_score_floor: default_normal_score_floor(),
            fallback_confidence: default_fallback_confidence(),
            tight_value_area_pct: default_tight_value_area_pct(),
            wide_value_area_pct: default_wide_value_area_pct(),
            high_0dte_share: default_high_0dte_share(),
            low_0dte_share: default_low_0dte_share(),
            high_gamma_concentration: default_high_gamma_concentration(),
            pinning_gamma_concentration: default_pinning_gamma_concentration(),
            high_imbalance: default_high_imbalance(),
            moderate_imbalance: default_moderate_imbalance(),
            put_call_extreme_high: default_put_call_extreme_high(),
            put_call_extreme_low: default_put_call_extreme_low(),
            hvn_density_high: default_hvn_density_high(),
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            min_switch_confidence: default_min_switch_confidence(),
            min_regime_dwell_minutes: default_min_regime_dwell_minutes(),
            confidence_improvement_threshold: default_confidence_improvement(),
            template_lookback_days: default_template_lookback_days(),
            poor_win_rate: default_poor_win_rate(),
            poor_avg_r: default_poor_avg_r(),
            min_trades_for_override: default_min_trades_for_override(),
            adaptation_lookback_days: default_adaptation_lookback_days(),
            poor_performance_score: default_poor_performance_score(),
            good_performance_score: default_good_performance_score(),
            min_trades_for_adaptation: default_min_trades_for_adaptation(),
            confidence_nudge: default_confidence_nudge(),
            size_nudge_down: default_size_nudge_down(),
            size_nudge_up: default_size_nudge_up(),
            max_position_ceiling: default_max_position_ceiling(),
            max_concurrent_ceiling: default_max_concurrent_ceiling(),
            min_confidence_ceiling: default_min_confidence_ceiling(),
            min_position_floor: default_min_position_floor(),
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            account_equity: default_account_equity(),
            kelly_lookback_days: default_kelly_lookback_days(),
            min_trades_for_kelly: default_min_trades_for_kelly(),
            fallback_kelly: default_fallback_kelly(),
            max_kelly: default_max_kelly(),
            kelly_fraction: default_kelly_fraction(),
            max_position_pct: default_max_position_pct(),
            daily_risk_budget_pct: default_daily_risk_budget_pct(),
            remaining_budget_usage: default_remaining_budget_usage(),
            target_volatility: default_target_volatility(),
            volatility_scaling: default_volatility_scaling(),
            correlation_ceiling: default_correlation_ceiling(),
            max_correlation_penalty: default_max_correlation_penalty(),
            default_correlation: default_correlation(),
            correlations: Vec::new(),
            performance_lookback_days: default_performance_lookback_days(),
            min_trades_for_performance: default_min_trades_for_performance(),
            regime_multipliers: default_regime_multipliers(),
            daily_loss_limit: default_daily_loss_limit(),
            max_consecutive_losses: default_max_consecutive_losses(),
            max_drawdown_pct: default_max_drawdown_pct(),
            drawdown_reduction_start: default_drawdown_reduction_start(),
            cooling_off_hours: default_cooling_off_hours(),
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            metrics_cache_ttl_minutes: default_metrics_cache_ttl_minutes(),
            importance_lookback_days: default_importance_lookback_days(),
            importance_min_samples: default_importance_min_samples(),
            importance_refresh_after: default_importance_refresh_after(),
            regime_lookback_days: default_regime_lookback_days(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            main_loop_secs: default_main_loop_secs(),
            scheduler_loop_secs: default_scheduler_loop_secs(),
            health_loop_secs: default_health_loop_secs(),
            signal_loop_secs: default_signal_loop_secs(),
            collaborator_timeout_ms: default_collaborator_timeout_ms(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            max_task_errors: default_max_task_errors(),
            regime_interval_minutes: default_regime_interval_minutes(),
            risk_check_interval_minutes: default_risk_check_interval_minutes(),
            report_interval_minutes: default_report_interval_minutes(),
            importance_interval_minutes: default_importance_interval_minutes(),
            report_dir: default_report_dir(),
            low_confidence_alert: default_low_confidence_alert(),
            stale_regime_minutes: default_stale_regime_minutes(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.policy.min_regime_dwell_minutes, 15);
        assert_eq!(cfg.risk.max_consecutive_losses, 4);
        assert_eq!(cfg.regime.normal_score_floor, 0.8);
        assert_eq!(cfg.risk.regime_multipliers[&RegimeType::GammaSqueeze], 0.5);
        assert_eq!(cfg.orchestrator.max_task_errors, 5);
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let cfg: EngineConfig =
            serde_json::from_str(r#"{"risk": {"daily_loss_limit": 500.0}}"#).unwrap();
        assert_eq!(cfg.risk.daily_loss_limit, 500.0);
        assert_eq!(cfg.risk.kelly_fraction, 0.25);
    }
}
