//! Configuration loader: merges `.env`, an optional TOML file, and
//! `ADAPTIVE_*` environment overrides.

use std::path::{Path, PathBuf};

use common::{EngineConfig, Error};
use serde::{Deserialize, Serialize};

/// File-backed collaborators the binary wires into the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Directory holding `market_context.json`, `volume_profiles.json`,
    /// `signals.jsonl` and `outcomes.jsonl`.
    #[serde(default = "default_feed_dir")]
    pub dir: String,
}

fn default_feed_dir() -> String {
    "feeds".to_string()
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            dir: default_feed_dir(),
        }
    }
}

impl FeedConfig {
    pub fn path(&self) -> PathBuf {
        PathBuf::from(&self.dir)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(flatten)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub feeds: FeedConfig,
}

fn parse_non_negative_f64(raw: &str, env_name: &str) -> Result<f64, Error> {
    let parsed = raw
        .trim()
        .parse::<f64>()
        .map_err(|_| Error::Config(format!("{env_name} must be a number >= 0")))?;
    if !parsed.is_finite() || parsed < 0.0 {
        return Err(Error::Config(format!("{env_name} must be a number >= 0")));
    }
    Ok(parsed)
}

fn parse_positive_u32(raw: &str, env_name: &str) -> Result<u32, Error> {
    let parsed = raw
        .trim()
        .parse::<u32>()
        .map_err(|_| Error::Config(format!("{env_name} must be an integer > 0")))?;
    if parsed == 0 {
        return Err(Error::Config(format!("{env_name} must be an integer > 0")));
    }
    Ok(parsed)
}

fn non_empty(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn in_unit_interval(value: f64) -> bool {
    value > 0.0 && value <= 1.0
}

fn validate_config(config: &AppConfig) -> Result<(), Error> {
    let mut issues: Vec<String> = Vec::new();
    let engine = &config.engine;

    let risk = &engine.risk;
    if risk.account_equity <= 0.0 {
        issues.push("risk.account_equity must be > 0".into());
    }
    if risk.daily_loss_limit <= 0.0 {
        issues.push("risk.daily_loss_limit must be > 0".into());
    }
    if !in_unit_interval(risk.max_drawdown_pct) {
        issues.push("risk.max_drawdown_pct must be in (0, 1]".into());
    }
    if !(0.0..1.0).contains(&risk.drawdown_reduction_start) {
        issues.push("risk.drawdown_reduction_start must be in [0, 1)".into());
    }
    if !in_unit_interval(risk.kelly_fraction) {
        issues.push("risk.kelly_fraction must be in (0, 1]".into());
    }
    if risk.fallback_kelly < 0.0 || risk.fallback_kelly > risk.max_kelly {
        issues.push("risk.fallback_kelly must be in [0, max_kelly]".into());
    }
    if !in_unit_interval(risk.max_position_pct) {
        issues.push("risk.max_position_pct must be in (0, 1]".into());
    }
    if !in_unit_interval(risk.daily_risk_budget_pct) {
        issues.push("risk.daily_risk_budget_pct must be in (0, 1]".into());
    }
    if !in_unit_interval(risk.remaining_budget_usage) {
        issues.push("risk.remaining_budget_usage must be in (0, 1]".into());
    }
    if risk.max_consecutive_losses == 0 {
        issues.push("risk.max_consecutive_losses must be > 0".into());
    }
    if risk.cooling_off_hours < 0 {
        issues.push("risk.cooling_off_hours must be >= 0".into());
    }
    for pair in &risk.correlations {
        if !(-1.0..=1.0).contains(&pair.rho) {
            issues.push(format!(
                "risk.correlations {}/{} rho must be in [-1, 1]",
                pair.a, pair.b
            ));
        }
    }
    if risk.regime_multipliers.values().any(|m| *m < 0.0) {
        issues.push("risk.regime_multipliers must be >= 0".into());
    }

    let regime = &engine.regime;
    if regime.min_consecutive_cycles == 0 {
        issues.push("regime.min_consecutive_cycles must be > 0".into());
    }
    if regime.history_size < regime.min_consecutive_cycles {
        issues.push("regime.history_size must be >= regime.min_consecutive_cycles".into());
    }
    if !in_unit_interval(regime.fallback_confidence) {
        issues.push("regime.fallback_confidence must be in (0, 1]".into());
    }

    let policy = &engine.policy;
    if !(0.0..=1.0).contains(&policy.min_switch_confidence) {
        issues.push("policy.min_switch_confidence must be in [0, 1]".into());
    }
    if policy.min_regime_dwell_minutes < 0 {
        issues.push("policy.min_regime_dwell_minutes must be >= 0".into());
    }
    if policy.min_position_floor <= 0.0 || policy.min_position_floor > policy.max_position_ceiling
    {
        issues.push("policy.min_position_floor must be in (0, max_position_ceiling]".into());
    }
    if policy.max_concurrent_ceiling == 0 {
        issues.push("policy.max_concurrent_ceiling must be > 0".into());
    }
    if !(0.0..=1.0).contains(&policy.min_confidence_ceiling) {
        issues.push("policy.min_confidence_ceiling must be in [0, 1]".into());
    }

    let orchestrator = &engine.orchestrator;
    for (name, secs) in [
        ("orchestrator.main_loop_secs", orchestrator.main_loop_secs),
        ("orchestrator.scheduler_loop_secs", orchestrator.scheduler_loop_secs),
        ("orchestrator.health_loop_secs", orchestrator.health_loop_secs),
        ("orchestrator.signal_loop_secs", orchestrator.signal_loop_secs),
        ("orchestrator.collaborator_timeout_ms", orchestrator.collaborator_timeout_ms),
    ] {
        if secs == 0 {
            issues.push(format!("{name} must be > 0"));
        }
    }
    for (name, minutes) in [
        ("orchestrator.regime_interval_minutes", orchestrator.regime_interval_minutes),
        ("orchestrator.risk_check_interval_minutes", orchestrator.risk_check_interval_minutes),
        ("orchestrator.report_interval_minutes", orchestrator.report_interval_minutes),
        ("orchestrator.importance_interval_minutes", orchestrator.importance_interval_minutes),
    ] {
        if minutes <= 0 {
            issues.push(format!("{name} must be > 0"));
        }
    }
    if orchestrator.max_task_errors == 0 {
        issues.push("orchestrator.max_task_errors must be > 0".into());
    }
    if orchestrator.report_dir.trim().is_empty() {
        issues.push("orchestrator.report_dir must not be empty".into());
    }

    if engine.storage.db_path.trim().is_empty() {
        issues.push("storage.db_path must not be empty (use :memory: for a scratch store)".into());
    }
    if config.feeds.dir.trim().is_empty() {
        issues.push("feeds.dir must not be empty".into());
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "Invalid config:\n - {}",
            issues.join("\n - ")
        )))
    }
}

/// Applies `ADAPTIVE_*` overrides read through `lookup`.
fn apply_env_overrides<F>(config: &mut AppConfig, lookup: F) -> Result<(), Error>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = lookup("ADAPTIVE_DB_PATH").as_deref().and_then(non_empty) {
        config.engine.storage.db_path = path;
    }
    if let Some(dir) = lookup("ADAPTIVE_REPORT_DIR").as_deref().and_then(non_empty) {
        config.engine.orchestrator.report_dir = dir;
    }
    if let Some(dir) = lookup("ADAPTIVE_FEED_DIR").as_deref().and_then(non_empty) {
        config.feeds.dir = dir;
    }
    if let Some(raw) = lookup("ADAPTIVE_ACCOUNT_EQUITY") {
        config.engine.risk.account_equity =
            parse_non_negative_f64(&raw, "ADAPTIVE_ACCOUNT_EQUITY")?;
    }
    if let Some(raw) = lookup("ADAPTIVE_DAILY_LOSS_LIMIT") {
        config.engine.risk.daily_loss_limit =
            parse_non_negative_f64(&raw, "ADAPTIVE_DAILY_LOSS_LIMIT")?;
    }
    if let Some(raw) = lookup("ADAPTIVE_MAX_CONSECUTIVE_LOSSES") {
        config.engine.risk.max_consecutive_losses =
            parse_positive_u32(&raw, "ADAPTIVE_MAX_CONSECUTIVE_LOSSES")?;
    }
    Ok(())
}

fn load_from<F>(path: &Path, lookup: F) -> Result<AppConfig, Error>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = AppConfig::default();

    if path.exists() {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        config = toml::from_str(&contents).map_err(|e| {
            Error::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
    } else {
        tracing::info!("{} not found, using defaults", path.display());
    }

    apply_env_overrides(&mut config, lookup)?;
    validate_config(&config)?;
    Ok(config)
}

/// Load configuration from the environment and an optional TOML file.
pub fn load_config(path: &Path) -> Result<AppConfig, Error> {
    // 1. Load .env file from project root or parent directories.
    if let Err(e) = dotenvy::dotenv() {
        tracing::debug!("No .env file loaded: {}", e);
    }

    // 2. Defaults, then the TOML file, then environment variables.
    load_from(path, |name| std::env::var(name).ok())
}
