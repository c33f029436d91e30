//! Scheduled task catalog.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use common::config::OrchestratorConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    RegimeUpdate,
    RiskCheck,
    PerformanceReport,
    FeatureImportance,
}

impl TaskKind {
    pub const ALL: [TaskKind; 4] = [
        TaskKind::RegimeUpdate,
        TaskKind::RiskCheck,
        TaskKind::PerformanceReport,
        TaskKind::FeatureImportance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RegimeUpdate => "regime_update",
            Self::RiskCheck => "risk_check",
            Self::PerformanceReport => "performance_report",
            Self::FeatureImportance => "feature_importance",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL.into_iter().find(|k| k.as_str() == normalized)
    }

    pub fn interval(&self, config: &OrchestratorConfig) -> Duration {
        let minutes = match self {
            Self::RegimeUpdate => config.regime_interval_minutes,
            Self::RiskCheck => config.risk_check_interval_minutes,
            Self::PerformanceReport => config.report_interval_minutes,
            Self::FeatureImportance => config.importance_interval_minutes,
        };
        Duration::minutes(minutes.max(1))
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduledTask {
    pub kind: TaskKind,
    pub interval_minutes: i64,
    pub next_run: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_duration_ms: Option<u64>,
    pub last_error: Option<String>,
    pub running: bool,
    pub error_count: u32,
    pub max_errors: u32,
    pub runs: u64,
    pub disabled: bool,
}

impl ScheduledTask {
    /// New tasks are due immediately.
    pub fn new(kind: TaskKind, config: &OrchestratorConfig, now: DateTime<Utc>) -> Self {
        Self {
            kind,
            interval_minutes: kind.interval(config).num_minutes(),
            next_run: now,
            last_run: None,
            last_duration_ms: None,
            last_error: None,
            running: false,
            error_count: 0,
            max_errors: config.max_task_errors.max(1),
            runs: 0,
            disabled: false,
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.disabled && !self.running && now >= self.next_run
    }

    pub(crate) fn record_success(&mut self, now: DateTime<Utc>, duration_ms: u64) {
        self.running = false;
        self.runs += 1;
        self.last_run = Some(now);
        self.next_run = now + Duration::minutes(self.interval_minutes);
        self.last_duration_ms = Some(duration_ms);
        self.error_count = 0;
        self.last_error = None;
    }

    /// Returns true when this failure disabled the task.
    pub(crate) fn record_failure(&mut self, now: DateTime<Utc>, error: String) -> bool {
        self.running = false;
        self.runs += 1;
        self.last_run = Some(now);
        self.next_run = now + Duration::minutes(self.interval_minutes);
        self.last_error = Some(error);
        self.error_count = self.error_count.saturating_add(1);
        if !self.disabled && self.error_count >= self.max_errors {
            self.disabled = true;
            return true;
        }
        false
    }
}
