//! Component health and alert scanning.

use chrono::{DateTime, Duration, Utc};
use common::config::OrchestratorConfig;
use common::RegimeVerdict;
use risk_engine::RiskMetrics;
use serde::Serialize;

use crate::tasks::ScheduledTask;

/// Share of the drawdown limit at which an alert is raised.
pub const DRAWDOWN_ALERT_FRACTION: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub kind: String,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    fn new(severity: AlertSeverity, kind: &str, message: String, now: DateTime<Utc>) -> Self {
        Self {
            severity,
            kind: kind.to_string(),
            message,
            raised_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub healthy: bool,
    pub detail: Option<String>,
    pub checked_at: DateTime<Utc>,
    /// Consecutive failed probes.
    pub failures: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub level: HealthLevel,
    pub components: Vec<ComponentHealth>,
    pub alerts: Vec<Alert>,
    pub checked_at: DateTime<Utc>,
}

impl SystemHealth {
    pub fn new(
        components: Vec<ComponentHealth>,
        alerts: Vec<Alert>,
        checked_at: DateTime<Utc>,
    ) -> Self {
        let level = if alerts.iter().any(|a| a.severity == AlertSeverity::Critical) {
            HealthLevel::Critical
        } else if components.iter().any(|c| !c.healthy)
            || alerts.iter().any(|a| a.severity == AlertSeverity::Warning)
        {
            HealthLevel::Degraded
        } else {
            HealthLevel::Healthy
        };
        Self {
            level,
            components,
            alerts,
            checked_at,
        }
    }

    pub fn degraded_components(&self) -> Vec<String> {
        self.components
            .iter()
            .filter(|c| !c.healthy)
            .map(|c| c.name.clone())
            .collect()
    }
}

pub struct AlertInputs<'a> {
    pub risk: &'a RiskMetrics,
    pub tasks: &'a [ScheduledTask],
    pub latest_verdict: Option<&'a RegimeVerdict>,
    pub components: &'a [ComponentHealth],
}

pub fn scan_alerts(
    inputs: &AlertInputs<'_>,
    config: &OrchestratorConfig,
    now: DateTime<Utc>,
) -> Vec<Alert> {
    let mut alerts = Vec::new();
    let risk = inputs.risk;

    if risk.circuit_breakers_active {
        alerts.push(Alert::new(
            AlertSeverity::Critical,
            "circuit_breakers_active",
            format!(
                "circuit breakers active: {}",
                risk.trip_reason.as_deref().unwrap_or("unknown cause")
            ),
            now,
        ));
    }

    if risk.max_drawdown_pct > 0.0
        && risk.drawdown_pct >= risk.max_drawdown_pct * DRAWDOWN_ALERT_FRACTION
    {
        alerts.push(Alert::new(
            AlertSeverity::Warning,
            "drawdown",
            format!(
                "drawdown {:.2}% is above {:.0}% of the {:.2}% limit",
                risk.drawdown_pct * 100.0,
                DRAWDOWN_ALERT_FRACTION * 100.0,
                risk.max_drawdown_pct * 100.0
            ),
            now,
        ));
    }

    for task in inputs.tasks.iter().filter(|t| t.is_disabled()) {
        alerts.push(Alert::new(
            AlertSeverity::Warning,
            "task_disabled",
            format!(
                "task {} disabled after {} errors: {}",
                task.kind,
                task.error_count,
                task.last_error.as_deref().unwrap_or("")
            ),
            now,
        ));
    }

    match inputs.latest_verdict {
        Some(verdict) => {
            if verdict.confidence < config.low_confidence_alert {
                alerts.push(Alert::new(
                    AlertSeverity::Info,
                    "low_regime_confidence",
                    format!(
                        "regime {} confidence {:.2} below {:.2}",
                        verdict.regime, verdict.confidence, config.low_confidence_alert
                    ),
                    now,
                ));
            }
            let age = now - verdict.detected_at;
            if age > Duration::minutes(config.stale_regime_minutes) {
                alerts.push(Alert::new(
                    AlertSeverity::Warning,
                    "stale_regime",
                    format!("last regime verdict is {} minutes old", age.num_minutes()),
                    now,
                ));
            }
        }
        None => alerts.push(Alert::new(
            AlertSeverity::Info,
            "no_regime_verdict",
            "no regime verdict yet".to_string(),
            now,
        )),
    }

    for component in inputs.components.iter().filter(|c| !c.healthy) {
        alerts.push(Alert::new(
            AlertSeverity::Warning,
            "component_degraded",
            format!(
                "{} degraded: {}",
                component.name,
                component.detail.as_deref().unwrap_or("health check failed")
            ),
            now,
        ));
    }

    alerts
}
