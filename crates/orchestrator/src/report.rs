//! Comprehensive JSON report written on a schedule and at shutdown.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use common::{PolicyRecord, PolicyState, Result};
use outcome_tracker::PerformanceMetrics;
use policy_manager::RegimeInfo;
use risk_engine::RiskMetrics;
use serde::Serialize;

use crate::health::{Alert, DRAWDOWN_ALERT_FRACTION};
use crate::tasks::ScheduledTask;

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceSection {
    pub last_7_days: PerformanceMetrics,
    pub last_30_days: PerformanceMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegimeSection {
    pub current: RegimeInfo,
    /// Keyed by regime name.
    pub breakdown: BTreeMap<String, PerformanceMetrics>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PolicySection {
    pub current: PolicyState,
    pub history: Vec<PolicyRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComprehensiveReport {
    pub generated_at: DateTime<Utc>,
    pub performance: PerformanceSection,
    pub risk: RiskMetrics,
    pub regime: RegimeSection,
    pub policy: PolicySection,
    pub feature_importance: BTreeMap<String, f64>,
    pub tasks: Vec<ScheduledTask>,
    pub alerts: Vec<Alert>,
    pub recommendations: Vec<String>,
}

pub fn report_file_name(at: DateTime<Utc>) -> String {
    format!("report_{}.json", at.format("%Y%m%d_%H%M%S"))
}

/// Writes the report under `dir`, creating it when missing.
pub fn write_report(dir: &Path, report: &ComprehensiveReport) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(report_file_name(report.generated_at));
    let body = serde_json::to_string_pretty(report)?;
    std::fs::write(&path, body)?;
    Ok(path)
}

pub fn recommendations(
    performance: &PerformanceSection,
    risk: &RiskMetrics,
    regime: &RegimeInfo,
    tasks: &[ScheduledTask],
    low_confidence: f64,
) -> Vec<String> {
    let mut out = Vec::new();
    let recent = &performance.last_7_days;

    if risk.circuit_breakers_active {
        out.push(format!(
            "Hold new entries until circuit breakers reset ({})",
            risk.trip_reason.as_deref().unwrap_or("unknown cause")
        ));
    }
    if risk.max_drawdown_pct > 0.0
        && risk.drawdown_pct >= risk.max_drawdown_pct * DRAWDOWN_ALERT_FRACTION
    {
        out.push(format!(
            "Drawdown at {:.2}%; cut exposure before the {:.2}% limit",
            risk.drawdown_pct * 100.0,
            risk.max_drawdown_pct * 100.0
        ));
    }
    if recent.total_trades == 0 {
        out.push("No resolved trades in 7 days; sizing runs on the fallback Kelly fraction".into());
    } else {
        if recent.total_trades >= 5 && recent.win_rate < 0.4 {
            out.push(format!(
                "7-day win rate {:.0}% is weak; review entry filters",
                recent.win_rate * 100.0
            ));
        }
        if matches!(recent.profit_factor, Some(pf) if pf < 1.0) {
            out.push("7-day profit factor below 1.0; losses outweigh wins".into());
        }
    }
    if regime.confidence < low_confidence {
        out.push(format!(
            "Regime {} accepted at low confidence {:.2}; favor defensive sizing",
            regime.regime, regime.confidence
        ));
    }
    for task in tasks.iter().filter(|t| t.is_disabled()) {
        out.push(format!("Investigate disabled task {}", task.kind));
    }
    if out.is_empty() {
        out.push("No action required".into());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use common::{PolicyType, RegimeType};

    fn risk() -> RiskMetrics {
        RiskMetrics {
            equity: 100_000.0,
            peak_equity: 100_000.0,
            drawdown_pct: 0.0,
            max_drawdown_pct: 0.15,
            daily_pnl: 0.0,
            daily_loss_limit: 2_000.0,
            consecutive_losses: 0,
            circuit_breakers_active: false,
            cooling_off_until: None,
            trip_reason: None,
            open_positions: 0,
            committed_risk: 0.0,
            daily_risk_budget: 0.06,
            remaining_budget: 0.06,
            value_at_risk: 0.0,
            sector_exposure: BTreeMap::new(),
        }
    }

    fn regime(confidence: f64) -> RegimeInfo {
        let at = Utc.with_ymd_and_hms(2024, 3, 4, 15, 0, 0).unwrap();
        RegimeInfo {
            regime: RegimeType::StrongTrend,
            confidence,
            regime_since: at,
            policy_type: PolicyType::AggressiveTrend,
            active_since: at,
            latest_verdict: None,
        }
    }

    #[test]
    fn test_file_name_is_timestamped() {
        let at = Utc.with_ymd_and_hms(2024, 3, 4, 9, 5, 7).unwrap();
        assert_eq!(report_file_name(at), "report_20240304_090507.json");
    }

    #[test]
    fn test_recommendations_flag_weak_performance() {
        let performance = PerformanceSection {
            last_7_days: PerformanceMetrics {
                total_trades: 8,
                win_rate: 0.25,
                profit_factor: Some(0.6),
                ..PerformanceMetrics::default()
            },
            last_30_days: PerformanceMetrics::default(),
        };
        let mut r = risk();
        r.circuit_breakers_active = true;
        r.trip_reason = Some("daily loss 2000.00 >= limit 2000.00".into());

        let recs = recommendations(&performance, &r, &regime(0.3), &[], 0.5);
        assert_eq!(recs.len(), 4);
        assert!(recs[0].starts_with("Hold new entries"));
        assert!(recs[3].contains("low confidence"));
    }

    #[test]
    fn test_recommendations_default() {
        let performance = PerformanceSection {
            last_7_days: PerformanceMetrics {
                total_trades: 6,
                win_rate: 0.6,
                profit_factor: Some(1.8),
                ..PerformanceMetrics::default()
            },
            last_30_days: PerformanceMetrics::default(),
        };
        let recs = recommendations(&performance, &risk(), &regime(0.9), &[], 0.5);
        assert_eq!(recs, vec!["No action required".to_string()]);
    }
}
