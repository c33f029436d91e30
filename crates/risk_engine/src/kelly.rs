//! Kelly estimation from trailing trade statistics.

use common::config::RiskConfig;
use outcome_tracker::PerformanceMetrics;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct KellyEstimate {
    /// Formula value before clamping, or the fallback constant.
    pub raw: f64,
    /// `raw` clamped to `[0, max_kelly]`.
    pub clamped: f64,
    pub trades: usize,
    pub from_history: bool,
}

/// `(b·p − q) / b` with `b = avg_win / avg_loss`.
pub fn kelly_fraction(win_rate: f64, avg_win_r: f64, avg_loss_r: f64) -> f64 {
    let p = win_rate.clamp(0.0, 1.0);
    let q = 1.0 - p;
    if avg_win_r <= 0.0 {
        return 0.0;
    }
    if avg_loss_r <= 0.0 {
        // no observed losses; the formula tends to p as b grows
        return p;
    }
    let b = avg_win_r / avg_loss_r;
    (b * p - q) / b
}

pub fn estimate(stats: &PerformanceMetrics, config: &RiskConfig) -> KellyEstimate {
    if stats.total_trades < config.min_trades_for_kelly {
        return KellyEstimate {
            raw: config.fallback_kelly,
            clamped: config.fallback_kelly.clamp(0.0, config.max_kelly),
            trades: stats.total_trades,
            from_history: false,
        };
    }
    let raw = kelly_fraction(stats.win_rate, stats.avg_win_r, stats.avg_loss_r);
    KellyEstimate {
        raw,
        clamped: raw.clamp(0.0, config.max_kelly),
        trades: stats.total_trades,
        from_history: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_b_kelly_is_clamped() {
        let stats = PerformanceMetrics {
            total_trades: 10,
            wins: 6,
            losses: 4,
            win_rate: 0.6,
            avg_win_r: 1.5,
            avg_loss_r: 1.0,
            ..PerformanceMetrics::default()
        };
        let k = estimate(&stats, &RiskConfig::default());
        assert!((k.raw - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(k.clamped, 0.10);
        assert!(k.from_history);
    }

    #[test]
    fn test_too_few_trades_uses_fallback() {
        let stats = PerformanceMetrics {
            total_trades: 9,
            win_rate: 0.9,
            avg_win_r: 3.0,
            avg_loss_r: 1.0,
            ..PerformanceMetrics::default()
        };
        let k = estimate(&stats, &RiskConfig::default());
        assert_eq!(k.raw, 0.01);
        assert!(!k.from_history);
    }

    #[test]
    fn test_negative_edge_clamps_to_zero() {
        assert!(kelly_fraction(0.3, 1.0, 1.0) < 0.0);
        let stats = PerformanceMetrics {
            total_trades: 20,
            win_rate: 0.3,
            avg_win_r: 1.0,
            avg_loss_r: 1.0,
            ..PerformanceMetrics::default()
        };
        assert_eq!(estimate(&stats, &RiskConfig::default()).clamped, 0.0);
    }
}
