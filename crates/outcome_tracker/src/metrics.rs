//! Aggregate trade statistics over resolved outcomes.

use common::{PolicyPerformance, SignalOutcome, TradeRecord};
use serde::{Deserialize, Serialize};

/// Blend of win-rate deviation and average R into [-1, 1].
///
/// A 50% win rate at 0R scores 0; 100% winners at +2R or better scores 1.
pub fn performance_score(win_rate: f64, avg_r_multiple: f64) -> f64 {
    let win_component = (win_rate - 0.5) * 2.0;
    let r_component = avg_r_multiple.clamp(-2.0, 2.0) / 2.0;
    ((win_component + r_component) / 2.0).clamp(-1.0, 1.0)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PerformanceMetrics {
    pub total_trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_rate: f64,
    pub avg_r_multiple: f64,
    /// Mean R of winning trades.
    pub avg_win_r: f64,
    /// Mean magnitude of R on losing trades (positive).
    pub avg_loss_r: f64,
    /// `avg_r_multiple * win_rate`.
    pub expectancy: f64,
    pub gross_profit_r: f64,
    pub gross_loss_r: f64,
    /// `None` when there are no losing trades.
    pub profit_factor: Option<f64>,
    pub best_r: f64,
    pub worst_r: f64,
    pub avg_mae: f64,
    pub avg_mfe: f64,
    pub avg_holding_secs: f64,
    pub performance_score: f64,
}

impl PerformanceMetrics {
    /// Aggregates terminal trades. Cancelled signals never traded and are skipped.
    pub fn from_trades<'a, I>(trades: I) -> Self
    where
        I: IntoIterator<Item = &'a TradeRecord>,
    {
        let mut m = PerformanceMetrics::default();
        let mut sum_r = 0.0;
        let mut sum_mae = 0.0;
        let mut sum_mfe = 0.0;
        let mut sum_holding = 0.0;
        let mut best = f64::NEG_INFINITY;
        let mut worst = f64::INFINITY;

        for trade in trades {
            if matches!(
                trade.outcome.outcome,
                SignalOutcome::Pending | SignalOutcome::Cancelled
            ) {
                continue;
            }
            let r = trade.r_multiple();
            m.total_trades += 1;
            sum_r += r;
            if r > 0.0 {
                m.wins += 1;
                m.gross_profit_r += r;
            } else if r < 0.0 {
                m.losses += 1;
                m.gross_loss_r += -r;
            }
            best = best.max(r);
            worst = worst.min(r);
            sum_mae += trade.outcome.mae.unwrap_or(0.0);
            sum_mfe += trade.outcome.mfe.unwrap_or(0.0);
            sum_holding += trade.outcome.holding_time_secs.unwrap_or(0) as f64;
        }

        if m.total_trades == 0 {
            return m;
        }

        let n = m.total_trades as f64;
        m.win_rate = m.wins as f64 / n;
        m.avg_r_multiple = sum_r / n;
        m.avg_win_r = if m.wins > 0 {
            m.gross_profit_r / m.wins as f64
        } else {
            0.0
        };
        m.avg_loss_r = if m.losses > 0 {
            m.gross_loss_r / m.losses as f64
        } else {
            0.0
        };
        m.expectancy = m.avg_r_multiple * m.win_rate;
        m.profit_factor = if m.gross_loss_r > 0.0 {
            Some(m.gross_profit_r / m.gross_loss_r)
        } else {
            None
        };
        m.best_r = best;
        m.worst_r = worst;
        m.avg_mae = sum_mae / n;
        m.avg_mfe = sum_mfe / n;
        m.avg_holding_secs = sum_holding / n;
        m.performance_score = performance_score(m.win_rate, m.avg_r_multiple);
        m
    }

    pub fn as_policy_performance(&self) -> PolicyPerformance {
        PolicyPerformance {
            trades: self.total_trades as u32,
            win_rate: self.win_rate,
            avg_r_multiple: self.avg_r_multiple,
            performance_score: self.performance_score,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::{Direction, SignalOutcomeRecord, SignalSnapshot};

    fn trade(r: f64, outcome: SignalOutcome) -> TradeRecord {
        let now = Utc::now();
        let snapshot = SignalSnapshot {
            signal_id: uuid::Uuid::new_v4().to_string(),
            instrument: "NQ".into(),
            direction: Direction::Buy,
            entry_price: 100.0,
            stop_loss: 99.0,
            target_price: 102.0,
            features: Default::default(),
            rationale: String::new(),
            confidence: 0.6,
            source: "test".into(),
            regime: None,
            created_at: now,
        };
        let mut record = SignalOutcomeRecord::pending(snapshot.signal_id.clone());
        record.outcome = outcome;
        record.r_multiple = Some(r);
        record.mae = Some(r.min(0.0));
        record.mfe = Some(r.max(0.0));
        record.exit_time = Some(now);
        TradeRecord {
            snapshot,
            outcome: record,
        }
    }

    #[test]
    fn test_aggregates_match_hand_computation() {
        let mut trades = Vec::new();
        for _ in 0..6 {
            trades.push(trade(1.5, SignalOutcome::TakeProfitHit));
        }
        for _ in 0..4 {
            trades.push(trade(-1.0, SignalOutcome::StopLossHit));
        }

        let m = PerformanceMetrics::from_trades(&trades);
        assert_eq!(m.total_trades, 10);
        assert!((m.win_rate - 0.6).abs() < 1e-12);
        assert!((m.avg_r_multiple - 0.5).abs() < 1e-12);
        assert!((m.expectancy - 0.3).abs() < 1e-12);
        assert!((m.avg_win_r - 1.5).abs() < 1e-12);
        assert!((m.avg_loss_r - 1.0).abs() < 1e-12);
        assert!((m.profit_factor.unwrap() - 2.25).abs() < 1e-12);
        assert_eq!(m.best_r, 1.5);
        assert_eq!(m.worst_r, -1.0);
        assert!((m.avg_mae + 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_cancelled_and_pending_are_ignored() {
        let trades = vec![
            trade(0.0, SignalOutcome::Cancelled),
            trade(0.0, SignalOutcome::Pending),
        ];
        let m = PerformanceMetrics::from_trades(&trades);
        assert_eq!(m, PerformanceMetrics::default());
    }

    #[test]
    fn test_no_losses_has_no_profit_factor() {
        let trades = vec![trade(2.0, SignalOutcome::TakeProfitHit)];
        let m = PerformanceMetrics::from_trades(&trades);
        assert_eq!(m.profit_factor, None);
        assert_eq!(m.win_rate, 1.0);
    }

    #[test]
    fn test_performance_score_bounds() {
        assert_eq!(performance_score(0.5, 0.0), 0.0);
        assert_eq!(performance_score(1.0, 5.0), 1.0);
        assert_eq!(performance_score(0.0, -5.0), -1.0);
        assert!(performance_score(0.3, -0.5) < -0.3);
    }
}
