//! Feature importance as correlation with realized R.

use std::collections::BTreeMap;

use common::{SignalOutcome, TradeRecord};

/// Pearson correlation; `None` for fewer than two points or zero variance.
pub fn pearson(xs: &[f64], ys: &[f64]) -> Option<f64> {
    let n = xs.len().min(ys.len());
    if n < 2 {
        return None;
    }
    let nf = n as f64;
    let mean_x = xs[..n].iter().sum::<f64>() / nf;
    let mean_y = ys[..n].iter().sum::<f64>() / nf;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for i in 0..n {
        let dx = xs[i] - mean_x;
        let dy = ys[i] - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    if var_x <= f64::EPSILON || var_y <= f64::EPSILON {
        return None;
    }
    Some((cov / (var_x.sqrt() * var_y.sqrt())).clamp(-1.0, 1.0))
}

/// Correlates every numeric snapshot feature against realized R.
///
/// Features observed on fewer than `min_samples` trades are left out.
pub fn compute_importance(trades: &[TradeRecord], min_samples: usize) -> BTreeMap<String, f64> {
    let mut columns: BTreeMap<String, (Vec<f64>, Vec<f64>)> = BTreeMap::new();
    for trade in trades {
        if matches!(
            trade.outcome.outcome,
            SignalOutcome::Pending | SignalOutcome::Cancelled
        ) {
            continue;
        }
        let r = trade.r_multiple();
        for (name, value) in trade.snapshot.features.numeric_features() {
            let (xs, ys) = columns.entry(name).or_default();
            xs.push(value);
            ys.push(r);
        }
    }

    columns
        .into_iter()
        .filter(|(_, (xs, _))| xs.len() >= min_samples.max(2))
        .filter_map(|(name, (xs, ys))| pearson(&xs, &ys).map(|c| (name, c)))
        .collect()
}
