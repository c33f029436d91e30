//! Seams to the market-facing collaborators. This core never fetches market
//! data itself; it pulls through these traits, always under a timeout.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use common::{
    Error, MarketContextFeatures, PositionSizeDecision, Result, SignalOutcome, SignalSnapshot,
    VolumeProfileFeatures,
};
use serde::{Deserialize, Serialize};

#[async_trait]
pub trait MarketDataSource: Send + Sync {
    fn name(&self) -> &str;

    async fn market_context(&self) -> Result<MarketContextFeatures>;

    async fn volume_profiles(&self) -> Result<Vec<VolumeProfileFeatures>>;

    /// Last traded prices by instrument, used for excursion tracking.
    async fn last_prices(&self) -> Result<BTreeMap<String, f64>> {
        Ok(BTreeMap::new())
    }

    /// Annualized realized volatility by instrument.
    async fn realized_volatility(&self) -> Result<BTreeMap<String, f64>> {
        Ok(BTreeMap::new())
    }

    async fn health_check(&self) -> Result<()>;

    async fn reinitialize(&self) -> Result<()> {
        Ok(())
    }
}

/// Execution result pushed back by the broker side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub signal_id: String,
    pub outcome: SignalOutcome,
    #[serde(default)]
    pub exit_price: Option<f64>,
    /// Realized P&L in account currency.
    #[serde(default)]
    pub pnl: f64,
    #[serde(default)]
    pub reason: Option<String>,
}

#[async_trait]
pub trait SignalSource: Send + Sync {
    fn name(&self) -> &str;

    /// New signal snapshots since the last poll.
    async fn poll_signals(&self) -> Result<Vec<SignalSnapshot>>;

    /// New execution outcomes since the last poll.
    async fn poll_outcomes(&self) -> Result<Vec<ExecutionOutcome>>;

    async fn deliver(&self, decision: &PositionSizeDecision) -> Result<()>;

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    async fn reinitialize(&self) -> Result<()> {
        Ok(())
    }
}

/// Bounds a collaborator call. Elapsed calls become `Error::Timeout`.
pub async fn with_timeout<T, F>(operation: &str, timeout: Duration, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout {
            operation: operation.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}
