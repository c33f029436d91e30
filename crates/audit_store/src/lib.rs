//! Durable state for the control layer.
//!
//! Four logical tables: an append-only regime log, an append-only policy
//! log, signal snapshots keyed by signal id, and a 1:1 outcome table that
//! starts out `pending`. Feature-importance scores ride along as a small
//! overwrite-in-place table.

pub mod failing;
pub mod memory;
pub mod sqlite;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::config::StorageConfig;
use common::{
    PolicyRecord, RegimeVerdict, Result, SignalOutcomeRecord, SignalSnapshot, TradeRecord,
};

pub use failing::FailingStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

pub trait AuditStore: Send + Sync {
    fn append_regime(&self, verdict: &RegimeVerdict) -> Result<()>;

    /// Most recent verdicts, oldest first.
    fn recent_regimes(&self, limit: usize) -> Result<Vec<RegimeVerdict>>;

    fn append_policy_record(&self, record: &PolicyRecord) -> Result<()>;

    /// Records whose end (or start, while still open) is at or after `since`.
    fn policy_records_since(&self, since: DateTime<Utc>) -> Result<Vec<PolicyRecord>>;

    /// Inserts the snapshot unless one with the same id exists. Returns
    /// `true` when a new row was written.
    fn insert_snapshot(&self, snapshot: &SignalSnapshot) -> Result<bool>;

    fn snapshot(&self, signal_id: &str) -> Result<Option<SignalSnapshot>>;

    /// Creates the pending outcome row if absent.
    fn insert_pending_outcome(&self, signal_id: &str) -> Result<bool>;

    fn outcome(&self, signal_id: &str) -> Result<Option<SignalOutcomeRecord>>;

    /// Writes a terminal outcome only over a pending row. Returns `false`
    /// when the row was already terminal or missing.
    fn finalize_outcome(&self, record: &SignalOutcomeRecord) -> Result<bool>;

    /// Terminal trades whose exit time falls in `[start, end]`, by exit time.
    fn resolved_trades_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TradeRecord>>;

    fn pending_snapshots(&self) -> Result<Vec<SignalSnapshot>>;

    fn save_feature_importance(&self, scores: &BTreeMap<String, f64>) -> Result<()>;

    fn feature_importance(&self) -> Result<BTreeMap<String, f64>>;
}

pub type SharedStore = Arc<dyn AuditStore>;

/// Opens the configured backend. `:memory:` still goes through SQLite so
/// the schema is exercised.
pub fn open_store(config: &StorageConfig) -> Result<SharedStore> {
    let store = if config.db_path.trim() == ":memory:" {
        SqliteStore::open_in_memory()?
    } else {
        SqliteStore::open(&config.db_path)?
    };
    tracing::info!("Audit store opened at {}", config.db_path);
    Ok(Arc::new(store))
}
