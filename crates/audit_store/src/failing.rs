//! Backend that rejects every call, for exercising degraded persistence.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use common::{
    Error, PolicyRecord, RegimeVerdict, Result, SignalOutcomeRecord, SignalSnapshot, TradeRecord,
};

use crate::AuditStore;

#[derive(Default)]
pub struct FailingStore {
    calls: AtomicUsize,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of calls rejected so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn reject<T>(&self, op: &str) -> Result<T> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(Error::Storage(format!("{op}: disk full")))
    }
}

impl AuditStore for FailingStore {
    fn append_regime(&self, _verdict: &RegimeVerdict) -> Result<()> {
        self.reject("append_regime")
    }

    fn recent_regimes(&self, _limit: usize) -> Result<Vec<RegimeVerdict>> {
        self.reject("recent_regimes")
    }

    fn append_policy_record(&self, _record: &PolicyRecord) -> Result<()> {
        self.reject("append_policy_record")
    }

    fn policy_records_since(&self, _since: DateTime<Utc>) -> Result<Vec<PolicyRecord>> {
        self.reject("policy_records_since")
    }

    fn insert_snapshot(&self, _snapshot: &SignalSnapshot) -> Result<bool> {
        self.reject("insert_snapshot")
    }

    fn snapshot(&self, _signal_id: &str) -> Result<Option<SignalSnapshot>> {
        self.reject("snapshot")
    }

    fn insert_pending_outcome(&self, _signal_id: &str) -> Result<bool> {
        self.reject("insert_pending_outcome")
    }

    fn outcome(&self, _signal_id: &str) -> Result<Option<SignalOutcomeRecord>> {
        self.reject("outcome")
    }

    fn finalize_outcome(&self, _record: &SignalOutcomeRecord) -> Result<bool> {
        self.reject("finalize_outcome")
    }

    fn resolved_trades_between(
        &self,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<Vec<TradeRecord>> {
        self.reject("resolved_trades_between")
    }

    fn pending_snapshots(&self) -> Result<Vec<SignalSnapshot>> {
        self.reject("pending_snapshots")
    }

    fn save_feature_importance(&self, _scores: &BTreeMap<String, f64>) -> Result<()> {
        self.reject("save_feature_importance")
    }

    fn feature_importance(&self) -> Result<BTreeMap<String, f64>> {
        self.reject("feature_importance")
    }
}
