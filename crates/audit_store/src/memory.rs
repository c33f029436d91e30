//! In-process backend for tests and dry runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use common::{
    Error, PolicyRecord, RegimeVerdict, Result, SignalOutcomeRecord, SignalSnapshot, TradeRecord,
};

use crate::AuditStore;

#[derive(Default)]
struct MemoryState {
    regimes: Vec<RegimeVerdict>,
    policies: Vec<PolicyRecord>,
    snapshots: HashMap<String, SignalSnapshot>,
    outcomes: HashMap<String, SignalOutcomeRecord>,
    importance: BTreeMap<String, f64>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl AuditStore for MemoryStore {
    fn append_regime(&self, verdict: &RegimeVerdict) -> Result<()> {
        self.state().regimes.push(verdict.clone());
        Ok(())
    }

    fn recent_regimes(&self, limit: usize) -> Result<Vec<RegimeVerdict>> {
        let state = self.state();
        let skip = state.regimes.len().saturating_sub(limit);
        Ok(state.regimes[skip..].to_vec())
    }

    fn append_policy_record(&self, record: &PolicyRecord) -> Result<()> {
        self.state().policies.push(record.clone());
        Ok(())
    }

    fn policy_records_since(&self, since: DateTime<Utc>) -> Result<Vec<PolicyRecord>> {
        Ok(self
            .state()
            .policies
            .iter()
            .filter(|r| r.ended_at.unwrap_or(r.started_at) >= since)
            .cloned()
            .collect())
    }

    fn insert_snapshot(&self, snapshot: &SignalSnapshot) -> Result<bool> {
        let mut state = self.state();
        if state.snapshots.contains_key(&snapshot.signal_id) {
            return Ok(false);
        }
        state
            .snapshots
            .insert(snapshot.signal_id.clone(), snapshot.clone());
        Ok(true)
    }

    fn snapshot(&self, signal_id: &str) -> Result<Option<SignalSnapshot>> {
        Ok(self.state().snapshots.get(signal_id).cloned())
    }

    fn insert_pending_outcome(&self, signal_id: &str) -> Result<bool> {
        let mut state = self.state();
        if !state.snapshots.contains_key(signal_id) {
            return Err(Error::Storage(format!(
                "outcome for {signal_id} has no snapshot"
            )));
        }
        if state.outcomes.contains_key(signal_id) {
            return Ok(false);
        }
        state
            .outcomes
            .insert(signal_id.to_string(), SignalOutcomeRecord::pending(signal_id));
        Ok(true)
    }

    fn outcome(&self, signal_id: &str) -> Result<Option<SignalOutcomeRecord>> {
        Ok(self.state().outcomes.get(signal_id).cloned())
    }

    fn finalize_outcome(&self, record: &SignalOutcomeRecord) -> Result<bool> {
        if !record.outcome.is_terminal() {
            return Err(Error::InvalidInput(format!(
                "cannot finalize {} with a pending outcome",
                record.signal_id
            )));
        }
        let mut state = self.state();
        match state.outcomes.get_mut(&record.signal_id) {
            Some(existing) if !existing.outcome.is_terminal() => {
                *existing = record.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn resolved_trades_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TradeRecord>> {
        let state = self.state();
        let mut trades: Vec<TradeRecord> = state
            .outcomes
            .values()
            .filter(|o| o.outcome.is_terminal())
            .filter(|o| o.exit_time.is_some_and(|t| t >= start && t <= end))
            .filter_map(|o| {
                state.snapshots.get(&o.signal_id).map(|s| TradeRecord {
                    snapshot: s.clone(),
                    outcome: o.clone(),
                })
            })
            .collect();
        trades.sort_by_key(|t| t.outcome.exit_time);
        Ok(trades)
    }

    fn pending_snapshots(&self) -> Result<Vec<SignalSnapshot>> {
        let state = self.state();
        let mut pending: Vec<SignalSnapshot> = state
            .outcomes
            .values()
            .filter(|o| !o.outcome.is_terminal())
            .filter_map(|o| state.snapshots.get(&o.signal_id).cloned())
            .collect();
        pending.sort_by_key(|s| s.created_at);
        Ok(pending)
    }

    fn save_feature_importance(&self, scores: &BTreeMap<String, f64>) -> Result<()> {
        let mut state = self.state();
        for (feature, score) in scores {
            state.importance.insert(feature.clone(), *score);
        }
        Ok(())
    }

    fn feature_importance(&self) -> Result<BTreeMap<String, f64>> {
        Ok(self.state().importance.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract;

    #[test]
    fn test_memory_store_contract() {
        let store = MemoryStore::new();
        contract::exercise(&store);
    }
}
