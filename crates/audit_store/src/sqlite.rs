//! SQLite backend.
//!
//! Filter columns are stored next to a JSON copy of the full record.
//! Timestamps are fixed-width RFC 3339 UTC strings and compare as text.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use common::{
    Error, PolicyEvent, PolicyRecord, RegimeVerdict, Result, SignalOutcome, SignalOutcomeRecord,
    SignalSnapshot, TradeRecord,
};
use rusqlite::{params, Connection, OptionalExtension};

use crate::AuditStore;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS regime_log (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    regime      TEXT NOT NULL,
    detected_at TEXT NOT NULL,
    record      TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS policy_log (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    policy_type TEXT NOT NULL,
    event       TEXT NOT NULL,
    effective_at TEXT NOT NULL,
    record      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_policy_log_effective ON policy_log(effective_at);
CREATE TABLE IF NOT EXISTS signal_snapshots (
    signal_id   TEXT PRIMARY KEY,
    instrument  TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    record      TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS signal_outcomes (
    signal_id   TEXT PRIMARY KEY REFERENCES signal_snapshots(signal_id),
    outcome     TEXT NOT NULL,
    exit_time   TEXT,
    record      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_signal_outcomes_exit ON signal_outcomes(exit_time);
CREATE TABLE IF NOT EXISTS feature_importance (
    feature     TEXT PRIMARY KEY,
    score       REAL NOT NULL
);
";

fn storage_err(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn event_label(event: PolicyEvent) -> &'static str {
    match event {
        PolicyEvent::Activated => "activated",
        PolicyEvent::Finalized => "finalized",
    }
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(storage_err)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(storage_err)?;
        conn.execute_batch(SCHEMA).map_err(storage_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl AuditStore for SqliteStore {
    fn append_regime(&self, verdict: &RegimeVerdict) -> Result<()> {
        let record = serde_json::to_string(verdict)?;
        self.conn()
            .execute(
                "INSERT INTO regime_log (regime, detected_at, record) VALUES (?1, ?2, ?3)",
                params![verdict.regime.as_str(), ts(verdict.detected_at), record],
            )
            .map_err(storage_err)?;
        Ok(())
    }

    fn recent_regimes(&self, limit: usize) -> Result<Vec<RegimeVerdict>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT record FROM regime_log ORDER BY id DESC LIMIT ?1")
            .map_err(storage_err)?;
        let rows = stmt
            .query_map(params![limit as i64], |row| row.get::<_, String>(0))
            .map_err(storage_err)?;

        let mut verdicts = Vec::new();
        for raw in rows {
            let raw = raw.map_err(storage_err)?;
            verdicts.push(serde_json::from_str::<RegimeVerdict>(&raw)?);
        }
        verdicts.reverse();
        Ok(verdicts)
    }

    fn append_policy_record(&self, record: &PolicyRecord) -> Result<()> {
        let raw = serde_json::to_string(record)?;
        let effective_at = record.ended_at.unwrap_or(record.started_at);
        self.conn()
            .execute(
                "INSERT INTO policy_log (policy_type, event, effective_at, record)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    record.policy_type.as_str(),
                    event_label(record.event),
                    ts(effective_at),
                    raw
                ],
            )
            .map_err(storage_err)?;
        Ok(())
    }

    fn policy_records_since(&self, since: DateTime<Utc>) -> Result<Vec<PolicyRecord>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT record FROM policy_log WHERE effective_at >= ?1 ORDER BY id")
            .map_err(storage_err)?;
        let rows = stmt
            .query_map(params![ts(since)], |row| row.get::<_, String>(0))
            .map_err(storage_err)?;

        let mut records = Vec::new();
        for raw in rows {
            let raw = raw.map_err(storage_err)?;
            records.push(serde_json::from_str::<PolicyRecord>(&raw)?);
        }
        Ok(records)
    }

    fn insert_snapshot(&self, snapshot: &SignalSnapshot) -> Result<bool> {
        let raw = serde_json::to_string(snapshot)?;
        let changed = self
            .conn()
            .execute(
                "INSERT INTO signal_snapshots (signal_id, instrument, created_at, record)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(signal_id) DO NOTHING",
                params![
                    snapshot.signal_id,
                    snapshot.instrument,
                    ts(snapshot.created_at),
                    raw
                ],
            )
            .map_err(storage_err)?;
        Ok(changed > 0)
    }

    fn snapshot(&self, signal_id: &str) -> Result<Option<SignalSnapshot>> {
        let raw: Option<String> = self
            .conn()
            .query_row(
                "SELECT record FROM signal_snapshots WHERE signal_id = ?1",
                params![signal_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_err)?;
        raw.map(|r| serde_json::from_str(&r).map_err(Error::from))
            .transpose()
    }

    fn insert_pending_outcome(&self, signal_id: &str) -> Result<bool> {
        let raw = serde_json::to_string(&SignalOutcomeRecord::pending(signal_id))?;
        let changed = self
            .conn()
            .execute(
                "INSERT INTO signal_outcomes (signal_id, outcome, exit_time, record)
                 VALUES (?1, ?2, NULL, ?3)
                 ON CONFLICT(signal_id) DO NOTHING",
                params![signal_id, SignalOutcome::Pending.as_str(), raw],
            )
            .map_err(storage_err)?;
        Ok(changed > 0)
    }

    fn outcome(&self, signal_id: &str) -> Result<Option<SignalOutcomeRecord>> {
        let raw: Option<String> = self
            .conn()
            .query_row(
                "SELECT record FROM signal_outcomes WHERE signal_id = ?1",
                params![signal_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_err)?;
        raw.map(|r| serde_json::from_str(&r).map_err(Error::from))
            .transpose()
    }

    fn finalize_outcome(&self, record: &SignalOutcomeRecord) -> Result<bool> {
        if !record.outcome.is_terminal() {
            return Err(Error::InvalidInput(format!(
                "cannot finalize {} with a pending outcome",
                record.signal_id
            )));
        }
        let raw = serde_json::to_string(record)?;
        let changed = self
            .conn()
            .execute(
                "UPDATE signal_outcomes SET outcome = ?1, exit_time = ?2, record = ?3
                 WHERE signal_id = ?4 AND outcome = ?5",
                params![
                    record.outcome.as_str(),
                    record.exit_time.map(ts),
                    raw,
                    record.signal_id,
                    SignalOutcome::Pending.as_str()
                ],
            )
            .map_err(storage_err)?;
        Ok(changed > 0)
    }

    fn resolved_trades_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TradeRecord>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT s.record, o.record
                 FROM signal_outcomes o
                 JOIN signal_snapshots s ON s.signal_id = o.signal_id
                 WHERE o.outcome != ?1 AND o.exit_time >= ?2 AND o.exit_time <= ?3
                 ORDER BY o.exit_time",
            )
            .map_err(storage_err)?;
        let rows = stmt
            .query_map(
                params![SignalOutcome::Pending.as_str(), ts(start), ts(end)],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .map_err(storage_err)?;

        let mut trades = Vec::new();
        for row in rows {
            let (snapshot, outcome) = row.map_err(storage_err)?;
            trades.push(TradeRecord {
                snapshot: serde_json::from_str(&snapshot)?,
                outcome: serde_json::from_str(&outcome)?,
            });
        }
        Ok(trades)
    }

    fn pending_snapshots(&self) -> Result<Vec<SignalSnapshot>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT s.record
                 FROM signal_outcomes o
                 JOIN signal_snapshots s ON s.signal_id = o.signal_id
                 WHERE o.outcome = ?1
                 ORDER BY s.created_at",
            )
            .map_err(storage_err)?;
        let rows = stmt
            .query_map(params![SignalOutcome::Pending.as_str()], |row| {
                row.get::<_, String>(0)
            })
            .map_err(storage_err)?;

        let mut snapshots = Vec::new();
        for raw in rows {
            let raw = raw.map_err(storage_err)?;
            snapshots.push(serde_json::from_str(&raw)?);
        }
        Ok(snapshots)
    }

    fn save_feature_importance(&self, scores: &BTreeMap<String, f64>) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(storage_err)?;
        for (feature, score) in scores {
            tx.execute(
                "INSERT INTO feature_importance (feature, score) VALUES (?1, ?2)
                 ON CONFLICT(feature) DO UPDATE SET score = excluded.score",
                params![feature, score],
            )
            .map_err(storage_err)?;
        }
        tx.commit().map_err(storage_err)
    }

    fn feature_importance(&self) -> Result<BTreeMap<String, f64>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT feature, score FROM feature_importance")
            .map_err(storage_err)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)))
            .map_err(storage_err)?;

        let mut scores = BTreeMap::new();
        for row in rows {
            let (feature, score) = row.map_err(storage_err)?;
            scores.insert(feature, score);
        }
        Ok(scores)
    }
}
