//! File-backed collaborators.
//!
//! Upstream ingestion drops normalized JSON into a feed directory; the
//! binary reads it through the orchestrator's collaborator traits and
//! appends every sizing decision to `decisions.jsonl` for the executor.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use common::{
    Error, MarketContextFeatures, PositionSizeDecision, Result, SignalSnapshot,
    VolumeProfileFeatures,
};
use orchestrator::{ExecutionOutcome, MarketDataSource, SignalSource};
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

pub const MARKET_CONTEXT_FILE: &str = "market_context.json";
pub const VOLUME_PROFILES_FILE: &str = "volume_profiles.json";
pub const PRICES_FILE: &str = "prices.json";
pub const VOLATILITY_FILE: &str = "volatility.json";
pub const SIGNALS_FILE: &str = "signals.jsonl";
pub const OUTCOMES_FILE: &str = "outcomes.jsonl";
pub const DECISIONS_FILE: &str = "decisions.jsonl";

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = tokio::fs::read(path)
        .await
        .map_err(|e| Error::Collaborator(format!("{}: {e}", path.display())))?;
    Ok(serde_json::from_slice(&raw)?)
}

/// Like `read_json`, but a missing file means "nothing published".
async fn read_optional_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    match tokio::fs::read(path).await {
        Ok(raw) => Ok(serde_json::from_slice(&raw)?),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

/// Market features published as whole-file JSON snapshots.
pub struct JsonFeatureFeed {
    dir: PathBuf,
}

impl JsonFeatureFeed {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl MarketDataSource for JsonFeatureFeed {
    fn name(&self) -> &str {
        "json_feature_feed"
    }

    async fn market_context(&self) -> Result<MarketContextFeatures> {
        read_json(&self.dir.join(MARKET_CONTEXT_FILE)).await
    }

    async fn volume_profiles(&self) -> Result<Vec<VolumeProfileFeatures>> {
        read_json(&self.dir.join(VOLUME_PROFILES_FILE)).await
    }

    async fn last_prices(&self) -> Result<BTreeMap<String, f64>> {
        read_optional_json(&self.dir.join(PRICES_FILE)).await
    }

    async fn realized_volatility(&self) -> Result<BTreeMap<String, f64>> {
        read_optional_json(&self.dir.join(VOLATILITY_FILE)).await
    }

    async fn health_check(&self) -> Result<()> {
        let path = self.dir.join(MARKET_CONTEXT_FILE);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(()),
            Ok(_) => Err(Error::Collaborator(format!(
                "{} is not a file",
                path.display()
            ))),
            Err(e) => Err(Error::Collaborator(format!("{}: {e}", path.display()))),
        }
    }
}

#[derive(Debug, Default)]
struct Offsets {
    signals: u64,
    outcomes: u64,
}

/// Append-only JSONL inbox. Each complete line is handed out exactly once
/// per process; a trailing partial line waits for the next poll.
pub struct JsonlInbox {
    dir: PathBuf,
    offsets: Mutex<Offsets>,
}

impl JsonlInbox {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            offsets: Mutex::new(Offsets::default()),
        }
    }

    pub fn decisions_path(&self) -> PathBuf {
        self.dir.join(DECISIONS_FILE)
    }
}

/// Reads complete lines past `offset` and advances it. A file shorter than
/// the offset was truncated or replaced and is read from the start.
async fn read_new_lines<T: DeserializeOwned>(path: &Path, offset: &mut u64) -> Result<Vec<T>> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    if (raw.len() as u64) < *offset {
        warn!(path = %path.display(), "inbox file shrank; rereading from start");
        *offset = 0;
    }
    let start = *offset as usize;
    let Some(last_newline) = raw[start..].iter().rposition(|b| *b == b'\n') else {
        return Ok(Vec::new());
    };
    let end = start + last_newline + 1;

    let mut items = Vec::new();
    for (idx, line) in raw[start..end].split(|b| *b == b'\n').enumerate() {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<T>(line) {
            Ok(item) => items.push(item),
            Err(e) => warn!(
                path = %path.display(),
                line = idx,
                error = %e,
                "skipping malformed inbox line"
            ),
        }
    }
    *offset = end as u64;
    Ok(items)
}

#[async_trait]
impl SignalSource for JsonlInbox {
    fn name(&self) -> &str {
        "jsonl_inbox"
    }

    async fn poll_signals(&self) -> Result<Vec<SignalSnapshot>> {
        let mut offsets = self.offsets.lock().await;
        read_new_lines(&self.dir.join(SIGNALS_FILE), &mut offsets.signals).await
    }

    async fn poll_outcomes(&self) -> Result<Vec<ExecutionOutcome>> {
        let mut offsets = self.offsets.lock().await;
        read_new_lines(&self.dir.join(OUTCOMES_FILE), &mut offsets.outcomes).await
    }

    async fn deliver(&self, decision: &PositionSizeDecision) -> Result<()> {
        let mut line = serde_json::to_string(decision)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.decisions_path())
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        match tokio::fs::metadata(&self.dir).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            _ => Err(Error::Collaborator(format!(
                "inbox directory {} is missing",
                self.dir.display()
            ))),
        }
    }

    async fn reinitialize(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use common::{RegimeType, RiskLevel, SignalOutcome};

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("adaptive-feeds-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn signal_line(id: &str) -> String {
        format!(
            r#"{{"signal_id":"{id}","instrument":"SPY","direction":"buy","entry_price":500.0,"stop_loss":498.0,"target_price":504.0,"confidence":0.7,"source":"vp_breakout","created_at":"2024-03-01T15:00:00Z"}}"#
        )
    }

    #[tokio::test]
    async fn test_feature_feed_reads_snapshots() {
        let dir = temp_dir();
        std::fs::write(
            dir.join(MARKET_CONTEXT_FILE),
            r#"{"spx_0dte_share":0.55,"put_call_ratio":0.9,"gamma_concentration":0.7,"session":"opening","weekday":"Fri","hour":10,"as_of":"2024-03-01T15:00:00Z"}"#,
        )
        .unwrap();
        std::fs::write(
            dir.join(VOLUME_PROFILES_FILE),
            r#"[{"instrument":"SPY","point_of_control":500.0,"value_area_high":502.0,"value_area_low":498.0,"total_volume":1000000.0}]"#,
        )
        .unwrap();

        let feed = JsonFeatureFeed::new(&dir);
        feed.health_check().await.unwrap();
        let ctx = feed.market_context().await.unwrap();
        assert_eq!(ctx.spx_0dte_share, 0.55);
        assert_eq!(ctx.hour, 10);
        let profiles = feed.volume_profiles().await.unwrap();
        assert_eq!(profiles.len(), 1);
        assert!(profiles[0].high_volume_nodes.is_empty());
        // Optional files default to empty.
        assert!(feed.last_prices().await.unwrap().is_empty());
        assert!(feed.realized_volatility().await.unwrap().is_empty());
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn test_feature_feed_missing_context_is_unhealthy() {
        let dir = temp_dir();
        let feed = JsonFeatureFeed::new(&dir);
        assert!(feed.health_check().await.is_err());
        assert!(matches!(
            feed.market_context().await.unwrap_err(),
            Error::Collaborator(_)
        ));
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn test_inbox_hands_out_each_line_once() {
        let dir = temp_dir();
        let inbox = JsonlInbox::new(&dir);
        assert!(inbox.poll_signals().await.unwrap().is_empty());

        let path = dir.join(SIGNALS_FILE);
        std::fs::write(
            &path,
            format!("{}\nnot json\n{}\n", signal_line("s1"), signal_line("s2")),
        )
        .unwrap();
        let first = inbox.poll_signals().await.unwrap();
        let ids: Vec<_> = first.iter().map(|s| s.signal_id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s2"]);
        assert!(inbox.poll_signals().await.unwrap().is_empty());

        // A partial trailing line is held back until it is completed.
        let partial = signal_line("s3");
        let (head, tail) = partial.split_at(20);
        let mut body = std::fs::read_to_string(&path).unwrap();
        body.push_str(head);
        std::fs::write(&path, &body).unwrap();
        assert!(inbox.poll_signals().await.unwrap().is_empty());
        body.push_str(tail);
        body.push('\n');
        std::fs::write(&path, &body).unwrap();
        let next = inbox.poll_signals().await.unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].signal_id, "s3");
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn test_inbox_rereads_truncated_file() {
        let dir = temp_dir();
        let inbox = JsonlInbox::new(&dir);
        let path = dir.join(OUTCOMES_FILE);
        std::fs::write(
            &path,
            "{\"signal_id\":\"s1\",\"outcome\":\"take_profit_hit\",\"pnl\":120.0}\n\
             {\"signal_id\":\"s2\",\"outcome\":\"stop_loss_hit\",\"pnl\":-60.0}\n",
        )
        .unwrap();
        assert_eq!(inbox.poll_outcomes().await.unwrap().len(), 2);

        std::fs::write(&path, "{\"signal_id\":\"s9\",\"outcome\":\"timeout\"}\n").unwrap();
        let outcomes = inbox.poll_outcomes().await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].outcome, SignalOutcome::Timeout);
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn test_deliver_appends_decisions() {
        let dir = temp_dir();
        let inbox = JsonlInbox::new(&dir);
        let decision = PositionSizeDecision {
            instrument: "SPY".into(),
            signal_id: "s1".into(),
            regime: RegimeType::Normal,
            recommended_size: 0.004,
            max_allowed: 0.03,
            risk_level: RiskLevel::Low,
            kelly_raw: 0.01,
            kelly_adjusted: 0.004,
            adjustment_factors: BTreeMap::new(),
            portfolio_risk_used_pct: 0.07,
            reason: "fallback kelly".into(),
            decided_at: Utc.with_ymd_and_hms(2024, 3, 1, 15, 0, 0).unwrap(),
        };
        inbox.deliver(&decision).await.unwrap();
        inbox.deliver(&decision).await.unwrap();

        let body = std::fs::read_to_string(inbox.decisions_path()).unwrap();
        let lines: Vec<_> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: PositionSizeDecision = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.signal_id, "s1");
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn test_inbox_reinitialize_recreates_dir() {
        let dir = temp_dir().join("nested");
        let inbox = JsonlInbox::new(&dir);
        assert!(inbox.health_check().await.is_err());
        inbox.reinitialize().await.unwrap();
        inbox.health_check().await.unwrap();
        std::fs::remove_dir_all(dir).ok();
    }
}
