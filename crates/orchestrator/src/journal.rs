//! Append-only JSONL event journal, one file per UTC day.

use std::fs::{create_dir_all, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::SecondsFormat;
use common::SharedClock;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::warn;

pub const JOURNAL_DIR: &str = "adaptive-control";

pub type SharedJournal = Arc<Mutex<EventJournal>>;

/// Root override; the journal lands in `<root>/adaptive-control`.
pub const JOURNAL_ROOT_ENV: &str = "TRADES_DIR";

/// `$TRADES_DIR/adaptive-control` when set, otherwise `TRADES/adaptive-control`
/// under the enclosing git checkout (or relative to the working directory).
pub fn resolve_trades_dir() -> PathBuf {
    let cwd = std::env::current_dir().unwrap_or_default();
    journal_dir_from(|name| std::env::var(name).ok(), &cwd)
}

fn journal_dir_from<F>(lookup: F, cwd: &Path) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    let root = lookup(JOURNAL_ROOT_ENV)
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            cwd.ancestors()
                .find(|dir| dir.join(".git").is_dir())
                .unwrap_or(Path::new(""))
                .join("TRADES")
        });
    root.join(JOURNAL_DIR)
}

pub struct EventJournal {
    dir: PathBuf,
    day_key: String,
    file: File,
    clock: SharedClock,
}

impl EventJournal {
    pub fn open(dir: PathBuf, clock: SharedClock) -> std::io::Result<Self> {
        create_dir_all(&dir)?;
        let day_key = clock.now().format("%Y-%m-%d").to_string();
        let file = Self::open_day_file(&dir, &day_key)?;
        Ok(Self {
            dir,
            day_key,
            file,
            clock,
        })
    }

    pub fn shared(self) -> SharedJournal {
        Arc::new(Mutex::new(self))
    }

    fn open_day_file(dir: &Path, day_key: &str) -> std::io::Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(format!("events-{day_key}.jsonl")))
    }

    fn rotate_if_needed(&mut self) -> std::io::Result<()> {
        let today = self.clock.now().format("%Y-%m-%d").to_string();
        if today != self.day_key {
            self.file = Self::open_day_file(&self.dir, &today)?;
            self.day_key = today;
        }
        Ok(())
    }

    /// Writes `{"ts", "kind", ...fields}`. Failures are logged, never returned.
    pub fn write_event(&mut self, kind: &str, fields: Value) {
        let mut event = json!({
            "ts": self.clock.now().to_rfc3339_opts(SecondsFormat::Millis, true),
            "kind": kind,
        });
        if let (Some(target), Value::Object(extra)) = (event.as_object_mut(), fields) {
            for (key, value) in extra {
                target.entry(key).or_insert(value);
            }
        }

        let result = (|| -> std::io::Result<()> {
            self.rotate_if_needed()?;
            let line = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
            writeln!(self.file, "{line}")?;
            self.file.flush()?;
            Ok(())
        })();

        if let Err(e) = result {
            warn!(kind, error = %e, "event journal write failed");
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Journals through an optional shared handle.
pub async fn write_event(journal: Option<&SharedJournal>, kind: &str, fields: Value) {
    if let Some(journal) = journal {
        journal.lock().await.write_event(kind, fields);
    }
}
