//! Task scheduler with per-kind in-flight guards and auto-disable.

use std::collections::BTreeMap;
use std::time::Instant;

use async_trait::async_trait;
use common::config::OrchestratorConfig;
use common::{Result, SharedClock};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::tasks::{ScheduledTask, TaskKind};

#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run_task(&self, kind: TaskKind) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskRunStatus {
    Completed { duration_ms: u64 },
    Failed { error: String, error_count: u32, disabled: bool },
    SkippedRunning,
    SkippedDisabled,
}

pub struct Scheduler {
    tasks: Mutex<BTreeMap<TaskKind, ScheduledTask>>,
    clock: SharedClock,
}

impl Scheduler {
    pub fn new(config: &OrchestratorConfig, clock: SharedClock) -> Self {
        let now = clock.now();
        let tasks = TaskKind::ALL
            .into_iter()
            .map(|kind| (kind, ScheduledTask::new(kind, config, now)))
            .collect();
        Self {
            tasks: Mutex::new(tasks),
            clock,
        }
    }

    /// Kinds whose next run has arrived and that are neither running nor disabled.
    pub async fn due(&self) -> Vec<TaskKind> {
        let now = self.clock.now();
        self.tasks
            .lock()
            .await
            .values()
            .filter(|t| t.is_due(now))
            .map(|t| t.kind)
            .collect()
    }

    /// Runs one task through the wrapper. A forced run ignores the schedule
    /// but not the in-flight guard or the disabled flag.
    pub async fn run(
        &self,
        kind: TaskKind,
        runner: &dyn TaskRunner,
        forced: bool,
    ) -> TaskRunStatus {
        // 1. Claim the task.
        {
            let mut tasks = self.tasks.lock().await;
            let Some(task) = tasks.get_mut(&kind) else {
                return TaskRunStatus::SkippedDisabled;
            };
            if task.is_disabled() {
                return TaskRunStatus::SkippedDisabled;
            }
            if task.running {
                debug!(task = %kind, "task already running; skipping");
                return TaskRunStatus::SkippedRunning;
            }
            task.running = true;
        }
        if forced {
            info!(task = %kind, "forced task run");
        }

        // 2. Execute without holding the lock.
        let started = Instant::now();
        let result = runner.run_task(kind).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        // 3. Book the result.
        let now = self.clock.now();
        let mut tasks = self.tasks.lock().await;
        let Some(task) = tasks.get_mut(&kind) else {
            return TaskRunStatus::SkippedDisabled;
        };
        match result {
            Ok(()) => {
                task.record_success(now, duration_ms);
                debug!(task = %kind, duration_ms, "task completed");
                TaskRunStatus::Completed { duration_ms }
            }
            Err(e) => {
                let disabled = task.record_failure(now, e.to_string());
                if disabled {
                    error!(
                        task = %kind,
                        error_count = task.error_count,
                        error = %e,
                        "task disabled after repeated failures"
                    );
                } else {
                    warn!(task = %kind, error_count = task.error_count, error = %e, "task failed");
                }
                TaskRunStatus::Failed {
                    error: e.to_string(),
                    error_count: task.error_count,
                    disabled,
                }
            }
        }
    }

    pub async fn snapshot(&self) -> Vec<ScheduledTask> {
        self.tasks.lock().await.values().cloned().collect()
    }

    pub async fn task(&self, kind: TaskKind) -> Option<ScheduledTask> {
        self.tasks.lock().await.get(&kind).cloned()
    }
}
