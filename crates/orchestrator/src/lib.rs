//! Orchestrator: composition root and supervisor for the control layer.
//!
//! Owns the classifier, policy manager, risk engine, and outcome tracker,
//! and drives them from four cooperative loops sharing one cancellation
//! token.

pub mod collaborators;
pub mod health;
pub mod journal;
pub mod report;
pub mod runtime;
pub mod scheduler;
pub mod tasks;

pub use collaborators::{with_timeout, ExecutionOutcome, MarketDataSource, SignalSource};
pub use health::{Alert, AlertSeverity, ComponentHealth, HealthLevel, SystemHealth};
pub use journal::{resolve_trades_dir, EventJournal, SharedJournal};
pub use report::{report_file_name, ComprehensiveReport};
pub use runtime::{Collaborators, CycleSummary, Orchestrator, SystemStatus};
pub use scheduler::{Scheduler, TaskRunStatus, TaskRunner};
pub use tasks::{ScheduledTask, TaskKind};
