//! Cadence-driven scheduler for the trendline agent pipeline.
//!
//! This crate provides:
//!
//! - **Cadence**: cron and `@every` expressions turned into time windows,
//!   with catch-up and emergency cadences
//! - **Task registry**: per-agent run ledgers backed by a durable journal
//! - **Dispatcher**: idempotent admission gated on dependencies, priority
//!   and resource ceilings
//! - **Recovery**: retry, deferral and terminal failure actions
//! - **Drift monitor**: evaluation signals turned into priority hints
//! - **Alert router**: severity routing with deduplication and retries
//! - **Orchestrator**: the per-agent decision loops tying these together

pub mod alert;
pub mod audit;
pub mod budget;
pub mod cadence;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod drift;
pub mod error;
pub mod execution;
pub mod health;
pub mod journal;
pub mod orchestrator;
pub mod queue;
pub mod recovery;
pub mod registry;
pub mod resolver;
pub mod run;
pub mod snapshot;

pub use alert::{
    AlertEvent, AlertKind, AlertRouter, AlertRoutes, AlertSettings, AlertSink, LogAlertSink,
    Severity,
};
pub use audit::{AuditKind, AuditLog, AuditRecord};
pub use cadence::{AgentCadence, Cadence, CadenceMode, DueWindow};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{PipelineConfig, SchedulerSettings, load_config};
pub use dispatcher::{Admission, Candidate, Rejection};
pub use drift::{DriftMetric, DriftMonitor, DriftSettings, EvaluationSignal, PriorityHint};
pub use error::{ConfigError, DeliveryError, JournalError, OperatorError, ScheduleError};
pub use health::AgentHealth;
pub use journal::{FileJournal, JournalEntry, MemoryJournal, RunJournal};
pub use orchestrator::{AgentStatus, Orchestrator, OrchestratorBuilder, Submission, TickReport};
pub use recovery::{RecoveryDecision, RecoveryManager};
pub use registry::{BacklogDepth, TaskRegistry};
pub use run::{PriorityClass, RunTrigger, TaskRun};
pub use snapshot::ConfigSnapshot;
