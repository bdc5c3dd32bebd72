pub mod audit;
pub mod config;
pub mod orchestrator;
pub mod resolver;
pub mod service;
pub mod upsert;

pub use audit::{SyncAuditLog, SyncHealth};
pub use config::{
    BackoffPolicy, ConfigError, RetrySettings, ScheduleEntry, SourceBackend, StoreBackend,
    SyncConfig, SyncTypeRegistry, SyncTypeSettings,
};
pub use orchestrator::{CancelFlag, RunOrchestrator, RunSummary};
pub use resolver::{resolve, Resolution, ResolveError};
pub use service::{SyncService, TriggerResponse};
pub use upsert::{RecordError, RecordResult, UpsertEngine};

pub const CRATE_NAME: &str = "fedsync-sync";
