//! Core domain model for the federal contracting sync pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

mod fields;

pub use fields::{
    diff_fields, AwardFields, DiffError, EntityKeys, FieldChange, OpportunityFields,
    OrganizationFields, PlaceOfPerformance, SourceFields, ValidationError,
};

pub const CRATE_NAME: &str = "fedsync-core";

/// Category of entity a sync run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncType {
    Opportunities,
    Awards,
    Organizations,
}

impl SyncType {
    pub const ALL: [SyncType; 3] = [
        SyncType::Opportunities,
        SyncType::Awards,
        SyncType::Organizations,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SyncType::Opportunities => "opportunities",
            SyncType::Awards => "awards",
            SyncType::Organizations => "organizations",
        }
    }
}

impl fmt::Display for SyncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {what}: {value}")]
pub struct ParseEnumError {
    pub what: &'static str,
    pub value: String,
}

impl FromStr for SyncType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "opportunities" => Ok(SyncType::Opportunities),
            "awards" => Ok(SyncType::Awards),
            "organizations" => Ok(SyncType::Organizations),
            _ => Err(ParseEnumError {
                what: "sync type",
                value: s.to_string(),
            }),
        }
    }
}

/// Lifecycle of a sync run. `completed_at` is set iff the status is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Pending,
    Running,
    Success,
    Failed,
    Partial,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Pending => "PENDING",
            SyncStatus::Running => "RUNNING",
            SyncStatus::Success => "SUCCESS",
            SyncStatus::Failed => "FAILED",
            SyncStatus::Partial => "PARTIAL",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SyncStatus::Success | SyncStatus::Failed | SyncStatus::Partial
        )
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(SyncStatus::Pending),
            "RUNNING" => Ok(SyncStatus::Running),
            "SUCCESS" => Ok(SyncStatus::Success),
            "FAILED" => Ok(SyncStatus::Failed),
            "PARTIAL" => Ok(SyncStatus::Partial),
            _ => Err(ParseEnumError {
                what: "sync status",
                value: s.to_string(),
            }),
        }
    }
}

/// Full runs ignore the watermark and reconcile soft-deletes; incremental runs do neither.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Full,
    #[default]
    Incremental,
}

impl SyncMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncMode::Full => "full",
            SyncMode::Incremental => "incremental",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncMode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(SyncMode::Full),
            "incremental" => Ok(SyncMode::Incremental),
            _ => Err(ParseEnumError {
                what: "sync mode",
                value: s.to_string(),
            }),
        }
    }
}

/// Tag of the structured `error_detail` attached to a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Record,
    IntegrityViolation,
    TransientSource,
    FatalSource,
    Timeout,
    Cancelled,
    Abandoned,
}

/// One failed record, addressed by its offset within the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFailure {
    pub offset: u64,
    pub natural_key: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
}

/// Machine-parseable failure summary for a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default)]
    pub records: Vec<RecordFailure>,
    /// Record failures dropped once the recorded list hit its cap.
    #[serde(default)]
    pub omitted_records: u64,
}

impl ErrorDetail {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            records: Vec::new(),
            omitted_records: 0,
        }
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "cancelled")
    }

    pub fn abandoned() -> Self {
        Self::new(ErrorKind::Abandoned, "stale/abandoned")
    }

    pub fn has_integrity_violation(&self) -> bool {
        self.kind == ErrorKind::IntegrityViolation
            || self
                .records
                .iter()
                .any(|r| r.kind == ErrorKind::IntegrityViolation)
    }
}

/// Audit row for one synchronization run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRun {
    pub id: Uuid,
    pub sync_type: SyncType,
    pub mode: SyncMode,
    pub status: SyncStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub records_processed: u64,
    pub error_count: u64,
    pub error_detail: Option<ErrorDetail>,
    pub watermark: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl SyncRun {
    pub fn start(
        sync_type: SyncType,
        mode: SyncMode,
        watermark: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sync_type,
            mode,
            status: SyncStatus::Running,
            started_at: now,
            completed_at: None,
            records_processed: 0,
            error_count: 0,
            error_detail: None,
            watermark,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Payload of the single terminal update written to a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunCompletion {
    pub status: SyncStatus,
    pub records_processed: u64,
    pub error_count: u64,
    pub error_detail: Option<ErrorDetail>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    #[default]
    Active,
    Inactive,
}

impl Lifecycle {
    pub fn is_active(self) -> bool {
        self == Lifecycle::Active
    }
}

/// A synchronized entity as the local store holds it.
///
/// `fields` is the only part the pipeline writes. `curated` belongs to other
/// subsystems (scores, notes) and passes through every sync untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalEntity {
    pub id: Uuid,
    pub sync_type: SyncType,
    pub keys: EntityKeys,
    pub fields: SourceFields,
    #[serde(default)]
    pub curated: serde_json::Map<String, serde_json::Value>,
    pub lifecycle: Lifecycle,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LocalEntity {
    pub fn from_source(fields: SourceFields, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sync_type: fields.sync_type(),
            keys: fields.keys(),
            fields,
            curated: serde_json::Map::new(),
            lifecycle: Lifecycle::Active,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One record as handed over by a source page.
#[derive(Debug, Clone, PartialEq)]
pub enum ExternalRecord {
    Parsed(SourceFields),
    /// The payload could not be mapped; becomes a record-level error.
    Unparseable {
        key_hint: Option<String>,
        reason: String,
    },
}

impl ExternalRecord {
    pub fn key_label(&self) -> Option<String> {
        match self {
            ExternalRecord::Parsed(fields) => fields.keys().label(),
            ExternalRecord::Unparseable { key_hint, .. } => key_hint.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
    Skipped,
    Failed,
}
