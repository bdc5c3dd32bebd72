//! Create / merge-update / no-op decisions for one record, one transaction each.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fedsync_core::{
    diff_fields, DiffError, ErrorKind, ExternalRecord, Lifecycle, LocalEntity, RecordFailure,
    SourceFields, UpsertOutcome, ValidationError,
};
use fedsync_storage::{EntityStore, SourceUpdate, StoreError};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::resolver::{resolve, Resolution, ResolveError};

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("unparseable record: {0}")]
    Unparseable(String),
    #[error("invalid record: {0}")]
    Invalid(#[from] ValidationError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Diff(#[from] DiffError),
    #[error("record persist timed out after {0:?}")]
    Timeout(Duration),
}

impl RecordError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RecordError::Resolve(ResolveError::Integrity { .. }) => ErrorKind::IntegrityViolation,
            RecordError::Timeout(_) => ErrorKind::Timeout,
            _ => ErrorKind::Record,
        }
    }

    fn is_unique_violation(&self) -> bool {
        matches!(
            self,
            RecordError::Store(StoreError::UniqueViolation(_))
                | RecordError::Resolve(ResolveError::Store(StoreError::UniqueViolation(_)))
        )
    }
}

/// What happened to one record.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordResult {
    pub offset: u64,
    pub natural_key: Option<String>,
    pub outcome: UpsertOutcome,
    pub entity_id: Option<Uuid>,
    pub failure: Option<RecordFailure>,
}

#[derive(Clone)]
pub struct UpsertEngine {
    store: Arc<dyn EntityStore>,
    record_timeout: Duration,
}

impl UpsertEngine {
    pub fn new(store: Arc<dyn EntityStore>, record_timeout: Duration) -> Self {
        Self {
            store,
            record_timeout,
        }
    }

    /// Applies one record. Never fails: errors become a `FAILED` result.
    pub async fn apply(&self, offset: u64, record: ExternalRecord, now: DateTime<Utc>) -> RecordResult {
        let natural_key = record.key_label();
        let result = match record {
            ExternalRecord::Unparseable { reason, .. } => Err(RecordError::Unparseable(reason)),
            ExternalRecord::Parsed(fields) => self.apply_parsed(&fields, now).await,
        };
        match result {
            Ok((outcome, entity_id)) => {
                debug!(offset, key = ?natural_key, ?outcome, "record applied");
                RecordResult {
                    offset,
                    natural_key,
                    outcome,
                    entity_id,
                    failure: None,
                }
            }
            Err(err) => {
                warn!(offset, key = ?natural_key, error = %err, "record failed");
                RecordResult {
                    offset,
                    failure: Some(RecordFailure {
                        offset,
                        natural_key: natural_key.clone(),
                        kind: err.kind(),
                        message: err.to_string(),
                    }),
                    natural_key,
                    outcome: UpsertOutcome::Failed,
                    entity_id: None,
                }
            }
        }
    }

    async fn apply_parsed(
        &self,
        fields: &SourceFields,
        now: DateTime<Utc>,
    ) -> Result<(UpsertOutcome, Option<Uuid>), RecordError> {
        fields.validate()?;
        tokio::time::timeout(self.record_timeout, self.upsert(fields, now))
            .await
            .map_err(|_| RecordError::Timeout(self.record_timeout))?
    }

    async fn upsert(
        &self,
        fields: &SourceFields,
        now: DateTime<Utc>,
    ) -> Result<(UpsertOutcome, Option<Uuid>), RecordError> {
        match self.upsert_once(fields, now).await {
            // A concurrent worker created the same key after our lookup; the
            // second pass resolves to that row and takes the update path.
            Err(err) if err.is_unique_violation() => {
                debug!(key = ?fields.keys().label(), "insert raced, retrying as update");
                self.upsert_once(fields, now).await
            }
            other => other,
        }
    }

    async fn upsert_once(
        &self,
        fields: &SourceFields,
        now: DateTime<Utc>,
    ) -> Result<(UpsertOutcome, Option<Uuid>), RecordError> {
        let mut tx = self.store.begin().await?;
        match resolve(tx.as_mut(), fields).await? {
            Resolution::Unkeyed => {
                tx.rollback().await?;
                Ok((UpsertOutcome::Skipped, None))
            }
            Resolution::New => {
                let entity = LocalEntity::from_source(fields.clone(), now);
                tx.insert(&entity).await?;
                tx.commit().await?;
                Ok((UpsertOutcome::Created, Some(entity.id)))
            }
            Resolution::Existing(existing) => {
                let changes = diff_fields(&existing.fields, fields)?;
                let reactivate = !existing.lifecycle.is_active();
                if changes.is_empty() && !reactivate {
                    tx.rollback().await?;
                    return Ok((UpsertOutcome::Unchanged, Some(existing.id)));
                }
                let update = SourceUpdate {
                    id: existing.id,
                    keys: fields.keys(),
                    fields: fields.clone(),
                    lifecycle: Lifecycle::Active,
                    updated_at: now,
                };
                tx.update_source(fields.sync_type(), &update).await?;
                tx.commit().await?;
                debug!(
                    id = %existing.id,
                    changed = changes.len(),
                    reactivated = reactivate,
                    "entity updated"
                );
                Ok((UpsertOutcome::Updated, Some(existing.id)))
            }
        }
    }
}
