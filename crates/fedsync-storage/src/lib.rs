//! Persistence for synchronized entities and the sync audit log.
//!
//! The pipeline talks to storage through two traits: [`EntityStore`] for the
//! business entities (one transaction per record) and [`SyncRunStore`] for the
//! audit rows. [`MemoryStore`] and [`PgStore`] implement both.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fedsync_core::{
    EntityKeys, ErrorDetail, Lifecycle, LocalEntity, RunCompletion, SourceFields, SyncRun,
    SyncStatus, SyncType,
};
use thiserror::Error;
use uuid::Uuid;

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{PgStore, PoolConfig};

pub const CRATE_NAME: &str = "fedsync-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("sync run {0} is already terminal")]
    AlreadyTerminal(Uuid),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("database error")]
    Database(#[source] sqlx::Error),
    #[error("migration failed")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        let unique = err
            .as_database_error()
            .and_then(|db| db.code())
            .is_some_and(|code| code == "23505");
        if unique {
            StoreError::UniqueViolation(err.to_string())
        } else {
            StoreError::Database(err)
        }
    }
}

/// Source-owned state written on the update path. Curated fields are not part of it.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceUpdate {
    pub id: Uuid,
    pub keys: EntityKeys,
    pub fields: SourceFields,
    pub lifecycle: Lifecycle,
    pub updated_at: DateTime<Utc>,
}

/// Natural keys observed during a full resync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeenKeys {
    pub primary: HashSet<String>,
    pub secondary: HashSet<String>,
}

impl SeenKeys {
    pub fn insert(&mut self, keys: &EntityKeys) {
        if let Some(p) = &keys.primary {
            self.primary.insert(p.clone());
        }
        if let Some(s) = &keys.secondary {
            self.secondary.insert(s.clone());
        }
    }

    /// An entity with a primary key is seen only through that key. The
    /// secondary key counts only for entities that have no primary key, since
    /// several organizations may share one CAGE code.
    pub fn contains(&self, keys: &EntityKeys) -> bool {
        match (&keys.primary, &keys.secondary) {
            (Some(p), _) => self.primary.contains(p),
            (None, Some(s)) => self.secondary.contains(s),
            (None, None) => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.primary.is_empty() && self.secondary.is_empty()
    }
}

/// A unit of work covering one record's resolve + upsert.
///
/// Dropping a transaction without committing discards its writes.
#[async_trait]
pub trait EntityTx: Send {
    async fn find_by_primary_key(
        &mut self,
        sync_type: SyncType,
        key: &str,
    ) -> Result<Vec<LocalEntity>, StoreError>;

    async fn find_by_secondary_key(
        &mut self,
        sync_type: SyncType,
        key: &str,
    ) -> Result<Vec<LocalEntity>, StoreError>;

    async fn insert(&mut self, entity: &LocalEntity) -> Result<(), StoreError>;

    async fn update_source(
        &mut self,
        sync_type: SyncType,
        update: &SourceUpdate,
    ) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn EntityTx>, StoreError>;

    async fn get(&self, sync_type: SyncType, id: Uuid) -> Result<Option<LocalEntity>, StoreError>;

    /// Soft-deletes every active entity whose keys are not in `seen`.
    async fn deactivate_missing(
        &self,
        sync_type: SyncType,
        seen: &SeenKeys,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn count(
        &self,
        sync_type: SyncType,
        lifecycle: Option<Lifecycle>,
    ) -> Result<u64, StoreError>;
}

/// Filter for audit log reads. Results are ordered newest `started_at` first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncRunQuery {
    pub sync_type: Option<SyncType>,
    pub statuses: Vec<SyncStatus>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl SyncRunQuery {
    pub fn for_type(sync_type: SyncType) -> Self {
        Self {
            sync_type: Some(sync_type),
            ..Default::default()
        }
    }

    pub fn with_statuses(mut self, statuses: &[SyncStatus]) -> Self {
        self.statuses = statuses.to_vec();
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, run: &SyncRun) -> bool {
        self.sync_type.map_or(true, |t| t == run.sync_type)
            && (self.statuses.is_empty() || self.statuses.contains(&run.status))
            && self.since.map_or(true, |since| run.started_at >= since)
            && self.until.map_or(true, |until| run.started_at <= until)
    }
}

#[async_trait]
pub trait SyncRunStore: Send + Sync {
    /// Inserts a RUNNING row. Returns `false` when another run of the same
    /// type already holds the RUNNING slot.
    async fn insert_running(&self, run: &SyncRun) -> Result<bool, StoreError>;

    /// Adds to the counters of a RUNNING row; terminal rows are left alone.
    async fn add_progress(
        &self,
        id: Uuid,
        processed_delta: u64,
        error_delta: u64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Terminal update. Counters never move backwards.
    async fn complete(
        &self,
        id: Uuid,
        completion: &RunCompletion,
        now: DateTime<Utc>,
    ) -> Result<SyncRun, StoreError>;

    async fn get_run(&self, id: Uuid) -> Result<Option<SyncRun>, StoreError>;

    async fn list_runs(&self, query: &SyncRunQuery) -> Result<Vec<SyncRun>, StoreError>;

    /// Marks RUNNING rows of `sync_type` started before `started_before` as
    /// FAILED, except the runs listed in `alive`.
    async fn fail_stale(
        &self,
        sync_type: SyncType,
        started_before: DateTime<Utc>,
        alive: &[Uuid],
        detail: &ErrorDetail,
        now: DateTime<Utc>,
    ) -> Result<Vec<SyncRun>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use fedsync_core::SyncMode;

    #[test]
    fn seen_keys_prefer_the_primary_key() {
        let mut seen = SeenKeys::default();
        seen.insert(&EntityKeys::new(Some("UEI000000001"), Some("1ABC2")));

        assert!(seen.contains(&EntityKeys::new(Some("UEI000000001"), None)));
        assert!(seen.contains(&EntityKeys::new(None, Some("1ABC2"))));
        assert!(!seen.contains(&EntityKeys::new(Some("UEI000000002"), Some("9ZZZ9"))));
        assert!(!seen.contains(&EntityKeys::default()));
        // A shared CAGE code does not keep a different UEI alive.
        assert!(!seen.contains(&EntityKeys::new(Some("UEI000000002"), Some("1ABC2"))));
    }

    #[test]
    fn run_query_filters_by_type_status_and_window() {
        let now = Utc::now();
        let mut run = SyncRun::start(SyncType::Awards, SyncMode::Full, None, now);
        run.status = SyncStatus::Failed;

        assert!(SyncRunQuery::for_type(SyncType::Awards).matches(&run));
        assert!(!SyncRunQuery::for_type(SyncType::Opportunities).matches(&run));
        assert!(!SyncRunQuery::default()
            .with_statuses(&[SyncStatus::Success])
            .matches(&run));

        let window = SyncRunQuery {
            since: Some(now - Duration::hours(1)),
            until: Some(now + Duration::hours(1)),
            ..Default::default()
        };
        assert!(window.matches(&run));
        let later = SyncRunQuery {
            since: Some(now + Duration::minutes(5)),
            ..Default::default()
        };
        assert!(!later.matches(&run));
    }
}
