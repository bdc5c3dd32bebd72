//! In-process backend. Entity transactions are serialized behind one lock and
//! stage their writes on a copy of the tables, so an uncommitted transaction
//! leaves nothing behind.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fedsync_core::{
    ErrorDetail, Lifecycle, LocalEntity, RunCompletion, SyncRun, SyncStatus, SyncType,
};
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::{
    EntityStore, EntityTx, SeenKeys, SourceUpdate, StoreError, SyncRunQuery, SyncRunStore,
};

#[derive(Debug, Clone, Default)]
struct EntityTables {
    rows: HashMap<SyncType, BTreeMap<Uuid, LocalEntity>>,
}

impl EntityTables {
    fn table(&self, sync_type: SyncType) -> impl Iterator<Item = &LocalEntity> {
        self.rows.get(&sync_type).into_iter().flat_map(|t| t.values())
    }

    fn table_mut(&mut self, sync_type: SyncType) -> &mut BTreeMap<Uuid, LocalEntity> {
        self.rows.entry(sync_type).or_default()
    }

    // Mirrors the unique index on the primary natural key.
    fn check_primary_unique(
        &self,
        sync_type: SyncType,
        id: Uuid,
        primary: Option<&str>,
    ) -> Result<(), StoreError> {
        let Some(primary) = primary else {
            return Ok(());
        };
        let clash = self
            .table(sync_type)
            .any(|e| e.id != id && e.keys.primary.as_deref() == Some(primary));
        if clash {
            return Err(StoreError::UniqueViolation(format!(
                "{sync_type} key {primary} already exists"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entities: Arc<Mutex<EntityTables>>,
    runs: Arc<Mutex<BTreeMap<Uuid, SyncRun>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes a curated (non-source) field, as a scoring or notes subsystem would.
    pub async fn set_curated_field(
        &self,
        sync_type: SyncType,
        id: Uuid,
        key: &str,
        value: Value,
    ) -> Result<(), StoreError> {
        let mut tables = self.entities.lock().await;
        let entity = tables
            .table_mut(sync_type)
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "entity",
                id: id.to_string(),
            })?;
        entity.curated.insert(key.to_string(), value);
        Ok(())
    }

    pub async fn all_entities(&self, sync_type: SyncType) -> Vec<LocalEntity> {
        self.entities
            .lock()
            .await
            .table(sync_type)
            .cloned()
            .collect()
    }

    /// Inserts a row bypassing the unique index, for exercising integrity checks.
    pub async fn insert_unchecked(&self, entity: LocalEntity) {
        self.entities
            .lock()
            .await
            .table_mut(entity.sync_type)
            .insert(entity.id, entity);
    }

    /// Seeds an audit row as-is, e.g. a RUNNING row left behind by a crash.
    pub async fn insert_run_unchecked(&self, run: SyncRun) {
        self.runs.lock().await.insert(run.id, run);
    }
}

pub struct MemoryEntityTx {
    guard: OwnedMutexGuard<EntityTables>,
    working: EntityTables,
}

#[async_trait]
impl EntityTx for MemoryEntityTx {
    async fn find_by_primary_key(
        &mut self,
        sync_type: SyncType,
        key: &str,
    ) -> Result<Vec<LocalEntity>, StoreError> {
        Ok(self
            .working
            .table(sync_type)
            .filter(|e| e.keys.primary.as_deref() == Some(key))
            .cloned()
            .collect())
    }

    async fn find_by_secondary_key(
        &mut self,
        sync_type: SyncType,
        key: &str,
    ) -> Result<Vec<LocalEntity>, StoreError> {
        Ok(self
            .working
            .table(sync_type)
            .filter(|e| e.keys.secondary.as_deref() == Some(key))
            .cloned()
            .collect())
    }

    async fn insert(&mut self, entity: &LocalEntity) -> Result<(), StoreError> {
        self.working.check_primary_unique(
            entity.sync_type,
            entity.id,
            entity.keys.primary.as_deref(),
        )?;
        let table = self.working.table_mut(entity.sync_type);
        if table.contains_key(&entity.id) {
            return Err(StoreError::UniqueViolation(format!(
                "entity id {} already exists",
                entity.id
            )));
        }
        table.insert(entity.id, entity.clone());
        Ok(())
    }

    async fn update_source(
        &mut self,
        sync_type: SyncType,
        update: &SourceUpdate,
    ) -> Result<(), StoreError> {
        self.working
            .check_primary_unique(sync_type, update.id, update.keys.primary.as_deref())?;
        let entity = self
            .working
            .table_mut(sync_type)
            .get_mut(&update.id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "entity",
                id: update.id.to_string(),
            })?;
        entity.keys = update.keys.clone();
        entity.fields = update.fields.clone();
        entity.lifecycle = update.lifecycle;
        entity.updated_at = update.updated_at;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryEntityTx { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn EntityTx>, StoreError> {
        let guard = self.entities.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryEntityTx { guard, working }))
    }

    async fn get(&self, sync_type: SyncType, id: Uuid) -> Result<Option<LocalEntity>, StoreError> {
        let tables = self.entities.lock().await;
        Ok(tables.rows.get(&sync_type).and_then(|t| t.get(&id)).cloned())
    }

    async fn deactivate_missing(
        &self,
        sync_type: SyncType,
        seen: &SeenKeys,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut tables = self.entities.lock().await;
        let mut deactivated = 0u64;
        for entity in tables.table_mut(sync_type).values_mut() {
            if entity.lifecycle.is_active() && !seen.contains(&entity.keys) {
                entity.lifecycle = Lifecycle::Inactive;
                entity.updated_at = now;
                deactivated += 1;
            }
        }
        Ok(deactivated)
    }

    async fn count(
        &self,
        sync_type: SyncType,
        lifecycle: Option<Lifecycle>,
    ) -> Result<u64, StoreError> {
        let tables = self.entities.lock().await;
        Ok(tables
            .table(sync_type)
            .filter(|e| lifecycle.map_or(true, |l| e.lifecycle == l))
            .count() as u64)
    }
}

#[async_trait]
impl SyncRunStore for MemoryStore {
    async fn insert_running(&self, run: &SyncRun) -> Result<bool, StoreError> {
        let mut runs = self.runs.lock().await;
        let busy = runs
            .values()
            .any(|r| r.sync_type == run.sync_type && r.status == SyncStatus::Running);
        if busy {
            return Ok(false);
        }
        runs.insert(run.id, run.clone());
        Ok(true)
    }

    async fn add_progress(
        &self,
        id: Uuid,
        processed_delta: u64,
        error_delta: u64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut runs = self.runs.lock().await;
        let run = runs.get_mut(&id).ok_or_else(|| StoreError::NotFound {
            entity: "sync run",
            id: id.to_string(),
        })?;
        if run.status == SyncStatus::Running {
            run.records_processed = run.records_processed.saturating_add(processed_delta);
            run.error_count = run.error_count.saturating_add(error_delta);
            run.updated_at = now;
        }
        Ok(())
    }

    async fn complete(
        &self,
        id: Uuid,
        completion: &RunCompletion,
        now: DateTime<Utc>,
    ) -> Result<SyncRun, StoreError> {
        let mut runs = self.runs.lock().await;
        let run = runs.get_mut(&id).ok_or_else(|| StoreError::NotFound {
            entity: "sync run",
            id: id.to_string(),
        })?;
        if run.is_terminal() {
            return Err(StoreError::AlreadyTerminal(id));
        }
        run.status = completion.status;
        run.completed_at = Some(now);
        run.records_processed = run.records_processed.max(completion.records_processed);
        run.error_count = run.error_count.max(completion.error_count);
        run.error_detail = completion.error_detail.clone();
        run.updated_at = now;
        Ok(run.clone())
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<SyncRun>, StoreError> {
        Ok(self.runs.lock().await.get(&id).cloned())
    }

    async fn list_runs(&self, query: &SyncRunQuery) -> Result<Vec<SyncRun>, StoreError> {
        let runs = self.runs.lock().await;
        let mut out: Vec<SyncRun> = runs.values().filter(|r| query.matches(r)).cloned().collect();
        out.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        if let Some(limit) = query.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn fail_stale(
        &self,
        sync_type: SyncType,
        started_before: DateTime<Utc>,
        alive: &[Uuid],
        detail: &ErrorDetail,
        now: DateTime<Utc>,
    ) -> Result<Vec<SyncRun>, StoreError> {
        let mut runs = self.runs.lock().await;
        let mut failed = Vec::new();
        for run in runs.values_mut() {
            if run.sync_type == sync_type
                && run.status == SyncStatus::Running
                && run.started_at < started_before
                && !alive.contains(&run.id)
            {
                run.status = SyncStatus::Failed;
                run.completed_at = Some(now);
                run.error_detail = Some(detail.clone());
                run.updated_at = now;
                failed.push(run.clone());
            }
        }
        Ok(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use fedsync_core::{OpportunityFields, SourceFields, SyncMode};

    fn opportunity(notice_id: &str) -> LocalEntity {
        LocalEntity::from_source(
            SourceFields::Opportunity(OpportunityFields {
                notice_id: Some(notice_id.to_string()),
                title: format!("Notice {notice_id}"),
                notice_type: "Solicitation".into(),
                ..Default::default()
            }),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn uncommitted_transaction_leaves_no_trace() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert(&opportunity("N-1")).await.unwrap();
        drop(tx);

        assert_eq!(store.count(SyncType::Opportunities, None).await.unwrap(), 0);

        let mut tx = store.begin().await.unwrap();
        tx.insert(&opportunity("N-1")).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.count(SyncType::Opportunities, None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn duplicate_primary_key_is_a_unique_violation() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert(&opportunity("N-1")).await.unwrap();
        let err = tx.insert(&opportunity("N-1")).await.unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation(_)));
    }

    #[tokio::test]
    async fn only_one_running_row_per_sync_type() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let first = SyncRun::start(SyncType::Awards, SyncMode::Full, None, now);
        let second = SyncRun::start(SyncType::Awards, SyncMode::Full, None, now);
        let other = SyncRun::start(SyncType::Opportunities, SyncMode::Full, None, now);

        assert!(store.insert_running(&first).await.unwrap());
        assert!(!store.insert_running(&second).await.unwrap());
        assert!(store.insert_running(&other).await.unwrap());
    }

    #[tokio::test]
    async fn terminal_rows_are_immutable() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let run = SyncRun::start(SyncType::Awards, SyncMode::Full, None, now);
        store.insert_running(&run).await.unwrap();
        store.add_progress(run.id, 10, 1, now).await.unwrap();

        let done = store
            .complete(
                run.id,
                &RunCompletion {
                    status: SyncStatus::Partial,
                    records_processed: 4,
                    error_count: 1,
                    error_detail: None,
                },
                now,
            )
            .await
            .unwrap();
        assert_eq!(done.records_processed, 10, "counters never move backwards");
        assert!(done.completed_at.is_some());

        store.add_progress(run.id, 5, 5, now).await.unwrap();
        assert_eq!(store.get_run(run.id).await.unwrap().unwrap().records_processed, 10);

        let again = store
            .complete(
                run.id,
                &RunCompletion {
                    status: SyncStatus::Success,
                    records_processed: 0,
                    error_count: 0,
                    error_detail: None,
                },
                now,
            )
            .await;
        assert!(matches!(again, Err(StoreError::AlreadyTerminal(_))));
    }

    #[tokio::test]
    async fn stale_running_rows_are_failed() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let old = SyncRun::start(
            SyncType::Opportunities,
            SyncMode::Incremental,
            None,
            now - Duration::hours(5),
        );
        store.insert_running(&old).await.unwrap();
        let live = SyncRun::start(
            SyncType::Opportunities,
            SyncMode::Full,
            None,
            now - Duration::hours(4),
        );
        store.insert_run_unchecked(live.clone()).await;

        let failed = store
            .fail_stale(
                SyncType::Opportunities,
                now - Duration::hours(3),
                &[live.id],
                &ErrorDetail::abandoned(),
                now,
            )
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, old.id);
        let live = store.get_run(live.id).await.unwrap().unwrap();
        assert_eq!(live.status, SyncStatus::Running);
        assert_eq!(failed[0].status, SyncStatus::Failed);
        assert_eq!(
            failed[0].error_detail.as_ref().unwrap().message,
            "stale/abandoned"
        );
    }
}
