//! Sync audit log: run lifecycle writes plus the read side used by operators.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fedsync_core::{ErrorDetail, RunCompletion, SyncMode, SyncRun, SyncStatus, SyncType};
use fedsync_storage::{StoreError, SyncRunQuery, SyncRunStore};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

/// Per-type freshness, for "no successful sync in N hours" alarms.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncHealth {
    pub sync_type: SyncType,
    pub last_success_at: Option<DateTime<Utc>>,
    pub healthy: bool,
    pub running: bool,
}

#[derive(Clone)]
pub struct SyncAuditLog {
    store: Arc<dyn SyncRunStore>,
}

impl SyncAuditLog {
    pub fn new(store: Arc<dyn SyncRunStore>) -> Self {
        Self { store }
    }

    /// Creates the run directly in RUNNING. `None` means another run of the
    /// same type holds the slot and nothing was written.
    pub async fn start_run(
        &self,
        sync_type: SyncType,
        mode: SyncMode,
        watermark: Option<DateTime<Utc>>,
    ) -> Result<Option<SyncRun>, StoreError> {
        let run = SyncRun::start(sync_type, mode, watermark, Utc::now());
        if self.store.insert_running(&run).await? {
            info!(run_id = %run.id, %sync_type, %mode, "sync run started");
            Ok(Some(run))
        } else {
            Ok(None)
        }
    }

    pub async fn record_progress(
        &self,
        run_id: Uuid,
        processed_delta: u64,
        error_delta: u64,
    ) -> Result<(), StoreError> {
        if processed_delta == 0 && error_delta == 0 {
            return Ok(());
        }
        self.store
            .add_progress(run_id, processed_delta, error_delta, Utc::now())
            .await
    }

    pub async fn complete_run(
        &self,
        run_id: Uuid,
        completion: &RunCompletion,
    ) -> Result<SyncRun, StoreError> {
        self.store.complete(run_id, completion, Utc::now()).await
    }

    /// Fails RUNNING rows of `sync_type` older than `stale_after`. Runs in
    /// `alive` are still executing and are left alone.
    pub async fn recover_stale(
        &self,
        sync_type: SyncType,
        stale_after: Duration,
        alive: &[Uuid],
    ) -> Result<Vec<SyncRun>, StoreError> {
        let now = Utc::now();
        let cutoff = chrono::Duration::from_std(stale_after)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let failed = self
            .store
            .fail_stale(sync_type, cutoff, alive, &ErrorDetail::abandoned(), now)
            .await?;
        for run in &failed {
            warn!(run_id = %run.id, %sync_type, started_at = %run.started_at, "stale run marked failed");
        }
        Ok(failed)
    }

    pub async fn get(&self, run_id: Uuid) -> Result<Option<SyncRun>, StoreError> {
        self.store.get_run(run_id).await
    }

    pub async fn list(&self, query: &SyncRunQuery) -> Result<Vec<SyncRun>, StoreError> {
        self.store.list_runs(query).await
    }

    pub async fn latest(&self, sync_type: SyncType) -> Result<Option<SyncRun>, StoreError> {
        let mut runs = self
            .store
            .list_runs(&SyncRunQuery::for_type(sync_type).limit(1))
            .await?;
        Ok(runs.pop())
    }

    pub async fn recent(&self, limit: usize) -> Result<Vec<SyncRun>, StoreError> {
        self.store
            .list_runs(&SyncRunQuery::default().limit(limit))
            .await
    }

    pub async fn failed(&self, limit: Option<usize>) -> Result<Vec<SyncRun>, StoreError> {
        let query = SyncRunQuery {
            statuses: vec![SyncStatus::Failed],
            limit,
            ..Default::default()
        };
        self.store.list_runs(&query).await
    }

    pub async fn running(&self, sync_type: SyncType) -> Result<Option<SyncRun>, StoreError> {
        let mut runs = self
            .store
            .list_runs(
                &SyncRunQuery::for_type(sync_type)
                    .with_statuses(&[SyncStatus::Running])
                    .limit(1),
            )
            .await?;
        Ok(runs.pop())
    }

    /// Start of the newest SUCCESS or PARTIAL run: the lower bound for the next
    /// incremental fetch.
    ///
    /// A PARTIAL run still advances the watermark, so records that failed in it
    /// are not fetched again by incremental runs unless upstream modifies them.
    /// The next full resync picks them up.
    pub async fn watermark(&self, sync_type: SyncType) -> Result<Option<DateTime<Utc>>, StoreError> {
        let mut runs = self
            .store
            .list_runs(
                &SyncRunQuery::for_type(sync_type)
                    .with_statuses(&[SyncStatus::Success, SyncStatus::Partial])
                    .limit(1),
            )
            .await?;
        Ok(runs.pop().map(|run| run.started_at))
    }

    pub async fn health(&self, max_age: Duration) -> Result<Vec<SyncHealth>, StoreError> {
        let now = Utc::now();
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let mut out = Vec::with_capacity(SyncType::ALL.len());
        for sync_type in SyncType::ALL {
            let last_success = self
                .store
                .list_runs(
                    &SyncRunQuery::for_type(sync_type)
                        .with_statuses(&[SyncStatus::Success])
                        .limit(1),
                )
                .await?
                .pop();
            let last_success_at = last_success.and_then(|run| run.completed_at);
            out.push(SyncHealth {
                sync_type,
                last_success_at,
                healthy: last_success_at.is_some_and(|at| now.signed_duration_since(at) <= max_age),
                running: self.running(sync_type).await?.is_some(),
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedsync_storage::MemoryStore;

    fn audit() -> (SyncAuditLog, MemoryStore) {
        let store = MemoryStore::new();
        (SyncAuditLog::new(Arc::new(store.clone())), store)
    }

    fn completion(status: SyncStatus) -> RunCompletion {
        RunCompletion {
            status,
            records_processed: 3,
            error_count: 0,
            error_detail: None,
        }
    }

    #[tokio::test]
    async fn second_start_is_rejected_until_completion() {
        let (audit, _) = audit();
        let run = audit
            .start_run(SyncType::Awards, SyncMode::Full, None)
            .await
            .unwrap()
            .unwrap();
        assert!(audit
            .start_run(SyncType::Awards, SyncMode::Full, None)
            .await
            .unwrap()
            .is_none());

        audit.record_progress(run.id, 3, 0).await.unwrap();
        let done = audit
            .complete_run(run.id, &completion(SyncStatus::Success))
            .await
            .unwrap();
        assert_eq!(done.records_processed, 3);
        assert!(audit
            .start_run(SyncType::Awards, SyncMode::Full, None)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn watermark_follows_successful_and_partial_runs() {
        let (audit, store) = audit();
        assert_eq!(audit.watermark(SyncType::Opportunities).await.unwrap(), None);

        let now = Utc::now();
        let mut ok = SyncRun::start(
            SyncType::Opportunities,
            SyncMode::Full,
            None,
            now - chrono::Duration::hours(2),
        );
        ok.status = SyncStatus::Partial;
        ok.completed_at = Some(now - chrono::Duration::hours(1));
        store.insert_run_unchecked(ok.clone()).await;

        let mut failed = SyncRun::start(SyncType::Opportunities, SyncMode::Full, None, now);
        failed.status = SyncStatus::Failed;
        failed.completed_at = Some(now);
        store.insert_run_unchecked(failed).await;

        assert_eq!(
            audit.watermark(SyncType::Opportunities).await.unwrap(),
            Some(ok.started_at)
        );
        assert_eq!(audit.failed(None).await.unwrap().len(), 1);
        assert_eq!(audit.recent(10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn health_reports_staleness_per_type() {
        let (audit, _) = audit();
        let run = audit
            .start_run(SyncType::Organizations, SyncMode::Full, None)
            .await
            .unwrap()
            .unwrap();
        audit
            .complete_run(run.id, &completion(SyncStatus::Success))
            .await
            .unwrap();
        audit
            .start_run(SyncType::Awards, SyncMode::Full, None)
            .await
            .unwrap();

        let health = audit.health(Duration::from_secs(3600)).await.unwrap();
        let orgs = health
            .iter()
            .find(|h| h.sync_type == SyncType::Organizations)
            .unwrap();
        assert!(orgs.healthy);
        assert!(orgs.last_success_at.is_some());
        let awards = health.iter().find(|h| h.sync_type == SyncType::Awards).unwrap();
        assert!(!awards.healthy);
        assert!(awards.running);
    }
}
