//! Entry point for manual triggers, scheduled runs and operator cancels.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use fedsync_core::{SyncMode, SyncRun, SyncType};
use fedsync_source::RecordSource;
use fedsync_storage::{EntityStore, StoreError, SyncRunStore};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audit::SyncAuditLog;
use crate::config::{SyncTypeRegistry, SyncTypeSettings};
use crate::orchestrator::{CancelFlag, RunOrchestrator, RunSummary};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerResponse {
    pub accepted: bool,
    pub run_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl TriggerResponse {
    fn accepted(run_id: Uuid) -> Self {
        Self {
            accepted: true,
            run_id: Some(run_id),
            reason: None,
        }
    }

    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            run_id: None,
            reason: Some(reason.into()),
        }
    }
}

enum Admission {
    Started {
        run: SyncRun,
        settings: SyncTypeSettings,
        cancel: CancelFlag,
    },
    Disabled,
    AlreadyRunning,
}

struct ServiceInner {
    audit: SyncAuditLog,
    orchestrator: RunOrchestrator,
    registry: SyncTypeRegistry,
    active: Mutex<HashMap<Uuid, CancelFlag>>,
}

#[derive(Clone)]
pub struct SyncService {
    inner: Arc<ServiceInner>,
}

impl SyncService {
    pub fn new(
        entities: Arc<dyn EntityStore>,
        runs: Arc<dyn SyncRunStore>,
        source: Arc<dyn RecordSource>,
        registry: SyncTypeRegistry,
    ) -> Self {
        let audit = SyncAuditLog::new(runs);
        let orchestrator = RunOrchestrator::new(audit.clone(), source, entities);
        Self {
            inner: Arc::new(ServiceInner {
                audit,
                orchestrator,
                registry,
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn audit(&self) -> &SyncAuditLog {
        &self.inner.audit
    }

    pub fn registry(&self) -> &SyncTypeRegistry {
        &self.inner.registry
    }

    /// Starts a run in the background. Never fails: problems come back as a
    /// rejected response.
    pub async fn trigger(&self, sync_type: SyncType, mode: SyncMode) -> TriggerResponse {
        match self.admit(sync_type, mode).await {
            Ok(Admission::Started {
                run,
                settings,
                cancel,
            }) => {
                let run_id = run.id;
                let svc = self.clone();
                tokio::spawn(async move {
                    if let Err(err) = svc.finish(run, &settings, cancel).await {
                        error!(%run_id, error = %err, "failed to record run completion");
                    }
                });
                TriggerResponse::accepted(run_id)
            }
            Ok(Admission::Disabled) => TriggerResponse::rejected(format!("{sync_type} sync is disabled")),
            Ok(Admission::AlreadyRunning) => {
                TriggerResponse::rejected(format!("a {sync_type} sync is already running"))
            }
            Err(err) => {
                error!(%sync_type, %mode, error = %err, "failed to start sync run");
                TriggerResponse::rejected("failed to start run")
            }
        }
    }

    /// Runs to completion on the caller's task. `None` when the run was not admitted.
    pub async fn run_now(
        &self,
        sync_type: SyncType,
        mode: SyncMode,
    ) -> Result<Option<RunSummary>, StoreError> {
        match self.admit(sync_type, mode).await? {
            Admission::Started {
                run,
                settings,
                cancel,
            } => self.finish(run, &settings, cancel).await.map(Some),
            Admission::Disabled | Admission::AlreadyRunning => Ok(None),
        }
    }

    /// Flags a run in this process for cancellation. It stops before its next page.
    pub async fn cancel(&self, run_id: Uuid) -> bool {
        match self.inner.active.lock().await.get(&run_id) {
            Some(flag) => {
                flag.cancel();
                info!(%run_id, "cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Fails abandoned RUNNING rows of every type. Called once at startup.
    pub async fn recover_all_stale(&self) -> Result<usize, StoreError> {
        let alive = self.alive_runs().await;
        let mut recovered = 0;
        for (sync_type, settings) in self.inner.registry.iter() {
            recovered += self
                .inner
                .audit
                .recover_stale(sync_type, settings.stale_after(), &alive)
                .await?
                .len();
        }
        Ok(recovered)
    }

    pub async fn build_scheduler(&self) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for (sync_type, settings) in self.inner.registry.iter() {
            if !settings.enabled {
                continue;
            }
            for entry in &settings.schedules {
                let mode = entry.mode;
                let svc = self.clone();
                let job = Job::new_async(&entry.cron, move |_uuid, _l| {
                    let svc = svc.clone();
                    Box::pin(async move {
                        let response = svc.trigger(sync_type, mode).await;
                        if !response.accepted {
                            info!(%sync_type, %mode, reason = ?response.reason, "scheduled sync skipped");
                        }
                    })
                })
                .with_context(|| format!("creating scheduler job for {sync_type} cron {}", entry.cron))?;
                sched.add(job).await.context("adding scheduler job")?;
                info!(%sync_type, %mode, cron = %entry.cron, "scheduled sync registered");
            }
        }
        Ok(sched)
    }

    async fn admit(&self, sync_type: SyncType, mode: SyncMode) -> Result<Admission, StoreError> {
        let settings = self.inner.registry.settings(sync_type);
        if !settings.enabled {
            info!(%sync_type, "sync type disabled; trigger ignored");
            return Ok(Admission::Disabled);
        }
        let audit = &self.inner.audit;
        let alive = self.alive_runs().await;
        audit
            .recover_stale(sync_type, settings.stale_after(), &alive)
            .await?;

        let watermark = match mode {
            SyncMode::Incremental => audit.watermark(sync_type).await?,
            SyncMode::Full => None,
        };
        let Some(run) = audit.start_run(sync_type, mode, watermark).await? else {
            warn!(%sync_type, %mode, "sync already running; trigger rejected");
            return Ok(Admission::AlreadyRunning);
        };
        let cancel = CancelFlag::new();
        self.inner.active.lock().await.insert(run.id, cancel.clone());
        Ok(Admission::Started {
            run,
            settings,
            cancel,
        })
    }

    async fn alive_runs(&self) -> Vec<Uuid> {
        self.inner.active.lock().await.keys().copied().collect()
    }

    async fn finish(
        &self,
        run: SyncRun,
        settings: &SyncTypeSettings,
        cancel: CancelFlag,
    ) -> Result<RunSummary, StoreError> {
        let run_id = run.id;
        let result = self.inner.orchestrator.execute(run, settings, cancel).await;
        self.inner.active.lock().await.remove(&run_id);
        result
    }
}
