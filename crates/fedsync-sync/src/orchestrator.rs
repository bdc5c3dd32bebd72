//! Drives one synchronization run from first page to terminal audit update.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use fedsync_core::{
    ErrorDetail, ErrorKind, ExternalRecord, RecordFailure, RunCompletion, SyncMode, SyncRun,
    SyncStatus, UpsertOutcome,
};
use fedsync_source::{Page, PageRequest, RecordSource, SourceError};
use fedsync_storage::{EntityStore, SeenKeys, StoreError};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, info_span, warn, Instrument};

use crate::audit::SyncAuditLog;
use crate::config::SyncTypeSettings;
use crate::upsert::{RecordResult, UpsertEngine};

/// Operator cancel flag, checked between pages.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Terminal audit row plus the per-outcome counts that the row does not carry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run: SyncRun,
    pub created: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub skipped: u64,
    pub failed: u64,
    pub deactivated: u64,
    pub pages: u64,
}

#[derive(Debug)]
struct RunTally {
    processed: u64,
    errors: u64,
    created: u64,
    updated: u64,
    unchanged: u64,
    skipped: u64,
    pages: u64,
    deactivated: u64,
    seen: SeenKeys,
    failures: Vec<RecordFailure>,
    omitted: u64,
    max_recorded: usize,
    integrity_violations: u64,
}

impl RunTally {
    fn new(max_recorded: usize) -> Self {
        Self {
            processed: 0,
            errors: 0,
            created: 0,
            updated: 0,
            unchanged: 0,
            skipped: 0,
            pages: 0,
            deactivated: 0,
            seen: SeenKeys::default(),
            failures: Vec::new(),
            omitted: 0,
            max_recorded,
            integrity_violations: 0,
        }
    }

    fn successes(&self) -> u64 {
        self.created + self.updated + self.unchanged + self.skipped
    }

    // Every fetched key counts as seen, whatever its outcome: a record that
    // failed to persist is still present upstream.
    fn observe(&mut self, record: &ExternalRecord) {
        match record {
            ExternalRecord::Parsed(fields) => self.seen.insert(&fields.keys()),
            ExternalRecord::Unparseable {
                key_hint: Some(hint),
                ..
            } => {
                self.seen.primary.insert(hint.clone());
                self.seen.secondary.insert(hint.clone());
            }
            ExternalRecord::Unparseable { key_hint: None, .. } => {}
        }
    }

    fn absorb(&mut self, result: RecordResult) {
        self.processed += 1;
        match result.outcome {
            UpsertOutcome::Created => self.created += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::Unchanged => self.unchanged += 1,
            UpsertOutcome::Skipped => self.skipped += 1,
            UpsertOutcome::Failed => {
                self.errors += 1;
                if let Some(failure) = result.failure {
                    self.push_failure(failure);
                }
            }
        }
    }

    // Integrity violations are tallied independently of the cap.
    fn push_failure(&mut self, failure: RecordFailure) {
        if failure.kind == ErrorKind::IntegrityViolation {
            self.integrity_violations += 1;
        }
        if self.failures.len() < self.max_recorded {
            self.failures.push(failure);
        } else {
            self.omitted += 1;
        }
    }

    fn has_integrity_violation(&self) -> bool {
        self.integrity_violations > 0
    }
}

#[derive(Debug)]
enum LoopEnd {
    Completed,
    Cancelled,
    SourceFailed {
        page: u64,
        attempts: usize,
        error: SourceError,
    },
    TimedOut,
}

#[derive(Clone)]
pub struct RunOrchestrator {
    audit: SyncAuditLog,
    source: Arc<dyn RecordSource>,
    entities: Arc<dyn EntityStore>,
}

impl RunOrchestrator {
    pub fn new(
        audit: SyncAuditLog,
        source: Arc<dyn RecordSource>,
        entities: Arc<dyn EntityStore>,
    ) -> Self {
        Self {
            audit,
            source,
            entities,
        }
    }

    /// Runs `run` (already RUNNING) to completion and writes the single
    /// terminal update. The only error is a failure to write that update.
    pub async fn execute(
        &self,
        run: SyncRun,
        settings: &SyncTypeSettings,
        cancel: CancelFlag,
    ) -> Result<RunSummary, StoreError> {
        let span = info_span!(
            "sync_run",
            run_id = %run.id,
            sync_type = %run.sync_type,
            mode = %run.mode,
            source = self.source.name()
        );
        self.execute_inner(run, settings, cancel).instrument(span).await
    }

    async fn execute_inner(
        &self,
        run: SyncRun,
        settings: &SyncTypeSettings,
        cancel: CancelFlag,
    ) -> Result<RunSummary, StoreError> {
        let engine = UpsertEngine::new(self.entities.clone(), settings.record_timeout());
        let mut tally = RunTally::new(settings.max_recorded_errors);

        let end = match tokio::time::timeout(
            settings.max_run(),
            self.paginate(&run, settings, &engine, &cancel, &mut tally),
        )
        .await
        {
            Ok(end) => end,
            Err(_) => LoopEnd::TimedOut,
        };

        if run.mode == SyncMode::Full && matches!(end, LoopEnd::Completed) {
            match self
                .entities
                .deactivate_missing(run.sync_type, &tally.seen, Utc::now())
                .await
            {
                Ok(count) => {
                    tally.deactivated = count;
                    if count > 0 {
                        warn!(count, "soft-deleted entities absent from full resync");
                    }
                }
                Err(err) => {
                    warn!(error = %err, "soft-delete reconciliation failed");
                    tally.errors += 1;
                    tally.push_failure(RecordFailure {
                        offset: tally.processed,
                        natural_key: None,
                        kind: ErrorKind::Record,
                        message: format!("soft-delete reconciliation failed: {err}"),
                    });
                }
            }
        }

        let (status, error_detail) = conclude(&end, &tally, settings);
        let completion = RunCompletion {
            status,
            records_processed: tally.processed,
            error_count: tally.errors,
            error_detail,
        };
        let finished = self.audit.complete_run(run.id, &completion).await?;
        info!(
            status = %finished.status,
            processed = tally.processed,
            errors = tally.errors,
            created = tally.created,
            updated = tally.updated,
            unchanged = tally.unchanged,
            deactivated = tally.deactivated,
            "sync run finished"
        );
        Ok(RunSummary {
            run: finished,
            created: tally.created,
            updated: tally.updated,
            unchanged: tally.unchanged,
            skipped: tally.skipped,
            failed: tally.errors,
            deactivated: tally.deactivated,
            pages: tally.pages,
        })
    }

    async fn paginate(
        &self,
        run: &SyncRun,
        settings: &SyncTypeSettings,
        engine: &UpsertEngine,
        cancel: &CancelFlag,
        tally: &mut RunTally,
    ) -> LoopEnd {
        let mut request = PageRequest {
            sync_type: run.sync_type,
            cursor: None,
            page_size: settings.page_size,
            since: match run.mode {
                SyncMode::Incremental => run.watermark,
                SyncMode::Full => None,
            },
        };
        loop {
            if cancel.is_cancelled() {
                warn!(page = tally.pages, "run cancelled by operator");
                return LoopEnd::Cancelled;
            }
            let page = match self.fetch_with_retry(&request, settings, tally.pages).await {
                Ok(page) => page,
                Err((attempts, error)) => {
                    return LoopEnd::SourceFailed {
                        page: tally.pages,
                        attempts,
                        error,
                    }
                }
            };
            tally.pages += 1;

            let before = (tally.processed, tally.errors);
            for record in &page.records {
                tally.observe(record);
            }
            let results = process_page(engine, settings, tally.processed, page.records).await;
            for result in results {
                tally.absorb(result);
            }
            if let Err(err) = self
                .audit
                .record_progress(run.id, tally.processed - before.0, tally.errors - before.1)
                .await
            {
                warn!(error = %err, "progress update failed");
            }

            match page.next_cursor {
                Some(cursor) => request.cursor = Some(cursor),
                None => return LoopEnd::Completed,
            }
        }
    }

    async fn fetch_with_retry(
        &self,
        request: &PageRequest,
        settings: &SyncTypeSettings,
        page: u64,
    ) -> Result<Page, (usize, SourceError)> {
        let backoff = settings.retry.backoff();
        let mut attempt = 0usize;
        loop {
            let span = info_span!("page_fetch", page, attempt = attempt + 1);
            let result = tokio::time::timeout(settings.page_timeout(), self.source.fetch_page(request))
                .instrument(span)
                .await;
            let error = match result {
                Ok(Ok(page)) => return Ok(page),
                Ok(Err(error)) => error,
                Err(_) => SourceError::Transient {
                    message: format!("page fetch timed out after {:?}", settings.page_timeout()),
                    status: None,
                },
            };
            if !error.is_retryable() || attempt >= backoff.max_retries {
                warn!(page, attempts = attempt + 1, error = %error, "page fetch failed");
                return Err((attempt + 1, error));
            }
            let delay = backoff.delay_for_attempt(attempt);
            warn!(page, attempt = attempt + 1, ?delay, error = %error, "page fetch failed, retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Upserts one page on a bounded worker pool. Results come back in offset order.
async fn process_page(
    engine: &UpsertEngine,
    settings: &SyncTypeSettings,
    base_offset: u64,
    records: Vec<ExternalRecord>,
) -> Vec<RecordResult> {
    let semaphore = Arc::new(Semaphore::new(settings.concurrency()));
    let mut tasks = JoinSet::new();
    let mut pending: HashMap<tokio::task::Id, (u64, Option<String>)> = HashMap::new();

    for (index, record) in records.into_iter().enumerate() {
        let offset = base_offset + index as u64;
        let key = record.key_label();
        let engine = engine.clone();
        let semaphore = semaphore.clone();
        let handle = tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            engine.apply(offset, record, Utc::now()).await
        });
        pending.insert(handle.id(), (offset, key));
    }

    let mut results = Vec::with_capacity(pending.len());
    while let Some(joined) = tasks.join_next_with_id().await {
        match joined {
            Ok((id, result)) => {
                pending.remove(&id);
                results.push(result);
            }
            Err(err) => {
                let (offset, natural_key) = pending.remove(&err.id()).unwrap_or((base_offset, None));
                warn!(offset, error = %err, "record worker aborted");
                results.push(RecordResult {
                    offset,
                    failure: Some(RecordFailure {
                        offset,
                        natural_key: natural_key.clone(),
                        kind: ErrorKind::Record,
                        message: format!("record worker aborted: {err}"),
                    }),
                    natural_key,
                    outcome: UpsertOutcome::Failed,
                    entity_id: None,
                });
            }
        }
    }
    results.sort_by_key(|r| r.offset);
    results
}

fn conclude(
    end: &LoopEnd,
    tally: &RunTally,
    settings: &SyncTypeSettings,
) -> (SyncStatus, Option<ErrorDetail>) {
    let attach = |mut detail: ErrorDetail| {
        detail.records = tally.failures.clone();
        detail.omitted_records = tally.omitted;
        Some(detail)
    };
    match end {
        LoopEnd::Completed if tally.errors == 0 => (SyncStatus::Success, None),
        LoopEnd::Completed => {
            let kind = if tally.has_integrity_violation() {
                ErrorKind::IntegrityViolation
            } else {
                ErrorKind::Record
            };
            let status = if tally.successes() > 0 {
                SyncStatus::Partial
            } else {
                SyncStatus::Failed
            };
            let message = format!("{} of {} records failed", tally.errors, tally.processed);
            (status, attach(ErrorDetail::new(kind, message)))
        }
        LoopEnd::Cancelled => (SyncStatus::Failed, attach(ErrorDetail::cancelled())),
        LoopEnd::SourceFailed {
            page,
            attempts,
            error,
        } => {
            let kind = if error.is_retryable() {
                ErrorKind::TransientSource
            } else {
                ErrorKind::FatalSource
            };
            let message = format!("page {page} failed after {attempts} attempt(s): {error}");
            (SyncStatus::Failed, attach(ErrorDetail::new(kind, message)))
        }
        LoopEnd::TimedOut => {
            let message = format!("run exceeded {}s wall-clock budget", settings.max_run_secs);
            (
                SyncStatus::Failed,
                attach(ErrorDetail::new(ErrorKind::Timeout, message)),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(offset: u64, kind: ErrorKind) -> RecordFailure {
        RecordFailure {
            offset,
            natural_key: Some(format!("K-{offset}")),
            kind,
            message: "boom".into(),
        }
    }

    fn tally_with(successes: u64, failures: &[RecordFailure]) -> RunTally {
        let mut tally = RunTally::new(100);
        tally.processed = successes + failures.len() as u64;
        tally.created = successes;
        tally.errors = failures.len() as u64;
        for failure in failures {
            tally.push_failure(failure.clone());
        }
        tally
    }

    #[test]
    fn status_follows_errors_and_successes() {
        let settings = SyncTypeSettings::default();

        let (status, detail) = conclude(&LoopEnd::Completed, &tally_with(5, &[]), &settings);
        assert_eq!(status, SyncStatus::Success);
        assert!(detail.is_none());

        let (status, detail) = conclude(
            &LoopEnd::Completed,
            &tally_with(99, &[failure(49, ErrorKind::Record)]),
            &settings,
        );
        assert_eq!(status, SyncStatus::Partial);
        let detail = detail.unwrap();
        assert_eq!(detail.kind, ErrorKind::Record);
        assert_eq!(detail.records[0].offset, 49);

        let (status, _) = conclude(
            &LoopEnd::Completed,
            &tally_with(0, &[failure(0, ErrorKind::Record)]),
            &settings,
        );
        assert_eq!(status, SyncStatus::Failed);
    }

    #[test]
    fn integrity_violations_are_flagged_in_the_detail() {
        let (status, detail) = conclude(
            &LoopEnd::Completed,
            &tally_with(
                3,
                &[
                    failure(1, ErrorKind::Record),
                    failure(2, ErrorKind::IntegrityViolation),
                ],
            ),
            &SyncTypeSettings::default(),
        );
        assert_eq!(status, SyncStatus::Partial);
        let detail = detail.unwrap();
        assert_eq!(detail.kind, ErrorKind::IntegrityViolation);
        assert!(detail.has_integrity_violation());
    }

    #[test]
    fn aborted_loops_always_fail() {
        let settings = SyncTypeSettings::default();
        let end = LoopEnd::SourceFailed {
            page: 0,
            attempts: 1,
            error: SourceError::Fatal {
                message: "http status 401".into(),
                status: Some(401),
            },
        };
        let (status, detail) = conclude(&end, &tally_with(10, &[]), &settings);
        assert_eq!(status, SyncStatus::Failed);
        assert_eq!(detail.unwrap().kind, ErrorKind::FatalSource);

        let (status, detail) = conclude(&LoopEnd::Cancelled, &tally_with(10, &[]), &settings);
        assert_eq!(status, SyncStatus::Failed);
        assert_eq!(detail.unwrap().message, "cancelled");

        let (_, detail) = conclude(&LoopEnd::TimedOut, &tally_with(0, &[]), &settings);
        assert_eq!(detail.unwrap().kind, ErrorKind::Timeout);
    }

    #[test]
    fn recorded_failures_are_capped() {
        let mut tally = RunTally::new(2);
        for offset in 0..5 {
            tally.push_failure(failure(offset, ErrorKind::Record));
        }
        assert_eq!(tally.failures.len(), 2);
        assert_eq!(tally.omitted, 3);
        assert!(!tally.has_integrity_violation());
    }

    #[test]
    fn integrity_violations_survive_the_failure_cap() {
        let mut tally = RunTally::new(0);
        tally.absorb(RecordResult {
            offset: 0,
            natural_key: None,
            outcome: UpsertOutcome::Created,
            entity_id: None,
            failure: None,
        });
        let violation = failure(1, ErrorKind::IntegrityViolation);
        tally.absorb(RecordResult {
            offset: 1,
            natural_key: violation.natural_key.clone(),
            outcome: UpsertOutcome::Failed,
            entity_id: None,
            failure: Some(violation),
        });
        assert!(tally.failures.is_empty());
        assert_eq!(tally.omitted, 1);

        let (status, detail) = conclude(&LoopEnd::Completed, &tally, &SyncTypeSettings::default());
        assert_eq!(status, SyncStatus::Partial);
        let detail = detail.unwrap();
        assert_eq!(detail.kind, ErrorKind::IntegrityViolation);
        assert_eq!(detail.omitted_records, 1);
    }
}
