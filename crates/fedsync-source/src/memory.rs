use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use fedsync_core::{ExternalRecord, SyncType};
use tokio::sync::Mutex;

use crate::{parse_offset_cursor, Page, PageRequest, RecordSource, SourceError};

/// Scripted source for tests and dry runs.
///
/// Records are paginated by the requested page size. Failures can be queued per
/// page index and are returned, one per call, before the page itself is served.
#[derive(Debug, Default)]
pub struct MemorySource {
    state: Mutex<MemoryState>,
    page_delay: Option<Duration>,
}

#[derive(Debug, Default)]
struct MemoryState {
    records: HashMap<SyncType, Vec<ExternalRecord>>,
    failures: HashMap<(SyncType, usize), VecDeque<SourceError>>,
    requests: Vec<PageRequest>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(mut self, sync_type: SyncType, records: Vec<ExternalRecord>) -> Self {
        self.state.get_mut().records.insert(sync_type, records);
        self
    }

    /// Queues `error` for the `page_index`-th page (0-based) of `sync_type`.
    pub fn with_failure(mut self, sync_type: SyncType, page_index: usize, error: SourceError) -> Self {
        self.state
            .get_mut()
            .failures
            .entry((sync_type, page_index))
            .or_default()
            .push_back(error);
        self
    }

    pub fn with_page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = Some(delay);
        self
    }

    pub async fn set_records(&self, sync_type: SyncType, records: Vec<ExternalRecord>) {
        self.state.lock().await.records.insert(sync_type, records);
    }

    /// Every request served so far, failed attempts included.
    pub async fn requests(&self) -> Vec<PageRequest> {
        self.state.lock().await.requests.clone()
    }
}

#[async_trait]
impl RecordSource for MemorySource {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<Page, SourceError> {
        if let Some(delay) = self.page_delay {
            tokio::time::sleep(delay).await;
        }
        let offset = parse_offset_cursor(request.cursor.as_deref())?;
        let page_size = request.page_size.max(1);

        let mut state = self.state.lock().await;
        state.requests.push(request.clone());
        if let Some(err) = state
            .failures
            .get_mut(&(request.sync_type, offset / page_size))
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }

        let all = state
            .records
            .get(&request.sync_type)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let end = (offset + page_size).min(all.len());
        Ok(Page {
            records: all.get(offset..end).map(<[ExternalRecord]>::to_vec).unwrap_or_default(),
            next_cursor: (end < all.len()).then(|| end.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unparseable(n: usize) -> ExternalRecord {
        ExternalRecord::Unparseable {
            key_hint: Some(format!("K-{n}")),
            reason: "scripted".into(),
        }
    }

    #[tokio::test]
    async fn queued_failures_precede_the_page() {
        let source = MemorySource::new()
            .with_records(SyncType::Awards, (0..3).map(unparseable).collect())
            .with_failure(
                SyncType::Awards,
                1,
                SourceError::Transient {
                    message: "503".into(),
                    status: Some(503),
                },
            );
        let mut request = PageRequest {
            sync_type: SyncType::Awards,
            cursor: None,
            page_size: 2,
            since: None,
        };

        let first = source.fetch_page(&request).await.unwrap();
        assert_eq!(first.records.len(), 2);

        request.cursor = first.next_cursor;
        assert!(source.fetch_page(&request).await.unwrap_err().is_retryable());
        let second = source.fetch_page(&request).await.unwrap();
        assert_eq!(second.records.len(), 1);
        assert_eq!(second.next_cursor, None);
        assert_eq!(source.requests().await.len(), 3);
    }
}
