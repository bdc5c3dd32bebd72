use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fedsync_core::SyncType;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};

use crate::samgov::map_records;
use crate::{parse_offset_cursor, Page, PageRequest, RecordSource, SourceError};

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub pacer: Option<PacerConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.sam.gov".to_string(),
            api_key: None,
            timeout: Duration::from_secs(20),
            user_agent: None,
            pacer: None,
        }
    }
}

/// Request budget against the public API's rate limit.
#[derive(Debug, Clone, Copy)]
pub struct PacerConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
struct RequestPacer {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<PacerState>,
}

#[derive(Debug, Clone, Copy)]
struct PacerState {
    tokens: u32,
    last_refill: Instant,
}

impl RequestPacer {
    fn new(config: PacerConfig) -> Self {
        Self {
            capacity: config.capacity.max(1),
            refill_every: config.refill_every,
            state: Mutex::new(PacerState {
                tokens: config.capacity.max(1),
                last_refill: Instant::now(),
            }),
        }
    }

    async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }
            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }
            let wait = self.refill_every;
            drop(state);
            tokio::time::sleep(wait).await;
        }
    }
}

struct Endpoint {
    path: &'static str,
    records_field: &'static str,
    since_param: &'static str,
}

fn endpoint(sync_type: SyncType) -> Endpoint {
    match sync_type {
        SyncType::Opportunities => Endpoint {
            path: "/opportunities/v2/search",
            records_field: "opportunitiesData",
            since_param: "postedFrom",
        },
        SyncType::Awards => Endpoint {
            path: "/contract-awards/v1/search",
            records_field: "awardSummary",
            since_param: "lastModifiedFrom",
        },
        SyncType::Organizations => Endpoint {
            path: "/entity-information/v3/entities",
            records_field: "entityData",
            since_param: "updateDateFrom",
        },
    }
}

/// SAM.gov public API client. Offset/limit pagination; the cursor is the next offset.
#[derive(Debug)]
pub struct SamGovHttpSource {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    pacer: Option<RequestPacer>,
}

impl SamGovHttpSource {
    pub fn new(config: HttpClientConfig) -> Result<Self, SourceError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().map_err(|err| SourceError::Fatal {
            message: format!("building http client: {err}"),
            status: None,
        })?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
            pacer: config.pacer.map(RequestPacer::new),
        })
    }

    fn query(
        &self,
        request: &PageRequest,
        offset: usize,
        endpoint: &Endpoint,
        now: DateTime<Utc>,
    ) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("limit", request.page_size.to_string()),
            ("offset", offset.to_string()),
        ];
        if let Some(key) = &self.api_key {
            params.push(("api_key", key.clone()));
        }
        if let Some(since) = request.since {
            params.push((endpoint.since_param, since.format("%m/%d/%Y").to_string()));
            if request.sync_type == SyncType::Opportunities {
                params.push(("postedTo", now.format("%m/%d/%Y").to_string()));
            }
        }
        params
    }
}

/// Pulls the record array and total out of a search response body.
fn split_body(body: Value, records_field: &str) -> Result<(Vec<Value>, Option<u64>), SourceError> {
    let Value::Object(mut map) = body else {
        return Err(SourceError::Malformed("response body is not an object".into()));
    };
    let total = map.get("totalRecords").and_then(Value::as_u64);
    let records = match map.remove(records_field) {
        Some(Value::Array(items)) => items,
        Some(Value::Null) | None => Vec::new(),
        Some(_) => {
            return Err(SourceError::Malformed(format!(
                "`{records_field}` is not an array"
            )))
        }
    };
    Ok((records, total))
}

fn next_offset(offset: usize, received: usize, page_size: usize, total: Option<u64>) -> Option<usize> {
    let next = offset + received;
    let exhausted = received == 0
        || received < page_size
        || total.is_some_and(|t| next as u64 >= t);
    (!exhausted).then_some(next)
}

#[async_trait]
impl RecordSource for SamGovHttpSource {
    fn name(&self) -> &'static str {
        "sam.gov"
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<Page, SourceError> {
        let offset = parse_offset_cursor(request.cursor.as_deref())?;
        let endpoint = endpoint(request.sync_type);
        let url = format!("{}{}", self.base_url, endpoint.path);
        let span = info_span!("http_fetch", sync_type = %request.sync_type, offset, url = %url);

        async {
            if let Some(pacer) = &self.pacer {
                pacer.take().await;
            }
            let resp = self
                .client
                .get(&url)
                .query(&self.query(request, offset, &endpoint, Utc::now()))
                .send()
                .await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(SourceError::from_status(status, endpoint.path));
            }
            let body: Value = resp.json().await?;
            let (raw, total) = split_body(body, endpoint.records_field)?;
            let received = raw.len();
            debug!(received, ?total, "page received");
            Ok(Page {
                records: map_records(request.sync_type, raw),
                next_cursor: next_offset(offset, received, request.page_size, total)
                    .map(|n| n.to_string()),
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn body_split_reads_records_and_total() {
        let (records, total) = split_body(
            json!({"totalRecords": 3, "opportunitiesData": [{"a": 1}, {"b": 2}]}),
            "opportunitiesData",
        )
        .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(total, Some(3));

        let (records, _) = split_body(json!({"totalRecords": 0}), "entityData").unwrap();
        assert!(records.is_empty());

        assert!(split_body(json!({"entityData": "nope"}), "entityData").is_err());
        assert!(split_body(json!([1]), "entityData").is_err());
    }

    #[test]
    fn pagination_stops_on_short_page_or_total() {
        assert_eq!(next_offset(0, 100, 100, None), Some(100));
        assert_eq!(next_offset(100, 40, 100, None), None);
        assert_eq!(next_offset(0, 100, 100, Some(100)), None);
        assert_eq!(next_offset(0, 0, 100, None), None);
    }

    #[test]
    fn incremental_requests_carry_the_watermark() {
        let source = SamGovHttpSource::new(HttpClientConfig {
            api_key: Some("k".into()),
            ..Default::default()
        })
        .unwrap();
        let since = DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let request = PageRequest {
            sync_type: SyncType::Opportunities,
            cursor: None,
            page_size: 50,
            since: Some(since),
        };
        let params = source.query(&request, 0, &endpoint(SyncType::Opportunities), since);
        assert!(params.contains(&("postedFrom", "02/24/2026".to_string())));
        assert!(params.contains(&("postedTo", "02/24/2026".to_string())));
        assert!(params.contains(&("api_key", "k".to_string())));
        assert!(params.contains(&("limit", "50".to_string())));
    }

    #[tokio::test]
    async fn pacer_hands_out_capacity_without_waiting() {
        let pacer = RequestPacer::new(PacerConfig {
            capacity: 2,
            refill_every: Duration::from_secs(60),
        });
        let started = Instant::now();
        pacer.take().await;
        pacer.take().await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
