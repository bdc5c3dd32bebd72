//! External record sources: the SAM.gov HTTP API, cached JSON exports on disk,
//! and a scripted in-memory source for tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fedsync_core::{ExternalRecord, SyncType};
use reqwest::StatusCode;
use thiserror::Error;

mod file;
mod http;
mod memory;
pub mod samgov;

pub use file::FileSource;
pub use http::{HttpClientConfig, PacerConfig, SamGovHttpSource};
pub use memory::MemorySource;

pub const CRATE_NAME: &str = "fedsync-source";

/// One page request. `cursor` is opaque to the caller; `None` asks for the first page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub sync_type: SyncType,
    pub cursor: Option<String>,
    pub page_size: usize,
    /// Watermark for incremental runs; full runs leave it unset.
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Page {
    pub records: Vec<ExternalRecord>,
    /// `None` once the source is exhausted.
    pub next_cursor: Option<String>,
}

#[derive(Debug, Error)]
pub enum SourceError {
    /// Worth retrying: 5xx, 429, timeouts, dropped connections.
    #[error("transient source error: {message}")]
    Transient {
        message: String,
        status: Option<u16>,
    },
    /// Not worth retrying: 4xx, auth failures.
    #[error("fatal source error: {message}")]
    Fatal {
        message: String,
        status: Option<u16>,
    },
    #[error("malformed source payload: {0}")]
    Malformed(String),
}

impl SourceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::Transient { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            SourceError::Transient { status, .. } | SourceError::Fatal { status, .. } => *status,
            SourceError::Malformed(_) => None,
        }
    }

    pub fn from_status(status: StatusCode, context: &str) -> Self {
        let message = format!("http status {} for {context}", status.as_u16());
        match classify_status(status) {
            RetryDisposition::Retryable => SourceError::Transient {
                message,
                status: Some(status.as_u16()),
            },
            RetryDisposition::NonRetryable => SourceError::Fatal {
                message,
                status: Some(status.as_u16()),
            },
        }
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return SourceError::Malformed(err.to_string());
        }
        let status = err.status().map(|s| s.as_u16());
        match classify_reqwest_error(&err) {
            RetryDisposition::Retryable => SourceError::Transient {
                message: err.to_string(),
                status,
            },
            RetryDisposition::NonRetryable => SourceError::Fatal {
                message: err.to_string(),
                status,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// A paginated feed of external records for one or more sync types.
///
/// Implementations make a single attempt per call; retries belong to the caller.
#[async_trait]
pub trait RecordSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch_page(&self, request: &PageRequest) -> Result<Page, SourceError>;
}

/// Offset cursors shared by the offset-paginated sources.
pub(crate) fn parse_offset_cursor(cursor: Option<&str>) -> Result<usize, SourceError> {
    match cursor {
        None => Ok(0),
        Some(raw) => raw
            .parse()
            .map_err(|_| SourceError::Fatal {
                message: format!("invalid page cursor {raw:?}"),
                status: None,
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn status_errors_keep_their_code() {
        let err = SourceError::from_status(StatusCode::BAD_GATEWAY, "/opportunities/v2/search");
        assert!(err.is_retryable());
        assert_eq!(err.status(), Some(502));

        let err = SourceError::from_status(StatusCode::FORBIDDEN, "/opportunities/v2/search");
        assert!(!err.is_retryable());
        assert_eq!(err.status(), Some(403));
    }

    #[test]
    fn offset_cursor_parsing() {
        assert_eq!(parse_offset_cursor(None).unwrap(), 0);
        assert_eq!(parse_offset_cursor(Some("200")).unwrap(), 200);
        assert!(parse_offset_cursor(Some("next")).is_err());
    }
}
