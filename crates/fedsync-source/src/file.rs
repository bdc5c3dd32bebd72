use std::path::PathBuf;

use async_trait::async_trait;
use fedsync_core::SyncType;
use serde_json::Value;
use tokio::fs;
use tracing::debug;

use crate::samgov::map_records;
use crate::{parse_offset_cursor, Page, PageRequest, RecordSource, SourceError};

/// Cached SAM.gov exports on disk: `<data_dir>/<sync_type>/*.json`.
///
/// Each file holds either a JSON array of records or a search response object
/// wrapping one. Files are read in name order and paginated as one sequence.
/// The watermark is ignored; exports carry no reliable change timestamps.
#[derive(Debug, Clone)]
pub struct FileSource {
    data_dir: PathBuf,
}

impl FileSource {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    async fn json_files(&self, sync_type: SyncType) -> Result<Vec<PathBuf>, SourceError> {
        let dir = self.data_dir.join(sync_type.as_str());
        // A missing directory is an error rather than an empty feed: an empty
        // full resync would soft-delete every local record.
        let mut entries = fs::read_dir(&dir).await.map_err(|err| SourceError::Fatal {
            message: format!("reading {}: {err}", dir.display()),
            status: None,
        })?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|err| SourceError::Fatal {
            message: format!("listing {}: {err}", dir.display()),
            status: None,
        })? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    async fn load_all(&self, sync_type: SyncType) -> Result<Vec<Value>, SourceError> {
        let mut out = Vec::new();
        for path in self.json_files(sync_type).await? {
            let bytes = fs::read(&path).await.map_err(|err| SourceError::Fatal {
                message: format!("reading {}: {err}", path.display()),
                status: None,
            })?;
            let body: Value = serde_json::from_slice(&bytes)
                .map_err(|err| SourceError::Malformed(format!("{}: {err}", path.display())))?;
            let records = records_of(body).ok_or_else(|| {
                SourceError::Malformed(format!("{}: no record array found", path.display()))
            })?;
            debug!(file = %path.display(), records = records.len(), "loaded export file");
            out.extend(records);
        }
        Ok(out)
    }
}

fn records_of(body: Value) -> Option<Vec<Value>> {
    match body {
        Value::Array(items) => Some(items),
        Value::Object(mut map) => ["opportunitiesData", "awardSummary", "entityData", "data"]
            .iter()
            .find_map(|field| match map.remove(*field) {
                Some(Value::Array(items)) => Some(items),
                _ => None,
            }),
        _ => None,
    }
}

#[async_trait]
impl RecordSource for FileSource {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<Page, SourceError> {
        let offset = parse_offset_cursor(request.cursor.as_deref())?;
        let all = self.load_all(request.sync_type).await?;
        let page_size = request.page_size.max(1);
        let end = (offset + page_size).min(all.len());
        let raw: Vec<Value> = all.get(offset..end).map(<[Value]>::to_vec).unwrap_or_default();
        Ok(Page {
            records: map_records(request.sync_type, raw),
            next_cursor: (end < all.len()).then(|| end.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedsync_core::ExternalRecord;
    use serde_json::json;
    use tempfile::tempdir;

    fn request(cursor: Option<String>) -> PageRequest {
        PageRequest {
            sync_type: SyncType::Opportunities,
            cursor,
            page_size: 2,
            since: None,
        }
    }

    #[tokio::test]
    async fn pages_across_files_in_name_order() {
        let dir = tempdir().expect("tempdir");
        let type_dir = dir.path().join("opportunities");
        std::fs::create_dir_all(&type_dir).unwrap();
        std::fs::write(
            type_dir.join("b.json"),
            json!({"totalRecords": 1, "opportunitiesData": [{"noticeId": "N-3", "title": "c"}]})
                .to_string(),
        )
        .unwrap();
        std::fs::write(
            type_dir.join("a.json"),
            json!([{"noticeId": "N-1", "title": "a"}, {"noticeId": "N-2", "title": "b"}])
                .to_string(),
        )
        .unwrap();
        std::fs::write(type_dir.join("notes.txt"), "ignored").unwrap();

        let source = FileSource::new(dir.path());
        let first = source.fetch_page(&request(None)).await.unwrap();
        assert_eq!(first.records.len(), 2);
        assert_eq!(first.records[0].key_label().as_deref(), Some("N-1"));
        assert_eq!(first.next_cursor.as_deref(), Some("2"));

        let second = source.fetch_page(&request(first.next_cursor)).await.unwrap();
        assert_eq!(second.records.len(), 1);
        assert!(matches!(&second.records[0], ExternalRecord::Parsed(_)));
        assert_eq!(second.next_cursor, None);
    }

    #[tokio::test]
    async fn missing_directory_is_fatal() {
        let dir = tempdir().expect("tempdir");
        let err = FileSource::new(dir.path())
            .fetch_page(&request(None))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn invalid_json_is_malformed() {
        let dir = tempdir().expect("tempdir");
        let type_dir = dir.path().join("opportunities");
        std::fs::create_dir_all(&type_dir).unwrap();
        std::fs::write(type_dir.join("bad.json"), "{not json").unwrap();

        let err = FileSource::new(dir.path())
            .fetch_page(&request(None))
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Malformed(_)));
    }
}
