//! Document store collaborator, durable queue storage, HTTP fetch utilities and
//! the price history store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use finca_core::{ErrorLogEntry, PriceReading, ERROR_LOG_COLLECTION, PRICE_READINGS_COLLECTION};
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub mod document;
pub mod http;
pub mod kv;
pub mod postgres;

pub use document::{
    DocumentQuery, DocumentStore, FieldKind, FieldValue, Filter, FilterOp, InMemoryDocumentStore,
    JsonFileDocumentStore, OrderBy, SortDirection, StoredDocument,
};
pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedResponse, HttpClientConfig,
    HttpFetcher, RetryDisposition,
};
pub use kv::{FileKeyValueStore, InMemoryKeyValueStore, KeyValueStore};
pub use postgres::PgDocumentStore;

pub const CRATE_NAME: &str = "finca-storage";

const CAPTURED_AT_FIELD: &str = "captured_at";

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing document: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("decoding {what}: {source}")]
    Decode {
        what: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Writes `bytes` to `path` through a temp file + rename so readers never see a
/// partial file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| PersistenceError::Io { path, source }
    };

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).await.map_err(io_err(parent))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(io_err(&temp_path))?;
    let written = async {
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    drop(file);
    if let Err(source) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(PersistenceError::Io {
            path: temp_path,
            source,
        });
    }

    if let Err(source) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(PersistenceError::Io {
            path: path.to_path_buf(),
            source,
        });
    }
    Ok(())
}

/// Append-only price history on top of a [`DocumentStore`].
#[derive(Clone)]
pub struct PriceStore {
    documents: Arc<dyn DocumentStore>,
}

impl PriceStore {
    pub fn new(documents: Arc<dyn DocumentStore>) -> Self {
        Self { documents }
    }

    pub fn documents(&self) -> &Arc<dyn DocumentStore> {
        &self.documents
    }

    pub async fn append(&self, reading: &PriceReading) -> Result<Uuid, PersistenceError> {
        let doc = serde_json::to_value(reading)?;
        self.documents.append(PRICE_READINGS_COLLECTION, doc).await
    }

    pub async fn latest(&self) -> Result<Option<PriceReading>, PersistenceError> {
        Ok(self.recent(1).await?.into_iter().next())
    }

    /// Most recent reading captured at or after `instant`.
    pub async fn latest_since(&self, instant: DateTime<Utc>) -> Result<Option<PriceReading>, PersistenceError> {
        let query = newest_first()
            .filter(CAPTURED_AT_FIELD, FilterOp::Gte, FieldValue::Timestamp(instant))
            .limit(1);
        Ok(self.run(&query).await?.into_iter().next())
    }

    /// One-shot snapshot of the `n` most recent readings, newest first.
    pub async fn recent(&self, n: usize) -> Result<Vec<PriceReading>, PersistenceError> {
        if n == 0 {
            return Ok(Vec::new());
        }
        self.run(&newest_first().limit(n)).await
    }

    pub fn percent_change(previous: Option<&PriceReading>, current: &PriceReading) -> Decimal {
        finca_core::percent_change(previous, current)
    }

    async fn run(&self, query: &DocumentQuery) -> Result<Vec<PriceReading>, PersistenceError> {
        self.documents
            .query(PRICE_READINGS_COLLECTION, query)
            .await?
            .into_iter()
            .map(|stored| {
                serde_json::from_value(stored.doc).map_err(|source| PersistenceError::Decode {
                    what: format!("price reading {}", stored.id),
                    source,
                })
            })
            .collect()
    }
}

fn newest_first() -> DocumentQuery {
    DocumentQuery::new().order_by(CAPTURED_AT_FIELD, FieldKind::Timestamp, SortDirection::Descending)
}

/// Append-only sync failure log, inspected by operators.
#[derive(Clone)]
pub struct ErrorLog {
    documents: Arc<dyn DocumentStore>,
}

impl ErrorLog {
    pub fn new(documents: Arc<dyn DocumentStore>) -> Self {
        Self { documents }
    }

    pub async fn append(&self, entry: &ErrorLogEntry) -> Result<Uuid, PersistenceError> {
        let doc = serde_json::to_value(entry)?;
        self.documents.append(ERROR_LOG_COLLECTION, doc).await
    }

    pub async fn recent(&self, n: usize) -> Result<Vec<ErrorLogEntry>, PersistenceError> {
        let query = newest_first().limit(n);
        self.documents
            .query(ERROR_LOG_COLLECTION, &query)
            .await?
            .into_iter()
            .map(|stored| {
                serde_json::from_value(stored.doc).map_err(|source| PersistenceError::Decode {
                    what: format!("error log entry {}", stored.id),
                    source,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use finca_core::{ErrorCategory, PriceUnit, ReadingSource};
    use rust_decimal_macros::dec;
    use serde_json::json;
    use tempfile::tempdir;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, hour, 0, 0).single().unwrap()
    }

    fn reading(price: Decimal, captured_at: DateTime<Utc>) -> PriceReading {
        PriceReading {
            price,
            unit: PriceUnit::PerThousand,
            currency: "GTQ".into(),
            source: ReadingSource::ScheduledJob,
            captured_at,
        }
    }

    #[tokio::test]
    async fn empty_store_has_no_latest() {
        let store = PriceStore::new(Arc::new(InMemoryDocumentStore::new()));
        assert_eq!(store.latest().await.unwrap(), None);
        assert!(store.recent(5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn recent_is_newest_first_and_limited() {
        let store = PriceStore::new(Arc::new(InMemoryDocumentStore::new()));
        store.append(&reading(dec!(400), at(8))).await.unwrap();
        store.append(&reading(dec!(450), at(9))).await.unwrap();
        store.append(&reading(dec!(520), at(10))).await.unwrap();

        let recent = store.recent(2).await.unwrap();
        assert_eq!(
            recent.iter().map(|r| r.price).collect::<Vec<_>>(),
            vec![dec!(520), dec!(450)]
        );
        assert_eq!(store.latest().await.unwrap().unwrap().price, dec!(520));
        assert!(store.recent(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn latest_since_respects_the_lower_bound() {
        let store = PriceStore::new(Arc::new(InMemoryDocumentStore::new()));
        store.append(&reading(dec!(450), at(5))).await.unwrap();

        assert_eq!(store.latest_since(at(6)).await.unwrap(), None);
        let hit = store.latest_since(at(5)).await.unwrap().unwrap();
        assert_eq!(hit.price, dec!(450));
    }

    #[tokio::test]
    async fn same_timestamp_readings_resolve_to_last_inserted() {
        let store = PriceStore::new(Arc::new(InMemoryDocumentStore::new()));
        store.append(&reading(dec!(450), at(9))).await.unwrap();
        store.append(&reading(dec!(455), at(9))).await.unwrap();
        assert_eq!(store.latest().await.unwrap().unwrap().price, dec!(455));
    }

    #[tokio::test]
    async fn file_store_persists_across_instances() {
        let dir = tempdir().expect("tempdir");
        {
            let store = PriceStore::new(Arc::new(JsonFileDocumentStore::new(dir.path())));
            store.append(&reading(dec!(480), at(7))).await.unwrap();
            store.append(&reading(dec!(500), at(8))).await.unwrap();
        }
        let reopened = PriceStore::new(Arc::new(JsonFileDocumentStore::new(dir.path())));
        let latest = reopened.latest().await.unwrap().unwrap();
        assert_eq!(latest.price, dec!(500));
        assert_eq!(latest.captured_at, at(8));
        assert_eq!(reopened.recent(10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn query_filters_by_text_and_number() {
        let docs = InMemoryDocumentStore::new();
        docs.append("things", json!({"kind": "a", "n": 1.0})).await.unwrap();
        docs.append("things", json!({"kind": "b", "n": 5.0})).await.unwrap();
        docs.append("things", json!({"kind": "a", "n": 9.0})).await.unwrap();

        let query = DocumentQuery::new()
            .filter("kind", FilterOp::Eq, FieldValue::Text("a".into()))
            .filter("n", FilterOp::Gt, FieldValue::Number(2.0));
        let found = docs.query("things", &query).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].doc["n"], 9.0);

        assert!(docs.query("missing", &DocumentQuery::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn error_log_is_append_only_and_newest_first() {
        let log = ErrorLog::new(Arc::new(InMemoryDocumentStore::new()));
        for (offset, message) in ["first", "second"].iter().enumerate() {
            log.append(&ErrorLogEntry {
                captured_at: at(6) + Duration::minutes(offset as i64),
                category: ErrorCategory::ScrapeFailure,
                kind: Some("not-found".into()),
                message: message.to_string(),
            })
            .await
            .unwrap();
        }
        let entries = log.recent(10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "second");
    }

    #[tokio::test]
    async fn atomic_write_replaces_contents() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("value.json");
        write_atomic(&path, b"one").await.unwrap();
        write_atomic(&path, b"two").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"two");
        let leftovers = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn file_kv_store_round_trips_keys_with_prefix() {
        let dir = tempdir().expect("tempdir");
        let kv = FileKeyValueStore::new(dir.path());
        kv.put("finca-queue:price-write", b"[]").await.unwrap();
        kv.put("finca-queue:expense-write", b"[1]").await.unwrap();
        kv.put("other:thing", b"x").await.unwrap();

        assert_eq!(
            kv.keys_with_prefix("finca-queue:").await.unwrap(),
            vec!["finca-queue:expense-write".to_string(), "finca-queue:price-write".to_string()]
        );
        assert_eq!(kv.get("finca-queue:expense-write").await.unwrap().unwrap(), b"[1]");
        kv.remove("finca-queue:expense-write").await.unwrap();
        assert_eq!(kv.get("finca-queue:expense-write").await.unwrap(), None);
        kv.remove("never-there").await.unwrap();
    }
}
