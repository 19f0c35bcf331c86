//! Generic document-store collaborator: append + filtered/ordered/limited query.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::fs;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{write_atomic, PersistenceError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub id: Uuid,
    pub doc: JsonValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Timestamp,
    Number,
    Text,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Timestamp(DateTime<Utc>),
    Number(f64),
    Text(String),
}

impl FieldValue {
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::Timestamp(_) => FieldKind::Timestamp,
            FieldValue::Number(_) => FieldKind::Number,
            FieldValue::Text(_) => FieldKind::Text,
        }
    }

    /// Reads a top-level field of `doc` interpreted as `kind`.
    pub fn extract(doc: &JsonValue, field: &str, kind: FieldKind) -> Option<Self> {
        let raw = doc.get(field)?;
        match kind {
            FieldKind::Timestamp => DateTime::parse_from_rfc3339(raw.as_str()?)
                .ok()
                .map(|ts| FieldValue::Timestamp(ts.with_timezone(&Utc))),
            FieldKind::Number => raw.as_f64().map(FieldValue::Number),
            FieldKind::Text => raw.as_str().map(|s| FieldValue::Text(s.to_string())),
        }
    }

    fn compare(&self, other: &FieldValue) -> Option<Ordering> {
        match (self, other) {
            (FieldValue::Timestamp(a), FieldValue::Timestamp(b)) => Some(a.cmp(b)),
            (FieldValue::Number(a), FieldValue::Number(b)) => a.partial_cmp(b),
            (FieldValue::Text(a), FieldValue::Text(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl FilterOp {
    pub fn sql(&self) -> &'static str {
        match self {
            FilterOp::Eq => " = ",
            FilterOp::Gt => " > ",
            FilterOp::Gte => " >= ",
            FilterOp::Lt => " < ",
            FilterOp::Lte => " <= ",
        }
    }

    fn accepts(&self, ordering: Ordering) -> bool {
        match self {
            FilterOp::Eq => ordering == Ordering::Equal,
            FilterOp::Gt => ordering == Ordering::Greater,
            FilterOp::Gte => ordering != Ordering::Less,
            FilterOp::Lt => ordering == Ordering::Less,
            FilterOp::Lte => ordering != Ordering::Greater,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: FieldValue,
}

impl Filter {
    pub fn new(field: impl Into<String>, op: FilterOp, value: FieldValue) -> Self {
        Self {
            field: field.into(),
            op,
            value,
        }
    }

    pub fn matches(&self, doc: &JsonValue) -> bool {
        FieldValue::extract(doc, &self.field, self.value.kind())
            .and_then(|actual| actual.compare(&self.value))
            .map(|ordering| self.op.accepts(ordering))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub field: String,
    pub kind: FieldKind,
    pub direction: SortDirection,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DocumentQuery {
    pub filters: Vec<Filter>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
}

impl DocumentQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, field: impl Into<String>, op: FilterOp, value: FieldValue) -> Self {
        self.filters.push(Filter::new(field, op, value));
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, kind: FieldKind, direction: SortDirection) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            kind,
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Evaluates the query over documents given in insertion order.
    ///
    /// Ties on the order field resolve by insertion order in the same direction,
    /// so a descending query puts the most recently appended document first.
    pub fn evaluate(&self, documents: &[StoredDocument]) -> Vec<StoredDocument> {
        let mut selected = documents
            .iter()
            .enumerate()
            .filter(|(_, d)| self.filters.iter().all(|f| f.matches(&d.doc)))
            .collect::<Vec<_>>();

        if let Some(order) = &self.order_by {
            let keyed = |doc: &StoredDocument| FieldValue::extract(&doc.doc, &order.field, order.kind);
            selected.sort_by(|(seq_a, a), (seq_b, b)| {
                let by_field = match (keyed(*a), keyed(*b)) {
                    (Some(x), Some(y)) => x.compare(&y).unwrap_or(Ordering::Equal),
                    (Some(_), None) => Ordering::Greater,
                    (None, Some(_)) => Ordering::Less,
                    (None, None) => Ordering::Equal,
                };
                let ordering = by_field.then(seq_a.cmp(seq_b));
                match order.direction {
                    SortDirection::Ascending => ordering,
                    SortDirection::Descending => ordering.reverse(),
                }
            });
        }

        selected
            .into_iter()
            .take(self.limit.unwrap_or(usize::MAX))
            .map(|(_, d)| d.clone())
            .collect()
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Appends a new document. Never overwrites.
    async fn append(&self, collection: &str, doc: JsonValue) -> Result<Uuid, PersistenceError>;

    async fn query(
        &self,
        collection: &str,
        query: &DocumentQuery,
    ) -> Result<Vec<StoredDocument>, PersistenceError>;
}

#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    collections: Mutex<HashMap<String, Vec<StoredDocument>>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn append(&self, collection: &str, doc: JsonValue) -> Result<Uuid, PersistenceError> {
        let id = Uuid::new_v4();
        let mut collections = self.collections.lock().await;
        collections
            .entry(collection.to_string())
            .or_default()
            .push(StoredDocument { id, doc });
        Ok(id)
    }

    async fn query(
        &self,
        collection: &str,
        query: &DocumentQuery,
    ) -> Result<Vec<StoredDocument>, PersistenceError> {
        let collections = self.collections.lock().await;
        Ok(collections
            .get(collection)
            .map(|docs| query.evaluate(docs))
            .unwrap_or_default())
    }
}

/// One JSON array file per collection, rewritten atomically on every append.
#[derive(Debug)]
pub struct JsonFileDocumentStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileDocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn collection_path(&self, collection: &str) -> PathBuf {
        let safe = collection
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect::<String>();
        self.root.join(format!("{safe}.json"))
    }

    async fn load(&self, collection: &str) -> Result<Vec<StoredDocument>, PersistenceError> {
        let path = self.collection_path(collection);
        match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| PersistenceError::Decode {
                what: path.display().to_string(),
                source,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(source) => Err(PersistenceError::Io { path, source }),
        }
    }
}

#[async_trait]
impl DocumentStore for JsonFileDocumentStore {
    fn backend(&self) -> &'static str {
        "file"
    }

    async fn append(&self, collection: &str, doc: JsonValue) -> Result<Uuid, PersistenceError> {
        let _guard = self.write_lock.lock().await;
        let mut docs = self.load(collection).await?;
        let id = Uuid::new_v4();
        docs.push(StoredDocument { id, doc });
        let bytes = serde_json::to_vec_pretty(&docs)?;
        write_atomic(&self.collection_path(collection), &bytes).await?;
        Ok(id)
    }

    async fn query(
        &self,
        collection: &str,
        query: &DocumentQuery,
    ) -> Result<Vec<StoredDocument>, PersistenceError> {
        let docs = self.load(collection).await?;
        Ok(query.evaluate(&docs))
    }
}
