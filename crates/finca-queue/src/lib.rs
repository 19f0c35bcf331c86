//! Durable offline write queue.
//!
//! Writes that cannot reach the backend are kept per operation type in a
//! [`KeyValueStore`] and replayed through the registered handler when
//! connectivity returns. Delivery is at-least-once: an item is removed only
//! after its handler returns `Ok`, and a failing item blocks every later item
//! of the same type until it succeeds.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use finca_core::{PriceReading, QueuedOperation};
use finca_storage::{KeyValueStore, PersistenceError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "finca-queue";

/// Namespace for queue records inside shared local storage.
pub const KEY_PREFIX: &str = "finca-queue:";

pub const PRICE_WRITE: &str = "price-write";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue storage: {0}")]
    Storage(#[from] PersistenceError),
    #[error("encoding queued `{op_type}` payload: {source}")]
    Encode {
        op_type: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("queue record for `{op_type}` is unreadable: {source}")]
    Corrupt {
        op_type: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Failure reported by a handler while replaying an operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct QueueHandlerError {
    pub message: String,
}

impl QueueHandlerError {
    pub fn new(message: impl std::fmt::Display) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

#[async_trait]
pub trait QueueHandler: Send + Sync {
    async fn handle(&self, op: &QueuedOperation) -> Result<(), QueueHandlerError>;
}

/// Adapts an async closure over the whole operation.
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> QueueHandler for FnHandler<F>
where
    F: Fn(QueuedOperation) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), QueueHandlerError>> + Send,
{
    async fn handle(&self, op: &QueuedOperation) -> Result<(), QueueHandlerError> {
        (self.f)(op.clone()).await
    }
}

/// A payload type bound to one operation tag.
pub trait QueueOperation: Serialize + DeserializeOwned {
    const TYPE: &'static str;
}

impl QueueOperation for PriceReading {
    const TYPE: &'static str = PRICE_WRITE;
}

/// Decodes the payload into `T` before calling the closure. A payload that no
/// longer decodes is a handler failure, so the item stays queued.
pub struct TypedHandler<T, F> {
    f: F,
    _payload: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T, F, Fut> QueueHandler for TypedHandler<T, F>
where
    T: QueueOperation + Send + 'static,
    F: Fn(Uuid, T) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), QueueHandlerError>> + Send,
{
    async fn handle(&self, op: &QueuedOperation) -> Result<(), QueueHandlerError> {
        let payload = serde_json::from_value::<T>(op.payload.clone()).map_err(|err| {
            QueueHandlerError::new(format!("payload does not decode as `{}`: {err}", T::TYPE))
        })?;
        (self.f)(op.op_id, payload).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Connectivity {
    Online,
    Offline,
    Syncing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub connectivity: Connectivity,
    pub pending: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainFailure {
    pub op_type: String,
    /// `None` when the stored list itself could not be read.
    pub op_id: Option<Uuid>,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub failures: Vec<DrainFailure>,
    pub remaining: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Written(QueuedOperation),
    Queued(QueuedOperation),
}

impl SubmitOutcome {
    pub fn operation(&self) -> &QueuedOperation {
        match self {
            SubmitOutcome::Written(op) | SubmitOutcome::Queued(op) => op,
        }
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, SubmitOutcome::Queued(_))
    }
}

/// What is persisted per item; the type lives in the record key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredEntry {
    op_id: Uuid,
    payload: JsonValue,
    enqueued_at: DateTime<Utc>,
}

#[derive(Default)]
struct TypeSlot {
    /// Guards the read-modify-write of the stored list.
    list: Mutex<()>,
    /// Keeps two drains of the same type from interleaving.
    drain: Mutex<()>,
}

pub struct OfflineQueue {
    storage: Arc<dyn KeyValueStore>,
    handlers: parking_lot::RwLock<BTreeMap<String, Arc<dyn QueueHandler>>>,
    slots: parking_lot::Mutex<HashMap<String, Arc<TypeSlot>>>,
    status: watch::Sender<QueueStatus>,
}

impl OfflineQueue {
    /// Opens the queue over `storage`, starting online with the pending count
    /// already on disk.
    pub async fn open(storage: Arc<dyn KeyValueStore>) -> Result<Self, QueueError> {
        let (status, _) = watch::channel(QueueStatus {
            connectivity: Connectivity::Online,
            pending: 0,
        });
        let queue = Self {
            storage,
            handlers: parking_lot::RwLock::new(BTreeMap::new()),
            slots: parking_lot::Mutex::new(HashMap::new()),
            status,
        };
        queue.refresh_pending().await?;
        Ok(queue)
    }

    /// One handler per type; registering again replaces the previous one.
    pub fn register(&self, op_type: impl Into<String>, handler: Arc<dyn QueueHandler>) {
        let op_type = op_type.into();
        if self.handlers.write().insert(op_type.clone(), handler).is_some() {
            info!(op_type = %op_type, "queue handler replaced");
        } else {
            debug!(op_type = %op_type, "queue handler registered");
        }
    }

    pub fn register_fn<F, Fut>(&self, op_type: impl Into<String>, f: F)
    where
        F: Fn(QueuedOperation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), QueueHandlerError>> + Send + 'static,
    {
        self.register(op_type, Arc::new(FnHandler::new(f)));
    }

    pub fn register_typed<T, F, Fut>(&self, f: F)
    where
        T: QueueOperation + Send + 'static,
        F: Fn(Uuid, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), QueueHandlerError>> + Send + 'static,
    {
        let handler = TypedHandler::<T, F> {
            f,
            _payload: PhantomData,
        };
        self.register(T::TYPE, Arc::new(handler));
    }

    pub fn has_handler(&self, op_type: &str) -> bool {
        self.handlers.read().contains_key(op_type)
    }

    /// Appends to the type's list. A storage failure is returned, never dropped.
    pub async fn enqueue(&self, op_type: &str, payload: JsonValue) -> Result<QueuedOperation, QueueError> {
        let op = QueuedOperation {
            op_id: Uuid::new_v4(),
            op_type: op_type.to_string(),
            payload,
            enqueued_at: Utc::now(),
        };
        self.push(&op).await?;
        Ok(op)
    }

    pub async fn enqueue_typed<T: QueueOperation>(&self, payload: &T) -> Result<QueuedOperation, QueueError> {
        self.enqueue(T::TYPE, encode::<T>(payload)?).await
    }

    /// Writes directly when online, the handler exists and nothing of this type
    /// is waiting ahead; otherwise, or when the direct write fails, enqueues.
    pub async fn submit(&self, op_type: &str, payload: JsonValue) -> Result<SubmitOutcome, QueueError> {
        let op = QueuedOperation {
            op_id: Uuid::new_v4(),
            op_type: op_type.to_string(),
            payload,
            enqueued_at: Utc::now(),
        };

        let online = self.status().connectivity != Connectivity::Offline;
        let handler = self.handlers.read().get(op_type).cloned();
        if let (true, Some(handler)) = (online, handler) {
            if self.load(op_type).await?.is_empty() {
                match handler.handle(&op).await {
                    Ok(()) => return Ok(SubmitOutcome::Written(op)),
                    Err(err) => warn!(op_type, op_id = %op.op_id, error = %err, "direct write failed; queueing"),
                }
            }
        }

        self.push(&op).await?;
        Ok(SubmitOutcome::Queued(op))
    }

    pub async fn submit_typed<T: QueueOperation>(&self, payload: &T) -> Result<SubmitOutcome, QueueError> {
        self.submit(T::TYPE, encode::<T>(payload)?).await
    }

    /// Pending operations of one type, oldest first.
    pub async fn pending(&self, op_type: &str) -> Result<Vec<QueuedOperation>, QueueError> {
        self.load(op_type).await
    }

    /// Sum of all per-type queue lengths.
    pub async fn pending_count(&self) -> Result<usize, QueueError> {
        Ok(self.pending_by_type().await?.values().sum())
    }

    /// Per-type queue lengths. Unreadable records are logged and left out so
    /// one damaged type cannot hide the others.
    pub async fn pending_by_type(&self) -> Result<BTreeMap<String, usize>, QueueError> {
        let mut counts = BTreeMap::new();
        for key in self.storage.keys_with_prefix(KEY_PREFIX).await? {
            let op_type = &key[KEY_PREFIX.len()..];
            let len = match self.load(op_type).await {
                Ok(items) => items.len(),
                Err(err @ QueueError::Corrupt { .. }) => {
                    warn!(op_type, error = %err, "skipping unreadable queue record");
                    continue;
                }
                Err(err) => return Err(err),
            };
            if len > 0 {
                counts.insert(op_type.to_string(), len);
            }
        }
        Ok(counts)
    }

    /// Drains every registered type in turn. Types without a handler keep their
    /// items, and a type whose record is unreadable is reported as blocked.
    pub async fn drain_all(&self) -> Result<DrainReport, QueueError> {
        let handlers: Vec<(String, Arc<dyn QueueHandler>)> = self
            .handlers
            .read()
            .iter()
            .map(|(op_type, handler)| (op_type.clone(), handler.clone()))
            .collect();

        let mut report = DrainReport::default();
        for (op_type, handler) in handlers {
            match self.drain_type(&op_type, handler.as_ref()).await {
                Ok((delivered, failure)) => {
                    report.delivered += delivered;
                    report.failures.extend(failure);
                }
                Err(err @ QueueError::Corrupt { .. }) => {
                    warn!(op_type = %op_type, error = %err, "queue record unreadable; type blocked");
                    report.failures.push(DrainFailure {
                        op_type,
                        op_id: None,
                        error: err.to_string(),
                    });
                }
                Err(err) => return Err(err),
            }
        }
        report.remaining = self.refresh_pending().await?;
        info!(
            delivered = report.delivered,
            blocked_types = report.failures.len(),
            remaining = report.remaining,
            "offline queue drained"
        );
        Ok(report)
    }

    async fn drain_type(
        &self,
        op_type: &str,
        handler: &dyn QueueHandler,
    ) -> Result<(usize, Option<DrainFailure>), QueueError> {
        let slot = self.slot(op_type);
        let _draining = slot.drain.lock().await;
        let mut delivered = 0;

        loop {
            let head = {
                let _list = slot.list.lock().await;
                self.load(op_type).await?.into_iter().next()
            };
            let Some(op) = head else {
                return Ok((delivered, None));
            };

            if let Err(err) = handler.handle(&op).await {
                warn!(op_type, op_id = %op.op_id, error = %err, "queued operation failed; type blocked until next drain");
                return Ok((
                    delivered,
                    Some(DrainFailure {
                        op_type: op_type.to_string(),
                        op_id: Some(op.op_id),
                        error: err.message,
                    }),
                ));
            }

            {
                let _list = slot.list.lock().await;
                let mut items = self.load(op_type).await?;
                if let Some(pos) = items.iter().position(|item| item.op_id == op.op_id) {
                    items.remove(pos);
                }
                self.save(op_type, &items).await?;
            }
            delivered += 1;
            self.refresh_pending().await?;
        }
    }

    pub fn status(&self) -> QueueStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<QueueStatus> {
        self.status.subscribe()
    }

    /// Connectivity came back: mark syncing, drain, then mark online.
    pub async fn set_online(&self) -> Result<DrainReport, QueueError> {
        self.set_connectivity(Connectivity::Syncing);
        let result = self.drain_all().await;
        self.set_connectivity(Connectivity::Online);
        result
    }

    /// Only flips the indicator; nothing is flushed while offline.
    pub fn set_offline(&self) {
        self.set_connectivity(Connectivity::Offline);
    }

    fn set_connectivity(&self, connectivity: Connectivity) {
        self.status.send_modify(|status| status.connectivity = connectivity);
    }

    async fn refresh_pending(&self) -> Result<usize, QueueError> {
        let pending = self.pending_count().await?;
        self.status.send_modify(|status| status.pending = pending);
        Ok(pending)
    }

    async fn push(&self, op: &QueuedOperation) -> Result<(), QueueError> {
        let slot = self.slot(&op.op_type);
        {
            let _list = slot.list.lock().await;
            let mut items = self.load(&op.op_type).await?;
            items.push(op.clone());
            self.save(&op.op_type, &items).await?;
        }
        let pending = self.refresh_pending().await?;
        info!(op_type = %op.op_type, op_id = %op.op_id, pending, "operation queued");
        Ok(())
    }

    fn slot(&self, op_type: &str) -> Arc<TypeSlot> {
        self.slots
            .lock()
            .entry(op_type.to_string())
            .or_default()
            .clone()
    }

    async fn load(&self, op_type: &str) -> Result<Vec<QueuedOperation>, QueueError> {
        let Some(bytes) = self.storage.get(&storage_key(op_type)).await? else {
            return Ok(Vec::new());
        };
        let entries: Vec<StoredEntry> = serde_json::from_slice(&bytes).map_err(|source| QueueError::Corrupt {
            op_type: op_type.to_string(),
            source,
        })?;
        Ok(entries
            .into_iter()
            .map(|entry| QueuedOperation {
                op_id: entry.op_id,
                op_type: op_type.to_string(),
                payload: entry.payload,
                enqueued_at: entry.enqueued_at,
            })
            .collect())
    }

    async fn save(&self, op_type: &str, items: &[QueuedOperation]) -> Result<(), QueueError> {
        let key = storage_key(op_type);
        if items.is_empty() {
            self.storage.remove(&key).await?;
            return Ok(());
        }
        let entries: Vec<StoredEntry> = items
            .iter()
            .map(|op| StoredEntry {
                op_id: op.op_id,
                payload: op.payload.clone(),
                enqueued_at: op.enqueued_at,
            })
            .collect();
        let bytes = serde_json::to_vec(&entries).map_err(|source| QueueError::Encode {
            op_type: op_type.to_string(),
            source,
        })?;
        self.storage.put(&key, &bytes).await?;
        Ok(())
    }
}

fn storage_key(op_type: &str) -> String {
    format!("{KEY_PREFIX}{op_type}")
}

fn encode<T: QueueOperation>(payload: &T) -> Result<JsonValue, QueueError> {
    serde_json::to_value(payload).map_err(|source| QueueError::Encode {
        op_type: T::TYPE.to_string(),
        source,
    })
}
