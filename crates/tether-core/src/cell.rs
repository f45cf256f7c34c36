//! Coordinated state cell: a single-writer document with change notifications.
//!
//! Mutations are admitted one at a time in arrival order (tokio's mutex is
//! fair). Each mutation runs on a copy of the document; only a copy that
//! differs from the current value is persisted, committed and published, and
//! the next mutation waits until all of that has finished.
//!
//! The published payload is the whole new document, and its message id
//! becomes the cell's counter, so [`StateCell::snapshot`] always pairs a
//! document with the id of the notification that produced it.

use crate::persist::{read_json, write_json_atomic};
use crate::pubsub::{Snapshot, Topic};
use crate::{Result, TetherError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Durable storage behind a cell.
#[async_trait::async_trait]
pub trait CellStore<T>: Send + Sync + 'static {
    /// The persisted document, if any.
    async fn load(&self) -> Result<Option<T>>;

    async fn persist(&self, value: &T) -> Result<()>;
}

/// Destination of a cell's change notifications.
pub trait CellPublisher: Send + Sync + 'static {
    /// Publish `data` and return its message id.
    fn publish(&self, data: Value) -> Result<u64>;

    /// Id of the last published message.
    fn counter(&self) -> u64 {
        0
    }
}

impl CellPublisher for Topic {
    fn publish(&self, data: Value) -> Result<u64> {
        Topic::publish(self, data)
    }

    fn counter(&self) -> u64 {
        Topic::counter(self)
    }
}

/// [`CellStore`] writing the document to one JSON file.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl<T> CellStore<T> for JsonFileStore
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn load(&self) -> Result<Option<T>> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || read_json::<T>(&path))
            .await
            .map_err(|e| TetherError::Other(format!("load task failed: {}", e)))?
    }

    async fn persist(&self, value: &T) -> Result<()> {
        let path = self.path.clone();
        let value = serde_json::to_value(value)?;
        tokio::task::spawn_blocking(move || write_json_atomic(&path, &value))
            .await
            .map_err(|e| TetherError::Other(format!("persist task failed: {}", e)))?
    }
}

/// In-memory [`CellStore`], mostly for tests.
pub struct MemoryStore<T> {
    value: std::sync::Mutex<Option<T>>,
    writes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl<T> Default for MemoryStore<T> {
    fn default() -> Self {
        Self {
            value: std::sync::Mutex::new(None),
            writes: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
        }
    }
}

impl<T: Clone> MemoryStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(value: T) -> Self {
        let store = Self::default();
        *store.lock() = Some(value);
        store
    }

    /// Number of successful persists.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn stored(&self) -> Option<T> {
        self.lock().clone()
    }

    /// Make subsequent persists fail.
    pub fn set_failing(&self, failing: bool) {
        self.fail_writes.store(failing, Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<T>> {
        self.value
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait::async_trait]
impl<T> CellStore<T> for Arc<MemoryStore<T>>
where
    T: Clone + Send + Sync + 'static,
{
    async fn load(&self) -> Result<Option<T>> {
        Ok(self.stored())
    }

    async fn persist(&self, value: &T) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TetherError::Io {
                message: "memory store is failing writes".to_string(),
                path: None,
                source: None,
            });
        }
        *self.lock() = Some(value.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct CellInner<T> {
    value: T,
    counter: u64,
}

/// Single-writer document that persists and publishes every effective change.
pub struct StateCell<T> {
    inner: Mutex<CellInner<T>>,
    store: Box<dyn CellStore<T>>,
    publisher: Arc<dyn CellPublisher>,
}

impl<T> StateCell<T>
where
    T: Clone + PartialEq + Serialize + Send + Sync + 'static,
{
    /// Load the persisted document, or start from `default`.
    pub async fn open(
        store: impl CellStore<T>,
        publisher: Arc<dyn CellPublisher>,
        default: T,
    ) -> Result<Self> {
        let value = store.load().await?.unwrap_or(default);
        let counter = publisher.counter();
        Ok(Self {
            inner: Mutex::new(CellInner { value, counter }),
            store: Box::new(store),
            publisher,
        })
    }

    /// Apply `f` to a copy of the document.
    ///
    /// Returns whether the document changed. A failed persist leaves the
    /// document untouched; a failed publish is logged and the change still
    /// commits.
    pub async fn mutate<F>(&self, f: F) -> Result<bool>
    where
        F: FnOnce(&mut T) + Send,
    {
        let mut inner = self.inner.lock().await;

        let mut draft = inner.value.clone();
        f(&mut draft);
        if draft == inner.value {
            debug!("Mutation left the document unchanged");
            return Ok(false);
        }

        let payload = serde_json::to_value(&draft)?;
        self.store.persist(&draft).await?;

        match self.publisher.publish(payload) {
            Ok(message_id) => inner.counter = message_id,
            Err(e) => warn!("Failed to publish document change: {}", e),
        }
        inner.value = draft;
        Ok(true)
    }

    /// The document and the id of the last notification it reflects.
    pub async fn snapshot(&self) -> Snapshot<T> {
        let inner = self.inner.lock().await;
        Snapshot {
            state: inner.value.clone(),
            counter: inner.counter,
        }
    }

    /// A copy of the current document.
    pub async fn read(&self) -> T {
        self.inner.lock().await.value.clone()
    }
}
