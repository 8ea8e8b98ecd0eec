//! The external key-value store preferences are persisted in.
//!
//! The store is asynchronous and eventually consistent. Besides reading and
//! writing it hands out a stream of change batches, which is how the
//! [`SettingsStore`](crate::settings::SettingsStore) learns about writes made
//! by itself or by anyone else.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

use crate::errors::StoreError;

/// How many change batches a slow listener may fall behind by.
const CHANGE_BUFFER: usize = 64;

/// A batch of changes, keyed by the store's own key names.
pub type Changes = HashMap<String, StorageChange>;

/// What happened to a single key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageChange {
    pub old_value: Option<String>,
    /// `None` when the key was removed.
    pub new_value: Option<String>,
}

/// An asynchronous key-value store which can notify us of changes.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read every persisted key/value pair.
    async fn get_all(&self) -> Result<HashMap<String, String>, StoreError>;

    /// Persist some key/value pairs.
    async fn set(&self, items: HashMap<String, String>) -> Result<(), StoreError>;

    /// Start listening for changes.
    ///
    /// Every batch emitted after this returns is buffered in the receiver,
    /// so nothing is missed between subscribing and reading.
    fn changes(&self) -> broadcast::Receiver<Changes>;
}

/// Work out which keys a write actually changes.
fn diff(current: &mut HashMap<String, String>, items: HashMap<String, String>) -> Changes {
    let mut changes = Changes::new();

    for (key, value) in items {
        let old_value = current.insert(key.clone(), value.clone());

        if old_value.as_ref() != Some(&value) {
            changes.insert(
                key,
                StorageChange {
                    old_value,
                    new_value: Some(value),
                },
            );
        }
    }

    changes
}

fn notify(tx: &broadcast::Sender<Changes>, changes: Changes) {
    if changes.is_empty() {
        return;
    }

    // an error only means nobody is listening
    let _ = tx.send(changes);
}

/// An in-memory store, useful for testing and for callers which don't need
/// anything to survive a restart.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

#[derive(Debug)]
struct MemoryInner {
    values: Mutex<HashMap<String, String>>,
    tx: broadcast::Sender<Changes>,
    reads: AtomicUsize,
    writes: AtomicUsize,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    read_gate: Mutex<Option<watch::Receiver<bool>>>,
    gate_opener: Mutex<Option<watch::Sender<bool>>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::with_values(HashMap::new())
    }

    pub fn with_values(values: HashMap<String, String>) -> MemoryStore {
        let (tx, _) = broadcast::channel(CHANGE_BUFFER);

        MemoryStore {
            inner: Arc::new(MemoryInner {
                values: Mutex::new(values),
                tx,
                reads: AtomicUsize::new(0),
                writes: AtomicUsize::new(0),
                fail_reads: AtomicBool::new(false),
                fail_writes: AtomicBool::new(false),
                read_gate: Mutex::new(None),
                gate_opener: Mutex::new(None),
            }),
        }
    }

    /// How many times [`KeyValueStore::get_all()`] has been called.
    pub fn read_count(&self) -> usize {
        self.inner.reads.load(Ordering::SeqCst)
    }

    /// How many times [`KeyValueStore::set()`] has been called.
    pub fn write_count(&self) -> usize {
        self.inner.writes.load(Ordering::SeqCst)
    }

    /// Make every subsequent read fail.
    pub fn fail_reads(&self, fail: bool) {
        self.inner.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent write fail.
    pub fn fail_writes(&self, fail: bool) {
        self.inner.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Hold all reads until [`MemoryStore::open_read_gate()`] is called.
    ///
    /// A held read still returns the values as they were when it started,
    /// the same as a slow read against a real store.
    pub fn close_read_gate(&self) {
        let (tx, rx) = watch::channel(false);
        *self.inner.read_gate.lock() = Some(rx);
        *self.inner.gate_opener.lock() = Some(tx);
    }

    pub fn open_read_gate(&self) {
        if let Some(tx) = self.inner.gate_opener.lock().take() {
            let _ = tx.send(true);
        }
        self.inner.read_gate.lock().take();
    }

    /// Read a value directly, bypassing any failure injection.
    pub fn value(&self, key: &str) -> Option<String> {
        self.inner.values.lock().get(key).cloned()
    }

    /// Delete a key, notifying listeners the same way a write would.
    pub fn remove(&self, key: &str) {
        let old_value = self.inner.values.lock().remove(key);

        if old_value.is_some() {
            let mut changes = Changes::new();
            changes.insert(
                key.to_string(),
                StorageChange {
                    old_value,
                    new_value: None,
                },
            );
            notify(&self.inner.tx, changes);
        }
    }

    async fn wait_for_gate(&self) {
        let gate = self.inner.read_gate.lock().clone();

        if let Some(mut gate) = gate {
            loop {
                let open = *gate.borrow();
                if open || gate.changed().await.is_err() {
                    break;
                }
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> MemoryStore {
        MemoryStore::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get_all(&self) -> Result<HashMap<String, String>, StoreError> {
        self.inner.reads.fetch_add(1, Ordering::SeqCst);
        let values = self.inner.values.lock().clone();
        self.wait_for_gate().await;

        if self.inner.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Read(String::from("reads are disabled")));
        }

        Ok(values)
    }

    async fn set(&self, items: HashMap<String, String>) -> Result<(), StoreError> {
        self.inner.writes.fetch_add(1, Ordering::SeqCst);

        if self.inner.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Write(String::from("writes are disabled")));
        }

        let changes = diff(&mut self.inner.values.lock(), items);
        notify(&self.inner.tx, changes);

        Ok(())
    }

    fn changes(&self) -> broadcast::Receiver<Changes> {
        self.inner.tx.subscribe()
    }
}

/// A store which keeps everything in a single JSON object on disk.
///
/// Only writes made through this handle (or its clones) produce change
/// notifications.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
    tx: broadcast::Sender<Changes>,
}

impl JsonFileStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> JsonFileStore {
        let (tx, _) = broadcast::channel(CHANGE_BUFFER);

        JsonFileStore {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
            tx,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_values(path: &Path) -> Result<HashMap<String, String>, StoreError> {
    let src = match fs::read_to_string(path) {
        Ok(src) => src,
        Err(ref e) if e.kind() == ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => {
            return Err(StoreError::Read(format!(
                "couldn't read {}, {}",
                path.display(),
                e
            )))
        }
    };

    if src.trim().is_empty() {
        return Ok(HashMap::new());
    }

    serde_json::from_str(&src)
        .map_err(|e| StoreError::Read(format!("{} is corrupted, {}", path.display(), e)))
}

fn write_values(path: &Path, values: &HashMap<String, String>) -> Result<(), StoreError> {
    let write_err = |e: &dyn std::fmt::Display| {
        StoreError::Write(format!("couldn't write {}, {}", path.display(), e))
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| write_err(&e))?;
        }
    }

    let json = serde_json::to_string_pretty(values).map_err(|e| write_err(&e))?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, json).map_err(|e| write_err(&e))?;
    fs::rename(&tmp, path).map_err(|e| write_err(&e))?;

    Ok(())
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn get_all(&self) -> Result<HashMap<String, String>, StoreError> {
        let path = self.path.clone();
        let lock = Arc::clone(&self.lock);

        tokio::task::spawn_blocking(move || {
            let _guard = lock.lock();
            read_values(&path)
        })
        .await
        .map_err(|_| StoreError::Closed)?
    }

    async fn set(&self, items: HashMap<String, String>) -> Result<(), StoreError> {
        let path = self.path.clone();
        let lock = Arc::clone(&self.lock);

        let changes = tokio::task::spawn_blocking(move || {
            let _guard = lock.lock();
            let mut values = read_values(&path)?;
            let changes = diff(&mut values, items);

            if !changes.is_empty() {
                write_values(&path, &values)?;
            }

            Ok::<_, StoreError>(changes)
        })
        .await
        .map_err(|_| StoreError::Closed)??;

        debug!("Wrote {} changed keys to {}", changes.len(), self.path.display());
        notify(&self.tx, changes);

        Ok(())
    }

    fn changes(&self) -> broadcast::Receiver<Changes> {
        self.tx.subscribe()
    }
}
