//! An in-memory mirror of the user's preferences.
//!
//! The [`SettingsStore`] answers reads synchronously from memory while
//! keeping itself in sync with an external [`KeyValueStore`]. It goes through
//! three states:
//!
//! - **Uninitialized**: only the built-in defaults are known
//! - **Syncing**: a change listener has been attached and the persisted
//!   values are being read. Every caller of [`SettingsStore::initialize()`]
//!   waits on the same read.
//! - **Ready**: the initial read succeeded. Changes reported by the external
//!   store keep flowing into memory from here on.
//! - **Failed**: the initial read failed. The defaults stay in place and
//!   later changes are still picked up, but nothing persisted was loaded.
//!
//! Local writes are queued and reach the external store in the order
//! [`SettingsStore::set()`] was called.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt::{self, Debug, Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

pub use crate::clone_url::Protocol;
use crate::errors::StoreError;
use crate::store::{Changes, KeyValueStore};

/// The preferences we know about.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Preference {
    /// Which [`Protocol`] to clone with.
    Protocol,
}

impl Preference {
    pub const ALL: &'static [Preference] = &[Preference::Protocol];

    pub fn name(&self) -> &'static str {
        match *self {
            Preference::Protocol => "protocol",
        }
    }

    /// The key this preference is persisted under.
    pub fn storage_key(&self) -> &'static str {
        match *self {
            Preference::Protocol => "clone-protocol-preference",
        }
    }

    pub fn default_value(&self) -> &'static str {
        match *self {
            Preference::Protocol => "https",
        }
    }

    pub fn from_storage_key(key: &str) -> Option<Preference> {
        Preference::ALL
            .iter()
            .cloned()
            .find(|pref| pref.storage_key() == key)
    }
}

impl Display for Preference {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where a [`SettingsStore`] is in its lifecycle.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SyncState {
    Uninitialized,
    Syncing,
    Ready,
    Failed,
}

type SyncFuture = Shared<BoxFuture<'static, Result<(), StoreError>>>;

enum Lifecycle {
    Uninitialized,
    Syncing(SyncFuture),
    Ready(Result<(), StoreError>),
}

type Callback = Arc<dyn Fn(&HashMap<Preference, String>) + Send + Sync>;

struct Subscriber {
    id: u64,
    keys: Vec<Preference>,
    callback: Callback,
}

type PendingWrite = (HashMap<String, String>, oneshot::Sender<Result<(), StoreError>>);

struct Inner {
    store: Arc<dyn KeyValueStore>,
    values: RwLock<HashMap<Preference, String>>,
    state: Mutex<Lifecycle>,
    subscribers: Mutex<Vec<Subscriber>>,
    next_subscriber: AtomicU64,
    listener: Mutex<Option<JoinHandle<()>>>,
    writer: Mutex<Option<mpsc::UnboundedSender<PendingWrite>>>,
}

/// A cheaply cloneable handle to the current preferences.
#[derive(Clone)]
pub struct SettingsStore {
    inner: Arc<Inner>,
}

impl SettingsStore {
    /// Create a store which only knows the defaults. Call
    /// [`SettingsStore::initialize()`] to start syncing with `store`.
    pub fn new(store: Arc<dyn KeyValueStore>) -> SettingsStore {
        let values = Preference::ALL
            .iter()
            .map(|pref| (*pref, pref.default_value().to_string()))
            .collect();

        SettingsStore {
            inner: Arc::new(Inner {
                store,
                values: RwLock::new(values),
                state: Mutex::new(Lifecycle::Uninitialized),
                subscribers: Mutex::new(Vec::new()),
                next_subscriber: AtomicU64::new(0),
                listener: Mutex::new(None),
                writer: Mutex::new(None),
            }),
        }
    }

    /// Start syncing with the external store, or wait for the sync that is
    /// already underway.
    ///
    /// The persisted values are only ever read once. Later calls get the
    /// same result, including the same error if that read failed. The
    /// defaults stay in place when it does, so callers may log the error
    /// and carry on.
    pub async fn initialize(&self) -> Result<(), StoreError> {
        let pending = {
            let mut guard = self.inner.state.lock();
            let state: &mut Lifecycle = &mut guard;

            match *state {
                Lifecycle::Ready(ref result) => return result.clone(),
                Lifecycle::Syncing(ref pending) => pending.clone(),
                Lifecycle::Uninitialized => {
                    debug!("Starting the storage sync");
                    let pending = sync(Arc::clone(&self.inner)).boxed().shared();
                    *state = Lifecycle::Syncing(pending.clone());
                    pending
                }
            }
        };

        let result = pending.await;

        let mut state = self.inner.state.lock();
        if let Lifecycle::Syncing(_) = *state {
            *state = Lifecycle::Ready(result.clone());
        }

        result
    }

    pub fn state(&self) -> SyncState {
        match *self.inner.state.lock() {
            Lifecycle::Uninitialized => SyncState::Uninitialized,
            Lifecycle::Syncing(_) => SyncState::Syncing,
            Lifecycle::Ready(Ok(())) => SyncState::Ready,
            Lifecycle::Ready(Err(_)) => SyncState::Failed,
        }
    }

    /// The current value of a preference.
    pub fn get(&self, pref: Preference) -> String {
        self.inner
            .values
            .read()
            .get(&pref)
            .cloned()
            .unwrap_or_else(|| pref.default_value().to_string())
    }

    /// The current clone protocol, falling back to the default if the stored
    /// value isn't one we recognise.
    pub fn protocol(&self) -> Protocol {
        let raw = self.get(Preference::Protocol);

        match raw.parse() {
            Ok(protocol) => protocol,
            Err(e) => {
                warn!("{}, using {}", e, Protocol::default());
                Protocol::default()
            }
        }
    }

    /// A copy of every preference's current value.
    pub fn snapshot(&self) -> HashMap<Preference, String> {
        self.inner.values.read().clone()
    }

    /// Update a preference.
    ///
    /// The new value is visible to [`SettingsStore::get()`] immediately. It
    /// is written to the external store in the background, after any
    /// earlier writes; await the returned [`WriteHandle`] to find out
    /// whether that worked, or drop it if you don't care.
    ///
    /// # Panics
    ///
    /// The first call must be made from within a Tokio runtime.
    pub fn set<V: Into<String>>(&self, pref: Preference, value: V) -> WriteHandle {
        let value = value.into();
        let mut items = HashMap::new();
        items.insert(pref.storage_key().to_string(), value.clone());
        let (tx, rx) = oneshot::channel();

        // held while queueing so memory and the queue agree on the order
        let mut writer = self.inner.writer.lock();
        self.inner.values.write().insert(pref, value);

        let queue = writer.get_or_insert_with(|| {
            let (queue, pending) = mpsc::unbounded_channel();
            tokio::spawn(write_in_order(Arc::clone(&self.inner.store), pending));
            queue
        });

        if let Err(mpsc::error::SendError((_, tx))) = queue.send((items, tx)) {
            let _ = tx.send(Err(StoreError::Closed));
        }

        WriteHandle { result: rx }
    }

    pub fn set_protocol(&self, protocol: Protocol) -> WriteHandle {
        self.set(Preference::Protocol, protocol.as_str())
    }

    /// Get told whenever one of `keys` changes in the external store.
    ///
    /// The callback receives only the watched preferences which changed in a
    /// batch and is skipped when none of them did. An empty `keys` watches
    /// every preference.
    pub fn subscribe<F>(&self, keys: &[Preference], callback: F) -> Subscription
    where
        F: Fn(&HashMap<Preference, String>) + Send + Sync + 'static,
    {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::SeqCst);
        let keys = if keys.is_empty() {
            Preference::ALL.to_vec()
        } else {
            keys.to_vec()
        };

        self.inner.subscribers.lock().push(Subscriber {
            id,
            keys,
            callback: Arc::new(callback),
        });

        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl Debug for SettingsStore {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("SettingsStore")
            .field("state", &self.state())
            .field("values", &self.snapshot())
            .finish()
    }
}

/// Attach the change listener, then read what has already been persisted.
async fn sync(inner: Arc<Inner>) -> Result<(), StoreError> {
    // listen first so nothing written during the read is lost
    let changes = inner.store.changes();
    let result = inner.store.get_all().await;

    match result {
        Ok(ref persisted) => {
            inner.apply_persisted(persisted);
            debug!("storage.ready {:?}", *inner.values.read());
        }
        Err(ref e) => warn!("Unable to read the stored preferences, {}", e),
    }

    let listener = tokio::spawn(listen(Arc::downgrade(&inner), changes));
    *inner.listener.lock() = Some(listener);

    result.map(|_| ())
}

async fn write_in_order(
    store: Arc<dyn KeyValueStore>,
    mut pending: mpsc::UnboundedReceiver<PendingWrite>,
) {
    while let Some((items, done)) = pending.recv().await {
        let result = store.set(items).await;

        if let Err(ref e) = result {
            warn!("Unable to persist a preference, {}", e);
        }

        // the caller may have dropped its handle
        let _ = done.send(result);
    }
}

async fn listen(inner: Weak<Inner>, mut changes: broadcast::Receiver<Changes>) {
    loop {
        let batch = match changes.recv().await {
            Ok(batch) => batch,
            Err(RecvError::Lagged(missed)) => {
                warn!("Missed {} batches of storage changes, re-reading", missed);

                if let Some(inner) = inner.upgrade() {
                    match inner.store.get_all().await {
                        Ok(persisted) => inner.replace_persisted(&persisted),
                        Err(e) => warn!("Unable to re-read the stored preferences, {}", e),
                    }
                }
                continue;
            }
            Err(RecvError::Closed) => {
                debug!("The store stopped sending change notifications");
                return;
            }
        };

        match inner.upgrade() {
            Some(inner) => inner.apply_changes(&batch),
            None => return,
        }
    }
}

impl Inner {
    fn apply_persisted(&self, persisted: &HashMap<String, String>) {
        let mut values = self.values.write();

        for (key, value) in persisted {
            if let Some(pref) = Preference::from_storage_key(key) {
                values.insert(pref, value.clone());
            }
        }
    }

    /// Like [`Inner::apply_persisted()`], except preferences which are no
    /// longer persisted go back to their defaults.
    fn replace_persisted(&self, persisted: &HashMap<String, String>) {
        {
            let mut values = self.values.write();
            for pref in Preference::ALL {
                values.insert(*pref, pref.default_value().to_string());
            }
        }

        self.apply_persisted(persisted);
    }

    fn apply_changes(&self, batch: &Changes) {
        let mut updated = HashMap::new();

        {
            let mut values = self.values.write();
            let before = values.clone();

            for (key, change) in batch {
                let pref = match Preference::from_storage_key(key) {
                    Some(pref) => pref,
                    None => continue,
                };

                match change.new_value {
                    Some(ref value) => {
                        values.insert(pref, value.clone());
                        updated.insert(pref, value.clone());
                    }
                    None => {
                        values.insert(pref, pref.default_value().to_string());
                    }
                }
            }

            debug!("storage.updated: before={:?} after={:?}", before, *values);
        }

        self.notify_subscribers(&updated);
    }

    fn notify_subscribers(&self, updated: &HashMap<Preference, String>) {
        if updated.is_empty() {
            return;
        }

        // callbacks run without the lock held so they can (un)subscribe
        let interested: Vec<_> = self
            .subscribers
            .lock()
            .iter()
            .map(|sub| (sub.keys.clone(), Arc::clone(&sub.callback)))
            .collect();

        for (keys, callback) in interested {
            let relevant: HashMap<Preference, String> = updated
                .iter()
                .filter(|&(pref, _)| keys.contains(pref))
                .map(|(pref, value)| (*pref, value.clone()))
                .collect();

            if !relevant.is_empty() {
                callback(&relevant);
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().take() {
            listener.abort();
        }
    }
}

/// A registered interest in preference changes.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    inner: Weak<Inner>,
}

impl Subscription {
    /// Stop receiving notifications. Other subscriptions are unaffected.
    pub fn unsubscribe(self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.subscribers.lock().retain(|sub| sub.id != self.id);
        }
    }
}

/// The background write started by [`SettingsStore::set()`].
///
/// Dropping the handle doesn't cancel the write.
#[derive(Debug)]
pub struct WriteHandle {
    result: oneshot::Receiver<Result<(), StoreError>>,
}

impl Future for WriteHandle {
    type Output = Result<(), StoreError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        match Pin::new(&mut self.result).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(StoreError::Closed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const PROTOCOL_KEY: &str = "clone-protocol-preference";

    fn items(key: &str, value: &str) -> HashMap<String, String> {
        let mut items = HashMap::new();
        items.insert(key.to_string(), value.to_string());
        items
    }

    fn settings_for(store: &MemoryStore) -> SettingsStore {
        SettingsStore::new(Arc::new(store.clone()))
    }

    async fn eventually<F: Fn() -> bool>(condition: F) {
        let wait = async {
            while !condition() {
                tokio::task::yield_now().await;
            }
        };

        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("Condition was never met");
    }

    #[test]
    fn storage_keys_map_back_to_preferences() {
        assert_eq!(
            Preference::from_storage_key(PROTOCOL_KEY),
            Some(Preference::Protocol)
        );
        assert_eq!(Preference::from_storage_key("protocol"), None);
    }

    #[tokio::test]
    async fn defaults_before_initializing() {
        let settings = settings_for(&MemoryStore::new());

        assert_eq!(settings.state(), SyncState::Uninitialized);
        assert_eq!(settings.get(Preference::Protocol), "https");
        assert_eq!(settings.protocol(), Protocol::Https);
    }

    #[tokio::test]
    async fn initializing_loads_persisted_values() {
        let mut persisted = items(PROTOCOL_KEY, "ssh");
        persisted.insert(String::from("some-other-extension"), String::from("x"));
        let store = MemoryStore::with_values(persisted);
        let settings = settings_for(&store);

        settings.initialize().await.unwrap();

        assert_eq!(settings.state(), SyncState::Ready);
        assert_eq!(settings.protocol(), Protocol::Ssh);
        assert_eq!(settings.snapshot().len(), Preference::ALL.len());
    }

    #[tokio::test]
    async fn concurrent_initializers_share_one_read() {
        let store = MemoryStore::new();
        store.close_read_gate();
        let settings = settings_for(&store);

        let (a, b, c, _) = tokio::join!(
            settings.initialize(),
            settings.initialize(),
            settings.initialize(),
            async {
                eventually(|| store.read_count() > 0).await;
                assert_eq!(settings.state(), SyncState::Syncing);
                store.open_read_gate();
            }
        );

        assert_eq!(a, Ok(()));
        assert_eq!(b, Ok(()));
        assert_eq!(c, Ok(()));
        assert_eq!(store.read_count(), 1);

        settings.initialize().await.unwrap();
        assert_eq!(store.read_count(), 1);
        assert_eq!(settings.state(), SyncState::Ready);
    }

    #[tokio::test]
    async fn a_failed_read_is_reported_to_everyone_and_never_retried() {
        let store = MemoryStore::with_values(items(PROTOCOL_KEY, "ssh"));
        store.fail_reads(true);
        let settings = settings_for(&store);

        let first = settings.initialize().await;
        store.fail_reads(false);
        let second = settings.initialize().await;

        assert!(first.is_err());
        assert_eq!(first, second);
        assert_eq!(store.read_count(), 1);
        assert_eq!(settings.state(), SyncState::Failed);
        assert_eq!(settings.protocol(), Protocol::Https);

        // the listener is still attached
        store.set(items(PROTOCOL_KEY, "ssh")).await.unwrap();
        eventually(|| settings.protocol() == Protocol::Ssh).await;
    }

    #[tokio::test]
    async fn local_writes_are_visible_immediately() {
        let store = MemoryStore::new();
        let settings = settings_for(&store);
        settings.initialize().await.unwrap();

        let write = settings.set(Preference::Protocol, "ssh");
        assert_eq!(settings.get(Preference::Protocol), "ssh");

        write.await.unwrap();
        assert_eq!(store.value(PROTOCOL_KEY).unwrap(), "ssh");
    }

    #[tokio::test]
    async fn a_change_made_during_the_initial_read_wins() {
        let store = MemoryStore::with_values(items(PROTOCOL_KEY, "https"));
        store.close_read_gate();
        let settings = settings_for(&store);

        let (result, _) = tokio::join!(settings.initialize(), async {
            eventually(|| store.read_count() > 0).await;
            store.set(items(PROTOCOL_KEY, "ssh")).await.unwrap();
            store.open_read_gate();
        });

        result.unwrap();
        eventually(|| settings.protocol() == Protocol::Ssh).await;
        assert_eq!(store.value(PROTOCOL_KEY).unwrap(), "ssh");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn the_last_write_is_the_one_that_sticks() {
        for _ in 0..50 {
            let store = MemoryStore::new();
            let settings = settings_for(&store);
            settings.initialize().await.unwrap();

            let writes: Vec<_> = (0..20)
                .map(|i| {
                    let value = if i % 2 == 0 { "ssh" } else { "https" };
                    settings.set(Preference::Protocol, value)
                })
                .collect();

            for write in writes {
                write.await.unwrap();
            }

            assert_eq!(store.value(PROTOCOL_KEY).unwrap(), "https");
            assert_eq!(store.write_count(), 20);
            eventually(|| settings.protocol() == Protocol::Https).await;
        }
    }

    #[tokio::test]
    async fn failed_writes_keep_the_local_value() {
        let store = MemoryStore::new();
        store.fail_writes(true);
        let settings = settings_for(&store);
        settings.initialize().await.unwrap();

        let result = settings.set_protocol(Protocol::Ssh).await;

        assert_eq!(
            result,
            Err(StoreError::Write(String::from("writes are disabled")))
        );
        assert_eq!(settings.protocol(), Protocol::Ssh);
        assert!(store.value(PROTOCOL_KEY).is_none());
    }

    #[tokio::test]
    async fn dropped_write_handles_still_write() {
        let store = MemoryStore::new();
        let settings = settings_for(&store);
        settings.initialize().await.unwrap();

        drop(settings.set_protocol(Protocol::Ssh));

        eventually(|| store.value(PROTOCOL_KEY).is_some()).await;
        assert_eq!(store.value(PROTOCOL_KEY).unwrap(), "ssh");
    }

    #[tokio::test]
    async fn subscribers_only_see_the_keys_they_watch() {
        let store = MemoryStore::new();
        let settings = settings_for(&store);
        settings.initialize().await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _sub = settings.subscribe(&[Preference::Protocol], move |changed| {
            let _ = tx.send(changed.clone());
        });

        store.set(items("unrelated", "value")).await.unwrap();
        store.set(items(PROTOCOL_KEY, "ssh")).await.unwrap();

        let got = rx.recv().await.unwrap();
        let mut should_be = HashMap::new();
        should_be.insert(Preference::Protocol, String::from("ssh"));
        assert_eq!(got, should_be);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn local_writes_come_back_as_notifications() {
        let store = MemoryStore::new();
        let settings = settings_for(&store);
        settings.initialize().await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _sub = settings.subscribe(&[], move |changed| {
            let _ = tx.send(changed[&Preference::Protocol].clone());
        });
        let _ = settings.set_protocol(Protocol::Ssh);

        assert_eq!(rx.recv().await.unwrap(), "ssh");
    }

    #[tokio::test]
    async fn unsubscribing_leaves_other_subscriptions_alone() {
        let store = MemoryStore::new();
        let settings = settings_for(&store);
        settings.initialize().await.unwrap();

        let dropped_calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&dropped_calls);
        let first = settings.subscribe(&[Preference::Protocol], move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _second = settings.subscribe(&[Preference::Protocol], move |changed| {
            let _ = tx.send(changed.clone());
        });

        first.unsubscribe();
        store.set(items(PROTOCOL_KEY, "ssh")).await.unwrap();

        rx.recv().await.unwrap();
        assert_eq!(dropped_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn removed_keys_fall_back_to_the_default() {
        let store = MemoryStore::with_values(items(PROTOCOL_KEY, "ssh"));
        let settings = settings_for(&store);
        settings.initialize().await.unwrap();
        assert_eq!(settings.protocol(), Protocol::Ssh);

        store.remove(PROTOCOL_KEY);

        eventually(|| settings.protocol() == Protocol::Https).await;
    }

    #[tokio::test]
    async fn catching_up_after_missed_notifications_drops_removed_keys() {
        let store = MemoryStore::with_values(items(PROTOCOL_KEY, "ssh"));
        let settings = settings_for(&store);
        settings.initialize().await.unwrap();
        assert_eq!(settings.protocol(), Protocol::Ssh);

        // the listener doesn't get to run until we yield, so the removal
        // gets pushed out of the notification buffer
        store.remove(PROTOCOL_KEY);
        for i in 0..100 {
            store.set(items("noise", &i.to_string())).await.unwrap();
        }

        eventually(|| settings.protocol() == Protocol::Https).await;
        assert_eq!(store.read_count(), 2);
    }

    #[tokio::test]
    async fn unrecognised_protocols_fall_back_to_the_default() {
        let store = MemoryStore::with_values(items(PROTOCOL_KEY, "carrier-pigeon"));
        let settings = settings_for(&store);
        settings.initialize().await.unwrap();

        assert_eq!(settings.get(Preference::Protocol), "carrier-pigeon");
        assert_eq!(settings.protocol(), Protocol::Https);
    }
}
