//! JSON files as shared state
//!
//! The file system is reached through the [`FileStorage`] trait so tests can
//! swap the real disk ([`FileSystemStorage`]) for an in-memory map
//! ([`InMemoryFileStorage`]) whose scheduled work runs on demand.
//!
//! Implicit saves (after `with_lock`) are throttled per key: the first write
//! goes to disk immediately, writes within the following window are
//! coalesced into a single write at the end of the window. Explicit saves
//! always write immediately.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::hash::{Hash, Hasher};
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::{self, JoinHandle};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::continuation::{LoadContinuation, SaveContinuation};
use crate::defaults;
use crate::key::{LoadContext, SaveContext, SharedKey, SharedReaderKey, SharedValue};
use crate::subscriber::SharedSubscriber;
use crate::subscription::SharedSubscription;

type OnChange = Arc<dyn Fn() + Send + Sync>;
type Job = Box<dyn FnOnce() + Send>;

/// File system operations used by [`FileStorageKey`]
pub trait FileStorage: Send + Sync {
    fn load(&self, path: &Path) -> io::Result<Vec<u8>>;

    fn save(&self, data: &[u8], path: &Path) -> io::Result<()>;

    /// Call `on_change` whenever the file at `path` changes, appears or
    /// disappears, until the subscription is dropped
    fn watch(&self, path: &Path, on_change: OnChange) -> SharedSubscription;

    /// Run `job` once, after `delay`
    fn schedule(&self, delay: Duration, job: Job);
}

// ============================================================================
// Real file system
// ============================================================================

/// [`FileStorage`] on the local disk
///
/// Watching polls a fingerprint of the file's contents. Inside a tokio runtime
/// the poll loop and delayed writes are runtime tasks, with file access on the
/// blocking pool. Without a runtime each watch gets its own thread.
#[derive(Debug, Clone)]
pub struct FileSystemStorage {
    poll_interval: Duration,
}

/// Length and content hash; `None` when the file cannot be read
type Fingerprint = Option<(u64, u64)>;

fn fingerprint(path: &Path) -> Fingerprint {
    let data = fs::read(path).ok()?;
    let mut hasher = DefaultHasher::new();
    data.hash(&mut hasher);
    Some((data.len() as u64, hasher.finish()))
}

/// One poll step: report a change and return the fingerprint to compare
/// against next time
fn poll_file(path: &Path, last: Fingerprint, stopped: &AtomicBool, on_change: &OnChange) -> Fingerprint {
    let current = fingerprint(path);
    if current != last && !stopped.load(Ordering::SeqCst) {
        on_change();
    }
    current
}

impl FileSystemStorage {
    #[must_use]
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    fn watch_on_runtime(
        &self,
        runtime: &Handle,
        path: PathBuf,
        mut last: Fingerprint,
        on_change: OnChange,
        stopped: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        let period = self.poll_interval;
        let path = Arc::new(path);
        runtime.spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            while !stopped.load(Ordering::SeqCst) {
                ticker.tick().await;
                let step = {
                    let (path, stopped, on_change) = (Arc::clone(&path), Arc::clone(&stopped), Arc::clone(&on_change));
                    task::spawn_blocking(move || poll_file(&path, last, &stopped, &on_change))
                };
                match step.await {
                    Ok(current) => last = current,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "file watch step failed");
                        break;
                    }
                }
            }
            trace!(path = %path.display(), "stopped watching");
        })
    }

    fn watch_on_thread(
        &self,
        path: PathBuf,
        mut last: Fingerprint,
        on_change: OnChange,
        stopped: Arc<AtomicBool>,
    ) -> io::Result<()> {
        let period = self.poll_interval;
        thread::Builder::new()
            .name("sharing-file-watch".to_string())
            .spawn(move || {
                while !stopped.load(Ordering::SeqCst) {
                    thread::sleep(period);
                    last = poll_file(&path, last, &stopped, &on_change);
                }
                trace!(path = %path.display(), "stopped watching");
            })
            .map(drop)
    }
}

impl FileStorage for FileSystemStorage {
    fn load(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn save(&self, data: &[u8], path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut staging = path.as_os_str().to_owned();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);
        fs::write(&staging, data)?;
        fs::rename(&staging, path)
    }

    fn watch(&self, path: &Path, on_change: OnChange) -> SharedSubscription {
        let stopped = Arc::new(AtomicBool::new(false));
        let path = path.to_path_buf();
        // Taken before returning so writes right after subscribing are seen
        let last = fingerprint(&path);
        if let Ok(runtime) = Handle::try_current() {
            let task = self.watch_on_runtime(&runtime, path, last, on_change, Arc::clone(&stopped));
            return SharedSubscription::new(move || {
                stopped.store(true, Ordering::SeqCst);
                task.abort();
            });
        }
        debug!(path = %path.display(), "no tokio runtime, watching on a thread");
        match self.watch_on_thread(path, last, on_change, Arc::clone(&stopped)) {
            Ok(()) => SharedSubscription::new(move || stopped.store(true, Ordering::SeqCst)),
            Err(e) => {
                warn!(error = %e, "cannot start file watcher");
                SharedSubscription::empty()
            }
        }
    }

    fn schedule(&self, delay: Duration, job: Job) {
        if let Ok(runtime) = Handle::try_current() {
            runtime.spawn(async move {
                time::sleep(delay).await;
                if let Err(e) = task::spawn_blocking(job).await {
                    warn!(error = %e, "delayed file write failed");
                }
            });
            return;
        }
        let spawned = thread::Builder::new()
            .name("sharing-file-flush".to_string())
            .spawn(move || {
                thread::sleep(delay);
                job();
            });
        if let Err(e) = spawned {
            warn!(error = %e, "cannot schedule delayed file write");
        }
    }
}

// ============================================================================
// In-memory file system
// ============================================================================

#[derive(Default)]
struct MemoryFiles {
    files: Mutex<HashMap<PathBuf, Vec<u8>>>,
    watchers: Mutex<HashMap<PathBuf, Vec<(u64, OnChange)>>>,
    next_watcher: AtomicU64,
    scheduled: Mutex<Vec<Job>>,
}

/// [`FileStorage`] kept in memory
///
/// Watchers are called synchronously on every change. Scheduled jobs wait
/// until [`run_scheduled`](Self::run_scheduled) is called, whatever their
/// delay. Clones share the same files.
#[derive(Clone, Default)]
pub struct InMemoryFileStorage {
    inner: Arc<MemoryFiles>,
}

impl InMemoryFileStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn file(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.inner.files.lock().get(path.as_ref()).cloned()
    }

    /// Write a file as an outside process would
    pub fn set_file(&self, path: impl AsRef<Path>, data: impl Into<Vec<u8>>) {
        let path = path.as_ref().to_path_buf();
        self.inner.files.lock().insert(path.clone(), data.into());
        self.notify(&path);
    }

    /// Delete a file as an outside process would
    pub fn remove_file(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        if self.inner.files.lock().remove(path).is_some() {
            self.notify(path);
        }
    }

    /// Run every scheduled job, returning how many ran
    pub fn run_scheduled(&self) -> usize {
        let jobs = std::mem::take(&mut *self.inner.scheduled.lock());
        let count = jobs.len();
        for job in jobs {
            job();
        }
        count
    }

    #[must_use]
    pub fn scheduled_jobs(&self) -> usize {
        self.inner.scheduled.lock().len()
    }

    fn notify(&self, path: &Path) {
        let snapshot: Vec<OnChange> = self
            .inner
            .watchers
            .lock()
            .get(path)
            .map(|entries| entries.iter().map(|(_, on_change)| Arc::clone(on_change)).collect())
            .unwrap_or_default();
        for on_change in snapshot {
            on_change();
        }
    }
}

impl FileStorage for InMemoryFileStorage {
    fn load(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.file(path)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{} not found", path.display())))
    }

    fn save(&self, data: &[u8], path: &Path) -> io::Result<()> {
        self.set_file(path, data);
        Ok(())
    }

    fn watch(&self, path: &Path, on_change: OnChange) -> SharedSubscription {
        let id = self.inner.next_watcher.fetch_add(1, Ordering::Relaxed);
        self.inner
            .watchers
            .lock()
            .entry(path.to_path_buf())
            .or_default()
            .push((id, on_change));
        let inner: Weak<MemoryFiles> = Arc::downgrade(&self.inner);
        let path = path.to_path_buf();
        SharedSubscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                if let Some(entries) = inner.watchers.lock().get_mut(&path) {
                    entries.retain(|(entry_id, _)| *entry_id != id);
                }
            }
        })
    }

    fn schedule(&self, _delay: Duration, job: Job) {
        self.inner.scheduled.lock().push(job);
    }
}

impl fmt::Debug for InMemoryFileStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryFileStorage")
            .field("files", &self.inner.files.lock().len())
            .field("scheduled", &self.scheduled_jobs())
            .finish()
    }
}

// ============================================================================
// Key
// ============================================================================

#[derive(Default)]
struct WriteState {
    /// Bytes last known to be on disk, written by us or observed
    known_contents: Option<Vec<u8>>,
    window_open: bool,
    pending: Option<(Vec<u8>, SaveContinuation)>,
}

/// Identity of a [`FileStorageKey`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileStorageKeyId {
    path: PathBuf,
    storage: usize,
}

/// Key for a JSON file
pub struct FileStorageKey<V> {
    path: PathBuf,
    storage: Arc<dyn FileStorage>,
    throttle: Duration,
    state: Arc<Mutex<WriteState>>,
    _value: PhantomData<fn() -> V>,
}

impl<V> FileStorageKey<V>
where
    V: SharedValue + Serialize + DeserializeOwned,
{
    /// Key for `path` on the process-wide file storage
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_storage(path, defaults::current().file_storage)
    }

    pub fn with_storage(path: impl Into<PathBuf>, storage: Arc<dyn FileStorage>) -> Self {
        Self {
            path: path.into(),
            storage,
            throttle: defaults::current().config.file_save_throttle(),
            state: Arc::new(Mutex::new(WriteState::default())),
            _value: PhantomData,
        }
    }

    /// Window in which implicit saves are coalesced
    #[must_use]
    pub fn throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn schedule_flush(&self) {
        let state = Arc::clone(&self.state);
        let storage: Weak<dyn FileStorage> = Arc::downgrade(&self.storage);
        let path = self.path.clone();
        self.storage.schedule(
            self.throttle,
            Box::new(move || {
                let pending = {
                    let mut state = state.lock();
                    state.window_open = false;
                    state.pending.take()
                };
                let Some((data, continuation)) = pending else {
                    return;
                };
                match storage.upgrade() {
                    Some(storage) => write_file(&state, storage.as_ref(), &path, data, &continuation),
                    None => continuation.resume_throwing(format!("file storage for {} was dropped", path.display())),
                }
            }),
        );
    }
}

fn write_file(
    state: &Mutex<WriteState>,
    storage: &dyn FileStorage,
    path: &Path,
    data: Vec<u8>,
    continuation: &SaveContinuation,
) {
    // Recorded first: in-memory watchers fire before `save` returns
    state.lock().known_contents = Some(data.clone());
    match storage.save(&data, path) {
        Ok(()) => continuation.resume(),
        Err(e) => {
            state.lock().known_contents = None;
            continuation.resume_throwing(e);
        }
    }
}

impl<V> SharedReaderKey for FileStorageKey<V>
where
    V: SharedValue + Serialize + DeserializeOwned,
{
    type Value = V;
    type Id = FileStorageKeyId;

    fn id(&self) -> FileStorageKeyId {
        FileStorageKeyId {
            path: self.path.clone(),
            storage: Arc::as_ptr(&self.storage) as *const () as usize,
        }
    }

    fn load(&self, _context: LoadContext<V>, continuation: LoadContinuation<V>) {
        match self.storage.load(&self.path) {
            Ok(data) => match serde_json::from_slice::<V>(&data) {
                Ok(value) => {
                    self.state.lock().known_contents = Some(data);
                    continuation.resume_returning_value(value);
                }
                Err(e) => continuation.resume_throwing(e),
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => continuation.resume_returning_initial_value(),
            Err(e) => continuation.resume_throwing(e),
        }
    }

    fn subscribe(&self, _context: LoadContext<V>, subscriber: SharedSubscriber<V>) -> SharedSubscription {
        let state = Arc::clone(&self.state);
        let storage: Weak<dyn FileStorage> = Arc::downgrade(&self.storage);
        let path = self.path.clone();
        self.storage.watch(
            &self.path,
            Arc::new(move || {
                let Some(storage) = storage.upgrade() else {
                    return;
                };
                match storage.load(&path) {
                    Ok(data) => {
                        {
                            let mut state = state.lock();
                            if state.known_contents.as_deref() == Some(data.as_slice()) {
                                trace!(path = %path.display(), "unchanged or own write");
                                return;
                            }
                            state.known_contents = Some(data.clone());
                        }
                        match serde_json::from_slice::<V>(&data) {
                            Ok(value) => subscriber.yield_value(value),
                            Err(e) => subscriber.yield_error(e),
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        state.lock().known_contents = None;
                        subscriber.yield_initial_value();
                    }
                    Err(e) => subscriber.yield_error(e),
                }
            }),
        )
    }

    fn description(&self) -> String {
        format!(".file_storage({:?})", self.path.display().to_string())
    }
}

impl<V> SharedKey for FileStorageKey<V>
where
    V: SharedValue + Serialize + DeserializeOwned,
{
    fn save(&self, value: &V, context: SaveContext, continuation: SaveContinuation) {
        let data = match serde_json::to_vec_pretty(value) {
            Ok(data) => data,
            Err(e) => {
                continuation.resume_throwing(e);
                return;
            }
        };
        match context {
            SaveContext::UserInitiated => {
                let superseded = self.state.lock().pending.take();
                if let Some((_, previous)) = superseded {
                    previous.resume();
                }
                write_file(&self.state, self.storage.as_ref(), &self.path, data, &continuation);
            }
            SaveContext::DidSet => {
                let superseded = {
                    let mut state = self.state.lock();
                    if state.window_open {
                        Some(state.pending.replace((data, continuation)))
                    } else {
                        state.window_open = true;
                        drop(state);
                        write_file(&self.state, self.storage.as_ref(), &self.path, data, &continuation);
                        self.schedule_flush();
                        None
                    }
                };
                // Coalesced into the write at the end of the window
                if let Some(Some((_, previous))) = superseded {
                    previous.resume();
                }
            }
        }
    }
}
