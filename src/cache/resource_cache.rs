/// Async Resource Cache
///
/// Maps versioned keys to lazily instantiated GPU resources. The render
/// thread calls `try_fetch`/`fetch` every frame; misses and version changes
/// dispatch instantiation to a background worker.
///
/// ## Synchronization
/// - The line map's shape is guarded by one `RwLock`, never held while a
///   backend runs.
/// - Every line field is guarded by the line's own `Mutex`. The version is
///   compared and bumped under that lock before dispatch, so each version is
///   instantiated at most once.
/// - Dispatches carry a sequence number. A completion older than the value
///   already in the line is discarded, so a slow instantiation of an old
///   version can never overwrite a newer one.
///
/// ## Deferred deletion
/// A replaced value may still be read by a frame that was submitted but has
/// not finished executing. It is parked in a synthetic line under a random
/// key that expires on the next `tick`, and only then handed to
/// `Backend::delete`.
///
/// ## Failure
/// An instantiation whose completion is dropped unfinished (the backend
/// panicked, or the worker had already stopped) poisons its line: pending
/// waits are released and every later fetch of that id panics until a
/// newer version is dispatched.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use rustc_hash::FxHashMap;

use super::{Backend, CacheKey, CacheStats, Completion, TextureSource};
use crate::config::CacheConfig;
use crate::error::CacheResult;
use crate::thread_pool::Worker;

/// Prefix of the synthetic keys holding superseded values
const DEFERRED_PREFIX: &str = "~deferred:";

struct LineState<V> {
    value: Option<V>,
    /// Version of the most recent dispatch
    version: Option<u64>,
    /// Sequence number of the most recent dispatch
    dispatched: u64,
    /// Sequence number that produced `value`
    applied: u64,
    /// Dispatches not yet completed
    pending: usize,
    age: Duration,
    permanent: bool,
    /// Removed from the map; late completions must not resurrect it
    evicted: bool,
    /// Synthetic line expiring on the next tick
    deferred: bool,
    /// An instantiation was abandoned
    failed: bool,
}

impl<V> LineState<V> {
    fn empty() -> Self {
        Self {
            value: None,
            version: None,
            dispatched: 0,
            applied: 0,
            pending: 0,
            age: Duration::ZERO,
            permanent: false,
            evicted: false,
            deferred: false,
            failed: false,
        }
    }
}

struct Line<V> {
    state: Mutex<LineState<V>>,
    /// Notified when a value lands or a dispatch completes
    changed: Condvar,
}

impl<V> Line<V> {
    fn new(state: LineState<V>) -> Self {
        Self {
            state: Mutex::new(state),
            changed: Condvar::new(),
        }
    }
}

struct Inner<K, V, B> {
    name: String,
    backend: B,
    lines: RwLock<FxHashMap<String, Arc<Line<V>>>>,
    max_age: Duration,
    _key: PhantomData<fn(K)>,
}

impl<K, V, B> Inner<K, V, B>
where
    K: CacheKey,
    V: Clone + Send + 'static,
    B: Backend<K, V>,
{
    fn line(&self, id: &str) -> Arc<Line<V>> {
        if let Some(line) = self.lines.read().get(id) {
            return Arc::clone(line);
        }
        let mut lines = self.lines.write();
        Arc::clone(
            lines
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(Line::new(LineState::empty()))),
        )
    }

    fn complete(&self, id: &str, line: &Line<V>, seq: u64, value: V) {
        let obsolete = {
            let mut state = line.state.lock();
            state.pending -= 1;

            let obsolete = if state.evicted {
                log::debug!("[ResourceCache:{}] {} completed after eviction", self.name, id);
                Some(value)
            } else if seq < state.applied {
                log::debug!(
                    "[ResourceCache:{}] Discarding stale instantiation of {} (#{} < #{})",
                    self.name,
                    id,
                    seq,
                    state.applied
                );
                Some(value)
            } else {
                log::debug!("[ResourceCache:{}] {} ready (#{})", self.name, id, seq);
                state.applied = seq;
                state.failed = false;
                state.value.replace(value)
            };

            line.changed.notify_all();
            obsolete
        };

        if let Some(value) = obsolete {
            self.defer_delete(value);
        }
    }

    /// Release waiters of an instantiation that will never complete
    fn fail(&self, id: &str, line: &Line<V>, seq: u64) {
        let mut state = line.state.lock();
        state.pending = state.pending.saturating_sub(1);
        state.failed = true;
        log::error!(
            "[ResourceCache:{}] Instantiation #{} of {} was abandoned",
            self.name,
            seq,
            id
        );
        line.changed.notify_all();
    }

    /// Park `value` in a synthetic line that expires on the next tick
    fn defer_delete(&self, value: V) {
        let mut state = LineState::empty();
        state.value = Some(value);
        state.age = self.max_age;
        state.deferred = true;

        let mut lines = self.lines.write();
        loop {
            let key = format!("{}{:016x}", DEFERRED_PREFIX, rand::random::<u64>());
            if !lines.contains_key(&key) {
                lines.insert(key, Arc::new(Line::new(state)));
                return;
            }
        }
    }
}

pub struct ResourceCache<K, V, B> {
    inner: Arc<Inner<K, V, B>>,
    worker: Worker,
    last_tick: Mutex<Instant>,
    destroyed: AtomicBool,
}

impl<K, V, B> ResourceCache<K, V, B>
where
    K: CacheKey,
    V: Clone + Send + 'static,
    B: Backend<K, V>,
{
    /// Create a cache with the default ten second max age
    pub fn new(backend: B) -> CacheResult<Self> {
        Self::with_config(backend, &CacheConfig::default())
    }

    pub fn with_config(backend: B, config: &CacheConfig) -> CacheResult<Self> {
        let name = backend.name().to_string();
        let worker = Worker::spawn(config.worker_name(&name))?;

        Ok(Self {
            inner: Arc::new(Inner {
                name,
                backend,
                lines: RwLock::new(FxHashMap::default()),
                max_age: config.max_age(),
                _key: PhantomData,
            }),
            worker,
            last_tick: Mutex::new(Instant::now()),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn max_age(&self) -> Duration {
        self.inner.max_age
    }

    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    /// Look up the line for `key`, resetting its age and dispatching an
    /// instantiation if the stored version differs.
    fn touch(&self, key: &K) -> Arc<Line<V>> {
        let line = self.inner.line(key.id());

        let dispatch = {
            let mut state = line.state.lock();
            state.age = Duration::ZERO;
            if state.version != Some(key.version()) {
                // record the version before dispatching so concurrent
                // fetches of the same version don't dispatch again
                state.version = Some(key.version());
                state.dispatched += 1;
                state.pending += 1;
                Some(state.dispatched)
            } else {
                None
            }
        };

        if let Some(seq) = dispatch {
            self.dispatch(key.clone(), Arc::clone(&line), seq);
        }
        line
    }

    fn dispatch(&self, key: K, line: Arc<Line<V>>, seq: u64) {
        log::debug!(
            "[ResourceCache:{}] Instantiating {} version {} (#{})",
            self.inner.name,
            key.id(),
            key.version(),
            seq
        );

        let id = key.id().to_string();
        let done = {
            let inner = Arc::clone(&self.inner);
            let line = Arc::clone(&line);
            let id = id.clone();
            Completion::new(move |value| inner.complete(&id, &line, seq, value))
        };
        let inner = Arc::clone(&self.inner);
        let done = done.on_abandon(move || inner.fail(&id, &line, seq));

        let inner = Arc::clone(&self.inner);
        self.worker.invoke(move || inner.backend.instantiate(key, done));
    }

    fn poisoned(&self, key: &K) -> ! {
        panic!(
            "[ResourceCache:{}] instantiation of {} failed",
            self.inner.name,
            key.id()
        )
    }

    /// Non-blocking fetch. Returns `None` until a value has been produced for
    /// this key; afterwards returns the latest value, which may be one
    /// version behind while an update is in flight.
    ///
    /// Panics if the last instantiation of this id failed and no newer one
    /// is in flight.
    pub fn try_fetch(&self, key: &K) -> Option<V> {
        let line = self.touch(key);
        let state = line.state.lock();
        if state.failed && state.pending == 0 {
            self.poisoned(key);
        }
        state.value.clone()
    }

    /// Blocking fetch. Waits for the first instantiation of this key if no
    /// value exists yet. Must not be called from inside a backend's
    /// instantiation on the cache's own worker. Panics if the last
    /// instantiation of this id failed; a version bump retries it.
    pub fn fetch(&self, key: &K) -> V {
        loop {
            let line = self.touch(key);
            let mut state = line.state.lock();
            while !state.evicted {
                if state.failed && state.pending == 0 {
                    self.poisoned(key);
                }
                if let Some(value) = &state.value {
                    return value.clone();
                }
                line.changed.wait(&mut state);
            }
            // evicted while waiting, start over with a fresh line
        }
    }

    /// Exempt the line for `key` from eviction, instantiating it if needed
    pub fn pin(&self, key: &K) {
        let line = self.touch(key);
        line.state.lock().permanent = true;
    }

    /// Make a pinned line evictable again
    pub fn unpin(&self, key: &K) {
        if let Some(line) = self.inner.lines.read().get(key.id()) {
            line.state.lock().permanent = false;
        }
    }

    /// Age lines by the wall-clock time since the previous tick and evict
    /// the ones that exceeded the max age. Call once per frame.
    pub fn tick(&self) {
        let elapsed = {
            let mut last = self.last_tick.lock();
            let now = Instant::now();
            let elapsed = now.duration_since(*last);
            *last = now;
            elapsed
        };
        self.tick_elapsed(elapsed);
    }

    /// Age lines by `elapsed` and evict expired ones
    pub fn tick_elapsed(&self, elapsed: Duration) {
        let max_age = self.inner.max_age;
        let mut expired = Vec::new();

        {
            let mut lines = self.inner.lines.write();
            lines.retain(|id, line| {
                let mut state = line.state.lock();
                if state.permanent {
                    return true;
                }
                state.age += elapsed;
                if state.deferred || state.age > max_age {
                    state.evicted = true;
                    if let Some(value) = state.value.take() {
                        expired.push((id.clone(), state.deferred, value));
                    }
                    // wake fetchers blocked on a line that will never fill
                    line.changed.notify_all();
                    return false;
                }
                true
            });
        }

        if expired.is_empty() {
            return;
        }

        let deferred = expired.iter().filter(|(_, deferred, _)| *deferred).count();
        log::info!(
            "[ResourceCache:{}] Releasing {} values ({} evicted, {} superseded)",
            self.inner.name,
            expired.len(),
            expired.len() - deferred,
            deferred
        );

        for (id, deferred, value) in expired {
            if !deferred {
                log::debug!("[ResourceCache:{}] Evicting {}", self.inner.name, id);
            }
            self.inner.backend.delete(value);
        }
    }

    pub fn stats(&self) -> CacheStats {
        let lines = self.inner.lines.read();
        let mut stats = CacheStats::default();
        for line in lines.values() {
            let state = line.state.lock();
            if state.deferred {
                stats.deferred += 1;
                continue;
            }
            stats.lines += 1;
            stats.pending += state.pending;
            if state.value.is_some() {
                stats.available += 1;
            }
            if state.permanent {
                stats.permanent += 1;
            }
        }
        stats
    }

    /// Evict everything and release the backend.
    ///
    /// Blocks until pending instantiations finish so that nothing the backend
    /// is still constructing gets destroyed. Queued jobs run first, then
    /// `Backend::flush` drives their completions. Must not be called from
    /// inside a backend callback. Later calls do nothing.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        // every dispatch reaches the backend before it is asked to flush
        self.worker.shutdown();
        self.inner.backend.flush();

        loop {
            // completions may park superseded values while we drain
            let lines = std::mem::take(&mut *self.inner.lines.write());
            if lines.is_empty() {
                break;
            }

            for (id, line) in lines {
                let value = {
                    let mut state = line.state.lock();
                    while state.pending > 0 {
                        log::debug!("[ResourceCache:{}] Waiting for {}", self.inner.name, id);
                        line.changed.wait(&mut state);
                    }
                    state.evicted = true;
                    line.changed.notify_all();
                    state.value.take()
                };
                if let Some(value) = value {
                    self.inner.backend.delete(value);
                }
            }
        }

        self.inner.backend.destroy();
        log::info!("[ResourceCache:{}] Destroyed", self.inner.name);
    }
}

impl<K, V, B> TextureSource for ResourceCache<K, V, B>
where
    K: CacheKey,
    V: Clone + Send + 'static,
    B: Backend<K, V>,
{
    type Key = K;
    type Texture = V;

    fn fetch(&self, key: &K) -> V {
        ResourceCache::fetch(self, key)
    }

    fn try_fetch(&self, key: &K) -> Option<V> {
        ResourceCache::try_fetch(self, key)
    }

    fn pin(&self, key: &K) {
        ResourceCache::pin(self, key)
    }
}
