/// Batched Cache
///
/// Single-threaded alternative to `ResourceCache`. `fetch` never blocks and
/// never creates anything itself: misses and stale versions queue work that
/// `tick` drains in order. A stale value is served for one frame after a
/// version bump.
///
/// Eviction is explicit. Callers run `evict()` when they choose to, since
/// not every resource is requested every frame.

use std::collections::hash_map::Entry;

use rustc_hash::FxHashMap;

use super::{CacheKey, SyncBackend};
use crate::config::CacheConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkOp {
    Create,
    Update,
}

struct Work<K> {
    op: WorkOp,
    key: K,
}

struct BatchedLine<V> {
    value: V,
    version: u64,
    age: u64,
}

pub struct BatchedCache<K, V, B> {
    backend: B,
    lines: FxHashMap<String, BatchedLine<V>>,
    work: Vec<Work<K>>,
    /// Index into `work` per id, so repeated fetches within a frame queue
    /// once and the newest key wins
    queued: FxHashMap<String, usize>,
    max_age: u64,
}

impl<K, V, B> BatchedCache<K, V, B>
where
    K: CacheKey,
    V: Clone,
    B: SyncBackend<K, V>,
{
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, &CacheConfig::default())
    }

    pub fn with_config(backend: B, config: &CacheConfig) -> Self {
        Self {
            backend,
            lines: FxHashMap::with_capacity_and_hasher(64, Default::default()),
            work: Vec::with_capacity(32),
            queued: FxHashMap::default(),
            max_age: config.batched_max_age_ticks,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Queued work items awaiting the next tick
    pub fn pending_work(&self) -> usize {
        self.work.len()
    }

    /// Returns the cached value, or `None` while its creation is queued. A
    /// stale value is returned as-is and an update is queued.
    pub fn fetch(&mut self, key: &K) -> Option<V> {
        let Some(line) = self.lines.get_mut(key.id()) else {
            self.enqueue(WorkOp::Create, key);
            return None;
        };

        line.age = 0;
        let value = line.value.clone();
        if line.version != key.version() || self.queued.contains_key(key.id()) {
            self.enqueue(WorkOp::Update, key);
        }
        Some(value)
    }

    /// Queue work for `key`, or retarget the work already queued for its id
    fn enqueue(&mut self, op: WorkOp, key: &K) {
        if let Some(&idx) = self.queued.get(key.id()) {
            self.work[idx].key = key.clone();
            return;
        }
        self.queued.insert(key.id().to_string(), self.work.len());
        self.work.push(Work {
            op,
            key: key.clone(),
        });
    }

    /// Age every line by one tick, then run queued work in insertion order
    pub fn tick(&mut self) {
        for line in self.lines.values_mut() {
            line.age += 1;
        }
        self.process();
    }

    fn process(&mut self) {
        let work = std::mem::take(&mut self.work);
        self.queued.clear();

        for item in work {
            match item.op {
                WorkOp::Create => self.process_create(&item.key),
                WorkOp::Update => self.process_update(&item.key),
            }
        }
    }

    fn process_create(&mut self, key: &K) {
        match self.lines.entry(key.id().to_string()) {
            Entry::Occupied(_) => {
                log::warn!("[BatchedCache] Create for existing line {}", key.id());
            }
            Entry::Vacant(slot) => {
                log::debug!("[BatchedCache] Creating {} version {}", key.id(), key.version());
                let value = self.backend.instantiate(key);
                slot.insert(BatchedLine {
                    value,
                    version: key.version(),
                    age: 0,
                });
            }
        }
    }

    fn process_update(&mut self, key: &K) {
        // the line may have been evicted since the update was queued
        let Some(line) = self.lines.get_mut(key.id()) else {
            return;
        };
        if line.version == key.version() {
            return;
        }
        log::debug!(
            "[BatchedCache] Updating {} from version {} to {}",
            key.id(),
            line.version,
            key.version()
        );
        self.backend.update(&mut line.value, key);
        line.version = key.version();
    }

    /// Evict one line not fetched for at least the max age. Returns whether
    /// anything was removed.
    pub fn evict(&mut self) -> bool {
        let max_age = self.max_age;
        let Some(id) = self
            .lines
            .iter()
            .find(|(_, line)| line.age >= max_age)
            .map(|(id, _)| id.clone())
        else {
            return false;
        };

        if let Some(line) = self.lines.remove(&id) {
            log::debug!("[BatchedCache] Evicting {}", id);
            self.backend.delete(line.value);
        }
        true
    }

    /// Delete every value and release the backend. Queued work is dropped.
    pub fn destroy(&mut self) {
        self.work.clear();
        self.queued.clear();
        for (_, line) in self.lines.drain() {
            self.backend.delete(line.value);
        }
        self.backend.destroy();
    }
}
