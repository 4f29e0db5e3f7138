//! Top-level owner of the engine's caches
//!
//! Caches are explicit instances registered here rather than process-wide
//! statics. The manager ticks them once per frame and tears them down in
//! reverse registration order, so caches built on top of others (samplers
//! over textures) go first.

use std::sync::Arc;

use parking_lot::Mutex;

use super::{Backend, CacheKey, CacheStats, ResourceCache, SamplerCache, TextureSource};

/// Lifecycle hooks the manager drives
pub trait ManagedCache: Send + Sync {
    fn name(&self) -> &str;

    /// Called once per frame
    fn tick(&self);

    fn destroy(&self);

    fn stats(&self) -> CacheStats;
}

impl<K, V, B> ManagedCache for ResourceCache<K, V, B>
where
    K: CacheKey,
    V: Clone + Send + 'static,
    B: Backend<K, V>,
{
    fn name(&self) -> &str {
        ResourceCache::name(self)
    }

    fn tick(&self) {
        ResourceCache::tick(self)
    }

    fn destroy(&self) {
        ResourceCache::destroy(self)
    }

    fn stats(&self) -> CacheStats {
        ResourceCache::stats(self)
    }
}

/// Sampler caches are mutated through `&mut self`, so the manager drives
/// them behind a lock shared with the render thread
impl<S> ManagedCache for Mutex<SamplerCache<S>>
where
    S: TextureSource + Send + 'static,
    S::Texture: Send + 'static,
{
    fn name(&self) -> &str {
        "samplers"
    }

    fn tick(&self) {
        self.lock().tick()
    }

    fn destroy(&self) {
        self.lock().destroy()
    }

    fn stats(&self) -> CacheStats {
        self.lock().stats()
    }
}

#[derive(Default)]
pub struct ResourceManager {
    caches: Vec<Arc<dyn ManagedCache>>,
    destroyed: bool,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take part ownership of a cache. The caller keeps its `Arc` for fetching.
    pub fn register(&mut self, cache: Arc<dyn ManagedCache>) {
        log::debug!("[ResourceManager] Registered cache {}", cache.name());
        self.caches.push(cache);
    }

    pub fn len(&self) -> usize {
        self.caches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }

    /// Age and evict every registered cache
    pub fn tick(&self) {
        for cache in &self.caches {
            cache.tick();
        }
    }

    pub fn stats(&self) -> Vec<(String, CacheStats)> {
        self.caches
            .iter()
            .map(|cache| (cache.name().to_string(), cache.stats()))
            .collect()
    }

    /// Destroy every cache, most recently registered first. Idempotent.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        for cache in self.caches.iter().rev() {
            log::info!("[ResourceManager] Destroying cache {}", cache.name());
            cache.destroy();
        }
        self.caches.clear();
        self.destroyed = true;
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        self.destroy();
    }
}
