//! GPU resource caches
//!
//! Content-addressed resource descriptions go in, GPU-resident objects come
//! out. Two concurrency models are provided:
//!
//! - `ResourceCache`: instantiation runs on a background worker, the render
//!   thread fetches without blocking (or blocks until the first value exists)
//! - `BatchedCache`: single-threaded, work queued on fetch and drained on tick
//!
//! `SamplerCache` layers compact descriptor handles over a texture cache and
//! `SharedMeshBackend` packs meshes into one sub-allocated device buffer.

pub mod batched_cache;
pub mod manager;
pub mod mesh_cache;
pub mod resource_cache;
pub mod sampler_cache;

pub use batched_cache::BatchedCache;
pub use manager::{ManagedCache, ResourceManager};
pub use mesh_cache::{GpuMesh, Mesh, MeshSource, SharedMeshBackend};
pub use resource_cache::ResourceCache;
pub use sampler_cache::{DescriptorArray, SamplerCache, SamplerHandle};

use std::fmt;
use std::sync::Arc;

/// Versioned identity of a cached resource.
///
/// Two keys with the same id but different versions name the same logical
/// resource at different points in time.
pub trait CacheKey: Clone + Send + Sync + 'static {
    fn id(&self) -> &str;

    /// Changes whenever the underlying content changes. Not required to
    /// increase by one, or at all; only inequality matters.
    fn version(&self) -> u64;
}

/// Plain id/version pair, for resources whose content lives elsewhere
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub id: String,
    pub version: u64,
}

impl ResourceKey {
    pub fn new(id: impl Into<String>, version: u64) -> Self {
        Self {
            id: id.into(),
            version,
        }
    }
}

impl CacheKey for ResourceKey {
    fn id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// One-shot handle a backend uses to hand back an instantiated value.
///
/// Dropping it without calling `complete` (a backend panic unwinding
/// through `instantiate`, or a job dropped by a stopped worker) runs the
/// abandon hook instead, so the cache never waits on a value that cannot
/// arrive.
pub struct Completion<V> {
    callback: Option<Box<dyn FnOnce(V) + Send + 'static>>,
    abandoned: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl<V> Completion<V> {
    pub fn new(callback: impl FnOnce(V) + Send + 'static) -> Self {
        Self {
            callback: Some(Box::new(callback)),
            abandoned: None,
        }
    }

    /// Run `abandoned` if this completion is dropped without a value
    pub fn on_abandon(mut self, abandoned: impl FnOnce() + Send + 'static) -> Self {
        self.abandoned = Some(Box::new(abandoned));
        self
    }

    pub fn complete(mut self, value: V) {
        self.abandoned = None;
        if let Some(callback) = self.callback.take() {
            callback(value);
        }
    }
}

impl<V> Drop for Completion<V> {
    fn drop(&mut self) {
        if let Some(abandoned) = self.abandoned.take() {
            abandoned();
        }
    }
}

impl<V> fmt::Debug for Completion<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Completion")
    }
}

/// Device-side half of an async cache.
///
/// Instantiation failure is unrecoverable: backends panic rather than call
/// `done` with a placeholder. The cache poisons the line and every later
/// fetch of it panics.
pub trait Backend<K: CacheKey, V>: Send + Sync + 'static {
    /// Used for worker thread names and log prefixes
    fn name(&self) -> &str;

    /// Create the resource for `key` and pass it to `done`, from any thread,
    /// at any later time.
    fn instantiate(&self, key: K, done: Completion<V>);

    /// Release a value the cache no longer references
    fn delete(&self, value: V);

    /// Drive every submitted instantiation to completion. Called by
    /// `ResourceCache::destroy` before it waits on pending lines, so backends
    /// whose completions depend on device polling must poll here.
    fn flush(&self) {}

    /// Release backend-wide resources after every value was deleted
    fn destroy(&self) {}
}

/// Synchronous backend for the single-threaded `BatchedCache`
pub trait SyncBackend<K: CacheKey, V> {
    fn instantiate(&mut self, key: &K) -> V;

    /// Bring `value` up to date with `key`'s content in place
    fn update(&mut self, value: &mut V, key: &K);

    fn delete(&mut self, value: V);

    fn destroy(&mut self) {}
}

/// What the sampler cache needs from the texture cache beneath it
pub trait TextureSource {
    type Key: CacheKey;
    type Texture: Clone;

    /// Blocking fetch
    fn fetch(&self, key: &Self::Key) -> Self::Texture;

    fn try_fetch(&self, key: &Self::Key) -> Option<Self::Texture>;

    /// Keep the texture for `key` alive regardless of use
    fn pin(&self, key: &Self::Key);
}

/// Lets one texture cache sit under a sampler cache while the resource
/// manager also holds it
impl<T: TextureSource + ?Sized> TextureSource for Arc<T> {
    type Key = T::Key;
    type Texture = T::Texture;

    fn fetch(&self, key: &Self::Key) -> Self::Texture {
        (**self).fetch(key)
    }

    fn try_fetch(&self, key: &Self::Key) -> Option<Self::Texture> {
        (**self).try_fetch(key)
    }

    fn pin(&self, key: &Self::Key) {
        (**self).pin(key)
    }
}

/// Snapshot of cache occupancy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lines keyed by resource id
    pub lines: usize,
    /// Lines holding a value
    pub available: usize,
    /// Instantiations dispatched but not completed
    pub pending: usize,
    /// Superseded values waiting for deletion
    pub deferred: usize,
    pub permanent: usize,
}
