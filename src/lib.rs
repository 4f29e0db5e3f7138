//! GPU resource cache and device memory sub-allocation.
//!
//! Turns content-addressed resource descriptions into GPU-resident objects
//! without stalling the render loop, shares device memory through buddy and
//! free-list sub-allocators, and keeps superseded resources alive until
//! frames that may still read them have retired.

pub mod cache;
pub mod config;
pub mod error;
pub mod gpu;
pub mod memory;
pub mod thread_pool;

pub use cache::{
    Backend, BatchedCache, CacheKey, CacheStats, Completion, ManagedCache, ResourceCache,
    ResourceKey, ResourceManager, SamplerCache, SamplerHandle, SyncBackend, TextureSource,
};
pub use config::CacheConfig;
pub use error::{CacheError, CacheResult};
pub use gpu::{GraphicsDevice, WgpuDevice};
pub use memory::{Allocator, Block, BlockAllocator, BuddyAllocator};
