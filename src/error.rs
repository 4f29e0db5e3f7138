//! Crate-wide error type
//!
//! Allocator and structural cache failures are returned as typed errors.
//! Backend instantiation failures are not represented here: a resource that
//! cannot be created leaves the render loop with nothing safe to draw, so
//! backends abort instead.

use thiserror::Error;

/// Result alias used throughout the crate
pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Debug, Error)]
pub enum CacheError {
    /// The allocator cannot satisfy the request. Callers may evict and retry.
    #[error("Out of memory: requested {requested} bytes, {available} bytes free")]
    OutOfMemory { requested: u64, available: u64 },

    /// A free targeted an offset or block that this allocator never issued.
    #[error("Invalid free: offset {offset} was not allocated by this allocator")]
    InvalidFree { offset: u64 },

    /// The sampler cache has no handle left in its descriptor array.
    #[error("Out of sampler handles: capacity {capacity} exhausted")]
    OutOfHandles { capacity: usize },

    #[error("Invalid size {size}: {reason}")]
    InvalidSize { size: u64, reason: String },

    #[error("Device allocation of {size} bytes failed: {reason}")]
    DeviceAllocation { size: u64, reason: String },

    #[error("Invalid configuration: {message}")]
    Config { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    TomlParse(#[from] toml::de::Error),
}

impl CacheError {
    /// Whether the caller can reasonably recover, e.g. by evicting and retrying.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CacheError::OutOfMemory { .. })
    }
}
