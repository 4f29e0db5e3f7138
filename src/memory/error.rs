//! Memory subsystem error helpers

use crate::error::CacheError;

/// Create an out of memory error
pub fn out_of_memory_error(requested: u64, available: u64) -> CacheError {
    CacheError::OutOfMemory {
        requested,
        available,
    }
}

/// Create an invalid free error
pub fn invalid_free_error(offset: u64) -> CacheError {
    CacheError::InvalidFree { offset }
}

pub(crate) fn not_power_of_two_error(size: u64) -> CacheError {
    CacheError::InvalidSize {
        size,
        reason: "allocator size must be a power of two".to_string(),
    }
}
