use crate::error::CacheResult;

/// Invoked once the device has finished executing a submitted batch
pub type CompletionCallback = Box<dyn FnOnce() + Send + 'static>;

/// Narrow view of the graphics device used by buffer-backed caches
pub trait GraphicsDevice: Send + Sync + 'static {
    /// Device memory handle. Cloning must be cheap (shared handle).
    type Memory: Clone + Send + Sync + 'static;

    /// A recorded batch of commands ready for submission
    type Commands: Send + 'static;

    /// Allocate `size` bytes of device memory with the given usage
    fn allocate(&self, size: u64, usage: wgpu::BufferUsages) -> CacheResult<Self::Memory>;

    /// Record a copy of `data` into `dst` at `offset` through a staging buffer
    fn record_upload(&self, dst: &Self::Memory, offset: u64, data: &[u8]) -> Self::Commands;

    /// Submit a batch. `on_complete` fires after the device has executed it,
    /// possibly on another thread, and possibly only once the device is
    /// polled or waited on.
    fn submit(&self, batch: Self::Commands, on_complete: CompletionCallback);

    /// Block until every submitted batch has executed and its completion
    /// callback has run
    fn wait_idle(&self);
}
