//! Graphics device collaborator
//!
//! The caches only need three things from the device: raw memory, a way to
//! record an upload into it, and batch submission with a completion callback.

pub mod device;
pub mod wgpu_device;

pub use device::{CompletionCallback, GraphicsDevice};
pub use wgpu_device::WgpuDevice;
