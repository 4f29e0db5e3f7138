//! `GraphicsDevice` implementation over wgpu

use std::sync::Arc;

use wgpu::util::DeviceExt;

use super::device::{CompletionCallback, GraphicsDevice};
use crate::error::{CacheError, CacheResult};

pub struct WgpuDevice {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
}

impl WgpuDevice {
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
        Self { device, queue }
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Drive completion callbacks. wgpu only fires `on_submitted_work_done`
    /// callbacks while the device is being polled, so the render loop calls
    /// this once per frame.
    pub fn poll(&self) {
        let _ = self.device.poll(wgpu::Maintain::Poll);
    }
}

/// Pad to the copy alignment wgpu requires for buffer transfers
fn pad_to_copy_alignment(data: &[u8]) -> Vec<u8> {
    let align = wgpu::COPY_BUFFER_ALIGNMENT as usize;
    let padded_len = (data.len() + align - 1) / align * align;
    let mut padded = Vec::with_capacity(padded_len);
    padded.extend_from_slice(data);
    padded.resize(padded_len, 0);
    padded
}

impl GraphicsDevice for WgpuDevice {
    type Memory = Arc<wgpu::Buffer>;
    type Commands = wgpu::CommandBuffer;

    fn allocate(&self, size: u64, usage: wgpu::BufferUsages) -> CacheResult<Self::Memory> {
        let max = self.device.limits().max_buffer_size;
        if size > max {
            return Err(CacheError::DeviceAllocation {
                size,
                reason: format!("exceeds device max buffer size of {} bytes", max),
            });
        }

        log::debug!("[WgpuDevice] Allocating {} bytes ({:?})", size, usage);

        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Resource Cache Pool"),
            size,
            usage,
            mapped_at_creation: false,
        });
        Ok(Arc::new(buffer))
    }

    fn record_upload(&self, dst: &Self::Memory, offset: u64, data: &[u8]) -> Self::Commands {
        let padded = pad_to_copy_alignment(data);

        let staging = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Resource Cache Staging"),
            contents: &padded,
            usage: wgpu::BufferUsages::COPY_SRC,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Resource Cache Upload"),
            });
        encoder.copy_buffer_to_buffer(&staging, 0, dst, offset, padded.len() as u64);
        encoder.finish()
    }

    fn submit(&self, batch: Self::Commands, on_complete: CompletionCallback) {
        self.queue.submit(std::iter::once(batch));
        self.queue.on_submitted_work_done(on_complete);
    }

    fn wait_idle(&self) {
        log::debug!("[WgpuDevice] Waiting for submitted work");
        let _ = self.device.poll(wgpu::Maintain::Wait);
    }
}
