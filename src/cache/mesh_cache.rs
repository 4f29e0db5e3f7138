/// Shared Mesh Backend
///
/// Packs every mesh into one device buffer usable as both vertex and index
/// buffer. Space is carved with a `BlockAllocator`; each mesh occupies one
/// block laid out as `[alignment padding][vertices][indices]`, so a draw
/// needs only a base vertex and an index byte range.

use std::ops::Range;
use std::sync::Arc;

use bytemuck::Pod;
use parking_lot::Mutex;

use super::{Backend, CacheKey, Completion};
use crate::error::CacheResult;
use crate::gpu::GraphicsDevice;
use crate::memory::{Allocator, Block, BlockAllocator};

/// Mesh content a `SharedMeshBackend` can upload
pub trait MeshSource: CacheKey {
    fn vertex_data(&self) -> &[u8];

    /// Bytes per vertex. Must be a multiple of 4 for buffer copies.
    fn vertex_size(&self) -> u64;

    fn index_data(&self) -> &[u8];

    fn index_count(&self) -> u32;

    fn index_format(&self) -> wgpu::IndexFormat {
        wgpu::IndexFormat::Uint32
    }
}

/// CPU-side mesh with `u32` indices. Cloning shares the vertex data.
#[derive(Debug, Clone)]
pub struct Mesh<V: Pod> {
    id: String,
    version: u64,
    vertices: Arc<Vec<V>>,
    indices: Arc<Vec<u32>>,
}

impl<V: Pod> Mesh<V> {
    pub fn new(id: impl Into<String>, vertices: Vec<V>, indices: Vec<u32>) -> Self {
        Self {
            id: id.into(),
            version: 1,
            vertices: Arc::new(vertices),
            indices: Arc::new(indices),
        }
    }

    /// Replace the content, bumping the version so caches re-upload
    pub fn update(&mut self, vertices: Vec<V>, indices: Vec<u32>) {
        self.vertices = Arc::new(vertices);
        self.indices = Arc::new(indices);
        self.version += 1;
    }

    pub fn vertices(&self) -> &[V] {
        &self.vertices
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }
}

impl<V: Pod + Send + Sync> CacheKey for Mesh<V> {
    fn id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

impl<V: Pod + Send + Sync> MeshSource for Mesh<V> {
    fn vertex_data(&self) -> &[u8] {
        bytemuck::cast_slice(self.vertices.as_slice())
    }

    fn vertex_size(&self) -> u64 {
        std::mem::size_of::<V>() as u64
    }

    fn index_data(&self) -> &[u8] {
        bytemuck::cast_slice(self.indices.as_slice())
    }

    fn index_count(&self) -> u32 {
        self.indices.len() as u32
    }
}

/// A mesh resident in the shared buffer
#[derive(Debug, Clone)]
pub struct GpuMesh<M> {
    pub buffer: M,
    /// Added to every index when drawing
    pub base_vertex: i32,
    /// Byte range of the indices within `buffer`
    pub index_range: Range<u64>,
    pub index_count: u32,
    pub index_format: wgpu::IndexFormat,
    block: Option<Block>,
}

impl<M> GpuMesh<M> {
    /// Sub-allocation backing this mesh; `None` for empty meshes
    pub fn block(&self) -> Option<Block> {
        self.block
    }
}

pub struct SharedMeshBackend<D: GraphicsDevice> {
    device: Arc<D>,
    buffer: D::Memory,
    allocator: Mutex<BlockAllocator>,
}

impl<D: GraphicsDevice> SharedMeshBackend<D> {
    /// Allocate a shared buffer of `size` bytes, which must be a power of two
    pub fn new(device: Arc<D>, size: u64) -> CacheResult<Self> {
        let allocator = BlockAllocator::new(size)?;
        let buffer = device.allocate(
            size,
            wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::INDEX | wgpu::BufferUsages::COPY_DST,
        )?;

        log::info!("[SharedMeshBackend] Created {} byte mesh pool", size);

        Ok(Self {
            device,
            buffer,
            allocator: Mutex::new(allocator),
        })
    }

    pub fn buffer(&self) -> &D::Memory {
        &self.buffer
    }

    /// Bytes still available in the pool
    pub fn free_space(&self) -> u64 {
        self.allocator.lock().free_space()
    }
}

impl<D, K> Backend<K, GpuMesh<D::Memory>> for SharedMeshBackend<D>
where
    D: GraphicsDevice,
    K: MeshSource,
{
    fn name(&self) -> &str {
        "meshes"
    }

    fn instantiate(&self, mesh: K, done: Completion<GpuMesh<D::Memory>>) {
        let vertex_size = mesh.vertex_size();
        assert!(
            vertex_size > 0 && vertex_size % 4 == 0,
            "mesh {}: vertex size {} is not a multiple of 4",
            mesh.id(),
            vertex_size
        );

        let vertex_bytes = mesh.vertex_data().len() as u64;
        let index_bytes = mesh.index_data().len() as u64;
        let size = vertex_bytes + index_bytes;

        if size == 0 {
            done.complete(GpuMesh {
                buffer: self.buffer.clone(),
                base_vertex: 0,
                index_range: 0..0,
                index_count: 0,
                index_format: mesh.index_format(),
                block: None,
            });
            return;
        }

        // one extra vertex of room so the vertex start can be aligned
        let block = match self.allocator.lock().alloc(size + vertex_size) {
            Ok(block) => block,
            Err(err) => {
                log::error!("[SharedMeshBackend] Cannot place mesh {}: {}", mesh.id(), err);
                panic!("mesh pool exhausted while uploading {}: {}", mesh.id(), err);
            }
        };

        // vertices must start at a multiple of the vertex size so the offset
        // can be expressed as a base vertex
        let align = (vertex_size - block.offset % vertex_size) % vertex_size;
        let vertex_start = block.offset + align;
        let index_start = vertex_start + vertex_bytes;

        let mut data = Vec::with_capacity(size as usize);
        data.extend_from_slice(mesh.vertex_data());
        data.extend_from_slice(mesh.index_data());

        log::debug!(
            "[SharedMeshBackend] Uploading {} ({} bytes) at offset {}",
            mesh.id(),
            size,
            vertex_start
        );

        let uploaded = GpuMesh {
            buffer: self.buffer.clone(),
            base_vertex: (vertex_start / vertex_size) as i32,
            index_range: index_start..index_start + index_bytes,
            index_count: mesh.index_count(),
            index_format: mesh.index_format(),
            block: Some(block),
        };

        let commands = self.device.record_upload(&self.buffer, vertex_start, &data);
        self.device
            .submit(commands, Box::new(move || done.complete(uploaded)));
    }

    fn delete(&self, mesh: GpuMesh<D::Memory>) {
        let Some(block) = mesh.block else {
            return;
        };
        if let Err(err) = self.allocator.lock().free(block) {
            log::error!("[SharedMeshBackend] Failed to release mesh block: {}", err);
        }
    }

    /// Uploads complete through device callbacks, which may only fire while
    /// the device is waited on
    fn flush(&self) {
        self.device.wait_idle();
    }

    fn destroy(&self) {
        let allocator = self.allocator.lock();
        if allocator.live_allocations() > 0 {
            log::warn!(
                "[SharedMeshBackend] Destroyed with {} live mesh blocks",
                allocator.live_allocations()
            );
        }
    }
}
