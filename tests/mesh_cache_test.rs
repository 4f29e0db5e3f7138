use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytemuck::{Pod, Zeroable};
use gpu_resource_cache::cache::{GpuMesh, Mesh, SharedMeshBackend};
use gpu_resource_cache::gpu::CompletionCallback;
use gpu_resource_cache::{CacheResult, GraphicsDevice, ResourceCache};
use parking_lot::Mutex;

type HostMemory = Arc<Mutex<Vec<u8>>>;

struct Upload {
    dst: HostMemory,
    offset: u64,
    data: Vec<u8>,
}

/// Device backed by host memory. Submissions execute immediately unless the
/// device is deferred, in which case they run on the next `wait_idle`.
#[derive(Default)]
struct HostDevice {
    deferred: bool,
    queued: Mutex<Vec<(Upload, CompletionCallback)>>,
    submissions: AtomicUsize,
    waits: AtomicUsize,
}

impl HostDevice {
    fn deferred() -> Self {
        Self {
            deferred: true,
            ..Self::default()
        }
    }

    fn execute(&self, upload: Upload, on_complete: CompletionCallback) {
        {
            let mut memory = upload.dst.lock();
            let start = upload.offset as usize;
            memory[start..start + upload.data.len()].copy_from_slice(&upload.data);
        }
        self.submissions.fetch_add(1, Ordering::SeqCst);
        on_complete();
    }
}

impl GraphicsDevice for HostDevice {
    type Memory = HostMemory;
    type Commands = Upload;

    fn allocate(&self, size: u64, _usage: wgpu::BufferUsages) -> CacheResult<HostMemory> {
        Ok(Arc::new(Mutex::new(vec![0; size as usize])))
    }

    fn record_upload(&self, dst: &HostMemory, offset: u64, data: &[u8]) -> Upload {
        Upload {
            dst: Arc::clone(dst),
            offset,
            data: data.to_vec(),
        }
    }

    fn submit(&self, upload: Upload, on_complete: CompletionCallback) {
        if self.deferred {
            self.queued.lock().push((upload, on_complete));
        } else {
            self.execute(upload, on_complete);
        }
    }

    fn wait_idle(&self) {
        self.waits.fetch_add(1, Ordering::SeqCst);
        let queued = std::mem::take(&mut *self.queued.lock());
        for (upload, on_complete) in queued {
            self.execute(upload, on_complete);
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
struct ColoredVertex {
    position: [f32; 3],
    color: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
struct PlainVertex {
    position: [f32; 3],
}

type MeshCache<V> = ResourceCache<Mesh<V>, GpuMesh<HostMemory>, SharedMeshBackend<HostDevice>>;

fn mesh_cache<V: Pod + Send + Sync>(pool_size: u64) -> MeshCache<V> {
    let _ = env_logger::builder().is_test(true).try_init();
    let device = Arc::new(HostDevice::default());
    let backend = SharedMeshBackend::new(device, pool_size).unwrap();
    ResourceCache::new(backend).unwrap()
}

fn triangle(id: &str, z: f32) -> Mesh<ColoredVertex> {
    let vertices = vec![
        ColoredVertex { position: [0.0, 0.0, z], color: 0xff0000ff },
        ColoredVertex { position: [1.0, 0.0, z], color: 0x00ff00ff },
        ColoredVertex { position: [0.0, 1.0, z], color: 0x0000ffff },
    ];
    Mesh::new(id, vertices, vec![0, 1, 2])
}

/// Read back what the mesh occupies in the shared buffer
fn read_back<V: Pod>(mesh: &GpuMesh<HostMemory>, vertex_count: usize) -> (Vec<V>, Vec<u32>) {
    let memory = mesh.buffer.lock();
    let vertex_size = std::mem::size_of::<V>();
    let start = mesh.base_vertex as usize * vertex_size;
    let vertices = memory[start..start + vertex_count * vertex_size]
        .chunks_exact(vertex_size)
        .map(bytemuck::pod_read_unaligned)
        .collect();
    let indices = memory[mesh.index_range.start as usize..mesh.index_range.end as usize]
        .chunks_exact(4)
        .map(bytemuck::pod_read_unaligned)
        .collect();
    (vertices, indices)
}

fn wait_until(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for upload");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_uploads_mesh_into_shared_buffer() {
    let cache = mesh_cache::<ColoredVertex>(4096);
    let mesh = triangle("tri", 0.0);

    let gpu = cache.fetch(&mesh);
    assert_eq!(gpu.index_count, 3);
    assert_eq!(gpu.index_format, wgpu::IndexFormat::Uint32);
    assert_eq!(gpu.index_range.end - gpu.index_range.start, 12);

    let (vertices, indices) = read_back::<ColoredVertex>(&gpu, 3);
    assert_eq!(vertices, mesh.vertices());
    assert_eq!(indices, mesh.indices());

    // 48 vertex bytes + 12 index bytes + one vertex of slack, rounded up
    assert_eq!(gpu.block().map(|block| block.size), Some(128));
    assert_eq!(cache.backend().free_space(), 4096 - 128);
    cache.destroy();
}

#[test]
fn test_vertex_start_aligned_to_vertex_size() {
    let cache = mesh_cache::<PlainVertex>(4096);
    let vertices = vec![
        PlainVertex { position: [0.0, 0.0, 0.0] },
        PlainVertex { position: [1.0, 0.0, 0.0] },
        PlainVertex { position: [0.0, 1.0, 0.0] },
    ];

    let first = cache.fetch(&Mesh::new("a", vertices.clone(), vec![0, 1, 2]));
    let second = cache.fetch(&Mesh::new("b", vertices.clone(), vec![2, 1, 0]));

    for (mesh, indices) in [(&first, vec![0, 1, 2]), (&second, vec![2, 1, 0])] {
        let block = mesh.block().unwrap();
        let vertex_start = mesh.base_vertex as u64 * 12;
        assert!(vertex_start >= block.offset);
        assert!(vertex_start - block.offset < 12);
        assert!(mesh.index_range.end <= block.end());
        assert_eq!(read_back::<PlainVertex>(mesh, 3), (vertices.clone(), indices));
    }
    assert_ne!(first.base_vertex, second.base_vertex);
    cache.destroy();
}

#[test]
fn test_updated_mesh_frees_previous_block() {
    let cache = mesh_cache::<ColoredVertex>(4096);
    let mut mesh = triangle("terrain", 0.0);

    let old = cache.fetch(&mesh);
    let old_block = old.block().unwrap();

    mesh.update(
        vec![ColoredVertex { position: [5.0, 5.0, 5.0], color: 7 }; 4],
        vec![0, 1, 2, 2, 3, 0],
    );
    wait_until(|| cache.try_fetch(&mesh).map(|gpu| gpu.index_count) == Some(6));

    let new = cache.fetch(&mesh);
    assert_ne!(new.block().unwrap().offset, old_block.offset);
    assert_eq!(read_back::<ColoredVertex>(&new, 4).0, mesh.vertices());
    assert_eq!(cache.backend().free_space(), 4096 - 256);

    // the old block is released once the superseded mesh expires
    cache.tick();
    assert_eq!(cache.backend().free_space(), 4096 - 128);
    cache.destroy();
    assert_eq!(cache.backend().free_space(), 4096);
}

#[test]
fn test_empty_mesh_takes_no_space() {
    let cache = mesh_cache::<ColoredVertex>(1024);
    let gpu = cache.fetch(&Mesh::new("nothing", Vec::new(), Vec::new()));

    assert_eq!(gpu.index_count, 0);
    assert!(gpu.block().is_none());
    assert_eq!(cache.backend().free_space(), 1024);
    cache.destroy();
}

#[test]
fn test_pool_must_be_power_of_two() {
    let device = Arc::new(HostDevice::default());
    assert!(SharedMeshBackend::new(device, 3000).is_err());
}

#[test]
fn test_destroy_waits_on_device_for_inflight_upload() {
    let _ = env_logger::builder().is_test(true).try_init();
    let device = Arc::new(HostDevice::deferred());
    let backend = SharedMeshBackend::new(Arc::clone(&device), 4096).unwrap();
    let cache: MeshCache<ColoredVertex> = ResourceCache::new(backend).unwrap();

    // the upload is submitted but nothing polls the device
    assert!(cache.try_fetch(&triangle("late", 0.0)).is_none());

    cache.destroy();
    assert!(device.waits.load(Ordering::SeqCst) >= 1);
    assert!(device.queued.lock().is_empty());
    assert_eq!(device.submissions.load(Ordering::SeqCst), 1);
    assert_eq!(cache.backend().free_space(), 4096);
}
