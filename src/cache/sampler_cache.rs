/// Sampler Handle Cache
///
/// Assigns compact integer handles to textures so shaders can index a fixed
/// size sampler array. Handle 0 is permanently bound to a blank texture.
/// Handles unused for `max_age` ticks are recycled and their slot is
/// rewritten with the blank texture, since slot indices are baked into
/// GPU-visible data and cannot simply disappear. The blank texture is
/// pinned in the texture source so it outlives every slot pointing at it.

use std::collections::BTreeSet;

use rustc_hash::FxHashMap;

use super::{CacheKey, CacheStats, TextureSource};
use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};

/// Id of the handle bound to the blank texture
pub const BLANK_HANDLE: usize = 0;

/// Shader-visible texture array the sampler cache writes into
pub trait DescriptorArray<T> {
    fn set_range(&mut self, offset: usize, textures: &[T]);
}

impl<T: Clone> DescriptorArray<T> for Vec<T> {
    fn set_range(&mut self, offset: usize, textures: &[T]) {
        for (i, texture) in textures.iter().enumerate() {
            match self.get_mut(offset + i) {
                Some(slot) => *slot = texture.clone(),
                None => self.push(texture.clone()),
            }
        }
    }
}

/// Resolved handle: slot index plus the texture currently bound to it
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerHandle<T> {
    pub id: usize,
    pub texture: T,
}

struct Slot<T> {
    id: usize,
    texture: Option<T>,
    age: u64,
}

pub struct SamplerCache<S: TextureSource> {
    textures: S,
    handles: FxHashMap<String, Slot<S::Texture>>,
    free: BTreeSet<usize>,
    descriptors: Vec<S::Texture>,
    next: usize,
    capacity: usize,
    max_age: u64,
    blank: S::Texture,
}

impl<S: TextureSource> SamplerCache<S> {
    /// Create a cache over `textures` with `capacity` slots. The blank
    /// texture is pinned, fetched (blocking) and bound to handle 0.
    pub fn new(textures: S, blank: &S::Key, capacity: usize, max_age: u64) -> CacheResult<Self> {
        if capacity == 0 {
            return Err(CacheError::OutOfHandles { capacity });
        }

        textures.pin(blank);
        let blank_texture = textures.fetch(blank);
        let mut samplers = Self {
            textures,
            handles: FxHashMap::with_capacity_and_hasher(capacity, Default::default()),
            free: BTreeSet::new(),
            descriptors: vec![blank_texture.clone(); capacity],
            next: 0,
            capacity,
            max_age,
            blank: blank_texture.clone(),
        };

        let id = samplers.assign_handle(blank.id())?;
        debug_assert_eq!(id, BLANK_HANDLE);
        samplers.bind(id, blank.id(), blank_texture);

        Ok(samplers)
    }

    pub fn with_config(textures: S, blank: &S::Key, config: &CacheConfig) -> CacheResult<Self> {
        Self::new(textures, blank, config.sampler_capacity, config.sampler_max_age_ticks)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of assigned handles, including the blank one
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn max_age(&self) -> u64 {
        self.max_age
    }

    /// Current contents of every slot
    pub fn descriptors(&self) -> &[S::Texture] {
        &self.descriptors
    }

    pub fn textures(&self) -> &S {
        &self.textures
    }

    fn next_id(&mut self) -> CacheResult<usize> {
        if let Some(id) = self.free.pop_first() {
            return Ok(id);
        }
        if self.next >= self.capacity {
            return Err(CacheError::OutOfHandles {
                capacity: self.capacity,
            });
        }
        let id = self.next;
        self.next += 1;
        Ok(id)
    }

    /// Existing handle for `key` with its age reset, or a newly assigned one
    fn assign_handle(&mut self, key: &str) -> CacheResult<usize> {
        if let Some(slot) = self.handles.get_mut(key) {
            slot.age = 0;
            return Ok(slot.id);
        }

        let id = self.next_id()?;
        log::debug!("[SamplerCache] Assigned handle {} to {}", id, key);
        self.handles.insert(
            key.to_string(),
            Slot {
                id,
                texture: None,
                age: 0,
            },
        );
        Ok(id)
    }

    fn bind(&mut self, id: usize, key: &str, texture: S::Texture) -> SamplerHandle<S::Texture> {
        if let Some(slot) = self.handles.get_mut(key) {
            slot.texture = Some(texture.clone());
        }
        self.descriptors[id] = texture.clone();
        SamplerHandle { id, texture }
    }

    /// Resolve a handle, blocking until the texture exists
    pub fn fetch(&mut self, key: &S::Key) -> CacheResult<SamplerHandle<S::Texture>> {
        let id = self.assign_handle(key.id())?;
        let texture = self.textures.fetch(key);
        Ok(self.bind(id, key.id(), texture))
    }

    /// Resolve a handle without blocking. The handle stays reserved while
    /// the texture loads; `Ok(None)` until it is available.
    pub fn try_fetch(&mut self, key: &S::Key) -> CacheResult<Option<SamplerHandle<S::Texture>>> {
        let id = self.assign_handle(key.id())?;
        Ok(self
            .textures
            .try_fetch(key)
            .map(|texture| self.bind(id, key.id(), texture)))
    }

    /// Bind an already created texture to a handle under `key`
    pub fn assign(&mut self, key: &str, texture: S::Texture) -> CacheResult<SamplerHandle<S::Texture>> {
        let id = self.assign_handle(key)?;
        Ok(self.bind(id, key, texture))
    }

    /// Currently bound handle for `key`, if it has a texture
    pub fn handle(&self, key: &str) -> Option<SamplerHandle<S::Texture>> {
        let slot = self.handles.get(key)?;
        slot.texture.clone().map(|texture| SamplerHandle {
            id: slot.id,
            texture,
        })
    }

    /// Age every handle except the blank one and recycle expired handles
    pub fn tick(&mut self) {
        let max_age = self.max_age;
        let mut expired = Vec::new();

        self.handles.retain(|key, slot| {
            if slot.id == BLANK_HANDLE {
                return true;
            }
            slot.age += 1;
            if slot.age > max_age {
                expired.push((key.clone(), slot.id));
                return false;
            }
            true
        });

        for (key, id) in expired {
            log::debug!("[SamplerCache] Recycling handle {} ({})", id, key);
            self.free.insert(id);
            self.descriptors[id] = self.blank.clone();
        }
    }

    pub fn stats(&self) -> CacheStats {
        let available = self
            .handles
            .values()
            .filter(|slot| slot.texture.is_some())
            .count();
        CacheStats {
            lines: self.handles.len(),
            available,
            pending: self.handles.len() - available,
            deferred: 0,
            permanent: usize::from(self.handles.values().any(|slot| slot.id == BLANK_HANDLE)),
        }
    }

    /// Release every handle except the blank one and point all slots at the
    /// blank texture. Textures belong to the source and are not deleted here.
    pub fn destroy(&mut self) {
        self.handles.retain(|_, slot| slot.id == BLANK_HANDLE);
        self.free.clear();
        self.next = BLANK_HANDLE + 1;
        for slot in self.descriptors.iter_mut() {
            *slot = self.blank.clone();
        }
        log::info!("[SamplerCache] Released all handles");
    }

    /// Tick, then write every slot into the descriptor array
    pub fn flush(&mut self, array: &mut impl DescriptorArray<S::Texture>) {
        self.tick();
        array.set_range(0, &self.descriptors);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ResourceKey;
    use std::cell::{Cell, RefCell};

    /// Textures are "id@version"; ids starting with "loading" never finish
    #[derive(Default)]
    struct FakeTextures {
        fetches: Cell<usize>,
        pinned: RefCell<Vec<String>>,
    }

    impl TextureSource for FakeTextures {
        type Key = ResourceKey;
        type Texture = String;

        fn fetch(&self, key: &ResourceKey) -> String {
            self.fetches.set(self.fetches.get() + 1);
            format!("{}@{}", key.id, key.version)
        }

        fn try_fetch(&self, key: &ResourceKey) -> Option<String> {
            if key.id.starts_with("loading") {
                None
            } else {
                Some(self.fetch(key))
            }
        }

        fn pin(&self, key: &ResourceKey) {
            self.pinned.borrow_mut().push(key.id.clone());
        }
    }

    fn samplers(capacity: usize, max_age: u64) -> SamplerCache<FakeTextures> {
        SamplerCache::new(
            FakeTextures::default(),
            &ResourceKey::new("white", 0),
            capacity,
            max_age,
        )
        .unwrap()
    }

    #[test]
    fn test_blank_is_handle_zero() {
        let cache = samplers(4, 10);
        let blank = cache.handle("white").unwrap();
        assert_eq!(blank.id, BLANK_HANDLE);
        assert!(cache.descriptors().iter().all(|t| t == "white@0"));
        assert_eq!(*cache.textures().pinned.borrow(), vec!["white"]);
    }

    #[test]
    fn test_handles_are_stable() {
        let mut cache = samplers(4, 10);
        let first = cache.fetch(&ResourceKey::new("grass", 1)).unwrap();
        let again = cache.fetch(&ResourceKey::new("grass", 2)).unwrap();
        assert_eq!(first.id, 1);
        assert_eq!(again.id, 1);
        assert_eq!(again.texture, "grass@2");
        assert_eq!(cache.descriptors()[1], "grass@2");
    }

    #[test]
    fn test_try_fetch_reserves_handle() {
        let mut cache = samplers(4, 10);
        assert_eq!(cache.try_fetch(&ResourceKey::new("loading-rock", 1)).unwrap(), None);
        assert_eq!(cache.len(), 2);
        assert!(cache.handle("loading-rock").is_none());
        assert_eq!(cache.descriptors()[1], "white@0");
    }

    #[test]
    fn test_out_of_handles_until_tick_recycles() {
        let mut cache = samplers(8, 2);
        for i in 1..8 {
            cache.fetch(&ResourceKey::new(format!("tex{}", i), 1)).unwrap();
        }
        assert_eq!(cache.len(), 8);

        let overflow = ResourceKey::new("tex8", 1);
        assert!(matches!(
            cache.fetch(&overflow),
            Err(CacheError::OutOfHandles { capacity: 8 })
        ));

        // keep everything but tex3 alive
        for _ in 0..3 {
            cache.tick();
            for i in (1..8).filter(|i| *i != 3) {
                cache.fetch(&ResourceKey::new(format!("tex{}", i), 1)).unwrap();
            }
        }
        assert!(cache.handle("tex3").is_none());
        assert_eq!(cache.descriptors()[3], "white@0");

        let recycled = cache.fetch(&overflow).unwrap();
        assert_eq!(recycled.id, 3);
        assert!(cache.handle("white").is_some());
    }

    #[test]
    fn test_assign_and_flush() {
        let mut cache = samplers(3, 10);
        let handle = cache.assign("shadowmap", "depth".to_string()).unwrap();
        assert_eq!(handle.id, 1);

        let mut array: Vec<String> = Vec::new();
        cache.flush(&mut array);
        assert_eq!(array, vec!["white@0", "depth", "white@0"]);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(
            SamplerCache::new(FakeTextures::default(), &ResourceKey::new("white", 0), 0, 10),
            Err(CacheError::OutOfHandles { capacity: 0 })
        ));
    }

    #[test]
    fn test_destroy_keeps_blank_handle() {
        let mut cache = samplers(4, 10);
        cache.fetch(&ResourceKey::new("grass", 1)).unwrap();
        cache.try_fetch(&ResourceKey::new("loading-sand", 1)).unwrap();

        let stats = cache.stats();
        assert_eq!((stats.lines, stats.available, stats.pending), (3, 2, 1));

        cache.destroy();
        assert_eq!(cache.len(), 1);
        assert!(cache.descriptors().iter().all(|t| t == "white@0"));
        assert_eq!(cache.fetch(&ResourceKey::new("rock", 1)).unwrap().id, 1);
        assert_eq!(cache.stats().permanent, 1);
    }
}
