use std::sync::Arc;
use std::time::Duration;

use gpu_resource_cache::{
    Backend, CacheConfig, Completion, ResourceCache, ResourceKey, ResourceManager, SamplerCache,
};
use parking_lot::Mutex;

/// Textures are "id@version", completed as soon as they are requested
#[derive(Default)]
struct TextureBackend {
    deleted: Mutex<Vec<String>>,
}

impl Backend<ResourceKey, String> for TextureBackend {
    fn name(&self) -> &str {
        "textures"
    }

    fn instantiate(&self, key: ResourceKey, done: Completion<String>) {
        done.complete(format!("{}@{}", key.id, key.version));
    }

    fn delete(&self, value: String) {
        self.deleted.lock().push(value);
    }
}

type Textures = ResourceCache<ResourceKey, String, TextureBackend>;

fn texture_cache() -> Arc<Textures> {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = CacheConfig {
        max_age_secs: 1.0,
        ..CacheConfig::default()
    };
    Arc::new(ResourceCache::with_config(TextureBackend::default(), &config).expect("spawn worker"))
}

#[test]
fn test_blank_texture_survives_texture_eviction() {
    let textures = texture_cache();
    let blank = ResourceKey::new("white", 0);
    let samplers = Arc::new(Mutex::new(
        SamplerCache::new(Arc::clone(&textures), &blank, 4, 2).expect("blank handle"),
    ));

    let mut manager = ResourceManager::new();
    manager.register(textures.clone());
    manager.register(samplers.clone());

    let grass = samplers
        .lock()
        .fetch(&ResourceKey::new("grass", 1))
        .expect("free handle");
    assert_eq!(grass.id, 1);

    // long idle frame: everything unpinned in the texture cache expires
    textures.tick_elapsed(Duration::from_secs(2));
    assert_eq!(*textures.backend().deleted.lock(), vec!["grass@1".to_string()]);
    assert_eq!(textures.try_fetch(&blank), Some("white@0".to_string()));
    assert_eq!(samplers.lock().descriptors()[0], "white@0");

    for _ in 0..3 {
        samplers.lock().tick();
    }
    assert_eq!(samplers.lock().descriptors()[1], "white@0");
    assert!(samplers.lock().handle("grass").is_none());

    let stats = manager.stats();
    let names: Vec<&str> = stats.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, vec!["textures", "samplers"]);
    assert_eq!(stats[1].1.lines, 1);
    assert_eq!(stats[1].1.permanent, 1);

    // samplers go first and delete nothing; the blank goes with the textures
    manager.destroy();
    assert_eq!(
        *textures.backend().deleted.lock(),
        vec!["grass@1".to_string(), "white@0".to_string()]
    );
    assert_eq!(samplers.lock().len(), 1);
}
