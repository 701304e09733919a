use blockcache_core::cluster_store::CLUSTER_SIZE;
use blockcache_core::settings::{read_settings, write_settings, SettingsLimits};
use blockcache_core::{
    CacheConfig, CacheManager, CorrectionAlgorithm, HashAlgorithm, Index, Key, Seed, SeedState,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::fs::{self, File};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn random_block(rng: &mut StdRng, len: usize) -> (Key, Vec<u8>) {
    let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
    (Key::compute(HashAlgorithm::Sha2_512, &data), data)
}

#[test]
fn state_survives_reopen() {
    init_tracing();
    let td = tempfile::tempdir().unwrap();
    let cfg = CacheConfig::new(td.path().join("c.blocks"));
    let settings = td.path().join("cache.settings");
    let shared = td.path().join("shared.bin");
    let gone = td.path().join("gone.bin");
    let mut rng = StdRng::seed_from_u64(61);

    let blocks: Vec<_> = (0..5).map(|i| random_block(&mut rng, 10_000 * (i + 1))).collect();
    fs::write(&shared, random_block(&mut rng, 9000).1).unwrap();
    fs::write(&gone, random_block(&mut rng, 100).1).unwrap();
    let seed;
    let shared_keys;
    {
        let cache = CacheManager::open_default(cfg.clone()).unwrap();
        for (k, v) in &blocks {
            cache.put(k, v).unwrap();
        }
        shared_keys = cache.share(&mut File::open(&shared).unwrap(), &shared, 4096).unwrap();
        cache.share(&mut File::open(&gone).unwrap(), &gone, 4096).unwrap();
        let keys: Vec<Key> = blocks.iter().map(|(k, _)| k.clone()).collect();
        let group = cache
            .parity_encoding(&keys, HashAlgorithm::Sha2_512, 50_000, CorrectionAlgorithm::None)
            .unwrap();
        seed = Seed::new("five", group.length, keys[0].clone());
        cache.set_seed(seed.clone(), vec![Index::plain(vec![group])]);
        cache.save_settings(&settings).unwrap();
    }
    fs::remove_file(&gone).unwrap();

    let cache = CacheManager::open_default(cfg).unwrap();
    assert_eq!(cache.count(), 0);
    cache.load_settings(&settings).unwrap();

    assert_eq!(cache.count(), 5);
    for (k, v) in &blocks {
        assert_eq!(&cache.get(k).unwrap(), v);
    }
    assert_eq!(cache.share_infos().len(), 1);
    assert_eq!(cache.share_infos()[0].path, shared);
    assert_eq!(cache.exists_keys(&shared_keys).len(), shared_keys.len());
    assert_eq!(cache.seeds(), vec![seed.clone()]);
    assert_eq!(cache.seed_state(&seed), Some(SeedState::Unverified));
    cache.revalidate_seeds();
    assert_eq!(cache.seed_state(&seed), Some(SeedState::Retained));

    // New blocks must not land on clusters the restored ones occupy.
    let (k, v) = random_block(&mut rng, 70_000);
    cache.put(&k, &v).unwrap();
    for (bk, bv) in &blocks {
        assert_eq!(&cache.get(bk).unwrap(), bv);
    }
    assert_eq!(cache.get(&k).unwrap(), v);
}

#[test]
fn shrinking_restored_size_drops_far_records() {
    let td = tempfile::tempdir().unwrap();
    let cfg = CacheConfig::new(td.path().join("c.blocks")).with_size(8 * CLUSTER_SIZE);
    let cache = CacheManager::open_default(cfg).unwrap();
    let mut rng = StdRng::seed_from_u64(62);
    for _ in 0..8 {
        let (k, v) = random_block(&mut rng, CLUSTER_SIZE as usize);
        cache.put(&k, &v).unwrap();
    }
    let mut snap = cache.snapshot_settings();
    snap.size = 3 * CLUSTER_SIZE;
    cache.restore_settings(snap).unwrap();
    assert_eq!(cache.count(), 3);
    assert_eq!(cache.size(), 3 * CLUSTER_SIZE);
}

#[test]
fn corrupted_blob_is_rejected() {
    let td = tempfile::tempdir().unwrap();
    let cache = CacheManager::open_default(CacheConfig::new(td.path().join("c.blocks"))).unwrap();
    let mut rng = StdRng::seed_from_u64(63);
    let (k, v) = random_block(&mut rng, 1234);
    cache.put(&k, &v).unwrap();
    let path = td.path().join("cache.settings");
    write_settings(&path, &cache.snapshot_settings()).unwrap();
    let loaded = read_settings(&path, &SettingsLimits::default()).unwrap();
    assert_eq!(loaded.clusters.len(), 1);

    let mut bytes = fs::read(&path).unwrap();
    bytes[30] ^= 0xFF;
    fs::write(&path, &bytes).unwrap();
    assert!(cache.load_settings(&path).is_err());
    // A failed load leaves the live state alone.
    assert_eq!(cache.get(&k).unwrap(), v);

    let tight = SettingsLimits { max_uncompressed_bytes: 1 << 20, max_entries: 0 };
    write_settings(&path, &cache.snapshot_settings()).unwrap();
    assert!(read_settings(&path, &tight).is_err());
}
