use blockcache_core::{
    CacheConfig, CacheManager, CipherAlgorithm, CompressionAlgorithm, CorrectionAlgorithm,
    Group, HashAlgorithm, Index, Key, Seed, SeedState, RETAINED_PRIORITY,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::fs::File;

const BLOCK: usize = 32 * 1024;

fn group_of(cache: &CacheManager, len: usize, seed: u64) -> Group {
    let mut rng = StdRng::seed_from_u64(seed);
    let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
    let keys = cache
        .encoding(
            &mut &data[..],
            CompressionAlgorithm::None,
            CipherAlgorithm::None,
            &[],
            HashAlgorithm::Sha2_512,
            BLOCK,
        )
        .unwrap();
    cache
        .parity_encoding(&keys, HashAlgorithm::Sha2_512, BLOCK, CorrectionAlgorithm::ReedSolomon8)
        .unwrap()
}

fn pinned(cache: &CacheManager, keys: &[Key]) -> usize {
    keys.iter().filter(|k| cache.priority(k) == Some(RETAINED_PRIORITY)).count()
}

#[test]
fn seed_is_retained_then_released() {
    let td = tempfile::tempdir().unwrap();
    let cache = CacheManager::open_default(CacheConfig::new(td.path().join("c.blocks"))).unwrap();
    let group = group_of(&cache, 100_000, 51);
    let seed = Seed::new("album", 100_000, group.keys[0].clone());
    cache.set_seed(seed.clone(), vec![Index::plain(vec![group.clone()])]);
    assert_eq!(cache.seed_state(&seed), Some(SeedState::Unverified));
    assert_eq!(pinned(&cache, &group.keys), 0);

    let outcome = cache.revalidate_seeds();
    assert_eq!(outcome.retained, vec![seed.clone()]);
    assert!(outcome.released.is_empty());
    assert_eq!(cache.seed_state(&seed), Some(SeedState::Retained));
    // The top key is a group member, so it fills one of the four slots.
    assert_eq!(pinned(&cache, &group.keys), 4);
    assert_eq!(cache.priority(&group.keys[0]), Some(RETAINED_PRIORITY));

    // A second pass keeps the same protected set.
    let before: Vec<_> = group.keys.iter().map(|k| cache.priority(k)).collect();
    cache.revalidate_seeds();
    let after: Vec<_> = group.keys.iter().map(|k| cache.priority(k)).collect();
    assert_eq!(before, after);

    // Five of eight gone: below the information length.
    for k in &group.keys[3..] {
        cache.remove(k);
    }
    let outcome = cache.revalidate_seeds();
    assert!(outcome.retained.is_empty());
    assert_eq!(outcome.released.len(), 1);
    assert_eq!(outcome.released[0].0, seed);
    assert_eq!(cache.seed_state(&seed), None);
    assert!(cache.seeds().is_empty());
    assert_eq!(pinned(&cache, &group.keys), 0);
}

#[test]
fn missing_top_key_releases_seed() {
    let td = tempfile::tempdir().unwrap();
    let cache = CacheManager::open_default(CacheConfig::new(td.path().join("c.blocks"))).unwrap();
    let group = group_of(&cache, 40_000, 52);
    let top = Key::compute(HashAlgorithm::Sha2_512, b"never stored");
    let seed = Seed::new("orphan", 40_000, top);
    cache.set_seed(seed.clone(), vec![Index::plain(vec![group])]);
    let outcome = cache.revalidate_seeds();
    assert_eq!(outcome.released.len(), 1);
    assert_eq!(cache.seed_state(&seed), None);
}

#[test]
fn shared_blocks_count_toward_completeness() {
    let td = tempfile::tempdir().unwrap();
    let cache = CacheManager::open_default(CacheConfig::new(td.path().join("c.blocks"))).unwrap();
    let shared = td.path().join("shared.bin");
    let mut rng = StdRng::seed_from_u64(53);
    let data: Vec<u8> = (0..3 * BLOCK).map(|_| rng.gen()).collect();
    std::fs::write(&shared, &data).unwrap();
    let keys = cache.share(&mut File::open(&shared).unwrap(), &shared, BLOCK).unwrap();
    let group = cache
        .parity_encoding(&keys, HashAlgorithm::Sha2_512, BLOCK, CorrectionAlgorithm::None)
        .unwrap();
    let seed = Seed::new("shared", data.len() as u64, keys[0].clone());
    cache.set_seed(seed.clone(), vec![Index::plain(vec![group])]);
    cache.revalidate_seeds();
    assert_eq!(cache.seed_state(&seed), Some(SeedState::Retained));

    let id = cache.share_infos()[0].id;
    cache.share_remove(id);
    cache.revalidate_seeds();
    assert_eq!(cache.seed_state(&seed), None);
}

#[test]
fn replacing_a_seed_tree_resets_its_state() {
    let td = tempfile::tempdir().unwrap();
    let cache = CacheManager::open_default(CacheConfig::new(td.path().join("c.blocks"))).unwrap();
    let group = group_of(&cache, 50_000, 54);
    let seed = Seed::new("doc", 50_000, group.keys[0].clone());
    cache.set_seed(seed.clone(), vec![Index::plain(vec![group])]);
    cache.revalidate_seeds();
    assert_eq!(cache.seed_state(&seed), Some(SeedState::Retained));

    cache.set_seed(seed.clone(), Vec::new());
    assert_eq!(cache.seed_state(&seed), Some(SeedState::Unverified));
    assert_eq!(cache.seed_indices(&seed), Some(Vec::new()));
}

#[test]
fn revalidation_respects_interval() {
    let td = tempfile::tempdir().unwrap();
    let mut cfg = CacheConfig::new(td.path().join("c.blocks"));
    cfg.revalidate_interval_secs = 3600;
    let cache = CacheManager::open_default(cfg).unwrap();
    assert!(cache.maybe_revalidate_seeds().is_some());
    assert!(cache.maybe_revalidate_seeds().is_none());
    cache.revalidate_seeds();
    assert!(cache.maybe_revalidate_seeds().is_none());
}
