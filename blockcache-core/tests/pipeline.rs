use blockcache_core::{
    BlockCodec, CacheConfig, CacheError, CacheManager, CipherAlgorithm, CipherKey,
    CompressionAlgorithm, HashAlgorithm,
};
use proptest::prelude::*;
use rand::{rngs::StdRng, Rng, SeedableRng};

fn open(dir: &std::path::Path) -> CacheManager {
    let mut cfg = CacheConfig::new(dir.join("c.blocks"));
    // Small transfer chunks exercise the block carry-over between reads.
    cfg.transfer_chunk = 10_000;
    CacheManager::open_default(cfg).unwrap()
}

fn sealed_roundtrip(cache: &CacheManager, data: &[u8], block_length: usize) -> usize {
    let key = CipherKey::generate();
    let keys = cache
        .encoding(
            &mut &data[..],
            CompressionAlgorithm::Zstd,
            CipherAlgorithm::Aes256Gcm,
            key.as_bytes(),
            HashAlgorithm::Sha2_512,
            block_length,
        )
        .unwrap();
    let mut out = Vec::new();
    cache
        .decoding(
            &mut out,
            CompressionAlgorithm::Zstd,
            CipherAlgorithm::Aes256Gcm,
            key.as_bytes(),
            &keys,
        )
        .unwrap();
    assert_eq!(out, data);
    keys.len()
}

#[test]
fn plain_stream_splits_into_exact_blocks() {
    let td = tempfile::tempdir().unwrap();
    let cache = open(td.path());
    let mut rng = StdRng::seed_from_u64(41);
    let data: Vec<u8> = (0..100_000).map(|_| rng.gen()).collect();

    let keys = cache
        .encoding(
            &mut &data[..],
            CompressionAlgorithm::None,
            CipherAlgorithm::None,
            &[],
            HashAlgorithm::Sha2_512,
            32 * 1024,
        )
        .unwrap();
    assert_eq!(keys.len(), 4);
    assert_eq!(cache.length_of(&keys[3]).unwrap(), 100_000 - 3 * 32 * 1024);

    let mut out = Vec::new();
    cache
        .decoding(&mut out, CompressionAlgorithm::None, CipherAlgorithm::None, &[], &keys)
        .unwrap();
    assert_eq!(out, data);
}

#[test]
fn empty_stream_has_no_blocks() {
    let td = tempfile::tempdir().unwrap();
    let cache = open(td.path());
    let keys = cache
        .encoding(
            &mut std::io::empty(),
            CompressionAlgorithm::None,
            CipherAlgorithm::None,
            &[],
            HashAlgorithm::Sha2_512,
            4096,
        )
        .unwrap();
    assert!(keys.is_empty());
}

#[test]
fn sealed_stream_roundtrips_and_compresses() {
    let td = tempfile::tempdir().unwrap();
    let cache = open(td.path());
    let text = b"the quick brown fox jumps over the lazy dog. ".repeat(5_000);
    let blocks = sealed_roundtrip(&cache, &text, 4096);
    // 225 KB of repetitive text compresses well below one block per 4 KiB of input.
    assert!(blocks < text.len() / 4096);
}

#[test]
fn sealed_blocks_do_not_contain_plaintext() {
    let td = tempfile::tempdir().unwrap();
    let cache = open(td.path());
    let key = CipherKey::generate();
    let secret = b"correct horse battery staple".repeat(100);
    let keys = cache
        .encoding(
            &mut &secret[..],
            CompressionAlgorithm::Zstd,
            CipherAlgorithm::Aes256Gcm,
            key.as_bytes(),
            HashAlgorithm::Sha2_512,
            1024,
        )
        .unwrap();
    for k in &keys {
        let block = cache.get(k).unwrap();
        assert!(!block.windows(7).any(|w| w == b"correct"));
    }
}

#[test]
fn wrong_cipher_key_fails_authentication() {
    let td = tempfile::tempdir().unwrap();
    let cache = open(td.path());
    let keys = cache
        .encoding(
            &mut &b"some payload"[..],
            CompressionAlgorithm::Zstd,
            CipherAlgorithm::Aes256Gcm,
            &[1u8; 32],
            HashAlgorithm::Sha2_512,
            4096,
        )
        .unwrap();
    let mut out = Vec::new();
    let res = cache.decoding(
        &mut out,
        CompressionAlgorithm::Zstd,
        CipherAlgorithm::Aes256Gcm,
        &[2u8; 32],
        &keys,
    );
    assert!(matches!(res, Err(CacheError::DecryptionAuthFailed)));
}

#[test]
fn unsupported_codec_pairs_are_rejected_before_io() {
    for (c, x) in [
        (CompressionAlgorithm::Zstd, CipherAlgorithm::None),
        (CompressionAlgorithm::None, CipherAlgorithm::Aes256Gcm),
    ] {
        assert!(matches!(
            BlockCodec::new(c, x, &[0u8; 32]),
            Err(CacheError::UnsupportedConfiguration(_))
        ));
    }
    assert!(matches!(
        BlockCodec::new(CompressionAlgorithm::Zstd, CipherAlgorithm::Aes256Gcm, &[0u8; 16]),
        Err(CacheError::UnsupportedConfiguration(_))
    ));

    let td = tempfile::tempdir().unwrap();
    let cache = open(td.path());
    let res = cache.encoding(
        &mut &b"never read"[..],
        CompressionAlgorithm::Zstd,
        CipherAlgorithm::None,
        &[],
        HashAlgorithm::Sha2_512,
        4096,
    );
    assert!(matches!(res, Err(CacheError::UnsupportedConfiguration(_))));
    assert_eq!(cache.count(), 0);
}

#[test]
fn missing_block_fails_decoding() {
    let td = tempfile::tempdir().unwrap();
    let cache = open(td.path());
    let data = vec![7u8; 9000];
    let keys = cache
        .encoding(
            &mut &data[..],
            CompressionAlgorithm::None,
            CipherAlgorithm::None,
            &[],
            HashAlgorithm::Sha2_512,
            4096,
        )
        .unwrap();
    cache.remove(&keys[2]);
    let mut out = Vec::new();
    let res =
        cache.decoding(&mut out, CompressionAlgorithm::None, CipherAlgorithm::None, &[], &keys);
    assert!(matches!(res, Err(CacheError::BlockNotFound(_))));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]
    #[test]
    fn sealed_roundtrip_any_stream(
        data in proptest::collection::vec(any::<u8>(), 0..50_000),
        block_length in 16usize..8192,
    ) {
        let td = tempfile::tempdir().unwrap();
        let cache = open(td.path());
        sealed_roundtrip(&cache, &data, block_length);
    }
}
