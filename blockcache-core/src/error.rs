//! Error types for the block cache.

use thiserror::Error;

use crate::key::Key;

/// Result type alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Error variants surfaced by the cache engine.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The block is absent, failed hash verification, or could not be read back in full.
    /// The offending key (or share) has already been deregistered when this is returned.
    #[error("block not found: {0}")]
    BlockNotFound(Key),

    /// Eviction could not free enough clusters for the write.
    #[error("space not found: needed {needed} clusters, {available} available")]
    SpaceNotFound { needed: usize, available: usize },

    /// Metadata query for a key that is neither stored nor shared.
    #[error("key not found: {0}")]
    KeyNotFound(Key),

    /// Compression/cipher/correction combination that the engine does not accept.
    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("erasure coding failed: {0}")]
    Erasure(#[from] reed_solomon_erasure::Error),

    #[error("compression failed: {0}")]
    Compression(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    /// AEAD tag mismatch; the stored stream was altered or the key is wrong.
    #[error("decryption failed: authentication tag mismatch")]
    DecryptionAuthFailed,
}
