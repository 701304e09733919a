pub mod check;
pub mod cluster_store;
pub mod compression;
pub mod config;
pub mod count_cache;
pub mod encryption;
pub mod erasure;
pub mod error;
pub mod group;
pub mod key;
pub mod key_index;
pub mod manager;
pub mod pipeline;
pub mod rs_codec;
pub mod seed;
pub mod settings;
pub mod share;

pub use check::CheckReport;
pub use compression::CompressionAlgorithm;
pub use config::CacheConfig;
pub use encryption::{CipherAlgorithm, CipherKey};
pub use error::{CacheError, CacheResult};
pub use group::{CorrectionAlgorithm, Group, Index, Seed};
pub use key::{HashAlgorithm, Key};
pub use manager::{CacheManager, InUseKeys, RETAINED_PRIORITY};
pub use pipeline::BlockCodec;
pub use seed::{Revalidation, SeedState};
pub use share::{ShareId, ShareInfo};
