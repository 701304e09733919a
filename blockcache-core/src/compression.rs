//! Compression family for the block pipeline.

use std::io::Write;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};

/// zstd level used for stored streams.
pub const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CompressionAlgorithm {
    /// Passthrough.
    #[default]
    None,
    /// Zstandard frame format.
    Zstd,
}

pub(crate) type Compressor<W> = zstd::stream::write::Encoder<'static, W>;
pub(crate) type Decompressor<W> = zstd::stream::write::Decoder<'static, W>;

pub(crate) fn compressor<W: Write>(sink: W) -> CacheResult<Compressor<W>> {
    Compressor::new(sink, ZSTD_LEVEL).map_err(|e| CacheError::Compression(e.to_string()))
}

pub(crate) fn decompressor<W: Write>(sink: W) -> CacheResult<Decompressor<W>> {
    Decompressor::new(sink).map_err(|e| CacheError::Compression(e.to_string()))
}
