use std::io::{Read, Write};

use rayon::prelude::*;
use tracing::debug;

use crate::compression::{compressor, decompressor, CompressionAlgorithm, Compressor};
use crate::encryption::{CipherAlgorithm, CipherKey, OpenWriter, SealWriter};
use crate::error::{CacheError, CacheResult};
use crate::group::Index;
use crate::key::{HashAlgorithm, Key};
use crate::manager::CacheManager;
use crate::share::read_full;

/// A validated compression + cipher pairing.
#[derive(Debug, Clone)]
pub enum BlockCodec {
    /// No compression, no cipher.
    Plain,
    /// zstd, then AES-256-GCM segments.
    Sealed(CipherKey),
}

impl BlockCodec {
    /// Only `(None, None)` and `(Zstd, Aes256Gcm)` are accepted.
    pub fn new(
        compression: CompressionAlgorithm,
        cipher: CipherAlgorithm,
        cipher_key: &[u8],
    ) -> CacheResult<Self> {
        match (compression, cipher) {
            (CompressionAlgorithm::None, CipherAlgorithm::None) => Ok(BlockCodec::Plain),
            (CompressionAlgorithm::Zstd, CipherAlgorithm::Aes256Gcm) => {
                Ok(BlockCodec::Sealed(CipherKey::from_slice(cipher_key)?))
            }
            (c, x) => Err(CacheError::UnsupportedConfiguration(format!(
                "compression {:?} with cipher {:?}",
                c, x
            ))),
        }
    }

    pub fn for_index(index: &Index) -> CacheResult<Self> {
        Self::new(index.compression, index.cipher, &index.cipher_key)
    }
}

enum EncodeSink {
    Plain(Vec<u8>),
    Sealed(Compressor<SealWriter<Vec<u8>>>),
}

impl EncodeSink {
    fn new(codec: &BlockCodec) -> CacheResult<Self> {
        Ok(match codec {
            BlockCodec::Plain => EncodeSink::Plain(Vec::new()),
            BlockCodec::Sealed(key) => {
                EncodeSink::Sealed(compressor(SealWriter::new(Vec::new(), key)?)?)
            }
        })
    }

    fn write_all(&mut self, data: &[u8]) -> CacheResult<()> {
        match self {
            EncodeSink::Plain(buf) => buf.extend_from_slice(data),
            EncodeSink::Sealed(enc) => {
                enc.write_all(data).map_err(|e| CacheError::Compression(e.to_string()))?
            }
        }
        Ok(())
    }

    /// Encoded bytes not yet cut into blocks.
    fn pending(&mut self) -> &mut Vec<u8> {
        match self {
            EncodeSink::Plain(buf) => buf,
            EncodeSink::Sealed(enc) => enc.get_mut().get_mut(),
        }
    }

    fn finish(self) -> CacheResult<Vec<u8>> {
        match self {
            EncodeSink::Plain(buf) => Ok(buf),
            EncodeSink::Sealed(enc) => {
                let seal = enc.finish().map_err(|e| CacheError::Compression(e.to_string()))?;
                seal.finish().map_err(|e| CacheError::Encryption(e.to_string()))
            }
        }
    }
}

impl CacheManager {
    /// Store `reader` as a sequence of blocks; returns their keys in stream order.
    pub fn encoding(
        &self,
        reader: &mut impl Read,
        compression: CompressionAlgorithm,
        cipher: CipherAlgorithm,
        cipher_key: &[u8],
        hash_algorithm: HashAlgorithm,
        block_length: usize,
    ) -> CacheResult<Vec<Key>> {
        let codec = BlockCodec::new(compression, cipher, cipher_key)?;
        self.encode_with(reader, &codec, hash_algorithm, block_length)
    }

    pub fn encode_with(
        &self,
        reader: &mut impl Read,
        codec: &BlockCodec,
        hash_algorithm: HashAlgorithm,
        block_length: usize,
    ) -> CacheResult<Vec<Key>> {
        if block_length == 0 {
            return Err(CacheError::InvalidArgument("block length must be non-zero".into()));
        }
        let mut sink = EncodeSink::new(codec)?;
        let mut keys = Vec::new();
        let mut buf = vec![0u8; self.config().transfer_chunk];
        let mut total = 0u64;
        loop {
            let n = read_full(reader, &mut buf)?;
            if n == 0 {
                break;
            }
            total += n as u64;
            sink.write_all(&buf[..n])?;
            let pending = sink.pending();
            let whole = pending.len() / block_length * block_length;
            let ready: Vec<u8> = pending.drain(..whole).collect();
            self.store_pieces(&ready, hash_algorithm, block_length, &mut keys)?;
        }
        let tail = sink.finish()?;
        self.store_pieces(&tail, hash_algorithm, block_length, &mut keys)?;
        debug!(bytes = total, blocks = keys.len(), ?codec, "encoded stream");
        Ok(keys)
    }

    fn store_pieces(
        &self,
        data: &[u8],
        hash_algorithm: HashAlgorithm,
        block_length: usize,
        keys: &mut Vec<Key>,
    ) -> CacheResult<()> {
        let hashed: Vec<Key> =
            data.par_chunks(block_length).map(|c| Key::compute(hash_algorithm, c)).collect();
        for (key, piece) in hashed.into_iter().zip(data.chunks(block_length)) {
            self.put(&key, piece)?;
            keys.push(key);
        }
        Ok(())
    }

    /// Write the stream stored under `keys` to `out`, undoing cipher then compression.
    pub fn decoding(
        &self,
        out: &mut impl Write,
        compression: CompressionAlgorithm,
        cipher: CipherAlgorithm,
        cipher_key: &[u8],
        keys: &[Key],
    ) -> CacheResult<()> {
        let codec = BlockCodec::new(compression, cipher, cipher_key)?;
        self.decode_with(out, &codec, keys)
    }

    pub fn decode_with(
        &self,
        out: &mut impl Write,
        codec: &BlockCodec,
        keys: &[Key],
    ) -> CacheResult<()> {
        match codec {
            BlockCodec::Plain => {
                for key in keys {
                    let block = self.get(key)?;
                    out.write_all(&block)?;
                }
            }
            BlockCodec::Sealed(cipher_key) => {
                let mut open = OpenWriter::new(decompressor(&mut *out)?, cipher_key)?;
                for key in keys {
                    let block = self.get(key)?;
                    open.push(&block)?;
                }
                let mut dec = open.finish()?;
                dec.flush().map_err(|e| CacheError::Compression(e.to_string()))?;
            }
        }
        out.flush()?;
        Ok(())
    }
}
