//! AES-256-GCM sealing of a byte stream in independently authenticated segments.
//!
//! Segment layout: `[u32 LE ciphertext length][12-byte nonce][ciphertext + 16-byte tag]`.

use std::io::{self, Write};

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CacheError, CacheResult};

/// Plaintext bytes covered by one segment.
pub const SEGMENT_LEN: usize = 64 * 1024;
const NONCE_LEN: usize = 12;
const HEADER_LEN: usize = 4 + NONCE_LEN;
const TAG_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CipherAlgorithm {
    #[default]
    None,
    Aes256Gcm,
}

/// 256-bit stream key, wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CipherKey([u8; 32]);

impl CipherKey {
    pub fn from_slice(bytes: &[u8]) -> CacheResult<Self> {
        let raw: [u8; 32] = bytes.try_into().map_err(|_| {
            CacheError::UnsupportedConfiguration(format!(
                "cipher key must be 32 bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(raw))
    }

    pub fn generate() -> Self {
        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        Self(raw)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn cipher(&self) -> CacheResult<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.0).map_err(|e| CacheError::Encryption(e.to_string()))
    }
}

impl std::fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CipherKey([REDACTED])")
    }
}

/// Encrypts everything written to it and forwards sealed segments to `inner`.
pub(crate) struct SealWriter<W: Write> {
    inner: W,
    cipher: Aes256Gcm,
    pending: Vec<u8>,
}

impl<W: Write> SealWriter<W> {
    pub(crate) fn new(inner: W, key: &CipherKey) -> CacheResult<Self> {
        Ok(Self { inner, cipher: key.cipher()?, pending: Vec::with_capacity(SEGMENT_LEN) })
    }

    pub(crate) fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    fn seal(&mut self, plain: &[u8]) -> io::Result<()> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plain)
            .map_err(|e| io::Error::other(format!("seal segment: {}", e)))?;
        self.inner.write_all(&(sealed.len() as u32).to_le_bytes())?;
        self.inner.write_all(&nonce)?;
        self.inner.write_all(&sealed)
    }

    /// Seal the trailing partial segment and hand back the sink.
    pub(crate) fn finish(mut self) -> io::Result<W> {
        if !self.pending.is_empty() {
            let last = std::mem::take(&mut self.pending);
            self.seal(&last)?;
        }
        Ok(self.inner)
    }
}

impl<W: Write> Write for SealWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        while self.pending.len() >= SEGMENT_LEN {
            let segment: Vec<u8> = self.pending.drain(..SEGMENT_LEN).collect();
            self.seal(&segment)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Accepts sealed segments in arbitrary slices and writes the opened plaintext to `inner`.
pub(crate) struct OpenWriter<W: Write> {
    inner: W,
    cipher: Aes256Gcm,
    pending: Vec<u8>,
}

impl<W: Write> OpenWriter<W> {
    pub(crate) fn new(inner: W, key: &CipherKey) -> CacheResult<Self> {
        Ok(Self { inner, cipher: key.cipher()?, pending: Vec::new() })
    }

    pub(crate) fn push(&mut self, data: &[u8]) -> CacheResult<()> {
        self.pending.extend_from_slice(data);
        let mut consumed = 0;
        while self.pending.len() - consumed >= HEADER_LEN {
            let head = &self.pending[consumed..consumed + HEADER_LEN];
            let mut len4 = [0u8; 4];
            len4.copy_from_slice(&head[..4]);
            let len = u32::from_le_bytes(len4) as usize;
            if !(TAG_LEN..=SEGMENT_LEN + TAG_LEN).contains(&len) {
                return Err(CacheError::DecryptionAuthFailed);
            }
            if self.pending.len() - consumed < HEADER_LEN + len {
                break;
            }
            let nonce = &self.pending[consumed + 4..consumed + HEADER_LEN];
            let body = &self.pending[consumed + HEADER_LEN..consumed + HEADER_LEN + len];
            let plain = self
                .cipher
                .decrypt(Nonce::from_slice(nonce), body)
                .map_err(|_| CacheError::DecryptionAuthFailed)?;
            self.inner.write_all(&plain)?;
            consumed += HEADER_LEN + len;
        }
        self.pending.drain(..consumed);
        Ok(())
    }

    pub(crate) fn finish(self) -> CacheResult<W> {
        if !self.pending.is_empty() {
            return Err(CacheError::Encryption(format!(
                "stream ends inside a segment ({} bytes left over)",
                self.pending.len()
            )));
        }
        Ok(self.inner)
    }
}
