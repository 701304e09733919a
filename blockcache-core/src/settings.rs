use crate::group::{Index, Seed};
use crate::key::Key;
use crate::key_index::Clusters;
use crate::share::{ShareId, ShareIndex};
use anyhow::{bail, Context, Result};
use crc32fast::Hasher as Crc32;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Descriptor at the start of the blob.
/// Format: magic (8) + NUL (1) + schema_version (u32 LE) + codec_id (u32 LE) + flags (u32 LE)
const DESC_MAGIC: &[u8] = b"BCSETTNG";
const DESC_LEN: usize = DESC_MAGIC.len() + 1 + 4 + 4 + 4;
const SCHEMA_VERSION: u32 = 1;
const CODEC_ZSTD: u32 = 1;

/// Fixed trailer at EOF locating the payload.
/// Format: magic (8) + NUL (1) + off (u64 LE) + len (u32 LE) + crc32 (u32 LE)
const TRAILER_MAGIC: &[u8] = b"BCSETEND";
const TRAILER_LEN: u64 = 8 + 1 + 8 + 4 + 4;

/// Everything needed to rebuild the in-memory engine state.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct CacheSettings {
    pub size: u64,
    pub clusters: Vec<(Key, Clusters)>,
    pub shares: Vec<(ShareId, ShareIndex)>,
    pub seeds: Vec<(Seed, Vec<Index>)>,
}

impl CacheSettings {
    fn entry_count(&self) -> usize {
        self.clusters.len()
            + self.shares.iter().map(|(_, s)| s.keys.len()).sum::<usize>()
            + self.seeds.len()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SettingsLimits {
    pub max_uncompressed_bytes: usize,
    pub max_entries: usize,
}

impl Default for SettingsLimits {
    fn default() -> Self {
        Self { max_uncompressed_bytes: 256 * 1024 * 1024, max_entries: 20_000_000 }
    }
}

/// Write the settings blob to a sibling temp file, then rename it over `path`.
pub fn write_settings(path: &Path, settings: &CacheSettings) -> Result<()> {
    let raw = bincode::serialize(settings).context("serialize settings")?;
    let compressed = zstd::stream::encode_all(&raw[..], 0).context("zstd compress settings")?;

    let mut desc = Vec::with_capacity(DESC_LEN);
    desc.extend_from_slice(DESC_MAGIC);
    desc.push(0);
    desc.extend_from_slice(&SCHEMA_VERSION.to_le_bytes());
    desc.extend_from_slice(&CODEC_ZSTD.to_le_bytes());
    desc.extend_from_slice(&0u32.to_le_bytes()); // flags

    let mut h = Crc32::new();
    h.update(&compressed);
    let crc = h.finalize();
    let payload_off = desc.len() as u64;
    let payload_len = u32::try_from(compressed.len()).context("settings payload over 4 GiB")?;

    let tmp = path.with_extension("tmp");
    {
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)
            .with_context(|| format!("create {:?}", tmp))?;
        f.write_all(&desc)?;
        f.write_all(&compressed)?;
        let mut tr = Vec::with_capacity(TRAILER_LEN as usize);
        tr.extend_from_slice(TRAILER_MAGIC);
        tr.push(0);
        tr.extend_from_slice(&payload_off.to_le_bytes());
        tr.extend_from_slice(&payload_len.to_le_bytes());
        tr.extend_from_slice(&crc.to_le_bytes());
        f.write_all(&tr)?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp, path).with_context(|| format!("rename {:?} -> {:?}", tmp, path))?;
    Ok(())
}

/// Read trailer at EOF; returns (payload_off, payload_len, crc32)
pub fn read_trailer(f: &mut File) -> Result<(u64, u32, u32)> {
    let flen = f.metadata()?.len();
    if flen < TRAILER_LEN + DESC_LEN as u64 {
        bail!("settings file too short");
    }
    f.seek(SeekFrom::Start(flen - TRAILER_LEN))?;
    let mut tr = vec![0u8; TRAILER_LEN as usize];
    f.read_exact(&mut tr)?;
    if &tr[..8] != TRAILER_MAGIC || tr[8] != 0 {
        bail!("bad settings trailer magic");
    }
    let mut off8 = [0u8; 8];
    off8.copy_from_slice(&tr[9..17]);
    let mut len4 = [0u8; 4];
    len4.copy_from_slice(&tr[17..21]);
    let mut crc4 = [0u8; 4];
    crc4.copy_from_slice(&tr[21..25]);
    Ok((u64::from_le_bytes(off8), u32::from_le_bytes(len4), u32::from_le_bytes(crc4)))
}

/// Verify descriptor and CRC, decompress, and decode with limits applied.
pub fn read_settings(path: &Path, limits: &SettingsLimits) -> Result<CacheSettings> {
    let mut f = File::open(path).with_context(|| format!("open {:?}", path))?;
    let (off, len, crc) = read_trailer(&mut f)?;

    let mut desc = vec![0u8; DESC_LEN];
    f.seek(SeekFrom::Start(0))?;
    f.read_exact(&mut desc)?;
    if &desc[..DESC_MAGIC.len()] != DESC_MAGIC || desc[DESC_MAGIC.len()] != 0 {
        bail!("bad settings descriptor magic");
    }
    let mut u4 = [0u8; 4];
    u4.copy_from_slice(&desc[DESC_MAGIC.len() + 1..DESC_MAGIC.len() + 5]);
    let schema = u32::from_le_bytes(u4);
    u4.copy_from_slice(&desc[DESC_MAGIC.len() + 5..DESC_MAGIC.len() + 9]);
    let codec = u32::from_le_bytes(u4);
    if schema != SCHEMA_VERSION || codec != CODEC_ZSTD {
        bail!("unsupported settings schema {} / codec {}", schema, codec);
    }

    let mut buf = vec![0u8; len as usize];
    f.seek(SeekFrom::Start(off))?;
    f.read_exact(&mut buf)?;
    let mut h = Crc32::new();
    h.update(&buf);
    if h.finalize() != crc {
        bail!("settings CRC mismatch");
    }
    let decompressed = zstd::stream::decode_all(&buf[..]).context("zstd decompress settings")?;
    if decompressed.len() > limits.max_uncompressed_bytes {
        bail!("settings too large: {} bytes", decompressed.len());
    }
    let settings: CacheSettings =
        bincode::deserialize(&decompressed).context("bincode settings decode")?;
    if settings.entry_count() > limits.max_entries {
        bail!("too many settings entries");
    }
    Ok(settings)
}
