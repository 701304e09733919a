//! Externally owned files served in place as content-addressed blocks.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{CacheError, CacheResult};
use crate::key::{HashAlgorithm, Key};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShareId(pub u64);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareIndex {
    pub path: PathBuf,
    pub block_length: usize,
    /// First block index holding each distinct content.
    pub keys: HashMap<Key, usize>,
}

/// Output of [`ShareRegistry::scan`].
#[derive(Debug)]
pub struct ScannedShare {
    block_length: usize,
    /// Every block's key in file order, duplicates included.
    pub keys: Vec<Key>,
    table: HashMap<Key, usize>,
}

/// Summary row for introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareInfo {
    pub id: ShareId,
    pub path: PathBuf,
    pub block_length: usize,
    pub block_count: usize,
}

#[derive(Debug, Default)]
pub struct ShareRegistry {
    shares: BTreeMap<ShareId, ShareIndex>,
    owners: HashMap<Key, ShareId>,
    next_id: u64,
}

/// Fill `buf` from `r`, stopping early only at end of stream.
pub(crate) fn read_full(r: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

impl ShareRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.owners.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.shares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shares.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.owners.keys()
    }

    pub fn id_for_path(&self, path: &Path) -> Option<ShareId> {
        self.shares.iter().find(|(_, s)| s.path == path).map(|(id, _)| *id)
    }

    pub fn infos(&self) -> Vec<ShareInfo> {
        self.shares
            .iter()
            .map(|(id, s)| ShareInfo {
                id: *id,
                path: s.path.clone(),
                block_length: s.block_length,
                block_count: s.keys.len(),
            })
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ShareId, &ShareIndex)> {
        self.shares.iter()
    }

    /// Hash `reader` in `block_length` chunks. Needs no registry state, so callers run it
    /// outside the engine lock.
    pub fn scan(
        reader: &mut impl Read,
        block_length: usize,
        algorithm: HashAlgorithm,
    ) -> CacheResult<ScannedShare> {
        if block_length == 0 {
            return Err(CacheError::InvalidArgument("share block length must be non-zero".into()));
        }
        let mut keys = Vec::new();
        let mut table = HashMap::new();
        let mut buf = vec![0u8; block_length];
        loop {
            let n = read_full(reader, &mut buf)?;
            if n == 0 {
                break;
            }
            let key = Key::compute(algorithm, &buf[..n]);
            table.entry(key.clone()).or_insert(keys.len());
            keys.push(key);
            if n < block_length {
                break;
            }
        }
        Ok(ScannedShare { block_length, keys, table })
    }

    /// Register scanned blocks as living in `path`, replacing any earlier share of that path.
    /// Returns the new id and the keys of the replaced share.
    pub fn register(&mut self, path: &Path, scanned: ScannedShare) -> (ShareId, Vec<Key>) {
        let replaced = match self.id_for_path(path) {
            Some(old) => self.unregister(old).unwrap_or_default(),
            None => Vec::new(),
        };
        let id = ShareId(self.next_id);
        self.next_id += 1;
        for k in scanned.table.keys() {
            self.owners.entry(k.clone()).or_insert(id);
        }
        debug!(
            path = %path.display(),
            blocks = scanned.keys.len(),
            distinct = scanned.table.len(),
            "registered share"
        );
        let share = ShareIndex {
            path: path.to_path_buf(),
            block_length: scanned.block_length,
            keys: scanned.table,
        };
        self.shares.insert(id, share);
        (id, replaced)
    }

    /// Re-insert a persisted share, keeping its id.
    pub fn restore(&mut self, id: ShareId, share: ShareIndex) {
        for k in share.keys.keys() {
            self.owners.entry(k.clone()).or_insert(id);
        }
        self.next_id = self.next_id.max(id.0 + 1);
        self.shares.insert(id, share);
    }

    /// Drop a share; returns the keys it was serving.
    pub fn unregister(&mut self, id: ShareId) -> Option<Vec<Key>> {
        let share = self.shares.remove(&id)?;
        let keys: Vec<Key> = share.keys.into_keys().collect();
        for k in &keys {
            if self.owners.get(k) != Some(&id) {
                continue;
            }
            let next = self.shares.iter().find(|(_, s)| s.keys.contains_key(k)).map(|(i, _)| *i);
            match next {
                Some(other) => {
                    self.owners.insert(k.clone(), other);
                }
                None => {
                    self.owners.remove(k);
                }
            }
        }
        Some(keys)
    }

    /// Drop every share whose file no longer exists; returns the keys they served.
    pub fn prune_missing(&mut self) -> Vec<Key> {
        let gone: Vec<ShareId> =
            self.shares.iter().filter(|(_, s)| !s.path.is_file()).map(|(id, _)| *id).collect();
        let mut keys = Vec::new();
        for id in gone {
            warn!(share = id.0, "shared file vanished, dropping share");
            keys.extend(self.unregister(id).unwrap_or_default());
        }
        keys
    }

    fn locate(&self, key: &Key) -> Option<(ShareId, &ShareIndex, usize)> {
        let id = *self.owners.get(key)?;
        let share = self.shares.get(&id)?;
        let block = *share.keys.get(key)?;
        Some((id, share, block))
    }

    /// Current length of the block for `key`, or `None` if it is not shared.
    pub fn length_of(&self, key: &Key) -> Option<io::Result<usize>> {
        let (_, share, block) = self.locate(key)?;
        Some(share.path.metadata().map(|m| {
            let offset = (block * share.block_length) as u64;
            m.len().saturating_sub(offset).min(share.block_length as u64) as usize
        }))
    }

    /// Read and verify the block for `key`.
    ///
    /// `Err` carries the keys of the share that was dropped because the read failed; the
    /// caller clears their presence and reports `BlockNotFound`. `Ok(None)` means the key
    /// is not shared at all.
    pub fn read(&mut self, key: &Key) -> Result<Option<Vec<u8>>, Vec<Key>> {
        let Some((id, share, block)) = self.locate(key) else {
            return Ok(None);
        };
        match read_block(&share.path, block, share.block_length) {
            Ok(data) if key.verify(&data) => Ok(Some(data)),
            Ok(_) => {
                warn!(
                    share = id.0,
                    path = %share.path.display(),
                    block,
                    "shared block hash mismatch"
                );
                Err(self.unregister(id).unwrap_or_default())
            }
            Err(e) => {
                warn!(
                    share = id.0,
                    path = %share.path.display(),
                    block,
                    error = %e,
                    "shared block unreadable"
                );
                Err(self.unregister(id).unwrap_or_default())
            }
        }
    }
}

fn read_block(path: &Path, block: usize, block_length: usize) -> io::Result<Vec<u8>> {
    let mut f = File::open(path)?;
    let len = f.metadata()?.len();
    let offset = (block * block_length) as u64;
    if offset >= len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("block {} starts at {} past file end {}", block, offset, len),
        ));
    }
    let want = (len - offset).min(block_length as u64) as usize;
    let mut buf = vec![0u8; want];
    f.seek(SeekFrom::Start(offset))?;
    f.read_exact(&mut buf)?;
    Ok(buf)
}
