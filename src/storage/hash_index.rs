//! content-hash → physical-block-number map, populated at COMMIT and used
//! to detect and collapse duplicate content.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use openssl::sha::Sha256;
use serde::{Deserialize, Serialize};

use crate::tools;
use super::StorageError;

pub type Digest = [u8; 32];

pub fn digest_of(data: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finish()
}

fn digest_hex(d: &Digest) -> String {
    d.iter().map(|b| format!("{:02x}", b)).collect()
}

#[derive(Default, Serialize, Deserialize)]
struct OnDisk {
    entries: HashMap<String, usize>,
}

pub struct HashIndex {
    path: PathBuf,
    map: HashMap<Digest, usize>,
}

impl HashIndex {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let map = match std::fs::read_to_string(&path) {
            Ok(contents) => {
                let on_disk: OnDisk = serde_json::from_str(&contents)
                    .map_err(|e| StorageError::CorruptMetadata("hash_index".into(), "".into(), e.to_string()))?;
                on_disk
                    .entries
                    .into_iter()
                    .filter_map(|(hex, block)| parse_hex(&hex).map(|d| (d, block)))
                    .collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(StorageError::Io(path.display().to_string(), e)),
        };
        Ok(HashIndex { path, map })
    }

    pub fn lookup(&self, digest: &Digest) -> Option<usize> {
        self.map.get(digest).copied()
    }

    /// Inserts `digest -> block` and persists the index durably.
    pub fn insert(&mut self, digest: Digest, block: usize) -> Result<(), StorageError> {
        self.map.insert(digest, block);
        self.persist()
    }

    /// Drops the mapping for `digest` if it currently points at `block`
    /// (called when that physical block is released).
    pub fn remove_if(&mut self, digest: &Digest, block: usize) -> Result<(), StorageError> {
        if self.map.get(digest) == Some(&block) {
            self.map.remove(digest);
            self.persist()?;
        }
        Ok(())
    }

    fn persist(&self) -> Result<(), StorageError> {
        let on_disk = OnDisk {
            entries: self.map.iter().map(|(d, b)| (digest_hex(d), *b)).collect(),
        };
        let serialized = serde_json::to_vec_pretty(&on_disk)
            .map_err(|e| StorageError::CorruptMetadata("hash_index".into(), "".into(), e.to_string()))?;
        tools::file_set_contents(&self.path, &serialized)
            .map_err(|e| StorageError::Io(self.path.display().to_string(), e))
    }
}

fn parse_hex(hex: &str) -> Option<Digest> {
    if hex.len() != 64 {
        return None;
    }
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn insert_lookup_persist_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hash_index");
        let d = digest_of(b"abcdabcdabcdabcd");
        {
            let mut idx = HashIndex::load(&path).unwrap();
            idx.insert(d, 7).unwrap();
        }
        let idx = HashIndex::load(&path).unwrap();
        assert_eq!(idx.lookup(&d), Some(7));
    }

    #[test]
    fn remove_if_only_matches_owner_block() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hash_index");
        let d = digest_of(b"content");
        let mut idx = HashIndex::load(&path).unwrap();
        idx.insert(d, 3).unwrap();
        idx.remove_if(&d, 4).unwrap();
        assert_eq!(idx.lookup(&d), Some(3));
        idx.remove_if(&d, 3).unwrap();
        assert_eq!(idx.lookup(&d), None);
    }
}
