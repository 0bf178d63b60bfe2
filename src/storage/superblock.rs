//! `superblock` file: the two numbers every other structure is sized from.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::tools;
use super::StorageError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Superblock {
    pub fs_size: u64,
    pub block_size: u32,
}

impl Superblock {
    pub fn total_blocks(&self) -> usize {
        ((self.fs_size + self.block_size as u64 - 1) / self.block_size as u64) as usize
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let map = crate::config::load_kv(path)
            .map_err(|e| StorageError::InvalidSuperblock(e.to_string()))?;
        Self::from_map(&map)
    }

    fn from_map(map: &HashMap<String, String>) -> Result<Self, StorageError> {
        let fs_size = map
            .get("FS_SIZE")
            .ok_or_else(|| StorageError::InvalidSuperblock("missing FS_SIZE".into()))?
            .parse()
            .map_err(|_| StorageError::InvalidSuperblock("bad FS_SIZE".into()))?;
        let block_size = map
            .get("BLOCK_SIZE")
            .ok_or_else(|| StorageError::InvalidSuperblock("missing BLOCK_SIZE".into()))?
            .parse()
            .map_err(|_| StorageError::InvalidSuperblock("bad BLOCK_SIZE".into()))?;
        Ok(Superblock { fs_size, block_size })
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), StorageError> {
        let contents = format!("FS_SIZE={}\nBLOCK_SIZE={}\n", self.fs_size, self.block_size);
        tools::file_set_contents(path.as_ref(), contents.as_bytes())
            .map_err(|e| StorageError::Io(path.as_ref().display().to_string(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn roundtrips_through_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("superblock");
        let sb = Superblock { fs_size: 1024 * 1024, block_size: 4096 };
        sb.save(&path).unwrap();
        let loaded = Superblock::load(&path).unwrap();
        assert_eq!(loaded.fs_size, sb.fs_size);
        assert_eq!(loaded.block_size, sb.block_size);
        assert_eq!(loaded.total_blocks(), 256);
    }
}
