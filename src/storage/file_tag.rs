//! `(file, tag)` metadata: `files/<file>/<tag>/metadata`, holding `size`,
//! `state` and the ordered logical→physical block list. Per the spec's own
//! design notes (§9), the logical→physical mapping is represented here as
//! this ordered `Vec<usize>` of physical block numbers rather than as
//! literal hard-link files under a `logical_blocks/` directory — the
//! `blocks` vector *is* the logical block table, and `BlockPool`'s refcount
//! map is rebuilt from the union of all such vectors. This preserves every
//! observable semantic (dedup, CoW, refcount-zero release) the spec
//! requires without depending on filesystem hard-link counting.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::tools;
use super::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TagState {
    WorkInProgress,
    Committed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTagMetadata {
    pub size: u64,
    pub state: TagState,
    pub blocks: Vec<usize>,
}

impl FileTagMetadata {
    pub fn new_empty() -> Self {
        FileTagMetadata { size: 0, state: TagState::WorkInProgress, blocks: Vec::new() }
    }

    pub fn logical_block_count(block_size: u32, size: u64) -> usize {
        if size == 0 {
            0
        } else {
            ((size + block_size as u64 - 1) / block_size as u64) as usize
        }
    }
}

pub struct FileTagStore {
    root: PathBuf,
}

impl FileTagStore {
    pub fn new(root: PathBuf) -> Self {
        FileTagStore { root }
    }

    fn tag_dir(&self, file: &str, tag: &str) -> PathBuf {
        self.root.join(file).join(tag)
    }

    fn metadata_path(&self, file: &str, tag: &str) -> PathBuf {
        self.tag_dir(file, tag).join("metadata")
    }

    pub fn exists(&self, file: &str, tag: &str) -> bool {
        self.metadata_path(file, tag).is_file()
    }

    pub fn load(&self, file: &str, tag: &str) -> Result<FileTagMetadata, StorageError> {
        let path = self.metadata_path(file, tag);
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(file.into(), tag.into()))
            }
            Err(e) => return Err(StorageError::Io(path.display().to_string(), e)),
        };
        serde_json::from_str(&contents)
            .map_err(|e| StorageError::CorruptMetadata(file.into(), tag.into(), e.to_string()))
    }

    pub fn save(&self, file: &str, tag: &str, meta: &FileTagMetadata) -> Result<(), StorageError> {
        let dir = self.tag_dir(file, tag);
        std::fs::create_dir_all(&dir).map_err(|e| StorageError::Io(dir.display().to_string(), e))?;
        let serialized = serde_json::to_vec_pretty(meta)
            .map_err(|e| StorageError::CorruptMetadata(file.into(), tag.into(), e.to_string()))?;
        tools::file_set_contents(self.metadata_path(file, tag), &serialized)
            .map_err(|e| StorageError::Io(self.metadata_path(file, tag).display().to_string(), e))
    }

    /// Removes the whole `<file>/<tag>` directory. Caller is responsible
    /// for decref-ing the blocks it referenced first.
    pub fn remove(&self, file: &str, tag: &str) -> Result<(), StorageError> {
        let dir = self.tag_dir(file, tag);
        if dir.exists() {
            std::fs::remove_dir_all(&dir).map_err(|e| StorageError::Io(dir.display().to_string(), e))?;
        }
        Ok(())
    }

    /// Walks every `(file, tag)` metadata file under the store root. Used
    /// at start-up to rebuild the block refcount map.
    pub fn walk_all(&self) -> Result<Vec<(String, String, FileTagMetadata)>, StorageError> {
        let mut out = Vec::new();
        if !self.root.exists() {
            return Ok(out);
        }
        for file_entry in std::fs::read_dir(&self.root)
            .map_err(|e| StorageError::Io(self.root.display().to_string(), e))?
        {
            let file_entry = file_entry.map_err(|e| StorageError::Io(self.root.display().to_string(), e))?;
            if !file_entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let file_name = file_entry.file_name().to_string_lossy().to_string();
            for tag_entry in std::fs::read_dir(file_entry.path())
                .map_err(|e| StorageError::Io(file_entry.path().display().to_string(), e))?
            {
                let tag_entry = tag_entry.map_err(|e| StorageError::Io(self.root.display().to_string(), e))?;
                if !tag_entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    continue;
                }
                let tag_name = tag_entry.file_name().to_string_lossy().to_string();
                if let Ok(meta) = self.load(&file_name, &tag_name) {
                    out.push((file_name.clone(), tag_name, meta));
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn save_then_load_roundtrip() {
        let dir = tempdir().unwrap();
        let store = FileTagStore::new(dir.path().join("files"));
        let mut meta = FileTagMetadata::new_empty();
        meta.size = 32;
        meta.blocks = vec![1, 2];
        store.save("f", "BASE", &meta).unwrap();
        assert!(store.exists("f", "BASE"));
        let loaded = store.load("f", "BASE").unwrap();
        assert_eq!(loaded.blocks, vec![1, 2]);
    }

    #[test]
    fn walk_all_finds_every_tag() {
        let dir = tempdir().unwrap();
        let store = FileTagStore::new(dir.path().join("files"));
        store.save("f", "BASE", &FileTagMetadata::new_empty()).unwrap();
        store.save("f", "dev", &FileTagMetadata::new_empty()).unwrap();
        let all = store.walk_all().unwrap();
        assert_eq!(all.len(), 2);
    }
}
