//! The storage engine: ties superblock, bitmap/block-pool, file/tag
//! metadata and the hash index together and implements the nine
//! operations of §4.3/§4.4. One engine-wide lock (held by the caller, see
//! `protocol.rs`) makes every operation below atomic with respect to every
//! other — the engine itself assumes single-writer access.

use std::path::PathBuf;
use std::time::Duration;

use log::{debug, info};

use super::block_pool::{BlockPool, INITIAL_BLOCK};
use super::file_tag::{FileTagMetadata, FileTagStore, TagState};
use super::hash_index::{digest_of, HashIndex};
use super::superblock::Superblock;
use super::StorageError;

pub const INITIAL_FILE: &str = "initial_file";
pub const INITIAL_TAG: &str = "BASE";

pub struct StorageEngine {
    root: PathBuf,
    superblock: Superblock,
    pool: BlockPool,
    files: FileTagStore,
    hash_index: HashIndex,
}

impl StorageEngine {
    pub fn new(
        root: PathBuf,
        fs_size: u64,
        block_size: u32,
        fresh_start: bool,
        operation_delay: Duration,
        block_access_delay: Duration,
    ) -> Result<Self, StorageError> {
        std::fs::create_dir_all(&root).map_err(|e| StorageError::Io(root.display().to_string(), e))?;

        let superblock_path = root.join("superblock");
        let bitmap_path = root.join("bitmap");
        let blocks_dir = root.join("physical_blocks");
        let files_dir = root.join("files");
        let hash_index_path = root.join("hash_index");

        if fresh_start {
            info!("storage: fresh start requested, wiping {:?}", root);
            let _ = std::fs::remove_file(&superblock_path);
            let _ = std::fs::remove_file(&bitmap_path);
            let _ = std::fs::remove_file(&hash_index_path);
            let _ = std::fs::remove_dir_all(&blocks_dir);
            let _ = std::fs::remove_dir_all(&files_dir);
        }

        let superblock = if superblock_path.exists() {
            Superblock::load(&superblock_path)?
        } else {
            let sb = Superblock { fs_size, block_size };
            sb.save(&superblock_path)?;
            sb
        };

        let total_blocks = superblock.total_blocks();
        let mut pool = BlockPool::open(
            blocks_dir,
            superblock.block_size,
            total_blocks,
            &bitmap_path,
            operation_delay,
            block_access_delay,
        )?;
        let files = FileTagStore::new(files_dir);
        let hash_index = HashIndex::load(&hash_index_path)?;

        let mut engine = StorageEngine { root, superblock, pool, files, hash_index };

        if fresh_start || !engine.files.exists(INITIAL_FILE, INITIAL_TAG) {
            engine.seed_initial_block()?;
        }

        let all_blocks = engine.files.walk_all()?;
        engine.pool.rebuild_refcounts(all_blocks.iter().flat_map(|(_, _, m)| m.blocks.iter().copied()));

        Ok(engine)
    }

    fn seed_initial_block(&mut self) -> Result<(), StorageError> {
        self.pool.reserve_initial_block()?;
        let meta = FileTagMetadata {
            size: self.pool.block_size() as u64,
            state: TagState::Committed,
            blocks: vec![INITIAL_BLOCK],
        };
        self.files.save(INITIAL_FILE, INITIAL_TAG, &meta)
    }

    fn require_not_committed(&self, file: &str, tag: &str, meta: &FileTagMetadata) -> Result<(), StorageError> {
        if meta.state == TagState::Committed {
            return Err(StorageError::Committed(file.into(), tag.into()));
        }
        Ok(())
    }

    /// Releases a logical block's reference. Before the refcount drop can
    /// free the physical block for reuse by `allocate`, drops the hash
    /// index's entry for its current content if this block is still the
    /// one that entry points at — otherwise a later writer of the same
    /// content this block used to hold could be dedup-linked to whatever
    /// unrelated bytes end up reallocated into it.
    fn release_block(&mut self, block: usize) -> Result<(), StorageError> {
        if block != INITIAL_BLOCK {
            let content = self.pool.read_block(block)?;
            let digest = digest_of(&content);
            self.hash_index.remove_if(&digest, block)?;
        }
        self.pool.decref(block)
    }

    pub fn create(&mut self, file: &str, tag: &str) -> Result<(), StorageError> {
        self.pool.simulate_operation_delay();
        if self.files.exists(file, tag) {
            return Err(StorageError::AlreadyExists(file.into(), tag.into()));
        }
        self.files.save(file, tag, &FileTagMetadata::new_empty())?;
        debug!("storage: CREATE {}:{}", file, tag);
        Ok(())
    }

    pub fn truncate(&mut self, file: &str, tag: &str, size: u64) -> Result<(), StorageError> {
        self.pool.simulate_operation_delay();
        let mut meta = self.files.load(file, tag)?;
        self.require_not_committed(file, tag, &meta)?;

        let block_size = self.pool.block_size();
        let new_count = FileTagMetadata::logical_block_count(block_size, size);

        if new_count < meta.blocks.len() {
            for block in meta.blocks.split_off(new_count) {
                self.release_block(block)?;
            }
        } else {
            while meta.blocks.len() < new_count {
                self.pool.incref(INITIAL_BLOCK);
                meta.blocks.push(INITIAL_BLOCK);
            }
        }
        meta.size = size;
        self.files.save(file, tag, &meta)?;
        debug!("storage: TRUNCATE {}:{} -> {} bytes", file, tag, size);
        Ok(())
    }

    pub fn write(&mut self, file: &str, tag: &str, offset: u64, content: &[u8]) -> Result<usize, StorageError> {
        self.pool.simulate_operation_delay();
        let mut meta = self.files.load(file, tag)?;
        self.require_not_committed(file, tag, &meta)?;

        if offset >= meta.size {
            return Ok(0);
        }
        let usable = content.len().min((meta.size - offset) as usize);
        let block_size = self.pool.block_size() as u64;

        let mut written = 0usize;
        while written < usable {
            let abs = offset + written as u64;
            let logical_index = (abs / block_size) as usize;
            let in_block_offset = (abs % block_size) as usize;
            let chunk_len = (block_size as usize - in_block_offset).min(usable - written);

            let phys = meta.blocks[logical_index];
            let target = if self.pool.is_shared(phys) {
                let data = self.pool.read_block(phys)?;
                let new_block = self.pool.allocate(&data)?;
                self.pool.decref(phys)?;
                meta.blocks[logical_index] = new_block;
                new_block
            } else {
                phys
            };

            let mut block_bytes = self.pool.read_block(target)?;
            block_bytes[in_block_offset..in_block_offset + chunk_len]
                .copy_from_slice(&content[written..written + chunk_len]);
            self.pool.write_block(target, &block_bytes)?;

            written += chunk_len;
        }

        self.files.save(file, tag, &meta)?;
        debug!("storage: WRITE {}:{} @{} ({} bytes)", file, tag, offset, written);
        Ok(written)
    }

    pub fn read(&mut self, file: &str, tag: &str, offset: u64, size: u64) -> Result<Vec<u8>, StorageError> {
        self.pool.simulate_operation_delay();
        let meta = self.files.load(file, tag)?;

        if offset >= meta.size {
            return Ok(Vec::new());
        }
        let usable = size.min(meta.size - offset) as usize;
        let block_size = self.pool.block_size() as u64;

        let mut out = Vec::with_capacity(usable);
        let mut read_so_far = 0usize;
        while read_so_far < usable {
            let abs = offset + read_so_far as u64;
            let logical_index = (abs / block_size) as usize;
            let in_block_offset = (abs % block_size) as usize;
            let chunk_len = (block_size as usize - in_block_offset).min(usable - read_so_far);

            let phys = meta.blocks[logical_index];
            let block_bytes = self.pool.read_block(phys)?;
            out.extend_from_slice(&block_bytes[in_block_offset..in_block_offset + chunk_len]);
            read_so_far += chunk_len;
        }
        Ok(out)
    }

    /// Independent deep copy: `dst_tag` gets freshly allocated physical
    /// blocks initialised with `src_tag`'s content. No CoW sharing at
    /// creation time, by design (spec §4.3).
    pub fn tag(&mut self, file: &str, src_tag: &str, dst_file: &str, dst_tag: &str) -> Result<(), StorageError> {
        self.pool.simulate_operation_delay();
        if file != dst_file {
            return Err(StorageError::TagFileMismatch(format!("{} != {}", file, dst_file)));
        }
        if self.files.exists(file, dst_tag) {
            return Err(StorageError::AlreadyExists(file.into(), dst_tag.into()));
        }
        let src = self.files.load(file, src_tag)?;

        let mut new_blocks = Vec::with_capacity(src.blocks.len());
        for &block in &src.blocks {
            let content = self.pool.read_block(block)?;
            let fresh = self.pool.allocate(&content)?;
            new_blocks.push(fresh);
        }

        let dst_meta = FileTagMetadata { size: src.size, state: TagState::WorkInProgress, blocks: new_blocks };
        self.files.save(file, dst_tag, &dst_meta)?;
        debug!("storage: TAG {}:{} -> {}:{}", file, src_tag, dst_file, dst_tag);
        Ok(())
    }

    /// Flush implies durability; in this engine every mutating operation
    /// already fsyncs its blocks/metadata before returning OK, so FLUSH is
    /// a durability no-op beyond confirming the tag isn't already gone.
    pub fn flush(&mut self, file: &str, tag: &str) -> Result<(), StorageError> {
        self.pool.simulate_operation_delay();
        let meta = self.files.load(file, tag)?;
        if meta.state == TagState::Committed {
            return Ok(());
        }
        self.files.save(file, tag, &meta)
    }

    /// Implicit FLUSH, then per physical block: hash content, consult the
    /// hash index, re-link duplicates to the canonical block, register new
    /// hashes, and mark COMMITTED.
    pub fn commit(&mut self, file: &str, tag: &str) -> Result<(), StorageError> {
        self.flush(file, tag)?;
        self.pool.simulate_operation_delay();
        let mut meta = self.files.load(file, tag)?;
        if meta.state == TagState::Committed {
            return Ok(());
        }

        for slot in meta.blocks.iter_mut() {
            let block = *slot;
            let content = self.pool.read_block(block)?;
            let digest = digest_of(&content);

            match self.hash_index.lookup(&digest) {
                Some(canonical) if canonical != block => {
                    self.pool.incref(canonical);
                    self.pool.decref(block)?;
                    *slot = canonical;
                    debug!("storage: COMMIT dedup block {} -> canonical {}", block, canonical);
                }
                Some(_) => {}
                None => {
                    self.hash_index.insert(digest, block)?;
                }
            }
        }

        meta.state = TagState::Committed;
        self.files.save(file, tag, &meta)?;
        info!("storage: COMMIT {}:{}", file, tag);
        Ok(())
    }

    pub fn delete(&mut self, file: &str, tag: &str) -> Result<(), StorageError> {
        self.pool.simulate_operation_delay();
        if file == INITIAL_FILE && tag == INITIAL_TAG {
            return Err(StorageError::CannotDeleteInitial);
        }
        let meta = self.files.load(file, tag)?;
        for block in &meta.blocks {
            self.release_block(*block)?;
        }
        self.files.remove(file, tag)?;
        info!("storage: DELETE {}:{}", file, tag);
        Ok(())
    }

    pub fn block_size(&self) -> u32 {
        self.superblock.block_size
    }

    pub fn mount_point(&self) -> &std::path::Path {
        &self.root
    }

    /// Testable invariant #3: allocated bitmap bits equal the union of all
    /// `(file, tag)` block lists plus block 0.
    #[cfg(test)]
    pub(crate) fn bitmap_matches_metadata(&self) -> Result<bool, StorageError> {
        use std::collections::HashSet;
        let mut expected: HashSet<usize> = self
            .files
            .walk_all()?
            .into_iter()
            .flat_map(|(_, _, m)| m.blocks.into_iter())
            .collect();
        expected.insert(INITIAL_BLOCK);
        let actual: HashSet<usize> = self.pool.allocated_blocks().into_iter().collect();
        Ok(expected == actual)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn engine(dir: &std::path::Path) -> StorageEngine {
        StorageEngine::new(
            dir.to_path_buf(),
            16 * 16,
            16,
            true,
            Duration::from_millis(0),
            Duration::from_millis(0),
        )
        .unwrap()
    }

    #[test]
    fn create_truncate_write_read_roundtrip() {
        let dir = tempdir().unwrap();
        let mut eng = engine(dir.path());
        eng.create("f", "BASE").unwrap();
        eng.truncate("f", "BASE", 16).unwrap();
        let n = eng.write("f", "BASE", 0, b"abcdefghijklmnop").unwrap();
        assert_eq!(n, 16);
        let data = eng.read("f", "BASE", 0, 16).unwrap();
        assert_eq!(data, b"abcdefghijklmnop");
    }

    #[test]
    fn truncate_zero_then_blocksize_is_zero_filled() {
        let dir = tempdir().unwrap();
        let mut eng = engine(dir.path());
        eng.create("f", "BASE").unwrap();
        eng.truncate("f", "BASE", 0).unwrap();
        eng.truncate("f", "BASE", 16).unwrap();
        let data = eng.read("f", "BASE", 0, 16).unwrap();
        assert_eq!(data, vec![0u8; 16]);
    }

    #[test]
    fn write_on_committed_file_is_rejected() {
        let dir = tempdir().unwrap();
        let mut eng = engine(dir.path());
        eng.create("f", "BASE").unwrap();
        eng.truncate("f", "BASE", 16).unwrap();
        eng.commit("f", "BASE").unwrap();
        let err = eng.write("f", "BASE", 0, b"x").unwrap_err();
        assert!(matches!(err, StorageError::Committed(_, _)));
    }

    #[test]
    fn tag_then_write_leaves_source_untouched() {
        let dir = tempdir().unwrap();
        let mut eng = engine(dir.path());
        eng.create("f", "BASE").unwrap();
        eng.truncate("f", "BASE", 16).unwrap();
        eng.write("f", "BASE", 0, b"hello...........").unwrap();
        eng.commit("f", "BASE").unwrap();

        eng.tag("f", "BASE", "f", "dev").unwrap();
        eng.write("f", "dev", 0, b"world").unwrap();

        assert_eq!(&eng.read("f", "BASE", 0, 5).unwrap(), b"hello");
        assert_eq!(&eng.read("f", "dev", 0, 5).unwrap(), b"world");
    }

    #[test]
    fn commit_deduplicates_identical_blocks() {
        let dir = tempdir().unwrap();
        let mut eng = engine(dir.path());
        eng.create("f", "BASE").unwrap();
        eng.truncate("f", "BASE", 32).unwrap();
        eng.write("f", "BASE", 0, b"abcdabcdabcdabcd").unwrap();
        eng.write("f", "BASE", 16, b"abcdabcdabcdabcd").unwrap();
        eng.commit("f", "BASE").unwrap();

        let meta = eng.files.load("f", "BASE").unwrap();
        assert_eq!(meta.blocks[0], meta.blocks[1]);
        assert!(eng.bitmap_matches_metadata().unwrap());
    }

    #[test]
    fn delete_then_reuse_does_not_poison_hash_index() {
        let dir = tempdir().unwrap();
        let mut eng = engine(dir.path());

        eng.create("f", "BASE").unwrap();
        eng.truncate("f", "BASE", 16).unwrap();
        eng.write("f", "BASE", 0, b"AAAAAAAAAAAAAAAA").unwrap();
        eng.commit("f", "BASE").unwrap();
        eng.delete("f", "BASE").unwrap();

        // Reuses the block f:BASE just freed, with unrelated content.
        eng.create("g", "BASE").unwrap();
        eng.truncate("g", "BASE", 16).unwrap();
        eng.write("g", "BASE", 0, b"BBBBBBBBBBBBBBBB").unwrap();

        // Same content f:BASE used to hold, on a different physical block.
        eng.create("h", "BASE").unwrap();
        eng.truncate("h", "BASE", 16).unwrap();
        eng.write("h", "BASE", 0, b"AAAAAAAAAAAAAAAA").unwrap();
        eng.commit("h", "BASE").unwrap();

        assert_eq!(&eng.read("h", "BASE", 0, 16).unwrap(), b"AAAAAAAAAAAAAAAA");
        assert_eq!(&eng.read("g", "BASE", 0, 16).unwrap(), b"BBBBBBBBBBBBBBBB");
        assert!(eng.bitmap_matches_metadata().unwrap());
    }

    #[test]
    fn delete_of_initial_file_is_rejected() {
        let dir = tempdir().unwrap();
        let mut eng = engine(dir.path());
        let err = eng.delete(INITIAL_FILE, INITIAL_TAG).unwrap_err();
        assert!(matches!(err, StorageError::CannotDeleteInitial));
    }

    #[test]
    fn delete_releases_blocks_and_bitmap_stays_consistent() {
        let dir = tempdir().unwrap();
        let mut eng = engine(dir.path());
        eng.create("f", "BASE").unwrap();
        eng.truncate("f", "BASE", 32).unwrap();
        eng.write("f", "BASE", 0, &vec![7u8; 32]).unwrap();
        eng.delete("f", "BASE").unwrap();
        assert!(eng.bitmap_matches_metadata().unwrap());
    }

    #[test]
    fn tag_of_different_file_is_rejected() {
        let dir = tempdir().unwrap();
        let mut eng = engine(dir.path());
        eng.create("f", "BASE").unwrap();
        let err = eng.tag("f", "BASE", "g", "dev").unwrap_err();
        assert!(matches!(err, StorageError::TagFileMismatch(_)));
    }
}
