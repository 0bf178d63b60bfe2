//! The physical block pool: `physical_blocks/block%04d` files, the bitmap
//! allocator over them, and the in-memory refcount used to decide whether
//! a block is "shared" (refcount >= 2, or block 0 — see spec §9 design
//! notes: an explicit refcount is equivalent to, and cheaper than,
//! scanning hard links across all `(file, tag)` metadata).

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use super::bitmap::Bitmap;
use super::StorageError;

pub const INITIAL_BLOCK: usize = 0;

pub struct BlockPool {
    dir: PathBuf,
    block_size: u32,
    bitmap: Bitmap,
    refcounts: HashMap<usize, u32>,
    operation_delay: Duration,
    block_access_delay: Duration,
}

fn block_path(dir: &Path, block: usize) -> PathBuf {
    dir.join(format!("block{:04}", block))
}

impl BlockPool {
    pub fn open(
        dir: PathBuf,
        block_size: u32,
        total_blocks: usize,
        bitmap_path: &Path,
        operation_delay: Duration,
        block_access_delay: Duration,
    ) -> Result<Self, StorageError> {
        std::fs::create_dir_all(&dir).map_err(|e| StorageError::Io(dir.display().to_string(), e))?;
        let bitmap = Bitmap::open(bitmap_path, total_blocks)?;
        Ok(BlockPool {
            dir,
            block_size,
            bitmap,
            refcounts: HashMap::new(),
            operation_delay,
            block_access_delay,
        })
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn simulate_operation_delay(&self) {
        if !self.operation_delay.is_zero() {
            thread::sleep(self.operation_delay);
        }
    }

    fn simulate_block_delay(&self) {
        if !self.block_access_delay.is_zero() {
            thread::sleep(self.block_access_delay);
        }
    }

    /// Seeds the refcount map from the union of all logical block lists
    /// across all `(file, tag)` metadata on disk, plus `initial_file:BASE`
    /// keeping block 0 alive. Called once at engine start-up.
    pub fn rebuild_refcounts<I: IntoIterator<Item = usize>>(&mut self, all_block_refs: I) {
        self.refcounts.clear();
        self.refcounts.insert(INITIAL_BLOCK, 1);
        for b in all_block_refs {
            *self.refcounts.entry(b).or_insert(0) += 1;
        }
    }

    pub fn refcount(&self, block: usize) -> u32 {
        self.refcounts.get(&block).copied().unwrap_or(0)
    }

    pub fn is_shared(&self, block: usize) -> bool {
        block == INITIAL_BLOCK || self.refcount(block) >= 2
    }

    pub fn incref(&mut self, block: usize) {
        *self.refcounts.entry(block).or_insert(0) += 1;
    }

    /// Decrements the refcount; if it drops to zero (and this isn't block
    /// 0) frees the physical block and its bitmap bit.
    pub fn decref(&mut self, block: usize) -> Result<(), StorageError> {
        if block == INITIAL_BLOCK {
            return Ok(());
        }
        let remaining = match self.refcounts.get_mut(&block) {
            Some(count) if *count > 0 => {
                *count -= 1;
                *count
            }
            _ => 0,
        };
        if remaining == 0 {
            self.refcounts.remove(&block);
            self.bitmap.free(block)?;
        }
        Ok(())
    }

    /// Marks block 0 allocated and zero-fills it, idempotently. Block 0 is
    /// never handed out by `allocate` (first-fit starts at index 1), so
    /// this is the only path that brings it into existence.
    pub fn reserve_initial_block(&mut self) -> Result<(), StorageError> {
        if !self.bitmap.is_allocated(INITIAL_BLOCK) {
            self.bitmap.allocate(INITIAL_BLOCK)?;
            let zero = vec![0u8; self.block_size as usize];
            self.write_block_raw(INITIAL_BLOCK, &zero)?;
        }
        self.refcounts.insert(INITIAL_BLOCK, 1);
        Ok(())
    }

    /// Allocates a fresh physical block via linear first-fit scan,
    /// initializes its content on disk, and gives it refcount 1.
    pub fn allocate(&mut self, initial_content: &[u8]) -> Result<usize, StorageError> {
        self.simulate_block_delay();
        let block = self.bitmap.first_fit_free().ok_or(StorageError::NoSpace)?;
        self.bitmap.allocate(block)?;
        self.write_block_raw(block, initial_content)?;
        self.refcounts.insert(block, 1);
        Ok(block)
    }

    pub fn read_block(&self, block: usize) -> Result<Vec<u8>, StorageError> {
        self.simulate_block_delay();
        let path = block_path(&self.dir, block);
        let mut file = File::open(&path).map_err(|e| StorageError::Io(path.display().to_string(), e))?;
        let mut buf = vec![0u8; self.block_size as usize];
        file.read_exact(&mut buf)
            .map_err(|e| StorageError::Io(path.display().to_string(), e))?;
        Ok(buf)
    }

    pub fn write_block(&self, block: usize, data: &[u8]) -> Result<(), StorageError> {
        self.simulate_block_delay();
        self.write_block_raw(block, data)
    }

    fn write_block_raw(&self, block: usize, data: &[u8]) -> Result<(), StorageError> {
        let path = block_path(&self.dir, block);
        let mut padded = vec![0u8; self.block_size as usize];
        let n = data.len().min(padded.len());
        padded[..n].copy_from_slice(&data[..n]);

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| StorageError::Io(path.display().to_string(), e))?;
        file.seek(SeekFrom::Start(0))
            .map_err(|e| StorageError::Io(path.display().to_string(), e))?;
        file.write_all(&padded)
            .map_err(|e| StorageError::Io(path.display().to_string(), e))?;
        file.sync_all()
            .map_err(|e| StorageError::Io(path.display().to_string(), e))?;
        Ok(())
    }

    pub fn allocated_blocks(&self) -> Vec<usize> {
        self.bitmap.allocated_blocks()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn pool(dir: &Path) -> BlockPool {
        BlockPool::open(
            dir.join("physical_blocks"),
            16,
            64,
            &dir.join("bitmap"),
            Duration::from_millis(0),
            Duration::from_millis(0),
        )
        .unwrap()
    }

    #[test]
    fn block_zero_is_always_shared() {
        let dir = tempdir().unwrap();
        let pool = pool(dir.path());
        assert!(pool.is_shared(INITIAL_BLOCK));
    }

    #[test]
    fn allocate_write_read_roundtrip() {
        let dir = tempdir().unwrap();
        let mut pool = pool(dir.path());
        let b = pool.allocate(b"hello").unwrap();
        assert_ne!(b, INITIAL_BLOCK);
        let content = pool.read_block(b).unwrap();
        assert_eq!(&content[..5], b"hello");
        pool.write_block(b, b"world").unwrap();
        assert_eq!(&pool.read_block(b).unwrap()[..5], b"world");
    }

    #[test]
    fn decref_to_zero_frees_block() {
        let dir = tempdir().unwrap();
        let mut pool = pool(dir.path());
        let b = pool.allocate(b"x").unwrap();
        assert!(pool.allocated_blocks().contains(&b));
        pool.decref(b).unwrap();
        assert!(!pool.allocated_blocks().contains(&b));
    }

    #[test]
    fn shared_when_refcount_at_least_two() {
        let dir = tempdir().unwrap();
        let mut pool = pool(dir.path());
        let b = pool.allocate(b"x").unwrap();
        assert!(!pool.is_shared(b));
        pool.incref(b);
        assert!(pool.is_shared(b));
    }
}
