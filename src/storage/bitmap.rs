//! One bit per physical block, persisted as a memory-mapped file. Any
//! mutation is synced to disk before the allocation/free is observable to
//! callers (spec invariant: "must be durable before observable
//! externally").

use std::fs::OpenOptions;
use std::path::Path;

use memmap2::MmapMut;

use super::StorageError;

pub struct Bitmap {
    mmap: MmapMut,
    bits: usize,
}

impl Bitmap {
    fn bytes_for(bits: usize) -> usize {
        (bits + 7) / 8
    }

    /// Opens (or creates, zero-filled) the bitmap file for `bits` blocks.
    pub fn open<P: AsRef<Path>>(path: P, bits: usize) -> Result<Self, StorageError> {
        let len = Self::bytes_for(bits) as u64;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path.as_ref())
            .map_err(|e| StorageError::Io(path.as_ref().display().to_string(), e))?;
        file.set_len(len)
            .map_err(|e| StorageError::Io(path.as_ref().display().to_string(), e))?;
        let mmap = unsafe {
            MmapMut::map_mut(&file).map_err(|e| StorageError::Io(path.as_ref().display().to_string(), e))?
        };
        Ok(Bitmap { mmap, bits })
    }

    pub fn is_allocated(&self, block: usize) -> bool {
        let byte = block / 8;
        let bit = block % 8;
        (self.mmap[byte] >> bit) & 1 == 1
    }

    /// Sets the bit and fsyncs before returning, so the allocation is
    /// durable before the caller advertises the block as theirs.
    pub fn allocate(&mut self, block: usize) -> Result<(), StorageError> {
        let byte = block / 8;
        let bit = block % 8;
        self.mmap[byte] |= 1 << bit;
        self.sync()
    }

    pub fn free(&mut self, block: usize) -> Result<(), StorageError> {
        let byte = block / 8;
        let bit = block % 8;
        self.mmap[byte] &= !(1 << bit);
        self.sync()
    }

    fn sync(&self) -> Result<(), StorageError> {
        self.mmap
            .flush()
            .map_err(|e| StorageError::Io("bitmap".into(), e))
    }

    /// Linear first-fit scan from block index 1 (block 0 is reserved).
    pub fn first_fit_free(&self) -> Option<usize> {
        (1..self.bits).find(|&b| !self.is_allocated(b))
    }

    pub fn allocated_blocks(&self) -> Vec<usize> {
        (0..self.bits).filter(|&b| self.is_allocated(b)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn allocate_and_free_roundtrip() {
        let dir = tempdir().unwrap();
        let mut bm = Bitmap::open(dir.path().join("bitmap"), 64).unwrap();
        assert!(!bm.is_allocated(5));
        bm.allocate(5).unwrap();
        assert!(bm.is_allocated(5));
        bm.free(5).unwrap();
        assert!(!bm.is_allocated(5));
    }

    #[test]
    fn first_fit_skips_block_zero() {
        let dir = tempdir().unwrap();
        let mut bm = Bitmap::open(dir.path().join("bitmap"), 8).unwrap();
        bm.allocate(0).unwrap();
        assert_eq!(bm.first_fit_free(), Some(1));
        bm.allocate(1).unwrap();
        assert_eq!(bm.first_fit_free(), Some(2));
    }
}
