//! Paged memory: a contiguous array of frames shared by every `(file,
//! tag)` a worker touches, with LRU and CLOCK-M replacement. Grounded on
//! the original engine's `memoryHelper.c` (`seleccionar_victima_clock`,
//! `seleccionar_victima_lru`) and generalized the way a multi-tier buffer
//! pool keeps page metadata (see e.g. `BufferFrame` in the harborgrid
//! buffer-pool reference in this pack).

use std::collections::HashMap;

use crate::config::ReplacementAlgorithm;

pub type FrameIndex = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub file: u64,
    pub logical_index: usize,
}

#[derive(Debug, Clone)]
struct PageTableEntry {
    frame: FrameIndex,
    dirty: bool,
    used: bool,
    last_used: u64,
}

/// A single writeback obligation returned by the replacement algorithm:
/// the victim page must be flushed to storage before its frame is reused.
pub struct Eviction {
    pub key: PageKey,
    pub frame: FrameIndex,
    pub dirty: bool,
}

pub struct PagedMemory {
    frame_size: usize,
    frames: Vec<Vec<u8>>,
    free_frames: Vec<FrameIndex>,
    pages: HashMap<PageKey, PageTableEntry>,
    // flat ordering of present pages, indexed by the clock hand
    clock_order: Vec<PageKey>,
    clock_hand: usize,
    algorithm: ReplacementAlgorithm,
    clock_tick: u64,
}

impl PagedMemory {
    pub fn new(total_size: usize, frame_size: usize, algorithm: ReplacementAlgorithm) -> Self {
        let frame_count = if frame_size == 0 { 0 } else { total_size / frame_size };
        PagedMemory {
            frame_size,
            frames: vec![vec![0u8; frame_size]; frame_count],
            free_frames: (0..frame_count).collect(),
            pages: HashMap::new(),
            clock_order: Vec::new(),
            clock_hand: 0,
            algorithm,
            clock_tick: 0,
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn is_present(&self, key: &PageKey) -> bool {
        self.pages.contains_key(key)
    }

    pub fn frame_of(&self, key: &PageKey) -> Option<FrameIndex> {
        self.pages.get(key).map(|e| e.frame)
    }

    pub fn frame_bytes(&self, frame: FrameIndex) -> &[u8] {
        &self.frames[frame]
    }

    fn tick(&mut self) -> u64 {
        self.clock_tick += 1;
        self.clock_tick
    }

    /// Reads a present page's bytes and refreshes its recency metadata.
    pub fn read(&mut self, key: &PageKey) -> &[u8] {
        let now = self.tick();
        let entry = self.pages.get_mut(key).expect("read of absent page");
        entry.used = true;
        entry.last_used = now;
        &self.frames[entry.frame]
    }

    /// Writes into a present page's frame and marks it dirty/used.
    pub fn write(&mut self, key: &PageKey, offset: usize, data: &[u8]) {
        let now = self.tick();
        let entry = self.pages.get_mut(key).expect("write of absent page");
        entry.dirty = true;
        entry.used = true;
        entry.last_used = now;
        self.frames[entry.frame][offset..offset + data.len()].copy_from_slice(data);
    }

    /// Installs page content fetched from storage into a free (or just
    /// evicted) frame.
    pub fn install(&mut self, key: PageKey, frame: FrameIndex, content: &[u8]) {
        self.frames[frame][..content.len()].copy_from_slice(content);
        let now = self.tick();
        self.pages.insert(key, PageTableEntry { frame, dirty: false, used: true, last_used: now });
        self.clock_order.push(key);
    }

    /// Pops a frame from the free list, if any are left.
    pub fn take_free_frame(&mut self) -> Option<FrameIndex> {
        self.free_frames.pop()
    }

    /// Chooses and removes a victim page per the configured algorithm,
    /// returning its frame (now free again) and whether it needs
    /// writeback. The caller must perform the writeback (if `dirty`)
    /// *before* reusing the frame.
    pub fn evict_victim(&mut self) -> Option<Eviction> {
        let victim_key = match self.algorithm {
            ReplacementAlgorithm::Lru => self.select_lru(),
            ReplacementAlgorithm::ClockM => self.select_clock_m(),
        }?;
        let entry = self.pages.remove(&victim_key).expect("victim must be present");
        self.clock_order.retain(|k| *k != victim_key);
        Some(Eviction { key: victim_key, frame: entry.frame, dirty: entry.dirty })
    }

    fn select_lru(&self) -> Option<PageKey> {
        self.pages
            .iter()
            .min_by_key(|(_, e)| e.last_used)
            .map(|(k, _)| *k)
    }

    /// Two-pass CLOCK-M: prefer `(used=false, dirty=false)`, then
    /// `(used=false, dirty=true)`, clearing `used` on anything else and
    /// advancing, for at most two full revolutions.
    fn select_clock_m(&mut self) -> Option<PageKey> {
        if self.clock_order.is_empty() {
            return None;
        }
        let total = self.clock_order.len();
        let mut best_class2: Option<PageKey> = None;

        for _ in 0..(total * 2) {
            if self.clock_hand >= self.clock_order.len() {
                self.clock_hand = 0;
            }
            let key = self.clock_order[self.clock_hand];
            let entry = self.pages.get(&key).expect("clock_order entry must be present");

            match (entry.used, entry.dirty) {
                (false, false) => return Some(key),
                (false, true) => {
                    if best_class2.is_none() {
                        best_class2 = Some(key);
                    }
                }
                _ => {
                    self.pages.get_mut(&key).unwrap().used = false;
                }
            }
            self.clock_hand = (self.clock_hand + 1) % self.clock_order.len();
        }
        best_class2.or_else(|| self.clock_order.get(self.clock_hand).copied())
    }

    /// Returns a frame to the free list after it has been written back (or
    /// was never dirty). Does not touch the page table.
    pub fn release_frame(&mut self, frame: FrameIndex) {
        self.free_frames.push(frame);
    }

    /// Clears `dirty` on a page table entry after a successful writeback
    /// that happened *without* evicting it (e.g. an explicit FLUSH).
    pub fn mark_clean(&mut self, key: &PageKey) {
        if let Some(entry) = self.pages.get_mut(key) {
            entry.dirty = false;
        }
    }

    /// Drops every page belonging to `file` without writeback and returns
    /// their frames to the free list — used on DELETE, per spec §4.2: the
    /// storage side has already deleted the tag, so dirty data would be
    /// writing back to nothing.
    pub fn drop_file(&mut self, file: u64) {
        let victims: Vec<PageKey> = self.pages.keys().filter(|k| k.file == file).copied().collect();
        for key in victims {
            if let Some(entry) = self.pages.remove(&key) {
                self.free_frames.push(entry.frame);
            }
            self.clock_order.retain(|k| *k != key);
        }
    }

    pub fn dirty_pages(&self) -> Vec<PageKey> {
        self.pages.iter().filter(|(_, e)| e.dirty).map(|(k, _)| *k).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem(algorithm: ReplacementAlgorithm) -> PagedMemory {
        PagedMemory::new(3 * 4, 4, algorithm)
    }

    fn key(file: u64, idx: usize) -> PageKey {
        PageKey { file, logical_index: idx }
    }

    #[test]
    fn lru_evicts_least_recently_used() {
        let mut m = mem(ReplacementAlgorithm::Lru);
        for i in 0..3 {
            let f = m.take_free_frame().unwrap();
            m.install(key(1, i), f, &[0, 0, 0, 0]);
        }
        // touch page 0 and 2, leaving page 1 as least-recently-used
        m.read(&key(1, 0));
        m.read(&key(1, 2));
        let victim = m.evict_victim().unwrap();
        assert_eq!(victim.key, key(1, 1));
        assert!(!victim.dirty);
    }

    #[test]
    fn clock_m_prefers_unused_clean_over_unused_dirty() {
        let mut m = mem(ReplacementAlgorithm::ClockM);
        let f0 = m.take_free_frame().unwrap();
        m.install(key(1, 0), f0, &[0, 0, 0, 0]);
        let f1 = m.take_free_frame().unwrap();
        m.install(key(1, 1), f1, &[0, 0, 0, 0]);

        // mark page 0 used+dirty, page 1 stays unused+clean
        m.write(&key(1, 0), 0, &[9]);
        m.pages.get_mut(&key(1, 0)).unwrap().used = false;

        let victim = m.evict_victim().unwrap();
        assert_eq!(victim.key, key(1, 1));
        assert!(!victim.dirty);
    }

    #[test]
    fn dirty_victim_must_be_written_back_before_reuse() {
        let mut m = mem(ReplacementAlgorithm::ClockM);
        let f0 = m.take_free_frame().unwrap();
        m.install(key(1, 0), f0, &[0, 0, 0, 0]);
        m.write(&key(1, 0), 0, &[1, 2, 3, 4]);
        m.pages.get_mut(&key(1, 0)).unwrap().used = false;

        let victim = m.evict_victim().unwrap();
        assert!(victim.dirty);
        // caller performs writeback, then releases the frame
        m.release_frame(victim.frame);
        assert_eq!(m.take_free_frame(), Some(victim.frame));
    }

    #[test]
    fn delete_drops_pages_without_writeback() {
        let mut m = mem(ReplacementAlgorithm::Lru);
        let f0 = m.take_free_frame().unwrap();
        m.install(key(1, 0), f0, &[0, 0, 0, 0]);
        m.write(&key(1, 0), 0, &[1, 2, 3, 4]);
        m.drop_file(1);
        assert!(!m.is_present(&key(1, 0)));
        assert_eq!(m.take_free_frame(), Some(f0));
    }
}
