//! Query script execution: reads one instruction at a time from the
//! script named in a DISPATCH_EXEC, interprets the nine opcodes of §4.3
//! against the worker's paged memory and the storage connection, and
//! reports completion/failure/eviction back to the scheduler.

use std::collections::HashMap;
use std::fs;

use crossbeam_channel::Receiver;
use log::{info, warn};

use crate::wire::parse_file_tag;

use super::error::WorkerError;
use super::memory::{PageKey, PagedMemory};
use super::scheduler_conn::{EventSink, SchedulerEvent};
use super::storage_client::StorageClient;

/// Assigns a small integer handle to each `(file, tag)` the worker has
/// touched, so `PageKey` doesn't carry a `String` per page.
#[derive(Default)]
struct HandleTable {
    by_name: HashMap<String, u64>,
    by_id: HashMap<u64, String>,
    next: u64,
}

impl HandleTable {
    fn handle_for(&mut self, key: &str) -> u64 {
        if let Some(id) = self.by_name.get(key) {
            return *id;
        }
        let id = self.next;
        self.next += 1;
        self.by_name.insert(key.to_string(), id);
        self.by_id.insert(id, key.to_string());
        id
    }

    fn name_of(&self, id: u64) -> &str {
        self.by_id.get(&id).map(|s| s.as_str()).unwrap_or("")
    }
}

pub enum Outcome {
    Ended,
    Evicted { pc: u32 },
}

/// Per-query execution counters, corresponding to the original engine's
/// `t_metricas_proceso`. Reset at the start of each `run_query` and logged
/// on END/eviction/error.
#[derive(Default)]
struct QueryMetrics {
    instructions: u64,
    page_faults: u64,
    swap_outs: u64,
    storage_reads: u64,
    storage_writes: u64,
}

impl QueryMetrics {
    fn log_summary(&self, query_id: u32) {
        info!(
            "worker: query {} metrics: instructions={} page_faults={} swap_outs={} storage_reads={} storage_writes={}",
            query_id, self.instructions, self.page_faults, self.swap_outs, self.storage_reads, self.storage_writes
        );
    }
}

pub struct QueryExecutor {
    storage: StorageClient,
    memory: PagedMemory,
    handles: HandleTable,
    metrics: QueryMetrics,
    /// Tracks, per handle, whether this worker has seen the `(file, tag)`
    /// reach COMMITTED. Paged writes consult this before touching a cached
    /// frame, since a committed tag's dirty page would otherwise never be
    /// checked against storage until the next flush/evict/commit.
    committed: HashMap<u64, bool>,
}

enum LineOutcome {
    Continue,
    End,
}

impl QueryExecutor {
    pub fn new(storage: StorageClient, memory: PagedMemory) -> Self {
        QueryExecutor {
            storage,
            memory,
            handles: HandleTable::default(),
            metrics: QueryMetrics::default(),
            committed: HashMap::new(),
        }
    }

    pub fn run_query(
        &mut self,
        query_id: u32,
        script_path: &std::path::Path,
        pc_start: u32,
        evict_rx: &Receiver<SchedulerEvent>,
        events: &mut EventSink,
    ) -> Outcome {
        self.metrics = QueryMetrics::default();
        let contents = match fs::read_to_string(script_path) {
            Ok(c) => c,
            Err(e) => {
                let _ = events.exec_error(query_id, &format!("cannot open script: {}", e));
                self.metrics.log_summary(query_id);
                return Outcome::Ended;
            }
        };
        let lines: Vec<&str> = contents
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .collect();

        for (idx, line) in lines.iter().enumerate().skip(pc_start as usize) {
            if let Ok(SchedulerEvent::Evict) = evict_rx.try_recv() {
                let pc = idx as u32;
                let _ = events.evict_reply(pc);
                self.metrics.log_summary(query_id);
                return Outcome::Evicted { pc };
            }

            self.metrics.instructions += 1;
            match self.execute_line(query_id, line, events) {
                Ok(LineOutcome::Continue) => continue,
                Ok(LineOutcome::End) => {
                    let _ = events.query_end(query_id);
                    self.metrics.log_summary(query_id);
                    return Outcome::Ended;
                }
                Err(message) => {
                    warn!("worker: query {} failed at pc={}: {}", query_id, idx, message);
                    let _ = events.exec_error(query_id, &message);
                    self.metrics.log_summary(query_id);
                    return Outcome::Ended;
                }
            }
        }
        let _ = events.query_end(query_id);
        self.metrics.log_summary(query_id);
        Outcome::Ended
    }

    fn execute_line(&mut self, query_id: u32, line: &str, events: &mut EventSink) -> Result<LineOutcome, String> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let op = tokens.first().copied().unwrap_or("");
        match op {
            "CREATE" => {
                let (file, tag) = parse_file_tag(tokens.get(1).ok_or("CREATE: missing file:tag")?);
                self.storage.create(&file, &tag).map_err(|e| e.to_string())?;
                let handle = self.handles.handle_for(&format!("{}:{}", file, tag));
                self.committed.insert(handle, false);
                Ok(LineOutcome::Continue)
            }
            "TRUNCATE" => {
                let (file, tag) = parse_file_tag(tokens.get(1).ok_or("TRUNCATE: missing file:tag")?);
                let size: u64 = tokens.get(2).ok_or("TRUNCATE: missing size")?.parse().map_err(|_| "TRUNCATE: bad size")?;
                self.storage.truncate(&file, &tag, size).map_err(|e| e.to_string())?;
                Ok(LineOutcome::Continue)
            }
            "WRITE" => {
                let (file, tag) = parse_file_tag(tokens.get(1).ok_or("WRITE: missing file:tag")?);
                let offset: u64 = tokens.get(2).ok_or("WRITE: missing offset")?.parse().map_err(|_| "WRITE: bad offset")?;
                let content = tokens.get(3).ok_or("WRITE: missing content")?.as_bytes();
                let handle = self.handles.handle_for(&format!("{}:{}", file, tag));
                let result = if self.committed.get(&handle).copied().unwrap_or(false) {
                    Err(WorkerError::Storage(format!("{}:{} is committed", file, tag)))
                } else {
                    self.write_paged(&file, &tag, offset, content)
                };
                if let Err(e) = result {
                    warn!("worker: non-critical WRITE failure for query {}: {}", query_id, e);
                }
                Ok(LineOutcome::Continue)
            }
            "READ" => {
                let (file, tag) = parse_file_tag(tokens.get(1).ok_or("READ: missing file:tag")?);
                let offset: u64 = tokens.get(2).ok_or("READ: missing offset")?.parse().map_err(|_| "READ: bad offset")?;
                let size: u64 = tokens.get(3).ok_or("READ: missing size")?.parse().map_err(|_| "READ: bad size")?;
                let _ = events.read_notice(query_id);
                let data = match self.read_paged(&file, &tag, offset, size) {
                    Ok(d) => d,
                    Err(e) => {
                        warn!("worker: non-critical READ failure for query {}: {}", query_id, e);
                        Vec::new()
                    }
                };
                let _ = events.read_result(query_id, &format!("{}:{}", file, tag), &data);
                Ok(LineOutcome::Continue)
            }
            "TAG" => {
                let (file, src_tag) = parse_file_tag(tokens.get(1).ok_or("TAG: missing src file:tag")?);
                let (dst_file, dst_tag) = parse_file_tag(tokens.get(2).ok_or("TAG: missing dst file:tag")?);
                self.storage.tag(&file, &src_tag, &dst_file, &dst_tag).map_err(|e| e.to_string())?;
                let dst_handle = self.handles.handle_for(&format!("{}:{}", dst_file, dst_tag));
                self.committed.insert(dst_handle, false);
                Ok(LineOutcome::Continue)
            }
            "COMMIT" => {
                let (file, tag) = parse_file_tag(tokens.get(1).ok_or("COMMIT: missing file:tag")?);
                self.flush_dirty_pages(&file, &tag).map_err(|e| e.to_string())?;
                self.storage.commit(&file, &tag).map_err(|e| e.to_string())?;
                let handle = self.handles.handle_for(&format!("{}:{}", file, tag));
                self.committed.insert(handle, true);
                Ok(LineOutcome::Continue)
            }
            "FLUSH" => {
                let (file, tag) = parse_file_tag(tokens.get(1).ok_or("FLUSH: missing file:tag")?);
                if let Err(e) = self.flush_dirty_pages(&file, &tag).and_then(|_| self.storage.flush(&file, &tag)) {
                    warn!("worker: non-critical FLUSH failure for query {}: {}", query_id, e);
                }
                Ok(LineOutcome::Continue)
            }
            "DELETE" => {
                let (file, tag) = parse_file_tag(tokens.get(1).ok_or("DELETE: missing file:tag")?);
                self.storage.delete(&file, &tag).map_err(|e| e.to_string())?;
                let handle = self.handles.handle_for(&format!("{}:{}", file, tag));
                self.memory.drop_file(handle);
                self.committed.remove(&handle);
                Ok(LineOutcome::Continue)
            }
            "END" => Ok(LineOutcome::End),
            other => Err(format!("unknown instruction {:?}", other)),
        }
    }

    fn block_size(&self) -> u64 {
        self.memory.frame_size() as u64
    }

    fn ensure_present(&mut self, handle: u64, logical_index: usize) -> Result<(), WorkerError> {
        let key = PageKey { file: handle, logical_index };
        if self.memory.is_present(&key) {
            return Ok(());
        }
        self.metrics.page_faults += 1;
        let frame = match self.memory.take_free_frame() {
            Some(f) => f,
            None => {
                let victim = self.memory.evict_victim().ok_or(WorkerError::OutOfMemory)?;
                if victim.dirty {
                    let bytes = self.memory.frame_bytes(victim.frame).to_vec();
                    let name = self.handles.name_of(victim.key.file).to_string();
                    let (vfile, vtag) = parse_file_tag(&name);
                    self.storage.write_block(&vfile, &vtag, victim.key.logical_index, &bytes)?;
                    self.metrics.swap_outs += 1;
                    self.metrics.storage_writes += 1;
                }
                self.memory.release_frame(victim.frame);
                victim.frame
            }
        };
        let name = self.handles.name_of(handle).to_string();
        let (file, tag) = parse_file_tag(&name);
        let content = self.storage.get_block(&file, &tag, logical_index)?;
        self.metrics.storage_reads += 1;
        self.memory.install(key, frame, &content);
        Ok(())
    }

    fn read_paged(&mut self, file: &str, tag: &str, offset: u64, size: u64) -> Result<Vec<u8>, WorkerError> {
        let handle = self.handles.handle_for(&format!("{}:{}", file, tag));
        let bs = self.block_size();
        let mut out = Vec::with_capacity(size as usize);
        let mut cur = offset;
        let mut remaining = size;
        while remaining > 0 {
            let logical_index = (cur / bs) as usize;
            let in_page = (cur % bs) as usize;
            let take = remaining.min(bs - in_page as u64) as usize;
            self.ensure_present(handle, logical_index)?;
            let key = PageKey { file: handle, logical_index };
            let frame = self.memory.frame_of(&key).expect("just made present");
            let bytes = self.memory.frame_bytes(frame);
            out.extend_from_slice(&bytes[in_page..in_page + take]);
            let _ = self.memory.read(&key);
            cur += take as u64;
            remaining -= take as u64;
        }
        Ok(out)
    }

    fn write_paged(&mut self, file: &str, tag: &str, offset: u64, content: &[u8]) -> Result<(), WorkerError> {
        let handle = self.handles.handle_for(&format!("{}:{}", file, tag));
        let bs = self.block_size();
        let mut cur = offset;
        let mut remaining = content.len();
        let mut consumed = 0usize;
        while remaining > 0 {
            let logical_index = (cur / bs) as usize;
            let in_page = (cur % bs) as usize;
            let take = remaining.min((bs - in_page as u64) as usize);
            self.ensure_present(handle, logical_index)?;
            let key = PageKey { file: handle, logical_index };
            self.memory.write(&key, in_page, &content[consumed..consumed + take]);
            cur += take as u64;
            consumed += take;
            remaining -= take;
        }
        Ok(())
    }

    fn flush_dirty_pages(&mut self, file: &str, tag: &str) -> Result<(), WorkerError> {
        let handle = self.handles.handle_for(&format!("{}:{}", file, tag));
        let dirty: Vec<PageKey> = self.memory.dirty_pages().into_iter().filter(|k| k.file == handle).collect();
        for key in dirty {
            let frame = self.memory.frame_of(&key).expect("dirty page must be present");
            let bytes = self.memory.frame_bytes(frame).to_vec();
            self.storage.write_block(file, tag, key.logical_index, &bytes)?;
            self.metrics.storage_writes += 1;
            self.memory.mark_clean(&key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplacementAlgorithm;
    use crate::storage::StorageEngine;
    use crossbeam_channel::unbounded;
    use std::io::Write as _;
    use std::net::TcpStream;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    const BLOCK_SIZE: u32 = 16;

    fn start_storage() -> (String, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let engine = StorageEngine::new(
            dir.path().join("mnt"),
            BLOCK_SIZE as u64 * 64,
            BLOCK_SIZE,
            true,
            std::time::Duration::ZERO,
            std::time::Duration::ZERO,
        )
        .unwrap();
        let engine = Arc::new(Mutex::new(engine));
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let addr_clone = addr.clone();
        std::thread::spawn(move || {
            crate::storage::protocol::serve(&addr_clone, engine).unwrap();
        });
        // give the listener a moment to bind before the client connects
        for _ in 0..50 {
            if TcpStream::connect(&addr).is_ok() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        (addr, dir)
    }

    fn executor(addr: &str) -> QueryExecutor {
        let storage = StorageClient::connect(addr, "test-worker").unwrap();
        let memory = PagedMemory::new(BLOCK_SIZE as usize * 4, BLOCK_SIZE as usize, ReplacementAlgorithm::Lru);
        QueryExecutor::new(storage, memory)
    }

    fn script(dir: &std::path::Path, contents: &str) -> std::path::PathBuf {
        let path = dir.join("script.q");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn create_truncate_write_read_roundtrip() {
        let (addr, dir) = start_storage();
        let mut exec = executor(&addr);
        let script_path = script(
            dir.path(),
            "CREATE f:BASE\nTRUNCATE f:BASE 16\nWRITE f:BASE 0 helloworld\nREAD f:BASE 0 10\nEND\n",
        );
        let (_tx, rx) = unbounded();
        let mut events = fake_event_sink(&addr);
        let outcome = exec.run_query(1, &script_path, 0, &rx, &mut events);
        assert!(matches!(outcome, Outcome::Ended));
    }

    #[test]
    fn write_then_read_across_page_boundary() {
        let (addr, dir) = start_storage();
        let mut exec = executor(&addr);
        let script_path = script(
            dir.path(),
            "CREATE f:BASE\nTRUNCATE f:BASE 32\nWRITE f:BASE 12 01234567\nREAD f:BASE 12 8\nEND\n",
        );
        let (_tx, rx) = unbounded();
        let mut events = fake_event_sink(&addr);
        let outcome = exec.run_query(1, &script_path, 0, &rx, &mut events);
        assert!(matches!(outcome, Outcome::Ended));
    }

    #[test]
    fn write_after_commit_is_rejected_even_with_page_still_cached() {
        let (addr, dir) = start_storage();
        let mut exec = executor(&addr);
        let script_path = script(
            dir.path(),
            "CREATE f:BASE\nTRUNCATE f:BASE 16\nWRITE f:BASE 0 helloworld\nCOMMIT f:BASE\nWRITE f:BASE 0 xxxxxxxxxx\nREAD f:BASE 0 10\nEND\n",
        );
        let (_tx, rx) = unbounded();
        let mut events = fake_event_sink(&addr);
        let outcome = exec.run_query(1, &script_path, 0, &rx, &mut events);
        assert!(matches!(outcome, Outcome::Ended));
        // the post-commit WRITE must not have reached the still-cached page
        let data = exec.read_paged("f", "BASE", 0, 10).unwrap();
        assert_eq!(&data, b"helloworld");
    }

    #[test]
    fn unknown_instruction_is_reported_as_exec_error() {
        let (addr, dir) = start_storage();
        let mut exec = executor(&addr);
        let script_path = script(dir.path(), "BOGUS f:BASE\n");
        let (_tx, rx) = unbounded();
        let mut events = fake_event_sink(&addr);
        let outcome = exec.run_query(1, &script_path, 0, &rx, &mut events);
        assert!(matches!(outcome, Outcome::Ended));
    }

    /// A throwaway `TcpStream` to back `EventSink` — no scheduler is
    /// needed to drive these executor-level tests, so the sink's writes
    /// just go to a socket nothing reads.
    fn fake_event_sink(addr: &str) -> EventSink {
        EventSink::from_stream(TcpStream::connect(addr).unwrap())
    }
}
