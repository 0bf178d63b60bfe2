//! The worker: executes query scripts dispatched by the scheduler against
//! a paged view of the storage engine. See `memory` for the page
//! replacement algorithms, `executor` for instruction interpretation,
//! `storage_client`/`scheduler_conn` for the two TCP connections a worker
//! holds for its entire lifetime.

pub mod error;
pub mod executor;
pub mod memory;
pub mod scheduler_conn;
pub mod storage_client;

use log::{info, warn};

use crate::config::WorkerConfig;

use error::WorkerError;
use executor::QueryExecutor;
use memory::PagedMemory;
use scheduler_conn::SchedulerEvent;
use storage_client::StorageClient;

/// Runs the worker's whole lifetime: connects to storage and the
/// scheduler, then services EXECUTE dispatches one at a time until the
/// scheduler connection drops.
pub fn run(worker_id: &str, config: &WorkerConfig) -> Result<(), WorkerError> {
    let storage_addr = format!("{}:{}", config.storage_host, config.storage_port);
    let storage = StorageClient::connect(&storage_addr, worker_id)?;
    let frame_size = storage.block_size() as usize;
    if config.block_size != 0 && config.block_size != frame_size {
        warn!(
            "worker {}: configured BLOCK_SIZE_MOCK={} disagrees with storage's handshake block size {}; using the handshake value",
            worker_id, config.block_size, frame_size
        );
    }
    let memory = PagedMemory::new(config.memory_size, frame_size, config.replacement_algorithm);
    let mut executor = QueryExecutor::new(storage, memory);

    let scheduler_addr = format!("{}:{}", config.scheduler_host, config.scheduler_port);
    let (mut events, rx) = scheduler_conn::connect(&scheduler_addr, worker_id)?;
    info!("worker {}: connected to storage {} and scheduler {}", worker_id, storage_addr, scheduler_addr);

    loop {
        match rx.recv() {
            Ok(SchedulerEvent::Dispatch { query_id, pc, script_path }) => {
                info!("worker {}: executing query {} from pc={}", worker_id, query_id, pc);
                executor.run_query(query_id, &script_path, pc, &rx, &mut events);
            }
            Ok(SchedulerEvent::Evict) => {
                // No query is running; nothing to evict. Can only happen
                // if the scheduler believes this worker is busy when it
                // is not, which the scheduler's own bookkeeping prevents.
            }
            Err(_) => return Ok(()),
        }
    }
}
