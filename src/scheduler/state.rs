//! In-memory scheduler state: the READY query list, the worker pool, and
//! the three locks the spec requires (`L_queries`, `L_workers`,
//! `L_dispatch`), always acquired in that order (§5).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crossbeam_channel::Sender;

use crate::query::{ClientId, Query, QueryId, QueryState, WorkerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    Fifo,
    Priority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Handshake,
    Idle,
    Busy,
    Disconnected,
}

/// Command sent from a dispatch-holding thread to a worker's own
/// connection thread, which owns the socket exclusively.
pub enum WorkerCommand {
    Execute { query_id: QueryId, pc: u32, script_path: String },
    Evict { reply: Sender<u32> },
}

pub struct WorkerHandle {
    pub id: WorkerId,
    pub status: WorkerStatus,
    pub current_query: Option<QueryId>,
    pub to_worker: Sender<WorkerCommand>,
}

/// Queries ordered by arrival; selection policy (FIFO head vs. lowest
/// priority, ties by arrival order) is applied over this same order, so a
/// single `VecDeque` serves both policies.
#[derive(Default)]
pub struct QueryTable {
    pub queries: HashMap<QueryId, Query>,
    ready_order: VecDeque<QueryId>,
    next_id: u32,
}

impl QueryTable {
    pub fn alloc_id(&mut self) -> QueryId {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    pub fn insert_ready(&mut self, query: Query) {
        self.ready_order.push_back(query.id);
        self.queries.insert(query.id, query);
    }

    pub fn remove_from_ready(&mut self, id: QueryId) {
        self.ready_order.retain(|q| *q != id);
    }

    pub fn reinsert_ready(&mut self, id: QueryId) {
        if !self.ready_order.contains(&id) {
            self.ready_order.push_back(id);
        }
    }

    /// Picks the next query to dispatch per `policy`, without removing it.
    pub fn select_next_ready(&self, policy: Policy) -> Option<QueryId> {
        match policy {
            Policy::Fifo => self.ready_order.front().copied(),
            Policy::Priority => self
                .ready_order
                .iter()
                .enumerate()
                .min_by_key(|(idx, id)| (self.queries[*id].priority, *idx))
                .map(|(_, id)| *id),
        }
    }

    pub fn is_ready_empty(&self) -> bool {
        self.ready_order.is_empty()
    }

    pub fn ready_ids(&self) -> Vec<QueryId> {
        self.ready_order.iter().copied().collect()
    }

    pub fn get(&self, id: QueryId) -> Option<&Query> {
        self.queries.get(&id)
    }

    pub fn get_mut(&mut self, id: QueryId) -> Option<&mut Query> {
        self.queries.get_mut(&id)
    }
}

#[derive(Default)]
pub struct WorkerTable {
    pub workers: HashMap<WorkerId, WorkerHandle>,
    next_id: u32,
}

impl WorkerTable {
    pub fn alloc_id(&mut self) -> WorkerId {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    pub fn insert(&mut self, handle: WorkerHandle) {
        self.workers.insert(handle.id, handle);
    }

    pub fn remove(&mut self, id: WorkerId) -> Option<WorkerHandle> {
        self.workers.remove(&id)
    }

    pub fn free_worker(&self) -> Option<WorkerId> {
        self.workers
            .values()
            .find(|w| w.status == WorkerStatus::Idle)
            .map(|w| w.id)
    }

    /// The busy worker whose current query has the largest priority
    /// number (i.e. the lowest actual priority), a preemption candidate.
    pub fn lowest_priority_busy_worker(&self, queries: &QueryTable) -> Option<(WorkerId, QueryId, i32)> {
        self.workers
            .values()
            .filter(|w| w.status == WorkerStatus::Busy)
            .filter_map(|w| w.current_query.map(|qid| (w.id, qid)))
            .filter_map(|(wid, qid)| queries.get(qid).map(|q| (wid, qid, q.priority)))
            .max_by_key(|(_, _, prio)| *prio)
    }
}

pub struct ClientHandle {
    pub to_client: Sender<crate::scheduler::client_conn::ClientMessage>,
}

pub struct SchedulerState {
    pub queries: Mutex<QueryTable>,
    pub workers: Mutex<WorkerTable>,
    pub dispatch: Mutex<()>,
    pub clients: Mutex<HashMap<ClientId, ClientHandle>>,
    pub policy: Policy,
    next_client_id: AtomicU32,
}

impl SchedulerState {
    pub fn new(policy: Policy) -> Self {
        SchedulerState {
            queries: Mutex::new(QueryTable::default()),
            workers: Mutex::new(WorkerTable::default()),
            dispatch: Mutex::new(()),
            clients: Mutex::new(HashMap::new()),
            policy,
            next_client_id: AtomicU32::new(0),
        }
    }

    pub fn alloc_client_id(&self) -> ClientId {
        self.next_client_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Marks `query_id`'s state without requiring the caller to juggle the
    /// borrow checker at every call site.
    pub fn set_query_state(&self, query_id: QueryId, state: QueryState) {
        let mut queries = self.queries.lock().unwrap();
        if let Some(q) = queries.get_mut(query_id) {
            q.state = state;
        }
    }
}
