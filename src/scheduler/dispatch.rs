//! Admission, dispatch, preemption and aging — the core scheduling
//! algorithm of §4.1. All state mutation here happens under the
//! `queries -> workers -> dispatch` lock order mandated by §5.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::bounded;
use log::{info, warn};

use crate::query::{ClientId, Query, QueryId, QueryState, WorkerId};

use super::client_conn::ClientMessage;
use super::state::{Policy, SchedulerState, WorkerCommand, WorkerStatus};

/// Admits a new query: assigns an id, appends to READY, runs dispatch.
/// Must be called with no locks already held by the caller.
pub fn admit(state: &Arc<SchedulerState>, script_path: String, priority: i32, client_channel: ClientId) -> QueryId {
    let id = {
        let mut queries = state.queries.lock().unwrap();
        let id = queries.alloc_id();
        let query = Query::new(id, priority, script_path.into(), client_channel);
        queries.insert_ready(query);
        id
    };
    info!("scheduler: admitted query {} prio={} client={}", id, priority, client_channel);
    run_dispatch(state);
    id
}

/// The dispatch algorithm: assign READY queries to free workers until
/// either side runs out, preempting first if the policy allows it and no
/// worker is free.
pub fn run_dispatch(state: &Arc<SchedulerState>) {
    loop {
        let mut queries = state.queries.lock().unwrap();
        let mut workers = state.workers.lock().unwrap();
        let _dispatch_guard = state.dispatch.lock().unwrap();

        if queries.is_ready_empty() {
            return;
        }

        let next_id = match queries.select_next_ready(state.policy) {
            Some(id) => id,
            None => return,
        };

        let worker_id = match workers.free_worker() {
            Some(w) => w,
            None => {
                if state.policy != Policy::Priority {
                    return;
                }
                match try_preempt(&mut queries, &mut workers, next_id) {
                    Some(w) => w,
                    None => return,
                }
            }
        };

        let script_path = queries.get(next_id).unwrap().script_path.to_string_lossy().to_string();
        queries.remove_from_ready(next_id);
        {
            let q = queries.get_mut(next_id).unwrap();
            q.state = QueryState::Exec;
            q.assigned_worker = Some(worker_id);
            q.ready_cycles = 0;
        }
        let pc = queries.get(next_id).unwrap().pc;

        let handle = workers.workers.get_mut(&worker_id).unwrap();
        handle.status = WorkerStatus::Busy;
        handle.current_query = Some(next_id);
        let send_result = handle.to_worker.send(WorkerCommand::Execute {
            query_id: next_id,
            pc,
            script_path,
        });

        drop(_dispatch_guard);
        drop(workers);
        drop(queries);

        if send_result.is_err() {
            // Worker vanished between selection and send: best-effort,
            // put the query back and let the next cycle retry.
            warn!("scheduler: worker {} gone before EXECUTE could be sent, re-queueing query {}", worker_id, next_id);
            let mut queries = state.queries.lock().unwrap();
            if let Some(q) = queries.get_mut(next_id) {
                q.state = QueryState::Ready;
                q.assigned_worker = None;
            }
            queries.reinsert_ready(next_id);
            let mut workers = state.workers.lock().unwrap();
            workers.remove(worker_id);
            continue;
        }
    }
}

/// PRIORITY-only: preempts the busy worker running the largest-priority
/// (lowest actual priority) query if `candidate`'s priority is strictly
/// smaller. Blocks on the worker's synchronous eviction reply.
fn try_preempt(
    queries: &mut super::state::QueryTable,
    workers: &mut super::state::WorkerTable,
    candidate: QueryId,
) -> Option<WorkerId> {
    let (worker_id, victim_id, victim_priority) = workers.lowest_priority_busy_worker(queries)?;
    let candidate_priority = queries.get(candidate)?.priority;
    if candidate_priority >= victim_priority {
        return None;
    }

    let (reply_tx, reply_rx) = bounded(1);
    let handle = workers.workers.get_mut(&worker_id)?;
    handle.to_worker.send(WorkerCommand::Evict { reply: reply_tx }).ok()?;

    let pc = reply_rx.recv_timeout(Duration::from_secs(30)).ok()?;

    let victim = queries.get_mut(victim_id)?;
    victim.pc = pc;
    victim.state = QueryState::Ready;
    victim.assigned_worker = None;
    queries.reinsert_ready(victim_id);

    let handle = workers.workers.get_mut(&worker_id)?;
    handle.status = WorkerStatus::Idle;
    handle.current_query = None;
    Some(worker_id)
}

/// Periodic aging tick: decrements priority for every READY query with
/// `priority > 0`, resets `ready_cycles`, and re-dispatches if anything
/// changed. Disabled by the caller unless policy is PRIORITY and the
/// interval is positive.
pub fn age_tick(state: &Arc<SchedulerState>) {
    let mut changed = false;
    {
        let mut queries = state.queries.lock().unwrap();
        let ids = queries.ready_ids();
        for id in ids {
            if let Some(q) = queries.get_mut(id) {
                if q.age_one_step() {
                    changed = true;
                }
            }
        }
    }
    if changed {
        run_dispatch(state);
    }
}

/// Runs an aging thread for the lifetime of the process. Intended to be
/// spawned once at start-up; returns immediately if aging is disabled.
pub fn spawn_aging_thread(state: Arc<SchedulerState>, interval_ms: u64) {
    if state.policy != Policy::Priority || interval_ms == 0 {
        info!("scheduler: aging disabled (policy={:?}, interval={}ms)", state.policy, interval_ms);
        return;
    }
    std::thread::spawn(move || loop {
        std::thread::sleep(Duration::from_millis(interval_ms));
        age_tick(&state);
    });
}

/// A worker's connection dropped while it held a query: the query returns
/// to READY with `pc = 0` (no preserved context), the worker is removed.
pub fn on_worker_disconnected(state: &Arc<SchedulerState>, worker_id: WorkerId) {
    let orphaned_query = {
        let mut workers = state.workers.lock().unwrap();
        workers.remove(worker_id).and_then(|h| h.current_query)
    };
    if let Some(qid) = orphaned_query {
        let mut queries = state.queries.lock().unwrap();
        if let Some(q) = queries.get_mut(qid) {
            q.pc = 0;
            q.state = QueryState::Ready;
            q.assigned_worker = None;
        }
        queries.reinsert_ready(qid);
    }
    run_dispatch(state);
}

/// A client channel closed: every query it submitted that is still READY
/// is cancelled immediately; an EXEC query is preempted first, then
/// retired. Per §4.1.
pub fn on_client_disconnected(state: &Arc<SchedulerState>, client_id: ClientId) {
    let affected: Vec<QueryId> = {
        let queries = state.queries.lock().unwrap();
        queries
            .queries
            .values()
            .filter(|q| q.client_channel == client_id && q.state != QueryState::Exit)
            .map(|q| q.id)
            .collect()
    };

    for qid in affected {
        let (state_now, worker) = {
            let queries = state.queries.lock().unwrap();
            match queries.get(qid) {
                Some(q) => (q.state, q.assigned_worker),
                None => continue,
            }
        };

        match state_now {
            QueryState::Ready => {
                let mut queries = state.queries.lock().unwrap();
                queries.remove_from_ready(qid);
                if let Some(q) = queries.get_mut(qid) {
                    q.state = QueryState::Exit;
                }
            }
            QueryState::Exec => {
                if let Some(worker_id) = worker {
                    evict_and_retire(state, worker_id, qid);
                }
            }
            QueryState::Exit => {}
        }
    }
    state.clients.lock().unwrap().remove(&client_id);
}

fn evict_and_retire(state: &Arc<SchedulerState>, worker_id: WorkerId, query_id: QueryId) {
    let reply_rx = {
        let mut workers = state.workers.lock().unwrap();
        let handle = match workers.workers.get_mut(&worker_id) {
            Some(h) => h,
            None => return,
        };
        let (reply_tx, reply_rx) = bounded(1);
        if handle.to_worker.send(WorkerCommand::Evict { reply: reply_tx }).is_err() {
            return;
        }
        reply_rx
    };
    let _pc = reply_rx.recv_timeout(Duration::from_secs(30));

    let mut workers = state.workers.lock().unwrap();
    if let Some(handle) = workers.workers.get_mut(&worker_id) {
        handle.status = WorkerStatus::Idle;
        handle.current_query = None;
    }
    drop(workers);

    let mut queries = state.queries.lock().unwrap();
    queries.remove_from_ready(query_id);
    if let Some(q) = queries.get_mut(query_id) {
        q.state = QueryState::Exit;
        q.assigned_worker = None;
    }
    drop(queries);
    run_dispatch(state);
}

/// Forwards an event that a worker emitted to the query's originating
/// client, dropping it silently if the client has already disconnected.
pub fn forward_to_client(state: &Arc<SchedulerState>, client_id: ClientId, message: ClientMessage) {
    let clients = state.clients.lock().unwrap();
    if let Some(handle) = clients.get(&client_id) {
        let _ = handle.to_client.send(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::state::WorkerHandle;
    use crossbeam_channel::Receiver;

    fn add_worker(state: &Arc<SchedulerState>) -> (WorkerId, Receiver<WorkerCommand>) {
        let (to_worker, rx) = crossbeam_channel::unbounded();
        let mut workers = state.workers.lock().unwrap();
        let id = workers.alloc_id();
        workers.insert(WorkerHandle { id, status: WorkerStatus::Idle, current_query: None, to_worker });
        (id, rx)
    }

    fn expect_execute(rx: &Receiver<WorkerCommand>) -> (QueryId, u32, String) {
        match rx.recv_timeout(Duration::from_millis(100)).expect("expected a command") {
            WorkerCommand::Execute { query_id, pc, script_path } => (query_id, pc, script_path),
            WorkerCommand::Evict { .. } => panic!("expected Execute, got Evict"),
        }
    }

    #[test]
    fn fifo_dispatches_in_arrival_order() {
        let state = Arc::new(SchedulerState::new(Policy::Fifo));
        let (_w1, rx) = add_worker(&state);

        let q1 = admit(&state, "script_a".into(), 5, 0);
        let (dispatched, _, _) = expect_execute(&rx);
        assert_eq!(dispatched, q1);

        // No second worker free: Q2 stays READY.
        let q2 = admit(&state, "script_b".into(), 1, 0);
        assert!(rx.try_recv().is_err());
        assert_eq!(state.queries.lock().unwrap().get(q2).unwrap().state, QueryState::Ready);
    }

    #[test]
    fn priority_policy_picks_lowest_number_first() {
        let state = Arc::new(SchedulerState::new(Policy::Priority));
        let (_w1, rx) = add_worker(&state);

        // Worker busy with a placeholder so both submissions queue up READY.
        {
            let mut workers = state.workers.lock().unwrap();
            workers.workers.get_mut(&_w1).unwrap().status = WorkerStatus::Busy;
        }
        let high_num_low_prio = admit(&state, "script_a".into(), 5, 0);
        let low_num_high_prio = admit(&state, "script_b".into(), 1, 0);
        assert!(rx.try_recv().is_err());

        {
            let mut workers = state.workers.lock().unwrap();
            workers.workers.get_mut(&_w1).unwrap().status = WorkerStatus::Idle;
        }
        run_dispatch(&state);
        let (dispatched, _, _) = expect_execute(&rx);
        assert_eq!(dispatched, low_num_high_prio);
        assert_ne!(dispatched, high_num_low_prio);
    }

    #[test]
    fn preemption_evicts_lower_priority_running_query() {
        let state = Arc::new(SchedulerState::new(Policy::Priority));
        let (_w1, rx) = add_worker(&state);

        let running = admit(&state, "script_a".into(), 5, 0);
        let (dispatched, _, _) = expect_execute(&rx);
        assert_eq!(dispatched, running);

        let urgent = admit(&state, "script_b".into(), 0, 0);

        // Preemption requires the worker side to answer DISPATCH_EVICT.
        match rx.recv_timeout(Duration::from_millis(100)).unwrap() {
            WorkerCommand::Evict { reply } => reply.send(7).unwrap(),
            WorkerCommand::Execute { .. } => panic!("expected Evict"),
        }

        let (dispatched_next, _, _) = expect_execute(&rx);
        assert_eq!(dispatched_next, urgent);

        let queries = state.queries.lock().unwrap();
        assert_eq!(queries.get(running).unwrap().state, QueryState::Ready);
        assert_eq!(queries.get(running).unwrap().pc, 7);
    }

    #[test]
    fn fifo_never_preempts() {
        let state = Arc::new(SchedulerState::new(Policy::Fifo));
        let (_w1, rx) = add_worker(&state);

        let running = admit(&state, "script_a".into(), 5, 0);
        expect_execute(&rx);
        admit(&state, "script_b".into(), 0, 0);
        assert!(rx.try_recv().is_err());
        assert_eq!(state.queries.lock().unwrap().get(running).unwrap().state, QueryState::Exec);
    }

    #[test]
    fn aging_promotes_starved_ready_query_and_redispatches() {
        let state = Arc::new(SchedulerState::new(Policy::Priority));
        let (_w1, rx) = add_worker(&state);

        let running = admit(&state, "script_a".into(), 5, 0);
        expect_execute(&rx);
        let starved = admit(&state, "script_b".into(), 3, 0);
        assert!(rx.try_recv().is_err());

        // Three ticks bring the starved query strictly below the running
        // query's priority (5), which must trigger preemption.
        for _ in 0..3 {
            age_tick(&state);
        }
        assert_eq!(state.queries.lock().unwrap().get(starved).unwrap().priority, 0);

        match rx.recv_timeout(Duration::from_millis(100)).unwrap() {
            WorkerCommand::Evict { reply } => reply.send(0).unwrap(),
            WorkerCommand::Execute { .. } => panic!("expected Evict once starved query outranks running"),
        }

        let (dispatched, _, _) = expect_execute(&rx);
        assert_eq!(dispatched, starved);

        // A fourth tick is a no-op: starved's priority cannot go negative,
        // and it is no longer READY (now EXEC).
        age_tick(&state);
        assert_eq!(state.queries.lock().unwrap().get(running).unwrap().state, QueryState::Ready);
    }

    #[test]
    fn worker_disconnect_returns_query_to_ready_with_pc_zero() {
        let state = Arc::new(SchedulerState::new(Policy::Fifo));
        let (w1, rx) = add_worker(&state);
        let q = admit(&state, "script_a".into(), 1, 0);
        expect_execute(&rx);
        if let Some(query) = state.queries.lock().unwrap().get_mut(q) {
            query.pc = 42;
        }

        on_worker_disconnected(&state, w1);

        let queries = state.queries.lock().unwrap();
        assert_eq!(queries.get(q).unwrap().state, QueryState::Ready);
        assert_eq!(queries.get(q).unwrap().pc, 0);
        assert!(queries.get(q).unwrap().assigned_worker.is_none());
    }
}
