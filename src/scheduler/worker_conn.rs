//! Worker-facing connection thread. Owns the TCP stream exclusively and
//! alternates, in a single loop, between draining queued `WorkerCommand`s
//! (EXECUTE / DISPATCH_EVICT) onto the wire and polling for worker-sent
//! events (READ_NOTICE, READ_RESULT, OP_END, EXEC_ERROR) with a short read
//! timeout. A single reader avoids any race between an evict's synchronous
//! raw-`i32` reply and the normal opcode-tagged event stream — both are
//! read by this one thread, never concurrently by another.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;
use log::{debug, info, warn};

use crate::wire::{Frame, OpCode};

use super::client_conn::ClientMessage;
use super::dispatch::{forward_to_client, on_worker_disconnected, run_dispatch};
use super::error::SchedulerError;
use super::state::{SchedulerState, WorkerCommand, WorkerHandle, WorkerStatus};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub fn handle_connection(mut stream: TcpStream, state: Arc<SchedulerState>) -> Result<(), SchedulerError> {
    let op = Frame::read_op(&mut stream)?;
    if op != OpCode::HandshakeWorker {
        return Err(SchedulerError::Rejected(format!("expected HANDSHAKE_WORKER, got {:?}", op)));
    }
    let worker_label = Frame::read_string(&mut stream)?;
    Frame::write_op(&mut stream, OpCode::Confirmation)?;

    let (to_worker, cmd_rx) = crossbeam_channel::unbounded();
    let worker_id = {
        let mut workers = state.workers.lock().unwrap();
        let id = workers.alloc_id();
        workers.insert(WorkerHandle { id, status: WorkerStatus::Idle, current_query: None, to_worker });
        id
    };
    info!("scheduler: worker {} ({}) connected", worker_id, worker_label);
    run_dispatch(&state);

    stream.set_read_timeout(Some(POLL_INTERVAL))?;
    let result = io_loop(&mut stream, &state, &cmd_rx);

    on_worker_disconnected(&state, worker_id);
    info!("scheduler: worker {} disconnected", worker_id);
    result
}

enum PollOutcome {
    Timeout,
    Closed,
    Op(OpCode),
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Reads the 4-byte op code with the stream's poll timeout in effect.
/// Bytes already received toward the current frame are never discarded on
/// a timeout; only a timeout with zero bytes received yields `Timeout`.
fn poll_read_op(stream: &mut TcpStream) -> Result<PollOutcome, SchedulerError> {
    let mut buf = [0u8; 4];
    let mut filled = 0;
    loop {
        match stream.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(PollOutcome::Closed),
            Ok(0) => return Err(SchedulerError::Rejected("worker closed mid-frame".into())),
            Ok(n) => {
                filled += n;
                if filled == buf.len() {
                    let v = u32::from_be_bytes(buf);
                    return OpCode::from_u32(v).map(PollOutcome::Op).map_err(SchedulerError::Wire);
                }
            }
            Err(e) if is_timeout(&e) => {
                if filled == 0 {
                    return Ok(PollOutcome::Timeout);
                }
                continue;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(SchedulerError::Io(e)),
        }
    }
}

fn read_i32_no_timeout(stream: &mut TcpStream) -> Result<i32, SchedulerError> {
    stream.set_read_timeout(None)?;
    let result = Frame::read_i32(stream).map_err(SchedulerError::Wire);
    stream.set_read_timeout(Some(POLL_INTERVAL))?;
    result
}

fn io_loop(stream: &mut TcpStream, state: &Arc<SchedulerState>, cmd_rx: &Receiver<WorkerCommand>) -> Result<(), SchedulerError> {
    loop {
        while let Ok(cmd) = cmd_rx.try_recv() {
            match cmd {
                WorkerCommand::Execute { query_id, pc, script_path } => {
                    Frame::write_op(stream, OpCode::DispatchExec)?;
                    Frame::write_i32(stream, query_id as i32)?;
                    Frame::write_i32(stream, pc as i32)?;
                    Frame::write_string(stream, &script_path)?;
                    stream.flush()?;
                }
                WorkerCommand::Evict { reply } => {
                    Frame::write_op(stream, OpCode::DispatchEvict)?;
                    stream.flush()?;
                    let pc = read_i32_no_timeout(stream)?;
                    let _ = reply.send(pc as u32);
                }
            }
        }

        match poll_read_op(stream)? {
            PollOutcome::Timeout => continue,
            PollOutcome::Closed => return Ok(()),
            PollOutcome::Op(op) => handle_event(stream, state, op)?,
        }
    }
}

fn handle_event(stream: &mut TcpStream, state: &Arc<SchedulerState>, op: OpCode) -> Result<(), SchedulerError> {
    // The rest of an event's payload (if any) is small and the worker
    // flushes it in one write; block for it rather than polling.
    stream.set_read_timeout(None)?;
    let outcome = handle_event_inner(stream, state, op);
    stream.set_read_timeout(Some(POLL_INTERVAL))?;
    outcome
}

fn handle_event_inner(stream: &mut TcpStream, state: &Arc<SchedulerState>, op: OpCode) -> Result<(), SchedulerError> {
    match op {
        OpCode::ReadNotice => {
            let query_id = Frame::read_u32(stream)?;
            debug!("scheduler: worker read-notice for query {}", query_id);
            Ok(())
        }
        OpCode::ReadResult => {
            let query_id = Frame::read_u32(stream)?;
            let file_tag = Frame::read_string(stream)?;
            let data = Frame::read_bytes(stream)?;
            if let Some(client_id) = client_for_query(state, query_id) {
                forward_to_client(state, client_id, ClientMessage::ReadResult { query_id, file_tag, data });
            }
            Ok(())
        }
        OpCode::OpEnd | OpCode::QueryFinished => {
            let query_id = Frame::read_u32(stream)?;
            if let Some(client_id) = retire_query(state, query_id) {
                forward_to_client(state, client_id, ClientMessage::QueryFinished { reason: "completed".into() });
            }
            run_dispatch(state);
            Ok(())
        }
        OpCode::ExecError => {
            let query_id = Frame::read_u32(stream)?;
            let message = Frame::read_string(stream)?;
            if let Some(client_id) = retire_query(state, query_id) {
                forward_to_client(state, client_id, ClientMessage::ExecError { message });
            }
            run_dispatch(state);
            Ok(())
        }
        other => {
            warn!("scheduler: unexpected event op {:?} from worker", other);
            Ok(())
        }
    }
}

fn client_for_query(state: &Arc<SchedulerState>, query_id: u32) -> Option<u32> {
    state.queries.lock().unwrap().get(query_id).map(|q| q.client_channel)
}

/// Marks `query_id` EXIT and frees its worker, returning the originating
/// client id (if still connected) so the caller can send exactly one
/// terminal message to it.
fn retire_query(state: &Arc<SchedulerState>, query_id: u32) -> Option<u32> {
    let mut queries = state.queries.lock().unwrap();
    let q = queries.get_mut(query_id)?;
    q.state = crate::query::QueryState::Exit;
    let client_id = q.client_channel;
    if let Some(worker_id) = q.assigned_worker.take() {
        drop(queries);
        let mut workers = state.workers.lock().unwrap();
        if let Some(handle) = workers.workers.get_mut(&worker_id) {
            handle.status = WorkerStatus::Idle;
            handle.current_query = None;
        }
    }
    Some(client_id)
}
