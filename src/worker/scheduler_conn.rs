//! Worker's connection to the scheduler. Split into two halves that never
//! share a direction: a reader thread only reads `DISPATCH_EXEC` /
//! `DISPATCH_EVICT` from the scheduler and forwards them over an
//! in-process channel; the executor thread owns every write on this
//! connection (events, and the synchronous pc reply to an eviction), so
//! writes are never interleaved between threads.

use std::io::{BufReader, Write};
use std::net::TcpStream;
use std::path::PathBuf;

use crossbeam_channel::{Receiver, Sender};
use log::warn;

use crate::wire::{Frame, OpCode};

use super::error::WorkerError;

pub enum SchedulerEvent {
    Dispatch { query_id: u32, pc: u32, script_path: PathBuf },
    Evict,
}

pub struct EventSink {
    writer: TcpStream,
}

impl EventSink {
    #[cfg(test)]
    pub(crate) fn from_stream(writer: TcpStream) -> Self {
        EventSink { writer }
    }

    pub fn read_notice(&mut self, query_id: u32) -> Result<(), WorkerError> {
        Frame::write_op(&mut self.writer, OpCode::ReadNotice).map_err(|e| WorkerError::Wire("scheduler", e))?;
        Frame::write_u32(&mut self.writer, query_id).map_err(|e| WorkerError::Wire("scheduler", e))?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn read_result(&mut self, query_id: u32, file_tag: &str, data: &[u8]) -> Result<(), WorkerError> {
        Frame::write_op(&mut self.writer, OpCode::ReadResult).map_err(|e| WorkerError::Wire("scheduler", e))?;
        Frame::write_u32(&mut self.writer, query_id).map_err(|e| WorkerError::Wire("scheduler", e))?;
        Frame::write_string(&mut self.writer, file_tag).map_err(|e| WorkerError::Wire("scheduler", e))?;
        Frame::write_bytes(&mut self.writer, data).map_err(|e| WorkerError::Wire("scheduler", e))?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn query_end(&mut self, query_id: u32) -> Result<(), WorkerError> {
        Frame::write_op(&mut self.writer, OpCode::OpEnd).map_err(|e| WorkerError::Wire("scheduler", e))?;
        Frame::write_u32(&mut self.writer, query_id).map_err(|e| WorkerError::Wire("scheduler", e))?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn exec_error(&mut self, query_id: u32, message: &str) -> Result<(), WorkerError> {
        Frame::write_op(&mut self.writer, OpCode::ExecError).map_err(|e| WorkerError::Wire("scheduler", e))?;
        Frame::write_u32(&mut self.writer, query_id).map_err(|e| WorkerError::Wire("scheduler", e))?;
        Frame::write_string(&mut self.writer, message).map_err(|e| WorkerError::Wire("scheduler", e))?;
        self.writer.flush()?;
        Ok(())
    }

    /// Raw (unwrapped) pc reply to a DISPATCH_EVICT, per the wire spec.
    pub fn evict_reply(&mut self, pc: u32) -> Result<(), WorkerError> {
        Frame::write_i32(&mut self.writer, pc as i32).map_err(|e| WorkerError::Wire("scheduler", e))?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Connects, performs the `HANDSHAKE_WORKER`/`CONFIRMATION` exchange, and
/// splits into a reader thread (spawned) plus this connection's `EventSink`
/// and the channel the reader feeds.
pub fn connect(addr: &str, worker_id: &str) -> Result<(EventSink, Receiver<SchedulerEvent>), WorkerError> {
    let mut stream = TcpStream::connect(addr)?;
    Frame::write_op(&mut stream, OpCode::HandshakeWorker).map_err(|e| WorkerError::Wire("scheduler", e))?;
    Frame::write_string(&mut stream, worker_id).map_err(|e| WorkerError::Wire("scheduler", e))?;
    stream.flush()?;

    let op = Frame::read_op(&mut stream).map_err(|e| WorkerError::Wire("scheduler", e))?;
    if op != OpCode::Confirmation {
        return Err(WorkerError::UnknownOpcode(format!("expected CONFIRMATION, got {:?}", op)));
    }

    let read_half = stream.try_clone()?;
    let (tx, rx) = crossbeam_channel::unbounded();
    std::thread::spawn(move || reader_loop(read_half, tx));

    Ok((EventSink { writer: stream }, rx))
}

fn reader_loop(stream: TcpStream, tx: Sender<SchedulerEvent>) {
    let mut reader = BufReader::new(stream);
    loop {
        let op = match Frame::read_op(&mut reader) {
            Ok(op) => op,
            Err(_) => {
                warn!("worker: scheduler connection closed");
                return;
            }
        };
        let event = match op {
            OpCode::DispatchExec => {
                let query_id = match Frame::read_i32(&mut reader) {
                    Ok(v) => v as u32,
                    Err(_) => return,
                };
                let pc = match Frame::read_i32(&mut reader) {
                    Ok(v) => v as u32,
                    Err(_) => return,
                };
                let path = match Frame::read_string(&mut reader) {
                    Ok(s) => s,
                    Err(_) => return,
                };
                SchedulerEvent::Dispatch { query_id, pc, script_path: PathBuf::from(path) }
            }
            OpCode::DispatchEvict => SchedulerEvent::Evict,
            other => {
                warn!("worker: unexpected op {:?} from scheduler", other);
                continue;
            }
        };
        if tx.send(event).is_err() {
            return;
        }
    }
}
