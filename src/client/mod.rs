//! Client-side library functions: the handshake, submitting a query, and
//! draining the scheduler's reply stream. No REPL or command parser lives
//! here — composing queries into a session is the caller's concern.

use std::io::{BufReader, Write};
use std::net::TcpStream;

use thiserror::Error;

use crate::wire::{Frame, OpCode, WireError};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// An event the scheduler sent back about a submitted query.
#[derive(Debug)]
pub enum SchedulerReply {
    ReadResult { query_id: u32, file_tag: String, data: Vec<u8> },
    QueryFinished { reason: String },
    ExecError { message: String },
}

pub struct Session {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Session {
    pub fn connect(addr: &str) -> Result<Self, ClientError> {
        let mut stream = TcpStream::connect(addr)?;
        Frame::write_op(&mut stream, OpCode::HandshakeClient)?;
        stream.flush()?;

        let op = Frame::read_op(&mut stream)?;
        if op != OpCode::Confirmation {
            return Err(ClientError::Wire(WireError::Malformed(format!("expected CONFIRMATION, got {:?}", op))));
        }
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Session { reader, writer: stream })
    }

    /// Submits a query script at `script_path` with the given priority.
    pub fn submit_query(&mut self, script_path: &str, priority: i32) -> Result<(), ClientError> {
        Frame::write_string(&mut self.writer, script_path)?;
        Frame::write_i32(&mut self.writer, priority)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Blocks for the next reply the scheduler sends on this connection.
    pub fn next_reply(&mut self) -> Result<SchedulerReply, ClientError> {
        let op = Frame::read_op(&mut self.reader)?;
        match op {
            OpCode::ReadResult => {
                let query_id = Frame::read_u32(&mut self.reader)?;
                let file_tag = Frame::read_string(&mut self.reader)?;
                let data = Frame::read_bytes(&mut self.reader)?;
                Ok(SchedulerReply::ReadResult { query_id, file_tag, data })
            }
            OpCode::QueryFinished => {
                let reason = Frame::read_string(&mut self.reader)?;
                Ok(SchedulerReply::QueryFinished { reason })
            }
            OpCode::ExecError => {
                let message = Frame::read_string(&mut self.reader)?;
                Ok(SchedulerReply::ExecError { message })
            }
            other => Err(ClientError::Wire(WireError::Malformed(format!("unexpected reply op {:?}", other)))),
        }
    }
}
