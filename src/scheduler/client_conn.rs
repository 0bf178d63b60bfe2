//! Client-facing connection thread: handshake, reads query submissions,
//! and forwards READ_RESULT / QUERY_FINISHED / EXEC_ERROR events back to
//! the client as they arrive from the worker side.

use std::io::{BufReader, BufWriter, Write};
use std::net::TcpStream;
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver};
use log::{info, warn};

use crate::wire::{Frame, OpCode, WireError};

use super::dispatch::admit;
use super::error::SchedulerError;
use super::state::{ClientHandle, SchedulerState};

/// An event destined for this client, queued by the worker-facing side of
/// the scheduler and drained by this connection's writer loop.
pub enum ClientMessage {
    ReadResult { query_id: u32, file_tag: String, data: Vec<u8> },
    QueryFinished { reason: String },
    ExecError { message: String },
}

pub fn handle_connection(stream: TcpStream, state: Arc<SchedulerState>) -> Result<(), SchedulerError> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream);

    let op = Frame::read_op(&mut reader)?;
    if op != OpCode::HandshakeClient {
        return Err(SchedulerError::Rejected(format!("expected HANDSHAKE_CLIENT, got {:?}", op)));
    }
    Frame::write_op(&mut writer, OpCode::Confirmation)?;
    writer.flush()?;

    let client_id = state.alloc_client_id();
    let (to_client, from_scheduler) = unbounded::<ClientMessage>();
    state.clients.lock().unwrap().insert(client_id, ClientHandle { to_client });
    info!("scheduler: client {} connected", client_id);

    let writer_thread = {
        let mut writer = writer;
        std::thread::spawn(move || drain_client_events(&mut writer, from_scheduler))
    };

    let result = read_submissions(&mut reader, &state, client_id);

    super::dispatch::on_client_disconnected(&state, client_id);
    drop(state.clients.lock().unwrap().remove(&client_id));
    let _ = writer_thread.join();

    match result {
        Err(SchedulerError::Wire(WireError::Closed)) => Ok(()),
        other => other,
    }
}

fn read_submissions<R: std::io::Read>(reader: &mut R, state: &Arc<SchedulerState>, client_id: u32) -> Result<(), SchedulerError> {
    loop {
        let path_len = Frame::read_u32(reader)?;
        let mut path_buf = vec![0u8; path_len as usize];
        std::io::Read::read_exact(reader, &mut path_buf)?;
        let script_path = String::from_utf8(path_buf).map_err(|e| SchedulerError::Rejected(e.to_string()))?;
        let priority = Frame::read_i32(reader)?;

        admit(state, script_path, priority, client_id);
    }
}

fn drain_client_events(writer: &mut BufWriter<TcpStream>, events: Receiver<ClientMessage>) {
    for msg in events {
        let result = match msg {
            ClientMessage::ReadResult { query_id, file_tag, data } => (|| -> Result<(), WireError> {
                Frame::write_op(writer, OpCode::ReadResult)?;
                Frame::write_u32(writer, query_id)?;
                Frame::write_string(writer, &file_tag)?;
                Frame::write_bytes(writer, &data)?;
                writer.flush()?;
                Ok(())
            })(),
            ClientMessage::QueryFinished { reason } => (|| -> Result<(), WireError> {
                Frame::write_op(writer, OpCode::QueryFinished)?;
                Frame::write_string(writer, &reason)?;
                writer.flush()?;
                Ok(())
            })(),
            ClientMessage::ExecError { message } => (|| -> Result<(), WireError> {
                Frame::write_op(writer, OpCode::ExecError)?;
                Frame::write_string(writer, &message)?;
                writer.flush()?;
                Ok(())
            })(),
        };
        if let Err(e) = result {
            warn!("scheduler: client write failed, dropping remaining events: {}", e);
            return;
        }
    }
}
