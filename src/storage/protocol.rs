//! The storage engine's worker-facing TCP server. One thread per
//! connection (the spec's concurrency model, §5); the engine itself is
//! wrapped in a single `Mutex` so every request is atomic with respect to
//! every other, matching "one engine-wide lock held for the duration of
//! every request-level operation".

use std::io::{BufReader, BufWriter, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;

use log::{debug, error, info, warn};

use crate::wire::{parse_file_tag, Frame, OpCode, WireError};

use super::{StorageEngine, StorageError};

pub fn serve(addr: &str, engine: Arc<Mutex<StorageEngine>>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr)?;
    info!("storage: listening on {}", addr);
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let engine = Arc::clone(&engine);
                thread::spawn(move || {
                    if let Err(e) = handle_connection(stream, engine) {
                        warn!("storage: connection ended: {}", e);
                    }
                });
            }
            Err(e) => error!("storage: accept failed: {}", e),
        }
    }
    Ok(())
}

fn handle_connection(stream: TcpStream, engine: Arc<Mutex<StorageEngine>>) -> Result<(), WireError> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream);

    // Handshake: either GET_BLOCK_SIZE(id) expecting BLOCK_SIZE(value), or
    // the worker identifies itself out of band and falls straight through
    // to the OP_PC-led request loop.
    let first_op = match Frame::read_op(&mut reader) {
        Ok(op) => op,
        Err(WireError::Closed) => return Ok(()),
        Err(e) => return Err(e),
    };

    let mut pending_op = if first_op == OpCode::GetBlockSize {
        let _worker_id = Frame::read_string(&mut reader)?;
        let block_size = engine.lock().unwrap().block_size();
        Frame::write_op(&mut writer, OpCode::BlockSize)?;
        Frame::write_u32(&mut writer, block_size)?;
        writer.flush()?;
        None
    } else {
        Some(first_op)
    };

    loop {
        let op = match pending_op.take() {
            Some(op) => op,
            None => match Frame::read_op(&mut reader) {
                Ok(op) => op,
                Err(WireError::Closed) => return Ok(()),
                Err(e) => return Err(e),
            },
        };

        if op != OpCode::OpPc {
            return Err(WireError::Malformed(format!("expected OP_PC, got {:?}", op)));
        }
        let pc = Frame::read_u32(&mut reader)?;
        let op = Frame::read_op(&mut reader)?;
        debug!("storage: pc={} op={:?}", pc, op);

        if op == OpCode::OpEnd {
            return Ok(());
        }

        let outcome = dispatch(&mut reader, &engine, op);
        match outcome {
            Ok(Response::Ok) => {
                Frame::write_op(&mut writer, OpCode::OpOk)?;
            }
            Ok(Response::OkWithData(data)) => {
                Frame::write_op(&mut writer, OpCode::OpOk)?;
                Frame::write_bytes(&mut writer, &data)?;
            }
            Err(e) => {
                Frame::write_op(&mut writer, OpCode::OpError)?;
                Frame::write_string(&mut writer, &e.to_string())?;
            }
        }
        writer.flush()?;
    }
}

enum Response {
    Ok,
    OkWithData(Vec<u8>),
}

fn dispatch<R: std::io::Read>(
    reader: &mut R,
    engine: &Arc<Mutex<StorageEngine>>,
    op: OpCode,
) -> Result<Response, StorageError> {
    match op {
        OpCode::OpCreate => {
            let (file, tag) = parse_file_tag(&read_string_or_corrupt(reader)?);
            engine.lock().unwrap().create(&file, &tag)?;
            Ok(Response::Ok)
        }
        OpCode::OpTruncate => {
            let (file, tag) = parse_file_tag(&read_string_or_corrupt(reader)?);
            let size = read_u32_or_corrupt(reader)? as u64;
            engine.lock().unwrap().truncate(&file, &tag, size)?;
            Ok(Response::Ok)
        }
        OpCode::OpWrite => {
            let (file, tag) = parse_file_tag(&read_string_or_corrupt(reader)?);
            let offset = read_u32_or_corrupt(reader)? as u64;
            let content = read_bytes_or_corrupt(reader)?;
            engine.lock().unwrap().write(&file, &tag, offset, &content)?;
            Ok(Response::Ok)
        }
        OpCode::OpRead => {
            let (file, tag) = parse_file_tag(&read_string_or_corrupt(reader)?);
            let offset = read_u32_or_corrupt(reader)? as u64;
            let size = read_u32_or_corrupt(reader)? as u64;
            let data = engine.lock().unwrap().read(&file, &tag, offset, size)?;
            Ok(Response::OkWithData(data))
        }
        OpCode::OpTag => {
            let (file, src_tag) = parse_file_tag(&read_string_or_corrupt(reader)?);
            let (dst_file, dst_tag) = parse_file_tag(&read_string_or_corrupt(reader)?);
            engine.lock().unwrap().tag(&file, &src_tag, &dst_file, &dst_tag)?;
            Ok(Response::Ok)
        }
        OpCode::OpCommit => {
            let (file, tag) = parse_file_tag(&read_string_or_corrupt(reader)?);
            engine.lock().unwrap().commit(&file, &tag)?;
            Ok(Response::Ok)
        }
        OpCode::OpFlush => {
            let (file, tag) = parse_file_tag(&read_string_or_corrupt(reader)?);
            engine.lock().unwrap().flush(&file, &tag)?;
            Ok(Response::Ok)
        }
        OpCode::OpDelete => {
            let (file, tag) = parse_file_tag(&read_string_or_corrupt(reader)?);
            engine.lock().unwrap().delete(&file, &tag)?;
            Ok(Response::Ok)
        }
        other => Err(StorageError::CorruptMetadata(
            "<wire>".into(),
            "".into(),
            format!("unexpected op code in request: {:?}", other),
        )),
    }
}

fn read_string_or_corrupt<R: std::io::Read>(r: &mut R) -> Result<String, StorageError> {
    Frame::read_string(r).map_err(|e| StorageError::CorruptMetadata("<wire>".into(), "".into(), e.to_string()))
}

fn read_u32_or_corrupt<R: std::io::Read>(r: &mut R) -> Result<u32, StorageError> {
    Frame::read_u32(r).map_err(|e| StorageError::CorruptMetadata("<wire>".into(), "".into(), e.to_string()))
}

fn read_bytes_or_corrupt<R: std::io::Read>(r: &mut R) -> Result<Vec<u8>, StorageError> {
    Frame::read_bytes(r).map_err(|e| StorageError::CorruptMetadata("<wire>".into(), "".into(), e.to_string()))
}
