//! TCP client used by a worker to talk to the storage engine: the
//! `GET_BLOCK_SIZE` handshake, then OP_PC-prefixed requests for every
//! query-level instruction (CREATE/TRUNCATE/WRITE/READ/TAG/COMMIT/FLUSH/
//! DELETE). The same OP_READ/OP_WRITE pair doubles as the paged-memory
//! subsystem's block fetch/writeback primitive: a page fault issues an
//! OP_READ at exactly `(offset = logical_index * block_size, size =
//! block_size)`, and dirty writeback issues the matching OP_WRITE.

use std::io::{BufReader, BufWriter, Write};
use std::net::TcpStream;

use crate::wire::{Frame, OpCode, WireError};

use super::error::WorkerError;

pub struct StorageClient {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
    block_size: u32,
    next_pc: u32,
}

impl StorageClient {
    pub fn connect(addr: &str, worker_id: &str) -> Result<Self, WorkerError> {
        let stream = TcpStream::connect(addr).map_err(WorkerError::Io)?;
        let mut reader = BufReader::new(stream.try_clone().map_err(WorkerError::Io)?);
        let mut writer = BufWriter::new(stream);

        Frame::write_op(&mut writer, OpCode::GetBlockSize).map_err(|e| WorkerError::Wire("storage", e))?;
        Frame::write_string(&mut writer, worker_id).map_err(|e| WorkerError::Wire("storage", e))?;
        writer.flush().map_err(WorkerError::Io)?;

        let op = Frame::read_op(&mut reader).map_err(|e| WorkerError::Wire("storage", e))?;
        if op != OpCode::BlockSize {
            return Err(WorkerError::Wire(
                "storage",
                WireError::Malformed(format!("expected BLOCK_SIZE, got {:?}", op)),
            ));
        }
        let block_size = Frame::read_u32(&mut reader).map_err(|e| WorkerError::Wire("storage", e))?;

        Ok(StorageClient { reader, writer, block_size, next_pc: 0 })
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    fn begin_request(&mut self, op: OpCode) -> Result<(), WorkerError> {
        let pc = self.next_pc;
        self.next_pc = self.next_pc.wrapping_add(1);
        Frame::write_op(&mut self.writer, OpCode::OpPc).map_err(|e| WorkerError::Wire("storage", e))?;
        Frame::write_u32(&mut self.writer, pc).map_err(|e| WorkerError::Wire("storage", e))?;
        Frame::write_op(&mut self.writer, op).map_err(|e| WorkerError::Wire("storage", e))?;
        Ok(())
    }

    fn finish_request(&mut self) -> Result<(), WorkerError> {
        self.writer.flush().map_err(WorkerError::Io)?;
        let op = Frame::read_op(&mut self.reader).map_err(|e| WorkerError::Wire("storage", e))?;
        match op {
            OpCode::OpOk => Ok(()),
            OpCode::OpError => {
                let msg = Frame::read_string(&mut self.reader).map_err(|e| WorkerError::Wire("storage", e))?;
                Err(WorkerError::Storage(msg))
            }
            other => Err(WorkerError::Wire(
                "storage",
                WireError::Malformed(format!("expected OP_OK/OP_ERROR, got {:?}", other)),
            )),
        }
    }

    fn finish_request_with_data(&mut self) -> Result<Vec<u8>, WorkerError> {
        let op = Frame::read_op(&mut self.reader).map_err(|e| WorkerError::Wire("storage", e))?;
        match op {
            OpCode::OpOk => {
                self.writer.flush().ok();
                Frame::read_bytes(&mut self.reader).map_err(|e| WorkerError::Wire("storage", e))
            }
            OpCode::OpError => {
                let msg = Frame::read_string(&mut self.reader).map_err(|e| WorkerError::Wire("storage", e))?;
                Err(WorkerError::Storage(msg))
            }
            other => Err(WorkerError::Wire(
                "storage",
                WireError::Malformed(format!("expected OP_OK/OP_ERROR, got {:?}", other)),
            )),
        }
    }

    pub fn create(&mut self, file: &str, tag: &str) -> Result<(), WorkerError> {
        self.begin_request(OpCode::OpCreate)?;
        Frame::write_string(&mut self.writer, &format!("{}:{}", file, tag)).map_err(|e| WorkerError::Wire("storage", e))?;
        self.finish_request()
    }

    pub fn truncate(&mut self, file: &str, tag: &str, size: u64) -> Result<(), WorkerError> {
        self.begin_request(OpCode::OpTruncate)?;
        Frame::write_string(&mut self.writer, &format!("{}:{}", file, tag)).map_err(|e| WorkerError::Wire("storage", e))?;
        Frame::write_u32(&mut self.writer, size as u32).map_err(|e| WorkerError::Wire("storage", e))?;
        self.finish_request()
    }

    pub fn write(&mut self, file: &str, tag: &str, offset: u64, data: &[u8]) -> Result<(), WorkerError> {
        self.begin_request(OpCode::OpWrite)?;
        Frame::write_string(&mut self.writer, &format!("{}:{}", file, tag)).map_err(|e| WorkerError::Wire("storage", e))?;
        Frame::write_u32(&mut self.writer, offset as u32).map_err(|e| WorkerError::Wire("storage", e))?;
        Frame::write_bytes(&mut self.writer, data).map_err(|e| WorkerError::Wire("storage", e))?;
        self.finish_request()
    }

    pub fn read(&mut self, file: &str, tag: &str, offset: u64, size: u64) -> Result<Vec<u8>, WorkerError> {
        self.begin_request(OpCode::OpRead)?;
        Frame::write_string(&mut self.writer, &format!("{}:{}", file, tag)).map_err(|e| WorkerError::Wire("storage", e))?;
        Frame::write_u32(&mut self.writer, offset as u32).map_err(|e| WorkerError::Wire("storage", e))?;
        Frame::write_u32(&mut self.writer, size as u32).map_err(|e| WorkerError::Wire("storage", e))?;
        self.writer.flush().map_err(WorkerError::Io)?;
        self.finish_request_with_data()
    }

    pub fn tag(&mut self, file: &str, src_tag: &str, dst_file: &str, dst_tag: &str) -> Result<(), WorkerError> {
        self.begin_request(OpCode::OpTag)?;
        Frame::write_string(&mut self.writer, &format!("{}:{}", file, src_tag)).map_err(|e| WorkerError::Wire("storage", e))?;
        Frame::write_string(&mut self.writer, &format!("{}:{}", dst_file, dst_tag)).map_err(|e| WorkerError::Wire("storage", e))?;
        self.finish_request()
    }

    pub fn commit(&mut self, file: &str, tag: &str) -> Result<(), WorkerError> {
        self.begin_request(OpCode::OpCommit)?;
        Frame::write_string(&mut self.writer, &format!("{}:{}", file, tag)).map_err(|e| WorkerError::Wire("storage", e))?;
        self.finish_request()
    }

    pub fn flush(&mut self, file: &str, tag: &str) -> Result<(), WorkerError> {
        self.begin_request(OpCode::OpFlush)?;
        Frame::write_string(&mut self.writer, &format!("{}:{}", file, tag)).map_err(|e| WorkerError::Wire("storage", e))?;
        self.finish_request()
    }

    pub fn delete(&mut self, file: &str, tag: &str) -> Result<(), WorkerError> {
        self.begin_request(OpCode::OpDelete)?;
        Frame::write_string(&mut self.writer, &format!("{}:{}", file, tag)).map_err(|e| WorkerError::Wire("storage", e))?;
        self.finish_request()
    }

    /// Fetches exactly one page's worth of content for a page fault.
    pub fn get_block(&mut self, file: &str, tag: &str, logical_index: usize) -> Result<Vec<u8>, WorkerError> {
        let offset = logical_index as u64 * self.block_size as u64;
        self.read(file, tag, offset, self.block_size as u64)
    }

    /// Writes back exactly one dirty page.
    pub fn write_block(&mut self, file: &str, tag: &str, logical_index: usize, data: &[u8]) -> Result<(), WorkerError> {
        let offset = logical_index as u64 * self.block_size as u64;
        self.write(file, tag, offset, data)
    }

    pub fn end(&mut self) -> Result<(), WorkerError> {
        Frame::write_op(&mut self.writer, OpCode::OpPc).map_err(|e| WorkerError::Wire("storage", e))?;
        Frame::write_u32(&mut self.writer, self.next_pc).map_err(|e| WorkerError::Wire("storage", e))?;
        Frame::write_op(&mut self.writer, OpCode::OpEnd).map_err(|e| WorkerError::Wire("storage", e))?;
        self.writer.flush().map_err(WorkerError::Io)
    }
}
