//! On-the-wire message framing shared by all four roles.
//!
//! Every message begins with a 1-word operation code. Integer scalars that
//! cross a process boundary are big-endian ("network byte order"); payload
//! fields following a length prefix are raw bytes. This module only knows
//! how to read/write the primitive pieces of that framing — it has no
//! knowledge of which op codes are legal in which direction, that lives in
//! `scheduler`, `worker` and `storage`.

use std::io::{self, Read, Write};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("connection closed")]
    Closed,
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type WireResult<T> = Result<T, WireError>;

/// Operation codes, canonical wire values per the protocol spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum OpCode {
    GetBlockSize = 100,
    BlockSize = 101,
    HandshakeWorker = 102,
    Confirmation = 103,
    HandshakeClient = 105,

    OpCreate = 200,
    OpRead = 202,
    OpWrite = 203,
    OpTruncate = 204,
    OpDelete = 205,
    OpTag = 206,
    OpCommit = 207,
    OpFlush = 208,
    OpEnd = 209,

    OpOk = 210,
    OpError = 211,
    ReadResult = 212,

    OpPc = 300,
    ReadNotice = 303,
    QueryFinished = 304,
    DispatchEvict = 305,
    DispatchExec = 306,
    ExecError = 307,
}

impl OpCode {
    pub fn from_u32(v: u32) -> WireResult<Self> {
        use OpCode::*;
        Ok(match v {
            100 => GetBlockSize,
            101 => BlockSize,
            102 => HandshakeWorker,
            103 => Confirmation,
            105 => HandshakeClient,
            200 => OpCreate,
            202 => OpRead,
            203 => OpWrite,
            204 => OpTruncate,
            205 => OpDelete,
            206 => OpTag,
            207 => OpCommit,
            208 => OpFlush,
            209 => OpEnd,
            210 => OpOk,
            211 => OpError,
            212 => ReadResult,
            300 => OpPc,
            303 => ReadNotice,
            304 => QueryFinished,
            305 => DispatchEvict,
            306 => DispatchExec,
            307 => ExecError,
            other => return Err(WireError::Malformed(format!("unknown op code {}", other))),
        })
    }
}

/// Thin wrapper that reads/writes the primitive framing elements on any
/// `Read + Write` stream (in practice a `std::net::TcpStream`).
pub struct Frame;

impl Frame {
    pub fn write_op<W: Write>(w: &mut W, op: OpCode) -> WireResult<()> {
        Self::write_u32(w, op as u32)
    }

    pub fn read_op<R: Read>(r: &mut R) -> WireResult<OpCode> {
        OpCode::from_u32(Self::read_u32(r)?)
    }

    pub fn write_u32<W: Write>(w: &mut W, v: u32) -> WireResult<()> {
        w.write_all(&v.to_be_bytes())?;
        Ok(())
    }

    pub fn read_u32<R: Read>(r: &mut R) -> WireResult<u32> {
        let mut buf = [0u8; 4];
        read_exact_or_closed(r, &mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    pub fn write_i32<W: Write>(w: &mut W, v: i32) -> WireResult<()> {
        w.write_all(&v.to_be_bytes())?;
        Ok(())
    }

    pub fn read_i32<R: Read>(r: &mut R) -> WireResult<i32> {
        let mut buf = [0u8; 4];
        read_exact_or_closed(r, &mut buf)?;
        Ok(i32::from_be_bytes(buf))
    }

    /// `u32 len` followed by `len` raw bytes.
    pub fn write_bytes<W: Write>(w: &mut W, data: &[u8]) -> WireResult<()> {
        Self::write_u32(w, data.len() as u32)?;
        w.write_all(data)?;
        Ok(())
    }

    pub fn read_bytes<R: Read>(r: &mut R) -> WireResult<Vec<u8>> {
        let len = Self::read_u32(r)? as usize;
        let mut buf = vec![0u8; len];
        read_exact_or_closed(r, &mut buf)?;
        Ok(buf)
    }

    /// `u32 len` followed by `len` UTF-8 bytes.
    pub fn write_string<W: Write>(w: &mut W, s: &str) -> WireResult<()> {
        Self::write_bytes(w, s.as_bytes())
    }

    pub fn read_string<R: Read>(r: &mut R) -> WireResult<String> {
        let bytes = Self::read_bytes(r)?;
        String::from_utf8(bytes).map_err(|e| WireError::Malformed(e.to_string()))
    }
}

/// `read_exact` that reports a zero-byte read as a clean `WireError::Closed`
/// rather than an `UnexpectedEof` io error, so callers can tell "peer hung
/// up between messages" apart from "peer sent a truncated message".
fn read_exact_or_closed<R: Read>(r: &mut R, buf: &mut [u8]) -> WireResult<()> {
    if buf.is_empty() {
        return Ok(());
    }
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Err(WireError::Closed),
            Ok(0) => return Err(WireError::Malformed("short read".into())),
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(WireError::Io(e)),
        }
    }
    Ok(())
}

/// Parses a `file:tag` identifier, defaulting an absent/empty tag to `BASE`.
pub fn parse_file_tag(s: &str) -> (String, String) {
    match s.split_once(':') {
        Some((file, tag)) if !tag.is_empty() => (file.to_string(), tag.to_string()),
        Some((file, _)) => (file.to_string(), "BASE".to_string()),
        None => (s.to_string(), "BASE".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn roundtrip_primitives() {
        let mut buf = Vec::new();
        Frame::write_op(&mut buf, OpCode::DispatchExec).unwrap();
        Frame::write_i32(&mut buf, 42).unwrap();
        Frame::write_string(&mut buf, "scripts/a.q").unwrap();

        let mut cur = Cursor::new(buf);
        assert_eq!(Frame::read_op(&mut cur).unwrap(), OpCode::DispatchExec);
        assert_eq!(Frame::read_i32(&mut cur).unwrap(), 42);
        assert_eq!(Frame::read_string(&mut cur).unwrap(), "scripts/a.q");
    }

    #[test]
    fn closed_on_empty_read() {
        let mut cur = Cursor::new(Vec::<u8>::new());
        match Frame::read_op(&mut cur) {
            Err(WireError::Closed) => {}
            other => panic!("expected Closed, got {:?}", other),
        }
    }

    #[test]
    fn file_tag_defaults_to_base() {
        assert_eq!(parse_file_tag("foo"), ("foo".into(), "BASE".into()));
        assert_eq!(parse_file_tag("foo:"), ("foo".into(), "BASE".into()));
        assert_eq!(parse_file_tag("foo:dev"), ("foo".into(), "dev".into()));
    }
}
