//! # Protocol Frames
//!
//! Defines the envelope of a mesh message (Call vs Reply vs Exception).
//!
//! ## Wire Format
//!
//! All integers are Big-Endian.
//!
//! ```text
//! [version | kind : 4b]   0x8001_00KK, KK = 1 (CALL), 2 (REPLY), 3 (EXCEPTION)
//! [name length    : 4b]   signed, 0 ..= MAX_METHOD_LEN
//! [name           : N ]   UTF-8
//! [seq id         : 4b]   signed
//! [payload        : ..]   everything that remains, opaque
//! ```
//!
//! ## Invariants
//! - **Panic Safety**: All decoding paths return `Result`, never panicking on unknown data.
//! - **Echo**: Replies and exceptions carry the method name and seq id of the call they answer.

use crate::error::Error;
use crate::error::Result;

/// Version bits of the first header word.
const VERSION_1: u32 = 0x8001_0000;
const VERSION_MASK: u32 = 0xffff_0000;
const KIND_MASK: u32 = 0x0000_00ff;

/// Fixed bytes in every header: version word, name length, seq id.
const FIXED_HEADER_LEN: usize = 12;

/// Longest method name a frame may carry.
pub const MAX_METHOD_LEN: usize = 65_535;

/// The kind of a frame. Closed: anything else on the wire is malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Call,
    Reply,
    Exception,
}

impl FrameKind {
    pub fn as_code(self) -> u8 {
        match self {
            Self::Call => 1,
            Self::Reply => 2,
            Self::Exception => 3,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            1 => Ok(Self::Call),
            2 => Ok(Self::Reply),
            3 => Ok(Self::Exception),
            other => Err(Error::UnknownKind(other)),
        }
    }

    /// True for the two kinds that answer a call.
    pub fn is_response(self) -> bool {
        matches!(self, Self::Reply | Self::Exception)
    }
}

impl std::fmt::Display for FrameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Call => write!(f, "CALL"),
            Self::Reply => write!(f, "REPLY"),
            Self::Exception => write!(f, "EXCEPTION"),
        }
    }
}

/// Sequence id correlating a response with its call.
///
/// Scoped to the connection that produced it, not globally unique.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct SeqId(pub i32);

impl std::fmt::Display for SeqId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "seq-{}", self.0)
    }
}

/// Encodes an outbound frame of any kind.
#[derive(Debug, Clone, Copy)]
pub struct FrameEncoder<'a> {
    pub kind: FrameKind,
    pub method: &'a str,
    pub seq: SeqId,
    pub payload: &'a [u8],
}

impl<'a> FrameEncoder<'a> {
    pub fn new(kind: FrameKind, method: &'a str, seq: SeqId, payload: &'a [u8]) -> Self {
        Self { kind, method, seq, payload }
    }

    pub fn call(method: &'a str, seq: SeqId, payload: &'a [u8]) -> Self {
        Self::new(FrameKind::Call, method, seq, payload)
    }

    pub fn reply(method: &'a str, seq: SeqId, payload: &'a [u8]) -> Self {
        Self::new(FrameKind::Reply, method, seq, payload)
    }

    pub fn exception(method: &'a str, seq: SeqId, payload: &'a [u8]) -> Self {
        Self::new(FrameKind::Exception, method, seq, payload)
    }

    /// Number of bytes `encode` will append.
    pub fn encoded_len(&self) -> usize {
        FIXED_HEADER_LEN + self.method.len() + self.payload.len()
    }

    /// Appends this frame to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        check_method(self.method)?;
        let name = self.method.as_bytes();

        out.reserve(self.encoded_len());
        let word = VERSION_1 | u32::from(self.kind.as_code());
        out.extend_from_slice(&word.to_be_bytes());
        // bounded by MAX_METHOD_LEN above
        out.extend_from_slice(&(name.len() as i32).to_be_bytes());
        out.extend_from_slice(name);
        out.extend_from_slice(&self.seq.0.to_be_bytes());
        out.extend_from_slice(self.payload);
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode(&mut out)?;
        Ok(out)
    }
}

/// A decoded header, borrowing method name and payload from the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader<'a> {
    pub method: &'a str,
    pub kind: FrameKind,
    pub seq: SeqId,
    pub payload: &'a [u8],
}

impl<'a> FrameHeader<'a> {
    /// Decode a frame header, leaving the payload untouched.
    pub fn decode(bytes: &'a [u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);

        let kind = read_version_word(&mut reader)?;

        let len = reader.i32()?;
        if len < 0 || len as usize > MAX_METHOD_LEN {
            return Err(Error::InvalidMethodLength(len));
        }
        let name = reader.take(len as usize)?;
        let method = std::str::from_utf8(name).map_err(|_| Error::InvalidUtf8)?;

        let seq = SeqId(reader.i32()?);

        Ok(Self { method, kind, seq, payload: reader.rest() })
    }

    pub fn to_frame(&self) -> CallFrame {
        CallFrame {
            method: self.method.to_string(),
            kind: self.kind,
            seq: self.seq,
            payload: self.payload.to_vec(),
        }
    }
}

/// An owned, immutable frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallFrame {
    pub method: String,
    pub kind: FrameKind,
    pub seq: SeqId,
    pub payload: Vec<u8>,
}

impl CallFrame {
    pub fn encode(&self) -> Result<Vec<u8>> {
        FrameEncoder::new(self.kind, &self.method, self.seq, &self.payload).to_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        FrameHeader::decode(bytes).map(|header| header.to_frame())
    }
}

/// Checks that `method` fits in a frame header.
pub fn check_method(method: &str) -> Result<()> {
    match method.len() {
        len if len > MAX_METHOD_LEN => Err(Error::MethodTooLong(len)),
        _ => Ok(()),
    }
}

/// Encodes a CALL frame.
pub fn encode_call(method: &str, seq: SeqId, payload: &[u8]) -> Result<Vec<u8>> {
    FrameEncoder::call(method, seq, payload).to_bytes()
}

/// Encodes a REPLY frame answering `method`/`seq`.
pub fn encode_reply(method: &str, seq: SeqId, payload: &[u8]) -> Result<Vec<u8>> {
    FrameEncoder::reply(method, seq, payload).to_bytes()
}

/// Encodes an EXCEPTION frame answering `method`/`seq`.
pub fn encode_exception(method: &str, seq: SeqId, payload: &[u8]) -> Result<Vec<u8>> {
    FrameEncoder::exception(method, seq, payload).to_bytes()
}

/// Decodes the header of a raw frame.
pub fn decode_header(bytes: &[u8]) -> Result<FrameHeader<'_>> {
    FrameHeader::decode(bytes)
}

/// Reads just the kind and sequence id from a raw frame.
/// Useful for diagnostics when the method name itself is garbage.
pub fn peek_seq(bytes: &[u8]) -> Result<(FrameKind, SeqId)> {
    let mut reader = Reader::new(bytes);
    let kind = read_version_word(&mut reader)?;
    let len = reader.i32()?;
    if len < 0 || len as usize > MAX_METHOD_LEN {
        return Err(Error::InvalidMethodLength(len));
    }
    reader.take(len as usize)?;
    Ok((kind, SeqId(reader.i32()?)))
}

// Helpers

fn read_version_word(reader: &mut Reader<'_>) -> Result<FrameKind> {
    let word = reader.u32()?;
    if word & VERSION_MASK != VERSION_1 {
        return Err(Error::BadVersion(word));
    }
    FrameKind::from_code((word & KIND_MASK) as u8)
}

/// Bounds-checked forward cursor over the input.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let remaining = self.buf.len() - self.pos;
        if n > remaining {
            return Err(Error::UnexpectedEnd { needed: n, remaining });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn i32(&mut self) -> Result<i32> {
        self.u32().map(|v| v as i32)
    }

    fn rest(self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}
