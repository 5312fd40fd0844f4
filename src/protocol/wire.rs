//! Length-prefixed binary wire frames (MongoDB message layout).
//!
//! Every frame starts with four little-endian `i32` fields: total length,
//! request id, response-to id and opcode. The payload is whatever follows,
//! up to the announced length.

use super::Decode;
use crate::error::PipelineError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const HEADER_LEN: usize = 16;
/// Largest frame a stock mongod accepts.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 48_000_000;

/// Known opcodes. Unknown values are kept as `Other` so they can still be
/// recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Reply,
    Update,
    Insert,
    Query,
    GetMore,
    Delete,
    KillCursors,
    Compressed,
    Msg,
    Other(i32),
}

impl OpCode {
    pub fn from_i32(code: i32) -> Self {
        match code {
            1 => Self::Reply,
            2001 => Self::Update,
            2002 => Self::Insert,
            2004 => Self::Query,
            2005 => Self::GetMore,
            2006 => Self::Delete,
            2007 => Self::KillCursors,
            2012 => Self::Compressed,
            2013 => Self::Msg,
            other => Self::Other(other),
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            Self::Reply => 1,
            Self::Update => 2001,
            Self::Insert => 2002,
            Self::Query => 2004,
            Self::GetMore => 2005,
            Self::Delete => 2006,
            Self::KillCursors => 2007,
            Self::Compressed => 2012,
            Self::Msg => 2013,
            Self::Other(code) => code,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Reply => "OP_REPLY",
            Self::Update => "OP_UPDATE",
            Self::Insert => "OP_INSERT",
            Self::Query => "OP_QUERY",
            Self::GetMore => "OP_GET_MORE",
            Self::Delete => "OP_DELETE",
            Self::KillCursors => "OP_KILL_CURSORS",
            Self::Compressed => "OP_COMPRESSED",
            Self::Msg => "OP_MSG",
            Self::Other(_) => "OP_UNKNOWN",
        }
    }
}

/// The fixed 16-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireFrameHeader {
    pub length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: i32,
}

impl WireFrameHeader {
    pub fn decode(mut buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        Some(Self {
            length: buf.get_i32_le(),
            request_id: buf.get_i32_le(),
            response_to: buf.get_i32_le(),
            op_code: buf.get_i32_le(),
        })
    }

    pub fn encode(&self, out: &mut BytesMut) {
        out.put_i32_le(self.length);
        out.put_i32_le(self.request_id);
        out.put_i32_le(self.response_to);
        out.put_i32_le(self.op_code);
    }

    pub fn op(&self) -> OpCode {
        OpCode::from_i32(self.op_code)
    }

    /// Payload size implied by the length field.
    pub fn payload_len(&self) -> usize {
        (self.length as usize).saturating_sub(HEADER_LEN)
    }
}

/// A complete frame. `payload.len() == header.length - HEADER_LEN` always holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    pub header: WireFrameHeader,
    pub payload: Bytes,
}

impl WireFrame {
    /// Builds a reply to `request`: `responseTo` mirrors the request id and
    /// the length is recomputed from the payload actually sent.
    pub fn reply_to(
        request: &WireFrameHeader,
        request_id: i32,
        op: OpCode,
        payload: Bytes,
    ) -> Result<Self, PipelineError> {
        let length = i32::try_from(HEADER_LEN + payload.len())
            .map_err(|_| PipelineError::Encoding("reply frame exceeds i32 length".to_string()))?;
        Ok(Self {
            header: WireFrameHeader {
                length,
                request_id,
                response_to: request.request_id,
                op_code: op.as_i32(),
            },
            payload,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, PipelineError> {
        if self.header.payload_len() != self.payload.len()
            || (self.header.length as usize) < HEADER_LEN
        {
            return Err(PipelineError::Encoding(format!(
                "frame length {} does not match payload of {} bytes",
                self.header.length,
                self.payload.len()
            )));
        }
        let mut out = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        self.header.encode(&mut out);
        out.extend_from_slice(&self.payload);
        Ok(out.to_vec())
    }

    /// Leading NUL-terminated string of the payload, skipping `offset` bytes.
    /// Used to pull the collection name out of legacy queries.
    pub fn cstring_at(&self, offset: usize) -> Option<String> {
        let rest = self.payload.get(offset..)?;
        let end = rest.iter().position(|&b| b == 0)?;
        Some(String::from_utf8_lossy(&rest[..end]).into_owned())
    }
}

/// Decoder for length-prefixed frames. The length field is validated
/// against the header size and `max_frame_size` before any payload is
/// awaited.
#[derive(Debug, Clone)]
pub struct WireParser {
    max_frame_size: usize,
}

impl Default for WireParser {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl WireParser {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn parse(&self, buffer: &[u8]) -> Result<Option<(WireFrame, usize)>, PipelineError> {
        let Some(header) = WireFrameHeader::decode(buffer) else {
            return Ok(None);
        };

        if header.length < HEADER_LEN as i32 {
            return Err(PipelineError::violation(format!(
                "frame length {} shorter than header",
                header.length
            )));
        }
        if header.length as usize > self.max_frame_size {
            return Err(PipelineError::violation(format!(
                "frame length {} exceeds maximum {}",
                header.length, self.max_frame_size
            )));
        }

        let total = header.length as usize;
        if buffer.len() < total {
            return Ok(None);
        }

        let frame = WireFrame {
            header,
            payload: Bytes::copy_from_slice(&buffer[HEADER_LEN..total]),
        };
        Ok(Some((frame, total)))
    }
}

impl Decode for WireParser {
    type Item = WireFrame;

    fn decode(&mut self, buf: &[u8]) -> Result<Option<(WireFrame, usize)>, PipelineError> {
        self.parse(buf)
    }
}
