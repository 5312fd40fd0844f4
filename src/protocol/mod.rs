//! Wire formats spoken by the emulated services: RESP (plus inline commands),
//! HTTP/1.x and length-prefixed binary frames.

pub mod detector;
pub mod http;
pub mod inline;
pub mod resp;
pub mod wire;

pub use detector::{detect_format, ProtocolFormat};
pub use http::{HttpParser, HttpRequest, HttpResponse};
pub use inline::InlineParser;
pub use resp::{RedisDatum, RespCommand, RespParser};
pub use wire::{OpCode, WireFrame, WireFrameHeader, WireParser};

use crate::error::PipelineError;

/// Recognises one complete item at the front of a receive buffer.
///
/// Implementations return the item together with the number of bytes it
/// spans, `Ok(None)` while it is still incomplete, and a
/// `ProtocolViolation` once the bytes can no longer become a valid item.
/// The caller owns consumption of the buffer.
pub trait Decode {
    type Item;

    fn decode(&mut self, buf: &[u8]) -> Result<Option<(Self::Item, usize)>, PipelineError>;
}

/// A borrowed view of a decoded request, tagged by the protocol it arrived
/// on. Requests are never modified after framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request<'a> {
    Http(&'a HttpRequest),
    Resp(&'a RespCommand),
    Binary(&'a WireFrame),
}

impl<'a> From<&'a HttpRequest> for Request<'a> {
    fn from(req: &'a HttpRequest) -> Self {
        Self::Http(req)
    }
}

impl<'a> From<&'a RespCommand> for Request<'a> {
    fn from(cmd: &'a RespCommand) -> Self {
        Self::Resp(cmd)
    }
}

impl<'a> From<&'a WireFrame> for Request<'a> {
    fn from(frame: &'a WireFrame) -> Self {
        Self::Binary(frame)
    }
}
