use super::{detect_format, Decode, InlineParser, ProtocolFormat};
use crate::error::{DatumError, PipelineError};
use bytes::Bytes;

/// Largest bulk string accepted from a client (same as Redis' proto-max-bulk-len).
pub const DEFAULT_MAX_BULK_LEN: usize = 512 * 1024 * 1024;
/// Largest request, inline or RESP, that may sit in the receive buffer.
pub const DEFAULT_MAX_BUFFER_LEN: usize = 64 * 1024;

const MAX_ARRAY_LEN: usize = 1024 * 1024;
const MAX_DEPTH: usize = 32;

/// A decoded or to-be-encoded RESP2 value.
///
/// Command handlers never match on variants directly to pull arguments out;
/// they go through [`RedisDatum::as_str`] and [`RedisDatum::as_int`], which
/// report a [`DatumError`] instead of assuming a shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedisDatum {
    SimpleString(String), // +
    Error(String),        // -
    Integer(i64),         // :
    BulkString(Bytes),    // $
    Array(Vec<RedisDatum>), // *
    Nil,                  // $-1 / *-1
}

impl RedisDatum {
    pub fn ok() -> Self {
        Self::SimpleString("OK".to_string())
    }

    pub fn simple(s: impl Into<String>) -> Self {
        Self::SimpleString(s.into())
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self::Error(msg.into())
    }

    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Self::BulkString(data.into())
    }

    pub fn empty_array() -> Self {
        Self::Array(Vec::new())
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::SimpleString(_) | Self::BulkString(_) => "string",
            Self::Error(_) => "error",
            Self::Integer(_) => "integer",
            Self::Array(_) => "array",
            Self::Nil => "nil",
        }
    }

    /// Borrow the value as UTF-8 text.
    pub fn as_str(&self) -> Result<&str, DatumError> {
        match self {
            Self::SimpleString(s) => Ok(s),
            Self::BulkString(b) => std::str::from_utf8(b).map_err(|_| DatumError::InvalidUtf8),
            other => Err(DatumError::UnexpectedType {
                expected: "string",
                found: other.type_name(),
            }),
        }
    }

    /// Read the value as an integer. Bulk strings holding a decimal number
    /// qualify, as they do for a real server.
    pub fn as_int(&self) -> Result<i64, DatumError> {
        match self {
            Self::Integer(i) => Ok(*i),
            Self::SimpleString(_) | Self::BulkString(_) => self
                .as_str()?
                .parse::<i64>()
                .map_err(|_| DatumError::NotAnInteger),
            other => Err(DatumError::UnexpectedType {
                expected: "integer",
                found: other.type_name(),
            }),
        }
    }

    /// Serialize this value to Redis wire format.
    pub fn to_bytes(&self) -> Result<Vec<u8>, PipelineError> {
        let mut out = Vec::new();
        self.encode(&mut out)?;
        Ok(out)
    }

    /// Append the wire form to `out`. Simple strings and errors are single
    /// lines, so a CR or LF inside them cannot be represented.
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), PipelineError> {
        match self {
            Self::SimpleString(s) => encode_line(out, b'+', s)?,
            Self::Error(e) => encode_line(out, b'-', e)?,
            Self::Integer(i) => out.extend_from_slice(format!(":{}\r\n", i).as_bytes()),
            Self::BulkString(b) => {
                out.extend_from_slice(format!("${}\r\n", b.len()).as_bytes());
                out.extend_from_slice(b);
                out.extend_from_slice(b"\r\n");
            }
            Self::Array(items) => {
                out.extend_from_slice(format!("*{}\r\n", items.len()).as_bytes());
                for item in items {
                    item.encode(out)?;
                }
            }
            Self::Nil => out.extend_from_slice(b"$-1\r\n"),
        }
        Ok(())
    }
}

fn encode_line(out: &mut Vec<u8>, prefix: u8, line: &str) -> Result<(), PipelineError> {
    if line.bytes().any(|b| b == b'\r' || b == b'\n') {
        return Err(PipelineError::Encoding(format!(
            "line reply contains CR or LF: {:?}",
            line
        )));
    }
    out.push(prefix);
    out.extend_from_slice(line.as_bytes());
    out.extend_from_slice(b"\r\n");
    Ok(())
}

/// One client command: the name plus its ordered arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RespCommand {
    pub name: String,
    pub args: Vec<RedisDatum>,
}

impl RespCommand {
    /// Turn a decoded top-level value into a command. Anything other than a
    /// non-empty array led by a string is a framing violation.
    pub fn from_datum(value: RedisDatum) -> Result<Self, PipelineError> {
        let mut parts = match value {
            RedisDatum::Array(parts) if !parts.is_empty() => parts,
            other => {
                return Err(PipelineError::violation(format!(
                    "expected command array, got {}",
                    other.type_name()
                )))
            }
        };

        let args = parts.split_off(1);
        let name = parts[0]
            .as_str()
            .map_err(|e| PipelineError::violation(format!("invalid command name: {}", e)))?
            .to_string();

        Ok(Self { name, args })
    }
}

/// Incremental RESP decoder.
///
/// Nothing is consumed from the buffer until a whole value is available, so
/// a partial frame simply waits for more bytes.
#[derive(Debug, Clone)]
pub struct RespParser {
    max_bulk_len: usize,
    max_buffer_len: usize,
}

impl Default for RespParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RespParser {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_BULK_LEN, DEFAULT_MAX_BUFFER_LEN)
    }

    /// `max_buffer_len` bounds a whole pending request, so a frame that
    /// announces more than that is refused before its payload arrives.
    pub fn with_limits(max_bulk_len: usize, max_buffer_len: usize) -> Self {
        Self {
            max_bulk_len,
            max_buffer_len,
        }
    }

    /// Parse the next complete value from the front of `buf`. Returns the
    /// value and the number of bytes it spans, or None if incomplete.
    /// Auto-detects inline (telnet) vs RESP format.
    pub fn parse(&self, buf: &[u8]) -> Result<Option<(RedisDatum, usize)>, PipelineError> {
        let mut start = 0;
        loop {
            let rest = &buf[start..];
            match detect_format(rest) {
                None => return Ok(None),
                Some(ProtocolFormat::Inline) => {
                    let Some(len) = InlineParser::line_len(rest) else {
                        if rest.len() > self.max_buffer_len {
                            return Err(PipelineError::violation("inline command too long"));
                        }
                        return Ok(None);
                    };
                    match InlineParser::parse(&rest[..len])? {
                        Some(value) => return Ok(Some((value, start + len))),
                        // Blank line, keep going with whatever follows it.
                        None => start += len,
                    }
                }
                Some(ProtocolFormat::Resp) => {
                    let mut pos = start;
                    let value = self.parse_value(buf, &mut pos, 0)?;
                    let end = if value.is_some() { pos } else { buf.len() };
                    if end - start > self.max_buffer_len {
                        return Err(PipelineError::violation("RESP request too large"));
                    }
                    return Ok(value.map(|value| (value, pos)));
                }
            }
        }
    }

    fn parse_value(
        &self,
        buf: &[u8],
        pos: &mut usize,
        depth: usize,
    ) -> Result<Option<RedisDatum>, PipelineError> {
        if depth > MAX_DEPTH {
            return Err(PipelineError::violation("RESP nesting too deep"));
        }
        let Some(&type_byte) = buf.get(*pos) else {
            return Ok(None);
        };
        *pos += 1;

        tracing::trace!("Parsing RESP type {:?} at offset {}", type_byte as char, *pos - 1);

        match type_byte {
            b'+' => Ok(self.read_line(buf, pos)?.map(RedisDatum::SimpleString)),
            b'-' => Ok(self.read_line(buf, pos)?.map(RedisDatum::Error)),
            b':' => match self.read_line(buf, pos)? {
                Some(line) => line
                    .parse::<i64>()
                    .map(|i| Some(RedisDatum::Integer(i)))
                    .map_err(|_| PipelineError::violation("invalid integer")),
                None => Ok(None),
            },
            b'$' => self.parse_bulk_string(buf, pos),
            b'*' => self.parse_array(buf, pos, depth),
            other => Err(PipelineError::violation(format!(
                "invalid RESP type byte: {:?}",
                other as char
            ))),
        }
    }

    fn parse_bulk_string(
        &self,
        buf: &[u8],
        pos: &mut usize,
    ) -> Result<Option<RedisDatum>, PipelineError> {
        let Some(len) = self.read_length(buf, pos, "bulk string")? else {
            return Ok(None);
        };
        let Some(len) = len else {
            return Ok(Some(RedisDatum::Nil));
        };
        if len > self.max_bulk_len || len > self.max_buffer_len {
            return Err(PipelineError::violation("bulk string too long"));
        }

        let end = *pos + len;
        if buf.len() < end + 2 {
            return Ok(None);
        }
        if &buf[end..end + 2] != b"\r\n" {
            return Err(PipelineError::violation("bulk string not terminated by CRLF"));
        }

        let data = Bytes::copy_from_slice(&buf[*pos..end]);
        *pos = end + 2;
        Ok(Some(RedisDatum::BulkString(data)))
    }

    fn parse_array(
        &self,
        buf: &[u8],
        pos: &mut usize,
        depth: usize,
    ) -> Result<Option<RedisDatum>, PipelineError> {
        let Some(len) = self.read_length(buf, pos, "array")? else {
            return Ok(None);
        };
        let Some(len) = len else {
            return Ok(Some(RedisDatum::Nil));
        };
        if len > MAX_ARRAY_LEN {
            return Err(PipelineError::violation("array too long"));
        }

        let mut elements = Vec::with_capacity(len.min(64));
        for _ in 0..len {
            match self.parse_value(buf, pos, depth + 1)? {
                Some(element) => elements.push(element),
                None => return Ok(None),
            }
        }
        Ok(Some(RedisDatum::Array(elements)))
    }

    /// Reads a length header. `Some(None)` is the `-1` null marker.
    fn read_length(
        &self,
        buf: &[u8],
        pos: &mut usize,
        what: &str,
    ) -> Result<Option<Option<usize>>, PipelineError> {
        let Some(line) = self.read_line(buf, pos)? else {
            return Ok(None);
        };
        let len = line
            .parse::<i64>()
            .map_err(|_| PipelineError::violation(format!("invalid {} length", what)))?;

        match len {
            -1 => Ok(Some(None)),
            n if n < 0 => Err(PipelineError::violation(format!("invalid {} length", what))),
            n => Ok(Some(Some(n as usize))),
        }
    }

    fn read_line(&self, buf: &[u8], pos: &mut usize) -> Result<Option<String>, PipelineError> {
        let rest = &buf[*pos..];
        match rest.windows(2).position(|w| w == b"\r\n") {
            Some(end) => {
                let line = std::str::from_utf8(&rest[..end])
                    .map_err(|_| PipelineError::violation("invalid UTF-8 in RESP line"))?
                    .to_string();
                *pos += end + 2;
                Ok(Some(line))
            }
            None if rest.len() > self.max_buffer_len => {
                Err(PipelineError::violation("RESP line too long"))
            }
            None => Ok(None),
        }
    }
}

impl Decode for RespParser {
    type Item = RespCommand;

    fn decode(&mut self, buf: &[u8]) -> Result<Option<(RespCommand, usize)>, PipelineError> {
        match self.parse(buf)? {
            Some((value, used)) => Ok(Some((RespCommand::from_datum(value)?, used))),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(data: &[u8]) -> Result<Option<RedisDatum>, PipelineError> {
        Ok(RespParser::new().parse(data)?.map(|(value, _)| value))
    }

    #[test]
    fn test_simple_string_serialization() {
        assert_eq!(RedisDatum::ok().to_bytes().unwrap(), b"+OK\r\n");
    }

    #[test]
    fn test_error_serialization() {
        let value = RedisDatum::error("ERR syntax error");
        assert_eq!(value.to_bytes().unwrap(), b"-ERR syntax error\r\n");
    }

    #[test]
    fn test_bulk_and_nil_serialization() {
        assert_eq!(RedisDatum::bulk("hello").to_bytes().unwrap(), b"$5\r\nhello\r\n");
        assert_eq!(RedisDatum::bulk("").to_bytes().unwrap(), b"$0\r\n\r\n");
        assert_eq!(RedisDatum::Nil.to_bytes().unwrap(), b"$-1\r\n");
    }

    #[test]
    fn test_nested_array_serialization() {
        let value = RedisDatum::Array(vec![
            RedisDatum::ok(),
            RedisDatum::Integer(42),
            RedisDatum::Array(vec![RedisDatum::bulk("a")]),
        ]);
        assert_eq!(
            value.to_bytes().unwrap(),
            b"*3\r\n+OK\r\n:42\r\n*1\r\n$1\r\na\r\n"
        );
        assert_eq!(RedisDatum::empty_array().to_bytes().unwrap(), b"*0\r\n");
    }

    #[test]
    fn test_line_reply_with_newline_is_unencodable() {
        let err = RedisDatum::simple("bad\r\nline").to_bytes().unwrap_err();
        assert!(matches!(err, PipelineError::Encoding(_)));

        let nested = RedisDatum::Array(vec![RedisDatum::error("x\ny")]);
        assert!(nested.to_bytes().is_err());
    }

    #[test]
    fn test_command_array_parsing() {
        let data = b"*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$5\r\nvalue\r\n";
        let (value, used) = RespParser::new().parse(data).unwrap().unwrap();
        assert_eq!(used, data.len());

        let cmd = RespCommand::from_datum(value).unwrap();
        assert_eq!(cmd.name, "SET");
        assert_eq!(cmd.args, vec![RedisDatum::bulk("key"), RedisDatum::bulk("value")]);
    }

    #[test]
    fn test_binary_bulk_string() {
        let value = parse_all(b"$4\r\n\x00\xff\r\n\r\n").unwrap().unwrap();
        assert_eq!(value, RedisDatum::bulk(&b"\x00\xff\r\n"[..]));
        assert_eq!(value.as_str(), Err(DatumError::InvalidUtf8));
    }

    #[test]
    fn test_null_values() {
        assert_eq!(parse_all(b"$-1\r\n").unwrap(), Some(RedisDatum::Nil));
        assert_eq!(parse_all(b"*-1\r\n").unwrap(), Some(RedisDatum::Nil));
    }

    #[test]
    fn test_incomplete_data() {
        let parser = RespParser::new();
        assert!(parser.parse(b"*2\r\n$4\r\nPING\r\n$3\r\nab").unwrap().is_none());
        assert!(parser.parse(b"*2\r\n$4\r\nPING").unwrap().is_none());
        assert!(parser.parse(b"+OK").unwrap().is_none());

        let (_, used) = parser.parse(b"*2\r\n$4\r\nPING\r\n$3\r\nabc\r\n").unwrap().unwrap();
        assert_eq!(used, 23);
    }

    #[test]
    fn test_invalid_lengths() {
        assert!(parse_all(b"$-5\r\n").is_err());
        assert!(parse_all(b"*abc\r\n").is_err());
        assert!(parse_all(b"$3\r\nabcXY").is_err());
    }

    #[test]
    fn test_bulk_limit() {
        assert!(RespParser::with_limits(4, 64).parse(b"$10\r\n").is_err());
    }

    #[test]
    fn test_inline_limit() {
        assert!(RespParser::with_limits(4, 8).parse(b"AAAAAAAAAAAA").is_err());
        assert!(RespParser::with_limits(4, 8).parse(b"AAAA").unwrap().is_none());
    }

    #[test]
    fn test_pending_request_capped() {
        let parser = RespParser::with_limits(DEFAULT_MAX_BULK_LEN, 64 * 1024);

        // Announced bulk larger than the buffer cap is refused up front.
        assert!(parser.parse(b"*1\r\n$100000000\r\n").is_err());

        // Many small bulks that together overflow the cap.
        let mut data = b"*100000\r\n".to_vec();
        while data.len() <= 64 * 1024 {
            data.extend_from_slice(b"$4\r\nAAAA\r\n");
        }
        assert!(parser.parse(&data).is_err());

        let mut big = b"*1\r\n$100000000\r\n".to_vec();
        big.resize(big.len() + 4 * 1024 * 1024, b'A');
        assert!(parser.parse(&big).is_err());
    }

    #[test]
    fn test_values_back_to_back() {
        let parser = RespParser::new();
        let data = b"+OK\r\n:42\r\n";
        let (first, used) = parser.parse(data).unwrap().unwrap();
        assert_eq!(first, RedisDatum::ok());
        let (second, _) = parser.parse(&data[used..]).unwrap().unwrap();
        assert_eq!(second, RedisDatum::Integer(42));
    }

    #[test]
    fn test_inline_command_integration() {
        let value = parse_all(b"PING\r\n").unwrap().unwrap();
        assert_eq!(value, RedisDatum::Array(vec![RedisDatum::bulk("PING")]));
    }

    #[test]
    fn test_blank_inline_lines_are_skipped() {
        let data = b"\r\n\r\nINFO server\r\n";
        let (value, used) = RespParser::new().parse(data).unwrap().unwrap();
        assert_eq!(
            value,
            RedisDatum::Array(vec![RedisDatum::bulk("INFO"), RedisDatum::bulk("server")])
        );
        assert_eq!(used, data.len());
    }

    #[test]
    fn test_inline_and_resp_agree() {
        let inline = parse_all(b"PING\r\n").unwrap();
        let resp = parse_all(b"*1\r\n$4\r\nPING\r\n").unwrap();
        assert_eq!(inline, resp);
    }

    #[test]
    fn test_accessors() {
        assert_eq!(RedisDatum::bulk("12").as_int(), Ok(12));
        assert_eq!(RedisDatum::Integer(7).as_int(), Ok(7));
        assert_eq!(RedisDatum::bulk("x").as_int(), Err(DatumError::NotAnInteger));
        assert_eq!(
            RedisDatum::Integer(7).as_str(),
            Err(DatumError::UnexpectedType {
                expected: "string",
                found: "integer"
            })
        );
        assert_eq!(
            RedisDatum::Nil.as_int(),
            Err(DatumError::UnexpectedType {
                expected: "integer",
                found: "nil"
            })
        );
    }

    #[test]
    fn test_command_from_non_array() {
        assert!(RespCommand::from_datum(RedisDatum::ok()).is_err());
        assert!(RespCommand::from_datum(RedisDatum::empty_array()).is_err());
        assert!(RespCommand::from_datum(RedisDatum::Array(vec![RedisDatum::Integer(1)])).is_err());
    }

    #[test]
    fn test_decode_yields_command() {
        let data = b"*2\r\n$4\r\nINFO\r\n:3\r\n";
        let (cmd, used) = RespParser::new().decode(data).unwrap().unwrap();
        assert_eq!(cmd.name, "INFO");
        assert_eq!(cmd.args, vec![RedisDatum::Integer(3)]);
        assert_eq!(used, data.len());
    }
}
