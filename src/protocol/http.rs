//! HTTP/1.x request framing and response serialization.
//!
//! Enough of the protocol to read one request (fixed-length or chunked body)
//! off a socket and write back a response that looks like it came from the
//! server being imitated.

use super::Decode;
use crate::error::PipelineError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

pub const DEFAULT_MAX_HEADER_SIZE: usize = 64 * 1024;
pub const DEFAULT_MAX_BODY_SIZE: usize = 1024 * 1024;
const MAX_HEADERS: usize = 100;

/// A fully-read HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    /// Request target exactly as sent, query string included.
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpRequest {
    /// Target without the query string.
    pub fn path(&self) -> &str {
        self.target
            .split_once('?')
            .map_or(self.target.as_str(), |(path, _)| path)
    }

    /// First value of a header, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn user_agent(&self) -> &str {
        self.header("user-agent").unwrap_or_default()
    }

    pub fn host(&self) -> &str {
        self.header("host").unwrap_or_default()
    }

    /// Headers grouped by lowercase name, values in arrival order.
    pub fn header_map(&self) -> BTreeMap<String, Vec<String>> {
        let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in &self.headers {
            map.entry(name.to_ascii_lowercase())
                .or_default()
                .push(value.clone());
        }
        map
    }
}

/// Incremental request decoder with size limits on the head and the body.
///
/// The request line and headers go through `httparse`; only the body framing
/// and the limits are handled here.
#[derive(Debug, Clone)]
pub struct HttpParser {
    max_header_size: usize,
    max_body_size: usize,
}

impl Default for HttpParser {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HEADER_SIZE, DEFAULT_MAX_BODY_SIZE)
    }
}

impl HttpParser {
    pub fn new(max_header_size: usize, max_body_size: usize) -> Self {
        Self {
            max_header_size,
            max_body_size,
        }
    }

    /// Parse one request from the front of `buffer`. Returns the request and
    /// the bytes it spans, or None until the whole request (head and body)
    /// is buffered.
    pub fn parse(&self, buffer: &[u8]) -> Result<Option<(HttpRequest, usize)>, PipelineError> {
        let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut head = httparse::Request::new(&mut slots);

        let body_start = match head.parse(buffer) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => {
                if buffer.len() > self.max_header_size {
                    return Err(PipelineError::violation("request head too large"));
                }
                return Ok(None);
            }
            Err(e) => {
                return Err(PipelineError::violation(format!("malformed request head: {}", e)))
            }
        };
        if body_start > self.max_header_size {
            return Err(PipelineError::violation("request head too large"));
        }

        let method = head.method.unwrap_or_default().to_string();
        let target = head.path.unwrap_or_default().to_string();
        let version = format!("HTTP/1.{}", head.version.unwrap_or(1));
        let headers: Vec<(String, String)> = head
            .headers
            .iter()
            .map(|h| {
                (
                    h.name.to_string(),
                    String::from_utf8_lossy(h.value).trim().to_string(),
                )
            })
            .collect();

        let chunked = headers.iter().any(|(n, v)| {
            n.eq_ignore_ascii_case("transfer-encoding") && v.to_ascii_lowercase().contains("chunked")
        });

        let (body, consumed) = if chunked {
            match self.parse_chunked(&buffer[body_start..])? {
                Some((body, used)) => (body, body_start + used),
                None => return Ok(None),
            }
        } else {
            let len = content_length(&headers)?;
            if len > self.max_body_size {
                return Err(PipelineError::violation("request body too large"));
            }
            if buffer.len() < body_start + len {
                return Ok(None);
            }
            (
                Bytes::copy_from_slice(&buffer[body_start..body_start + len]),
                body_start + len,
            )
        };

        let request = HttpRequest {
            method,
            target,
            version,
            headers,
            body,
        };
        Ok(Some((request, consumed)))
    }

    /// Decodes a chunked body. Returns the body and the bytes used.
    fn parse_chunked(&self, buf: &[u8]) -> Result<Option<(Bytes, usize)>, PipelineError> {
        let mut body = Vec::new();
        let mut pos = 0;

        loop {
            let (line_len, size) = match httparse::parse_chunk_size(&buf[pos..]) {
                Ok(httparse::Status::Complete(parsed)) => parsed,
                Ok(httparse::Status::Partial) => return Ok(None),
                Err(_) => return Err(PipelineError::violation("invalid chunk size")),
            };
            pos += line_len;

            if size == 0 {
                let mut trailers = [httparse::EMPTY_HEADER; MAX_HEADERS];
                return match httparse::parse_headers(&buf[pos..], &mut trailers) {
                    Ok(httparse::Status::Complete((used, _))) => Ok(Some((Bytes::from(body), pos + used))),
                    Ok(httparse::Status::Partial) => Ok(None),
                    Err(e) => Err(PipelineError::violation(format!("malformed chunk trailer: {}", e))),
                };
            }

            let size = usize::try_from(size)
                .ok()
                .filter(|&size| size <= self.max_body_size - body.len())
                .ok_or_else(|| PipelineError::violation("request body too large"))?;
            if buf.len() < pos + size + 2 {
                return Ok(None);
            }
            body.extend_from_slice(&buf[pos..pos + size]);
            pos += size;
            match &buf[pos..pos + 2] {
                b"\r\n" => pos += 2,
                [b'\n', _] => pos += 1,
                _ => return Err(PipelineError::violation("chunk not terminated by CRLF")),
            }
        }
    }
}

impl Decode for HttpParser {
    type Item = HttpRequest;

    fn decode(&mut self, buf: &[u8]) -> Result<Option<(HttpRequest, usize)>, PipelineError> {
        self.parse(buf)
    }
}

fn content_length(headers: &[(String, String)]) -> Result<usize, PipelineError> {
    let mut length = None;
    for (_, value) in headers.iter().filter(|(n, _)| n.eq_ignore_ascii_case("content-length")) {
        let parsed = value
            .parse::<usize>()
            .map_err(|_| PipelineError::violation(format!("invalid Content-Length: {:?}", value)))?;
        if length.is_some_and(|prev| prev != parsed) {
            return Err(PipelineError::violation("conflicting Content-Length headers"));
        }
        length = Some(parsed);
    }
    Ok(length.unwrap_or(0))
}

/// Formats a timestamp the way HTTP `Date` headers expect (RFC 1123).
pub fn http_date(now: DateTime<Utc>) -> String {
    now.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// An HTTP response. `Content-Length` is always derived from the body when
/// serializing, so it cannot disagree with what is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// A `200 OK` answering a request made with `version`.
    pub fn ok(version: &str) -> Self {
        Self {
            version: version.to_string(),
            status: 200,
            reason: "OK".to_string(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Serialize as status line, `Content-Length`, remaining headers sorted by
    /// name, blank line, body.
    pub fn to_bytes(&self) -> Result<Vec<u8>, PipelineError> {
        let mut headers: Vec<&(String, String)> = self
            .headers
            .iter()
            .filter(|(n, _)| !n.eq_ignore_ascii_case("content-length"))
            .collect();
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let mut out = Vec::with_capacity(128 + self.body.len());
        out.extend_from_slice(
            format!("{} {} {}\r\n", self.version, self.status, self.reason).as_bytes(),
        );
        out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        for (name, value) in headers {
            if [name, value].iter().any(|s| s.contains(['\r', '\n'])) {
                return Err(PipelineError::Encoding(format!(
                    "header {:?} contains CR or LF",
                    name
                )));
            }
            out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        Ok(out)
    }
}
