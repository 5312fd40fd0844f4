//! Telemetry events: one structured record per request an emulator reads.
//!
//! Events are built by a per-connection [`TelemetryEmitter`] and handed to an
//! [`EventSink`]. Sinks must never block the connection that submits to them.

use crate::metrics::Metrics;
use crate::protocol::{Request, WireFrame};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info};

/// A single captured interaction. Write-once: built, submitted, forgotten.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub category: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(rename = "source-addr")]
    pub source_addr: SocketAddr,
    #[serde(rename = "destination-addr")]
    pub destination_addr: SocketAddr,
    pub date: DateTime<Utc>,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
    #[serde(serialize_with = "serialize_payload")]
    pub payload: Bytes,
}

fn serialize_payload<S: Serializer>(payload: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(payload))
}

impl Event {
    pub fn new(category: impl Into<String>, source_addr: SocketAddr, destination_addr: SocketAddr) -> Self {
        Self {
            category: category.into(),
            kind: None,
            source_addr,
            destination_addr,
            date: Utc::now(),
            fields: BTreeMap::new(),
            payload: Bytes::new(),
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = payload;
        self
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Destination for captured events.
///
/// `submit` is synchronous and must return promptly; delivery, batching and
/// persistence are the sink's business.
pub trait EventSink: Send + Sync {
    fn submit(&self, event: Event);
}

/// Drops everything. Used until a real sink is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn submit(&self, _event: Event) {}
}

/// Renders each event as JSON through `tracing` under the `events` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn submit(&self, event: Event) {
        match event.to_json() {
            Ok(json) => info!(target: "events", "{}", json),
            Err(e) => debug!("Dropping unserializable event: {}", e),
        }
    }
}

/// Events held for the writer before new ones are dropped.
pub const DEFAULT_EVENT_QUEUE: usize = 1024;

/// Forwards events into a bounded channel. Submission never waits: when the
/// queue is full the event is dropped and counted.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Event>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::Receiver<Event>) {
        Self::with_capacity(DEFAULT_EVENT_QUEUE)
    }

    /// `capacity` must be non-zero.
    pub fn with_capacity(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn submit(&self, event: Event) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                debug!("Event queue full, dropping {} event", event.category);
                Metrics::get().record_event_dropped(&event.category);
            }
            Err(TrySendError::Closed(_)) => debug!("Event receiver gone, dropping event"),
        }
    }
}

/// Drains `rx` into `writer` as JSON lines until every sender is dropped.
pub async fn write_events<W>(mut rx: mpsc::Receiver<Event>, mut writer: W) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(event) = rx.recv().await {
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        writer.write_all(&line).await?;
        writer.flush().await?;
    }
    Ok(())
}

/// Builds and submits the events of one connection.
#[derive(Clone)]
pub struct TelemetryEmitter {
    category: &'static str,
    instance: Arc<str>,
    sink: Arc<dyn EventSink>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

impl TelemetryEmitter {
    pub fn new(
        category: &'static str,
        instance: Arc<str>,
        sink: Arc<dyn EventSink>,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Self {
        Self {
            category,
            instance,
            sink,
            local_addr,
            peer_addr,
        }
    }

    /// Base event for a request: addresses, raw bytes, and the fields every
    /// request of that protocol carries. Services add their own on top.
    pub fn event(&self, request: Request<'_>, raw: Bytes) -> Event {
        let event = Event::new(self.category, self.peer_addr, self.local_addr)
            .with_field("service.name", self.instance.as_ref())
            .with_payload(raw);

        match request {
            Request::Http(req) => {
                let mut event = event
                    .with_field("http.user-agent", req.user_agent())
                    .with_field("http.method", req.method.as_str())
                    .with_field("http.proto", req.version.as_str())
                    .with_field("http.host", req.host())
                    .with_field("http.url", req.target.as_str());
                for (name, values) in req.header_map() {
                    event = event.with_field(format!("http.header.{}", name), values);
                }
                event
            }
            Request::Resp(cmd) => {
                let args: Vec<String> = cmd
                    .args
                    .iter()
                    .map(|arg| match arg.as_str() {
                        Ok(s) => s.to_string(),
                        Err(_) => format!("{:?}", arg),
                    })
                    .collect();
                event
                    .with_kind(cmd.name.to_ascii_lowercase())
                    .with_field("redis.command", cmd.name.as_str())
                    .with_field("redis.args", args)
            }
            Request::Binary(frame) => wire_fields(event, frame),
        }
    }

    /// Hand the event to the sink. Never waits on delivery.
    pub fn emit(&self, event: Event) {
        Metrics::get().record_event(self.category);
        self.sink.submit(event);
    }
}

fn wire_fields(event: Event, frame: &WireFrame) -> Event {
    let op = frame.header.op();
    event
        .with_kind(op.name())
        .with_field("mongodb.opcode", frame.header.op_code)
        .with_field("mongodb.opcode-name", op.name())
        .with_field("mongodb.request-id", frame.header.request_id)
        .with_field("mongodb.length", frame.header.length)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{HttpParser, RespParser, WireFrameHeader};
    use crate::protocol::Decode;
    use serde_json::json;

    fn addrs() -> (SocketAddr, SocketAddr) {
        ("10.0.0.1:6379".parse().unwrap(), "203.0.113.7:50000".parse().unwrap())
    }

    fn emitter(sink: Arc<dyn EventSink>) -> TelemetryEmitter {
        let (local, peer) = addrs();
        TelemetryEmitter::new("test", Arc::from("test01"), sink, local, peer)
    }

    #[test]
    fn test_event_json_shape() {
        let (local, peer) = addrs();
        let event = Event::new("redis", peer, local)
            .with_kind("set")
            .with_field("redis.command", "SET")
            .with_payload(Bytes::from_static(b"hi"));

        let value: Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(value["category"], "redis");
        assert_eq!(value["type"], "set");
        assert_eq!(value["source-addr"], "203.0.113.7:50000");
        assert_eq!(value["destination-addr"], "10.0.0.1:6379");
        assert_eq!(value["redis.command"], "SET");
        assert_eq!(value["payload"], "aGk=");
        assert!(value["date"].is_string());
    }

    #[test]
    fn test_kind_omitted_when_absent() {
        let (local, peer) = addrs();
        let value: Value = serde_json::from_str(&Event::new("x", peer, local).to_json().unwrap()).unwrap();
        assert!(value.get("type").is_none());
    }

    #[tokio::test]
    async fn test_channel_sink_delivers() {
        let (sink, mut rx) = ChannelSink::new();
        let emitter = emitter(Arc::new(sink));
        let (local, peer) = addrs();
        emitter.emit(Event::new("test", peer, local));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.category, "test");
    }

    #[test]
    fn test_channel_sink_survives_closed_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        let (local, peer) = addrs();
        sink.submit(Event::new("test", peer, local));
    }

    #[test]
    fn test_channel_sink_drops_when_full() {
        let (sink, mut rx) = ChannelSink::with_capacity(2);
        let (local, peer) = addrs();
        for category in ["a", "b", "c"] {
            sink.submit(Event::new(category, peer, local));
        }

        assert_eq!(rx.try_recv().unwrap().category, "a");
        assert_eq!(rx.try_recv().unwrap().category, "b");
        assert!(rx.try_recv().is_err());

        sink.submit(Event::new("d", peer, local));
        assert_eq!(rx.try_recv().unwrap().category, "d");
    }

    #[test]
    fn test_http_request_fields() {
        let raw = b"GET /_all_dbs HTTP/1.1\r\nHost: db\r\nUser-Agent: zgrab\r\nAccept: */*\r\n\r\n";
        let (req, used) = HttpParser::default().decode(raw).unwrap().unwrap();
        let event = emitter(Arc::new(NullSink)).event(Request::from(&req), Bytes::copy_from_slice(&raw[..used]));

        assert_eq!(event.field("service.name"), Some(&json!("test01")));
        assert_eq!(event.field("http.method"), Some(&json!("GET")));
        assert_eq!(event.field("http.url"), Some(&json!("/_all_dbs")));
        assert_eq!(event.field("http.user-agent"), Some(&json!("zgrab")));
        assert_eq!(event.field("http.header.accept"), Some(&json!(["*/*"])));
        assert_eq!(&event.payload[..], &raw[..]);
    }

    #[test]
    fn test_resp_request_fields() {
        let raw = b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n:5\r\n";
        let (cmd, _) = RespParser::new().decode(raw).unwrap().unwrap();
        let event = emitter(Arc::new(NullSink)).event(Request::from(&cmd), Bytes::from_static(raw));

        assert_eq!(event.kind.as_deref(), Some("set"));
        assert_eq!(event.field("redis.command"), Some(&json!("SET")));
        assert_eq!(event.field("redis.args"), Some(&json!(["k", "Integer(5)"])));
    }

    #[test]
    fn test_wire_request_fields() {
        let frame = WireFrame {
            header: WireFrameHeader {
                length: 20,
                request_id: 3,
                response_to: 0,
                op_code: 2004,
            },
            payload: Bytes::from_static(b"\0\0\0\0"),
        };
        let event = emitter(Arc::new(NullSink)).event(Request::from(&frame), Bytes::new());
        assert_eq!(event.kind.as_deref(), Some("OP_QUERY"));
        assert_eq!(event.field("mongodb.request-id"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn test_write_events_as_json_lines() {
        let (sink, rx) = ChannelSink::new();
        let (local, peer) = addrs();
        sink.submit(Event::new("a", peer, local));
        sink.submit(Event::new("b", peer, local));
        drop(sink);

        let mut out = Vec::new();
        write_events(rx, &mut out).await.unwrap();

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["category"], "b");
    }
}
