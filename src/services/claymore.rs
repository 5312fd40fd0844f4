//! Claymore dual miner remote-management API (JSON-RPC over HTTP).

use super::{settle, Connection, Service, ServiceBase, ServiceKind};
use crate::config::Limits;
use crate::error::PipelineError;
use crate::event::EventSink;
use crate::metrics::{Metrics, Timer};
use crate::protocol::{HttpParser, HttpResponse, Request};
use crate::server::framer::{Framed, RequestFramer};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

type MethodFn = fn(&Map<String, Value>) -> Value;

const CONTENT_TYPE: &str = "application/json; charset=UTF-8";

const GETSTAT1: [&str; 9] = [
    "10.1 - ETH",
    "4286",
    "149336;7492;0",
    "30620;29877;28285;30605;29946",
    "0;0;0",
    "off;off;off;off;off",
    "62;65;51;64;61;75;51;67;62;72",
    "eth-eu1.nanopool.org:9999",
    "0;1;0;0",
];

/// Answers `miner_getstat1` with a believable rig and acknowledges the
/// management calls attackers use to take a rig over.
pub struct Claymore {
    base: ServiceBase,
    methods: HashMap<&'static str, MethodFn>,
}

impl Claymore {
    pub fn new(name: &str, limits: Limits) -> Self {
        let mut methods: HashMap<&'static str, MethodFn> = HashMap::new();
        methods.insert("miner_getstat1", getstat1);
        methods.insert("miner_reboot", acknowledge);
        methods.insert("miner_file", acknowledge);

        Self {
            base: ServiceBase::new(name, ServiceKind::Claymore, limits),
            methods,
        }
    }

    /// Reply body for a request body, or `None` when nothing should be said.
    fn respond(&self, body: Option<&Map<String, Value>>) -> Result<Option<Vec<u8>>, PipelineError> {
        let Some(request) = body else {
            return Ok(None);
        };
        let method = request.get("method").and_then(Value::as_str).unwrap_or_default();
        let Some(handler) = self.methods.get(method) else {
            warn!("Claymore method {:?} not supported", method);
            Metrics::get().record_unknown(self.base.category);
            return Ok(None);
        };

        let mut out = serde_json::to_vec(&handler(request))
            .map_err(|e| PipelineError::Encoding(e.to_string()))?;
        out.push(b'\n');
        Ok(Some(out))
    }

    async fn serve(&self, conn: Connection) -> Result<(), PipelineError> {
        let emitter = self.base.emitter(&conn);
        let limits = &self.base.limits;
        let mut framer = RequestFramer::new(conn.stream).with_read_timeout(limits.read_timeout());
        let mut parser = HttpParser::new(limits.max_header_size, limits.max_body_size);

        let Framed { item: req, raw } = framer.next(&mut parser).await?;
        let timer = Timer::new();

        let body: Option<Map<String, Value>> = serde_json::from_slice(&req.body).ok();
        if body.is_none() {
            debug!("Claymore request body is not a JSON object");
        }
        let field = |key: &str| body.as_ref().and_then(|b| b.get(key)).cloned().unwrap_or(Value::Null);
        let method = body
            .as_ref()
            .and_then(|b| b.get("method"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let event = emitter
            .event(Request::from(&req), raw)
            .with_kind(method)
            .with_field("claymore.id", field("id"))
            .with_field("claymore.method", field("method"))
            .with_field("claymore.jsonrpc", field("jsonrpc"));
        emitter.emit(event);

        let mut response = HttpResponse::ok(&req.version).with_header("Content-Type", CONTENT_TYPE);
        if let Some(out) = self.respond(body.as_ref())? {
            response = response.with_body(out);
        }
        framer.write_response(&response.to_bytes()?).await?;

        Metrics::get().record_request(self.base.category, timer.elapsed_seconds());
        Ok(())
    }
}

fn envelope(request: &Map<String, Value>, result: Value) -> Value {
    json!({
        "id": request.get("id").cloned().unwrap_or(Value::Null),
        "jsonrpc": request.get("jsonrpc").cloned().unwrap_or(Value::Null),
        "result": result,
    })
}

fn getstat1(request: &Map<String, Value>) -> Value {
    envelope(request, json!(GETSTAT1))
}

fn acknowledge(request: &Map<String, Value>) -> Value {
    envelope(request, Value::Bool(true))
}

#[async_trait]
impl Service for Claymore {
    fn name(&self) -> &str {
        &self.base.name
    }

    fn category(&self) -> &'static str {
        self.base.category
    }

    fn attach_sink(&mut self, sink: Arc<dyn EventSink>) {
        self.base.sink = sink;
    }

    async fn handle(&self, conn: Connection) -> Result<(), PipelineError> {
        settle(self.serve(conn).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::{exchange, spawn};

    fn post(body: &str) -> Vec<u8> {
        format!(
            "POST / HTTP/1.1\r\nHost: rig\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        )
        .into_bytes()
    }

    fn split(reply: &[u8]) -> (String, Value) {
        let text = String::from_utf8(reply.to_vec()).unwrap();
        let (head, body) = text.split_once("\r\n\r\n").unwrap();
        (head.to_string(), serde_json::from_str(body).unwrap())
    }

    #[tokio::test]
    async fn test_miner_reboot() {
        let (client, mut events, handle) = spawn(Claymore::new("claymore01", Limits::default()));
        let request = r#"{"id":0,"jsonrpc":"2.0","method":"miner_reboot"}"#;
        let reply = exchange(client, &post(request)).await;
        handle.await.unwrap().unwrap();

        let (head, body) = split(&reply);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Content-Type: application/json; charset=UTF-8"));
        assert_eq!(body, json!({"id": 0, "jsonrpc": "2.0", "result": true}));

        let event = events.recv().await.unwrap();
        assert_eq!(event.category, "claymore");
        assert_eq!(event.kind.as_deref(), Some("miner_reboot"));
        assert_eq!(event.field("claymore.jsonrpc"), Some(&json!("2.0")));
        assert_eq!(event.field("service.name"), Some(&json!("claymore01")));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_miner_getstat1() {
        let (client, _events, _handle) = spawn(Claymore::new("claymore01", Limits::default()));
        let reply = exchange(client, &post(r#"{"id":7,"jsonrpc":"2.0","method":"miner_getstat1"}"#)).await;

        let (_, body) = split(&reply);
        assert_eq!(body["id"], 7);
        assert_eq!(body["result"][0], "10.1 - ETH");
        assert_eq!(body["result"].as_array().unwrap().len(), 9);
    }

    #[tokio::test]
    async fn test_body_has_trailing_newline_and_exact_length() {
        let (client, _events, _handle) = spawn(Claymore::new("claymore01", Limits::default()));
        let reply = exchange(client, &post(r#"{"id":1,"jsonrpc":"2.0","method":"miner_file"}"#)).await;
        let text = String::from_utf8(reply).unwrap();
        let (head, body) = text.split_once("\r\n\r\n").unwrap();

        assert!(body.ends_with('\n'));
        assert!(head.contains(&format!("Content-Length: {}", body.len())));
    }

    #[tokio::test]
    async fn test_unknown_method_gets_empty_body() {
        let (client, mut events, _handle) = spawn(Claymore::new("claymore01", Limits::default()));
        let reply = exchange(client, &post(r#"{"id":1,"method":"miner_restart"}"#)).await;
        let text = String::from_utf8(reply).unwrap();

        assert!(text.contains("Content-Length: 0\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
        assert_eq!(events.recv().await.unwrap().kind.as_deref(), Some("miner_restart"));
    }

    #[tokio::test]
    async fn test_non_json_body_still_recorded() {
        let (client, mut events, handle) = spawn(Claymore::new("claymore01", Limits::default()));
        let reply = exchange(client, &post("not json")).await;
        handle.await.unwrap().unwrap();

        assert!(String::from_utf8(reply).unwrap().contains("Content-Length: 0\r\n"));
        let event = events.recv().await.unwrap();
        assert_eq!(event.field("claymore.method"), Some(&Value::Null));
        assert!(event.payload.ends_with(b"not json"));
    }

    #[tokio::test]
    async fn test_malformed_request_line_is_violation() {
        let (client, mut events, handle) = spawn(Claymore::new("claymore01", Limits::default()));
        let reply = exchange(client, b"\x16\x03\x01garbage\r\n\r\n").await;

        assert!(reply.is_empty());
        assert!(matches!(handle.await.unwrap(), Err(PipelineError::ProtocolViolation(_))));
        assert!(events.recv().await.is_none());
    }
}
