//! MongoDB wire protocol listener.
//!
//! Only the framing is emulated. Legacy queries and cursor fetches get an
//! empty `OP_REPLY`; everything else is recorded and left unanswered.

use super::{settle, Connection, Service, ServiceBase, ServiceKind};
use crate::config::Limits;
use crate::error::PipelineError;
use crate::event::EventSink;
use crate::metrics::{Metrics, Timer};
use crate::protocol::{OpCode, Request, WireFrame, WireParser};
use crate::server::framer::{Framed, RequestFramer};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, warn};

/// responseFlags, cursorID, startingFrom, numberReturned: all zero.
const EMPTY_REPLY: [u8; 20] = [0; 20];

/// Offset of the collection name in OP_QUERY and OP_GET_MORE bodies.
const COLLECTION_OFFSET: usize = 4;

pub struct MongoDb {
    base: ServiceBase,
}

impl MongoDb {
    pub fn new(name: &str, limits: Limits) -> Self {
        Self {
            base: ServiceBase::new(name, ServiceKind::Mongodb, limits),
        }
    }

    /// Reply to `frame`, if its opcode gets one.
    fn reply(frame: &WireFrame, request_id: i32) -> Result<Option<WireFrame>, PipelineError> {
        match frame.header.op() {
            OpCode::Query | OpCode::GetMore => WireFrame::reply_to(
                &frame.header,
                request_id,
                OpCode::Reply,
                Bytes::from_static(&EMPTY_REPLY),
            )
            .map(Some),
            _ => Ok(None),
        }
    }

    async fn serve(&self, conn: Connection) -> Result<(), PipelineError> {
        let emitter = self.base.emitter(&conn);
        let limits = &self.base.limits;
        let mut framer = RequestFramer::new(conn.stream).with_read_timeout(limits.read_timeout());
        let mut parser = WireParser::new(limits.max_frame_size);
        // Reply ids are local to the connection.
        let mut next_id: i32 = 1;

        loop {
            let Framed { item: frame, raw } = framer.next(&mut parser).await?;
            let timer = Timer::new();
            let op = frame.header.op();

            let mut event = emitter.event(Request::from(&frame), raw);
            if matches!(op, OpCode::Query | OpCode::GetMore) {
                if let Some(collection) = frame.cstring_at(COLLECTION_OFFSET) {
                    event = event.with_field("mongodb.collection", collection);
                }
            }
            emitter.emit(event);

            match Self::reply(&frame, next_id)? {
                Some(reply) => {
                    debug!("Answering {} {} with empty reply", op.name(), frame.header.request_id);
                    framer.write_response(&reply.to_bytes()?).await?;
                    next_id = next_id.wrapping_add(1);
                }
                None => {
                    warn!("MongoDB opcode {} ({}) not supported", frame.header.op_code, op.name());
                    Metrics::get().record_unknown(self.base.category);
                }
            }

            Metrics::get().record_request(self.base.category, timer.elapsed_seconds());
        }
    }
}

#[async_trait]
impl Service for MongoDb {
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
    use crate::protocol::wire::HEADER_LEN;
    use crate::protocol::WireFrameHeader;
    use crate::services::testing::{exchange, spawn};
    use bytes::BytesMut;
    use serde_json::json;

    fn frame(request_id: i32, op_code: i32, payload: &[u8]) -> Vec<u8> {
        let mut out = BytesMut::new();
        WireFrameHeader {
            length: (HEADER_LEN + payload.len()) as i32,
            request_id,
            response_to: 0,
            op_code,
        }
        .encode(&mut out);
        out.extend_from_slice(payload);
        out.to_vec()
    }

    fn query(request_id: i32) -> Vec<u8> {
        frame(request_id, 2004, b"\0\0\0\0admin.$cmd\0\0\0\0\0\xff\xff\xff\xff\x05\0\0\0\0")
    }

    #[tokio::test]
    async fn test_query_gets_empty_reply() {
        let (client, mut events, handle) = spawn(MongoDb::new("mongo01", Limits::default()));
        let reply = exchange(client, &query(42)).await;
        handle.await.unwrap().unwrap();

        assert_eq!(reply.len(), HEADER_LEN + 20);
        let header = WireFrameHeader::decode(&reply).unwrap();
        assert_eq!(header.response_to, 42);
        assert_eq!(header.length as usize, reply.len());
        assert_eq!(header.op(), OpCode::Reply);
        assert!(reply[HEADER_LEN..].iter().all(|&b| b == 0));

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind.as_deref(), Some("OP_QUERY"));
        assert_eq!(event.field("mongodb.collection"), Some(&json!("admin.$cmd")));
        assert_eq!(event.field("mongodb.request-id"), Some(&json!(42)));
    }

    #[tokio::test]
    async fn test_several_frames_per_connection() {
        let (client, mut events, _handle) = spawn(MongoDb::new("mongo01", Limits::default()));
        let mut request = query(1);
        request.extend(frame(2, 2013, b"\0\0\0\0\0\x05\0\0\0\0"));
        request.extend(query(3));
        let reply = exchange(client, &request).await;

        // OP_MSG goes unanswered.
        assert_eq!(reply.len(), 2 * (HEADER_LEN + 20));
        let first = WireFrameHeader::decode(&reply).unwrap();
        let second = WireFrameHeader::decode(&reply[HEADER_LEN + 20..]).unwrap();
        assert_eq!((first.response_to, second.response_to), (1, 3));
        assert_ne!(first.request_id, second.request_id);

        let mut kinds = Vec::new();
        while let Some(event) = events.recv().await {
            kinds.push(event.kind.unwrap());
        }
        assert_eq!(kinds, ["OP_QUERY", "OP_MSG", "OP_QUERY"]);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let limits = Limits {
            max_frame_size: 64,
            ..Limits::default()
        };
        let (client, mut events, handle) = spawn(MongoDb::new("mongo01", limits));
        let reply = exchange(client, &frame(1, 2004, &[0u8; 100])).await;

        assert!(reply.is_empty());
        assert!(matches!(handle.await.unwrap(), Err(PipelineError::ProtocolViolation(_))));
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_short_length_rejected() {
        let (client, _events, handle) = spawn(MongoDb::new("mongo01", Limits::default()));
        let mut bad = frame(1, 2004, b"");
        bad[..4].copy_from_slice(&12i32.to_le_bytes());
        exchange(client, &bad).await;
        assert!(matches!(handle.await.unwrap(), Err(PipelineError::ProtocolViolation(_))));
    }
}
