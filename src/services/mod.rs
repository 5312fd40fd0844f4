//! The emulated services.
//!
//! Each service owns its selector table, built once when the service is
//! constructed and shared read-only by every connection it handles.

pub mod claymore;
pub mod couchdb;
pub mod mongodb;
pub mod redis;

pub use claymore::Claymore;
pub use couchdb::CouchDb;
pub use mongodb::MongoDb;
pub use redis::Redis;

use crate::config::Limits;
use crate::error::PipelineError;
use crate::event::{EventSink, NullSink, TelemetryEmitter};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// Byte stream a service reads requests from and writes replies to.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// An accepted connection as handed over by the listener.
pub struct Connection {
    pub stream: Box<dyn Stream>,
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
}

impl Connection {
    pub fn new<S: Stream + 'static>(stream: S, local_addr: SocketAddr, peer_addr: SocketAddr) -> Self {
        Self {
            stream: Box::new(stream),
            local_addr,
            peer_addr,
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

/// One emulated network service.
///
/// `handle` drives a single connection to completion. A peer that closes
/// between requests or goes silent past the read deadline is a normal end
/// and yields `Ok(())`.
#[async_trait]
pub trait Service: Send + Sync {
    /// Configured instance name.
    fn name(&self) -> &str;

    /// Event category, fixed per kind.
    fn category(&self) -> &'static str;

    fn attach_sink(&mut self, sink: Arc<dyn EventSink>);

    async fn handle(&self, conn: Connection) -> Result<(), PipelineError>;
}

/// Which emulator a listener runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Claymore,
    Couchdb,
    Redis,
    Mongodb,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 4] = [Self::Claymore, Self::Couchdb, Self::Redis, Self::Mongodb];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Claymore => "claymore",
            Self::Couchdb => "couchdb",
            Self::Redis => "redis",
            Self::Mongodb => "mongodb",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Self::Claymore => 3333,
            Self::Couchdb => 5984,
            Self::Redis => 6379,
            Self::Mongodb => 27017,
        }
    }

    /// Construct the emulator with a [`NullSink`] attached.
    pub fn build(self, name: &str, limits: &Limits) -> Box<dyn Service> {
        match self {
            Self::Claymore => Box::new(Claymore::new(name, limits.clone())),
            Self::Couchdb => Box::new(CouchDb::new(name, limits.clone())),
            Self::Redis => Box::new(Redis::new(name, limits.clone())),
            Self::Mongodb => Box::new(MongoDb::new(name, limits.clone())),
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State shared by every emulator: identity, sink and limits.
#[derive(Clone)]
pub(crate) struct ServiceBase {
    pub name: Arc<str>,
    pub category: &'static str,
    pub sink: Arc<dyn EventSink>,
    pub limits: Limits,
}

impl ServiceBase {
    pub fn new(name: &str, kind: ServiceKind, limits: Limits) -> Self {
        Self {
            name: Arc::from(name),
            category: kind.as_str(),
            sink: Arc::new(NullSink),
            limits,
        }
    }

    pub fn emitter(&self, conn: &Connection) -> TelemetryEmitter {
        TelemetryEmitter::new(
            self.category,
            Arc::clone(&self.name),
            Arc::clone(&self.sink),
            conn.local_addr,
            conn.peer_addr,
        )
    }
}

/// Fold the quiet endings of a connection into success.
pub(crate) fn settle(result: Result<(), PipelineError>) -> Result<(), PipelineError> {
    match result {
        Err(e) if e.is_quiet() => Ok(()),
        other => other,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::event::{ChannelSink, Event};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::sync::mpsc::Receiver;
    use tokio::task::JoinHandle;

    pub fn addrs() -> (SocketAddr, SocketAddr) {
        ("127.0.0.1:9000".parse().unwrap(), "198.51.100.4:41000".parse().unwrap())
    }

    /// Attach a channel sink and start `service` on one end of a duplex pipe.
    pub fn spawn<S: Service + 'static>(
        mut service: S,
    ) -> (
        DuplexStream,
        Receiver<Event>,
        JoinHandle<Result<(), PipelineError>>,
    ) {
        let (sink, rx) = ChannelSink::new();
        service.attach_sink(Arc::new(sink));
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (local, peer) = addrs();
        let handle = tokio::spawn(async move { service.handle(Connection::new(server, local, peer)).await });
        (client, rx, handle)
    }

    /// Send `request`, close the write half, and collect everything sent back.
    pub async fn exchange(mut client: DuplexStream, request: &[u8]) -> Vec<u8> {
        client.write_all(request).await.unwrap();
        client.shutdown().await.unwrap();
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        reply
    }
}
