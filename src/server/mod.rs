//! Listener registry: one TCP listener per configured service, one task per
//! accepted connection.

pub mod framer;

use crate::config::{Config, ServiceConfig};
use crate::error::PipelineError;
use crate::event::EventSink;
use crate::metrics::{Metrics, Timer};
use crate::services::{Connection, Service};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A built emulator bound to its listener.
pub struct Listener {
    service: Arc<dyn Service>,
    listener: TcpListener,
}

impl Listener {
    /// Build the emulator described by `entry`, attach `sink`, and bind.
    pub async fn bind(
        host: &str,
        entry: &ServiceConfig,
        config: &Config,
        sink: Arc<dyn EventSink>,
    ) -> std::io::Result<Self> {
        let mut service = entry.kind.build(&entry.name, &config.limits);
        service.attach_sink(sink);
        let listener = TcpListener::bind((host, entry.port)).await?;
        Ok(Self {
            service: Arc::from(service),
            listener,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept forever, handing each connection to its own task.
    pub async fn run(self) -> std::io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(
            "{} ({}) listening on {}",
            self.service.name(),
            self.service.category(),
            local_addr
        );

        loop {
            let (socket, peer_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("{}: accept failed: {}", self.service.name(), e);
                    continue;
                }
            };
            let service = Arc::clone(&self.service);

            tokio::spawn(async move {
                debug!("New {} connection from {}", service.name(), peer_addr);
                let metrics = Metrics::get();
                metrics.record_connection(service.category());
                let timer = Timer::new();

                let result = service
                    .handle(Connection::new(socket, local_addr, peer_addr))
                    .await;
                report(service.as_ref(), peer_addr, result);

                metrics.record_connection_closed(service.category(), timer.elapsed_seconds());
            });
        }
    }
}

/// Log how a connection ended, at the level its outcome deserves.
fn report(service: &dyn Service, peer: SocketAddr, result: Result<(), PipelineError>) {
    let Err(e) = result else {
        debug!("{}: connection from {} closed", service.name(), peer);
        return;
    };
    let metrics = Metrics::get();
    match &e {
        PipelineError::ProtocolViolation(_) => {
            warn!("{}: {} from {}", service.name(), e, peer);
            metrics.record_error(service.category(), "protocol_violation");
        }
        PipelineError::Encoding(_) => {
            error!("{}: {} answering {}", service.name(), e, peer);
            metrics.record_error(service.category(), "encoding");
        }
        PipelineError::Io(_) => {
            debug!("{}: {} with {}", service.name(), e, peer);
            metrics.record_error(service.category(), "io");
        }
        PipelineError::ConnectionClosed | PipelineError::Timeout => {
            debug!("{}: {} ({})", service.name(), e, peer);
        }
    }
}

/// Every configured listener.
pub struct Server {
    listeners: Vec<Listener>,
}

impl Server {
    /// Bind all listeners up front so a port conflict fails startup.
    pub async fn bind(config: &Config, sink: Arc<dyn EventSink>) -> std::io::Result<Self> {
        let mut listeners = Vec::with_capacity(config.services.len());
        for entry in &config.services {
            let listener = Listener::bind(&config.server.host, entry, config, Arc::clone(&sink))
                .await
                .map_err(|e| {
                    std::io::Error::new(
                        e.kind(),
                        format!("binding {} on {}:{}: {}", entry.name, config.server.host, entry.port, e),
                    )
                })?;
            listeners.push(listener);
        }
        Ok(Self { listeners })
    }

    pub fn local_addrs(&self) -> std::io::Result<Vec<SocketAddr>> {
        self.listeners.iter().map(Listener::local_addr).collect()
    }

    /// Run every listener until one of them fails.
    pub async fn run(self) -> std::io::Result<()> {
        let handles: Vec<JoinHandle<std::io::Result<()>>> = self
            .listeners
            .into_iter()
            .map(|listener| tokio::spawn(listener.run()))
            .collect();

        for handle in handles {
            handle
                .await
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ChannelSink;
    use crate::services::ServiceKind;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn ephemeral(kinds: &[ServiceKind]) -> Config {
        let mut config = Config::default();
        config.services = kinds
            .iter()
            .map(|&kind| ServiceConfig {
                port: 0,
                ..ServiceConfig::default_for(kind)
            })
            .collect();
        config
    }

    #[tokio::test]
    async fn test_serves_over_tcp() {
        let (sink, mut events) = ChannelSink::new();
        let server = Server::bind(&ephemeral(&[ServiceKind::Redis]), Arc::new(sink))
            .await
            .unwrap();
        let addr = server.local_addrs().unwrap()[0];
        tokio::spawn(server.run());

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"PING\r\n").await.unwrap();
        let mut reply = [0u8; 7];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"+PONG\r\n");

        let event = events.recv().await.unwrap();
        assert_eq!(event.category, "redis");
        assert_eq!(event.destination_addr, addr);
    }

    #[tokio::test]
    async fn test_port_conflict_fails_bind() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = ephemeral(&[ServiceKind::Mongodb]);
        config.services[0].port = taken.local_addr().unwrap().port();

        let (sink, _events) = ChannelSink::new();
        assert!(Server::bind(&config, Arc::new(sink)).await.is_err());
    }
}
