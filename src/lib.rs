pub mod cli;
pub mod config;
pub mod error;
pub mod event;
pub mod metrics;
pub mod protocol;
pub mod server;
pub mod services;
pub mod telemetry;

pub use config::{Config, Limits};
pub use error::{AppError, PipelineError};
pub use event::{ChannelSink, Event, EventSink, LogSink, NullSink};
pub use protocol::{RedisDatum, Request};
pub use server::Server;
pub use services::{Connection, Service, ServiceKind};
