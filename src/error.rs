//! Application-level error types for the Coral decoy daemon.

use thiserror::Error;

/// Top-level application error type.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("file error: {0}")]
    FileError(#[from] std::io::Error),

    #[error("parse error: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("missing required field: {0}")]
    MissingField(String),
}

/// Telemetry initialization errors.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("provider setup failed: {0}")]
    ProviderSetup(String),
}

/// Failures that end a single connection's pipeline.
///
/// Unknown selectors and argument validation failures never show up here:
/// they are answered with a protocol-appropriate reply instead.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Peer went away between requests. Not an error.
    #[error("connection closed")]
    ConnectionClosed,

    /// Malformed framing. Logged, no reply is sent.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A reply could not be serialized.
    #[error("encoding failure: {0}")]
    Encoding(String),

    /// Peer stayed silent past the read deadline.
    #[error("read timed out")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn violation(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(msg.into())
    }

    /// True for outcomes that end the connection without a diagnostic.
    pub fn is_quiet(&self) -> bool {
        matches!(self, Self::ConnectionClosed | Self::Timeout)
    }
}

/// Raised by the typed RESP accessors when a datum has the wrong variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DatumError {
    #[error("Expected {expected} argument, got {found}")]
    UnexpectedType {
        expected: &'static str,
        found: &'static str,
    },

    #[error("Expected string argument, got invalid UTF-8")]
    InvalidUtf8,

    #[error("value is not an integer or out of range")]
    NotAnInteger,
}

pub type Result<T> = std::result::Result<T, AppError>;
