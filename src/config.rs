use crate::cli::Cli;
use crate::error::ConfigError;
use crate::protocol::http::{DEFAULT_MAX_BODY_SIZE, DEFAULT_MAX_HEADER_SIZE};
use crate::protocol::resp::DEFAULT_MAX_BUFFER_LEN;
use crate::protocol::wire::DEFAULT_MAX_FRAME_SIZE;
use crate::services::ServiceKind;
use crate::event::DEFAULT_EVENT_QUEUE;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration: bind address, listeners, limits and event output.
///
/// Can be loaded from files, env vars, or CLI args with precedence order:
/// CLI > File > Environment > Defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default = "default_services")]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub events: EventsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

/// One listener: an emulator kind bound to a port under an instance name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub kind: ServiceKind,
    pub port: u16,
}

impl ServiceConfig {
    pub fn default_for(kind: ServiceKind) -> Self {
        Self {
            name: kind.as_str().to_string(),
            kind,
            port: kind.default_port(),
        }
    }
}

fn default_services() -> Vec<ServiceConfig> {
    ServiceKind::ALL.into_iter().map(ServiceConfig::default_for).collect()
}

/// Per-connection resource limits shared by every listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_frame_size: usize,
    pub max_header_size: usize,
    pub max_body_size: usize,
    /// Upper bound on one buffered Redis request, inline or RESP.
    pub max_inline_size: usize,
    /// Seconds a read may stay idle. `0` disables the deadline.
    pub read_timeout_secs: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            max_inline_size: DEFAULT_MAX_BUFFER_LEN,
            read_timeout_secs: 60,
        }
    }
}

impl Limits {
    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_secs > 0).then(|| Duration::from_secs(self.read_timeout_secs))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default)]
    pub output: EventOutput,
    /// Events queued for the writer before new ones are dropped.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            output: EventOutput::default(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_queue_capacity() -> usize {
    DEFAULT_EVENT_QUEUE
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EventOutput {
    /// Render events through the log.
    #[default]
    Log,
    /// Append JSON lines to a file.
    File { path: PathBuf },
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            services: default_services(),
            limits: Limits::default(),
            events: EventsConfig::default(),
        }
    }
}

impl Config {
    /// Create config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(host) = lookup("DECOY_HOST") {
            config.server.host = host;
        }

        if let Some(path) = lookup("DECOY_EVENTS_FILE") {
            config.events.output = EventOutput::File {
                path: PathBuf::from(path),
            };
        }

        if let Some(size) = lookup("DECOY_MAX_FRAME_SIZE") {
            config.limits.max_frame_size = size.parse().map_err(|_| {
                ConfigError::Validation(format!("DECOY_MAX_FRAME_SIZE is not a size: {}", size))
            })?;
        }

        if let Some(secs) = lookup("DECOY_READ_TIMEOUT") {
            config.limits.read_timeout_secs = secs.parse().map_err(|_| {
                ConfigError::Validation(format!("DECOY_READ_TIMEOUT is not a number of seconds: {}", secs))
            })?;
        }

        Ok(config)
    }

    /// Create config with CLI args taking precedence over environment and file.
    ///
    /// Precedence: CLI > File > Environment > Defaults
    pub fn from_sources(cli: &Cli) -> Result<Self, ConfigError> {
        let env_config = Self::from_env()?;

        let file_layer = cli
            .config
            .as_ref()
            .map(Self::load_file_layer)
            .transpose()?;

        Self::merge(cli, file_layer, env_config)
    }

    fn merge(cli: &Cli, file_layer: Option<Value>, env_config: Config) -> Result<Self, ConfigError> {
        let base = match file_layer {
            Some(layer) => {
                let mut merged = serde_json::to_value(&env_config)?;
                overlay(&mut merged, layer);
                serde_json::from_value(merged)?
            }
            None => env_config,
        };

        let server = ServerConfig {
            host: cli.host.clone().unwrap_or(base.server.host),
        };

        let mut services = base.services;
        for kind in ServiceKind::ALL {
            let Some(port) = cli.port_for(kind) else {
                continue;
            };
            match services.iter_mut().find(|s| s.kind == kind) {
                Some(existing) => existing.port = port,
                None => services.push(ServiceConfig {
                    port,
                    ..ServiceConfig::default_for(kind)
                }),
            }
        }

        let mut events = base.events;
        if let Some(path) = &cli.events_file {
            events.output = EventOutput::File { path: path.clone() };
        }

        let config = Config {
            server,
            services,
            limits: base.limits,
            events,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut ports = HashSet::new();
        let mut names = HashSet::new();

        for service in &self.services {
            if service.name.trim().is_empty() {
                return Err(ConfigError::MissingField(format!(
                    "name for {} listener on port {}",
                    service.kind, service.port
                )));
            }
            if !names.insert(service.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate service name {:?}",
                    service.name
                )));
            }
            if !ports.insert(service.port) {
                return Err(ConfigError::Validation(format!(
                    "port {} assigned to more than one service",
                    service.port
                )));
            }
        }

        let limits = &self.limits;
        for (name, value) in [
            ("max_frame_size", limits.max_frame_size),
            ("max_header_size", limits.max_header_size),
            ("max_body_size", limits.max_body_size),
            ("max_inline_size", limits.max_inline_size),
            ("events.queue_capacity", self.events.queue_capacity),
        ] {
            if value == 0 {
                return Err(ConfigError::Validation(format!("{} must be non-zero", name)));
            }
        }

        Ok(())
    }

    /// Read a config file as a JSON object. Keys it leaves out keep their
    /// value from the lower layers.
    pub fn load_file_layer<P: AsRef<Path>>(path: P) -> Result<Value, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let layer: Value = serde_json::from_str(&contents)?;
        if !layer.is_object() {
            return Err(ConfigError::Validation(
                "config file must hold a JSON object".to_string(),
            ));
        }
        Ok(layer)
    }
}

/// Copy `layer` onto `base` key by key. Arrays, scalars and tagged objects
/// (those with a `kind` key) replace the base value whole.
fn overlay(base: &mut Value, layer: Value) {
    match (base, layer) {
        (Value::Object(base), Value::Object(layer)) if !layer.contains_key("kind") => {
            for (key, value) in layer {
                match base.get_mut(&key) {
                    Some(slot) => overlay(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, layer) => *base = layer,
    }
}
