use crate::error::TelemetryError;
use opentelemetry::global;
use opentelemetry_sdk::metrics::MeterProvider;
use tracing::{info, Level};

/// Metrics stay in-process: the provider has no reader or exporter attached.
pub struct TelemetryConfig {
    pub enable_metrics: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enable_metrics: true,
        }
    }
}

pub struct TelemetryService {
    config: TelemetryConfig,
}

impl TelemetryService {
    pub fn new(config: TelemetryConfig) -> Result<Self, TelemetryError> {
        if config.enable_metrics {
            let provider = MeterProvider::builder().build();
            global::set_meter_provider(provider);
        }

        Ok(Self { config })
    }

    pub fn initialize(&self) -> Result<(), TelemetryError> {
        if !self.config.enable_metrics {
            info!("Metrics collection disabled");
            return Ok(());
        }

        info!("OpenTelemetry metrics initialized (in-process, no exporter)");
        Ok(())
    }
}

/// Install the fmt subscriber at `level`. Fails if one is already set.
pub fn init_logging(level: Level) -> Result<(), TelemetryError> {
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .try_init()
        .map_err(|e| TelemetryError::ProviderSetup(e.to_string()))
}

// Convenience function to initialize telemetry with default configuration
pub fn init_telemetry() -> Result<TelemetryService, TelemetryError> {
    init_telemetry_with_config(TelemetryConfig::default())
}

pub fn init_telemetry_with_config(config: TelemetryConfig) -> Result<TelemetryService, TelemetryError> {
    let service = TelemetryService::new(config)?;

    crate::metrics::Metrics::init();

    service.initialize()?;

    info!("OpenTelemetry telemetry initialized");
    Ok(service)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_metrics_initialize() {
        let service = TelemetryService::new(TelemetryConfig {
            enable_metrics: false,
        })
        .unwrap();
        assert!(service.initialize().is_ok());
    }

    #[test]
    fn test_init_telemetry() {
        assert!(init_telemetry().is_ok());
        crate::metrics::Metrics::get().record_event("test");
    }
}
