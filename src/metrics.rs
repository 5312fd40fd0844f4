use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::{global, KeyValue};
use std::sync::OnceLock;
use std::time::Instant;

/// OpenTelemetry metrics for the emulated services.
///
/// Tracks connections, handled requests, unknown selectors, protocol
/// violations and submitted events, all labelled by service category.
/// Labels never carry peer-supplied text. Singleton instance accessed via
/// `Metrics::get()`.
pub struct Metrics {
    // Connection-level metrics
    pub connections_total: Counter<u64>,
    pub connection_duration: Histogram<f64>,

    // Request metrics
    pub requests_total: Counter<u64>,
    pub request_duration: Histogram<f64>,
    pub unknown_selectors_total: Counter<u64>,

    // Failure metrics
    pub errors_total: Counter<u64>,

    // Telemetry pipeline
    pub events_total: Counter<u64>,
    pub events_dropped_total: Counter<u64>,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

impl Metrics {
    pub fn init() -> &'static Self {
        METRICS.get_or_init(|| {
            let meter = global::meter("coral-decoy");

            Metrics {
                connections_total: meter
                    .u64_counter("decoy_connections_total")
                    .with_description("Total number of accepted connections")
                    .init(),

                connection_duration: meter
                    .f64_histogram("decoy_connection_duration_seconds")
                    .with_description("Connection lifetime in seconds")
                    .init(),

                requests_total: meter
                    .u64_counter("decoy_requests_total")
                    .with_description("Total number of framed requests")
                    .init(),

                request_duration: meter
                    .f64_histogram("decoy_request_duration_seconds")
                    .with_description("Time from framed request to written reply")
                    .init(),

                unknown_selectors_total: meter
                    .u64_counter("decoy_unknown_selectors_total")
                    .with_description("Requests naming a path, command or opcode with no canned reply")
                    .init(),

                errors_total: meter
                    .u64_counter("decoy_errors_total")
                    .with_description("Connections ended by an error")
                    .init(),

                events_total: meter
                    .u64_counter("decoy_events_total")
                    .with_description("Telemetry events submitted to the sink")
                    .init(),

                events_dropped_total: meter
                    .u64_counter("decoy_events_dropped_total")
                    .with_description("Events discarded because the event queue was full")
                    .init(),
            }
        })
    }

    pub fn get() -> &'static Self {
        METRICS.get().unwrap_or_else(|| {
            // For tests, initialize with defaults if not already initialized
            Self::init()
        })
    }

    pub fn record_connection(&self, service: &str) {
        self.connections_total
            .add(1, &[KeyValue::new("service", service.to_string())]);
    }

    pub fn record_connection_closed(&self, service: &str, duration: f64) {
        self.connection_duration
            .record(duration, &[KeyValue::new("service", service.to_string())]);
    }

    pub fn record_request(&self, service: &str, duration: f64) {
        let labels = &[KeyValue::new("service", service.to_string())];
        self.requests_total.add(1, labels);
        self.request_duration.record(duration, labels);
    }

    /// The selector itself is logged by the caller, not used as a label.
    pub fn record_unknown(&self, service: &str) {
        self.unknown_selectors_total.add(1, &service_labels(service));
    }

    pub fn record_error(&self, service: &str, error_type: &str) {
        self.errors_total.add(
            1,
            &[
                KeyValue::new("service", service.to_string()),
                KeyValue::new("error_type", error_type.to_string()),
            ],
        );
    }

    pub fn record_event(&self, category: &str) {
        self.events_total
            .add(1, &[KeyValue::new("category", category.to_string())]);
    }

    pub fn record_event_dropped(&self, category: &str) {
        self.events_dropped_total
            .add(1, &[KeyValue::new("category", category.to_string())]);
    }
}

fn service_labels(service: &str) -> [KeyValue; 1] {
    [KeyValue::new("service", service.to_string())]
}

// Timer utility for measuring durations
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_seconds(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
