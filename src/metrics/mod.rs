//! Metrics export.
//!
//! Instruments are created from `opentelemetry::global::meter` where
//! they are recorded. [`initialize_metrics`] routes them into the
//! default prometheus registry, which [`gather_text`] renders for the
//! status API.

use std::sync::OnceLock;

use opentelemetry::global;
use opentelemetry::sdk::metrics::Aggregation;
use opentelemetry::sdk::metrics::Instrument;
use opentelemetry::sdk::metrics::MeterProvider;
use opentelemetry::sdk::metrics::Stream;
use prometheus::default_registry;
use prometheus::Encoder;
use prometheus::TextEncoder;

use crate::errors::ExecutionError;

/// Evaluate `$body` and record how long it took in seconds.
#[macro_export]
macro_rules! with_timer {
    ($histogram: expr, $labels: expr, $body: expr) => {{
        let now = std::time::Instant::now();
        let res = $body;
        $histogram.record(now.elapsed().as_secs_f64(), &$labels);
        res
    }};
}

fn config_err(err: impl std::fmt::Display) -> ExecutionError {
    ExecutionError::Config(format!("unable to set up metrics: {err}"))
}

/// Install a global meter provider exporting to the default
/// prometheus registry.
///
/// Only the first call installs anything; later calls return its
/// result.
pub fn initialize_metrics() -> Result<(), ExecutionError> {
    static INITIALIZED: OnceLock<Result<(), ExecutionError>> = OnceLock::new();
    INITIALIZED.get_or_init(install_provider).clone()
}

fn install_provider() -> Result<(), ExecutionError> {
    let registry = default_registry();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .with_namespace("flowcore")
        .build()
        .map_err(config_err)?;

    let provider = MeterProvider::builder()
        .with_reader(exporter)
        .with_view(
            opentelemetry_sdk::metrics::new_view(
                // Must match the histogram names.
                Instrument::new().name("*duration*"),
                Stream::new().aggregation(Aggregation::ExplicitBucketHistogram {
                    boundaries: vec![
                        0.0, 0.0005, 0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0,
                        2.5, 5.0, 7.5, 10.0,
                    ],
                    record_min_max: true,
                }),
            )
            .map_err(config_err)?,
        )
        .build();
    global::set_meter_provider(provider);
    Ok(())
}

/// All metrics of the default registry in the prometheus text format.
pub fn gather_text() -> Result<String, ExecutionError> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&default_registry().gather(), &mut buffer)
        .map_err(config_err)?;
    String::from_utf8(buffer).map_err(config_err)
}

#[test]
fn recorded_metrics_are_gathered() {
    use opentelemetry::KeyValue;

    initialize_metrics().unwrap();
    let counter = global::meter("flowcore")
        .u64_counter("test_item_count")
        .init();
    counter.add(3, &[KeyValue::new("vertex", "test")]);
    let text = gather_text().unwrap();
    assert!(text.contains("test_item_count"), "{text}");
}
