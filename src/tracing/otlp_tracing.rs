use opentelemetry::runtime::Tokio;
use opentelemetry::sdk::trace::config;
use opentelemetry::sdk::trace::Sampler;
use opentelemetry::sdk::trace::Tracer;
use opentelemetry::sdk::Resource;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;

use crate::errors::ExecutionError;

use super::TracerBuilder;

/// Send traces to an opentelemetry collector:
/// https://opentelemetry.io/docs/collector/
///
/// Only the GRPC protocol is supported.
#[derive(Debug, Clone)]
pub struct OtlpTracingConfig {
    /// Identifies this node in traces.
    pub service_name: String,
    /// Collector URL, `grpc://127.0.0.1:4317` if unset.
    pub url: Option<String>,
    /// Share of traces sampled, between 0 and 1.
    pub sampling_ratio: f64,
}

impl OtlpTracingConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            url: None,
            sampling_ratio: 1.0,
        }
    }
}

impl TracerBuilder for OtlpTracingConfig {
    fn build(&self) -> Result<Tracer, ExecutionError> {
        let mut exporter = opentelemetry_otlp::new_exporter().tonic();
        if let Some(endpoint) = self.url.as_ref() {
            exporter = exporter.with_endpoint(endpoint);
        }

        opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(
                config()
                    .with_sampler(Sampler::TraceIdRatioBased(self.sampling_ratio))
                    .with_resource(Resource::new(vec![KeyValue::new(
                        "service.name",
                        self.service_name.clone(),
                    )])),
            )
            .install_batch(Tokio)
            .map_err(|err| ExecutionError::Config(format!("error installing tracer: {err}")))
    }
}
