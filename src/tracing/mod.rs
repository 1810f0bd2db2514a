//! Tracing and logging setup.
//!
//! Logging to stdout is always enabled, at least at the "ERROR"
//! level, for events under the `flowcore` target. Exporting traces is
//! optional and off by default.
//!
//! Each tracing backend implements [`TracerBuilder`], which returns the
//! [`Tracer`] the opentelemetry layer sends spans to.

use opentelemetry::sdk::trace::Tracer;
use tokio::runtime::EnterGuard;
use tracing::level_filters::LevelFilter;
use tracing::Subscriber;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Layer;
use tracing_subscriber::Registry;

use crate::errors::ExecutionError;

pub mod otlp_tracing;

pub use otlp_tracing::OtlpTracingConfig;

const TARGET: &str = "flowcore";

/// Where traces go.
#[derive(Debug, Clone, Default)]
pub enum TracingConfig {
    /// Only log.
    #[default]
    Disabled,
    Otlp(OtlpTracingConfig),
}

/// Implemented by every tracing backend.
pub trait TracerBuilder {
    fn build(&self) -> Result<Tracer, ExecutionError>;
}

fn get_log_level(level: Option<&str>) -> Result<LevelFilter, ExecutionError> {
    let Some(level) = level else {
        return Ok(LevelFilter::ERROR);
    };
    match level.to_lowercase().as_str() {
        "trace" => Ok(LevelFilter::TRACE),
        "debug" => Ok(LevelFilter::DEBUG),
        "info" => Ok(LevelFilter::INFO),
        "warn" => Ok(LevelFilter::WARN),
        "error" => Ok(LevelFilter::ERROR),
        level => Err(ExecutionError::Config(format!("wrong log level: {level}"))),
    }
}

/// Keeps the tokio runtime the trace exporter runs on alive.
pub struct FlowcoreTracer {
    rt: tokio::runtime::Runtime,
}

impl FlowcoreTracer {
    pub fn new() -> Result<Self, ExecutionError> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|err| {
                ExecutionError::Config(format!("unable to start tracing runtime: {err}"))
            })?;
        Ok(Self { rt })
    }

    /// Install the global subscriber. Keep the returned guard in
    /// scope for as long as you want traces exported.
    pub fn setup(
        &self,
        config: TracingConfig,
        log_level: Option<&str>,
    ) -> Result<EnterGuard<'_>, ExecutionError> {
        let guard = self.rt.enter();
        let log_level = get_log_level(log_level)?;

        let logs = tracing_subscriber::fmt::Layer::default()
            .compact()
            .with_file(true)
            .with_line_number(true)
            .with_thread_ids(true)
            .with_filter(Targets::new().with_target(TARGET, log_level));

        match config {
            TracingConfig::Otlp(otlp) => {
                // The batch exporter spawns onto the runtime, so it
                // has to be built from within it.
                let tracer = self.rt.block_on(async { otlp.build() })?;
                let telemetry = tracing_opentelemetry::layer()
                    .with_tracer(tracer)
                    .with_filter(Targets::new().with_target(TARGET, LevelFilter::TRACE));
                set_global_subscriber(Registry::default().with(logs).with(telemetry));
            }
            TracingConfig::Disabled => set_global_subscriber(Registry::default().with(logs)),
        }
        Ok(guard)
    }
}

// Installing twice happens in tests and when a process starts more
// than one node, so only warn.
fn set_global_subscriber<S>(subscriber: S)
where
    S: Subscriber + Send + Sync + 'static,
{
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        tracing::warn!("{err}");
    }
}

#[test]
fn log_levels_parse() {
    assert_eq!(get_log_level(None).unwrap(), LevelFilter::ERROR);
    assert_eq!(get_log_level(Some("DEBUG")).unwrap(), LevelFilter::DEBUG);
    assert!(matches!(
        get_log_level(Some("loud")),
        Err(ExecutionError::Config(_))
    ));
}

#[test]
fn setup_twice_is_harmless() {
    let tracer = FlowcoreTracer::new().unwrap();
    drop(tracer.setup(TracingConfig::Disabled, Some("info")).unwrap());
    drop(tracer.setup(TracingConfig::Disabled, None).unwrap());
}
