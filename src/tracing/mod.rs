//! Logging and trace export.
//!
//! Logs always go to stdout, by default only at the "ERROR" level.
//! Spans can additionally be exported to an OpenTelemetry collector
//! with [`OtlpTracingConfig`].
//!
//! Every tracing backend implements [`TracerBuilder`], which only has
//! to return the proper `Tracer`.
use opentelemetry::sdk::trace::Tracer;
use tracing::level_filters::LevelFilter;
use tracing::Subscriber;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::Registry;

use crate::errors::EngineError;
use crate::errors::Result;

pub(crate) mod otlp_tracing;

pub use otlp_tracing::OtlpTracingConfig;

/// Env var that replaces the log filter entirely, using
/// `EnvFilter` directives.
///
/// eg: to see spotguard's debug logs and warnings from everything
/// else:
///     $ SPOTGUARD_LOG="spotguard=debug,warn" spotguard
pub const LOG_ENV_VAR: &str = "SPOTGUARD_LOG";

const TARGET: &str = "spotguard";

/// Implemented by every trace export backend.
pub(crate) trait TracerBuilder {
    fn build(&self) -> Result<Tracer>;
}

pub fn parse_log_level(level: &str) -> Result<LevelFilter> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(LevelFilter::TRACE),
        "debug" => Ok(LevelFilter::DEBUG),
        "info" => Ok(LevelFilter::INFO),
        "warn" => Ok(LevelFilter::WARN),
        "error" => Ok(LevelFilter::ERROR),
        level => Err(EngineError::Config(format!("wrong log level: {level}"))),
    }
}

fn log_filter(log_level: LevelFilter) -> Box<dyn Layer<Registry> + Send + Sync> {
    let logs = tracing_subscriber::fmt::Layer::default()
        .compact()
        // Show source file
        .with_file(true)
        // Display source code line numbers
        .with_line_number(true)
        // Display the thread ID an event was recorded on
        .with_thread_ids(true);
    match std::env::var(LOG_ENV_VAR) {
        Ok(directives) => logs.with_filter(EnvFilter::new(directives)).boxed(),
        Err(_) => logs
            .with_filter(Targets::new().with_target(TARGET, log_level))
            .boxed(),
    }
}

/// Install the global subscriber.
///
/// Has to run inside a tokio runtime when `otlp` is set, since the
/// batch exporter spawns onto it.
pub fn setup_tracing(log_level: &str, otlp: Option<&OtlpTracingConfig>) -> Result<()> {
    let logs = log_filter(parse_log_level(log_level)?);
    match otlp {
        Some(conf) => {
            let tracer = conf.build()?;
            let telemetry = tracing_opentelemetry::layer()
                .with_tracer(tracer)
                // Send all traces from spotguard
                .with_filter(Targets::new().with_target(TARGET, LevelFilter::TRACE));
            set_global_subscriber(Registry::default().with(logs).with(telemetry));
        }
        None => set_global_subscriber(Registry::default().with(logs)),
    }
    Ok(())
}

// Try to set a global default subscriber, logging the error without
// panicking if it was already set.
fn set_global_subscriber<S>(subscriber: S)
where
    S: Subscriber + Send + Sync + 'static,
{
    // This fails if tracing was already initialized, which happens in
    // tests and when an embedding program set up its own subscriber.
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        tracing::warn!("{err}");
    }
}
