use std::sync::OnceLock;

use opentelemetry::global;
use opentelemetry::metrics::Counter;
use opentelemetry::metrics::Histogram;
use opentelemetry::sdk::metrics::Aggregation;
use opentelemetry::sdk::metrics::Instrument;
use opentelemetry::sdk::metrics::MeterProvider;
use opentelemetry::sdk::metrics::Stream;
use opentelemetry::KeyValue;
use prometheus::default_registry;
use prometheus::Encoder;
use prometheus::TextEncoder;

use crate::errors::EngineError;
use crate::errors::Result;

#[macro_export]
macro_rules! with_timer {
    ($histogram: expr, $labels: expr, $body: expr) => {{
        let now = std::time::Instant::now();
        let res = $body;
        $histogram.record(now.elapsed().as_secs_f64(), &$labels);
        res
    }};
}

/// Initialize the global registry for Prometheus metrics,
/// and create a global MeterProvider.
///
/// Instruments created before this stay bound to the no-op meter, so
/// it must run before [`EngineMetrics::new`]. Later calls return the
/// first outcome.
pub fn initialize_metrics() -> Result<()> {
    static INIT: OnceLock<std::result::Result<(), String>> = OnceLock::new();
    INIT.get_or_init(|| install_meter_provider().map_err(|err| err.to_string()))
        .clone()
        .map_err(EngineError::Config)
}

fn install_meter_provider() -> Result<()> {
    // Initialize the global default registry for prometheus metrics
    // as internally it's a lazy static.
    let registry = default_registry();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .with_namespace("spotguard")
        .build()
        .map_err(|err| EngineError::Config(format!("prometheus exporter: {err}")))?;

    // Failovers and snapshots take seconds to tens of minutes.
    let provider = MeterProvider::builder()
        .with_reader(exporter)
        .with_view(
            opentelemetry_sdk::metrics::new_view(
                Instrument::new().name("*duration*"), // Must match histogram name
                Stream::new().aggregation(Aggregation::ExplicitBucketHistogram {
                    boundaries: vec![
                        0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0,
                        1800.0, 3600.0,
                    ],
                    record_min_max: true,
                }),
            )
            .map_err(|err| EngineError::Config(format!("metrics view: {err}")))?,
        )
        .build();
    global::set_meter_provider(provider);
    Ok(())
}

/// Prometheus text exposition of everything in the default
/// registry.
pub fn render() -> Result<String> {
    let families = default_registry().gather();
    let mut buf = Vec::new();
    TextEncoder::new()
        .encode(&families, &mut buf)
        .map_err(|err| EngineError::Config(format!("encoding metrics: {err}")))?;
    String::from_utf8(buf).map_err(|err| EngineError::Config(format!("encoding metrics: {err}")))
}

/// Instruments shared by every component.
///
/// Without [`initialize_metrics`] the global meter is a no-op, so
/// components can always record.
#[derive(Clone)]
pub struct EngineMetrics {
    pub failover_total: Counter<u64>,
    pub failover_duration: Histogram<f64>,
    pub failover_phase_duration: Histogram<f64>,
    pub race_total: Counter<u64>,
    pub race_loser_leaks: Counter<u64>,
    pub snapshot_create_duration: Histogram<f64>,
    pub snapshot_restore_duration: Histogram<f64>,
    pub snapshot_failures: Counter<u64>,
    pub heartbeat_failures: Counter<u64>,
    pub warm_pool_acquire: Counter<u64>,
}

impl std::fmt::Debug for EngineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineMetrics").finish_non_exhaustive()
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineMetrics {
    pub fn new() -> Self {
        let meter = global::meter("spotguard");
        Self {
            failover_total: meter
                .u64_counter("failover_total")
                .with_description("number of finished failovers by outcome")
                .init(),
            failover_duration: meter
                .f64_histogram("failover_duration_seconds")
                .with_description("detection to completion time of successful failovers")
                .init(),
            failover_phase_duration: meter
                .f64_histogram("failover_phase_duration_seconds")
                .with_description("time spent in each failover phase")
                .init(),
            race_total: meter
                .u64_counter("race_total")
                .with_description("number of provisioning races by outcome")
                .init(),
            race_loser_leaks: meter
                .u64_counter("race_loser_leaks_total")
                .with_description("race losers whose destroy failed")
                .init(),
            snapshot_create_duration: meter
                .f64_histogram("snapshot_create_duration_seconds")
                .with_description("`create_snapshot` duration in seconds")
                .init(),
            snapshot_restore_duration: meter
                .f64_histogram("snapshot_restore_duration_seconds")
                .with_description("`restore_snapshot` duration in seconds")
                .init(),
            snapshot_failures: meter
                .u64_counter("snapshot_failures_total")
                .with_description("failed snapshot creates and restores by error kind")
                .init(),
            heartbeat_failures: meter
                .u64_counter("heartbeat_failures_total")
                .with_description("workers declared failed after heartbeat silence")
                .init(),
            warm_pool_acquire: meter
                .u64_counter("warm_pool_acquire_total")
                .with_description("warm pool acquisitions by outcome")
                .init(),
        }
    }
}

pub(crate) fn label(key: &'static str, value: impl Into<String>) -> [KeyValue; 1] {
    [KeyValue::new(key, value.into())]
}
