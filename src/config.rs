//! Engine configuration.
//!
//! Every option has a default, so an empty JSON object is a valid
//! config. Environment variables prefixed `SPOTGUARD_` override
//! whatever was loaded from file.

use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::errors::EngineError;
use crate::errors::Result;
use crate::model::ResourceClass;
use crate::tracing::parse_log_level;
use crate::tracing::OtlpTracingConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(rename = "heartbeat_timeout_secs", with = "crate::serde::duration_secs")]
    pub heartbeat_timeout: Duration,
    #[serde(rename = "scan_interval_secs", with = "crate::serde::duration_secs")]
    pub scan_interval: Duration,

    #[serde(rename = "snapshot_interval_secs", with = "crate::serde::duration_secs")]
    pub snapshot_interval: Duration,
    /// Paths archived by scheduled snapshots.
    pub snapshot_paths: Vec<String>,
    pub snapshot_bucket: String,
    /// How often the scheduler checks for due schedules.
    #[serde(rename = "scheduler_tick_secs", with = "crate::serde::duration_secs")]
    pub scheduler_tick: Duration,
    pub circuit_breaker_threshold: u32,

    pub race_candidates: usize,
    #[serde(rename = "race_timeout_secs", with = "crate::serde::duration_secs")]
    pub race_timeout: Duration,
    #[serde(rename = "race_poll_interval_secs", with = "crate::serde::duration_secs")]
    pub race_poll_interval: Duration,
    /// Upper bound on offer price for race candidates.
    pub max_price: Option<f64>,

    #[serde(rename = "pool_acquire_timeout_secs", with = "crate::serde::duration_secs")]
    pub pool_acquire_timeout: Duration,
    pub pool_min_ready: usize,
    pub pool_max_ready: usize,
    /// Resource classes the replenish loop keeps stocked.
    pub pool_classes: Vec<ResourceClass>,
    #[serde(rename = "replenish_interval_secs", with = "crate::serde::duration_secs")]
    pub replenish_interval: Duration,
    /// How often leaked workers are retried for destruction.
    #[serde(rename = "leak_sweep_interval_secs", with = "crate::serde::duration_secs")]
    pub leak_sweep_interval: Duration,

    pub retry_attempts: u32,
    #[serde(rename = "retry_base_backoff_ms", with = "crate::serde::duration_millis")]
    pub retry_base_backoff: Duration,
    #[serde(rename = "retry_max_backoff_ms", with = "crate::serde::duration_millis")]
    pub retry_max_backoff: Duration,
    #[serde(rename = "rate_limit_backoff_ms", with = "crate::serde::duration_millis")]
    pub rate_limit_backoff: Duration,
    /// Deadline on any single marketplace, transport or storage call.
    #[serde(rename = "external_call_timeout_secs", with = "crate::serde::duration_secs")]
    pub external_call_timeout: Duration,

    #[serde(rename = "acquire_phase_timeout_secs", with = "crate::serde::duration_secs")]
    pub acquire_phase_timeout: Duration,
    #[serde(rename = "restore_phase_timeout_secs", with = "crate::serde::duration_secs")]
    pub restore_phase_timeout: Duration,
    #[serde(rename = "verify_phase_timeout_secs", with = "crate::serde::duration_secs")]
    pub verify_phase_timeout: Duration,
    /// How long completion waits for the old worker's teardown before
    /// leaving it to finish in the background.
    #[serde(rename = "teardown_grace_secs", with = "crate::serde::duration_secs")]
    pub teardown_grace: Duration,

    pub standby_resource_class: ResourceClass,

    /// `None` keeps records in memory only.
    pub record_store_path: Option<PathBuf>,
    /// `None` disables the reporting API.
    pub api_port: Option<u16>,
    /// One of trace, debug, info, warn, error.
    pub log_level: String,
    /// Export spans to an OpenTelemetry collector.
    pub otlp: Option<OtlpTracingConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(30),
            scan_interval: Duration::from_secs(5),
            snapshot_interval: Duration::from_secs(15 * 60),
            snapshot_paths: vec!["/workspace".to_string()],
            snapshot_bucket: "spotguard-snapshots".to_string(),
            scheduler_tick: Duration::from_secs(30),
            circuit_breaker_threshold: 3,
            race_candidates: 3,
            race_timeout: Duration::from_secs(300),
            race_poll_interval: Duration::from_secs(2),
            max_price: None,
            pool_acquire_timeout: Duration::from_secs(10),
            pool_min_ready: 0,
            pool_max_ready: 0,
            pool_classes: Vec::new(),
            replenish_interval: Duration::from_secs(30),
            leak_sweep_interval: Duration::from_secs(5 * 60),
            retry_attempts: 3,
            retry_base_backoff: Duration::from_millis(500),
            retry_max_backoff: Duration::from_secs(30),
            rate_limit_backoff: Duration::from_secs(5),
            external_call_timeout: Duration::from_secs(60),
            acquire_phase_timeout: Duration::from_secs(600),
            restore_phase_timeout: Duration::from_secs(30 * 60),
            verify_phase_timeout: Duration::from_secs(10 * 60),
            teardown_grace: Duration::from_secs(30),
            standby_resource_class: ResourceClass::from("cpu-small"),
            record_store_path: None,
            api_port: Some(3030),
            log_level: "error".to_string(),
            otlp: None,
        }
    }
}

fn env_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|err| EngineError::Config(format!("unable to parse {name}={raw:?}: {err}"))),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(EngineError::Config(format!("{name}: {err}"))),
    }
}

fn env_secs(name: &str, target: &mut Duration) -> Result<()> {
    if let Some(secs) = env_var::<u64>(name)? {
        *target = Duration::from_secs(secs);
    }
    Ok(())
}

impl EngineConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| EngineError::Config(format!("can't read {path:?}: {err}")))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|err| EngineError::Config(format!("can't parse {path:?}: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by the environment.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `SPOTGUARD_*` overrides in place.
    pub fn apply_env(&mut self) -> Result<()> {
        env_secs("SPOTGUARD_HEARTBEAT_TIMEOUT_SECS", &mut self.heartbeat_timeout)?;
        env_secs("SPOTGUARD_SCAN_INTERVAL_SECS", &mut self.scan_interval)?;
        env_secs("SPOTGUARD_SNAPSHOT_INTERVAL_SECS", &mut self.snapshot_interval)?;
        env_secs("SPOTGUARD_RACE_TIMEOUT_SECS", &mut self.race_timeout)?;
        env_secs(
            "SPOTGUARD_POOL_ACQUIRE_TIMEOUT_SECS",
            &mut self.pool_acquire_timeout,
        )?;
        if let Some(n) = env_var("SPOTGUARD_CIRCUIT_BREAKER_THRESHOLD")? {
            self.circuit_breaker_threshold = n;
        }
        if let Some(n) = env_var("SPOTGUARD_RACE_CANDIDATES")? {
            self.race_candidates = n;
        }
        if let Some(n) = env_var("SPOTGUARD_POOL_MIN_READY")? {
            self.pool_min_ready = n;
        }
        if let Some(n) = env_var("SPOTGUARD_POOL_MAX_READY")? {
            self.pool_max_ready = n;
        }
        if let Some(port) = env_var("SPOTGUARD_API_PORT")? {
            self.api_port = Some(port);
        }
        if let Some(path) = env_var::<PathBuf>("SPOTGUARD_RECORD_STORE")? {
            self.record_store_path = Some(path);
        }
        if let Some(level) = env_var("SPOTGUARD_LOG_LEVEL")? {
            self.log_level = level;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("heartbeat_timeout", self.heartbeat_timeout),
            ("scan_interval", self.scan_interval),
            ("snapshot_interval", self.snapshot_interval),
            ("scheduler_tick", self.scheduler_tick),
            ("race_timeout", self.race_timeout),
            ("race_poll_interval", self.race_poll_interval),
            ("replenish_interval", self.replenish_interval),
            ("leak_sweep_interval", self.leak_sweep_interval),
            ("external_call_timeout", self.external_call_timeout),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, d)| d.is_zero()) {
            return Err(EngineError::Config(format!("{name} must be non-zero")));
        }
        if self.race_candidates == 0 {
            return Err(EngineError::Config(
                "race_candidates must be at least 1".to_string(),
            ));
        }
        if self.circuit_breaker_threshold == 0 {
            return Err(EngineError::Config(
                "circuit_breaker_threshold must be at least 1".to_string(),
            ));
        }
        if self.retry_attempts == 0 {
            return Err(EngineError::Config(
                "retry_attempts must be at least 1".to_string(),
            ));
        }
        if self.pool_min_ready > self.pool_max_ready {
            return Err(EngineError::Config(format!(
                "pool_min_ready ({}) exceeds pool_max_ready ({})",
                self.pool_min_ready, self.pool_max_ready
            )));
        }
        if self.max_price.map_or(false, |p| !(p > 0.0)) {
            return Err(EngineError::Config("max_price must be positive".to_string()));
        }
        if let Some(relative) = self.snapshot_paths.iter().find(|p| !p.starts_with('/')) {
            return Err(EngineError::Config(format!(
                "snapshot path {relative:?} is not absolute"
            )));
        }
        parse_log_level(&self.log_level)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_is_all_defaults() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(30));
        assert_eq!(config.scan_interval, Duration::from_secs(5));
        assert_eq!(config.snapshot_interval, Duration::from_secs(900));
        assert_eq!(config.circuit_breaker_threshold, 3);
        config.validate().unwrap();
    }

    #[test]
    fn json_overrides_by_wire_name() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"heartbeat_timeout_secs": 12, "retry_base_backoff_ms": 250, "pool_min_ready": 1, "pool_max_ready": 2, "pool_classes": ["a100"]}"#,
        )
        .unwrap();
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(12));
        assert_eq!(config.retry_base_backoff, Duration::from_millis(250));
        assert_eq!(config.pool_classes, vec![ResourceClass::from("a100")]);
        config.validate().unwrap();
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(serde_json::from_str::<EngineConfig>(r#"{"heartbeat_timeout": 12}"#).is_err());
    }

    #[test]
    fn validate_rejects_bad_bounds() {
        let mut config = EngineConfig {
            pool_min_ready: 3,
            pool_max_ready: 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        config.pool_max_ready = 3;
        config.validate().unwrap();
        config.scan_interval = Duration::ZERO;
        assert!(config.validate().is_err());
        config.scan_interval = Duration::from_secs(1);
        config.race_candidates = 0;
        assert!(config.validate().is_err());
        config.race_candidates = 2;
        config.log_level = "chatty".to_string();
        assert!(config.validate().is_err());
        config.log_level = "info".to_string();
        config.snapshot_paths = vec!["workspace".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn otlp_section_is_optional() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"otlp": {"service_name": "spotguard", "url": "http://collector:4317"}}"#,
        )
        .unwrap();
        let otlp = config.otlp.unwrap();
        assert_eq!(otlp.url.as_deref(), Some("http://collector:4317"));
        assert_eq!(otlp.sampling_ratio, 1.0);
    }
}
