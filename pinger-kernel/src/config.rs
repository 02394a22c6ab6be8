//! Static collector configuration.
//!
//! Loaded once at startup from a YAML file (`PINGER_CONFIG`, default
//! `pinger.yaml`). Every tunable has a default so an empty or missing file
//! yields a runnable collector.

use serde::{Deserialize, Serialize};
use std::{path::Path, path::PathBuf, time::Duration};
use tokio::fs;

pub const CONCURRENCY_MIN: usize = 10;
pub const CONCURRENCY_MAX: usize = 100;
pub const CONCURRENCY_STEP: usize = 5;
pub const CONCURRENCY_INITIAL: usize = 50;
pub const CONCURRENCY_HISTORY_SIZE: usize = 5;
pub const CONCURRENCY_SLOW_THRESHOLD_SECS: f64 = 30.0;
pub const CONCURRENCY_FAST_THRESHOLD_SECS: f64 = 10.0;

pub const INTERVAL_STABLE_SECS: u64 = 60;
pub const INTERVAL_UNSTABLE_SECS: u64 = 30;
pub const INTERVAL_CRITICAL_SECS: u64 = 15;
pub const OFFLINE_CRITICAL_THRESHOLD: usize = 5;
pub const STABLE_CYCLES_REQUIRED: u32 = 3;

pub const SMART_LOG_INTERVAL_SECS: u64 = 300;
pub const LATENCY_CHANGE_THRESHOLD_MS: u32 = 20;
pub const LOG_BUFFER_SIZE: usize = 100;
pub const LOG_BUFFER_MAX_AGE_SECS: u64 = 30;

pub const CONFIG_CACHE_TTL_SECS: u64 = 60;
pub const NOTIFY_QUEUE_SIZE: usize = 1024;
pub const HEALTH_CHECK_PORT: u16 = 8081;
pub const HEALTH_CHECK_MAX_AGE_SECS: u64 = 180;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("invalid YAML in {path}: {source}")]
    Parse { path: PathBuf, source: serde_yaml::Error },
    #[error("invalid tunables: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PingerConfig {
    pub concurrency: ConcurrencyConf,
    pub interval: IntervalConf,
    pub smart_log: SmartLogConf,
    pub probe: ProbeConf,
    pub health: HealthConf,
    pub supervisor: SupervisorConf,
    pub sources: SourcesConf,
    pub notify: NotifyConf,
    pub mqtt: Option<MqttConf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConf {
    pub min: usize,
    pub max: usize,
    pub step: usize,
    pub initial: usize,
    pub history_size: usize,
    pub slow_threshold_secs: f64,
    pub fast_threshold_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntervalConf {
    pub stable_secs: u64,
    pub unstable_secs: u64,
    pub critical_secs: u64,
    pub offline_critical_threshold: usize,
    pub stable_cycles_required: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmartLogConf {
    pub interval_secs: u64,
    pub latency_change_threshold_ms: u32,
    pub buffer_size: usize,
    pub buffer_max_age_secs: u64,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    pub signal_tolerance_db: i32,
    pub ccq_tolerance: u32,
    /// Whether `unknown -> up/down` on first sighting counts as a transition.
    pub notify_first_observation: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConf {
    pub icmp_timeout_ms: u64,
    pub icmp_retries: u32,
    pub snmp_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConf {
    pub port: u16,
    pub max_age_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConf {
    pub shutdown_grace_secs: u64,
    pub registry_failure_limit: u32,
    pub config_cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConf {
    pub devices_file: PathBuf,
    pub settings_file: PathBuf,
    pub ping_log_file: PathBuf,
    pub metric_log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConf {
    pub telegram_api_url: String,
    pub whatsapp_api_url: Option<String>,
    pub timeout_secs: u64,
    /// Per-transport backlog of undelivered events.
    pub queue_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
}

impl Default for PingerConfig {
    fn default() -> Self {
        Self {
            concurrency: ConcurrencyConf::default(),
            interval: IntervalConf::default(),
            smart_log: SmartLogConf::default(),
            probe: ProbeConf::default(),
            health: HealthConf::default(),
            supervisor: SupervisorConf::default(),
            sources: SourcesConf::default(),
            notify: NotifyConf::default(),
            mqtt: None,
        }
    }
}

impl Default for ConcurrencyConf {
    fn default() -> Self {
        Self {
            min: CONCURRENCY_MIN,
            max: CONCURRENCY_MAX,
            step: CONCURRENCY_STEP,
            initial: CONCURRENCY_INITIAL,
            history_size: CONCURRENCY_HISTORY_SIZE,
            slow_threshold_secs: CONCURRENCY_SLOW_THRESHOLD_SECS,
            fast_threshold_secs: CONCURRENCY_FAST_THRESHOLD_SECS,
        }
    }
}

impl Default for IntervalConf {
    fn default() -> Self {
        Self {
            stable_secs: INTERVAL_STABLE_SECS,
            unstable_secs: INTERVAL_UNSTABLE_SECS,
            critical_secs: INTERVAL_CRITICAL_SECS,
            offline_critical_threshold: OFFLINE_CRITICAL_THRESHOLD,
            stable_cycles_required: STABLE_CYCLES_REQUIRED,
        }
    }
}

impl Default for SmartLogConf {
    fn default() -> Self {
        Self {
            interval_secs: SMART_LOG_INTERVAL_SECS,
            latency_change_threshold_ms: LATENCY_CHANGE_THRESHOLD_MS,
            buffer_size: LOG_BUFFER_SIZE,
            buffer_max_age_secs: LOG_BUFFER_MAX_AGE_SECS,
            backoff_base_secs: 1,
            backoff_max_secs: 60,
            signal_tolerance_db: 3,
            ccq_tolerance: 5,
            notify_first_observation: false,
        }
    }
}

impl Default for ProbeConf {
    fn default() -> Self {
        Self { icmp_timeout_ms: 2_000, icmp_retries: 2, snmp_timeout_ms: 2_000 }
    }
}

impl Default for HealthConf {
    fn default() -> Self {
        Self { port: HEALTH_CHECK_PORT, max_age_secs: HEALTH_CHECK_MAX_AGE_SECS }
    }
}

impl Default for SupervisorConf {
    fn default() -> Self {
        Self {
            shutdown_grace_secs: 10,
            registry_failure_limit: 5,
            config_cache_ttl_secs: CONFIG_CACHE_TTL_SECS,
        }
    }
}

impl Default for SourcesConf {
    fn default() -> Self {
        Self {
            devices_file: "devices.yaml".into(),
            settings_file: "settings.yaml".into(),
            ping_log_file: "./data/ping_log.jsonl".into(),
            metric_log_file: Some("./data/metrics.jsonl".into()),
        }
    }
}

impl Default for NotifyConf {
    fn default() -> Self {
        Self {
            telegram_api_url: "https://api.telegram.org".into(),
            whatsapp_api_url: None,
            timeout_secs: 10,
            queue_size: NOTIFY_QUEUE_SIZE,
        }
    }
}

impl ConcurrencyConf {
    pub fn slow_threshold(&self) -> Duration {
        Duration::from_secs_f64(self.slow_threshold_secs)
    }

    pub fn fast_threshold(&self) -> Duration {
        Duration::from_secs_f64(self.fast_threshold_secs)
    }
}

impl PingerConfig {
    /// Rejects tunables the governors cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.concurrency;
        if c.min == 0 || c.min > c.max {
            return Err(ConfigError::Invalid(format!("concurrency min {} / max {}", c.min, c.max)));
        }
        if c.step == 0 {
            return Err(ConfigError::Invalid("concurrency step must be > 0".into()));
        }
        if c.history_size == 0 {
            return Err(ConfigError::Invalid("concurrency history_size must be > 0".into()));
        }
        if !(c.fast_threshold_secs >= 0.0 && c.fast_threshold_secs < c.slow_threshold_secs) {
            return Err(ConfigError::Invalid(format!(
                "fast threshold {}s must be below slow threshold {}s",
                c.fast_threshold_secs, c.slow_threshold_secs
            )));
        }
        let i = &self.interval;
        if i.stable_secs == 0 || i.unstable_secs == 0 || i.critical_secs == 0 {
            return Err(ConfigError::Invalid("intervals must be > 0".into()));
        }
        if i.offline_critical_threshold == 0 {
            return Err(ConfigError::Invalid("offline_critical_threshold must be > 0".into()));
        }
        let s = &self.smart_log;
        if s.buffer_size == 0 || s.buffer_max_age_secs == 0 {
            return Err(ConfigError::Invalid("log buffer size and max age must be > 0".into()));
        }
        if s.backoff_base_secs == 0 || s.backoff_base_secs > s.backoff_max_secs {
            return Err(ConfigError::Invalid("backoff base must be in 1..=backoff_max".into()));
        }
        if self.probe.icmp_retries == 0 {
            return Err(ConfigError::Invalid("icmp_retries must be > 0".into()));
        }
        if self.notify.queue_size == 0 {
            return Err(ConfigError::Invalid("notify queue_size must be > 0".into()));
        }
        Ok(())
    }
}

pub fn config_path() -> PathBuf {
    std::env::var("PINGER_CONFIG").unwrap_or_else(|_| "pinger.yaml".into()).into()
}

/// Missing file falls back to defaults; an unreadable or invalid file is an error.
pub async fn load_config(path: &Path) -> Result<PingerConfig, ConfigError> {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "no config file, using defaults");
        return Ok(PingerConfig::default());
    }
    let txt = fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
    if txt.trim().is_empty() {
        return Ok(PingerConfig::default());
    }
    let cfg: PingerConfig = serde_yaml::from_str(&txt)
        .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
    cfg.validate()?;
    Ok(cfg)
}
