//! Engine Configuration - every tunable as a TOML value
//!
//! Each section implements `Default` with the deployment defaults from
//! [`defaults`](super::defaults), so the engine runs unchanged when no config
//! file is present.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use super::defaults;
use crate::detection::{BandRegistry, DeviceBand};
use crate::types::{EventTime, MILLIS_PER_SEC};
use crate::window::{WindowSpec, WindowSpecError};

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "REACTOR_SAGA_CONFIG";

/// Config file looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "reactor_saga.toml";

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration.
///
/// Load with `EngineConfig::load()` which searches:
/// 1. `$REACTOR_SAGA_CONFIG`
/// 2. `./reactor_saga.toml`
/// 3. Built-in defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Broker endpoints and topic names
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Lane count, queues, redelivery and offset commits
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Hopping window geometry
    #[serde(default)]
    pub window: WindowConfig,

    /// Nominal bands per device class
    #[serde(default)]
    pub detection: DetectionConfig,

    /// Saga initiation
    #[serde(default)]
    pub saga: SagaConfig,

    /// Durable store
    #[serde(default)]
    pub sink: SinkConfig,

    /// HTTP server
    #[serde(default)]
    pub server: ServerConfig,
}

impl EngineConfig {
    /// Load configuration using the standard search order, falling back to
    /// defaults when a file is missing or invalid.
    pub fn load() -> Self {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), "Loaded engine config from {CONFIG_ENV_VAR}");
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from {CONFIG_ENV_VAR}, falling back");
                    }
                }
            } else {
                warn!(path = %path, "{CONFIG_ENV_VAR} points to non-existent file, falling back");
            }
        }

        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!("Loaded engine config from ./{LOCAL_CONFIG_FILE}");
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./{LOCAL_CONFIG_FILE}, using defaults");
                }
            }
        }

        info!("No {LOCAL_CONFIG_FILE} found, using built-in defaults");
        Self::default()
    }

    /// Load from a specific TOML file path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Self::from_toml_str(&contents).map_err(|e| match e {
            ConfigError::Parse(_, inner) => ConfigError::Parse(path.to_path_buf(), inner),
            other => other,
        })
    }

    /// Parse and validate a TOML document. Unknown keys are logged as
    /// warnings, never rejected.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        for w in super::validation::validate_unknown_keys(contents) {
            warn!("{}", w);
        }
        let config: Self =
            toml::from_str(contents).map_err(|e| ConfigError::Parse(PathBuf::new(), e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Validate all sections, collecting every problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.broker.telemetry_endpoint.trim().is_empty() {
            errors.push("broker.telemetry_endpoint must not be empty".to_string());
        }
        if self.broker.command_endpoint.trim().is_empty() {
            errors.push("broker.command_endpoint must not be empty".to_string());
        }

        let rt = &self.runtime;
        if rt.partition_count == 0 {
            errors.push("runtime.partition_count must be >= 1".to_string());
        }
        if rt.lane_queue_capacity == 0 {
            errors.push("runtime.lane_queue_capacity must be >= 1".to_string());
        }
        if rt.max_delivery_attempts == 0 {
            errors.push("runtime.max_delivery_attempts must be >= 1".to_string());
        }
        if rt.commit_interval_ms == 0 {
            errors.push("runtime.commit_interval_ms must be > 0".to_string());
        }

        if let Err(e) = self.window_spec() {
            errors.push(format!("window: {e}"));
        }

        if self.saga.cooldown_secs == Some(0) {
            errors.push("saga.cooldown_secs must be > 0".to_string());
        }

        self.validate_detection(&mut errors);

        if self.sink.write_timeout_ms == 0 {
            errors.push("sink.write_timeout_ms must be > 0".to_string());
        }
        if self.sink.path.as_os_str().is_empty() {
            errors.push("sink.path must not be empty".to_string());
        }

        if self.server.addr.parse::<SocketAddr>().is_err() {
            errors.push(format!(
                "server.addr = '{}' is not a valid socket address",
                self.server.addr
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    fn validate_detection(&self, errors: &mut Vec<String>) {
        let detection = &self.detection;
        if !detection.classes.contains_key(&detection.default_class) {
            errors.push(format!(
                "detection.default_class '{}' is not defined under [detection.classes]",
                detection.default_class
            ));
        }

        let mut seen_prefixes = HashSet::new();
        for (name, class) in &detection.classes {
            if !class.nominal.is_finite() || class.nominal <= 0.0 {
                errors.push(format!(
                    "detection.classes.{name}.nominal = {} must be finite and > 0",
                    class.nominal
                ));
            }
            if !class.tolerance_fraction.is_finite()
                || class.tolerance_fraction <= 0.0
                || class.tolerance_fraction >= 1.0
            {
                errors.push(format!(
                    "detection.classes.{name}.tolerance_fraction = {} must be in (0, 1)",
                    class.tolerance_fraction
                ));
            }
            for prefix in &class.device_prefixes {
                if prefix.is_empty() {
                    errors.push(format!("detection.classes.{name}: empty device prefix"));
                } else if !seen_prefixes.insert(prefix.as_str()) {
                    errors.push(format!(
                        "detection.classes.{name}: prefix '{prefix}' is claimed by more than one class"
                    ));
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Derived values
    // ------------------------------------------------------------------------

    pub fn window_spec(&self) -> Result<WindowSpec, WindowSpecError> {
        let w = &self.window;
        let lateness = w.allowed_lateness_secs.unwrap_or(w.size_secs);
        WindowSpec::with_lateness(
            secs_to_millis(w.size_secs),
            secs_to_millis(w.step_secs),
            secs_to_millis(lateness),
        )
    }

    /// Saga cooldown in event-time milliseconds; defaults to the window size.
    pub fn cooldown_ms(&self) -> EventTime {
        secs_to_millis(self.saga.cooldown_secs.unwrap_or(self.window.size_secs))
    }

    /// Build the band registry. Falls back to the built-in band if the
    /// default class is missing (rejected by `validate`).
    pub fn band_registry(&self) -> BandRegistry {
        let detection = &self.detection;
        let default_band = detection.classes.get(&detection.default_class).map_or_else(
            || {
                DeviceBand::new(
                    defaults::DEFAULT_DEVICE_CLASS,
                    defaults::NOMINAL_POWER_MW,
                    defaults::TOLERANCE_FRACTION,
                )
            },
            |class| class.band(&detection.default_class),
        );

        detection
            .classes
            .iter()
            .fold(BandRegistry::new(default_band), |registry, (name, class)| {
                registry.with_class(class.band(name), class.device_prefixes.iter().cloned())
            })
    }

    pub fn sink_write_timeout(&self) -> Duration {
        Duration::from_millis(self.sink.write_timeout_ms)
    }
}

fn secs_to_millis(secs: u64) -> EventTime {
    EventTime::try_from(secs)
        .unwrap_or(EventTime::MAX)
        .saturating_mul(MILLIS_PER_SEC)
}

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config I/O error ({0:?}): {1}")]
    Io(PathBuf, std::io::Error),

    #[error("config parse error ({0:?}): {1}")]
    Parse(PathBuf, toml::de::Error),

    #[error("config serialization error: {0}")]
    Serialize(toml::ser::Error),

    #[error("config validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),
}

// ============================================================================
// Broker
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// `host:port` streaming inbound readings as JSON lines
    #[serde(default = "default_telemetry_endpoint")]
    pub telemetry_endpoint: String,

    /// `host:port` accepting outbound commands as JSON lines
    #[serde(default = "default_command_endpoint")]
    pub command_endpoint: String,

    #[serde(default = "default_telemetry_topic")]
    pub telemetry_topic: String,

    #[serde(default = "default_command_topic")]
    pub command_topic: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            telemetry_endpoint: default_telemetry_endpoint(),
            command_endpoint: default_command_endpoint(),
            telemetry_topic: default_telemetry_topic(),
            command_topic: default_command_topic(),
        }
    }
}

fn default_telemetry_endpoint() -> String {
    defaults::TELEMETRY_ENDPOINT.to_string()
}
fn default_command_endpoint() -> String {
    defaults::COMMAND_ENDPOINT.to_string()
}
fn default_telemetry_topic() -> String {
    defaults::TELEMETRY_TOPIC.to_string()
}
fn default_command_topic() -> String {
    defaults::COMMAND_TOPIC.to_string()
}

// ============================================================================
// Runtime
// ============================================================================

/// What `submit` does when a lane queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Wait for capacity.
    #[default]
    Block,
    /// Fail immediately; the delivery stays unacknowledged.
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_partition_count")]
    pub partition_count: usize,

    #[serde(default = "default_lane_queue_capacity")]
    pub lane_queue_capacity: usize,

    #[serde(default)]
    pub backpressure: BackpressurePolicy,

    /// In-lane attempts for a reading whose command emission fails
    #[serde(default = "default_max_delivery_attempts")]
    pub max_delivery_attempts: u32,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_commit_interval_ms")]
    pub commit_interval_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            partition_count: default_partition_count(),
            lane_queue_capacity: default_lane_queue_capacity(),
            backpressure: BackpressurePolicy::default(),
            max_delivery_attempts: default_max_delivery_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            commit_interval_ms: default_commit_interval_ms(),
        }
    }
}

fn default_partition_count() -> usize { defaults::PARTITION_COUNT }
fn default_lane_queue_capacity() -> usize { defaults::LANE_QUEUE_CAPACITY }
fn default_max_delivery_attempts() -> u32 { defaults::MAX_DELIVERY_ATTEMPTS }
fn default_retry_backoff_ms() -> u64 { defaults::RETRY_BACKOFF_MS }
fn default_commit_interval_ms() -> u64 { defaults::COMMIT_INTERVAL_MS }

// ============================================================================
// Window
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    #[serde(default = "default_window_size_secs")]
    pub size_secs: u64,

    #[serde(default = "default_window_step_secs")]
    pub step_secs: u64,

    /// How long after `window_end` a bucket still accepts late readings.
    /// Unset means one window size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_lateness_secs: Option<u64>,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            size_secs: default_window_size_secs(),
            step_secs: default_window_step_secs(),
            allowed_lateness_secs: None,
        }
    }
}

fn default_window_size_secs() -> u64 { defaults::WINDOW_SIZE_SECS }
fn default_window_step_secs() -> u64 { defaults::WINDOW_STEP_SECS }

// ============================================================================
// Detection
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Class applied to devices matching no prefix
    #[serde(default = "default_device_class")]
    pub default_class: String,

    #[serde(default = "default_classes")]
    pub classes: BTreeMap<String, DeviceClassConfig>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            default_class: default_device_class(),
            classes: default_classes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceClassConfig {
    pub nominal: f64,

    #[serde(default = "default_tolerance_fraction")]
    pub tolerance_fraction: f64,

    /// Device ids starting with any of these belong to the class
    #[serde(default)]
    pub device_prefixes: Vec<String>,
}

impl DeviceClassConfig {
    fn band(&self, name: &str) -> DeviceBand {
        DeviceBand::new(name, self.nominal, self.tolerance_fraction)
    }
}

fn default_device_class() -> String {
    defaults::DEFAULT_DEVICE_CLASS.to_string()
}
fn default_tolerance_fraction() -> f64 {
    defaults::TOLERANCE_FRACTION
}
fn default_classes() -> BTreeMap<String, DeviceClassConfig> {
    let mut classes = BTreeMap::new();
    classes.insert(
        defaults::DEFAULT_DEVICE_CLASS.to_string(),
        DeviceClassConfig {
            nominal: defaults::NOMINAL_POWER_MW,
            tolerance_fraction: defaults::TOLERANCE_FRACTION,
            device_prefixes: Vec::new(),
        },
    );
    classes
}

// ============================================================================
// Saga
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SagaConfig {
    /// Event-time cooldown after a STARTED saga. Unset means one window size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_secs: Option<u64>,
}

// ============================================================================
// Sink
// ============================================================================

/// When aggregate rows are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateWritePolicy {
    /// Upsert every bucket a reading touches.
    #[default]
    EveryUpdate,
    /// Write each bucket once, when it is evicted.
    OnClose,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Keyspace directory
    #[serde(default = "default_sink_path")]
    pub path: PathBuf,

    #[serde(default = "default_sink_write_timeout_ms")]
    pub write_timeout_ms: u64,

    #[serde(default)]
    pub aggregate_writes: AggregateWritePolicy,

    /// Create the schema on startup instead of failing when it is missing
    #[serde(default)]
    pub create_schema: bool,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            path: default_sink_path(),
            write_timeout_ms: default_sink_write_timeout_ms(),
            aggregate_writes: AggregateWritePolicy::default(),
            create_schema: false,
        }
    }
}

fn default_sink_path() -> PathBuf {
    PathBuf::from(defaults::SINK_PATH)
}
fn default_sink_write_timeout_ms() -> u64 {
    defaults::SINK_WRITE_TIMEOUT_MS
}

// ============================================================================
// Server
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_addr")]
    pub addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_server_addr(),
        }
    }
}

fn default_server_addr() -> String {
    defaults::SERVER_ADDR.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        let spec = config.window_spec().unwrap();
        assert_eq!(spec.size(), 300_000);
        assert_eq!(spec.step(), 60_000);
        assert_eq!(spec.allowed_lateness(), 300_000);
        assert_eq!(config.cooldown_ms(), 300_000);
        assert_eq!(config.runtime.partition_count, 3);
    }

    #[test]
    fn default_band_is_980_at_five_percent() {
        let registry = EngineConfig::default().band_registry();
        let band = registry.band_for("Rivne-3");
        assert_eq!(band.class, "vver-1000");
        assert!((band.nominal - 980.0).abs() < f64::EPSILON);
        assert!((band.tolerance_fraction - 0.05).abs() < f64::EPSILON);
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
[runtime]
partition_count = 8
backpressure = "reject"

[saga]
cooldown_secs = 30
"#,
        )
        .unwrap();
        assert_eq!(config.runtime.partition_count, 8);
        assert_eq!(config.runtime.backpressure, BackpressurePolicy::Reject);
        assert_eq!(config.runtime.lane_queue_capacity, defaults::LANE_QUEUE_CAPACITY);
        assert_eq!(config.cooldown_ms(), 30_000);
        assert_eq!(config.sink.aggregate_writes, AggregateWritePolicy::EveryUpdate);
    }

    #[test]
    fn collects_every_validation_error() {
        let mut config = EngineConfig::default();
        config.runtime.partition_count = 0;
        config.window.step_secs = 70;
        config.detection.default_class = "missing".to_string();
        config.server.addr = "nowhere".to_string();

        let Err(ConfigError::Validation(errors)) = config.validate() else {
            panic!("expected validation errors");
        };
        assert_eq!(errors.len(), 4, "{errors:?}");
    }

    #[test]
    fn rejects_prefix_claimed_twice() {
        let result = EngineConfig::from_toml_str(
            r#"
[detection.classes.a]
nominal = 950.0
device_prefixes = ["ZAP-"]

[detection.classes.b]
nominal = 1000.0
device_prefixes = ["ZAP-"]
"#,
        );
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn toml_round_trip_preserves_classes() {
        let config = EngineConfig::default();
        let text = config.to_toml().unwrap();
        let parsed = EngineConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed.detection.classes.len(), 1);
        assert_eq!(parsed.detection.default_class, "vver-1000");
    }
}
