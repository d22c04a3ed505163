//! System-wide default constants.
//!
//! Grouped by subsystem. Values that operators tune live in
//! [`EngineConfig`](super::EngineConfig); these are the built-in fallbacks
//! and the transport constants that are not exposed as config keys.

// ============================================================================
// Broker
// ============================================================================

/// Topic carrying inbound telemetry readings.
pub const TELEMETRY_TOPIC: &str = "telemetry-raw";

/// Topic receiving outbound saga commands.
pub const COMMAND_TOPIC: &str = "saga-load-command";

/// Default telemetry endpoint (line-delimited JSON over TCP).
pub const TELEMETRY_ENDPOINT: &str = "127.0.0.1:9092";

/// Default command endpoint (line-delimited JSON over TCP).
pub const COMMAND_ENDPOINT: &str = "127.0.0.1:9093";

/// TCP connect timeout (seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Read timeout on the telemetry stream before forcing a reconnect (seconds).
pub const READ_TIMEOUT_SECS: u64 = 120;

/// Reconnect attempts before the telemetry source gives up.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// First reconnect delay; doubles per attempt (milliseconds).
pub const INITIAL_RECONNECT_DELAY_MS: u64 = 500;

/// Cap on the reconnect delay (milliseconds).
pub const MAX_RECONNECT_DELAY_MS: u64 = 30_000;

/// Idle time before TCP keepalive probes start (seconds).
pub const TCP_KEEPALIVE_TIME_SECS: u64 = 30;

/// Interval between TCP keepalive probes (seconds).
pub const TCP_KEEPALIVE_INTERVAL_SECS: u64 = 10;

// ============================================================================
// Runtime
// ============================================================================

/// Number of processing lanes (matches the topic partition count).
pub const PARTITION_COUNT: usize = 3;

/// Bounded queue depth per lane.
pub const LANE_QUEUE_CAPACITY: usize = 1_024;

/// In-lane delivery attempts for a reading whose command emission fails.
pub const MAX_DELIVERY_ATTEMPTS: u32 = 5;

/// First in-lane retry delay; doubles per attempt (milliseconds).
pub const RETRY_BACKOFF_MS: u64 = 200;

/// How often the committed offset is persisted (milliseconds).
pub const COMMIT_INTERVAL_MS: u64 = 1_000;

// ============================================================================
// Windowing
// ============================================================================

/// Hopping window size (seconds). 300 = 5 minutes.
pub const WINDOW_SIZE_SECS: u64 = 300;

/// Hopping window step (seconds). 60 = 1 minute.
pub const WINDOW_STEP_SECS: u64 = 60;

// ============================================================================
// Detection
// ============================================================================

/// Class applied to devices that match no configured prefix.
pub const DEFAULT_DEVICE_CLASS: &str = "vver-1000";

/// Nominal electrical output of a VVER-1000 unit (MW).
pub const NOMINAL_POWER_MW: f64 = 980.0;

/// Allowed deviation as a fraction of nominal.
pub const TOLERANCE_FRACTION: f64 = 0.05;

// ============================================================================
// Sink
// ============================================================================

/// Keyspace location for the sled store.
pub const SINK_PATH: &str = "./data/energy_monitoring";

/// Upper bound on a single sink write (milliseconds).
pub const SINK_WRITE_TIMEOUT_MS: u64 = 2_000;

/// Table of per-window aggregates.
pub const AGGREGATES_TABLE: &str = "load_following_aggregates";

/// Append-only saga step log.
pub const SAGA_LOG_TABLE: &str = "saga_log";

/// Committed consumer offsets per source.
pub const OFFSETS_TABLE: &str = "consumer_offsets";

/// Schema marker tree.
pub const SCHEMA_TABLE: &str = "__schema";

/// Current on-disk schema version.
pub const SCHEMA_VERSION: u32 = 1;

// ============================================================================
// Server
// ============================================================================

/// HTTP listen address for health and metrics.
pub const SERVER_ADDR: &str = "0.0.0.0:8080";

// ============================================================================
// Simulation
// ============================================================================

/// Reactors emitted by the simulator.
pub const SIMULATED_DEVICES: [&str; 4] = ["Rivne-3", "Rivne-4", "ZAP-5", "ZAP-6"];

/// Interval between simulated readings per device (milliseconds).
pub const SIMULATION_INTERVAL_MS: u64 = 10_000;
