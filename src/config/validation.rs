//! Config validation: unknown-key detection with Levenshtein suggestions.
//!
//! The raw TOML is walked as a `toml::Value` tree before serde sees it, and
//! every dotted key path is compared against the known layout. Unknown keys
//! produce warnings with a "did you mean?" suggestion; they never fail a load.

use std::collections::HashSet;

/// A non-fatal config warning (typo, unknown section).
#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
    pub suggestion: Option<String>,
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(ref s) = self.suggestion {
            write!(f, " (did you mean '{s}'?)")?;
        }
        Ok(())
    }
}

/// Placeholder segment for user-named device classes.
const CLASS_WILDCARD: &str = "*";

// ============================================================================
// Known Config Keys
// ============================================================================

/// Every valid dotted key path of `EngineConfig`.
///
/// Device class names are user-chosen, so they appear as `*`. Keep in sync
/// with engine_config.rs.
pub fn known_config_keys() -> HashSet<&'static str> {
    let keys: &[&str] = &[
        // [broker]
        "broker",
        "broker.telemetry_endpoint",
        "broker.command_endpoint",
        "broker.telemetry_topic",
        "broker.command_topic",
        // [runtime]
        "runtime",
        "runtime.partition_count",
        "runtime.lane_queue_capacity",
        "runtime.backpressure",
        "runtime.max_delivery_attempts",
        "runtime.retry_backoff_ms",
        "runtime.commit_interval_ms",
        // [window]
        "window",
        "window.size_secs",
        "window.step_secs",
        "window.allowed_lateness_secs",
        // [detection]
        "detection",
        "detection.default_class",
        "detection.classes",
        "detection.classes.*",
        "detection.classes.*.nominal",
        "detection.classes.*.tolerance_fraction",
        "detection.classes.*.device_prefixes",
        // [saga]
        "saga",
        "saga.cooldown_secs",
        // [sink]
        "sink",
        "sink.path",
        "sink.write_timeout_ms",
        "sink.aggregate_writes",
        "sink.create_schema",
        // [server]
        "server",
        "server.addr",
    ];
    keys.iter().copied().collect()
}

// ============================================================================
// TOML Key Walking
// ============================================================================

/// Recursively walks a `toml::Value` tree and collects all dotted key paths.
///
/// A table `{ a = { b = 1, c = 2 } }` yields `["a", "a.b", "a.c"]`.
pub fn walk_toml_keys(value: &toml::Value, prefix: &str) -> Vec<String> {
    let mut keys = Vec::new();
    if let Some(table) = value.as_table() {
        for (k, v) in table {
            let path = if prefix.is_empty() {
                k.clone()
            } else {
                format!("{prefix}.{k}")
            };
            keys.push(path.clone());
            if v.is_table() {
                keys.extend(walk_toml_keys(v, &path));
            }
        }
    }
    keys
}

/// Replace the class-name segment of `detection.classes.<name>...` with `*`.
fn normalize_key(key: &str) -> String {
    let mut parts: Vec<&str> = key.split('.').collect();
    if parts.len() >= 3 && parts[0] == "detection" && parts[1] == "classes" {
        parts[2] = CLASS_WILDCARD;
    }
    parts.join(".")
}

// ============================================================================
// Levenshtein Distance
// ============================================================================

fn levenshtein(a: &str, b: &str) -> usize {
    let b_len = b.chars().count();
    if a.is_empty() {
        return b_len;
    }
    if b_len == 0 {
        return a.chars().count();
    }

    let mut prev: Vec<usize> = (0..=b_len).collect();
    let mut curr = vec![0; b_len + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.chars().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b_len]
}

/// Suggest the closest known key for an unknown key, if within edit distance 3.
pub fn suggest_correction(unknown: &str, known: &HashSet<&str>) -> Option<String> {
    known
        .iter()
        .map(|k| (*k, levenshtein(unknown, k)))
        .filter(|(_, dist)| *dist <= 3)
        .min_by(|(a, da), (b, db)| da.cmp(db).then_with(|| a.cmp(b)))
        .map(|(k, _)| k.to_string())
}

// ============================================================================
// Unknown Key Validation (entry point)
// ============================================================================

/// Parse a raw TOML string and return warnings for any unknown config keys.
pub fn validate_unknown_keys(raw_toml: &str) -> Vec<ValidationWarning> {
    let value: toml::Value = match raw_toml.parse() {
        Ok(v) => v,
        // parse errors surface from serde later
        Err(_) => return Vec::new(),
    };

    let known = known_config_keys();
    walk_toml_keys(&value, "")
        .into_iter()
        .filter_map(|key| {
            let normalized = normalize_key(&key);
            if known.contains(normalized.as_str()) {
                return None;
            }
            let suggestion = suggest_correction(&normalized, &known).map(|s| {
                // put the user's class name back into the suggestion
                key.split('.')
                    .nth(2)
                    .filter(|_| s.starts_with("detection.classes.*"))
                    .map_or_else(|| s.clone(), |class| s.replacen(CLASS_WILDCARD, class, 1))
            });
            Some(ValidationWarning {
                message: format!("Unknown config key '{key}'"),
                field: key,
                suggestion,
            })
        })
        .collect()
}
