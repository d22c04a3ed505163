//! Saga command and saga log records.

use super::EventTime;
use serde::{Deserialize, Serialize};

/// Outbound command published when a device leaves its nominal band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaCommand {
    pub command_id: String,
    pub target_device: String,
    pub requested_value: f64,
    pub compensation_needed: bool,
}

impl SagaCommand {
    /// Mint the command id for a device and a monotonic per-device token.
    ///
    /// The token is the triggering reading's event time, so redelivery of
    /// the same reading reproduces the same id.
    pub fn command_id_for(device_id: &str, token: EventTime) -> String {
        format!("{device_id}-{token}")
    }
}

/// Saga step kinds. Only `Started` is produced here; completion and
/// compensation rows belong to a downstream consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaAction {
    Started,
    Completed,
    Compensated,
}

impl SagaAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "STARTED",
            Self::Completed => "COMPLETED",
            Self::Compensated => "COMPENSATED",
        }
    }
}

impl std::fmt::Display for SagaAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step number of the initiation row.
pub const STARTED_STEP: u32 = 1;

/// One append-only row of the saga log.
///
/// `(saga_id, step_number)` is the row identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaLogEntry {
    pub saga_id: String,
    pub timestamp: EventTime,
    pub step_number: u32,
    pub action_type: SagaAction,
    pub device_id: String,
    pub details: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_serializes_to_wire_schema() {
        let command = SagaCommand {
            command_id: SagaCommand::command_id_for("Rivne-3", 60_000),
            target_device: "Rivne-3".to_string(),
            requested_value: 980.0,
            compensation_needed: false,
        };
        let json: serde_json::Value = serde_json::to_value(&command).unwrap();
        assert_eq!(json["command_id"], "Rivne-3-60000");
        assert_eq!(json["target_device"], "Rivne-3");
        assert_eq!(json["requested_value"], 980.0);
        assert_eq!(json["compensation_needed"], false);
        assert_eq!(json.as_object().unwrap().len(), 4);
    }

    #[test]
    fn action_type_is_upper_case_on_the_wire() {
        let json = serde_json::to_string(&SagaAction::Started).unwrap();
        assert_eq!(json, "\"STARTED\"");
        assert_eq!(SagaAction::Started.to_string(), "STARTED");
    }
}
