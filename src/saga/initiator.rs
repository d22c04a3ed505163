//! Per-device episode tracking and saga initiation.

use std::collections::HashMap;
use std::sync::Arc;

use super::publisher::{CommandPublisher, EmitError};
use crate::detection::DeviceBand;
use crate::types::{
    EventTime, SagaAction, SagaCommand, SagaLogEntry, TelemetryReading, STARTED_STEP,
};

/// Where a device stands with respect to saga initiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EpisodeState {
    /// No saga open; the next violation starts one.
    Idle,
    /// A saga was started; re-emission is suppressed until `until`.
    Cooldown {
        saga_id: String,
        started_at: EventTime,
        until: EventTime,
    },
}

/// Result of feeding one reading to the initiator.
#[derive(Debug, Clone, PartialEq)]
pub enum Initiation {
    /// Reading inside the band; the device is idle.
    InTolerance,
    /// Violation while a cooldown is active.
    Suppressed { saga_id: String },
    /// Command emitted; the log row still has to be appended.
    Started {
        command: SagaCommand,
        log_entry: SagaLogEntry,
    },
}

/// Owns the episode state of every device in one lane.
///
/// The cooldown runs on event time, so replays and redeliveries see the
/// same decisions as the live stream did.
pub struct SagaInitiator {
    cooldown: EventTime,
    devices: HashMap<String, EpisodeState>,
    publisher: Arc<dyn CommandPublisher>,
}

impl SagaInitiator {
    pub fn new(cooldown: EventTime, publisher: Arc<dyn CommandPublisher>) -> Self {
        Self {
            cooldown,
            devices: HashMap::new(),
            publisher,
        }
    }

    pub fn state(&self, device_id: &str) -> EpisodeState {
        self.devices
            .get(device_id)
            .cloned()
            .unwrap_or(EpisodeState::Idle)
    }

    /// Re-enter cooldown for a saga found in the durable log.
    pub fn restore(&mut self, entry: &SagaLogEntry) {
        let until = entry.timestamp.saturating_add(self.cooldown);
        let newer = match self.devices.get(&entry.device_id) {
            Some(EpisodeState::Cooldown { started_at, .. }) => entry.timestamp > *started_at,
            _ => true,
        };
        if newer {
            self.devices.insert(
                entry.device_id.clone(),
                EpisodeState::Cooldown {
                    saga_id: entry.saga_id.clone(),
                    started_at: entry.timestamp,
                    until,
                },
            );
        }
    }

    /// Advance the device's episode with one evaluated reading.
    ///
    /// State changes only after the command is handed to the transport. On
    /// `Err` nothing changed and the same reading may be offered again.
    pub async fn on_reading(
        &mut self,
        reading: &TelemetryReading,
        band: &DeviceBand,
        violated: bool,
    ) -> Result<Initiation, EmitError> {
        if !violated {
            self.devices.remove(&reading.device_id);
            return Ok(Initiation::InTolerance);
        }

        if let Some(EpisodeState::Cooldown {
            saga_id,
            started_at,
            until,
        }) = self.devices.get(&reading.device_id)
        {
            // The trigger itself never re-opens its own episode, even with a zero cooldown.
            if reading.event_time < *until || reading.event_time <= *started_at {
                return Ok(Initiation::Suppressed {
                    saga_id: saga_id.clone(),
                });
            }
        }

        let command = SagaCommand {
            command_id: SagaCommand::command_id_for(&reading.device_id, reading.event_time),
            target_device: reading.device_id.clone(),
            requested_value: band.nominal,
            compensation_needed: false,
        };

        self.publisher.publish(&command).await?;

        tracing::info!(
            device_id = %reading.device_id,
            command_id = %command.command_id,
            value = reading.value,
            nominal = band.nominal,
            transport = self.publisher.transport_name(),
            "Saga started"
        );

        let log_entry = SagaLogEntry {
            saga_id: command.command_id.clone(),
            timestamp: reading.event_time,
            step_number: STARTED_STEP,
            action_type: SagaAction::Started,
            device_id: reading.device_id.clone(),
            details: started_details(reading, band),
        };
        self.devices.insert(
            reading.device_id.clone(),
            EpisodeState::Cooldown {
                saga_id: command.command_id.clone(),
                started_at: reading.event_time,
                until: reading.event_time.saturating_add(self.cooldown),
            },
        );

        Ok(Initiation::Started { command, log_entry })
    }
}

/// Deterministic in the reading, so a re-appended row is byte-identical.
fn started_details(reading: &TelemetryReading, band: &DeviceBand) -> String {
    let at = chrono::DateTime::from_timestamp_millis(reading.event_time)
        .map_or_else(|| reading.event_time.to_string(), |t| t.to_rfc3339());
    format!(
        "Calculation completed: {:.1} deviates {:+.1} from nominal {:.1} (tolerance {:.1}, class {}) at {at}",
        reading.value,
        reading.value - band.nominal,
        band.nominal,
        band.tolerance(),
        band.class,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saga::ChannelPublisher;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    const COOLDOWN: EventTime = 300_000;

    fn band() -> DeviceBand {
        DeviceBand::new("vver-1000", 980.0, 0.05)
    }

    async fn feed(
        initiator: &mut SagaInitiator,
        value: f64,
        event_time: EventTime,
    ) -> Initiation {
        let reading = TelemetryReading::new("Rivne-3", value, event_time);
        let violated = band().is_violated_by(&reading);
        initiator.on_reading(&reading, &band(), violated).await.unwrap()
    }

    #[tokio::test]
    async fn redelivered_trigger_is_suppressed_without_cooldown() {
        let (publisher, mut rx) = ChannelPublisher::new(16);
        let mut initiator = SagaInitiator::new(0, Arc::new(publisher));

        assert!(matches!(
            feed(&mut initiator, 900.0, 10_000).await,
            Initiation::Started { .. }
        ));
        assert!(matches!(
            feed(&mut initiator, 900.0, 10_000).await,
            Initiation::Suppressed { .. }
        ));
        assert_eq!(rx.recv().await.unwrap().command_id, "Rivne-3-10000");
        assert!(rx.try_recv().is_err());

        // a later reading is a new episode once the (empty) cooldown is over
        assert!(matches!(
            feed(&mut initiator, 900.0, 10_001).await,
            Initiation::Started { .. }
        ));
    }

    #[tokio::test]
    async fn sustained_violation_starts_one_saga() {
        let (publisher, mut rx) = ChannelPublisher::new(256);
        let mut initiator = SagaInitiator::new(COOLDOWN, Arc::new(publisher));

        let mut started = 0;
        for i in 0..100 {
            if let Initiation::Started { .. } = feed(&mut initiator, 900.0, i * 1_000).await {
                started += 1;
            }
        }
        assert_eq!(started, 1);
        assert_eq!(rx.recv().await.unwrap().command_id, "Rivne-3-0");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn continuing_violation_after_cooldown_is_a_new_episode() {
        let (publisher, _rx) = ChannelPublisher::new(16);
        let mut initiator = SagaInitiator::new(COOLDOWN, Arc::new(publisher));

        assert!(matches!(feed(&mut initiator, 900.0, 0).await, Initiation::Started { .. }));
        assert!(matches!(
            feed(&mut initiator, 900.0, COOLDOWN - 1).await,
            Initiation::Suppressed { .. }
        ));
        let Initiation::Started { command, .. } = feed(&mut initiator, 900.0, COOLDOWN).await
        else {
            panic!("expected a new episode");
        };
        assert_eq!(command.command_id, format!("Rivne-3-{COOLDOWN}"));
    }

    #[tokio::test]
    async fn return_to_tolerance_resets_cooldown() {
        let (publisher, _rx) = ChannelPublisher::new(16);
        let mut initiator = SagaInitiator::new(COOLDOWN, Arc::new(publisher));

        feed(&mut initiator, 900.0, 0).await;
        assert_eq!(feed(&mut initiator, 979.0, 1_000).await, Initiation::InTolerance);
        assert_eq!(initiator.state("Rivne-3"), EpisodeState::Idle);
        assert!(matches!(feed(&mut initiator, 900.0, 2_000).await, Initiation::Started { .. }));
    }

    #[tokio::test]
    async fn started_row_is_step_one_at_event_time() {
        let (publisher, _rx) = ChannelPublisher::new(16);
        let mut initiator = SagaInitiator::new(COOLDOWN, Arc::new(publisher));

        let Initiation::Started { command, log_entry } = feed(&mut initiator, 930.0, 42_000).await
        else {
            panic!("930 is outside the band");
        };
        assert_eq!(log_entry.saga_id, command.command_id);
        assert_eq!(log_entry.step_number, 1);
        assert_eq!(log_entry.action_type, SagaAction::Started);
        assert_eq!(log_entry.timestamp, 42_000);
        assert!(log_entry.details.starts_with("Calculation completed"));
        assert!((command.requested_value - 980.0).abs() < f64::EPSILON);
        assert!(!command.compensation_needed);
    }

    struct FlakyPublisher {
        down: AtomicBool,
    }

    #[async_trait]
    impl CommandPublisher for FlakyPublisher {
        async fn publish(&self, _command: &SagaCommand) -> Result<(), EmitError> {
            if self.down.load(Ordering::SeqCst) {
                Err(EmitError::ChannelClosed)
            } else {
                Ok(())
            }
        }
        fn transport_name(&self) -> &str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn failed_emission_leaves_device_idle() {
        let publisher = Arc::new(FlakyPublisher {
            down: AtomicBool::new(true),
        });
        let mut initiator = SagaInitiator::new(COOLDOWN, publisher.clone());
        let reading = TelemetryReading::new("Rivne-3", 900.0, 5_000);

        assert!(initiator.on_reading(&reading, &band(), true).await.is_err());
        assert_eq!(initiator.state("Rivne-3"), EpisodeState::Idle);

        publisher.down.store(false, Ordering::SeqCst);
        let Initiation::Started { command, .. } =
            initiator.on_reading(&reading, &band(), true).await.unwrap()
        else {
            panic!("retry should start the saga");
        };
        assert_eq!(command.command_id, "Rivne-3-5000");
    }

    #[tokio::test]
    async fn restored_saga_suppresses_until_cooldown_ends() {
        let (publisher, _rx) = ChannelPublisher::new(16);
        let mut initiator = SagaInitiator::new(COOLDOWN, Arc::new(publisher));
        initiator.restore(&SagaLogEntry {
            saga_id: "Rivne-3-10000".to_string(),
            timestamp: 10_000,
            step_number: STARTED_STEP,
            action_type: SagaAction::Started,
            device_id: "Rivne-3".to_string(),
            details: String::new(),
        });

        assert!(matches!(
            feed(&mut initiator, 900.0, 10_000).await,
            Initiation::Suppressed { .. }
        ));
        assert!(matches!(
            feed(&mut initiator, 900.0, 10_000 + COOLDOWN).await,
            Initiation::Started { .. }
        ));
    }
}
