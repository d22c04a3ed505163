//! Saga initiation: one outbound command and one STARTED log row per
//! violation episode.
//!
//! ```text
//! Idle     --violation, publish ok-->   Cooldown { until = t + cooldown }
//! Idle     --violation, publish err-->  Idle (reading retried)
//! Cooldown --violation, t < until-->    Cooldown (suppressed)
//! Cooldown --violation, t >= until-->   new episode
//! any      --reading in band-->         Idle
//! ```
//!
//! Completion and compensation steps are not produced here; the log row
//! marks the hand-off to whatever consumes the command topic.

mod initiator;
mod publisher;

pub use initiator::{EpisodeState, Initiation, SagaInitiator};
pub use publisher::{
    ChannelPublisher, CommandPublisher, EmitError, StdoutPublisher, TcpPublisher,
};
