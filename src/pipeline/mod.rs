//! Processing Pipeline Module
//!
//! ## Per-Reading Flow
//!
//! ```text
//! Source (stdin / broker TCP / replay file)
//!   └─► IngestLoop ──submit──► PartitionedRuntime
//!                                  └─► lane = hash(device_id) % N
//!                                        └─► LanePipeline
//!                                              1. Aggregate (hopping windows)
//!                                              2. Detect    (nominal band)
//!                                              3. Initiate  (command + STARTED row)
//!                                              4. Persist   (aggregate rows)
//!                                        └─► ack(offset) ──► OffsetCommitter
//! ```
//!
//! CRITICAL GUARANTEE: readings for one device are processed by one lane, in
//! submission order, and an offset is acknowledged only after its reading has
//! been through every stage.

mod lane;
mod offsets;
pub mod processing_loop;
mod runtime;
pub mod source;

pub use lane::{LaneOutcome, LanePipeline, LaneReport, PipelineError};
pub use offsets::{OffsetCommitter, OffsetTracker};
pub use processing_loop::{IngestEnd, IngestLoop, IngestStats};
pub use runtime::{
    lane_for, PartitionedRuntime, RuntimeDeps, RuntimeReport, RuntimeSettings, SubmitError,
};
pub use source::{InputKind, ReplaySource, SourceEvent, StdinSource, TcpSource, TelemetrySource};
