//! Durable storage for window aggregates, the saga log and consumer offsets.
//!
//! - [`DurableStore`] / [`OffsetStore`]: backend traits
//! - [`SledStore`]: embedded keyspace (one sled tree per table)
//! - [`InMemoryStore`]: tests and minimal deployments
//! - [`SinkAdapter`]: bounded, best-effort writes shared by all lanes

mod persistence;
mod sink;
mod sled_store;

pub use persistence::{DurableStore, InMemoryStore, OffsetStore, SinkError};
pub use sink::{SinkAdapter, WriteStatus};
pub use sled_store::SledStore;
