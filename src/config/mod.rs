//! Engine Configuration Module
//!
//! Per-deployment configuration loaded from TOML.
//!
//! ## Loading Order
//!
//! 1. `REACTOR_SAGA_CONFIG` environment variable (path to TOML file)
//! 2. `reactor_saga.toml` in the current working directory
//! 3. Built-in defaults
//!
//! The loaded config is shared as `Arc<EngineConfig>` and passed explicitly
//! to every component that needs it.

mod engine_config;
pub mod defaults;
pub mod validation;

pub use engine_config::*;
