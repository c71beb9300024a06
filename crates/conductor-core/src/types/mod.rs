//! Core type definitions for Conductor
//!
//! Shared types used across the orchestrator and by external consumers.
//! Everything here is serializable so it can cross an IPC boundary.

mod agent_types;
mod event_types;

pub use agent_types::*;
pub use event_types::*;
