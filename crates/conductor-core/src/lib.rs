//! Conductor Core Library
//!
//! This crate provides the core functionality for Conductor, including:
//! - Agent records and lifecycle state machine
//! - Supervision of one external CLI process per agent
//! - Heuristic status classification of agent output
//! - Typed lifecycle events for any number of subscribers
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     conductor-core                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  orchestrator.rs - Lifecycle API (create/start/stop/...)    │
//! │  agent/          - Registry, supervisor, classifier         │
//! │  events/         - Event bus and subscriptions              │
//! │  types/          - Shared type definitions                  │
//! │  config.rs       - Orchestrator configuration               │
//! │  error.rs        - Error types                              │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod agent;
pub mod config;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod types;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;

pub use config::{CommandConfig, OrchestratorConfig};
pub use events::{EventBus, EventReceiver, Subscription};
pub use orchestrator::Orchestrator;

// Re-export agent components
pub use agent::{
    AgentRegistry, Classification, ClassifierRule, RuleClassifier, StatusClassifier, Verdict,
};
