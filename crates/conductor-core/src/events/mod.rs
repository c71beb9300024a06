//! Lifecycle event delivery
//!
//! Consumers (UI bridge, task-board sync, automation) subscribe per
//! [`EventKind`](crate::types::EventKind) and receive typed
//! [`AgentEvent`](crate::types::AgentEvent)s.

mod bus;

pub use bus::{EventBus, EventReceiver, Subscription};
