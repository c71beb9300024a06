//! Lifecycle event types published on the event bus

use super::AgentStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event published by the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// A chunk of the process's stdout
    #[serde(rename_all = "camelCase")]
    Output {
        agent_id: String,
        data: String,
        timestamp: DateTime<Utc>,
    },
    /// A chunk of the process's stderr
    #[serde(rename_all = "camelCase")]
    ErrorOutput {
        agent_id: String,
        data: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    StatusChanged {
        agent_id: String,
        status: AgentStatus,
        timestamp: DateTime<Utc>,
    },
    /// The process exited on its own
    #[serde(rename_all = "camelCase")]
    Completed {
        agent_id: String,
        exit_code: i32,
        timestamp: DateTime<Utc>,
    },
}

impl AgentEvent {
    pub fn output(agent_id: impl Into<String>, data: impl Into<String>) -> Self {
        Self::Output {
            agent_id: agent_id.into(),
            data: data.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn error_output(agent_id: impl Into<String>, data: impl Into<String>) -> Self {
        Self::ErrorOutput {
            agent_id: agent_id.into(),
            data: data.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn status_changed(agent_id: impl Into<String>, status: AgentStatus) -> Self {
        Self::StatusChanged {
            agent_id: agent_id.into(),
            status,
            timestamp: Utc::now(),
        }
    }

    pub fn completed(agent_id: impl Into<String>, exit_code: i32) -> Self {
        Self::Completed {
            agent_id: agent_id.into(),
            exit_code,
            timestamp: Utc::now(),
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::Output { .. } => EventKind::Output,
            Self::ErrorOutput { .. } => EventKind::ErrorOutput,
            Self::StatusChanged { .. } => EventKind::StatusChanged,
            Self::Completed { .. } => EventKind::Completed,
        }
    }

    pub fn agent_id(&self) -> &str {
        match self {
            Self::Output { agent_id, .. }
            | Self::ErrorOutput { agent_id, .. }
            | Self::StatusChanged { agent_id, .. }
            | Self::Completed { agent_id, .. } => agent_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Output { timestamp, .. }
            | Self::ErrorOutput { timestamp, .. }
            | Self::StatusChanged { timestamp, .. }
            | Self::Completed { timestamp, .. } => *timestamp,
        }
    }
}

/// Discriminant used as the subscription key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Output,
    ErrorOutput,
    StatusChanged,
    Completed,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::Output,
        EventKind::ErrorOutput,
        EventKind::StatusChanged,
        EventKind::Completed,
    ];
}
