//! Agent configuration, record and status types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Input for creating an agent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// Optional display name
    #[serde(default)]
    pub name: Option<String>,
    /// Filesystem root the agent process runs in
    pub project_path: String,
    /// Capability tags passed through to the process environment
    #[serde(default)]
    pub skills: Vec<String>,
    /// Extra environment for this agent, merged over the global command env
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl AgentConfig {
    pub fn new(project_path: impl Into<String>) -> Self {
        Self {
            project_path: project_path.into(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_skills<I, S>(mut self, skills: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skills = skills.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Agent lifecycle status
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// No process, never started or stopped
    #[default]
    Idle,
    /// Process is live and producing work
    Running,
    /// Process is live and appears to be awaiting input
    Waiting,
    /// Last process exited with code 0
    Completed,
    /// Last process failed to spawn or exited non-zero
    Error,
}

impl AgentStatus {
    /// Whether a live process is expected in this status
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Waiting)
    }

    /// Whether `start()` spawns a fresh process from this status
    pub fn is_resting(self) -> bool {
        !self.is_active()
    }

    /// Lifecycle state machine.
    ///
    /// `stop()` may force any status to Idle. Resting statuses may go to
    /// Running on start, or to Error when the spawn itself fails.
    pub fn can_transition_to(self, next: AgentStatus) -> bool {
        use AgentStatus::*;
        match (self, next) {
            (_, Idle) => true,
            (Idle | Completed | Error, Running) => true,
            (Idle | Completed | Error, Error) => true,
            (Running, Waiting) | (Waiting, Running) => true,
            (Running | Waiting, Completed | Error) => true,
            _ => false,
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// One managed coding-task executor (in-memory only)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub id: String,
    pub name: Option<String>,
    pub status: AgentStatus,
    pub project_path: String,
    pub skills: Vec<String>,
    pub env: HashMap<String, String>,
    pub current_task_summary: Option<String>,
    /// Bounded, oldest chunk first
    pub output: Vec<String>,
    pub last_activity: chrono::DateTime<chrono::Utc>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub error: Option<String>,
    /// Exit code of the most recent run
    pub exit_code: Option<i32>,
    /// OS pid of the live process
    pub pid: Option<u32>,
}

/// Per-start options for the external CLI
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StartOptions {
    #[serde(default)]
    pub model: Option<String>,
    /// Session to resume
    #[serde(default)]
    pub resume: Option<String>,
}

impl StartOptions {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_resume(mut self, session: impl Into<String>) -> Self {
        self.resume = Some(session.into());
        self
    }
}

/// Result of a successful `start()` call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StartOutcome {
    /// A new process was spawned
    Started { pid: Option<u32> },
    /// A process was already live; the prompt was written to its stdin instead
    Redirected { previous: AgentStatus },
}

impl StartOutcome {
    pub fn was_redirected(&self) -> bool {
        matches!(self, Self::Redirected { .. })
    }

    /// Human-readable summary for UI surfaces
    pub fn message(&self) -> String {
        match self {
            Self::Started { .. } => "Agent started".to_string(),
            Self::Redirected { previous } => format!(
                "Agent was already {}; prompt delivered as input",
                previous
            ),
        }
    }
}
