//! Error types for Conductor Core

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for Conductor operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Agent lifecycle errors
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Agent not found: {0}")]
    NotFound(String),

    #[error("Invalid agent configuration: {0}")]
    InvalidConfig(String),

    #[error("Agent not running: {0}")]
    NotRunning(String),

    #[error("Failed to spawn process for agent {id}: {reason}")]
    ProcessSpawnFailed { id: String, reason: String },

    #[error("Failed to confirm termination of agent {id}: {reason}")]
    KillFailed { id: String, reason: String },
}

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(ConfigError::Parse(err.to_string()))
    }
}

impl Error {
    /// True when the error is `AgentError::NotFound`
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Agent(AgentError::NotFound(_)))
    }

    /// True when the error is `AgentError::NotRunning`
    pub fn is_not_running(&self) -> bool {
        matches!(self, Error::Agent(AgentError::NotRunning(_)))
    }
}

impl serde::Serialize for Error {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;
