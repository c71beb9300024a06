//! Orchestrator configuration
//!
//! Every field has a default so partial TOML files are accepted:
//!
//! ```toml
//! termination_timeout_ms = 3000
//!
//! [command]
//! program = "claude"
//! base_args = ["--verbose"]
//! ```

use crate::error::{ConfigError, Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Environment variable that overrides `command.program`
pub const PROGRAM_ENV: &str = "CONDUCTOR_AGENT_PROGRAM";

/// How the external CLI is invoked
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CommandConfig {
    pub program: String,
    /// Arguments placed before the per-start flags and the prompt
    pub base_args: Vec<String>,
    pub model_flag: String,
    pub resume_flag: String,
    /// Receives the comma-joined skills
    pub skills_env: String,
    /// Receives the agent id
    pub agent_id_env: String,
    pub env: HashMap<String, String>,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            base_args: Vec::new(),
            model_flag: "--model".to_string(),
            resume_flag: "--resume".to_string(),
            skills_env: "CONDUCTOR_SKILLS".to_string(),
            agent_id_env: "CONDUCTOR_AGENT_ID".to_string(),
            env: HashMap::new(),
        }
    }
}

/// Orchestrator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub command: CommandConfig,
    pub output_buffer_limit: usize,
    pub summary_max_chars: usize,
    pub error_tail_lines: usize,
    pub termination_timeout_ms: u64,
    pub kill_timeout_ms: u64,
    pub output_drain_timeout_ms: u64,
    pub input_channel_capacity: usize,
    /// Longest output line forwarded as one chunk; longer lines are split
    pub max_line_bytes: usize,
    /// Case-insensitive patterns matched against the last line of a chunk
    pub waiting_patterns: Vec<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            command: CommandConfig::default(),
            output_buffer_limit: 1000,
            summary_max_chars: 80,
            error_tail_lines: 20,
            termination_timeout_ms: 5000,
            kill_timeout_ms: 2000,
            output_drain_timeout_ms: 500,
            input_channel_capacity: 100,
            max_line_bytes: 64 * 1024,
            waiting_patterns: default_waiting_patterns(),
        }
    }
}

pub fn default_waiting_patterns() -> Vec<String> {
    [
        r"\(y/n\)",
        r"\[y/n\]",
        r"press enter",
        r"waiting for (your )?input",
        r"awaiting input",
        r"^do you want to",
        r"^would you like to",
        r"continue\?\s*$",
        r"^.{1,120}\?\s*$",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl OrchestratorConfig {
    /// Load from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| {
            Error::Config(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })
        })?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Load `path` if given, else the default location if it exists, else defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(path),
            _ => {
                debug!("No config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// `<config dir>/conductor/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("conductor").join("config.toml"))
    }

    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(program) = std::env::var(PROGRAM_ENV) {
            if !program.trim().is_empty() {
                debug!("Agent program overridden by {}: {}", PROGRAM_ENV, program);
                self.command.program = program;
            }
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(Error::Config(ConfigError::Invalid(msg.to_string())));

        if self.command.program.trim().is_empty() {
            return invalid("command.program must not be empty");
        }
        if self.output_buffer_limit == 0 {
            return invalid("output_buffer_limit must be greater than 0");
        }
        if self.summary_max_chars < 4 {
            return invalid("summary_max_chars must be at least 4");
        }
        if self.input_channel_capacity == 0 {
            return invalid("input_channel_capacity must be greater than 0");
        }
        if self.max_line_bytes == 0 {
            return invalid("max_line_bytes must be greater than 0");
        }
        if self.kill_timeout_ms == 0 {
            return invalid("kill_timeout_ms must be greater than 0");
        }
        for pattern in &self.waiting_patterns {
            if let Err(e) = Regex::new(pattern) {
                return Err(Error::Config(ConfigError::Invalid(format!(
                    "waiting pattern {:?}: {}",
                    pattern, e
                ))));
            }
        }
        Ok(())
    }

    pub fn termination_timeout(&self) -> Duration {
        Duration::from_millis(self.termination_timeout_ms)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }

    pub fn output_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.output_drain_timeout_ms)
    }
}
