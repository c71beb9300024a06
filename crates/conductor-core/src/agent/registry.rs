//! In-memory agent registry
//!
//! The registry is the single source of truth for agent identity,
//! configuration and current status. It performs no I/O. Mutators are
//! crate-private: only the process supervisor changes a record once it
//! has been created.

use crate::error::{AgentError, Error, Result};
use crate::types::{AgentConfig, AgentRecord, AgentStatus};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info, warn};

struct Entry {
    record: AgentRecord,
    output: VecDeque<String>,
}

impl Entry {
    fn snapshot(&self) -> AgentRecord {
        let mut record = self.record.clone();
        record.output = self.output.iter().cloned().collect();
        record
    }

    fn touch(&mut self) {
        self.record.last_activity = chrono::Utc::now();
    }
}

/// Keyed store of agent records
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, Entry>>,
    output_limit: usize,
}

impl AgentRegistry {
    pub fn new(output_limit: usize) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            output_limit: output_limit.max(1),
        }
    }

    /// Validate `config`, store a new Idle record and return a copy
    pub fn create(&self, config: AgentConfig) -> Result<AgentRecord> {
        if config.project_path.trim().is_empty() {
            return Err(Error::Agent(AgentError::InvalidConfig(
                "projectPath is required".to_string(),
            )));
        }

        let mut skills: Vec<String> = Vec::with_capacity(config.skills.len());
        for skill in config.skills {
            let skill = skill.trim().to_string();
            if skill.is_empty() {
                return Err(Error::Agent(AgentError::InvalidConfig(
                    "skills must not contain blank entries".to_string(),
                )));
            }
            if !skills.contains(&skill) {
                skills.push(skill);
            }
        }

        let now = chrono::Utc::now();
        let record = AgentRecord {
            id: uuid::Uuid::new_v4().to_string(),
            name: config.name,
            status: AgentStatus::Idle,
            project_path: config.project_path,
            skills,
            env: config.env,
            current_task_summary: None,
            output: Vec::new(),
            last_activity: now,
            created_at: now,
            error: None,
            exit_code: None,
            pid: None,
        };

        info!("Created agent {} ({})", record.id, record.project_path);

        let mut agents = self.agents.write();
        agents.insert(
            record.id.clone(),
            Entry {
                record: record.clone(),
                output: VecDeque::new(),
            },
        );
        Ok(record)
    }

    pub fn get(&self, id: &str) -> Result<AgentRecord> {
        self.agents
            .read()
            .get(id)
            .map(Entry::snapshot)
            .ok_or_else(|| Error::Agent(AgentError::NotFound(id.to_string())))
    }

    /// All records, oldest first
    pub fn list(&self) -> Vec<AgentRecord> {
        let mut records: Vec<AgentRecord> =
            self.agents.read().values().map(Entry::snapshot).collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        records
    }

    pub fn contains(&self, id: &str) -> bool {
        self.agents.read().contains_key(id)
    }

    pub fn status(&self, id: &str) -> Option<AgentStatus> {
        self.agents.read().get(id).map(|e| e.record.status)
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn remove(&self, id: &str) -> Result<AgentRecord> {
        let entry = self
            .agents
            .write()
            .remove(id)
            .ok_or_else(|| Error::Agent(AgentError::NotFound(id.to_string())))?;
        info!("Removed agent {}", id);
        Ok(entry.snapshot())
    }

    /// Apply a state-machine transition.
    ///
    /// Returns `Ok(true)` when the status changed, `Ok(false)` when it was
    /// already `next` or the transition is not allowed.
    pub(crate) fn set_status(&self, id: &str, next: AgentStatus) -> Result<bool> {
        self.update_status(id, None, next, None)
    }

    /// Like `set_status`, but only if the current status is still `expected`
    pub(crate) fn transition_from(
        &self,
        id: &str,
        expected: AgentStatus,
        next: AgentStatus,
    ) -> Result<bool> {
        self.update_status(id, Some(expected), next, None)
    }

    /// Move to Error and record the diagnostic in one step
    pub(crate) fn fail(&self, id: &str, error: impl Into<String>) -> Result<bool> {
        self.update_status(id, None, AgentStatus::Error, Some(error.into()))
    }

    fn update_status(
        &self,
        id: &str,
        expected: Option<AgentStatus>,
        next: AgentStatus,
        error: Option<String>,
    ) -> Result<bool> {
        let mut agents = self.agents.write();
        let entry = agents
            .get_mut(id)
            .ok_or_else(|| Error::Agent(AgentError::NotFound(id.to_string())))?;

        let current = entry.record.status;
        if expected.is_some_and(|e| e != current) {
            return Ok(false);
        }
        if current == next {
            if error.is_some() {
                entry.record.error = error;
            }
            return Ok(false);
        }
        if !current.can_transition_to(next) {
            warn!("Rejected transition {} -> {} for agent {}", current, next, id);
            return Ok(false);
        }

        debug!("Agent {} status {} -> {}", id, current, next);
        entry.record.status = next;
        entry.record.error = if next == AgentStatus::Error { error } else { None };
        entry.touch();
        Ok(true)
    }

    /// Reset per-run state before a fresh spawn
    pub(crate) fn begin_run(&self, id: &str) -> Result<()> {
        let mut agents = self.agents.write();
        let entry = agents
            .get_mut(id)
            .ok_or_else(|| Error::Agent(AgentError::NotFound(id.to_string())))?;
        entry.output.clear();
        entry.record.current_task_summary = None;
        entry.record.error = None;
        entry.record.exit_code = None;
        entry.record.pid = None;
        entry.touch();
        Ok(())
    }

    pub(crate) fn append_output(&self, id: &str, chunk: &str) {
        let mut agents = self.agents.write();
        if let Some(entry) = agents.get_mut(id) {
            while entry.output.len() >= self.output_limit {
                entry.output.pop_front();
            }
            entry.output.push_back(chunk.to_string());
            entry.touch();
        }
    }

    /// Last `n` output lines, oldest first
    pub(crate) fn output_tail(&self, id: &str, n: usize) -> Vec<String> {
        let agents = self.agents.read();
        let Some(entry) = agents.get(id) else {
            return Vec::new();
        };
        let mut lines: Vec<String> = entry
            .output
            .iter()
            .rev()
            .flat_map(|chunk| chunk.lines().rev())
            .filter(|line| !line.trim().is_empty())
            .take(n)
            .map(str::to_string)
            .collect();
        lines.reverse();
        lines
    }

    pub(crate) fn set_task_summary(&self, id: &str, summary: String) {
        if let Some(entry) = self.agents.write().get_mut(id) {
            entry.record.current_task_summary = Some(summary);
        }
    }

    pub(crate) fn set_process(&self, id: &str, pid: Option<u32>) {
        if let Some(entry) = self.agents.write().get_mut(id) {
            entry.record.pid = pid;
        }
    }

    pub(crate) fn set_exit_code(&self, id: &str, code: i32) {
        if let Some(entry) = self.agents.write().get_mut(id) {
            entry.record.exit_code = Some(code);
            entry.record.pid = None;
        }
    }

    pub(crate) fn touch(&self, id: &str) {
        if let Some(entry) = self.agents.write().get_mut(id) {
            entry.touch();
        }
    }
}
