//! Lifecycle API
//!
//! `Orchestrator` is the only entry point hosts use. It owns one registry,
//! one event bus and one supervisor, and wires them to a classifier.

use crate::agent::{AgentRegistry, ProcessSupervisor, RuleClassifier, StatusClassifier};
use crate::config::OrchestratorConfig;
use crate::error::{Error, Result};
use crate::events::{EventBus, EventReceiver, Subscription};
use crate::types::{AgentConfig, AgentEvent, AgentRecord, EventKind, StartOptions, StartOutcome};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{error, info};

/// Cheap to clone; clones share the same agents
#[derive(Clone)]
pub struct Orchestrator {
    registry: Arc<AgentRegistry>,
    bus: Arc<EventBus>,
    supervisor: Arc<ProcessSupervisor>,
    config: Arc<OrchestratorConfig>,
}

impl Orchestrator {
    /// Create an orchestrator with the default rule classifier
    pub fn new(config: OrchestratorConfig) -> Result<Self> {
        config.validate()?;
        let classifier = RuleClassifier::from_config(&config)?;
        Self::with_classifier(config, Arc::new(classifier))
    }

    /// Create an orchestrator that classifies output with `classifier`
    pub fn with_classifier(
        config: OrchestratorConfig,
        classifier: Arc<dyn StatusClassifier>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let registry = Arc::new(AgentRegistry::new(config.output_buffer_limit));
        let bus = Arc::new(EventBus::new());
        let supervisor = Arc::new(ProcessSupervisor::new(
            Arc::clone(&registry),
            Arc::clone(&bus),
            classifier,
            Arc::clone(&config),
        ));

        info!("Orchestrator ready (agent program: {})", config.command.program);

        Ok(Self {
            registry,
            bus,
            supervisor,
            config,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Register `handler` for one event kind
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&AgentEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe(kind, handler)
    }

    pub fn subscribe_channel(&self, kinds: &[EventKind]) -> EventReceiver {
        self.bus.subscribe_channel(kinds)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub fn create_agent(&self, config: AgentConfig) -> Result<AgentRecord> {
        self.registry.create(config)
    }

    /// Start the agent on `prompt`.
    ///
    /// If a process is already live the prompt is written to its stdin
    /// instead and `StartOutcome::Redirected` is returned.
    pub async fn start_agent(
        &self,
        id: &str,
        prompt: &str,
        options: StartOptions,
    ) -> Result<StartOutcome> {
        self.supervisor.start(id, prompt, &options).await
    }

    /// Stop the agent's process, if any, and reset it to Idle
    pub async fn stop_agent(&self, id: &str) -> Result<()> {
        self.supervisor.stop(id).await
    }

    /// Stop the agent and delete its record
    pub async fn remove_agent(&self, id: &str) -> Result<()> {
        self.supervisor.remove(id).await
    }

    pub async fn send_input(&self, id: &str, text: &str) -> Result<()> {
        self.supervisor.send_input(id, text).await
    }

    pub fn list_agents(&self) -> Vec<AgentRecord> {
        self.registry.list()
    }

    pub fn get_agent(&self, id: &str) -> Result<AgentRecord> {
        self.registry.get(id)
    }

    // ========================================================================
    // Operational helpers
    // ========================================================================

    pub async fn is_running(&self, id: &str) -> bool {
        self.supervisor.is_running(id).await
    }

    /// Ids of agents with a live process
    pub async fn running_agents(&self) -> Vec<String> {
        self.supervisor.running_agents().await
    }

    /// Stop every live agent concurrently
    pub async fn stop_all(&self) -> Result<()> {
        let running = self.running_agents().await;
        if running.is_empty() {
            return Ok(());
        }
        info!("Stopping {} running agents", running.len());

        let results = join_all(running.iter().map(|id| self.supervisor.stop(id))).await;

        let failed: Vec<String> = running
            .iter()
            .zip(results)
            .filter_map(|(id, result)| {
                result.err().map(|e| {
                    error!("Error stopping agent {}: {}", id, e);
                    id.clone()
                })
            })
            .collect();

        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::Internal(format!(
                "failed to stop agents: {}",
                failed.join(", ")
            )))
        }
    }

    /// Stop everything before the host exits
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down orchestrator");
        self.stop_all().await
    }
}
