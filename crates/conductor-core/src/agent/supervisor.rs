//! Process supervision
//!
//! At most one live OS process exists per agent id. Every operation on an
//! id (start, stop, input, removal) first takes that id's slot lock, so
//! they serialize per agent while different agents proceed in parallel.
//!
//! Each process is owned by a pump task that forwards output, applies
//! classifier hints and reports the exit. Once a process is running, only
//! its exit code moves the agent to Completed or Error; classifier hints
//! are limited to Running and Waiting. The pump never takes the slot lock,
//! which lets `stop()` hold it while waiting for the pump to finish.
//!
//! Status changes from the pump and from API calls are committed and
//! published under one lock, so subscribers see them in commit order.
//! Stopping or restarting an agent also clears out its process group,
//! including tools the CLI left running after it exited.

use super::classifier::StatusClassifier;
use super::command::LaunchSpec;
use super::process::{
    exit_code, group_alive, signal_group, AgentProcess, StopSignal, StreamChunk,
};
use super::registry::AgentRegistry;
use crate::config::OrchestratorConfig;
use crate::error::{AgentError, Error, Result};
use crate::events::EventBus;
use crate::types::{AgentEvent, AgentStatus, StartOptions, StartOutcome};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{mpsc, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn};

/// How often a process group is checked while it winds down
const GROUP_POLL_INTERVAL: Duration = Duration::from_millis(25);

enum Control {
    Terminate,
}

/// How a pump task ended
#[derive(Debug)]
enum RunEnd {
    /// The process exited on its own; terminal status already recorded
    Exited { code: i32 },
    /// The process was stopped on request
    Terminated { code: Option<i32> },
    KillFailed { reason: String },
}

/// Process-table entry for one agent
struct LiveProcess {
    /// Also the process group id
    pid: Option<u32>,
    stdin_tx: mpsc::Sender<String>,
    control_tx: mpsc::Sender<Control>,
    /// Set by the pump as soon as the OS reports the exit
    exited: Arc<AtomicBool>,
    task: JoinHandle<RunEnd>,
}

impl LiveProcess {
    fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    /// Ask the pump to terminate the process and wait for it to finish
    async fn shutdown(self) -> RunEnd {
        // Fails only if the pump already ended, in which case join returns at once
        let _ = self.control_tx.try_send(Control::Terminate);
        self.join().await
    }

    async fn join(self) -> RunEnd {
        match self.task.await {
            Ok(end) => end,
            Err(e) => {
                error!("Supervisor task failed: {}", e);
                RunEnd::KillFailed {
                    reason: format!("supervisor task failed: {}", e),
                }
            }
        }
    }
}

type Slot = Arc<AsyncMutex<Option<LiveProcess>>>;

/// Shared handles used by both the API side and the pump tasks
#[derive(Clone)]
struct RunContext {
    registry: Arc<AgentRegistry>,
    bus: Arc<EventBus>,
    classifier: Arc<dyn StatusClassifier>,
    config: Arc<OrchestratorConfig>,
    /// Held from a status commit until its event is queued
    status_order: Arc<Mutex<()>>,
}

impl RunContext {
    /// Apply `update` and, if it changed the status to `next`, publish that
    fn commit(&self, id: &str, next: AgentStatus, update: impl FnOnce() -> Result<bool>) {
        let _order = self.status_order.lock();
        match update() {
            Ok(true) => self.bus.publish(AgentEvent::status_changed(id, next)),
            Ok(false) => {}
            Err(e) => debug!("Status update skipped for agent {}: {}", id, e),
        }
    }

    fn transition(&self, id: &str, next: AgentStatus) {
        self.commit(id, next, || self.registry.set_status(id, next));
    }

    fn transition_from(&self, id: &str, expected: AgentStatus, next: AgentStatus) {
        self.commit(id, next, || self.registry.transition_from(id, expected, next));
    }

    fn fail(&self, id: &str, error: String) {
        self.commit(id, AgentStatus::Error, || self.registry.fail(id, error));
    }

    fn handle_chunk(&self, id: &str, chunk: StreamChunk) {
        match chunk {
            StreamChunk::Stdout(data) => {
                self.registry.append_output(id, &data);
                self.bus.publish(AgentEvent::output(id, &data));
                self.classify(id, &data);
            }
            StreamChunk::Stderr(data) => {
                self.registry.append_output(id, &data);
                self.bus.publish(AgentEvent::error_output(id, data));
            }
        }
    }

    fn classify(&self, id: &str, chunk: &str) {
        let Some(prior) = self.registry.status(id) else {
            return;
        };
        if !prior.is_active() {
            return;
        }

        let classification =
            match catch_unwind(AssertUnwindSafe(|| self.classifier.classify(prior, chunk))) {
                Ok(c) => c,
                Err(_) => {
                    warn!("Classifier panicked on output from agent {}; ignoring", id);
                    return;
                }
            };

        if let Some(summary) = classification.task_summary {
            self.registry.set_task_summary(id, summary);
        }
        // Terminal statuses only ever come from the exit code
        if let Some(hint) = classification.status_hint.filter(|s| s.is_active()) {
            self.transition_from(id, prior, hint);
        }
    }

    /// Forward output still buffered after the process went away
    async fn drain(&self, id: &str, chunks: &mut mpsc::Receiver<StreamChunk>) {
        let deadline = Instant::now() + self.config.output_drain_timeout();
        while let Ok(Some(chunk)) = timeout_at(deadline, chunks.recv()).await {
            self.handle_chunk(id, chunk);
        }
    }

    fn finish_run(&self, id: &str, code: i32) {
        self.registry.set_exit_code(id, code);

        if code == 0 {
            info!("Agent {} completed", id);
            self.transition(id, AgentStatus::Completed);
        } else {
            warn!("Agent {} exited with code {}", id, code);
            let tail = self.registry.output_tail(id, self.config.error_tail_lines);
            let mut message = format!("Process exited with code {}", code);
            if !tail.is_empty() {
                message.push('\n');
                message.push_str(&tail.join("\n"));
            }
            self.fail(id, message);
        }

        self.bus.publish(AgentEvent::completed(id, code));
    }
}

/// Pump task: owns the child for its whole life
async fn pump(
    ctx: RunContext,
    id: String,
    mut child: Child,
    pid: Option<u32>,
    mut chunks: mpsc::Receiver<StreamChunk>,
    mut control_rx: mpsc::Receiver<Control>,
    exited: Arc<AtomicBool>,
) -> RunEnd {
    let mut streams_open = true;

    let status = loop {
        tokio::select! {
            biased;
            Some(Control::Terminate) = control_rx.recv() => {
                let end = terminate(&id, &mut child, pid, &ctx.config).await;
                exited.store(true, Ordering::Release);
                ctx.drain(&id, &mut chunks).await;
                return end;
            }
            chunk = chunks.recv(), if streams_open => match chunk {
                Some(chunk) => ctx.handle_chunk(&id, chunk),
                None => streams_open = false,
            },
            status = child.wait() => break status,
        }
    };

    exited.store(true, Ordering::Release);
    ctx.drain(&id, &mut chunks).await;

    let code = match status {
        Ok(status) => exit_code(&status),
        Err(e) => {
            error!("Failed to wait on agent {}: {}", id, e);
            -1
        }
    };
    ctx.finish_run(&id, code);
    RunEnd::Exited { code }
}

/// SIGTERM, wait, then SIGKILL, wait
async fn terminate(
    id: &str,
    child: &mut Child,
    pid: Option<u32>,
    config: &OrchestratorConfig,
) -> RunEnd {
    let graceful = match pid {
        Some(pid) => match signal_group(pid, StopSignal::Terminate) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to send SIGTERM to agent {}: {}", id, e);
                false
            }
        },
        None => false,
    };

    if graceful {
        match timeout(config.termination_timeout(), child.wait()).await {
            Ok(Ok(status)) => {
                return RunEnd::Terminated {
                    code: Some(exit_code(&status)),
                }
            }
            Ok(Err(e)) => warn!("Failed to wait on agent {}: {}", id, e),
            Err(_) => warn!(
                "Agent {} still running {:?} after SIGTERM, sending SIGKILL",
                id,
                config.termination_timeout()
            ),
        }
    }

    if let Some(pid) = pid {
        if let Err(e) = signal_group(pid, StopSignal::Kill) {
            debug!("Group SIGKILL for agent {} failed: {}", id, e);
        }
    }
    if let Err(e) = child.start_kill() {
        debug!("Direct kill for agent {} failed: {}", id, e);
    }

    match timeout(config.kill_timeout(), child.wait()).await {
        Ok(Ok(status)) => RunEnd::Terminated {
            code: Some(exit_code(&status)),
        },
        Ok(Err(e)) => RunEnd::KillFailed {
            reason: e.to_string(),
        },
        Err(_) => RunEnd::KillFailed {
            reason: format!(
                "process still alive {:?} after SIGKILL",
                config.kill_timeout()
            ),
        },
    }
}

/// Owns the live-process table
pub struct ProcessSupervisor {
    ctx: RunContext,
    slots: Mutex<HashMap<String, Slot>>,
}

impl ProcessSupervisor {
    pub fn new(
        registry: Arc<AgentRegistry>,
        bus: Arc<EventBus>,
        classifier: Arc<dyn StatusClassifier>,
        config: Arc<OrchestratorConfig>,
    ) -> Self {
        Self {
            ctx: RunContext {
                registry,
                bus,
                classifier,
                config,
                status_order: Arc::new(Mutex::new(())),
            },
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Lock the slot for `id`, which must still be registered once the lock is held
    async fn lock_slot(&self, id: &str) -> Result<OwnedMutexGuard<Option<LiveProcess>>> {
        self.ensure_known(id)?;
        let slot = Arc::clone(self.slots.lock().entry(id.to_string()).or_default());
        let guard = slot.lock_owned().await;

        // Removed while this call waited; drop the entry it may have recreated
        if !self.ctx.registry.contains(id) {
            drop(guard);
            self.slots.lock().remove(id);
            return Err(Error::Agent(AgentError::NotFound(id.to_string())));
        }
        Ok(guard)
    }

    fn existing_slot(&self, id: &str) -> Option<Slot> {
        self.slots.lock().get(id).cloned()
    }

    fn ensure_known(&self, id: &str) -> Result<()> {
        if self.ctx.registry.contains(id) {
            Ok(())
        } else {
            Err(Error::Agent(AgentError::NotFound(id.to_string())))
        }
    }

    /// Spawn a process for `id`, or deliver `prompt` as input if one is live
    pub async fn start(
        &self,
        id: &str,
        prompt: &str,
        options: &StartOptions,
    ) -> Result<StartOutcome> {
        let mut guard = self.lock_slot(id).await?;
        let record = self.ctx.registry.get(id)?;

        let live_input = guard
            .as_ref()
            .filter(|live| !live.has_exited())
            .map(|live| live.stdin_tx.clone());
        if let Some(stdin_tx) = live_input {
            drop(guard);
            info!(
                "Agent {} already {}; delivering prompt as input",
                id, record.status
            );
            self.deliver(id, stdin_tx, prompt).await?;
            return Ok(StartOutcome::Redirected {
                previous: record.status,
            });
        }

        // Let a finished run publish its final events before the next one starts
        if let Some(previous) = guard.take() {
            debug!("Reaping finished run of agent {}", id);
            let pid = previous.pid;
            previous.join().await;
            self.sweep_group(id, pid).await;
        }

        self.ctx.registry.begin_run(id)?;
        let spec = LaunchSpec::build(&self.ctx.config.command, &record, prompt, options);
        let spawned = AgentProcess::spawn(
            &spec,
            self.ctx.config.input_channel_capacity,
            self.ctx.config.max_line_bytes,
        );
        let process = match spawned {
            Ok(process) => process,
            Err(e) => {
                error!("Failed to spawn agent {}: {}", id, e);
                self.ctx
                    .fail(id, format!("Failed to spawn {}: {}", spec.program, e));
                return Err(Error::Agent(AgentError::ProcessSpawnFailed {
                    id: id.to_string(),
                    reason: e.to_string(),
                }));
            }
        };

        let pid = process.pid;
        info!("Agent {} started (pid {:?}): {}", id, pid, spec.display());
        self.ctx.registry.set_process(id, pid);
        // Published before the pump exists, so Running precedes any output
        self.ctx.transition(id, AgentStatus::Running);
        *guard = Some(self.launch(id, process));

        Ok(StartOutcome::Started { pid })
    }

    fn launch(&self, id: &str, process: AgentProcess) -> LiveProcess {
        let AgentProcess {
            child,
            pid,
            stdin_tx,
            chunks,
        } = process;
        let (control_tx, control_rx) = mpsc::channel(1);
        let exited = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(pump(
            self.ctx.clone(),
            id.to_string(),
            child,
            pid,
            chunks,
            control_rx,
            Arc::clone(&exited),
        ));

        LiveProcess {
            pid,
            stdin_tx,
            control_tx,
            exited,
            task,
        }
    }

    /// Write `text` to the live process's stdin
    pub async fn send_input(&self, id: &str, text: &str) -> Result<()> {
        self.ensure_known(id)?;

        let mut stdin_tx = None;
        if let Some(slot) = self.existing_slot(id) {
            if let Some(live) = slot.lock().await.as_ref() {
                if !live.has_exited() {
                    stdin_tx = Some(live.stdin_tx.clone());
                }
            }
        }

        match stdin_tx {
            Some(tx) => self.deliver(id, tx, text).await,
            None => Err(Error::Agent(AgentError::NotRunning(id.to_string()))),
        }
    }

    async fn deliver(&self, id: &str, stdin_tx: mpsc::Sender<String>, text: &str) -> Result<()> {
        stdin_tx.send(text.to_string()).await.map_err(|_| {
            debug!("Input for agent {} dropped: process is gone", id);
            Error::Agent(AgentError::NotRunning(id.to_string()))
        })?;
        self.ctx.registry.touch(id);
        self.ctx
            .transition_from(id, AgentStatus::Waiting, AgentStatus::Running);
        Ok(())
    }

    /// Terminate the live process (if any) and force the status to Idle.
    ///
    /// Idempotent: stopping an agent without a process only resets its status.
    pub async fn stop(&self, id: &str) -> Result<()> {
        let mut guard = self.lock_slot(id).await?;
        self.stop_locked(id, &mut guard).await
    }

    async fn stop_locked(&self, id: &str, live: &mut Option<LiveProcess>) -> Result<()> {
        let end = match live.take() {
            Some(process) => {
                info!("Stopping agent {} (pid {:?})", id, process.pid);
                let pid = process.pid;
                let end = process.shutdown().await;
                self.sweep_group(id, pid).await;
                Some(end)
            }
            None => None,
        };
        self.ctx.registry.set_process(id, None);

        match end {
            Some(RunEnd::KillFailed { reason }) => {
                error!("Could not confirm agent {} terminated: {}", id, reason);
                self.ctx
                    .fail(id, format!("Failed to confirm termination: {}", reason));
                return Err(Error::Agent(AgentError::KillFailed {
                    id: id.to_string(),
                    reason,
                }));
            }
            Some(RunEnd::Terminated { code }) => {
                debug!("Agent {} terminated with code {:?}", id, code);
                if let Some(code) = code {
                    self.ctx.registry.set_exit_code(id, code);
                }
            }
            Some(RunEnd::Exited { code }) => {
                debug!("Agent {} had already exited with code {}", id, code);
            }
            None => {}
        }

        self.ctx.transition(id, AgentStatus::Idle);
        self.ctx.registry.touch(id);
        Ok(())
    }

    /// Stop the agent, then drop its record and process-table entry
    pub async fn remove(&self, id: &str) -> Result<()> {
        let mut guard = self.lock_slot(id).await?;

        self.stop_locked(id, &mut guard).await?;
        self.ctx.registry.remove(id)?;
        drop(guard);

        self.slots.lock().remove(id);
        Ok(())
    }

    /// SIGTERM whatever is left in the group led by `pid`, then SIGKILL
    /// once the termination timeout passes
    async fn sweep_group(&self, id: &str, pid: Option<u32>) {
        let Some(pid) = pid else {
            return;
        };
        if !group_alive(pid) {
            return;
        }

        debug!("Terminating leftover processes of agent {} (group {})", id, pid);
        if let Err(e) = signal_group(pid, StopSignal::Terminate) {
            warn!("Failed to signal process group of agent {}: {}", id, e);
            return;
        }

        let deadline = Instant::now() + self.ctx.config.termination_timeout();
        while group_alive(pid) && Instant::now() < deadline {
            tokio::time::sleep(GROUP_POLL_INTERVAL).await;
        }
        if group_alive(pid) {
            warn!("Process group of agent {} ignored SIGTERM, sending SIGKILL", id);
            if let Err(e) = signal_group(pid, StopSignal::Kill) {
                warn!("Failed to kill process group of agent {}: {}", id, e);
            }
        }
    }

    pub async fn is_running(&self, id: &str) -> bool {
        match self.existing_slot(id) {
            Some(slot) => slot
                .lock()
                .await
                .as_ref()
                .is_some_and(|live| !live.has_exited()),
            None => false,
        }
    }

    /// Ids of agents with a live process
    pub async fn running_agents(&self) -> Vec<String> {
        let slots: Vec<(String, Slot)> = self
            .slots
            .lock()
            .iter()
            .map(|(id, slot)| (id.clone(), Arc::clone(slot)))
            .collect();

        let mut running = Vec::new();
        for (id, slot) in slots {
            if slot
                .lock()
                .await
                .as_ref()
                .is_some_and(|live| !live.has_exited())
            {
                running.push(id);
            }
        }
        running.sort();
        running
    }
}
