//! End-to-end lifecycle tests against real child processes.
//!
//! Each agent runs `sh -c <script> agent <prompt>`, so the prompt is `$1`
//! inside the script. Scripts stand in for the external coding CLI.

#![cfg(unix)]

use conductor_core::error::AgentError;
use conductor_core::{
    AgentConfig, AgentEvent, AgentStatus, CommandConfig, Error, EventKind, EventReceiver,
    Orchestrator, OrchestratorConfig, StartOptions, StartOutcome,
};
use futures::future::join_all;
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::timeout;
use tokio_test::{assert_err, assert_ok};

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Helper: orchestrator whose agents run `script` under sh
fn sh_orchestrator(script: &str) -> Orchestrator {
    let config = OrchestratorConfig {
        command: CommandConfig {
            program: "sh".to_string(),
            base_args: vec!["-c".to_string(), script.to_string(), "agent".to_string()],
            ..Default::default()
        },
        termination_timeout_ms: 500,
        kill_timeout_ms: 3000,
        output_drain_timeout_ms: 200,
        ..Default::default()
    };
    Orchestrator::new(config).unwrap()
}

/// Helper: a fresh agent working in its own temp directory
fn create_agent(orchestrator: &Orchestrator) -> (String, TempDir) {
    let dir = TempDir::new().unwrap();
    let record = orchestrator
        .create_agent(AgentConfig::new(dir.path().to_string_lossy()))
        .unwrap();
    (record.id, dir)
}

/// Helper: next event matching `pred`, skipping everything else
async fn wait_for<F>(rx: &mut EventReceiver, pred: F) -> AgentEvent
where
    F: Fn(&AgentEvent) -> bool,
{
    loop {
        let event = timeout(EVENT_TIMEOUT, rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        if pred(&event) {
            return event;
        }
    }
}

fn is_completed(event: &AgentEvent) -> bool {
    matches!(event, AgentEvent::Completed { .. })
}

fn is_output(text: &str) -> impl Fn(&AgentEvent) -> bool + '_ {
    move |event| matches!(event, AgentEvent::Output { data, .. } if data == text)
}

/// Helper: every event up to and including the first Completed
async fn collect_run(rx: &mut EventReceiver) -> Vec<AgentEvent> {
    let mut events = Vec::new();
    loop {
        let event = timeout(EVENT_TIMEOUT, rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        let done = is_completed(&event);
        events.push(event);
        if done {
            return events;
        }
    }
}

/// Helper: `pid` is dead, or a zombie waiting to be reaped by its new parent
fn is_gone(pid: i32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid), None) {
        Err(Errno::ESRCH) => true,
        _ => std::fs::read_to_string(format!("/proc/{}/stat", pid))
            .map(|stat| {
                stat.rsplit(')')
                    .next()
                    .is_some_and(|rest| rest.trim_start().starts_with('Z'))
            })
            .unwrap_or(false),
    }
}

async fn wait_until_gone(pid: i32) -> bool {
    for _ in 0..100 {
        if is_gone(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Compact rendering so whole event sequences can be compared
fn describe(event: &AgentEvent) -> String {
    match event {
        AgentEvent::Output { data, .. } => format!("output:{}", data),
        AgentEvent::ErrorOutput { data, .. } => format!("stderr:{}", data),
        AgentEvent::StatusChanged { status, .. } => format!("status:{}", status),
        AgentEvent::Completed { exit_code, .. } => format!("completed:{}", exit_code),
    }
}

// ===========================================================================
// Restart scenario
// ===========================================================================

#[tokio::test]
async fn test_restart_scenario() {
    let orchestrator = sh_orchestrator(
        r#"if [ "$1" = "next task" ]; then read hold; fi; echo "Tool: grep"; echo "task $1""#,
    );
    let (id, _dir) = create_agent(&orchestrator);
    assert_eq!(orchestrator.get_agent(&id).unwrap().status, AgentStatus::Idle);

    let mut rx = orchestrator.subscribe_channel(&EventKind::ALL);
    let outcome = assert_ok!(
        orchestrator
            .start_agent(&id, "fix bug", StartOptions::default())
            .await
    );
    assert!(!outcome.was_redirected());

    let events: Vec<String> = collect_run(&mut rx).await.iter().map(describe).collect();
    assert_eq!(
        events,
        vec![
            "status:running",
            "output:Tool: grep",
            "output:task fix bug",
            "status:completed",
            "completed:0",
        ]
    );

    let record = orchestrator.get_agent(&id).unwrap();
    assert_eq!(record.status, AgentStatus::Completed);
    assert_eq!(record.exit_code, Some(0));
    assert_eq!(record.output, vec!["Tool: grep", "task fix bug"]);
    assert!(record.error.is_none());
    assert!(record.pid.is_none());

    // Second run blocks on stdin before printing anything
    assert_ok!(
        orchestrator
            .start_agent(&id, "next task", StartOptions::default())
            .await
    );
    let record = orchestrator.get_agent(&id).unwrap();
    assert_eq!(record.status, AgentStatus::Running);
    assert!(record.output.is_empty(), "restart must clear output");
    assert!(record.exit_code.is_none());
    assert!(record.pid.is_some());

    assert_ok!(orchestrator.stop_agent(&id).await);
}

// ===========================================================================
// Exit-code mapping
// ===========================================================================

#[tokio::test]
async fn test_exit_code_mapping() {
    let cases = [
        ("exit 0", 0, AgentStatus::Completed),
        ("echo boom; exit 1", 1, AgentStatus::Error),
        ("kill -9 $$", 137, AgentStatus::Error),
    ];

    for (script, code, status) in cases {
        let orchestrator = sh_orchestrator(script);
        let (id, _dir) = create_agent(&orchestrator);
        let mut rx = orchestrator.subscribe_channel(&[EventKind::Completed]);

        orchestrator
            .start_agent(&id, "", StartOptions::default())
            .await
            .unwrap();

        match wait_for(&mut rx, is_completed).await {
            AgentEvent::Completed { exit_code, .. } => {
                assert_eq!(exit_code, code, "script: {}", script)
            }
            other => panic!("unexpected {:?}", other),
        }

        let record = orchestrator.get_agent(&id).unwrap();
        assert_eq!(record.status, status, "script: {}", script);
        assert_eq!(record.exit_code, Some(code));
        if code == 0 {
            assert!(record.error.is_none());
        } else {
            let error = record.error.expect("error should be populated");
            assert!(
                error.contains(&format!("code {}", code)),
                "unexpected error text: {}",
                error
            );
        }
    }
}

#[tokio::test]
async fn test_error_captures_output_tail() {
    let orchestrator =
        sh_orchestrator("echo compiling; echo 'error[E0308]: mismatched types' 1>&2; exit 101");
    let (id, _dir) = create_agent(&orchestrator);
    let mut rx =
        orchestrator.subscribe_channel(&[EventKind::ErrorOutput, EventKind::Completed]);

    orchestrator
        .start_agent(&id, "", StartOptions::default())
        .await
        .unwrap();

    let events: Vec<String> = collect_run(&mut rx).await.iter().map(describe).collect();
    assert_eq!(
        events,
        vec!["stderr:error[E0308]: mismatched types", "completed:101"]
    );

    let error = orchestrator.get_agent(&id).unwrap().error.unwrap();
    assert!(error.contains("compiling"));
    assert!(error.contains("mismatched types"));
}

// ===========================================================================
// Single process per agent
// ===========================================================================

#[tokio::test]
async fn test_concurrent_starts_spawn_one_process() {
    let orchestrator = sh_orchestrator(r#"while read line; do echo "got $line"; done"#);
    let (id, _dir) = create_agent(&orchestrator);

    let starts = (0..10).map(|i| {
        let orchestrator = orchestrator.clone();
        let id = id.clone();
        tokio::spawn(async move {
            orchestrator
                .start_agent(&id, &format!("prompt {}", i), StartOptions::default())
                .await
        })
    });
    let outcomes: Vec<StartOutcome> = join_all(starts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let started = outcomes.iter().filter(|o| !o.was_redirected()).count();
    assert_eq!(started, 1, "outcomes: {:?}", outcomes);
    assert_eq!(orchestrator.running_agents().await, vec![id.clone()]);

    assert_ok!(orchestrator.stop_agent(&id).await);
    assert!(orchestrator.running_agents().await.is_empty());
}

#[tokio::test]
async fn test_start_while_running_redirects_to_input() {
    let orchestrator =
        sh_orchestrator(r#"echo "started $1"; while read line; do echo "input $line"; done"#);
    let (id, _dir) = create_agent(&orchestrator);
    let mut rx = orchestrator.subscribe_channel(&[EventKind::Output]);

    orchestrator
        .start_agent(&id, "first", StartOptions::default())
        .await
        .unwrap();
    wait_for(&mut rx, is_output("started first")).await;
    let pid = orchestrator.get_agent(&id).unwrap().pid;

    let outcome = orchestrator
        .start_agent(&id, "new prompt", StartOptions::default())
        .await
        .unwrap();
    assert_eq!(
        outcome,
        StartOutcome::Redirected {
            previous: AgentStatus::Running
        }
    );
    assert!(outcome.message().contains("was already running"));

    wait_for(&mut rx, is_output("input new prompt")).await;
    assert_eq!(orchestrator.get_agent(&id).unwrap().pid, pid);
    assert_eq!(orchestrator.running_agents().await.len(), 1);

    assert_ok!(orchestrator.stop_agent(&id).await);
}

#[tokio::test]
async fn test_shutdown_stops_every_agent() {
    let orchestrator = sh_orchestrator("echo ready; while :; do sleep 0.1; done");
    let (a, _dir_a) = create_agent(&orchestrator);
    let (b, _dir_b) = create_agent(&orchestrator);
    let mut output = orchestrator.subscribe_channel(&[EventKind::Output]);
    let mut completed = orchestrator.subscribe_channel(&[EventKind::Completed]);

    for id in [&a, &b] {
        orchestrator
            .start_agent(id, "", StartOptions::default())
            .await
            .unwrap();
    }
    wait_for(&mut output, is_output("ready")).await;
    wait_for(&mut output, is_output("ready")).await;

    let mut expected = vec![a.clone(), b.clone()];
    expected.sort();
    assert_eq!(orchestrator.running_agents().await, expected);

    assert_ok!(orchestrator.shutdown().await);
    assert!(orchestrator.running_agents().await.is_empty());
    assert!(completed.try_recv().is_none(), "stop must not emit Completed");
    for id in [&a, &b] {
        let record = orchestrator.get_agent(id).unwrap();
        assert_eq!(record.status, AgentStatus::Idle);
        assert!(record.pid.is_none());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_racing_start_leaves_consistent_state() {
    let orchestrator = sh_orchestrator("while read line; do :; done");
    let (id, _dir) = create_agent(&orchestrator);
    let sequence = Arc::new(AtomicUsize::new(0));

    for round in 0..25 {
        let start = tokio::spawn({
            let orchestrator = orchestrator.clone();
            let id = id.clone();
            let sequence = Arc::clone(&sequence);
            async move {
                let outcome = orchestrator
                    .start_agent(&id, "go", StartOptions::default())
                    .await;
                (outcome, sequence.fetch_add(1, Ordering::SeqCst))
            }
        });
        let stop = tokio::spawn({
            let orchestrator = orchestrator.clone();
            let id = id.clone();
            let sequence = Arc::clone(&sequence);
            async move {
                let result = orchestrator.stop_agent(&id).await;
                (result, sequence.fetch_add(1, Ordering::SeqCst))
            }
        });

        let (outcome, started_at) = start.await.unwrap();
        let (stopped, stopped_at) = stop.await.unwrap();
        let outcome = outcome.unwrap();
        assert!(!outcome.was_redirected(), "round {}: {:?}", round, outcome);
        assert_ok!(stopped);

        let running = orchestrator.running_agents().await;
        assert!(running.len() <= 1, "round {}: {:?}", round, running);

        let record = orchestrator.get_agent(&id).unwrap();
        if started_at > stopped_at {
            assert_eq!(record.status, AgentStatus::Running, "round {}", round);
            assert_eq!(running, vec![id.clone()]);
            assert!(record.pid.is_some());
        } else {
            assert_eq!(record.status, AgentStatus::Idle, "round {}", round);
            assert!(running.is_empty());
            assert!(record.pid.is_none());
        }

        assert_ok!(orchestrator.stop_agent(&id).await);
        assert!(!orchestrator.is_running(&id).await);
    }
}

// ===========================================================================
// Ordering
// ===========================================================================

#[tokio::test]
async fn test_output_order_per_subscriber() {
    let orchestrator =
        sh_orchestrator(r#"i=1; while [ $i -le 200 ]; do echo "line $i"; i=$((i+1)); done"#);
    let (id, _dir) = create_agent(&orchestrator);
    let mut first = orchestrator.subscribe_channel(&[EventKind::Output, EventKind::Completed]);
    let mut second = orchestrator.subscribe_channel(&[EventKind::Output, EventKind::Completed]);

    orchestrator
        .start_agent(&id, "", StartOptions::default())
        .await
        .unwrap();

    let expected: Vec<String> = (1..=200).map(|i| format!("output:line {}", i)).collect();
    for rx in [&mut first, &mut second] {
        let mut events: Vec<String> = collect_run(rx).await.iter().map(describe).collect();
        assert_eq!(events.pop().as_deref(), Some("completed:0"));
        assert_eq!(events, expected);
    }
}

#[tokio::test]
async fn test_handler_subscription_receives_completion() {
    let orchestrator = sh_orchestrator("exit 0");
    let (id, _dir) = create_agent(&orchestrator);

    let (tx, rx) = std::sync::mpsc::channel();
    let subscription = orchestrator.subscribe(EventKind::Completed, move |event| {
        let _ = tx.send(event.agent_id().to_string());
    });

    orchestrator
        .start_agent(&id, "", StartOptions::default())
        .await
        .unwrap();

    let got = tokio::task::spawn_blocking(move || rx.recv_timeout(EVENT_TIMEOUT))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got, id);
    subscription.unsubscribe();
}

// ===========================================================================
// Stop / input / removal
// ===========================================================================

#[tokio::test]
async fn test_stop_is_idempotent() {
    let orchestrator = sh_orchestrator("echo ready; while :; do sleep 0.1; done");
    let (id, _dir) = create_agent(&orchestrator);
    let mut rx = orchestrator.events().subscribe_all();

    orchestrator
        .start_agent(&id, "", StartOptions::default())
        .await
        .unwrap();
    wait_for(&mut rx, is_output("ready")).await;

    assert_ok!(orchestrator.stop_agent(&id).await);
    assert_eq!(orchestrator.get_agent(&id).unwrap().status, AgentStatus::Idle);
    assert_ok!(orchestrator.stop_agent(&id).await);
    assert_eq!(orchestrator.get_agent(&id).unwrap().status, AgentStatus::Idle);

    let mut rest = Vec::new();
    while let Some(event) = rx.try_recv() {
        rest.push(describe(&event));
    }
    assert_eq!(rest, vec!["status:idle"]);
    assert!(!orchestrator.is_running(&id).await);
}

#[tokio::test]
async fn test_stop_escalates_when_sigterm_ignored() {
    let orchestrator = sh_orchestrator("trap '' TERM; echo ready; while :; do sleep 0.05; done");
    let (id, _dir) = create_agent(&orchestrator);
    let mut rx = orchestrator.subscribe_channel(&[EventKind::Output]);

    orchestrator
        .start_agent(&id, "", StartOptions::default())
        .await
        .unwrap();
    wait_for(&mut rx, is_output("ready")).await;

    assert_ok!(orchestrator.stop_agent(&id).await);
    let record = orchestrator.get_agent(&id).unwrap();
    assert_eq!(record.status, AgentStatus::Idle);
    assert_eq!(record.exit_code, Some(137));
}

#[tokio::test]
async fn test_input_after_completion_is_not_running() {
    let orchestrator = sh_orchestrator("echo done");
    let (id, _dir) = create_agent(&orchestrator);
    let mut rx = orchestrator.subscribe_channel(&[EventKind::StatusChanged]);

    orchestrator
        .start_agent(&id, "", StartOptions::default())
        .await
        .unwrap();
    wait_for(&mut rx, |event| {
        matches!(
            event,
            AgentEvent::StatusChanged {
                status: AgentStatus::Completed,
                ..
            }
        )
    })
    .await;

    let err = assert_err!(orchestrator.send_input(&id, "too late").await);
    assert!(err.is_not_running(), "unexpected error: {}", err);
}

#[tokio::test]
async fn test_waiting_prompt_and_input() {
    let orchestrator = sh_orchestrator(
        r#"echo "Apply these changes? (y/n)"; read answer; echo "answer $answer"; read hold"#,
    );
    let (id, _dir) = create_agent(&orchestrator);
    let mut status_rx = orchestrator.subscribe_channel(&[EventKind::StatusChanged]);
    let mut output_rx = orchestrator.subscribe_channel(&[EventKind::Output]);

    orchestrator
        .start_agent(&id, "", StartOptions::default())
        .await
        .unwrap();
    wait_for(&mut status_rx, |event| {
        matches!(
            event,
            AgentEvent::StatusChanged {
                status: AgentStatus::Waiting,
                ..
            }
        )
    })
    .await;
    let record = orchestrator.get_agent(&id).unwrap();
    assert_eq!(record.status, AgentStatus::Waiting);
    assert_eq!(
        record.current_task_summary.as_deref(),
        Some("Apply these changes? (y/n)")
    );

    assert_ok!(orchestrator.send_input(&id, "y").await);
    assert_eq!(orchestrator.get_agent(&id).unwrap().status, AgentStatus::Running);
    wait_for(&mut output_rx, is_output("answer y")).await;

    assert_ok!(orchestrator.remove_agent(&id).await);
}

#[tokio::test]
async fn test_remove_terminates_process() {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let orchestrator = sh_orchestrator("echo ready; while :; do sleep 0.1; done");
    let (id, _dir) = create_agent(&orchestrator);
    let mut rx = orchestrator.subscribe_channel(&[EventKind::Output]);

    orchestrator
        .start_agent(&id, "", StartOptions::default())
        .await
        .unwrap();
    wait_for(&mut rx, is_output("ready")).await;
    let pid = orchestrator.get_agent(&id).unwrap().pid.unwrap();

    assert_ok!(orchestrator.remove_agent(&id).await);
    assert!(orchestrator.get_agent(&id).unwrap_err().is_not_found());
    assert!(orchestrator.list_agents().is_empty());
    assert_eq!(kill(Pid::from_raw(pid as i32), None), Err(Errno::ESRCH));

    let err = assert_err!(orchestrator.send_input(&id, "x").await);
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_background_children_do_not_outlive_agent() {
    let orchestrator = sh_orchestrator("sleep 30 >/dev/null 2>&1 & echo $!; exit 0");
    let mut rx = orchestrator.subscribe_channel(&[EventKind::Completed]);

    let (stopped, _dir_a) = create_agent(&orchestrator);
    let (removed, _dir_b) = create_agent(&orchestrator);
    let mut background = Vec::new();
    for id in [&stopped, &removed] {
        orchestrator
            .start_agent(id, "", StartOptions::default())
            .await
            .unwrap();
        let event = wait_for(&mut rx, |e| e.agent_id() == id.as_str()).await;
        assert!(matches!(event, AgentEvent::Completed { exit_code: 0, .. }));

        let pid: i32 = orchestrator.get_agent(id).unwrap().output[0].parse().unwrap();
        background.push(pid);
    }

    // The CLI exited but left its tool running
    assert!(!is_gone(background[0]));

    assert_ok!(orchestrator.stop_agent(&stopped).await);
    assert!(wait_until_gone(background[0]).await, "survived stop_agent");

    assert_ok!(orchestrator.remove_agent(&removed).await);
    assert!(wait_until_gone(background[1]).await, "survived remove_agent");
}

// ===========================================================================
// Spawn failures
// ===========================================================================

#[tokio::test]
async fn test_spawn_failure_reports_error() {
    let config = OrchestratorConfig {
        command: CommandConfig {
            program: "conductor-test-missing-binary".to_string(),
            ..Default::default()
        },
        ..Default::default()
    };
    let orchestrator = Orchestrator::new(config).unwrap();
    let (id, _dir) = create_agent(&orchestrator);
    let mut rx = orchestrator.subscribe_channel(&[EventKind::StatusChanged]);

    let err = assert_err!(
        orchestrator
            .start_agent(&id, "hello", StartOptions::default())
            .await
    );
    assert!(
        matches!(err, Error::Agent(AgentError::ProcessSpawnFailed { .. })),
        "unexpected error: {:?}",
        err
    );

    let record = orchestrator.get_agent(&id).unwrap();
    assert_eq!(record.status, AgentStatus::Error);
    assert!(record.error.is_some());
    assert_eq!(
        rx.try_recv().map(|e| describe(&e)).as_deref(),
        Some("status:error")
    );
    assert!(!orchestrator.is_running(&id).await);
}

#[tokio::test]
async fn test_missing_project_directory_fails_to_spawn() {
    let orchestrator = sh_orchestrator("true");
    let record = orchestrator
        .create_agent(AgentConfig::new("/nonexistent/conductor/project"))
        .unwrap();

    let err = assert_err!(
        orchestrator
            .start_agent(&record.id, "", StartOptions::default())
            .await
    );
    assert!(matches!(
        err,
        Error::Agent(AgentError::ProcessSpawnFailed { .. })
    ));
}
