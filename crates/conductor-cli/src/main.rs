//! Conductor - headless host for one supervised coding agent.
//!
//! Creates an agent for a project directory, starts it on a prompt and
//! streams its events until the process exits. Lines typed on stdin are
//! forwarded to the agent; Ctrl-C stops it.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use conductor_core::{AgentConfig, AgentEvent, Orchestrator, OrchestratorConfig, StartOptions};

/// Exit code reported when the run is interrupted with Ctrl-C
const INTERRUPTED: i32 = 130;

/// Run a coding agent CLI under supervision.
#[derive(Parser)]
#[command(name = "conductor")]
#[command(author, version, about = "Run a coding agent CLI under supervision", long_about = None)]
struct Cli {
    /// Project directory the agent works in
    #[arg(short = 'C', long, default_value = ".")]
    project: PathBuf,

    /// Display name for the agent
    #[arg(short, long)]
    name: Option<String>,

    /// Skill tag passed to the agent (repeatable)
    #[arg(short, long = "skill")]
    skills: Vec<String>,

    /// Model to request from the agent CLI
    #[arg(short, long, env = "CONDUCTOR_MODEL")]
    model: Option<String>,

    /// Session to resume
    #[arg(short, long)]
    resume: Option<String>,

    /// Config file (defaults to <config dir>/conductor/config.toml)
    #[arg(short, long, env = "CONDUCTOR_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter, e.g. "debug" or "conductor_core=trace" (overrides RUST_LOG)
    #[arg(long)]
    log_level: Option<String>,

    /// Print every event as a JSON line
    #[arg(long)]
    json: bool,

    /// Prompt for the agent
    #[arg(required = true, trailing_var_arg = true)]
    prompt: Vec<String>,
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    // Logs go to stderr; stdout carries agent output
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    match run(cli).await {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(e) => {
            eprintln!("conductor: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let config = OrchestratorConfig::load_or_default(cli.config.as_deref())
        .context("Failed to load configuration")?
        .apply_env_overrides();
    let orchestrator = Orchestrator::new(config).context("Invalid configuration")?;

    let project = cli
        .project
        .canonicalize()
        .with_context(|| format!("Project directory {:?} not found", cli.project))?;

    let mut agent = AgentConfig::new(project.to_string_lossy()).with_skills(cli.skills);
    if let Some(name) = cli.name {
        agent = agent.with_name(name);
    }
    let id = orchestrator.create_agent(agent)?.id;

    let mut options = StartOptions::default();
    if let Some(model) = cli.model {
        options = options.with_model(model);
    }
    if let Some(session) = cli.resume {
        options = options.with_resume(session);
    }

    // Subscribe before starting so no event is missed
    let mut events = orchestrator.events().subscribe_all();

    let prompt = cli.prompt.join(" ");
    let outcome = orchestrator
        .start_agent(&id, &prompt, options)
        .await
        .context("Failed to start agent")?;
    info!("{} ({})", outcome.message(), id);

    tokio::spawn(forward_stdin(orchestrator.clone(), id.clone()));

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    bail!("Event stream closed");
                };
                print_event(&event, cli.json)?;
                if let AgentEvent::Completed { exit_code, .. } = event {
                    return Ok(exit_code);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping agent {}", id);
                orchestrator.shutdown().await.context("Failed to stop agent")?;
                return Ok(INTERRUPTED);
            }
        }
    }
}

fn print_event(event: &AgentEvent, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }

    match event {
        AgentEvent::Output { data, .. } => println!("{}", data),
        AgentEvent::ErrorOutput { data, .. } => eprintln!("{}", data),
        AgentEvent::StatusChanged { status, .. } => info!("Agent status: {}", status),
        AgentEvent::Completed { exit_code, .. } => info!("Agent exited with code {}", exit_code),
    }
    Ok(())
}

/// Forward terminal lines to the agent's stdin until EOF
async fn forward_stdin(orchestrator: Orchestrator, id: String) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Err(e) = orchestrator.send_input(&id, &line).await {
                    warn!("Input not delivered: {}", e);
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read stdin: {}", e);
                break;
            }
        }
    }
    debug!("Stdin forwarding ended");
}
