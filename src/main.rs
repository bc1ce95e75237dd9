#![forbid(unsafe_code)]

//! `agent-conduit` command-line agent gateway binary.
//!
//! `run` streams one prompt through the agent and prints each event as a
//! JSON line. `serve` starts the local socket session server with the
//! message bus, the correlation sweep and the session idle sweep, and runs
//! until ctrl-c or SIGTERM.

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use agent_conduit::bus::AgentBus;
use agent_conduit::client::{AgentClient, AgentRequest, DEFAULT_KEY};
use agent_conduit::config::GlobalConfig;
use agent_conduit::correlation::CorrelationEngine;
use agent_conduit::ipc::{spawn_ipc_server, IpcState};
use agent_conduit::session::{spawn_idle_sweeper, SessionRegistry};
use agent_conduit::stream::StreamEvent;
use agent_conduit::{AppError, Result};

/// Bound on queued bus requests and replies.
const BUS_CAPACITY: usize = 256;

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-conduit", about = "Bounded streaming gateway for CLI agents", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Send one prompt and stream the agent's events to stdout.
    Run {
        /// Prompt text.
        #[arg(long)]
        prompt: String,
        /// Admission key.
        #[arg(long, default_value = DEFAULT_KEY)]
        key: String,
        /// Token budget used to scale the timeout.
        #[arg(long)]
        max_tokens: Option<u32>,
    },
    /// Serve sessions on the configured local socket.
    Serve,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let config = GlobalConfig::load_from_path(&args.config)?;
    info!(binary = %config.agent.binary.display(), "configuration loaded");

    match args.command {
        Command::Run {
            prompt,
            key,
            max_tokens,
        } => run_once(&config, &key, prompt, max_tokens).await,
        Command::Serve => serve(config).await,
    }
}

async fn run_once(
    config: &GlobalConfig,
    key: &str,
    prompt: String,
    max_tokens: Option<u32>,
) -> Result<()> {
    let client = AgentClient::from_config(config);
    let request = AgentRequest {
        prompt,
        max_tokens,
        timeout_seconds: None,
    };

    client
        .stream(key, &request, print_event)
        .await?
        .into_completed()
        .map(|_| ())
}

fn print_event(event: StreamEvent) {
    match serde_json::to_string(&event) {
        Ok(line) => {
            let mut stdout = std::io::stdout().lock();
            if let Err(err) = writeln!(stdout, "{line}") {
                error!(%err, "failed to write event to stdout");
            }
        }
        Err(err) => error!(%err, "failed to encode event"),
    }
}

async fn serve(config: GlobalConfig) -> Result<()> {
    let ct = CancellationToken::new();

    let client = Arc::new(AgentClient::from_config(&config));
    let engine = CorrelationEngine::start(&config.correlation);
    let (bus, bus_tasks) =
        AgentBus::start(Arc::clone(&client), Arc::clone(&engine), BUS_CAPACITY, &ct);
    info!("message bus started");

    let sessions = Arc::new(SessionRegistry::new(config.sessions.max_sessions));
    let sweeper = spawn_idle_sweeper(
        Arc::clone(&sessions),
        config.sessions.idle_timeout(),
        config.sessions.sweep_interval(),
        ct.clone(),
    );

    let state = Arc::new(IpcState {
        client: Arc::clone(&client),
        sessions: Arc::clone(&sessions),
        bus,
    });
    let ipc_handle = spawn_ipc_server(&config.ipc_name, state, ct.clone())?;
    info!(ipc_name = %config.ipc_name, "agent-conduit ready");

    shutdown_signal().await;
    info!("shutdown signal received, stopping");

    ct.cancel();
    client.limiter().close().await;
    let failed = engine.shutdown().await;
    let closed = sessions.shutdown().await;
    info!(failed_replies = failed, closed_sessions = closed, "state drained");

    let _ = sweeper.await;
    let _ = ipc_handle.await;
    for task in bus_tasks {
        let _ = task.await;
    }

    info!("agent-conduit shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Logs go to stderr; stdout carries `run` output.
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
