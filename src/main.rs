//! Hydra Agent - gateway relay for the Hydra Gate coordinator
//!
//! The agent connects to the coordinator over Socket.IO, registers itself,
//! relays every work request to the target service over HTTP, and reports
//! each outcome back on the request's completion event.

mod cli;
mod config;
mod coordinator;
mod error;
mod logging;
mod protocol;
mod relay;
mod types;
mod version;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{debug, error, info, warn};

use crate::cli::{Cli, Command, ConfigCommand, OutputArgs};
use crate::config::AgentConfig;
use crate::coordinator::{ClientEvent, ConnectionManager};
use crate::error::{Error, Result};
use crate::relay::{HttpTarget, RelayDispatcher};
use crate::types::{AgentIdentity, Credential};
use crate::version::Build;

/// Interval of the periodic relay status log
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

fn main() {
    let cli = Cli::parse();

    let outcome = match cli.command {
        Command::Version => {
            print!("{}", Build::current());
            Ok(())
        }
        Command::Config(command) => config_command(command),
        Command::Run { config } => run(config.as_deref(), cli.output),
    };

    if let Err(e) = outcome {
        eprint!("{}", e.terminal_report());
        std::process::exit(e.exit_code());
    }
}

fn run(config_path: Option<&str>, output: OutputArgs) -> Result<()> {
    let config = AgentConfig::load(config_path)?;

    // Dropping the guard flushes the file writer
    let _log_guard = logging::init_logging(&config.logging, output.verbose, output.quiet)?;

    let build = Build::current();
    info!(
        version = %build.describe(),
        target = build.target,
        profile = build.profile,
        "Starting Hydra agent"
    );

    // Dispatches interleave with the connection loop on a single thread.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create async runtime: {}", e)))?;

    runtime.block_on(relay_until_stopped(config)).map_err(|e| {
        error!(error = %e.log_line(), "Agent stopped");
        e
    })
}

/// Own the channel and the dispatcher until Ctrl+C or a fatal channel error
async fn relay_until_stopped(config: AgentConfig) -> Result<()> {
    let identity = AgentIdentity::from_config(config.agent.id.as_deref());
    let credential = Credential::new(config.agent.token.clone());

    let target = HttpTarget::new(&config.target_options())?;
    let (dispatcher, mut results) = RelayDispatcher::new(config.dispatcher_config()?, Arc::new(target));

    let mut connection = ConnectionManager::new(config.connection_config(), identity, credential);
    info!(
        agent_id = %connection.identity(),
        coordinator = %config.coordinator.url,
        target = %config.target.base_url,
        revision = %config.coordinator.engine_revision,
        "Connecting to coordinator"
    );
    let mut events = connection.connect().await?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut status = tokio::time::interval(STATUS_INTERVAL);
    status.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut channel_open = true;
    let outcome = loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted, shutting down");
                break Ok(());
            }

            event = events.recv(), if channel_open => match event {
                Some(event) => {
                    if let Err(e) = on_client_event(event, &dispatcher, &connection) {
                        break Err(e);
                    }
                }
                None => {
                    warn!("Coordinator connection loop ended; waiting for Ctrl+C");
                    channel_open = false;
                }
            },

            Some(result) = results.recv() => {
                info!(id = %result.id, success = result.success, event = result.event_name(), "==> work result");
                if let Err(e) = connection.send_result(result) {
                    warn!(error = %e, "Work result dropped");
                }
            }

            _ = status.tick() => {
                let tracker = dispatcher.tracker();
                debug!(
                    state = ?connection.session_state(),
                    registered = connection.is_registered(),
                    sid = ?connection.session_id(),
                    in_flight = tracker.in_flight_count(),
                    dispatched = tracker.dispatched_count(),
                    succeeded = tracker.succeeded_count(),
                    failed = tracker.failed_count(),
                    "Relay status"
                );
            }
        }
    };

    if let Err(e) = connection.shutdown().await {
        warn!(error = %e, "Error closing coordinator channel");
    }

    let tracker = dispatcher.tracker();
    info!(
        dispatched = tracker.dispatched_count(),
        succeeded = tracker.succeeded_count(),
        failed = tracker.failed_count(),
        registrations = connection.registrations(),
        "Agent stopped"
    );
    let abandoned = tracker.in_flight_ids();
    if !abandoned.is_empty() {
        warn!(ids = ?abandoned, "Abandoning in-flight relays");
    }

    outcome
}

/// React to one channel event; only a fatal channel error stops the agent
fn on_client_event(
    event: ClientEvent,
    dispatcher: &RelayDispatcher,
    connection: &ConnectionManager,
) -> Result<()> {
    match event {
        ClientEvent::Connected => info!("Connected to coordinator"),
        ClientEvent::Welcomed { greeting } => debug!(greeting = ?greeting, "Welcomed"),
        ClientEvent::Registered { session_id } => {
            info!(sid = ?session_id, agent_id = %connection.identity(), "Registered");
        }
        ClientEvent::WorkRequest(request) => {
            info!(
                id = %request.id,
                kind = %request.kind,
                method = ?request.method,
                path = ?request.path,
                sent_at = ?request.sent_at,
                "<== work request"
            );
            dispatcher.submit(request);
        }
        ClientEvent::Disconnected { reason } => warn!(
            reason = %reason,
            in_flight = dispatcher.tracker().in_flight_count(),
            "Disconnected from coordinator"
        ),
        ClientEvent::Reconnecting { attempt, delay } => {
            info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting");
        }
        ClientEvent::Error { message, fatal: true } => {
            return Err(Error::ChannelClosed(message));
        }
        ClientEvent::Error { message, fatal: false } => warn!(message = %message, "Channel error"),
    }
    Ok(())
}

fn config_command(command: ConfigCommand) -> Result<()> {
    logging::init_for_command(tracing::Level::WARN)?;

    match command {
        ConfigCommand::Show(file) => {
            let config = AgentConfig::load(file.config.as_deref())?;
            print!("{}", toml::to_string_pretty(&config)?);
        }
        ConfigCommand::Init { path, force } => {
            let written = config::init_config(path.as_deref(), force)?;
            println!("Configuration file created: {}", written.display());
        }
        ConfigCommand::Validate(file) => {
            AgentConfig::load(file.config.as_deref())?;
            println!("Configuration is valid.");
        }
    }
    Ok(())
}
