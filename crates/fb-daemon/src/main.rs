//! fb-daemon - outbox dispatcher and fleet administration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fleetbeat_core::config::{Config, ConfigOverrides, resolve_config};
use fleetbeat_core::heartbeat::{ExecutableId, HeartbeatRegistry, local_hostname};
use fleetbeat_core::{DeliveryService, MessageOutbox, Store};
use fleetbeat_daemon::{ConfiguredTransport, Dispatcher};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// fb-daemon - outbox dispatcher and fleet administration
#[derive(Parser, Debug)]
#[command(name = "fb-daemon")]
#[command(about = "Heartbeat-partitioned outbox dispatcher")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Database file
    #[arg(long, value_name = "PATH", global = true)]
    database: Option<PathBuf>,

    /// Comma-separated delivery services messages fan out to
    #[arg(long, value_name = "LIST", value_delimiter = ',', global = true)]
    services: Option<Vec<String>>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Dispatch outbox messages until interrupted
    Run {
        /// Heartbeat executable prefix; the service name is appended
        #[arg(long)]
        executable: Option<String>,
        /// Delivery service to drain
        #[arg(long)]
        service: Option<String>,
        /// Run a single tick and print its report
        #[arg(long)]
        once: bool,
    },
    /// List every heartbeat
    Heartbeats {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Count live threads per heartbeat payload
    PayloadCounts {
        #[arg(long)]
        executable: String,
    },
    /// Remove heartbeats, all of them or those older than the given age
    CardiacArrest {
        /// Age in seconds
        #[arg(long, value_name = "SECS")]
        older_than: Option<u64>,
    },
    /// Reap heartbeats of dead local processes and expired rows
    SanityCheck {
        #[arg(long)]
        executable: Option<String>,
    },
    /// Drop every pending message without archiving
    TruncateMessages,
    /// Stage one message
    Enqueue {
        #[arg(long)]
        event_type: String,
        /// JSON payload
        #[arg(long)]
        payload: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.verbose {
        fleetbeat_core::logging::init_with_level(tracing::Level::DEBUG);
    } else {
        fleetbeat_core::logging::init();
    }

    let home_dir =
        fleetbeat_core::home::get_home_dir().context("Failed to determine home directory")?;
    let current_dir = std::env::current_dir().context("Failed to get current directory")?;

    let (executable, service) = match &args.command {
        Command::Run {
            executable, service, ..
        } => (executable.clone(), service.clone()),
        _ => (None, None),
    };
    let overrides = ConfigOverrides {
        config_path: args.config.clone(),
        database: args.database.clone(),
        services: args.services.clone(),
        executable,
        service,
    };
    let config = resolve_config(&overrides, &current_dir, &home_dir)
        .context("Failed to resolve configuration")?;

    let store = Store::from_config(&config.store, &home_dir).context("Failed to open store")?;
    info!("Using store {}", store.path().display());

    match args.command {
        Command::Run { once, .. } => run_dispatcher(store, &config, once).await,
        Command::Heartbeats { json } => list_heartbeats(store, json),
        Command::PayloadCounts { executable } => {
            let registry = HeartbeatRegistry::new(store);
            let counts = registry
                .list_payload_counts(&ExecutableId::new(executable), config.heartbeat.older_than())
                .context("Failed to count payloads")?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
            Ok(())
        }
        Command::CardiacArrest { older_than } => {
            let registry = HeartbeatRegistry::new(store);
            let removed = registry
                .cardiac_arrest(older_than.map(Duration::from_secs))
                .context("Failed to remove heartbeats")?;
            println!("Removed {removed} heartbeat(s)");
            Ok(())
        }
        Command::SanityCheck { executable } => {
            let registry = HeartbeatRegistry::new(store);
            let executable = executable.map(ExecutableId::new);
            registry.sanity_check(
                executable.as_ref(),
                &local_hostname(),
                Some(config.heartbeat.expiration_delay()),
            );
            Ok(())
        }
        Command::TruncateMessages => {
            let outbox = MessageOutbox::new(store, config.outbox.clone());
            let removed = outbox
                .truncate_messages()
                .context("Failed to truncate messages")?;
            println!("Removed {removed} pending message(s)");
            Ok(())
        }
        Command::Enqueue {
            event_type,
            payload,
        } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("Payload is not valid JSON")?;
            let outbox = MessageOutbox::new(store, config.outbox.clone());
            let inserted = outbox
                .add_message(&event_type, &payload)
                .context("Failed to enqueue message")?;
            println!("Staged {inserted} message row(s)");
            Ok(())
        }
    }
}

async fn run_dispatcher(store: Store, config: &Config, once: bool) -> Result<()> {
    let service: DeliveryService = config
        .dispatcher
        .service
        .as_deref()
        .unwrap_or("activemq")
        .parse()
        .context("Invalid dispatcher service")?;
    let transport = ConfiguredTransport::new(service, config.dispatcher.spool_dir.as_deref());
    let dispatcher = Dispatcher::new(store, config, transport);

    if once {
        let report = dispatcher.tick().await.context("Dispatch tick failed")?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let cancel_token = CancellationToken::new();
    let cancel_for_signals = cancel_token.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        cancel_for_signals.cancel();
    });

    let interval = Duration::from_secs(config.dispatcher.interval_secs.max(1));
    fleetbeat_daemon::run(&dispatcher, interval, cancel_token)
        .await
        .context("Dispatcher loop failed")?;

    info!("fb-daemon shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT (Ctrl+C)"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {e}");
                if let Err(e) = ctrl_c.await {
                    warn!("Failed to listen for Ctrl+C: {e}");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = ctrl_c.await {
            warn!("Failed to listen for Ctrl+C: {e}");
        }
        info!("Received Ctrl+C");
    }
}

fn list_heartbeats(store: Store, json: bool) -> Result<()> {
    let registry = HeartbeatRegistry::new(store);
    let rows = registry
        .list_heartbeats()
        .context("Failed to list heartbeats")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!(
        "{:<24} {:<20} {:>8} {:<16} {:<25} {}",
        "EXECUTABLE", "HOST", "PID", "THREAD", "UPDATED", "PAYLOAD"
    );
    for row in rows {
        println!(
            "{:<24} {:<20} {:>8} {:<16} {:<25} {}",
            row.readable.as_deref().unwrap_or("-"),
            row.hostname,
            row.pid,
            row.thread_name.as_deref().unwrap_or("-"),
            row.updated_at.format("%Y-%m-%d %H:%M:%S UTC"),
            row.payload.as_deref().unwrap_or("")
        );
    }
    Ok(())
}
