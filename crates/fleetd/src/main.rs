//! fleetd: the fleet partitioning daemon.
//!
//! Single binary with three roles:
//! - `run`: owns the state database (redb), registers itself, runs the
//!   stale-server reaper and the periodic partition sweep, and serves the
//!   admin API
//! - `join`: a peer server that registers and heartbeats through that API
//! - everything else: one-shot admin commands sent to that API
//!
//! # Usage
//!
//! ```text
//! fleetd --config /etc/fleetd.toml run
//! fleetd --endpoint 10.0.0.5:7081 join --name jon-2
//! fleetd server register jon-3 --address 10.0.0.7
//! fleetd list agent-17
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use fleet_core::{FleetConfig, LogFormat};
use fleet_state::{ExecutionStatus, OperationMode};

mod commands;
mod daemon;
mod join;

#[derive(Parser)]
#[command(name = "fleetd", about = "Fleet partitioning daemon", version)]
struct Cli {
    /// Path to fleetd.toml.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Data directory (overrides storage.data_dir).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Admin API `host:port` of the running daemon (overrides api.endpoint).
    #[arg(long, global = true)]
    endpoint: Option<String>,

    /// Log output format (overrides logging.format): text or json.
    #[arg(long, global = true)]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run this server: own the database, register, heartbeat, sweep stale
    /// servers, process requested repartitions and serve the admin API.
    /// Stops on Ctrl-C.
    Run {
        /// This server's name (overrides server.name).
        #[arg(long)]
        name: Option<String>,

        /// Admin API bind address (overrides api.listen).
        #[arg(long)]
        listen: Option<std::net::SocketAddr>,

        /// Seconds without a heartbeat before a server is forced DOWN.
        #[arg(long)]
        stale_interval: Option<u64>,

        /// Sweep cadence in seconds.
        #[arg(long)]
        sweep_interval: Option<u64>,

        /// Periodic rebalance cadence in seconds (0 disables).
        #[arg(long)]
        rebalance_interval: Option<u64>,
    },
    /// Run a peer server: register with the running daemon and keep its
    /// heartbeat fresh. Stops on Ctrl-C.
    Join {
        /// This server's name (overrides server.name).
        #[arg(long)]
        name: Option<String>,

        /// Heartbeat cadence in seconds (overrides partition.sweep_interval_secs).
        #[arg(long)]
        heartbeat_interval: Option<u64>,
    },
    /// Manage servers.
    Server {
        #[command(subcommand)]
        action: ServerAction,
    },
    /// Manage agents.
    Agent {
        #[command(subcommand)]
        action: AgentAction,
    },
    /// Regenerate every agent's failover list now.
    Repartition {
        #[arg(long, default_value = "operator request")]
        detail: String,
    },
    /// Print an agent's stored failover list.
    List { agent: String },
    /// Print every server with its mode and primary agent count.
    Status,
    /// Print partition events.
    Events {
        /// Only events with this status (IMMEDIATE, REQUESTED, AUDIT, COMPLETED).
        #[arg(long)]
        status: Option<ExecutionStatus>,
    },
}

#[derive(Subcommand)]
enum ServerAction {
    /// Register a server, or refresh a known one. INSTALLED and DOWN servers
    /// come back NORMAL; MAINTENANCE is kept.
    Register {
        name: String,
        #[arg(long, default_value = "127.0.0.1")]
        address: String,
        #[arg(long, default_value = "7080")]
        port: u16,
        #[arg(long)]
        affinity_group: Option<String>,
        #[arg(long, default_value = "1")]
        compute_power: u32,
    },
    /// Delete a server that is not in NORMAL mode.
    Delete { name: String },
    /// Set the operation mode of one or more servers.
    Mode {
        mode: OperationMode,
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Record a heartbeat for a server.
    Heartbeat { name: String },
    /// Set (or clear, without --group) a server's affinity group.
    Affinity {
        name: String,
        #[arg(long)]
        group: Option<String>,
    },
}

#[derive(Subcommand)]
enum AgentAction {
    /// Register an agent and print its failover list.
    Register {
        name: String,
        #[arg(long, default_value = "127.0.0.1")]
        address: String,
        #[arg(long, default_value = "16163")]
        port: u16,
        #[arg(long)]
        affinity_group: Option<String>,
        /// Server the agent reached first; kept as its primary when allowed.
        #[arg(long)]
        server: Option<String>,
    },
    /// Record that an agent connected to a server.
    Connect { agent: String, server: String },
    /// Record that an agent shut down.
    Shutdown { agent: String },
    /// Set (or clear, without --group) an agent's affinity group.
    Affinity {
        name: String,
        #[arg(long)]
        group: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = FleetConfig::load_or_default(cli.config.as_deref())?;
    if let Some(data_dir) = cli.data_dir {
        config.storage.data_dir = data_dir;
    }
    if let Some(format) = cli.log_format.as_deref() {
        config.logging.format = match format {
            "json" => LogFormat::Json,
            "text" => LogFormat::Text,
            other => anyhow::bail!("unknown log format: {other}"),
        };
    }
    init_tracing(&config)?;

    if let Some(endpoint) = cli.endpoint {
        config.api.endpoint = Some(endpoint);
    }

    let client = commands::client(&config);
    match cli.command {
        Command::Run {
            name,
            listen,
            stale_interval,
            sweep_interval,
            rebalance_interval,
        } => {
            if let Some(name) = name {
                config.server.name = name;
            }
            if let Some(listen) = listen {
                config.api.listen = listen;
            }
            if let Some(secs) = stale_interval {
                config.partition.stale_interval_secs = secs;
            }
            if let Some(secs) = sweep_interval {
                config.partition.sweep_interval_secs = secs;
            }
            if let Some(secs) = rebalance_interval {
                config.partition.rebalance_interval_secs = secs;
            }
            config.validate()?;
            daemon::run(config).await
        }
        Command::Join {
            name,
            heartbeat_interval,
        } => {
            if let Some(name) = name {
                config.server.name = name;
            }
            if let Some(secs) = heartbeat_interval {
                config.partition.sweep_interval_secs = secs;
            }
            config.validate()?;
            join::run(config).await
        }
        Command::Server { action } => match action {
            ServerAction::Register {
                name,
                address,
                port,
                affinity_group,
                compute_power,
            } => {
                commands::server_register(
                    &client,
                    fleet_events::ServerRegistration {
                        name,
                        address,
                        port,
                        affinity_group,
                        compute_power,
                    },
                )
                .await
            }
            ServerAction::Delete { name } => commands::server_delete(&client, &name).await,
            ServerAction::Mode { mode, names } => {
                commands::server_mode(&client, &names, mode).await
            }
            ServerAction::Heartbeat { name } => commands::server_heartbeat(&client, &name).await,
            ServerAction::Affinity { name, group } => {
                commands::server_affinity(&client, &name, group).await
            }
        },
        Command::Agent { action } => match action {
            AgentAction::Register {
                name,
                address,
                port,
                affinity_group,
                server,
            } => {
                commands::agent_register(
                    &client,
                    fleet_events::AgentRegistration {
                        name,
                        address,
                        port,
                        affinity_group,
                        registering_server: server,
                    },
                )
                .await
            }
            AgentAction::Connect { agent, server } => {
                commands::agent_connect(&client, &agent, &server).await
            }
            AgentAction::Shutdown { agent } => commands::agent_shutdown(&client, &agent).await,
            AgentAction::Affinity { name, group } => {
                commands::agent_affinity(&client, &name, group).await
            }
        },
        Command::Repartition { detail } => commands::repartition(&client, &detail).await,
        Command::List { agent } => commands::list(&client, &agent).await,
        Command::Status => commands::status(&client).await,
        Command::Events { status } => commands::events(&client, status).await,
    }
}

fn init_tracing(config: &FleetConfig) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&config.logging.filter))?;

    match config.logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }
    Ok(())
}
