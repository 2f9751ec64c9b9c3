use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use relay_coordination::{FileHeartbeatStore, HeartbeatStore, WorkerReport};
use relay_daemon::{
    new_coordinator_registry, AgentRuntime, ClientOptions, DaemonState, RelayAddr, RelayClient,
    RelayConfig, RelayServer,
};
use relay_protocol::SendPayload;
use relay_storage::{open_channel_store, open_store, StorageDriver};

#[derive(Debug, Parser)]
#[command(name = "agent-relay")]
#[command(about = "Message relay and coordination daemon for local agents")]
struct Cli {
    /// Config file (defaults to the per-user config directory).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the relay daemon.
    Serve(ServeCommand),
    /// Connect as an agent and run the coordination runtime.
    Agent(AgentCommand),
    /// Send one message and exit.
    Send(SendCommand),
    /// Report task progress to the current lead.
    Report(ReportCommand),
    /// Print storage health and recent sessions.
    Status(StatusCommand),
}

#[derive(Debug, clap::Args)]
struct ServeCommand {
    /// `unix:/path/to.sock` or `tcp:host:port`.
    #[arg(long)]
    listen: Option<String>,
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Use the 4-byte length-prefix framing of older clients.
    #[arg(long)]
    legacy_framing: bool,
    #[arg(long, value_enum)]
    storage: Option<DriverArg>,
}

#[derive(Debug, clap::Args)]
struct AgentCommand {
    #[arg(long)]
    name: String,
    #[arg(long)]
    connect: Option<String>,
    #[arg(long)]
    cli: Option<String>,
    /// Channels to join after connecting.
    #[arg(long, value_delimiter = ',')]
    channels: Vec<String>,
    #[arg(long)]
    task_log: Option<PathBuf>,
    #[arg(long)]
    lead_heartbeat: Option<PathBuf>,
}

#[derive(Debug, clap::Args)]
struct SendCommand {
    #[arg(long, default_value = "cli")]
    from: String,
    /// Agent name, `*`, `#channel` or `project:agent`.
    #[arg(long)]
    to: String,
    #[arg(long)]
    connect: Option<String>,
    #[arg(long)]
    topic: Option<String>,
    /// Wait up to this many milliseconds for the recipient's ACK.
    #[arg(long)]
    wait_ms: Option<u64>,
    body: String,
}

#[derive(Debug, clap::Args)]
struct ReportCommand {
    /// Worker name the report is sent as.
    #[arg(long)]
    name: String,
    #[arg(long)]
    task: String,
    #[arg(long, value_enum)]
    action: ReportAction,
    #[arg(long)]
    reason: Option<String>,
    #[arg(long)]
    connect: Option<String>,
    #[arg(long)]
    lead_heartbeat: Option<PathBuf>,
}

#[derive(Debug, clap::Args)]
struct StatusCommand {
    #[arg(long)]
    data_dir: Option<PathBuf>,
    #[arg(long, default_value_t = 10)]
    limit: usize,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DriverArg {
    Sqlite,
    Jsonl,
    Memory,
}

impl From<DriverArg> for StorageDriver {
    fn from(arg: DriverArg) -> Self {
        match arg {
            DriverArg::Sqlite => StorageDriver::Sqlite,
            DriverArg::Jsonl => StorageDriver::Jsonl,
            DriverArg::Memory => StorageDriver::Memory,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ReportAction {
    Renew,
    Complete,
    Blocked,
}

impl ReportAction {
    fn label(self) -> &'static str {
        match self {
            Self::Renew => "TASK_RENEW",
            Self::Complete => "TASK_COMPLETE",
            Self::Blocked => "TASK_BLOCKED",
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = RelayConfig::load(cli.config.as_deref())?;
    match cli.command {
        Commands::Serve(cmd) => serve(config, cmd).await,
        Commands::Agent(cmd) => run_agent(config, cmd).await,
        Commands::Send(cmd) => send(config, cmd).await,
        Commands::Report(cmd) => report(config, cmd).await,
        Commands::Status(cmd) => status(config, cmd).await,
    }
}

fn init_tracing(json: bool) {
    let builder = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(true);
    let _ = if json {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    };
}

async fn serve(mut config: RelayConfig, cmd: ServeCommand) -> Result<()> {
    if let Some(dir) = cmd.data_dir {
        config.storage.path = dir;
    }
    if let Some(listen) = cmd.listen {
        config.daemon.listen = listen;
    }
    if cmd.legacy_framing {
        config.daemon.legacy_framing = true;
    }
    if let Some(driver) = cmd.storage {
        config.storage.driver = driver.into();
    }

    let state = Arc::new(DaemonState::open(&config).await?);
    let server = RelayServer::new(Arc::clone(&state))?;
    let listen = config.daemon.listen_addr()?;

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Relay server stopped");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
        }
    }

    if let Err(e) = state.store.close().await {
        tracing::warn!(error = %e, "Failed to close storage cleanly");
    }
    if let RelayAddr::Unix(path) = listen {
        let _ = std::fs::remove_file(path);
    }
    Ok(())
}

fn connect_addr(config: &RelayConfig, explicit: Option<&str>) -> Result<RelayAddr> {
    let addr = explicit.unwrap_or(&config.daemon.listen);
    RelayAddr::parse(addr).with_context(|| format!("invalid relay address {addr}"))
}

async fn connect(
    config: &RelayConfig,
    explicit: Option<&str>,
    options: ClientOptions,
) -> Result<RelayClient> {
    let addr = connect_addr(config, explicit)?;
    let options = options.with_frame_mode(config.daemon.frame_mode());
    RelayClient::connect(&addr, options)
        .await
        .with_context(|| format!("connecting to relay at {addr}"))
}

async fn run_agent(mut config: RelayConfig, cmd: AgentCommand) -> Result<()> {
    if let Some(path) = cmd.task_log {
        config.coordination.task_log = path;
    }
    if let Some(path) = cmd.lead_heartbeat {
        config.coordination.lead_heartbeat = path;
    }

    let mut options = ClientOptions::new(cmd.name.clone());
    if let Some(cli) = cmd.cli {
        options = options.with_cli(cli);
    }
    let client = Arc::new(connect(&config, cmd.connect.as_deref(), options).await?);
    for channel in &cmd.channels {
        client.join_channel(channel)?;
    }

    let runtime =
        AgentRuntime::from_config(client, &config.coordination, new_coordinator_registry());
    runtime.start().await?;

    tokio::select! {
        _ = runtime.run() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(agent = %cmd.name, "Interrupted");
        }
    }
    runtime.stop().await;
    Ok(())
}

async fn send(config: RelayConfig, cmd: SendCommand) -> Result<()> {
    let client = connect(&config, cmd.connect.as_deref(), ClientOptions::new(cmd.from)).await?;
    let payload = SendPayload::text(cmd.body);

    match cmd.wait_ms {
        Some(wait_ms) => {
            let ack = client
                .send_and_wait(&cmd.to, &payload, Duration::from_millis(wait_ms))
                .await
                .context("waiting for ACK")?;
            println!("{}", serde_json::to_string_pretty(&ack)?);
        }
        None => {
            let mut envelope = relay_protocol::Envelope::send(&cmd.to, &payload)?;
            envelope.topic = cmd.topic;
            let id = envelope.id.clone();
            client.send_envelope(envelope)?;
            println!("{id}");
        }
    }
    client.close().await?;
    Ok(())
}

async fn report(config: RelayConfig, cmd: ReportCommand) -> Result<()> {
    let heartbeat_path = cmd
        .lead_heartbeat
        .unwrap_or_else(|| config.coordination.lead_heartbeat.clone());
    let lead = FileHeartbeatStore::new(&heartbeat_path)
        .read()
        .await?
        .with_context(|| format!("no lead heartbeat at {}", heartbeat_path.display()))?;

    let report = match cmd.action {
        ReportAction::Renew => WorkerReport::TaskRenew {
            task_id: cmd.task.clone(),
        },
        ReportAction::Complete => WorkerReport::TaskComplete {
            task_id: cmd.task.clone(),
            reason: cmd.reason,
        },
        ReportAction::Blocked => WorkerReport::TaskBlocked {
            task_id: cmd.task.clone(),
            reason: cmd.reason.unwrap_or_else(|| "blocked".to_string()),
        },
    };
    let payload = SendPayload {
        body: format!("{} {}", cmd.action.label(), cmd.task),
        data: Some(report.to_data()),
        ..SendPayload::default()
    };

    let client = connect(&config, cmd.connect.as_deref(), ClientOptions::new(cmd.name)).await?;
    client.send(&lead.lead_name, &payload)?;
    tracing::info!(lead = %lead.lead_name, task_id = %cmd.task, "Report sent");
    client.close().await?;
    Ok(())
}

async fn status(mut config: RelayConfig, cmd: StatusCommand) -> Result<()> {
    if let Some(dir) = cmd.data_dir {
        config.storage.path = dir;
    }
    let store = open_store(&config.storage).await;
    let channels = open_channel_store(config.channels.backend, config.data_dir()).await;

    let health = store.health_check().await;
    let sessions = store.get_recent_sessions(cmd.limit).await?;
    let memberships = channels.all().await?;
    let report = serde_json::json!({
        "health": health,
        "sessions": sessions,
        "channels": memberships,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    store.close().await?;
    Ok(())
}
