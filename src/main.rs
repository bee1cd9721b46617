//! WolfQuorum - Quorum Role State Machine
//!
//! Runs one ensemble member and offers a few diagnostics against running
//! members.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfquorum::config::QuorumConfig;
use wolfquorum::error::{Error, Result};
use wolfquorum::network::{query_leader, StatusListener};
use wolfquorum::peer::{PeerSettings, QuorumPeer};
use wolfquorum::roles::StandbyRoles;
use wolfquorum::state::{EpochFile, EpochStore, PeerStatus};
use wolfquorum::storage::VolatileStorage;

/// WolfQuorum - Quorum Role State Machine
#[derive(Parser)]
#[command(name = "wolfquorum")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfquorum.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the quorum peer
    Start,

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfquorum.toml")]
        output: PathBuf,

        /// Server id
        #[arg(long, default_value_t = 1)]
        node_id: u64,
    },

    /// Ask a member who it believes the leader is
    Query {
        /// Quorum address of the member (host:port)
        address: SocketAddr,
    },

    /// Print a member's status report
    Stat {
        /// Client address of the member (host:port)
        address: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => run_start(cli.config, cli.log_level).await,
        Commands::Validate => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"), "pretty");
            run_validate(cli.config)
        }
        Commands::Info => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"), "pretty");
            run_info(cli.config)
        }
        Commands::Init { output, node_id } => run_init(output, node_id),
        Commands::Query { address } => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"), "pretty");
            run_query(address).await
        }
        Commands::Stat { address } => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"), "pretty");
            run_stat(address).await
        }
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "compact" {
        registry.with(tracing_subscriber::fmt::layer().compact()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Start the quorum peer
async fn run_start(config_path: PathBuf, log_level: Option<String>) -> Result<()> {
    let config = QuorumConfig::from_file(&config_path)?;
    init_logging(
        log_level.as_deref().unwrap_or(&config.logging.level),
        &config.logging.format,
    );

    tracing::info!("Starting WolfQuorum node {}...", config.node.id);
    tracing::info!(
        "Ensemble of {} servers, quorum size {}, election {}",
        config.quorum.servers.len(),
        config.quorum_size(),
        config.quorum.election
    );

    let status = PeerStatus::shared(config.node.id);
    let listener = Arc::new(StatusListener::new(
        config.node.client_address,
        Arc::clone(&status),
    ));
    let storage = Arc::new(VolatileStorage::new(0));

    let peer = QuorumPeer::new(
        PeerSettings::from(&config),
        status,
        storage,
        listener,
        Arc::new(StandbyRoles),
    )?;

    if let Err(e) = peer.start().await {
        if e.is_fatal() {
            tracing::error!("Fatal startup error, refusing to serve: {}", e);
        }
        return Err(e);
    }

    let summary = peer.summary().await;
    match toml::to_string(&summary) {
        Ok(rendered) => tracing::debug!("Peer summary:\n{}", rendered),
        Err(e) => tracing::debug!("Could not render peer summary: {}", e),
    }
    tracing::info!(
        "Node {} up, quorum address {:?}, client address {:?}",
        summary.id,
        peer.quorum_address(),
        peer.client_address()
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");

    peer.shutdown().await;
    tracing::info!("WolfQuorum shutdown complete");
    Ok(())
}

/// Initialize a new configuration file
fn run_init(output: PathBuf, node_id: u64) -> Result<()> {
    let config_content = format!(r#"# WolfQuorum Configuration
# Generated configuration file

[node]
id = {node_id}
data_dir = "/var/lib/wolfquorum/{node_id}"
client_address = "0.0.0.0:2181"
# learner_type = "observer"

[quorum]
tick_time_ms = 2000
init_limit = 10
sync_limit = 5
election = "udp-exchange"
servers = [
    {{ id = 1, address = "10.0.0.1:2888", election_address = "10.0.0.1:3888" }},
    {{ id = 2, address = "10.0.0.2:2888", election_address = "10.0.0.2:3888" }},
    {{ id = 3, address = "10.0.0.3:2888", election_address = "10.0.0.3:3888" }},
    # {{ id = 4, address = "10.0.0.4:2888", learner_type = "observer" }},
]

[logging]
level = "info"
format = "pretty"
"#);

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to describe your ensemble.");
    println!("Then start with: wolfquorum --config {} start", output.display());

    Ok(())
}

/// Validate configuration file
fn run_validate(config_path: PathBuf) -> Result<()> {
    match QuorumConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Server id: {}", config.node.id);
            println!("  Learner type: {}", config.learner_type());
            println!("  Servers: {}", config.quorum.servers.len());
            println!("  Quorum Size: {}", config.quorum_size());
            println!(
                "  Election: {} ({})",
                config.quorum.election,
                config.quorum.election.code()
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show node information
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = QuorumConfig::from_file(&config_path)?;
    let view = config.quorum_view();

    println!("WolfQuorum Node Information");
    println!("===========================");
    println!();
    println!("Server id:        {}", config.node.id);
    println!("Learner type:     {}", config.learner_type());
    println!("Client address:   {}", config.node.client_address);
    println!("Data Directory:   {}", config.data_dir().display());
    println!();
    println!("Ensemble:");
    for server in view.view().values() {
        println!(
            "  {:>4}  {:<22} {}",
            server.id,
            server.addr.to_string(),
            server.learner_type
        );
    }
    println!("  Voting:         {:?}", view.voting_view().keys().collect::<Vec<_>>());
    println!("  Observing:      {:?}", view.observing_view().keys().collect::<Vec<_>>());
    println!("  Quorum Size:    {}", view.quorum_size());
    println!();
    println!("Timing:");
    println!("  Tick:           {} ms", config.quorum.tick_time_ms);
    println!("  Init limit:     {} ticks", config.quorum.init_limit);
    println!("  Sync limit:     {} ticks", config.quorum.sync_limit);
    println!("  Read-only after {} ms", config.read_only_grace().as_millis());
    println!();
    println!("Epochs:");
    let snap_dir = config.snap_dir();
    if snap_dir.exists() {
        let store = EpochStore::new(snap_dir)?;
        for file in [EpochFile::Current, EpochFile::Accepted] {
            match store.read(file) {
                Ok(epoch) => println!("  {:<15} {}", file.file_name(), epoch),
                Err(Error::EpochNotFound(_)) => println!("  {:<15} (not set)", file.file_name()),
                Err(e) => println!("  {:<15} unreadable: {}", file.file_name(), e),
            }
        }
    } else {
        println!("  (no data directory yet)");
    }

    Ok(())
}

/// Ask a member who it believes the leader is
async fn run_query(address: SocketAddr) -> Result<()> {
    match query_leader(address, rand::random(), Duration::from_secs(1)).await {
        Ok(response) => {
            println!("Server:  {}", response.server_id);
            println!("Leader:  {}", response.leader_id);
            match response.zxid {
                Some(zxid) => println!("Zxid:    0x{:x}", zxid),
                None => println!("Zxid:    (not available)"),
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Failed to query {}: {}", address, e);
            Err(e)
        }
    }
}

/// Print a member's status report
async fn run_stat(address: SocketAddr) -> Result<()> {
    let mut stream = TcpStream::connect(address)
        .await
        .map_err(|e| Error::Network(format!("Failed to connect to {}: {}", address, e)))?;
    stream.write_all(b"srvr").await?;

    let mut report = String::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_string(&mut report))
        .await
        .map_err(|_| Error::Network(format!("Timed out reading from {}", address)))??;

    print!("{}", report);
    Ok(())
}
