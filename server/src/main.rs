use clap::Parser;
use log::{info, warn};
use server::config::{RecoveryConfig, SecurityConfig, ServerConfig};
use server::network::Server;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Room tick interval in milliseconds
    #[arg(short, long, default_value = "100")]
    tick_ms: u64,

    /// Maximum concurrent connections across all rooms
    #[arg(long, default_value = "256")]
    max_clients: usize,

    /// Maximum concurrently open rooms
    #[arg(long, default_value = "64")]
    max_rooms: usize,

    /// Directory for snapshots; omit to keep them in memory
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Interval between periodic snapshots in milliseconds
    #[arg(long, default_value = "30000")]
    snapshot_interval_ms: u64,

    /// Snapshots retained per room
    #[arg(long, default_value = "10")]
    max_snapshots: usize,

    /// Milliseconds a disconnected player may stay away outside votes
    #[arg(long, default_value = "60000")]
    player_timeout_ms: u64,

    /// Milliseconds a disconnected player may stay away during votes
    #[arg(long, default_value = "30000")]
    vote_timeout_ms: u64,

    /// Fraction of disconnected players above which a room pauses
    #[arg(long, default_value = "0.5")]
    mass_disconnect_threshold: f64,

    /// Actions allowed per player per rate window
    #[arg(long, default_value = "20")]
    player_rate_limit: u32,

    /// Actions allowed per room per rate window
    #[arg(long, default_value = "200")]
    room_rate_limit: u32,

    /// Secret used to sign recovery tokens
    #[arg(long, env = "AVALON_TOKEN_SECRET")]
    token_secret: Option<String>,

    /// Leave timed-out players idle instead of acting for them
    #[arg(long)]
    no_auto_actions: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let mut recovery = RecoveryConfig {
        snapshot_interval_ms: args.snapshot_interval_ms,
        max_snapshots: args.max_snapshots,
        default_timeout_ms: args.player_timeout_ms,
        vote_timeout_ms: args.vote_timeout_ms,
        mass_disconnect_threshold: args.mass_disconnect_threshold,
        auto_actions: !args.no_auto_actions,
        ..RecoveryConfig::default()
    };
    match args.token_secret {
        Some(secret) => recovery.token_secret = secret.into_bytes(),
        None => warn!("Using the built-in token secret; recovery tokens are forgeable"),
    }

    let config = ServerConfig {
        bind_addr: format!("{}:{}", args.host, args.port),
        tick_ms: args.tick_ms,
        max_clients: args.max_clients,
        max_rooms: args.max_rooms,
        data_dir: args.data_dir,
        recovery,
        security: SecurityConfig {
            player_limit: args.player_rate_limit,
            room_limit: args.room_rate_limit,
            ..SecurityConfig::default()
        },
        ..ServerConfig::default()
    };

    info!("Starting server on {}", config.bind_addr);
    let mut server = Server::new(config).await?;
    server.run().await?;

    Ok(())
}
