use clap::Parser;
use client::config::ClientConfig;
use client::network::Client;
use client::optimistic::ConflictStrategy;
use log::{error, info};
use std::io::BufRead;
use tokio::sync::{mpsc, watch};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Room code to join
    #[arg(short = 'r', long, default_value = "LOBBY")]
    room: String,

    /// Stable player id; reuse it to reclaim a seat after a crash
    #[arg(short = 'i', long)]
    player_id: String,

    /// Display name, defaults to the player id
    #[arg(short = 'n', long)]
    name: Option<String>,

    /// Simulate network latency in milliseconds
    #[arg(short = 'l', long, default_value = "0")]
    fake_ping: u64,

    /// Milliseconds before an unconfirmed action is rolled back
    #[arg(long, default_value = "5000")]
    optimistic_timeout_ms: u64,

    /// server_wins, client_wins, merge, timestamp or discard
    #[arg(long, default_value = "server_wins")]
    conflict_strategy: ConflictStrategy,

    /// Ask before resolving conflicts instead of applying the strategy
    #[arg(long)]
    manual_conflicts: bool,

    /// Stop after this many reconnect attempts; retries forever when omitted
    #[arg(long)]
    max_reconnect_attempts: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let config = ClientConfig {
        server_addr: args.server,
        room_code: args.room,
        player_name: args.name.unwrap_or_else(|| args.player_id.clone()),
        player_id: args.player_id,
        fake_ping_ms: args.fake_ping,
        optimistic_timeout_ms: args.optimistic_timeout_ms,
        conflict_strategy: args.conflict_strategy,
        auto_resolve: !args.manual_conflicts,
        max_reconnect_attempts: args.max_reconnect_attempts,
        ..ClientConfig::default()
    };

    info!("Starting client...");
    info!("Joining room {} on {} as {}", config.room_code, config.server_addr, config.player_id);
    if config.fake_ping_ms > 0 {
        info!("Simulating {}ms latency", config.fake_ping_ms);
    }
    println!("Type 'help' for commands");

    // Plain thread so a blocked terminal read never holds up runtime shutdown
    let (command_tx, command_rx) = mpsc::channel(32);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if command_tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!("Error reading stdin: {}", e);
                    break;
                }
            }
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    let mut client = Client::new(config).await?;
    client.run(command_rx, shutdown_rx).await?;

    Ok(())
}
