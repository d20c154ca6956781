use clap::Parser;
use log::{error, info};
use server::network::{Server, ServerConfig, ServerMessage};
use shared::{SystemTimeSource, TimeSource};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Maximum number of connected clients
    #[arg(short, long, default_value = "32")]
    max_clients: usize,

    /// Delay between issuing a command and its effect time
    #[arg(long, default_value = "300")]
    command_lead_ms: i64,

    /// Interval between periodic anchor snapshots
    #[arg(long, default_value = "5000")]
    snapshot_interval_ms: u64,

    /// Drop clients silent for this long
    #[arg(long, default_value = "10")]
    client_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let config = ServerConfig {
        max_clients: args.max_clients,
        command_lead_ms: args.command_lead_ms,
        snapshot_interval: Duration::from_millis(args.snapshot_interval_ms.max(1)),
        client_timeout: Duration::from_secs(args.client_timeout_secs),
        read_console: true,
    };

    let address = format!("{}:{}", args.host, args.port);
    info!("Starting server on {}", address);
    info!(
        "Commands take effect {}ms after issue, snapshots every {}ms",
        config.command_lead_ms, args.snapshot_interval_ms
    );

    let time: Arc<dyn TimeSource> = Arc::new(SystemTimeSource::new());
    let mut server = Server::new(&address, config, time).await?;

    let shutdown = server.message_sender();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok()
            && shutdown.send(ServerMessage::Shutdown).is_err()
        {
            error!("Server loop already stopped");
        }
    });

    server.run().await?;

    Ok(())
}
