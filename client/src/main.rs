use clap::Parser;
use client::network::{Client, LatencySimulation};
use client::{SimulatedPlayer, SyncConfig};
use log::info;
use shared::{SystemTimeSource, TimeSource};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Simulate network latency in milliseconds
    #[arg(short = 'l', long, default_value = "0")]
    fake_ping: u64,

    /// Random extra one-way delay of up to this many milliseconds
    #[arg(short = 'j', long, default_value = "0")]
    jitter: u64,

    /// Offset the local clock by this many milliseconds
    #[arg(long, default_value = "0", allow_hyphen_values = true)]
    clock_skew_ms: i64,

    /// Make the simulated player run fast (positive) or slow (negative)
    #[arg(long, default_value = "0", allow_hyphen_values = true)]
    speed_error_ppm: f64,

    /// Probe round trips per clock sync
    #[arg(long, default_value = "5")]
    sample_count: u32,

    #[arg(long, default_value = "100")]
    inter_sample_delay_ms: u64,

    #[arg(long, default_value = "30000")]
    resync_interval_ms: u64,

    #[arg(long, default_value = "1000")]
    check_interval_ms: u64,

    /// Drift up to this is left alone
    #[arg(long, default_value = "250")]
    tolerance_ms: f64,

    /// Drift from this on is fixed with a seek
    #[arg(long, default_value = "750")]
    hard_sync_threshold_ms: f64,

    #[arg(long, default_value = "0.05")]
    soft_sync_rate_factor: f64,

    /// Only measure the clock when asked to on the console
    #[arg(long)]
    no_auto_sync: bool,
}

impl Args {
    fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            sample_count: self.sample_count,
            inter_sample_delay_ms: self.inter_sample_delay_ms,
            resync_interval_ms: self.resync_interval_ms,
            check_interval_ms: self.check_interval_ms,
            tolerance_ms: self.tolerance_ms,
            hard_sync_threshold_ms: self.hard_sync_threshold_ms,
            soft_sync_rate_factor: self.soft_sync_rate_factor,
            auto_sync: !self.no_auto_sync,
            ..SyncConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let config = args.sync_config();
    config.validate()?;

    info!("Starting client...");
    info!("Connecting to: {}", args.server);
    if args.fake_ping > 0 || args.jitter > 0 {
        info!(
            "Simulating {}ms latency with up to {}ms jitter",
            args.fake_ping, args.jitter
        );
    }
    if args.clock_skew_ms != 0 {
        info!("Local clock skewed by {}ms", args.clock_skew_ms);
    }
    info!("Console: 'resync' forces a resync, 'status' prints sync status");

    let time: Arc<dyn TimeSource> = Arc::new(SystemTimeSource::with_skew(args.clock_skew_ms));
    let player = SimulatedPlayer::new(Arc::clone(&time)).with_speed_error(args.speed_error_ppm);
    let latency = LatencySimulation {
        fake_ping_ms: args.fake_ping,
        jitter_ms: args.jitter,
    };

    let mut client = Client::new(&args.server, config, time, player, latency).await?;

    client.run().await?;

    Ok(())
}
