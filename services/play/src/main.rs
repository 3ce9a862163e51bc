// play: PlayHouse Play node. Hosts stages and routes client traffic.

use clap::Parser;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "play", about = "PlayHouse play node")]
struct Args {
    /// Path to the node's TOML config.
    #[arg(long, default_value = "/etc/playhouse/play.toml")]
    config: std::path::PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(version = env!("CARGO_PKG_VERSION"), config = %args.config.display(), "play starting");

    let cfg = match play::config::load_config_from_path(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let node = match play::start(cfg, play::sample::sample_registry()).await {
        Ok(node) => node,
        Err(e) => {
            eprintln!("FATAL: failed to start: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        eprintln!("FATAL: signal handler: {}", e);
        std::process::exit(1);
    }
    node.shutdown();
    // Give outbound queues a moment to drain before the process exits.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    info!("play stopped");
}
