// api: PlayHouse API node. Runs stateless request handlers on the mesh.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use clap::Parser;
use tracing::info;

use ph_protocol::RoutePacket;
use stage_core::{ApiHandler, ApiSender};

#[derive(Parser, Debug)]
#[command(name = "api", about = "PlayHouse api node")]
struct Args {
    /// Path to the node's TOML config.
    #[arg(long, default_value = "/etc/playhouse/api.toml")]
    config: std::path::PathBuf,
}

/// Sample handler: answers `Ping` with `pong`.
struct PingHandler;

#[async_trait]
impl ApiHandler for PingHandler {
    async fn handle(&self, _packet: RoutePacket, sender: ApiSender) {
        sender.reply(Bytes::from_static(b"pong"));
    }
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
    info!(version = env!("CARGO_PKG_VERSION"), config = %args.config.display(), "api starting");

    let cfg = match api::config::load_config_from_path(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let handlers = vec![("Ping".to_owned(), Arc::new(PingHandler) as Arc<dyn ApiHandler>)];
    let _node = match api::start(cfg, handlers).await {
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
    info!("api stopped");
}
