//! Overseer gateway binary

use clap::Parser;
use overseer_gateway::{build_router, AppConfig, AppState};
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "overseer", about = "Agent orchestration core gateway")]
struct Cli {
    /// Port to listen on
    #[arg(long, default_value_t = 7430, env = "OVERSEER_PORT")]
    port: u16,

    /// Bind address
    #[arg(long, default_value = "127.0.0.1", env = "OVERSEER_BIND")]
    bind: String,

    /// Directory for persisted state files
    #[arg(long, env = "OVERSEER_STATE_DIR")]
    state_dir: Option<std::path::PathBuf>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("OVERSEER_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info,overseer=debug"));
    let json_logs = std::env::var("OVERSEER_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = AppConfig::from_env();
    if let Some(dir) = cli.state_dir {
        config.state_dir = dir;
    }

    let state = AppState::wire(config).await?;
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", cli.bind, cli.port).parse()?;
    info!(version = env!("CARGO_PKG_VERSION"), %addr, "overseer gateway listening");
    info!("  events:  ws://{}/events", addr);
    info!("  health:  http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
