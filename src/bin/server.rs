//! Capsule Memory HTTP server
//!
//! Run with: capsule-server

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use capsule::config::Config;
use capsule::error::Result;
use capsule::graph::GraphWorker;
use capsule::server::{router, AppState};
use capsule::storage::Storage;

#[derive(Parser, Debug)]
#[command(name = "capsule-server")]
#[command(about = "Capsule Memory HTTP server for AI agent long-term memory")]
struct Args {
    /// Database path, or ":memory:" for an ephemeral store
    #[arg(long, env = "CAPSULE_DB_PATH")]
    db_path: Option<String>,

    /// Listen address
    #[arg(long, env = "CAPSULE_LISTEN_ADDR")]
    listen_addr: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_ansi(false))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut config = Config::from_env()?;
    if let Some(db_path) = args.db_path {
        config.db_path = db_path;
    }
    if let Some(listen_addr) = args.listen_addr {
        config.listen_addr = listen_addr;
    }

    let storage = Storage::open(&config.db_path)?;
    tracing::info!(db_path = %config.db_path, "storage opened");

    let graph_worker = GraphWorker::new();
    graph_worker.start(storage.clone(), config.graph_worker_interval).await;

    let listen_addr = config.listen_addr.clone();
    let state = AppState::new(storage, config)?;
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(addr = %listen_addr, "capsule-server listening");
    axum::serve(listener, app).await?;

    Ok(())
}
