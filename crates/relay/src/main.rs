//! Tally Relay - blind store-and-forward for encrypted ledger deltas
//!
//! The relay accepts ciphertext deltas from devices, assigns cursors, and
//! serves them back per grant window. It holds no key material; losing the
//! relay loses nothing that devices cannot re-push.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use relay::http::build_router;
use relay::store::{DeltaStore, MemoryDeltaStore, SqliteDeltaStore};
use relay::RelayState;

/// Tally Relay - blind store-and-forward for encrypted ledger deltas
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on for HTTP requests
    #[arg(short, long, default_value = "7300")]
    port: u16,

    /// Path to SQLite database file; omit for an ephemeral in-memory store
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let (non_blocking_writer, _guard) = tracing_appender::non_blocking(std::io::stdout());
    let log_level: tracing::Level = args.log_level.parse().unwrap_or(tracing::Level::INFO);
    let env_filter = EnvFilter::builder()
        .with_default_directive(log_level.into())
        .from_env_lossy();

    let stdout_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(non_blocking_writer)
        .with_filter(env_filter);

    tracing_subscriber::registry().with(stdout_layer).init();

    tracing::info!("Starting Tally Relay");

    // Set up graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let graceful_shutdown = async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl+c");
        tracing::info!("Received shutdown signal");
        let _ = shutdown_tx.send(());
    };
    tokio::spawn(graceful_shutdown);

    let listen_addr = SocketAddr::from_str(&format!("0.0.0.0:{}", args.port))?;

    match args.database {
        Some(path) => {
            let store = match SqliteDeltaStore::new(&path).await {
                Ok(store) => store,
                Err(e) => {
                    tracing::error!("Failed to open relay database: {}", e);
                    std::process::exit(1);
                }
            };
            tracing::info!(path = %path.display(), "using SQLite delta store");
            serve(store, listen_addr, shutdown_rx).await
        }
        None => {
            tracing::warn!("no --database given, deltas will not survive a restart");
            serve(MemoryDeltaStore::new(), listen_addr, shutdown_rx).await
        }
    }
}

async fn serve<S: DeltaStore>(
    store: S,
    listen_addr: SocketAddr,
    mut shutdown_rx: watch::Receiver<()>,
) -> Result<()> {
    let router = build_router(RelayState::new(store));

    tracing::info!("Relay listening on {}", listen_addr);
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await?;

    tracing::info!("Relay shutdown complete");
    Ok(())
}
