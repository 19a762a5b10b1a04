use anyhow::Context;
use clap::Parser;
use prism_core::models::StateVersion;
use prism_storage::postgres::{connect, PostgresCvrGateway};
use prism_syncer::{
    pipeline::ReplicaHandle,
    syncer::{SyncerConfig, SyncerRegistry},
};
use std::{sync::Arc, time::Duration};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Per-client-group view syncer for the prism sync platform.
///
/// The binary wires the CVR database and the syncer registry together; the
/// websocket connection layer and the replication ingester attach through
/// the registry and the replica handle.
#[derive(Parser, Debug)]
#[command(name = "prism-syncer", version)]
struct Cli {
    /// Connection string of the CVR database.
    #[arg(long, env = "PRISM_DATABASE_URL")]
    database_url: String,

    /// Idle timeout in milliseconds before an unused group service shuts
    /// down.
    #[arg(long, env = "PRISM_KEEPALIVE_MS", default_value_t = 30_000)]
    keepalive_ms: u64,

    /// Log filter, e.g. `info` or `prism_syncer=debug`.
    #[arg(long, env = "PRISM_LOG", default_value = "info")]
    log_filter: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log_filter)?)
        .init();

    let pool = connect(&cli.database_url)
        .await
        .context("connecting to the CVR database")?;
    let gateway = Arc::new(PostgresCvrGateway::new(pool));
    let replica = ReplicaHandle::new(StateVersion::min());
    let registry = SyncerRegistry::new(
        gateway,
        replica,
        SyncerConfig { keepalive: Duration::from_millis(cli.keepalive_ms) },
    );

    info!("prism-syncer up; waiting for connections");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutting down");
    registry.stop_all().await;
    Ok(())
}
