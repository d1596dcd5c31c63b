//! `vigil-service` entry point: loads configuration, opens the store, starts
//! the expiration poller, and serves the IPC socket until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use vigil_core::SwitchService;
use vigil_core::auth::SessionBroker;
use vigil_core::config::VigilConfig;
use vigil_core::gateway::WebhookPublisher;
use vigil_core::poller::Poller;
use vigil_core::store::MemoryStore;
use vigil_core::store::SqliteStore;
use vigil_core::store::SwitchStore;
use vigil_service::Daemon;
use vigil_service::ipc;

#[derive(Debug, Parser)]
#[command(name = "vigil-service", version, about = "Dead man's switch daemon")]
struct Args {
    /// Path to the configuration file.
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen on this socket instead of the configured path.
    #[arg(long, value_name = "PATH")]
    socket: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = VigilConfig::load(args.config.as_deref())?;
    let socket_path = args
        .socket
        .unwrap_or_else(|| config.service.socket_path.clone());

    let store = open_store(&config)?;
    let publisher = Arc::new(WebhookPublisher::from_config(&config.broadcast)?);
    let switch = Arc::new(SwitchService::new(store, publisher, &config));
    switch.bootstrap(chrono::Utc::now())?;

    let poller_shutdown = CancellationToken::new();
    let poller = Poller::new(
        Arc::clone(&switch),
        config.poll_interval(),
        poller_shutdown.clone(),
    );
    let poller_task = tokio::spawn(poller.run());

    let daemon = Arc::new(Daemon::new(
        switch,
        SessionBroker::new(&config.auth),
        config.service.poll_interval_seconds,
    ));

    let listener = ipc::bind_listener(&socket_path)?;
    tracing::info!(
        socket = %socket_path.display(),
        version = env!("CARGO_PKG_VERSION"),
        "vigil-service listening"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received; shutting down");
        }
        let _ = shutdown_tx.send(true);
    });

    ipc::serve(daemon, listener, shutdown_rx).await?;

    poller_shutdown.cancel();
    let _ = poller_task.await;
    tracing::info!("vigil-service stopped");
    Ok(())
}

fn open_store(config: &VigilConfig) -> anyhow::Result<Arc<dyn SwitchStore>> {
    let store: Arc<dyn SwitchStore> = match config.storage.backend.as_str() {
        "memory" => {
            tracing::warn!("memory backend selected; state will not survive a restart");
            Arc::new(MemoryStore::new())
        }
        _ => {
            tracing::info!(path = %config.storage.path.display(), "opening sqlite store");
            Arc::new(SqliteStore::open(&config.storage.path)?)
        }
    };
    Ok(store)
}
