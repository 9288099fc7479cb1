use crate::config::MeshConfig;
use crate::server::runtime::WorkerThreads;
use crate::server::ControlPlane;
use anyhow::Result;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub worker_threads: WorkerThreads,
}

/// Control plane lifecycle: init → build → start → wait → shutdown.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();
    tracing::info!(
        "server: runtime sized, worker_threads={}, source={}",
        args.worker_threads.threads,
        args.worker_threads.source
    );

    let config = MeshConfig::load(&args.config_path)?;
    crate::metrics::install(&config.metrics)?;

    // Connects to the store but starts no background work yet.
    let plane = ControlPlane::build(config).await?;
    plane.start();

    tracing::info!(
        "server: hermes-mesh running, host={}",
        hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string())
    );

    wait_for_shutdown().await;

    plane.shutdown().await;
    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    // The writer must outlive every log call; the process exits right after run().
    std::mem::forget(guard);
}

/// Resolve on SIGINT or SIGTERM. A signal that cannot be listened for is
/// logged and simply never fires.
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("server: cannot listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("server: cannot install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }
}
