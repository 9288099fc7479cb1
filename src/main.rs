#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use hermes_mesh::server;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "hermes-mesh",
    about = "Service mesh control plane: registry, health checks, circuit breakers and load balancing"
)]
struct Cli {
    /// Path to mesh config file (.toml or .json)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Tokio worker threads (default: container CPU limit)
    #[arg(long)]
    worker_threads: Option<usize>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let worker_threads = server::runtime::worker_threads(cli.worker_threads);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads.threads)
        .enable_all()
        .build()?;

    rt.block_on(server::bootstrap::run(server::bootstrap::BootstrapArgs {
        config_path: cli.config,
        worker_threads,
    }))
}
