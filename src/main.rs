#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "muxd", about = "Dynamic, reconfigurable HTTP/HTTPS reverse proxy core")]
struct Cli {
    /// Path to the mux config file (process-wide defaults: timeouts, admin listen, etc.)
    #[arg(short, long, default_value = "mux.toml")]
    config: PathBuf,

    /// Path to an initial object graph snapshot (hosts/backends/listeners/frontends) for Init.
    #[arg(short, long)]
    snapshot: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let worker_threads = mux::runtime::get_container_cpu_limit();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    rt.block_on(mux::bootstrap::run(mux::bootstrap::BootstrapArgs {
        config_path: cli.config,
        snapshot_path: cli.snapshot,
    }))
}
