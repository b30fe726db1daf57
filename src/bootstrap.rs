//! Process lifecycle: build a `Mux`, `init` it from a snapshot, adopt any
//! inherited listening sockets, `start`, serve the admin surface, then
//! block until a shutdown signal arrives (SPEC_FULL §4.7/§4.9/§4.11).
//! Grounded on the teacher's `server/bootstrap.rs::run`/`init_tracing`:
//! structured JSON logging via `tracing-subscriber` initialized once up
//! front, a single `run` entry point phased init → serve → shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::TcpListener;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::MuxConfig;
use crate::handoff;
use crate::metrics::Metrics;
use crate::middleware::MiddlewareRegistry;
use crate::mux::{Mux, MuxSnapshot};
use crate::staple::NullStapleSource;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: PathBuf,
    /// Initial object graph for `Mux::init`. Optional: a mux with no
    /// snapshot starts with an empty graph and is populated entirely
    /// through the mutator API (spec §1 "the configuration store... is
    /// out of scope", spec §4.1 `Init` is the bulk-load path only).
    pub snapshot_path: Option<PathBuf>,
}

/// Mux lifecycle: init → adopt inherited sockets → start → serve admin →
/// block for shutdown → stop.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    let config = MuxConfig::load(&args.config_path).context("loading mux config")?;
    let metrics = Metrics::install();

    let mux = Arc::new(Mux::new(config.clone(), MiddlewareRegistry::new(), Arc::new(NullStapleSource)));

    if let Some(path) = &args.snapshot_path {
        let snapshot = load_snapshot(path).context("loading initial snapshot")?;
        mux.init(snapshot).await.context("mux: init failed")?;
    } else {
        mux.init(MuxSnapshot::default()).await.context("mux: init failed")?;
    }

    let inherited = handoff::take_from_env().context("parsing inherited fd manifest")?;
    if !inherited.is_empty() {
        tracing::info!(count = inherited.len(), "bootstrap: adopting inherited listening sockets");
        mux.take_files(inherited).await.context("mux: take_files failed")?;
    }

    mux.start().await.context("mux: start failed")?;
    tracing::info!("bootstrap: mux started");

    let admin_handle = spawn_admin_server(&config.admin_listen, mux.clone(), metrics);

    wait_for_shutdown().await;
    tracing::info!("bootstrap: shutdown signal received, draining");

    mux.stop(true).await;
    admin_handle.abort();

    tracing::info!("bootstrap: shutdown complete");
    Ok(())
}

fn load_snapshot(path: &std::path::Path) -> Result<MuxSnapshot> {
    let content = std::fs::read_to_string(path).with_context(|| format!("reading snapshot file {}", path.display()))?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => Ok(toml::from_str(&content)?),
        Some("json") => Ok(serde_json::from_str(&content)?),
        _ => anyhow::bail!("unsupported snapshot format, use .toml or .json"),
    }
}

fn init_tracing() {
    let (non_blocking, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false).with_target(false).json())
        .init();

    std::mem::forget(guard);
}

fn spawn_admin_server(listen: &str, mux: Arc<Mux>, metrics: Metrics) -> tokio::task::JoinHandle<()> {
    let listen = listen.to_string();
    tokio::spawn(async move {
        let addr: std::net::SocketAddr = match listen.parse() {
            Ok(a) => a,
            Err(e) => {
                tracing::error!(error = %e, address = %listen, "admin: invalid listen address, admin surface disabled");
                return;
            }
        };
        let listener = match TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(error = %e, address = %listen, "admin: bind failed, admin surface disabled");
                return;
            }
        };
        tracing::info!(address = %listen, "admin: listening");

        loop {
            let (stream, _peer) = match listener.accept().await {
                Ok(v) => v,
                Err(e) => {
                    tracing::error!(error = %e, "admin: accept failed");
                    continue;
                }
            };
            let mux = mux.clone();
            let metrics = metrics.clone();
            tokio::spawn(async move {
                let svc = service_fn(move |req: Request<Incoming>| {
                    crate::admin::handle_admin(req, mux.clone(), metrics.clone())
                });
                if let Err(e) = auto::Builder::new(TokioExecutor::new()).http1().http2().serve_connection(TokioIo::new(stream), svc).await {
                    tracing::debug!(error = %e, "admin: connection error");
                }
            });
        }
    })
}

/// A closed global stop channel is the single signal for all background
/// workers (spec §5); at the process level that signal is SIGTERM/SIGINT
/// (Unix) or Ctrl-C (elsewhere).
#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => tracing::info!("bootstrap: received SIGTERM"),
        _ = sigint.recv() => tracing::info!("bootstrap: received SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("bootstrap: received ctrl-c");
}
