//! Server — the live object bound to a Listener: a bound (or inherited)
//! listening socket, an HTTP(S) accept loop, and for HTTPS, dynamic TLS
//! termination (spec §4.2). Grounded on the teacher's
//! `server/mod.rs::run_proxy_server`: a `Semaphore`-counted in-flight
//! tracker, an `AtomicI64` active-connection gauge, a `tokio::select!`
//! accept loop that stops taking new connections on a shutdown signal and
//! then drains with a bounded timeout.

use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, Notify};
use tracing::{error, info, warn};

use crate::error::{MuxError, MuxResult};
use crate::forwarder::BoxBody;
use crate::host::Host;
use crate::keys::HostKey;
use crate::listener::{ListenerAddress, ListenerSpec, Protocol};
use crate::router::{not_found_response, RadixRouter};
use crate::staple::StapleCache;
use crate::tls::{build_server_config, SniResolver};

struct ActiveRun {
    listener: Arc<TcpListener>,
    shutdown: Arc<Notify>,
    active_conns: Arc<AtomicI64>,
    accept_task: tokio::task::JoinHandle<()>,
}

enum RunState {
    Init,
    Active(ActiveRun),
    Stopped,
}

/// TLS material for an HTTPS listener: the SNI resolver (reads the Mux's
/// live host map and staple cache) plus the `rustls::ServerConfig` built
/// around it. Reload only ever swaps the resolver's default-host pointer
/// — host cert data and staples are already live, so no config rebuild is
/// needed on a plain TLS reload (spec §4.2 step 4, §5).
struct TlsState {
    resolver: Arc<SniResolver>,
    config: Arc<rustls::ServerConfig>,
}

pub struct Server {
    key: crate::keys::ListenerKey,
    spec: Arc<ArcSwap<ListenerSpec>>,
    router: RadixRouter,
    hosts: Arc<dashmap::DashMap<HostKey, Arc<Host>>>,
    staples: StapleCache,
    tls: Arc<ArcSwap<Option<TlsState>>>,
    pending_fd: Mutex<Option<OwnedFd>>,
    run: Mutex<RunState>,
    grace: Duration,
}

impl Server {
    pub fn new(
        key: crate::keys::ListenerKey,
        spec: ListenerSpec,
        router: RadixRouter,
        hosts: Arc<dashmap::DashMap<HostKey, Arc<Host>>>,
        staples: StapleCache,
        grace: Duration,
    ) -> Self {
        let tls = Self::build_tls(&spec, &hosts, &staples);
        Server {
            key,
            spec: Arc::new(ArcSwap::from_pointee(spec)),
            router,
            hosts,
            staples,
            tls: Arc::new(ArcSwap::from_pointee(tls)),
            pending_fd: Mutex::new(None),
            run: Mutex::new(RunState::Init),
            grace,
        }
    }

    fn build_tls(
        spec: &ListenerSpec,
        hosts: &Arc<dashmap::DashMap<HostKey, Arc<Host>>>,
        staples: &StapleCache,
    ) -> Option<TlsState> {
        if spec.protocol != Protocol::Https {
            return None;
        }
        let default_host = spec.tls.as_ref().and_then(|t| t.default_host.clone()).map(HostKey::from);
        let resolver = SniResolver::new(hosts.clone(), staples.clone(), default_host);
        let config = build_server_config(resolver.clone(), true);
        Some(TlsState { resolver, config })
    }

    pub fn address(&self) -> ListenerAddress {
        self.spec.load().address.clone()
    }

    /// Adopt an inherited descriptor instead of binding fresh (spec §4.1
    /// `TakeFiles`, §4.2 `takeFile`). Must be called before `start`.
    pub async fn take_file(&self, fd: OwnedFd) {
        *self.pending_fd.lock().await = Some(fd);
    }

    /// Duplicate the listening socket for handoff (spec §4.1 `GetFiles`,
    /// §4.2 `GetFile`). The original keeps serving; the dup is what the
    /// successor process inherits.
    pub async fn get_file(&self) -> MuxResult<OwnedFd> {
        let run = self.run.lock().await;
        match &*run {
            RunState::Active(active) => crate::handoff::dup_fd(active.listener.as_raw_fd()),
            _ => Err(MuxError::internal(format!("server {} has no live socket to hand off", self.key))),
        }
    }

    /// Bind fresh, or adopt a pending inherited descriptor if `take_file`
    /// was called first (spec §4.2 `start`). A shutdown server is never
    /// restarted via `start` — callers recreate the Server on re-upsert.
    pub async fn start(&self) -> MuxResult<()> {
        let mut run = self.run.lock().await;
        if matches!(&*run, RunState::Active(_)) {
            return Ok(());
        }

        let pending = self.pending_fd.lock().await.take();
        let listener = match pending {
            Some(fd) => {
                let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd.into_raw_fd()) };
                std_listener
                    .set_nonblocking(true)
                    .map_err(|e| MuxError::internal(format!("failed to set nonblocking on inherited socket: {}", e)))?;
                TcpListener::from_std(std_listener)
                    .map_err(|e| MuxError::internal(format!("failed to adopt inherited socket: {}", e)))?
            }
            None => {
                let addr: SocketAddr = self
                    .spec
                    .load()
                    .host_port()
                    .parse()
                    .map_err(|e| MuxError::invalid_argument(format!("invalid listener address: {}", e)))?;
                TcpListener::bind(addr)
                    .await
                    .map_err(|e| MuxError::internal(format!("bind failed for {}: {}", addr, e)))?
            }
        };

        let listener = Arc::new(listener);
        let shutdown = Arc::new(Notify::new());
        let active_conns = Arc::new(AtomicI64::new(0));

        let accept_task = spawn_accept_loop(
            self.key.clone(),
            listener.clone(),
            self.router.clone(),
            self.spec.clone(),
            self.tls.clone(),
            shutdown.clone(),
            active_conns.clone(),
        );

        info!(listener = %self.key, address = %self.address(), "server: started");
        *run = RunState::Active(ActiveRun { listener, shutdown, active_conns, accept_task });
        Ok(())
    }

    /// Graceful drain: stop accepting, wait up to `self.grace` for
    /// in-flight requests, then close (spec §4.2). A shutdown from
    /// `Init` is a no-op — there is no socket yet.
    pub async fn shutdown(&self) {
        let mut run = self.run.lock().await;
        let active = match std::mem::replace(&mut *run, RunState::Stopped) {
            RunState::Active(active) => active,
            _ => return,
        };

        active.shutdown.notify_waiters();
        let deadline = self.grace;
        let active_conns = active.active_conns.clone();
        let drained = tokio::time::timeout(deadline, async {
            while active_conns.load(Ordering::Relaxed) > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(listener = %self.key, "server: drain timeout, dropping remaining connections");
        }
        active.accept_task.abort();
        info!(listener = %self.key, "server: shutdown complete");
    }

    /// Replace TLS configuration atomically without closing the socket
    /// (spec §4.2 `reload`). Host cert data and staples are read live
    /// through shared structures; reload only needs to (re)point the
    /// listener's default-host fallback.
    pub fn reload(&self) {
        let spec = self.spec.load();
        if let Some(tls) = self.tls.load().as_ref() {
            let default_host = spec.tls.as_ref().and_then(|t| t.default_host.clone()).map(HostKey::from);
            tls.resolver.set_default_host(default_host);
            metrics::counter!("mux_tls_reloads_total", "listener" => self.key.to_string()).increment(1);
            info!(listener = %self.key, "server: tls reloaded");
        }
    }

    /// Apply a new Listener record in place (spec §4.1 `UpsertListener`,
    /// §4.2 `updateListener`). Rejects an address change — callers must
    /// delete and reinsert, since that is a new bind (spec §4.2, §7
    /// `conflict`).
    pub fn update_listener(&self, new: ListenerSpec) -> MuxResult<()> {
        let current = self.spec.load();
        if current.address != new.address {
            return Err(MuxError::conflict("listener address is immutable; delete and reinsert instead"));
        }
        let tls_or_scope_changed = current.tls.as_ref().map(|t| t.default_host.clone())
            != new.tls.as_ref().map(|t| t.default_host.clone())
            || current.scope != new.scope
            || current.protocol != new.protocol;

        let rebuilt_tls = Self::build_tls(&new, &self.hosts, &self.staples);
        self.spec.store(Arc::new(new));
        if tls_or_scope_changed {
            self.tls.store(Arc::new(rebuilt_tls));
            self.reload();
        }
        Ok(())
    }
}

fn spawn_accept_loop(
    key: crate::keys::ListenerKey,
    listener: Arc<TcpListener>,
    router: RadixRouter,
    spec: Arc<ArcSwap<ListenerSpec>>,
    tls: Arc<ArcSwap<Option<TlsState>>>,
    shutdown: Arc<Notify>,
    active_conns: Arc<AtomicI64>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                result = listener.accept() => result,
                _ = shutdown.notified() => {
                    info!(listener = %key, "server: stop accepting new connections, draining");
                    break;
                }
            };

            let (stream, peer_addr) = match accepted {
                Ok(v) => {
                    metrics::counter!("mux_connections_total", "listener" => key.to_string()).increment(1);
                    v
                }
                Err(e) => {
                    error!(listener = %key, error = %e, "server: accept failed");
                    continue;
                }
            };

            metrics::gauge!("mux_connections_active", "listener" => key.to_string()).increment(1.0);
            active_conns.fetch_add(1, Ordering::Relaxed);

            let router = router.clone();
            let spec = spec.clone();
            let tls = tls.load_full();
            let active_conns = active_conns.clone();
            let key_label = key.clone();

            tokio::spawn(async move {
                let result = match tls.as_ref() {
                    Some(tls_state) => {
                        let acceptor = tokio_rustls::TlsAcceptor::from(tls_state.config.clone());
                        match acceptor.accept(stream).await {
                            Ok(tls_stream) => serve(TokioIo::new(tls_stream), router, spec, peer_addr).await,
                            Err(e) => Err(e.to_string()),
                        }
                    }
                    None => serve(TokioIo::new(stream), router, spec, peer_addr).await,
                };

                if let Err(e) = result {
                    if !e.contains("connection closed") {
                        error!(listener = %key_label, peer = %peer_addr, error = %e, "server: connection error");
                    }
                }

                metrics::gauge!("mux_connections_active", "listener" => key_label.to_string()).decrement(1.0);
                active_conns.fetch_sub(1, Ordering::Relaxed);
            });
        }
    })
}

async fn serve<IO>(io: TokioIo<IO>, router: RadixRouter, spec: Arc<ArcSwap<ListenerSpec>>, peer_addr: SocketAddr) -> Result<(), String>
where
    IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let svc = service_fn(move |req: Request<Incoming>| {
        let router = router.clone();
        let spec = spec.clone();
        async move { Ok::<_, std::convert::Infallible>(dispatch(&router, &spec, req, peer_addr).await) }
    });

    auto::Builder::new(TokioExecutor::new())
        .http1()
        .keep_alive(true)
        .http2()
        .keep_alive_interval(Some(Duration::from_secs(20)))
        .serve_connection_with_upgrades(io, svc)
        .await
        .map_err(|e| e.to_string())
}

async fn dispatch(
    router: &RadixRouter,
    spec: &ArcSwap<ListenerSpec>,
    mut req: Request<Incoming>,
    peer_addr: SocketAddr,
) -> Response<BoxBody> {
    req.extensions_mut().insert(crate::middleware::ClientAddr(peer_addr));
    let host = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().host())
        .unwrap_or("")
        .to_string();
    let path = req.uri().path().to_string();
    let method = req.method().as_str().to_string();

    metrics::counter!("mux_http_requests_total").increment(1);
    metrics::gauge!("mux_http_requests_in_flight").increment(1.0);
    let start = std::time::Instant::now();

    // A listener's `scope` restricts which frontends it serves (spec §3);
    // a host outside the scope never reaches the router at all.
    let response = if !spec.load().scope_matches(&host) {
        not_found_response()
    } else {
        let req = req.map(crate::forwarder::body_from_incoming);
        match router.dispatch(&host, &path, &method) {
            Some(frontend) => frontend.handle(req).await,
            None => not_found_response(),
        }
    };

    metrics::gauge!("mux_http_requests_in_flight").decrement(1.0);
    metrics::histogram!("mux_http_request_duration_seconds").record(start.elapsed().as_secs_f64());
    response
}
