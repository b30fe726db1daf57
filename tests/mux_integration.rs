//! End-to-end scenarios from spec §8, exercised against real listening
//! sockets rather than mocked collaborators — each test drives an actual
//! `Mux` over a loopback TCP connection the way a client would.

use std::convert::Infallible;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::TcpListener as TokioTcpListener;

use mux::config::MuxConfig;
use mux::frontend::FrontendSettings;
use mux::listener::{ListenerAddress, ListenerSpec, Network, Protocol};
use mux::middleware::MiddlewareRegistry;
use mux::mux::{FrontendSnapshot, Mux, MuxSnapshot};
use mux::staple::NullStapleSource;

fn free_port() -> u16 {
    let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    l.local_addr().unwrap().port()
}

/// A trivial upstream echoing a fixed 200 response with an `x-upstream`
/// header, so tests can tell the forwarder actually reached it.
async fn spawn_fake_upstream() -> u16 {
    let listener = TokioTcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(v) => v,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let svc = service_fn(|_req: Request<Incoming>| async move {
                    Ok::<_, Infallible>(
                        Response::builder()
                            .status(200)
                            .header("x-upstream", "hit")
                            .body(Full::new(Bytes::from_static(b"ok")).map_err(|never| match never {}).boxed())
                            .unwrap(),
                    )
                });
                let _ = auto::Builder::new(TokioExecutor::new()).http1().serve_connection(TokioIo::new(stream), svc).await;
            });
        }
    });
    port
}

fn raw_http_get(port: u16, host: &str, path: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let request = format!("GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n", path, host);
    stream.write_all(request.as_bytes()).unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    let status_line = response.lines().next().unwrap_or("");
    let status: u16 = status_line.split_whitespace().nth(1).and_then(|s| s.parse().ok()).unwrap_or(0);
    (status, response)
}

async fn build_mux() -> Arc<Mux> {
    Arc::new(Mux::new(MuxConfig::default(), MiddlewareRegistry::new(), Arc::new(NullStapleSource)))
}

/// Scenario 1 (spec §8): a request for the bound host reaches the
/// upstream; a request for an unknown host gets the default 404 JSON.
#[tokio::test]
async fn simple_routing_reaches_upstream_and_404s_unknown_host() {
    let upstream_port = spawn_fake_upstream().await;
    let listener_port = free_port();
    let mux = build_mux().await;

    let mut snapshot = MuxSnapshot::default();
    snapshot.backends.insert(
        "b1".to_string(),
        mux::mux::BackendSnapshot {
            spec: Default::default(),
            servers: std::collections::HashMap::from([("s1".to_string(), format!("http://127.0.0.1:{}", upstream_port))]),
        },
    );
    snapshot.listeners.insert(
        "l1".to_string(),
        ListenerSpec {
            address: ListenerAddress::new(Network::Tcp, format!("127.0.0.1:{}", listener_port)),
            protocol: Protocol::Http,
            tls: None,
            scope: None,
        },
    );
    snapshot.frontends.insert(
        "f1".to_string(),
        FrontendSnapshot {
            route: r#"Host("api.example.com")"#.to_string(),
            backend_id: "b1".to_string(),
            settings: FrontendSettings::default(),
            middlewares: vec![],
        },
    );

    mux.init(snapshot).await.unwrap();
    mux.start().await.unwrap();

    let (status, body) = raw_http_get(listener_port, "api.example.com", "/");
    assert_eq!(status, 200);
    assert!(body.contains("x-upstream"));

    let (status, body) = raw_http_get(listener_port, "other.example.com", "/");
    assert_eq!(status, 404);
    assert!(body.contains("\"error\":\"not found\""));

    mux.stop(true).await;
}

/// A listener's `scope` restricts which hosts it serves (spec §3): a
/// request for a host outside the scope 404s even though a frontend for
/// that exact host exists and is reachable from an unscoped listener.
#[tokio::test]
async fn listener_scope_excludes_hosts_outside_it() {
    let upstream_port = spawn_fake_upstream().await;
    let listener_port = free_port();
    let mux = build_mux().await;

    let mut snapshot = MuxSnapshot::default();
    snapshot.backends.insert(
        "b1".to_string(),
        mux::mux::BackendSnapshot {
            spec: Default::default(),
            servers: std::collections::HashMap::from([("s1".to_string(), format!("http://127.0.0.1:{}", upstream_port))]),
        },
    );
    snapshot.listeners.insert(
        "l1".to_string(),
        ListenerSpec {
            address: ListenerAddress::new(Network::Tcp, format!("127.0.0.1:{}", listener_port)),
            protocol: Protocol::Http,
            tls: None,
            scope: Some("*.internal.example.com".to_string()),
        },
    );
    snapshot.frontends.insert(
        "f1".to_string(),
        FrontendSnapshot {
            route: r#"Host("api.example.com")"#.to_string(),
            backend_id: "b1".to_string(),
            settings: FrontendSettings::default(),
            middlewares: vec![],
        },
    );

    mux.init(snapshot).await.unwrap();
    mux.start().await.unwrap();

    // "api.example.com" has a matching frontend, but the listener's scope
    // only admits "*.internal.example.com" — out of scope, so 404.
    let (status, _) = raw_http_get(listener_port, "api.example.com", "/");
    assert_eq!(status, 404);

    mux.stop(true).await;
}

/// Scenario 4 (spec §8): deleting a linked backend is rejected with
/// `conflict`; deleting the frontend first unblocks the delete.
#[tokio::test]
async fn backend_delete_guarded_then_unblocked() {
    let upstream_port = spawn_fake_upstream().await;
    let mux = build_mux().await;

    mux.upsert_server("b1", "s1", format!("http://127.0.0.1:{}", upstream_port)).await.unwrap();
    mux.upsert_frontend(
        "f1",
        FrontendSnapshot {
            route: r#"Host("api.example.com")"#.to_string(),
            backend_id: "b1".to_string(),
            settings: FrontendSettings::default(),
            middlewares: vec![],
        },
    )
    .await
    .unwrap();

    let err = mux.delete_backend("b1").await.unwrap_err();
    assert_eq!(err.kind, mux::error::ErrorKind::Conflict);

    mux.delete_frontend("f1").await.unwrap();
    mux.delete_backend("b1").await.unwrap();
}

/// Scenario 5 (spec §8): `GetFiles` on a running Mux, `TakeFiles` on a
/// fresh one, bound ports are not rebound — the successor serves on the
/// exact same socket without an unbound window.
#[tokio::test]
async fn handoff_adopts_inherited_socket_without_rebinding() {
    let upstream_port = spawn_fake_upstream().await;
    let listener_port = free_port();

    let snapshot_for = |upstream_port: u16| {
        let mut snapshot = MuxSnapshot::default();
        snapshot.backends.insert(
            "b1".to_string(),
            mux::mux::BackendSnapshot {
                spec: Default::default(),
                servers: std::collections::HashMap::from([("s1".to_string(), format!("http://127.0.0.1:{}", upstream_port))]),
            },
        );
        snapshot.listeners.insert(
            "l1".to_string(),
            ListenerSpec {
                address: ListenerAddress::new(Network::Tcp, format!("127.0.0.1:{}", listener_port)),
                protocol: Protocol::Http,
                tls: None,
                scope: None,
            },
        );
        snapshot.frontends.insert(
            "f1".to_string(),
            FrontendSnapshot {
                route: r#"Host("api.example.com")"#.to_string(),
                backend_id: "b1".to_string(),
                settings: FrontendSettings::default(),
                middlewares: vec![],
            },
        );
        snapshot
    };

    let mux_a = build_mux().await;
    mux_a.init(snapshot_for(upstream_port)).await.unwrap();
    mux_a.start().await.unwrap();

    let (status, _) = raw_http_get(listener_port, "api.example.com", "/");
    assert_eq!(status, 200);

    let files = mux_a.get_files().await.unwrap();
    assert_eq!(files.len(), 1);
    let inherited: Vec<mux::handoff::InheritedFile> =
        files.into_iter().map(|f| mux::handoff::InheritedFile { address: f.address, file: f.file }).collect();

    let mux_b = build_mux().await;
    mux_b.init(snapshot_for(upstream_port)).await.unwrap();
    mux_b.take_files(inherited).await.unwrap();
    mux_b.start().await.unwrap();

    // mux_a's original socket is still bound and serving during the handoff window.
    let (status, _) = raw_http_get(listener_port, "api.example.com", "/");
    assert_eq!(status, 200);

    mux_a.stop(true).await;

    // After A shuts down, B (holding the inherited duplicate) keeps serving
    // on the exact same address with no rebind.
    let (status, _) = raw_http_get(listener_port, "api.example.com", "/");
    assert_eq!(status, 200);

    mux_b.stop(true).await;
}
