//! Metrics (SPEC_FULL §4.10, ambient). Grounded on the teacher's
//! `metrics/registry.rs`: a thin handle around a global
//! `metrics_exporter_prometheus` recorder, installed once, with
//! descriptions registered up front so the `/metrics` endpoint carries
//! HELP/TYPE lines even before the first observation. Metric names are
//! retargeted from the teacher's gateway-request concerns to this crate's
//! mutation / TLS-reload / staple-refresh / dispatch concerns.

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

const LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric
    /// descriptions. Must be called once at process start, before any
    /// `counter!`/`gauge!`/`histogram!` call.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder()
            .expect("failed to install metrics recorder");

        // mutation API (spec §4.1)
        describe_counter!("mux_mutations_total", Unit::Count, "Total mutator calls by operation, entity kind, and result");

        // request / dispatch path (spec §4.5, §7)
        describe_counter!("mux_http_requests_total", Unit::Count, "Total HTTP requests dispatched through the router");
        describe_histogram!("mux_http_request_duration_seconds", Unit::Seconds, "Request duration from accept to response completion");
        describe_gauge!("mux_http_requests_in_flight", Unit::Count, "Requests currently being handled");
        describe_counter!("mux_dispatch_errors_total", Unit::Count, "Dispatch-path failures by ForwardError kind");

        // connections (spec §4.2)
        describe_gauge!("mux_connections_active", Unit::Count, "Active downstream connections per listener");
        describe_counter!("mux_connections_total", Unit::Count, "Total connections accepted per listener");

        // TLS / staple (spec §4.2, §4.6)
        describe_counter!("mux_tls_reloads_total", Unit::Count, "TLS reconfiguration events per server");
        describe_counter!("mux_staple_refresh_total", Unit::Count, "OCSP staple refresh events consumed");

        // graph size (spec §3)
        describe_gauge!("mux_hosts_total", Unit::Count, "Number of hosts currently loaded");
        describe_gauge!("mux_backends_total", Unit::Count, "Number of backends currently loaded");
        describe_gauge!("mux_frontends_total", Unit::Count, "Number of frontends currently loaded");
        describe_gauge!("mux_listeners_total", Unit::Count, "Number of listeners currently loaded");

        Self { handle }
    }

    pub fn render(&self) -> String {
        self.handle.render()
    }
}
