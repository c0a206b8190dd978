//! Admission gauges and their exposition endpoint. The gauges are plain
//! atomics underneath; readers get a best-effort snapshot, the two values
//! are not updated transactionally.

use std::net::SocketAddr;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, IntGauge, Registry, TextEncoder};

static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static CURRENT_PENDING_CSRS: LazyLock<IntGauge> = LazyLock::new(|| {
    let g = IntGauge::new(
        "mapi_current_pending_csr",
        "Count of recently pending node CSRs",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(g.clone()))
        .expect("metric not yet registered");
    g
});

static MAX_PENDING_CSRS: LazyLock<IntGauge> = LazyLock::new(|| {
    let g = IntGauge::new(
        "mapi_max_pending_csr",
        "Pending node CSR ceiling above which approvals pause",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(g.clone()))
        .expect("metric not yet registered");
    g
});

pub fn set_pending_csrs(count: usize) {
    CURRENT_PENDING_CSRS.set(count as i64);
}

pub fn set_max_pending_csrs(count: usize) {
    MAX_PENDING_CSRS.set(count as i64);
}

pub fn pending_csrs() -> i64 {
    CURRENT_PENDING_CSRS.get()
}

pub fn max_pending_csrs() -> i64 {
    MAX_PENDING_CSRS.get()
}

async fn metrics_handler() -> impl IntoResponse {
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buf) {
        return (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            format!("encode metrics: {}", e),
        );
    }
    (
        axum::http::StatusCode::OK,
        String::from_utf8_lossy(&buf).into_owned(),
    )
}

async fn healthz() -> &'static str {
    "ok"
}

/// Serve `/metrics` and `/healthz` until the process exits.
pub async fn serve(addr: SocketAddr) -> Result<()> {
    // Touch the gauges so they are registered before the first scrape.
    set_pending_csrs(0);
    set_max_pending_csrs(0);

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz));
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await
        .with_context(|| format!("metrics server on {}", addr))
}
