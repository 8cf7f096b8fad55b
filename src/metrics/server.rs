//! Prometheus metrics infrastructure with singleton-based initialization.
//!
//! One recorder is installed per process and shared by every stage. The
//! HTTP endpoint exposes:
//! - `/metrics` - Prometheus metrics in text format
//! - `/health` - Health check endpoint (returns 200 OK)

use axum::{Extension, Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use snafu::prelude::*;
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::{AlreadyInitializedSnafu, MetricsError, PrometheusInitSnafu};

/// Default metrics address.
pub const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:9090";

/// Histogram buckets for duration metrics (in seconds).
const DURATION_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn install() -> Result<PrometheusHandle, MetricsError> {
    PrometheusBuilder::new()
        .set_buckets(DURATION_BUCKETS)
        .context(PrometheusInitSnafu)?
        .install_recorder()
        .context(PrometheusInitSnafu)
}

/// Install the recorder and serve it over HTTP on `addr`.
///
/// Returns an error if metrics were already initialized in this process.
pub fn init_global(addr: SocketAddr) -> Result<(), MetricsError> {
    ensure!(HANDLE.get().is_none(), AlreadyInitializedSnafu);
    let handle = install()?;
    HANDLE
        .set(handle.clone())
        .map_err(|_| AlreadyInitializedSnafu.build())?;

    tokio::spawn(run_server(addr, handle));

    info!(%addr, "Metrics server started");
    Ok(())
}

/// Install the recorder without an HTTP endpoint.
///
/// Safe to call repeatedly and from several test threads.
pub fn init_test() {
    if HANDLE.get().is_some() {
        return;
    }
    match install() {
        Ok(handle) => {
            let _ = HANDLE.set(handle);
        }
        Err(_) => {
            // Another thread installed the global recorder first.
            while HANDLE.get().is_none() {
                std::hint::spin_loop();
            }
        }
    }
}

/// Render the current metrics in Prometheus text format, if initialized.
pub fn render() -> Option<String> {
    HANDLE.get().map(PrometheusHandle::render)
}

async fn run_server(addr: SocketAddr, handle: PrometheusHandle) {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(Extension(handle));

    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind metrics server to {}: {}", addr, e);
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        error!("Metrics server error: {}", e);
    }
}

async fn metrics_handler(Extension(handle): Extension<PrometheusHandle>) -> String {
    handle.render()
}

async fn health_handler() -> &'static str {
    "ok\n"
}
