//! The HTTP admin endpoint: liveness, readiness, and metrics.
//!
//! Orthogonal to the signing path; nothing here touches credentials.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tracing::info;

use strand_identity::Error;

/// Process-local issuance counters, rendered in Prometheus text format.
#[derive(Debug, Default)]
pub struct Metrics {
    issued: AtomicU64,
    client_errors: AtomicU64,
    transient_errors: AtomicU64,
}

impl Metrics {
    pub fn record_success(&self) {
        self.issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self, err: &Error) {
        match err {
            Error::ReviewUnavailable(_) | Error::Signing(_) => {
                self.transient_errors.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.client_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn render(&self) -> String {
        format!(
            "# HELP strand_identity_certificates_issued_total Certificates issued by this process.\n\
             # TYPE strand_identity_certificates_issued_total counter\n\
             strand_identity_certificates_issued_total {}\n\
             # HELP strand_identity_certify_failures_total Certify calls that returned an error.\n\
             # TYPE strand_identity_certify_failures_total counter\n\
             strand_identity_certify_failures_total{{class=\"client\"}} {}\n\
             strand_identity_certify_failures_total{{class=\"transient\"}} {}\n",
            self.issued.load(Ordering::Relaxed),
            self.client_errors.load(Ordering::Relaxed),
            self.transient_errors.load(Ordering::Relaxed),
        )
    }
}

/// Shared state behind the admin routes.
#[derive(Clone)]
pub struct AdminState {
    metrics: Arc<Metrics>,
    ready: Arc<AtomicBool>,
}

impl AdminState {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            metrics,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flips readiness once the signing endpoint is accepting requests.
    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }
}

/// Serves the admin endpoint until the process exits.
pub async fn serve(state: AdminState, addr: SocketAddr) -> std::io::Result<()> {
    let app = Router::new()
        .route("/live", get(live))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "admin server listening");
    axum::serve(listener, app).await
}

async fn live() -> StatusCode {
    StatusCode::OK
}

async fn ready(State(state): State<AdminState>) -> StatusCode {
    if state.ready.load(Ordering::Acquire) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn metrics(State(state): State<AdminState>) -> String {
    state.metrics.render()
}
