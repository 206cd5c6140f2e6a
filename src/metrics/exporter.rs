//! HTTP Exporter
//!
//! `/metrics` in the Prometheus text format and `/healthz` `/livez` `/readyz`
//! probes, both served by hyper until the token is cancelled.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::FleetMetrics;
use crate::error::{Error, Result};

/// Readiness flag shared with the probes
#[derive(Debug, Default)]
pub struct HealthState {
    ready: AtomicBool,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}

fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

fn health_response(path: &str, state: &HealthState) -> Response<Full<Bytes>> {
    match path {
        "/healthz" | "/livez" => respond(StatusCode::OK, "ok"),
        "/readyz" if state.is_ready() => respond(StatusCode::OK, "ok"),
        "/readyz" => respond(StatusCode::SERVICE_UNAVAILABLE, "not ready"),
        _ => respond(StatusCode::NOT_FOUND, "not found"),
    }
}

fn metrics_response(path: &str, metrics: &FleetMetrics) -> Response<Full<Bytes>> {
    if path != "/metrics" {
        return respond(StatusCode::NOT_FOUND, "not found");
    }
    match metrics.encode() {
        Ok(buffer) => {
            let mut response = respond(StatusCode::OK, buffer);
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static(prometheus::TEXT_FORMAT));
            response
        }
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            respond(StatusCode::INTERNAL_SERVER_ERROR, "encoding failed")
        }
    }
}

async fn bind(addr: &str, what: &str) -> Result<TcpListener> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Config(format!("Invalid {} address {}: {}", what, addr, e)))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind {}: {}", what, e)))?;

    info!("{} listening on {}", what, addr);
    Ok(listener)
}

// =============================================================================
// Health Server
// =============================================================================

pub async fn run_health_server(
    addr: &str,
    state: Arc<HealthState>,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = bind(addr, "Health server").await?;

    loop {
        let (stream, _) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted?,
        };
        let io = TokioIo::new(stream);
        let state = Arc::clone(&state);

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let response = health_response(req.uri().path(), &state);
                async move { Ok::<_, Infallible>(response) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Health server connection error: {}", e);
            }
        });
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

pub async fn run_metrics_server(
    addr: &str,
    metrics: Arc<FleetMetrics>,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = bind(addr, "Metrics server").await?;

    loop {
        let (stream, _) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted?,
        };
        let io = TokioIo::new(stream);
        let metrics = Arc::clone(&metrics);

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let response = metrics_response(req.uri().path(), &metrics);
                async move { Ok::<_, Infallible>(response) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Metrics server connection error: {}", e);
            }
        });
    }
}
