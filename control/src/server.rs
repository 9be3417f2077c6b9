//! Metrics and health endpoint
//!
//! - `GET /metrics`: Prometheus text format
//! - `GET /healthz`: always 200 while the process runs
//! - `GET /readyz`: 200 once the startup sync completed, 503 before

use crate::apis::metrics::gather_controller_metrics;
use crate::error::ControllerError;
use crate::sync::SyncOrchestrator;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

fn text(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// Answer one request
pub fn respond(method: &Method, path: &str, ready: bool) -> Response<Full<Bytes>> {
    if *method != Method::GET {
        return text(StatusCode::METHOD_NOT_ALLOWED, "text/plain", "method not allowed\n");
    }

    match path {
        "/metrics" => match gather_controller_metrics() {
            Ok(body) => text(StatusCode::OK, METRICS_CONTENT_TYPE, body),
            Err(e) => {
                error!("Failed to gather metrics: {}", e);
                text(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", e)
            }
        },
        "/healthz" => text(StatusCode::OK, "text/plain", "ok\n"),
        "/readyz" if ready => text(StatusCode::OK, "text/plain", "ready\n"),
        "/readyz" => text(StatusCode::SERVICE_UNAVAILABLE, "text/plain", "initial sync pending\n"),
        _ => text(StatusCode::NOT_FOUND, "text/plain", "not found\n"),
    }
}

/// Serve until the task is aborted
pub async fn serve(addr: SocketAddr, orchestrator: Arc<SyncOrchestrator>) -> Result<(), ControllerError> {
    let listener = TcpListener::bind(addr).await?;
    info!("Metrics and health server listening on {}", addr);

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Accept error on {}: {}", addr, e);
                continue;
            }
        };

        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req: Request<Incoming>| {
                let response = respond(req.method(), req.uri().path(), orchestrator.is_ready());
                async move { Ok::<_, Infallible>(response) }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!("Connection error from {}: {}", peer, e);
            }
        });
    }
}
