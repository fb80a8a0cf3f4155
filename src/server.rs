use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    response::Response,
    routing::get,
    Router,
};
use hyper::{body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::rt::{TokioIo, TokioTimer};
use prometheus::TextEncoder;
use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower::ServiceExt;
use tracing::{debug, info, warn};

use crate::{error::Result, metrics::Metrics, service::GatewayService};

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<GatewayService>,
    pub metrics: Arc<Metrics>,
}

/// Build the HTTP surface.
///
/// `GET /health`, `GET /metrics` and `GET /` answer directly. Every other
/// method and path goes through the dispatcher.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check).fallback(dispatch))
        .route("/metrics", get(metrics_handler).fallback(dispatch))
        .route("/", get(root).fallback(dispatch))
        .fallback(dispatch)
        .with_state(state)
}

async fn dispatch(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    state.service.handle(request, remote).await
}

async fn health_check() -> &'static str {
    "OK"
}

async fn root() -> &'static str {
    "Welcome to the API Gateway!"
}

async fn metrics_handler(State(state): State<AppState>) -> std::result::Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = state.metrics.registry().gather();

    match encoder.encode_to_string(&metric_families) {
        Ok(metrics) => Ok(metrics),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// Accept connections until `shutdown` resolves.
///
/// Each connection is served on its own task. A client that does not finish
/// sending request headers within `read_timeout` is disconnected.
pub async fn serve<F>(
    listener: TcpListener,
    app: Router,
    read_timeout: Duration,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()>,
{
    let local = listener.local_addr()?;
    info!(address = %local, "Gateway listening");
    tokio::pin!(shutdown);

    loop {
        let (stream, remote) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    continue;
                }
            },
            _ = &mut shutdown => break,
        };

        let app = app.clone();
        tokio::spawn(async move {
            let service = service_fn(move |mut request: hyper::Request<Incoming>| {
                request.extensions_mut().insert(ConnectInfo(remote));
                app.clone().oneshot(request.map(Body::new))
            });

            let connection = http1::Builder::new()
                .timer(TokioTimer::new())
                .header_read_timeout(read_timeout)
                .serve_connection(TokioIo::new(stream), service);

            if let Err(e) = connection.await {
                debug!(remote = %remote, error = %e, "Connection closed with error");
            }
        });
    }

    info!("Gateway stopped accepting connections");
    Ok(())
}
