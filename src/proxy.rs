//! Forwarding of routed requests to upstream services.

use async_trait::async_trait;
use axum::{
    body::{Body, Bytes},
    extract::Request,
    http::{
        header::{self, HeaderMap, HeaderName, HeaderValue},
        Version,
    },
    response::Response,
};
use http_body::{Body as HttpBody, Frame, SizeHint};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::{TokioExecutor, TokioTimer},
};
use std::{
    future::Future,
    io,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};
use tokio::time::{Instant, Sleep};
use tracing::{debug, warn};

use crate::{
    error::{GatewayError, Result},
    metrics::Metrics,
    routes::RouteEntry,
    utils::X_FORWARDED_FOR,
};

pub const X_FORWARDED_HOST: &str = "x-forwarded-host";
pub const X_ORIGIN_HOST: &str = "x-origin-host";

/// Headers that describe one connection and must not cross the proxy
static HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Sends a routed request upstream and hands back the upstream's response
#[async_trait]
pub trait Forward: Send + Sync {
    /// Forward `request` to `route` with its path replaced by `path`.
    ///
    /// Any upstream status is a successful forward. Errors mean no response
    /// was obtained.
    async fn forward(
        &self,
        route: &RouteEntry,
        path: &str,
        request: Request,
        remote: SocketAddr,
    ) -> Result<Response>;
}

/// Pooled plain-HTTP forwarder
pub struct HttpForwarder {
    client: Client<HttpConnector, Body>,
    timeout: Duration,
    metrics: Arc<Metrics>,
}

impl HttpForwarder {
    /// `timeout` bounds the whole exchange, from connecting until the last
    /// body frame. `idle_timeout` closes pooled upstream connections left unused.
    pub fn new(timeout: Duration, idle_timeout: Duration, metrics: Arc<Metrics>) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(timeout));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(idle_timeout)
            .build(connector);

        Self {
            client,
            timeout,
            metrics,
        }
    }
}

#[async_trait]
impl Forward for HttpForwarder {
    async fn forward(
        &self,
        route: &RouteEntry,
        path: &str,
        request: Request,
        remote: SocketAddr,
    ) -> Result<Response> {
        let service = route.name.as_str();
        let outbound = build_upstream_request(route, path, request, remote)?;

        debug!(
            service,
            method = %outbound.method(),
            uri = %outbound.uri(),
            "Proxying request"
        );

        let deadline = Instant::now() + self.timeout;
        let timer = self.metrics.start_forward_timer(service);
        let result = tokio::time::timeout_at(deadline, self.client.request(outbound)).await;
        timer.observe_duration();

        match result {
            Ok(Ok(response)) => {
                self.metrics
                    .record_upstream_response(service, response.status().as_u16());

                let (mut parts, body) = response.into_parts();
                strip_hop_by_hop(&mut parts.headers);
                let body = DeadlineBody::new(Body::new(body), deadline, service);
                Ok(Response::from_parts(parts, Body::new(body)))
            }
            Ok(Err(e)) => {
                warn!(service, error = %e, "Upstream unreachable");
                self.metrics.record_upstream_error(service, "unreachable");
                Err(GatewayError::UpstreamUnreachable {
                    service: service.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                warn!(
                    service,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Upstream timed out"
                );
                self.metrics.record_upstream_error(service, "timeout");
                Err(GatewayError::UpstreamTimeout {
                    service: service.to_string(),
                })
            }
        }
    }
}

/// Relayed upstream body that fails once the forward deadline passes
struct DeadlineBody {
    inner: Body,
    deadline: Pin<Box<Sleep>>,
    service: String,
}

impl DeadlineBody {
    fn new(inner: Body, deadline: Instant, service: &str) -> Self {
        Self {
            inner,
            deadline: Box::pin(tokio::time::sleep_until(deadline)),
            service: service.to_string(),
        }
    }
}

impl HttpBody for DeadlineBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, axum::Error>>> {
        if let Poll::Ready(frame) = Pin::new(&mut self.inner).poll_frame(cx) {
            return Poll::Ready(frame);
        }

        if self.deadline.as_mut().poll(cx).is_ready() {
            warn!(service = %self.service, "Upstream body timed out");
            return Poll::Ready(Some(Err(axum::Error::new(io::Error::new(
                io::ErrorKind::TimedOut,
                "upstream body timed out",
            )))));
        }

        Poll::Pending
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Rewrite an inbound request into the request sent to `route`.
///
/// Method, body and end-to-end headers are kept. The target URI, `Host` and
/// the forwarding headers are replaced.
pub fn build_upstream_request(
    route: &RouteEntry,
    path: &str,
    request: Request,
    remote: SocketAddr,
) -> Result<Request> {
    let (mut parts, body) = request.into_parts();

    parts.uri = route.upstream_uri(path, parts.uri.query())?;
    parts.version = Version::HTTP_11;

    let headers = &mut parts.headers;
    strip_hop_by_hop(headers);

    let client_ip = remote.ip().to_string();
    // A chain split over several header lines is one list
    let mut hops: Vec<&str> = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .collect();
    hops.push(&client_ip);
    let forwarded_for = hops.join(", ");

    headers.insert(X_FORWARDED_FOR, header_value(&forwarded_for)?);
    if let Some(host) = headers.get(header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_ORIGIN_HOST, header_value(&route.authority)?);
    headers.insert(header::HOST, header_value(&route.authority)?);

    Ok(Request::from_parts(parts, body))
}

/// Drop hop-by-hop headers, including any named by `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| GatewayError::RequestBuild(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::{RouteConfig, RouteTable};
    use axum::http::Method;

    fn products() -> RouteEntry {
        RouteTable::compile(vec![RouteConfig::new(
            "products",
            "http://product-service:8082",
            "/products",
        )])
        .unwrap()
        .routes()[0]
            .clone()
    }

    fn remote() -> SocketAddr {
        "192.0.2.10:40000".parse().unwrap()
    }

    #[test]
    fn test_upstream_request_rewrites_target_and_host() {
        let request = Request::builder()
            .method(Method::PUT)
            .uri("/products/42?fields=name")
            .header(header::HOST, "gateway.example.com")
            .body(Body::from("payload"))
            .unwrap();

        let outbound = build_upstream_request(&products(), "/42", request, remote()).unwrap();

        assert_eq!(outbound.method(), Method::PUT);
        assert_eq!(
            outbound.uri().to_string(),
            "http://product-service:8082/42?fields=name"
        );
        assert_eq!(outbound.headers()[header::HOST], "product-service:8082");
        assert_eq!(outbound.headers()[X_FORWARDED_HOST], "gateway.example.com");
        assert_eq!(outbound.headers()[X_ORIGIN_HOST], "product-service:8082");
        assert_eq!(outbound.headers()[X_FORWARDED_FOR], "192.0.2.10");
    }

    #[test]
    fn test_forwarded_for_chain_is_extended() {
        let request = Request::builder()
            .uri("/products")
            .header(X_FORWARDED_FOR, "203.0.113.1, 198.51.100.2")
            .body(Body::empty())
            .unwrap();

        let outbound = build_upstream_request(&products(), "/", request, remote()).unwrap();
        assert_eq!(
            outbound.headers()[X_FORWARDED_FOR],
            "203.0.113.1, 198.51.100.2, 192.0.2.10"
        );
        assert!(outbound.headers().get(X_FORWARDED_HOST).is_none());
    }

    #[test]
    fn test_forwarded_for_lines_are_joined() {
        let request = Request::builder()
            .uri("/products")
            .header(X_FORWARDED_FOR, "203.0.113.1")
            .header(X_FORWARDED_FOR, "198.51.100.2")
            .body(Body::empty())
            .unwrap();

        let outbound = build_upstream_request(&products(), "/", request, remote()).unwrap();

        let values: Vec<_> = outbound.headers().get_all(X_FORWARDED_FOR).iter().collect();
        assert_eq!(values, ["203.0.113.1, 198.51.100.2, 192.0.2.10"]);
    }

    #[test]
    fn test_hop_by_hop_headers_removed() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-session-hint"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-session-hint", HeaderValue::from_static("abc"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer t"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert_eq!(headers[header::AUTHORIZATION], "Bearer t");
    }
}
