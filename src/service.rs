use axum::{
    body::Body,
    extract::Request,
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
};
use std::{net::SocketAddr, sync::Arc};
use tracing::{debug, info};

use crate::{
    error::{GatewayError, LimitTier, Result},
    limiter::TokenBucket,
    metrics::Metrics,
    proxy::Forward,
    registry::ClientLimiterRegistry,
    routes::RouteTable,
    utils::client_key,
};

const ALLOW_ORIGIN: &str = "*";
const ALLOW_METHODS: &str = "GET, POST, PUT, DELETE, OPTIONS";
const ALLOW_HEADERS: &str = "Content-Type, Authorization";

/// Set the CORS headers every dispatched response carries
pub fn apply_cors(headers: &mut HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static(ALLOW_ORIGIN),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(ALLOW_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(ALLOW_HEADERS),
    );
}

/// The gateway request pipeline.
///
/// Per request: preflight short-circuit, global bucket, per-client bucket,
/// route resolution, then forwarding. Each stage either passes the request on
/// or produces the final response.
pub struct GatewayService {
    global: TokenBucket,
    clients: Arc<ClientLimiterRegistry>,
    routes: RouteTable,
    forwarder: Box<dyn Forward>,
    metrics: Arc<Metrics>,
    trust_forwarded_for: bool,
}

impl GatewayService {
    pub fn new(
        global: TokenBucket,
        clients: Arc<ClientLimiterRegistry>,
        routes: RouteTable,
        forwarder: Box<dyn Forward>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            global,
            clients,
            routes,
            forwarder,
            metrics,
            trust_forwarded_for: true,
        }
    }

    /// Whether the per-client key may come from `X-Forwarded-For`
    pub fn with_trust_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }

    /// Run one request through the pipeline
    pub async fn handle(&self, request: Request, remote: SocketAddr) -> Response {
        if request.method() == Method::OPTIONS {
            self.metrics.record_request("preflight");
            let mut response = (StatusCode::OK, Body::empty()).into_response();
            apply_cors(response.headers_mut());
            return response;
        }

        let mut response = match self.dispatch(request, remote).await {
            Ok(response) => {
                self.metrics.record_request("forwarded");
                response
            }
            Err(e) => {
                self.record_failure(&e);
                e.into_response()
            }
        };

        apply_cors(response.headers_mut());
        response
    }

    async fn dispatch(&self, request: Request, remote: SocketAddr) -> Result<Response> {
        if !self.global.allow() {
            return Err(GatewayError::RateLimited(LimitTier::Global));
        }

        let client = client_key(request.headers(), remote, self.trust_forwarded_for);
        if !self.clients.limiter_for(&client).allow() {
            debug!(client = %client, "Client over rate limit");
            return Err(GatewayError::RateLimited(LimitTier::Client));
        }

        let path = request.uri().path().to_string();
        let matched = self
            .routes
            .resolve(&path)
            .ok_or_else(|| GatewayError::RouteNotFound(path.clone()))?;

        info!(
            method = %request.method(),
            path = %path,
            service = %matched.route.name,
            upstream = %matched.route.upstream,
            "Forwarding request"
        );

        self.forwarder
            .forward(matched.route, &matched.path, request, remote)
            .await
    }

    fn record_failure(&self, error: &GatewayError) {
        match error {
            GatewayError::RateLimited(tier) => {
                self.metrics.record_request("rate_limited");
                self.metrics.record_rate_limited(tier.as_str());
            }
            GatewayError::RouteNotFound(path) => {
                debug!(path = %path, "No route");
                self.metrics.record_request("not_found");
            }
            _ => self.metrics.record_request("upstream_error"),
        }
    }

    pub fn clients(&self) -> &Arc<ClientLimiterRegistry> {
        &self.clients
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        limiter::BucketConfig,
        routes::{RouteConfig, RouteEntry},
        utils::{ManualTimeSource, TimeSource, X_FORWARDED_FOR},
    };
    use async_trait::async_trait;
    use std::{sync::Mutex, time::Duration};

    /// Records what it was asked to forward and answers 200
    #[derive(Default)]
    struct RecordingForwarder {
        calls: Arc<Mutex<Vec<(String, String)>>>,
    }

    #[async_trait]
    impl Forward for RecordingForwarder {
        async fn forward(
            &self,
            route: &RouteEntry,
            path: &str,
            _request: Request,
            _remote: SocketAddr,
        ) -> Result<Response> {
            self.calls
                .lock()
                .unwrap()
                .push((route.name.clone(), path.to_string()));
            Ok((StatusCode::OK, "upstream").into_response())
        }
    }

    struct UnreachableForwarder;

    #[async_trait]
    impl Forward for UnreachableForwarder {
        async fn forward(
            &self,
            route: &RouteEntry,
            _path: &str,
            _request: Request,
            _remote: SocketAddr,
        ) -> Result<Response> {
            Err(GatewayError::UpstreamUnreachable {
                service: route.name.clone(),
                reason: "connection refused".into(),
            })
        }
    }

    fn service_with(
        global: BucketConfig,
        client: BucketConfig,
        forwarder: Box<dyn Forward>,
    ) -> (GatewayService, Arc<ManualTimeSource>) {
        let clock = Arc::new(ManualTimeSource::new());
        let time_source: Arc<dyn TimeSource> = clock.clone();
        let routes = RouteTable::compile(vec![RouteConfig::new(
            "products",
            "http://product-service:8082",
            "/products",
        )])
        .unwrap();

        let service = GatewayService::new(
            TokenBucket::new(global, time_source.clone()),
            Arc::new(ClientLimiterRegistry::new(
                client,
                Duration::from_secs(3600),
                time_source,
            )),
            routes,
            forwarder,
            Arc::new(Metrics::new().unwrap()),
        );
        (service, clock)
    }

    fn remote() -> SocketAddr {
        "10.1.2.3:5555".parse().unwrap()
    }

    fn get(path: &str) -> Request {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_forwards_with_rewritten_path() {
        let forwarder = RecordingForwarder::default();
        let calls = forwarder.calls.clone();
        let (service, _clock) = service_with(
            BucketConfig::new(10.0, 1.0),
            BucketConfig::new(10.0, 1.0),
            Box::new(forwarder),
        );

        let response = service.handle(get("/products/42"), remote()).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(
            calls.lock().unwrap().as_slice(),
            &[("products".to_string(), "/42".to_string())]
        );
    }

    #[tokio::test]
    async fn test_unknown_path_is_404() {
        let (service, _clock) = service_with(
            BucketConfig::new(10.0, 1.0),
            BucketConfig::new(10.0, 1.0),
            Box::new(RecordingForwarder::default()),
        );

        let response = service.handle(get("/unknown"), remote()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_global_limit_rejects_with_429() {
        let (service, _clock) = service_with(
            BucketConfig::new(2.0, 1.0),
            BucketConfig::new(100.0, 1.0),
            Box::new(RecordingForwarder::default()),
        );

        assert_eq!(service.handle(get("/products"), remote()).await.status(), StatusCode::OK);
        assert_eq!(service.handle(get("/products"), remote()).await.status(), StatusCode::OK);

        let rejected = service.handle(get("/products"), remote()).await;
        assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_client_limit_is_per_client() {
        let (service, _clock) = service_with(
            BucketConfig::new(100.0, 1.0),
            BucketConfig::new(1.0, 1.0),
            Box::new(RecordingForwarder::default()),
        );

        let from = |client: &str| {
            Request::builder()
                .uri("/products")
                .header(X_FORWARDED_FOR, client)
                .body(Body::empty())
                .unwrap()
        };

        assert_eq!(service.handle(from("203.0.113.1"), remote()).await.status(), StatusCode::OK);
        assert_eq!(
            service.handle(from("203.0.113.1"), remote()).await.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(service.handle(from("203.0.113.2"), remote()).await.status(), StatusCode::OK);
        assert_eq!(service.clients().len(), 2);
    }

    #[tokio::test]
    async fn test_refill_readmits_after_wait() {
        let (service, clock) = service_with(
            BucketConfig::new(1.0, 1.0),
            BucketConfig::new(10.0, 1.0),
            Box::new(RecordingForwarder::default()),
        );

        assert_eq!(service.handle(get("/products"), remote()).await.status(), StatusCode::OK);
        assert_eq!(
            service.handle(get("/products"), remote()).await.status(),
            StatusCode::TOO_MANY_REQUESTS
        );

        clock.advance(Duration::from_secs(1));
        assert_eq!(service.handle(get("/products"), remote()).await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_preflight_skips_limits_and_routing() {
        let (service, _clock) = service_with(
            BucketConfig::new(1.0, 1.0),
            BucketConfig::new(1.0, 1.0),
            Box::new(RecordingForwarder::default()),
        );

        for path in ["/products", "/nowhere", "/"] {
            let request = Request::builder()
                .method(Method::OPTIONS)
                .uri(path)
                .body(Body::empty())
                .unwrap();
            let response = service.handle(request, remote()).await;

            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(
                response.headers()[header::ACCESS_CONTROL_ALLOW_METHODS],
                "GET, POST, PUT, DELETE, OPTIONS"
            );
            assert_eq!(
                response.headers()[header::ACCESS_CONTROL_ALLOW_HEADERS],
                "Content-Type, Authorization"
            );
        }

        // Buckets are still full
        assert_eq!(service.handle(get("/products"), remote()).await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_upstream_failure_is_502() {
        let (service, _clock) = service_with(
            BucketConfig::new(10.0, 1.0),
            BucketConfig::new(10.0, 1.0),
            Box::new(UnreachableForwarder),
        );

        let response = service.handle(get("/products/1"), remote()).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    }

    #[tokio::test]
    async fn test_untrusted_forwarded_for_keys_on_peer() {
        let (service, _clock) = service_with(
            BucketConfig::new(100.0, 1.0),
            BucketConfig::new(1.0, 1.0),
            Box::new(RecordingForwarder::default()),
        );
        let service = service.with_trust_forwarded_for(false);

        let spoofed = |client: &str| {
            Request::builder()
                .uri("/products")
                .header(X_FORWARDED_FOR, client)
                .body(Body::empty())
                .unwrap()
        };

        assert_eq!(service.handle(spoofed("1.1.1.1"), remote()).await.status(), StatusCode::OK);
        assert_eq!(
            service.handle(spoofed("2.2.2.2"), remote()).await.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }
}
