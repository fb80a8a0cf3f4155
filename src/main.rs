use anyhow::Result;
use std::sync::Arc;
use tokio::{net::TcpListener, signal};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api_gateway::{
    config::GatewayConfig,
    limiter::TokenBucket,
    metrics::Metrics,
    proxy::HttpForwarder,
    registry::ClientLimiterRegistry,
    routes::RouteTable,
    server::{self, AppState},
    service::GatewayService,
    utils::{SystemTimeSource, TimeSource},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "api_gateway=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting API Gateway");

    // Invalid configuration or routes abort startup
    let config = GatewayConfig::from_env()?;
    let routes = RouteTable::compile(config.routes()?)?;

    let metrics = Arc::new(Metrics::new()?);
    let time_source: Arc<dyn TimeSource> = Arc::new(SystemTimeSource);

    let clients = Arc::new(ClientLimiterRegistry::new(
        config.client_limit.bucket(),
        config.client_limit.cleanup_interval(),
        time_source.clone(),
    ));
    let sweeper = clients.spawn_sweeper(metrics.clone());

    let service = create_service(&config, routes, clients, time_source, metrics.clone());
    let state = AppState {
        service: Arc::new(service),
        metrics,
    };

    info!(
        global_capacity = config.global_limit.capacity,
        global_refill_rate = config.global_limit.refill_rate,
        client_capacity = config.client_limit.capacity,
        client_refill_rate = config.client_limit.refill_rate,
        cleanup_interval_secs = config.client_limit.cleanup_interval_secs,
        "Rate limiters configured"
    );

    let listener = TcpListener::bind(config.listen_addr()).await?;
    server::serve(
        listener,
        server::router(state),
        config.read_timeout(),
        async {
            let _ = signal::ctrl_c().await;
            info!("Received Ctrl+C, shutting down");
        },
    )
    .await?;

    sweeper.shutdown().await;
    info!("Gateway stopped");
    Ok(())
}

fn create_service(
    config: &GatewayConfig,
    routes: RouteTable,
    clients: Arc<ClientLimiterRegistry>,
    time_source: Arc<dyn TimeSource>,
    metrics: Arc<Metrics>,
) -> GatewayService {
    let forwarder = HttpForwarder::new(config.write_timeout(), config.idle_timeout(), metrics.clone());
    let global = TokenBucket::new(config.global_limit, time_source);

    GatewayService::new(global, clients, routes, Box::new(forwarder), metrics)
        .with_trust_forwarded_for(config.trust_forwarded_for)
}
