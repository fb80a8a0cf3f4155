// Validates gateway configuration without starting the server
// Run this with: cargo run --bin check_config

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api_gateway::{config::GatewayConfig, routes::RouteTable};

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Checking gateway configuration...");

    let config = GatewayConfig::from_env().map_err(|e| {
        error!("Configuration rejected: {}", e);
        e
    })?;

    let routes = config
        .routes()
        .and_then(RouteTable::compile)
        .context("route table rejected")?;

    let report = json!({
        "listen": config.listen_addr().to_string(),
        "timeouts_secs": {
            "read": config.read_timeout_secs,
            "write": config.write_timeout_secs,
            "idle": config.idle_timeout_secs,
        },
        "global_limit": config.global_limit,
        "client_limit": config.client_limit,
        "trust_forwarded_for": config.trust_forwarded_for,
        "routes": routes.routes(),
    });

    println!("{}", serde_json::to_string_pretty(&report)?);
    info!("Configuration OK ({} routes)", routes.len());
    Ok(())
}
