use serde::{Deserialize, Serialize};
use std::{collections::HashMap, net::SocketAddr, time::Duration};

use crate::{
    error::{GatewayError, Result},
    limiter::BucketConfig,
    routes::RouteConfig,
};

/// Gateway settings, read once at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub port: u16,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub global_limit: BucketConfig,
    pub client_limit: ClientLimitConfig,
    pub trust_forwarded_for: bool,
    #[serde(default)]
    pub routes_file: Option<String>,
    pub services: ServiceUrls,
}

/// Per-client limiter tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientLimitConfig {
    pub capacity: f64,
    pub refill_rate: f64,
    pub cleanup_interval_secs: u64,
}

impl ClientLimitConfig {
    pub fn bucket(&self) -> BucketConfig {
        BucketConfig::new(self.capacity, self.refill_rate)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// Upstream base addresses for the built-in route set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceUrls {
    pub products: String,
    pub payments: String,
    pub users: String,
    pub auth: String,
}

/// Plain variable names that override the prefixed ones
const LEGACY_OVERRIDES: [(&str, &str); 5] = [
    ("PORT", "port"),
    ("PRODUCT_SERVICE_URL", "services.products"),
    ("PAYMENT_SERVICE_URL", "services.payments"),
    ("USER_SERVICE_URL", "services.users"),
    ("AUTH_SERVICE_URL", "services.auth"),
];

impl GatewayConfig {
    /// Load from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars().collect())
    }

    /// Load from an explicit variable map.
    ///
    /// Defaults, then `GATEWAY__*` variables (`__` separates nested keys),
    /// then the legacy plain variables.
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("port", 8080)?
            .set_default("read_timeout_secs", 15)?
            .set_default("write_timeout_secs", 15)?
            .set_default("idle_timeout_secs", 60)?
            .set_default("global_limit.capacity", 100.0)?
            .set_default("global_limit.refill_rate", 10.0)?
            .set_default("client_limit.capacity", 10.0)?
            .set_default("client_limit.refill_rate", 1.0)?
            .set_default("client_limit.cleanup_interval_secs", 3600)?
            .set_default("trust_forwarded_for", true)?
            .set_default("services.products", "http://product-service:8082")?
            .set_default("services.payments", "http://payment-service:8081")?
            .set_default("services.users", "http://user-service:8083")?
            .set_default("services.auth", "http://auth-service:8080")?
            .add_source(
                config::Environment::with_prefix("GATEWAY")
                    .separator("__")
                    .try_parsing(true)
                    .source(Some(vars.clone())),
            );

        for (var, key) in LEGACY_OVERRIDES {
            let value = vars.get(var).filter(|value| !value.is_empty()).cloned();
            builder = builder.set_override_option(key, value)?;
        }

        let config: GatewayConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the gateway cannot run with
    pub fn validate(&self) -> Result<()> {
        self.global_limit.validate("global")?;
        self.client_limit.bucket().validate("client")?;

        if self.client_limit.cleanup_interval_secs == 0 {
            return Err(GatewayError::Config(
                "client cleanup interval must be positive".to_string(),
            ));
        }

        for (name, value) in [
            ("read", self.read_timeout_secs),
            ("write", self.write_timeout_secs),
            ("idle", self.idle_timeout_secs),
        ] {
            if value == 0 {
                return Err(GatewayError::Config(format!(
                    "{} timeout must be positive",
                    name
                )));
            }
        }

        Ok(())
    }

    /// Route set from `routes_file` if configured, otherwise the built-in one
    pub fn routes(&self) -> Result<Vec<RouteConfig>> {
        match &self.routes_file {
            Some(path) => load_routes_from_file(path),
            None => Ok(vec![
                RouteConfig::new("products", &self.services.products, "/products"),
                RouteConfig::new("payments", &self.services.payments, "/payment"),
                RouteConfig::new("users", &self.services.users, "/users"),
                RouteConfig::new("auth", &self.services.auth, "/auth"),
            ]),
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Load routes from a YAML list
pub fn load_routes_from_yaml(yaml: &str) -> Result<Vec<RouteConfig>> {
    let routes: Vec<RouteConfig> = serde_yaml::from_str(yaml)?;
    if routes.is_empty() {
        return Err(GatewayError::Config("routes file defines no routes".to_string()));
    }
    Ok(routes)
}

/// Load routes from a YAML file
pub fn load_routes_from_file(path: &str) -> Result<Vec<RouteConfig>> {
    let content = std::fs::read_to_string(path)?;
    load_routes_from_yaml(&content)
}
