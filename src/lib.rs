//! API Gateway
//!
//! Routes requests to upstream services by path prefix and protects them
//! with a two-tier token-bucket rate limiter: one bucket shared by every
//! caller and one bucket per client identity.

pub mod config;
pub mod error;
pub mod limiter;
pub mod metrics;
pub mod proxy;
pub mod registry;
pub mod routes;
pub mod server;
pub mod service;
pub mod utils;

// Re-export main types
pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use limiter::{BucketConfig, TokenBucket};
pub use registry::ClientLimiterRegistry;
pub use routes::{RouteEntry, RouteTable};
pub use service::GatewayService;
