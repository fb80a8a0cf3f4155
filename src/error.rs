use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Which limiter rejected a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitTier {
    Global,
    Client,
}

impl LimitTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitTier::Global => "global",
            LimitTier::Client => "client",
        }
    }
}

/// Errors that can occur in the gateway
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid upstream address for {service}: {reason}")]
    InvalidUpstream { service: String, reason: String },

    #[error("Rate limit exceeded ({})", .0.as_str())]
    RateLimited(LimitTier),

    #[error("No route for path: {0}")]
    RouteNotFound(String),

    #[error("Upstream {service} unreachable: {reason}")]
    UpstreamUnreachable { service: String, reason: String },

    #[error("Upstream {service} timed out")]
    UpstreamTimeout { service: String },

    #[error("Failed to build upstream request: {0}")]
    RequestBuild(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::RouteNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::UpstreamUnreachable { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = match &self {
            GatewayError::RateLimited(_) => "Rate limit exceeded",
            GatewayError::RouteNotFound(_) => "404 page not found",
            GatewayError::UpstreamUnreachable { .. } => "Bad Gateway",
            GatewayError::UpstreamTimeout { .. } => "Gateway Timeout",
            // Startup and internal details stay in the logs
            _ => "Internal Server Error",
        };

        (self.status_code(), body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            GatewayError::RateLimited(LimitTier::Global).status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            GatewayError::RouteNotFound("/nope".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::UpstreamUnreachable {
                service: "products".into(),
                reason: "connection refused".into(),
            }
            .status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::UpstreamTimeout {
                service: "products".into()
            }
            .status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            GatewayError::Config("bad".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_messages() {
        let err = GatewayError::RateLimited(LimitTier::Client);
        assert_eq!(err.to_string(), "Rate limit exceeded (client)");

        let err = GatewayError::InvalidUpstream {
            service: "users".into(),
            reason: "missing scheme".into(),
        };
        assert!(err.to_string().contains("users"));
    }
}
