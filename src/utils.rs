use std::{
    net::SocketAddr,
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

use axum::http::HeaderMap;

/// Source of monotonic time for refill and idle calculations.
///
/// Buckets and the client registry read the clock through this trait so that
/// tests can move time forward without sleeping.
pub trait TimeSource: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall-clock backed time source used in production
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Time source that only moves when told to
#[derive(Debug)]
pub struct ManualTimeSource {
    current: Mutex<Instant>,
}

impl ManualTimeSource {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(Instant::now()),
        }
    }

    /// Move the clock forward by `by`
    pub fn advance(&self, by: Duration) {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        *current += by;
    }
}

impl Default for ManualTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> Instant {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Header carrying the chain of client addresses seen by proxies
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Derive the per-client rate limit key for a request.
///
/// With `trust_forwarded_for` the leftmost non-empty `X-Forwarded-For` entry
/// wins. Otherwise, or when the header is absent or blank, the peer IP is
/// used without its port so reconnecting clients keep their bucket.
pub fn client_key(headers: &HeaderMap, remote: SocketAddr, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        let forwarded = headers
            .get(X_FORWARDED_FOR)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').map(str::trim).find(|entry| !entry.is_empty()));

        if let Some(client) = forwarded {
            return client.to_string();
        }
    }

    remote.ip().to_string()
}
