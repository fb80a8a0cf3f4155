use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};
use tokio::{sync::oneshot, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info};

use crate::{
    limiter::{BucketConfig, TokenBucket},
    metrics::Metrics,
    utils::TimeSource,
};

/// Per-client token buckets, created on first sight and evicted when idle.
///
/// The map sits behind a read-preferring lock: lookups of known clients share
/// it, inserts and sweeps take it exclusively. Bucket arithmetic happens on
/// the returned `Arc` after the map lock is released.
pub struct ClientLimiterRegistry {
    clients: RwLock<HashMap<String, Arc<TokenBucket>>>,
    config: BucketConfig,
    cleanup_interval: Duration,
    time_source: Arc<dyn TimeSource>,
}

impl ClientLimiterRegistry {
    pub fn new(
        config: BucketConfig,
        cleanup_interval: Duration,
        time_source: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            config,
            cleanup_interval,
            time_source,
        }
    }

    /// Get the bucket for `client_key`, creating a full one if needed
    pub fn limiter_for(&self, client_key: &str) -> Arc<TokenBucket> {
        {
            let clients = self.clients.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(bucket) = clients.get(client_key) {
                return bucket.clone();
            }
        }

        let mut clients = self.clients.write().unwrap_or_else(PoisonError::into_inner);
        // Another task may have inserted between the two locks
        clients
            .entry(client_key.to_string())
            .or_insert_with(|| {
                debug!(client = client_key, "Tracking new client");
                Arc::new(TokenBucket::new(self.config, self.time_source.clone()))
            })
            .clone()
    }

    /// Remove every bucket idle for at least the cleanup interval.
    ///
    /// Returns the number of evicted clients.
    pub fn sweep(&self) -> usize {
        let now = self.time_source.now();
        let mut clients = self.clients.write().unwrap_or_else(PoisonError::into_inner);

        let before = clients.len();
        clients.retain(|_, bucket| bucket.idle_for(now) < self.cleanup_interval);
        before - clients.len()
    }

    /// Number of clients currently tracked
    pub fn len(&self) -> usize {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, client_key: &str) -> bool {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(client_key)
    }

    /// Start the periodic idle sweep on the current tokio runtime
    pub fn spawn_sweeper(self: &Arc<Self>, metrics: Arc<Metrics>) -> Sweeper {
        let registry = Arc::clone(self);
        let period = self.cleanup_interval;
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = registry.sweep();
                        let remaining = registry.len();
                        metrics.record_client_sweep(evicted, remaining);
                        if evicted > 0 {
                            debug!(evicted, remaining, "Evicted idle clients");
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }

            info!("Client limiter sweeper stopped");
        });

        Sweeper {
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }
}

/// Handle to the background sweep task
pub struct Sweeper {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Sweeper {
    /// Stop the timer and wait for the task to finish
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
