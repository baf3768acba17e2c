//! Per-client token-bucket rate limiting.
//!
//! Clients are keyed by an opaque string (typically the peer address). Every
//! client shares the same rate and burst. One mutex guards the whole client
//! map; a background sweep evicts clients idle longer than the deletion
//! threshold.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RateLimitSettings;

/// Shortest period the sweep will run at.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Refilling token bucket for one client.
#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

impl TokenBucket {
    fn full(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
            last_seen: now,
        }
    }

    fn try_take(&mut self, rate: f64, capacity: f64, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(capacity);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Shared admission gate. Cloning is cheap; clones share the client map.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    settings: RateLimitSettings,
    clients: Arc<Mutex<HashMap<String, TokenBucket>>>,
}

impl RateLimiter {
    /// Limiter without a background sweep.
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            settings,
            clients: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Limiter plus its sweep task, which runs until `shutdown` is cancelled.
    ///
    /// An `evaluation_interval` below [`MIN_SWEEP_INTERVAL`] is raised to it.
    pub fn start(
        settings: RateLimitSettings,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let limiter = Self::new(settings);
        let sweeper = limiter.clone();
        let handle = tokio::spawn(async move { sweeper.run_sweeper(shutdown).await });
        info!(
            rate = settings.rate_per_second,
            burst = settings.burst,
            "rate limiter started"
        );
        (limiter, handle)
    }

    /// Take one token for `key`, creating its bucket on first sight.
    pub async fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        let capacity = f64::from(self.settings.burst);
        let mut clients = self.clients.lock().await;
        let bucket = clients
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::full(capacity, now));
        bucket.last_seen = now;
        bucket.try_take(self.settings.rate_per_second, capacity, now)
    }

    /// Evict clients idle longer than the deletion threshold.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let threshold = self.settings.deletion_threshold;
        let mut clients = self.clients.lock().await;
        let before = clients.len();
        clients.retain(|_, bucket| {
            now.saturating_duration_since(bucket.last_seen) <= threshold
        });
        let evicted = before - clients.len();
        if evicted > 0 {
            debug!(evicted, remaining = clients.len(), "evicted idle rate limit clients");
        }
        evicted
    }

    pub async fn client_count(&self) -> usize {
        self.clients.lock().await.len()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.clients.lock().await.contains_key(key)
    }

    async fn run_sweeper(self, shutdown: CancellationToken) {
        let period = self.settings.evaluation_interval;
        let period = if period < MIN_SWEEP_INTERVAL {
            warn!(?period, min = ?MIN_SWEEP_INTERVAL, "sweep interval raised to minimum");
            MIN_SWEEP_INTERVAL
        } else {
            period
        };
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("rate limiter sweep stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }
    }
}
