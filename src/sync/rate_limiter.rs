//! Per-host request spacing
//!
//! Every outbound request reserves a slot on its host's bucket. Slots are
//! spaced by the host's minimum interval plus optional jitter, so K requests
//! to one host take at least `(K - 1) * min_interval` regardless of how many
//! tasks issue them. Throttling responses push the next slot further out with
//! an exponentially growing penalty.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::RateLimitConfig;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    next_allowed: Instant,
    penalty_level: u32,
}

/// Host-keyed rate limiter shared by every job
pub struct HostRateLimiter {
    clock: Arc<dyn Clock>,
    config: RateLimitConfig,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl HostRateLimiter {
    /// Create a limiter over the given time source
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Wait until one more request to `host` is allowed
    pub async fn acquire(&self, host: &str) {
        let now = self.clock.now();
        let slot = {
            let mut buckets = self.buckets.lock().unwrap();
            let bucket = buckets.entry(host.to_string()).or_insert(Bucket {
                next_allowed: now,
                penalty_level: 0,
            });

            let slot = bucket.next_allowed.max(now);
            bucket.next_allowed = slot + self.spacing(host);
            slot
        };

        if slot > now {
            debug!(
                host = host,
                wait_ms = (slot - now).as_millis() as u64,
                "Waiting for rate limit"
            );
            self.clock.sleep_until(slot).await;
        }
    }

    /// Report a throttling response from `host`
    ///
    /// Returns the delay applied before the next request.
    pub fn penalize(&self, host: &str, suggested_delay: Option<Duration>) -> Duration {
        let now = self.clock.now();
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets.entry(host.to_string()).or_insert(Bucket {
            next_allowed: now,
            penalty_level: 0,
        });

        bucket.penalty_level = bucket.penalty_level.saturating_add(1);
        let delay = suggested_delay
            .unwrap_or_else(|| self.penalty_delay(bucket.penalty_level))
            .min(self.max_backoff());

        bucket.next_allowed = bucket.next_allowed.max(now + delay);

        warn!(
            host = host,
            level = bucket.penalty_level,
            delay_ms = delay.as_millis() as u64,
            "Host throttled, backing off"
        );
        delay
    }

    /// Clear the penalty after a successful response
    pub fn record_success(&self, host: &str) {
        let mut buckets = self.buckets.lock().unwrap();
        if let Some(bucket) = buckets.get_mut(host) {
            bucket.penalty_level = 0;
        }
    }

    /// Current penalty level for `host`
    pub fn penalty_level(&self, host: &str) -> u32 {
        self.buckets
            .lock()
            .unwrap()
            .get(host)
            .map(|b| b.penalty_level)
            .unwrap_or(0)
    }

    /// Delay for the n-th consecutive penalty: `base * 2^(n-1)`, capped
    pub fn penalty_delay(&self, level: u32) -> Duration {
        let exponent = level.saturating_sub(1).min(31);
        let delay = self
            .config
            .base_backoff_ms
            .saturating_mul(1u64 << exponent);
        Duration::from_millis(delay).min(self.max_backoff())
    }

    /// Minimum spacing configured for `host`
    pub fn min_interval(&self, host: &str) -> Duration {
        let ms = self
            .config
            .hosts
            .get(host)
            .copied()
            .unwrap_or(self.config.default_min_interval_ms);
        Duration::from_millis(ms)
    }

    fn spacing(&self, host: &str) -> Duration {
        let jitter = if self.config.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.config.jitter_ms)
        } else {
            0
        };
        self.min_interval(host) + Duration::from_millis(jitter)
    }

    fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.config.max_backoff_secs)
    }
}

/// Host portion of a URL, used as the rate-limit bucket key
pub fn host_key(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(parsed) => match (parsed.host_str(), parsed.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            _ => url.to_string(),
        },
        Err(_) => url.to_string(),
    }
}
