//! Token-bucket rate limiter shared by every executor of a run.
//!
//! Time comes from `tokio::time`, so paused-clock tests run instantly.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::errors::{SnapError, SnapResult};

fn default_backoff_factor() -> f64 {
    0.5
}

fn default_min_rpm() -> f64 {
    1.0
}

fn default_recovery_window() -> u32 {
    10
}

fn default_recovery_step() -> f64 {
    0.1
}

/// Multiplicative-decrease / additive-increase tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    /// Rate multiplier applied on a provider rate-limit signal.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Floor for the effective rate.
    #[serde(default = "default_min_rpm")]
    pub min_rpm: f64,
    /// Consecutive successes before the rate is raised again.
    #[serde(default = "default_recovery_window")]
    pub recovery_window: u32,
    /// Increase per recovery step, as a fraction of the ceiling.
    #[serde(default = "default_recovery_step")]
    pub recovery_step: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            backoff_factor: default_backoff_factor(),
            min_rpm: default_min_rpm(),
            recovery_window: default_recovery_window(),
            recovery_step: default_recovery_step(),
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    rpm: f64,
    successes: u32,
}

impl Bucket {
    fn refill(&mut self, burst: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rpm / 60.0).min(burst);
        self.last_refill = now;
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    ceiling_rpm: f64,
    burst: f64,
    adaptive: Option<AdaptiveConfig>,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Fixed-rate limiter starting with a full bucket.
    pub fn new(requests_per_minute: f64, burst: u32) -> SnapResult<Self> {
        if !requests_per_minute.is_finite() || requests_per_minute <= 0.0 {
            return Err(SnapError::config(format!(
                "requests_per_minute must be positive, got {requests_per_minute}"
            )));
        }
        if burst == 0 {
            return Err(SnapError::config("burst must be at least 1"));
        }
        let burst = f64::from(burst);
        Ok(Self {
            ceiling_rpm: requests_per_minute,
            burst,
            adaptive: None,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
                rpm: requests_per_minute,
                successes: 0,
            }),
        })
    }

    /// Enable adaptive rate control.
    pub fn adaptive(mut self, config: AdaptiveConfig) -> SnapResult<Self> {
        if !(0.0..1.0).contains(&config.backoff_factor) || config.backoff_factor == 0.0 {
            return Err(SnapError::config("backoff_factor must be in (0, 1)"));
        }
        if config.recovery_window == 0 {
            return Err(SnapError::config("recovery_window must be at least 1"));
        }
        self.adaptive = Some(config);
        Ok(self)
    }

    /// Take one token, suspending the calling task until one is available.
    ///
    /// Waiters sleep and re-check; they are not served in arrival order.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                bucket.refill(self.burst);
                if bucket.tokens >= 1.0 - f64::EPSILON {
                    bucket.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) * 60.0 / bucket.rpm)
            };
            debug!(wait_ms = wait.as_millis() as u64, "rate limiter waiting");
            tokio::time::sleep(wait).await;
        }
    }

    /// Provider signalled a rate limit: shrink the effective rate.
    pub async fn on_rate_limited(&self) {
        let Some(cfg) = &self.adaptive else {
            return;
        };
        let mut bucket = self.bucket.lock().await;
        bucket.refill(self.burst);
        let floor = cfg.min_rpm.min(self.ceiling_rpm);
        bucket.rpm = (bucket.rpm * cfg.backoff_factor).max(floor);
        bucket.successes = 0;
        warn!(rpm = bucket.rpm, "rate limited by provider, reducing request rate");
    }

    /// A call succeeded: after enough consecutive successes, raise the rate.
    pub async fn on_success(&self) {
        let Some(cfg) = &self.adaptive else {
            return;
        };
        let mut bucket = self.bucket.lock().await;
        if bucket.rpm >= self.ceiling_rpm {
            return;
        }
        bucket.successes += 1;
        if bucket.successes >= cfg.recovery_window {
            bucket.refill(self.burst);
            bucket.rpm = (bucket.rpm + cfg.recovery_step * self.ceiling_rpm).min(self.ceiling_rpm);
            bucket.successes = 0;
            info!(rpm = bucket.rpm, "recovering request rate");
        }
    }

    /// Effective requests per minute.
    pub async fn current_rpm(&self) -> f64 {
        self.bucket.lock().await.rpm
    }

    pub fn ceiling_rpm(&self) -> f64 {
        self.ceiling_rpm
    }

    /// Back to the configured ceiling with a full bucket.
    pub async fn reset(&self) {
        let mut bucket = self.bucket.lock().await;
        bucket.tokens = self.burst;
        bucket.last_refill = Instant::now();
        bucket.rpm = self.ceiling_rpm;
        bucket.successes = 0;
    }
}
