//! Per-peer rate limiting for imrpc servers.
//!
//! Each peer IP gets its own budget, kept by one of two algorithms:
//!
//! - [`RateAlgorithm::TokenBucket`]: a request consumes one token; the bucket
//!   refills continuously at `requests_per_second` up to `burst_size`.
//! - [`RateAlgorithm::FixedWindow`]: at most `burst_size` requests per window;
//!   the count resets when the window ends.
//!
//! A throttled request is answered with a "rate limited" error response and
//! the connection stays open.
//!
//! # Example
//!
//! ```
//! use imrpc_common::rate_limit::{RateLimitConfig, RateLimiter};
//! use std::net::{IpAddr, Ipv4Addr};
//!
//! let limiter = RateLimiter::new(RateLimitConfig::new(10.0, 2));
//! let peer = IpAddr::V4(Ipv4Addr::LOCALHOST);
//!
//! assert!(limiter.check(peer).is_allowed());
//! assert!(limiter.check(peer).is_allowed());
//! assert!(!limiter.check(peer).is_allowed());
//! ```

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Message carried in the error field of a throttled response.
pub const RATE_LIMITED_MESSAGE: &str = "rate limited";

/// How a peer's budget is replenished.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RateAlgorithm {
    #[default]
    TokenBucket,
    FixedWindow { window: Duration },
}

/// Rate limiter parameters.
#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub algorithm: RateAlgorithm,
    /// Sustained request rate per peer
    pub requests_per_second: f64,
    /// Tokens a fresh or idle peer starts with; for a fixed window, the
    /// requests allowed per window
    pub burst_size: u32,
    /// How often idle buckets are swept
    pub cleanup_interval: Duration,
    /// Buckets untouched for this long are dropped
    pub entry_ttl: Duration,
}

impl RateLimitConfig {
    pub fn new(requests_per_second: f64, burst_size: u32) -> Self {
        Self {
            algorithm: RateAlgorithm::TokenBucket,
            requests_per_second,
            burst_size,
            cleanup_interval: Duration::from_secs(60),
            entry_ttl: Duration::from_secs(300),
        }
    }

    /// `rps` sustained with a burst of twice that.
    pub fn per_second(rps: f64) -> Self {
        Self::new(rps, (rps * 2.0).ceil() as u32)
    }

    /// At most `max_requests` per `window` for each peer.
    pub fn fixed_window(max_requests: u32, window: Duration) -> Self {
        let rate = max_requests as f64 / window.as_secs_f64().max(f64::EPSILON);
        let ttl = window.max(Duration::from_secs(300));
        Self {
            algorithm: RateAlgorithm::FixedWindow { window },
            ..Self::new(rate, max_requests)
        }
        .with_entry_ttl(ttl)
    }

    pub fn with_entry_ttl(mut self, ttl: Duration) -> Self {
        self.entry_ttl = ttl;
        self
    }
}

/// Outcome of [`RateLimiter::check`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Limited { retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed)
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RateDecision::Allowed => None,
            RateDecision::Limited { retry_after } => Some(*retry_after),
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    /// Last refill, or the start of the current window
    refilled_at: Instant,
    touched_at: Instant,
}

impl Bucket {
    fn full(config: &RateLimitConfig, now: Instant) -> Self {
        Self {
            tokens: config.burst_size as f64,
            refilled_at: now,
            touched_at: now,
        }
    }

    fn take(&mut self, config: &RateLimitConfig, now: Instant) -> RateDecision {
        self.touched_at = now;
        match config.algorithm {
            RateAlgorithm::TokenBucket => self.take_token(config, now),
            RateAlgorithm::FixedWindow { window } => self.take_in_window(config, window, now),
        }
    }

    fn take_in_window(
        &mut self,
        config: &RateLimitConfig,
        window: Duration,
        now: Instant,
    ) -> RateDecision {
        let mut elapsed = now.saturating_duration_since(self.refilled_at);
        if elapsed >= window {
            self.tokens = config.burst_size as f64;
            self.refilled_at = now;
            elapsed = Duration::ZERO;
        }

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return RateDecision::Allowed;
        }
        RateDecision::Limited {
            retry_after: window - elapsed,
        }
    }

    fn take_token(&mut self, config: &RateLimitConfig, now: Instant) -> RateDecision {
        let elapsed = now.saturating_duration_since(self.refilled_at).as_secs_f64();
        self.tokens = (self.tokens + elapsed * config.requests_per_second)
            .min(config.burst_size as f64);
        self.refilled_at = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return RateDecision::Allowed;
        }

        let missing = 1.0 - self.tokens;
        let retry_after = if config.requests_per_second > 0.0 {
            Duration::from_secs_f64(missing / config.requests_per_second)
        } else {
            Duration::MAX
        };
        RateDecision::Limited { retry_after }
    }
}

#[derive(Debug)]
struct Buckets {
    by_peer: HashMap<IpAddr, Bucket>,
    swept_at: Instant,
}

/// Per-IP rate limiter. Share it behind an `Arc`.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Mutex<Buckets>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(Buckets {
                by_peer: HashMap::new(),
                swept_at: Instant::now(),
            }),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Consumes one request of `peer`'s budget if any is left.
    pub fn check(&self, peer: IpAddr) -> RateDecision {
        self.check_at(peer, Instant::now())
    }

    fn check_at(&self, peer: IpAddr, now: Instant) -> RateDecision {
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);

        if now.saturating_duration_since(buckets.swept_at) >= self.config.cleanup_interval {
            let ttl = self.config.entry_ttl;
            buckets
                .by_peer
                .retain(|_, bucket| now.saturating_duration_since(bucket.touched_at) < ttl);
            buckets.swept_at = now;
        }

        let config = &self.config;
        buckets
            .by_peer
            .entry(peer)
            .or_insert_with(|| Bucket::full(config, now))
            .take(config, now)
    }

    /// Number of peers currently holding a bucket.
    pub fn tracked_peers(&self) -> usize {
        self.buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_peer
            .len()
    }
}
