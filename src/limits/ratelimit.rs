//! Fixed-window request rate limiting
//!
//! Each client key gets a one-minute window. The first request opens the
//! window; once the count passes the threshold the key is latched as
//! blocked until the window rolls over, even if nothing else arrives.
//! The threshold is `requests_per_window` under [`RatePolicy::Standard`]
//! and `requests_per_window + burst_size` under [`RatePolicy::Burst`];
//! both policies share one record per key.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::clock::{system_clock, SharedClock};
use crate::sweep::Sweeper;

/// Default requests allowed per window
pub const DEFAULT_REQUESTS_PER_WINDOW: u32 = 60;

/// Default extra requests allowed under the burst policy
pub const DEFAULT_BURST_SIZE: u32 = 10;

/// Window length
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Default stale-entry sweep interval (30 minutes)
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1800);

/// Entries whose window ended longer ago than this are swept (2 hours)
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(2 * 3600);

/// Which threshold a check is evaluated against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RatePolicy {
    /// Trip after `requests_per_window`
    Standard,
    /// Trip after `requests_per_window + burst_size`
    Burst,
}

impl RatePolicy {
    /// The single policy a process uses: `Burst` when a burst allowance is
    /// configured, otherwise `Standard`.
    pub fn for_config(config: &RateLimitConfig) -> Self {
        if config.burst_size > 0 {
            RatePolicy::Burst
        } else {
            RatePolicy::Standard
        }
    }
}

/// Outcome of a rate check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// Admitted. `remaining` is `None` when limiting is disabled or the
    /// key is exempt.
    Allowed { remaining: Option<u32> },
    /// Denied until the current window ends.
    Limited { retry_after_secs: u64 },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

/// Rate limiting configuration
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Whether rate limiting is enabled
    pub enabled: bool,
    /// Requests allowed per window
    pub requests_per_window: u32,
    /// Extra requests allowed under the burst policy
    pub burst_size: u32,
    /// Window length
    pub window: Duration,
    /// Trusted proxy headers for client IP extraction
    pub trust_proxy_headers: bool,
    /// How often stale entries are swept
    pub sweep_interval: Duration,
    /// How long after its window ends an entry is kept
    pub retention: Duration,
    /// Keys (client IPs) that are never limited
    pub exempt_ips: Vec<IpAddr>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            enabled: true,
            requests_per_window: DEFAULT_REQUESTS_PER_WINDOW,
            burst_size: DEFAULT_BURST_SIZE,
            window: DEFAULT_WINDOW,
            trust_proxy_headers: false,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            retention: DEFAULT_RETENTION,
            exempt_ips: Vec::new(),
        }
    }
}

impl RateLimitConfig {
    /// Create a builder for custom configuration
    pub fn builder() -> RateLimitConfigBuilder {
        RateLimitConfigBuilder::default()
    }

    /// Check if a client key is exempt from rate limiting
    pub fn is_exempt(&self, key: &str) -> bool {
        if self.exempt_ips.is_empty() {
            return false;
        }
        key.parse::<IpAddr>()
            .map(|ip| self.exempt_ips.contains(&ip))
            .unwrap_or(false)
    }

    /// Trip threshold under `policy`
    pub fn threshold(&self, policy: RatePolicy) -> u32 {
        match policy {
            RatePolicy::Standard => self.requests_per_window,
            RatePolicy::Burst => self.requests_per_window.saturating_add(self.burst_size),
        }
    }
}

/// Builder for RateLimitConfig
#[derive(Default)]
pub struct RateLimitConfigBuilder {
    config: RateLimitConfig,
}

impl RateLimitConfigBuilder {
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.config.enabled = enabled;
        self
    }

    pub fn requests_per_window(mut self, requests: u32) -> Self {
        self.config.requests_per_window = requests;
        self
    }

    pub fn burst_size(mut self, burst: u32) -> Self {
        self.config.burst_size = burst;
        self
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.config.window = window;
        self
    }

    pub fn trust_proxy_headers(mut self, trust: bool) -> Self {
        self.config.trust_proxy_headers = trust;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval = interval;
        self
    }

    pub fn retention(mut self, retention: Duration) -> Self {
        self.config.retention = retention;
        self
    }

    pub fn exempt_ips(mut self, ips: Vec<IpAddr>) -> Self {
        self.config.exempt_ips = ips;
        self
    }

    pub fn build(self) -> RateLimitConfig {
        self.config
    }
}

#[derive(Debug, Clone)]
struct RateRecord {
    count: u32,
    window_reset_at: DateTime<Utc>,
    blocked: bool,
}

/// Rate limiter statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterStats {
    pub tracked_keys: usize,
    pub blocked_keys: usize,
    pub config_enabled: bool,
}

/// Per-key fixed-window limiter. Clones share state.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    records: Arc<RwLock<HashMap<String, RateRecord>>>,
    config: Arc<RateLimitConfig>,
    clock: SharedClock,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: RateLimitConfig, clock: SharedClock) -> Self {
        RateLimiter {
            records: Arc::new(RwLock::new(HashMap::new())),
            config: Arc::new(config),
            clock,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// The policy this limiter's configuration selects.
    pub fn policy(&self) -> RatePolicy {
        RatePolicy::for_config(&self.config)
    }

    fn window(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.window)
            .unwrap_or_else(|_| chrono::Duration::seconds(60))
    }

    /// Record one request from `key` and decide whether it is admitted.
    pub fn check(&self, key: &str, policy: RatePolicy) -> RateDecision {
        if !self.config.enabled || self.config.is_exempt(key) {
            return RateDecision::Allowed { remaining: None };
        }

        let threshold = self.config.threshold(policy);
        let now = self.clock.now();
        let window = self.window();

        let mut records = self.records.write();
        let record = match records.get_mut(key) {
            Some(record) => record,
            None => {
                debug!(key = %key, "rate limit record created");
                records.insert(
                    key.to_string(),
                    RateRecord {
                        count: 1,
                        window_reset_at: now + window,
                        blocked: false,
                    },
                );
                return RateDecision::Allowed {
                    remaining: Some(threshold.saturating_sub(1)),
                };
            }
        };

        if now >= record.window_reset_at {
            record.count = 1;
            record.blocked = false;
            record.window_reset_at = now + window;
            return RateDecision::Allowed {
                remaining: Some(threshold.saturating_sub(1)),
            };
        }

        let retry_after_secs = (record.window_reset_at - now).num_seconds().max(1) as u64;

        if record.blocked {
            debug!(key = %key, "request denied, key is blocked for this window");
            return RateDecision::Limited { retry_after_secs };
        }

        record.count = record.count.saturating_add(1);
        if record.count > threshold {
            record.blocked = true;
            warn!(
                key = %key,
                requests = record.count,
                limit = threshold,
                policy = ?policy,
                "rate limit exceeded"
            );
            return RateDecision::Limited { retry_after_secs };
        }

        RateDecision::Allowed {
            remaining: Some(threshold - record.count),
        }
    }

    /// Standard-policy check.
    pub fn allow(&self, key: &str) -> bool {
        self.check(key, RatePolicy::Standard).is_allowed()
    }

    /// Burst-policy check.
    pub fn allow_with_burst(&self, key: &str) -> bool {
        self.check(key, RatePolicy::Burst).is_allowed()
    }

    /// Requests left for `key` in its current window against the standard
    /// threshold. `None` means limiting is disabled.
    pub fn remaining(&self, key: &str) -> Option<u32> {
        if !self.config.enabled {
            return None;
        }

        let limit = self.config.requests_per_window;
        let now = self.clock.now();
        let records = self.records.read();
        match records.get(key) {
            Some(record) if now < record.window_reset_at => Some(limit.saturating_sub(record.count)),
            _ => Some(limit),
        }
    }

    /// Forget `key`, returning it to first-sight behaviour.
    pub fn reset(&self, key: &str) -> bool {
        let removed = self.records.write().remove(key).is_some();
        info!(key = %key, removed = removed, "rate limit reset");
        removed
    }

    /// Drop entries whose window ended more than `retention` ago.
    pub fn sweep_stale(&self) -> usize {
        let now = self.clock.now();
        let retention = chrono::Duration::from_std(self.config.retention)
            .unwrap_or_else(|_| chrono::Duration::hours(2));

        let mut records = self.records.write();
        let before = records.len();
        records.retain(|_, record| now - record.window_reset_at <= retention);
        let removed = before - records.len();

        if removed > 0 {
            info!(
                removed = removed,
                remaining = records.len(),
                "rate limit sweep completed"
            );
        }
        removed
    }

    /// Get current stats for monitoring
    pub fn stats(&self) -> RateLimiterStats {
        let records = self.records.read();
        RateLimiterStats {
            tracked_keys: records.len(),
            blocked_keys: records.values().filter(|r| r.blocked).count(),
            config_enabled: self.config.enabled,
        }
    }
}

#[async_trait]
impl Sweeper for RateLimiter {
    fn name(&self) -> &'static str {
        "ratelimit"
    }

    async fn sweep(&self) -> usize {
        self.sweep_stale()
    }
}
