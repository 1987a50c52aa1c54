//! Per-client daily quota tracking
//!
//! Each client key accumulates consumed bytes until the configured local
//! reset instant (`hour:minute`) passes, at which point usage drops back to
//! zero. The reset is applied lazily by whichever call touches the key
//! first after the instant, or eagerly by the periodic sweep. Both paths
//! run under the same write lock, so a reset can never swallow a
//! concurrent commit.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDate, TimeZone, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::clock::{system_clock, SharedClock};
use crate::sweep::Sweeper;

/// Default daily limit (1000 MiB)
pub const DEFAULT_DAILY_LIMIT_BYTES: u64 = 1000 * 1024 * 1024;

/// Default sweep interval (5 minutes)
pub const DEFAULT_QUOTA_SWEEP_INTERVAL_SECS: u64 = 300;

/// Idle zero-usage records are forgotten after this long (7 days)
pub const DEFAULT_STALE_AFTER_SECS: u64 = 7 * 24 * 3600;

/// Quota tracker configuration
#[derive(Debug, Clone)]
pub struct QuotaConfig {
    /// Whether quota tracking is enabled
    pub enabled: bool,

    /// Daily ceiling per client key
    pub daily_limit_bytes: u64,

    /// Local hour of the daily reset (0-23)
    pub reset_hour: u32,

    /// Local minute of the daily reset (0-59)
    pub reset_minute: u32,

    /// How often the background sweep runs
    pub sweep_interval: Duration,

    /// Idle time after which a zero-usage record is pruned
    pub stale_after: Duration,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            daily_limit_bytes: DEFAULT_DAILY_LIMIT_BYTES,
            reset_hour: 0,
            reset_minute: 0,
            sweep_interval: Duration::from_secs(DEFAULT_QUOTA_SWEEP_INTERVAL_SECS),
            stale_after: Duration::from_secs(DEFAULT_STALE_AFTER_SECS),
        }
    }
}

impl QuotaConfig {
    pub fn enabled(mut self) -> Self {
        self.enabled = true;
        self
    }

    pub fn with_daily_limit_bytes(mut self, limit: u64) -> Self {
        self.daily_limit_bytes = limit;
        self
    }

    pub fn with_reset_time(mut self, hour: u32, minute: u32) -> Self {
        self.reset_hour = hour.min(23);
        self.reset_minute = minute.min(59);
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }
}

/// Result of a headroom check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Headroom {
    pub allowed: bool,
    pub remaining_bytes: u64,
}

/// Snapshot of a client's quota window
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaStatus {
    pub enabled: bool,
    pub used_bytes: u64,
    pub limit_bytes: u64,
    pub remaining_bytes: u64,
    /// `None` when quota tracking is disabled
    pub window_reset_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct QuotaRecord {
    used_bytes: u64,
    window_reset_at: DateTime<Utc>,
    /// Last client-driven access; resets do not touch it.
    last_seen: DateTime<Utc>,
}

/// Per-key daily byte quota.
#[derive(Debug)]
pub struct QuotaTracker {
    config: QuotaConfig,
    records: RwLock<HashMap<String, QuotaRecord>>,
    clock: SharedClock,
}

impl QuotaTracker {
    pub fn new(config: QuotaConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: QuotaConfig, clock: SharedClock) -> Self {
        Self {
            config,
            records: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Next reset instant strictly after `now`, in the local timezone.
    fn next_reset(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        next_reset_after(
            &now.with_timezone(&Local),
            self.config.reset_hour,
            self.config.reset_minute,
        )
        .with_timezone(&Utc)
    }

    /// Create the record for `key` if absent, or reset it if its window
    /// has elapsed. Caller holds the write lock.
    fn refresh<'a>(
        &self,
        records: &'a mut HashMap<String, QuotaRecord>,
        key: &str,
        now: DateTime<Utc>,
    ) -> &'a mut QuotaRecord {
        let record = records.entry(key.to_string()).or_insert_with(|| {
            let window_reset_at = self.next_reset(now);
            tracing::info!(key = %key, reset_at = %window_reset_at, "quota record created");
            QuotaRecord {
                used_bytes: 0,
                window_reset_at,
                last_seen: now,
            }
        });

        if now >= record.window_reset_at {
            record.used_bytes = 0;
            record.window_reset_at = self.next_reset(now);
            tracing::info!(key = %key, reset_at = %record.window_reset_at, "quota window reset");
        }
        record
    }

    /// Check whether `key` can consume `requested_bytes` more.
    ///
    /// Disabled tracking always allows with the full limit remaining.
    pub fn check_headroom(&self, key: &str, requested_bytes: u64) -> Headroom {
        let limit = self.config.daily_limit_bytes;
        if !self.config.enabled {
            return Headroom {
                allowed: true,
                remaining_bytes: limit,
            };
        }

        let now = self.clock.now();
        let mut records = self.records.write();
        let record = self.refresh(&mut records, key, now);
        record.last_seen = now;

        let remaining = limit.saturating_sub(record.used_bytes);
        if remaining == 0 {
            tracing::warn!(key = %key, limit_bytes = limit, "quota exhausted");
            return Headroom {
                allowed: false,
                remaining_bytes: 0,
            };
        }
        if requested_bytes > remaining {
            tracing::warn!(
                key = %key,
                requested_bytes = requested_bytes,
                remaining_bytes = remaining,
                "quota insufficient"
            );
            return Headroom {
                allowed: false,
                remaining_bytes: remaining,
            };
        }

        Headroom {
            allowed: true,
            remaining_bytes: remaining,
        }
    }

    /// Add `bytes` to the usage of `key`. The limit is not re-checked.
    pub fn commit(&self, key: &str, bytes: u64) {
        if !self.config.enabled {
            return;
        }

        let now = self.clock.now();
        let mut records = self.records.write();
        let record = self.refresh(&mut records, key, now);
        record.used_bytes = record.used_bytes.saturating_add(bytes);
        record.last_seen = now;

        tracing::debug!(
            key = %key,
            used_bytes = record.used_bytes,
            limit_bytes = self.config.daily_limit_bytes,
            "quota usage committed"
        );
    }

    /// Current window snapshot for `key`. Applies a due reset but never
    /// creates a record.
    pub fn status(&self, key: &str) -> QuotaStatus {
        let limit = self.config.daily_limit_bytes;
        if !self.config.enabled {
            return QuotaStatus {
                enabled: false,
                used_bytes: 0,
                limit_bytes: limit,
                remaining_bytes: limit,
                window_reset_at: None,
            };
        }

        let now = self.clock.now();
        let mut records = self.records.write();
        let (used_bytes, window_reset_at) = if records.contains_key(key) {
            let record = self.refresh(&mut records, key, now);
            (record.used_bytes, record.window_reset_at)
        } else {
            (0, self.next_reset(now))
        };

        QuotaStatus {
            enabled: true,
            used_bytes,
            limit_bytes: limit,
            remaining_bytes: limit.saturating_sub(used_bytes),
            window_reset_at: Some(window_reset_at),
        }
    }

    /// Reset every elapsed window and prune idle zero-usage records.
    ///
    /// Returns the number of records reset or removed.
    pub fn sweep_windows(&self) -> usize {
        let now = self.clock.now();
        let stale_after = chrono::Duration::from_std(self.config.stale_after)
            .unwrap_or_else(|_| chrono::Duration::days(7));

        let mut records = self.records.write();
        let mut reset = 0;
        for record in records.values_mut() {
            if now >= record.window_reset_at {
                record.used_bytes = 0;
                record.window_reset_at = self.next_reset(now);
                reset += 1;
            }
        }

        let before = records.len();
        records.retain(|_, r| r.used_bytes > 0 || now - r.last_seen < stale_after);
        let pruned = before - records.len();

        if reset > 0 || pruned > 0 {
            tracing::info!(
                reset = reset,
                pruned = pruned,
                remaining = records.len(),
                "quota sweep completed"
            );
        }

        reset + pruned
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl Sweeper for QuotaTracker {
    fn name(&self) -> &'static str {
        "quota"
    }

    async fn sweep(&self) -> usize {
        self.sweep_windows()
    }
}

/// The first `hour:minute` wall-clock instant strictly after `now` in
/// `now`'s timezone.
///
/// A reset time that falls in a DST gap moves forward by one hour.
pub fn next_reset_after<Tz: TimeZone>(now: &DateTime<Tz>, hour: u32, minute: u32) -> DateTime<Tz> {
    let tz = now.timezone();
    let today = now.date_naive();

    match at_local_time(&tz, today, hour, minute) {
        Some(candidate) if candidate > *now => candidate,
        _ => today
            .succ_opt()
            .and_then(|tomorrow| at_local_time(&tz, tomorrow, hour, minute))
            .unwrap_or_else(|| now.clone() + chrono::Duration::days(1)),
    }
}

fn at_local_time<Tz: TimeZone>(
    tz: &Tz,
    date: NaiveDate,
    hour: u32,
    minute: u32,
) -> Option<DateTime<Tz>> {
    let naive = date.and_hms_opt(hour, minute, 0)?;
    tz.from_local_datetime(&naive).earliest().or_else(|| {
        tz.from_local_datetime(&(naive + chrono::Duration::hours(1)))
            .earliest()
    })
}
