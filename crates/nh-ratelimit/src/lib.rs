//! Multi-algorithm rate limiter
//!
//! Admission control against a logical key (caller identity + route) with a
//! selectable algorithm per call:
//! - Sliding window: timestamped event log trimmed to the window
//! - Fixed window: counter bucketed by `floor(now / window)`
//! - Token bucket: `{tokens, last_refill}` refilled at `max_requests / window`
//!
//! Each check-and-update runs while holding the key's map entry exclusively,
//! so concurrent callers sharing a key cannot race. Idle records expire via
//! a TTL and a periodic sweep deletes them defensively.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    SlidingWindow,
    FixedWindow,
    TokenBucket,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub algorithm: RateLimitAlgorithm,
    pub window: Duration,
    pub max_requests: u32,
    pub key_prefix: String,
    /// Tokens deducted per admitted request (token bucket only).
    pub request_cost: f64,
    /// Bucket capacity; defaults to `max_requests` when unset.
    pub burst_limit: Option<u32>,
}

impl RateLimitConfig {
    pub fn new(algorithm: RateLimitAlgorithm, window: Duration, max_requests: u32) -> Self {
        Self {
            algorithm,
            window,
            max_requests,
            key_prefix: "ratelimit".to_string(),
            request_cost: 1.0,
            burst_limit: None,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn burst(&self) -> f64 {
        f64::from(self.burst_limit.unwrap_or(self.max_requests))
    }
}

/// Admission outcome. `remaining` is signed: a negative value means the
/// request was rejected.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitInfo {
    pub limit: u32,
    pub current: u32,
    pub remaining: i64,
    pub reset_at: DateTime<Utc>,
}

impl RateLimitInfo {
    pub fn is_allowed(&self) -> bool {
        self.remaining >= 0
    }
}

/// Injected predicate deciding which callers skip limiting entirely.
/// Authorization is an external collaborator; the limiter only asks this
/// one question about a caller.
pub trait BypassPolicy: Send + Sync {
    fn should_bypass(&self, caller: &str) -> bool;
}

/// Default policy: nobody bypasses.
pub struct NoBypass;

impl BypassPolicy for NoBypass {
    fn should_bypass(&self, _caller: &str) -> bool {
        false
    }
}

enum RecordState {
    Sliding { events: VecDeque<Instant> },
    Fixed { bucket: i64, count: u32 },
    Bucket { tokens: f64, last_refill: Instant },
}

struct RecordEntry {
    state: RecordState,
    expires_at: Instant,
}

pub struct RateLimiter {
    records: DashMap<String, RecordEntry>,
    bypass: Arc<dyn BypassPolicy>,
}

impl RateLimiter {
    pub fn new(bypass: Arc<dyn BypassPolicy>) -> Self {
        Self {
            records: DashMap::new(),
            bypass,
        }
    }

    /// Check-and-update for one request. Atomic per key: the record entry is
    /// held exclusively for the duration of the update.
    pub fn check(&self, caller: &str, route: &str, config: &RateLimitConfig) -> RateLimitInfo {
        if self.bypass.should_bypass(caller) {
            return RateLimitInfo {
                limit: config.max_requests,
                current: 0,
                remaining: i64::from(config.max_requests),
                reset_at: Utc::now(),
            };
        }

        let key = format!("{}:{}:{}", config.key_prefix, caller, route);
        let now = Instant::now();

        let mut entry = self
            .records
            .entry(key.clone())
            .or_insert_with(|| RecordEntry {
                state: Self::fresh_state(config, now),
                expires_at: now + config.window,
            });
        entry.expires_at = now + config.window;

        let info = match config.algorithm {
            RateLimitAlgorithm::SlidingWindow => Self::check_sliding(&mut entry.state, config, now),
            RateLimitAlgorithm::FixedWindow => Self::check_fixed(&mut entry.state, config),
            RateLimitAlgorithm::TokenBucket => Self::check_bucket(&mut entry.state, config, now),
        };
        drop(entry);

        gauge!("rate_limit_remaining", "route" => route.to_string())
            .set(info.remaining as f64);
        if !info.is_allowed() {
            warn!(
                key = %key,
                limit = info.limit,
                current = info.current,
                "Rate limit exceeded"
            );
            counter!("rate_limit_rejections_total", "route" => route.to_string()).increment(1);
        }

        info
    }

    fn fresh_state(config: &RateLimitConfig, now: Instant) -> RecordState {
        match config.algorithm {
            RateLimitAlgorithm::SlidingWindow => RecordState::Sliding {
                events: VecDeque::new(),
            },
            RateLimitAlgorithm::FixedWindow => RecordState::Fixed {
                bucket: Self::window_bucket(config),
                count: 0,
            },
            RateLimitAlgorithm::TokenBucket => RecordState::Bucket {
                tokens: config.burst(),
                last_refill: now,
            },
        }
    }

    fn window_bucket(config: &RateLimitConfig) -> i64 {
        let window_ms = config.window.as_millis().max(1) as i64;
        Utc::now().timestamp_millis() / window_ms
    }

    fn check_sliding(
        state: &mut RecordState,
        config: &RateLimitConfig,
        now: Instant,
    ) -> RateLimitInfo {
        // A record can outlive a config change; reset on algorithm mismatch.
        if !matches!(state, RecordState::Sliding { .. }) {
            *state = Self::fresh_state(config, now);
        }
        let RecordState::Sliding { events } = state else {
            unreachable!("state reset above");
        };

        while events
            .front()
            .is_some_and(|at| now.duration_since(*at) > config.window)
        {
            events.pop_front();
        }
        events.push_back(now);

        let current = events.len() as u32;
        RateLimitInfo {
            limit: config.max_requests,
            current,
            remaining: i64::from(config.max_requests) - i64::from(current),
            reset_at: Utc::now()
                + chrono::Duration::milliseconds(config.window.as_millis() as i64),
        }
    }

    fn check_fixed(state: &mut RecordState, config: &RateLimitConfig) -> RateLimitInfo {
        let bucket_now = Self::window_bucket(config);
        if !matches!(state, RecordState::Fixed { .. }) {
            *state = RecordState::Fixed {
                bucket: bucket_now,
                count: 0,
            };
        }
        let RecordState::Fixed { bucket, count } = state else {
            unreachable!("state reset above");
        };

        if *bucket != bucket_now {
            *bucket = bucket_now;
            *count = 0;
        }
        *count += 1;

        let window_ms = config.window.as_millis().max(1) as i64;
        let reset_ms = (bucket_now + 1) * window_ms;
        RateLimitInfo {
            limit: config.max_requests,
            current: *count,
            remaining: i64::from(config.max_requests) - i64::from(*count),
            reset_at: DateTime::<Utc>::from_timestamp_millis(reset_ms).unwrap_or_else(Utc::now),
        }
    }

    fn check_bucket(
        state: &mut RecordState,
        config: &RateLimitConfig,
        now: Instant,
    ) -> RateLimitInfo {
        if !matches!(state, RecordState::Bucket { .. }) {
            *state = Self::fresh_state(config, now);
        }
        let RecordState::Bucket {
            tokens,
            last_refill,
        } = state
        else {
            unreachable!("state reset above");
        };

        let window_ms = config.window.as_millis().max(1) as f64;
        let refill_per_ms = f64::from(config.max_requests) / window_ms;
        let elapsed_ms = now.duration_since(*last_refill).as_millis() as f64;
        *tokens = (*tokens + elapsed_ms * refill_per_ms).min(config.burst());
        *last_refill = now;

        let cost = config.request_cost;
        let remaining = if *tokens >= cost {
            *tokens -= cost;
            tokens.floor() as i64
        } else {
            tokens.floor() as i64 - cost.ceil() as i64
        };

        // Time until the bucket refills, capped at a day for degenerate
        // configurations with a zero refill rate.
        let missing = (config.burst() - *tokens).max(0.0);
        let refill_ms = (missing / refill_per_ms).ceil().min(86_400_000.0) as i64;
        RateLimitInfo {
            limit: config.max_requests,
            current: (config.burst() - *tokens).round() as u32,
            remaining,
            reset_at: Utc::now() + chrono::Duration::milliseconds(refill_ms),
        }
    }

    /// Drop records whose TTL has lapsed. Returns the number removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.records.len();
        self.records.retain(|_, entry| entry.expires_at > now);
        let removed = before - self.records.len();
        if removed > 0 {
            info!(removed, "Rate limiter sweep removed expired keys");
        }
        removed
    }

    /// Spawn the periodic defensive sweep. Dropping or aborting the returned
    /// handle stops it.
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = limiter.sweep_expired();
                debug!(removed, "Rate limiter cleanup cycle complete");
            }
        })
    }

    pub fn tracked_keys(&self) -> usize {
        self.records.len()
    }
}
