//! Per-subject submission rate limiting over a rolling window.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

const REDIS_KEY_PREFIX: &str = "carrier_verify:submissions:";

/// Limit on submissions per subject. `max_submissions == 0` disables limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub max_submissions: u32,
    pub window: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Limited { retry_after: Duration },
}

impl RateDecision {
    /// Whole seconds a caller should wait, never less than one.
    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            RateDecision::Allowed => None,
            RateDecision::Limited { retry_after } => {
                Some((retry_after.as_secs_f64().ceil() as u64).max(1))
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Record a submission attempt for `key` unless it would exceed the
    /// policy. Rejected attempts are not counted.
    async fn check(&self, key: &str) -> Result<RateDecision, RateLimitError>;

    async fn health_check(&self) -> Result<(), RateLimitError> {
        Ok(())
    }

    fn policy(&self) -> RateLimitPolicy;

    /// Short backend name for health reporting.
    fn backend(&self) -> &'static str;
}

struct WindowLog {
    entries: HashMap<String, VecDeque<Instant>>,
    last_sweep: Instant,
}

impl WindowLog {
    /// Forget subjects whose newest attempt has left the window.
    fn sweep(&mut self, now: Instant, window: Duration) {
        self.entries.retain(|_, attempts| {
            attempts
                .back()
                .is_some_and(|last| now.duration_since(*last) < window)
        });
        self.last_sweep = now;
    }
}

/// In-process sliding-window log.
///
/// Idle subjects are swept at most once per window, so the log only holds
/// subjects seen within roughly the last two windows.
pub struct SlidingWindowLimiter {
    policy: RateLimitPolicy,
    log: Mutex<WindowLog>,
}

impl SlidingWindowLimiter {
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self {
            policy,
            log: Mutex::new(WindowLog {
                entries: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowLimiter {
    async fn check(&self, key: &str) -> Result<RateDecision, RateLimitError> {
        if self.policy.max_submissions == 0 {
            return Ok(RateDecision::Allowed);
        }

        let now = Instant::now();
        let mut log = self.log.lock().await;
        if now.duration_since(log.last_sweep) >= self.policy.window {
            log.sweep(now, self.policy.window);
        }
        let entries = log.entries.entry(key.to_string()).or_default();
        while let Some(oldest) = entries.front() {
            if now.duration_since(*oldest) >= self.policy.window {
                entries.pop_front();
            } else {
                break;
            }
        }

        if entries.len() >= self.policy.max_submissions as usize {
            let oldest = entries.front().copied().unwrap_or(now);
            let retry_after = self.policy.window.saturating_sub(now.duration_since(oldest));
            return Ok(RateDecision::Limited { retry_after });
        }

        entries.push_back(now);
        Ok(RateDecision::Allowed)
    }

    fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

/// Sliding-window log kept in a Redis sorted set, so limits survive restarts.
pub struct RedisRateLimiter {
    client: redis::Client,
    policy: RateLimitPolicy,
}

impl RedisRateLimiter {
    pub fn new(redis_url: &str, policy: RateLimitPolicy) -> Result<Self, RateLimitError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client, policy })
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn check(&self, key: &str) -> Result<RateDecision, RateLimitError> {
        if self.policy.max_submissions == 0 {
            return Ok(RateDecision::Allowed);
        }

        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let redis_key = format!("{REDIS_KEY_PREFIX}{key}");
        let now_ms = Utc::now().timestamp_millis();
        let window_ms = i64::try_from(self.policy.window.as_millis()).unwrap_or(i64::MAX);
        let member = format!("{now_ms}:{}", Uuid::new_v4());

        // Trim, record and count in one transaction so concurrent callers
        // cannot both slip under the limit.
        let (count, oldest): (u64, Vec<(String, f64)>) = redis::pipe()
            .atomic()
            .zrembyscore(&redis_key, 0, now_ms.saturating_sub(window_ms))
            .ignore()
            .zadd(&redis_key, &member, now_ms)
            .ignore()
            .zcard(&redis_key)
            .zrange_withscores(&redis_key, 0, 0)
            .pexpire(&redis_key, window_ms)
            .ignore()
            .query_async(&mut conn)
            .await?;

        if count <= u64::from(self.policy.max_submissions) {
            return Ok(RateDecision::Allowed);
        }

        redis::cmd("ZREM")
            .arg(&redis_key)
            .arg(&member)
            .query_async::<()>(&mut conn)
            .await?;

        let oldest_ms = oldest.first().map(|(_, score)| *score as i64).unwrap_or(now_ms);
        let remaining_ms = window_ms.saturating_sub(now_ms.saturating_sub(oldest_ms)).max(0);
        Ok(RateDecision::Limited {
            retry_after: Duration::from_millis(remaining_ms as u64),
        })
    }

    async fn health_check(&self) -> Result<(), RateLimitError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }

    fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
