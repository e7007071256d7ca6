use std::time::Duration;

use serde::Deserialize;

use crate::services::rate_limit::RateLimitPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000")
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string. Without it jobs are kept in memory.
    pub database_url: Option<String>,

    /// AES-256-GCM key for subject payloads at rest (base64-encoded, 32 bytes).
    /// Required together with `database_url`.
    pub encryption_key: Option<String>,

    /// Redis connection string for the shared submission rate limiter
    pub redis_url: Option<String>,

    /// Submissions allowed per subject within the window. 0 disables limiting.
    #[serde(default = "default_rate_limit_max_submissions")]
    pub rate_limit_max_submissions: u32,

    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,

    /// Upper bound on a single verification run
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,

    /// A push subscription with no events for this long is closed with `timeout`
    #[serde(default = "default_sse_idle_timeout_secs")]
    pub sse_idle_timeout_secs: u64,

    #[serde(default = "default_sse_keepalive_secs")]
    pub sse_keepalive_secs: u64,

    /// Base URL of the verification automation service
    pub verifier_url: String,

    pub verifier_api_token: Option<String>,

    /// Where clients navigate once a job completes
    #[serde(default = "default_post_completion_route")]
    pub post_completion_route: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_rate_limit_max_submissions() -> u32 {
    5
}

fn default_rate_limit_window_secs() -> u64 {
    3600
}

fn default_job_timeout_secs() -> u64 {
    600
}

fn default_sse_idle_timeout_secs() -> u64 {
    120
}

fn default_sse_keepalive_secs() -> u64 {
    15
}

fn default_post_completion_route() -> String {
    "results".to_string()
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn rate_limit_policy(&self) -> RateLimitPolicy {
        RateLimitPolicy {
            max_submissions: self.rate_limit_max_submissions,
            window: Duration::from_secs(self.rate_limit_window_secs),
        }
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn sse_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.sse_idle_timeout_secs)
    }

    pub fn sse_keepalive(&self) -> Duration {
        Duration::from_secs(self.sse_keepalive_secs)
    }
}
