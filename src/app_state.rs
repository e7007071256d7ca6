use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::services::gateway::Gateway;
use crate::services::rate_limit::RateLimitPolicy;

/// Settings the HTTP layer needs beyond the gateway itself.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub sse_idle_timeout: Duration,
    pub sse_keepalive: Duration,
    pub rate_limit: RateLimitPolicy,
    pub post_completion_route: String,
}

impl ServiceSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            sse_idle_timeout: config.sse_idle_timeout(),
            sse_keepalive: config.sse_keepalive(),
            rate_limit: config.rate_limit_policy(),
            post_completion_route: config.post_completion_route.clone(),
        }
    }
}

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub settings: Arc<ServiceSettings>,
}

impl AppState {
    pub fn new(gateway: Arc<Gateway>, settings: ServiceSettings) -> Self {
        Self {
            gateway,
            settings: Arc::new(settings),
        }
    }
}
