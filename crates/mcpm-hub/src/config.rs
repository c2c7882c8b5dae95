use std::time::Duration;

use crate::registry::CollisionPolicy;

const DEFAULT_HTTP_BIND: &str = "127.0.0.1";
const DEFAULT_HTTP_PORT: u16 = 0;
const DEFAULT_MAX_REQUEST_BODY_BYTES: usize = 10 * 1024 * 1024;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;
const HTTP_MOUNT_PATH: &str = "/mcp/";

/// Everything the aggregator needs to stand up one run.
/// Built once by the caller (`mcpm run`/`mcpm run --http`/`mcpm share`) and
/// passed down — no module-level singletons.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub http_bind: String,
    pub http_port: u16,
    pub max_request_body_bytes: usize,
    pub request_timeout: Duration,
    pub collision_policy: CollisionPolicy,
    pub auth: AuthConfig,
    pub debug_logging: bool,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            http_bind: DEFAULT_HTTP_BIND.to_string(),
            http_port: DEFAULT_HTTP_PORT,
            max_request_body_bytes: DEFAULT_MAX_REQUEST_BODY_BYTES,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            collision_policy: CollisionPolicy::Auto,
            auth: AuthConfig::default(),
            debug_logging: false,
        }
    }
}

impl AggregatorConfig {
    pub fn mount_path(&self) -> &'static str {
        HTTP_MOUNT_PATH
    }
}

/// Bearer-token auth for HTTP mode. `enabled = false`
/// means every request is admitted and the caller should log the
/// unauthenticated-endpoint warning once at startup.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub enabled: bool,
    pub api_key: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = AggregatorConfig::default();
        assert_eq!(cfg.http_bind, "127.0.0.1");
        assert_eq!(cfg.http_port, 0);
        assert_eq!(cfg.request_timeout, Duration::from_secs(60));
        assert_eq!(cfg.mount_path(), "/mcp/");
        assert!(matches!(cfg.collision_policy, CollisionPolicy::Auto));
        assert!(!cfg.auth.enabled);
    }
}
