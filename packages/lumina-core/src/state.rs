//! Core application configuration.

use serde::{Deserialize, Serialize};

/// Parameters for one rate-limited surface.
#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
pub struct RateLimitConfig {
    /// Sliding-window length in milliseconds.
    pub window_ms: u64,
    /// Maximum requests per window per client.
    pub max_requests: usize,
}

/// Per-endpoint rate limits.
#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
pub struct LimitsConfig {
    /// `/api/identify` uploads.
    pub identify: RateLimitConfig,
    /// `/api/search` lookups.
    pub search: RateLimitConfig,
    /// `/api/video/search` lookups.
    pub video: RateLimitConfig,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            identify: RateLimitConfig {
                window_ms: 60_000,
                max_requests: 10,
            },
            search: RateLimitConfig {
                window_ms: 60_000,
                max_requests: 30,
            },
            video: RateLimitConfig {
                window_ms: 60_000,
                max_requests: 20,
            },
        }
    }
}

/// Configuration for a Lumina Relay instance.
///
/// All fields have sensible defaults; the `apps/server` binary overlays
/// YAML config, environment variables and CLI flags on top.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    // Server
    /// Port for the HTTP/WS server.
    pub port: u16,

    // Substrate
    /// Redis connection URL. `None` runs the instance in local-only mode:
    /// sessions and rate limits are process-local and cross-process fan-out
    /// is disabled.
    pub redis_url: Option<String>,

    // Sessions
    /// When false, every client binds to the reserved open session and no
    /// codes are required.
    pub require_code: bool,

    // HTTP
    /// Trust `X-Forwarded-For` when extracting client keys for rate limiting.
    pub trust_proxy: bool,

    // Identify
    /// Worker count for the identify pool. `0` selects `max(2, cores - 1)`.
    pub identify_workers: usize,

    /// Command invoked by the default recognizer, with the audio path as its
    /// single argument. `None` disables recognition (identify returns null).
    pub recognizer_command: Option<String>,

    // Lookups
    /// YouTube Data API key for `/api/video/search`.
    pub youtube_api_key: Option<String>,

    // Rate limits
    #[serde(default)]
    pub limits: LimitsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            redis_url: None,
            require_code: true,
            trust_proxy: false,
            identify_workers: 0,
            recognizer_command: None,
            youtube_api_key: None,
            limits: LimitsConfig::default(),
        }
    }
}

impl Config {
    /// Resolves the identify worker count, applying the `max(2, cores - 1)`
    /// default when unset.
    pub fn resolved_identify_workers(&self) -> usize {
        if self.identify_workers > 0 {
            return self.identify_workers;
        }
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        cores.saturating_sub(1).max(2)
    }
}
