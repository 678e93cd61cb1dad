//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port to bind the HTTP/WS server to.
    /// Override: `PORT`
    pub port: u16,

    /// Redis connection URL. Unset runs the relay in local-only mode.
    /// Override: `REDIS_URL`
    pub redis_url: Option<String>,

    /// Whether clients must present a session code.
    /// Override: `REQUIRE_CODE`
    pub require_code: bool,

    /// Trust `X-Forwarded-For` from the load balancer.
    /// Override: `TRUST_PROXY`
    pub trust_proxy: bool,

    /// Identify pool worker count. 0 selects `max(2, cores - 1)`.
    /// Override: `IDENTIFY_WORKERS`
    pub identify_workers: usize,

    /// Command invoked for music recognition.
    /// Override: `RECOGNIZER_COMMAND`
    pub recognizer_command: Option<String>,

    /// YouTube Data API key for video search.
    /// Override: `YOUTUBE_API_KEY`
    pub youtube_api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            redis_url: None,
            require_code: true,
            trust_proxy: false,
            identify_workers: 0,
            recognizer_command: None,
            youtube_api_key: None,
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("PORT") {
            if let Ok(port) = val.parse() {
                self.port = port;
            }
        }

        if let Ok(val) = std::env::var("REDIS_URL") {
            if !val.is_empty() {
                self.redis_url = Some(val);
            }
        }

        if let Ok(val) = std::env::var("REQUIRE_CODE") {
            if let Some(flag) = parse_bool(&val) {
                self.require_code = flag;
            }
        }

        if let Ok(val) = std::env::var("TRUST_PROXY") {
            if let Some(flag) = parse_bool(&val) {
                self.trust_proxy = flag;
            }
        }

        if let Ok(val) = std::env::var("IDENTIFY_WORKERS") {
            if let Ok(workers) = val.parse() {
                self.identify_workers = workers;
            }
        }

        if let Ok(val) = std::env::var("RECOGNIZER_COMMAND") {
            if !val.is_empty() {
                self.recognizer_command = Some(val);
            }
        }

        if let Ok(val) = std::env::var("YOUTUBE_API_KEY") {
            if !val.is_empty() {
                self.youtube_api_key = Some(val);
            }
        }
    }

    /// Converts to lumina-core's Config type.
    pub fn to_core_config(&self) -> lumina_core::Config {
        lumina_core::Config {
            port: self.port,
            redis_url: self.redis_url.clone(),
            require_code: self.require_code,
            trust_proxy: self.trust_proxy,
            identify_workers: self.identify_workers,
            recognizer_command: self.recognizer_command.clone(),
            youtube_api_key: self.youtube_api_key.clone(),
            ..Default::default()
        }
    }
}
