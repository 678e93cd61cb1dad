//! HTTP/WebSocket API layer.
//!
//! This module contains thin handlers that delegate to services. It provides
//! bootstrap, router construction and server startup.

use std::sync::Arc;

use thiserror::Error;

use crate::identify::{CommandRecognizer, IdentifyPool, NullRecognizer, Recognizer};
use crate::kv::KvStore;
use crate::lookup::LookupService;
use crate::ratelimit::RateLimiter;
use crate::relay::RelayHub;
use crate::session::SessionStore;
use crate::state::Config;

pub mod http;
pub mod response;
pub mod ws;

/// Errors that can occur when starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to the configured TCP port.
    #[error("Failed to bind to port: {0}")]
    Bind(#[from] std::io::Error),
}

/// Per-surface rate limiters.
#[derive(Clone)]
pub struct Limiters {
    pub identify: Arc<RateLimiter>,
    pub search: Arc<RateLimiter>,
    pub video: Arc<RateLimiter>,
}

/// Shared application state for the API layer.
///
/// This is a thin wrapper that holds references to services; all business
/// logic lives in the services themselves. Tests construct their own
/// instance, so nothing here is process-global.
#[derive(Clone)]
pub struct AppState {
    /// Relay hub: rooms, fan-out, grace FSM.
    pub hub: Arc<RelayHub>,
    /// Session codes and cached frames.
    pub sessions: Arc<SessionStore>,
    /// Shared substrate adapter.
    pub kv: Arc<KvStore>,
    /// Music-recognition worker pool.
    pub identify: Arc<IdentifyPool>,
    /// Outbound search/video lookups.
    pub lookup: Arc<LookupService>,
    /// Per-surface rate limiters.
    pub limiters: Limiters,
    /// Instance configuration.
    pub config: Arc<Config>,
}

impl AppState {
    /// Wires up every service from a configuration.
    pub async fn bootstrap(config: Config) -> Self {
        let kv = Arc::new(KvStore::connect(config.redis_url.as_deref()).await);
        let sessions = Arc::new(SessionStore::new(Arc::clone(&kv)));
        let hub = RelayHub::new(&config, Arc::clone(&sessions), Arc::clone(&kv));

        let recognizer: Arc<dyn Recognizer> = match &config.recognizer_command {
            Some(command) => Arc::new(CommandRecognizer::new(command.clone())),
            None => {
                log::warn!("[Boot] No recognizer command configured, identify returns null");
                Arc::new(NullRecognizer)
            }
        };
        let identify = Arc::new(IdentifyPool::new(
            config.resolved_identify_workers(),
            recognizer,
        ));

        let lookup = Arc::new(LookupService::new(
            Arc::clone(&kv),
            config.youtube_api_key.clone(),
        ));

        let limiters = Limiters {
            identify: RateLimiter::new("identify", config.limits.identify, Arc::clone(&kv)),
            search: RateLimiter::new("search", config.limits.search, Arc::clone(&kv)),
            video: RateLimiter::new("video", config.limits.video, Arc::clone(&kv)),
        };

        Self {
            hub,
            sessions,
            kv,
            identify,
            lookup,
            limiters,
            config: Arc::new(config),
        }
    }
}

/// Starts the HTTP server on the configured port. Runs until the listener
/// fails or the task is aborted.
pub async fn start_server(state: AppState) -> Result<(), ServerError> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], state.config.port));
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    log::info!(
        "Server listening on http://0.0.0.0:{} (instance {})",
        state.config.port,
        state.hub.instance_id()
    );
    let app = http::create_router(state);

    // Connect info enables peer-address extraction for rate limiting.
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;
    Ok(())
}
