//! HTTP route handlers.
//!
//! All handlers are thin - they delegate to services for business logic.

use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{connect_info::ConnectInfo, DefaultBodyLimit, Multipart, Query, State},
    http::{header, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::response::{api_error, api_success};
use crate::api::ws::ws_handler;
use crate::api::AppState;
use crate::error::LuminaError;
use crate::protocol_constants::{IDENTIFY_MAX_UPLOAD_BYTES, IDENTIFY_QUEUE_MAX, SERVICE_ID};
use crate::ratelimit::{client_key, Decision, RateLimiter};

/// Builds the application router.
pub fn create_router(state: AppState) -> Router {
    let trust_proxy = state.config.trust_proxy;

    let identify_limiter = Arc::clone(&state.limiters.identify);
    let identify = Router::new()
        .route("/api/identify", post(identify_song))
        // Multipart body: the audio cap plus form-encoding overhead.
        .layer(DefaultBodyLimit::max(IDENTIFY_MAX_UPLOAD_BYTES + 64 * 1024))
        .route_layer(middleware::from_fn(
            move |req: Request<axum::body::Body>, next: Next| {
                enforce_limit(Arc::clone(&identify_limiter), trust_proxy, req, next)
            },
        ));

    let search_limiter = Arc::clone(&state.limiters.search);
    let search = Router::new()
        .route("/api/search", get(search_recordings))
        .route_layer(middleware::from_fn(
            move |req: Request<axum::body::Body>, next: Next| {
                enforce_limit(Arc::clone(&search_limiter), trust_proxy, req, next)
            },
        ));

    let video_limiter = Arc::clone(&state.limiters.video);
    let video = Router::new()
        .route("/api/video/search", get(search_video))
        .route_layer(middleware::from_fn(
            move |req: Request<axum::body::Body>, next: Next| {
                enforce_limit(Arc::clone(&video_limiter), trust_proxy, req, next)
            },
        ));

    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/config", get(get_public_config))
        .merge(identify)
        .merge(search)
        .merge(video)
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Rate-limit middleware: record the request, pass or 429 with Retry-After.
async fn enforce_limit(
    limiter: Arc<RateLimiter>,
    trust_proxy: bool,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let key = client_key(req.headers(), peer, trust_proxy);
    match limiter.check(&key).await {
        Decision::Allowed => next.run(req).await,
        Decision::Limited { retry_after_secs } => {
            let mut response = api_error(StatusCode::TOO_MANY_REQUESTS, "Too many requests");
            if let Ok(value) = retry_after_secs.to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
            response
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// Liveness probe: "Is the process running?"
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    api_success(json!({
        "status": "ok",
        "service": SERVICE_ID,
        "instanceId": state.hub.instance_id(),
        "distributed": state.kv.is_distributed(),
        "identify": {
            "workers": state.identify.worker_count(),
            "queueDepth": state.identify.queue_depth(),
            "queueMax": IDENTIFY_QUEUE_MAX,
        },
    }))
}

/// Public configuration for clients: whether a code prompt is needed and
/// what limits to respect.
async fn get_public_config(State(state): State<AppState>) -> impl IntoResponse {
    api_success(json!({
        "requireCode": state.config.require_code,
        "maxUploadBytes": IDENTIFY_MAX_UPLOAD_BYTES,
        "videoSearch": state.config.youtube_api_key.is_some(),
    }))
}

/// `POST /api/identify` - multipart audio upload, recognized by the pool.
async fn identify_song(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    let audio = loop {
        match multipart.next_field().await {
            Ok(Some(field)) => {
                // First file-bearing field wins; metadata fields are skipped.
                if field.file_name().is_none() && field.name() != Some("audio") {
                    continue;
                }
                match field.bytes().await {
                    Ok(bytes) => break bytes,
                    Err(_) => {
                        return api_error(StatusCode::BAD_REQUEST, "Unreadable audio field")
                    }
                }
            }
            Ok(None) => return api_error(StatusCode::BAD_REQUEST, "Missing audio field"),
            Err(_) => return api_error(StatusCode::BAD_REQUEST, "Malformed multipart body"),
        }
    };

    if audio.is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "Empty audio upload");
    }
    if audio.len() > IDENTIFY_MAX_UPLOAD_BYTES {
        return api_error(StatusCode::PAYLOAD_TOO_LARGE, "Audio upload exceeds 3 MiB");
    }

    // Spool to a temp file the worker will remove after recognition.
    let path = match write_temp_audio(&audio) {
        Ok(path) => path,
        Err(e) => {
            log::error!("[Identify] Failed to spool upload: {}", e);
            return LuminaError::Internal("could not store upload".to_string()).into_response();
        }
    };

    match state.identify.submit(path).await {
        Ok(result) => api_success(json!({ "result": result })),
        Err(LuminaError::Overloaded) => api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "Server overloaded, try again shortly",
        ),
        Err(err) => err.into_response(),
    }
}

fn write_temp_audio(audio: &[u8]) -> std::io::Result<std::path::PathBuf> {
    let mut file = tempfile::Builder::new()
        .prefix("identify-")
        .suffix(".audio")
        .tempfile()?;
    file.write_all(audio)?;
    let (_, path) = file.keep().map_err(|e| e.error)?;
    Ok(path)
}

#[derive(Deserialize)]
struct SearchParams {
    q: Option<String>,
}

/// `GET /api/search?q=` - cached MusicBrainz recording search.
async fn search_recordings(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Response {
    let Some(query) = params.q.as_deref().map(str::trim).filter(|q| !q.is_empty()) else {
        return api_error(StatusCode::BAD_REQUEST, "Missing query parameter q");
    };
    match state.lookup.search_recordings(query).await {
        Ok(body) => api_success(body),
        Err(err) => err.into_response(),
    }
}

/// `GET /api/video/search?q=` - cached, quota-charged video search.
async fn search_video(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Response {
    let Some(query) = params.q.as_deref().map(str::trim).filter(|q| !q.is_empty()) else {
        return api_error(StatusCode::BAD_REQUEST, "Missing query parameter q");
    };
    match state.lookup.search_video(query).await {
        Ok(body) => api_success(body),
        Err(err) => err.into_response(),
    }
}
