//! Lumina Core - shared library for the Lumina Relay.
//!
//! This crate provides the core functionality for Lumina Relay, a
//! session-scoped WebSocket relay that lets mobile controllers drive
//! music-visualizer displays, with passive viewers observing the same
//! session. Any number of relay processes run behind a load balancer and
//! coordinate through a shared Redis substrate, so clients connected to
//! different processes still exchange messages as if they were in one room.
//!
//! # Architecture
//!
//! - [`kv`]: uniform get/set/incr/expire/publish/subscribe adapter over the
//!   substrate, with an in-process fallback
//! - [`session`]: session codes and cached display frames
//! - [`relay`]: rooms, role-based fan-out, the grace-period state machine and
//!   cross-instance envelopes
//! - [`identify`]: bounded worker pool for music-recognition jobs
//! - [`ratelimit`]: sliding-window limiter, substrate-backed with local
//!   fallback
//! - [`lookup`]: cached outbound search collaborators
//! - [`api`]: axum HTTP/WebSocket surface
//! - [`error`]: centralized error types

#![warn(clippy::all)]

pub mod api;
pub mod error;
pub mod identify;
pub mod kv;
pub mod lookup;
pub mod protocol_constants;
pub mod ratelimit;
pub mod relay;
pub mod session;
pub mod state;
pub mod utils;

// Re-export commonly used types at the crate root
pub use api::{start_server, AppState, Limiters, ServerError};
pub use error::{LuminaError, LuminaResult};
pub use identify::{CommandRecognizer, IdentifyPool, NullRecognizer, Recognizer};
pub use kv::KvStore;
pub use lookup::LookupService;
pub use ratelimit::{Decision, RateLimiter};
pub use relay::{ClientConnection, Envelope, JoinRequest, RelayHub, Role, ServerMessage};
pub use session::{CachedFrames, FrameKindCache, SessionStore};
pub use state::{Config, LimitsConfig, RateLimitConfig};
pub use utils::now_millis;
