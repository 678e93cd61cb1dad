//! Fixed protocol constants that should NOT be changed.
//!
//! These values are part of the wire contract between relay processes and the
//! browser/mobile clients. Changing them breaks interop with deployed clients
//! and with peer relay instances sharing the same substrate.

// ─────────────────────────────────────────────────────────────────────────────
// Session Codes
// ─────────────────────────────────────────────────────────────────────────────

/// Alphabet for session codes.
///
/// Excludes `I`, `O`, `0` and `1`, which are ambiguous on small phone screens.
pub const SESSION_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Number of characters in a session code.
pub const SESSION_CODE_LEN: usize = 6;

/// Reserved session id used when the deployment disables code gating.
pub const OPEN_SESSION_ID: &str = "__open__";

/// Sessions expire after 24 hours without traffic.
pub const SESSION_TTL_SECS: u64 = 24 * 60 * 60;

// ─────────────────────────────────────────────────────────────────────────────
// Relay Timers
// ─────────────────────────────────────────────────────────────────────────────

/// Grace window after the last controller disconnects before displays are
/// told the remote is gone. Absorbs phones going to sleep mid-session.
pub const DISCONNECT_GRACE_MS: u64 = 15_000;

/// Delay before an empty room is reaped (and its substrate channel dropped).
pub const ROOM_REAP_MS: u64 = 60_000;

// ─────────────────────────────────────────────────────────────────────────────
// Wire Limits
// ─────────────────────────────────────────────────────────────────────────────

/// Maximum accepted size of a single inbound frame (bytes).
pub const MAX_FRAME_BYTES: usize = 50 * 1024;

/// Maximum inbound frames buffered while join setup is in flight.
/// Excess frames are dropped, oldest first retained.
pub const SETUP_BUFFER_MAX_FRAMES: usize = 64;

/// WebSocket close code for an unknown session code.
pub const CLOSE_INVALID_SESSION: u16 = 4001;

// ─────────────────────────────────────────────────────────────────────────────
// Substrate Key Layout
// ─────────────────────────────────────────────────────────────────────────────

/// Prefix for the cross-process relay channels: `ws:relay:<sessionId>`.
pub const RELAY_CHANNEL_PREFIX: &str = "ws:relay:";

/// Prefix for session entries: `ws:session:<id>` and `ws:session:<id>:<kind>`.
pub const SESSION_KEY_PREFIX: &str = "ws:session:";

/// Prefix for generic TTL cache entries (search, video, ...).
pub const CACHE_KEY_PREFIX: &str = "cache:";

/// Prefix for rate-limiter windows: `ratelimit:<prefix>:<client>`.
pub const RATELIMIT_KEY_PREFIX: &str = "ratelimit:";

/// TTL for cached lookup responses (search, video).
pub const LOOKUP_CACHE_TTL_SECS: u64 = 24 * 60 * 60;

// ─────────────────────────────────────────────────────────────────────────────
// Identify Pool
// ─────────────────────────────────────────────────────────────────────────────

/// Queue depth at which the identify pool refuses new jobs.
pub const IDENTIFY_QUEUE_MAX: usize = 50;

/// Maximum accepted upload size for `/api/identify` (bytes).
pub const IDENTIFY_MAX_UPLOAD_BYTES: usize = 3 * 1024 * 1024;

// ─────────────────────────────────────────────────────────────────────────────
// Local (degraded-mode) Limits
// ─────────────────────────────────────────────────────────────────────────────

/// Capacity of the in-process LRU that backs the KV adapter when the
/// substrate is unavailable.
pub const LOCAL_CACHE_CAPACITY: usize = 500;

/// Maximum keys held by the in-process rate-limiter map before the oldest
/// keys are evicted.
pub const LIMITER_LOCAL_MAX_KEYS: usize = 10_000;

/// Interval between sweeps of empty in-process limiter windows (seconds).
pub const LIMITER_SWEEP_SECS: u64 = 60;

// ─────────────────────────────────────────────────────────────────────────────
// Substrate Subscriber
// ─────────────────────────────────────────────────────────────────────────────

/// Initial reconnect backoff for the pub/sub subscriber connection (ms).
pub const SUBSCRIBER_BACKOFF_INITIAL_MS: u64 = 500;

/// Cap on the subscriber reconnect backoff (ms).
pub const SUBSCRIBER_BACKOFF_MAX_MS: u64 = 30_000;

// ─────────────────────────────────────────────────────────────────────────────
// Lookup Collaborators
// ─────────────────────────────────────────────────────────────────────────────

/// Daily YouTube API quota budget (units).
pub const YOUTUBE_DAILY_QUOTA: u64 = 10_000;

/// Quota cost of one search call, per the YouTube Data API pricing table.
pub const YOUTUBE_SEARCH_COST: u64 = 100;

/// TTL on the daily quota counter. 48 hours so yesterday's counter survives
/// long enough to inspect, then expires on its own.
pub const QUOTA_TTL_SECS: u64 = 48 * 60 * 60;

// ─────────────────────────────────────────────────────────────────────────────
// Application Identity
// ─────────────────────────────────────────────────────────────────────────────

/// Service identifier reported by the health endpoint.
///
/// Clients probe `/api/health` and expect this exact string to identify a
/// Lumina relay instance behind the load balancer.
pub const SERVICE_ID: &str = "lumina-relay";
