//! Wire message shapes and inbound frame validation.
//!
//! The relay does not interpret message internals: a lightweight header
//! decode yields the `type`, and the rest of the payload is forwarded
//! verbatim as opaque text. Only server-originated notifications are fully
//! typed here.

use serde::{Deserialize, Serialize};

use crate::protocol_constants::MAX_FRAME_BYTES;

// ─────────────────────────────────────────────────────────────────────────────
// Roles
// ─────────────────────────────────────────────────────────────────────────────

/// Role a client declared at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Mobile remote driving a display.
    Controller,
    /// Client rendering visuals/lyrics/video.
    Display,
    /// Passive observer of a display.
    Viewer,
}

impl Role {
    /// Parses the `role` query parameter. Unknown or missing values coerce
    /// to `Controller`, matching deployed client behavior.
    pub fn from_query(value: Option<&str>) -> Self {
        match value {
            Some("display") => Self::Display,
            Some("viewer") => Self::Viewer,
            _ => Self::Controller,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Controller => "controller",
            Self::Display => "display",
            Self::Viewer => "viewer",
        }
    }

    /// Local fan-out matrix: which roles receive a frame sent by this role.
    pub fn fan_out_targets(&self) -> &'static [Role] {
        match self {
            Self::Display => &[Role::Controller, Role::Viewer],
            Self::Controller | Self::Viewer => &[Role::Display],
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Inbound Validation
// ─────────────────────────────────────────────────────────────────────────────

/// The closed set of accepted frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    State,
    Song,
    Beat,
    Command,
    Visualizer,
    Lyrics,
    Video,
    NowPlaying,
    SeekTo,
    Display,
    RemoteStatus,
    Session,
    Error,
    Ping,
    Pong,
    AudioFeatures,
    KioskStatus,
}

impl FrameKind {
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "state" => Self::State,
            "song" => Self::Song,
            "beat" => Self::Beat,
            "command" => Self::Command,
            "visualizer" => Self::Visualizer,
            "lyrics" => Self::Lyrics,
            "video" => Self::Video,
            "nowPlaying" => Self::NowPlaying,
            "seekTo" => Self::SeekTo,
            "display" => Self::Display,
            "remoteStatus" => Self::RemoteStatus,
            "session" => Self::Session,
            "error" => Self::Error,
            "ping" => Self::Ping,
            "pong" => Self::Pong,
            "audioFeatures" => Self::AudioFeatures,
            "kioskStatus" => Self::KioskStatus,
            _ => return None,
        })
    }
}

/// Minimal header decode: the relay only needs the `type` discriminant.
#[derive(Deserialize)]
struct FrameHeader {
    #[serde(rename = "type")]
    kind: String,
}

/// Validates an inbound frame: size cap, JSON object with a known `type`.
///
/// Returns the decoded kind, or `None` for frames that must be dropped
/// silently (oversize, malformed, unknown type).
pub fn validate_inbound(payload: &str) -> Option<FrameKind> {
    if payload.len() > MAX_FRAME_BYTES {
        return None;
    }
    let header: FrameHeader = serde_json::from_str(payload).ok()?;
    FrameKind::parse(&header.kind)
}

// ─────────────────────────────────────────────────────────────────────────────
// Server-Originated Messages
// ─────────────────────────────────────────────────────────────────────────────

/// Notifications the relay itself produces.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Tells a client which session it was bound to after minting.
    Session { session_id: String },
    /// In-band join failure, sent just before the 4001 close.
    Error { message: String },
    /// Controller presence, sent to displays.
    RemoteStatus { connected: bool, controllers: usize },
    /// Kiosk display presence, sent to viewers.
    KioskStatus { connected: bool },
}

impl ServerMessage {
    pub fn to_json(&self) -> String {
        // Serialization of these closed shapes cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Cross-Process Envelope
// ─────────────────────────────────────────────────────────────────────────────

/// Wrapper for frames republished on `ws:relay:<sessionId>`.
///
/// `payload` is the original client JSON string, forwarded verbatim.
/// Receivers drop envelopes whose `from_instance_id` equals their own.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub from_instance_id: String,
    pub sender_role: Role,
    pub payload: String,
}
