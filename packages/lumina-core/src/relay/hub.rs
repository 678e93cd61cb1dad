//! Relay hub: role-based fan-out, the join protocol, the grace-period state
//! machine, and cross-instance envelopes.
//!
//! The hub is safe for concurrent calls from connection handlers, the
//! substrate subscriber and timer callbacks. Fan-out pushes onto unbounded
//! per-connection queues and never blocks, so a room either receives a frame
//! on every intended member or on none.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{LuminaError, LuminaResult};
use crate::kv::KvStore;
use crate::protocol_constants::{
    DISCONNECT_GRACE_MS, OPEN_SESSION_ID, RELAY_CHANNEL_PREFIX, ROOM_REAP_MS,
};
use crate::session::{FrameKindCache, SessionStore};
use crate::state::Config;

use super::frame::{validate_inbound, Envelope, FrameKind, Role, ServerMessage};
use super::registry::{ClientConnection, Outbound, RoomRegistry};

/// Name of the cross-process channel for a session.
pub fn relay_channel(session_id: &str) -> String {
    format!("{RELAY_CHANNEL_PREFIX}{session_id}")
}

/// Parameters of one join attempt, parsed from the upgrade URL.
#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub role: Role,
    pub kiosk: bool,
    pub requested: Option<String>,
}

/// Coordinates rooms, caching side effects and cross-instance traffic for
/// one relay process.
pub struct RelayHub {
    instance_id: String,
    require_code: bool,
    registry: RoomRegistry,
    sessions: Arc<SessionStore>,
    kv: Arc<KvStore>,
    /// Sessions whose display joined with `kiosk=true`.
    kiosk_sessions: DashMap<String, ()>,
    /// Latest `audioFeatures` frame per session. Memory-only: this is a
    /// per-frame ~30 Hz stream and would swamp the shared substrate.
    audio_snapshots: DashMap<String, String>,
    /// Pending disconnect-grace timers, at most one per session.
    grace_timers: DashMap<String, JoinHandle<()>>,
    /// Sessions whose cross-process channel this instance subscribes to.
    subscribed: DashMap<String, ()>,
}

impl RelayHub {
    pub fn new(config: &Config, sessions: Arc<SessionStore>, kv: Arc<KvStore>) -> Arc<Self> {
        Arc::new(Self {
            instance_id: Uuid::new_v4().to_string(),
            require_code: config.require_code,
            registry: RoomRegistry::new(),
            sessions,
            kv,
            kiosk_sessions: DashMap::new(),
            audio_snapshots: DashMap::new(),
            grace_timers: DashMap::new(),
            subscribed: DashMap::new(),
        })
    }

    /// UUID identifying this process in cross-instance envelopes.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Join
    // ─────────────────────────────────────────────────────────────────────────

    /// Binds a new connection to a session and runs the role-specific join
    /// side effects (replay, presence notifications, kiosk bookkeeping).
    ///
    /// Errors map to an in-band `error` frame plus close code 4001, emitted
    /// by the endpoint.
    pub async fn join_session(
        self: &Arc<Self>,
        req: JoinRequest,
        tx: mpsc::UnboundedSender<Outbound>,
    ) -> LuminaResult<Arc<ClientConnection>> {
        let mut minted = false;
        let session_id = if !self.require_code {
            OPEN_SESSION_ID.to_string()
        } else {
            match req.role {
                // A display reuses an existing session or mints a fresh one;
                // a stale requested code is not an error for displays (kiosks
                // restart after their session expired).
                Role::Display => match req.requested {
                    Some(id) if self.sessions.exists(&id).await => id,
                    _ => {
                        minted = true;
                        self.sessions.create().await
                    }
                },
                Role::Controller => match req.requested {
                    Some(id) => {
                        if self.sessions.exists(&id).await {
                            id
                        } else {
                            return Err(LuminaError::InvalidSession);
                        }
                    }
                    None => {
                        minted = true;
                        self.sessions.create().await
                    }
                },
                Role::Viewer => match req.requested {
                    Some(id) if self.sessions.exists(&id).await => id,
                    _ => return Err(LuminaError::InvalidSession),
                },
            }
        };

        self.sessions.ensure(&session_id).await;

        let kiosk = req.kiosk && req.role == Role::Display;
        let conn = self
            .registry
            .make_connection(req.role, &session_id, kiosk, tx);
        self.registry.attach(&conn);
        self.ensure_subscribed(&session_id);

        if minted {
            conn.send_message(&ServerMessage::Session {
                session_id: session_id.clone(),
            });
        }

        match req.role {
            Role::Controller => {
                self.replay_cached_frames(&conn).await;
                self.cancel_grace(&session_id);
                let controllers = self.registry.count_by_role(&session_id, Role::Controller);
                self.send_to_role(
                    &session_id,
                    Role::Display,
                    &ServerMessage::RemoteStatus {
                        connected: true,
                        controllers,
                    },
                );
            }
            Role::Viewer => {
                self.replay_cached_frames(&conn).await;
                if let Some(snapshot) = self.audio_snapshots.get(&session_id) {
                    conn.send_raw(snapshot.value());
                }
                conn.send_message(&ServerMessage::KioskStatus {
                    connected: self.kiosk_sessions.contains_key(&session_id),
                });
            }
            Role::Display => {
                if kiosk {
                    self.kiosk_sessions.insert(session_id.clone(), ());
                    self.send_to_role(
                        &session_id,
                        Role::Viewer,
                        &ServerMessage::KioskStatus { connected: true },
                    );
                }
            }
        }

        log::info!(
            "[Hub] {} {} joined session {}{}",
            conn.role.as_str(),
            conn.id,
            session_id,
            if minted { " (minted)" } else { "" }
        );
        Ok(conn)
    }

    /// Replays cached `state`, `song`, `beat` frames, in that order. The
    /// order is a contract with downstream rendering.
    async fn replay_cached_frames(&self, conn: &ClientConnection) {
        let frames = self.sessions.frames(&conn.session_id).await;
        for frame in [frames.state, frames.song, frames.beat]
            .into_iter()
            .flatten()
        {
            conn.send_raw(&frame);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Inbound
    // ─────────────────────────────────────────────────────────────────────────

    /// Validates and routes one inbound frame.
    ///
    /// Invalid frames (oversize, malformed, unknown type) are dropped
    /// silently. Accepted frames refresh the session TTL, run display-side
    /// caching side effects, fan out locally, then publish the envelope for
    /// other instances (best effort).
    pub async fn handle_inbound(&self, conn: &ClientConnection, payload: &str) {
        let Some(kind) = validate_inbound(payload) else {
            log::debug!(
                "[Hub] Dropped invalid frame from {} in {}",
                conn.id,
                conn.session_id
            );
            return;
        };

        self.sessions.touch(&conn.session_id).await;

        if conn.role == Role::Display {
            match kind {
                FrameKind::State => {
                    self.sessions
                        .cache_frame(&conn.session_id, FrameKindCache::State, payload)
                        .await;
                }
                FrameKind::Song => {
                    self.sessions
                        .cache_frame(&conn.session_id, FrameKindCache::Song, payload)
                        .await;
                }
                FrameKind::Beat => {
                    self.sessions
                        .cache_frame(&conn.session_id, FrameKindCache::Beat, payload)
                        .await;
                }
                FrameKind::AudioFeatures => {
                    self.audio_snapshots
                        .insert(conn.session_id.clone(), payload.to_string());
                }
                _ => {}
            }
        }

        self.fan_out_local(&conn.session_id, conn.role, payload, Some(conn.id));

        let envelope = Envelope {
            from_instance_id: self.instance_id.clone(),
            sender_role: conn.role,
            payload: payload.to_string(),
        };
        match serde_json::to_string(&envelope) {
            Ok(json) => {
                self.kv
                    .publish(&relay_channel(&conn.session_id), &json)
                    .await;
            }
            Err(e) => log::warn!("[Hub] Envelope serialization failed: {}", e),
        }
    }

    /// Delivers a frame to the local room per the fan-out matrix.
    fn fan_out_local(
        &self,
        session_id: &str,
        sender_role: Role,
        payload: &str,
        exclude: Option<u64>,
    ) {
        for role in sender_role.fan_out_targets() {
            for conn in self.registry.by_role(session_id, *role) {
                if exclude == Some(conn.id) {
                    continue;
                }
                conn.send_raw(payload);
            }
        }
    }

    /// Sends a server message to every member of one role.
    fn send_to_role(&self, session_id: &str, role: Role, msg: &ServerMessage) {
        let json = msg.to_json();
        for conn in self.registry.by_role(session_id, role) {
            conn.send_raw(&json);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Cross-Process Ingestion
    // ─────────────────────────────────────────────────────────────────────────

    /// Handles one envelope from the substrate subscriber. Envelopes from
    /// this instance are dropped (loop avoidance); the rest re-enter the
    /// local fan-out. Never re-published.
    pub fn ingest_remote(&self, channel: &str, payload: &str) {
        let Some(session_id) = channel.strip_prefix(RELAY_CHANNEL_PREFIX) else {
            return;
        };
        let Ok(envelope) = serde_json::from_str::<Envelope>(payload) else {
            log::debug!("[Hub] Dropped malformed envelope on {}", channel);
            return;
        };
        if envelope.from_instance_id == self.instance_id {
            return;
        }
        self.fan_out_local(session_id, envelope.sender_role, &envelope.payload, None);
    }

    /// Subscribes this instance to a session's channel, once.
    fn ensure_subscribed(self: &Arc<Self>, session_id: &str) {
        match self.subscribed.entry(session_id.to_string()) {
            Entry::Occupied(_) => {}
            Entry::Vacant(entry) => {
                entry.insert(());
                let weak = Arc::downgrade(self);
                self.kv.subscribe(
                    &relay_channel(session_id),
                    Arc::new(move |channel, payload| {
                        if let Some(hub) = weak.upgrade() {
                            hub.ingest_remote(channel, payload);
                        }
                    }),
                );
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Close Handling & Grace FSM
    // ─────────────────────────────────────────────────────────────────────────

    /// Detaches a closed connection and runs role-specific side effects.
    pub fn handle_close(self: &Arc<Self>, conn: &ClientConnection) {
        let became_empty = self.registry.detach(conn);

        match conn.role {
            Role::Controller => {
                let remaining = self.registry.count_by_role(&conn.session_id, Role::Controller);
                if remaining > 0 {
                    self.send_to_role(
                        &conn.session_id,
                        Role::Display,
                        &ServerMessage::RemoteStatus {
                            connected: true,
                            controllers: remaining,
                        },
                    );
                } else {
                    // Last controller gone: grace window before displays are
                    // told. Phones sleeping reconnect well inside it.
                    self.schedule_grace(&conn.session_id);
                }
            }
            Role::Display if conn.kiosk => {
                self.kiosk_sessions.remove(&conn.session_id);
                self.audio_snapshots.remove(&conn.session_id);
                self.send_to_role(
                    &conn.session_id,
                    Role::Viewer,
                    &ServerMessage::KioskStatus { connected: false },
                );
            }
            _ => {}
        }

        if became_empty {
            self.schedule_reap(&conn.session_id);
        }

        log::debug!(
            "[Hub] {} {} left session {}",
            conn.role.as_str(),
            conn.id,
            conn.session_id
        );
    }

    /// Arms the disconnect-grace timer, unless one is already pending.
    fn schedule_grace(self: &Arc<Self>, session_id: &str) {
        match self.grace_timers.entry(session_id.to_string()) {
            Entry::Occupied(_) => {}
            Entry::Vacant(entry) => {
                let weak = Arc::downgrade(self);
                let session = session_id.to_string();
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(DISCONNECT_GRACE_MS)).await;
                    let Some(hub) = weak.upgrade() else { return };
                    hub.grace_timers.remove(&session);
                    let controllers = hub.registry.count_by_role(&session, Role::Controller);
                    hub.send_to_role(
                        &session,
                        Role::Display,
                        &ServerMessage::RemoteStatus {
                            connected: controllers > 0,
                            controllers,
                        },
                    );
                    log::info!(
                        "[Hub] Grace expired for {} (controllers={})",
                        session,
                        controllers
                    );
                });
                entry.insert(handle);
            }
        }
    }

    /// Cancels a pending grace timer (controller rejoined in time).
    fn cancel_grace(&self, session_id: &str) {
        if let Some((_, handle)) = self.grace_timers.remove(session_id) {
            handle.abort();
        }
    }

    /// Arms the room-reap timer, unless one is already pending. Firing
    /// re-checks emptiness, then drops the room, kiosk flag, audio snapshot
    /// and the session's cross-instance subscription.
    fn schedule_reap(self: &Arc<Self>, session_id: &str) {
        if self.registry.reap_pending(session_id) {
            return;
        }
        let weak = Arc::downgrade(self);
        let session = session_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ROOM_REAP_MS)).await;
            let Some(hub) = weak.upgrade() else { return };
            hub.registry.clear_reap_handle(&session);
            if !hub.registry.is_empty_room(&session) {
                return;
            }
            hub.registry.remove_room(&session);
            hub.kiosk_sessions.remove(&session);
            hub.audio_snapshots.remove(&session);
            hub.kv.unsubscribe(&relay_channel(&session));
            hub.subscribed.remove(&session);
            log::info!("[Hub] Reaped idle room {}", session);
        });
        self.registry.store_reap(session_id, handle);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Introspection
    // ─────────────────────────────────────────────────────────────────────────

    /// Number of sessions with a local room.
    pub fn room_count(&self) -> usize {
        self.subscribed.len()
    }

    /// Whether a session's display registered as a kiosk.
    pub fn kiosk_online(&self, session_id: &str) -> bool {
        self.kiosk_sessions.contains_key(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol_constants::MAX_FRAME_BYTES;

    struct TestClient {
        conn: Arc<ClientConnection>,
        rx: mpsc::UnboundedReceiver<Outbound>,
    }

    impl TestClient {
        /// Drains queued text frames.
        fn frames(&mut self) -> Vec<String> {
            let mut out = Vec::new();
            while let Ok(item) = self.rx.try_recv() {
                if let Outbound::Frame(frame) = item {
                    out.push(frame);
                }
            }
            out
        }
    }

    fn test_hub(require_code: bool) -> Arc<RelayHub> {
        let kv = Arc::new(KvStore::in_memory());
        let sessions = Arc::new(SessionStore::new(Arc::clone(&kv)));
        let config = Config {
            require_code,
            ..Default::default()
        };
        RelayHub::new(&config, sessions, kv)
    }

    async fn join(
        hub: &Arc<RelayHub>,
        role: Role,
        kiosk: bool,
        requested: Option<&str>,
    ) -> TestClient {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = hub
            .join_session(
                JoinRequest {
                    role,
                    kiosk,
                    requested: requested.map(str::to_string),
                },
                tx,
            )
            .await
            .expect("join should succeed");
        TestClient { conn, rx }
    }

    fn frame_type(frame: &str) -> String {
        serde_json::from_str::<serde_json::Value>(frame)
            .ok()
            .and_then(|v| v["type"].as_str().map(str::to_string))
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn display_without_code_gets_minted_session() {
        let hub = test_hub(true);
        let mut display = join(&hub, Role::Display, false, None).await;

        let frames = display.frames();
        assert_eq!(frames.len(), 1);
        let msg: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(msg["type"], "session");
        let code = msg["sessionId"].as_str().unwrap();
        assert_eq!(code.len(), 6);
        assert_eq!(display.conn.session_id, code);
    }

    #[tokio::test]
    async fn controller_with_unknown_code_is_rejected() {
        let hub = test_hub(true);
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = hub
            .join_session(
                JoinRequest {
                    role: Role::Controller,
                    kiosk: false,
                    requested: Some("ZZZZZZ".to_string()),
                },
                tx,
            )
            .await;
        assert!(matches!(result, Err(LuminaError::InvalidSession)));
    }

    #[tokio::test]
    async fn viewer_requires_a_valid_code() {
        let hub = test_hub(true);
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = hub
            .join_session(
                JoinRequest {
                    role: Role::Viewer,
                    kiosk: false,
                    requested: None,
                },
                tx,
            )
            .await;
        assert!(matches!(result, Err(LuminaError::InvalidSession)));
    }

    #[tokio::test]
    async fn controller_without_code_mints_and_is_told() {
        let hub = test_hub(true);
        let mut controller = join(&hub, Role::Controller, false, None).await;
        let frames = controller.frames();
        assert_eq!(frame_type(&frames[0]), "session");
    }

    #[tokio::test]
    async fn open_mode_binds_every_role_to_the_open_session() {
        let hub = test_hub(false);
        let display = join(&hub, Role::Display, false, None).await;
        let controller = join(&hub, Role::Controller, false, Some("IGNORED")).await;
        assert_eq!(display.conn.session_id, OPEN_SESSION_ID);
        assert_eq!(controller.conn.session_id, OPEN_SESSION_ID);
    }

    #[tokio::test]
    async fn controller_join_notifies_displays() {
        let hub = test_hub(true);
        let mut display = join(&hub, Role::Display, false, None).await;
        let session = display.conn.session_id.clone();
        display.frames();

        let _controller = join(&hub, Role::Controller, false, Some(&session)).await;

        let frames = display.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(
            frames[0],
            r#"{"type":"remoteStatus","connected":true,"controllers":1}"#
        );
    }

    #[tokio::test]
    async fn fan_out_matrix_display_to_controllers_and_viewers() {
        let hub = test_hub(true);
        let mut display = join(&hub, Role::Display, false, None).await;
        let session = display.conn.session_id.clone();
        let mut display2 = join(&hub, Role::Display, false, Some(&session)).await;
        let mut c1 = join(&hub, Role::Controller, false, Some(&session)).await;
        let mut c2 = join(&hub, Role::Controller, false, Some(&session)).await;
        let mut viewer = join(&hub, Role::Viewer, false, Some(&session)).await;
        for client in [&mut display, &mut display2, &mut c1, &mut c2, &mut viewer] {
            client.frames();
        }

        let state = r#"{"type":"state","data":{"mode":"nebula"}}"#;
        hub.handle_inbound(&display.conn, state).await;

        assert_eq!(c1.frames(), vec![state.to_string()]);
        assert_eq!(c2.frames(), vec![state.to_string()]);
        assert_eq!(viewer.frames(), vec![state.to_string()]);
        // No display receives a display-originated frame, sender included.
        assert!(display.frames().is_empty());
        assert!(display2.frames().is_empty());
    }

    #[tokio::test]
    async fn fan_out_matrix_controller_to_displays_only() {
        let hub = test_hub(true);
        let mut display = join(&hub, Role::Display, false, None).await;
        let session = display.conn.session_id.clone();
        let mut c1 = join(&hub, Role::Controller, false, Some(&session)).await;
        let mut c2 = join(&hub, Role::Controller, false, Some(&session)).await;
        let mut viewer = join(&hub, Role::Viewer, false, Some(&session)).await;
        for client in [&mut display, &mut c1, &mut c2, &mut viewer] {
            client.frames();
        }

        let command = r#"{"type":"command","action":"setVisualizerMode","value":"nebula"}"#;
        hub.handle_inbound(&c1.conn, command).await;

        assert_eq!(display.frames(), vec![command.to_string()]);
        assert!(c1.frames().is_empty());
        assert!(c2.frames().is_empty());
        assert!(viewer.frames().is_empty());
    }

    #[tokio::test]
    async fn controller_join_replays_cached_frames_in_order() {
        let hub = test_hub(true);
        let mut display = join(&hub, Role::Display, false, None).await;
        let session = display.conn.session_id.clone();
        display.frames();

        let state = r#"{"type":"state","data":{"v":1}}"#;
        let song = r#"{"type":"song","data":{"title":"Aurora"}}"#;
        let beat = r#"{"type":"beat","bpm":120}"#;
        // Cached out of replay order on purpose.
        hub.handle_inbound(&display.conn, beat).await;
        hub.handle_inbound(&display.conn, state).await;
        hub.handle_inbound(&display.conn, song).await;

        let mut controller = join(&hub, Role::Controller, false, Some(&session)).await;
        let live = r#"{"type":"state","data":{"v":2}}"#;
        hub.handle_inbound(&display.conn, live).await;

        let frames = controller.frames();
        assert_eq!(frames, vec![state, song, beat, live]);
    }

    #[tokio::test]
    async fn viewer_join_replays_frames_snapshot_and_kiosk_status() {
        let hub = test_hub(true);
        let mut display = join(&hub, Role::Display, true, None).await;
        let session = display.conn.session_id.clone();
        display.frames();

        let state = r#"{"type":"state","data":{}}"#;
        let audio = r#"{"type":"audioFeatures","rms":0.42}"#;
        hub.handle_inbound(&display.conn, state).await;
        hub.handle_inbound(&display.conn, audio).await;

        let mut viewer = join(&hub, Role::Viewer, false, Some(&session)).await;
        let frames = viewer.frames();
        assert_eq!(
            frames,
            vec![
                state.to_string(),
                audio.to_string(),
                r#"{"type":"kioskStatus","connected":true}"#.to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn audio_features_stay_off_the_substrate() {
        let hub = test_hub(true);
        let display = join(&hub, Role::Display, false, None).await;
        let session = display.conn.session_id.clone();

        hub.handle_inbound(&display.conn, r#"{"type":"audioFeatures","rms":0.9}"#)
            .await;

        // Cached frames hold only state/song/beat; the snapshot is in memory.
        let frames = hub.sessions.frames(&session).await;
        assert!(frames.state.is_none());
        assert!(hub.audio_snapshots.contains_key(&session));
    }

    #[tokio::test]
    async fn invalid_frames_are_dropped_silently() {
        let hub = test_hub(true);
        let mut display = join(&hub, Role::Display, false, None).await;
        let session = display.conn.session_id.clone();
        let mut controller = join(&hub, Role::Controller, false, Some(&session)).await;
        display.frames();
        controller.frames();

        let oversize = format!(
            r#"{{"type":"state","data":"{}"}}"#,
            "x".repeat(MAX_FRAME_BYTES)
        );
        hub.handle_inbound(&display.conn, &oversize).await;
        hub.handle_inbound(&display.conn, r#"{"type":"teleport"}"#).await;
        hub.handle_inbound(&display.conn, "not json at all").await;

        assert!(controller.frames().is_empty());
        assert!(hub.sessions.frames(&session).await.state.is_none());
    }

    #[tokio::test]
    async fn self_originated_envelopes_are_dropped() {
        let hub = test_hub(true);
        let mut display = join(&hub, Role::Display, false, None).await;
        let session = display.conn.session_id.clone();
        let mut controller = join(&hub, Role::Controller, false, Some(&session)).await;
        display.frames();
        controller.frames();

        let envelope = serde_json::to_string(&Envelope {
            from_instance_id: hub.instance_id().to_string(),
            sender_role: Role::Display,
            payload: r#"{"type":"state","data":{}}"#.to_string(),
        })
        .unwrap();
        hub.ingest_remote(&relay_channel(&session), &envelope);

        assert!(controller.frames().is_empty());
    }

    #[tokio::test]
    async fn remote_envelopes_fan_out_without_republishing() {
        let hub = test_hub(true);
        let mut display = join(&hub, Role::Display, false, None).await;
        let session = display.conn.session_id.clone();
        let mut controller = join(&hub, Role::Controller, false, Some(&session)).await;
        let mut viewer = join(&hub, Role::Viewer, false, Some(&session)).await;
        display.frames();
        controller.frames();
        viewer.frames();

        // A frame a controller sent on another instance.
        let payload = r#"{"type":"command","action":"play"}"#;
        let envelope = serde_json::to_string(&Envelope {
            from_instance_id: "00000000-0000-0000-0000-000000000000".to_string(),
            sender_role: Role::Controller,
            payload: payload.to_string(),
        })
        .unwrap();
        hub.ingest_remote(&relay_channel(&session), &envelope);

        assert_eq!(display.frames(), vec![payload.to_string()]);
        assert!(controller.frames().is_empty());
        assert!(viewer.frames().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn grace_expiry_emits_exactly_one_disconnect() {
        let hub = test_hub(true);
        let mut display = join(&hub, Role::Display, false, None).await;
        let session = display.conn.session_id.clone();
        let controller = join(&hub, Role::Controller, false, Some(&session)).await;
        display.frames();

        hub.handle_close(&controller.conn);
        tokio::time::sleep(Duration::from_millis(DISCONNECT_GRACE_MS + 1_000)).await;

        let frames = display.frames();
        assert_eq!(
            frames,
            vec![r#"{"type":"remoteStatus","connected":false,"controllers":0}"#.to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rejoin_within_grace_suppresses_disconnect() {
        let hub = test_hub(true);
        let mut display = join(&hub, Role::Display, false, None).await;
        let session = display.conn.session_id.clone();
        let controller = join(&hub, Role::Controller, false, Some(&session)).await;
        display.frames();

        hub.handle_close(&controller.conn);
        tokio::time::sleep(Duration::from_millis(14_000)).await;
        let _controller2 = join(&hub, Role::Controller, false, Some(&session)).await;

        // Rejoin announces presence; no disconnect flash before or after.
        let frames = display.frames();
        assert_eq!(
            frames,
            vec![r#"{"type":"remoteStatus","connected":true,"controllers":1}"#.to_string()]
        );

        tokio::time::sleep(Duration::from_millis(30_000)).await;
        assert!(display.frames().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn second_controller_close_skips_grace() {
        let hub = test_hub(true);
        let mut display = join(&hub, Role::Display, false, None).await;
        let session = display.conn.session_id.clone();
        let c1 = join(&hub, Role::Controller, false, Some(&session)).await;
        let _c2 = join(&hub, Role::Controller, false, Some(&session)).await;
        display.frames();

        hub.handle_close(&c1.conn);

        let frames = display.frames();
        assert_eq!(
            frames,
            vec![r#"{"type":"remoteStatus","connected":true,"controllers":1}"#.to_string()]
        );
    }

    #[tokio::test]
    async fn kiosk_close_clears_state_and_notifies_viewers() {
        let hub = test_hub(true);
        let display = join(&hub, Role::Display, true, None).await;
        let session = display.conn.session_id.clone();
        hub.handle_inbound(&display.conn, r#"{"type":"audioFeatures","rms":0.5}"#)
            .await;
        let mut viewer = join(&hub, Role::Viewer, false, Some(&session)).await;
        viewer.frames();

        hub.handle_close(&display.conn);

        assert!(!hub.kiosk_online(&session));
        assert!(!hub.audio_snapshots.contains_key(&session));
        assert_eq!(
            viewer.frames(),
            vec![r#"{"type":"kioskStatus","connected":false}"#.to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn empty_room_is_reaped_and_unsubscribed() {
        let hub = test_hub(true);
        let display = join(&hub, Role::Display, true, None).await;
        let session = display.conn.session_id.clone();
        assert_eq!(hub.kv.subscription_count(), 1);

        hub.handle_close(&display.conn);
        tokio::time::sleep(Duration::from_millis(ROOM_REAP_MS + 1_000)).await;

        assert_eq!(hub.kv.subscription_count(), 0);
        assert!(!hub.kiosk_online(&session));
        assert_eq!(hub.room_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rejoin_before_reap_keeps_the_room() {
        let hub = test_hub(true);
        let display = join(&hub, Role::Display, false, None).await;
        let session = display.conn.session_id.clone();

        hub.handle_close(&display.conn);
        tokio::time::sleep(Duration::from_millis(30_000)).await;
        let _display2 = join(&hub, Role::Display, false, Some(&session)).await;
        tokio::time::sleep(Duration::from_millis(ROOM_REAP_MS)).await;

        assert_eq!(hub.kv.subscription_count(), 1);
        assert_eq!(hub.registry.member_count(&session), 1);
    }

    #[tokio::test]
    async fn subscriber_handler_routes_into_the_hub() {
        // End-to-end through the KV handler registry: a dispatched message
        // behaves like a remote envelope.
        let hub = test_hub(true);
        let mut display = join(&hub, Role::Display, false, None).await;
        let session = display.conn.session_id.clone();
        display.frames();

        let payload = r#"{"type":"seekTo","position":42}"#;
        let envelope = serde_json::to_string(&Envelope {
            from_instance_id: "peer-instance".to_string(),
            sender_role: Role::Controller,
            payload: payload.to_string(),
        })
        .unwrap();
        hub.kv
            .dispatch_for_test(&relay_channel(&session), &envelope);

        assert_eq!(display.frames(), vec![payload.to_string()]);
    }
}
