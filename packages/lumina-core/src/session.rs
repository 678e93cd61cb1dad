//! Session store: code minting, existence checks, cached display frames.
//!
//! Sessions live in the shared substrate so that clients landing on different
//! relay processes resolve the same code. There is no delete API; the 24 hour
//! TTL is the only destruction path, refreshed by every inbound frame.

use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::kv::KvStore;
use crate::protocol_constants::{
    OPEN_SESSION_ID, SESSION_CODE_ALPHABET, SESSION_CODE_LEN, SESSION_KEY_PREFIX,
    SESSION_TTL_SECS,
};
use crate::utils::now_millis;

/// The three frame kinds a display's latest state is cached under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKindCache {
    State,
    Song,
    Beat,
}

impl FrameKindCache {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::State => "state",
            Self::Song => "song",
            Self::Beat => "beat",
        }
    }
}

/// Latest cached frames for a session. Missing kinds are `None`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CachedFrames {
    pub state: Option<String>,
    pub song: Option<String>,
    pub beat: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct SessionEntry {
    #[serde(rename = "createdAt")]
    created_at: u64,
}

/// Substrate-backed session store.
pub struct SessionStore {
    kv: Arc<KvStore>,
}

fn session_key(id: &str) -> String {
    format!("{SESSION_KEY_PREFIX}{id}")
}

fn frame_key(id: &str, kind: FrameKindCache) -> String {
    format!("{SESSION_KEY_PREFIX}{id}:{}", kind.as_str())
}

/// Draws one six-character code from the reduced alphabet.
///
/// `ThreadRng` is a CSPRNG, so codes are not guessable from prior codes.
fn mint_code() -> String {
    let mut rng = rand::thread_rng();
    (0..SESSION_CODE_LEN)
        .map(|_| SESSION_CODE_ALPHABET[rng.gen_range(0..SESSION_CODE_ALPHABET.len())] as char)
        .collect()
}

impl SessionStore {
    pub fn new(kv: Arc<KvStore>) -> Self {
        Self { kv }
    }

    /// Mints a new session code and writes its entry with the session TTL.
    ///
    /// Collisions are vanishingly unlikely (32^6 codes) but re-drawn anyway
    /// so a returned code never silently adopts an existing session.
    pub async fn create(&self) -> String {
        loop {
            let id = mint_code();
            if !self.exists(&id).await {
                self.write_entry(&id).await;
                log::info!("[Session] Created session {}", id);
                return id;
            }
        }
    }

    /// Whether a session entry exists in the substrate.
    pub async fn exists(&self, id: &str) -> bool {
        self.kv.get(&session_key(id)).await.is_some()
    }

    /// Idempotently materializes a session. A second call is a no-op beyond
    /// refreshing the TTL. The reserved open id is the only id this accepts
    /// that `create` would never mint.
    pub async fn ensure(&self, id: &str) {
        if self.exists(id).await {
            self.touch(id).await;
        } else {
            self.write_entry(id).await;
        }
    }

    /// Overwrites the cached frame of the given kind with the raw payload,
    /// verbatim, no re-encoding.
    pub async fn cache_frame(&self, id: &str, kind: FrameKindCache, payload: &str) {
        self.kv
            .set(&frame_key(id, kind), payload, SESSION_TTL_SECS)
            .await;
    }

    /// Fetches all three cached frames in parallel; missing kinds are `None`.
    pub async fn frames(&self, id: &str) -> CachedFrames {
        let state_key = frame_key(id, FrameKindCache::State);
        let song_key = frame_key(id, FrameKindCache::Song);
        let beat_key = frame_key(id, FrameKindCache::Beat);
        let (state, song, beat) = tokio::join!(
            self.kv.get(&state_key),
            self.kv.get(&song_key),
            self.kv.get(&beat_key),
        );
        CachedFrames { state, song, beat }
    }

    /// Refreshes the TTL on the session entry and all three frame keys.
    pub async fn touch(&self, id: &str) {
        let sess_key = session_key(id);
        let state_key = frame_key(id, FrameKindCache::State);
        let song_key = frame_key(id, FrameKindCache::Song);
        let beat_key = frame_key(id, FrameKindCache::Beat);
        tokio::join!(
            self.kv.expire(&sess_key, SESSION_TTL_SECS),
            self.kv.expire(&state_key, SESSION_TTL_SECS),
            self.kv.expire(&song_key, SESSION_TTL_SECS),
            self.kv.expire(&beat_key, SESSION_TTL_SECS),
        );
    }

    async fn write_entry(&self, id: &str) {
        let entry = SessionEntry {
            created_at: now_millis(),
        };
        let json = serde_json::to_string(&entry).unwrap_or_else(|_| "{}".to_string());
        self.kv.set(&session_key(id), &json, SESSION_TTL_SECS).await;
    }
}

/// Returns the reserved session id used when code gating is disabled.
pub fn open_session_id() -> &'static str {
    OPEN_SESSION_ID
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn store() -> SessionStore {
        SessionStore::new(Arc::new(KvStore::in_memory()))
    }

    #[test]
    fn codes_use_only_the_reduced_alphabet() {
        for _ in 0..100 {
            let code = mint_code();
            assert_eq!(code.len(), 6);
            for c in code.bytes() {
                assert!(
                    SESSION_CODE_ALPHABET.contains(&c),
                    "unexpected character {}",
                    c as char
                );
            }
            for banned in ['I', 'O', '0', '1'] {
                assert!(!code.contains(banned), "ambiguous character in {}", code);
            }
        }
    }

    #[tokio::test]
    async fn hundred_creates_are_distinct() {
        let store = store();
        let mut seen = HashSet::new();
        for _ in 0..100 {
            assert!(seen.insert(store.create().await));
        }
        assert_eq!(seen.len(), 100);
    }

    #[tokio::test]
    async fn created_session_exists() {
        let store = store();
        let id = store.create().await;
        assert!(store.exists(&id).await);
        assert!(!store.exists("ZZZZZZ").await);
    }

    #[tokio::test]
    async fn ensure_is_idempotent() {
        let store = store();
        store.ensure("ABCDEF").await;
        store.ensure("ABCDEF").await;
        assert!(store.exists("ABCDEF").await);
    }

    #[tokio::test]
    async fn ensure_materializes_the_open_session() {
        let store = store();
        store.ensure(open_session_id()).await;
        assert!(store.exists(open_session_id()).await);
    }

    #[tokio::test]
    async fn cache_frame_keeps_only_the_latest() {
        let store = store();
        store.ensure("ABCDEF").await;
        store
            .cache_frame("ABCDEF", FrameKindCache::State, r#"{"type":"state","data":{"a":1}}"#)
            .await;
        store
            .cache_frame("ABCDEF", FrameKindCache::State, r#"{"type":"state","data":{"a":2}}"#)
            .await;

        let frames = store.frames("ABCDEF").await;
        assert_eq!(
            frames.state.as_deref(),
            Some(r#"{"type":"state","data":{"a":2}}"#)
        );
        assert!(frames.song.is_none());
        assert!(frames.beat.is_none());
    }

    #[tokio::test]
    async fn frame_kinds_do_not_clobber_each_other() {
        let store = store();
        store.ensure("ABCDEF").await;
        store
            .cache_frame("ABCDEF", FrameKindCache::State, r#"{"type":"state"}"#)
            .await;
        store
            .cache_frame("ABCDEF", FrameKindCache::Song, r#"{"type":"song"}"#)
            .await;
        store
            .cache_frame("ABCDEF", FrameKindCache::Beat, r#"{"type":"beat","bpm":120}"#)
            .await;

        let frames = store.frames("ABCDEF").await;
        assert_eq!(frames.state.as_deref(), Some(r#"{"type":"state"}"#));
        assert_eq!(frames.song.as_deref(), Some(r#"{"type":"song"}"#));
        assert_eq!(frames.beat.as_deref(), Some(r#"{"type":"beat","bpm":120}"#));
    }

    #[tokio::test]
    async fn touch_refreshes_without_creating() {
        let store = store();
        store.touch("ABCDEF").await;
        assert!(!store.exists("ABCDEF").await);

        store.ensure("ABCDEF").await;
        store.touch("ABCDEF").await;
        assert!(store.exists("ABCDEF").await);
    }
}
