//! Uniform key/value + pub/sub adapter over the shared substrate.
//!
//! Every component that needs cross-process state goes through this adapter:
//! session entries, cached frames, lookup caches, quota counters, rate-limit
//! windows and the relay's cross-instance channels.
//!
//! Two backends:
//! - **Redis** (normal operation): a `ConnectionManager` for commands plus a
//!   dedicated split pub/sub connection owned by the subscriber task.
//! - **Memory** (degraded / unconfigured): a bounded LRU with per-entry TTL.
//!   `publish`/`subscribe` become no-ops, silently making fan-out
//!   single-process.
//!
//! Per-operation substrate errors degrade to the local path and are logged;
//! routing never sees them.

mod memory;
mod subscriber;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::mpsc;

use crate::utils::now_millis;

use memory::LocalCache;
use subscriber::{spawn_subscriber, SubCmd};

/// Callback invoked by the subscriber task for each message on a subscribed
/// channel: `(channel, payload)`. Must not block; the relay hub's handler
/// only pushes onto unbounded per-connection queues.
pub type SubscriberFn = Arc<dyn Fn(&str, &str) + Send + Sync>;

enum Backend {
    Redis(ConnectionManager),
    Memory,
}

/// Shared-substrate adapter with in-process fallback.
pub struct KvStore {
    backend: Backend,
    local: LocalCache,
    handlers: Arc<DashMap<String, SubscriberFn>>,
    sub_tx: Option<mpsc::UnboundedSender<SubCmd>>,
}

impl KvStore {
    /// Connects to the substrate, or constructs a local-only store when
    /// `redis_url` is absent or unreachable. Never fails: missing substrate
    /// is a supported (logged) mode.
    pub async fn connect(redis_url: Option<&str>) -> Self {
        let handlers: Arc<DashMap<String, SubscriberFn>> = Arc::new(DashMap::new());

        if let Some(url) = redis_url {
            match Self::connect_redis(url, Arc::clone(&handlers)).await {
                Ok((manager, sub_tx)) => {
                    log::info!("[KV] Connected to substrate at {}", url);
                    return Self {
                        backend: Backend::Redis(manager),
                        local: LocalCache::new(),
                        handlers,
                        sub_tx: Some(sub_tx),
                    };
                }
                Err(e) => {
                    log::warn!(
                        "[KV] Substrate unavailable ({}), running local-only: \
                         sessions will not be visible to other instances",
                        e
                    );
                }
            }
        } else {
            log::info!("[KV] No substrate configured, running local-only");
        }

        Self {
            backend: Backend::Memory,
            local: LocalCache::new(),
            handlers,
            sub_tx: None,
        }
    }

    /// In-memory store, used by tests and by `connect` as the fallback.
    pub fn in_memory() -> Self {
        Self {
            backend: Backend::Memory,
            local: LocalCache::new(),
            handlers: Arc::new(DashMap::new()),
            sub_tx: None,
        }
    }

    async fn connect_redis(
        url: &str,
        handlers: Arc<DashMap<String, SubscriberFn>>,
    ) -> Result<(ConnectionManager, mpsc::UnboundedSender<SubCmd>), redis::RedisError> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client.clone()).await?;
        let (sub_tx, sub_rx) = mpsc::unbounded_channel();
        spawn_subscriber(client, handlers, sub_rx);
        Ok((manager, sub_tx))
    }

    /// Whether writes are visible to other relay processes.
    pub fn is_distributed(&self) -> bool {
        matches!(self.backend, Backend::Redis(_))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // String Operations
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn get(&self, key: &str) -> Option<String> {
        if let Backend::Redis(manager) = &self.backend {
            let mut conn = manager.clone();
            match conn.get::<_, Option<String>>(key).await {
                Ok(value) => return value,
                Err(e) => log::warn!("[KV] GET {} degraded to local: {}", key, e),
            }
        }
        self.local.get(key)
    }

    pub async fn set(&self, key: &str, value: &str, ttl_secs: u64) {
        if let Backend::Redis(manager) = &self.backend {
            let mut conn = manager.clone();
            match conn.set_ex::<_, _, ()>(key, value, ttl_secs).await {
                Ok(()) => return,
                Err(e) => log::warn!("[KV] SET {} degraded to local: {}", key, e),
            }
        }
        self.local
            .set(key, value, Some(Duration::from_secs(ttl_secs)));
    }

    /// Increments a counter, applying `ttl_secs` only when the counter hits 1.
    pub async fn incr(&self, key: &str, ttl_secs: u64) -> u64 {
        if let Backend::Redis(manager) = &self.backend {
            let mut conn = manager.clone();
            match conn.incr::<_, _, i64>(key, 1).await {
                Ok(value) => {
                    if value == 1 {
                        if let Err(e) = conn.expire::<_, bool>(key, ttl_secs as i64).await {
                            log::warn!("[KV] EXPIRE after INCR {} failed: {}", key, e);
                        }
                    }
                    return value.max(0) as u64;
                }
                Err(e) => log::warn!("[KV] INCR {} degraded to local: {}", key, e),
            }
        }
        self.local.incr(key, Some(Duration::from_secs(ttl_secs)))
    }

    /// Refreshes a key's TTL. Returns false if the key does not exist.
    pub async fn expire(&self, key: &str, ttl_secs: u64) -> bool {
        if let Backend::Redis(manager) = &self.backend {
            let mut conn = manager.clone();
            match conn.expire::<_, bool>(key, ttl_secs as i64).await {
                Ok(found) => return found,
                Err(e) => log::warn!("[KV] EXPIRE {} degraded to local: {}", key, e),
            }
        }
        self.local.expire(key, Duration::from_secs(ttl_secs))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Pub/Sub
    // ─────────────────────────────────────────────────────────────────────────

    /// Publishes to a channel, best effort. Failure means no cross-instance
    /// delivery for this payload; local fan-out has already happened.
    pub async fn publish(&self, channel: &str, payload: &str) {
        if let Backend::Redis(manager) = &self.backend {
            let mut conn = manager.clone();
            if let Err(e) = conn.publish::<_, _, ()>(channel, payload).await {
                log::warn!("[KV] PUBLISH {} dropped: {}", channel, e);
            }
        }
        // Local-only mode: no-op. There is no other process to reach.
    }

    /// Registers a handler for a channel. In local-only mode the handler is
    /// retained but never invoked (nothing publishes across processes).
    pub fn subscribe(&self, channel: &str, handler: SubscriberFn) {
        self.handlers.insert(channel.to_string(), handler);
        if let Some(tx) = &self.sub_tx {
            let _ = tx.send(SubCmd::Subscribe(channel.to_string()));
        }
    }

    /// Drops the handler for a channel and unsubscribes on the wire.
    pub fn unsubscribe(&self, channel: &str) {
        self.handlers.remove(channel);
        if let Some(tx) = &self.sub_tx {
            let _ = tx.send(SubCmd::Unsubscribe(channel.to_string()));
        }
    }

    /// Number of channels with registered handlers.
    pub fn subscription_count(&self) -> usize {
        self.handlers.len()
    }

    #[cfg(test)]
    pub(crate) fn dispatch_for_test(&self, channel: &str, payload: &str) {
        if let Some(handler) = self.handlers.get(channel) {
            (handler.value())(channel, payload);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sliding Window (rate limiter support)
    // ─────────────────────────────────────────────────────────────────────────

    /// Runs the limiter's atomic window sequence against the substrate:
    /// prune entries older than the window, insert now (with a random
    /// tie-breaker so concurrent hits coexist), read cardinality, refresh the
    /// key TTL to the window length.
    ///
    /// Returns the post-insert cardinality, or `None` when the substrate is
    /// unavailable and the caller should use its in-process window.
    pub async fn sliding_window_count(&self, key: &str, window_ms: u64) -> Option<u64> {
        let Backend::Redis(manager) = &self.backend else {
            return None;
        };
        let mut conn = manager.clone();
        let now = now_millis();
        let cutoff = now.saturating_sub(window_ms);
        let member = format!("{}-{:08x}", now, rand::random::<u32>());

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg(0)
            .arg(cutoff)
            .cmd("ZADD")
            .arg(key)
            .arg(now)
            .arg(&member)
            .cmd("ZCARD")
            .arg(key)
            .cmd("PEXPIRE")
            .arg(key)
            .arg(window_ms);
        let result: Result<(i64, i64, u64, i64), redis::RedisError> =
            pipe.query_async(&mut conn).await;

        match result {
            Ok((_, _, cardinality, _)) => Some(cardinality),
            Err(e) => {
                log::warn!("[KV] Sliding window {} degraded to local: {}", key, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_roundtrips() {
        let kv = KvStore::in_memory();
        assert!(!kv.is_distributed());
        kv.set("key", "value", 60).await;
        assert_eq!(kv.get("key").await, Some("value".to_string()));
        assert_eq!(kv.get("missing").await, None);
    }

    #[tokio::test]
    async fn memory_incr_counts_up() {
        let kv = KvStore::in_memory();
        assert_eq!(kv.incr("quota:youtube:2026-08-01", 60).await, 1);
        assert_eq!(kv.incr("quota:youtube:2026-08-01", 60).await, 2);
    }

    #[tokio::test]
    async fn memory_expire_reports_presence() {
        let kv = KvStore::in_memory();
        assert!(!kv.expire("missing", 60).await);
        kv.set("key", "v", 60).await;
        assert!(kv.expire("key", 60).await);
    }

    #[tokio::test]
    async fn memory_publish_and_subscribe_are_noops() {
        let kv = KvStore::in_memory();
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        kv.subscribe(
            "ws:relay:ABCDEF",
            Arc::new(move |_, _| {
                hits_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }),
        );
        kv.publish("ws:relay:ABCDEF", "{}").await;
        // Handler is registered but nothing crosses process boundaries.
        assert_eq!(kv.subscription_count(), 1);
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 0);

        kv.unsubscribe("ws:relay:ABCDEF");
        assert_eq!(kv.subscription_count(), 0);
    }

    #[tokio::test]
    async fn sliding_window_unavailable_in_memory_mode() {
        let kv = KvStore::in_memory();
        assert_eq!(kv.sliding_window_count("ratelimit:x:1.2.3.4", 1000).await, None);
    }
}
