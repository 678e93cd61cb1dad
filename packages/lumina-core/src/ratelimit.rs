//! Sliding-window rate limiter.
//!
//! Globally consistent when the substrate is up: each request runs one atomic
//! prune/insert/count/expire sequence against a sorted set, so every relay
//! process sees the same window. When the substrate is unavailable the
//! limiter degrades to an in-process map with identical semantics, bounded by
//! oldest-key eviction and a periodic sweep.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use parking_lot::Mutex;

use crate::kv::KvStore;
use crate::protocol_constants::{
    LIMITER_LOCAL_MAX_KEYS, LIMITER_SWEEP_SECS, RATELIMIT_KEY_PREFIX,
};
use crate::state::RateLimitConfig;
use crate::utils::now_millis;

/// Outcome of one limiter check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Limited { retry_after_secs: u64 },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

struct LocalWindows {
    windows: HashMap<String, Vec<u64>>,
    /// Keys in creation order, for oldest-first eviction. May contain keys
    /// the sweep already removed; eviction skips those.
    insertion_order: VecDeque<String>,
}

/// One rate-limited surface: `ratelimit:<prefix>:<client>`.
pub struct RateLimiter {
    prefix: String,
    window_ms: u64,
    max_requests: usize,
    kv: Arc<KvStore>,
    local: Mutex<LocalWindows>,
    sweep_scheduled: AtomicBool,
}

impl RateLimiter {
    pub fn new(prefix: impl Into<String>, config: RateLimitConfig, kv: Arc<KvStore>) -> Arc<Self> {
        Arc::new(Self {
            prefix: prefix.into(),
            window_ms: config.window_ms,
            max_requests: config.max_requests,
            kv,
            local: Mutex::new(LocalWindows {
                windows: HashMap::new(),
                insertion_order: VecDeque::new(),
            }),
            sweep_scheduled: AtomicBool::new(false),
        })
    }

    /// Records one request for `client_key` and decides whether it passes.
    pub async fn check(self: &Arc<Self>, client_key: &str) -> Decision {
        let key = format!("{RATELIMIT_KEY_PREFIX}{}:{}", self.prefix, client_key);

        let count = match self.kv.sliding_window_count(&key, self.window_ms).await {
            Some(count) => count,
            None => self.check_local(&key),
        };

        if count as usize > self.max_requests {
            Decision::Limited {
                retry_after_secs: self.window_ms.div_ceil(1000),
            }
        } else {
            Decision::Allowed
        }
    }

    /// In-process window with the same prune/insert/count semantics.
    fn check_local(self: &Arc<Self>, key: &str) -> u64 {
        self.ensure_sweep();
        let now = now_millis();
        let cutoff = now.saturating_sub(self.window_ms);

        let mut local = self.local.lock();
        if !local.windows.contains_key(key) {
            if local.windows.len() >= LIMITER_LOCAL_MAX_KEYS {
                Self::evict_oldest(&mut local);
            }
            local.insertion_order.push_back(key.to_string());
            local.windows.insert(key.to_string(), Vec::new());
        }
        let window = local.windows.get_mut(key).expect("inserted above");
        window.retain(|&ts| ts > cutoff);
        window.push(now);
        window.len() as u64
    }

    fn evict_oldest(local: &mut LocalWindows) {
        while local.windows.len() >= LIMITER_LOCAL_MAX_KEYS {
            let Some(oldest) = local.insertion_order.pop_front() else {
                return;
            };
            // Keys already removed by the sweep just fall through.
            local.windows.remove(&oldest);
        }
    }

    /// Starts the sweep ticker once per limiter.
    fn ensure_sweep(self: &Arc<Self>) {
        if self
            .sweep_scheduled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(LIMITER_SWEEP_SECS));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(limiter) = weak.upgrade() else { return };
                limiter.sweep_local();
            }
        });
    }

    /// Drops windows with no live timestamps.
    fn sweep_local(&self) {
        let cutoff = now_millis().saturating_sub(self.window_ms);
        let mut local = self.local.lock();
        local
            .windows
            .retain(|_, window| window.iter().any(|&ts| ts > cutoff));
    }

    #[cfg(test)]
    fn local_key_count(&self) -> usize {
        self.local.lock().windows.len()
    }
}

/// Extracts the client key for limiting: the first `X-Forwarded-For` hop
/// when the deployment trusts its proxy, else the peer address.
pub fn client_key(headers: &HeaderMap, peer: Option<SocketAddr>, trust_proxy: bool) -> String {
    if trust_proxy {
        if let Some(forwarded) = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            return forwarded.to_string();
        }
    }
    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(window_ms: u64, max_requests: usize) -> Arc<RateLimiter> {
        RateLimiter::new(
            "test",
            RateLimitConfig {
                window_ms,
                max_requests,
            },
            Arc::new(KvStore::in_memory()),
        )
    }

    #[tokio::test]
    async fn six_requests_in_window_allow_exactly_five() {
        let limiter = limiter(1000, 5);
        let mut allowed = 0;
        let mut limited = 0;
        for _ in 0..6 {
            match limiter.check("1.2.3.4").await {
                Decision::Allowed => allowed += 1,
                Decision::Limited { retry_after_secs } => {
                    limited += 1;
                    assert_eq!(retry_after_secs, 1);
                }
            }
        }
        assert_eq!(allowed, 5);
        assert_eq!(limited, 1);
    }

    #[tokio::test]
    async fn window_slides_after_expiry() {
        let limiter = limiter(100, 2);
        assert!(limiter.check("client").await.is_allowed());
        assert!(limiter.check("client").await.is_allowed());
        assert!(!limiter.check("client").await.is_allowed());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(limiter.check("client").await.is_allowed());
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let limiter = limiter(1000, 1);
        assert!(limiter.check("a").await.is_allowed());
        assert!(!limiter.check("a").await.is_allowed());
        assert!(limiter.check("b").await.is_allowed());
    }

    #[tokio::test]
    async fn retry_after_is_ceiling_of_window_seconds() {
        let limiter = limiter(1500, 0);
        match limiter.check("client").await {
            Decision::Limited { retry_after_secs } => assert_eq!(retry_after_secs, 2),
            Decision::Allowed => panic!("max=0 must always limit"),
        }
    }

    #[tokio::test]
    async fn local_map_evicts_oldest_keys_at_capacity() {
        let limiter = limiter(60_000, 5);
        for i in 0..(LIMITER_LOCAL_MAX_KEYS + 5) {
            limiter.check(&format!("client-{i}")).await;
        }
        assert!(limiter.local_key_count() <= LIMITER_LOCAL_MAX_KEYS);
        // The newest key survived eviction.
        let newest = format!(
            "{RATELIMIT_KEY_PREFIX}test:client-{}",
            LIMITER_LOCAL_MAX_KEYS + 4
        );
        assert!(limiter.local.lock().windows.contains_key(&newest));
    }

    #[tokio::test]
    async fn sweep_drops_empty_windows() {
        let limiter = limiter(50, 5);
        limiter.check("short-lived").await;
        assert_eq!(limiter.local_key_count(), 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        limiter.sweep_local();
        assert_eq!(limiter.local_key_count(), 0);
    }

    #[test]
    fn client_key_prefers_forwarded_header_when_trusted() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.9, 10.0.0.1".parse().unwrap());
        let peer: SocketAddr = "192.0.2.1:443".parse().unwrap();

        assert_eq!(client_key(&headers, Some(peer), true), "203.0.113.9");
        assert_eq!(client_key(&headers, Some(peer), false), "192.0.2.1");
        assert_eq!(client_key(&HeaderMap::new(), None, true), "unknown");
    }
}
