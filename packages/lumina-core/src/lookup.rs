//! Outbound lookup collaborators: recording search and video search.
//!
//! Plain HTTP requests with substrate-backed caching. The video path charges
//! a daily quota counter before going to the wire; the counter outlives the
//! day it tracks so it can still be inspected, then expires on its own.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::error::{LuminaError, LuminaResult};
use crate::kv::KvStore;
use crate::protocol_constants::{
    LOOKUP_CACHE_TTL_SECS, QUOTA_TTL_SECS, YOUTUBE_DAILY_QUOTA, YOUTUBE_SEARCH_COST,
};

const MUSICBRAINZ_ENDPOINT: &str = "https://musicbrainz.org/ws/2/recording";
const YOUTUBE_ENDPOINT: &str = "https://www.googleapis.com/youtube/v3/search";
const USER_AGENT: &str = concat!("lumina-relay/", env!("CARGO_PKG_VERSION"));

fn search_cache_key(query: &str) -> String {
    format!("cache:search:{query}")
}

fn video_cache_key(query: &str) -> String {
    format!("cache:video:{query}")
}

/// Daily quota counter key, e.g. `quota:youtube:2026-08-01`.
fn quota_key_today() -> String {
    format!("quota:youtube:{}", Utc::now().format("%Y-%m-%d"))
}

/// Cached outbound lookups shared by every relay process.
pub struct LookupService {
    kv: Arc<KvStore>,
    http: reqwest::Client,
    youtube_api_key: Option<String>,
}

impl LookupService {
    pub fn new(kv: Arc<KvStore>, youtube_api_key: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            kv,
            http,
            youtube_api_key,
        }
    }

    /// MusicBrainz recording search, cached for a day.
    pub async fn search_recordings(&self, query: &str) -> LuminaResult<serde_json::Value> {
        let cache_key = search_cache_key(query);
        if let Some(hit) = self.cached(&cache_key).await {
            return Ok(hit);
        }

        let response = self
            .http
            .get(MUSICBRAINZ_ENDPOINT)
            .query(&[("query", query), ("fmt", "json"), ("limit", "10")])
            .send()
            .await?
            .error_for_status()?;
        let body: serde_json::Value = response.json().await?;

        self.store(&cache_key, &body).await;
        Ok(body)
    }

    /// YouTube video search, quota-charged and cached for a day.
    ///
    /// Cache hits are free; only wire calls consume quota.
    pub async fn search_video(&self, query: &str) -> LuminaResult<serde_json::Value> {
        let cache_key = video_cache_key(query);
        if let Some(hit) = self.cached(&cache_key).await {
            return Ok(hit);
        }

        let Some(api_key) = &self.youtube_api_key else {
            return Err(LuminaError::Configuration(
                "video search requires a YouTube API key".to_string(),
            ));
        };

        let calls = self.kv.incr(&quota_key_today(), QUOTA_TTL_SECS).await;
        if calls * YOUTUBE_SEARCH_COST > YOUTUBE_DAILY_QUOTA {
            log::warn!("[Lookup] YouTube quota exhausted ({} calls today)", calls);
            return Err(LuminaError::QuotaExceeded(
                "YouTube search budget spent for today".to_string(),
            ));
        }

        let response = self
            .http
            .get(YOUTUBE_ENDPOINT)
            .query(&[
                ("part", "snippet"),
                ("type", "video"),
                ("maxResults", "10"),
                ("q", query),
                ("key", api_key.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?;
        let body: serde_json::Value = response.json().await?;

        self.store(&cache_key, &body).await;
        Ok(body)
    }

    async fn cached(&self, key: &str) -> Option<serde_json::Value> {
        let raw = self.kv.get(key).await?;
        serde_json::from_str(&raw).ok()
    }

    async fn store(&self, key: &str, value: &serde_json::Value) {
        if let Ok(raw) = serde_json::to_string(value) {
            self.kv.set(key, &raw, LOOKUP_CACHE_TTL_SECS).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn quota_key_carries_the_date() {
        let key = quota_key_today();
        assert!(key.starts_with("quota:youtube:"));
        // yyyy-mm-dd
        assert_eq!(key.len(), "quota:youtube:".len() + 10);
    }

    #[tokio::test]
    async fn cached_search_skips_the_wire() {
        let kv = Arc::new(KvStore::in_memory());
        let cached = json!({"recordings": [{"title": "Aurora"}]});
        kv.set(
            &search_cache_key("aurora"),
            &cached.to_string(),
            LOOKUP_CACHE_TTL_SECS,
        )
        .await;

        let service = LookupService::new(Arc::clone(&kv), None);
        let result = service.search_recordings("aurora").await.unwrap();
        assert_eq!(result, cached);
    }

    #[tokio::test]
    async fn video_search_without_key_is_a_configuration_error() {
        let service = LookupService::new(Arc::new(KvStore::in_memory()), None);
        let result = service.search_video("aurora").await;
        assert!(matches!(result, Err(LuminaError::Configuration(_))));
    }

    #[tokio::test]
    async fn cached_video_needs_no_key_and_no_quota() {
        let kv = Arc::new(KvStore::in_memory());
        let cached = json!({"items": []});
        kv.set(
            &video_cache_key("aurora"),
            &cached.to_string(),
            LOOKUP_CACHE_TTL_SECS,
        )
        .await;

        let service = LookupService::new(Arc::clone(&kv), None);
        let result = service.search_video("aurora").await.unwrap();
        assert_eq!(result, cached);
    }

    #[tokio::test]
    async fn exhausted_quota_refuses_before_the_wire() {
        let kv = Arc::new(KvStore::in_memory());
        let quota_key = quota_key_today();
        // Burn the whole daily budget.
        for _ in 0..(YOUTUBE_DAILY_QUOTA / YOUTUBE_SEARCH_COST) {
            kv.incr(&quota_key, QUOTA_TTL_SECS).await;
        }

        let service = LookupService::new(Arc::clone(&kv), Some("key".to_string()));
        let result = service.search_video("uncached query").await;
        assert!(matches!(result, Err(LuminaError::QuotaExceeded(_))));
    }
}
