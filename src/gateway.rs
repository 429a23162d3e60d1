//! Remote gateway metadata and its TTL cache.

use crate::error::Error;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Floor applied to the cache TTL so a zero/near-zero `reset_after`
/// cannot turn every lookup into a remote fetch.
const MIN_CACHE_TTL: Duration = Duration::from_millis(5000);

/// Quota on Identify operations in a rolling window, shared across all
/// shards of one application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStartLimit {
    /// Total identifies allowed per window
    pub total: u32,
    /// Identifies remaining in the current window
    pub remaining: u32,
    /// Milliseconds until the window resets
    #[serde(rename = "reset_after")]
    pub reset_after_ms: u64,
    /// How many shards may identify concurrently
    pub max_concurrency: u32,
}

/// Metadata describing the remote event-streaming endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayInformation {
    /// Base WebSocket URL
    pub url: String,
    /// Shard count the endpoint recommends for this application
    #[serde(rename = "shards")]
    pub recommended_shards: u32,
    pub session_start_limit: SessionStartLimit,
}

/// Where gateway metadata comes from.
///
/// The default in a full SDK is the REST collaborator's gateway-info
/// endpoint; tests inject canned values.
#[async_trait]
pub trait GatewayInfoSource: Send + Sync {
    async fn fetch_gateway_information(&self) -> Result<GatewayInformation, Error>;
}

#[derive(Debug)]
struct CachedInfo {
    info: GatewayInformation,
    expires_at: Instant,
}

/// TTL cache over a [`GatewayInfoSource`].
///
/// A refresh replaces the cached value wholesale; readers never observe a
/// partially updated entry.
pub struct GatewayInfoCache {
    source: Arc<dyn GatewayInfoSource>,
    cached: Mutex<Option<CachedInfo>>,
}

impl GatewayInfoCache {
    pub fn new(source: Arc<dyn GatewayInfoSource>) -> Self {
        Self {
            source,
            cached: Mutex::new(None),
        }
    }

    /// Fetch gateway information, consulting the cache first.
    ///
    /// The entry expires after `session_start_limit.reset_after` (floored
    /// at 5000ms), or immediately when `force` is set.
    pub async fn fetch(&self, force: bool) -> Result<GatewayInformation, Error> {
        let mut cached = self.cached.lock().await;

        if !force {
            if let Some(entry) = cached.as_ref() {
                if Instant::now() < entry.expires_at {
                    return Ok(entry.info.clone());
                }
                debug!("gateway information cache expired");
            }
        }

        let info = self.source.fetch_gateway_information().await?;
        let ttl = Duration::from_millis(info.session_start_limit.reset_after_ms).max(MIN_CACHE_TTL);
        debug!(
            url = %info.url,
            recommended_shards = info.recommended_shards,
            ttl_ms = ttl.as_millis() as u64,
            "fetched gateway information"
        );
        *cached = Some(CachedInfo {
            info: info.clone(),
            expires_at: Instant::now() + ttl,
        });

        Ok(info)
    }
}

impl std::fmt::Debug for GatewayInfoCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayInfoCache").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingSource {
        calls: AtomicU32,
        reset_after_ms: u64,
    }

    #[async_trait]
    impl GatewayInfoSource for CountingSource {
        async fn fetch_gateway_information(&self) -> Result<GatewayInformation, Error> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(GatewayInformation {
                url: format!("wss://gateway.example/{call}"),
                recommended_shards: 2,
                session_start_limit: SessionStartLimit {
                    total: 1000,
                    remaining: 999,
                    reset_after_ms: self.reset_after_ms,
                    max_concurrency: 1,
                },
            })
        }
    }

    fn cache(reset_after_ms: u64) -> (GatewayInfoCache, Arc<CountingSource>) {
        let source = Arc::new(CountingSource {
            calls: AtomicU32::new(0),
            reset_after_ms,
        });
        (GatewayInfoCache::new(source.clone()), source)
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_within_ttl() {
        let (cache, source) = cache(60_000);

        let first = cache.fetch(false).await.unwrap();
        let second = cache.fetch(false).await.unwrap();
        assert_eq!(first.url, second.url);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expires_after_reset_window() {
        let (cache, source) = cache(10_000);

        cache.fetch(false).await.unwrap();
        tokio::time::advance(Duration::from_millis(10_001)).await;
        let refreshed = cache.fetch(false).await.unwrap();

        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert_eq!(refreshed.url, "wss://gateway.example/1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_floor_applies() {
        // reset_after below the floor must not expire before 5000ms
        let (cache, source) = cache(1);

        cache.fetch(false).await.unwrap();
        tokio::time::advance(Duration::from_millis(3_000)).await;
        cache.fetch(false).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_millis(2_001)).await;
        cache.fetch(false).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_refresh() {
        let (cache, source) = cache(60_000);

        cache.fetch(false).await.unwrap();
        cache.fetch(true).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }
}
