//! Identify pacing across the whole shard fleet.

use crate::error::Error;
use crate::gateway::GatewayInfoCache;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::debug;

/// Minimum spacing between two identifies sharing a rate bucket.
const IDENTIFY_SPACING: Duration = Duration::from_secs(5);

/// Gate consulted immediately before every Identify send.
///
/// Blocks the caller until the endpoint's concurrent-identify limit
/// (`max_concurrency`) and the rolling session-start window both permit
/// it. Implementations must serialize across all shards of one
/// application, even across process boundaries when the sharding strategy
/// is distributed.
#[async_trait]
pub trait IdentifyThrottler: Send + Sync {
    /// Suspend until the given shard may send Identify.
    async fn wait_for_identify(&self, shard_id: u32) -> Result<(), Error>;
}

/// Default single-process throttler.
///
/// Shards are assigned to `shard_id % max_concurrency` buckets; identifies
/// within one bucket are spaced at least five seconds apart, while
/// different buckets proceed independently.
pub struct SimpleIdentifyThrottler {
    info: Arc<GatewayInfoCache>,
    /// Earliest next-identify instant per bucket
    buckets: Mutex<HashMap<u32, Instant>>,
}

impl SimpleIdentifyThrottler {
    pub fn new(info: Arc<GatewayInfoCache>) -> Self {
        Self {
            info,
            buckets: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl IdentifyThrottler for SimpleIdentifyThrottler {
    async fn wait_for_identify(&self, shard_id: u32) -> Result<(), Error> {
        let mut info = self.info.fetch(false).await?;

        // Rolling window exhausted: wait it out, then re-read the quota.
        while info.session_start_limit.remaining == 0 {
            let reset_after = Duration::from_millis(info.session_start_limit.reset_after_ms);
            debug!(
                shard_id,
                reset_after_ms = reset_after.as_millis() as u64,
                "session start limit exhausted, waiting for window reset"
            );
            tokio::time::sleep(reset_after).await;
            info = self.info.fetch(true).await?;
        }

        let max_concurrency = info.session_start_limit.max_concurrency.max(1);
        let bucket = shard_id % max_concurrency;

        // The lock is held across the sleep on purpose: it is what
        // serializes identifies within a bucket.
        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();
        let ready_at = buckets.get(&bucket).copied().unwrap_or(now);

        if ready_at > now {
            debug!(
                shard_id,
                bucket,
                wait_ms = (ready_at - now).as_millis() as u64,
                "identify throttled"
            );
            sleep_until(ready_at).await;
        }

        buckets.insert(bucket, Instant::now() + IDENTIFY_SPACING);
        Ok(())
    }
}
