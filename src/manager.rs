//! The manager: owns the shard fleet and the state shared across it.

use crate::config::{GatewayConfig, ShardIds};
use crate::error::Error;
use crate::events::{channel, EventReceiver, EventSender};
use crate::gateway::{GatewayInfoCache, GatewayInfoSource, GatewayInformation};
use crate::protocol::GatewayMessage;
use crate::session::SessionStore;
use crate::shard::{DestroyOptions, ShardStatus};
use crate::strategy::{ShardingStrategy, SimpleShardingStrategy};
use crate::throttle::{IdentifyThrottler, SimpleIdentifyThrottler};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// State shared by the manager and every shard it owns.
///
/// Shards hold an `Arc` to this and reach through it for configuration,
/// the token, gateway metadata, identify pacing, session persistence,
/// and event emission.
pub struct GatewayContext {
    config: GatewayConfig,
    /// TTL-cached gateway metadata
    pub info: Arc<GatewayInfoCache>,
    /// Identify pacing shared by the whole fleet
    pub throttler: Arc<dyn IdentifyThrottler>,
    /// Emission half of the consumer event channel
    pub event_tx: EventSender,
    token: RwLock<Option<String>>,
    /// Resolved fleet-wide shard count; set by the manager before spawn
    shard_count: AtomicU32,
}

impl GatewayContext {
    fn new(
        config: GatewayConfig,
        info: Arc<GatewayInfoCache>,
        throttler: Arc<dyn IdentifyThrottler>,
        event_tx: EventSender,
    ) -> Self {
        let token = config.token.clone();
        Self {
            config,
            info,
            throttler,
            event_tx,
            token: RwLock::new(token),
            shard_count: AtomicU32::new(1),
        }
    }

    /// The immutable configuration.
    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// The session persistence backend.
    #[must_use]
    pub fn session_store(&self) -> &Arc<dyn SessionStore> {
        &self.config.session_store
    }

    /// The current token, if one has been set.
    #[must_use]
    pub fn token(&self) -> Option<String> {
        self.token.read().clone()
    }

    /// Set the token. Write-once: a second set is rejected.
    pub(crate) fn set_token(&self, token: String) -> Result<(), Error> {
        let mut slot = self.token.write();
        if slot.is_some() {
            return Err(Error::TokenAlreadySet);
        }
        *slot = Some(token);
        Ok(())
    }

    /// The resolved fleet-wide shard count.
    #[must_use]
    pub fn shard_count(&self) -> u32 {
        self.shard_count.load(Ordering::Acquire)
    }

    fn set_shard_count(&self, count: u32) {
        self.shard_count.store(count, Ordering::Release);
    }
}

impl std::fmt::Debug for GatewayContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayContext")
            .field("config", &self.config)
            .field("shard_count", &self.shard_count())
            .finish_non_exhaustive()
    }
}

/// Stand-in for configs assembled without an info source.
struct NoInfoSource;

#[async_trait]
impl GatewayInfoSource for NoInfoSource {
    async fn fetch_gateway_information(&self) -> Result<GatewayInformation, Error> {
        Err(Error::GatewayInfo(
            "no gateway information source configured".to_string(),
        ))
    }
}

/// The resolved shard plan, cached between gateway-info refreshes.
#[derive(Debug, Default)]
struct ShardPlan {
    ids: Option<Vec<u32>>,
    count_override: Option<u32>,
}

/// Orchestrates a fleet of gateway shards.
///
/// Resolves which shards to run (explicit configuration or the
/// endpoint's recommendation), spawns them through the sharding
/// strategy, and fans lifecycle operations out to them. Consumer-facing
/// events arrive on the [`EventReceiver`] returned at construction.
pub struct WebSocketManager {
    ctx: Arc<GatewayContext>,
    strategy: Box<dyn ShardingStrategy>,
    plan: Mutex<ShardPlan>,
}

impl WebSocketManager {
    /// Create a manager with the default in-process strategy and
    /// throttler.
    pub fn new(config: GatewayConfig) -> (Self, EventReceiver) {
        Self::with_collaborators(
            config,
            |info| -> Arc<dyn IdentifyThrottler> { Arc::new(SimpleIdentifyThrottler::new(info)) },
            |ctx| -> Box<dyn ShardingStrategy> { Box::new(SimpleShardingStrategy::new(ctx)) },
        )
    }

    /// Create a manager with custom collaborators.
    ///
    /// `throttler` receives the shared gateway-info cache; `strategy`
    /// receives the shared context.
    pub fn with_collaborators<T, S>(config: GatewayConfig, throttler: T, strategy: S) -> (Self, EventReceiver)
    where
        T: FnOnce(Arc<GatewayInfoCache>) -> Arc<dyn IdentifyThrottler>,
        S: FnOnce(Arc<GatewayContext>) -> Box<dyn ShardingStrategy>,
    {
        // The builder validates this; a hand-assembled config without a
        // source fails on first fetch instead of panicking here.
        let source = config
            .info_source
            .clone()
            .unwrap_or_else(|| Arc::new(NoInfoSource));
        let info = Arc::new(GatewayInfoCache::new(source));
        let throttler = throttler(Arc::clone(&info));
        let (event_tx, event_rx) = channel();

        let ctx = Arc::new(GatewayContext::new(config, info, throttler, event_tx));
        let strategy = strategy(Arc::clone(&ctx));

        (
            Self {
                ctx,
                strategy,
                plan: Mutex::new(ShardPlan::default()),
            },
            event_rx,
        )
    }

    /// The shared context.
    #[must_use]
    pub fn context(&self) -> &Arc<GatewayContext> {
        &self.ctx
    }

    /// Set the token after construction. Write-once.
    pub fn set_token(&self, token: impl Into<String>) -> Result<(), Error> {
        self.ctx.set_token(token.into())
    }

    /// Fetch gateway metadata, consulting the TTL cache unless `force`.
    pub async fn fetch_gateway_information(
        &self,
        force: bool,
    ) -> Result<GatewayInformation, Error> {
        self.ctx.info.fetch(force).await
    }

    /// The total shard count: explicit override, then configuration,
    /// then the endpoint's recommendation.
    pub async fn get_shard_count(&self) -> Result<u32, Error> {
        let plan = self.plan.lock().await;
        self.resolve_shard_count(&plan).await
    }

    async fn resolve_shard_count(&self, plan: &ShardPlan) -> Result<u32, Error> {
        if let Some(count) = plan.count_override {
            return Ok(count);
        }
        if let Some(count) = self.ctx.config().shard_count {
            return Ok(count);
        }
        Ok(self.ctx.info.fetch(false).await?.recommended_shards)
    }

    /// The shard ids this manager owns, cached after first resolution
    /// unless `force`.
    pub async fn get_shard_ids(&self, force: bool) -> Result<Vec<u32>, Error> {
        let mut plan = self.plan.lock().await;
        if !force {
            if let Some(ids) = &plan.ids {
                return Ok(ids.clone());
            }
        }

        let count = self.resolve_shard_count(&plan).await?;
        let ids = resolve_shard_ids(self.ctx.config().shard_ids.as_ref(), count)?;
        plan.ids = Some(ids.clone());
        Ok(ids)
    }

    /// Destroy the current fleet and respawn it against a new total
    /// shard count. Does not reconnect; call [`connect`](Self::connect).
    pub async fn update_shard_count(&self, count: u32) -> Result<Vec<u32>, Error> {
        self.strategy.destroy(DestroyOptions::default()).await?;

        let mut plan = self.plan.lock().await;
        plan.count_override = Some(count);
        let ids = resolve_shard_ids(self.ctx.config().shard_ids.as_ref(), count)?;
        plan.ids = Some(ids.clone());
        drop(plan);

        self.ctx.set_shard_count(count);
        self.strategy.spawn(&ids).await?;
        Ok(ids)
    }

    /// Resolve the shard plan, spawn the fleet, and connect every shard.
    ///
    /// Fails fast (before any socket is opened) when the identify quota
    /// cannot cover the whole fleet.
    pub async fn connect(&self) -> Result<(), Error> {
        if self.ctx.token().is_none() {
            return Err(Error::MissingToken);
        }

        let count = self.get_shard_count().await?;
        self.ctx.set_shard_count(count);
        let ids = self.get_shard_ids(false).await?;

        let info = self.ctx.info.fetch(false).await?;
        let required = ids.len() as u32;
        if info.session_start_limit.remaining < required {
            return Err(Error::InsufficientSessionStarts {
                remaining: info.session_start_limit.remaining,
                required,
                reset_after_ms: info.session_start_limit.reset_after_ms,
            });
        }

        info!(
            "Connecting {} shard(s) of {} total",
            ids.len(),
            count
        );
        self.strategy.spawn(&ids).await?;
        self.strategy.connect().await
    }

    /// Route a payload to one shard.
    pub async fn send(&self, shard_id: u32, message: GatewayMessage) -> Result<(), Error> {
        self.strategy.send(shard_id, message).await
    }

    /// Destroy every shard.
    pub async fn destroy(&self, options: DestroyOptions) -> Result<(), Error> {
        self.strategy.destroy(options).await
    }

    /// Snapshot the status of every shard.
    pub async fn fetch_status(&self) -> Result<HashMap<u32, ShardStatus>, Error> {
        self.strategy.fetch_status().await
    }
}

/// Expand configured shard ids against a total count.
fn resolve_shard_ids(configured: Option<&ShardIds>, count: u32) -> Result<Vec<u32>, Error> {
    let ids = match configured {
        Some(ShardIds::List(list)) => list.clone(),
        Some(ShardIds::Range { start, end }) => (*start..=*end).collect(),
        None => (0..count).collect(),
    };

    if let Some(&max) = ids.iter().max() {
        if max >= count {
            return Err(Error::UnknownShard { id: max });
        }
    }

    Ok(ids)
}
