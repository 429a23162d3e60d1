//! # ws-gateway
//!
//! A sharded gateway client for real-time event-streaming WebSocket
//! endpoints.
//!
//! ## Features
//!
//! - **Sharding** with explicit ids/ranges or the endpoint's recommendation
//! - **Identify throttling** honoring per-bucket spacing and the
//!   session-start quota
//! - **Session resumption** with pluggable persistence
//! - **Auto-reconnection** with exponential backoff and full jitter
//! - **Heartbeating** with zombie-connection detection
//! - **Transport and payload zlib compression**
//! - **Send rate limiting** with reserved heartbeat headroom
//!
//! ## Example
//!
//! ```ignore
//! use ws_gateway::{GatewayConfig, WebSocketManager};
//!
//! let config = GatewayConfig::builder()
//!     .token(std::env::var("TOKEN")?)
//!     .intents(513)
//!     .info_source(my_rest_client)
//!     .build()?;
//!
//! let (manager, mut events) = WebSocketManager::new(config);
//! manager.connect().await?;
//!
//! while let Some((shard_id, event)) = events.recv().await {
//!     println!("shard {shard_id}: {event:?}");
//! }
//! ```

mod compression;
mod config;
mod error;
mod events;
mod gateway;
mod manager;
mod protocol;
mod session;
mod shard;
mod strategy;
mod throttle;

pub use config::{
    BackoffConfig, CompressionMode, ConfigError, GatewayConfig, GatewayConfigBuilder, ShardIds,
};
pub use error::{Error, ErrorKind};
pub use events::{EventReceiver, EventSender, ShardEvent, ShardId};
pub use gateway::{GatewayInfoCache, GatewayInfoSource, GatewayInformation, SessionStartLimit};
pub use manager::{GatewayContext, WebSocketManager};
pub use protocol::{
    close_behavior, close_code_description, CloseBehavior, GatewayMessage, IdentifyPayload,
    IdentifyProperties, OpCode, ResumePayload, CLOSE_CODE_NORMAL, CLOSE_CODE_RESUMING,
};
pub use session::{InMemorySessionStore, SessionInfo, SessionStore};
pub use shard::{DestroyOptions, Recovery, ShardCommand, ShardStatus, WebSocketShard};
pub use strategy::{ShardingStrategy, SimpleShardingStrategy};
pub use throttle::{IdentifyThrottler, SimpleIdentifyThrottler};

/// Result type for ws-gateway operations
pub type Result<T> = std::result::Result<T, Error>;
