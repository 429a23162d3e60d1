use crate::gateway::GatewayInfoSource;
use crate::protocol::IdentifyProperties;
use crate::session::{InMemorySessionStore, SessionStore};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// How inbound frames are compressed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionMode {
    /// Plain JSON text frames
    #[default]
    None,
    /// Each binary frame is an independently inflatable zlib payload,
    /// negotiated through the Identify `compress` flag
    Payload,
    /// One persistent inflate context for the whole connection,
    /// negotiated through the `compress=zlib-stream` query parameter
    Transport,
}

/// Which shard ids this manager owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardIds {
    /// An explicit list of ids
    List(Vec<u32>),
    /// An inclusive range of ids
    Range { start: u32, end: u32 },
}

/// Configuration for the gateway manager and its shards.
pub struct GatewayConfig {
    /// Authentication token; may instead be provided once via
    /// `WebSocketManager::set_token`
    pub token: Option<String>,
    /// Event subscription bitfield sent in Identify
    pub intents: u64,
    /// Connection properties sent in Identify
    pub properties: IdentifyProperties,
    /// Member-list threshold sent in Identify, if any
    pub large_threshold: Option<u16>,
    /// Initial presence sent in Identify, if any
    pub presence: Option<Value>,
    /// Gateway protocol version for the `v` query parameter
    pub version: u16,
    /// Wire compression scheme to request
    pub compression: CompressionMode,
    /// Overrides the base URL from gateway information when set
    pub gateway_url: Option<String>,
    /// Shard ids to run; resolved from gateway information when `None`
    pub shard_ids: Option<ShardIds>,
    /// Total shard count; resolved from gateway information when `None`
    pub shard_count: Option<u32>,
    /// Bound on the wait for the Hello frame after the socket opens
    pub hello_timeout: Duration,
    /// Bound on the wait for READY/RESUMED after Identify/Resume
    pub ready_timeout: Duration,
    /// Pacing for automatic reconnection attempts
    pub backoff: BackoffConfig,
    /// Resume-state persistence
    pub session_store: Arc<dyn SessionStore>,
    /// Source of gateway metadata (in a full SDK, the REST client)
    pub info_source: Option<Arc<dyn GatewayInfoSource>>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            token: None,
            intents: 0,
            properties: IdentifyProperties::default(),
            large_threshold: None,
            presence: None,
            version: 10,
            compression: CompressionMode::default(),
            gateway_url: None,
            shard_ids: None,
            shard_count: None,
            hello_timeout: Duration::from_secs(60),
            ready_timeout: Duration::from_secs(15),
            backoff: BackoffConfig::default(),
            session_store: Arc::new(InMemorySessionStore::new()),
            info_source: None,
        }
    }
}

impl GatewayConfig {
    /// Create a new builder for configuration.
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder::default()
    }
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("intents", &self.intents)
            .field("version", &self.version)
            .field("compression", &self.compression)
            .field("shard_ids", &self.shard_ids)
            .field("shard_count", &self.shard_count)
            .finish_non_exhaustive()
    }
}

/// Builder for [`GatewayConfig`].
#[derive(Default)]
pub struct GatewayConfigBuilder {
    config: GatewayConfig,
}

impl GatewayConfigBuilder {
    /// Set the authentication token.
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.config.token = Some(token.into());
        self
    }

    /// Set the intents bitfield.
    pub fn intents(mut self, intents: u64) -> Self {
        self.config.intents = intents;
        self
    }

    /// Set the Identify connection properties.
    pub fn properties(mut self, properties: IdentifyProperties) -> Self {
        self.config.properties = properties;
        self
    }

    /// Set the large-guild threshold.
    pub fn large_threshold(mut self, threshold: u16) -> Self {
        self.config.large_threshold = Some(threshold);
        self
    }

    /// Set the initial presence.
    pub fn presence(mut self, presence: Value) -> Self {
        self.config.presence = Some(presence);
        self
    }

    /// Set the gateway protocol version.
    pub fn version(mut self, version: u16) -> Self {
        self.config.version = version;
        self
    }

    /// Set the wire compression scheme.
    pub fn compression(mut self, mode: CompressionMode) -> Self {
        self.config.compression = mode;
        self
    }

    /// Override the gateway base URL.
    pub fn gateway_url(mut self, url: impl Into<String>) -> Self {
        self.config.gateway_url = Some(url.into());
        self
    }

    /// Set the shard ids this manager owns.
    pub fn shard_ids(mut self, ids: ShardIds) -> Self {
        self.config.shard_ids = Some(ids);
        self
    }

    /// Set the total shard count.
    pub fn shard_count(mut self, count: u32) -> Self {
        self.config.shard_count = Some(count);
        self
    }

    /// Bound the wait for the Hello frame.
    pub fn hello_timeout(mut self, timeout: Duration) -> Self {
        self.config.hello_timeout = timeout;
        self
    }

    /// Bound the wait for READY/RESUMED.
    pub fn ready_timeout(mut self, timeout: Duration) -> Self {
        self.config.ready_timeout = timeout;
        self
    }

    /// Set reconnection backoff pacing.
    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.config.backoff = backoff;
        self
    }

    /// Set the session store.
    pub fn session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.config.session_store = store;
        self
    }

    /// Set the gateway metadata source. Required.
    pub fn info_source(mut self, source: Arc<dyn GatewayInfoSource>) -> Self {
        self.config.info_source = Some(source);
        self
    }

    /// Build the configuration with validation.
    pub fn build(self) -> Result<GatewayConfig, ConfigError> {
        let config = self.config;

        if config.info_source.is_none() {
            return Err(ConfigError::MissingInfoSource);
        }

        if let Some(token) = &config.token {
            if token.is_empty() {
                return Err(ConfigError::InvalidToken("token is empty".to_string()));
            }
        }

        if let Some(ShardIds::Range { start, end }) = &config.shard_ids {
            if start > end {
                return Err(ConfigError::InvalidShardIds(format!(
                    "range start {start} is greater than end {end}"
                )));
            }
        }

        if let (Some(ids), Some(count)) = (&config.shard_ids, config.shard_count) {
            let max = match ids {
                ShardIds::List(list) => list.iter().copied().max(),
                ShardIds::Range { end, .. } => Some(*end),
            };
            if let Some(max) = max {
                if max >= count {
                    return Err(ConfigError::InvalidShardIds(format!(
                        "shard id {max} is out of range for shard count {count}"
                    )));
                }
            }
        }

        if config.backoff.max_delay < config.backoff.initial_delay {
            return Err(ConfigError::InvalidBackoff(
                "max_delay must be >= initial_delay".to_string(),
            ));
        }

        if config.backoff.multiplier <= 0.0 {
            return Err(ConfigError::InvalidBackoff(
                "multiplier must be > 0".to_string(),
            ));
        }

        Ok(config)
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// No gateway metadata source was provided
    #[error("a gateway information source is required")]
    MissingInfoSource,
    /// Invalid token
    #[error("invalid token: {0}")]
    InvalidToken(String),
    /// Invalid shard id configuration
    #[error("invalid shard ids: {0}")]
    InvalidShardIds(String),
    /// Invalid backoff configuration
    #[error("invalid backoff configuration: {0}")]
    InvalidBackoff(String),
}

/// Backoff configuration for automatic reconnection
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Initial delay before the first reconnection attempt
    pub initial_delay: Duration,
    /// Maximum delay between reconnection attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (typically 2.0)
    pub multiplier: f64,
    /// Whether to add random jitter to delays
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true, // Full jitter recommended by AWS
        }
    }
}

impl BackoffConfig {
    /// Calculate the delay for a given attempt number (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay =
            self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        if self.jitter {
            // Full jitter: random value between 0 and capped_delay
            let jittered = rand::random::<f64>() * capped_delay;
            Duration::from_millis(jittered as u64)
        } else {
            Duration::from_millis(capped_delay as u64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::gateway::GatewayInformation;
    use async_trait::async_trait;

    struct NullSource;

    #[async_trait]
    impl GatewayInfoSource for NullSource {
        async fn fetch_gateway_information(&self) -> Result<GatewayInformation, Error> {
            Err(Error::GatewayInfo("unused".into()))
        }
    }

    fn builder() -> GatewayConfigBuilder {
        GatewayConfig::builder().info_source(Arc::new(NullSource))
    }

    #[test]
    fn test_builder_defaults() {
        let config = builder().token("tok").build().expect("valid config");
        assert_eq!(config.version, 10);
        assert_eq!(config.compression, CompressionMode::None);
        assert!(config.shard_ids.is_none());
    }

    #[test]
    fn test_info_source_required() {
        let result = GatewayConfig::builder().token("tok").build();
        assert!(matches!(result, Err(ConfigError::MissingInfoSource)));
    }

    #[test]
    fn test_rejects_empty_token() {
        let result = builder().token("").build();
        assert!(matches!(result, Err(ConfigError::InvalidToken(_))));
    }

    #[test]
    fn test_rejects_inverted_range() {
        let result = builder()
            .shard_ids(ShardIds::Range { start: 6, end: 3 })
            .build();
        assert!(matches!(result, Err(ConfigError::InvalidShardIds(_))));
    }

    #[test]
    fn test_rejects_id_out_of_count() {
        let result = builder()
            .shard_ids(ShardIds::List(vec![0, 5]))
            .shard_count(4)
            .build();
        assert!(matches!(result, Err(ConfigError::InvalidShardIds(_))));
    }

    #[test]
    fn test_backoff_delay_calculation() {
        let config = BackoffConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: false,
        };

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(400));

        // Should cap at max_delay
        assert_eq!(config.delay_for_attempt(12), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_with_jitter() {
        let config = BackoffConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        };

        // With jitter, delay is between 0 and the calculated delay
        for attempt in 0..5 {
            let delay = config.delay_for_attempt(attempt);
            let max_expected = Duration::from_millis((100.0 * 2.0_f64.powi(attempt as i32)) as u64);
            assert!(delay <= max_expected);
        }
    }
}
