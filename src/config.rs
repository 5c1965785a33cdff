use std::time::Duration;

/// Configuration for the rate limiter
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Limit assigned to a bucket before the server has reported one
    pub default_limit: u32,
    /// Window assigned to a bucket before the server has reported a reset time
    pub default_window: Duration,
    /// Reset delay applied to a 429 that carries neither quota headers nor `retry-after`
    pub retry_after_fallback: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            default_limit: 1,
            default_window: Duration::from_secs(3),
            retry_after_fallback: Duration::from_secs(1),
        }
    }
}

impl RateLimiterConfig {
    /// Create a new builder for configuration
    pub fn builder() -> RateLimiterConfigBuilder {
        RateLimiterConfigBuilder::default()
    }
}

/// Builder for RateLimiterConfig
#[derive(Debug, Clone, Default)]
pub struct RateLimiterConfigBuilder {
    config: RateLimiterConfig,
}

impl RateLimiterConfigBuilder {
    /// Set the bootstrap limit for unseen buckets
    pub fn default_limit(mut self, limit: u32) -> Self {
        self.config.default_limit = limit;
        self
    }

    /// Set the bootstrap window for unseen buckets
    pub fn default_window(mut self, window: Duration) -> Self {
        self.config.default_window = window;
        self
    }

    /// Set the fallback delay used for bare 429 responses
    pub fn retry_after_fallback(mut self, delay: Duration) -> Self {
        self.config.retry_after_fallback = delay;
        self
    }

    /// Build the configuration with validation.
    ///
    /// Returns an error if `default_limit` is 0, since such a bucket could
    /// never admit the request that teaches it the real limits.
    pub fn build(self) -> Result<RateLimiterConfig, ConfigError> {
        if self.config.default_limit == 0 {
            return Err(ConfigError::InvalidLimit(
                "default_limit cannot be 0".to_string(),
            ));
        }

        if self.config.retry_after_fallback.is_zero() {
            return Err(ConfigError::InvalidDuration(
                "retry_after_fallback must be > 0".to_string(),
            ));
        }

        Ok(self.config)
    }
}

/// Configuration for the shard manager
#[derive(Debug, Clone)]
pub struct ShardManagerConfig {
    /// Pause between successive shard connects.
    ///
    /// The gateway limits how often a session may be identified, independently
    /// of the REST quotas.
    pub connect_stagger: Duration,
}

impl Default for ShardManagerConfig {
    fn default() -> Self {
        Self {
            connect_stagger: Duration::from_secs(5),
        }
    }
}

impl ShardManagerConfig {
    /// Create a new builder for configuration
    pub fn builder() -> ShardManagerConfigBuilder {
        ShardManagerConfigBuilder::default()
    }
}

/// Builder for ShardManagerConfig
#[derive(Debug, Clone, Default)]
pub struct ShardManagerConfigBuilder {
    config: ShardManagerConfig,
}

impl ShardManagerConfigBuilder {
    /// Set the delay between successive shard connects
    pub fn connect_stagger(mut self, stagger: Duration) -> Self {
        self.config.connect_stagger = stagger;
        self
    }

    /// Build the configuration.
    ///
    /// A zero stagger is accepted; it is mostly useful against local gateways.
    pub fn build(self) -> Result<ShardManagerConfig, ConfigError> {
        Ok(self.config)
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// Invalid bucket limit
    #[error("Invalid limit: {0}")]
    InvalidLimit(String),
    /// Invalid duration
    #[error("Invalid duration: {0}")]
    InvalidDuration(String),
}
