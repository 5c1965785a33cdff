//! # gateway-flow
//!
//! Traffic control for a chat-platform API client: per-endpoint REST rate
//! limiting and a gateway shard manager.
//!
//! ## Features
//!
//! - **Per-route buckets** keyed by major parameter and endpoint shape
//! - **Server-driven quotas** learned from `x-ratelimit-*` response headers
//! - **FIFO replay** of requests queued behind an exhausted bucket
//! - **429 handling** - rate-limited requests are re-queued, never surfaced
//! - **Staggered shard connects** with a configurable delay between shards
//! - **Aggregate lifecycle** - one connected/disconnected notification per cycle
//! - **Metrics** for observability
//!
//! ## Example
//!
//! ```ignore
//! use gateway_flow::{RateLimitKey, RateLimiter, RateLimiterConfig};
//!
//! let limiter = RateLimiter::new(RateLimiterConfig::default(), MyTransport::new());
//! let key = RateLimitKey::from_route("/channels/1234/messages");
//!
//! let response = limiter.send(request, &key).await?;
//! ```

mod bucket;
mod config;
mod delegate;
mod error;
mod headers;
mod key;
mod limiter;
mod manager;
mod metrics;
mod shard;
mod transport;

pub use bucket::{BucketSnapshot, BucketState, RateLimitBucket};
pub use config::{
    ConfigError, RateLimiterConfig, RateLimiterConfigBuilder, ShardManagerConfig,
    ShardManagerConfigBuilder,
};
pub use delegate::{DisconnectReason, ManagerDelegate};
pub use error::{Error, ErrorKind, TransportError};
pub use headers::{retry_after, QuotaHeaders, LIMIT_HEADER, REMAINING_HEADER, RESET_HEADER};
pub use key::{RateLimitKey, RateLimited, UrlParts};
pub use limiter::{RateLimiter, ResponseCallback};
pub use manager::{ManagerState, ShardManager};
pub use metrics::{
    LimiterMetrics, LimiterMetricsSnapshot, ManagerMetrics, ManagerMetricsSnapshot, ShardMetrics,
};
pub use shard::{Shard, ShardFactory, ShardInfo, ShardSignals};
pub use transport::{HttpResponse, Transport};

// Re-export http types used by `Transport` implementations
pub use http::{HeaderMap, HeaderValue, StatusCode};

/// Result type for gateway-flow operations
pub type Result<T> = std::result::Result<T, Error>;
