use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Metrics for a rate limiter
///
/// Use `snapshot()` to get a point-in-time view of all counters, or the
/// individual getters.
///
/// # Example
/// ```ignore
/// let metrics = limiter.metrics();
///
/// println!("Queued: {}", metrics.requests_queued());
/// println!("429s: {}", metrics.rate_limited());
///
/// let snapshot = metrics.snapshot();
/// ```
#[derive(Debug, Default)]
pub struct LimiterMetrics {
    requests_admitted_total: AtomicU64,
    requests_queued_total: AtomicU64,
    requests_replayed_total: AtomicU64,
    rate_limited_total: AtomicU64,
    transport_errors_total: AtomicU64,
    bucket_resets_total: AtomicU64,
}

impl LimiterMetrics {
    /// Create a new LimiterMetrics instance
    pub fn new() -> Self {
        Self::default()
    }

    // ========== Getters ==========

    /// Get total requests admitted against a bucket (including replays)
    pub fn requests_admitted(&self) -> u64 {
        self.requests_admitted_total.load(Ordering::Relaxed)
    }

    /// Get total requests queued behind an exhausted bucket
    pub fn requests_queued(&self) -> u64 {
        self.requests_queued_total.load(Ordering::Relaxed)
    }

    /// Get total queued requests replayed after a reset
    pub fn requests_replayed(&self) -> u64 {
        self.requests_replayed_total.load(Ordering::Relaxed)
    }

    /// Get total 429 responses
    pub fn rate_limited(&self) -> u64 {
        self.rate_limited_total.load(Ordering::Relaxed)
    }

    /// Get total transport failures
    pub fn transport_errors(&self) -> u64 {
        self.transport_errors_total.load(Ordering::Relaxed)
    }

    /// Get total bucket resets fired
    pub fn bucket_resets(&self) -> u64 {
        self.bucket_resets_total.load(Ordering::Relaxed)
    }

    // ========== Recording methods (called internally) ==========

    pub(crate) fn record_admitted(&self) {
        self.requests_admitted_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_queued(&self) {
        self.requests_queued_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_replayed(&self, count: usize) {
        self.requests_replayed_total
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_rate_limited(&self) {
        self.rate_limited_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transport_error(&self) {
        self.transport_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_bucket_reset(&self) {
        self.bucket_resets_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a point-in-time snapshot of all counters for export
    pub fn snapshot(&self) -> LimiterMetricsSnapshot {
        LimiterMetricsSnapshot {
            requests_admitted_total: self.requests_admitted_total.load(Ordering::Acquire),
            requests_queued_total: self.requests_queued_total.load(Ordering::Acquire),
            requests_replayed_total: self.requests_replayed_total.load(Ordering::Acquire),
            rate_limited_total: self.rate_limited_total.load(Ordering::Acquire),
            transport_errors_total: self.transport_errors_total.load(Ordering::Acquire),
            bucket_resets_total: self.bucket_resets_total.load(Ordering::Acquire),
        }
    }
}

/// A point-in-time snapshot of rate limiter metrics
#[derive(Debug, Clone)]
pub struct LimiterMetricsSnapshot {
    pub requests_admitted_total: u64,
    pub requests_queued_total: u64,
    pub requests_replayed_total: u64,
    pub rate_limited_total: u64,
    pub transport_errors_total: u64,
    pub bucket_resets_total: u64,
}

/// Metrics for a shard manager
#[derive(Debug, Default)]
pub struct ManagerMetrics {
    shard_connects_total: AtomicU64,
    shard_connect_failures_total: AtomicU64,
    manager_connected_total: AtomicU64,
    manager_disconnected_total: AtomicU64,

    /// Per-shard metrics, ordered by shard index
    shard_metrics: RwLock<Vec<ShardMetrics>>,
}

/// Metrics for a single shard
#[derive(Debug, Clone, Default)]
pub struct ShardMetrics {
    /// Shard index
    pub shard_index: usize,
    /// Whether the shard last reported itself connected
    pub is_connected: bool,
    /// Connect calls issued to this shard
    pub connect_attempts: u32,
    /// Duration since the shard last reported connected (None if never)
    pub time_since_connected: Option<Duration>,
    #[doc(hidden)]
    pub(crate) last_connected_at: Option<Instant>,
}

impl ShardMetrics {
    fn snapshot(&self) -> ShardMetrics {
        ShardMetrics {
            time_since_connected: self.last_connected_at.map(|t| t.elapsed()),
            ..self.clone()
        }
    }
}

impl ManagerMetrics {
    /// Create a new ManagerMetrics instance
    pub fn new() -> Self {
        Self::default()
    }

    // ========== Getters ==========

    /// Get total shard connects issued
    pub fn shard_connects(&self) -> u64 {
        self.shard_connects_total.load(Ordering::Relaxed)
    }

    /// Get total shard connects that returned an error
    pub fn shard_connect_failures(&self) -> u64 {
        self.shard_connect_failures_total.load(Ordering::Relaxed)
    }

    /// Get total "manager connected" notifications
    pub fn manager_connected(&self) -> u64 {
        self.manager_connected_total.load(Ordering::Relaxed)
    }

    /// Get total "manager disconnected" notifications
    pub fn manager_disconnected(&self) -> u64 {
        self.manager_disconnected_total.load(Ordering::Relaxed)
    }

    // ========== Recording methods (called internally) ==========

    pub(crate) fn record_shard_connect(&self, shard_index: usize) {
        self.shard_connects_total.fetch_add(1, Ordering::Relaxed);
        self.update_shard(shard_index, |s| s.connect_attempts += 1);
    }

    pub(crate) fn record_shard_connect_failed(&self) {
        self.shard_connect_failures_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_manager_connected(&self) {
        self.manager_connected_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_manager_disconnected(&self) {
        self.manager_disconnected_total
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Update metrics for a specific shard, creating its entry on first use
    pub(crate) fn update_shard(&self, shard_index: usize, update_fn: impl FnOnce(&mut ShardMetrics)) {
        let mut shards = self.shard_metrics.write();

        let position = match shards.binary_search_by_key(&shard_index, |s| s.shard_index) {
            Ok(position) => position,
            Err(position) => {
                shards.insert(
                    position,
                    ShardMetrics {
                        shard_index,
                        ..Default::default()
                    },
                );
                position
            }
        };

        update_fn(&mut shards[position]);
    }

    /// Drop all per-shard entries (the shard set was rebuilt)
    pub(crate) fn clear_shards(&self) {
        self.shard_metrics.write().clear();
    }

    /// Get a snapshot of all shard metrics with computed durations
    pub fn shard_metrics(&self) -> Vec<ShardMetrics> {
        self.shard_metrics.read().iter().map(|s| s.snapshot()).collect()
    }

    /// Get current count of shards reporting connected
    pub fn connected_shards(&self) -> usize {
        self.shard_metrics
            .read()
            .iter()
            .filter(|s| s.is_connected)
            .count()
    }

    /// Get a point-in-time snapshot of all metrics for export
    pub fn snapshot(&self) -> ManagerMetricsSnapshot {
        let shards = self.shard_metrics();

        ManagerMetricsSnapshot {
            shard_connects_total: self.shard_connects_total.load(Ordering::Acquire),
            shard_connect_failures_total: self.shard_connect_failures_total.load(Ordering::Acquire),
            manager_connected_total: self.manager_connected_total.load(Ordering::Acquire),
            manager_disconnected_total: self.manager_disconnected_total.load(Ordering::Acquire),
            connected_shards: shards.iter().filter(|s| s.is_connected).count(),
            shards,
        }
    }
}

/// A point-in-time snapshot of shard manager metrics
#[derive(Debug, Clone)]
pub struct ManagerMetricsSnapshot {
    pub shard_connects_total: u64,
    pub shard_connect_failures_total: u64,
    pub manager_connected_total: u64,
    pub manager_disconnected_total: u64,
    pub connected_shards: usize,
    pub shards: Vec<ShardMetrics>,
}
