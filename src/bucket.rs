use crate::headers::QuotaHeaders;
use std::collections::VecDeque;
use tokio::time::{Duration, Instant};

/// Observable state of a bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketState {
    /// Quota left in the current window
    Open,
    /// Quota exhausted and no reset timer armed yet
    Throttled,
    /// Reset timer armed
    ResetPending,
}

/// Quota state and pending queue for one rate-limit key.
///
/// The bucket itself is passive: it decides and records, while the owning
/// limiter performs dispatch and timer scheduling.
#[derive(Debug)]
pub struct RateLimitBucket<P> {
    limit: u32,
    remaining: u32,
    reset_at: Instant,
    pending: VecDeque<P>,
    reset_scheduled: bool,
}

impl<P> RateLimitBucket<P> {
    /// Create a bucket with provisional limits, used until the server reports real ones.
    pub fn new(limit: u32, window: Duration) -> Self {
        let limit = limit.max(1);
        Self {
            limit,
            remaining: limit,
            reset_at: Instant::now() + window,
            pending: VecDeque::new(),
            reset_scheduled: false,
        }
    }

    /// Consume one unit of quota if any is left.
    pub fn try_admit(&mut self) -> bool {
        if self.remaining > 0 {
            self.remaining -= 1;
            true
        } else {
            false
        }
    }

    /// Queue a request at the back of the pending sequence.
    pub fn enqueue(&mut self, item: P) {
        self.pending.push_back(item);
    }

    /// Overwrite limit, remaining and reset time with server-reported values.
    pub fn apply(&mut self, quota: &QuotaHeaders) {
        self.limit = quota.limit.max(1);
        self.remaining = quota.remaining;
        self.reset_at = Instant::now() + quota.reset_after();
    }

    /// Move the reset time to `delay` from now.
    pub fn reset_after(&mut self, delay: Duration) {
        self.remaining = 0;
        self.reset_at = Instant::now() + delay;
    }

    /// Mark a reset timer as armed.
    ///
    /// Returns the delay to arm it with, or `None` if one is already armed.
    /// The delay is never negative: a reset time in the past fires immediately.
    pub fn arm_reset(&mut self) -> Option<Duration> {
        if self.reset_scheduled {
            return None;
        }
        self.reset_scheduled = true;
        Some(self.reset_at.saturating_duration_since(Instant::now()))
    }

    /// Restore the window and take the requests to replay.
    ///
    /// Pops at most `limit` requests from the front of the queue, in FIFO
    /// order. The caller must run each through normal admission, which
    /// consumes the restored quota.
    pub fn reset(&mut self) -> Vec<P> {
        self.remaining = self.limit;
        self.reset_scheduled = false;
        let count = (self.limit as usize).min(self.pending.len());
        self.pending.drain(..count).collect()
    }

    /// Current state
    pub fn state(&self) -> BucketState {
        if self.reset_scheduled {
            BucketState::ResetPending
        } else if self.remaining > 0 {
            BucketState::Open
        } else {
            BucketState::Throttled
        }
    }

    /// Requests allowed per window
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Requests left in the current window
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// When the current window resets
    pub fn reset_at(&self) -> Instant {
        self.reset_at
    }

    /// Number of queued requests
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Whether a reset timer is armed
    pub fn is_reset_scheduled(&self) -> bool {
        self.reset_scheduled
    }

    /// Point-in-time copy of the quota state
    pub fn snapshot(&self) -> BucketSnapshot {
        BucketSnapshot {
            limit: self.limit,
            remaining: self.remaining,
            reset_at: self.reset_at,
            pending: self.pending.len(),
            state: self.state(),
        }
    }
}

/// A point-in-time view of one bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketSnapshot {
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: Instant,
    pub pending: usize,
    pub state: BucketState,
}
