use crate::bucket::{BucketSnapshot, RateLimitBucket};
use crate::config::RateLimiterConfig;
use crate::error::{Error, TransportError};
use crate::headers::{retry_after, QuotaHeaders};
use crate::key::{RateLimitKey, RateLimited};
use crate::metrics::LimiterMetrics;
use crate::transport::{HttpResponse, Transport};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, trace, warn};

/// Completion callback for a rate-limited request.
///
/// Invoked exactly once, with the response or the transport failure. Never
/// invoked for a 429; the request is replayed and the callback waits for the
/// replay's outcome.
pub type ResponseCallback = Box<dyn FnOnce(Result<HttpResponse, TransportError>) + Send + 'static>;

/// A request waiting in (or travelling through) a bucket
struct PendingRequest<R> {
    request: R,
    callback: ResponseCallback,
}

/// Messages processed by the limiter task, in arrival order
enum Command<R> {
    Execute {
        key: RateLimitKey,
        pending: PendingRequest<R>,
    },
    Completed {
        key: RateLimitKey,
        pending: PendingRequest<R>,
        result: Result<HttpResponse, TransportError>,
    },
    ResetFired {
        key: RateLimitKey,
    },
    Inspect {
        key: RateLimitKey,
        reply: oneshot::Sender<Option<BucketSnapshot>>,
    },
}

/// Routes every outgoing request through its rate-limit bucket.
///
/// # Thread Safety
///
/// `RateLimiter` is `Send + Sync`; share it with `Arc` and call it from any
/// task or thread. All bucket state lives in a single background task that
/// handles requests, responses and reset timers one message at a time, so two
/// callers can never both spend the last unit of a bucket's quota.
///
/// # Example
///
/// ```ignore
/// let limiter = RateLimiter::new(RateLimiterConfig::default(), MyTransport::new());
/// let key = RateLimitKey::from_route("/channels/123/messages");
/// let response = limiter.send(request, &key).await?;
/// ```
pub struct RateLimiter<T: Transport> {
    command_tx: mpsc::UnboundedSender<Command<T::Request>>,
    metrics: Arc<LimiterMetrics>,
    task: JoinHandle<()>,
}

impl<T: Transport> RateLimiter<T> {
    /// Create a rate limiter and start its background task.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn new(config: RateLimiterConfig, transport: T) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let metrics = Arc::new(LimiterMetrics::new());

        let actor = LimiterTask {
            transport: Arc::new(transport),
            config,
            buckets: HashMap::new(),
            command_tx: command_tx.clone(),
            metrics: metrics.clone(),
        };
        let task = tokio::spawn(actor.run(command_rx));

        Self {
            command_tx,
            metrics,
            task,
        }
    }

    /// Get the metrics for this limiter
    pub fn metrics(&self) -> Arc<LimiterMetrics> {
        self.metrics.clone()
    }

    /// Send `request` through the bucket for `key`.
    ///
    /// If the bucket has quota left the request is dispatched immediately,
    /// otherwise it is queued until the bucket resets. `callback` receives the
    /// eventual response or transport failure.
    pub fn execute<K, F>(&self, request: T::Request, key: &K, callback: F)
    where
        K: RateLimited + ?Sized,
        F: FnOnce(Result<HttpResponse, TransportError>) + Send + 'static,
    {
        let command = Command::Execute {
            key: key.rate_limit_key(),
            pending: PendingRequest {
                request,
                callback: Box::new(callback),
            },
        };

        if let Err(mpsc::error::SendError(command)) = self.command_tx.send(command) {
            warn!("Rate limiter task is gone, failing request");
            if let Command::Execute { pending, .. } = command {
                (pending.callback)(Err(TransportError::Disconnected));
            }
        }
    }

    /// Send `request` through the bucket for `key` and wait for the response.
    ///
    /// # Errors
    ///
    /// Returns `Error::Transport` if the transport failed, or
    /// `Error::ShuttingDown` if the limiter stopped before the request completed.
    pub async fn send<K>(&self, request: T::Request, key: &K) -> Result<HttpResponse, Error>
    where
        K: RateLimited + ?Sized,
    {
        let (tx, rx) = oneshot::channel();
        self.execute(request, key, move |result| {
            let _ = tx.send(result);
        });

        match rx.await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::ShuttingDown),
        }
    }

    /// Current state of the bucket for `key`, if it has been used.
    pub async fn bucket<K>(&self, key: &K) -> Option<BucketSnapshot>
    where
        K: RateLimited + ?Sized,
    {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(Command::Inspect {
                key: key.rate_limit_key(),
                reply,
            })
            .ok()?;
        rx.await.ok().flatten()
    }
}

impl<T: Transport> Drop for RateLimiter<T> {
    fn drop(&mut self) {
        // Queued callbacks are dropped with the task
        self.task.abort();
    }
}

type Bucket<R> = RateLimitBucket<PendingRequest<R>>;

/// Owner of all bucket state
struct LimiterTask<T: Transport> {
    transport: Arc<T>,
    config: RateLimiterConfig,
    buckets: HashMap<RateLimitKey, Bucket<T::Request>>,
    command_tx: mpsc::UnboundedSender<Command<T::Request>>,
    metrics: Arc<LimiterMetrics>,
}

impl<T: Transport> LimiterTask<T> {
    async fn run(mut self, mut command_rx: mpsc::UnboundedReceiver<Command<T::Request>>) {
        while let Some(command) = command_rx.recv().await {
            match command {
                Command::Execute { key, pending } => self.admit(key, pending),
                Command::Completed {
                    key,
                    pending,
                    result,
                } => self.complete(key, pending, result),
                Command::ResetFired { key } => self.reset(key),
                Command::Inspect { key, reply } => {
                    let _ = reply.send(self.buckets.get(&key).map(|b| b.snapshot()));
                }
            }
        }
        debug!("Rate limiter task stopped");
    }

    /// Dispatch if the bucket has quota, queue otherwise.
    fn admit(&mut self, key: RateLimitKey, pending: PendingRequest<T::Request>) {
        let bucket = bucket_entry(&mut self.buckets, &key, &self.config);

        if !bucket.try_admit() {
            bucket.enqueue(pending);
            self.metrics.record_queued();
            debug!(
                "[{}] Bucket exhausted, queued request ({} pending)",
                key,
                bucket.pending_len()
            );
            return;
        }

        self.metrics.record_admitted();
        trace!("[{}] Admitted request ({} remaining)", key, bucket.remaining());
        self.dispatch(key, pending);
    }

    fn dispatch(&self, key: RateLimitKey, pending: PendingRequest<T::Request>) {
        let transport = self.transport.clone();
        let command_tx = self.command_tx.clone();

        tokio::spawn(async move {
            let result = transport.send(&pending.request).await;
            if command_tx
                .send(Command::Completed {
                    key,
                    pending,
                    result,
                })
                .is_err()
            {
                debug!("Rate limiter stopped before a response could be handled");
            }
        });
    }

    fn complete(
        &mut self,
        key: RateLimitKey,
        pending: PendingRequest<T::Request>,
        result: Result<HttpResponse, TransportError>,
    ) {
        let bucket = bucket_entry(&mut self.buckets, &key, &self.config);

        match result {
            Err(error) => {
                self.metrics.record_transport_error();
                debug!("[{}] Transport failed: {}", key, error);
                // Keep the queue moving even though this round taught us nothing
                if bucket.pending_len() > 0 {
                    if let Some(delay) = bucket.arm_reset() {
                        schedule_reset(&self.command_tx, key, delay);
                    }
                }
                (pending.callback)(Err(error));
            }
            Ok(response) if response.is_rate_limited() => {
                self.metrics.record_rate_limited();
                let delay = match QuotaHeaders::parse(&response.headers) {
                    Some(quota) => {
                        bucket.apply(&quota);
                        quota.reset_after()
                    }
                    None => retry_after(&response.headers)
                        .unwrap_or(self.config.retry_after_fallback),
                };
                // A stale or zero reset must not turn into an immediate retry loop
                bucket.reset_after(delay.max(self.config.retry_after_fallback));
                bucket.enqueue(pending);
                warn!(
                    "[{}] Rate limited by server, request requeued ({} pending)",
                    key,
                    bucket.pending_len()
                );
                if let Some(delay) = bucket.arm_reset() {
                    schedule_reset(&self.command_tx, key, delay);
                }
            }
            Ok(response) => {
                if let Some(quota) = QuotaHeaders::parse(&response.headers) {
                    bucket.apply(&quota);
                    debug!(
                        "[{}] Quota updated: {}/{} remaining",
                        key, quota.remaining, quota.limit
                    );
                }
                if let Some(delay) = bucket.arm_reset() {
                    schedule_reset(&self.command_tx, key, delay);
                }
                (pending.callback)(Ok(response));
            }
        }
    }

    /// Restore the window and replay queued requests through normal admission.
    fn reset(&mut self, key: RateLimitKey) {
        let replay = match self.buckets.get_mut(&key) {
            Some(bucket) => bucket.reset(),
            None => return,
        };

        self.metrics.record_bucket_reset();
        self.metrics.record_replayed(replay.len());
        debug!("[{}] Bucket reset, replaying {} requests", key, replay.len());

        for pending in replay {
            self.admit(key.clone(), pending);
        }
    }
}

fn bucket_entry<'a, R>(
    buckets: &'a mut HashMap<RateLimitKey, Bucket<R>>,
    key: &RateLimitKey,
    config: &RateLimiterConfig,
) -> &'a mut Bucket<R> {
    buckets.entry(key.clone()).or_insert_with(|| {
        trace!("[{}] Creating bucket", key);
        RateLimitBucket::new(config.default_limit, config.default_window)
    })
}

/// Post a `ResetFired` back to the limiter task after `delay`.
fn schedule_reset<R: Send + 'static>(
    command_tx: &mpsc::UnboundedSender<Command<R>>,
    key: RateLimitKey,
    delay: Duration,
) {
    debug!("[{}] Reset scheduled in {:?}", key, delay);
    let command_tx = command_tx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = command_tx.send(Command::ResetFired { key });
    });
}
