use crate::config::ShardManagerConfig;
use crate::delegate::{DisconnectReason, ManagerDelegate};
use crate::error::Error;
use crate::metrics::ManagerMetrics;
use crate::shard::{Shard, ShardFactory, ShardInfo, ShardSignals, SignalSink};
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Aggregate lifecycle state derived from per-shard signals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    /// Shards built but not connected
    Idle,
    /// Connect requested, not every shard has reported connected
    Connecting,
    /// Every shard reported connected
    Connected,
    /// Closed before fully connecting, or every shard reported disconnected
    Disconnected,
}

/// Owns a set of gateway shards, connects them with a stagger, and turns
/// per-shard signals into manager-level connected/disconnected notifications.
///
/// # Thread Safety
///
/// `ShardManager` is `Send + Sync`. Shard signals arrive from the shards' own
/// tasks; the counters and the shard set are guarded by one `parking_lot::Mutex`
/// that is never held across an await, a shard call or a delegate callback.
pub struct ShardManager<F: ShardFactory> {
    factory: F,
    config: ShardManagerConfig,
    shared: Arc<Shared<F::Shard>>,
    /// Background task running the staggered connect sequence
    connect_task: Mutex<Option<JoinHandle<()>>>,
}

/// State reachable from shard signals
struct Shared<S> {
    state: Mutex<ManagerInner<S>>,
    delegate: RwLock<Option<Weak<dyn ManagerDelegate>>>,
    /// Mirrors `ManagerInner::closed` so the connect loop can wait on it
    closed_tx: watch::Sender<bool>,
    metrics: Arc<ManagerMetrics>,
}

struct ManagerInner<S> {
    /// Shards keyed by index
    shards: BTreeMap<usize, Arc<S>>,
    /// Bumped on every rebuild so late signals from discarded shards are ignored
    generation: u64,
    /// Indices that reported connected this cycle
    connected: HashSet<usize>,
    /// Indices that reported disconnected this cycle
    disconnected: HashSet<usize>,
    closed: bool,
    phase: ManagerState,
}

impl<S> Default for ManagerInner<S> {
    fn default() -> Self {
        Self {
            shards: BTreeMap::new(),
            generation: 0,
            connected: HashSet::new(),
            disconnected: HashSet::new(),
            closed: false,
            phase: ManagerState::Idle,
        }
    }
}

impl<S> ManagerInner<S> {
    fn reset_counters(&mut self) {
        self.connected.clear();
        self.disconnected.clear();
    }

    fn owned_shards(&self) -> Vec<Arc<S>> {
        self.shards.values().cloned().collect()
    }
}

impl<S: Shard> Shared<S> {
    fn delegate(&self) -> Option<Arc<dyn ManagerDelegate>> {
        self.delegate.read().as_ref().and_then(Weak::upgrade)
    }

    fn notify_connected(&self) {
        self.metrics.record_manager_connected();
        info!("All shards connected");
        match self.delegate() {
            Some(delegate) => delegate.on_manager_connected(),
            None => debug!("No delegate to notify of connection"),
        }
    }

    fn notify_disconnected(&self, reason: DisconnectReason) {
        self.metrics.record_manager_disconnected();
        info!("Shard manager disconnected: {}", reason);
        match self.delegate() {
            Some(delegate) => delegate.on_manager_disconnected(&reason),
            None => debug!("No delegate to notify of disconnection"),
        }
    }

    fn generation(&self) -> u64 {
        self.state.lock().generation
    }
}

impl<S: Shard> SignalSink for Shared<S> {
    fn shard_connected(&self, index: usize, generation: u64) {
        let notify = {
            let mut inner = self.state.lock();
            if inner.generation != generation {
                trace!("[SHARD-{}] Ignoring connected signal from a discarded shard", index);
                return;
            }

            if !inner.shards.contains_key(&index) {
                warn!("[SHARD-{}] Connected signal for a shard this manager does not own", index);
                return;
            }
            if !inner.connected.insert(index) {
                trace!("[SHARD-{}] Repeated connected signal ignored", index);
                return;
            }

            let total = inner.shards.len();
            let connected = inner.connected.len();
            debug!("[SHARD-{}] Connected ({}/{})", index, connected, total);

            let fully_connected = connected == total && !inner.closed;
            if fully_connected {
                inner.phase = ManagerState::Connected;
            }
            fully_connected
        };

        self.metrics.update_shard(index, |s| {
            s.is_connected = true;
            s.last_connected_at = Some(Instant::now());
        });

        if notify {
            self.notify_connected();
        }
    }

    fn shard_disconnected(&self, index: usize, generation: u64) {
        let notify = {
            let mut inner = self.state.lock();
            if inner.generation != generation {
                trace!("[SHARD-{}] Ignoring disconnected signal from a discarded shard", index);
                return;
            }

            if !inner.shards.contains_key(&index) {
                warn!("[SHARD-{}] Disconnected signal for a shard this manager does not own", index);
                return;
            }
            if !inner.disconnected.insert(index) {
                trace!("[SHARD-{}] Repeated disconnected signal ignored", index);
                return;
            }

            let total = inner.shards.len();
            let disconnected = inner.disconnected.len();
            debug!("[SHARD-{}] Disconnected ({}/{})", index, disconnected, total);

            let fully_closed = disconnected == total && inner.phase != ManagerState::Disconnected;
            if fully_closed {
                inner.phase = ManagerState::Disconnected;
            }
            fully_closed
        };

        self.metrics.update_shard(index, |s| s.is_connected = false);

        if notify {
            self.notify_disconnected(DisconnectReason::AllShardsDisconnected);
        }
    }
}

impl<F: ShardFactory> ShardManager<F> {
    /// Create a shard manager. No shards exist until `shatter` is called.
    pub fn new(config: ShardManagerConfig, factory: F) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            factory,
            config,
            shared: Arc::new(Shared {
                state: Mutex::new(ManagerInner::default()),
                delegate: RwLock::new(None),
                closed_tx,
                metrics: Arc::new(ManagerMetrics::new()),
            }),
            connect_task: Mutex::new(None),
        }
    }

    /// Register the delegate to notify. Held weakly.
    pub fn set_delegate<D: ManagerDelegate + 'static>(&self, delegate: &Arc<D>) {
        let delegate: Weak<dyn ManagerDelegate> = Arc::downgrade(delegate) as Weak<dyn ManagerDelegate>;
        *self.shared.delegate.write() = Some(delegate);
    }

    /// Get the metrics for this manager
    pub fn metrics(&self) -> Arc<ManagerMetrics> {
        self.shared.metrics.clone()
    }

    /// Replace all shards with `count` new ones, indices `0..count`.
    ///
    /// Counters are reset and the new shards are not connected. Does nothing
    /// when no delegate is registered.
    pub fn shatter(&self, count: usize) {
        let infos: Vec<ShardInfo> = (0..count)
            .map(|index| ShardInfo {
                index,
                total: count,
            })
            .collect();
        info!("Shattering into {} shards", count);
        self.rebuild(infos);
    }

    /// Replace all shards with the single shard described by `info`.
    ///
    /// Used when shards are spread over several processes. Does nothing when
    /// no delegate is registered.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidShardInfo` unless `info.index < info.total`.
    pub fn manually_shatter(&self, info: ShardInfo) -> Result<(), Error> {
        let info = ShardInfo::new(info.index, info.total)?;
        info!(
            "Manually shattering into shard {} of {}",
            info.index, info.total
        );
        self.rebuild(vec![info]);
        Ok(())
    }

    fn rebuild(&self, infos: Vec<ShardInfo>) {
        if self.shared.delegate().is_none() {
            warn!("No delegate registered, ignoring shatter");
            return;
        }

        self.abort_connect_task();

        let (generation, old_shards) = {
            let mut inner = self.shared.state.lock();
            inner.generation += 1;
            inner.reset_counters();
            inner.closed = false;
            inner.phase = ManagerState::Idle;
            (inner.generation, std::mem::take(&mut inner.shards))
        };
        self.shared.closed_tx.send_replace(false);
        self.shared.metrics.clear_shards();

        // Old shards can no longer affect the counters; close any still open
        for shard in old_shards.values().filter(|s| s.is_connected()) {
            debug!("[SHARD-{}] Closing discarded shard", shard.info().index);
            shard.disconnect();
        }

        let sink: Weak<dyn SignalSink> = Arc::downgrade(&self.shared) as Weak<dyn SignalSink>;
        let shards: BTreeMap<usize, Arc<F::Shard>> = infos
            .into_iter()
            .map(|info| {
                let signals = ShardSignals::new(sink.clone(), info.index, generation);
                (info.index, Arc::new(self.factory.create(info, signals)))
            })
            .collect();

        let mut inner = self.shared.state.lock();
        if inner.generation == generation {
            inner.shards = shards;
        } else {
            debug!("Shard set rebuilt concurrently, discarding generation {}", generation);
        }
    }

    /// Connect every shard in index order, pausing `connect_stagger` between
    /// successive connects.
    ///
    /// Returns immediately; the sequence runs on a background task and stops
    /// before the next shard once `disconnect()` is called. After a
    /// `disconnect()` this starts a new cycle with fresh counters, even if some
    /// shards have not yet reported their connection closed. Does nothing while
    /// already connected.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn connect(&self) {
        let (shards, generation) = {
            let mut inner = self.shared.state.lock();
            if inner.shards.is_empty() {
                warn!("No shards to connect, call shatter first");
                return;
            }
            if inner.phase == ManagerState::Connected && !inner.closed {
                debug!("Already connected");
                return;
            }
            if inner.closed || inner.phase == ManagerState::Disconnected {
                // New connect cycle on the same shard set
                inner.reset_counters();
            }
            inner.closed = false;
            inner.phase = ManagerState::Connecting;
            (inner.owned_shards(), inner.generation)
        };
        self.shared.closed_tx.send_replace(false);

        info!(
            "Connecting {} shards with {:?} stagger",
            shards.len(),
            self.config.connect_stagger
        );

        let shared = self.shared.clone();
        let closed_rx = self.shared.closed_tx.subscribe();
        let stagger = self.config.connect_stagger;
        let handle = tokio::spawn(run_connect_sequence(
            shared, shards, generation, stagger, closed_rx,
        ));

        if let Some(previous) = self.connect_task.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Close every shard.
    ///
    /// Stops a connect sequence still in progress. If not every shard had
    /// connected, the delegate is told immediately: a partially connected
    /// manager never counted as connected.
    pub fn disconnect(&self) {
        let (shards, notify) = {
            let mut inner = self.shared.state.lock();
            inner.closed = true;
            let notify = matches!(inner.phase, ManagerState::Idle | ManagerState::Connecting);
            if notify {
                inner.phase = ManagerState::Disconnected;
            }
            (inner.owned_shards(), notify)
        };
        self.shared.closed_tx.send_replace(true);

        info!("Disconnecting {} shards", shards.len());
        for shard in &shards {
            shard.disconnect();
        }

        if notify {
            self.shared
                .notify_disconnected(DisconnectReason::ClosedBeforeConnected);
        }
    }

    /// Record that the shard with `index` connected.
    ///
    /// Shards normally report through their [`ShardSignals`]; this is the same
    /// signal for the current shard set. Indices the manager does not own are
    /// logged and ignored, as is a second signal from the same shard in one
    /// connect cycle.
    pub fn signal_shard_connected(&self, index: usize) {
        self.shared.shard_connected(index, self.shared.generation());
    }

    /// Record that the shard with `index` disconnected.
    pub fn signal_shard_disconnected(&self, index: usize) {
        self.shared
            .shard_disconnected(index, self.shared.generation());
    }

    /// Get the shard with `index`.
    ///
    /// # Panics
    ///
    /// Panics if no owned shard has that index. Indices are assigned by the
    /// manager, so this is a usage error.
    pub fn shard(&self, index: usize) -> Arc<F::Shard> {
        match self.get_shard(index) {
            Some(shard) => shard,
            None => panic!(
                "no shard with index {} (manager owns {} shards)",
                index,
                self.shard_count()
            ),
        }
    }

    /// Get the shard with `index`, if owned
    pub fn get_shard(&self, index: usize) -> Option<Arc<F::Shard>> {
        self.shared.state.lock().shards.get(&index).cloned()
    }

    /// All owned shards, in index order
    pub fn shards(&self) -> Vec<Arc<F::Shard>> {
        self.shared.state.lock().owned_shards()
    }

    /// Send a gateway payload over the shard with `index`.
    ///
    /// # Errors
    ///
    /// Returns `Error::ShardNotFound` if no owned shard has that index, or
    /// whatever the shard's send reports.
    pub async fn send_payload(
        &self,
        payload: <F::Shard as Shard>::Payload,
        index: usize,
    ) -> Result<(), Error> {
        let shard = self.get_shard(index).ok_or_else(|| Error::ShardNotFound {
            index,
            count: self.shard_count(),
        })?;
        trace!("[SHARD-{}] Sending gateway payload", index);
        shard.send_gateway_payload(payload).await
    }

    /// Current aggregate state
    pub fn state(&self) -> ManagerState {
        self.shared.state.lock().phase
    }

    /// Number of owned shards
    pub fn shard_count(&self) -> usize {
        self.shared.state.lock().shards.len()
    }

    /// Shards that have reported connected this cycle
    pub fn connected_count(&self) -> usize {
        self.shared.state.lock().connected.len()
    }

    /// Shards that have reported disconnected this cycle
    pub fn closed_count(&self) -> usize {
        self.shared.state.lock().disconnected.len()
    }

    /// Whether `disconnect()` was called since the last `connect()`
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    fn abort_connect_task(&self) {
        if let Some(handle) = self.connect_task.lock().take() {
            handle.abort();
        }
    }
}

impl<F: ShardFactory> Drop for ShardManager<F> {
    fn drop(&mut self) {
        // Abort the connect sequence to prevent orphaned tasks
        self.abort_connect_task();
    }
}

/// Connect shards one after another, waiting `stagger` between them.
async fn run_connect_sequence<S: Shard>(
    shared: Arc<Shared<S>>,
    shards: Vec<Arc<S>>,
    generation: u64,
    stagger: Duration,
    mut closed_rx: watch::Receiver<bool>,
) {
    let total = shards.len();

    for (position, shard) in shards.into_iter().enumerate() {
        if position > 0 && !stagger.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(stagger) => {}
                _ = wait_closed(&mut closed_rx) => {}
            }
        }

        let closed = *closed_rx.borrow();
        if closed || shared.generation() != generation {
            info!(
                "Connect sequence halted after {}/{} shards",
                position, total
            );
            return;
        }

        let index = shard.info().index;
        shared.metrics.record_shard_connect(index);
        info!("[SHARD-{}] Connecting ({}/{})", index, position + 1, total);

        match AssertUnwindSafe(shard.connect()).catch_unwind().await {
            Ok(Ok(())) => debug!("[SHARD-{}] Connect issued", index),
            Ok(Err(e)) => {
                shared.metrics.record_shard_connect_failed();
                warn!("[SHARD-{}] Connect failed: {}", index, e);
            }
            Err(panic_err) => {
                let panic_msg = if let Some(s) = panic_err.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_err.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic".to_string()
                };
                shared.metrics.record_shard_connect_failed();
                error!("[SHARD-{}] Connect PANICKED: {}", index, panic_msg);
            }
        }
    }

    debug!("Connect sequence finished for {} shards", total);
}

/// Resolve once the closed flag is set.
async fn wait_closed(closed_rx: &mut watch::Receiver<bool>) {
    let _ = closed_rx.wait_for(|closed| *closed).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::time::Instant as TokioInstant;

    type ConnectLog = Arc<Mutex<Vec<(usize, TokioInstant)>>>;

    struct MockShard {
        info: ShardInfo,
        signals: ShardSignals,
        log: ConnectLog,
        fail_connect: bool,
        connected: AtomicBool,
        disconnects: AtomicUsize,
        payloads: Mutex<Vec<String>>,
    }

    impl Shard for MockShard {
        type Payload = String;

        fn info(&self) -> ShardInfo {
            self.info
        }

        async fn connect(&self) -> Result<(), Error> {
            self.log.lock().push((self.info.index, TokioInstant::now()));
            if self.fail_connect {
                return Err(Error::Shard("identify rejected".to_string()));
            }
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn disconnect(&self) {
            self.connected.store(false, Ordering::SeqCst);
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }

        async fn send_gateway_payload(&self, payload: String) -> Result<(), Error> {
            self.payloads.lock().push(payload);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct RecordingDelegate {
        connected: AtomicUsize,
        disconnected: Mutex<Vec<DisconnectReason>>,
    }

    impl ManagerDelegate for RecordingDelegate {
        fn on_manager_connected(&self) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }

        fn on_manager_disconnected(&self, reason: &DisconnectReason) {
            self.disconnected.lock().push(*reason);
        }
    }

    fn manager_with(
        stagger: Duration,
        failing: Option<usize>,
    ) -> (
        ShardManager<impl ShardFactory<Shard = MockShard>>,
        Arc<RecordingDelegate>,
        ConnectLog,
    ) {
        let log: ConnectLog = Arc::new(Mutex::new(Vec::new()));
        let factory_log = log.clone();
        let factory = move |info: ShardInfo, signals: ShardSignals| MockShard {
            info,
            signals,
            log: factory_log.clone(),
            fail_connect: failing == Some(info.index),
            connected: AtomicBool::new(false),
            disconnects: AtomicUsize::new(0),
            payloads: Mutex::new(Vec::new()),
        };

        let config = ShardManagerConfig::builder()
            .connect_stagger(stagger)
            .build()
            .expect("valid config");
        let manager = ShardManager::new(config, factory);
        let delegate = Arc::new(RecordingDelegate::default());
        manager.set_delegate(&delegate);
        (manager, delegate, log)
    }

    fn manager() -> (
        ShardManager<impl ShardFactory<Shard = MockShard>>,
        Arc<RecordingDelegate>,
        ConnectLog,
    ) {
        manager_with(Duration::from_secs(5), None)
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_shatter_builds_contiguous_shards() {
        let (manager, _delegate, _log) = manager();
        manager.shatter(4);

        assert_eq!(manager.shard_count(), 4);
        assert_eq!(manager.state(), ManagerState::Idle);
        for index in 0..4 {
            let shard = manager.shard(index);
            assert_eq!(shard.info(), ShardInfo { index, total: 4 });
            assert_eq!(shard.signals.shard_index(), index);
            assert!(!shard.is_connected());
        }
    }

    #[test]
    fn test_reshatter_resets_shards_and_counters() {
        let (manager, _delegate, _log) = manager();
        manager.shatter(5);
        let stale = manager.shard(4);
        manager.signal_shard_connected(0);
        manager.signal_shard_disconnected(1);
        assert_eq!(manager.connected_count(), 1);

        manager.shatter(3);

        assert_eq!(manager.shard_count(), 3);
        let indices: Vec<usize> = manager.shards().iter().map(|s| s.info().index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert!(manager.shards().iter().all(|s| s.info().total == 3));
        assert_eq!(manager.connected_count(), 0);
        assert_eq!(manager.closed_count(), 0);
        assert!(manager.get_shard(4).is_none());

        // Signals from a discarded shard no longer count
        stale.signals.connected();
        assert_eq!(manager.connected_count(), 0);
    }

    #[test]
    fn test_shatter_without_delegate_is_noop() {
        let config = ShardManagerConfig::default();
        let factory = |info: ShardInfo, signals: ShardSignals| MockShard {
            info,
            signals,
            log: Arc::new(Mutex::new(Vec::new())),
            fail_connect: false,
            connected: AtomicBool::new(false),
            disconnects: AtomicUsize::new(0),
            payloads: Mutex::new(Vec::new()),
        };
        let manager = ShardManager::new(config, factory);

        manager.shatter(3);
        assert_eq!(manager.shard_count(), 0);

        // A delegate that has been dropped counts as missing
        let delegate = Arc::new(RecordingDelegate::default());
        manager.set_delegate(&delegate);
        drop(delegate);
        manager.shatter(3);
        assert_eq!(manager.shard_count(), 0);
    }

    #[test]
    fn test_manually_shatter_single_shard() {
        let (manager, _delegate, _log) = manager();
        manager
            .manually_shatter(ShardInfo { index: 3, total: 8 })
            .expect("valid info");

        assert_eq!(manager.shard_count(), 1);
        assert_eq!(manager.shard(3).info(), ShardInfo { index: 3, total: 8 });
        assert!(manager.get_shard(0).is_none());

        let err = manager
            .manually_shatter(ShardInfo { index: 8, total: 8 })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidShardInfo { index: 8, total: 8 }));
        // The previous shard set is untouched
        assert_eq!(manager.shard_count(), 1);
    }

    #[test]
    #[should_panic(expected = "no shard with index 7")]
    fn test_unknown_shard_index_panics() {
        let (manager, _delegate, _log) = manager();
        manager.shatter(2);
        let _ = manager.shard(7);
    }

    #[test]
    fn test_connected_fires_once_after_all_signals_in_any_order() {
        let (manager, delegate, _log) = manager();
        manager.shatter(3);

        manager.shard(2).signals.connected();
        assert_eq!(delegate.connected.load(Ordering::SeqCst), 0);
        manager.shard(0).signals.connected();
        assert_eq!(delegate.connected.load(Ordering::SeqCst), 0);
        manager.shard(1).signals.connected();
        assert_eq!(delegate.connected.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state(), ManagerState::Connected);

        // Repeated signals never re-notify or overflow the counter
        manager.shard(1).signals.connected();
        manager.signal_shard_connected(0);
        assert_eq!(delegate.connected.load(Ordering::SeqCst), 1);
        assert_eq!(manager.connected_count(), 3);
        assert_eq!(manager.metrics().manager_connected(), 1);
    }

    #[test]
    fn test_concurrent_signals_notify_once() {
        let (manager, delegate, _log) = manager();
        manager.shatter(16);

        let threads: Vec<_> = manager
            .shards()
            .into_iter()
            .map(|shard| std::thread::spawn(move || shard.signals.connected()))
            .collect();
        for thread in threads {
            thread.join().expect("signal thread");
        }

        assert_eq!(manager.connected_count(), 16);
        assert_eq!(delegate.connected.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disconnect_before_connected_notifies_immediately() {
        let (manager, delegate, _log) = manager();
        manager.shatter(3);
        manager.shard(0).signals.connected();

        manager.disconnect();

        assert_eq!(
            *delegate.disconnected.lock(),
            vec![DisconnectReason::ClosedBeforeConnected]
        );
        assert_eq!(manager.state(), ManagerState::Disconnected);
        assert!(manager.is_closed());
        for shard in manager.shards() {
            assert_eq!(shard.disconnects.load(Ordering::SeqCst), 1);
        }

        // Late shard-level signals do not notify a second time
        for shard in manager.shards() {
            shard.signals.disconnected();
        }
        assert_eq!(delegate.disconnected.lock().len(), 1);
        assert_eq!(manager.closed_count(), 3);
    }

    #[test]
    fn test_disconnect_after_connected_waits_for_all_shards() {
        let (manager, delegate, _log) = manager();
        manager.shatter(3);
        for shard in manager.shards() {
            shard.signals.connected();
        }

        manager.disconnect();
        assert!(delegate.disconnected.lock().is_empty());

        manager.shard(0).signals.disconnected();
        manager.shard(2).signals.disconnected();
        assert!(delegate.disconnected.lock().is_empty());

        manager.shard(1).signals.disconnected();
        assert_eq!(
            *delegate.disconnected.lock(),
            vec![DisconnectReason::AllShardsDisconnected]
        );
        assert_eq!(manager.state(), ManagerState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_staggers_shards_in_index_order() {
        let (manager, _delegate, log) = manager();
        manager.shatter(3);
        let start = TokioInstant::now();

        manager.connect();
        assert_eq!(manager.state(), ManagerState::Connecting);
        tokio::time::sleep(Duration::from_secs(11)).await;

        let log = log.lock().clone();
        let order: Vec<usize> = log.iter().map(|(index, _)| *index).collect();
        assert_eq!(order, vec![0, 1, 2]);
        let offsets: Vec<Duration> = log.iter().map(|(_, at)| *at - start).collect();
        assert!(offsets[0] < Duration::from_secs(1));
        assert!(offsets[1] >= Duration::from_secs(5) && offsets[1] < Duration::from_secs(6));
        assert!(offsets[2] >= Duration::from_secs(10) && offsets[2] < Duration::from_secs(11));
        assert_eq!(manager.metrics().shard_connects(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_halts_connect_sequence() {
        let (manager, delegate, log) = manager();
        manager.shatter(3);

        manager.connect();
        settle().await;
        assert_eq!(log.lock().len(), 1);

        manager.disconnect();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(log.lock().len(), 1);
        assert_eq!(
            *delegate.disconnected.lock(),
            vec![DisconnectReason::ClosedBeforeConnected]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_signals_processed_during_stagger() {
        let (manager, _delegate, log) = manager();
        manager.shatter(2);

        manager.connect();
        settle().await;
        assert_eq!(log.lock().len(), 1);

        // The connect loop is sleeping; the signal must not wait for it
        manager.shard(0).signals.connected();
        assert_eq!(manager.connected_count(), 1);
        assert_eq!(log.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_continues_past_failing_shard() {
        let (manager, delegate, log) = manager_with(Duration::from_secs(1), Some(1));
        manager.shatter(3);

        manager.connect();
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(log.lock().len(), 3);
        assert_eq!(manager.metrics().shard_connect_failures(), 1);
        assert!(manager.shard(0).is_connected());
        assert!(!manager.shard(1).is_connected());
        assert!(manager.shard(2).is_connected());
        assert_eq!(delegate.connected.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_disconnect_starts_new_cycle() {
        let (manager, delegate, _log) = manager_with(Duration::ZERO, None);
        manager.shatter(2);

        manager.connect();
        for shard in manager.shards() {
            shard.signals.connected();
        }
        manager.disconnect();
        for shard in manager.shards() {
            shard.signals.disconnected();
        }
        assert_eq!(manager.state(), ManagerState::Disconnected);

        manager.connect();
        assert_eq!(manager.connected_count(), 0);
        assert!(!manager.is_closed());
        for shard in manager.shards() {
            shard.signals.connected();
        }

        assert_eq!(delegate.connected.load(Ordering::SeqCst), 2);
        assert_eq!(
            *delegate.disconnected.lock(),
            vec![DisconnectReason::AllShardsDisconnected]
        );
    }

    #[tokio::test]
    async fn test_send_payload_routes_to_named_shard() {
        let (manager, _delegate, _log) = manager();
        manager.shatter(3);

        manager
            .send_payload("presence".to_string(), 1)
            .await
            .expect("shard 1 exists");

        assert_eq!(*manager.shard(1).payloads.lock(), vec!["presence".to_string()]);
        assert!(manager.shard(0).payloads.lock().is_empty());
        assert!(manager.shard(2).payloads.lock().is_empty());

        let err = manager
            .send_payload("presence".to_string(), 9)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ShardNotFound { index: 9, count: 3 }));
    }

    #[test]
    fn test_signals_for_unowned_indices_are_ignored() {
        let (manager, delegate, _log) = manager();
        manager.shatter(3);

        manager.signal_shard_connected(7);
        manager.signal_shard_connected(8);
        manager.signal_shard_connected(9);
        manager.signal_shard_disconnected(usize::MAX);

        assert_eq!(manager.connected_count(), 0);
        assert_eq!(manager.closed_count(), 0);
        assert_eq!(delegate.connected.load(Ordering::SeqCst), 0);
        assert_eq!(manager.state(), ManagerState::Idle);
        assert!(manager.metrics().shard_metrics().is_empty());
    }

    #[test]
    fn test_repeated_signal_does_not_stand_in_for_missing_shard() {
        let (manager, delegate, _log) = manager();
        manager.shatter(3);

        manager.shard(0).signals.connected();
        manager.shard(0).signals.connected();
        manager.shard(1).signals.connected();
        manager.shard(1).signals.connected();
        assert_eq!(manager.connected_count(), 2);
        assert_eq!(delegate.connected.load(Ordering::SeqCst), 0);

        manager.shard(2).signals.connected();
        assert_eq!(delegate.connected.load(Ordering::SeqCst), 1);

        manager.disconnect();
        manager.shard(0).signals.disconnected();
        manager.shard(0).signals.disconnected();
        manager.shard(1).signals.disconnected();
        assert!(delegate.disconnected.lock().is_empty());
    }

    #[test]
    fn test_manual_shard_signals_use_its_own_index() {
        let (manager, delegate, _log) = manager();
        manager
            .manually_shatter(ShardInfo { index: 5, total: 8 })
            .expect("valid info");

        manager.signal_shard_connected(0);
        assert_eq!(manager.connected_count(), 0);

        manager.shard(5).signals.connected();
        assert_eq!(delegate.connected.load(Ordering::SeqCst), 1);
        let tracked: Vec<usize> = manager
            .metrics()
            .shard_metrics()
            .iter()
            .map(|s| s.shard_index)
            .collect();
        assert_eq!(tracked, vec![5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_right_after_disconnect_starts_new_cycle() {
        let (manager, delegate, log) = manager_with(Duration::ZERO, None);
        manager.shatter(2);

        manager.connect();
        settle().await;
        for shard in manager.shards() {
            shard.signals.connected();
        }
        assert_eq!(manager.state(), ManagerState::Connected);

        // Connecting again while connected changes nothing
        manager.connect();
        settle().await;
        assert_eq!(log.lock().len(), 2);

        // Shards have not reported closed yet when the reconnect arrives
        manager.disconnect();
        manager.connect();
        settle().await;

        assert!(!manager.is_closed());
        assert_eq!(manager.state(), ManagerState::Connecting);
        assert_eq!(manager.connected_count(), 0);
        assert_eq!(log.lock().len(), 4);
        assert!(manager.shards().iter().all(|s| s.is_connected()));

        for shard in manager.shards() {
            shard.signals.connected();
        }
        assert_eq!(manager.state(), ManagerState::Connected);
        assert_eq!(delegate.connected.load(Ordering::SeqCst), 2);
    }
}
