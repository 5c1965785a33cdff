use crate::error::Error;
use std::future::Future;
use std::sync::Weak;
use tracing::trace;

/// Identity of one shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShardInfo {
    /// Shard index, `0..total`
    pub index: usize,
    /// Number of shards the bot runs across all processes
    pub total: usize,
}

impl ShardInfo {
    /// Create a shard identity.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidShardInfo` unless `index < total`.
    pub fn new(index: usize, total: usize) -> Result<Self, Error> {
        if index >= total {
            return Err(Error::InvalidShardInfo { index, total });
        }
        Ok(Self { index, total })
    }
}

/// Trait that gateway connection engines implement to be driven by the
/// shard manager.
///
/// Handshake, heartbeats and event dispatch are the implementor's concern.
/// The manager only starts, stops and addresses shards; shards report back
/// through the [`ShardSignals`] handed to them at construction.
pub trait Shard: Send + Sync + 'static {
    /// Gateway payload type accepted by this shard
    type Payload: Send + 'static;

    /// This shard's identity
    fn info(&self) -> ShardInfo;

    /// Open the gateway connection.
    ///
    /// Should return once the connection attempt has been made; reaching the
    /// ready state is reported separately with [`ShardSignals::connected`].
    fn connect(&self) -> impl Future<Output = Result<(), Error>> + Send;

    /// Close the gateway connection. Fire-and-forget.
    fn disconnect(&self);

    /// Send a payload over this shard's connection.
    fn send_gateway_payload(
        &self,
        payload: Self::Payload,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Whether the connection is currently up
    fn is_connected(&self) -> bool;
}

/// Builds the shards for a manager.
///
/// Implemented for any `Fn(ShardInfo, ShardSignals) -> S`.
pub trait ShardFactory: Send + Sync + 'static {
    /// Shard type produced
    type Shard: Shard;

    /// Create the shard for `info`, wired to report through `signals`.
    fn create(&self, info: ShardInfo, signals: ShardSignals) -> Self::Shard;
}

impl<S, F> ShardFactory for F
where
    S: Shard,
    F: Fn(ShardInfo, ShardSignals) -> S + Send + Sync + 'static,
{
    type Shard = S;

    fn create(&self, info: ShardInfo, signals: ShardSignals) -> S {
        self(info, signals)
    }
}

/// Receiver of shard lifecycle signals (the manager's shared state)
pub(crate) trait SignalSink: Send + Sync {
    fn shard_connected(&self, index: usize, generation: u64);
    fn shard_disconnected(&self, index: usize, generation: u64);
}

/// Non-owning handle a shard uses to report lifecycle events to its manager.
///
/// Never keeps the manager alive. Signals from a shard whose set has since
/// been rebuilt with `shatter` are ignored.
#[derive(Clone)]
pub struct ShardSignals {
    sink: Weak<dyn SignalSink>,
    index: usize,
    generation: u64,
}

impl ShardSignals {
    pub(crate) fn new(sink: Weak<dyn SignalSink>, index: usize, generation: u64) -> Self {
        Self {
            sink,
            index,
            generation,
        }
    }

    /// Report that the shard finished its handshake and is ready.
    pub fn connected(&self) {
        match self.sink.upgrade() {
            Some(sink) => sink.shard_connected(self.index, self.generation),
            None => trace!("[SHARD-{}] Manager gone, dropping connected signal", self.index),
        }
    }

    /// Report that the shard's connection closed.
    pub fn disconnected(&self) {
        match self.sink.upgrade() {
            Some(sink) => sink.shard_disconnected(self.index, self.generation),
            None => trace!("[SHARD-{}] Manager gone, dropping disconnected signal", self.index),
        }
    }

    /// Index of the shard this handle reports for
    pub fn shard_index(&self) -> usize {
        self.index
    }
}

impl std::fmt::Debug for ShardSignals {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardSignals")
            .field("index", &self.index)
            .field("generation", &self.generation)
            .finish()
    }
}
