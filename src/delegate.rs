use std::fmt;

/// Why the manager considers itself disconnected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect()` was called before every shard had connected
    ClosedBeforeConnected,
    /// Every shard reported that its connection closed
    AllShardsDisconnected,
}

impl DisconnectReason {
    /// Human-readable reason
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::ClosedBeforeConnected => "manager closed before all shards connected",
            DisconnectReason::AllShardsDisconnected => "all shards disconnected",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trait that clients implement to learn about manager-level lifecycle changes.
///
/// The manager holds its delegate weakly; the enclosing client owns it.
/// Callbacks run on whichever task delivered the triggering shard signal (or
/// the caller of `disconnect()`), after the manager's lock is released, so a
/// delegate may call back into the manager.
///
/// # Example
///
/// ```ignore
/// use gateway_flow::{DisconnectReason, ManagerDelegate};
///
/// struct Client;
///
/// impl ManagerDelegate for Client {
///     fn on_manager_connected(&self) {
///         tracing::info!("all shards ready");
///     }
///
///     fn on_manager_disconnected(&self, reason: &DisconnectReason) {
///         tracing::warn!("gateway down: {}", reason);
///     }
/// }
/// ```
pub trait ManagerDelegate: Send + Sync {
    /// Called once when every shard has reported connected.
    fn on_manager_connected(&self);

    /// Called once per connect cycle when the manager becomes disconnected.
    fn on_manager_disconnected(&self, reason: &DisconnectReason);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_display() {
        assert_eq!(
            DisconnectReason::AllShardsDisconnected.to_string(),
            "all shards disconnected"
        );
        assert_eq!(
            DisconnectReason::ClosedBeforeConnected.to_string(),
            DisconnectReason::ClosedBeforeConnected.as_str()
        );
    }
}
