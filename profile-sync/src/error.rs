//! Error taxonomy for the replication core.
//!
//! None of these are fatal to a [`SubscriptionManager`](crate::SubscriptionManager):
//! connection and timeout errors move on to the next relay or to the cache,
//! parse errors keep the last known-good value, cache errors are logged and
//! treated as a miss.

use std::time::Duration;

use crate::protocol::ProtocolError;

/// Boxed error returned by a listener callback.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Relay unreachable or the WebSocket handshake failed.
    #[error("connection to {relay} failed: {reason}")]
    Connection { relay: String, reason: String },

    /// Health probe said no before a connection was attempted.
    #[error("relay {0} is unreachable")]
    Unreachable(String),

    /// No data within the configured bound.
    #[error("no data within {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The link was opened as an observer and cannot write.
    #[error("connection role is read-only")]
    ReadOnly,

    /// The replica has no live relay connection.
    #[error("replica is not connected to a relay")]
    NotConnected,
}

impl RelayError {
    pub(crate) fn connection(relay: &str, reason: impl ToString) -> Self {
        RelayError::Connection {
            relay: relay.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Soft failures fall through to the next resolution step.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            RelayError::Connection { .. } | RelayError::Unreachable(_) | RelayError::Timeout(_)
        )
    }
}
