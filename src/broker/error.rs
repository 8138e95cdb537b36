//! Transport Error Types

use thiserror::Error;

/// Errors raised by the queue transport.
///
/// None of these are fatal to the process: the producer and consumer contain
/// them and fall back to reconnecting (or buffering).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Broker unreachable or the connection dropped
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection attempt timed out after {0} ms")]
    Timeout(u64),

    /// Channel-level failure, handled exactly like connection loss
    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("No open connection")]
    NotConnected,

    /// Broker did not confirm (or negatively confirmed) a publish
    #[error("Publish not confirmed: {0}")]
    PublishUnconfirmed(String),

    #[error("Queue not found: {0}")]
    QueueNotFound(String),
}

impl BrokerError {
    /// True when the error means the link to the broker is gone and the
    /// owner should mark itself disconnected and reconnect.
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            BrokerError::Connection(_)
                | BrokerError::ConnectionClosed
                | BrokerError::Timeout(_)
                | BrokerError::Channel(_)
                | BrokerError::ChannelClosed
                | BrokerError::NotConnected
        )
    }
}

impl From<lapin::Error> for BrokerError {
    fn from(e: lapin::Error) -> Self {
        match e {
            lapin::Error::InvalidChannelState(_) => BrokerError::ChannelClosed,
            lapin::Error::InvalidConnectionState(_) => BrokerError::ConnectionClosed,
            lapin::Error::IOError(io) => BrokerError::Connection(io.to_string()),
            lapin::Error::ProtocolError(p) => BrokerError::Channel(p.to_string()),
            other => BrokerError::Connection(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_failure_classification() {
        assert!(BrokerError::ConnectionClosed.is_link_failure());
        assert!(BrokerError::ChannelClosed.is_link_failure());
        assert!(BrokerError::Channel("precondition".into()).is_link_failure());
        assert!(BrokerError::Timeout(10_000).is_link_failure());

        assert!(!BrokerError::PublishUnconfirmed("nack".into()).is_link_failure());
        assert!(!BrokerError::QueueNotFound("q".into()).is_link_failure());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            BrokerError::Timeout(10_000).to_string(),
            "Connection attempt timed out after 10000 ms"
        );
    }
}
