//! Errors produced by the ticker stream.

use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::stream::proto::DecodeError;

/// Errors produced by stream configuration, transport and protocol handling.
#[derive(Debug, Error)]
pub enum TickerError {
    /// Invalid reconnect policy or client configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Websocket dial or handshake failure.
    #[error("connect failed: {0}")]
    Connect(#[source] WsError),

    /// Transport handshake or authentication reply did not finish in time.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Malformed or empty authentication reply.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Feed token or client code rejected by the server.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Inbound frame could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Read or write failure on an established session.
    #[error("transport error: {0}")]
    Transport(#[source] WsError),

    /// Peer closed the socket or the stream ended.
    #[error("connection closed")]
    ConnectionClosed,

    /// Control frame serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Write requested while no session is live.
    #[error("no active session")]
    NotConnected,

    /// A session task panicked or was aborted.
    #[error("session task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// Reconnect attempts went past the configured ceiling.
    #[error("reconnect attempts exhausted after {attempts} attempts")]
    RetryExhausted { attempts: u32 },
}

impl TickerError {
    /// Returns `true` when backing off and dialing again can fix the failure.
    ///
    /// Rejected credentials and bad configuration never recover on retry.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            TickerError::Config(_) | TickerError::Auth(_) | TickerError::RetryExhausted { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_tungstenite::tungstenite::Error as WsError;

    use super::TickerError;

    #[test]
    fn credential_and_config_failures_are_not_retryable() {
        assert!(!TickerError::Auth("invalid feed token or client code".to_string()).is_retryable());
        assert!(!TickerError::Config("bad".to_string()).is_retryable());
        assert!(!TickerError::RetryExhausted { attempts: 3 }.is_retryable());
    }

    #[test]
    fn transport_and_protocol_failures_are_retryable() {
        assert!(TickerError::Connect(WsError::ConnectionClosed).is_retryable());
        assert!(TickerError::ConnectTimeout(Duration::from_secs(7)).is_retryable());
        assert!(TickerError::Protocol("invalid message".to_string()).is_retryable());
        assert!(TickerError::Transport(WsError::AlreadyClosed).is_retryable());
        assert!(TickerError::ConnectionClosed.is_retryable());
    }
}
