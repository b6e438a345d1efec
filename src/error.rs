//! Error types for the bridge subsystems.

use thiserror::Error;

/// Connection-level errors reported by the transport worker.
///
/// These are never thrown across threads; they travel inside the
/// [`ConnectionStatus`](crate::transport::ConnectionStatus) snapshot so any
/// caller can inspect the last failure without blocking.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    /// Broker unreachable or the socket dropped. Recovered locally via
    /// the reconnect loop.
    #[error("network error: {0}")]
    Network(String),

    /// Broker rejected the session (bad credentials, bad client id).
    /// Fatal: requires a fresh `connect()` from the caller.
    #[error("broker refused connection: {0}")]
    Refused(String),

    /// Broker and client disagree on the protocol. Fatal.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Handshake or network operation exceeded its bound.
    #[error("timed out waiting for broker")]
    Timeout,
}

impl ConnectError {
    /// Fatal errors stop the reconnect loop; everything else is retried
    /// with backoff until the caller disconnects.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConnectError::Refused(_) | ConnectError::ProtocolViolation(_))
    }
}

/// Terminal failure reasons for an outbound command, surfaced through
/// its [`CommandHandle`](crate::message::CommandHandle).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    /// The outbound queue is at capacity; the command was not enqueued.
    #[error("outbound queue full")]
    QueueFull,

    /// The command exceeded its max age before it could be delivered.
    #[error("command expired before delivery")]
    Expired,

    /// The broker (or the client request pipeline) rejected the publish
    /// after the retry budget was exhausted.
    #[error("broker rejected publish: {0}")]
    BrokerRejected(String),
}

/// Errors returned by the facade's control operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// A background worker is gone and can no longer accept commands.
    #[error("bridge worker unavailable: {0}")]
    WorkerUnavailable(String),

    /// A subscribe request could not be handed to the MQTT client.
    #[error("subscribe request failed: {0}")]
    Subscribe(String),

    /// An unsubscribe request could not be handed to the MQTT client.
    #[error("unsubscribe request failed: {0}")]
    Unsubscribe(String),
}

/// Errors while loading the bridge configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Failure of a single request handed to the MQTT client.
///
/// Used at the seam between the workers and the client so the workers can
/// be exercised against a fake client in tests.
#[derive(Debug, Error)]
#[error("client request failed: {0}")]
pub(crate) struct RequestError(pub String);
