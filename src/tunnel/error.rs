use thiserror::Error;

use crate::tunnel::protocol::{ProtocolError, SignalId};

#[derive(Debug, Error)]
pub enum TunnelError {
    /// The uri belongs to another protocol handler.
    #[error("bad scheme: {0}")]
    BadScheme(String),
    #[error("can't parse uri: {0}")]
    BadUri(String),
    /// Caller misconfiguration; retrying will not help.
    #[error("invalid configuration: {0}")]
    Configuration(&'static str),
    /// No connection was delivered for `request()` within the wait window.
    #[error("unable to get a client connection for signal id {0}")]
    ConnectionUnavailable(SignalId),
    #[error("unknown signal id {0}")]
    UnknownSignalId(SignalId),
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("tunnel endpoint closed")]
    Closed,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport: {0:#}")]
    Transport(#[from] anyhow::Error),
}

impl TunnelError {
    /// Errors after which the same call may succeed later: a request that
    /// timed out, or a delegate that could not dial.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TunnelError::ConnectionUnavailable(_) | TunnelError::Transport(_)
        )
    }
}
