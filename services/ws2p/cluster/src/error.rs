//! Cluster errors.

use thiserror::Error;
use ws2p_session::ConnectionError;
use ws2p_wire::WireError;

/// Errors raised by the cluster overlay
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Configuration cannot be used
    #[error("Invalid cluster configuration: {0}")]
    Config(String),

    /// The admission policy refused the key
    #[error("Connection to {0} refused")]
    Refused(String),

    /// The listener could not be started
    #[error("Cannot listen: {0}")]
    Listen(String),

    /// Session level failure
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// A remote answered with something we cannot use
    #[error("Unexpected answer to {request}: {reason}")]
    UnexpectedAnswer {
        /// Request name
        request: String,
        /// What was wrong
        reason: String,
    },

    /// Wire decoding failure
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The chain backend failed
    #[error("Backend error: {0}")]
    Backend(String),
}

impl ClusterError {
    pub(crate) fn unexpected(request: &str, reason: impl Into<String>) -> Self {
        Self::UnexpectedAnswer {
            request: request.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<anyhow::Error> for ClusterError {
    fn from(e: anyhow::Error) -> Self {
        Self::Backend(format!("{:#}", e))
    }
}
