//! Status notifications published by the cluster.

use std::fmt;

/// Tier of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionLevel {
    /// Opened by us (level 1)
    Outbound,
    /// Accepted by our server (level 2)
    Inbound,
}

impl fmt::Display for ConnectionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionLevel::Outbound => write!(f, "level 1"),
            ConnectionLevel::Inbound => write!(f, "level 2"),
        }
    }
}

/// Something worth telling the node operator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    /// A session completed its handshake
    Connected {
        /// Remote key
        pubkey: String,
        /// Dialed URL or remote socket address
        address: String,
        /// Tier of the session
        level: ConnectionLevel,
    },
    /// A session was closed
    Disconnected {
        /// Remote key
        pubkey: String,
        /// Tier of the session
        level: ConnectionLevel,
    },
    /// A key was banned
    Banned {
        /// Banned key
        pubkey: String,
        /// Why
        reason: String,
    },
    /// A batch of heads was spread
    HeadsSpread {
        /// Heads in the batch
        heads: usize,
        /// Sessions the batch was pushed to
        peers: usize,
    },
}
