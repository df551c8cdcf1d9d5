//! Error types for the group communication layer

use crate::config::PartyId;

/// Errors surfaced by channels, the connection bootstrap and the network.
///
/// Every variant tied to a single peer carries that peer's id; see
/// [`Error::peer`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Malformed group descriptor or network configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Bind/listen/accept/connect failed and was not resolved within the retry policy
    #[error("connection error (party {local}, peer {remote}, port {port}): {reason}")]
    Connection {
        local: PartyId,
        remote: PartyId,
        port: u16,
        reason: String,
    },

    /// Both ends of a pair resolved to the same role
    #[error("role collision between party {local} and peer {remote}")]
    RoleCollision { local: PartyId, remote: PartyId },

    /// The peer closed its stream before the requested bytes were transferred
    #[error("connection to peer {peer} lost after {transferred} of {expected} bytes")]
    ConnectionLost {
        peer: PartyId,
        expected: usize,
        transferred: usize,
    },

    /// A send or receive did not complete within the configured deadline.
    /// If any bytes had moved the channel is no longer usable.
    #[error("{operation} with peer {peer} timed out after {transferred} bytes")]
    Timeout {
        peer: PartyId,
        operation: &'static str,
        transferred: usize,
    },

    /// Operation invoked in the wrong state or with an out-of-range party id
    #[error("protocol misuse: {0}")]
    Misuse(String),

    /// Unexpected I/O failure on an established stream
    #[error("IO error with peer {peer}: {source}")]
    Io {
        peer: PartyId,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Returns true for errors raised while setting up the group, which
    /// callers usually treat as fatal for the whole process.
    pub fn is_fatal_setup(&self) -> bool {
        matches!(
            self,
            Error::Configuration(_) | Error::Connection { .. } | Error::RoleCollision { .. }
        )
    }

    /// The peer this error is attributed to, if any.
    pub fn peer(&self) -> Option<PartyId> {
        match self {
            Error::Connection { remote, .. } | Error::RoleCollision { remote, .. } => Some(*remote),
            Error::ConnectionLost { peer, .. }
            | Error::Timeout { peer, .. }
            | Error::Io { peer, .. } => Some(*peer),
            Error::Configuration(_) | Error::Misuse(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
