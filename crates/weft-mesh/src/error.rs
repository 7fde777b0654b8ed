//! Error types for weft-mesh.

use thiserror::Error;

use crate::peer::{PeerName, PeerUid};

/// Errors that can occur in mesh operations.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Connection-level failure.
    #[error("connection error: {0}")]
    Connection(String),

    /// Handshake failed before the connection was registered.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Protocol violation on an established connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Gossip delivery or relay failure.
    #[error("gossip error: {0}")]
    Gossip(String),

    /// Malformed wire data.
    #[error("decode error: {0}")]
    Decode(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Remote requested an unencrypted connection but we hold a password.
    #[error("password specified, but peer requested an unencrypted connection")]
    ExpectedCrypto,

    /// Remote requested an encrypted connection but we have no password.
    #[error("no password specified, but peer requested an encrypted connection")]
    ExpectedNoCrypto,

    /// The remote end of the connection is ourselves.
    #[error("cannot connect to ourself")]
    ConnectToSelf,

    /// Same name, different incarnation.
    #[error("name collision: {name} is known with uid {known}, update has uid {received}")]
    NameCollision {
        /// Colliding peer name.
        name: PeerName,
        /// UID already registered locally.
        known: PeerUid,
        /// UID carried by the rejected candidate.
        received: PeerUid,
    },

    /// Topology update references a peer we know nothing about.
    #[error("update references unknown peer {0}")]
    UnknownPeer(PeerName),

    /// Another connection to the same peer won (or tied) the tie-break.
    #[error("duplicate connection to {remote}: {outcome}")]
    Duplicate {
        /// Peer both connections lead to.
        remote: PeerName,
        /// How the tie-break was resolved.
        outcome: String,
    },

    /// Connection limit reached.
    #[error("connection limit reached ({0})")]
    ConnectionLimit(usize),

    /// Timed out waiting for a heartbeat.
    #[error("timed out waiting for {0} heartbeat")]
    HeartbeatTimeout(&'static str),

    /// A task or queue has shut down.
    #[error("{0} has shut down")]
    Shutdown(&'static str),

    /// Crypto failure.
    #[error("crypto error: {0}")]
    Crypto(#[from] weft_crypto::CryptoError),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<prost::DecodeError> for MeshError {
    fn from(err: prost::DecodeError) -> Self {
        Self::Decode(err.to_string())
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}
