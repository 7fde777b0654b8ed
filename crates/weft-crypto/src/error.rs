//! Error types for weft-crypto.

use thiserror::Error;

/// Errors that can occur in session crypto operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    /// Invalid key length.
    #[error("invalid key length: expected 32, got {0}")]
    InvalidKeyLength(usize),

    /// Invalid hex encoding.
    #[error("invalid hex encoding: {0}")]
    InvalidHex(String),

    /// Remote public key is a low-order point.
    #[error("remote public key is weak")]
    WeakKey,

    /// Authenticated encryption failed.
    #[error("encryption failed")]
    Seal,

    /// Authentication or decryption failed.
    #[error("decryption failed")]
    Open,

    /// Ciphertext shorter than the fixed framing.
    #[error("ciphertext too short: {len} bytes, need at least {min}")]
    Truncated {
        /// Length received.
        len: usize,
        /// Minimum acceptable length.
        min: usize,
    },

    /// Sequence number was already accepted or is too old.
    #[error("replayed or stale sequence number {0}")]
    Replay(u64),

    /// Sequence counter exhausted; the session must be re-keyed.
    #[error("sequence number space exhausted")]
    SequenceExhausted,
}
