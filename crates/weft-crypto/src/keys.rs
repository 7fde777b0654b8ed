//! Handshake key material.
//!
//! Each connection generates a fresh X25519 key pair when a password is
//! configured. Both sides combine the Diffie-Hellman shared secret with the
//! password through SHA-256 to obtain the [`SessionKey`], so a peer without
//! the password derives a different key and every sealed message fails to
//! open.

use std::fmt;

use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit};
use rand_core::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Key size in bytes (256-bit Curve25519 keys and ChaCha20 keys).
pub const KEY_SIZE: usize = 32;

/// A Curve25519 public key as exchanged in the handshake.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; KEY_SIZE]);

impl PublicKey {
    /// Creates a public key from raw bytes.
    #[must_use]
    pub const fn from_bytes_array(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Creates a public key from a byte slice.
    ///
    /// # Errors
    ///
    /// Returns an error if the slice is not exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength(bytes.len()))?;
        Ok(Self(arr))
    }

    /// Returns the raw bytes of the public key.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Encodes the key as lowercase hex, as carried in version 1 handshakes.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Decodes a public key from hex.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not valid hex or has the wrong length.
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s).map_err(|e| CryptoError::InvalidHex(e.to_string()))?;
        Self::from_bytes(&bytes)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<X25519PublicKey> for PublicKey {
    fn from(key: X25519PublicKey) -> Self {
        Self::from_bytes_array(*key.as_bytes())
    }
}

/// An ephemeral X25519 key pair generated for one handshake.
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Generates a new random key pair.
    #[must_use]
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(X25519PublicKey::from(&secret));
        Self { secret, public }
    }

    /// Returns the public half.
    #[must_use]
    pub const fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Derives the session key shared with `remote`.
    ///
    /// The key is `SHA-256(shared_secret || password)`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::WeakKey`] if the remote key is a low-order point
    /// and the exchange would not be contributory.
    pub fn session_key(&self, remote: &PublicKey, password: &[u8]) -> Result<SessionKey, CryptoError> {
        let shared = self
            .secret
            .diffie_hellman(&X25519PublicKey::from(*remote.as_bytes()));
        if !shared.was_contributory() {
            return Err(CryptoError::WeakKey);
        }
        let mut hasher = Sha256::new();
        hasher.update(shared.as_bytes());
        hasher.update(password);
        Ok(SessionKey(hasher.finalize().into()))
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Symmetric key for one connection.
///
/// The key is securely zeroized when dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; KEY_SIZE]);

impl SessionKey {
    /// Creates a session key from raw bytes.
    #[must_use]
    pub const fn from_bytes_array(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Returns the raw key bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    pub(crate) fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(&Key::from(self.0))
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKey([REDACTED])")
    }
}
