//! Sealed messages over the reliable transport.
//!
//! TCP delivers messages in order, so both ends simply count: the sealer
//! uses its own sequence number as the nonce and the opener expects exactly
//! the next one. Any reordering, drop or injected message makes the
//! authentication check fail and is fatal to the connection.

use chacha20poly1305::aead::Aead;
use chacha20poly1305::ChaCha20Poly1305;

use crate::error::CryptoError;
use crate::keys::SessionKey;
use crate::nonce::{make_nonce, Polarity, Transport};

/// Seals outgoing TCP messages for one connection.
pub struct MessageSealer {
    cipher: ChaCha20Poly1305,
    polarity: Polarity,
    seq: u64,
}

impl MessageSealer {
    /// Creates a sealer for the local side of a connection.
    #[must_use]
    pub fn new(key: &SessionKey, outbound: bool) -> Self {
        Self {
            cipher: key.cipher(),
            polarity: Polarity::local(outbound),
            seq: 0,
        }
    }

    /// Encrypts and authenticates one message.
    pub fn seal(&mut self, msg: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = make_nonce(self.polarity, Transport::Tcp, self.seq);
        self.seq = self.seq.checked_add(1).ok_or(CryptoError::SequenceExhausted)?;
        self.cipher.encrypt(&nonce, msg).map_err(|_| CryptoError::Seal)
    }
}

impl std::fmt::Debug for MessageSealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageSealer")
            .field("polarity", &self.polarity)
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}

/// Opens incoming TCP messages for one connection.
pub struct MessageOpener {
    cipher: ChaCha20Poly1305,
    polarity: Polarity,
    seq: u64,
}

impl MessageOpener {
    /// Creates an opener for the local side of a connection.
    ///
    /// Messages are expected with the remote side's polarity.
    #[must_use]
    pub fn new(key: &SessionKey, outbound: bool) -> Self {
        Self {
            cipher: key.cipher(),
            polarity: Polarity::local(outbound).opposite(),
            seq: 0,
        }
    }

    /// Authenticates and decrypts the next message.
    pub fn open(&mut self, msg: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = make_nonce(self.polarity, Transport::Tcp, self.seq);
        let plain = self.cipher.decrypt(&nonce, msg).map_err(|_| CryptoError::Open)?;
        self.seq = self.seq.checked_add(1).ok_or(CryptoError::SequenceExhausted)?;
        Ok(plain)
    }
}

impl std::fmt::Debug for MessageOpener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageOpener")
            .field("polarity", &self.polarity)
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}
