//! Sealed datagrams for the UDP tunnel.
//!
//! Wire layout of a sealed datagram body:
//!
//! ```text
//! +----------------------------+----------------------------+-----------+
//! | prefix (8 bytes, BE)       | ciphertext                 | tag (16)  |
//! | bit 63 = DF, 0..62 = seq   |                            |           |
//! +----------------------------+----------------------------+-----------+
//! ```
//!
//! The sequence number doubles as the nonce counter. Because datagrams may
//! be lost or reordered, the opener validates sequence numbers against a
//! [`ReplayWindow`] instead of expecting a strict successor.

use chacha20poly1305::aead::Aead;
use chacha20poly1305::ChaCha20Poly1305;

use crate::error::CryptoError;
use crate::keys::SessionKey;
use crate::nonce::{make_nonce, Polarity, Transport, TAG_SIZE};
use crate::replay::ReplayWindow;

/// Size of the sequence/flag prefix in bytes.
pub const DATAGRAM_PREFIX_SIZE: usize = 8;

const DF_FLAG: u64 = 1 << 63;
const MAX_SEQ: u64 = DF_FLAG - 1;

/// Seals outgoing datagram bodies for one forwarder.
pub struct DatagramSealer {
    cipher: ChaCha20Poly1305,
    polarity: Polarity,
    seq: u64,
}

impl DatagramSealer {
    /// Bytes added to every sealed datagram body.
    pub const OVERHEAD: usize = DATAGRAM_PREFIX_SIZE + TAG_SIZE;

    /// Creates a sealer for the local side of a connection.
    #[must_use]
    pub fn new(key: &SessionKey, outbound: bool) -> Self {
        Self {
            cipher: key.cipher(),
            polarity: Polarity::local(outbound),
            seq: 0,
        }
    }

    /// Seals `plain`, recording whether it travels on the don't-fragment path.
    pub fn seal(&mut self, plain: &[u8], df: bool) -> Result<Vec<u8>, CryptoError> {
        if self.seq > MAX_SEQ {
            return Err(CryptoError::SequenceExhausted);
        }
        let seq = self.seq;
        self.seq += 1;

        let prefix = if df { seq | DF_FLAG } else { seq };
        let nonce = make_nonce(self.polarity, Transport::Udp, seq);
        let sealed = self.cipher.encrypt(&nonce, plain).map_err(|_| CryptoError::Seal)?;

        let mut out = Vec::with_capacity(DATAGRAM_PREFIX_SIZE + sealed.len());
        out.extend_from_slice(&prefix.to_be_bytes());
        out.extend_from_slice(&sealed);
        Ok(out)
    }
}

impl std::fmt::Debug for DatagramSealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatagramSealer")
            .field("polarity", &self.polarity)
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}

/// A datagram body that passed authentication and replay checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedDatagram {
    /// Whether the sender marked the datagram don't-fragment.
    pub df: bool,
    /// Sequence number carried in the prefix.
    pub seq: u64,
    /// Decrypted body.
    pub payload: Vec<u8>,
}

/// Opens incoming datagram bodies for one forwarder.
pub struct DatagramOpener {
    cipher: ChaCha20Poly1305,
    polarity: Polarity,
    window: ReplayWindow,
}

impl DatagramOpener {
    /// Creates an opener for the local side of a connection.
    #[must_use]
    pub fn new(key: &SessionKey, outbound: bool) -> Self {
        Self {
            cipher: key.cipher(),
            polarity: Polarity::local(outbound).opposite(),
            window: ReplayWindow::new(),
        }
    }

    /// Authenticates, decrypts and replay-checks one datagram body.
    ///
    /// The replay window is only advanced by datagrams that authenticate, so
    /// forged prefixes cannot push it forward.
    pub fn open(&mut self, datagram: &[u8]) -> Result<OpenedDatagram, CryptoError> {
        let min = DatagramSealer::OVERHEAD;
        if datagram.len() < min {
            return Err(CryptoError::Truncated {
                len: datagram.len(),
                min,
            });
        }
        let (prefix_bytes, body) = datagram.split_at(DATAGRAM_PREFIX_SIZE);
        let mut prefix = [0u8; DATAGRAM_PREFIX_SIZE];
        prefix.copy_from_slice(prefix_bytes);
        let prefix = u64::from_be_bytes(prefix);
        let df = prefix & DF_FLAG != 0;
        let seq = prefix & MAX_SEQ;

        self.window.check(seq)?;
        let nonce = make_nonce(self.polarity, Transport::Udp, seq);
        let payload = self.cipher.decrypt(&nonce, body).map_err(|_| CryptoError::Open)?;
        self.window.accept(seq)?;

        Ok(OpenedDatagram { df, seq, payload })
    }
}

impl std::fmt::Debug for DatagramOpener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatagramOpener")
            .field("polarity", &self.polarity)
            .field("window", &self.window.current_base())
            .finish_non_exhaustive()
    }
}
