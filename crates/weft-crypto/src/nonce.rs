//! Nonce layout shared by the stream and datagram ciphers.
//!
//! The 96-bit ChaCha20-Poly1305 nonce is built as:
//! - bit 7 of byte 0: polarity, set for messages sent by the dialling side
//! - bit 6 of byte 0: transport, set for TCP messages
//! - bytes 4..12: big-endian sequence number
//!
//! Polarity keeps the two directions of one connection from ever reusing a
//! nonce; the transport bit does the same for TCP and UDP traffic sealed
//! under the same session key.

use chacha20poly1305::Nonce;

/// Nonce size in bytes (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Size of the authentication tag in bytes (128 bits).
pub const TAG_SIZE: usize = 16;

const POLARITY_BIT: u8 = 1 << 7;
const TRANSPORT_BIT: u8 = 1 << 6;

/// Which end of a connection produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    /// Sent by the side that dialled the connection.
    Outbound,
    /// Sent by the side that accepted the connection.
    Inbound,
}

impl Polarity {
    /// Returns the polarity for the local side of a connection.
    #[must_use]
    pub const fn local(outbound: bool) -> Self {
        if outbound { Self::Outbound } else { Self::Inbound }
    }

    /// Returns the polarity used by the other end.
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Outbound => Self::Inbound,
            Self::Inbound => Self::Outbound,
        }
    }
}

/// Transport a sealed message travels over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Reliable, ordered stream.
    Tcp,
    /// Unreliable datagrams.
    Udp,
}

/// Builds the nonce for one message.
#[must_use]
pub fn make_nonce(polarity: Polarity, transport: Transport, seq: u64) -> Nonce {
    let mut bytes = [0u8; NONCE_SIZE];
    if polarity == Polarity::Outbound {
        bytes[0] |= POLARITY_BIT;
    }
    if transport == Transport::Tcp {
        bytes[0] |= TRANSPORT_BIT;
    }
    bytes[NONCE_SIZE - 8..].copy_from_slice(&seq.to_be_bytes());
    Nonce::from(bytes)
}
