//! # weft-crypto
//!
//! Cryptographic session layer for the weft overlay network.
//!
//! This crate provides:
//!
//! - X25519 key pairs and password-bound session key derivation
//! - Sealed, ordered message streams for the reliable (TCP) transport
//! - Sealed datagrams with sequence prefixes and anti-replay for the UDP tunnel
//!
//! ## Core Types
//!
//! - [`KeyPair`] / [`PublicKey`]: Curve25519 key material exchanged during the handshake
//! - [`SessionKey`]: Symmetric key shared by both ends of one connection
//! - [`MessageSealer`] / [`MessageOpener`]: Per-direction TCP message crypto
//! - [`DatagramSealer`] / [`DatagramOpener`]: Per-direction UDP datagram crypto
//! - [`ReplayWindow`]: Two-window sliding replay detector

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod datagram;
pub mod error;
pub mod keys;
pub mod nonce;
pub mod replay;
pub mod stream;

pub use datagram::{DatagramOpener, DatagramSealer, OpenedDatagram, DATAGRAM_PREFIX_SIZE};
pub use error::CryptoError;
pub use keys::{KeyPair, PublicKey, SessionKey, KEY_SIZE};
pub use nonce::{Polarity, Transport, NONCE_SIZE, TAG_SIZE};
pub use replay::{ReplayWindow, REPLAY_WINDOW};
pub use stream::{MessageOpener, MessageSealer};
