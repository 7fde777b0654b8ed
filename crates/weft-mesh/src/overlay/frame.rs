//! Sleeve datagram layout.
//!
//! A datagram is the sender's peer name followed by a body of frames,
//! `src(6) dst(6) len(u16 BE) frame`. On encrypted forwarders the body is
//! sealed as a whole, so the DF flag and sequence number travel in the
//! sealed prefix.
//!
//! Frames whose 14-byte Ethernet header is all zeros are special frames
//! produced by the forwarders themselves and are told apart by length.

use bytes::{Buf, BufMut};
use weft_crypto::{DatagramOpener, DatagramSealer};

use crate::error::MeshError;
use crate::peer::{PeerName, NAME_SIZE};

/// Ethernet header size; MTUs exclude it but captured frames include it.
pub const ETHERNET_OVERHEAD: usize = 14;

/// Per-frame header: source name, destination name, length.
pub const FRAME_OVERHEAD: usize = NAME_SIZE * 2 + 2;

/// IPv4 plus UDP header size.
pub const UDP_OVERHEAD: usize = 28;

/// Largest UDP datagram we read.
pub const MAX_UDP_PACKET_SIZE: usize = 65536;

/// Size of the all-zero fragmentation test frame.
pub const FRAG_TEST_SIZE: usize = 60001;

/// Size of the frame that kicks off PMTU discovery.
pub const PMTU_DISCOVERY_SIZE: usize = 60000;

/// Size of a heartbeat frame: zero header plus the connection id.
pub const HEARTBEAT_SIZE: usize = ETHERNET_OVERHEAD + 8;

/// Frames queued for one datagram.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    body: Vec<u8>,
    frames: usize,
}

impl FrameBuffer {
    /// Appends a frame.
    pub fn append(&mut self, src: PeerName, dst: PeerName, frame: &[u8]) {
        self.body.put_slice(src.as_bytes());
        self.body.put_slice(dst.as_bytes());
        self.body.put_u16(frame.len() as u16);
        self.body.put_slice(frame);
        self.frames += 1;
    }

    /// Body length so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.body.len()
    }

    /// Returns true if no frame has been appended.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames == 0
    }

    /// Number of frames appended.
    #[must_use]
    pub const fn frames(&self) -> usize {
        self.frames
    }

    /// Takes the body, leaving the buffer empty.
    pub fn take(&mut self) -> Vec<u8> {
        self.frames = 0;
        std::mem::take(&mut self.body)
    }
}

/// Turns frame buffers into datagrams for one remote peer.
pub struct PacketEncoder {
    local: PeerName,
    sealer: Option<DatagramSealer>,
}

impl PacketEncoder {
    /// Creates an encoder; `sealer` is `None` on unencrypted forwarders.
    #[must_use]
    pub const fn new(local: PeerName, sealer: Option<DatagramSealer>) -> Self {
        Self { local, sealer }
    }

    /// Bytes a datagram carries on top of its frames.
    #[must_use]
    pub const fn packet_overhead(&self) -> usize {
        if self.sealer.is_some() {
            NAME_SIZE + DatagramSealer::OVERHEAD
        } else {
            NAME_SIZE
        }
    }

    /// Returns true if `frame` can join `buffer` without the datagram
    /// payload exceeding `limit`.
    #[must_use]
    pub fn fits(&self, buffer: &FrameBuffer, frame: &[u8], limit: usize) -> bool {
        self.packet_overhead() + buffer.body.len() + FRAME_OVERHEAD + frame.len() <= limit
    }

    /// Drains `buffer` into a datagram.
    pub fn encode(&mut self, buffer: &mut FrameBuffer, df: bool) -> Result<Vec<u8>, MeshError> {
        let body = buffer.take();
        let mut packet = Vec::with_capacity(self.packet_overhead() + body.len());
        packet.put_slice(self.local.as_bytes());
        match self.sealer.as_mut() {
            Some(sealer) => packet.put_slice(&sealer.seal(&body, df)?),
            None => packet.put_slice(&body),
        }
        Ok(packet)
    }

    /// Encodes a datagram carrying a single frame from us to `remote`.
    pub fn encode_special(
        &mut self,
        remote: PeerName,
        frame: &[u8],
        df: bool,
    ) -> Result<Vec<u8>, MeshError> {
        let mut buffer = FrameBuffer::default();
        buffer.append(self.local, remote, frame);
        self.encode(&mut buffer, df)
    }
}

impl std::fmt::Debug for PacketEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketEncoder")
            .field("local", &self.local)
            .field("encrypted", &self.sealer.is_some())
            .finish()
    }
}

/// Splits a datagram into its sender name and body.
#[must_use]
pub fn split_sender(datagram: &[u8]) -> Option<(PeerName, &[u8])> {
    if datagram.len() < NAME_SIZE {
        return None;
    }
    let (name, body) = datagram.split_at(NAME_SIZE);
    PeerName::from_bytes(name).ok().map(|name| (name, body))
}

/// Opens a datagram body, if sealed.
pub fn open_body(opener: Option<&mut DatagramOpener>, body: &[u8]) -> Result<Vec<u8>, MeshError> {
    match opener {
        Some(opener) => Ok(opener.open(body)?.payload),
        None => Ok(body.to_vec()),
    }
}

/// Calls `f(src, dst, frame)` for every frame in `body`.
///
/// # Errors
///
/// Returns [`MeshError::Decode`] on a truncated frame; frames before it
/// have already been delivered.
pub fn iterate_frames(
    mut body: &[u8],
    mut f: impl FnMut(PeerName, PeerName, &[u8]),
) -> Result<(), MeshError> {
    while !body.is_empty() {
        if body.len() < FRAME_OVERHEAD {
            return Err(MeshError::Decode(format!(
                "truncated frame header ({} bytes)",
                body.len()
            )));
        }
        let src = PeerName::from_bytes(&body[..NAME_SIZE])?;
        let dst = PeerName::from_bytes(&body[NAME_SIZE..NAME_SIZE * 2])?;
        body.advance(NAME_SIZE * 2);
        let len = usize::from(body.get_u16());
        if body.len() < len {
            return Err(MeshError::Decode(format!(
                "frame length {len} exceeds remaining {}",
                body.len()
            )));
        }
        let (frame, rest) = body.split_at(len);
        f(src, dst, frame);
        body = rest;
    }
    Ok(())
}

/// A frame produced by a forwarder rather than captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialFrame {
    /// Heartbeat carrying the connection id.
    Heartbeat(u64),
    /// Fragmentation test.
    FragTest,
    /// PMTU probe for the given effective PMTU.
    PmtuProbe(usize),
}

impl SpecialFrame {
    /// Classifies `frame`, returning `None` for ordinary frames.
    #[must_use]
    pub fn parse(frame: &[u8]) -> Option<Self> {
        if frame.len() < ETHERNET_OVERHEAD || frame[..ETHERNET_OVERHEAD].iter().any(|b| *b != 0) {
            return None;
        }
        Some(match frame.len() {
            HEARTBEAT_SIZE => {
                let mut uid = &frame[ETHERNET_OVERHEAD..];
                Self::Heartbeat(uid.get_u64())
            }
            FRAG_TEST_SIZE => Self::FragTest,
            len => Self::PmtuProbe(len - ETHERNET_OVERHEAD),
        })
    }

    /// Builds the frame.
    #[must_use]
    pub fn build(self) -> Vec<u8> {
        match self {
            Self::Heartbeat(uid) => {
                let mut frame = vec![0u8; ETHERNET_OVERHEAD];
                frame.put_u64(uid);
                frame
            }
            Self::FragTest => vec![0u8; FRAG_TEST_SIZE],
            Self::PmtuProbe(epmtu) => vec![0u8; epmtu + ETHERNET_OVERHEAD],
        }
    }
}

/// Returns true if every byte of `frame` is zero.
#[must_use]
pub fn all_zeros(frame: &[u8]) -> bool {
    frame.iter().all(|b| *b == 0)
}

/// Overlay control messages sent over the TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMsg {
    /// A heartbeat arrived over UDP.
    HeartbeatAck,
    /// The fragmentation test frame arrived.
    FragTestAck,
    /// A PMTU probe for this effective PMTU arrived.
    PmtuTestAck(u16),
}

impl ControlMsg {
    const HEARTBEAT_ACK: u8 = 0;
    const FRAG_TEST_ACK: u8 = 1;
    const PMTU_TEST_ACK: u8 = 2;

    /// Encodes the message.
    #[must_use]
    pub fn encode(self) -> Vec<u8> {
        match self {
            Self::HeartbeatAck => vec![Self::HEARTBEAT_ACK],
            Self::FragTestAck => vec![Self::FRAG_TEST_ACK],
            Self::PmtuTestAck(epmtu) => {
                let mut msg = vec![Self::PMTU_TEST_ACK];
                msg.put_u16(epmtu);
                msg
            }
        }
    }

    /// Decodes a message.
    pub fn decode(mut msg: &[u8]) -> Result<Self, MeshError> {
        if msg.is_empty() {
            return Err(MeshError::Protocol("empty control message".to_string()));
        }
        match msg.get_u8() {
            Self::HEARTBEAT_ACK => Ok(Self::HeartbeatAck),
            Self::FRAG_TEST_ACK => Ok(Self::FragTestAck),
            Self::PMTU_TEST_ACK if msg.len() >= 2 => Ok(Self::PmtuTestAck(msg.get_u16())),
            Self::PMTU_TEST_ACK => Err(MeshError::Protocol(
                "truncated PMTU test ack".to_string(),
            )),
            other => Err(MeshError::Protocol(format!(
                "unknown control message {other}"
            ))),
        }
    }
}
