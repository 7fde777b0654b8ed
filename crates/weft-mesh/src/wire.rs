//! Prost wire formats for topology updates and gossip envelopes.
//!
//! Peer names travel as raw 6-byte fields; everything else uses the obvious
//! protobuf scalar types.

use prost::Message;

use crate::error::MeshError;
use crate::peer::{Edge, Peer, PeerName};

/// One outgoing edge in a topology update.
#[derive(Clone, PartialEq, Message)]
pub struct EdgeRecord {
    /// Remote peer name.
    #[prost(bytes = "vec", tag = "1")]
    pub remote: Vec<u8>,
    /// Remote TCP address as seen by the owner.
    #[prost(string, tag = "2")]
    pub remote_addr: String,
    /// Whether the owner dialled the connection.
    #[prost(bool, tag = "3")]
    pub outbound: bool,
    /// Whether the connection is established.
    #[prost(bool, tag = "4")]
    pub established: bool,
}

/// One peer in a topology update.
#[derive(Clone, PartialEq, Message)]
pub struct PeerRecord {
    /// Peer name.
    #[prost(bytes = "vec", tag = "1")]
    pub name: Vec<u8>,
    /// Nickname.
    #[prost(string, tag = "2")]
    pub nick_name: String,
    /// Incarnation id.
    #[prost(uint64, tag = "3")]
    pub uid: u64,
    /// Version.
    #[prost(uint64, tag = "4")]
    pub version: u64,
    /// Outgoing edges.
    #[prost(message, repeated, tag = "5")]
    pub edges: Vec<EdgeRecord>,
}

/// A batch of peer records.
#[derive(Clone, PartialEq, Message)]
pub struct PeerUpdate {
    /// Records in the batch.
    #[prost(message, repeated, tag = "1")]
    pub peers: Vec<PeerRecord>,
}

/// Gossip channel message. Which fields are meaningful depends on the
/// protocol tag it travels under.
#[derive(Clone, PartialEq, Message)]
pub struct GossipEnvelope {
    /// Channel name.
    #[prost(string, tag = "1")]
    pub channel: String,
    /// Originating peer.
    #[prost(bytes = "vec", tag = "2")]
    pub sender: Vec<u8>,
    /// Destination peer, unicast only.
    #[prost(bytes = "vec", tag = "3")]
    pub destination: Vec<u8>,
    /// Opaque payload produced by the channel's gossip data.
    #[prost(bytes = "vec", tag = "4")]
    pub payload: Vec<u8>,
}

impl GossipEnvelope {
    /// Decodes an envelope from bytes.
    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, MeshError> {
        Ok(Self::decode(bytes)?)
    }

    /// Returns the sender name.
    pub fn sender_name(&self) -> Result<PeerName, MeshError> {
        PeerName::from_bytes(&self.sender)
    }

    /// Returns the destination name.
    pub fn destination_name(&self) -> Result<PeerName, MeshError> {
        PeerName::from_bytes(&self.destination)
    }
}

impl From<&Peer> for PeerRecord {
    fn from(peer: &Peer) -> Self {
        Self {
            name: peer.name.as_bytes().to_vec(),
            nick_name: peer.nick_name.clone(),
            uid: peer.uid,
            version: peer.version,
            edges: peer
                .edges
                .iter()
                .map(|(remote, edge)| EdgeRecord {
                    remote: remote.as_bytes().to_vec(),
                    remote_addr: edge.remote_addr.clone(),
                    outbound: edge.outbound,
                    established: edge.established,
                })
                .collect(),
        }
    }
}

impl TryFrom<PeerRecord> for Peer {
    type Error = MeshError;

    fn try_from(record: PeerRecord) -> Result<Self, Self::Error> {
        let mut peer = Self::new(
            PeerName::from_bytes(&record.name)?,
            record.nick_name,
            record.uid,
            record.version,
        );
        for edge in record.edges {
            peer.edges.insert(
                PeerName::from_bytes(&edge.remote)?,
                Edge::new(edge.remote_addr, edge.outbound, edge.established),
            );
        }
        Ok(peer)
    }
}
