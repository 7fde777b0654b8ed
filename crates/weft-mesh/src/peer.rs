//! Peer identity and the per-peer edge summary.
//!
//! - [`PeerName`]: 6-byte MAC-style name, totally ordered by bytes
//! - [`PeerUid`]: random incarnation id
//! - [`Peer`]: name, incarnation, version and outgoing edges
//! - [`Edge`]: summary of one connection as reported by its owner

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::MeshError;

/// Size of a peer name in bytes.
pub const NAME_SIZE: usize = 6;

/// Naming scheme advertised in the handshake so incompatible peers refuse
/// to talk to each other.
pub const PEER_NAME_FLAVOUR: &str = "mac";

/// Incarnation id distinguishing successive runs of the same name.
pub type PeerUid = u64;

/// Generates a random, non-zero incarnation id.
#[must_use]
pub fn random_uid() -> PeerUid {
    let mut rng = rand::thread_rng();
    loop {
        let uid: PeerUid = rng.r#gen();
        if uid != 0 {
            return uid;
        }
    }
}

/// A peer's name.
///
/// Displayed as colon-separated hex, like a MAC address. Ordering is by
/// byte value; route computation depends on every peer agreeing on it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct PeerName([u8; NAME_SIZE]);

impl PeerName {
    /// The all-zero name, used for "no route" entries.
    pub const UNKNOWN: Self = Self([0; NAME_SIZE]);

    /// Creates a name from raw bytes.
    #[must_use]
    pub const fn from_bytes_array(bytes: [u8; NAME_SIZE]) -> Self {
        Self(bytes)
    }

    /// Creates a name from a byte slice.
    ///
    /// # Errors
    ///
    /// Returns an error if the slice is not exactly [`NAME_SIZE`] bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MeshError> {
        let arr: [u8; NAME_SIZE] = bytes.try_into().map_err(|_| {
            MeshError::Decode(format!(
                "peer name must be {NAME_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    /// Generates a random locally-administered unicast name.
    #[must_use]
    pub fn random() -> Self {
        let mut bytes: [u8; NAME_SIZE] = rand::thread_rng().r#gen();
        bytes[0] = (bytes[0] & 0xfe) | 0x02;
        Self(bytes)
    }

    /// Returns the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; NAME_SIZE] {
        &self.0
    }

    /// Returns true for the all-zero name.
    #[must_use]
    pub fn is_unknown(&self) -> bool {
        *self == Self::UNKNOWN
    }
}

impl fmt::Display for PeerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl fmt::Debug for PeerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerName({self})")
    }
}

impl FromStr for PeerName {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || MeshError::Decode(format!("invalid peer name: {s:?}"));
        let mut bytes = [0u8; NAME_SIZE];
        let mut parts = s.split(':');
        for byte in &mut bytes {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 {
                return Err(invalid());
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self(bytes))
    }
}

impl From<PeerName> for String {
    fn from(name: PeerName) -> Self {
        name.to_string()
    }
}

impl TryFrom<String> for PeerName {
    type Error = MeshError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// One outgoing connection of a peer, as reported by that peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// TCP address of the remote end, as seen by the owner.
    pub remote_addr: String,
    /// Whether the owner dialled this connection.
    pub outbound: bool,
    /// Whether the connection completed its heartbeat handshake.
    pub established: bool,
}

impl Edge {
    /// Creates an edge summary.
    #[must_use]
    pub fn new(remote_addr: impl Into<String>, outbound: bool, established: bool) -> Self {
        Self {
            remote_addr: remote_addr.into(),
            outbound,
            established,
        }
    }
}

/// Everything this process knows about one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Peer {
    /// Peer name.
    pub name: PeerName,
    /// Human-readable nickname.
    pub nick_name: String,
    /// Incarnation id.
    pub uid: PeerUid,
    /// Monotonic version, bumped on every edge change by the owner.
    pub version: u64,
    /// Outgoing edges keyed by remote name.
    pub edges: BTreeMap<PeerName, Edge>,
    #[serde(skip)]
    pub(crate) local_refs: u64,
}

impl Peer {
    /// Creates a peer with no edges.
    #[must_use]
    pub fn new(name: PeerName, nick_name: impl Into<String>, uid: PeerUid, version: u64) -> Self {
        Self {
            name,
            nick_name: nick_name.into(),
            uid,
            version,
            edges: BTreeMap::new(),
            local_refs: 0,
        }
    }

    /// Adds an edge, builder style.
    #[must_use]
    pub fn with_edge(mut self, remote: PeerName, edge: Edge) -> Self {
        self.edges.insert(remote, edge);
        self
    }

    /// Returns the number of local references held on this peer.
    #[must_use]
    pub const fn local_refs(&self) -> u64 {
        self.local_refs
    }

    /// Returns the edge to `remote`, if any.
    #[must_use]
    pub fn edge(&self, remote: &PeerName) -> Option<&Edge> {
        self.edges.get(remote)
    }

    /// Returns true if this peer reports an established edge to `remote`.
    #[must_use]
    pub fn has_established_edge_to(&self, remote: &PeerName) -> bool {
        self.edges.get(remote).is_some_and(|e| e.established)
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.nick_name)
    }
}
