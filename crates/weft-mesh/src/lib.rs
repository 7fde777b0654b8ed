//! # weft-mesh
//!
//! Core of the weft overlay network. A set of peers, each running a
//! [`Router`], form a mesh over TCP control connections and carry frames
//! between each other in UDP.
//!
//! This crate provides:
//!
//! - A gossiped peer graph with edge lists and reference-counted
//!   garbage collection
//! - Shortest-path unicast and broadcast routes computed over
//!   symmetric edges
//! - Named gossip channels with unicast, broadcast and full-state gossip
//! - Authenticated, optionally encrypted control connections with
//!   duplicate resolution
//! - A connection maker that dials direct and discovered peers with
//!   back-off
//! - The sleeve overlay: UDP encapsulation with heartbeats, path MTU
//!   discovery and IPv4 fragmentation
//!
//! ## Core Types
//!
//! - [`PeerName`]: 48-bit peer identifier
//! - [`PeerGraph`]: every known peer and its edges
//! - [`RouteTable`]: next hops derived from the graph
//! - [`GossipChannels`]: registry of named gossip channels
//! - [`Router`]: ties it all together behind one listening port

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod connection;
pub mod connection_maker;
pub mod error;
pub mod gossip;
pub mod local_peer;
pub mod overlay;
pub mod peer;
pub mod peers;
pub mod protocol;
pub mod router;
pub mod routes;
pub mod token_bucket;
pub mod topology;
pub mod wire;

pub use config::{OverlayKind, RouterConfig, DEFAULT_CONN_LIMIT, DEFAULT_PORT};
pub use connection::{ConnectionHandle, ConnectionState, TieBreak};
pub use connection_maker::{ConnectionMaker, TargetStatus};
pub use error::MeshError;
pub use gossip::{GossipChannel, GossipChannels, GossipData, Gossiper, GOSSIP_INTERVAL};
pub use local_peer::{ConnectionMap, LocalPeer};
pub use overlay::{DiscardFrames, FrameConsumer, NullOverlay, Overlay, Sleeve};
pub use peer::{Edge, Peer, PeerName, PeerUid};
pub use peers::{PeerGraph, PeerTable};
pub use router::{ConnectionStatus, Router, RouterStatus};
pub use routes::{RouteTable, Routes};
pub use token_bucket::TokenBucket;
pub use topology::{TopologyData, TopologyGossiper, TOPOLOGY_CHANNEL};
