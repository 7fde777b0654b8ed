//! Topology gossip.
//!
//! The peer graph is itself gossiped on the `"topology"` channel. The
//! gossiped value is a set of peer names; it is encoded by looking the
//! names up in the graph at send time, so a delayed send always carries
//! the latest version of each peer.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::MeshError;
use crate::gossip::{GossipData, Gossiper};
use crate::peer::PeerName;
use crate::peers::{AppliedUpdate, PeerGraph, PeerNameSet};
use crate::routes::RouteTable;

/// Name of the topology gossip channel.
pub const TOPOLOGY_CHANNEL: &str = "topology";

/// Callback invoked when an update taught us something new.
pub type UpdateCallback = Box<dyn Fn() + Send + Sync>;

/// A set of peers whose records should be gossiped.
#[derive(Clone)]
pub struct TopologyData {
    peers: Arc<PeerGraph>,
    names: PeerNameSet,
}

impl TopologyData {
    /// Creates gossip data for `names`.
    #[must_use]
    pub const fn new(peers: Arc<PeerGraph>, names: PeerNameSet) -> Self {
        Self { peers, names }
    }

    /// Returns the names carried.
    #[must_use]
    pub const fn names(&self) -> &PeerNameSet {
        &self.names
    }
}

impl GossipData for TopologyData {
    fn encode(&self) -> Vec<Vec<u8>> {
        vec![self.peers.encode_peers(&self.names)]
    }

    fn merge(&mut self, other: Self) {
        self.names.extend(other.names);
    }
}

impl std::fmt::Debug for TopologyData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("TopologyData").field(&self.names).finish()
    }
}

/// Gossiper for the topology channel.
pub struct TopologyGossiper {
    peers: Arc<PeerGraph>,
    routes: Arc<RouteTable>,
    on_update: Mutex<Vec<UpdateCallback>>,
}

impl TopologyGossiper {
    /// Creates a topology gossiper over `peers`.
    #[must_use]
    pub fn new(peers: Arc<PeerGraph>, routes: Arc<RouteTable>) -> Self {
        Self {
            peers,
            routes,
            on_update: Mutex::new(Vec::new()),
        }
    }

    /// Registers a callback run whenever an update changes the graph.
    pub fn on_update(&self, callback: UpdateCallback) {
        self.on_update.lock().push(callback);
    }

    /// Gossip data naming `names`.
    #[must_use]
    pub fn data(&self, names: PeerNameSet) -> TopologyData {
        TopologyData::new(Arc::clone(&self.peers), names)
    }

    fn apply(&self, update: &[u8]) -> Result<Option<AppliedUpdate>, MeshError> {
        let applied = match self.peers.apply_update(update) {
            Ok(applied) => applied,
            Err(MeshError::UnknownPeer(name)) => {
                debug!(peer = %name, "ignoring topology update referencing unknown peer");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        if !applied.new_names.is_empty() {
            self.routes.recalculate();
            for callback in self.on_update.lock().iter() {
                callback();
            }
        }
        Ok(Some(applied))
    }

    fn non_empty(&self, names: PeerNameSet) -> Option<TopologyData> {
        (!names.is_empty()).then(|| self.data(names))
    }
}

impl Gossiper for TopologyGossiper {
    type Data = TopologyData;

    fn on_gossip_unicast(&self, sender: PeerName, msg: &[u8]) -> Result<(), MeshError> {
        warn!(peer = %sender, len = msg.len(), "unexpected topology unicast");
        Err(MeshError::Gossip(format!(
            "unexpected topology gossip unicast from {sender}"
        )))
    }

    fn on_gossip_broadcast(
        &self,
        _source: PeerName,
        update: &[u8],
    ) -> Result<Option<TopologyData>, MeshError> {
        Ok(self
            .apply(update)?
            .and_then(|applied| self.non_empty(applied.update_names)))
    }

    fn gossip(&self) -> Option<TopologyData> {
        Some(self.data(self.peers.names()))
    }

    fn on_gossip(&self, update: &[u8]) -> Result<Option<TopologyData>, MeshError> {
        Ok(self
            .apply(update)?
            .and_then(|applied| self.non_empty(applied.new_names)))
    }
}

impl std::fmt::Debug for TopologyGossiper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologyGossiper")
            .field("ourself", &self.peers.ourself_name())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{Edge, Peer};
    use crate::wire::{PeerRecord, PeerUpdate};
    use prost::Message;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn name(n: u8) -> PeerName {
        PeerName::from_bytes_array([2, 0, 0, 0, 0, n])
    }

    fn link(n: u8) -> Edge {
        Edge::new(format!("10.0.0.{n}:6783"), true, true)
    }

    fn encode(peers: &[Peer]) -> Vec<u8> {
        PeerUpdate {
            peers: peers.iter().map(PeerRecord::from).collect(),
        }
        .encode_to_vec()
    }

    fn gossiper(n: u8) -> TopologyGossiper {
        let peers = Arc::new(PeerGraph::new(Peer::new(name(n), "p", u64::from(n), 0)));
        let (routes, _calculator) = RouteTable::new(Arc::clone(&peers));
        TopologyGossiper::new(peers, routes)
    }

    fn b_and_c() -> Vec<u8> {
        encode(&[
            Peer::new(name(2), "b", 2, 1)
                .with_edge(name(1), link(1))
                .with_edge(name(3), link(3)),
            Peer::new(name(3), "c", 3, 1).with_edge(name(2), link(2)),
        ])
    }

    // ========== TopologyData Tests ==========

    #[test]
    fn merge_is_union() {
        let g = gossiper(1);
        let mut data = g.data([name(1), name(2)].into());
        data.merge(g.data([name(2), name(3)].into()));
        assert_eq!(data.names(), &[name(1), name(2), name(3)].into());
    }

    #[test]
    fn merge_is_idempotent() {
        let g = gossiper(1);
        let mut data = g.data([name(1)].into());
        let snapshot = data.clone();
        data.merge(snapshot.clone());
        data.merge(snapshot);
        assert_eq!(data.names(), &[name(1)].into());
    }

    #[test]
    fn encoding_looks_up_latest_records() {
        let g = gossiper(1);
        let data = g.data([name(1)].into());
        g.peers.add_local_edge(name(2), link(2));

        let decoded = PeerUpdate::decode(data.encode()[0].as_slice()).expect("decode");
        assert_eq!(decoded.peers.len(), 1);
        assert_eq!(decoded.peers[0].version, 1);
    }

    // ========== Gossiper Tests ==========

    #[test]
    fn unicast_is_rejected() {
        let g = gossiper(1);
        assert!(g.on_gossip_unicast(name(2), b"x").is_err());
    }

    #[test]
    fn full_gossip_names_everyone() {
        let g = gossiper(1);
        g.peers.add_local_edge(name(2), link(2));
        g.on_gossip(&b_and_c()).expect("applied");
        let data = g.gossip().expect("data");
        assert_eq!(data.names(), &[name(1), name(2), name(3)].into());
    }

    #[test]
    fn gossip_returns_only_what_was_new() {
        let g = gossiper(1);
        g.peers.add_local_edge(name(2), link(2));

        let first = g.on_gossip(&b_and_c()).expect("applied").expect("new");
        assert_eq!(first.names(), &[name(2), name(3)].into());
        assert!(g.on_gossip(&b_and_c()).expect("applied").is_none());
    }

    #[test]
    fn broadcast_relays_the_whole_update() {
        let g = gossiper(1);
        g.peers.add_local_edge(name(2), link(2));
        g.on_gossip(&b_and_c()).expect("applied");

        // nothing new, but a broadcast is still passed on
        let relayed = g
            .on_gossip_broadcast(name(2), &b_and_c())
            .expect("applied")
            .expect("relay");
        assert_eq!(relayed.names(), &[name(2), name(3)].into());
    }

    #[test]
    fn own_gossip_is_not_new() {
        let g = gossiper(1);
        g.peers.add_local_edge(name(2), link(2));
        g.on_gossip(&b_and_c()).expect("applied");

        let ours = g.gossip().expect("data").encode();
        assert!(g.on_gossip(&ours[0]).expect("applied").is_none());
    }

    #[test]
    fn unknown_peer_is_ignored() {
        let g = gossiper(1);
        let update = encode(&[Peer::new(name(2), "b", 2, 1).with_edge(name(9), link(9))]);
        assert!(g.on_gossip(&update).expect("ignored").is_none());
        assert!(g.peers.fetch(&name(2)).is_none());
    }

    #[test]
    fn collision_is_an_error() {
        let g = gossiper(1);
        g.peers.add_local_edge(name(2), link(2));
        g.on_gossip(&b_and_c()).expect("applied");
        let impostor = encode(&[Peer::new(name(2), "b", 99, 5).with_edge(name(1), link(1))]);
        assert!(matches!(
            g.on_gossip(&impostor),
            Err(MeshError::NameCollision { .. })
        ));
    }

    #[test]
    fn update_callbacks_fire_only_on_change() {
        let g = gossiper(1);
        g.peers.add_local_edge(name(2), link(2));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        g.on_update(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        g.on_gossip(&b_and_c()).expect("applied");
        g.on_gossip(&b_and_c()).expect("applied");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn merge_order_does_not_matter(
                a in proptest::collection::btree_set(1u8..20, 0..8),
                b in proptest::collection::btree_set(1u8..20, 0..8),
            ) {
                let g = gossiper(1);
                let set = |s: &std::collections::BTreeSet<u8>| -> PeerNameSet {
                    s.iter().map(|n| name(*n)).collect()
                };
                let mut ab = g.data(set(&a));
                ab.merge(g.data(set(&b)));
                let mut ba = g.data(set(&b));
                ba.merge(g.data(set(&a)));
                let mut twice = ab.clone();
                twice.merge(g.data(set(&b)));

                prop_assert_eq!(ab.names(), ba.names());
                prop_assert_eq!(ab.names(), twice.names());
            }
        }
    }
}
