//! The peer graph: every peer this process knows about, with edges.
//!
//! The table lives behind a `RwLock<Arc<PeerTable>>`. Readers clone the
//! `Arc` and work on a consistent snapshot without holding the lock; writers
//! take the exclusive lock and modify a private copy (`Arc::make_mut`), so a
//! snapshot handed out earlier never changes underneath its holder.
//!
//! - [`PeerGraph`]: the shared, versioned table
//! - [`PeerTable`]: an immutable snapshot of it
//! - [`AppliedUpdate`]: result of merging a topology update

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use prost::Message;
use tracing::debug;

use crate::error::MeshError;
use crate::peer::{Edge, Peer, PeerName};
use crate::routes::routes_from;
use crate::wire::{PeerRecord, PeerUpdate};

/// A set of peer names.
pub type PeerNameSet = BTreeSet<PeerName>;

/// Callback invoked for every peer removed by garbage collection.
pub type GcCallback = Box<dyn Fn(&Peer) + Send + Sync>;

/// Snapshot of the peer table.
#[derive(Debug, Clone, Default)]
pub struct PeerTable {
    peers: BTreeMap<PeerName, Peer>,
}

impl PeerTable {
    /// Returns the peer with the given name.
    #[must_use]
    pub fn get(&self, name: &PeerName) -> Option<&Peer> {
        self.peers.get(name)
    }

    /// Returns true if the peer is known.
    #[must_use]
    pub fn contains(&self, name: &PeerName) -> bool {
        self.peers.contains_key(name)
    }

    /// Iterates over all peers in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    /// Returns all known names.
    #[must_use]
    pub fn names(&self) -> PeerNameSet {
        self.peers.keys().copied().collect()
    }

    /// Number of known peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Returns true if no peers are known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl FromIterator<Peer> for PeerTable {
    fn from_iter<I: IntoIterator<Item = Peer>>(iter: I) -> Self {
        Self {
            peers: iter.into_iter().map(|p| (p.name, p)).collect(),
        }
    }
}

/// Outcome of [`PeerGraph::apply_update`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedUpdate {
    /// Every peer named in the update.
    pub update_names: PeerNameSet,
    /// Peers whose state changed locally and should be re-propagated.
    pub new_names: PeerNameSet,
}

/// The authoritative table of known peers.
pub struct PeerGraph {
    ourself: PeerName,
    table: RwLock<Arc<PeerTable>>,
    on_gc: Mutex<Vec<GcCallback>>,
}

impl PeerGraph {
    /// Creates a graph containing only the local peer.
    #[must_use]
    pub fn new(ourself: Peer) -> Self {
        let name = ourself.name;
        let mut table = PeerTable::default();
        table.peers.insert(name, ourself);
        Self {
            ourself: name,
            table: RwLock::new(Arc::new(table)),
            on_gc: Mutex::new(Vec::new()),
        }
    }

    /// Returns the local peer's name.
    #[must_use]
    pub const fn ourself_name(&self) -> PeerName {
        self.ourself
    }

    /// Returns a copy of the local peer.
    #[must_use]
    pub fn ourself(&self) -> Peer {
        self.fetch(&self.ourself)
            .unwrap_or_else(|| Peer::new(self.ourself, "", 0, 0))
    }

    /// Returns a consistent snapshot of the whole table.
    #[must_use]
    pub fn snapshot(&self) -> Arc<PeerTable> {
        Arc::clone(&self.table.read())
    }

    /// Registers a garbage-collection callback.
    pub fn on_gc(&self, callback: GcCallback) {
        self.on_gc.lock().push(callback);
    }

    /// Returns a copy of the named peer.
    #[must_use]
    pub fn fetch(&self, name: &PeerName) -> Option<Peer> {
        self.table.read().get(name).cloned()
    }

    /// Returns all known names.
    #[must_use]
    pub fn names(&self) -> PeerNameSet {
        self.table.read().names()
    }

    /// Calls `f` for every peer of a snapshot, in name order.
    pub fn for_each(&self, mut f: impl FnMut(&Peer)) {
        self.snapshot().iter().for_each(|peer| f(peer));
    }

    /// Number of known peers, ourselves included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    /// Always false: the local peer is always present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }

    /// Returns the canonical peer for `candidate.name`, adopting the
    /// candidate if the name is new, and takes a local reference on it.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::NameCollision`] if the name is already known with
    /// a different UID. Existing state is left untouched.
    pub fn fetch_with_default(&self, candidate: Peer) -> Result<Peer, MeshError> {
        let mut guard = self.table.write();
        if let Some(existing) = guard.get(&candidate.name) {
            if existing.uid != candidate.uid {
                return Err(MeshError::NameCollision {
                    name: candidate.name,
                    known: existing.uid,
                    received: candidate.uid,
                });
            }
        }
        let table = Arc::make_mut(&mut guard);
        let peer = table
            .peers
            .entry(candidate.name)
            .or_insert_with(|| Peer {
                local_refs: 0,
                ..candidate
            });
        peer.local_refs += 1;
        Ok(peer.clone())
    }

    /// Takes a local reference on an already-known peer.
    pub fn fetch_and_add_ref(&self, name: &PeerName) -> Option<Peer> {
        let mut guard = self.table.write();
        if !guard.contains(name) {
            return None;
        }
        let peer = Arc::make_mut(&mut guard).peers.get_mut(name)?;
        peer.local_refs += 1;
        Some(peer.clone())
    }

    /// Releases a local reference taken by one of the fetch operations.
    pub fn dereference(&self, name: &PeerName) {
        let mut guard = self.table.write();
        if let Some(peer) = Arc::make_mut(&mut guard).peers.get_mut(name) {
            peer.local_refs = peer.local_refs.saturating_sub(1);
        }
    }

    /// Merges an encoded batch of peer records into the table.
    ///
    /// The whole batch is validated before anything is applied.
    ///
    /// # Errors
    ///
    /// - [`MeshError::Decode`] for malformed input
    /// - [`MeshError::NameCollision`] if a known name arrives with another UID
    /// - [`MeshError::UnknownPeer`] if an edge points at a peer that is
    ///   neither in the batch nor known; the update should be retried once a
    ///   more complete one arrives
    pub fn apply_update(&self, update: &[u8]) -> Result<AppliedUpdate, MeshError> {
        let batch = PeerUpdate::decode(update)?
            .peers
            .into_iter()
            .map(Peer::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        let (removed, applied) = {
            let mut guard = self.table.write();
            let update_names: PeerNameSet = batch.iter().map(|p| p.name).collect();

            for peer in &batch {
                if peer.name == self.ourself {
                    continue;
                }
                if let Some(existing) = guard.get(&peer.name) {
                    if existing.uid != peer.uid {
                        return Err(MeshError::NameCollision {
                            name: peer.name,
                            known: existing.uid,
                            received: peer.uid,
                        });
                    }
                }
            }
            for remote in batch.iter().flat_map(|p| p.edges.keys()) {
                if !update_names.contains(remote) && !guard.contains(remote) {
                    return Err(MeshError::UnknownPeer(*remote));
                }
            }

            let table = Arc::make_mut(&mut guard);
            let mut new_names = PeerNameSet::new();
            for incoming in batch {
                let name = incoming.name;
                match table.peers.get_mut(&name) {
                    Some(us) if name == self.ourself => {
                        // A stale record of an earlier incarnation of
                        // ourselves; outbid it so ours wins everywhere.
                        if incoming.uid != us.uid && incoming.version >= us.version {
                            us.version = incoming.version + 1;
                            new_names.insert(name);
                        }
                    }
                    Some(existing) => {
                        if incoming.version > existing.version {
                            existing.version = incoming.version;
                            existing.nick_name = incoming.nick_name;
                            existing.edges = incoming.edges;
                            new_names.insert(name);
                        }
                    }
                    None => {
                        table.peers.insert(name, incoming);
                        new_names.insert(name);
                    }
                }
            }

            let removed = collect_garbage(table, self.ourself);
            for peer in &removed {
                new_names.remove(&peer.name);
            }
            (
                removed,
                AppliedUpdate {
                    update_names,
                    new_names,
                },
            )
        };

        self.notify_gc(&removed);
        Ok(applied)
    }

    /// Removes peers that are unreachable from ourselves and unreferenced.
    pub fn garbage_collect(&self) -> Vec<Peer> {
        let removed = {
            let mut guard = self.table.write();
            collect_garbage(Arc::make_mut(&mut guard), self.ourself)
        };
        self.notify_gc(&removed);
        removed
    }

    fn notify_gc(&self, removed: &[Peer]) {
        if removed.is_empty() {
            return;
        }
        let callbacks = self.on_gc.lock();
        for peer in removed {
            debug!(peer = %peer, "removed unreachable peer");
            for callback in callbacks.iter() {
                callback(peer);
            }
        }
    }

    /// Encodes the named peers as a topology update. Unknown names are skipped.
    #[must_use]
    pub fn encode_peers(&self, names: &PeerNameSet) -> Vec<u8> {
        let table = self.snapshot();
        PeerUpdate {
            peers: names
                .iter()
                .filter_map(|name| table.get(name))
                .map(PeerRecord::from)
                .collect(),
        }
        .encode_to_vec()
    }

    /// Encodes every known peer.
    #[must_use]
    pub fn encode_all(&self) -> Vec<u8> {
        self.encode_peers(&self.names())
    }

    /// Records a new local connection and bumps our version.
    pub fn add_local_edge(&self, remote: PeerName, edge: Edge) {
        self.update_ourself(|us| {
            us.edges.insert(remote, edge);
            true
        });
    }

    /// Removes a local connection; bumps our version if it existed.
    pub fn remove_local_edge(&self, remote: &PeerName) -> bool {
        self.update_ourself(|us| us.edges.remove(remote).is_some())
    }

    /// Marks a local connection established; bumps our version if it exists.
    pub fn mark_local_edge_established(&self, remote: &PeerName) -> bool {
        self.update_ourself(|us| match us.edges.get_mut(remote) {
            Some(edge) => {
                edge.established = true;
                true
            }
            None => false,
        })
    }

    fn update_ourself(&self, f: impl FnOnce(&mut Peer) -> bool) -> bool {
        let mut guard = self.table.write();
        let Some(us) = Arc::make_mut(&mut guard).peers.get_mut(&self.ourself) else {
            return false;
        };
        let changed = f(us);
        if changed {
            us.version += 1;
        }
        changed
    }
}

impl std::fmt::Debug for PeerGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerGraph")
            .field("ourself", &self.ourself)
            .field("peers", &self.len())
            .finish_non_exhaustive()
    }
}

fn collect_garbage(table: &mut PeerTable, ourself: PeerName) -> Vec<Peer> {
    let (_, reached) = routes_from(table, ourself, false, None);
    let doomed: Vec<PeerName> = table
        .peers
        .values()
        .filter(|p| p.local_refs == 0 && !reached.contains_key(&p.name))
        .map(|p| p.name)
        .collect();
    doomed
        .iter()
        .filter_map(|name| table.peers.remove(name))
        .collect()
}

#[cfg(test)]
#[path = "peers_tests.rs"]
mod tests;
