//! Route computation over the peer graph.
//!
//! Routes are computed by breadth-first widening from a start peer. Each
//! level of the worklist is visited in name order so that every peer
//! computing routes over the same graph arrives at the same answer.
//!
//! - [`Routes`]: immutable snapshot of the four route tables
//! - [`RouteTable`]: publishes snapshots and coalesces recalculation
//! - [`RouteCalculator`]: the background task doing the work

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::peer::{Peer, PeerName};
use crate::peers::{PeerGraph, PeerTable};

/// Map from destination to next hop.
pub type RouteMap = HashMap<PeerName, PeerName>;

/// Callback invoked after a new snapshot has been published.
pub type ChangeCallback = Box<dyn Fn(&Routes) + Send + Sync>;

/// Walks the graph from `start`, returning whether `stop_at` was reached
/// and, for every peer visited, the first hop taken from `start`.
///
/// `start` itself maps to [`PeerName::UNKNOWN`]. With `symmetric` set only
/// edges both ends report as established are followed.
pub(crate) fn routes_from(
    table: &PeerTable,
    start: PeerName,
    symmetric: bool,
    stop_at: Option<PeerName>,
) -> (bool, RouteMap) {
    let mut routes = RouteMap::new();
    routes.insert(start, PeerName::UNKNOWN);
    let mut next = vec![start];

    while !next.is_empty() {
        let mut level = std::mem::take(&mut next);
        level.sort_unstable();
        for current in level {
            if Some(current) == stop_at {
                return (true, routes);
            }
            let Some(peer) = table.get(&current) else {
                continue;
            };
            let hop = if current == start {
                None
            } else {
                routes.get(&current).copied()
            };
            for remote in connected_peers(table, peer, symmetric, &routes) {
                routes.insert(remote, hop.unwrap_or(remote));
                next.push(remote);
            }
        }
    }
    (false, routes)
}

fn connected_peers(
    table: &PeerTable,
    peer: &Peer,
    symmetric: bool,
    exclude: &RouteMap,
) -> Vec<PeerName> {
    peer.edges
        .iter()
        .filter(|(remote, edge)| {
            if symmetric && !edge.established {
                return false;
            }
            if exclude.contains_key(remote) {
                return false;
            }
            table
                .get(remote)
                .is_some_and(|r| !symmetric || r.has_established_edge_to(&peer.name))
        })
        .map(|(remote, _)| *remote)
        .collect()
}

fn broadcast_hops(
    table: &PeerTable,
    source: PeerName,
    ourself: &Peer,
    symmetric: bool,
) -> Vec<PeerName> {
    let (found, reached) = routes_from(table, source, symmetric, Some(ourself.name));
    if found {
        connected_peers(table, ourself, symmetric, &reached)
    } else {
        Vec::new()
    }
}

/// An immutable set of route tables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Routes {
    ourself: PeerName,
    unicast: RouteMap,
    unicast_all: RouteMap,
    broadcast: HashMap<PeerName, Vec<PeerName>>,
    broadcast_all: HashMap<PeerName, Vec<PeerName>>,
}

impl Routes {
    /// Routes before anything has been calculated: only the self route.
    #[must_use]
    pub fn initial(ourself: PeerName) -> Self {
        let self_only: RouteMap = [(ourself, PeerName::UNKNOWN)].into();
        Self {
            ourself,
            unicast: self_only.clone(),
            unicast_all: self_only,
            broadcast: [(ourself, Vec::new())].into(),
            broadcast_all: [(ourself, Vec::new())].into(),
        }
    }

    /// Computes all four tables over a snapshot.
    #[must_use]
    pub fn calculate(table: &PeerTable, ourself: PeerName) -> Self {
        let Some(us) = table.get(&ourself) else {
            return Self::initial(ourself);
        };
        let (_, unicast) = routes_from(table, ourself, true, None);
        let (_, unicast_all) = routes_from(table, ourself, false, None);
        let mut broadcast = HashMap::with_capacity(table.len());
        let mut broadcast_all = HashMap::with_capacity(table.len());
        for peer in table.iter() {
            broadcast.insert(peer.name, broadcast_hops(table, peer.name, us, true));
            broadcast_all.insert(peer.name, broadcast_hops(table, peer.name, us, false));
        }
        Self {
            ourself,
            unicast,
            unicast_all,
            broadcast,
            broadcast_all,
        }
    }

    /// Next hop towards `name` over established symmetric edges.
    ///
    /// Returns `None` for unreachable peers and for ourselves.
    #[must_use]
    pub fn unicast(&self, name: &PeerName) -> Option<PeerName> {
        self.unicast.get(name).copied().filter(|hop| !hop.is_unknown())
    }

    /// Next hop towards `name` over any edge.
    #[must_use]
    pub fn unicast_all(&self, name: &PeerName) -> Option<PeerName> {
        self.unicast_all
            .get(name)
            .copied()
            .filter(|hop| !hop.is_unknown())
    }

    /// Returns true if `name` is reachable over established symmetric edges.
    #[must_use]
    pub fn is_reachable(&self, name: &PeerName) -> bool {
        self.unicast.contains_key(name)
    }

    /// Returns true if `name` is reachable over any edge.
    #[must_use]
    pub fn is_known(&self, name: &PeerName) -> bool {
        self.unicast_all.contains_key(name)
    }

    /// Peers to forward a broadcast from `source` to, over established edges.
    #[must_use]
    pub fn broadcast(&self, source: &PeerName) -> &[PeerName] {
        self.broadcast.get(source).map_or(&[], Vec::as_slice)
    }

    /// Peers to forward a broadcast from `source` to, over any edge.
    #[must_use]
    pub fn broadcast_all(&self, source: &PeerName) -> &[PeerName] {
        self.broadcast_all.get(source).map_or(&[], Vec::as_slice)
    }

    /// The unicast table, for status reporting.
    #[must_use]
    pub const fn unicast_table(&self) -> &RouteMap {
        &self.unicast
    }

    /// The broadcast table, for status reporting.
    #[must_use]
    pub const fn broadcast_table(&self) -> &HashMap<PeerName, Vec<PeerName>> {
        &self.broadcast
    }

    /// Picks about log2(n) distinct next hops for full-state gossip.
    ///
    /// Hops that route to many destinations are proportionally more likely
    /// to be chosen. `except` is never returned.
    #[must_use]
    pub fn random_neighbours(&self, except: &PeerName) -> Vec<PeerName> {
        let want = (self.unicast_all.len().max(1).ilog2() as usize).max(1);
        let mut candidates: Vec<PeerName> = self
            .unicast_all
            .values()
            .filter(|hop| !hop.is_unknown() && *hop != except)
            .copied()
            .collect();
        candidates.sort_unstable();
        candidates.shuffle(&mut rand::thread_rng());

        let mut chosen = Vec::with_capacity(want);
        for hop in candidates {
            if chosen.len() >= want {
                break;
            }
            if !chosen.contains(&hop) {
                chosen.push(hop);
            }
        }
        chosen
    }
}

/// Publishes route snapshots and schedules recalculation.
pub struct RouteTable {
    ourself: PeerName,
    peers: Arc<PeerGraph>,
    current: RwLock<Arc<Routes>>,
    recalculate: mpsc::Sender<()>,
    wait: mpsc::Sender<oneshot::Sender<()>>,
    on_change: Mutex<Vec<ChangeCallback>>,
}

impl RouteTable {
    /// Creates a route table and the calculator that serves it.
    ///
    /// The caller must spawn [`RouteCalculator::run`]; see [`RouteTable::start`].
    #[must_use]
    pub fn new(peers: Arc<PeerGraph>) -> (Arc<Self>, RouteCalculator) {
        let ourself = peers.ourself_name();
        let (recalculate_tx, recalculate_rx) = mpsc::channel(1);
        let (wait_tx, wait_rx) = mpsc::channel(1);
        let table = Arc::new(Self {
            ourself,
            peers,
            current: RwLock::new(Arc::new(Routes::initial(ourself))),
            recalculate: recalculate_tx,
            wait: wait_tx,
            on_change: Mutex::new(Vec::new()),
        });
        let calculator = RouteCalculator {
            table: Arc::downgrade(&table),
            recalculate: recalculate_rx,
            wait: wait_rx,
        };
        (table, calculator)
    }

    /// Creates a route table and spawns its calculator on the current runtime.
    #[must_use]
    pub fn start(peers: Arc<PeerGraph>) -> Arc<Self> {
        let (table, calculator) = Self::new(peers);
        tokio::spawn(calculator.run());
        table
    }

    /// Returns the current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Routes> {
        Arc::clone(&self.current.read())
    }

    /// Registers a callback run after each new snapshot is published.
    pub fn on_change(&self, callback: ChangeCallback) {
        self.on_change.lock().push(callback);
    }

    /// Requests a recalculation. Requests made while one is pending are
    /// folded into it.
    pub fn recalculate(&self) {
        let _ = self.recalculate.try_send(());
    }

    /// Waits until any pending recalculation has been applied.
    pub async fn ensure_recalculated(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.wait.send(done_tx).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Recalculates synchronously and publishes the result.
    pub fn recalculate_now(&self) -> Arc<Routes> {
        let table = self.peers.snapshot();
        let routes = Arc::new(Routes::calculate(&table, self.ourself));
        *self.current.write() = Arc::clone(&routes);
        trace!(reachable = routes.unicast.len(), "published routes");
        for callback in self.on_change.lock().iter() {
            callback(&routes);
        }
        routes
    }

    /// See [`Routes::unicast`].
    #[must_use]
    pub fn unicast(&self, name: &PeerName) -> Option<PeerName> {
        self.snapshot().unicast(name)
    }

    /// See [`Routes::unicast_all`].
    #[must_use]
    pub fn unicast_all(&self, name: &PeerName) -> Option<PeerName> {
        self.snapshot().unicast_all(name)
    }

    /// See [`Routes::broadcast`].
    #[must_use]
    pub fn broadcast(&self, source: &PeerName) -> Vec<PeerName> {
        self.snapshot().broadcast(source).to_vec()
    }

    /// See [`Routes::broadcast_all`].
    #[must_use]
    pub fn broadcast_all(&self, source: &PeerName) -> Vec<PeerName> {
        self.snapshot().broadcast_all(source).to_vec()
    }

    /// See [`Routes::random_neighbours`].
    #[must_use]
    pub fn random_neighbours(&self, except: &PeerName) -> Vec<PeerName> {
        self.snapshot().random_neighbours(except)
    }
}

impl std::fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteTable")
            .field("ourself", &self.ourself)
            .finish_non_exhaustive()
    }
}

/// Background task that performs coalesced recalculations.
#[derive(Debug)]
pub struct RouteCalculator {
    table: Weak<RouteTable>,
    recalculate: mpsc::Receiver<()>,
    wait: mpsc::Receiver<oneshot::Sender<()>>,
}

impl RouteCalculator {
    /// Runs until the route table is dropped.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                request = self.recalculate.recv() => {
                    if request.is_none() || !self.apply() {
                        break;
                    }
                }
                waiter = self.wait.recv() => {
                    let Some(done) = waiter else { break };
                    if self.recalculate.try_recv().is_ok() && !self.apply() {
                        break;
                    }
                    let _ = done.send(());
                }
            }
        }
        debug!("route calculator stopped");
    }

    fn apply(&self) -> bool {
        match self.table.upgrade() {
            Some(table) => {
                table.recalculate_now();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
#[path = "routes_tests.rs"]
mod tests;
