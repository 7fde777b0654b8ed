//! The local peer: owner of every live connection.
//!
//! Connections register and unregister through a single actor task, so
//! duplicate resolution, the connection limit and the matching edge
//! updates in the peer graph happen in one order. Lookups by remote name
//! go through [`ConnectionMap`] without involving the actor.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::connection::{ConnectionHandle, TieBreak};
use crate::error::MeshError;
use crate::gossip::{ConnectionSet, GossipChannel, GossipChannels, ProtocolSender};
use crate::peer::{Edge, PeerName};
use crate::peers::{PeerGraph, PeerNameSet};
use crate::routes::RouteTable;
use crate::topology::TopologyGossiper;

/// Capacity of the action queue.
const CHANNEL_SIZE: usize = 16;

/// Live connections keyed by remote peer.
#[derive(Default)]
pub struct ConnectionMap {
    conns: RwLock<HashMap<PeerName, Arc<ConnectionHandle>>>,
}

impl ConnectionMap {
    /// Returns the connection to `name`.
    #[must_use]
    pub fn get(&self, name: &PeerName) -> Option<Arc<ConnectionHandle>> {
        self.conns.read().get(name).cloned()
    }

    /// Returns every connection.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<ConnectionHandle>> {
        self.conns.read().values().cloned().collect()
    }

    /// Number of connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.conns.read().len()
    }

    /// Returns true if there are no connections.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conns.read().is_empty()
    }

    fn holds(&self, conn: &Arc<ConnectionHandle>) -> bool {
        self.conns
            .read()
            .get(&conn.remote_name())
            .is_some_and(|c| Arc::ptr_eq(c, conn))
    }
}

impl ConnectionSet for ConnectionMap {
    fn connection_to(&self, name: &PeerName) -> Option<Arc<dyn ProtocolSender>> {
        self.get(name).map(|c| c as Arc<dyn ProtocolSender>)
    }

    fn connections(&self) -> Vec<Arc<dyn ProtocolSender>> {
        self.all()
            .into_iter()
            .map(|c| c as Arc<dyn ProtocolSender>)
            .collect()
    }
}

impl std::fmt::Debug for ConnectionMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionMap")
            .field("len", &self.len())
            .finish()
    }
}

enum LocalPeerAction {
    Add {
        conn: Arc<ConnectionHandle>,
        reply: oneshot::Sender<Result<(), MeshError>>,
    },
    Established(Arc<ConnectionHandle>),
    Delete(Arc<ConnectionHandle>),
}

/// Handle to the local peer actor.
#[derive(Clone)]
pub struct LocalPeer {
    connections: Arc<ConnectionMap>,
    conn_limit: usize,
    actions: mpsc::Sender<LocalPeerAction>,
}

impl LocalPeer {
    /// Spawns the actor. A `conn_limit` of 0 means unlimited.
    #[must_use]
    pub fn start(
        peers: Arc<PeerGraph>,
        routes: Arc<RouteTable>,
        connections: Arc<ConnectionMap>,
        gossip: Arc<GossipChannels>,
        topology: Arc<GossipChannel<TopologyGossiper>>,
        conn_limit: usize,
        shutdown: CancellationToken,
    ) -> Self {
        let (actions_tx, actions_rx) = mpsc::channel(CHANNEL_SIZE);
        let actor = Actor {
            peers,
            routes,
            connections: Arc::clone(&connections),
            gossip,
            topology,
            conn_limit,
        };
        tokio::spawn(actor.run(actions_rx, shutdown));
        Self {
            connections,
            conn_limit,
            actions: actions_tx,
        }
    }

    /// The live connections.
    #[must_use]
    pub const fn connections(&self) -> &Arc<ConnectionMap> {
        &self.connections
    }

    /// Fails if no further connection may be made.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::ConnectionLimit`] when at the limit.
    pub fn check_connection_limit(&self) -> Result<(), MeshError> {
        check_limit(self.conn_limit, self.connections.len())
    }

    /// Registers a connection that finished its handshake.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Duplicate`] if another connection to the same
    /// peer wins the tie-break, [`MeshError::ConnectionLimit`] when full, or
    /// [`MeshError::Shutdown`] once the actor has stopped.
    pub async fn add_connection(&self, conn: Arc<ConnectionHandle>) -> Result<(), MeshError> {
        let (reply, rx) = oneshot::channel();
        self.actions
            .send(LocalPeerAction::Add { conn, reply })
            .await
            .map_err(|_| MeshError::Shutdown("local peer"))?;
        rx.await.map_err(|_| MeshError::Shutdown("local peer"))?
    }

    /// Marks a registered connection as established.
    pub async fn connection_established(&self, conn: Arc<ConnectionHandle>) {
        let _ = self.actions.send(LocalPeerAction::Established(conn)).await;
    }

    /// Unregisters a connection. Ignored if it was already replaced.
    pub async fn delete_connection(&self, conn: Arc<ConnectionHandle>) {
        let _ = self.actions.send(LocalPeerAction::Delete(conn)).await;
    }
}

impl std::fmt::Debug for LocalPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalPeer")
            .field("connections", &self.connections.len())
            .field("conn_limit", &self.conn_limit)
            .finish_non_exhaustive()
    }
}

const fn check_limit(limit: usize, count: usize) -> Result<(), MeshError> {
    if limit != 0 && count >= limit {
        return Err(MeshError::ConnectionLimit(limit));
    }
    Ok(())
}

struct Actor {
    peers: Arc<PeerGraph>,
    routes: Arc<RouteTable>,
    connections: Arc<ConnectionMap>,
    gossip: Arc<GossipChannels>,
    topology: Arc<GossipChannel<TopologyGossiper>>,
    conn_limit: usize,
}

impl Actor {
    async fn run(self, mut actions: mpsc::Receiver<LocalPeerAction>, shutdown: CancellationToken) {
        loop {
            let action = tokio::select! {
                action = actions.recv() => match action {
                    Some(action) => action,
                    None => break,
                },
                () = shutdown.cancelled() => break,
            };
            match action {
                LocalPeerAction::Add { conn, reply } => {
                    let _ = reply.send(self.add(conn));
                }
                LocalPeerAction::Established(conn) => self.established(&conn),
                LocalPeerAction::Delete(conn) => self.delete(&conn),
            }
        }
        debug!("local peer stopped");
    }

    fn add(&self, conn: Arc<ConnectionHandle>) -> Result<(), MeshError> {
        let remote = conn.remote_name();
        if let Some(existing) = self.connections.get(&remote) {
            if Arc::ptr_eq(&existing, &conn) {
                return Ok(());
            }
            let outcome = TieBreak::between(conn.uid(), existing.uid());
            let duplicate = || MeshError::Duplicate {
                remote,
                outcome: outcome.to_string(),
            };
            match outcome {
                TieBreak::Won => {
                    existing.shutdown(duplicate());
                    self.delete(&existing);
                }
                TieBreak::Lost => return Err(duplicate()),
                TieBreak::Tied => {
                    existing.shutdown(duplicate());
                    self.delete(&existing);
                    return Err(duplicate());
                }
            }
        }
        check_limit(self.conn_limit, self.connections.len())?;

        let known_route = self.routes.unicast(&remote).is_some();
        self.connections
            .conns
            .write()
            .insert(remote, Arc::clone(&conn));
        self.peers.add_local_edge(
            remote,
            Edge::new(conn.address(), conn.outbound(), conn.is_established()),
        );
        if known_route {
            info!(peer = %remote, addr = %conn.address(), "connection added");
        } else {
            info!(peer = %remote, addr = %conn.address(), "connection added (new peer)");
            let sender: Arc<dyn ProtocolSender> = conn;
            self.gossip.send_all_gossip_down(&sender);
        }
        self.routes.recalculate();
        self.broadcast_update(Some(remote));
        Ok(())
    }

    fn established(&self, conn: &Arc<ConnectionHandle>) {
        if !self.connections.holds(conn) {
            return;
        }
        if self.peers.mark_local_edge_established(&conn.remote_name()) {
            info!(peer = %conn.remote_name(), "connection fully established");
            self.routes.recalculate();
            self.broadcast_update(None);
        }
    }

    fn delete(&self, conn: &Arc<ConnectionHandle>) {
        let remote = conn.remote_name();
        {
            let mut conns = self.connections.conns.write();
            if !conns.get(&remote).is_some_and(|c| Arc::ptr_eq(c, conn)) {
                return;
            }
            conns.remove(&remote);
        }
        info!(peer = %remote, "connection deleted");
        self.peers.remove_local_edge(&remote);
        // collect before recalculating so routes never name removed peers
        self.peers.garbage_collect();
        self.routes.recalculate();
        self.broadcast_update(None);
    }

    fn broadcast_update(&self, also: Option<PeerName>) {
        let mut names = PeerNameSet::new();
        names.insert(self.peers.ourself_name());
        names.extend(also);
        self.topology
            .gossip_broadcast(self.topology.gossiper().data(names));
    }
}
