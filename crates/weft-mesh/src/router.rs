//! The router: one peer's whole mesh stack.
//!
//! Owns the peer graph, route table, gossip channels, local peer,
//! connection maker and overlay, listens for TCP connections and dials
//! the targets the connection maker asks for.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{OverlayKind, RouterConfig};
use crate::connection::{run_connection, ConnectionContext};
use crate::connection_maker::{ConnectionMaker, DialFn, TargetStatus};
use crate::error::MeshError;
use crate::gossip::{ConnectionSet, GossipChannel, GossipChannels, Gossiper, GOSSIP_INTERVAL};
use crate::local_peer::{ConnectionMap, LocalPeer};
use crate::overlay::{FrameConsumer, NullOverlay, Overlay, Sleeve};
use crate::peer::{random_uid, Peer, PeerName};
use crate::peers::PeerGraph;
use crate::routes::RouteTable;
use crate::token_bucket::{TokenBucket, ACCEPT_BURST, ACCEPT_TOKEN_INTERVAL};
use crate::topology::{TopologyGossiper, TOPOLOGY_CHANNEL};

/// One live connection, for status reports.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    /// Peer at the other end.
    pub peer: PeerName,
    /// Address on our edge.
    pub address: String,
    /// Whether we dialled.
    pub outbound: bool,
    /// Whether the overlay is established.
    pub established: bool,
}

/// Point-in-time view of a router.
#[derive(Debug, Clone, Serialize)]
pub struct RouterStatus {
    /// Our name.
    pub name: PeerName,
    /// Our nickname.
    pub nick_name: String,
    /// TCP listening address.
    pub listen_addr: SocketAddr,
    /// Every known peer with its edges.
    pub peers: Vec<Peer>,
    /// Live connections.
    pub connections: Vec<ConnectionStatus>,
    /// Destination to next hop.
    pub unicast_routes: BTreeMap<PeerName, PeerName>,
    /// Source to next hops for broadcasts.
    pub broadcast_routes: BTreeMap<PeerName, Vec<PeerName>>,
    /// Connection maker targets.
    pub targets: Vec<TargetStatus>,
    /// Overlay diagnostics.
    pub overlay: serde_json::Value,
}

/// A running mesh peer.
pub struct Router {
    nick_name: String,
    listen_addr: SocketAddr,
    peers: Arc<PeerGraph>,
    routes: Arc<RouteTable>,
    gossip: Arc<GossipChannels>,
    topology: Arc<GossipChannel<TopologyGossiper>>,
    sleeve: Option<Arc<Sleeve>>,
    ctx: ConnectionContext,
    shutdown: CancellationToken,
}

impl Router {
    /// Validates `config`, binds the listening sockets, starts every
    /// background task and begins dialling the configured peers. Frames
    /// arriving over the overlay go to `consumer`.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Config`] for an invalid configuration and
    /// [`MeshError::Io`] if a socket cannot be bound.
    pub async fn start(
        config: RouterConfig,
        consumer: Arc<dyn FrameConsumer>,
    ) -> Result<Arc<Self>, MeshError> {
        config.validate()?;
        let name = config.name.unwrap_or_else(PeerName::random);
        let peers = Arc::new(PeerGraph::new(Peer::new(
            name,
            config.nick_name.clone(),
            random_uid(),
            0,
        )));
        peers.on_gc(Box::new(|peer| {
            info!(peer = %peer.name, nick = %peer.nick_name, "removed unreachable peer");
        }));
        let routes = RouteTable::start(Arc::clone(&peers));
        let connections = Arc::new(ConnectionMap::default());
        let gossip = Arc::new(GossipChannels::new(
            name,
            Arc::clone(&routes),
            Arc::clone(&connections) as Arc<dyn ConnectionSet>,
        ));
        let topology = gossip.new_channel(
            TOPOLOGY_CHANNEL,
            Arc::new(TopologyGossiper::new(Arc::clone(&peers), Arc::clone(&routes))),
        )?;
        let shutdown = CancellationToken::new();

        let listener = TcpListener::bind((config.bind_address, config.port)).await?;
        let listen_addr = listener.local_addr()?;
        let sleeve = match config.overlay {
            OverlayKind::Sleeve => Some(
                Sleeve::bind(
                    listen_addr,
                    Arc::clone(&peers),
                    consumer,
                    shutdown.clone(),
                )
                .await?,
            ),
            OverlayKind::None => None,
        };
        let overlay: Arc<dyn Overlay> = match &sleeve {
            Some(sleeve) => Arc::clone(sleeve) as Arc<dyn Overlay>,
            None => Arc::new(NullOverlay),
        };

        let local_peer = LocalPeer::start(
            Arc::clone(&peers),
            Arc::clone(&routes),
            connections,
            Arc::clone(&gossip),
            Arc::clone(&topology),
            config.conn_limit,
            shutdown.clone(),
        );

        let router = Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            let dial: DialFn = Arc::new(move |address, direct| {
                if let Some(router) = weak.upgrade() {
                    router.create_connection(address, direct);
                }
            });
            let maker = ConnectionMaker::start(
                Arc::clone(&peers),
                listen_addr.port(),
                config.peer_discovery,
                dial,
                shutdown.clone(),
            );
            Self {
                nick_name: config.nick_name.clone(),
                listen_addr,
                peers: Arc::clone(&peers),
                routes: Arc::clone(&routes),
                gossip: Arc::clone(&gossip),
                topology: Arc::clone(&topology),
                sleeve,
                ctx: ConnectionContext {
                    peers: Arc::clone(&peers),
                    local_peer,
                    gossip: Arc::clone(&gossip),
                    maker,
                    overlay,
                    min_version: config.protocol_min_version,
                    password: config.password_bytes(),
                    trusted_subnets: config.trusted_subnets.clone(),
                    shutdown: shutdown.clone(),
                },
                shutdown,
            }
        });

        let maker = router.ctx.maker.clone();
        router
            .topology
            .gossiper()
            .on_update(Box::new(move || maker.refresh()));

        tokio::spawn(Arc::clone(&router).accept_loop(listener));
        tokio::spawn(gossip_loop(
            Arc::clone(&router.gossip),
            router.shutdown.clone(),
        ));
        info!(peer = %name, nick = %config.nick_name, addr = %listen_addr, "router started");
        for err in router.connect(&config.peers, false).await {
            warn!(error = %err, "ignoring configured peer");
        }
        Ok(router)
    }

    /// Our name.
    #[must_use]
    pub fn name(&self) -> PeerName {
        self.peers.ourself_name()
    }

    /// TCP listening address; the sleeve uses the same port for UDP.
    #[must_use]
    pub const fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Known peers.
    #[must_use]
    pub const fn peers(&self) -> &Arc<PeerGraph> {
        &self.peers
    }

    /// Route table.
    #[must_use]
    pub const fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    /// The sleeve overlay, unless running without a data plane.
    #[must_use]
    pub const fn sleeve(&self) -> Option<&Arc<Sleeve>> {
        self.sleeve.as_ref()
    }

    /// Registers an application gossip channel.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Gossip`] if the name is taken.
    pub fn new_gossip_channel<G: Gossiper>(
        &self,
        name: &str,
        gossiper: Arc<G>,
    ) -> Result<Arc<GossipChannel<G>>, MeshError> {
        self.gossip.new_channel(name, gossiper)
    }

    /// Adds direct peers, replacing the current set if `replace` is set.
    /// Returns the addresses that could not be resolved.
    pub async fn connect(&self, peers: &[String], replace: bool) -> Vec<MeshError> {
        self.ctx.maker.initiate_connections(peers, replace).await
    }

    /// Removes direct peers.
    pub async fn forget(&self, peers: &[String]) {
        self.ctx.maker.forget_connections(peers).await;
    }

    /// Sends a frame from us to `dst` over the overlay.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Connection`] when there is no route to `dst` or
    /// no data plane.
    pub async fn forward_frame(&self, dst: PeerName, frame: &[u8]) -> Result<(), MeshError> {
        let sleeve = self
            .sleeve
            .as_ref()
            .ok_or_else(|| MeshError::Connection("no overlay configured".to_string()))?;
        let via = self
            .routes
            .unicast(&dst)
            .ok_or_else(|| MeshError::Connection(format!("no route to {dst}")))?;
        sleeve.forward(via, self.name(), dst, frame, false).await
    }

    /// Snapshot of the router's state.
    pub async fn status(&self) -> RouterStatus {
        let routes = self.routes.snapshot();
        let mut peers = Vec::new();
        self.peers.for_each(|peer| peers.push(peer.clone()));
        let connections = self
            .ctx
            .local_peer
            .connections()
            .all()
            .into_iter()
            .map(|conn| ConnectionStatus {
                peer: conn.remote_name(),
                address: conn.address().to_string(),
                outbound: conn.outbound(),
                established: conn.is_established(),
            })
            .collect();
        RouterStatus {
            name: self.name(),
            nick_name: self.nick_name.clone(),
            listen_addr: self.listen_addr,
            peers,
            connections,
            unicast_routes: routes
                .unicast_table()
                .iter()
                .map(|(dst, via)| (*dst, *via))
                .collect(),
            broadcast_routes: routes
                .broadcast_table()
                .iter()
                .map(|(src, hops)| (*src, hops.clone()))
                .collect(),
            targets: self.ctx.maker.targets().await,
            overlay: self.ctx.overlay.diagnostics(),
        }
    }

    /// Stops every task and closes every connection.
    pub fn stop(&self) {
        info!(peer = %self.name(), "router stopping");
        self.shutdown.cancel();
    }

    /// Returns true once [`Router::stop`] has been called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Dials `address` on behalf of the connection maker.
    fn create_connection(self: &Arc<Self>, address: String, direct: bool) {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            let maker = &router.ctx.maker;
            if let Err(err) = router.ctx.local_peer.check_connection_limit() {
                maker.connection_aborted(address, &err).await;
                return;
            }
            let addr: SocketAddr = match address.parse() {
                Ok(addr) => addr,
                Err(_) => {
                    let err = MeshError::Config(format!("invalid target address '{address}'"));
                    maker.connection_aborted(address, &err).await;
                    return;
                }
            };
            debug!(addr = %addr, direct, "dialling");
            let connected = tokio::select! {
                connected = TcpStream::connect(addr) => connected,
                () = router.shutdown.cancelled() => return,
            };
            match connected {
                Ok(stream) => {
                    run_connection(router.ctx.clone(), stream, address, true, direct).await;
                }
                Err(err) => maker.connection_aborted(address, &err.into()).await,
            }
        });
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut bucket = TokenBucket::new(ACCEPT_BURST, ACCEPT_TOKEN_INTERVAL);
        loop {
            tokio::select! {
                () = bucket.wait() => {}
                () = self.shutdown.cancelled() => break,
            }
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                () = self.shutdown.cancelled() => break,
            };
            match accepted {
                Ok((stream, addr)) => {
                    if let Err(err) = self.ctx.local_peer.check_connection_limit() {
                        info!(addr = %addr, error = %err, "rejecting connection");
                        continue;
                    }
                    debug!(addr = %addr, "accepted connection");
                    tokio::spawn(run_connection(
                        self.ctx.clone(),
                        stream,
                        addr.to_string(),
                        false,
                        true,
                    ));
                }
                Err(err) => warn!(error = %err, "accept failed"),
            }
        }
        debug!("listener stopped");
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("name", &self.name())
            .field("listen_addr", &self.listen_addr)
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

async fn gossip_loop(gossip: Arc<GossipChannels>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + GOSSIP_INTERVAL,
        GOSSIP_INTERVAL,
    );
    loop {
        tokio::select! {
            _ = ticker.tick() => gossip.send_all_gossip().await,
            () = shutdown.cancelled() => break,
        }
    }
}
