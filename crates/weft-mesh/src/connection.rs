//! Control connections to remote peers.
//!
//! - [`run_connection`]: drives one TCP stream from handshake to teardown
//! - [`ConnectionHandle`]: the registered side that gossip, the overlay
//!   and the local peer talk to
//! - [`TieBreak`]: resolves two connections to the same peer
//!
//! Each connection is three tasks: an actor that owns the lifecycle, a
//! reader that dispatches inbound messages, and a writer that drains the
//! outbound queue and sends TCP heartbeats.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ipnet::IpNet;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection_maker::{ConnectionMaker, ConnectionSummary};
use crate::error::MeshError;
use crate::gossip::{BoxFuture, GossipChannels, ProtocolSender};
use crate::local_peer::LocalPeer;
use crate::overlay::{Overlay, OverlayConnection, OverlayConnectionParams, OverlayEvent};
use crate::peer::{random_uid, Peer, PeerName, PEER_NAME_FLAVOUR};
use crate::peers::PeerGraph;
use crate::protocol::{
    do_intro, feature, Features, IntroParams, ProtocolMsg, ProtocolTag, TcpReceiver, TcpSender,
    FEATURE_CONN_ID, FEATURE_NAME, FEATURE_NICK_NAME, FEATURE_PEER_NAME_FLAVOUR, FEATURE_TRUSTED,
    FEATURE_UID, PROTOCOL_MAX_VERSION, TCP_HEARTBEAT,
};

/// Capacity of per-connection queues.
pub const CHANNEL_SIZE: usize = 16;

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// TCP is being set up.
    Connecting,
    /// Exchanging protocol header and features.
    Handshaking,
    /// The overlay works in both directions.
    Established,
    /// Torn down.
    Closed,
}

impl ConnectionState {
    /// Returns true if the connection carries traffic.
    #[must_use]
    pub const fn is_usable(&self) -> bool {
        matches!(self, Self::Established)
    }

    /// Returns true if the connection has been torn down.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Outcome of comparing a new connection with an existing one to the same
/// peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TieBreak {
    /// The new connection replaces the existing one.
    Won,
    /// The new connection is dropped.
    Lost,
    /// Both are dropped.
    Tied,
}

impl TieBreak {
    /// Compares combined connection ids. Both ends compute the same ids, so
    /// both reach the same verdict.
    #[must_use]
    pub const fn between(ours: u64, theirs: u64) -> Self {
        if ours < theirs {
            Self::Won
        } else if ours > theirs {
            Self::Lost
        } else {
            Self::Tied
        }
    }
}

impl fmt::Display for TieBreak {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Won => "won",
            Self::Lost => "lost",
            Self::Tied => "tied",
        })
    }
}

/// The registered side of a connection.
pub struct ConnectionHandle {
    uid: u64,
    remote: PeerName,
    address: String,
    remote_addr: SocketAddr,
    outbound: bool,
    established: AtomicBool,
    msgs: mpsc::Sender<ProtocolMsg>,
    errors: mpsc::Sender<MeshError>,
    finished: CancellationToken,
}

impl ConnectionHandle {
    pub(crate) fn new(
        uid: u64,
        remote: PeerName,
        address: String,
        remote_addr: SocketAddr,
        outbound: bool,
        finished: CancellationToken,
    ) -> (
        Arc<Self>,
        mpsc::Receiver<ProtocolMsg>,
        mpsc::Receiver<MeshError>,
    ) {
        let (msgs_tx, msgs_rx) = mpsc::channel(CHANNEL_SIZE);
        let (errors_tx, errors_rx) = mpsc::channel(1);
        let handle = Arc::new(Self {
            uid,
            remote,
            address,
            remote_addr,
            outbound,
            established: AtomicBool::new(false),
            msgs: msgs_tx,
            errors: errors_tx,
            finished,
        });
        (handle, msgs_rx, errors_rx)
    }

    /// Combined connection id.
    #[must_use]
    pub const fn uid(&self) -> u64 {
        self.uid
    }

    /// Peer at the other end.
    #[must_use]
    pub const fn remote_name(&self) -> PeerName {
        self.remote
    }

    /// Address recorded on our edge: the dialled target for outbound
    /// connections, the remote socket address for inbound ones.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Remote TCP address.
    #[must_use]
    pub const fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Whether we dialled.
    #[must_use]
    pub const fn outbound(&self) -> bool {
        self.outbound
    }

    /// Returns true once the overlay reported the connection established.
    #[must_use]
    pub fn is_established(&self) -> bool {
        self.established.load(Ordering::Acquire)
    }

    /// Returns true once the connection has started shutting down.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }

    /// Asks the connection to close with `err`. Only the first reason is
    /// kept.
    pub fn shutdown(&self, err: MeshError) {
        if self.errors.try_send(err).is_err() {
            debug!(peer = %self.remote, "connection already shutting down");
        }
    }

    /// Summary for the connection maker.
    #[must_use]
    pub fn summary(&self) -> ConnectionSummary {
        ConnectionSummary {
            id: self.uid,
            remote: self.remote,
            address: self.address.clone(),
            outbound: self.outbound,
        }
    }
}

impl ProtocolSender for ConnectionHandle {
    fn id(&self) -> u64 {
        self.uid
    }

    fn remote_name(&self) -> PeerName {
        self.remote
    }

    fn send_protocol_msg(&self, msg: ProtocolMsg) -> BoxFuture<'_, Result<(), MeshError>> {
        Box::pin(async move {
            tokio::select! {
                sent = self.msgs.send(msg) => sent.map_err(|_| MeshError::Shutdown("connection")),
                () = self.finished.cancelled() => Err(MeshError::Shutdown("connection")),
            }
        })
    }

    fn try_send_protocol_msg(&self, msg: ProtocolMsg) -> Result<(), MeshError> {
        match self.msgs.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(MeshError::Connection(format!(
                "send queue to {} is full",
                self.remote
            ))),
            Err(TrySendError::Closed(_)) => Err(MeshError::Shutdown("connection")),
        }
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("uid", &self.uid)
            .field("remote", &self.remote)
            .field("address", &self.address)
            .field("outbound", &self.outbound)
            .field("established", &self.is_established())
            .finish_non_exhaustive()
    }
}

/// Everything a connection needs from the router.
#[derive(Clone)]
pub struct ConnectionContext {
    /// Known peers.
    pub peers: Arc<PeerGraph>,
    /// Owner of live connections.
    pub local_peer: LocalPeer,
    /// Gossip dispatch.
    pub gossip: Arc<GossipChannels>,
    /// Told about every connection that starts or ends.
    pub maker: ConnectionMaker,
    /// Data plane.
    pub overlay: Arc<dyn Overlay>,
    /// Oldest protocol version we accept.
    pub min_version: u8,
    /// Shared password; `None` for unencrypted connections.
    pub password: Option<Vec<u8>>,
    /// Remote addresses whose overlay traffic need not be encrypted.
    pub trusted_subnets: Vec<IpNet>,
    /// Router shutdown.
    pub shutdown: CancellationToken,
}

impl ConnectionContext {
    fn trusts(&self, ip: IpAddr) -> bool {
        self.trusted_subnets.iter().any(|net| net.contains(&ip))
    }
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("ourself", &self.peers.ourself_name())
            .field("min_version", &self.min_version)
            .field("encrypted", &self.password.is_some())
            .finish_non_exhaustive()
    }
}

/// What the remote told us about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RemoteIntro {
    peer: Peer,
    conn_id: u64,
    trusted: bool,
}

impl RemoteIntro {
    fn parse(features: &Features) -> Result<Self, MeshError> {
        let flavour = feature(features, FEATURE_PEER_NAME_FLAVOUR)?;
        if flavour != PEER_NAME_FLAVOUR {
            return Err(MeshError::Handshake(format!(
                "peer name flavour mismatch (ours: '{PEER_NAME_FLAVOUR}', theirs: '{flavour}')"
            )));
        }
        let name: PeerName = feature(features, FEATURE_NAME)?.parse()?;
        let nick_name = feature(features, FEATURE_NICK_NAME)?;
        let uid = parse_u64(features, FEATURE_UID)?;
        let conn_id = parse_u64(features, FEATURE_CONN_ID)?;
        let trusted = features
            .get(FEATURE_TRUSTED)
            .is_some_and(|t| t == "true");
        Ok(Self {
            peer: Peer::new(name, nick_name, uid, 0),
            conn_id,
            trusted,
        })
    }
}

fn parse_u64(features: &Features, key: &str) -> Result<u64, MeshError> {
    let value = feature(features, key)?;
    value
        .parse()
        .map_err(|_| MeshError::Handshake(format!("invalid {key} '{value}'")))
}

/// Runs a connection over `stream` until it closes.
///
/// `address` is the dialled target for outbound connections, which is how
/// the connection maker recognises them. `accept_new_peer` allows the
/// remote to be a peer we have never heard of.
pub async fn run_connection(
    ctx: ConnectionContext,
    stream: TcpStream,
    address: String,
    outbound: bool,
    accept_new_peer: bool,
) {
    let remote_addr = match stream.peer_addr() {
        Ok(addr) => addr,
        Err(err) => {
            let err = MeshError::from(err);
            warn!(addr = %address, error = %err, "connection lost before handshake");
            if outbound {
                ctx.maker.connection_aborted(address, &err).await;
            }
            return;
        }
    };
    let mut conn = LocalConnection {
        ctx,
        address,
        remote_addr,
        outbound,
        state: ConnectionState::Connecting,
        remote: None,
        handle: None,
        overlay: None,
        added: false,
    };
    let err = match conn.serve(stream, accept_new_peer).await {
        Ok(()) => MeshError::Shutdown("router"),
        Err(err) => err,
    };
    conn.teardown(err).await;
}

struct LocalConnection {
    ctx: ConnectionContext,
    address: String,
    remote_addr: SocketAddr,
    outbound: bool,
    state: ConnectionState,
    /// Set once we hold a reference on the remote peer.
    remote: Option<PeerName>,
    handle: Option<Arc<ConnectionHandle>>,
    overlay: Option<Arc<dyn OverlayConnection>>,
    added: bool,
}

impl LocalConnection {
    fn local_features(&self, conn_id: u64, trust_remote: bool) -> Features {
        let ourself = self.ctx.peers.ourself();
        let mut features = Features::new();
        features.insert(FEATURE_PEER_NAME_FLAVOUR.to_string(), PEER_NAME_FLAVOUR.to_string());
        features.insert(FEATURE_NAME.to_string(), ourself.name.to_string());
        features.insert(FEATURE_NICK_NAME.to_string(), ourself.nick_name);
        features.insert(FEATURE_UID.to_string(), ourself.uid.to_string());
        features.insert(FEATURE_CONN_ID.to_string(), conn_id.to_string());
        features.insert(FEATURE_TRUSTED.to_string(), trust_remote.to_string());
        self.ctx.overlay.add_features_to(&mut features);
        features
    }

    /// Returns `Ok` only when the router shuts down.
    async fn serve(&mut self, stream: TcpStream, accept_new_peer: bool) -> Result<(), MeshError> {
        stream.set_nodelay(true)?;
        let conn_id = random_uid();
        let trust_remote = self.ctx.trusts(self.remote_addr.ip());
        let params = IntroParams {
            min_version: self.ctx.min_version,
            max_version: PROTOCOL_MAX_VERSION,
            features: self.local_features(conn_id, trust_remote),
            password: self.ctx.password.clone(),
            outbound: self.outbound,
        };

        self.state = ConnectionState::Handshaking;
        let intro = do_intro(stream, &params).await?;
        let remote = RemoteIntro::parse(&intro.features)?;
        let uid = conn_id ^ remote.conn_id;
        self.register_remote(&remote.peer, accept_new_peer)?;

        let (handle, msgs, errors) = ConnectionHandle::new(
            uid,
            remote.peer.name,
            self.address.clone(),
            self.remote_addr,
            self.outbound,
            self.ctx.shutdown.child_token(),
        );
        self.handle = Some(Arc::clone(&handle));

        // the overlay skips encryption only when both ends trust each other
        let session_key = if trust_remote && remote.trusted {
            None
        } else {
            intro.session_key.clone()
        };
        let (events_tx, events) = mpsc::channel(CHANNEL_SIZE);
        let overlay = self.ctx.overlay.prepare_connection(
            OverlayConnectionParams {
                remote_peer: remote.peer.name,
                remote_addr: self.remote_addr,
                outbound: self.outbound,
                conn_uid: uid,
                session_key,
                control: Arc::clone(&handle) as Arc<dyn ProtocolSender>,
                features: intro.features.clone(),
            },
            events_tx,
        )?;
        self.overlay = Some(Arc::clone(&overlay));

        self.ctx.local_peer.add_connection(Arc::clone(&handle)).await?;
        self.added = true;
        self.ctx.maker.connection_created(handle.summary()).await;
        overlay.confirm();
        info!(
            peer = %remote.peer.name,
            nick = %remote.peer.nick_name,
            addr = %self.address,
            version = intro.version,
            encrypted = intro.sender.is_encrypted(),
            overlay = overlay.display_name(),
            "connection ready"
        );

        tokio::spawn(write_loop(intro.sender, msgs, Arc::clone(&handle)));
        tokio::spawn(read_loop(
            intro.receiver,
            Arc::clone(&handle),
            Arc::clone(&self.ctx.gossip),
            overlay,
        ));
        self.actor_loop(&handle, errors, events).await
    }

    fn register_remote(&mut self, candidate: &Peer, accept_new_peer: bool) -> Result<(), MeshError> {
        let ourself = self.ctx.peers.ourself();
        if candidate.name == ourself.name {
            if candidate.uid == ourself.uid {
                return Err(MeshError::ConnectToSelf);
            }
            return Err(MeshError::NameCollision {
                name: candidate.name,
                known: ourself.uid,
                received: candidate.uid,
            });
        }
        let peer = if accept_new_peer {
            self.ctx.peers.fetch_with_default(candidate.clone())?
        } else {
            self.ctx
                .peers
                .fetch_and_add_ref(&candidate.name)
                .ok_or_else(|| {
                    MeshError::Handshake(format!(
                        "found unknown remote name {} at {}",
                        candidate.name, self.remote_addr
                    ))
                })?
        };
        self.remote = Some(peer.name);
        if peer.uid != candidate.uid {
            return Err(MeshError::NameCollision {
                name: peer.name,
                known: peer.uid,
                received: candidate.uid,
            });
        }
        Ok(())
    }

    async fn actor_loop(
        &mut self,
        handle: &Arc<ConnectionHandle>,
        mut errors: mpsc::Receiver<MeshError>,
        mut events: mpsc::Receiver<OverlayEvent>,
    ) -> Result<(), MeshError> {
        loop {
            tokio::select! {
                err = errors.recv() => {
                    return Err(err.unwrap_or(MeshError::Shutdown("connection")));
                }
                event = events.recv() => match event {
                    Some(OverlayEvent::Established) => {
                        if !handle.established.swap(true, Ordering::AcqRel) {
                            self.state = ConnectionState::Established;
                            self.ctx.local_peer.connection_established(Arc::clone(handle)).await;
                        }
                    }
                    Some(OverlayEvent::Error(err)) => return Err(err),
                    None => return Err(MeshError::Shutdown("overlay")),
                },
                () = handle.finished.cancelled() => return Ok(()),
            }
        }
    }

    async fn teardown(self, err: MeshError) {
        if let Some(handle) = &self.handle {
            handle.finished.cancel();
        }
        match self.remote {
            Some(remote) => info!(
                peer = %remote,
                addr = %self.address,
                state = ?self.state,
                error = %err,
                "connection shutting down"
            ),
            None => info!(
                addr = %self.address,
                error = %err,
                "connection shutting down during handshake"
            ),
        }

        if let Some(remote) = &self.remote {
            self.ctx.peers.dereference(remote);
        }
        if let Some(handle) = self.handle.as_ref().filter(|_| self.added) {
            self.ctx.local_peer.delete_connection(Arc::clone(handle)).await;
        }
        if let Some(overlay) = &self.overlay {
            overlay.stop();
        }

        let summary = match &self.handle {
            Some(handle) => handle.summary(),
            None => ConnectionSummary {
                id: 0,
                remote: self.remote.unwrap_or(PeerName::UNKNOWN),
                address: self.address.clone(),
                outbound: self.outbound,
            },
        };
        self.ctx.maker.connection_terminated(summary, &err).await;
    }
}

async fn write_loop(
    mut sender: TcpSender<TcpStream>,
    mut msgs: mpsc::Receiver<ProtocolMsg>,
    handle: Arc<ConnectionHandle>,
) {
    let mut heartbeat =
        tokio::time::interval_at(tokio::time::Instant::now() + TCP_HEARTBEAT, TCP_HEARTBEAT);
    loop {
        let msg = tokio::select! {
            () = handle.finished.cancelled() => break,
            msg = msgs.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
            _ = heartbeat.tick() => ProtocolMsg::heartbeat(),
        };
        if let Err(err) = sender.send(&msg.encode()).await {
            handle.shutdown(err);
            break;
        }
    }
}

async fn read_loop(
    mut receiver: TcpReceiver<TcpStream>,
    handle: Arc<ConnectionHandle>,
    gossip: Arc<GossipChannels>,
    overlay: Arc<dyn OverlayConnection>,
) {
    let err = loop {
        let received = tokio::select! {
            () = handle.finished.cancelled() => return,
            received = tokio::time::timeout(TCP_HEARTBEAT * 2, receiver.receive()) => received,
        };
        let bytes = match received {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(err)) => break err,
            Err(_) => break MeshError::HeartbeatTimeout("TCP"),
        };
        let msg = match ProtocolMsg::decode(bytes) {
            Ok(msg) => msg,
            Err(err) => break err,
        };
        match msg.tag {
            ProtocolTag::Heartbeat => {}
            ProtocolTag::ConnectionEstablished
            | ProtocolTag::FragmentationReceived
            | ProtocolTag::PmtuVerified => {
                debug!(peer = %handle.remote_name(), tag = ?msg.tag, "ignoring legacy overlay message");
            }
            ProtocolTag::OverlayControl => overlay.control_message(&msg.payload),
            ProtocolTag::Gossip | ProtocolTag::GossipUnicast | ProtocolTag::GossipBroadcast => {
                if let Err(err) = gossip.handle(msg.tag, &msg.payload).await {
                    break err;
                }
            }
        }
    };
    handle.shutdown(err);
}

#[cfg(test)]
#[path = "connection_tests.rs"]
mod tests;
