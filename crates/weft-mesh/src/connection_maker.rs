//! Outbound connection management.
//!
//! The connection maker keeps a set of target addresses (direct peers given
//! by the operator plus, with discovery on, addresses learned from other
//! peers' edges), dials the ones that are due, and reschedules them with
//! randomized exponential backoff when attempts fail.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::MeshError;
use crate::peer::PeerName;
use crate::peers::PeerGraph;

/// Retry delay after the first failure.
pub const INITIAL_INTERVAL: Duration = Duration::from_secs(2);

/// Upper bound on the retry delay.
pub const MAX_INTERVAL: Duration = Duration::from_secs(6 * 60);

/// A connection that outlives its retry time by this much resets backoff.
pub const RESET_AFTER: Duration = Duration::from_secs(60);

/// Capacity of the action queue.
pub const CHANNEL_SIZE: usize = 16;

/// Dials `address`. The flag is true for operator-supplied targets, which
/// may introduce peers we have never heard of.
pub type DialFn = Arc<dyn Fn(String, bool) + Send + Sync>;

/// What the connection maker needs to know about a live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSummary {
    /// Connection id.
    pub id: u64,
    /// Peer at the other end.
    pub remote: PeerName,
    /// Remote TCP address; for outbound connections, the dialled target.
    pub address: String,
    /// Whether we dialled.
    pub outbound: bool,
}

/// Progress of one target address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetState {
    /// Waiting for the next attempt.
    Waiting,
    /// A connection attempt is in flight.
    Attempting,
    /// Connected.
    Connected,
}

#[derive(Debug, Clone)]
struct Target {
    state: TargetState,
    last_error: Option<String>,
    /// `None` means never retry.
    try_after: Option<Instant>,
    try_interval: Duration,
}

impl Target {
    fn new(now: Instant) -> Self {
        let mut target = Self {
            state: TargetState::Waiting,
            last_error: None,
            try_after: None,
            try_interval: INITIAL_INTERVAL,
        };
        target.next_try_now(now);
        target
    }

    fn next_try_never(&mut self) {
        self.try_after = None;
        self.try_interval = MAX_INTERVAL;
    }

    fn next_try_now(&mut self, now: Instant) {
        self.try_after = Some(now);
        self.try_interval = INITIAL_INTERVAL;
    }

    // The delay is drawn from [i/2, 3i/2) and i grows by half each time.
    fn next_try_later(&mut self, now: Instant) {
        let jitter = if self.try_interval.is_zero() {
            Duration::ZERO
        } else {
            rand::thread_rng().gen_range(Duration::ZERO..self.try_interval)
        };
        self.try_after = Some(now + self.try_interval / 2 + jitter);
        self.try_interval = (self.try_interval * 3 / 2).min(MAX_INTERVAL);
    }
}

/// Status of one target, for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetStatus {
    /// Target address.
    pub address: String,
    /// Current state.
    pub state: TargetState,
    /// Why the last attempt ended, if it did.
    pub last_error: Option<String>,
    /// Seconds until the next attempt; `None` when not scheduled.
    pub retry_in_secs: Option<u64>,
}

/// Target bookkeeping, separate from the task that drives it.
#[derive(Debug)]
struct MakerState {
    ourself: PeerName,
    port: u16,
    discovery: bool,
    targets: HashMap<String, Target>,
    connections: HashMap<u64, ConnectionSummary>,
    direct_peers: HashMap<String, SocketAddr>,
}

impl MakerState {
    fn new(ourself: PeerName, port: u16, discovery: bool) -> Self {
        Self {
            ourself,
            port,
            discovery,
            targets: HashMap::new(),
            connections: HashMap::new(),
            direct_peers: HashMap::new(),
        }
    }

    fn complete_addr(&self, addr: SocketAddr) -> String {
        if addr.port() == 0 {
            SocketAddr::new(addr.ip(), self.port).to_string()
        } else {
            addr.to_string()
        }
    }

    fn initiate(&mut self, peers: Vec<(String, SocketAddr)>, replace: bool, now: Instant) {
        if replace {
            self.direct_peers.clear();
        }
        for (peer, addr) in peers {
            let address = self.complete_addr(addr);
            self.direct_peers.insert(peer, addr);
            if let Some(target) = self.targets.get_mut(&address) {
                target.next_try_now(now);
            }
        }
    }

    fn forget(&mut self, peers: &[String]) {
        for peer in peers {
            self.direct_peers.remove(peer);
        }
    }

    fn aborted(&mut self, address: &str, error: String, now: Instant) {
        if let Some(target) = self.targets.get_mut(address) {
            target.state = TargetState::Waiting;
            target.last_error = Some(error);
            target.next_try_later(now);
        }
    }

    fn created(&mut self, conn: ConnectionSummary) {
        if conn.outbound {
            if let Some(target) = self.targets.get_mut(&conn.address) {
                target.state = TargetState::Connected;
            }
        }
        self.connections.insert(conn.id, conn);
    }

    fn terminated(&mut self, conn: &ConnectionSummary, never: bool, error: String, now: Instant) {
        self.connections.remove(&conn.id);
        if !conn.outbound {
            return;
        }
        let Some(target) = self.targets.get_mut(&conn.address) else {
            return;
        };
        target.state = TargetState::Waiting;
        target.last_error = Some(error);
        match target.try_after {
            _ if never => target.next_try_never(),
            Some(after) if now > after + RESET_AFTER => target.next_try_now(now),
            _ => target.next_try_later(now),
        }
    }

    /// Adds and prunes targets, dials those that are due, and returns how
    /// long until the next one is.
    fn check_state_and_attempt(
        &mut self,
        peers: &PeerGraph,
        now: Instant,
        dial: &dyn Fn(String, bool),
    ) -> Option<Duration> {
        let mut connected_peers = HashSet::new();
        let mut connected_targets = HashSet::new();
        let mut inbound_ips = HashSet::new();
        for conn in self.connections.values() {
            connected_peers.insert(conn.remote);
            connected_targets.insert(conn.address.clone());
            if !conn.outbound {
                if let Some(ip) = ip_of(&conn.address) {
                    inbound_ips.insert(ip);
                }
            }
        }

        let mut valid = HashSet::new();
        let mut direct = HashSet::new();
        let mut add_target = |targets: &mut HashMap<String, Target>, address: String| {
            if connected_targets.contains(&address) {
                return;
            }
            targets
                .entry(address.clone())
                .or_insert_with(|| Target::new(now));
            valid.insert(address);
        };

        for addr in self.direct_peers.values() {
            let address = self.complete_addr(*addr);
            direct.insert(address.clone());
            // a peer given without a port is satisfied by any inbound
            // connection from its IP
            if addr.port() == 0 && inbound_ips.contains(&addr.ip()) {
                continue;
            }
            add_target(&mut self.targets, address);
        }

        if self.discovery {
            let mut discovered = Vec::new();
            peers.for_each(|peer| {
                if peer.name == self.ourself {
                    return;
                }
                for (other, edge) in &peer.edges {
                    if *other == self.ourself || connected_peers.contains(other) {
                        continue;
                    }
                    if edge.outbound {
                        discovered.push(edge.remote_addr.clone());
                    } else if let Some(ip) = ip_of(&edge.remote_addr) {
                        // the remote port of an inbound connection is
                        // ephemeral; try the well-known port instead
                        discovered.push(SocketAddr::new(ip, self.port).to_string());
                    }
                }
            });
            for address in discovered {
                add_target(&mut self.targets, address);
            }
        }

        let mut after: Option<Duration> = None;
        self.targets.retain(|address, target| {
            if target.state != TargetState::Waiting {
                return true;
            }
            if !valid.contains(address) {
                return false;
            }
            let Some(try_after) = target.try_after else {
                return true;
            };
            let wait = try_after.saturating_duration_since(now);
            if wait.is_zero() {
                target.state = TargetState::Attempting;
                dial(address.clone(), direct.contains(address));
            } else if after.is_none_or(|a| wait < a) {
                after = Some(wait);
            }
            true
        });
        after
    }

    fn status(&self, now: Instant) -> Vec<TargetStatus> {
        let mut status: Vec<TargetStatus> = self
            .targets
            .iter()
            .map(|(address, target)| TargetStatus {
                address: address.clone(),
                state: target.state,
                last_error: target.last_error.clone(),
                retry_in_secs: match target.state {
                    TargetState::Waiting => target
                        .try_after
                        .map(|t| t.saturating_duration_since(now).as_secs()),
                    _ => None,
                },
            })
            .collect();
        status.sort_by(|a, b| a.address.cmp(&b.address));
        status
    }
}

fn ip_of(address: &str) -> Option<IpAddr> {
    address.parse::<SocketAddr>().ok().map(|a| a.ip())
}

enum MakerAction {
    Initiate {
        peers: Vec<(String, SocketAddr)>,
        replace: bool,
    },
    Forget(Vec<String>),
    Aborted {
        address: String,
        error: String,
    },
    Created(ConnectionSummary),
    Terminated {
        conn: ConnectionSummary,
        never: bool,
        error: String,
    },
    Refresh,
    Status(oneshot::Sender<Vec<TargetStatus>>),
}

/// Handle to the connection maker task.
#[derive(Clone)]
pub struct ConnectionMaker {
    actions: mpsc::Sender<MakerAction>,
}

impl ConnectionMaker {
    /// Spawns the connection maker.
    ///
    /// `port` completes targets given without one and is where discovered
    /// inbound-only peers are dialled.
    #[must_use]
    pub fn start(
        peers: Arc<PeerGraph>,
        port: u16,
        discovery: bool,
        dial: DialFn,
        shutdown: CancellationToken,
    ) -> Self {
        let (actions_tx, actions_rx) = mpsc::channel(CHANNEL_SIZE);
        let state = MakerState::new(peers.ourself_name(), port, discovery);
        tokio::spawn(run(state, actions_rx, peers, dial, shutdown));
        Self {
            actions: actions_tx,
        }
    }

    async fn send(&self, action: MakerAction) {
        if self.actions.send(action).await.is_err() {
            debug!("connection maker has stopped");
        }
    }

    /// Adds direct peers given as `host` or `host:port`, replacing the
    /// existing set if `replace` is set. Returns the entries that could not
    /// be resolved.
    pub async fn initiate_connections(&self, peers: &[String], replace: bool) -> Vec<MeshError> {
        let mut errors = Vec::new();
        let mut resolved = Vec::new();
        for peer in peers {
            match resolve(peer).await {
                Ok(addr) => resolved.push((peer.clone(), addr)),
                Err(err) => errors.push(err),
            }
        }
        self.send(MakerAction::Initiate {
            peers: resolved,
            replace,
        })
        .await;
        errors
    }

    /// Removes direct peers. Existing connections are left alone.
    pub async fn forget_connections(&self, peers: &[String]) {
        self.send(MakerAction::Forget(peers.to_vec())).await;
    }

    /// Reports that dialling `address` failed before a connection existed.
    pub async fn connection_aborted(&self, address: String, err: &MeshError) {
        self.send(MakerAction::Aborted {
            address,
            error: err.to_string(),
        })
        .await;
    }

    /// Reports a registered connection.
    pub async fn connection_created(&self, conn: ConnectionSummary) {
        self.send(MakerAction::Created(conn)).await;
    }

    /// Reports a closed connection and why it closed.
    pub async fn connection_terminated(&self, conn: ConnectionSummary, err: &MeshError) {
        self.send(MakerAction::Terminated {
            conn,
            never: matches!(err, MeshError::ConnectToSelf),
            error: err.to_string(),
        })
        .await;
    }

    /// Asks for targets to be re-evaluated, e.g. after a topology change.
    pub fn refresh(&self) {
        let _ = self.actions.try_send(MakerAction::Refresh);
    }

    /// Returns the status of every target.
    pub async fn targets(&self) -> Vec<TargetStatus> {
        let (tx, rx) = oneshot::channel();
        self.send(MakerAction::Status(tx)).await;
        rx.await.unwrap_or_default()
    }
}

impl std::fmt::Debug for ConnectionMaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionMaker").finish_non_exhaustive()
    }
}

async fn run(
    mut state: MakerState,
    mut actions: mpsc::Receiver<MakerAction>,
    peers: Arc<PeerGraph>,
    dial: DialFn,
    shutdown: CancellationToken,
) {
    let mut deadline: Option<Instant> = None;
    loop {
        let recheck = tokio::select! {
            action = actions.recv() => {
                let Some(action) = action else { break };
                apply(&mut state, action)
            }
            () = sleep_until(deadline) => true,
            () = shutdown.cancelled() => break,
        };
        if recheck {
            let now = Instant::now();
            deadline = state
                .check_state_and_attempt(&peers, now, &*dial)
                .map(|wait| now + wait);
        }
    }
    debug!("connection maker stopped");
}

fn apply(state: &mut MakerState, action: MakerAction) -> bool {
    let now = Instant::now();
    match action {
        MakerAction::Initiate { peers, replace } => {
            state.initiate(peers, replace, now);
            true
        }
        MakerAction::Forget(peers) => {
            state.forget(&peers);
            false
        }
        MakerAction::Aborted { address, error } => {
            warn!(addr = %address, error = %error, "connection attempt failed");
            state.aborted(&address, error, now);
            true
        }
        MakerAction::Created(conn) => {
            state.created(conn);
            false
        }
        MakerAction::Terminated { conn, never, error } => {
            state.terminated(&conn, never, error, now);
            true
        }
        MakerAction::Refresh => true,
        MakerAction::Status(reply) => {
            let _ = reply.send(state.status(now));
            false
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Resolves `host` or `host:port`; a missing port is returned as 0.
async fn resolve(peer: &str) -> Result<SocketAddr, MeshError> {
    if let Ok(addr) = peer.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = peer.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, 0));
    }
    let (host, port) = match peer.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| MeshError::Config(format!("invalid port in peer address '{peer}'")))?;
            (host, port)
        }
        None => (peer, 0),
    };
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| MeshError::Connection(format!("cannot resolve '{peer}': {e}")))?
        .collect();
    let addr = addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| MeshError::Connection(format!("no addresses for '{peer}'")))?;
    info!(peer, addr = %addr, "resolved peer address");
    Ok(addr)
}
