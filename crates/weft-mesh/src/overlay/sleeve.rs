//! UDP encapsulation overlay.
//!
//! One UDP socket serves every remote peer. Each connection gets a
//! forwarder task that batches frames into datagrams, sends heartbeats,
//! tests whether the path fragments, and runs PMTU discovery. Frames on
//! the don't-fragment path that exceed the effective PMTU are either
//! fragmented here or bounced back to the sender as ICMP "fragmentation
//! needed".

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use weft_crypto::{DatagramOpener, DatagramSealer};

use super::fragment::{fragment, frame_too_big, icmp_frag_needed, Ipv4Frame};
use super::frame::{
    all_zeros, iterate_frames, open_body, split_sender, ControlMsg, FrameBuffer, PacketEncoder,
    SpecialFrame, ETHERNET_OVERHEAD, MAX_UDP_PACKET_SIZE, PMTU_DISCOVERY_SIZE, UDP_OVERHEAD,
};
use super::pmtu::{PmtuAction, PmtuDiscovery};
use super::sockopt;
use super::{
    FrameConsumer, Overlay, OverlayConnection, OverlayConnectionParams, OverlayEvent,
};
use crate::error::MeshError;
use crate::gossip::ProtocolSender;
use crate::peer::PeerName;
use crate::peers::PeerGraph;
use crate::protocol::{Features, ProtocolMsg, ProtocolTag};

/// Feature announcing the port our sleeve socket listens on.
pub const FEATURE_UDP_PORT: &str = "UDPPort";

/// Heartbeat interval until the remote has acknowledged one.
pub const FAST_HEARTBEAT: Duration = Duration::from_millis(500);

/// Heartbeat interval once the path is known to work.
pub const SLOW_HEARTBEAT: Duration = Duration::from_secs(10);

/// Silence after which the forwarder gives up.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);

/// How often the fragmentation test is repeated.
pub const FRAG_TEST_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Most frames batched into one datagram.
const MAX_AGGREGATE: usize = 100;

const CHANNEL_SIZE: usize = 16;

/// Reason a datagram could not be sent.
#[derive(Debug)]
pub enum SendError {
    /// The datagram exceeds the path MTU, which is `pmtu` at the IP level.
    MessageTooBig {
        /// Path MTU reported for the destination.
        pmtu: usize,
    },
    /// Any other failure.
    Io(io::Error),
}

/// Sends datagrams on the underlay.
pub trait DatagramSender: Send + Sync {
    /// Sends `datagram` to `addr`. `df` selects the don't-fragment path.
    fn send_to(&self, datagram: &[u8], addr: SocketAddr, df: bool) -> Result<(), SendError>;
}

/// Sends on the sleeve's own socket.
///
/// The socket is switched between don't-fragment and fragmenting mode
/// per datagram. The mode and the send that depends on it happen under
/// one lock.
#[derive(Debug)]
pub struct UdpSender {
    socket: Arc<UdpSocket>,
    ipv6: bool,
    df_mode: Mutex<Option<bool>>,
}

impl UdpSender {
    /// Wraps a bound socket.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the socket address cannot be read.
    pub fn new(socket: Arc<UdpSocket>) -> io::Result<Self> {
        let ipv6 = socket.local_addr()?.is_ipv6();
        Ok(Self {
            socket,
            ipv6,
            df_mode: Mutex::new(None),
        })
    }
}

impl DatagramSender for UdpSender {
    fn send_to(&self, datagram: &[u8], addr: SocketAddr, df: bool) -> Result<(), SendError> {
        let mut mode = self.df_mode.lock();
        if *mode != Some(df) {
            sockopt::set_dont_fragment(&*self.socket, self.ipv6, df).map_err(SendError::Io)?;
            *mode = Some(df);
        }
        match self.socket.try_send_to(datagram, addr) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                debug!(%addr, len = datagram.len(), "UDP send buffer full, dropping datagram");
                Ok(())
            }
            Err(err) if sockopt::is_message_too_big(&err) => {
                let pmtu = sockopt::path_mtu(addr).map_err(SendError::Io)?;
                debug!(%addr, len = datagram.len(), pmtu, "EMSGSIZE on send, expecting PMTU update");
                Err(SendError::MessageTooBig { pmtu })
            }
            Err(err) => Err(SendError::Io(err)),
        }
    }
}

struct QueuedFrame {
    src: PeerName,
    dst: PeerName,
    frame: Vec<u8>,
}

enum ForwarderInput {
    Confirm,
    Special { from: SocketAddr, frame: SpecialFrame },
    Control(ControlMsg),
}

/// Forwarder state reachable from outside its task.
struct ForwarderShared {
    remote: PeerName,
    uid: u64,
    remote_addr: Mutex<Option<SocketAddr>>,
    effective_pmtu: AtomicUsize,
    stack_frag: AtomicBool,
    frames: mpsc::Sender<QueuedFrame>,
    frames_df: mpsc::Sender<QueuedFrame>,
    inputs: mpsc::Sender<ForwarderInput>,
    opener: Mutex<Option<DatagramOpener>>,
    finished: CancellationToken,
}

impl ForwarderShared {
    fn remote_addr(&self) -> Option<SocketAddr> {
        *self.remote_addr.lock()
    }

    fn input(&self, input: ForwarderInput) {
        if self.inputs.try_send(input).is_err() {
            debug!(peer = %self.remote, "forwarder busy, dropping input");
        }
    }

    async fn queue(&self, df: bool, frame: QueuedFrame) {
        let queue = if df { &self.frames_df } else { &self.frames };
        tokio::select! {
            _ = queue.send(frame) => {}
            () = self.finished.cancelled() => {}
        }
    }
}

type ForwarderMap = RwLock<HashMap<PeerName, Arc<ForwarderShared>>>;

/// The UDP overlay.
pub struct Sleeve {
    local: PeerName,
    port: u16,
    sender: Arc<dyn DatagramSender>,
    peers: Arc<PeerGraph>,
    consumer: Arc<dyn FrameConsumer>,
    forwarders: Arc<ForwarderMap>,
}

impl Sleeve {
    /// Binds the sleeve socket and starts reading from it.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Io`] if the socket cannot be bound.
    pub async fn bind(
        addr: SocketAddr,
        peers: Arc<PeerGraph>,
        consumer: Arc<dyn FrameConsumer>,
        shutdown: CancellationToken,
    ) -> Result<Arc<Self>, MeshError> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let sender = Arc::new(UdpSender::new(Arc::clone(&socket))?);
        Self::with_sender(socket, sender, peers, consumer, shutdown)
    }

    /// Like [`Sleeve::bind`], but sends through `sender`.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Io`] if the socket address cannot be read.
    pub fn with_sender(
        socket: Arc<UdpSocket>,
        sender: Arc<dyn DatagramSender>,
        peers: Arc<PeerGraph>,
        consumer: Arc<dyn FrameConsumer>,
        shutdown: CancellationToken,
    ) -> Result<Arc<Self>, MeshError> {
        let port = socket.local_addr()?.port();
        let sleeve = Arc::new(Self {
            local: peers.ourself_name(),
            port,
            sender,
            peers,
            consumer,
            forwarders: Arc::new(RwLock::new(HashMap::new())),
        });
        tokio::spawn(read_loop(Arc::clone(&sleeve), socket, shutdown));
        info!(port, "sleeve listening");
        Ok(sleeve)
    }

    /// Port of the sleeve socket.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Effective PMTU towards `remote`, if a forwarder exists.
    #[must_use]
    pub fn effective_pmtu(&self, remote: &PeerName) -> Option<usize> {
        self.forwarder(remote)
            .map(|fwd| fwd.effective_pmtu.load(Ordering::Relaxed))
    }

    fn forwarder(&self, remote: &PeerName) -> Option<Arc<ForwarderShared>> {
        self.forwarders.read().get(remote).cloned()
    }

    /// Sends a frame from `src` to `dst` via the neighbour `via`.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Connection`] if there is no forwarder to `via`,
    /// or [`MeshError::Protocol`] if the frame cannot be fragmented.
    pub async fn forward(
        &self,
        via: PeerName,
        src: PeerName,
        dst: PeerName,
        frame: &[u8],
        broadcast: bool,
    ) -> Result<(), MeshError> {
        let fwd = self
            .forwarder(&via)
            .ok_or_else(|| MeshError::Connection(format!("no forwarder to {via}")))?;
        let pmtu = fwd.effective_pmtu.load(Ordering::Relaxed);
        let queued = |frame: &[u8]| QueuedFrame {
            src,
            dst,
            frame: frame.to_vec(),
        };

        let Some(packet) = Ipv4Frame::parse(frame) else {
            fwd.queue(false, queued(frame)).await;
            return Ok(());
        };

        if packet.dont_fragment() {
            if !frame_too_big(frame.len(), pmtu) {
                fwd.queue(true, queued(frame)).await;
            } else if broadcast {
                debug!(%via, len = frame.len(), pmtu, "dropping oversized broadcast frame");
            } else {
                let icmp = icmp_frag_needed(&packet, pmtu);
                self.consumer.consume(dst, src, &icmp);
            }
            return Ok(());
        }

        if fwd.stack_frag.load(Ordering::Relaxed) {
            fwd.queue(false, queued(frame)).await;
        } else if !frame_too_big(frame.len(), pmtu) {
            fwd.queue(true, queued(frame)).await;
        } else {
            for piece in fragment(&packet, pmtu)? {
                fwd.queue(true, queued(&piece)).await;
            }
        }
        Ok(())
    }

    fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) {
        let Some((sender, body)) = split_sender(datagram) else {
            debug!(%from, len = datagram.len(), "ignoring short UDP packet");
            return;
        };
        let Some(fwd) = self.forwarder(&sender) else {
            return;
        };
        let plain = match open_body(fwd.opener.lock().as_mut(), body) {
            Ok(plain) => plain,
            Err(err) => {
                debug!(%from, peer = %sender, error = %err, "dropping undecryptable packet");
                return;
            }
        };
        let table = self.peers.snapshot();
        let result = iterate_frames(&plain, |src, dst, frame| {
            if !table.contains(&src) || !table.contains(&dst) || frame.len() < ETHERNET_OVERHEAD {
                return;
            }
            if let Some(special) = SpecialFrame::parse(frame) {
                let ours = src == fwd.remote && dst == self.local;
                let genuine = special != SpecialFrame::FragTest || all_zeros(frame);
                if ours && genuine {
                    fwd.input(ForwarderInput::Special {
                        from,
                        frame: special,
                    });
                }
                return;
            }
            self.consumer.consume(src, dst, frame);
        });
        if let Err(err) = result {
            debug!(%from, error = %err, "malformed UDP packet");
        }
    }
}

impl std::fmt::Debug for Sleeve {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sleeve")
            .field("local", &self.local)
            .field("port", &self.port)
            .field("forwarders", &self.forwarders.read().len())
            .finish_non_exhaustive()
    }
}

async fn read_loop(sleeve: Arc<Sleeve>, socket: Arc<UdpSocket>, shutdown: CancellationToken) {
    let mut buf = vec![0u8; MAX_UDP_PACKET_SIZE];
    loop {
        let (len, from) = tokio::select! {
            () = shutdown.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(err) => {
                    debug!(error = %err, "UDP receive failed");
                    continue;
                }
            },
        };
        sleeve.handle_datagram(&buf[..len], from);
    }
    let forwarders: Vec<_> = sleeve.forwarders.write().drain().map(|(_, fwd)| fwd).collect();
    for fwd in forwarders {
        fwd.finished.cancel();
    }
    debug!("sleeve stopped");
}

impl Overlay for Sleeve {
    fn add_features_to(&self, features: &mut Features) {
        features.insert(FEATURE_UDP_PORT.to_string(), self.port.to_string());
    }

    fn prepare_connection(
        &self,
        params: OverlayConnectionParams,
        events: mpsc::Sender<OverlayEvent>,
    ) -> Result<Arc<dyn OverlayConnection>, MeshError> {
        let remote_addr = if params.outbound {
            let port = match params.features.get(FEATURE_UDP_PORT) {
                Some(port) => port
                    .parse()
                    .map_err(|_| MeshError::Handshake(format!("invalid UDP port '{port}'")))?,
                None => params.remote_addr.port(),
            };
            Some(SocketAddr::new(params.remote_addr.ip(), port))
        } else {
            None
        };

        let sealer = params
            .session_key
            .as_ref()
            .map(|key| DatagramSealer::new(key, params.outbound));
        let opener = params
            .session_key
            .as_ref()
            .map(|key| DatagramOpener::new(key, params.outbound));
        let encoder = PacketEncoder::new(self.local, sealer);
        let pmtu = PmtuDiscovery::new(encoder.packet_overhead());

        let (frames_tx, frames_rx) = mpsc::channel(CHANNEL_SIZE);
        let (frames_df_tx, frames_df_rx) = mpsc::channel(CHANNEL_SIZE);
        let (inputs_tx, inputs_rx) = mpsc::channel(CHANNEL_SIZE);
        let shared = Arc::new(ForwarderShared {
            remote: params.remote_peer,
            uid: params.conn_uid,
            remote_addr: Mutex::new(remote_addr),
            effective_pmtu: AtomicUsize::new(pmtu.effective_pmtu()),
            stack_frag: AtomicBool::new(false),
            frames: frames_tx,
            frames_df: frames_df_tx,
            inputs: inputs_tx,
            opener: Mutex::new(opener),
            finished: CancellationToken::new(),
        });

        let forwarder = Forwarder {
            shared: Arc::clone(&shared),
            sender: Arc::clone(&self.sender),
            encoder,
            pmtu,
            control: params.control,
            events,
            buffer: FrameBuffer::default(),
            heartbeat_interval: None,
            next_heartbeat: None,
            heartbeat_deadline: None,
            next_frag_test: None,
            probe_deadline: None,
            acked_heartbeat: false,
        };
        tokio::spawn(forwarder.run(frames_rx, frames_df_rx, inputs_rx));

        Ok(Arc::new(SleeveConnection {
            shared,
            forwarders: Arc::clone(&self.forwarders),
        }))
    }

    fn diagnostics(&self) -> serde_json::Value {
        let forwarders: Vec<_> = self
            .forwarders
            .read()
            .values()
            .map(|fwd| {
                serde_json::json!({
                    "peer": fwd.remote.to_string(),
                    "remote_addr": fwd.remote_addr().map(|addr| addr.to_string()),
                    "effective_pmtu": fwd.effective_pmtu.load(Ordering::Relaxed),
                    "stack_frag": fwd.stack_frag.load(Ordering::Relaxed),
                })
            })
            .collect();
        serde_json::json!({
            "overlay": "sleeve",
            "port": self.port,
            "forwarders": forwarders,
        })
    }
}

struct SleeveConnection {
    shared: Arc<ForwarderShared>,
    forwarders: Arc<ForwarderMap>,
}

impl OverlayConnection for SleeveConnection {
    // unconfirmed forwarders stay out of the map so a duplicate that loses
    // the tie-break never displaces a live one
    fn confirm(&self) {
        let previous = self
            .forwarders
            .write()
            .insert(self.shared.remote, Arc::clone(&self.shared));
        if let Some(previous) = previous {
            if !Arc::ptr_eq(&previous, &self.shared) {
                previous.finished.cancel();
            }
        }
        self.shared.input(ForwarderInput::Confirm);
    }

    fn control_message(&self, msg: &[u8]) {
        match ControlMsg::decode(msg) {
            Ok(msg) => self.shared.input(ForwarderInput::Control(msg)),
            Err(err) => warn!(peer = %self.shared.remote, error = %err, "bad overlay control message"),
        }
    }

    fn stop(&self) {
        let mut forwarders = self.forwarders.write();
        if forwarders
            .get(&self.shared.remote)
            .is_some_and(|fwd| Arc::ptr_eq(fwd, &self.shared))
        {
            forwarders.remove(&self.shared.remote);
        }
        drop(forwarders);
        self.shared.finished.cancel();
    }

    fn display_name(&self) -> &'static str {
        "sleeve"
    }
}

/// The task side of a forwarder.
struct Forwarder {
    shared: Arc<ForwarderShared>,
    sender: Arc<dyn DatagramSender>,
    encoder: PacketEncoder,
    pmtu: PmtuDiscovery,
    control: Arc<dyn ProtocolSender>,
    events: mpsc::Sender<OverlayEvent>,
    buffer: FrameBuffer,
    heartbeat_interval: Option<Duration>,
    next_heartbeat: Option<Instant>,
    heartbeat_deadline: Option<Instant>,
    next_frag_test: Option<Instant>,
    probe_deadline: Option<Instant>,
    acked_heartbeat: bool,
}

impl Forwarder {
    async fn run(
        mut self,
        mut frames: mpsc::Receiver<QueuedFrame>,
        mut frames_df: mpsc::Receiver<QueuedFrame>,
        mut inputs: mpsc::Receiver<ForwarderInput>,
    ) {
        let finished = self.shared.finished.clone();
        let result = loop {
            let step = tokio::select! {
                () = finished.cancelled() => break Ok(()),
                Some(frame) = frames.recv() => self.aggregate_and_send(frame, &mut frames, false),
                Some(frame) = frames_df.recv() => self.aggregate_and_send(frame, &mut frames_df, true),
                Some(input) = inputs.recv() => self.handle_input(input),
                () = sleep_until(self.next_heartbeat) => self.send_heartbeat(),
                () = sleep_until(self.heartbeat_deadline) => Err(MeshError::HeartbeatTimeout("UDP")),
                () = sleep_until(self.next_frag_test) => {
                    self.next_frag_test = Some(Instant::now() + FRAG_TEST_INTERVAL);
                    self.send_frag_test()
                }
                () = sleep_until(self.probe_deadline) => {
                    self.probe_deadline = None;
                    let action = self.pmtu.on_probe_timeout();
                    self.apply_pmtu(action)
                }
            };
            if let Err(err) = step {
                break Err(err);
            }
        };
        if let Err(err) = result {
            warn!(peer = %self.shared.remote, error = %err, "forwarder failed");
            let _ = self.events.try_send(OverlayEvent::Error(err));
        }
        debug!(peer = %self.shared.remote, "forwarder stopped");
    }

    fn handle_input(&mut self, input: ForwarderInput) -> Result<(), MeshError> {
        match input {
            ForwarderInput::Confirm => self.confirm(),
            ForwarderInput::Special { from, frame } => match frame {
                SpecialFrame::Heartbeat(uid) => self.handle_heartbeat(from, uid),
                SpecialFrame::FragTest => self.send_control(ControlMsg::FragTestAck),
                SpecialFrame::PmtuProbe(epmtu) => {
                    let epmtu = u16::try_from(epmtu).unwrap_or(u16::MAX);
                    self.send_control(ControlMsg::PmtuTestAck(epmtu))
                }
            },
            ForwarderInput::Control(ControlMsg::HeartbeatAck) => self.handle_heartbeat_ack(),
            ForwarderInput::Control(ControlMsg::FragTestAck) => {
                debug!(peer = %self.shared.remote, "path fragments, using non-DF path");
                self.shared.stack_frag.store(true, Ordering::Relaxed);
                Ok(())
            }
            ForwarderInput::Control(ControlMsg::PmtuTestAck(epmtu)) => {
                let action = self.pmtu.on_probe_ack(usize::from(epmtu));
                self.apply_pmtu(action)
            }
        }
    }

    fn confirm(&mut self) -> Result<(), MeshError> {
        if self.heartbeat_interval.is_some() {
            return Ok(());
        }
        self.heartbeat_interval = Some(FAST_HEARTBEAT);
        self.heartbeat_deadline = Some(Instant::now() + HEARTBEAT_TIMEOUT);
        if self.shared.remote_addr().is_some() {
            self.send_heartbeat()?;
        }
        Ok(())
    }

    fn handle_heartbeat(&mut self, from: SocketAddr, uid: u64) -> Result<(), MeshError> {
        if uid != self.shared.uid {
            return Ok(());
        }
        let previous = self.shared.remote_addr.lock().replace(from);
        match previous {
            None => {
                debug!(peer = %self.shared.remote, %from, "learned UDP address");
                if self.heartbeat_interval.is_some() {
                    self.send_heartbeat()?;
                }
            }
            Some(addr) if addr != from => {
                info!(peer = %self.shared.remote, old = %addr, new = %from, "peer UDP address changed");
            }
            Some(_) => {}
        }
        if !self.acked_heartbeat {
            self.acked_heartbeat = true;
            self.send_control(ControlMsg::HeartbeatAck)?;
        }
        if self.heartbeat_deadline.is_some() {
            self.heartbeat_deadline = Some(Instant::now() + HEARTBEAT_TIMEOUT);
        }
        Ok(())
    }

    fn handle_heartbeat_ack(&mut self) -> Result<(), MeshError> {
        let _ = self.events.try_send(OverlayEvent::Established);
        if self.heartbeat_interval != Some(SLOW_HEARTBEAT) {
            self.heartbeat_interval = Some(SLOW_HEARTBEAT);
            if self.next_heartbeat.is_some() {
                self.next_heartbeat = Some(Instant::now() + SLOW_HEARTBEAT);
            }
        }
        self.next_frag_test = Some(Instant::now() + FRAG_TEST_INTERVAL);
        self.send_frag_test()?;
        self.send_frame(&vec![0u8; PMTU_DISCOVERY_SIZE], true)
    }

    fn send_heartbeat(&mut self) -> Result<(), MeshError> {
        self.next_heartbeat = self.heartbeat_interval.map(|i| Instant::now() + i);
        self.send_frame(&SpecialFrame::Heartbeat(self.shared.uid).build(), true)
    }

    fn send_frag_test(&mut self) -> Result<(), MeshError> {
        self.shared.stack_frag.store(false, Ordering::Relaxed);
        self.send_frame(&SpecialFrame::FragTest.build(), false)
    }

    fn send_control(&self, msg: ControlMsg) -> Result<(), MeshError> {
        let msg = ProtocolMsg::new(ProtocolTag::OverlayControl, msg.encode());
        match self.control.try_send_protocol_msg(msg) {
            Ok(()) => Ok(()),
            Err(MeshError::Shutdown(what)) => Err(MeshError::Shutdown(what)),
            Err(err) => {
                warn!(peer = %self.shared.remote, error = %err, "dropping overlay control message");
                Ok(())
            }
        }
    }

    fn apply_pmtu(&mut self, action: PmtuAction) -> Result<(), MeshError> {
        self.shared
            .effective_pmtu
            .store(self.pmtu.effective_pmtu(), Ordering::Relaxed);
        match action {
            PmtuAction::SendProbe { epmtu, timeout } => {
                self.probe_deadline = Some(Instant::now() + timeout);
                self.send_frame(&SpecialFrame::PmtuProbe(epmtu).build(), true)
            }
            PmtuAction::Verified(epmtu) => {
                info!(peer = %self.shared.remote, epmtu, "effective PMTU verified");
                self.probe_deadline = None;
                Ok(())
            }
            PmtuAction::None => Ok(()),
        }
    }

    /// Sends one forwarder-generated frame on its own.
    fn send_frame(&mut self, frame: &[u8], df: bool) -> Result<(), MeshError> {
        let Some(addr) = self.shared.remote_addr() else {
            return Ok(());
        };
        let packet = self.encoder.encode_special(self.shared.remote, frame, df)?;
        self.send(&packet, addr, df)
    }

    fn aggregate_and_send(
        &mut self,
        first: QueuedFrame,
        queue: &mut mpsc::Receiver<QueuedFrame>,
        df: bool,
    ) -> Result<(), MeshError> {
        let limit = if df {
            self.pmtu.max_payload()
        } else {
            MAX_UDP_PACKET_SIZE - UDP_OVERHEAD
        };
        let mut next = Some(first);
        let mut taken = 0;
        while let Some(frame) = next.take() {
            if self.encoder.fits(&self.buffer, &frame.frame, limit) {
                self.buffer.append(frame.src, frame.dst, &frame.frame);
            } else if self.buffer.is_empty() {
                warn!(peer = %self.shared.remote, len = frame.frame.len(), "dropping frame too big to send");
            } else {
                self.flush(df)?;
                next = Some(frame);
                continue;
            }
            taken += 1;
            if taken < MAX_AGGREGATE {
                next = queue.try_recv().ok();
            }
        }
        self.flush(df)
    }

    fn flush(&mut self, df: bool) -> Result<(), MeshError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let Some(addr) = self.shared.remote_addr() else {
            self.buffer.take();
            return Ok(());
        };
        let packet = self.encoder.encode(&mut self.buffer, df)?;
        self.send(&packet, addr, df)
    }

    fn send(&mut self, packet: &[u8], addr: SocketAddr, df: bool) -> Result<(), MeshError> {
        match self.sender.send_to(packet, addr, df) {
            Ok(()) => Ok(()),
            Err(SendError::MessageTooBig { pmtu }) => {
                let action = self.pmtu.on_message_too_big(pmtu);
                self.apply_pmtu(action)
            }
            Err(SendError::Io(err)) => Err(err.into()),
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[path = "sleeve_tests.rs"]
mod tests;
