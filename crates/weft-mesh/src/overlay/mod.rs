//! The data plane carried alongside each control connection.
//!
//! An [`Overlay`] is consulted while a connection is being set up: it adds
//! its own handshake features, then prepares an [`OverlayConnection`] that
//! reports [`OverlayEvent`]s back to the connection. The connection counts
//! as established once its overlay says so.
//!
//! - [`Sleeve`]: UDP encapsulation with PMTU discovery
//! - [`NullOverlay`]: no data plane; connections establish immediately

mod fragment;
mod frame;
mod pmtu;
mod sleeve;
mod sockopt;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use weft_crypto::SessionKey;

use crate::error::MeshError;
use crate::gossip::ProtocolSender;
use crate::peer::PeerName;
use crate::protocol::Features;

pub use fragment::{fragment, frame_too_big, icmp_frag_needed, Ipv4Frame};
pub use frame::{
    ControlMsg, FrameBuffer, PacketEncoder, SpecialFrame, ETHERNET_OVERHEAD, FRAG_TEST_SIZE,
    FRAME_OVERHEAD, MAX_UDP_PACKET_SIZE, PMTU_DISCOVERY_SIZE, UDP_OVERHEAD,
};
pub use pmtu::{PmtuAction, PmtuDiscovery, DEFAULT_PMTU, PMTU_VERIFY_ATTEMPTS, PMTU_VERIFY_TIMEOUT};
pub use sleeve::{
    DatagramSender, SendError, Sleeve, UdpSender, FAST_HEARTBEAT, FEATURE_UDP_PORT,
    FRAG_TEST_INTERVAL, HEARTBEAT_TIMEOUT, SLOW_HEARTBEAT,
};

/// Receives frames that arrive over the overlay.
pub trait FrameConsumer: Send + Sync {
    /// Handles a frame travelling from `src` to `dst`.
    fn consume(&self, src: PeerName, dst: PeerName, frame: &[u8]);
}

/// Discards every frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardFrames;

impl FrameConsumer for DiscardFrames {
    fn consume(&self, _src: PeerName, _dst: PeerName, _frame: &[u8]) {}
}

/// What an overlay needs to set up one connection.
#[derive(Clone)]
pub struct OverlayConnectionParams {
    /// Peer at the other end.
    pub remote_peer: PeerName,
    /// Remote TCP address.
    pub remote_addr: SocketAddr,
    /// Whether we dialled.
    pub outbound: bool,
    /// Connection id both ends agree on.
    pub conn_uid: u64,
    /// Key for overlay encryption; `None` for an unencrypted overlay.
    pub session_key: Option<SessionKey>,
    /// The control connection, for overlay control messages.
    pub control: Arc<dyn ProtocolSender>,
    /// Features the remote announced.
    pub features: Features,
}

impl std::fmt::Debug for OverlayConnectionParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayConnectionParams")
            .field("remote_peer", &self.remote_peer)
            .field("remote_addr", &self.remote_addr)
            .field("outbound", &self.outbound)
            .field("encrypted", &self.session_key.is_some())
            .finish_non_exhaustive()
    }
}

/// Reported by an overlay connection.
#[derive(Debug)]
pub enum OverlayEvent {
    /// The data plane works in both directions.
    Established,
    /// The data plane failed; the connection should close.
    Error(MeshError),
}

/// A data plane implementation.
pub trait Overlay: Send + Sync {
    /// Adds the overlay's handshake features.
    fn add_features_to(&self, features: &mut Features);

    /// Prepares the overlay side of a connection. Nothing is sent until
    /// [`OverlayConnection::confirm`].
    fn prepare_connection(
        &self,
        params: OverlayConnectionParams,
        events: mpsc::Sender<OverlayEvent>,
    ) -> Result<Arc<dyn OverlayConnection>, MeshError>;

    /// Overlay state, for status reports.
    fn diagnostics(&self) -> serde_json::Value;
}

/// The overlay side of one connection.
pub trait OverlayConnection: Send + Sync {
    /// The connection has been registered; start talking to the remote.
    fn confirm(&self);

    /// Handles an overlay control message from the remote.
    fn control_message(&self, msg: &[u8]);

    /// Tears the overlay side down.
    fn stop(&self);

    /// Short name for logs.
    fn display_name(&self) -> &'static str;
}

/// Overlay without a data plane.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullOverlay;

impl Overlay for NullOverlay {
    fn add_features_to(&self, _features: &mut Features) {}

    fn prepare_connection(
        &self,
        _params: OverlayConnectionParams,
        events: mpsc::Sender<OverlayEvent>,
    ) -> Result<Arc<dyn OverlayConnection>, MeshError> {
        Ok(Arc::new(NullConnection { events }))
    }

    fn diagnostics(&self) -> serde_json::Value {
        serde_json::json!({ "overlay": "none" })
    }
}

struct NullConnection {
    events: mpsc::Sender<OverlayEvent>,
}

impl OverlayConnection for NullConnection {
    fn confirm(&self) {
        let _ = self.events.try_send(OverlayEvent::Established);
    }

    fn control_message(&self, _msg: &[u8]) {}

    fn stop(&self) {}

    fn display_name(&self) -> &'static str {
        "none"
    }
}
