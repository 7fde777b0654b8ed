//! Epidemic gossip over named channels.
//!
//! Each channel carries three kinds of message: unicast (relayed along the
//! unicast route and consumed at the destination), broadcast (relayed along
//! the broadcast tree of its source and merged everywhere) and full-state
//! gossip (merged locally, with anything new passed on to a few random
//! neighbours).
//!
//! ## Architecture
//!
//! - [`Gossiper`]: implemented by anything whose state is gossiped
//! - [`GossipData`]: mergeable unit of that state
//! - [`GossipChannel`]: one named channel bound to a gossiper
//! - [`GossipChannels`]: the channel registry; routes inbound messages
//! - [`GossipSender`]: per-destination coalescing sender task
//! - [`ProtocolSender`] and [`ConnectionSet`]: what gossip needs from connections

mod channel;
mod sender;
mod surrogate;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::info;

use crate::error::MeshError;
use crate::peer::PeerName;
use crate::protocol::{ProtocolMsg, ProtocolTag};
use crate::routes::RouteTable;
use crate::wire::GossipEnvelope;

pub use channel::GossipChannel;
pub use sender::GossipSender;
pub use surrogate::{SurrogateData, SurrogateGossiper};

/// Interval between periodic full-state gossip rounds.
pub const GOSSIP_INTERVAL: Duration = Duration::from_secs(30);

/// Boxed future type for async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A mergeable unit of gossiped state.
///
/// Merging must be commutative and idempotent: merging the same value twice,
/// or two values in either order, ends in the same state.
pub trait GossipData: Clone + Send + Sync + 'static {
    /// Serializes the value into one or more independently sendable payloads.
    fn encode(&self) -> Vec<Vec<u8>>;

    /// Absorbs `other` into `self`.
    fn merge(&mut self, other: Self);
}

/// A participant in gossip on one channel.
pub trait Gossiper: Send + Sync + 'static {
    /// The mergeable state type exchanged on the channel.
    type Data: GossipData;

    /// Consumes a unicast message addressed to us.
    fn on_gossip_unicast(&self, sender: PeerName, msg: &[u8]) -> Result<(), MeshError>;

    /// Merges a broadcast and returns what should be relayed on, if anything.
    fn on_gossip_broadcast(
        &self,
        source: PeerName,
        update: &[u8],
    ) -> Result<Option<Self::Data>, MeshError>;

    /// Returns everything we know, for periodic gossip.
    fn gossip(&self) -> Option<Self::Data>;

    /// Merges full-state gossip and returns whatever was new to us.
    fn on_gossip(&self, update: &[u8]) -> Result<Option<Self::Data>, MeshError>;
}

/// Transport for protocol messages to one directly connected peer.
pub trait ProtocolSender: Send + Sync {
    /// Process-unique id of the underlying connection.
    fn id(&self) -> u64;

    /// Name of the peer at the other end.
    fn remote_name(&self) -> PeerName;

    /// Queues a message, waiting for space.
    fn send_protocol_msg(&self, msg: ProtocolMsg) -> BoxFuture<'_, Result<(), MeshError>>;

    /// Queues a message if there is space right now.
    fn try_send_protocol_msg(&self, msg: ProtocolMsg) -> Result<(), MeshError>;
}

/// Lookup of live connections by remote peer name.
pub trait ConnectionSet: Send + Sync {
    /// Returns the connection to `name`, if one is registered.
    fn connection_to(&self, name: &PeerName) -> Option<Arc<dyn ProtocolSender>>;

    /// Returns the connections to those of `names` we are connected to.
    fn connections_to(&self, names: &[PeerName]) -> Vec<Arc<dyn ProtocolSender>> {
        names.iter().filter_map(|n| self.connection_to(n)).collect()
    }

    /// Returns every registered connection.
    fn connections(&self) -> Vec<Arc<dyn ProtocolSender>>;
}

/// Type-erased view of a channel, for the registry.
pub(crate) trait ChannelHandler: Send + Sync {
    /// Handles an inbound envelope received under `tag`.
    fn deliver(
        &self,
        tag: ProtocolTag,
        envelope: GossipEnvelope,
    ) -> BoxFuture<'_, Result<(), MeshError>>;

    /// Gossips our full state to random neighbours.
    fn send_all(&self) -> BoxFuture<'_, ()>;

    /// Gossips our full state to one connection.
    fn send_all_down(&self, conn: Arc<dyn ProtocolSender>);
}

/// Encodes a gossip envelope as a protocol message.
pub(crate) fn envelope_msg(
    tag: ProtocolTag,
    channel: &str,
    sender: PeerName,
    destination: Option<PeerName>,
    payload: Vec<u8>,
) -> ProtocolMsg {
    use prost::Message;

    let envelope = GossipEnvelope {
        channel: channel.to_string(),
        sender: sender.as_bytes().to_vec(),
        destination: destination.map(|d| d.as_bytes().to_vec()).unwrap_or_default(),
        payload,
    };
    ProtocolMsg::new(tag, envelope.encode_to_vec())
}

/// Registry of gossip channels.
pub struct GossipChannels {
    ourself: PeerName,
    routes: Arc<RouteTable>,
    connections: Arc<dyn ConnectionSet>,
    channels: RwLock<HashMap<String, Arc<dyn ChannelHandler>>>,
}

impl GossipChannels {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(
        ourself: PeerName,
        routes: Arc<RouteTable>,
        connections: Arc<dyn ConnectionSet>,
    ) -> Self {
        Self {
            ourself,
            routes,
            connections,
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a channel served by `gossiper`.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Gossip`] if the name is already taken.
    pub fn new_channel<G: Gossiper>(
        &self,
        name: &str,
        gossiper: Arc<G>,
    ) -> Result<Arc<GossipChannel<G>>, MeshError> {
        let mut channels = self.channels.write();
        if channels.contains_key(name) {
            return Err(MeshError::Gossip(format!("duplicate channel {name}")));
        }
        let channel = Arc::new(self.make_channel(name, gossiper));
        channels.insert(name.to_string(), Arc::clone(&channel) as Arc<dyn ChannelHandler>);
        Ok(channel)
    }

    fn make_channel<G: Gossiper>(&self, name: &str, gossiper: Arc<G>) -> GossipChannel<G> {
        GossipChannel::new(
            name,
            self.ourself,
            Arc::clone(&self.routes),
            Arc::clone(&self.connections),
            gossiper,
        )
    }

    fn channel(&self, name: &str) -> Arc<dyn ChannelHandler> {
        if let Some(channel) = self.channels.read().get(name) {
            return Arc::clone(channel);
        }
        let mut channels = self.channels.write();
        Arc::clone(channels.entry(name.to_string()).or_insert_with(|| {
            info!(channel = name, "created surrogate channel");
            Arc::new(self.make_channel(name, Arc::new(SurrogateGossiper))) as Arc<dyn ChannelHandler>
        }))
    }

    /// Returns the names of all registered channels.
    #[must_use]
    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn all(&self) -> Vec<Arc<dyn ChannelHandler>> {
        self.channels.read().values().cloned().collect()
    }

    /// Dispatches an inbound gossip message to its channel.
    pub async fn handle(&self, tag: ProtocolTag, payload: &[u8]) -> Result<(), MeshError> {
        let envelope = GossipEnvelope::decode_bytes(payload)?;
        let channel = self.channel(&envelope.channel);
        channel.deliver(tag, envelope).await
    }

    /// Runs one round of full-state gossip on every channel.
    pub async fn send_all_gossip(&self) {
        for channel in self.all() {
            channel.send_all().await;
        }
    }

    /// Sends our full state on every channel to a single connection.
    pub fn send_all_gossip_down(&self, conn: &Arc<dyn ProtocolSender>) {
        for channel in self.all() {
            channel.send_all_down(Arc::clone(conn));
        }
    }
}

impl std::fmt::Debug for GossipChannels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GossipChannels")
            .field("ourself", &self.ourself)
            .field("channels", &self.channel_names())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests;
