//! A single named gossip channel.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::sender::SendFn;
use super::{
    envelope_msg, BoxFuture, ChannelHandler, ConnectionSet, GossipData, GossipSender, Gossiper,
    ProtocolSender,
};
use crate::error::MeshError;
use crate::peer::PeerName;
use crate::protocol::{ProtocolMsg, ProtocolTag};
use crate::routes::RouteTable;
use crate::wire::GossipEnvelope;

/// A named channel binding a [`Gossiper`] to the mesh.
pub struct GossipChannel<G: Gossiper> {
    name: String,
    ourself: PeerName,
    routes: Arc<RouteTable>,
    connections: Arc<dyn ConnectionSet>,
    gossiper: Arc<G>,
    senders: Mutex<HashMap<u64, GossipSender<G::Data>>>,
    broadcasters: Mutex<HashMap<PeerName, GossipSender<G::Data>>>,
}

impl<G: Gossiper> GossipChannel<G> {
    pub(crate) fn new(
        name: &str,
        ourself: PeerName,
        routes: Arc<RouteTable>,
        connections: Arc<dyn ConnectionSet>,
        gossiper: Arc<G>,
    ) -> Self {
        Self {
            name: name.to_string(),
            ourself,
            routes,
            connections,
            gossiper,
            senders: Mutex::new(HashMap::new()),
            broadcasters: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the channel name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the gossiper serving this channel.
    #[must_use]
    pub fn gossiper(&self) -> &Arc<G> {
        &self.gossiper
    }

    /// Sends `msg` to `destination` along the unicast route.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Gossip`] if there is no route or no connection
    /// to the next hop.
    pub fn gossip_unicast(&self, destination: PeerName, msg: &[u8]) -> Result<(), MeshError> {
        self.relay_unicast(
            destination,
            envelope_msg(
                ProtocolTag::GossipUnicast,
                &self.name,
                self.ourself,
                Some(destination),
                msg.to_vec(),
            ),
        )
    }

    /// Broadcasts `update` from ourselves along the broadcast tree.
    pub fn gossip_broadcast(&self, update: G::Data) {
        self.relay_broadcast(self.ourself, update);
    }

    /// Gossips `data` to random neighbours.
    pub async fn send(&self, data: G::Data) {
        self.relay(self.ourself, data).await;
    }

    /// Gossips `data` to one connection.
    pub fn send_down(&self, conn: Arc<dyn ProtocolSender>, data: G::Data) {
        self.send_down_all(vec![conn], data);
    }

    fn relay_unicast(&self, destination: PeerName, msg: ProtocolMsg) -> Result<(), MeshError> {
        let hop = self.routes.unicast_all(&destination).ok_or_else(|| {
            MeshError::Gossip(format!("unknown relay destination {destination}"))
        })?;
        let conn = self.connections.connection_to(&hop).ok_or_else(|| {
            MeshError::Gossip(format!("no connection to relay peer {hop}"))
        })?;
        conn.try_send_protocol_msg(msg)
    }

    fn relay_broadcast(&self, source: PeerName, update: G::Data) {
        let known = self.routes.snapshot();
        let mut broadcasters = self.broadcasters.lock();
        collect_stale(&mut broadcasters, |name| known.is_known(name));
        broadcasters
            .entry(source)
            .or_insert_with(|| GossipSender::spawn(self.broadcast_fn(source)))
            .send(update);
    }

    async fn relay(&self, source: PeerName, data: G::Data) {
        self.routes.ensure_recalculated().await;
        let neighbours = self.routes.random_neighbours(&source);
        self.send_down_all(self.connections.connections_to(&neighbours), data);
    }

    fn send_down_all(&self, conns: Vec<Arc<dyn ProtocolSender>>, data: G::Data) {
        if conns.is_empty() {
            return;
        }
        let live: HashSet<u64> = self.connections.connections().iter().map(|c| c.id()).collect();
        let mut senders = self.senders.lock();
        collect_stale(&mut senders, |id| live.contains(id));
        for conn in conns {
            senders
                .entry(conn.id())
                .or_insert_with(|| GossipSender::spawn(self.connection_fn(conn)))
                .send(data.clone());
        }
    }

    fn connection_fn(&self, conn: Arc<dyn ProtocolSender>) -> SendFn<G::Data> {
        let channel = self.name.clone();
        let ourself = self.ourself;
        Arc::new(move |data: G::Data| {
            let conn = Arc::clone(&conn);
            let msgs: Vec<ProtocolMsg> = data
                .encode()
                .into_iter()
                .map(|payload| envelope_msg(ProtocolTag::Gossip, &channel, ourself, None, payload))
                .collect();
            Box::pin(async move {
                for msg in msgs {
                    conn.send_protocol_msg(msg).await?;
                }
                Ok(())
            })
        })
    }

    fn broadcast_fn(&self, source: PeerName) -> SendFn<G::Data> {
        let channel = self.name.clone();
        let routes = Arc::clone(&self.routes);
        let connections = Arc::clone(&self.connections);
        Arc::new(move |data: G::Data| {
            let routes = Arc::clone(&routes);
            let connections = Arc::clone(&connections);
            let msgs: Vec<ProtocolMsg> = data
                .encode()
                .into_iter()
                .map(|payload| {
                    envelope_msg(ProtocolTag::GossipBroadcast, &channel, source, None, payload)
                })
                .collect();
            Box::pin(async move {
                routes.ensure_recalculated().await;
                let targets = connections.connections_to(&routes.broadcast_all(&source));
                for conn in targets {
                    for msg in &msgs {
                        if conn.send_protocol_msg(msg.clone()).await.is_err() {
                            break;
                        }
                    }
                }
                Ok(())
            })
        })
    }

    async fn deliver_envelope(
        &self,
        tag: ProtocolTag,
        envelope: GossipEnvelope,
    ) -> Result<(), MeshError> {
        let source = envelope.sender_name()?;
        match tag {
            ProtocolTag::GossipUnicast => {
                let destination = envelope.destination_name()?;
                if destination == self.ourself {
                    return self.gossiper.on_gossip_unicast(source, &envelope.payload);
                }
                let msg = envelope_msg(
                    tag,
                    &self.name,
                    source,
                    Some(destination),
                    envelope.payload,
                );
                if let Err(err) = self.relay_unicast(destination, msg) {
                    debug!(channel = %self.name, error = %err, "dropped unicast relay");
                }
            }
            ProtocolTag::GossipBroadcast => {
                if let Some(data) = self.gossiper.on_gossip_broadcast(source, &envelope.payload)? {
                    self.relay_broadcast(source, data);
                }
            }
            ProtocolTag::Gossip => {
                if let Some(data) = self.gossiper.on_gossip(&envelope.payload)? {
                    self.relay(source, data).await;
                }
            }
            other => {
                warn!(channel = %self.name, tag = ?other, "not a gossip message");
            }
        }
        Ok(())
    }
}

impl<G: Gossiper> ChannelHandler for GossipChannel<G> {
    fn deliver(
        &self,
        tag: ProtocolTag,
        envelope: GossipEnvelope,
    ) -> BoxFuture<'_, Result<(), MeshError>> {
        Box::pin(self.deliver_envelope(tag, envelope))
    }

    fn send_all(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Some(data) = self.gossiper.gossip() {
                self.send(data).await;
            }
        })
    }

    fn send_all_down(&self, conn: Arc<dyn ProtocolSender>) {
        if let Some(data) = self.gossiper.gossip() {
            self.send_down(conn, data);
        }
    }
}

impl<G: Gossiper> std::fmt::Debug for GossipChannel<G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GossipChannel")
            .field("name", &self.name)
            .field("senders", &self.senders.lock().len())
            .field("broadcasters", &self.broadcasters.lock().len())
            .finish_non_exhaustive()
    }
}

/// Drops stale senders, stopping at the first live one. Cheap when there
/// is little garbage, quick to clear when there is a lot.
fn collect_stale<K, D>(senders: &mut HashMap<K, GossipSender<D>>, live: impl Fn(&K) -> bool)
where
    K: Copy + Eq + Hash,
    D: GossipData,
{
    let stale: Vec<K> = senders
        .iter()
        .map_while(|(key, sender)| (!live(key) || sender.is_finished()).then_some(*key))
        .collect();
    for key in stale {
        if let Some(sender) = senders.remove(&key) {
            sender.stop();
        }
    }
}
