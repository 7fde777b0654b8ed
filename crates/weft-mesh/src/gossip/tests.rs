//! Tests for the channel registry and message relaying.

use super::*;
use crate::peer::{Edge, Peer};
use crate::peers::PeerGraph;
use crate::wire::{PeerRecord, PeerUpdate};
use parking_lot::Mutex;
use prost::Message;
use std::collections::BTreeSet;

fn name(n: u8) -> PeerName {
    PeerName::from_bytes_array([2, 0, 0, 0, 0, n])
}

fn link(n: u8) -> Edge {
    Edge::new(format!("10.0.0.{n}:6783"), true, true)
}

struct FakeConn {
    id: u64,
    remote: PeerName,
    sent: Mutex<Vec<ProtocolMsg>>,
}

impl FakeConn {
    fn new(id: u64, remote: PeerName) -> Arc<Self> {
        Arc::new(Self {
            id,
            remote,
            sent: Mutex::new(Vec::new()),
        })
    }

    fn sent(&self) -> Vec<ProtocolMsg> {
        self.sent.lock().clone()
    }

    async fn wait_for(&self, count: usize) -> Vec<ProtocolMsg> {
        for _ in 0..200 {
            if self.sent.lock().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.sent()
    }
}

impl ProtocolSender for FakeConn {
    fn id(&self) -> u64 {
        self.id
    }

    fn remote_name(&self) -> PeerName {
        self.remote
    }

    fn send_protocol_msg(&self, msg: ProtocolMsg) -> BoxFuture<'_, Result<(), MeshError>> {
        Box::pin(async move { self.try_send_protocol_msg(msg) })
    }

    fn try_send_protocol_msg(&self, msg: ProtocolMsg) -> Result<(), MeshError> {
        self.sent.lock().push(msg);
        Ok(())
    }
}

#[derive(Default)]
struct FakeConnections {
    conns: Mutex<HashMap<PeerName, Arc<FakeConn>>>,
}

impl FakeConnections {
    fn add(&self, conn: &Arc<FakeConn>) {
        self.conns.lock().insert(conn.remote, Arc::clone(conn));
    }

    fn remove(&self, remote: &PeerName) {
        self.conns.lock().remove(remote);
    }
}

impl ConnectionSet for FakeConnections {
    fn connection_to(&self, name: &PeerName) -> Option<Arc<dyn ProtocolSender>> {
        self.conns
            .lock()
            .get(name)
            .map(|c| Arc::clone(c) as Arc<dyn ProtocolSender>)
    }

    fn connections(&self) -> Vec<Arc<dyn ProtocolSender>> {
        self.conns
            .lock()
            .values()
            .map(|c| Arc::clone(c) as Arc<dyn ProtocolSender>)
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Blobs(BTreeSet<Vec<u8>>);

impl GossipData for Blobs {
    fn encode(&self) -> Vec<Vec<u8>> {
        self.0.iter().cloned().collect()
    }

    fn merge(&mut self, other: Self) {
        self.0.extend(other.0);
    }
}

#[derive(Default)]
struct Recorder {
    unicasts: Mutex<Vec<(PeerName, Vec<u8>)>>,
    state: Mutex<BTreeSet<Vec<u8>>>,
}

impl Recorder {
    fn absorb(&self, update: &[u8]) -> Option<Blobs> {
        self.state
            .lock()
            .insert(update.to_vec())
            .then(|| Blobs([update.to_vec()].into()))
    }
}

impl Gossiper for Recorder {
    type Data = Blobs;

    fn on_gossip_unicast(&self, sender: PeerName, msg: &[u8]) -> Result<(), MeshError> {
        self.unicasts.lock().push((sender, msg.to_vec()));
        Ok(())
    }

    fn on_gossip_broadcast(&self, _source: PeerName, update: &[u8]) -> Result<Option<Blobs>, MeshError> {
        Ok(self.absorb(update))
    }

    fn gossip(&self) -> Option<Blobs> {
        let state = self.state.lock();
        (!state.is_empty()).then(|| Blobs(state.clone()))
    }

    fn on_gossip(&self, update: &[u8]) -> Result<Option<Blobs>, MeshError> {
        Ok(self.absorb(update))
    }
}

/// We are peer 1, connected to 2, which is connected to 3.
struct Fixture {
    channels: GossipChannels,
    connections: Arc<FakeConnections>,
    to_b: Arc<FakeConn>,
}

fn fixture() -> Fixture {
    let peers = Arc::new(PeerGraph::new(Peer::new(name(1), "a", 11, 0)));
    peers.add_local_edge(name(2), link(2));
    let update = PeerUpdate {
        peers: vec![
            PeerRecord::from(
                &Peer::new(name(2), "b", 22, 1)
                    .with_edge(name(1), link(1))
                    .with_edge(name(3), link(3)),
            ),
            PeerRecord::from(&Peer::new(name(3), "c", 33, 1).with_edge(name(2), link(2))),
        ],
    }
    .encode_to_vec();
    peers.apply_update(&update).expect("update");

    let routes = RouteTable::start(peers);
    routes.recalculate_now();

    let connections = Arc::new(FakeConnections::default());
    let to_b = FakeConn::new(1, name(2));
    connections.add(&to_b);
    let channels = GossipChannels::new(
        name(1),
        routes,
        Arc::clone(&connections) as Arc<dyn ConnectionSet>,
    );
    Fixture {
        channels,
        connections,
        to_b,
    }
}

fn envelope(msg: &ProtocolMsg) -> GossipEnvelope {
    GossipEnvelope::decode_bytes(&msg.payload).expect("envelope")
}

// ========== Registry Tests ==========

#[tokio::test]
async fn duplicate_channel_is_rejected() {
    let f = fixture();
    f.channels
        .new_channel("test", Arc::new(Recorder::default()))
        .expect("first");
    let err = f
        .channels
        .new_channel("test", Arc::new(Recorder::default()))
        .expect_err("duplicate");
    assert!(matches!(err, MeshError::Gossip(_)));
}

#[tokio::test]
async fn unknown_channel_gets_a_surrogate() {
    let f = fixture();
    let msg = envelope_msg(
        ProtocolTag::GossipBroadcast,
        "elsewhere",
        name(2),
        None,
        b"update".to_vec(),
    );
    f.channels
        .handle(msg.tag, &msg.payload)
        .await
        .expect("handled");
    assert_eq!(f.channels.channel_names(), vec!["elsewhere".to_string()]);
}

#[tokio::test]
async fn garbage_envelope_is_a_decode_error() {
    let f = fixture();
    let err = f
        .channels
        .handle(ProtocolTag::Gossip, &[0xff, 0xff, 0xff])
        .await
        .expect_err("garbage");
    assert!(matches!(err, MeshError::Decode(_)));
}

// ========== Unicast Tests ==========

#[tokio::test]
async fn unicast_goes_to_next_hop() {
    let f = fixture();
    let channel = f
        .channels
        .new_channel("test", Arc::new(Recorder::default()))
        .expect("channel");

    channel.gossip_unicast(name(3), b"hello").expect("sent");

    let sent = f.to_b.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].tag, ProtocolTag::GossipUnicast);
    let env = envelope(&sent[0]);
    assert_eq!(env.channel, "test");
    assert_eq!(env.sender_name().expect("sender"), name(1));
    assert_eq!(env.destination_name().expect("destination"), name(3));
    assert_eq!(env.payload, b"hello");
}

#[tokio::test]
async fn unicast_to_unknown_peer_fails() {
    let f = fixture();
    let channel = f
        .channels
        .new_channel("test", Arc::new(Recorder::default()))
        .expect("channel");
    assert!(matches!(
        channel.gossip_unicast(name(9), b"hello"),
        Err(MeshError::Gossip(_))
    ));
}

#[tokio::test]
async fn unicast_without_connection_to_hop_fails() {
    let f = fixture();
    let channel = f
        .channels
        .new_channel("test", Arc::new(Recorder::default()))
        .expect("channel");
    f.connections.remove(&name(2));
    assert!(channel.gossip_unicast(name(3), b"hello").is_err());
}

#[tokio::test]
async fn unicast_for_us_is_consumed() {
    let f = fixture();
    let recorder = Arc::new(Recorder::default());
    f.channels
        .new_channel("test", Arc::clone(&recorder))
        .expect("channel");

    let msg = envelope_msg(ProtocolTag::GossipUnicast, "test", name(3), Some(name(1)), b"hi".to_vec());
    f.channels.handle(msg.tag, &msg.payload).await.expect("handled");

    assert_eq!(recorder.unicasts.lock().clone(), vec![(name(3), b"hi".to_vec())]);
    assert!(f.to_b.sent().is_empty());
}

#[tokio::test]
async fn unicast_for_others_is_relayed_unchanged() {
    let f = fixture();
    f.channels
        .new_channel("test", Arc::new(Recorder::default()))
        .expect("channel");

    // from a peer on the far side of us, addressed to 3
    let msg = envelope_msg(ProtocolTag::GossipUnicast, "test", name(7), Some(name(3)), b"hi".to_vec());
    f.channels.handle(msg.tag, &msg.payload).await.expect("handled");

    let sent = f.to_b.sent();
    assert_eq!(sent.len(), 1);
    let env = envelope(&sent[0]);
    assert_eq!(env.sender_name().expect("sender"), name(7));
    assert_eq!(env.destination_name().expect("destination"), name(3));
}

// ========== Broadcast Tests ==========

#[tokio::test]
async fn broadcast_reaches_neighbours() {
    let f = fixture();
    let channel = f
        .channels
        .new_channel("test", Arc::new(Recorder::default()))
        .expect("channel");

    channel.gossip_broadcast(Blobs([b"news".to_vec()].into()));

    let sent = f.to_b.wait_for(1).await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].tag, ProtocolTag::GossipBroadcast);
    let env = envelope(&sent[0]);
    assert_eq!(env.sender_name().expect("sender"), name(1));
    assert_eq!(env.payload, b"news");
}

#[tokio::test]
async fn known_broadcast_is_not_relayed() {
    let f = fixture();
    let recorder = Arc::new(Recorder::default());
    recorder.absorb(b"old");
    f.channels.new_channel("test", recorder).expect("channel");

    let msg = envelope_msg(ProtocolTag::GossipBroadcast, "test", name(3), None, b"old".to_vec());
    f.channels.handle(msg.tag, &msg.payload).await.expect("handled");

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(f.to_b.sent().is_empty());
}

// ========== Full-State Gossip Tests ==========

#[tokio::test]
async fn periodic_gossip_goes_to_a_neighbour() {
    let f = fixture();
    let recorder = Arc::new(Recorder::default());
    recorder.absorb(b"one");
    recorder.absorb(b"two");
    f.channels.new_channel("test", recorder).expect("channel");

    f.channels.send_all_gossip().await;

    let sent = f.to_b.wait_for(2).await;
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|m| m.tag == ProtocolTag::Gossip));
    let payloads: Vec<Vec<u8>> = sent.iter().map(|m| envelope(m).payload).collect();
    assert_eq!(payloads, vec![b"one".to_vec(), b"two".to_vec()]);
}

#[tokio::test]
async fn new_connection_gets_everything() {
    let f = fixture();
    let recorder = Arc::new(Recorder::default());
    recorder.absorb(b"state");
    f.channels.new_channel("test", recorder).expect("channel");
    f.channels
        .new_channel("quiet", Arc::new(Recorder::default()))
        .expect("channel");

    let conn: Arc<dyn ProtocolSender> = Arc::clone(&f.to_b) as Arc<dyn ProtocolSender>;
    f.channels.send_all_gossip_down(&conn);

    let sent = f.to_b.wait_for(1).await;
    assert_eq!(sent.len(), 1);
    assert_eq!(envelope(&sent[0]).channel, "test");
}

#[tokio::test]
async fn gossip_with_nothing_new_stops_here() {
    let f = fixture();
    let recorder = Arc::new(Recorder::default());
    recorder.absorb(b"seen");
    f.channels.new_channel("test", recorder).expect("channel");

    let msg = envelope_msg(ProtocolTag::Gossip, "test", name(2), None, b"seen".to_vec());
    f.channels.handle(msg.tag, &msg.payload).await.expect("handled");

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(f.to_b.sent().is_empty());
}
