//! Tests for the peer graph.

use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};

fn name(n: u8) -> PeerName {
    PeerName::from_bytes_array([2, 0, 0, 0, 0, n])
}

fn link(addr: &str) -> Edge {
    Edge::new(addr, true, true)
}

fn encode(peers: &[Peer]) -> Vec<u8> {
    PeerUpdate {
        peers: peers.iter().map(PeerRecord::from).collect(),
    }
    .encode_to_vec()
}

fn graph_connected_to_b() -> PeerGraph {
    let graph = PeerGraph::new(Peer::new(name(1), "a", 11, 0));
    graph.add_local_edge(name(2), link("10.0.0.2:6783"));
    graph
}

fn remote_b(version: u64) -> Peer {
    Peer::new(name(2), "b", 22, version)
        .with_edge(name(1), link("10.0.0.1:6783"))
        .with_edge(name(3), link("10.0.0.3:6783"))
}

fn remote_c(version: u64) -> Peer {
    Peer::new(name(3), "c", 33, version).with_edge(name(2), link("10.0.0.2:6783"))
}

// ========== Construction Tests ==========

#[test]
fn new_graph_holds_only_ourself() {
    let graph = PeerGraph::new(Peer::new(name(1), "a", 11, 0));
    assert_eq!(graph.len(), 1);
    assert_eq!(graph.ourself().name, name(1));
    assert_eq!(graph.names().into_iter().collect::<Vec<_>>(), vec![name(1)]);
}

#[test]
fn local_edge_changes_bump_version() {
    let graph = graph_connected_to_b();
    assert_eq!(graph.ourself().version, 1);

    assert!(graph.mark_local_edge_established(&name(2)));
    assert_eq!(graph.ourself().version, 2);

    assert!(!graph.mark_local_edge_established(&name(9)));
    assert_eq!(graph.ourself().version, 2);

    assert!(graph.remove_local_edge(&name(2)));
    assert!(!graph.remove_local_edge(&name(2)));
    assert_eq!(graph.ourself().version, 3);
    assert!(graph.ourself().edges.is_empty());
}

// ========== FetchOrAdopt Tests ==========

#[test]
fn fetch_with_default_adopts_then_references() {
    let graph = graph_connected_to_b();
    let first = graph
        .fetch_with_default(Peer::new(name(2), "b", 22, 0))
        .expect("adopt");
    assert_eq!(first.local_refs(), 1);

    let second = graph
        .fetch_with_default(Peer::new(name(2), "ignored", 22, 9))
        .expect("fetch");
    assert_eq!(second.local_refs(), 2);
    assert_eq!(second.nick_name, "b");
    assert_eq!(second.version, 0);
}

#[test]
fn fetch_with_default_rejects_uid_mismatch() {
    let graph = graph_connected_to_b();
    graph
        .fetch_with_default(Peer::new(name(2), "b", 22, 0))
        .expect("adopt");

    let err = graph
        .fetch_with_default(Peer::new(name(2), "b", 99, 0))
        .expect_err("collision");
    assert!(matches!(
        err,
        MeshError::NameCollision {
            known: 22,
            received: 99,
            ..
        }
    ));
    assert_eq!(graph.fetch(&name(2)).expect("still there").local_refs(), 1);
}

#[test]
fn fetch_and_add_ref_only_for_known_peers() {
    let graph = graph_connected_to_b();
    assert!(graph.fetch_and_add_ref(&name(2)).is_none());
    assert_eq!(
        graph.fetch_and_add_ref(&name(1)).expect("ourself").local_refs(),
        1
    );
}

#[test]
fn dereferenced_unreachable_peer_is_collected() {
    let graph = PeerGraph::new(Peer::new(name(1), "a", 11, 0));
    graph
        .fetch_with_default(Peer::new(name(2), "b", 22, 0))
        .expect("adopt");

    assert!(graph.garbage_collect().is_empty());

    graph.dereference(&name(2));
    let removed = graph.garbage_collect();
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].name, name(2));
    assert!(graph.fetch(&name(2)).is_none());
}

// ========== ApplyUpdate Tests ==========

#[test]
fn apply_update_adopts_reachable_peers() {
    let graph = graph_connected_to_b();
    let applied = graph
        .apply_update(&encode(&[remote_b(1), remote_c(1)]))
        .expect("apply");

    assert_eq!(applied.update_names, [name(2), name(3)].into());
    assert_eq!(applied.new_names, [name(2), name(3)].into());
    assert_eq!(graph.len(), 3);
}

#[test]
fn apply_update_is_idempotent() {
    let graph = graph_connected_to_b();
    let update = encode(&[remote_b(1), remote_c(1)]);
    graph.apply_update(&update).expect("first");

    let again = graph.apply_update(&update).expect("second");
    assert!(again.new_names.is_empty());
    assert_eq!(again.update_names.len(), 2);
}

#[test]
fn apply_update_replaces_older_versions_only() {
    let graph = graph_connected_to_b();
    graph
        .apply_update(&encode(&[remote_b(5), remote_c(1)]))
        .expect("apply");

    let stale = Peer::new(name(2), "stale", 22, 4).with_edge(name(1), link("10.0.0.1:6783"));
    let applied = graph.apply_update(&encode(&[stale])).expect("stale");
    assert!(applied.new_names.is_empty());
    assert_eq!(graph.fetch(&name(2)).expect("b").nick_name, "b");

    let fresh = Peer::new(name(2), "fresh", 22, 6).with_edge(name(1), link("10.0.0.1:6783"));
    let applied = graph.apply_update(&encode(&[fresh])).expect("fresh");
    assert_eq!(applied.new_names, [name(2)].into());
    let b = graph.fetch(&name(2)).expect("b");
    assert_eq!(b.version, 6);
    assert_eq!(b.nick_name, "fresh");
    assert!(b.edge(&name(3)).is_none());
}

#[test]
fn apply_update_collects_peers_that_became_unreachable() {
    let graph = graph_connected_to_b();
    graph
        .apply_update(&encode(&[remote_b(1), remote_c(1)]))
        .expect("apply");

    let collected = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&collected);
    graph.on_gc(Box::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    let without_c = Peer::new(name(2), "b", 22, 2).with_edge(name(1), link("10.0.0.1:6783"));
    let applied = graph.apply_update(&encode(&[without_c])).expect("apply");

    assert_eq!(applied.new_names, [name(2)].into());
    assert!(graph.fetch(&name(3)).is_none());
    assert_eq!(collected.load(Ordering::SeqCst), 1);
}

#[test]
fn apply_update_drops_collected_names_from_delta() {
    let graph = PeerGraph::new(Peer::new(name(1), "a", 11, 0));
    let applied = graph.apply_update(&encode(&[remote_c(1)]));
    // c's edge points at b, which nobody has told us about
    assert!(matches!(applied, Err(MeshError::UnknownPeer(n)) if n == name(2)));

    let applied = graph
        .apply_update(&encode(&[remote_b(1), remote_c(1)]))
        .expect("apply");
    assert_eq!(applied.update_names.len(), 2);
    assert!(applied.new_names.is_empty());
    assert_eq!(graph.len(), 1);
}

#[test]
fn apply_update_rejects_uid_mismatch() {
    let graph = graph_connected_to_b();
    graph
        .apply_update(&encode(&[remote_b(1), remote_c(1)]))
        .expect("apply");

    let imposter = Peer::new(name(3), "c", 77, 9).with_edge(name(2), link("10.0.0.2:6783"));
    let err = graph.apply_update(&encode(&[imposter])).expect_err("collision");
    assert!(matches!(err, MeshError::NameCollision { .. }));
    assert_eq!(graph.fetch(&name(3)).expect("c").uid, 33);
}

#[test]
fn apply_update_rejects_garbage() {
    let graph = graph_connected_to_b();
    assert!(matches!(
        graph.apply_update(&[0xff, 0xff, 0xff]),
        Err(MeshError::Decode(_))
    ));
}

#[test]
fn stale_self_record_moves_our_version_beyond_it() {
    let graph = graph_connected_to_b();
    let old_incarnation = Peer::new(name(1), "a", 10, 7);

    let applied = graph.apply_update(&encode(&[old_incarnation])).expect("apply");

    assert_eq!(applied.new_names, [name(1)].into());
    let us = graph.ourself();
    assert_eq!(us.version, 8);
    assert_eq!(us.uid, 11);
    assert!(us.edge(&name(2)).is_some());
}

#[test]
fn own_record_echoed_back_is_ignored() {
    let graph = PeerGraph::new(Peer::new(name(1), "a", 11, 0));
    graph
        .fetch_with_default(Peer::new(name(2), "b", 22, 0))
        .expect("adopt b");
    graph.add_local_edge(name(2), link("10.0.0.2:6783"));
    let echo = graph.ourself();
    let applied = graph.apply_update(&encode(&[echo])).expect("apply");
    assert!(applied.new_names.is_empty());
    assert_eq!(graph.ourself().version, 1);
}

// ========== Encoding Tests ==========

#[test]
fn encode_peers_skips_unknown_names() {
    let graph = graph_connected_to_b();
    let bytes = graph.encode_peers(&[name(1), name(9)].into());
    let decoded = PeerUpdate::decode(bytes.as_slice()).expect("decode");
    assert_eq!(decoded.peers.len(), 1);
    assert_eq!(decoded.peers[0].name, name(1).as_bytes().to_vec());
}

#[test]
fn encode_all_round_trips_through_another_graph() {
    let a = graph_connected_to_b();
    a.apply_update(&encode(&[remote_b(1), remote_c(1)]))
        .expect("apply");

    let b = PeerGraph::new(Peer::new(name(2), "b", 22, 1));
    b.add_local_edge(name(1), link("10.0.0.1:6783"));
    b.add_local_edge(name(3), link("10.0.0.3:6783"));
    let applied = b.apply_update(&a.encode_all()).expect("apply");

    assert!(applied.new_names.contains(&name(1)));
    assert!(applied.new_names.contains(&name(3)));
    assert_eq!(b.len(), 3);
}

// ========== Property Tests ==========

mod proptest_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn applying_twice_yields_empty_delta(versions in proptest::collection::vec(1u64..50, 2)) {
            let graph = graph_connected_to_b();
            let update = encode(&[remote_b(versions[0]), remote_c(versions[1])]);
            graph.apply_update(&update).expect("first");
            let again = graph.apply_update(&update).expect("second");
            prop_assert!(again.new_names.is_empty());
        }

        #[test]
        fn snapshots_do_not_change_after_updates(version in 1u64..50) {
            let graph = graph_connected_to_b();
            let before = graph.snapshot();
            graph.apply_update(&encode(&[remote_b(version), remote_c(version)])).expect("apply");
            prop_assert_eq!(before.len(), 1);
            prop_assert_eq!(graph.snapshot().len(), 3);
        }
    }
}
