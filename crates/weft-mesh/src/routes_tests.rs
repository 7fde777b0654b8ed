//! Tests for route computation.

use super::*;
use crate::peer::Edge;
use crate::wire::{PeerRecord, PeerUpdate};
use prost::Message;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

fn name(n: u8) -> PeerName {
    PeerName::from_bytes_array([2, 0, 0, 0, 0, n])
}

/// Builds a table where every listed pair is connected in both directions.
fn mesh(nodes: u8, links: &[(u8, u8)], established: bool) -> PeerTable {
    let mut peers: BTreeMap<u8, Peer> = (1..=nodes)
        .map(|n| (n, Peer::new(name(n), format!("p{n}"), u64::from(n), 1)))
        .collect();
    for &(a, b) in links {
        for (from, to) in [(a, b), (b, a)] {
            if let Some(peer) = peers.get_mut(&from) {
                peer.edges
                    .insert(name(to), Edge::new(format!("10.0.0.{to}:6783"), from < to, established));
            }
        }
    }
    peers.into_values().collect()
}

/// Delivers a broadcast from `source` the way forwarding peers would and
/// counts how often each peer receives it.
fn simulate_broadcast(table: &PeerTable, source: PeerName) -> BTreeMap<PeerName, usize> {
    let routes: HashMap<PeerName, Routes> = table
        .iter()
        .map(|p| (p.name, Routes::calculate(table, p.name)))
        .collect();
    let mut received = BTreeMap::new();
    let mut queue = vec![source];
    while let Some(at) = queue.pop() {
        for hop in routes[&at].broadcast(&source) {
            *received.entry(*hop).or_insert(0) += 1;
            queue.push(*hop);
        }
    }
    received
}

// ========== Traversal Tests ==========

#[test]
fn traversal_records_first_hop() {
    let table = mesh(4, &[(1, 2), (2, 3), (3, 4)], true);
    let (found, routes) = routes_from(&table, name(1), true, None);

    assert!(!found);
    assert_eq!(routes[&name(1)], PeerName::UNKNOWN);
    assert_eq!(routes[&name(2)], name(2));
    assert_eq!(routes[&name(3)], name(2));
    assert_eq!(routes[&name(4)], name(2));
}

#[test]
fn traversal_stops_at_target() {
    let table = mesh(4, &[(1, 2), (2, 3), (3, 4)], true);
    let (found, routes) = routes_from(&table, name(1), true, Some(name(3)));

    assert!(found);
    assert!(routes.contains_key(&name(3)));
    assert!(!routes.contains_key(&name(4)));
}

#[test]
fn traversal_prefers_lower_names_on_ties() {
    // 1 reaches 4 through both 2 and 3 at equal distance
    let table = mesh(4, &[(1, 3), (1, 2), (2, 4), (3, 4)], true);
    let (_, routes) = routes_from(&table, name(1), true, None);
    assert_eq!(routes[&name(4)], name(2));
}

#[test]
fn symmetric_traversal_ignores_half_edges() {
    let mut peers: Vec<Peer> = mesh(3, &[(1, 2)], true).iter().cloned().collect();
    // 2 claims a link to 3 that 3 does not report
    peers[1]
        .edges
        .insert(name(3), Edge::new("10.0.0.3:6783", true, true));
    let table: PeerTable = peers.into_iter().collect();

    let (_, strict) = routes_from(&table, name(1), true, None);
    let (_, loose) = routes_from(&table, name(1), false, None);
    assert!(!strict.contains_key(&name(3)));
    assert_eq!(loose[&name(3)], name(2));
}

#[test]
fn unestablished_edges_only_count_when_unrestricted() {
    let table = mesh(2, &[(1, 2)], false);
    let routes = Routes::calculate(&table, name(1));

    assert_eq!(routes.unicast(&name(2)), None);
    assert_eq!(routes.unicast_all(&name(2)), Some(name(2)));
    assert!(routes.broadcast(&name(1)).is_empty());
    assert_eq!(routes.broadcast_all(&name(1)), &[name(2)]);
}

// ========== Routes Tests ==========

#[test]
fn self_route_is_unknown_but_reachable() {
    let routes = Routes::calculate(&mesh(2, &[(1, 2)], true), name(1));
    assert!(routes.is_reachable(&name(1)));
    assert_eq!(routes.unicast(&name(1)), None);
    assert!(!routes.is_reachable(&name(9)));
}

#[test]
fn initial_routes_only_know_ourself() {
    let routes = Routes::initial(name(1));
    assert_eq!(routes.unicast_table().len(), 1);
    assert!(routes.broadcast(&name(1)).is_empty());
    assert!(routes.random_neighbours(&name(1)).is_empty());
}

#[test]
fn broadcast_from_self_reaches_all_neighbours() {
    let table = mesh(4, &[(1, 2), (1, 3), (2, 4)], true);
    let routes = Routes::calculate(&table, name(1));
    assert_eq!(routes.broadcast(&name(1)), &[name(2), name(3)]);
    // a broadcast from 4 arrives via 2 and is passed on to 3 only
    assert_eq!(routes.broadcast(&name(4)), &[name(3)]);
}

#[test]
fn broadcast_reaches_every_peer_exactly_once_on_a_ring() {
    let table = mesh(6, &[(1, 2), (2, 3), (3, 4), (4, 5), (5, 6), (6, 1), (2, 5)], true);
    for source in table.names() {
        let received = simulate_broadcast(&table, source);
        assert_eq!(received.len(), 5, "source {source}");
        assert!(received.values().all(|&n| n == 1), "source {source}: {received:?}");
        assert!(!received.contains_key(&source));
    }
}

#[test]
fn random_neighbours_are_distinct_hops() {
    let table = mesh(
        8,
        &[(1, 2), (1, 3), (1, 4), (2, 5), (3, 6), (4, 7), (4, 8)],
        true,
    );
    let routes = Routes::calculate(&table, name(1));
    for _ in 0..20 {
        let picked = routes.random_neighbours(&name(4));
        // eight destinations: log2(8) = 3, but only two hops remain
        assert_eq!(picked.len(), 2);
        assert!(!picked.contains(&name(4)));
        assert_ne!(picked[0], picked[1]);
        assert!(picked.iter().all(|p| [name(2), name(3)].contains(p)));
    }
}

// ========== RouteTable Tests ==========

fn graph_with_neighbour() -> Arc<PeerGraph> {
    let graph = Arc::new(PeerGraph::new(Peer::new(name(1), "a", 1, 0)));
    graph.add_local_edge(name(2), Edge::new("10.0.0.2:6783", true, true));
    let update = PeerUpdate {
        peers: vec![PeerRecord::from(
            &Peer::new(name(2), "b", 2, 1)
                .with_edge(name(1), Edge::new("10.0.0.1:6783", false, true)),
        )],
    }
    .encode_to_vec();
    graph.apply_update(&update).expect("apply");
    graph
}

#[tokio::test]
async fn recalculation_publishes_new_snapshot() {
    let table = RouteTable::start(graph_with_neighbour());
    assert_eq!(table.unicast(&name(2)), None);

    let changes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&changes);
    table.on_change(Box::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    table.recalculate();
    table.ensure_recalculated().await;

    assert_eq!(table.unicast(&name(2)), Some(name(2)));
    assert_eq!(table.broadcast(&name(1)), vec![name(2)]);
    assert_eq!(changes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn repeated_requests_are_coalesced() {
    let table = RouteTable::start(graph_with_neighbour());
    let changes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&changes);
    table.on_change(Box::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    for _ in 0..10 {
        table.recalculate();
    }
    table.ensure_recalculated().await;

    let runs = changes.load(Ordering::SeqCst);
    assert!((1..10).contains(&runs), "ran {runs} times");
}

#[tokio::test]
async fn old_snapshots_are_not_mutated() {
    let table = RouteTable::start(graph_with_neighbour());
    let before = table.snapshot();
    table.recalculate_now();
    assert_eq!(before.unicast(&name(2)), None);
    assert_eq!(table.snapshot().unicast(&name(2)), Some(name(2)));
}

// ========== Property Tests ==========

mod proptest_tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_links() -> impl Strategy<Value = (u8, Vec<(u8, u8)>)> {
        (3u8..9).prop_flat_map(|n| {
            let extra = proptest::collection::vec((1..=n, 1..=n), 0..12);
            extra.prop_map(move |pairs| {
                let mut links: Vec<(u8, u8)> = (1..n).map(|i| (i, i + 1)).collect();
                links.extend(pairs.into_iter().filter(|(a, b)| a != b));
                (n, links)
            })
        })
    }

    /// Applies each peer's updates in the given interleaving; per-peer
    /// order is preserved because versions are assigned on first sight.
    fn converge(order: &[u8]) -> Routes {
        let graph = PeerGraph::new(Peer::new(name(1), "a", 1, 0));
        for n in 2..=4 {
            graph.add_local_edge(name(n), Edge::new(format!("10.0.0.{n}:6783"), true, true));
            graph
                .fetch_with_default(Peer::new(name(n), "", u64::from(n), 0))
                .expect("seed");
        }
        let mut seen: BTreeMap<u8, u64> = BTreeMap::new();
        for &n in order {
            let version = seen.entry(n).or_insert(0);
            *version += 1;
            let mut peer = Peer::new(name(n), format!("p{n}"), u64::from(n), *version)
                .with_edge(name(1), Edge::new("10.0.0.1:6783", false, true));
            if *version == 2 {
                let other = if n == 4 { 2 } else { n + 1 };
                peer = peer.with_edge(name(other), Edge::new(format!("10.0.0.{other}:6783"), true, true));
            }
            let bytes = PeerUpdate { peers: vec![PeerRecord::from(&peer)] }.encode_to_vec();
            graph.apply_update(&bytes).expect("apply");
        }
        Routes::calculate(&graph.snapshot(), name(1))
    }

    proptest! {
        #[test]
        fn broadcast_is_exactly_once((n, links) in arb_links()) {
            let table = mesh(n, &links, true);
            for source in table.names() {
                let received = simulate_broadcast(&table, source);
                prop_assert_eq!(received.len(), usize::from(n) - 1);
                prop_assert!(received.values().all(|&count| count == 1));
            }
        }

        #[test]
        fn interleaved_updates_converge(order in Just(vec![2u8, 2, 3, 3, 4, 4]).prop_shuffle()) {
            let expected = converge(&[2, 2, 3, 3, 4, 4]);
            let actual = converge(&order);
            prop_assert_eq!(actual.unicast_table(), expected.unicast_table());
            prop_assert_eq!(actual.broadcast_table(), expected.broadcast_table());
        }
    }
}
