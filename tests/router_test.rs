//! Routing and dedup laws against the public API.

use treemesh::{Connection, DedupCache, Router, Side, SubtreeDescriptor};

fn established(conn: u64, peer: u32, subtree: SubtreeDescriptor) -> Connection {
    let mut c = Connection::new(conn, Side::Ap, 0, 64, 32 * 1024);
    c.mark_handshake_sent();
    c.complete_handshake(peer, subtree);
    c
}

#[test]
fn dfs_route_over_advertised_subtrees() {
    let router = Router::new(1, 500, 60_000, 0);
    // Two branches: 2-{4,5} and 3-{6-{7}}.
    let conns = vec![
        established(
            10,
            2,
            SubtreeDescriptor {
                root: 2,
                children: vec![SubtreeDescriptor::leaf(4), SubtreeDescriptor::leaf(5)],
            },
        ),
        established(
            11,
            3,
            SubtreeDescriptor {
                root: 3,
                children: vec![SubtreeDescriptor {
                    root: 6,
                    children: vec![SubtreeDescriptor::leaf(7)],
                }],
            },
        ),
    ];

    assert_eq!(router.route_to(5, conns.iter()), vec![1, 2, 5]);
    assert_eq!(router.route_to(7, conns.iter()), vec![1, 3, 6, 7]);
    assert_eq!(router.conn_for(7, conns.iter()), Some(11));
    assert!(router.route_to(99, conns.iter()).is_empty());
}

#[test]
fn routes_are_recomputed_from_latest_adverts() {
    let router = Router::new(1, 500, 60_000, 0);
    let mut conns = vec![established(10, 2, SubtreeDescriptor::leaf(2))];
    assert!(router.route_to(3, conns.iter()).is_empty());

    // The peer's subtree grows: the next query sees it without any
    // table maintenance.
    conns[0].update_subtree(SubtreeDescriptor {
        root: 2,
        children: vec![SubtreeDescriptor::leaf(3)],
    });
    assert_eq!(router.route_to(3, conns.iter()), vec![1, 2, 3]);

    // And shrinks again.
    conns[0].update_subtree(SubtreeDescriptor::leaf(2));
    assert!(router.route_to(3, conns.iter()).is_empty());
}

#[test]
fn dedup_one_delivery_per_window() {
    // For any (from, msgId) seen twice within the window, only the first
    // sighting passes.
    let mut cache = DedupCache::new(500, 60_000);
    assert!(cache.insert((1000, 42), 0));
    for t in (1..60).map(|s| s * 1000) {
        assert!(!cache.insert((1000, 42), t));
    }
    // A different message id from the same origin is independent.
    assert!(cache.insert((1000, 43), 5_000));
    // After the TTL the same id is fresh again.
    assert!(cache.insert((1000, 42), 61_000));
}

#[test]
fn dedup_is_bounded() {
    let mut cache = DedupCache::new(500, 60_000);
    for i in 0..10_000u32 {
        cache.insert((7, i), i as u64);
        assert!(cache.len() <= 500);
    }
}

#[test]
fn msg_ids_wrap_without_panic() {
    let mut router = Router::new(1, 16, 60_000, u32::MAX - 1);
    let a = router.next_msg_id();
    let b = router.next_msg_id();
    let c = router.next_msg_id();
    assert_eq!((a, b, c), (u32::MAX - 1, u32::MAX, 0));
}
