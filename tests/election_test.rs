//! Bridge election properties against the public API.

use treemesh::wire::{BridgeElectionPayload, BridgeStatusPayload};
use treemesh::{
    BridgeConfig, BridgeCoordinator, BridgeRole, ElectionCandidate, LocalObservation,
    election_winner,
};

fn candidate(node_id: u32, rssi: i16, uptime: u64, memory: u64) -> ElectionCandidate {
    ElectionCandidate { node_id, router_rssi: rssi, uptime, free_memory: memory }
}

#[test]
fn tie_break_by_uptime() {
    // Candidates at −42/−42/−55 with uptimes 3600/7200/10000: best RSSI
    // ties, the higher uptime among the tie wins.
    let set = vec![
        candidate(100, -42, 3600, 123),
        candidate(200, -42, 7200, 456),
        candidate(50, -55, 10_000, 789),
    ];
    assert_eq!(election_winner(&set), Some(200));
}

#[test]
fn winner_is_lexicographic_argmax() {
    // Exhaustive ordering: rssi dominates uptime dominates memory
    // dominates (negated) node id.
    let base = candidate(10, -50, 100, 100);
    let better_rssi = candidate(20, -40, 1, 1);
    assert_eq!(election_winner(&[base.clone(), better_rssi.clone()]), Some(20));

    let tie_rssi_better_uptime = candidate(30, -50, 200, 1);
    assert_eq!(
        election_winner(&[base.clone(), tie_rssi_better_uptime]),
        Some(30)
    );

    let tie_both_better_memory = candidate(40, -50, 100, 200);
    assert_eq!(
        election_winner(&[base.clone(), tie_both_better_memory]),
        Some(40)
    );

    let full_tie_lower_id = candidate(5, -50, 100, 100);
    assert_eq!(election_winner(&[base, full_tie_lower_id]), Some(5));
}

#[test]
fn zero_rssi_candidates_ineligible() {
    let set = vec![candidate(1, 0, u64::MAX, u64::MAX), candidate(2, -90, 0, 0)];
    assert_eq!(election_winner(&set), Some(2));
    assert_eq!(election_winner(&[candidate(1, 0, 1, 1)]), None);
}

#[test]
fn every_node_computes_the_same_winner() {
    // The determinism property: any permutation of the same candidate set
    // yields the same winner.
    let a = candidate(100, -42, 3600, 10);
    let b = candidate(200, -42, 7200, 20);
    let c = candidate(50, -55, 10_000, 30);
    let orders = [
        vec![a.clone(), b.clone(), c.clone()],
        vec![b.clone(), c.clone(), a.clone()],
        vec![c.clone(), a.clone(), b.clone()],
        vec![c, b, a],
    ];
    for set in orders {
        assert_eq!(election_winner(&set), Some(200));
    }
}

fn capable_coordinator(id: u32, rssi: i16) -> BridgeCoordinator {
    let cfg = BridgeConfig {
        router_ssid: "upstream".into(),
        failover_enabled: true,
        ..BridgeConfig::default()
    };
    let mut c = BridgeCoordinator::new(id, cfg, true);
    c.set_observation(LocalObservation { router_rssi: rssi, ..LocalObservation::default() });
    c
}

fn heartbeat(c: &mut BridgeCoordinator, from: u32, now_ms: u64) {
    c.on_status(
        from,
        &BridgeStatusPayload {
            internet_connected: true,
            router_rssi: -50,
            router_channel: 1,
            uptime: 1,
            gateway_ip: String::new(),
            timestamp: now_ms,
        },
        now_ms,
    );
}

#[test]
fn role_changes_at_most_once_per_cooldown() {
    let mut c = capable_coordinator(7, -40);
    heartbeat(&mut c, 99, 0);

    // Bridge goes silent; candidacy, win, promote.
    assert!(c.check_bridge_timeout(60_000).is_some());
    c.close_election(65_000).unwrap();
    c.promotion_succeeded(65_000);
    assert_eq!(c.role(), BridgeRole::BridgeActive);

    // Demotion shortly after starts the cooldown clock again.
    c.demote(70_000);
    heartbeat(&mut c, 99, 70_000);

    // Silence long enough to elect, but inside the 60 s cooldown.
    assert!(c.check_bridge_timeout(129_999).is_none());
    assert!(c.check_bridge_timeout(130_000).is_some());
}

#[test]
fn candidates_collected_only_inside_window() {
    let mut c = capable_coordinator(7, -80);
    heartbeat(&mut c, 99, 0);
    c.check_bridge_timeout(60_000).unwrap();

    // A stronger peer inside the window wins.
    c.on_election_msg(
        8,
        &BridgeElectionPayload {
            router_rssi: -30,
            uptime: 1,
            free_memory: 1,
            timestamp: 61_000,
            router_ssid: "upstream".into(),
        },
        61_000,
    );
    assert!(c.close_election(65_000).is_none());
    assert_eq!(c.role(), BridgeRole::None);

    // The same message outside any window does not resurrect the closed
    // election; it opens a fresh one only when the cooldown permits.
    assert!(c.close_election(66_000).is_none());
}
