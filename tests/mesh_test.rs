//! End-to-end scenarios over the in-memory link hub.
//!
//! Each test builds real `MeshCore`s wired through a `SimHub`, drives time
//! explicitly, and pumps link events until the network quiesces.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use treemesh::link::memory::{SimHub, SimLink};
use treemesh::mesh::MeshCore;
use treemesh::{MeshConfig, MeshError, NodeId, ScanCandidate};

fn core(hub: &SimHub, id: NodeId, rssi: i16, channel: u8) -> MeshCore<SimLink> {
    let link = hub.register(&format!("mesh-{id}"), rssi, channel);
    let mut config = MeshConfig::default();
    config.mesh_prefix = "mesh".into();
    MeshCore::new(config, id, link)
}

fn candidate(id: NodeId, rssi: i16, channel: u8) -> ScanCandidate {
    ScanCandidate {
        ssid: format!("mesh-{id}"),
        rssi,
        channel,
        target: format!("mesh-{id}"),
    }
}

/// Deliver pending link events until nothing moves.
fn pump(hub: &SimHub, cores: &mut [&mut MeshCore<SimLink>], now_ms: u64) {
    for _ in 0..128 {
        let mut moved = false;
        for c in cores.iter_mut() {
            let node = c.driver_mut().node_index();
            for ev in hub.take_events(node) {
                moved = true;
                c.handle_link_event(ev, now_ms);
            }
        }
        if !moved {
            return;
        }
    }
    panic!("network did not quiesce");
}

/// Advance simulated time, running due tasks and pumping at each step.
fn settle(hub: &SimHub, cores: &mut [&mut MeshCore<SimLink>], from_ms: u64, to_ms: u64, step: u64) {
    let mut t = from_ms;
    while t <= to_ms {
        for c in cores.iter_mut() {
            c.run_due(t);
        }
        pump(hub, cores, t);
        t += step;
    }
}

/// Collect (from, type, msg bytes) seen by a node's app callback.
fn record_received(core: &mut MeshCore<SimLink>) -> Arc<Mutex<Vec<(NodeId, u16)>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen2 = seen.clone();
    core.set_on_receive(Box::new(move |view| {
        seen2
            .lock()
            .unwrap()
            .push((view.envelope.from, view.envelope.type_code));
    }));
    seen
}

fn body_with(text: &str) -> serde_json::Map<String, serde_json::Value> {
    let mut map = serde_json::Map::new();
    map.insert("body".into(), serde_json::Value::String(text.into()));
    map
}

// =============================================================================
// S1: two-node bring-up and broadcast
// =============================================================================

#[test]
fn two_node_bring_up_and_broadcast() {
    let hub = SimHub::new();
    let mut b = core(&hub, 2000, -50, 1);
    let mut a = core(&hub, 1000, -40, 1);
    let b_seen = record_received(&mut b);

    // B first, then A; A discovers B through the scan loop.
    b.start(0);
    a.start(0);
    settle(&hub, &mut [&mut a, &mut b], 0, 1_000, 250);

    assert_eq!(a.stats(1_000).node_count, 2);
    assert_eq!(b.stats(1_000).node_count, 2);

    a.send_broadcast(200, body_with("hi"), 0, 2_000).unwrap();
    pump(&hub, &mut [&mut a, &mut b], 2_000);

    let seen = b_seen.lock().unwrap();
    assert_eq!(seen.as_slice(), &[(1000, 200)]);
}

// =============================================================================
// S2: three-node unicast with one hop
// =============================================================================

#[test]
fn three_node_unicast_forwards_through_middle() {
    let hub = SimHub::new();
    let mut a = core(&hub, 1, -40, 1);
    let mut b = core(&hub, 2, -40, 1);
    let mut c = core(&hub, 3, -40, 1);
    let c_seen = record_received(&mut c);
    let b_seen = record_received(&mut b);

    // Deterministic topology via explicit joins: C—B, then A—B.
    c.join(&candidate(2, -40, 1));
    pump(&hub, &mut [&mut a, &mut b, &mut c], 0);
    a.join(&candidate(2, -40, 1));
    pump(&hub, &mut [&mut a, &mut b, &mut c], 10);
    settle(&hub, &mut [&mut a, &mut b, &mut c], 10, 1_500, 250);

    // B's subtree as seen from A contains {2, {3}}.
    assert_eq!(a.route_to(3), vec![1, 2, 3]);

    a.send_single(3, 200, body_with("x"), 2_000).unwrap();
    pump(&hub, &mut [&mut a, &mut b, &mut c], 2_000);

    // C delivered exactly once; B forwarded without delivering locally.
    assert_eq!(c_seen.lock().unwrap().as_slice(), &[(1, 200)]);
    assert!(b_seen.lock().unwrap().is_empty());
}

#[test]
fn unreachable_unicast_reports_error() {
    let hub = SimHub::new();
    let mut a = core(&hub, 1, -40, 1);
    a.start(0);
    match a.send_single(99, 200, body_with("x"), 0) {
        Err(MeshError::Unreachable(99)) => {}
        other => panic!("unexpected {other:?}"),
    }
}

// =============================================================================
// S3: broadcast dedup over a redundant link
// =============================================================================

#[test]
fn redundant_link_broadcast_delivered_once() {
    let hub = SimHub::new();
    let mut a = core(&hub, 1, -40, 1);
    let mut b = core(&hub, 2, -40, 1);
    let mut c = core(&hub, 3, -40, 1);
    let c_seen = record_received(&mut c);

    // A—B—C chain.
    b.join(&candidate(1, -40, 1));
    pump(&hub, &mut [&mut a, &mut b, &mut c], 0);
    c.join(&candidate(2, -40, 1));
    pump(&hub, &mut [&mut a, &mut b, &mut c], 10);
    settle(&hub, &mut [&mut a, &mut b, &mut c], 10, 1_500, 250);

    // Redundant link attempt: C dials A directly. C's advert to A leaves
    // out the branch containing A, so A sees a leaf and permits it.
    c.join(&candidate(1, -40, 1));
    settle(&hub, &mut [&mut a, &mut b, &mut c], 1_500, 2_500, 250);
    assert_eq!(a.stats(2_500).connections.iter().filter(|i| i.established).count(), 2);

    // A broadcast from A reaches C twice (direct, and via B); the second
    // copy is suppressed by the dedup cache.
    a.send_broadcast(200, body_with("m"), 0, 3_000).unwrap();
    pump(&hub, &mut [&mut a, &mut b, &mut c], 3_000);

    assert_eq!(c_seen.lock().unwrap().as_slice(), &[(1, 200)]);
}

// =============================================================================
// S6: channel re-synchronization
// =============================================================================

#[test]
fn channel_resync_after_empty_scans() {
    let hub = SimHub::new();
    let mut a = core(&hub, 1000, -40, 1);
    // The established mesh lives on channel 6; connected nodes never
    // channel-hop, so only the isolated A re-synchronizes.
    let mut b = core(&hub, 2000, -50, 6);
    let mut d = core(&hub, 3000, -60, 6);
    let a_node = a.driver_mut().node_index();

    d.join(&candidate(2000, -50, 6));
    pump(&hub, &mut [&mut b, &mut d], 0);

    a.start(0);
    b.start(0);
    d.start(0);

    // Fast scans on channel 1 find nothing; after the empty-scan
    // threshold a full scan locates the mesh on channel 6, the access
    // endpoint restarts there, and the join handshake follows.
    settle(&hub, &mut [&mut a, &mut b, &mut d], 0, 120_000, 500);

    assert_eq!(a.stats(120_000).channel, 6);
    assert_eq!(hub.channel_of(a_node), 6);
    assert_eq!(a.stats(120_000).node_count, 3);
    assert_eq!(a.route_to(3000), vec![1000, 2000, 3000]);
}

// =============================================================================
// Drop handling
// =============================================================================

#[test]
fn peer_drop_invalidates_routes_and_notifies() {
    let hub = SimHub::new();
    let mut a = core(&hub, 1000, -40, 1);
    let mut b = core(&hub, 2000, -50, 1);
    let b_node = b.driver_mut().node_index();

    let dropped = Arc::new(Mutex::new(Vec::new()));
    let dropped2 = dropped.clone();
    a.set_on_dropped(Box::new(move |peer| dropped2.lock().unwrap().push(peer)));

    a.start(0);
    b.start(0);
    settle(&hub, &mut [&mut a, &mut b], 0, 1_000, 250);
    assert_eq!(a.route_to(2000), vec![1000, 2000]);

    hub.power_off(b_node);
    pump(&hub, &mut [&mut a], 2_000);

    assert!(a.route_to(2000).is_empty());
    assert_eq!(dropped.lock().unwrap().as_slice(), &[2000]);
    assert_eq!(a.stats(2_000).node_count, 1);
}

// =============================================================================
// Duplicate links between the same pair converge
// =============================================================================

#[test]
fn reverse_dial_converges_to_one_link() {
    let hub = SimHub::new();
    let mut a = core(&hub, 1, -40, 1);
    let mut b = core(&hub, 2, -40, 1);

    b.join(&candidate(1, -40, 1));
    pump(&hub, &mut [&mut a, &mut b], 0);
    settle(&hub, &mut [&mut a, &mut b], 0, 1_000, 250);
    assert_eq!(a.stats(1_000).node_count, 2);

    // A dial in the reverse direction: both ends apply the same
    // lower-station-id rule, so they agree on which link survives and
    // exactly one connection per peer remains.
    a.join(&candidate(2, -40, 1));
    settle(&hub, &mut [&mut a, &mut b], 1_000, 2_500, 250);

    let a_established: Vec<_> = a
        .stats(2_500)
        .connections
        .into_iter()
        .filter(|i| i.established)
        .collect();
    assert_eq!(a_established.len(), 1);
    assert_eq!(a_established[0].peer_id, Some(2));
    assert_eq!(a.route_to(2), vec![1, 2]);
    assert_eq!(b.route_to(1), vec![2, 1]);
}

// =============================================================================
// Time sync runs along the tree
// =============================================================================

#[test]
fn time_sync_exchanges_record_latency() {
    let hub = SimHub::new();
    let mut a = core(&hub, 1000, -40, 1);
    let mut b = core(&hub, 2000, -50, 1);

    a.start(0);
    b.start(0);
    settle(&hub, &mut [&mut a, &mut b], 0, 25_000, 500);

    // B (higher id, equal tree) pulls from A; its uplink carries latency
    // samples from the exchange.
    let stats = b.stats(25_000);
    let uplink = stats
        .connections
        .iter()
        .find(|i| i.peer_id == Some(1000))
        .expect("uplink present");
    assert!(uplink.avg_latency_us.is_some());
    // Neither side drifted: the hub delivers within one step.
    assert_eq!(stats.offset_us, 0);
}

// =============================================================================
// Bridge election over the mesh
// =============================================================================

#[test]
fn solo_bridge_election_proceeds() {
    // A credentialed node with no peers still stands, wins unopposed, and
    // becomes the bridge when router association succeeds.
    let hub = SimHub::new();
    let mut config = MeshConfig::default();
    config.mesh_prefix = "mesh".into();
    config.bridge.router_ssid = "upstream".into();
    config.bridge.failover_enabled = true;
    let link = hub.register("mesh-9", -50, 1);
    let mut x = MeshCore::new(config, 9, link);
    x.set_auto_associate(Some(true));
    x.set_observation(treemesh::LocalObservation {
        router_rssi: -60,
        router_channel: 1,
        ..Default::default()
    });

    x.start(0);
    settle(&hub, &mut [&mut x], 0, 80_000, 1_000);
    assert_eq!(x.bridge_role(), treemesh::BridgeRole::BridgeActive);
}

#[test]
fn bridge_election_promotes_and_flushes_queues() {
    let hub = SimHub::new();
    let mut a = core(&hub, 1000, -40, 1);
    let mut b = core(&hub, 2000, -50, 1);

    // X is bridge-capable with failover; promotions auto-succeed.
    let mut config = MeshConfig::default();
    config.mesh_prefix = "mesh".into();
    config.bridge.router_ssid = "upstream".into();
    config.bridge.failover_enabled = true;
    let link = hub.register("mesh-3000", -60, 1);
    let mut x = MeshCore::new(config, 3000, link);
    x.set_auto_associate(Some(true));
    x.set_observation(treemesh::LocalObservation {
        router_rssi: -45,
        router_channel: 1,
        uptime_secs: 10,
        free_memory: 4096,
        gateway_ip: "10.0.0.1".into(),
    });

    let role_changes = Arc::new(Mutex::new(Vec::new()));
    let role_changes2 = role_changes.clone();
    x.set_on_bridge_role_changed(Box::new(move |active, reason| {
        role_changes2.lock().unwrap().push((active, reason.to_string()));
    }));

    let a_status = Arc::new(AtomicUsize::new(0));
    let a_status2 = a_status.clone();
    a.set_on_bridge_status_changed(Box::new(move |_, internet| {
        if internet {
            a_status2.fetch_add(1, Ordering::SeqCst);
        }
    }));
    let a_flushed = Arc::new(Mutex::new(Vec::new()));
    let a_flushed2 = a_flushed.clone();
    a.set_on_queue_flush(Box::new(move |batch| {
        a_flushed2.lock().unwrap().extend(batch.into_iter().map(|m| m.id));
    }));

    // Something for A to flush when the uplink appears.
    let queued = a
        .offline_enqueue(b"reading".to_vec(), "https://up.example/ingest".into(), treemesh::Priority::High, 0)
        .unwrap()
        .unwrap();

    a.start(0);
    b.start(0);
    x.start(0);
    settle(&hub, &mut [&mut a, &mut b, &mut x], 0, 2_000, 250);
    assert_eq!(a.stats(2_000).node_count, 3);

    // No bridge status ever arrives: X stands, wins unopposed, promotes,
    // and starts broadcasting status.
    settle(&hub, &mut [&mut a, &mut b, &mut x], 2_000, 90_000, 1_000);

    assert_eq!(x.bridge_role(), treemesh::BridgeRole::BridgeActive);
    assert_eq!(
        role_changes.lock().unwrap().first(),
        Some(&(true, "election".to_string()))
    );
    assert!(a_status.load(Ordering::SeqCst) >= 1);
    assert_eq!(a_flushed.lock().unwrap().as_slice(), &[queued]);
    assert_eq!(a.preferred_bridge(90_000), Some(3000));
}
