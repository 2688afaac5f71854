//! Offline queue laws against the public API.

use treemesh::{MeshError, MessageQueue, Priority, QueueState};

fn put(q: &mut MessageQueue, p: Priority, now: u64) -> u64 {
    q.enqueue(format!("m-{now}").into_bytes(), "https://up.example".into(), p, now)
        .unwrap()
        .expect("stored")
}

#[test]
fn eviction_under_pressure_scenario() {
    // maxSize=3; (LOW,1), (LOW,2), (NORMAL,3); a CRITICAL arrives.
    let mut q = MessageQueue::new(3, 60_000);
    let id1 = put(&mut q, Priority::Low, 0);
    let id2 = put(&mut q, Priority::Low, 1);
    let id3 = put(&mut q, Priority::Normal, 2);
    let id4 = put(&mut q, Priority::Critical, 3);

    // Oldest LOW evicted: queue is {CRITICAL, NORMAL, LOW}, one drop.
    assert_eq!(q.size(None), 3);
    assert!(!q.contains(id1));
    assert!(q.contains(id2));
    assert!(q.contains(id3));
    assert!(q.contains(id4));
    assert_eq!(q.stats().dropped, 1);
    assert_eq!(q.size(Some(Priority::Critical)), 1);
    assert_eq!(q.size(Some(Priority::Normal)), 1);
    assert_eq!(q.size(Some(Priority::Low)), 1);
}

#[test]
fn critical_never_dropped_without_operator_action() {
    let mut q = MessageQueue::new(4, 60_000);
    let criticals: Vec<u64> = (0..4).map(|i| put(&mut q, Priority::Critical, i)).collect();

    // No class of enqueue may displace a CRITICAL.
    for p in [Priority::Low, Priority::Normal, Priority::High] {
        let res = q.enqueue(b"x".to_vec(), "d".into(), p, 10).unwrap();
        assert!(res.is_none());
    }
    let err = q.enqueue(b"x".to_vec(), "d".into(), Priority::Critical, 11).unwrap_err();
    assert!(matches!(err, MeshError::QueueSaturatedCritical));

    for id in &criticals {
        assert!(q.contains(*id));
    }
}

#[test]
fn size_bound_holds_under_any_sequence() {
    let mut q = MessageQueue::new(7, 60_000);
    for i in 0..200u64 {
        let p = match i % 7 {
            0 | 3 => Priority::Low,
            1 | 4 => Priority::Normal,
            2 | 5 => Priority::High,
            _ => Priority::Critical,
        };
        let _ = q.enqueue(vec![i as u8], "d".into(), p, i);
        assert!(q.size(None) <= 7, "queue exceeded bound at step {i}");
        if i % 11 == 0 {
            for m in q.flush(i) {
                if m.id % 2 == 0 {
                    q.remove(m.id);
                }
            }
        }
    }
}

#[test]
fn flush_order_and_delivery_confirmation() {
    let mut q = MessageQueue::new(10, 0);
    let low = put(&mut q, Priority::Low, 0);
    let crit = put(&mut q, Priority::Critical, 1);
    let norm = put(&mut q, Priority::Normal, 2);
    let high = put(&mut q, Priority::High, 3);

    let order: Vec<u64> = q.flush(10).iter().map(|m| m.id).collect();
    assert_eq!(order, vec![crit, high, norm, low]);

    // Caller confirms two deliveries; the rest stay queued.
    assert!(q.remove(crit));
    assert!(q.remove(high));
    assert_eq!(q.stats().sent, 2);
    let order: Vec<u64> = q.flush(20).iter().map(|m| m.id).collect();
    assert_eq!(order, vec![norm, low]);
}

#[test]
fn state_transitions_fire_in_order() {
    use std::sync::{Arc, Mutex};
    let states = Arc::new(Mutex::new(Vec::new()));
    let states2 = states.clone();

    // Tracking window zero so repeated flushes in the drain loop keep
    // handing entries out.
    let mut q = MessageQueue::new(8, 0);
    q.set_state_callback(Box::new(move |s| states2.lock().unwrap().push(s)));

    for i in 0..8 {
        put(&mut q, Priority::Normal, i);
    }
    while q.size(None) > 0 {
        let id = q.flush(100).first().unwrap().id;
        q.remove(id);
    }

    let seen = states.lock().unwrap();
    assert_eq!(seen[0], QueueState::Normal);
    assert!(seen.contains(&QueueState::AboveThreeQuarters));
    assert!(seen.contains(&QueueState::Full));
    assert_eq!(*seen.last().unwrap(), QueueState::Empty);
}

#[test]
fn prune_is_the_only_aging_path_for_critical() {
    let mut q = MessageQueue::new(5, 60_000);
    let old = put(&mut q, Priority::Critical, 0);
    let fresh = put(&mut q, Priority::Critical, 90_000);

    assert_eq!(q.prune(60_000, 100_000), 1);
    assert!(!q.contains(old));
    assert!(q.contains(fresh));

    q.clear();
    assert_eq!(q.size(None), 0);
}
