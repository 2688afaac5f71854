//! Per-peer connection state and outbound queueing.
//!
//! A `Connection` is exclusively owned by the protocol engine; the router
//! refers to peers by NodeId only. One connection per peer NodeId: a
//! reconnect replaces the previous record.
//!
//! ```text
//! State Transitions:
//!
//! ┌──────┐ endpoint up  ┌────────────────┐ peer HANDSHAKE ok ┌────────────────────┐
//! │ Init │─────────────►│ HandshakeSent  │──────────────────►│ HandshakeComplete  │
//! └──────┘ (sent ours)  └──────┬─────────┘                   └─────────┬──────────┘
//!                              │ timeout / self-loop / cycle           │ drop
//!                              ▼                                       ▼
//!                         ┌─────────┐                             ┌─────────┐
//!                         │ Closing │                             │ Closing │
//!                         └─────────┘                             └─────────┘
//! ```
//!
//! Only HandshakeComplete connections are advertised to the router;
//! pre-handshake peers cannot inject routed traffic.

use crate::link::{ConnId, LineAssembler};
use crate::scheduler::TaskHandle;
use crate::types::{NodeId, Priority, SubtreeDescriptor};
use std::collections::VecDeque;

// =============================================================================
// QUEUE BOUNDS
// =============================================================================

/// Latency samples kept per peer; the average of this window is the
/// latency figure in the quality score.
pub const LATENCY_WINDOW: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Init,
    HandshakeSent,
    HandshakeComplete,
    Closing,
}

/// Which end initiated: the station dialed out, the AP accepted.
/// Exactly one side of every established link is the station.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Station,
    Ap,
}

#[derive(Debug)]
struct OutFrame {
    line: String,
    priority: Priority,
}

/// An active bidirectional link to a neighbor.
pub struct Connection {
    pub conn: ConnId,
    pub side: Side,
    pub state: ConnState,
    /// Filled once the peer's handshake arrives.
    pub peer_id: Option<NodeId>,
    /// Peer's advertised subtree, rooted at the peer.
    pub subtree: Option<SubtreeDescriptor>,
    /// Station side: signal strength of the joined endpoint.
    pub rssi: Option<i16>,
    pub channel: Option<u8>,
    /// Station side: the network name we joined.
    pub station_ssid: Option<String>,
    /// Inbound line reassembly buffer.
    pub assembler: LineAssembler,

    pub created_ms: u64,
    pub last_received_ms: u64,
    /// One-shot scheduler task guarding handshake arrival.
    pub handshake_timer: Option<TaskHandle>,

    // Counters
    pub messages_rx: u64,
    pub messages_tx: u64,
    pub messages_dropped: u64,

    latency_us: VecDeque<i64>,
    outbound: VecDeque<OutFrame>,
    outbound_bytes: usize,
    max_frames: usize,
    max_bytes: usize,
}

impl Connection {
    pub fn new(conn: ConnId, side: Side, now_ms: u64, max_frames: usize, max_bytes: usize) -> Self {
        Self {
            conn,
            side,
            state: ConnState::Init,
            peer_id: None,
            subtree: None,
            rssi: None,
            channel: None,
            station_ssid: None,
            assembler: LineAssembler::new(),
            created_ms: now_ms,
            last_received_ms: now_ms,
            handshake_timer: None,
            messages_rx: 0,
            messages_tx: 0,
            messages_dropped: 0,
            latency_us: VecDeque::with_capacity(LATENCY_WINDOW),
            outbound: VecDeque::new(),
            outbound_bytes: 0,
            max_frames,
            max_bytes,
        }
    }

    pub fn is_established(&self) -> bool {
        self.state == ConnState::HandshakeComplete
    }

    pub fn mark_handshake_sent(&mut self) {
        if self.state == ConnState::Init {
            self.state = ConnState::HandshakeSent;
        }
    }

    /// Record the peer's handshake. The caller has already validated the
    /// self-loop and cycle rules.
    pub fn complete_handshake(&mut self, peer_id: NodeId, subtree: SubtreeDescriptor) {
        self.peer_id = Some(peer_id);
        self.subtree = Some(subtree);
        self.state = ConnState::HandshakeComplete;
    }

    pub fn begin_close(&mut self) {
        self.state = ConnState::Closing;
    }

    /// Update the peer's advertised subtree (unsolicited NODE_SYNC).
    pub fn update_subtree(&mut self, subtree: SubtreeDescriptor) {
        self.subtree = Some(subtree);
    }

    /// Whether `id` is reachable through this peer per its last advert.
    pub fn subtree_contains(&self, id: NodeId) -> bool {
        self.subtree.as_ref().is_some_and(|s| s.contains(id))
    }

    pub fn on_received(&mut self, now_ms: u64) {
        self.last_received_ms = now_ms;
        self.messages_rx += 1;
    }

    pub fn record_latency(&mut self, rtt_us: i64) {
        if self.latency_us.len() == LATENCY_WINDOW {
            self.latency_us.pop_front();
        }
        self.latency_us.push_back(rtt_us.max(0));
    }

    /// Rolling average latency in microseconds, if any samples exist.
    pub fn avg_latency_us(&self) -> Option<i64> {
        if self.latency_us.is_empty() {
            return None;
        }
        Some(self.latency_us.iter().sum::<i64>() / self.latency_us.len() as i64)
    }

    // -------------------------------------------------------------------------
    // Outbound FIFO
    // -------------------------------------------------------------------------

    /// Queue a frame for transmission. Under backpressure the oldest LOW
    /// frames go first, then NORMAL; CRITICAL and HIGH are never dropped by
    /// the queue. Returns false when the frame itself was rejected.
    pub fn enqueue(&mut self, line: String, priority: Priority) -> bool {
        if self.state == ConnState::Closing {
            self.messages_dropped += 1;
            return false;
        }
        let incoming_bytes = line.len();
        while self.outbound.len() + 1 > self.max_frames
            || self.outbound_bytes + incoming_bytes > self.max_bytes
        {
            if !self.drop_oldest_droppable() {
                // Nothing droppable left. Control traffic squeezes in
                // anyway; data is rejected.
                if matches!(priority, Priority::Critical | Priority::High) {
                    break;
                }
                self.messages_dropped += 1;
                return false;
            }
        }
        self.outbound_bytes += incoming_bytes;
        self.outbound.push_back(OutFrame { line, priority });
        true
    }

    fn drop_oldest_droppable(&mut self) -> bool {
        for class in [Priority::Low, Priority::Normal] {
            let pos = self.outbound.iter().position(|f| f.priority == class);
            if let Some(frame) = pos.and_then(|p| self.outbound.remove(p)) {
                self.outbound_bytes -= frame.line.len();
                self.messages_dropped += 1;
                return true;
            }
        }
        false
    }

    /// Next frame to hand to the link, without removing it.
    pub fn peek_outbound(&self) -> Option<&str> {
        self.outbound.front().map(|f| f.line.as_str())
    }

    /// Confirm the peeked frame was accepted by the link.
    pub fn pop_outbound(&mut self) {
        if let Some(frame) = self.outbound.pop_front() {
            self.outbound_bytes -= frame.line.len();
            self.messages_tx += 1;
        }
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    // -------------------------------------------------------------------------
    // Quality
    // -------------------------------------------------------------------------

    /// Link quality score in [0, 100]: penalties for high latency, loss,
    /// and weak signal.
    pub fn quality(&self) -> u8 {
        let mut score: i32 = 100;

        if let Some(avg_us) = self.avg_latency_us() {
            let avg_ms = avg_us / 1000;
            if avg_ms > 100 {
                score -= (((avg_ms - 100) / 10) as i32).min(30);
            }
        }

        let attempted = self.messages_tx + self.messages_dropped;
        if attempted > 0 {
            let loss_pct = (self.messages_dropped * 100 / attempted) as i32;
            score -= loss_pct.min(40);
        }

        if let Some(rssi) = self.rssi {
            if rssi < -80 {
                score -= ((-80 - rssi as i32) * 2).min(30);
            }
        }

        score.clamp(0, 100) as u8
    }
}

/// Connection snapshot for external queries.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub conn: ConnId,
    pub peer_id: Option<NodeId>,
    pub side: Side,
    pub established: bool,
    pub subtree_size: usize,
    pub rssi: Option<i16>,
    pub avg_latency_us: Option<i64>,
    pub quality: u8,
    pub messages_rx: u64,
    pub messages_tx: u64,
    pub messages_dropped: u64,
    pub last_received_ms: u64,
}

impl From<&Connection> for ConnectionInfo {
    fn from(c: &Connection) -> Self {
        Self {
            conn: c.conn,
            peer_id: c.peer_id,
            side: c.side,
            established: c.is_established(),
            subtree_size: c.subtree.as_ref().map(|s| s.size()).unwrap_or(0),
            rssi: c.rssi,
            avg_latency_us: c.avg_latency_us(),
            quality: c.quality(),
            messages_rx: c.messages_rx,
            messages_tx: c.messages_tx,
            messages_dropped: c.messages_dropped,
            last_received_ms: c.last_received_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        Connection::new(1, Side::Station, 0, 4, 1024)
    }

    #[test]
    fn handshake_transitions() {
        let mut c = conn();
        assert_eq!(c.state, ConnState::Init);
        c.mark_handshake_sent();
        assert_eq!(c.state, ConnState::HandshakeSent);
        c.complete_handshake(42, SubtreeDescriptor::leaf(42));
        assert!(c.is_established());
        assert_eq!(c.peer_id, Some(42));
        assert!(c.subtree_contains(42));
        assert!(!c.subtree_contains(7));
    }

    #[test]
    fn fifo_drops_low_before_normal_never_high() {
        let mut c = conn();
        assert!(c.enqueue("l1\n".into(), Priority::Low));
        assert!(c.enqueue("n1\n".into(), Priority::Normal));
        assert!(c.enqueue("h1\n".into(), Priority::High));
        assert!(c.enqueue("l2\n".into(), Priority::Low));
        // Capacity 4: a HIGH enqueue must displace the oldest LOW.
        assert!(c.enqueue("h2\n".into(), Priority::High));
        assert_eq!(c.outbound_len(), 4);
        assert_eq!(c.messages_dropped, 1);

        // Fill with control only, then a LOW is rejected outright.
        assert!(c.enqueue("h3\n".into(), Priority::High)); // displaces l2
        assert!(c.enqueue("c1\n".into(), Priority::Critical)); // displaces n1
        assert!(!c.enqueue("l3\n".into(), Priority::Low));
        assert_eq!(c.messages_dropped, 4);

        // Control still squeezes in past the bound.
        assert!(c.enqueue("c2\n".into(), Priority::Critical));
        assert_eq!(c.outbound_len(), 5);
    }

    #[test]
    fn byte_bound_applies() {
        let mut c = Connection::new(1, Side::Ap, 0, 100, 10);
        assert!(c.enqueue("aaaa\n".into(), Priority::Low));
        assert!(c.enqueue("bbbb\n".into(), Priority::Low));
        // 10 bytes queued; next LOW displaces the oldest.
        assert!(c.enqueue("cccc\n".into(), Priority::Low));
        assert_eq!(c.outbound_len(), 2);
        assert_eq!(c.peek_outbound(), Some("bbbb\n"));
    }

    #[test]
    fn quality_penalizes_latency_loss_and_rssi() {
        let mut c = conn();
        assert_eq!(c.quality(), 100);

        for _ in 0..LATENCY_WINDOW {
            c.record_latency(400_000); // 400 ms
        }
        assert_eq!(c.quality(), 70);

        c.rssi = Some(-92);
        assert_eq!(c.quality(), 46);
    }

    #[test]
    fn latency_window_is_bounded() {
        let mut c = conn();
        for i in 0..(LATENCY_WINDOW as i64 + 5) {
            c.record_latency(i * 1000);
        }
        // Only the last LATENCY_WINDOW samples (5..15 ms) are averaged.
        let avg = c.avg_latency_us().unwrap();
        assert_eq!(avg, (5..15).map(|i| i * 1000).sum::<i64>() / 10);
    }

    #[test]
    fn closing_rejects_enqueue() {
        let mut c = conn();
        c.begin_close();
        assert!(!c.enqueue("x\n".into(), Priority::Critical));
    }
}
