// Treemesh Network Layer — Constants and Types
// Distributed under the MIT software license.

//! Core identifiers, protocol constants, and the subtree data model.
//!
//! # Design Goals
//!
//! 1. **Bounded memory usage** — every collection the protocol keeps
//!    (dedup cache, latency ring, bridge table, outbound FIFO) has an
//!    explicit size limit declared here or next to its owner.
//!
//! 2. **Acyclic overlay** — the mesh is a rooted tree. `SubtreeDescriptor`
//!    is the unit of topology exchange; `contains()` is the single check
//!    that keeps the overlay loop-free (see topology handshake rules).
//!
//! 3. **On-demand routing** — no routing tables are persisted. A route is
//!    a DFS over the latest advertised subtrees, recomputed per send.

use serde::{Deserialize, Serialize};

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Node identifier, unique per running node within a mesh instance.
pub type NodeId = u32;

/// Reserved destination meaning "broadcast" in send APIs and envelopes.
pub const BROADCAST_NODE: NodeId = 0;

/// Logical mesh time in microseconds (signed: offsets can be negative).
pub type MeshTimeMicros = i64;

// =============================================================================
// PROTOCOL IDENTIFICATION
// =============================================================================

/// Protocol version advertised in the handshake.
/// Peers with a different major version are dropped at handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum wire line length including the trailing LF.
/// A peer exceeding this is closed with reason `Oversize`.
pub const MAX_LINE_BYTES: usize = 8 * 1024;

// =============================================================================
// MESSAGE TYPE CODES
// =============================================================================
// Codes 1–99 are internal protocol types. 100+ are plugin codes routed to
// the application callback unless a handler claims them.

pub const TYPE_HANDSHAKE: u16 = 1;
pub const TYPE_TIME_SYNC_REQUEST: u16 = 3;
pub const TYPE_TIME_SYNC_REPLY: u16 = 4;
pub const TYPE_NODE_SYNC_REQUEST: u16 = 5;
pub const TYPE_NODE_SYNC_REPLY: u16 = 6;

/// First code available to plugins and applications.
pub const FIRST_PLUGIN_TYPE: u16 = 100;

pub const TYPE_BRIDGE_STATUS: u16 = 610;
pub const TYPE_BRIDGE_ELECTION: u16 = 611;
pub const TYPE_BRIDGE_TAKEOVER: u16 = 612;
pub const TYPE_BRIDGE_COORDINATION: u16 = 613;
pub const TYPE_NTP_TIME: u16 = 614;

/// Shared-gateway relay codes. Reserved and routable; the gateway payload
/// processors themselves live outside this crate.
pub const TYPE_GATEWAY_RELAY_REQUEST: u16 = 620;
pub const TYPE_GATEWAY_RELAY_RESPONSE: u16 = 621;
pub const TYPE_GATEWAY_RELAY_NOTIFY: u16 = 622;

// =============================================================================
// CAPABILITY FLAGS
// =============================================================================
// Advertised in the handshake to indicate node roles.

/// Node has router credentials configured and can assume the bridge role.
pub const CAP_BRIDGE: u64 = 1 << 0;

/// Node is willing to act as a time reference if it becomes tree root.
pub const CAP_TIME_SOURCE: u64 = 1 << 1;

/// Node keeps a persistent offline queue.
pub const CAP_QUEUE: u64 = 1 << 2;

// =============================================================================
// ROUTING
// =============================================================================

/// Routing discipline carried in every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routing {
    /// Source-routed to a single destination; intermediates recompute.
    Single,
    /// Direct neighbour only; never forwarded.
    Neighbour,
    /// Flooded down the tree with dedup suppression.
    Broadcast,
}

impl Routing {
    pub fn as_u8(self) -> u8 {
        match self {
            Routing::Single => 0,
            Routing::Neighbour => 1,
            Routing::Broadcast => 2,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Routing::Single),
            1 => Some(Routing::Neighbour),
            2 => Some(Routing::Broadcast),
            _ => None,
        }
    }
}

// =============================================================================
// PRIORITY
// =============================================================================

/// Message priority, used by the offline queue's eviction lattice and by
/// the per-connection outbound FIFO under backpressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

impl Priority {
    /// Evictable classes for a new entry of this priority, lowest first.
    /// CRITICAL never appears: it is never evicted by another enqueue.
    pub fn evicts(self) -> &'static [Priority] {
        match self {
            Priority::Critical => &[Priority::Low, Priority::Normal, Priority::High],
            Priority::High => &[Priority::Low, Priority::Normal],
            Priority::Normal => &[Priority::Low],
            Priority::Low => &[],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

// =============================================================================
// CLOSE REASONS
// =============================================================================

/// Why a connection was (or is being) closed. Carried on the drop path and
/// surfaced in logs and the `on_dropped` callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Inbound line exceeded MAX_LINE_BYTES.
    Oversize,
    /// Peer handshake did not arrive within the configured window.
    HandshakeTimeout,
    /// Peer advertised our own NodeId.
    SelfLoop,
    /// Peer's advertised subtree contains our NodeId.
    CycleDetected,
    /// A newer connection from the same NodeId replaced this one.
    Replaced,
    /// Underlying transport failed or the peer went away.
    TransportError,
    /// Local shutdown.
    Shutdown,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::Oversize => "oversize",
            CloseReason::HandshakeTimeout => "handshake_timeout",
            CloseReason::SelfLoop => "self_loop",
            CloseReason::CycleDetected => "cycle_detected",
            CloseReason::Replaced => "replaced",
            CloseReason::TransportError => "transport_error",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

// =============================================================================
// SUBTREE DESCRIPTOR
// =============================================================================

/// Recursive topology advertisement: a peer's own NodeId plus the subtrees
/// of each of its other connections.
///
/// Every peer advertises one of these in HANDSHAKE and NODE_SYNC messages.
/// All routing and broadcast-suppression decisions are made against the
/// latest advertised copies; nothing here is authoritative beyond the moment
/// it was received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtreeDescriptor {
    pub root: NodeId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<SubtreeDescriptor>,
}

impl SubtreeDescriptor {
    pub fn leaf(root: NodeId) -> Self {
        Self { root, children: Vec::new() }
    }

    /// Total number of nodes in this subtree, itself included.
    pub fn size(&self) -> usize {
        1 + self.children.iter().map(|c| c.size()).sum::<usize>()
    }

    /// Whether `id` appears anywhere in this subtree.
    pub fn contains(&self, id: NodeId) -> bool {
        self.root == id || self.children.iter().any(|c| c.contains(id))
    }

    /// DFS path from this subtree's root down to `dest`, inclusive.
    /// Empty when `dest` is not present.
    pub fn route_to(&self, dest: NodeId) -> Vec<NodeId> {
        if self.root == dest {
            return vec![self.root];
        }
        for child in &self.children {
            let tail = child.route_to(dest);
            if !tail.is_empty() {
                let mut route = Vec::with_capacity(1 + tail.len());
                route.push(self.root);
                route.extend(tail);
                return route;
            }
        }
        Vec::new()
    }

    /// All NodeIds in this subtree, pre-order.
    pub fn flatten(&self) -> Vec<NodeId> {
        let mut out = Vec::with_capacity(self.size());
        self.collect_into(&mut out);
        out
    }

    fn collect_into(&self, out: &mut Vec<NodeId>) {
        out.push(self.root);
        for child in &self.children {
            child.collect_into(out);
        }
    }
}

// =============================================================================
// TIME HELPERS
// =============================================================================

/// Wall-clock seconds since the Unix epoch. Used only for bridge status
/// timestamps and the NTP anchor; mesh time is the logical clock.
pub fn unix_time_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> SubtreeDescriptor {
        // 2 — 3 — 4, with 5 as a second child of 2
        SubtreeDescriptor {
            root: 2,
            children: vec![
                SubtreeDescriptor {
                    root: 3,
                    children: vec![SubtreeDescriptor::leaf(4)],
                },
                SubtreeDescriptor::leaf(5),
            ],
        }
    }

    #[test]
    fn subtree_size_and_contains() {
        let t = chain();
        assert_eq!(t.size(), 4);
        assert!(t.contains(2));
        assert!(t.contains(4));
        assert!(t.contains(5));
        assert!(!t.contains(9));
    }

    #[test]
    fn subtree_route() {
        let t = chain();
        assert_eq!(t.route_to(4), vec![2, 3, 4]);
        assert_eq!(t.route_to(5), vec![2, 5]);
        assert_eq!(t.route_to(2), vec![2]);
        assert!(t.route_to(7).is_empty());
    }

    #[test]
    fn routing_codes_round_trip() {
        for r in [Routing::Single, Routing::Neighbour, Routing::Broadcast] {
            assert_eq!(Routing::from_u8(r.as_u8()), Some(r));
        }
        assert_eq!(Routing::from_u8(3), None);
    }

    #[test]
    fn priority_eviction_lattice() {
        assert_eq!(
            Priority::Critical.evicts(),
            &[Priority::Low, Priority::Normal, Priority::High]
        );
        assert_eq!(Priority::High.evicts(), &[Priority::Low, Priority::Normal]);
        assert_eq!(Priority::Normal.evicts(), &[Priority::Low]);
        assert!(Priority::Low.evicts().is_empty());
    }
}
