//! Routing over advertised subtrees.
//!
//! Routes are computed on demand by DFS over {local node} ∪ {each direct
//! connection's advertised subtree}; nothing is persisted. Broadcast
//! duplicates are suppressed by a bounded insertion-ordered LRU keyed
//! `(from, msgId)` with a TTL sweep on insert.

use crate::connection::Connection;
use crate::link::ConnId;
use crate::types::NodeId;
use std::collections::{HashMap, VecDeque};

// =============================================================================
// DEDUP CACHE
// =============================================================================

type DedupKey = (NodeId, u32);

/// Bounded dedup store: insertion-ordered eviction plus TTL expiry.
pub struct DedupCache {
    capacity: usize,
    ttl_ms: u64,
    entries: HashMap<DedupKey, u64>,
    order: VecDeque<(DedupKey, u64)>,
}

impl DedupCache {
    pub fn new(capacity: usize, ttl_ms: u64) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl_ms,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn sweep(&mut self, now_ms: u64) {
        while let Some(&(key, at)) = self.order.front() {
            if now_ms.saturating_sub(at) < self.ttl_ms {
                break;
            }
            self.order.pop_front();
            if self.entries.get(&key) == Some(&at) {
                self.entries.remove(&key);
            }
        }
    }

    /// Record a sighting. Returns true when the key was fresh (first time
    /// within the window) and false for a duplicate.
    pub fn insert(&mut self, key: DedupKey, now_ms: u64) -> bool {
        self.sweep(now_ms);
        if self.entries.contains_key(&key) {
            return false;
        }
        if self.entries.len() >= self.capacity {
            while let Some((old, at)) = self.order.pop_front() {
                if self.entries.get(&old) == Some(&at) {
                    self.entries.remove(&old);
                    break;
                }
            }
        }
        self.entries.insert(key, now_ms);
        self.order.push_back((key, now_ms));
        true
    }

    pub fn contains(&self, key: &DedupKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// ROUTER
// =============================================================================

/// Routing decisions over the current connection set. Owns no connections:
/// the protocol engine passes its live view per query.
pub struct Router {
    local_id: NodeId,
    dedup: DedupCache,
    next_msg_id: u32,
}

impl Router {
    pub fn new(local_id: NodeId, dedup_capacity: usize, dedup_ttl_ms: u64, msg_id_seed: u32) -> Self {
        Self {
            local_id,
            dedup: DedupCache::new(dedup_capacity, dedup_ttl_ms),
            next_msg_id: msg_id_seed,
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// Per-origin wrapping message counter for the envelope.
    pub fn next_msg_id(&mut self) -> u32 {
        let id = self.next_msg_id;
        self.next_msg_id = self.next_msg_id.wrapping_add(1);
        id
    }

    /// Full route `[self, …, dest]`, empty when unreachable.
    pub fn route_to<'a>(
        &self,
        dest: NodeId,
        conns: impl Iterator<Item = &'a Connection>,
    ) -> Vec<NodeId> {
        if dest == self.local_id {
            return vec![self.local_id];
        }
        for conn in conns {
            if !conn.is_established() {
                continue;
            }
            if let Some(subtree) = &conn.subtree {
                let tail = subtree.route_to(dest);
                if !tail.is_empty() {
                    let mut route = Vec::with_capacity(1 + tail.len());
                    route.push(self.local_id);
                    route.extend(tail);
                    return route;
                }
            }
        }
        Vec::new()
    }

    /// The connection whose subtree holds `dest`, for unicast forwarding.
    pub fn conn_for<'a>(
        &self,
        dest: NodeId,
        conns: impl Iterator<Item = &'a Connection>,
    ) -> Option<ConnId> {
        conns
            .filter(|c| c.is_established())
            .find(|c| c.subtree_contains(dest))
            .map(|c| c.conn)
    }

    /// Every established connection except the one rooted at `exclude`
    /// (0 excludes nothing).
    pub fn broadcast_targets<'a>(
        &self,
        exclude: NodeId,
        conns: impl Iterator<Item = &'a Connection>,
    ) -> Vec<ConnId> {
        conns
            .filter(|c| c.is_established())
            .filter(|c| exclude == 0 || c.peer_id != Some(exclude))
            .map(|c| c.conn)
            .collect()
    }

    /// Dedup gate: true exactly once per `(from, msgId)` within the window.
    pub fn first_sighting(&mut self, from: NodeId, msg_id: u32, now_ms: u64) -> bool {
        self.dedup.insert((from, msg_id), now_ms)
    }

    pub fn dedup_len(&self) -> usize {
        self.dedup.len()
    }
}
