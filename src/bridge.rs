//! Bridge coordination: uplink health, election, failover, multi-bridge.
//!
//! A bridge is a mesh node with an external uplink. Non-bridge nodes track
//! bridge health from BRIDGE_STATUS broadcasts; when the mesh loses its
//! bridge, credential-holding nodes elect a replacement with a
//! deterministic comparator so every node computes the same winner from
//! the same candidate set.
//!
//! ```text
//! Role Transitions:
//!
//! ┌──────┐ status silence > timeout  ┌───────────┐ window closes, won ┌───────────┐
//! │ None │──────────────────────────►│ Candidate │───────────────────►│ Promoting │
//! └──────┘  (credentials + failover) └─────┬─────┘                    └─────┬─────┘
//!    ▲                                     │ lost / takeover seen           │
//!    │◄────────────────────────────────────┘                                │
//!    │                 association failed                                   │
//!    │◄─────────────────────────────────────────────────────────────────────┤
//!    │                                                         assoc ok     ▼
//!    │          demotion / shutdown                       ┌──────────────────┐
//!    └────────────────────────────────────────────────────│   BridgeActive   │
//!                                                         └──────────────────┘
//! ```
//!
//! A node may not change bridge role more than once per
//! ROLE_CHANGE_COOLDOWN; re-election inside the window defers to the
//! current primary.

use crate::config::{BridgeConfig, BridgeStrategy};
use crate::types::NodeId;
use crate::wire::{
    BridgeCoordinationPayload, BridgeElectionPayload, BridgeStatusPayload, BridgeTakeoverPayload,
};
use tracing::{debug, info};

// =============================================================================
// CONSTANTS
// =============================================================================

/// Minimum spacing between role changes (rapid-switch suppression).
pub const ROLE_CHANGE_COOLDOWN_MS: u64 = 60_000;

/// A bridge is healthy when seen within this window and internet-connected.
pub const BRIDGE_HEALTH_WINDOW_MS: u64 = 60_000;

// =============================================================================
// TRACKED BRIDGES
// =============================================================================

/// Multi-bridge role advertised in coordination messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeRank {
    Primary,
    Secondary,
    Standby,
}

impl BridgeRank {
    pub fn as_str(self) -> &'static str {
        match self {
            BridgeRank::Primary => "primary",
            BridgeRank::Secondary => "secondary",
            BridgeRank::Standby => "standby",
        }
    }

    pub fn parse(s: &str) -> BridgeRank {
        match s {
            "primary" => BridgeRank::Primary,
            "secondary" => BridgeRank::Secondary,
            _ => BridgeRank::Standby,
        }
    }
}

/// Cached remote advertisement for one known bridge. Never owns a
/// connection; routing to a bridge goes through the router like any node.
#[derive(Debug, Clone)]
pub struct BridgeInfo {
    pub node_id: NodeId,
    pub router_rssi: i16,
    pub router_channel: u8,
    pub internet_connected: bool,
    pub uptime: u64,
    pub free_memory: u64,
    pub last_seen_ms: u64,
    pub priority: u8,
    pub rank: BridgeRank,
    pub load_pct: u8,
    pub peer_bridge_ids: Vec<NodeId>,
}

impl BridgeInfo {
    pub fn is_healthy(&self, now_ms: u64) -> bool {
        self.internet_connected
            && now_ms.saturating_sub(self.last_seen_ms) <= BRIDGE_HEALTH_WINDOW_MS
    }
}

// =============================================================================
// ELECTION
// =============================================================================

#[derive(Debug, Clone)]
pub struct ElectionCandidate {
    pub node_id: NodeId,
    pub router_rssi: i16,
    pub uptime: u64,
    pub free_memory: u64,
}

/// Deterministic winner: best router RSSI, ties by uptime, then free
/// memory, then lowest NodeId. Candidates that cannot see the router
/// (rssi == 0) are ineligible.
pub fn election_winner(candidates: &[ElectionCandidate]) -> Option<NodeId> {
    candidates
        .iter()
        .filter(|c| c.router_rssi != 0)
        .max_by(|a, b| {
            a.router_rssi
                .cmp(&b.router_rssi)
                .then(a.uptime.cmp(&b.uptime))
                .then(a.free_memory.cmp(&b.free_memory))
                .then(b.node_id.cmp(&a.node_id))
        })
        .map(|c| c.node_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeRole {
    None,
    Candidate,
    Promoting,
    BridgeActive,
}

/// What the protocol engine should do after feeding the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeDirective {
    /// Broadcast our candidacy and schedule the window close.
    OpenElection(BridgeElectionPayload),
    /// We won: attempt router association within the promotion window.
    BeginPromotion,
    /// Somebody's internet reachability changed; fire the status callback
    /// (and flush the queue when it came up).
    StatusChanged { bridge: NodeId, has_internet: bool },
}

/// Local observations fed by the host: what the node itself can see of the
/// upstream router and its own vitals.
#[derive(Debug, Clone, Default)]
pub struct LocalObservation {
    pub router_rssi: i16,
    pub router_channel: u8,
    pub uptime_secs: u64,
    pub free_memory: u64,
    pub gateway_ip: String,
}

// =============================================================================
// COORDINATOR
// =============================================================================

pub struct BridgeCoordinator {
    cfg: BridgeConfig,
    local_id: NodeId,
    bridge_capable: bool,
    role: BridgeRole,
    observation: LocalObservation,
    internet_connected: bool,
    active_since_ms: Option<u64>,

    bridges: Vec<BridgeInfo>,
    /// Last BRIDGE_STATUS heard from anyone (including ourselves when
    /// active); silence beyond the timeout triggers candidacy.
    last_status_ms: Option<u64>,
    last_role_change_ms: Option<u64>,

    election_open: bool,
    candidates: Vec<ElectionCandidate>,
    /// Previous primary, for the takeover announcement.
    known_primary: Option<NodeId>,

    round_robin_cursor: usize,
}

impl BridgeCoordinator {
    pub fn new(local_id: NodeId, cfg: BridgeConfig, bridge_capable: bool) -> Self {
        Self {
            cfg,
            local_id,
            bridge_capable,
            role: BridgeRole::None,
            observation: LocalObservation::default(),
            internet_connected: false,
            active_since_ms: None,
            bridges: Vec::new(),
            last_status_ms: None,
            last_role_change_ms: None,
            election_open: false,
            candidates: Vec::new(),
            known_primary: None,
            round_robin_cursor: 0,
        }
    }

    pub fn role(&self) -> BridgeRole {
        self.role
    }

    pub fn is_active(&self) -> bool {
        self.role == BridgeRole::BridgeActive
    }

    pub fn known_bridges(&self) -> &[BridgeInfo] {
        &self.bridges
    }

    pub fn set_observation(&mut self, obs: LocalObservation) {
        self.observation = obs;
    }

    pub fn observation(&self) -> &LocalObservation {
        &self.observation
    }

    fn can_change_role(&self, now_ms: u64) -> bool {
        self.last_role_change_ms
            .map(|at| now_ms.saturating_sub(at) >= ROLE_CHANGE_COOLDOWN_MS)
            .unwrap_or(true)
    }

    // -------------------------------------------------------------------------
    // Remote message intake
    // -------------------------------------------------------------------------

    /// Track a BRIDGE_STATUS broadcast.
    pub fn on_status(
        &mut self,
        from: NodeId,
        p: &BridgeStatusPayload,
        now_ms: u64,
    ) -> Option<BridgeDirective> {
        self.last_status_ms = Some(now_ms);
        if self.known_primary.is_none() {
            self.known_primary = Some(from);
        }

        let prev_internet = self.find(from).map(|b| b.internet_connected);
        self.upsert(BridgeInfo {
            node_id: from,
            router_rssi: p.router_rssi,
            router_channel: p.router_channel,
            internet_connected: p.internet_connected,
            uptime: p.uptime,
            free_memory: 0,
            last_seen_ms: now_ms,
            priority: 0,
            rank: BridgeRank::Primary,
            load_pct: 0,
            peer_bridge_ids: Vec::new(),
        });

        if prev_internet != Some(p.internet_connected) {
            return Some(BridgeDirective::StatusChanged {
                bridge: from,
                has_internet: p.internet_connected,
            });
        }
        None
    }

    /// Track a BRIDGE_COORDINATION broadcast (multi-bridge mode).
    pub fn on_coordination(&mut self, from: NodeId, p: &BridgeCoordinationPayload, now_ms: u64) {
        if !self.cfg.multi_bridge.enabled {
            return;
        }
        self.last_status_ms = Some(now_ms);
        let existing = self.find(from).cloned();
        self.upsert(BridgeInfo {
            node_id: from,
            router_rssi: existing.as_ref().map(|b| b.router_rssi).unwrap_or(0),
            router_channel: existing.as_ref().map(|b| b.router_channel).unwrap_or(0),
            internet_connected: existing.map(|b| b.internet_connected).unwrap_or(true),
            uptime: 0,
            free_memory: 0,
            last_seen_ms: now_ms,
            priority: p.priority,
            rank: BridgeRank::parse(&p.role),
            load_pct: p.load,
            peer_bridge_ids: p.peer_bridges.clone(),
        });
    }

    /// A peer's candidacy. Joins the local election when one is open;
    /// otherwise opens ours so all capable nodes score the same set.
    pub fn on_election_msg(
        &mut self,
        from: NodeId,
        p: &BridgeElectionPayload,
        now_ms: u64,
    ) -> Option<BridgeDirective> {
        let candidate = ElectionCandidate {
            node_id: from,
            router_rssi: p.router_rssi,
            uptime: p.uptime,
            free_memory: p.free_memory,
        };
        if self.election_open {
            if !self.candidates.iter().any(|c| c.node_id == from) {
                self.candidates.push(candidate);
            }
            return None;
        }
        // Rapid-switch suppression: defer to the current primary inside
        // the cooldown window.
        if self.role == BridgeRole::None
            && self.bridge_capable
            && self.cfg.failover_enabled
            && self.can_change_role(now_ms)
        {
            let directive = self.open_election(now_ms);
            self.candidates.push(candidate);
            return Some(directive);
        }
        None
    }

    /// A new bridge announced itself; abandon any local ambitions.
    pub fn on_takeover(&mut self, from: NodeId, p: &BridgeTakeoverPayload, now_ms: u64) {
        debug!(
            target: "treemesh::bridge",
            from,
            previous = p.previous_bridge,
            reason = %p.reason,
            "bridge takeover observed"
        );
        self.last_status_ms = Some(now_ms);
        self.known_primary = Some(from);
        if from != self.local_id
            && matches!(self.role, BridgeRole::Candidate | BridgeRole::Promoting)
        {
            self.role = BridgeRole::None;
            self.election_open = false;
            self.candidates.clear();
        }
    }

    // -------------------------------------------------------------------------
    // Election lifecycle
    // -------------------------------------------------------------------------

    /// Periodic health check: start an election when no bridge status has
    /// been heard for the timeout. The first check after startup arms the
    /// silence clock instead of electing immediately.
    pub fn check_bridge_timeout(&mut self, now_ms: u64) -> Option<BridgeDirective> {
        if self.role != BridgeRole::None || !self.bridge_capable || !self.cfg.failover_enabled {
            return None;
        }
        match self.last_status_ms {
            None => {
                self.last_status_ms = Some(now_ms);
                None
            }
            Some(at) if now_ms.saturating_sub(at) >= self.cfg.bridge_timeout_ms => {
                if !self.can_change_role(now_ms) {
                    return None;
                }
                info!(
                    target: "treemesh::bridge",
                    silence_ms = now_ms.saturating_sub(at),
                    "bridge lost, standing for election"
                );
                Some(self.open_election(now_ms))
            }
            Some(_) => None,
        }
    }

    fn open_election(&mut self, now_ms: u64) -> BridgeDirective {
        self.role = BridgeRole::Candidate;
        self.election_open = true;
        self.candidates = vec![ElectionCandidate {
            node_id: self.local_id,
            router_rssi: self.observation.router_rssi,
            uptime: self.observation.uptime_secs,
            free_memory: self.observation.free_memory,
        }];
        BridgeDirective::OpenElection(BridgeElectionPayload {
            router_rssi: self.observation.router_rssi,
            uptime: self.observation.uptime_secs,
            free_memory: self.observation.free_memory,
            timestamp: now_ms,
            router_ssid: self.cfg.router_ssid.clone(),
        })
    }

    /// Close the election window and score the collected set.
    pub fn close_election(&mut self, _now_ms: u64) -> Option<BridgeDirective> {
        if !self.election_open {
            return None;
        }
        self.election_open = false;
        let winner = election_winner(&self.candidates);
        let was_sole = self.candidates.len() == 1;
        self.candidates.clear();
        match winner {
            Some(id) if id == self.local_id => {
                info!(target: "treemesh::bridge", "won bridge election, promoting");
                self.role = BridgeRole::Promoting;
                Some(BridgeDirective::BeginPromotion)
            }
            Some(id) => {
                debug!(target: "treemesh::bridge", winner = id, "lost bridge election");
                self.role = BridgeRole::None;
                None
            }
            None => {
                // Nobody could see the router (all rssi == 0).
                debug!(
                    target: "treemesh::bridge",
                    sole = was_sole,
                    "election produced no eligible winner"
                );
                self.role = BridgeRole::None;
                None
            }
        }
    }

    /// Router association succeeded; assume the bridge role.
    /// Returns the takeover announcement (the caller broadcasts it on the
    /// current channel, and again after any channel switch).
    pub fn promotion_succeeded(&mut self, now_ms: u64) -> BridgeTakeoverPayload {
        let previous = self.known_primary.filter(|&p| p != self.local_id).unwrap_or(0);
        self.role = BridgeRole::BridgeActive;
        self.internet_connected = true;
        self.active_since_ms = Some(now_ms);
        self.last_role_change_ms = Some(now_ms);
        self.last_status_ms = Some(now_ms);
        self.known_primary = Some(self.local_id);
        info!(target: "treemesh::bridge", previous, "assumed bridge role");
        BridgeTakeoverPayload {
            previous_bridge: previous,
            reason: "election".to_string(),
            router_rssi: self.observation.router_rssi,
            timestamp: now_ms,
        }
    }

    /// Router association failed inside the promotion window. The caller
    /// surfaces `bridge_promotion_failed`; there is no automatic restart.
    pub fn promotion_failed(&mut self, now_ms: u64) {
        self.role = BridgeRole::None;
        self.last_role_change_ms = Some(now_ms);
    }

    /// Voluntary or upstream-forced demotion while active.
    pub fn demote(&mut self, now_ms: u64) {
        if self.role == BridgeRole::BridgeActive {
            self.role = BridgeRole::None;
            self.internet_connected = false;
            self.active_since_ms = None;
            self.last_role_change_ms = Some(now_ms);
        }
    }

    pub fn set_internet_connected(&mut self, up: bool) {
        self.internet_connected = up;
    }

    // -------------------------------------------------------------------------
    // Own broadcasts while active
    // -------------------------------------------------------------------------

    pub fn make_status(&mut self, now_ms: u64) -> BridgeStatusPayload {
        self.last_status_ms = Some(now_ms);
        BridgeStatusPayload {
            internet_connected: self.internet_connected,
            router_rssi: self.observation.router_rssi,
            router_channel: self.observation.router_channel,
            uptime: self
                .active_since_ms
                .map(|at| now_ms.saturating_sub(at) / 1000)
                .unwrap_or(0),
            gateway_ip: self.observation.gateway_ip.clone(),
            timestamp: now_ms,
        }
    }

    pub fn make_coordination(&self, load_pct: u8, now_ms: u64) -> BridgeCoordinationPayload {
        BridgeCoordinationPayload {
            priority: self.cfg.priority,
            role: self.local_rank(now_ms).as_str().to_string(),
            load: load_pct,
            peer_bridges: self.bridges.iter().map(|b| b.node_id).collect(),
            timestamp: now_ms,
        }
    }

    /// Our rank among healthy bridges: primary unless a healthy peer
    /// advertises a higher priority (ties go to the lower NodeId).
    fn local_rank(&self, now_ms: u64) -> BridgeRank {
        if !self.is_active() {
            return BridgeRank::Standby;
        }
        let outranked = self.bridges.iter().filter(|b| b.is_healthy(now_ms)).any(|b| {
            b.priority > self.cfg.priority
                || (b.priority == self.cfg.priority && b.node_id < self.local_id)
        });
        if outranked { BridgeRank::Secondary } else { BridgeRank::Primary }
    }

    // -------------------------------------------------------------------------
    // Bridge table
    // -------------------------------------------------------------------------

    fn find(&self, id: NodeId) -> Option<&BridgeInfo> {
        self.bridges.iter().find(|b| b.node_id == id)
    }

    fn upsert(&mut self, info: BridgeInfo) {
        if let Some(existing) = self.bridges.iter_mut().find(|b| b.node_id == info.node_id) {
            *existing = info;
            return;
        }
        self.bridges.push(info);
        let ceiling = self.cfg.multi_bridge.max_bridges.max(1);
        while self.bridges.len() > ceiling {
            // Oldest-seen entry over the ceiling goes first.
            let Some(oldest) = self
                .bridges
                .iter()
                .enumerate()
                .min_by_key(|(_, b)| b.last_seen_ms)
                .map(|(i, _)| i)
            else {
                break;
            };
            let evicted = self.bridges.remove(oldest);
            debug!(
                target: "treemesh::bridge",
                evicted = evicted.node_id,
                "bridge table over ceiling"
            );
        }
    }

    pub fn healthy_bridges(&self, now_ms: u64) -> Vec<&BridgeInfo> {
        self.bridges.iter().filter(|b| b.is_healthy(now_ms)).collect()
    }

    /// Whether `id` is currently tracked as a bridge (gates NTP intake).
    pub fn is_known_bridge(&self, id: NodeId) -> bool {
        self.find(id).is_some() || self.known_primary == Some(id)
    }

    /// Preferred bridge for application traffic, by configured strategy.
    pub fn preferred_bridge(&mut self, now_ms: u64) -> Option<NodeId> {
        let mut healthy: Vec<&BridgeInfo> = self
            .bridges
            .iter()
            .filter(|b| b.is_healthy(now_ms))
            .collect();
        if healthy.is_empty() {
            return None;
        }
        healthy.sort_by_key(|b| b.node_id);
        match self.cfg.multi_bridge.strategy {
            BridgeStrategy::PriorityBased => healthy
                .iter()
                .max_by(|a, b| {
                    a.priority
                        .cmp(&b.priority)
                        .then(b.node_id.cmp(&a.node_id))
                })
                .map(|b| b.node_id),
            BridgeStrategy::BestSignal => healthy
                .iter()
                .max_by(|a, b| {
                    a.router_rssi
                        .cmp(&b.router_rssi)
                        .then(b.node_id.cmp(&a.node_id))
                })
                .map(|b| b.node_id),
            BridgeStrategy::RoundRobin => {
                let pick = healthy[self.round_robin_cursor % healthy.len()].node_id;
                self.round_robin_cursor = self.round_robin_cursor.wrapping_add(1);
                Some(pick)
            }
        }
    }
}
