//! Tree discovery and maintenance decisions.
//!
//! The topology engine owns the scan/join state machine: how often to scan,
//! which candidate to join, when a run of empty scans means the mesh moved
//! to another channel, and which peers are temporarily off-limits after
//! failures or cycle rejections. It is a passive decision-maker — the mesh
//! engine feeds it scan results and asks what to do next; all link
//! operations are issued by the caller.

use crate::link::{ScanCandidate, ScanScope};
use crate::types::NodeId;
use crate::wire::HandshakePayload;
use std::collections::HashMap;
use tracing::debug;

// =============================================================================
// RETRY BACKOFF
// =============================================================================

/// Initial delay after a failed connect attempt.
const INITIAL_RETRY_DELAY_MS: u64 = 10_000;

/// Ceiling on the exponential backoff.
const MAX_RETRY_DELAY_MS: u64 = 300_000;

const RETRY_BACKOFF_FACTOR: u64 = 2;

/// RSSI margin within which a previously healthy parent is preferred over
/// the strongest candidate.
const PARENT_STICKINESS_DBM: i16 = 6;

#[derive(Debug, Clone, Default)]
struct RetryInfo {
    attempts: u32,
    /// Do not retry before this instant.
    blocked_until_ms: u64,
    next_delay_ms: u64,
}

impl RetryInfo {
    fn record_failure(&mut self, now_ms: u64) {
        if self.next_delay_ms == 0 {
            self.next_delay_ms = INITIAL_RETRY_DELAY_MS;
        }
        self.attempts += 1;
        self.blocked_until_ms = now_ms.saturating_add(self.next_delay_ms);
        self.next_delay_ms = (self.next_delay_ms * RETRY_BACKOFF_FACTOR).min(MAX_RETRY_DELAY_MS);
    }

    fn block_for(&mut self, now_ms: u64, window_ms: u64) {
        self.attempts += 1;
        self.blocked_until_ms = self.blocked_until_ms.max(now_ms.saturating_add(window_ms));
    }

    fn eligible(&self, now_ms: u64) -> bool {
        now_ms >= self.blocked_until_ms
    }
}

// =============================================================================
// SCAN / JOIN STATE MACHINE
// =============================================================================

/// What the mesh engine should do after a scan completes.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    /// Nothing to do; keep the scan loop running.
    Idle,
    /// Dial this candidate as our uplink.
    Join(ScanCandidate),
    /// Too many empty scans: perform a full multi-channel scan.
    FullScan,
    /// The mesh lives on another channel: retune, restart the access
    /// endpoint, then join the candidate.
    SwitchChannel { channel: u8, join: ScanCandidate },
}

/// The engine's view of local connectivity when digesting a scan.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanContext<'a> {
    /// A station-side connection exists (we have a parent).
    pub has_uplink: bool,
    /// Any connection at all exists. Channel re-synchronization is only
    /// considered when a node is fully disconnected: retuning restarts
    /// the access endpoint and would orphan children.
    pub has_any_link: bool,
    /// Nodes already present in the local tree view; their endpoints are
    /// not join candidates.
    pub known_nodes: &'a [NodeId],
}

pub struct Topology {
    local_id: NodeId,
    mesh_prefix: String,
    channel: u8,
    fast_scan_ms: u64,
    slow_scan_ms: u64,
    empty_scan_threshold: u32,
    cycle_backoff_ms: u64,

    empty_scans: u32,
    /// Dial in flight: (driver target, advertised ssid). Backoff is keyed
    /// by ssid, which scans report; the target maps a failure back to it.
    connecting: Option<(String, String)>,
    backoff: HashMap<String, RetryInfo>,
    /// Last parent we had a healthy link to; preferred on RSSI near-ties.
    preferred_parent: Option<String>,
}

impl Topology {
    pub fn new(
        local_id: NodeId,
        mesh_prefix: String,
        channel: u8,
        fast_scan_ms: u64,
        slow_scan_ms: u64,
        empty_scan_threshold: u32,
        cycle_backoff_ms: u64,
    ) -> Self {
        Self {
            local_id,
            mesh_prefix,
            channel,
            fast_scan_ms,
            slow_scan_ms,
            empty_scan_threshold,
            cycle_backoff_ms,
            empty_scans: 0,
            connecting: None,
            backoff: HashMap::new(),
            preferred_parent: None,
        }
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn set_channel(&mut self, channel: u8) {
        self.channel = channel;
    }

    /// SSID this node's access endpoint advertises.
    pub fn local_ssid(&self) -> String {
        format!("{}-{}", self.mesh_prefix, self.local_id)
    }

    /// Scan period: fast while we have no uplink, slow once connected.
    pub fn scan_interval_ms(&self, has_uplink: bool) -> u64 {
        if has_uplink { self.slow_scan_ms } else { self.fast_scan_ms }
    }

    pub fn matches_prefix(&self, ssid: &str) -> bool {
        ssid.starts_with(self.mesh_prefix.as_str())
    }

    /// NodeId hint from a `<prefix>-<id>` network name.
    pub fn node_id_from_ssid(&self, ssid: &str) -> Option<NodeId> {
        ssid.strip_prefix(self.mesh_prefix.as_str())?
            .strip_prefix('-')?
            .parse()
            .ok()
    }

    // -------------------------------------------------------------------------
    // Scan handling
    // -------------------------------------------------------------------------

    /// Digest scan results and decide the next move.
    pub fn on_scan_results(
        &mut self,
        scope: ScanScope,
        candidates: &[ScanCandidate],
        ctx: ScanContext<'_>,
        now_ms: u64,
    ) -> ScanOutcome {
        if ctx.has_uplink || self.connecting.is_some() {
            // Stations keep exactly one uplink; scans while joined only
            // refresh neighbor awareness.
            self.empty_scans = 0;
            return ScanOutcome::Idle;
        }

        let eligible: Vec<&ScanCandidate> = candidates
            .iter()
            .filter(|c| self.matches_prefix(&c.ssid))
            .filter(|c| match self.node_id_from_ssid(&c.ssid) {
                // Skip ourselves and anything already in the tree.
                Some(id) => id != self.local_id && !ctx.known_nodes.contains(&id),
                None => true,
            })
            .filter(|c| {
                self.backoff
                    .get(&c.ssid)
                    .map(|b| b.eligible(now_ms))
                    .unwrap_or(true)
            })
            // A node with children stays on its channel; off-channel
            // candidates are only reachable through re-synchronization,
            // which requires being fully disconnected.
            .filter(|c| !ctx.has_any_link || c.channel == self.channel)
            .collect();

        if eligible.is_empty() {
            if matches!(scope, ScanScope::CurrentChannel(_)) && !ctx.has_any_link {
                self.empty_scans += 1;
                debug!(
                    target: "treemesh::topology",
                    empty = self.empty_scans,
                    "scan found no joinable mesh network"
                );
                if self.empty_scans >= self.empty_scan_threshold {
                    self.empty_scans = 0;
                    return ScanOutcome::FullScan;
                }
            }
            return ScanOutcome::Idle;
        }

        self.empty_scans = 0;
        let Some(pick) = self.pick_candidate(&eligible).cloned() else {
            return ScanOutcome::Idle;
        };

        if pick.channel != self.channel {
            return ScanOutcome::SwitchChannel { channel: pick.channel, join: pick };
        }
        ScanOutcome::Join(pick)
    }

    /// Strongest signal wins; a previously healthy parent within
    /// PARENT_STICKINESS_DBM of the best is taken instead.
    fn pick_candidate<'a>(&self, eligible: &[&'a ScanCandidate]) -> Option<&'a ScanCandidate> {
        let best = eligible
            .iter()
            .copied()
            .max_by(|a, b| a.rssi.cmp(&b.rssi).then_with(|| b.ssid.cmp(&a.ssid)))?;

        if let Some(parent) = &self.preferred_parent {
            if let Some(prev) = eligible.iter().copied().find(|c| &c.ssid == parent) {
                if prev.rssi >= best.rssi - PARENT_STICKINESS_DBM {
                    return Some(prev);
                }
            }
        }
        Some(best)
    }

    // -------------------------------------------------------------------------
    // Dial bookkeeping
    // -------------------------------------------------------------------------

    pub fn mark_connecting(&mut self, target: &str, ssid: &str) {
        self.connecting = Some((target.to_string(), ssid.to_string()));
    }

    pub fn is_connecting(&self) -> bool {
        self.connecting.is_some()
    }

    pub fn on_connect_failed(&mut self, target: &str, now_ms: u64) {
        let key = match self.connecting.take() {
            Some((t, ssid)) if t == target => ssid,
            other => {
                self.connecting = other;
                target.to_string()
            }
        };
        self.backoff.entry(key).or_default().record_failure(now_ms);
    }

    pub fn on_connect_established(&mut self) {
        self.connecting = None;
    }

    /// Uplink handshake completed; remember the parent and clear its
    /// backoff history.
    pub fn on_parent_joined(&mut self, ssid: &str) {
        self.backoff.remove(ssid);
        self.preferred_parent = Some(ssid.to_string());
    }

    /// A peer was rejected for advertising a cycle; keep away from it for
    /// the configured window.
    pub fn on_cycle_rejected(&mut self, ssid: &str, now_ms: u64) {
        let window = self.cycle_backoff_ms;
        self.backoff
            .entry(ssid.to_string())
            .or_default()
            .block_for(now_ms, window);
    }

    /// Periodic cleanup of expired backoff entries.
    pub fn sweep_backoff(&mut self, now_ms: u64) {
        self.backoff
            .retain(|_, info| !info.eligible(now_ms) || info.attempts == 0);
    }

    // -------------------------------------------------------------------------
    // Handshake validation
    // -------------------------------------------------------------------------

    /// The single acyclicity gate: reject self-dials and any peer whose
    /// advertised subtree already contains this node.
    pub fn validate_handshake(&self, payload: &HandshakePayload) -> Result<(), HandshakeReject> {
        if payload.node_id == self.local_id {
            return Err(HandshakeReject::SelfLoop);
        }
        if payload.subtree.contains(self.local_id) {
            return Err(HandshakeReject::Cycle);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeReject {
    SelfLoop,
    Cycle,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SubtreeDescriptor;

    fn topo() -> Topology {
        Topology::new(1000, "mesh".into(), 1, 15_000, 30_000, 6, 60_000)
    }

    fn solo() -> ScanContext<'static> {
        ScanContext { has_uplink: false, has_any_link: false, known_nodes: &[] }
    }

    fn joined() -> ScanContext<'static> {
        ScanContext { has_uplink: true, has_any_link: true, known_nodes: &[] }
    }

    fn cand(ssid: &str, rssi: i16, channel: u8) -> ScanCandidate {
        ScanCandidate {
            ssid: ssid.into(),
            rssi,
            channel,
            target: ssid.into(),
        }
    }

    #[test]
    fn scan_interval_adapts() {
        let t = topo();
        assert_eq!(t.scan_interval_ms(false), 15_000);
        assert_eq!(t.scan_interval_ms(true), 30_000);
    }

    #[test]
    fn joins_strongest_matching_candidate() {
        let mut t = topo();
        let scans = vec![
            cand("mesh-2000", -70, 1),
            cand("mesh-3000", -50, 1),
            cand("othernet", -10, 1),
        ];
        match t.on_scan_results(ScanScope::CurrentChannel(1), &scans, solo(), 0) {
            ScanOutcome::Join(c) => assert_eq!(c.ssid, "mesh-3000"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn own_ssid_is_not_a_candidate() {
        let mut t = topo();
        let scans = vec![cand("mesh-1000", -40, 1)];
        assert_eq!(
            t.on_scan_results(ScanScope::CurrentChannel(1), &scans, solo(), 0),
            ScanOutcome::Idle
        );
    }

    #[test]
    fn empty_scans_escalate_to_full_scan() {
        let mut t = topo();
        for i in 0..5 {
            assert_eq!(
                t.on_scan_results(ScanScope::CurrentChannel(1), &[], solo(), i),
                ScanOutcome::Idle
            );
        }
        assert_eq!(
            t.on_scan_results(ScanScope::CurrentChannel(1), &[], solo(), 5),
            ScanOutcome::FullScan
        );
        // Counter reset after escalation.
        assert_eq!(
            t.on_scan_results(ScanScope::CurrentChannel(1), &[], solo(), 6),
            ScanOutcome::Idle
        );
    }

    #[test]
    fn full_scan_on_other_channel_switches() {
        let mut t = topo();
        let scans = vec![cand("mesh-2000", -40, 6)];
        match t.on_scan_results(ScanScope::AllChannels, &scans, solo(), 0) {
            ScanOutcome::SwitchChannel { channel, join } => {
                assert_eq!(channel, 6);
                assert_eq!(join.ssid, "mesh-2000");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn connected_station_does_not_rejoin() {
        let mut t = topo();
        let scans = vec![cand("mesh-2000", -40, 1)];
        assert_eq!(
            t.on_scan_results(ScanScope::CurrentChannel(1), &scans, joined(), 0),
            ScanOutcome::Idle
        );
    }

    #[test]
    fn cycle_backoff_excludes_candidate_until_window_passes() {
        let mut t = topo();
        t.on_cycle_rejected("mesh-2000", 0);
        let scans = vec![cand("mesh-2000", -40, 1)];
        assert_eq!(
            t.on_scan_results(ScanScope::CurrentChannel(1), &scans, solo(), 1_000),
            ScanOutcome::Idle
        );
        match t.on_scan_results(ScanScope::CurrentChannel(1), &scans, solo(), 60_001) {
            ScanOutcome::Join(c) => assert_eq!(c.ssid, "mesh-2000"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn connect_failure_backs_off_exponentially() {
        let mut t = topo();
        t.mark_connecting("mesh-2000", "mesh-2000");
        t.on_connect_failed("mesh-2000", 0);
        let scans = vec![cand("mesh-2000", -40, 1)];
        // Blocked for the initial 10 s delay.
        assert_eq!(
            t.on_scan_results(ScanScope::CurrentChannel(1), &scans, solo(), 5_000),
            ScanOutcome::Idle
        );
        assert!(matches!(
            t.on_scan_results(ScanScope::CurrentChannel(1), &scans, solo(), 10_000),
            ScanOutcome::Join(_)
        ));
        // Second failure doubles the delay.
        t.on_connect_failed("mesh-2000", 10_000);
        assert_eq!(
            t.on_scan_results(ScanScope::CurrentChannel(1), &scans, solo(), 25_000),
            ScanOutcome::Idle
        );
        assert!(matches!(
            t.on_scan_results(ScanScope::CurrentChannel(1), &scans, solo(), 30_000),
            ScanOutcome::Join(_)
        ));
    }

    #[test]
    fn nodes_already_in_tree_are_not_candidates() {
        let mut t = topo();
        let known: &[NodeId] = &[2000];
        let ctx = ScanContext { has_uplink: false, has_any_link: true, known_nodes: known };
        let scans = vec![cand("mesh-2000", -40, 1), cand("mesh-3000", -60, 1)];
        match t.on_scan_results(ScanScope::CurrentChannel(1), &scans, ctx, 0) {
            ScanOutcome::Join(c) => assert_eq!(c.ssid, "mesh-3000"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn connected_node_ignores_off_channel_candidates_and_never_escalates() {
        let mut t = topo();
        let ctx = ScanContext { has_uplink: false, has_any_link: true, known_nodes: &[] };
        let scans = vec![cand("mesh-2000", -40, 6)];
        assert_eq!(
            t.on_scan_results(ScanScope::CurrentChannel(1), &scans, ctx, 0),
            ScanOutcome::Idle
        );
        // Empty scans with a live link never trigger a full scan.
        for i in 0..20 {
            assert_eq!(
                t.on_scan_results(ScanScope::CurrentChannel(1), &[], ctx, i),
                ScanOutcome::Idle
            );
        }
    }

    #[test]
    fn previously_healthy_parent_preferred_on_near_tie() {
        let mut t = topo();
        t.on_parent_joined("mesh-2000");
        let scans = vec![cand("mesh-2000", -55, 1), cand("mesh-3000", -50, 1)];
        match t.on_scan_results(ScanScope::CurrentChannel(1), &scans, solo(), 0) {
            ScanOutcome::Join(c) => assert_eq!(c.ssid, "mesh-2000"),
            other => panic!("unexpected {other:?}"),
        }
        // Outside the stickiness margin the stronger one wins.
        let scans = vec![cand("mesh-2000", -60, 1), cand("mesh-3000", -50, 1)];
        match t.on_scan_results(ScanScope::CurrentChannel(1), &scans, solo(), 0) {
            ScanOutcome::Join(c) => assert_eq!(c.ssid, "mesh-3000"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn handshake_rejects_self_and_cycles() {
        let t = topo();
        let mut hs = HandshakePayload {
            node_id: 1000,
            subtree: SubtreeDescriptor::leaf(1000),
            capabilities: 0,
            mesh_time_estimate: 0,
        };
        assert_eq!(t.validate_handshake(&hs), Err(HandshakeReject::SelfLoop));

        hs.node_id = 2000;
        hs.subtree = SubtreeDescriptor {
            root: 2000,
            children: vec![SubtreeDescriptor::leaf(1000)],
        };
        assert_eq!(t.validate_handshake(&hs), Err(HandshakeReject::Cycle));

        hs.subtree = SubtreeDescriptor::leaf(2000);
        assert!(t.validate_handshake(&hs).is_ok());
    }
}
