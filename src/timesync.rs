//! Mesh-wide logical time.
//!
//! Every node keeps `offset` (mesh time − local monotonic) and a drift
//! estimate in ppm. Leaves pull time from their parent with the standard
//! NTP four-timestamp exchange; the node with the largest known subtree
//! (ties broken by lowest NodeId) is the reference and never adjusts.
//!
//! Corrections are damped and the clock may only move backward when the
//! node is demonstrably not the reference, and then never faster than
//! 100 ms per second.

use crate::types::{MeshTimeMicros, NodeId};
use crate::wire::{TimeSyncReplyPayload, TimeSyncRequestPayload};
use std::collections::HashMap;
use tracing::debug;

/// Damping applied to each measured offset before it touches the clock.
const OFFSET_DAMPING: f64 = 0.125;

/// Maximum backward slew: 100 ms of correction per elapsed second.
const MAX_BACKWARD_STEP_US: i64 = 100_000;

/// Backward corrections below this magnitude are applied directly.
const BACKWARD_STEP_THRESHOLD_US: i64 = 100_000;

/// EWMA factor for the drift estimate.
const DRIFT_ALPHA: f64 = 0.25;

/// Minimum spacing between samples used for drift estimation.
const DRIFT_MIN_ELAPSED_US: i64 = 1_000_000;

/// Result of folding in one sync exchange.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncSample {
    /// Measured clock offset against the peer (before damping).
    pub offset_us: i64,
    /// Estimated round-trip network delay.
    pub delay_us: i64,
}

pub struct TimeSync {
    local_id: NodeId,
    offset_us: i64,
    drift_ppm: f64,
    /// Backward correction still to be bled out, positive magnitude.
    pending_backward_us: i64,
    last_pace_local_us: i64,
    /// Previous applied-sample point for drift estimation.
    last_sample: Option<(i64, i64)>, // (local_us, offset_us)
    /// Advertised subtree sizes of peers, for reference determination.
    peer_sizes: HashMap<NodeId, u32>,
    /// Wall-clock anchor from a bridge: (mesh_us at anchor, unix seconds).
    wall_anchor: Option<(i64, u64)>,
}

impl TimeSync {
    pub fn new(local_id: NodeId) -> Self {
        Self {
            local_id,
            offset_us: 0,
            drift_ppm: 0.0,
            pending_backward_us: 0,
            last_pace_local_us: 0,
            last_sample: None,
            peer_sizes: HashMap::new(),
            wall_anchor: None,
        }
    }

    /// Logical mesh time for a local monotonic instant.
    pub fn mesh_time(&self, local_us: i64) -> MeshTimeMicros {
        let drift = if let Some((at, _)) = self.last_sample {
            ((local_us - at) as f64 * self.drift_ppm / 1_000_000.0) as i64
        } else {
            0
        };
        local_us + self.offset_us + drift
    }

    pub fn offset_us(&self) -> i64 {
        self.offset_us
    }

    pub fn drift_ppm(&self) -> f64 {
        self.drift_ppm
    }

    // -------------------------------------------------------------------------
    // Reference determination
    // -------------------------------------------------------------------------

    pub fn update_peer_authority(&mut self, peer: NodeId, subtree_size: u32) {
        self.peer_sizes.insert(peer, subtree_size);
    }

    pub fn forget_peer(&mut self, peer: NodeId) {
        self.peer_sizes.remove(&peer);
    }

    /// Whether this node is the time reference given its own tree size:
    /// no known peer advertises a larger subtree, nor an equal one with a
    /// lower NodeId.
    pub fn local_is_reference(&self, local_size: u32) -> bool {
        !self.peer_sizes.iter().any(|(&id, &size)| {
            size > local_size || (size == local_size && id < self.local_id)
        })
    }

    // -------------------------------------------------------------------------
    // Exchange
    // -------------------------------------------------------------------------

    pub fn make_request(&self, local_us: i64) -> TimeSyncRequestPayload {
        TimeSyncRequestPayload { t1: self.mesh_time(local_us) }
    }

    /// Responder side: echo t1, stamp receive and send instants.
    pub fn make_reply(
        &self,
        request: &TimeSyncRequestPayload,
        recv_local_us: i64,
        subtree_size: u32,
    ) -> TimeSyncReplyPayload {
        let t2 = self.mesh_time(recv_local_us);
        TimeSyncReplyPayload {
            t1: request.t1,
            t2,
            // Send follows receive within the same handler run.
            t3: t2,
            subtree_size,
        }
    }

    /// Requester side: fold a reply in. `local_us` is the reply arrival
    /// instant. Returns the measured sample; the clock is adjusted
    /// internally under the damping and monotonicity rules.
    pub fn on_reply(
        &mut self,
        reply: &TimeSyncReplyPayload,
        peer: NodeId,
        local_us: i64,
        local_size: u32,
    ) -> SyncSample {
        self.update_peer_authority(peer, reply.subtree_size);

        let t4 = self.mesh_time(local_us);
        let offset = ((reply.t2 - reply.t1) + (reply.t3 - t4)) / 2;
        let delay = (t4 - reply.t1) - (reply.t3 - reply.t2);
        let sample = SyncSample { offset_us: offset, delay_us: delay.max(0) };

        if self.local_is_reference(local_size) {
            // The reference is the baseline; it never chases a peer.
            return sample;
        }

        self.apply_offset(offset, local_us);
        sample
    }

    fn apply_offset(&mut self, raw_offset_us: i64, local_us: i64) {
        let damped = (raw_offset_us as f64 * OFFSET_DAMPING) as i64;
        if damped >= 0 {
            self.offset_us += damped;
            // A forward move supersedes any queued backward slew.
            self.pending_backward_us = 0;
        } else if -damped <= BACKWARD_STEP_THRESHOLD_US {
            self.offset_us += damped;
        } else {
            self.pending_backward_us += -damped;
            self.last_pace_local_us = self.last_pace_local_us.max(local_us);
            debug!(
                target: "treemesh::sync",
                pending_ms = self.pending_backward_us / 1000,
                "large backward correction queued for paced slew"
            );
        }
        self.update_drift(local_us);
        self.last_sample = Some((local_us, self.offset_us));
    }

    fn update_drift(&mut self, local_us: i64) {
        if let Some((prev_at, prev_offset)) = self.last_sample {
            let elapsed = local_us - prev_at;
            if elapsed >= DRIFT_MIN_ELAPSED_US {
                let raw_ppm = (self.offset_us - prev_offset) as f64 * 1_000_000.0 / elapsed as f64;
                self.drift_ppm = self.drift_ppm * (1.0 - DRIFT_ALPHA) + raw_ppm * DRIFT_ALPHA;
            }
        }
    }

    /// Bleed queued backward correction at ≤ 100 ms per elapsed second.
    /// Driven by a periodic task.
    pub fn pace_backward(&mut self, local_us: i64) {
        if self.pending_backward_us == 0 {
            self.last_pace_local_us = local_us;
            return;
        }
        let elapsed_us = (local_us - self.last_pace_local_us).max(0);
        let budget = elapsed_us / 1_000_000 * MAX_BACKWARD_STEP_US;
        if budget == 0 {
            return;
        }
        let step = budget.min(self.pending_backward_us);
        self.offset_us -= step;
        self.pending_backward_us -= step;
        self.last_pace_local_us = local_us;
    }

    // -------------------------------------------------------------------------
    // Wall-clock anchor (from a bridge's upstream time source)
    // -------------------------------------------------------------------------

    /// Accepts a coarse wall-clock anchor. Only a node currently marked as
    /// a bridge may provide it; the caller enforces that.
    pub fn set_wall_anchor(&mut self, unix_secs: u64, local_us: i64) {
        self.wall_anchor = Some((self.mesh_time(local_us), unix_secs));
    }

    /// Estimated Unix seconds for a local instant, if anchored.
    pub fn wall_time_estimate(&self, local_us: i64) -> Option<u64> {
        let (anchor_mesh_us, anchor_secs) = self.wall_anchor?;
        let elapsed_secs = (self.mesh_time(local_us) - anchor_mesh_us) / 1_000_000;
        Some((anchor_secs as i64 + elapsed_secs).max(0) as u64)
    }
}
