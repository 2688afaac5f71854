//! Process-wide configuration knobs.
//!
//! Everything is set at startup on `MeshConfig`; fields documented as
//! mutable may be changed at runtime through `MeshCore` operations.

use serde::{Deserialize, Serialize};

// =============================================================================
// DEBUG CATEGORIES
// =============================================================================
// Bitfield selecting which log categories are emitted. Categories map onto
// tracing targets; the bitfield is the runtime coarse filter on top of the
// subscriber's own EnvFilter.

pub const DEBUG_ERROR: u32 = 1 << 0;
pub const DEBUG_STARTUP: u32 = 1 << 1;
pub const DEBUG_CONNECTION: u32 = 1 << 2;
pub const DEBUG_SYNC: u32 = 1 << 3;
pub const DEBUG_COMMUNICATION: u32 = 1 << 4;
pub const DEBUG_GENERAL: u32 = 1 << 5;
pub const DEBUG_MSG_TYPES: u32 = 1 << 6;
pub const DEBUG_REMOTE: u32 = 1 << 7;

/// Selected debug categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugCategories(pub u32);

impl DebugCategories {
    pub const NONE: DebugCategories = DebugCategories(0);
    pub const ALL: DebugCategories = DebugCategories(u32::MAX);

    pub fn contains(self, category: u32) -> bool {
        self.0 & category != 0
    }

    /// Tracing filter directives for the enabled categories. ERROR and
    /// STARTUP ride on the subscriber's base level; the rest raise their
    /// targets to debug.
    pub fn tracing_directives(self) -> Vec<&'static str> {
        let map: [(u32, &[&'static str]); 6] = [
            (DEBUG_CONNECTION, &["treemesh::connection=debug", "treemesh::topology=debug"]),
            (DEBUG_SYNC, &["treemesh::sync=debug"]),
            (DEBUG_COMMUNICATION, &["treemesh::communication=debug"]),
            (DEBUG_GENERAL, &["treemesh::general=debug", "treemesh::queue=debug"]),
            (DEBUG_MSG_TYPES, &["treemesh::msg_types=debug"]),
            (DEBUG_REMOTE, &["treemesh::remote=debug", "treemesh::bridge=debug"]),
        ];
        let mut out = Vec::new();
        for (bit, directives) in map {
            if self.contains(bit) {
                out.extend_from_slice(directives);
            }
        }
        out
    }
}

impl Default for DebugCategories {
    fn default() -> Self {
        DebugCategories(DEBUG_ERROR | DEBUG_STARTUP)
    }
}

// =============================================================================
// BRIDGE CONFIGURATION
// =============================================================================

/// Multi-bridge selection strategy for non-bridge nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BridgeStrategy {
    /// Highest advertised priority wins.
    PriorityBased,
    /// Rotate among healthy bridges.
    RoundRobin,
    /// Closest by router RSSI.
    BestSignal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiBridgeConfig {
    pub enabled: bool,
    /// Ceiling on tracked bridges; clamped to 1–5 at load.
    pub max_bridges: usize,
    pub strategy: BridgeStrategy,
}

impl Default for MultiBridgeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_bridges: 2,
            strategy: BridgeStrategy::PriorityBased,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Upstream router SSID. Empty means no credentials configured and this
    /// node never becomes an election candidate.
    pub router_ssid: String,
    pub router_password: String,
    /// Participate in failover elections when the active bridge goes silent.
    pub failover_enabled: bool,
    /// No BRIDGE_STATUS for this long marks the bridge as lost.
    pub bridge_timeout_ms: u64,
    /// Election window: candidates collected for this long before scoring.
    pub election_timeout_ms: u64,
    /// BRIDGE_STATUS / BRIDGE_COORDINATION broadcast period.
    pub status_interval_ms: u64,
    /// Promotion window for router association.
    pub promotion_timeout_ms: u64,
    /// Advertised priority in multi-bridge coordination.
    pub priority: u8,
    pub multi_bridge: MultiBridgeConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            router_ssid: String::new(),
            router_password: String::new(),
            failover_enabled: false,
            bridge_timeout_ms: 60_000,
            election_timeout_ms: 5_000,
            status_interval_ms: 30_000,
            promotion_timeout_ms: 15_000,
            priority: 0,
            multi_bridge: MultiBridgeConfig::default(),
        }
    }
}

// =============================================================================
// QUEUE CONFIGURATION
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum queued entries before the eviction lattice applies.
    pub max_size: usize,
    /// Relay-dedup tracking window per message, independent of queue age.
    pub tracking_timeout_ms: u64,
    /// Optional JSON-lines backing file, atomic-replace on save.
    pub storage_path: Option<std::path::PathBuf>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 500,
            tracking_timeout_ms: 60_000,
            storage_path: None,
        }
    }
}

// =============================================================================
// MESH CONFIGURATION
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Network name prefix shared by all nodes of this mesh.
    pub mesh_prefix: String,
    pub mesh_password: String,
    pub mesh_port: u16,

    /// Slow scan period once at least one neighbor is connected.
    pub scan_interval_ms: u64,
    /// Fast scan period while no neighbors are known.
    pub fast_scan_interval_ms: u64,
    /// Consecutive empty scans (while disconnected) before a full
    /// multi-channel scan is performed. Channel re-sync trigger.
    pub empty_scan_threshold: u32,

    /// Peer handshake must complete within this window.
    pub handshake_timeout_ms: u64,
    /// TIME_SYNC exchange period toward the parent.
    pub time_sync_interval_ms: u64,
    /// Coalescing delay for NODE_SYNC broadcasts after topology changes.
    pub node_sync_delay_ms: u64,
    /// Back-off window before re-contacting a cycle-rejected peer.
    pub cycle_backoff_ms: u64,

    /// Broadcast dedup LRU capacity.
    pub dedup_capacity: usize,
    /// Broadcast dedup entry TTL.
    pub dedup_ttl_ms: u64,

    /// Per-connection outbound FIFO bounds.
    pub max_outbound_frames: usize,
    pub max_outbound_bytes: usize,

    pub bridge: BridgeConfig,
    pub message_queue: QueueConfig,
    pub debug_msg_types: DebugCategories,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            mesh_prefix: "treemesh".to_string(),
            mesh_password: String::new(),
            mesh_port: 5555,
            scan_interval_ms: 30_000,
            fast_scan_interval_ms: 15_000,
            empty_scan_threshold: 6,
            handshake_timeout_ms: 10_000,
            time_sync_interval_ms: 10_000,
            node_sync_delay_ms: 300,
            cycle_backoff_ms: 60_000,
            dedup_capacity: 500,
            dedup_ttl_ms: 60_000,
            max_outbound_frames: 64,
            max_outbound_bytes: 32 * 1024,
            bridge: BridgeConfig::default(),
            message_queue: QueueConfig::default(),
            debug_msg_types: DebugCategories::default(),
        }
    }
}

impl MeshConfig {
    /// Clamp out-of-range knobs to their documented ranges.
    pub fn sanitized(mut self) -> Self {
        self.bridge.multi_bridge.max_bridges =
            self.bridge.multi_bridge.max_bridges.clamp(1, 5);
        if self.message_queue.max_size == 0 {
            self.message_queue.max_size = 1;
        }
        self
    }

    /// Whether this node can ever stand for bridge election.
    pub fn bridge_capable(&self) -> bool {
        !self.bridge.router_ssid.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = MeshConfig::default();
        assert_eq!(c.scan_interval_ms, 30_000);
        assert_eq!(c.empty_scan_threshold, 6);
        assert_eq!(c.bridge.bridge_timeout_ms, 60_000);
        assert_eq!(c.bridge.election_timeout_ms, 5_000);
        assert_eq!(c.bridge.status_interval_ms, 30_000);
        assert_eq!(c.bridge.multi_bridge.max_bridges, 2);
        assert_eq!(c.message_queue.max_size, 500);
        assert_eq!(c.message_queue.tracking_timeout_ms, 60_000);
    }

    #[test]
    fn sanitize_clamps_bridge_ceiling() {
        let mut c = MeshConfig::default();
        c.bridge.multi_bridge.max_bridges = 9;
        assert_eq!(c.sanitized().bridge.multi_bridge.max_bridges, 5);

        let mut c = MeshConfig::default();
        c.bridge.multi_bridge.max_bridges = 0;
        assert_eq!(c.sanitized().bridge.multi_bridge.max_bridges, 1);
    }

    #[test]
    fn debug_categories() {
        let cats = DebugCategories(DEBUG_ERROR | DEBUG_SYNC);
        assert!(cats.contains(DEBUG_ERROR));
        assert!(cats.contains(DEBUG_SYNC));
        assert!(!cats.contains(DEBUG_REMOTE));
    }
}
