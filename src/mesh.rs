//! The mesh engine: single owner of every core component.
//!
//! `MeshCore` holds the scheduler, connections, router, topology engine,
//! time synchronizer, plugin registry, bridge coordinator, and offline
//! queue. It is driven synchronously — link events in, due tasks out — so
//! the whole protocol is deterministic under test. [`Mesh`](crate::Mesh)
//! wraps a core in a tokio event loop for real deployments.
//!
//! Concurrency model: one handler runs to completion before the next; all
//! mutable state lives here; the link driver is the only boundary that
//! queues work asynchronously.

use crate::bridge::{BridgeCoordinator, BridgeDirective, BridgeRole, LocalObservation};
use crate::config::MeshConfig;
use crate::connection::{Connection, ConnectionInfo, ConnState, Side};
use crate::error::{MeshError, Result};
use crate::link::{AssembleError, ConnId, LinkDriver, LinkEvent, ScanCandidate, ScanScope};
use crate::plugin::{Dispatch, InternalTarget, PluginRegistry};
use crate::queue::{MessageQueue, QueueState, QueuedMessage, QueueStats};
use crate::router::Router;
use crate::scheduler::{Repeat, Scheduler, TaskHandle};
use crate::timesync::TimeSync;
use crate::topology::{HandshakeReject, ScanContext, ScanOutcome, Topology};
use crate::types::{
    BROADCAST_NODE, CAP_BRIDGE, CAP_QUEUE, CAP_TIME_SOURCE, CloseReason, FIRST_PLUGIN_TYPE,
    NodeId, Priority, Routing, SubtreeDescriptor, TYPE_BRIDGE_COORDINATION, TYPE_BRIDGE_ELECTION,
    TYPE_BRIDGE_STATUS, TYPE_BRIDGE_TAKEOVER, TYPE_HANDSHAKE, TYPE_NODE_SYNC_REPLY,
    TYPE_NODE_SYNC_REQUEST, TYPE_NTP_TIME, TYPE_TIME_SYNC_REPLY, TYPE_TIME_SYNC_REQUEST,
    unix_time_secs,
};
use crate::wire::{self, Body, Envelope, HandshakePayload, NodeSyncPayload, NtpTimePayload, PackageView};
use rand::Rng;
use std::collections::HashMap;
use tracing::{debug, info, warn};

// =============================================================================
// SCHEDULED TASKS
// =============================================================================

/// Clock pacing period for backward-slew corrections.
const PACE_CLOCK_INTERVAL_MS: u64 = 1_000;

/// Bridge silence is checked at this granularity.
const BRIDGE_WATCH_INTERVAL_MS: u64 = 5_000;

/// Expired scan/cycle backoff entries are swept at this period.
const BACKOFF_SWEEP_INTERVAL_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MeshTask {
    ScanTick,
    TimeSyncTick,
    PaceClockTick,
    HandshakeTimeout(ConnId),
    NodeSyncBroadcast,
    BridgeWatchTick,
    BridgeStatusTick,
    ElectionClose,
    PromotionTimeout,
    BackoffSweep,
    StatusLog,
}

/// Period of the informational status line.
const STATUS_LOG_INTERVAL_MS: u64 = 30_000;

// =============================================================================
// CALLBACKS
// =============================================================================

pub type DroppedCallback = Box<dyn FnMut(NodeId) + Send>;
pub type BridgeStatusCallback = Box<dyn FnMut(NodeId, bool) + Send>;
pub type BridgeRoleCallback = Box<dyn FnMut(bool, &str) + Send>;
pub type PromotionCallback = Box<dyn FnMut() + Send>;
pub type QueueFlushCallback = Box<dyn FnMut(Vec<QueuedMessage>) + Send>;

#[derive(Default)]
struct Callbacks {
    on_dropped: Option<DroppedCallback>,
    on_bridge_status_changed: Option<BridgeStatusCallback>,
    on_bridge_role_changed: Option<BridgeRoleCallback>,
    /// Fired when this node wins an election; the host must attempt router
    /// association and call `report_router_association`.
    on_promotion_requested: Option<PromotionCallback>,
    on_queue_flush: Option<QueueFlushCallback>,
}

// =============================================================================
// STATS
// =============================================================================

#[derive(Debug, Clone)]
pub struct MeshStats {
    pub node_id: NodeId,
    pub node_count: usize,
    pub channel: u8,
    pub mesh_time_us: i64,
    pub offset_us: i64,
    pub drift_ppm: f64,
    pub subtree: SubtreeDescriptor,
    pub connections: Vec<ConnectionInfo>,
    pub queue: QueueStats,
    pub bridge_role: BridgeRole,
}

// =============================================================================
// CORE
// =============================================================================

pub struct MeshCore<D: LinkDriver> {
    config: MeshConfig,
    local_id: NodeId,
    driver: D,

    scheduler: Scheduler<MeshTask>,
    connections: HashMap<ConnId, Connection>,
    router: Router,
    topology: Topology,
    timesync: TimeSync,
    plugins: PluginRegistry,
    bridge: BridgeCoordinator,
    queue: MessageQueue,

    callbacks: Callbacks,

    scan_task: Option<TaskHandle>,
    node_sync_task: Option<TaskHandle>,
    election_task: Option<TaskHandle>,
    promotion_task: Option<TaskHandle>,
    bridge_status_task: Option<TaskHandle>,
    /// Join target deferred across a channel-switch AP restart.
    pending_join: Option<ScanCandidate>,
    /// Second takeover announcement deferred across the same restart.
    pending_takeover: Option<wire::BridgeTakeoverPayload>,
    /// When set, router association resolves immediately with this
    /// outcome instead of waiting on `report_router_association` (hosts
    /// whose uplink is managed outside the mesh).
    auto_associate: Option<bool>,
}

/// Frame priority by message class: protocol control outranks data.
fn priority_for(type_code: u16) -> Priority {
    if type_code < FIRST_PLUGIN_TYPE || (610..=614).contains(&type_code) {
        Priority::High
    } else {
        Priority::Normal
    }
}

impl<D: LinkDriver> MeshCore<D> {
    pub fn new(config: MeshConfig, local_id: NodeId, driver: D) -> Self {
        let config = config.sanitized();
        let bridge_capable = config.bridge_capable();
        let topology = Topology::new(
            local_id,
            config.mesh_prefix.clone(),
            1,
            config.fast_scan_interval_ms,
            config.scan_interval_ms,
            config.empty_scan_threshold,
            config.cycle_backoff_ms,
        );
        let queue = MessageQueue::new(
            config.message_queue.max_size,
            config.message_queue.tracking_timeout_ms,
        );
        let msg_id_seed: u32 = rand::thread_rng().r#gen();
        Self {
            router: Router::new(local_id, config.dedup_capacity, config.dedup_ttl_ms, msg_id_seed),
            topology,
            timesync: TimeSync::new(local_id),
            plugins: PluginRegistry::new(),
            bridge: BridgeCoordinator::new(local_id, config.bridge.clone(), bridge_capable),
            queue,
            scheduler: Scheduler::new(),
            connections: HashMap::new(),
            callbacks: Callbacks::default(),
            scan_task: None,
            node_sync_task: None,
            election_task: None,
            promotion_task: None,
            bridge_status_task: None,
            pending_join: None,
            pending_takeover: None,
            auto_associate: None,
            config,
            local_id,
            driver,
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Arm the periodic tasks and load the persisted queue. Scan starts
    /// with a small jitter so co-started nodes do not scan in lockstep.
    pub fn start(&mut self, now_ms: u64) {
        info!(
            target: "treemesh::startup",
            node = self.local_id,
            prefix = %self.config.mesh_prefix,
            channel = self.topology.channel(),
            "mesh starting"
        );
        if let Some(path) = self.config.message_queue.storage_path.clone() {
            match self.queue.load(&path) {
                Ok(n) if n > 0 => info!(target: "treemesh::startup", n, "restored queued messages"),
                Ok(_) => {}
                Err(e) => warn!("queue restore failed: {e}"),
            }
        }

        let jitter = rand::thread_rng().gen_range(0..500);
        self.scan_task =
            Some(self.scheduler.schedule(now_ms, jitter, Repeat::Once, MeshTask::ScanTick));
        self.scheduler.schedule(
            now_ms,
            self.config.time_sync_interval_ms,
            Repeat::Every(self.config.time_sync_interval_ms),
            MeshTask::TimeSyncTick,
        );
        self.scheduler.schedule(
            now_ms,
            PACE_CLOCK_INTERVAL_MS,
            Repeat::Every(PACE_CLOCK_INTERVAL_MS),
            MeshTask::PaceClockTick,
        );
        self.scheduler.schedule(
            now_ms,
            BRIDGE_WATCH_INTERVAL_MS,
            Repeat::Every(BRIDGE_WATCH_INTERVAL_MS),
            MeshTask::BridgeWatchTick,
        );
        self.scheduler.schedule(
            now_ms,
            BACKOFF_SWEEP_INTERVAL_MS,
            Repeat::Every(BACKOFF_SWEEP_INTERVAL_MS),
            MeshTask::BackoffSweep,
        );
        self.scheduler.schedule(
            now_ms,
            STATUS_LOG_INTERVAL_MS,
            Repeat::Every(STATUS_LOG_INTERVAL_MS),
            MeshTask::StatusLog,
        );
    }

    pub fn shutdown(&mut self, _now_ms: u64) {
        if let Some(path) = self.config.message_queue.storage_path.clone() {
            if let Err(e) = self.queue.save(&path) {
                warn!("queue save failed: {e}");
            }
        }
        let conns: Vec<ConnId> = self.connections.keys().copied().collect();
        for conn in conns {
            self.driver.close(conn, CloseReason::Shutdown);
        }
        self.connections.clear();
        info!(target: "treemesh::general", "mesh shut down");
    }

    // -------------------------------------------------------------------------
    // Callback registration
    // -------------------------------------------------------------------------

    /// Default sink for application packages (types 100+).
    pub fn set_on_receive(&mut self, cb: crate::plugin::AppCallback) {
        self.plugins.set_app_callback(cb);
    }

    /// Register a typed handler; return value `true` consumes the package.
    pub fn register_handler(&mut self, type_code: u16, h: crate::plugin::PackageHandler) -> bool {
        self.plugins.register(type_code, h)
    }

    pub fn set_on_dropped(&mut self, cb: DroppedCallback) {
        self.callbacks.on_dropped = Some(cb);
    }

    pub fn set_on_bridge_status_changed(&mut self, cb: BridgeStatusCallback) {
        self.callbacks.on_bridge_status_changed = Some(cb);
    }

    pub fn set_on_bridge_role_changed(&mut self, cb: BridgeRoleCallback) {
        self.callbacks.on_bridge_role_changed = Some(cb);
    }

    pub fn set_on_promotion_requested(&mut self, cb: PromotionCallback) {
        self.callbacks.on_promotion_requested = Some(cb);
    }

    pub fn set_on_queue_flush(&mut self, cb: QueueFlushCallback) {
        self.callbacks.on_queue_flush = Some(cb);
    }

    pub fn set_on_queue_state_changed(&mut self, cb: Box<dyn FnMut(QueueState) + Send>) {
        self.queue.set_state_callback(cb);
    }

    pub fn set_observation(&mut self, obs: LocalObservation) {
        self.bridge.set_observation(obs);
    }

    /// Resolve future promotions immediately with `outcome` instead of
    /// waiting for `report_router_association`.
    pub fn set_auto_associate(&mut self, outcome: Option<bool>) {
        self.auto_associate = outcome;
    }

    // -------------------------------------------------------------------------
    // Views
    // -------------------------------------------------------------------------

    fn local_us(now_ms: u64) -> i64 {
        (now_ms as i64).saturating_mul(1000)
    }

    pub fn mesh_time(&self, now_ms: u64) -> i64 {
        self.timesync.mesh_time(Self::local_us(now_ms))
    }

    /// This node's full tree view.
    fn subtree_view(&self) -> SubtreeDescriptor {
        self.advert_view(None, None)
    }

    /// The tree as advertised toward one peer: the link it travels on is
    /// left out, as is any branch already containing the receiver —
    /// routes back to a node through itself are meaningless and would
    /// trip its cycle gate on a legitimate redundant link.
    fn advert_view(&self, exclude_conn: Option<ConnId>, receiver: Option<NodeId>) -> SubtreeDescriptor {
        let children = self
            .connections
            .values()
            .filter(|c| c.is_established() && Some(c.conn) != exclude_conn)
            .filter_map(|c| c.subtree.clone())
            .filter(|s| receiver.map(|id| !s.contains(id)).unwrap_or(true))
            .collect();
        SubtreeDescriptor { root: self.local_id, children }
    }

    fn tree_size(&self) -> u32 {
        self.subtree_view().size() as u32
    }

    fn has_station_uplink(&self) -> bool {
        self.connections
            .values()
            .any(|c| c.side == Side::Station && c.state != ConnState::Closing)
    }

    pub fn stats(&self, now_ms: u64) -> MeshStats {
        let subtree = self.subtree_view();
        // Redundant links can list a node under two branches; count ids.
        let node_count = subtree
            .flatten()
            .into_iter()
            .collect::<std::collections::HashSet<_>>()
            .len();
        MeshStats {
            node_id: self.local_id,
            node_count,
            channel: self.topology.channel(),
            mesh_time_us: self.mesh_time(now_ms),
            offset_us: self.timesync.offset_us(),
            drift_ppm: self.timesync.drift_ppm(),
            subtree,
            connections: self.connections.values().map(ConnectionInfo::from).collect(),
            queue: self.queue.stats(),
            bridge_role: self.bridge.role(),
        }
    }

    pub fn bridge_role(&self) -> BridgeRole {
        self.bridge.role()
    }

    /// Preferred bridge for upstream traffic, per the configured strategy.
    pub fn preferred_bridge(&mut self, now_ms: u64) -> Option<NodeId> {
        self.bridge.preferred_bridge(now_ms)
    }

    // -------------------------------------------------------------------------
    // Public send API
    // -------------------------------------------------------------------------

    /// Source-routed unicast. `dest == 0` falls through to broadcast.
    pub fn send_single(
        &mut self,
        dest: NodeId,
        type_code: u16,
        body: serde_json::Map<String, serde_json::Value>,
        now_ms: u64,
    ) -> Result<()> {
        if dest == BROADCAST_NODE {
            return self.send_broadcast(type_code, body, 0, now_ms);
        }
        if dest == self.local_id {
            return Err(MeshError::Unreachable(dest));
        }
        let conn = self
            .router
            .conn_for(dest, self.connections.values())
            .ok_or(MeshError::Unreachable(dest))?;
        let envelope = Envelope {
            type_code,
            from: self.local_id,
            dest,
            routing: Routing::Single,
            msg_id: self.router.next_msg_id(),
        };
        let line = wire::to_line(&envelope, &Body::Unknown(body))?;
        self.enqueue_line(conn, line, priority_for(type_code));
        Ok(())
    }

    /// Controlled flood to the whole mesh, excluding the branch rooted at
    /// `exclude` (0 excludes nothing). A solo node's broadcast is a no-op.
    pub fn send_broadcast(
        &mut self,
        type_code: u16,
        body: serde_json::Map<String, serde_json::Value>,
        exclude: NodeId,
        now_ms: u64,
    ) -> Result<()> {
        let envelope = Envelope {
            type_code,
            from: self.local_id,
            dest: BROADCAST_NODE,
            routing: Routing::Broadcast,
            msg_id: self.router.next_msg_id(),
        };
        let line = wire::to_line(&envelope, &Body::Unknown(body))?;
        // Mark our own id so a looped-back copy is suppressed.
        self.router.first_sighting(self.local_id, envelope.msg_id, now_ms);
        let targets = self.router.broadcast_targets(exclude, self.connections.values());
        for conn in targets {
            self.enqueue_line(conn, line.clone(), priority_for(type_code));
        }
        Ok(())
    }

    /// Direct neighbours only; never forwarded.
    pub fn send_neighbour(
        &mut self,
        type_code: u16,
        body: serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        let envelope = Envelope {
            type_code,
            from: self.local_id,
            dest: BROADCAST_NODE,
            routing: Routing::Neighbour,
            msg_id: self.router.next_msg_id(),
        };
        let line = wire::to_line(&envelope, &Body::Unknown(body))?;
        let targets = self.router.broadcast_targets(0, self.connections.values());
        for conn in targets {
            self.enqueue_line(conn, line.clone(), priority_for(type_code));
        }
        Ok(())
    }

    /// Current route to `dest`, for diagnostics. Empty when unreachable.
    pub fn route_to(&self, dest: NodeId) -> Vec<NodeId> {
        self.router.route_to(dest, self.connections.values())
    }

    /// Dial a specific candidate outside the scan loop. The handshake
    /// gates still apply; a redundant link to an already-reachable node is
    /// permitted and its duplicates fall to broadcast dedup.
    pub fn join(&mut self, candidate: &ScanCandidate) {
        self.topology.mark_connecting(&candidate.target, &candidate.ssid);
        self.driver.connect(candidate);
    }

    // -------------------------------------------------------------------------
    // Offline queue passthrough
    // -------------------------------------------------------------------------

    pub fn offline_enqueue(
        &mut self,
        payload: Vec<u8>,
        destination: String,
        priority: Priority,
        now_ms: u64,
    ) -> Result<Option<u64>> {
        self.queue.enqueue(payload, destination, priority, now_ms)
    }

    pub fn offline_remove(&mut self, id: u64) -> bool {
        self.queue.remove(id)
    }

    pub fn offline_increment_attempts(&mut self, id: u64) -> bool {
        self.queue.increment_attempts(id)
    }

    pub fn offline_prune(&mut self, max_age_ms: u64, now_ms: u64) -> usize {
        self.queue.prune(max_age_ms, now_ms)
    }

    pub fn offline_size(&self, filter: Option<Priority>) -> usize {
        self.queue.size(filter)
    }

    pub fn offline_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    // -------------------------------------------------------------------------
    // Promotion (router association is the host's job)
    // -------------------------------------------------------------------------

    /// Host reports the router-association outcome during promotion.
    pub fn report_router_association(&mut self, success: bool, now_ms: u64) -> Result<()> {
        if self.bridge.role() != BridgeRole::Promoting {
            return Err(MeshError::BridgePromotionFailed("no promotion in progress"));
        }
        if let Some(task) = self.promotion_task.take() {
            self.scheduler.cancel(task);
        }
        if !success {
            return self.fail_promotion(now_ms, "router association failed");
        }

        let takeover = self.bridge.promotion_succeeded(now_ms);
        self.broadcast_internal(
            TYPE_BRIDGE_TAKEOVER,
            &Body::BridgeTakeover(takeover.clone()),
            now_ms,
        );

        // Channel-change discipline: announce on the old channel first,
        // re-home to the router's channel, then announce again there.
        let router_channel = self.bridge.observation().router_channel;
        if router_channel != 0 && router_channel != self.topology.channel() {
            self.pending_takeover = Some(takeover);
            self.topology.set_channel(router_channel);
            self.driver.restart_access_point(router_channel);
        }

        let interval = self.config.bridge.status_interval_ms;
        if let Some(old) = self.bridge_status_task.take() {
            self.scheduler.cancel(old);
        }
        self.bridge_status_task = Some(self.scheduler.schedule(
            now_ms,
            0,
            Repeat::Every(interval),
            MeshTask::BridgeStatusTick,
        ));
        if let Some(cb) = self.callbacks.on_bridge_role_changed.as_mut() {
            cb(true, "election");
        }
        Ok(())
    }

    fn fail_promotion(&mut self, now_ms: u64, reason: &'static str) -> Result<()> {
        self.bridge.promotion_failed(now_ms);
        if let Some(cb) = self.callbacks.on_bridge_role_changed.as_mut() {
            cb(false, reason);
        }
        Err(MeshError::BridgePromotionFailed(reason))
    }

    /// Step down from the bridge role.
    pub fn demote_bridge(&mut self, now_ms: u64) {
        if self.bridge.is_active() {
            self.bridge.demote(now_ms);
            if let Some(task) = self.bridge_status_task.take() {
                self.scheduler.cancel(task);
            }
            if let Some(cb) = self.callbacks.on_bridge_role_changed.as_mut() {
                cb(false, "demoted");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Event intake
    // -------------------------------------------------------------------------

    pub fn handle_link_event(&mut self, event: LinkEvent, now_ms: u64) {
        match event {
            LinkEvent::Accepted { conn } => self.on_endpoint_up(conn, Side::Ap, None, now_ms),
            LinkEvent::Connected { conn, candidate } => {
                self.topology.on_connect_established();
                self.on_endpoint_up(conn, Side::Station, Some(candidate), now_ms);
            }
            LinkEvent::ConnectFailed { target } => {
                debug!(target: "treemesh::connection", peer = %target, "connect failed");
                self.topology.on_connect_failed(&target, now_ms);
            }
            LinkEvent::Data { conn, bytes } => self.on_data(conn, &bytes, now_ms),
            LinkEvent::Closed { conn, reason } => self.cleanup_conn(conn, reason, now_ms),
            LinkEvent::ScanComplete { scope, candidates } => {
                self.on_scan_complete(scope, candidates, now_ms)
            }
            LinkEvent::ApRestarted { channel } => self.on_ap_restarted(channel, now_ms),
        }
    }

    fn on_endpoint_up(
        &mut self,
        conn: ConnId,
        side: Side,
        candidate: Option<ScanCandidate>,
        now_ms: u64,
    ) {
        let mut c = Connection::new(
            conn,
            side,
            now_ms,
            self.config.max_outbound_frames,
            self.config.max_outbound_bytes,
        );
        if let Some(candidate) = candidate {
            c.rssi = Some(candidate.rssi);
            c.channel = Some(candidate.channel);
            c.station_ssid = Some(candidate.ssid);
        }
        c.handshake_timer = Some(self.scheduler.schedule(
            now_ms,
            self.config.handshake_timeout_ms,
            Repeat::Once,
            MeshTask::HandshakeTimeout(conn),
        ));
        let ssid_hint = c.station_ssid.clone();
        self.connections.insert(conn, c);

        // The station speaks first; the acceptor replies once it knows who
        // dialed, so its advert can leave the dialer's branch out.
        if side == Side::Station {
            let peer_hint = ssid_hint.and_then(|s| self.topology.node_id_from_ssid(&s));
            self.send_handshake(conn, peer_hint, now_ms);
        }
    }

    fn send_handshake(&mut self, conn: ConnId, receiver: Option<NodeId>, now_ms: u64) {
        let body = Body::Handshake(HandshakePayload {
            node_id: self.local_id,
            subtree: self.advert_view(Some(conn), receiver),
            capabilities: self.capabilities(),
            mesh_time_estimate: self.mesh_time(now_ms),
        });
        self.send_package(conn, TYPE_HANDSHAKE, BROADCAST_NODE, Routing::Neighbour, &body);
        if let Some(c) = self.connections.get_mut(&conn) {
            c.mark_handshake_sent();
        }
    }

    fn capabilities(&self) -> u64 {
        let mut caps = CAP_TIME_SOURCE;
        if self.config.bridge_capable() {
            caps |= CAP_BRIDGE;
        }
        if self.config.message_queue.storage_path.is_some() {
            caps |= CAP_QUEUE;
        }
        caps
    }

    fn on_data(&mut self, conn: ConnId, bytes: &[u8], now_ms: u64) {
        let lines = {
            let Some(c) = self.connections.get_mut(&conn) else {
                return;
            };
            match c.assembler.push(bytes) {
                Ok(lines) => lines,
                Err(AssembleError::Oversize) => {
                    warn!(target: "treemesh::connection", conn, "oversize frame");
                    self.close_conn(conn, CloseReason::Oversize, now_ms);
                    return;
                }
                Err(AssembleError::Utf8) => {
                    self.close_conn(conn, CloseReason::TransportError, now_ms);
                    return;
                }
            }
        };
        for line in lines {
            self.handle_line(conn, line, now_ms);
        }
    }

    fn on_scan_complete(
        &mut self,
        scope: ScanScope,
        candidates: Vec<ScanCandidate>,
        now_ms: u64,
    ) {
        let known = self.subtree_view().flatten();
        let ctx = ScanContext {
            has_uplink: self.has_station_uplink(),
            has_any_link: self
                .connections
                .values()
                .any(|c| c.state != ConnState::Closing),
            known_nodes: &known,
        };
        match self.topology.on_scan_results(scope, &candidates, ctx, now_ms) {
            ScanOutcome::Idle => {}
            ScanOutcome::Join(candidate) => {
                debug!(
                    target: "treemesh::connection",
                    ssid = %candidate.ssid,
                    rssi = candidate.rssi,
                    "joining mesh network"
                );
                self.topology.mark_connecting(&candidate.target, &candidate.ssid);
                self.driver.connect(&candidate);
            }
            ScanOutcome::FullScan => {
                debug!(target: "treemesh::sync", "empty-scan threshold reached, full scan");
                self.driver.request_scan(ScanScope::AllChannels);
            }
            ScanOutcome::SwitchChannel { channel, join } => {
                info!(
                    target: "treemesh::sync",
                    from = self.topology.channel(),
                    to = channel,
                    "channel re-synchronization"
                );
                self.topology.set_channel(channel);
                self.pending_join = Some(join);
                self.driver.restart_access_point(channel);
            }
        }
    }

    fn on_ap_restarted(&mut self, channel: u8, now_ms: u64) {
        self.topology.set_channel(channel);
        if let Some(candidate) = self.pending_join.take() {
            self.topology.mark_connecting(&candidate.target, &candidate.ssid);
            self.driver.connect(&candidate);
        }
        if let Some(takeover) = self.pending_takeover.take() {
            // Dual announcement: the second takeover goes out on the new
            // channel once the endpoint is back.
            self.broadcast_internal(TYPE_BRIDGE_TAKEOVER, &Body::BridgeTakeover(takeover), now_ms);
        }
    }

    // -------------------------------------------------------------------------
    // Inbound package path
    // -------------------------------------------------------------------------

    fn handle_line(&mut self, conn: ConnId, line: String, now_ms: u64) {
        let view = match wire::parse_line(&line) {
            Ok(v) => v,
            Err(e) => {
                debug!(target: "treemesh::communication", conn, "bad frame: {e}");
                return;
            }
        };
        let envelope = view.envelope;
        if envelope.from == self.local_id {
            return;
        }

        let (established, peer_id) = match self.connections.get_mut(&conn) {
            Some(c) => {
                c.on_received(now_ms);
                (c.is_established(), c.peer_id)
            }
            None => return,
        };

        if envelope.type_code == TYPE_HANDSHAKE {
            self.handle_handshake(conn, &view, now_ms);
            return;
        }
        if !established {
            debug!(
                target: "treemesh::communication",
                conn,
                code = envelope.type_code,
                "dropping pre-handshake package"
            );
            return;
        }

        // Dedup gate: one delivery (and one forward) per (from, msgId).
        if envelope.routing == Routing::Broadcast
            && !self.router.first_sighting(envelope.from, envelope.msg_id, now_ms)
        {
            return;
        }

        // Transit unicast: recompute locally, forward, done.
        if envelope.routing == Routing::Single
            && envelope.dest != self.local_id
            && envelope.dest != BROADCAST_NODE
        {
            self.forward_single(&view);
            return;
        }

        let dispatch = self.plugins.dispatch(&view);
        match dispatch {
            Dispatch::Internal(InternalTarget::Topology) => {
                self.handle_node_sync(conn, &view, now_ms)
            }
            Dispatch::Internal(InternalTarget::TimeSync) => {
                self.handle_time_sync(conn, &view, now_ms)
            }
            Dispatch::Internal(InternalTarget::Bridge) => {
                self.handle_bridge_msg(&view, now_ms)
            }
            Dispatch::Handled { .. } | Dispatch::Unhandled => {}
        }

        let consumed = matches!(dispatch, Dispatch::Handled { consumed: true });
        if envelope.routing == Routing::Broadcast && !consumed {
            let exclude = peer_id.unwrap_or(0);
            self.forward_broadcast(view.raw_line(), exclude, priority_for(envelope.type_code));
        }
    }

    fn forward_single(&mut self, view: &PackageView) {
        let dest = view.envelope.dest;
        match self.router.conn_for(dest, self.connections.values()) {
            Some(conn) => {
                let line = view.raw_line().to_string();
                self.enqueue_line(conn, line, priority_for(view.envelope.type_code));
            }
            None => {
                debug!(
                    target: "treemesh::communication",
                    dest,
                    "transit unicast unreachable, dropped"
                );
            }
        }
    }

    fn forward_broadcast(&mut self, raw_line: &str, exclude: NodeId, priority: Priority) {
        let targets = self.router.broadcast_targets(exclude, self.connections.values());
        for conn in targets {
            self.enqueue_line(conn, raw_line.to_string(), priority);
        }
    }

    // -------------------------------------------------------------------------
    // Handshake
    // -------------------------------------------------------------------------

    fn handle_handshake(&mut self, conn: ConnId, view: &PackageView, now_ms: u64) {
        let Body::Handshake(hs) = &view.body else {
            self.close_conn(conn, CloseReason::TransportError, now_ms);
            return;
        };
        match self.topology.validate_handshake(hs) {
            Err(HandshakeReject::SelfLoop) => {
                self.close_conn(conn, CloseReason::SelfLoop, now_ms);
                return;
            }
            Err(HandshakeReject::Cycle) => {
                let ssid = self
                    .connections
                    .get(&conn)
                    .and_then(|c| c.station_ssid.clone())
                    .unwrap_or_else(|| format!("{}-{}", self.config.mesh_prefix, hs.node_id));
                warn!(
                    target: "treemesh::connection",
                    peer = hs.node_id,
                    "peer subtree contains us, rejecting"
                );
                self.topology.on_cycle_rejected(&ssid, now_ms);
                self.close_conn(conn, CloseReason::CycleDetected, now_ms);
                return;
            }
            Ok(()) => {}
        }

        // One connection per peer. On a simultaneous cross-dial both ends
        // must keep the same link, so the survivor is chosen by a shared
        // rule: the link whose station end has the lower NodeId wins;
        // on a tie (same direction, i.e. a reconnect) the newer replaces
        // the older.
        let new_side = match self.connections.get(&conn) {
            Some(c) => c.side,
            None => return,
        };
        let duplicate = self
            .connections
            .values()
            .find(|c| c.peer_id == Some(hs.node_id) && c.conn != conn)
            .map(|c| (c.conn, c.side));
        if let Some((old_conn, old_side)) = duplicate {
            let station_of = |side: Side| match side {
                Side::Station => self.local_id,
                Side::Ap => hs.node_id,
            };
            if station_of(old_side) < station_of(new_side) {
                debug!(
                    target: "treemesh::connection",
                    peer = hs.node_id,
                    "keeping existing link, refusing cross-dial"
                );
                self.close_conn(conn, CloseReason::Replaced, now_ms);
                return;
            }
            debug!(target: "treemesh::connection", peer = hs.node_id, "replacing stale link");
            self.close_conn(old_conn, CloseReason::Replaced, now_ms);
        }

        let (side, ssid) = {
            let Some(c) = self.connections.get_mut(&conn) else {
                return;
            };
            if let Some(timer) = c.handshake_timer.take() {
                self.scheduler.cancel(timer);
            }
            c.complete_handshake(hs.node_id, hs.subtree.clone());
            (c.side, c.station_ssid.clone())
        };

        self.timesync
            .update_peer_authority(hs.node_id, hs.subtree.size() as u32);
        match side {
            Side::Station => {
                let ssid =
                    ssid.unwrap_or_else(|| format!("{}-{}", self.config.mesh_prefix, hs.node_id));
                self.topology.on_parent_joined(&ssid);
            }
            Side::Ap => {
                // Acceptor's turn: answer with our identity and advert.
                self.send_handshake(conn, Some(hs.node_id), now_ms);
            }
        }
        info!(
            target: "treemesh::connection",
            peer = hs.node_id,
            side = ?side,
            subtree = hs.subtree.size(),
            "handshake complete"
        );
        self.schedule_node_sync(now_ms);
    }

    // -------------------------------------------------------------------------
    // Node sync
    // -------------------------------------------------------------------------

    fn handle_node_sync(&mut self, conn: ConnId, view: &PackageView, now_ms: u64) {
        let (subtree, size, is_request) = match &view.body {
            Body::NodeSyncRequest(p) => (p.subtree.clone(), p.subtree_size, true),
            Body::NodeSyncReply(p) => (p.subtree.clone(), p.subtree_size, false),
            _ => return,
        };
        let from = view.envelope.from;

        // Re-run the cycle gate on updates too: a stale peer could fold our
        // own branch back into its advert.
        if subtree.contains(self.local_id) {
            self.topology.on_cycle_rejected(
                &format!("{}-{}", self.config.mesh_prefix, from),
                now_ms,
            );
            self.close_conn(conn, CloseReason::CycleDetected, now_ms);
            return;
        }

        let changed = {
            let Some(c) = self.connections.get_mut(&conn) else {
                return;
            };
            let changed = c.subtree.as_ref() != Some(&subtree);
            c.update_subtree(subtree);
            changed
        };
        self.timesync.update_peer_authority(from, size);

        if is_request {
            let body = Body::NodeSyncReply(NodeSyncPayload {
                subtree: self.advert_view(Some(conn), Some(from)),
                subtree_size: self.tree_size(),
            });
            self.send_package(conn, TYPE_NODE_SYNC_REPLY, from, Routing::Neighbour, &body);
        }
        if changed {
            self.schedule_node_sync(now_ms);
        }
    }

    /// Coalesce subtree-change broadcasts behind a short delay.
    fn schedule_node_sync(&mut self, now_ms: u64) {
        if self
            .node_sync_task
            .is_some_and(|t| self.scheduler.is_pending(t))
        {
            return;
        }
        self.node_sync_task = Some(self.scheduler.schedule(
            now_ms,
            self.config.node_sync_delay_ms,
            Repeat::Once,
            MeshTask::NodeSyncBroadcast,
        ));
    }

    fn broadcast_node_sync(&mut self) {
        self.node_sync_task = None;
        let targets: Vec<(ConnId, NodeId)> = self
            .connections
            .values()
            .filter(|c| c.is_established())
            .filter_map(|c| c.peer_id.map(|p| (c.conn, p)))
            .collect();
        for (conn, peer) in targets {
            let body = Body::NodeSyncRequest(NodeSyncPayload {
                subtree: self.advert_view(Some(conn), Some(peer)),
                subtree_size: self.tree_size(),
            });
            self.send_package(conn, TYPE_NODE_SYNC_REQUEST, peer, Routing::Neighbour, &body);
        }
    }

    // -------------------------------------------------------------------------
    // Time sync
    // -------------------------------------------------------------------------

    fn handle_time_sync(&mut self, conn: ConnId, view: &PackageView, now_ms: u64) {
        let from = view.envelope.from;
        match &view.body {
            Body::TimeSyncRequest(req) => {
                let size = self.tree_size();
                let reply = self.timesync.make_reply(req, Self::local_us(now_ms), size);
                self.send_package(
                    conn,
                    TYPE_TIME_SYNC_REPLY,
                    from,
                    Routing::Neighbour,
                    &Body::TimeSyncReply(reply),
                );
            }
            Body::TimeSyncReply(reply) => {
                let size = self.tree_size();
                let sample = self
                    .timesync
                    .on_reply(reply, from, Self::local_us(now_ms), size);
                if let Some(c) = self.connections.get_mut(&conn) {
                    c.record_latency(sample.delay_us);
                }
                debug!(
                    target: "treemesh::sync",
                    peer = from,
                    offset_us = sample.offset_us,
                    delay_us = sample.delay_us,
                    "time sync sample"
                );
            }
            _ => {}
        }
    }

    fn initiate_time_sync(&mut self, now_ms: u64) {
        if self.timesync.local_is_reference(self.tree_size()) {
            return;
        }
        // Pull from the parent; any neighbor serves when there is none.
        let target = self
            .connections
            .values()
            .filter(|c| c.is_established())
            .find(|c| c.side == Side::Station)
            .or_else(|| self.connections.values().find(|c| c.is_established()))
            .map(|c| (c.conn, c.peer_id.unwrap_or(BROADCAST_NODE)));
        if let Some((conn, peer)) = target {
            let req = self.timesync.make_request(Self::local_us(now_ms));
            self.send_package(
                conn,
                TYPE_TIME_SYNC_REQUEST,
                peer,
                Routing::Neighbour,
                &Body::TimeSyncRequest(req),
            );
        }
    }

    // -------------------------------------------------------------------------
    // Bridge messages
    // -------------------------------------------------------------------------

    fn handle_bridge_msg(&mut self, view: &PackageView, now_ms: u64) {
        let from = view.envelope.from;
        match &view.body {
            Body::BridgeStatus(p) => {
                if let Some(d) = self.bridge.on_status(from, p, now_ms) {
                    self.apply_bridge_directive(d, now_ms);
                }
            }
            Body::BridgeElection(p) => {
                if let Some(d) = self.bridge.on_election_msg(from, p, now_ms) {
                    self.apply_bridge_directive(d, now_ms);
                }
            }
            Body::BridgeTakeover(p) => self.bridge.on_takeover(from, p, now_ms),
            Body::BridgeCoordination(p) => self.bridge.on_coordination(from, p, now_ms),
            Body::NtpTime(p) => {
                // Wall-clock anchors are accepted from bridges only.
                if self.bridge.is_known_bridge(from) {
                    self.timesync.set_wall_anchor(p.ntp_time, Self::local_us(now_ms));
                } else {
                    debug!(
                        target: "treemesh::remote",
                        from,
                        "ignoring NTP anchor from non-bridge"
                    );
                }
            }
            _ => {}
        }
    }

    fn apply_bridge_directive(&mut self, directive: BridgeDirective, now_ms: u64) {
        match directive {
            BridgeDirective::StatusChanged { bridge, has_internet } => {
                if let Some(cb) = self.callbacks.on_bridge_status_changed.as_mut() {
                    cb(bridge, has_internet);
                }
                if has_internet {
                    let batch = self.queue.flush(now_ms);
                    if !batch.is_empty() {
                        info!(
                            target: "treemesh::remote",
                            n = batch.len(),
                            "uplink restored, flushing offline queue"
                        );
                        if let Some(cb) = self.callbacks.on_queue_flush.as_mut() {
                            cb(batch);
                        }
                    }
                }
            }
            BridgeDirective::OpenElection(payload) => {
                self.broadcast_internal(
                    TYPE_BRIDGE_ELECTION,
                    &Body::BridgeElection(payload),
                    now_ms,
                );
                if let Some(old) = self.election_task.take() {
                    self.scheduler.cancel(old);
                }
                self.election_task = Some(self.scheduler.schedule(
                    now_ms,
                    self.config.bridge.election_timeout_ms,
                    Repeat::Once,
                    MeshTask::ElectionClose,
                ));
            }
            BridgeDirective::BeginPromotion => {
                if let Some(cb) = self.callbacks.on_promotion_requested.as_mut() {
                    cb();
                }
                if let Some(outcome) = self.auto_associate {
                    let _ = self.report_router_association(outcome, now_ms);
                    return;
                }
                self.promotion_task = Some(self.scheduler.schedule(
                    now_ms,
                    self.config.bridge.promotion_timeout_ms,
                    Repeat::Once,
                    MeshTask::PromotionTimeout,
                ));
            }
        }
    }

    // -------------------------------------------------------------------------
    // Scheduler
    // -------------------------------------------------------------------------

    pub fn next_deadline(&mut self) -> Option<u64> {
        self.scheduler.next_deadline()
    }

    pub fn run_due(&mut self, now_ms: u64) {
        for (_, task) in self.scheduler.take_due(now_ms) {
            self.run_task(task, now_ms);
        }
    }

    fn run_task(&mut self, task: MeshTask, now_ms: u64) {
        match task {
            MeshTask::ScanTick => {
                let channel = self.topology.channel();
                self.driver.request_scan(ScanScope::CurrentChannel(channel));
                let interval = self.topology.scan_interval_ms(self.has_station_uplink());
                self.scan_task = Some(self.scheduler.schedule(
                    now_ms,
                    interval,
                    Repeat::Once,
                    MeshTask::ScanTick,
                ));
            }
            MeshTask::TimeSyncTick => self.initiate_time_sync(now_ms),
            MeshTask::PaceClockTick => self.timesync.pace_backward(Self::local_us(now_ms)),
            MeshTask::HandshakeTimeout(conn) => {
                let pending = self
                    .connections
                    .get(&conn)
                    .is_some_and(|c| !c.is_established());
                if pending {
                    warn!(target: "treemesh::connection", conn, "handshake timeout");
                    self.close_conn(conn, CloseReason::HandshakeTimeout, now_ms);
                }
            }
            MeshTask::NodeSyncBroadcast => self.broadcast_node_sync(),
            MeshTask::BridgeWatchTick => {
                if let Some(d) = self.bridge.check_bridge_timeout(now_ms) {
                    self.apply_bridge_directive(d, now_ms);
                }
            }
            MeshTask::ElectionClose => {
                self.election_task = None;
                if let Some(d) = self.bridge.close_election(now_ms) {
                    self.apply_bridge_directive(d, now_ms);
                }
            }
            MeshTask::PromotionTimeout => {
                self.promotion_task = None;
                if self.bridge.role() == BridgeRole::Promoting {
                    let _ = self.fail_promotion(now_ms, "promotion window expired");
                }
            }
            MeshTask::BridgeStatusTick => self.bridge_status_tick(now_ms),
            MeshTask::BackoffSweep => self.topology.sweep_backoff(now_ms),
            MeshTask::StatusLog => {
                let peers = self.connections.values().filter(|c| c.is_established()).count();
                info!(
                    target: "treemesh::general",
                    peers,
                    nodes = self.tree_size(),
                    offset_us = self.timesync.offset_us(),
                    queue = self.queue.size(None),
                    role = ?self.bridge.role(),
                    "status"
                );
            }
        }
    }

    fn bridge_status_tick(&mut self, now_ms: u64) {
        if !self.bridge.is_active() {
            if let Some(task) = self.bridge_status_task.take() {
                self.scheduler.cancel(task);
            }
            return;
        }
        let status = self.bridge.make_status(now_ms);
        let internet = status.internet_connected;
        self.broadcast_internal(TYPE_BRIDGE_STATUS, &Body::BridgeStatus(status), now_ms);

        if self.config.bridge.multi_bridge.enabled {
            let load = (self.queue.size(None) * 100 / self.config.message_queue.max_size) as u8;
            let coordination = self.bridge.make_coordination(load, now_ms);
            self.broadcast_internal(
                TYPE_BRIDGE_COORDINATION,
                &Body::BridgeCoordination(coordination),
                now_ms,
            );
        }
        if internet {
            let anchor = Body::NtpTime(NtpTimePayload {
                ntp_time: unix_time_secs(),
                accuracy_ms: 1_000,
                source: "host".to_string(),
                timestamp: now_ms,
            });
            self.broadcast_internal(TYPE_NTP_TIME, &anchor, now_ms);
        }
    }

    // -------------------------------------------------------------------------
    // Outbound plumbing
    // -------------------------------------------------------------------------

    fn send_package(
        &mut self,
        conn: ConnId,
        type_code: u16,
        dest: NodeId,
        routing: Routing,
        body: &Body,
    ) {
        let envelope = Envelope {
            type_code,
            from: self.local_id,
            dest,
            routing,
            msg_id: self.router.next_msg_id(),
        };
        match wire::to_line(&envelope, body) {
            Ok(line) => self.enqueue_line(conn, line, priority_for(type_code)),
            Err(e) => warn!("cannot serialize type {type_code}: {e}"),
        }
    }

    fn broadcast_internal(&mut self, type_code: u16, body: &Body, now_ms: u64) {
        let envelope = Envelope {
            type_code,
            from: self.local_id,
            dest: BROADCAST_NODE,
            routing: Routing::Broadcast,
            msg_id: self.router.next_msg_id(),
        };
        match wire::to_line(&envelope, body) {
            Ok(line) => {
                self.router.first_sighting(self.local_id, envelope.msg_id, now_ms);
                let targets = self.router.broadcast_targets(0, self.connections.values());
                for conn in targets {
                    self.enqueue_line(conn, line.clone(), priority_for(type_code));
                }
            }
            Err(e) => warn!("cannot serialize type {type_code}: {e}"),
        }
    }

    fn enqueue_line(&mut self, conn: ConnId, line: String, priority: Priority) {
        let queued = match self.connections.get_mut(&conn) {
            Some(c) => c.enqueue(line, priority),
            None => false,
        };
        if queued {
            self.flush_conn(conn);
        }
    }

    fn flush_conn(&mut self, conn: ConnId) {
        loop {
            let line = match self.connections.get(&conn).and_then(|c| c.peek_outbound()) {
                Some(l) => l.to_string(),
                None => return,
            };
            if !self.driver.send(conn, &line) {
                return;
            }
            match self.connections.get_mut(&conn) {
                Some(c) => c.pop_outbound(),
                None => return,
            }
        }
    }

    // -------------------------------------------------------------------------
    // Teardown
    // -------------------------------------------------------------------------

    /// Locally initiated close: tell the driver, then clean up.
    fn close_conn(&mut self, conn: ConnId, reason: CloseReason, now_ms: u64) {
        if let Some(c) = self.connections.get_mut(&conn) {
            c.begin_close();
        }
        self.driver.close(conn, reason);
        self.cleanup_conn(conn, reason, now_ms);
    }

    /// Shared teardown for local and remote closes: cancel owned tasks,
    /// reclaim routes, notify, resume scanning.
    fn cleanup_conn(&mut self, conn: ConnId, reason: CloseReason, now_ms: u64) {
        let Some(mut c) = self.connections.remove(&conn) else {
            return;
        };
        if let Some(timer) = c.handshake_timer.take() {
            self.scheduler.cancel(timer);
        }
        let peer = c.peer_id;
        let was_established = c.is_established();

        info!(
            target: "treemesh::connection",
            conn,
            peer = peer.unwrap_or(0),
            reason = reason.as_str(),
            "connection closed"
        );

        if let Some(peer) = peer {
            self.timesync.forget_peer(peer);
        }
        if was_established {
            if let Some(peer) = peer {
                if let Some(cb) = self.callbacks.on_dropped.as_mut() {
                    cb(peer);
                }
            }
            // Remaining peers learn the revised subtree.
            self.schedule_node_sync(now_ms);
        }
        if c.side == Side::Station {
            // Lost the uplink: rejoin promptly on the fast cadence.
            if let Some(task) = self.scan_task.take() {
                self.scheduler.cancel(task);
            }
            self.scan_task =
                Some(self.scheduler.schedule(now_ms, 0, Repeat::Once, MeshTask::ScanTick));
        }
    }
}

// =============================================================================
// TOKIO RUNNER
// =============================================================================

/// A `MeshCore` over the TCP driver, driven by a tokio event loop.
/// One task owns the core; link events and scheduler deadlines are the
/// only wake sources.
pub struct Mesh {
    core: MeshCore<crate::link::tcp::TcpLinkDriver>,
    events: tokio::sync::mpsc::UnboundedReceiver<LinkEvent>,
    epoch: std::time::Instant,
}

impl Mesh {
    pub async fn new(
        config: MeshConfig,
        local_id: NodeId,
        link_config: crate::link::tcp::TcpLinkConfig,
    ) -> std::io::Result<Self> {
        let (mut driver, events) = crate::link::tcp::TcpLinkDriver::new(link_config);
        driver.start().await?;
        Ok(Self {
            core: MeshCore::new(config, local_id, driver),
            events,
            epoch: std::time::Instant::now(),
        })
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Configure callbacks and handlers before `run`.
    pub fn core_mut(&mut self) -> &mut MeshCore<crate::link::tcp::TcpLinkDriver> {
        &mut self.core
    }

    pub fn core(&self) -> &MeshCore<crate::link::tcp::TcpLinkDriver> {
        &self.core
    }

    /// Drive the mesh until the link event channel closes.
    pub async fn run(&mut self) {
        let now = self.now_ms();
        self.core.start(now);
        loop {
            let sleep_ms = self
                .core
                .next_deadline()
                .map(|d| d.saturating_sub(self.now_ms()))
                .unwrap_or(60_000);
            tokio::select! {
                maybe_event = self.events.recv() => match maybe_event {
                    Some(event) => {
                        let now = self.now_ms();
                        self.core.handle_link_event(event, now);
                    }
                    None => break,
                },
                _ = tokio::time::sleep(std::time::Duration::from_millis(sleep_ms)) => {}
            }
            let now = self.now_ms();
            self.core.run_due(now);
        }
    }

    pub fn shutdown(&mut self) {
        let now = self.now_ms();
        self.core.shutdown(now);
        self.core.driver_mut().shutdown();
    }
}
