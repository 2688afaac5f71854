//! In-memory link driver for deterministic multi-node simulation.
//!
//! A [`SimHub`] models the shared medium: registered access endpoints with
//! channels and signal strengths, paired endpoints per connection, and one
//! event queue per node. Tests register a [`SimLink`] per mesh core, drive
//! the cores by draining queues, and control time explicitly.
//!
//! Single-threaded by construction (`Rc<RefCell>`): events are queued by
//! driver calls and handed out via [`SimHub::take_events`], so no driver
//! call ever re-enters a core.

use super::{ConnId, LinkDriver, LinkEvent, ScanCandidate, ScanScope};
use crate::types::CloseReason;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

struct NodeState {
    ssid: String,
    channel: u8,
    /// Signal strength others observe when scanning this endpoint.
    rssi: i16,
    ap_up: bool,
    queue: VecDeque<LinkEvent>,
}

struct Endpoint {
    node: usize,
    peer: ConnId,
}

struct HubInner {
    next_conn: ConnId,
    nodes: Vec<NodeState>,
    endpoints: HashMap<ConnId, Endpoint>,
}

impl HubInner {
    fn close_endpoint(&mut self, conn: ConnId, notify_local: bool) {
        let Some(ep) = self.endpoints.remove(&conn) else {
            return;
        };
        if notify_local {
            self.nodes[ep.node].queue.push_back(LinkEvent::Closed {
                conn,
                reason: CloseReason::TransportError,
            });
        }
        if let Some(peer_ep) = self.endpoints.remove(&ep.peer) {
            self.nodes[peer_ep.node].queue.push_back(LinkEvent::Closed {
                conn: ep.peer,
                reason: CloseReason::TransportError,
            });
        }
    }

    fn close_all_for(&mut self, node: usize, notify_local: bool) {
        let owned: Vec<ConnId> = self
            .endpoints
            .iter()
            .filter(|(_, ep)| ep.node == node)
            .map(|(id, _)| *id)
            .collect();
        for conn in owned {
            self.close_endpoint(conn, notify_local);
        }
    }
}

#[derive(Clone)]
pub struct SimHub {
    inner: Rc<RefCell<HubInner>>,
}

impl SimHub {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(HubInner {
                next_conn: 1,
                nodes: Vec::new(),
                endpoints: HashMap::new(),
            })),
        }
    }

    /// Register a node's access endpoint and get its driver.
    pub fn register(&self, ssid: &str, rssi: i16, channel: u8) -> SimLink {
        let mut inner = self.inner.borrow_mut();
        let node = inner.nodes.len();
        inner.nodes.push(NodeState {
            ssid: ssid.to_string(),
            channel,
            rssi,
            ap_up: true,
            queue: VecDeque::new(),
        });
        SimLink { hub: self.clone(), node }
    }

    /// Drain a node's pending link events.
    pub fn take_events(&self, node: usize) -> Vec<LinkEvent> {
        self.inner.borrow_mut().nodes[node].queue.drain(..).collect()
    }

    pub fn has_events(&self, node: usize) -> bool {
        !self.inner.borrow().nodes[node].queue.is_empty()
    }

    /// Power the node's endpoint off, dropping all its connections.
    pub fn power_off(&self, node: usize) {
        let mut inner = self.inner.borrow_mut();
        inner.nodes[node].ap_up = false;
        inner.close_all_for(node, false);
        inner.nodes[node].queue.clear();
    }

    pub fn set_rssi(&self, node: usize, rssi: i16) {
        self.inner.borrow_mut().nodes[node].rssi = rssi;
    }

    /// Move a node's endpoint to another channel without the node's
    /// cooperation (used to stage channel-resync scenarios).
    pub fn set_channel(&self, node: usize, channel: u8) {
        self.inner.borrow_mut().nodes[node].channel = channel;
    }

    pub fn channel_of(&self, node: usize) -> u8 {
        self.inner.borrow().nodes[node].channel
    }
}

impl Default for SimHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-node driver handle into the hub.
pub struct SimLink {
    hub: SimHub,
    node: usize,
}

impl SimLink {
    pub fn node_index(&self) -> usize {
        self.node
    }
}

impl LinkDriver for SimLink {
    fn request_scan(&mut self, scope: ScanScope) {
        let mut inner = self.hub.inner.borrow_mut();
        let candidates: Vec<ScanCandidate> = inner
            .nodes
            .iter()
            .enumerate()
            .filter(|(i, n)| {
                *i != self.node
                    && n.ap_up
                    && match scope {
                        ScanScope::CurrentChannel(ch) => n.channel == ch,
                        ScanScope::AllChannels => true,
                    }
            })
            .map(|(_, n)| ScanCandidate {
                ssid: n.ssid.clone(),
                rssi: n.rssi,
                channel: n.channel,
                target: n.ssid.clone(),
            })
            .collect();
        inner.nodes[self.node]
            .queue
            .push_back(LinkEvent::ScanComplete { scope, candidates });
    }

    fn restart_access_point(&mut self, channel: u8) {
        let mut inner = self.hub.inner.borrow_mut();
        inner.close_all_for(self.node, true);
        let state = &mut inner.nodes[self.node];
        state.channel = channel;
        state.ap_up = true;
        state.queue.push_back(LinkEvent::ApRestarted { channel });
    }

    fn connect(&mut self, candidate: &ScanCandidate) {
        let mut inner = self.hub.inner.borrow_mut();
        // Radios only reach endpoints on the channel they are tuned to.
        let found = inner
            .nodes
            .iter()
            .position(|n| n.ssid == candidate.target && n.ap_up && n.channel == candidate.channel);
        match found {
            Some(peer_node) if peer_node != self.node => {
                let a = inner.next_conn;
                let b = inner.next_conn + 1;
                inner.next_conn += 2;
                inner.endpoints.insert(a, Endpoint { node: self.node, peer: b });
                inner.endpoints.insert(b, Endpoint { node: peer_node, peer: a });
                inner.nodes[peer_node]
                    .queue
                    .push_back(LinkEvent::Accepted { conn: b });
                inner.nodes[self.node].queue.push_back(LinkEvent::Connected {
                    conn: a,
                    candidate: candidate.clone(),
                });
            }
            _ => {
                inner.nodes[self.node].queue.push_back(LinkEvent::ConnectFailed {
                    target: candidate.target.clone(),
                });
            }
        }
    }

    fn send(&mut self, conn: ConnId, line: &str) -> bool {
        let mut inner = self.hub.inner.borrow_mut();
        let Some(ep) = inner.endpoints.get(&conn) else {
            return false;
        };
        let peer_conn = ep.peer;
        let Some(peer_ep) = inner.endpoints.get(&peer_conn) else {
            return false;
        };
        let peer_node = peer_ep.node;
        inner.nodes[peer_node].queue.push_back(LinkEvent::Data {
            conn: peer_conn,
            bytes: line.as_bytes().to_vec(),
        });
        true
    }

    fn close(&mut self, conn: ConnId, _reason: CloseReason) {
        self.hub.inner.borrow_mut().close_endpoint(conn, false);
    }
}
