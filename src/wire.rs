//! Wire format: UTF-8 JSON, one object per line, LF-terminated.
//!
//! Envelope fields are `type`, `from`, `dest` (0 = broadcast), `routing`
//! (0 = SINGLE, 1 = NEIGHBOUR, 2 = BROADCAST) and `msgId`, a per-origin
//! wrapping counter used for broadcast dedup.
//!
//! A parsed line keeps its original text alongside the typed view; forwarding
//! re-sends the original line, so fields this node does not understand pass
//! through untouched.

use crate::error::{MeshError, Result};
use crate::types::{
    MAX_LINE_BYTES, NodeId, Routing, SubtreeDescriptor, TYPE_BRIDGE_COORDINATION,
    TYPE_BRIDGE_ELECTION, TYPE_BRIDGE_STATUS, TYPE_BRIDGE_TAKEOVER, TYPE_HANDSHAKE,
    TYPE_NODE_SYNC_REPLY, TYPE_NODE_SYNC_REQUEST, TYPE_NTP_TIME, TYPE_TIME_SYNC_REPLY,
    TYPE_TIME_SYNC_REQUEST,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// =============================================================================
// ENVELOPE
// =============================================================================

/// Fields common to every package on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    pub type_code: u16,
    pub from: NodeId,
    /// 0 means broadcast.
    pub dest: NodeId,
    pub routing: Routing,
    /// Per-origin wrapping counter; dedup key is `(from, msg_id)`.
    pub msg_id: u32,
}

// =============================================================================
// TYPED BODIES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakePayload {
    pub node_id: NodeId,
    pub subtree: SubtreeDescriptor,
    pub capabilities: u64,
    pub mesh_time_estimate: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSyncRequestPayload {
    /// Origin send time, mesh-time microseconds.
    pub t1: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSyncReplyPayload {
    /// Echo of the request's origin send time.
    pub t1: i64,
    /// Request receive time at the responder.
    pub t2: i64,
    /// Reply send time at the responder.
    pub t3: i64,
    pub subtree_size: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSyncPayload {
    pub subtree: SubtreeDescriptor,
    pub subtree_size: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStatusPayload {
    pub internet_connected: bool,
    /// dBm; 0 means the router is not visible.
    pub router_rssi: i16,
    pub router_channel: u8,
    /// Seconds since the bridge came up.
    pub uptime: u64,
    pub gateway_ip: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeElectionPayload {
    pub router_rssi: i16,
    pub uptime: u64,
    pub free_memory: u64,
    pub timestamp: u64,
    pub router_ssid: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeTakeoverPayload {
    pub previous_bridge: NodeId,
    pub reason: String,
    pub router_rssi: i16,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeCoordinationPayload {
    pub priority: u8,
    pub role: String,
    /// Load percentage 0–100.
    pub load: u8,
    pub peer_bridges: Vec<NodeId>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NtpTimePayload {
    /// Unix seconds from the bridge's upstream time source.
    pub ntp_time: u64,
    pub accuracy_ms: u32,
    pub source: String,
    pub timestamp: u64,
}

/// Typed view of a package body. `Unknown` carries the raw object so the
/// package can be forwarded without loss.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Handshake(HandshakePayload),
    TimeSyncRequest(TimeSyncRequestPayload),
    TimeSyncReply(TimeSyncReplyPayload),
    NodeSyncRequest(NodeSyncPayload),
    NodeSyncReply(NodeSyncPayload),
    BridgeStatus(BridgeStatusPayload),
    BridgeElection(BridgeElectionPayload),
    BridgeTakeover(BridgeTakeoverPayload),
    BridgeCoordination(BridgeCoordinationPayload),
    NtpTime(NtpTimePayload),
    Unknown(Map<String, Value>),
}

impl Body {
    pub fn kind(&self) -> &'static str {
        match self {
            Body::Handshake(_) => "handshake",
            Body::TimeSyncRequest(_) => "time_sync_request",
            Body::TimeSyncReply(_) => "time_sync_reply",
            Body::NodeSyncRequest(_) => "node_sync_request",
            Body::NodeSyncReply(_) => "node_sync_reply",
            Body::BridgeStatus(_) => "bridge_status",
            Body::BridgeElection(_) => "bridge_election",
            Body::BridgeTakeover(_) => "bridge_takeover",
            Body::BridgeCoordination(_) => "bridge_coordination",
            Body::NtpTime(_) => "ntp_time",
            Body::Unknown(_) => "unknown",
        }
    }
}

// =============================================================================
// PARSED PACKAGE
// =============================================================================

/// A package parsed off the wire: typed view plus the original line for
/// transparent forwarding.
#[derive(Debug, Clone)]
pub struct PackageView {
    pub envelope: Envelope,
    pub body: Body,
    line: String,
}

impl PackageView {
    /// Original wire line, LF included. Forwarding sends this verbatim so
    /// fields unknown to this node survive the hop.
    pub fn raw_line(&self) -> &str {
        &self.line
    }
}

// =============================================================================
// PARSE
// =============================================================================

fn field_u64(map: &Map<String, Value>, key: &str) -> Option<u64> {
    map.get(key).and_then(Value::as_u64)
}

/// Parse one LF-terminated line into a package view.
pub fn parse_line(line: &str) -> Result<PackageView> {
    if line.len() > MAX_LINE_BYTES {
        return Err(MeshError::Oversize(line.len()));
    }

    let value: Value = serde_json::from_str(line.trim_end_matches('\n'))
        .map_err(|e| MeshError::Malformed(format!("not JSON: {e}")))?;
    let map = match value {
        Value::Object(map) => map,
        _ => return Err(MeshError::Malformed("not a JSON object".into())),
    };

    let type_code = field_u64(&map, "type")
        .and_then(|v| u16::try_from(v).ok())
        .ok_or_else(|| MeshError::Malformed("missing/invalid 'type'".into()))?;
    let from = field_u64(&map, "from")
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| MeshError::Malformed("missing/invalid 'from'".into()))?;
    let dest = field_u64(&map, "dest")
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| MeshError::Malformed("missing/invalid 'dest'".into()))?;
    let routing = field_u64(&map, "routing")
        .and_then(|v| u8::try_from(v).ok())
        .and_then(Routing::from_u8)
        .ok_or_else(|| MeshError::Malformed("missing/invalid 'routing'".into()))?;
    // Tolerated absent for interop with senders that predate dedup ids.
    let msg_id = field_u64(&map, "msgId").map(|v| v as u32).unwrap_or(0);

    let envelope = Envelope { type_code, from, dest, routing, msg_id };
    let body = parse_body(type_code, &map)?;

    let mut line = line.trim_end_matches('\n').to_string();
    line.push('\n');
    Ok(PackageView { envelope, body, line })
}

fn parse_body(type_code: u16, map: &Map<String, Value>) -> Result<Body> {
    fn typed<T: serde::de::DeserializeOwned>(map: &Map<String, Value>) -> Result<T> {
        serde_json::from_value(Value::Object(map.clone()))
            .map_err(|e| MeshError::Malformed(format!("bad body: {e}")))
    }

    Ok(match type_code {
        TYPE_HANDSHAKE => Body::Handshake(typed(map)?),
        TYPE_TIME_SYNC_REQUEST => Body::TimeSyncRequest(typed(map)?),
        TYPE_TIME_SYNC_REPLY => Body::TimeSyncReply(typed(map)?),
        TYPE_NODE_SYNC_REQUEST => Body::NodeSyncRequest(typed(map)?),
        TYPE_NODE_SYNC_REPLY => Body::NodeSyncReply(typed(map)?),
        TYPE_BRIDGE_STATUS => Body::BridgeStatus(typed(map)?),
        TYPE_BRIDGE_ELECTION => Body::BridgeElection(typed(map)?),
        TYPE_BRIDGE_TAKEOVER => Body::BridgeTakeover(typed(map)?),
        TYPE_BRIDGE_COORDINATION => Body::BridgeCoordination(typed(map)?),
        TYPE_NTP_TIME => Body::NtpTime(typed(map)?),
        _ => Body::Unknown(map.clone()),
    })
}

// =============================================================================
// SERIALIZE
// =============================================================================

fn body_value(body: &Body) -> Result<Value> {
    let value = match body {
        Body::Handshake(p) => serde_json::to_value(p),
        Body::TimeSyncRequest(p) => serde_json::to_value(p),
        Body::TimeSyncReply(p) => serde_json::to_value(p),
        Body::NodeSyncRequest(p) => serde_json::to_value(p),
        Body::NodeSyncReply(p) => serde_json::to_value(p),
        Body::BridgeStatus(p) => serde_json::to_value(p),
        Body::BridgeElection(p) => serde_json::to_value(p),
        Body::BridgeTakeover(p) => serde_json::to_value(p),
        Body::BridgeCoordination(p) => serde_json::to_value(p),
        Body::NtpTime(p) => serde_json::to_value(p),
        Body::Unknown(map) => Ok(Value::Object(map.clone())),
    };
    value.map_err(|e| MeshError::Malformed(format!("serialize: {e}")))
}

/// Serialize a package to one LF-terminated wire line.
pub fn to_line(envelope: &Envelope, body: &Body) -> Result<String> {
    let mut map = match body_value(body)? {
        Value::Object(map) => map,
        other => {
            return Err(MeshError::Malformed(format!(
                "body serialized to non-object: {other}"
            )));
        }
    };

    map.insert("type".into(), Value::from(envelope.type_code));
    map.insert("from".into(), Value::from(envelope.from));
    map.insert("dest".into(), Value::from(envelope.dest));
    map.insert("routing".into(), Value::from(envelope.routing.as_u8()));
    map.insert("msgId".into(), Value::from(envelope.msg_id));

    let mut line = serde_json::to_string(&Value::Object(map))
        .map_err(|e| MeshError::Malformed(format!("serialize: {e}")))?;
    if line.len() + 1 > MAX_LINE_BYTES {
        return Err(MeshError::Oversize(line.len() + 1));
    }
    line.push('\n');
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(type_code: u16, routing: Routing) -> Envelope {
        Envelope { type_code, from: 1000, dest: 0, routing, msg_id: 7 }
    }

    #[test]
    fn handshake_round_trip() {
        let body = Body::Handshake(HandshakePayload {
            node_id: 1000,
            subtree: SubtreeDescriptor {
                root: 1000,
                children: vec![SubtreeDescriptor::leaf(2000)],
            },
            capabilities: crate::types::CAP_BRIDGE,
            mesh_time_estimate: 123_456,
        });
        let env = envelope(TYPE_HANDSHAKE, Routing::Neighbour);
        let line = to_line(&env, &body).unwrap();
        let view = parse_line(&line).unwrap();
        assert_eq!(view.envelope, env);
        assert_eq!(view.body, body);
    }

    #[test]
    fn time_sync_round_trip() {
        let body = Body::TimeSyncReply(TimeSyncReplyPayload {
            t1: 10,
            t2: 20,
            t3: 30,
            subtree_size: 4,
        });
        let env = envelope(TYPE_TIME_SYNC_REPLY, Routing::Neighbour);
        let view = parse_line(&to_line(&env, &body).unwrap()).unwrap();
        assert_eq!(view.body, body);
    }

    #[test]
    fn bridge_bodies_round_trip() {
        let cases = vec![
            (
                TYPE_BRIDGE_STATUS,
                Body::BridgeStatus(BridgeStatusPayload {
                    internet_connected: true,
                    router_rssi: -42,
                    router_channel: 6,
                    uptime: 3600,
                    gateway_ip: "192.168.1.1".into(),
                    timestamp: 99,
                }),
            ),
            (
                TYPE_BRIDGE_ELECTION,
                Body::BridgeElection(BridgeElectionPayload {
                    router_rssi: -55,
                    uptime: 7200,
                    free_memory: 40_960,
                    timestamp: 100,
                    router_ssid: "upstream".into(),
                }),
            ),
            (
                TYPE_BRIDGE_TAKEOVER,
                Body::BridgeTakeover(BridgeTakeoverPayload {
                    previous_bridge: 50,
                    reason: "election".into(),
                    router_rssi: -42,
                    timestamp: 101,
                }),
            ),
            (
                TYPE_BRIDGE_COORDINATION,
                Body::BridgeCoordination(BridgeCoordinationPayload {
                    priority: 3,
                    role: "primary".into(),
                    load: 17,
                    peer_bridges: vec![200, 300],
                    timestamp: 102,
                }),
            ),
            (
                TYPE_NTP_TIME,
                Body::NtpTime(NtpTimePayload {
                    ntp_time: 1_700_000_000,
                    accuracy_ms: 50,
                    source: "pool.ntp.org".into(),
                    timestamp: 103,
                }),
            ),
        ];
        for (code, body) in cases {
            let env = envelope(code, Routing::Broadcast);
            let view = parse_line(&to_line(&env, &body).unwrap()).unwrap();
            assert_eq!(view.body, body, "type {code}");
        }
    }

    #[test]
    fn unknown_type_keeps_all_fields() {
        let line = "{\"type\":230,\"from\":9,\"dest\":0,\"routing\":2,\"msgId\":4,\
                    \"customField\":[1,2,3],\"nested\":{\"a\":true}}\n";
        let view = parse_line(line).unwrap();
        assert_eq!(view.envelope.type_code, 230);
        match &view.body {
            Body::Unknown(map) => {
                assert!(map.contains_key("customField"));
                assert!(map.contains_key("nested"));
            }
            other => panic!("expected unknown body, got {}", other.kind()),
        }
        // Forwarding uses the original text verbatim.
        assert_eq!(view.raw_line(), line);
    }

    #[test]
    fn known_type_ignores_extra_fields_but_raw_keeps_them() {
        let line = "{\"type\":5,\"from\":2,\"dest\":0,\"routing\":2,\"msgId\":1,\
                    \"subtree\":{\"root\":2},\"subtreeSize\":1,\"futureFlag\":true}\n";
        let view = parse_line(line).unwrap();
        match &view.body {
            Body::NodeSyncRequest(p) => assert_eq!(p.subtree.root, 2),
            other => panic!("expected node sync, got {}", other.kind()),
        }
        assert!(view.raw_line().contains("futureFlag"));
    }

    #[test]
    fn missing_envelope_fields_rejected() {
        assert!(parse_line("{\"type\":1,\"from\":2}\n").is_err());
        assert!(parse_line("[1,2,3]\n").is_err());
        assert!(parse_line("{\"type\":1,\"from\":2,\"dest\":0,\"routing\":9}\n").is_err());
    }

    #[test]
    fn oversize_line_rejected() {
        let big = format!(
            "{{\"type\":200,\"from\":1,\"dest\":0,\"routing\":2,\"pad\":\"{}\"}}\n",
            "x".repeat(MAX_LINE_BYTES)
        );
        assert!(matches!(parse_line(&big), Err(MeshError::Oversize(_))));
    }

    #[test]
    fn absent_msg_id_defaults_to_zero() {
        let line = "{\"type\":3,\"from\":8,\"dest\":9,\"routing\":1,\"t1\":5}\n";
        let view = parse_line(line).unwrap();
        assert_eq!(view.envelope.msg_id, 0);
    }
}
