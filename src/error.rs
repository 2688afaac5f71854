//! Error surface for fallible local operations.
//!
//! Asynchronous failures (transport drops, bridge health changes, queue
//! thresholds) are reported through registered callbacks instead; there is
//! no global error state.

use crate::types::NodeId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MeshError>;

#[derive(Debug, Error)]
pub enum MeshError {
    /// Unicast destination not present in any known subtree.
    #[error("unreachable: node {0} is not in any known subtree")]
    Unreachable(NodeId),

    /// Send attempted on a connection that is closed or closing.
    #[error("transport_closed: connection to node {0} is closed")]
    TransportClosed(NodeId),

    /// A frame exceeded the wire line limit, locally or from a peer.
    #[error("oversize: frame of {0} bytes exceeds line limit")]
    Oversize(usize),

    /// Handshake timed out, or the peer was a self-loop / cycle.
    #[error("handshake_failed: {0}")]
    HandshakeFailed(&'static str),

    /// Router association did not complete within the promotion window.
    #[error("bridge_promotion_failed: {0}")]
    BridgePromotionFailed(&'static str),

    /// Queue is full and holds only CRITICAL entries.
    #[error("queue_saturated_critical")]
    QueueSaturatedCritical,

    /// Wire line was not a valid protocol envelope.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// Queue persistence I/O failed.
    #[error("queue storage: {0}")]
    QueueStorage(#[from] std::io::Error),
}
