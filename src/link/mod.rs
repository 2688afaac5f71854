//! Link-layer abstraction.
//!
//! The core consumes discrete connection endpoints that deliver ordered
//! bytes and signal connect/disconnect; it never touches sockets or radios
//! directly. Two drivers ship with the crate: [`tcp`] for real deployments
//! (the desktop transport) and [`memory`] for deterministic multi-node
//! simulation in tests.
//!
//! Guarantees required of a driver: in-order byte delivery per endpoint, no
//! cross-endpoint ordering, non-blocking best-effort sends.

pub mod memory;
pub mod tcp;

use crate::types::{CloseReason, MAX_LINE_BYTES};

/// Driver-scoped connection endpoint id.
pub type ConnId = u64;

// =============================================================================
// SCANNING
// =============================================================================

/// Scan breadth: the normal loop scans the operating channel only; channel
/// re-synchronization widens to all channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanScope {
    CurrentChannel(u8),
    AllChannels,
}

/// A visible network reported by a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanCandidate {
    /// Advertised network name; mesh members are `<prefix>-<nodeId>`.
    pub ssid: String,
    /// Signal strength in dBm as seen locally.
    pub rssi: i16,
    pub channel: u8,
    /// Opaque connect address understood by the driver that produced it.
    pub target: String,
}

// =============================================================================
// EVENTS
// =============================================================================

/// Everything a driver reports back to the core. Delivery order per
/// connection matches the byte stream; events for different connections are
/// unordered relative to each other.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// Inbound endpoint accepted (this node is the AP side).
    Accepted { conn: ConnId },
    /// Outbound endpoint established (this node is the station side).
    Connected { conn: ConnId, candidate: ScanCandidate },
    ConnectFailed { target: String },
    Data { conn: ConnId, bytes: Vec<u8> },
    /// Remote or transport-initiated close. Locally requested closes are
    /// not echoed.
    Closed { conn: ConnId, reason: CloseReason },
    ScanComplete { scope: ScanScope, candidates: Vec<ScanCandidate> },
    /// Access endpoint restarted (after a channel switch).
    ApRestarted { channel: u8 },
}

// =============================================================================
// DRIVER CONTRACT
// =============================================================================

/// Non-blocking link operations. Implementations queue work and report
/// outcomes through their [`LinkEvent`] stream; none of these calls may
/// block the caller.
pub trait LinkDriver {
    fn request_scan(&mut self, scope: ScanScope);
    fn restart_access_point(&mut self, channel: u8);
    fn connect(&mut self, candidate: &ScanCandidate);
    /// Queue one LF-terminated line. Returns false when the endpoint is
    /// gone or its transmit queue rejected the frame.
    fn send(&mut self, conn: ConnId, line: &str) -> bool;
    fn close(&mut self, conn: ConnId, reason: CloseReason);
}

// =============================================================================
// LINE ASSEMBLY
// =============================================================================

/// Why assembly failed; both end the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssembleError {
    /// Buffered bytes exceeded MAX_LINE_BYTES without a terminator.
    Oversize,
    /// A completed line was not valid UTF-8.
    Utf8,
}

/// Reassembles LF-terminated lines from a byte stream, with the per-peer
/// buffer capped at MAX_LINE_BYTES.
#[derive(Debug, Default)]
pub struct LineAssembler {
    buf: Vec<u8>,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Feed bytes; returns completed lines (terminator included).
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<String>, AssembleError> {
        let mut lines = Vec::new();
        for &b in bytes {
            self.buf.push(b);
            if b == b'\n' {
                let raw = std::mem::take(&mut self.buf);
                let line = String::from_utf8(raw).map_err(|_| AssembleError::Utf8)?;
                lines.push(line);
            } else if self.buf.len() >= MAX_LINE_BYTES {
                self.buf.clear();
                return Err(AssembleError::Oversize);
            }
        }
        Ok(lines)
    }

    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }
}
