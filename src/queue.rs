//! Offline priority message queue.
//!
//! Bounded store for traffic that cannot be delivered while the uplink is
//! down. Eviction under pressure follows a strict lattice: an incoming
//! CRITICAL evicts the oldest LOW, then NORMAL, then HIGH; HIGH evicts LOW
//! then NORMAL; NORMAL evicts LOW; LOW is dropped when nothing below it
//! remains. CRITICAL entries are never evicted by another enqueue — when
//! the queue holds only CRITICAL, a CRITICAL enqueue is refused with
//! `queue_saturated_critical`.
//!
//! Persistence is an optional collaborator: a JSON-lines blob replaced
//! atomically on save.

use crate::error::{MeshError, Result};
use crate::types::Priority;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use std::path::Path;
use tracing::{debug, warn};

// =============================================================================
// ENTRIES
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: u64,
    pub payload: Vec<u8>,
    /// Delivery target: an upstream URL or a mesh destination.
    pub destination: String,
    pub priority: Priority,
    pub enqueued_at_ms: u64,
    pub attempts: u32,
    /// Last time flush() handed this entry out; relay-dedup tracking.
    #[serde(default)]
    pub last_flushed_ms: Option<u64>,
}

/// Fill-level bands for the state-change callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Empty,
    Normal,
    /// At or above 75% of capacity.
    AboveThreeQuarters,
    Full,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Entries accepted over the queue's lifetime.
    pub queued: u64,
    /// Entries removed after confirmed delivery.
    pub sent: u64,
    /// Entries evicted, rejected, or pruned.
    pub dropped: u64,
}

pub type StateCallback = Box<dyn FnMut(QueueState) + Send>;

// =============================================================================
// QUEUE
// =============================================================================

pub struct MessageQueue {
    max_size: usize,
    tracking_timeout_ms: u64,
    entries: Vec<QueuedMessage>,
    next_id: u64,
    stats: QueueStats,
    state: QueueState,
    on_state_change: Option<StateCallback>,
}

impl MessageQueue {
    pub fn new(max_size: usize, tracking_timeout_ms: u64) -> Self {
        Self {
            max_size: max_size.max(1),
            tracking_timeout_ms,
            entries: Vec::new(),
            next_id: 1,
            stats: QueueStats::default(),
            state: QueueState::Empty,
            on_state_change: None,
        }
    }

    pub fn set_state_callback(&mut self, cb: StateCallback) {
        self.on_state_change = Some(cb);
    }

    fn compute_state(&self) -> QueueState {
        let len = self.entries.len();
        if len == 0 {
            QueueState::Empty
        } else if len >= self.max_size {
            QueueState::Full
        } else if len * 4 >= self.max_size * 3 {
            QueueState::AboveThreeQuarters
        } else {
            QueueState::Normal
        }
    }

    fn after_mutation(&mut self) {
        let new_state = self.compute_state();
        if new_state != self.state {
            self.state = new_state;
            if let Some(cb) = self.on_state_change.as_mut() {
                cb(new_state);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Enqueue / eviction
    // -------------------------------------------------------------------------

    /// Store a message. `Ok(Some(id))` when stored, `Ok(None)` when the
    /// message itself was dropped per the eviction lattice (full queue,
    /// nothing below it to evict), `Err(queue_saturated_critical)` when a
    /// CRITICAL enqueue meets an all-CRITICAL queue.
    pub fn enqueue(
        &mut self,
        payload: Vec<u8>,
        destination: String,
        priority: Priority,
        now_ms: u64,
    ) -> Result<Option<u64>> {
        if self.entries.len() >= self.max_size && !self.evict_for(priority) {
            if priority == Priority::Critical {
                return Err(MeshError::QueueSaturatedCritical);
            }
            self.stats.dropped += 1;
            debug!(
                target: "treemesh::queue",
                priority = priority.as_str(),
                "queue full, message dropped"
            );
            return Ok(None);
        }

        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(QueuedMessage {
            id,
            payload,
            destination,
            priority,
            enqueued_at_ms: now_ms,
            attempts: 0,
            last_flushed_ms: None,
        });
        self.stats.queued += 1;
        self.after_mutation();
        Ok(Some(id))
    }

    /// Make room for an incoming entry of `priority`: evict the oldest
    /// entry of the lowest evictable class. Returns false when nothing
    /// may be evicted.
    fn evict_for(&mut self, priority: Priority) -> bool {
        for class in priority.evicts() {
            let victim = self
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.priority == *class)
                .min_by_key(|(_, e)| e.id)
                .map(|(i, _)| i);
            if let Some(i) = victim {
                let evicted = self.entries.remove(i);
                self.stats.dropped += 1;
                debug!(
                    target: "treemesh::queue",
                    id = evicted.id,
                    priority = evicted.priority.as_str(),
                    "evicted for incoming higher-priority message"
                );
                return true;
            }
        }
        false
    }

    // -------------------------------------------------------------------------
    // Flush / delivery bookkeeping
    // -------------------------------------------------------------------------

    /// Snapshot for transmission: priority order (CRITICAL, HIGH, NORMAL,
    /// LOW), FIFO within a class. Entries handed out within the tracking
    /// window are skipped; handed-out entries are stamped. The caller
    /// confirms each delivery with `remove(id)`.
    pub fn flush(&mut self, now_ms: u64) -> Vec<QueuedMessage> {
        let window = self.tracking_timeout_ms;
        let mut out: Vec<QueuedMessage> = self
            .entries
            .iter_mut()
            .filter(|e| {
                e.last_flushed_ms
                    .map(|at| now_ms.saturating_sub(at) >= window)
                    .unwrap_or(true)
            })
            .map(|e| {
                e.last_flushed_ms = Some(now_ms);
                e.clone()
            })
            .collect();
        out.sort_by_key(|e| (e.priority, e.id));
        out
    }

    /// Confirm delivery; the entry is destroyed and counted as sent.
    pub fn remove(&mut self, id: u64) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        let removed = self.entries.len() != before;
        if removed {
            self.stats.sent += 1;
            self.after_mutation();
        }
        removed
    }

    pub fn increment_attempts(&mut self, id: u64) -> bool {
        match self.entries.iter_mut().find(|e| e.id == id) {
            Some(e) => {
                e.attempts += 1;
                true
            }
            None => false,
        }
    }

    /// Drop entries older than `max_age_ms`. Aged-out entries count as
    /// dropped — this is the only path that may destroy CRITICAL entries
    /// besides `clear` and confirmed delivery.
    pub fn prune(&mut self, max_age_ms: u64, now_ms: u64) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|e| now_ms.saturating_sub(e.enqueued_at_ms) <= max_age_ms);
        let pruned = before - self.entries.len();
        if pruned > 0 {
            self.stats.dropped += pruned as u64;
            self.after_mutation();
        }
        pruned
    }

    pub fn clear(&mut self) {
        let cleared = self.entries.len();
        self.entries.clear();
        self.stats.dropped += cleared as u64;
        self.after_mutation();
    }

    /// Entry count, optionally for one priority class.
    pub fn size(&self, filter: Option<Priority>) -> usize {
        match filter {
            None => self.entries.len(),
            Some(p) => self.entries.iter().filter(|e| e.priority == p).count(),
        }
    }

    pub fn stats(&self) -> QueueStats {
        self.stats
    }

    pub fn state(&self) -> QueueState {
        self.state
    }

    pub fn contains(&self, id: u64) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }

    // -------------------------------------------------------------------------
    // Optional persistence
    // -------------------------------------------------------------------------

    /// Write the queue as JSON-lines with atomic replace (temp + rename).
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let tmp = path.with_extension("tmp");
        {
            let file = std::fs::File::create(&tmp)?;
            let mut w = std::io::BufWriter::new(file);
            for entry in &self.entries {
                let line = serde_json::to_string(entry)
                    .map_err(|e| MeshError::Malformed(format!("queue entry: {e}")))?;
                writeln!(w, "{line}")?;
            }
            w.flush()?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Load entries from a JSON-lines blob. A missing file leaves the
    /// queue empty; unparseable lines are skipped with a warning.
    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<usize> {
        let path = path.as_ref();
        let file = match std::fs::File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let reader = std::io::BufReader::new(file);
        let mut loaded = 0usize;
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<QueuedMessage>(&line) {
                Ok(entry) => {
                    if self.entries.len() < self.max_size {
                        self.next_id = self.next_id.max(entry.id + 1);
                        self.entries.push(entry);
                        loaded += 1;
                    }
                }
                Err(e) => warn!("skipping bad queue entry: {e}"),
            }
        }
        if loaded > 0 {
            self.after_mutation();
        }
        Ok(loaded)
    }
}
