//! Cooperative task scheduler.
//!
//! Every long-running responsibility in the core is a scheduled task with an
//! optional period; handler bodies run to completion before the next task
//! fires. Cancellation is synchronous. Timeouts are one-shot tasks.
//!
//! The scheduler holds task values, not closures: the mesh dispatches on the
//! task enum, so tasks capture nothing but data.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

pub type TaskHandle = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    Once,
    /// Re-armed relative to the firing instant: a late tick does not burst.
    Every(u64),
}

struct TaskState<T> {
    task: T,
    repeat: Repeat,
}

pub struct Scheduler<T> {
    next_handle: TaskHandle,
    tasks: HashMap<TaskHandle, TaskState<T>>,
    // Min-heap of (due_ms, handle). Stale heap entries (cancelled or
    // re-armed) are skipped at pop time by consulting `tasks`.
    deadlines: BinaryHeap<Reverse<(u64, TaskHandle)>>,
}

impl<T: Clone> Scheduler<T> {
    pub fn new() -> Self {
        Self {
            next_handle: 1,
            tasks: HashMap::new(),
            deadlines: BinaryHeap::new(),
        }
    }

    /// Schedule `task` to fire at `now_ms + delay_ms`, then per `repeat`.
    pub fn schedule(&mut self, now_ms: u64, delay_ms: u64, repeat: Repeat, task: T) -> TaskHandle {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.tasks.insert(handle, TaskState { task, repeat });
        self.deadlines.push(Reverse((now_ms.saturating_add(delay_ms), handle)));
        handle
    }

    /// Remove a task. Returns whether it was still pending.
    pub fn cancel(&mut self, handle: TaskHandle) -> bool {
        self.tasks.remove(&handle).is_some()
    }

    pub fn is_pending(&self, handle: TaskHandle) -> bool {
        self.tasks.contains_key(&handle)
    }

    /// Earliest live deadline, for the event loop's sleep.
    pub fn next_deadline(&mut self) -> Option<u64> {
        while let Some(Reverse((due, handle))) = self.deadlines.peek().copied() {
            if self.tasks.contains_key(&handle) {
                return Some(due);
            }
            // Cancelled: drop the stale entry.
            let _ = self.deadlines.pop();
        }
        None
    }

    /// Pop every task due at or before `now_ms`, re-arming periodic ones.
    pub fn take_due(&mut self, now_ms: u64) -> Vec<(TaskHandle, T)> {
        let mut due = Vec::new();
        loop {
            match self.deadlines.peek().copied() {
                Some(Reverse((at, _))) if at <= now_ms => {}
                _ => break,
            }
            let Some(Reverse((_, handle))) = self.deadlines.pop() else {
                break;
            };
            let Some(state) = self.tasks.get(&handle) else {
                continue; // cancelled
            };
            due.push((handle, state.task.clone()));
            match state.repeat {
                Repeat::Once => {
                    self.tasks.remove(&handle);
                }
                Repeat::Every(period) => {
                    self.deadlines
                        .push(Reverse((now_ms.saturating_add(period.max(1)), handle)));
                }
            }
        }
        due
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl<T: Clone> Default for Scheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}
