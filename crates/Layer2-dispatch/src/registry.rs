//! Dispatch registry - per-key lane state, aliases and admission bookkeeping
//!
//! Plain data: the queue owns the only instance behind a mutex and performs
//! every transition while holding it. Nothing here awaits.

use crate::handle::ProcessHandle;
use crate::key::{DispatchKey, Lane, LaneMap};
use crate::state::LanePhase;
use chrono::{DateTime, Utc};
use corral_foundation::Result;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tokio::sync::oneshot;

/// Deferred task body
pub type TaskWork = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// Task waiting for (or holding) the task lane
pub struct QueuedTask {
    pub id: String,
    pub preview: String,
    pub(crate) work: TaskWork,
    pub(crate) completion: oneshot::Sender<Result<()>>,
}

/// Pending unit of work
pub enum QueueEntry {
    /// Re-derive pending messages on dequeue
    CheckMessages,
    /// Run a task body
    RunTask(QueuedTask),
}

impl QueueEntry {
    pub fn is_check(&self) -> bool {
        matches!(self, QueueEntry::CheckMessages)
    }

    pub fn task_id(&self) -> Option<&str> {
        match self {
            QueueEntry::RunTask(task) => Some(&task.id),
            QueueEntry::CheckMessages => None,
        }
    }
}

impl std::fmt::Debug for QueueEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueEntry::CheckMessages => write!(f, "CheckMessages"),
            QueueEntry::RunTask(task) => write!(f, "RunTask({})", task.id),
        }
    }
}

/// Snapshot of the running background task for a key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveTaskInfo {
    pub task_id: String,
    pub preview: String,
    pub started_at: DateTime<Utc>,
}

/// One (key, lane) slot
#[derive(Debug, Default)]
pub struct LaneState {
    pub phase: LanePhase,
    pub handle: Option<ProcessHandle>,
    /// Process reported a terminal result and is waiting for input
    pub idle_waiting: bool,
    /// FIFO of entries not yet admitted
    pub pending: VecDeque<QueueEntry>,
}

/// Per canonical key
#[derive(Debug, Default)]
pub struct GroupState {
    pub lanes: LaneMap<LaneState>,
    /// Consecutive failed message checks
    pub retry_count: u32,
    /// Task holding the task lane, until its body returns
    pub running_task_id: Option<String>,
    /// Preview for interactive messages; cleared once the task went idle
    pub running_task: Option<ActiveTaskInfo>,
}

impl GroupState {
    fn is_quiet(&self) -> bool {
        self.retry_count == 0
            && self.running_task_id.is_none()
            && self.running_task.is_none()
            && self
                .lanes
                .iter()
                .all(|(_, s)| s.phase == LanePhase::Idle && s.pending.is_empty() && s.handle.is_none())
    }
}

/// Entry taken off a pending queue and moved to `Starting`
#[derive(Debug)]
pub struct Admission {
    pub key: DispatchKey,
    pub lane: Lane,
    pub entry: QueueEntry,
}

/// Registry state
#[derive(Debug, Default)]
pub struct DispatchRegistry {
    aliases: HashMap<String, DispatchKey>,
    groups: HashMap<DispatchKey, GroupState>,
    /// Keys with pending work blocked on the global cap, oldest first
    waiting: LaneMap<VecDeque<DispatchKey>>,
    shutting_down: bool,
}

impl DispatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Aliases
    // ========================================================================

    pub fn register_alias(&mut self, external: &str, canonical: DispatchKey) {
        if external == canonical.as_str() {
            self.aliases.remove(external);
        } else {
            self.aliases.insert(external.to_string(), canonical);
        }
    }

    pub fn resolve(&self, key: &str) -> DispatchKey {
        self.aliases
            .get(key)
            .cloned()
            .unwrap_or_else(|| DispatchKey::new(key))
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    pub fn group(&self, key: &DispatchKey) -> Option<&GroupState> {
        self.groups.get(key)
    }

    pub fn group_mut(&mut self, key: &DispatchKey) -> &mut GroupState {
        self.groups.entry(key.clone()).or_default()
    }

    pub fn lane(&self, key: &DispatchKey, lane: Lane) -> Option<&LaneState> {
        self.groups.get(key).map(|g| g.lanes.get(lane))
    }

    pub fn phase(&self, key: &DispatchKey, lane: Lane) -> LanePhase {
        self.lane(key, lane).map(|s| s.phase).unwrap_or_default()
    }

    /// Live slots in `lane` across all keys
    pub fn live_count(&self, lane: Lane) -> usize {
        self.groups
            .values()
            .filter(|g| g.lanes.get(lane).phase.is_live())
            .count()
    }

    /// Registered process handles across all keys and lanes
    pub fn live_handles(&self) -> Vec<ProcessHandle> {
        self.groups
            .values()
            .flat_map(|g| g.lanes.iter().filter_map(|(_, s)| s.handle.clone()))
            .collect()
    }

    pub fn handle_count(&self) -> usize {
        self.groups
            .values()
            .map(|g| g.lanes.iter().filter(|(_, s)| s.handle.is_some()).count())
            .sum()
    }

    pub fn pending_count(&self, key: &DispatchKey, lane: Lane) -> usize {
        self.lane(key, lane).map(|s| s.pending.len()).unwrap_or(0)
    }

    /// Task already queued or running for `key`
    pub fn has_task(&self, key: &DispatchKey, task_id: &str) -> bool {
        let Some(group) = self.groups.get(key) else {
            return false;
        };
        group.running_task_id.as_deref() == Some(task_id)
            || group
                .lanes
                .get(Lane::Task)
                .pending
                .iter()
                .any(|e| e.task_id() == Some(task_id))
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    // ========================================================================
    // Admission
    // ========================================================================

    /// Admit the head of `key`'s FIFO for `lane` if the lane is idle and a
    /// global slot is free; otherwise remember the key as waiting
    pub fn admit_next(&mut self, key: &DispatchKey, lane: Lane, cap: usize) -> Option<Admission> {
        if self.shutting_down {
            return None;
        }

        let live = self.live_count(lane);
        let group = self.groups.get_mut(key)?;
        let state = group.lanes.get_mut(lane);
        if state.phase != LanePhase::Idle || state.pending.is_empty() {
            return None;
        }

        let waiting = self.waiting.get_mut(lane);
        if live >= cap {
            if !waiting.contains(key) {
                waiting.push_back(key.clone());
            }
            return None;
        }

        let entry = state.pending.pop_front()?;
        state.phase = LanePhase::Starting;
        state.idle_waiting = false;
        waiting.retain(|k| k != key);

        if let QueueEntry::RunTask(task) = &entry {
            group.running_task_id = Some(task.id.clone());
            group.running_task = Some(ActiveTaskInfo {
                task_id: task.id.clone(),
                preview: task.preview.clone(),
                started_at: Utc::now(),
            });
        }

        Some(Admission {
            key: key.clone(),
            lane,
            entry,
        })
    }

    /// Admissions after a slot in `lane` freed up: `key` first, then waiting
    /// keys in arrival order while room remains
    pub fn drain(&mut self, key: &DispatchKey, lane: Lane, cap: usize) -> Vec<Admission> {
        let mut admitted = Vec::new();
        if let Some(admission) = self.admit_next(key, lane, cap) {
            admitted.push(admission);
        }

        while !self.shutting_down && self.live_count(lane) < cap {
            let Some(next) = self.waiting.get_mut(lane).pop_front() else {
                break;
            };
            if let Some(admission) = self.admit_next(&next, lane, cap) {
                admitted.push(admission);
            }
        }
        admitted
    }

    /// Work for `key`/`lane` finished; the slot returns to `Idle`
    pub fn finish_lane(&mut self, key: &DispatchKey, lane: Lane) {
        let Some(group) = self.groups.get_mut(key) else {
            return;
        };
        let state = group.lanes.get_mut(lane);
        state.phase = LanePhase::Idle;
        state.handle = None;
        state.idle_waiting = false;
        if lane == Lane::Task {
            group.running_task_id = None;
            group.running_task = None;
        }
    }

    /// Drop groups with nothing left to remember
    pub fn prune(&mut self, key: &DispatchKey) {
        if self.groups.get(key).is_some_and(GroupState::is_quiet) {
            self.groups.remove(key);
        }
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Stop admissions, move live processes to `Draining` and hand back
    /// their handles together with every entry that will never run
    pub fn begin_shutdown(&mut self) -> (Vec<ProcessHandle>, Vec<QueueEntry>) {
        self.shutting_down = true;
        for lane in Lane::ALL {
            self.waiting.get_mut(lane).clear();
        }

        let mut handles = Vec::new();
        let mut dropped = Vec::new();
        for group in self.groups.values_mut() {
            for lane in Lane::ALL {
                let state = group.lanes.get_mut(lane);
                dropped.extend(state.pending.drain(..));
                if let Some(handle) = &state.handle {
                    if state.phase == LanePhase::Running {
                        state.phase = LanePhase::Draining;
                    }
                    handles.push(handle.clone());
                }
            }
        }
        (handles, dropped)
    }
}
