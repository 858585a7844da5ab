//! Queue lifecycle events, broadcast to any number of subscribers

use crate::key::{DispatchKey, Lane};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum QueueEventKind {
    /// Entry waiting for its lane or a global slot
    Queued { lane: Lane, pending: usize },
    /// Entry admitted and started
    Admitted { lane: Lane },
    ProcessRegistered { lane: Lane, name: String },
    HandoffDelivered { lane: Lane },
    /// Live process went away before delivery
    HandoffMissed { lane: Lane },
    /// Process reported a terminal result and is idling
    LaneIdle { lane: Lane },
    CloseRequested { lane: Lane },
    ProcessExited { lane: Lane, name: String },
    /// Unit of work finished, lane is free again
    Finished { lane: Lane, success: bool },
    RetryScheduled { attempt: u32, delay_ms: u64 },
    RetriesExhausted { attempts: u32 },
    TaskDuplicate { task_id: String },
    ShutdownStarted { live: usize },
    ShutdownComplete { forced: usize },
}

/// A single queue event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEvent {
    pub timestamp: DateTime<Utc>,

    /// Canonical key, absent for queue-wide events
    pub key: Option<DispatchKey>,

    #[serde(flatten)]
    pub kind: QueueEventKind,
}

impl QueueEvent {
    pub fn new(key: Option<DispatchKey>, kind: QueueEventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            key,
            kind,
        }
    }

    pub fn for_key(key: &DispatchKey, kind: QueueEventKind) -> Self {
        Self::new(Some(key.clone()), kind)
    }

    pub fn global(kind: QueueEventKind) -> Self {
        Self::new(None, kind)
    }
}

impl std::fmt::Display for QueueEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let time = self.timestamp.format("%H:%M:%S%.3f");
        match &self.key {
            Some(key) => write!(f, "[{}] {} {:?}", time, key, self.kind),
            None => write!(f, "[{}] {:?}", time, self.kind),
        }
    }
}
