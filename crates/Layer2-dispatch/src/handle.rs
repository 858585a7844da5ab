//! Process handle - one spawned sandbox process

use crate::backend::{SandboxBackend, TerminateSignal};
use crate::key::{DispatchKey, Lane};
use chrono::{DateTime, Utc};
use corral_foundation::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Unique identifier for a spawned process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessId(pub Uuid);

impl ProcessId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ProcessId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Handle to a live sandbox process
///
/// Cheap to clone. The backend that spawned the process owns its I/O streams;
/// the handle only carries identity and the kill capability.
#[derive(Clone)]
pub struct ProcessHandle {
    /// Unique id
    pub id: ProcessId,

    /// Display name (container name or `key/lane` for local processes)
    pub name: String,

    /// Key the process serves
    pub key: DispatchKey,

    /// Lane the process serves
    pub lane: Lane,

    /// OS pid, when the backend knows it
    pub pid: Option<u32>,

    /// When the process was spawned
    pub started_at: DateTime<Utc>,

    /// Owning backend
    backend: Arc<dyn SandboxBackend>,

    /// Serializes live input deliveries in call order
    input_gate: Arc<Mutex<()>>,
}

impl ProcessHandle {
    pub fn new(
        name: impl Into<String>,
        key: DispatchKey,
        lane: Lane,
        backend: Arc<dyn SandboxBackend>,
    ) -> Self {
        Self {
            id: ProcessId::new(),
            name: name.into(),
            key,
            lane,
            pid: None,
            started_at: Utc::now(),
            backend,
            input_gate: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_pid(mut self, pid: Option<u32>) -> Self {
        self.pid = pid;
        self
    }

    /// Backend that owns this process
    pub fn backend(&self) -> &Arc<dyn SandboxBackend> {
        &self.backend
    }

    /// Name of the owning backend
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Send a termination signal through the owning backend
    pub async fn terminate(&self, signal: TerminateSignal) -> Result<()> {
        self.backend.terminate(self, signal).await
    }

    /// Same underlying process
    pub fn same_process(&self, other: &ProcessHandle) -> bool {
        self.id == other.id
    }

    pub(crate) fn input_gate(&self) -> Arc<Mutex<()>> {
        Arc::clone(&self.input_gate)
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("key", &self.key)
            .field("lane", &self.lane)
            .field("pid", &self.pid)
            .field("backend", &self.backend.name())
            .finish()
    }
}
