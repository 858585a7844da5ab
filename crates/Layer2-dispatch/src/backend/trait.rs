//! Backend trait

use crate::handle::ProcessHandle;
use crate::key::{DispatchKey, Lane};
use async_trait::async_trait;
use corral_foundation::Result;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::io::AsyncRead;

/// Byte stream from a sandbox's stdout or stderr
pub type OutputReader = Box<dyn AsyncRead + Send + Unpin>;

/// Resolves with the exit code once the process is gone (`None` if signalled)
pub type ExitFuture = BoxFuture<'static, Result<Option<i32>>>;

/// How hard to stop a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateSignal {
    /// Ask politely (SIGTERM / `stop`)
    Graceful,
    /// Kill immediately
    Kill,
}

/// What to start
#[derive(Debug, Clone)]
pub struct SpawnContext {
    pub key: DispatchKey,
    pub lane: Lane,
    /// First input written to the sandbox
    pub prompt: String,
    /// Session to resume, if any
    pub session_id: Option<String>,
}

impl SpawnContext {
    pub fn new(key: DispatchKey, lane: Lane, prompt: impl Into<String>) -> Self {
        Self {
            key,
            lane,
            prompt: prompt.into(),
            session_id: None,
        }
    }

    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }
}

/// Raw result of a backend spawn
pub struct SpawnedChild {
    pub name: String,
    pub pid: Option<u32>,
    pub stdout: OutputReader,
    pub stderr: OutputReader,
    pub exit: ExitFuture,
}

/// A spawned process with its handle and streams
pub struct SpawnedProcess {
    pub handle: ProcessHandle,
    pub stdout: OutputReader,
    pub stderr: OutputReader,
    pub exit: ExitFuture,
}

/// Backend trait - implement to add new sandbox technologies
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Start a process; succeeds or fails as a whole
    async fn spawn(&self, ctx: &SpawnContext) -> Result<SpawnedChild>;

    /// Write a message to the live process for `key`/`lane`
    ///
    /// Returns false when no live channel exists (the process already exited).
    async fn deliver_live_input(&self, key: &DispatchKey, lane: Lane, payload: &str) -> bool;

    /// Close the live input channel, letting the process wind down
    async fn request_close(&self, key: &DispatchKey, lane: Lane);

    /// Signal the process
    async fn terminate(&self, handle: &ProcessHandle, signal: TerminateSignal) -> Result<()>;

    /// Get backend name
    fn name(&self) -> &'static str;
}

/// Spawn through `backend` and wrap the result in a [`ProcessHandle`]
pub async fn spawn_process(
    backend: &Arc<dyn SandboxBackend>,
    ctx: &SpawnContext,
) -> Result<SpawnedProcess> {
    let child = backend.spawn(ctx).await?;
    let handle = ProcessHandle::new(child.name, ctx.key.clone(), ctx.lane, Arc::clone(backend))
        .with_pid(child.pid);

    Ok(SpawnedProcess {
        handle,
        stdout: child.stdout,
        stderr: child.stderr,
        exit: child.exit,
    })
}
