//! Local backend - runs the sandbox command as a host subprocess
//!
//! No isolation; meant for development and tests. The command is run via
//! `sh -c` with `CORRAL_KEY` / `CORRAL_LANE` set, and speaks the same stdin
//! and stdout protocol as a container.

use super::{attach_child, LiveInputs, SandboxBackend, SpawnContext, SpawnedChild, TerminateSignal};
use crate::handle::ProcessHandle;
use crate::key::{DispatchKey, Lane};
use async_trait::async_trait;
use corral_foundation::Result;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info};

struct LocalChild {
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
}

/// Local subprocess backend
pub struct LocalBackend {
    command: String,
    working_dir: Option<PathBuf>,
    env: HashMap<String, String>,
    live: Arc<LiveInputs>,
    children: Arc<Mutex<HashMap<String, LocalChild>>>,
    spawned: AtomicU64,
}

impl LocalBackend {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            working_dir: None,
            env: HashMap::new(),
            live: Arc::new(LiveInputs::new()),
            children: Arc::new(Mutex::new(HashMap::new())),
            spawned: AtomicU64::new(0),
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Processes currently alive
    pub fn running(&self) -> usize {
        self.children.lock().len()
    }

    #[cfg(unix)]
    fn send_sigterm(pid: u32) -> bool {
        // SAFETY: kill(2) has no memory-safety preconditions
        unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 }
    }

    #[cfg(not(unix))]
    fn send_sigterm(_pid: u32) -> bool {
        false
    }

    fn force_kill(&self, name: &str) -> bool {
        let tx = self
            .children
            .lock()
            .get_mut(name)
            .and_then(|child| child.kill_tx.take());
        match tx {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl SandboxBackend for LocalBackend {
    async fn spawn(&self, ctx: &SpawnContext) -> Result<SpawnedChild> {
        let seq = self.spawned.fetch_add(1, Ordering::Relaxed) + 1;
        let name = format!("local-{}-{}-{}", ctx.key, ctx.lane, seq);

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&self.command)
            .env("CORRAL_KEY", ctx.key.as_str())
            .env("CORRAL_LANE", ctx.lane.as_str())
            .envs(&self.env);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        let mut child = attach_child(command, name.clone(), ctx, Arc::clone(&self.live), Some(kill_rx))?;

        info!("Started local process {} (pid {:?})", name, child.pid);
        self.children.lock().insert(
            name.clone(),
            LocalChild {
                pid: child.pid,
                kill_tx: Some(kill_tx),
            },
        );

        let children = Arc::clone(&self.children);
        let exit = child.exit;
        child.exit = async move {
            let status = exit.await;
            children.lock().remove(&name);
            status
        }
        .boxed();

        Ok(child)
    }

    async fn deliver_live_input(&self, key: &DispatchKey, lane: Lane, payload: &str) -> bool {
        self.live
            .deliver(key, lane, super::encode_message(payload))
    }

    async fn request_close(&self, key: &DispatchKey, lane: Lane) {
        if self.live.close(key, lane) {
            debug!("Closed stdin for {}/{}", key, lane);
        }
    }

    async fn terminate(&self, handle: &ProcessHandle, signal: TerminateSignal) -> Result<()> {
        let pid = self.children.lock().get(&handle.name).and_then(|c| c.pid);
        let Some(pid) = pid else {
            debug!("Process {} already exited", handle.name);
            return Ok(());
        };

        if signal == TerminateSignal::Graceful && Self::send_sigterm(pid) {
            debug!("Sent SIGTERM to {} (pid {})", handle.name, pid);
            return Ok(());
        }

        if self.force_kill(&handle.name) {
            info!("Killed process {} (pid {})", handle.name, pid);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "local"
    }
}
