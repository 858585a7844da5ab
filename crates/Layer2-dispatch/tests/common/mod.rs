//! Scripted in-memory backend for driving the queue and runner in tests

#![allow(dead_code)]

use async_trait::async_trait;
use corral_dispatch::{
    DispatchKey, DispatchQueue, Lane, LanePhase, Markers, ProcessHandle, SandboxBackend,
    SpawnContext, SpawnedChild, TerminateSignal,
};
use corral_foundation::{Error, Result};
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::oneshot;

struct ScriptedProcess {
    name: String,
    stdout: Arc<tokio::sync::Mutex<Option<DuplexStream>>>,
    stderr: Arc<tokio::sync::Mutex<Option<DuplexStream>>>,
    exit: Option<oneshot::Sender<Option<i32>>>,
    input_open: bool,
}

#[derive(Default)]
struct ScriptState {
    live: HashMap<(DispatchKey, Lane), ScriptedProcess>,
    inputs: HashMap<(DispatchKey, Lane), Vec<String>>,
    spawned: usize,
    fail_next: usize,
    terminations: Vec<(String, TerminateSignal)>,
}

/// Backend whose processes are driven by the test
///
/// - `request_close` and graceful termination make the process exit unless
///   the backend is stubborn
/// - `Kill` always makes it exit
#[derive(Default)]
pub struct ScriptedBackend {
    state: Mutex<ScriptState>,
    stubborn: bool,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Processes ignore close requests and graceful stops
    pub fn stubborn() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ScriptState::default()),
            stubborn: true,
        })
    }

    pub fn fail_next_spawns(&self, count: usize) {
        self.state.lock().fail_next = count;
    }

    pub fn spawned(&self) -> usize {
        self.state.lock().spawned
    }

    pub fn live(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn is_live(&self, key: &str, lane: Lane) -> bool {
        self.state
            .lock()
            .live
            .contains_key(&(DispatchKey::new(key), lane))
    }

    /// Lines written to stdin of every process that served `key`/`lane`
    pub fn inputs(&self, key: &str, lane: Lane) -> Vec<String> {
        self.state
            .lock()
            .inputs
            .get(&(DispatchKey::new(key), lane))
            .cloned()
            .unwrap_or_default()
    }

    pub fn terminations(&self) -> Vec<(String, TerminateSignal)> {
        self.state.lock().terminations.clone()
    }

    /// Write raw text to the process's stdout
    pub async fn emit(&self, key: &str, lane: Lane, text: &str) {
        let stdout = {
            let state = self.state.lock();
            match state.live.get(&(DispatchKey::new(key), lane)) {
                Some(process) => Arc::clone(&process.stdout),
                None => return,
            }
        };
        let mut guard = stdout.lock().await;
        if let Some(stream) = guard.as_mut() {
            let _ = stream.write_all(text.as_bytes()).await;
        };
    }

    /// Write one result block to the process's stdout
    pub async fn emit_result(&self, key: &str, lane: Lane, result: &str) {
        let record = serde_json::json!({ "status": "success", "result": result });
        self.emit(key, lane, &Markers::default().wrap(&record.to_string()))
            .await;
    }

    pub async fn emit_stderr(&self, key: &str, lane: Lane, text: &str) {
        let stderr = {
            let state = self.state.lock();
            match state.live.get(&(DispatchKey::new(key), lane)) {
                Some(process) => Arc::clone(&process.stderr),
                None => return,
            }
        };
        let mut guard = stderr.lock().await;
        if let Some(stream) = guard.as_mut() {
            let _ = stream.write_all(text.as_bytes()).await;
        };
    }

    /// Close the process's stdin behind the queue's back
    pub fn drop_input(&self, key: &str, lane: Lane) {
        if let Some(process) = self
            .state
            .lock()
            .live
            .get_mut(&(DispatchKey::new(key), lane))
        {
            process.input_open = false;
        }
    }

    /// End the process with `code`
    pub async fn exit(&self, key: &str, lane: Lane, code: Option<i32>) {
        let process = self.state.lock().live.remove(&(DispatchKey::new(key), lane));
        if let Some(process) = process {
            finish(process, code).await;
        }
    }

    async fn exit_by_name(&self, name: &str, code: Option<i32>) {
        let process = {
            let mut state = self.state.lock();
            let slot = state
                .live
                .iter()
                .find(|(_, p)| p.name == name)
                .map(|(slot, _)| slot.clone());
            slot.and_then(|slot| state.live.remove(&slot))
        };
        if let Some(process) = process {
            finish(process, code).await;
        }
    }
}

async fn finish(mut process: ScriptedProcess, code: Option<i32>) {
    process.stdout.lock().await.take();
    process.stderr.lock().await.take();
    if let Some(exit) = process.exit.take() {
        let _ = exit.send(code);
    }
}

#[async_trait]
impl SandboxBackend for ScriptedBackend {
    async fn spawn(&self, ctx: &SpawnContext) -> Result<SpawnedChild> {
        let mut state = self.state.lock();
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(Error::Spawn("scripted spawn failure".into()));
        }

        state.spawned += 1;
        let name = format!("scripted-{}-{}-{}", ctx.key, ctx.lane, state.spawned);
        let (stdout_tx, stdout_rx) = tokio::io::duplex(64 * 1024);
        let (stderr_tx, stderr_rx) = tokio::io::duplex(64 * 1024);
        let (exit_tx, exit_rx) = oneshot::channel();

        let slot = (ctx.key.clone(), ctx.lane);
        state
            .inputs
            .entry(slot.clone())
            .or_default()
            .push(ctx.prompt.clone());
        state.live.insert(
            slot,
            ScriptedProcess {
                name: name.clone(),
                stdout: Arc::new(tokio::sync::Mutex::new(Some(stdout_tx))),
                stderr: Arc::new(tokio::sync::Mutex::new(Some(stderr_tx))),
                exit: Some(exit_tx),
                input_open: true,
            },
        );

        Ok(SpawnedChild {
            name,
            pid: None,
            stdout: Box::new(stdout_rx),
            stderr: Box::new(stderr_rx),
            exit: async move { Ok(exit_rx.await.unwrap_or(None)) }.boxed(),
        })
    }

    async fn deliver_live_input(&self, key: &DispatchKey, lane: Lane, payload: &str) -> bool {
        let mut state = self.state.lock();
        let slot = (key.clone(), lane);
        match state.live.get(&slot) {
            Some(process) if process.input_open => {
                state.inputs.entry(slot).or_default().push(payload.to_string());
                true
            }
            _ => false,
        }
    }

    async fn request_close(&self, key: &DispatchKey, lane: Lane) {
        if self.stubborn {
            self.drop_input(key.as_str(), lane);
            return;
        }
        self.exit(key.as_str(), lane, Some(0)).await;
    }

    async fn terminate(&self, handle: &ProcessHandle, signal: TerminateSignal) -> Result<()> {
        self.state
            .lock()
            .terminations
            .push((handle.name.clone(), signal));
        if signal == TerminateSignal::Kill || !self.stubborn {
            self.exit_by_name(&handle.name, None).await;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// Poll until `key`/`lane` reaches `phase`
pub async fn wait_for_phase(queue: &DispatchQueue, key: &str, lane: Lane, phase: LanePhase) {
    wait_until(|| queue.lane_phase(key, lane) == phase).await;
}

/// Poll `condition` every few milliseconds, failing the test after 5s
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let wait = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("condition not reached in time");
}
