//! Dispatch queue - admission controller for sandbox processes
//!
//! Decides per unit of work whether to hand off to a live process, start a
//! new one (within the global per-lane caps) or wait in the key's FIFO.
//!
//! All state lives in one [`DispatchRegistry`] behind a `parking_lot::Mutex`.
//! Every transition happens while holding it; backend calls (live input,
//! close, terminate) and user work always run after it is released.

use crate::event::{QueueEvent, QueueEventKind};
use crate::handle::ProcessHandle;
use crate::key::{DispatchKey, Lane};
use crate::registry::{ActiveTaskInfo, Admission, DispatchRegistry, QueueEntry, QueuedTask};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::state::LanePhase;
use crate::backend::TerminateSignal;
use async_trait::async_trait;
use corral_foundation::{CorralConfig, Error, QueueSettings, Result};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch, Notify};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

/// Re-derives and handles new messages for a key
///
/// Called on dequeue of a message check, so it always sees the latest
/// messages rather than a snapshot from enqueue time. `Ok(false)` and `Err`
/// both count as a failed attempt.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn process_messages(&self, key: &DispatchKey) -> Result<bool>;
}

/// Result of [`DispatchQueue::enqueue_task`]
#[derive(Debug)]
pub enum TaskSubmission {
    /// Scheduled; resolves when the task finishes
    Scheduled(TaskCompletion),
    /// Same task id already queued or running; nothing scheduled
    Duplicate,
}

impl TaskSubmission {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, TaskSubmission::Duplicate)
    }

    pub fn into_completion(self) -> Option<TaskCompletion> {
        match self {
            TaskSubmission::Scheduled(completion) => Some(completion),
            TaskSubmission::Duplicate => None,
        }
    }
}

/// Completion of a scheduled task
///
/// Resolves to the task's own result, or [`Error::Cancelled`] if the queue
/// dropped it (shutdown).
#[derive(Debug)]
pub struct TaskCompletion {
    task_id: String,
    rx: oneshot::Receiver<Result<()>>,
}

impl TaskCompletion {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }
}

impl Future for TaskCompletion {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(Error::Cancelled)))
    }
}

struct QueueInner {
    registry: Mutex<DispatchRegistry>,
    settings: QueueSettings,
    retry: RetryPolicy,
    handler: RwLock<Option<Arc<dyn MessageHandler>>>,
    events: broadcast::Sender<QueueEvent>,
    /// Signalled whenever a handle is cleared or a lane goes idle
    lane_freed: Notify,
    shutdown_started: AtomicBool,
    shutdown_done: watch::Sender<bool>,
}

/// Admission controller; cheap to clone
#[derive(Clone)]
pub struct DispatchQueue {
    inner: Arc<QueueInner>,
}

impl DispatchQueue {
    pub fn new(settings: QueueSettings, retry: RetryPolicy) -> Self {
        let (events, _) = broadcast::channel(settings.event_capacity.max(1));
        let (shutdown_done, _) = watch::channel(false);

        Self {
            inner: Arc::new(QueueInner {
                registry: Mutex::new(DispatchRegistry::new()),
                settings,
                retry,
                handler: RwLock::new(None),
                events,
                lane_freed: Notify::new(),
                shutdown_started: AtomicBool::new(false),
                shutdown_done,
            }),
        }
    }

    pub fn from_config(config: &CorralConfig) -> Self {
        Self::new(config.queue.clone(), RetryPolicy::from(&config.retry))
    }

    pub fn set_message_handler(&self, handler: Arc<dyn MessageHandler>) {
        *self.inner.handler.write() = Some(handler);
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: QueueEvent) {
        let _ = self.inner.events.send(event);
    }

    fn cap(&self, lane: Lane) -> usize {
        match lane {
            Lane::Message => self.inner.settings.max_message_processes,
            Lane::Task => self.inner.settings.max_task_processes,
        }
    }

    // ========================================================================
    // Aliases & introspection
    // ========================================================================

    /// Route `external` to `canonical`; last write wins
    pub fn register_alias(&self, external: &str, canonical: &str) {
        let canonical = DispatchKey::new(canonical);
        debug!("Alias {} -> {}", external, canonical);
        self.inner.registry.lock().register_alias(external, canonical);
    }

    /// Canonical key for `key`
    pub fn resolve(&self, key: &str) -> DispatchKey {
        self.inner.registry.lock().resolve(key)
    }

    pub fn lane_phase(&self, key: &str, lane: Lane) -> LanePhase {
        let registry = self.inner.registry.lock();
        registry.phase(&registry.resolve(key), lane)
    }

    pub fn live_count(&self, lane: Lane) -> usize {
        self.inner.registry.lock().live_count(lane)
    }

    pub fn pending_count(&self, key: &str, lane: Lane) -> usize {
        let registry = self.inner.registry.lock();
        registry.pending_count(&registry.resolve(key), lane)
    }

    /// Running background task for `key`, if any
    pub fn get_active_task_info(&self, key: &str) -> Option<ActiveTaskInfo> {
        let registry = self.inner.registry.lock();
        registry
            .group(&registry.resolve(key))
            .and_then(|g| g.running_task.clone())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown_started.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Work intake
    // ========================================================================

    /// Deliver `payload` to the live process for `key`/`lane`
    ///
    /// Returns false if there is no running process or the delivery raced
    /// with its exit; the caller should fall back to [`enqueue_check`].
    ///
    /// [`enqueue_check`]: DispatchQueue::enqueue_check
    pub async fn try_handoff(&self, key: &str, lane: Lane, payload: &str) -> bool {
        let (key, handle) = {
            let registry = self.inner.registry.lock();
            let key = registry.resolve(key);
            let handle = registry
                .lane(&key, lane)
                .filter(|s| s.phase.accepts_input())
                .and_then(|s| s.handle.clone());
            (key, handle)
        };
        let Some(handle) = handle else {
            return false;
        };

        let gate = handle.input_gate();
        let _order = gate.lock().await;
        let delivered = handle
            .backend()
            .deliver_live_input(&key, lane, payload)
            .await;

        if delivered {
            {
                let mut registry = self.inner.registry.lock();
                let state = registry.group_mut(&key).lanes.get_mut(lane);
                if state.handle.as_ref().is_some_and(|h| h.same_process(&handle)) {
                    state.idle_waiting = false;
                }
            }
            debug!("Handed off to {} ({} lane)", handle.name, lane);
            self.emit(QueueEvent::for_key(&key, QueueEventKind::HandoffDelivered { lane }));
        } else {
            debug!("Handoff to {} missed, process gone", handle.name);
            self.emit(QueueEvent::for_key(&key, QueueEventKind::HandoffMissed { lane }));
        }
        delivered
    }

    /// Schedule a message check for `key` unless one is already pending
    pub fn enqueue_check(&self, key: &str) {
        let lane = Lane::Message;
        let cap = self.cap(lane);

        let (key, admission, pending) = {
            let mut registry = self.inner.registry.lock();
            if registry.is_shutting_down() {
                debug!("Ignoring message check for {}: shutting down", key);
                return;
            }
            let key = registry.resolve(key);
            let state = registry.group_mut(&key).lanes.get_mut(lane);
            if state.pending.iter().any(QueueEntry::is_check) {
                debug!("Message check already pending for {}", key);
                return;
            }
            state.pending.push_back(QueueEntry::CheckMessages);

            let admission = registry.admit_next(&key, lane, cap);
            let pending = registry.pending_count(&key, lane);
            (key, admission, pending)
        };

        match admission {
            Some(admission) => self.launch(admission),
            None => {
                debug!("Queued message check for {} ({} pending)", key, pending);
                self.emit(QueueEvent::for_key(&key, QueueEventKind::Queued { lane, pending }));
            }
        }
    }

    /// Schedule a task on the task lane
    ///
    /// A task id already queued or running for the same key is not scheduled
    /// again.
    pub fn enqueue_task<F, Fut>(
        &self,
        key: &str,
        task_id: impl Into<String>,
        preview: impl Into<String>,
        work: F,
    ) -> Result<TaskSubmission>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let lane = Lane::Task;
        let cap = self.cap(lane);
        let task_id = task_id.into();

        let (key, admission, pending, close, rx) = {
            let mut registry = self.inner.registry.lock();
            if registry.is_shutting_down() {
                return Err(Error::ShuttingDown);
            }
            let key = registry.resolve(key);
            if registry.has_task(&key, &task_id) {
                drop(registry);
                debug!("Task {} already queued or running for {}", task_id, key);
                self.emit(QueueEvent::for_key(&key, QueueEventKind::TaskDuplicate { task_id }));
                return Ok(TaskSubmission::Duplicate);
            }

            let (tx, rx) = oneshot::channel();
            let state = registry.group_mut(&key).lanes.get_mut(lane);
            state.pending.push_back(QueueEntry::RunTask(QueuedTask {
                id: task_id.clone(),
                preview: preview.into(),
                work: Box::new(move || work().boxed()),
                completion: tx,
            }));
            // An idling task process would hold the lane forever; wind it down
            let close = state.idle_waiting && state.phase == LanePhase::Running;

            let admission = registry.admit_next(&key, lane, cap);
            let pending = registry.pending_count(&key, lane);
            (key, admission, pending, close, rx)
        };

        match admission {
            Some(admission) => self.launch(admission),
            None => {
                debug!("Queued task {} for {} ({} pending)", task_id, key, pending);
                self.emit(QueueEvent::for_key(&key, QueueEventKind::Queued { lane, pending }));
            }
        }

        if close {
            let queue = self.clone();
            let close_key = key.clone();
            tokio::spawn(async move { queue.close_stdin(close_key.as_str(), lane).await });
        }

        Ok(TaskSubmission::Scheduled(TaskCompletion { task_id, rx }))
    }

    // ========================================================================
    // Process lifecycle (called by the collaborator that spawns)
    // ========================================================================

    /// Install a freshly spawned process for `key`/`lane`
    ///
    /// A previous handle for the same slot is assumed to have exited.
    pub async fn register_process(&self, key: &str, handle: ProcessHandle, lane: Lane) {
        let (key, shutting_down) = {
            let mut registry = self.inner.registry.lock();
            let key = registry.resolve(key);
            let shutting_down = registry.is_shutting_down();
            let state = registry.group_mut(&key).lanes.get_mut(lane);
            if let Some(previous) = state.handle.replace(handle.clone()) {
                debug!("Replacing handle {} for {}/{}", previous.name, key, lane);
            }
            state.phase = if shutting_down {
                LanePhase::Draining
            } else {
                LanePhase::Running
            };
            state.idle_waiting = false;
            (key, shutting_down)
        };

        info!(
            "Registered {} for {} on {} lane ({})",
            handle.name,
            key,
            lane,
            handle.backend_name()
        );
        self.emit(QueueEvent::for_key(
            &key,
            QueueEventKind::ProcessRegistered {
                lane,
                name: handle.name.clone(),
            },
        ));

        if shutting_down {
            handle.backend().request_close(&key, lane).await;
        }
    }

    /// Spawn for an admitted entry failed before any handle existed
    pub fn spawn_failed(&self, key: &str, lane: Lane) {
        let mut registry = self.inner.registry.lock();
        let key = registry.resolve(key);
        let state = registry.group_mut(&key).lanes.get_mut(lane);
        if state.phase == LanePhase::Starting {
            state.phase = LanePhase::Terminated;
        }
    }

    /// The process behind `handle` exited
    pub fn process_exited(&self, key: &str, lane: Lane, handle: &ProcessHandle) {
        let (key, cleared) = {
            let mut registry = self.inner.registry.lock();
            let key = registry.resolve(key);
            let state = registry.group_mut(&key).lanes.get_mut(lane);
            let cleared = state
                .handle
                .as_ref()
                .is_some_and(|h| h.same_process(handle));
            if cleared {
                state.handle = None;
                state.idle_waiting = false;
                if state.phase.can_transition_to(LanePhase::Terminated) {
                    state.phase = LanePhase::Terminated;
                }
            }
            (key, cleared)
        };

        if cleared {
            debug!("Process {} for {}/{} exited", handle.name, key, lane);
            self.emit(QueueEvent::for_key(
                &key,
                QueueEventKind::ProcessExited {
                    lane,
                    name: handle.name.clone(),
                },
            ));
            self.inner.lane_freed.notify_waiters();
        }
    }

    /// Message lane produced a terminal result and is idling
    pub async fn notify_idle(&self, key: &str) {
        self.notify_lane_idle(key, Lane::Message).await;
    }

    /// `lane`'s process produced a terminal, non-erroring result
    ///
    /// Clears the running task's preview. Does not stop the process unless
    /// other work is waiting for the lane, in which case its input is closed.
    pub async fn notify_lane_idle(&self, key: &str, lane: Lane) {
        let (key, close) = {
            let mut registry = self.inner.registry.lock();
            let key = registry.resolve(key);
            let group = registry.group_mut(&key);
            let state = group.lanes.get_mut(lane);
            if state.phase != LanePhase::Running {
                return;
            }
            state.idle_waiting = true;
            let close = !state.pending.is_empty();
            // Only the preview; the task id stays until its body returns
            if lane == Lane::Task {
                group.running_task = None;
            }
            (key, close)
        };

        debug!("{} lane idle for {}", lane, key);
        self.emit(QueueEvent::for_key(&key, QueueEventKind::LaneIdle { lane }));
        self.inner.lane_freed.notify_waiters();

        if close {
            self.close_stdin(key.as_str(), lane).await;
        }
    }

    /// Close the live input of `key`/`lane`, starting a controlled shutdown
    pub async fn close_stdin(&self, key: &str, lane: Lane) {
        let (key, handle) = {
            let mut registry = self.inner.registry.lock();
            let key = registry.resolve(key);
            let state = registry.group_mut(&key).lanes.get_mut(lane);
            let handle = match (&state.handle, state.phase) {
                (Some(handle), LanePhase::Running) => handle.clone(),
                _ => return,
            };
            state.phase = LanePhase::Draining;
            state.idle_waiting = false;
            (key, handle)
        };

        debug!("Closing stdin of {}", handle.name);
        self.emit(QueueEvent::for_key(&key, QueueEventKind::CloseRequested { lane }));
        handle.backend().request_close(&key, lane).await;
    }

    // ========================================================================
    // Execution
    // ========================================================================

    fn launch(&self, admission: Admission) {
        let Admission { key, lane, entry } = admission;
        info!("Admitted {} on {} lane ({:?})", key, lane, entry);
        self.emit(QueueEvent::for_key(&key, QueueEventKind::Admitted { lane }));

        let queue = self.clone();
        match entry {
            QueueEntry::CheckMessages => {
                tokio::spawn(async move { queue.run_check(key).await });
            }
            QueueEntry::RunTask(task) => {
                tokio::spawn(async move { queue.run_task(key, task).await });
            }
        }
    }

    async fn run_check(&self, key: DispatchKey) {
        let handler = self.inner.handler.read().clone();
        let result = match handler {
            Some(handler) => AssertUnwindSafe(handler.process_messages(&key))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(Error::Internal("message handler panicked".into()))),
            None => {
                warn!("No message handler registered, dropping check for {}", key);
                Ok(true)
            }
        };

        let success = matches!(result, Ok(true));
        if let Err(e) = &result {
            error!("Message processing failed for {}: {}", key, e);
        }

        self.finish(&key, Lane::Message, success);
        self.record_check_result(&key, success);
    }

    async fn run_task(&self, key: DispatchKey, task: QueuedTask) {
        let QueuedTask {
            id,
            work,
            completion,
            ..
        } = task;

        let result = AssertUnwindSafe(work())
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(Error::Internal(format!("task {} panicked", id))));

        match &result {
            Ok(()) => info!("Task {} for {} completed", id, key),
            Err(e) => error!("Task {} for {} failed: {}", id, key, e),
        }

        self.finish(&key, Lane::Task, result.is_ok());
        let _ = completion.send(result);
    }

    /// Return the lane to `Idle` and start whatever the freed slot allows
    fn finish(&self, key: &DispatchKey, lane: Lane, success: bool) {
        let cap = self.cap(lane);
        let admissions = {
            let mut registry = self.inner.registry.lock();
            registry.finish_lane(key, lane);
            let admissions = registry.drain(key, lane, cap);
            registry.prune(key);
            admissions
        };

        self.emit(QueueEvent::for_key(key, QueueEventKind::Finished { lane, success }));
        self.inner.lane_freed.notify_waiters();

        for admission in admissions {
            self.launch(admission);
        }
    }

    fn record_check_result(&self, key: &DispatchKey, success: bool) {
        let decision = {
            let mut registry = self.inner.registry.lock();
            let group = registry.group_mut(key);
            if success {
                group.retry_count = 0;
                None
            } else {
                group.retry_count += 1;
                let decision = self.inner.retry.decide(group.retry_count);
                if matches!(decision, RetryDecision::Exhausted { .. }) {
                    group.retry_count = 0;
                }
                Some(decision)
            }
        };

        match decision {
            None => {}
            Some(RetryDecision::Retry { attempt, delay }) => {
                warn!(
                    "Retrying {} in {}ms (attempt {}/{})",
                    key,
                    delay.as_millis(),
                    attempt,
                    self.inner.retry.max_retries
                );
                self.emit(QueueEvent::for_key(
                    key,
                    QueueEventKind::RetryScheduled {
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                    },
                ));

                let queue = self.clone();
                let key = key.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if !queue.is_shutting_down() {
                        queue.enqueue_check(key.as_str());
                    }
                });
            }
            Some(RetryDecision::Exhausted { attempts }) => {
                error!(
                    "Giving up on {} after {} failed attempts",
                    key, attempts
                );
                self.emit(QueueEvent::for_key(
                    key,
                    QueueEventKind::RetriesExhausted { attempts },
                ));
            }
        }
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Stop admissions, close every live process and wait up to `deadline`
    /// for them to exit; stragglers are then killed without waiting
    ///
    /// Concurrent and repeated calls wait for the first one to complete,
    /// bounded by their own deadline.
    pub async fn shutdown(&self, deadline: Duration) {
        let deadline = Instant::now() + deadline;

        if self.inner.shutdown_started.swap(true, Ordering::SeqCst) {
            let mut done = self.inner.shutdown_done.subscribe();
            let _ = timeout_at(deadline, done.wait_for(|done| *done)).await;
            return;
        }

        let (handles, dropped) = self.inner.registry.lock().begin_shutdown();
        info!(
            "Shutting down: {} live processes, {} pending entries dropped",
            handles.len(),
            dropped.len()
        );
        // Dropping the entries resolves their completions as cancelled
        drop(dropped);
        self.emit(QueueEvent::global(QueueEventKind::ShutdownStarted {
            live: handles.len(),
        }));

        for handle in &handles {
            let close = handle.backend().request_close(&handle.key, handle.lane);
            if timeout_at(deadline, close).await.is_err() {
                warn!("Shutdown deadline reached while closing {}", handle.name);
                break;
            }
        }

        loop {
            let freed = self.inner.lane_freed.notified();
            tokio::pin!(freed);
            freed.as_mut().enable();

            if self.inner.registry.lock().handle_count() == 0 {
                break;
            }
            if timeout_at(deadline, freed).await.is_err() {
                break;
            }
        }

        let stragglers = self.inner.registry.lock().live_handles();
        for handle in &stragglers {
            warn!("Force-killing {} after shutdown deadline", handle.name);
            let handle = handle.clone();
            tokio::spawn(async move {
                if let Err(e) = handle.terminate(TerminateSignal::Kill).await {
                    warn!("Failed to kill {}: {}", handle.name, e);
                }
            });
        }

        info!("Shutdown complete ({} force-killed)", stragglers.len());
        self.emit(QueueEvent::global(QueueEventKind::ShutdownComplete {
            forced: stragglers.len(),
        }));
        self.inner.shutdown_done.send_replace(true);
    }
}

impl std::fmt::Debug for DispatchQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchQueue")
            .field("settings", &self.inner.settings)
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn queue(max_message: usize, max_task: usize) -> DispatchQueue {
        let settings = QueueSettings {
            max_message_processes: max_message,
            max_task_processes: max_task,
            ..QueueSettings::default()
        };
        DispatchQueue::new(settings, RetryPolicy::no_retry())
    }

    #[tokio::test]
    async fn test_alias_resolution() {
        let queue = queue(1, 1);
        queue.register_alias("slack:C1", "team");
        assert_eq!(queue.resolve("slack:C1").as_str(), "team");
        assert_eq!(queue.resolve("team").as_str(), "team");
    }

    #[tokio::test]
    async fn test_handoff_without_process() {
        let queue = queue(1, 1);
        assert!(!queue.try_handoff("k", Lane::Message, "hi").await);
        assert_eq!(queue.lane_phase("k", Lane::Message), LanePhase::Idle);
    }

    #[tokio::test]
    async fn test_duplicate_task_runs_once() {
        let queue = queue(1, 1);
        let runs = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let first_runs = Arc::clone(&runs);
        let first = queue
            .enqueue_task("k1", "t1", "first", move || async move {
                first_runs.fetch_add(1, Ordering::SeqCst);
                let _ = release_rx.await;
                Ok(())
            })
            .unwrap();

        let second_runs = Arc::clone(&runs);
        let second = queue
            .enqueue_task("k1", "t1", "second", move || async move {
                second_runs.fetch_add(100, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        assert!(second.is_duplicate());

        let info = queue.get_active_task_info("k1").unwrap();
        assert_eq!(info.task_id, "t1");
        assert_eq!(info.preview, "first");

        release_tx.send(()).unwrap();
        first.into_completion().unwrap().await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(queue.get_active_task_info("k1").is_none());
    }

    #[tokio::test]
    async fn test_task_error_resolves_completion() {
        let queue = queue(1, 1);
        let completion = queue
            .enqueue_task("k", "t", "fails", || async {
                Err(Error::Backend("no runtime".into()))
            })
            .unwrap()
            .into_completion()
            .unwrap();

        assert!(matches!(completion.await, Err(Error::Backend(_))));
        assert_eq!(queue.lane_phase("k", Lane::Task), LanePhase::Idle);
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown() {
        let queue = queue(1, 1);
        queue.shutdown(Duration::from_millis(10)).await;
        assert!(queue.is_shutting_down());
        assert!(matches!(
            queue.enqueue_task("k", "t", "p", || async { Ok(()) }),
            Err(Error::ShuttingDown)
        ));
    }
}
