//! Queue integration tests - admission, ordering, handoff and shutdown
//!
//! `cargo test -p corral-dispatch --test queue_test`

mod common;

use async_trait::async_trait;
use common::{wait_for_phase, wait_until, ScriptedBackend};
use corral_dispatch::{
    DispatchKey, DispatchQueue, Lane, LanePhase, MessageHandler, QueueEventKind, RetryPolicy,
    RunRequest, SandboxBackend, SandboxRunner, TerminateSignal,
};
use corral_foundation::{Error, QueueSettings, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

fn settings(max_message: usize, max_task: usize) -> QueueSettings {
    QueueSettings {
        max_message_processes: max_message,
        max_task_processes: max_task,
        ..QueueSettings::default()
    }
}

/// Handles a message check by running one sandbox process
struct RunnerHandler {
    runner: SandboxRunner,
}

#[async_trait]
impl MessageHandler for RunnerHandler {
    async fn process_messages(&self, key: &DispatchKey) -> Result<bool> {
        let outcome = self
            .runner
            .run(RunRequest::new(key.clone(), Lane::Message, "pending messages").expect_output(false))
            .await?;
        Ok(outcome.is_success())
    }
}

fn setup(backend: Arc<ScriptedBackend>, max_message: usize, max_task: usize) -> (DispatchQueue, SandboxRunner) {
    let queue = DispatchQueue::new(settings(max_message, max_task), RetryPolicy::no_retry());
    let backend: Arc<dyn SandboxBackend> = backend;
    let runner = SandboxRunner::new(queue.clone(), backend);
    queue.set_message_handler(Arc::new(RunnerHandler {
        runner: runner.clone(),
    }));
    (queue, runner)
}

#[tokio::test]
async fn test_single_flight_per_lane() {
    let backend = ScriptedBackend::new();
    let (queue, _runner) = setup(Arc::clone(&backend), 5, 2);

    queue.enqueue_check("chat");
    wait_for_phase(&queue, "chat", Lane::Message, LanePhase::Running).await;

    let handoffs = (0..10).map(|i| {
        let queue = queue.clone();
        async move {
            queue
                .try_handoff("chat", Lane::Message, &format!("m{}", i))
                .await
        }
    });
    let delivered = futures::future::join_all(handoffs).await;
    assert!(delivered.into_iter().all(|d| d));

    // A check while the lane is busy waits instead of spawning
    queue.enqueue_check("chat");
    queue.enqueue_check("chat");
    assert_eq!(backend.spawned(), 1);
    assert_eq!(queue.pending_count("chat", Lane::Message), 1);
    assert_eq!(backend.inputs("chat", Lane::Message).len(), 11);

    backend.exit("chat", Lane::Message, Some(0)).await;
    wait_until(|| backend.spawned() == 2).await;
    wait_for_phase(&queue, "chat", Lane::Message, LanePhase::Running).await;
    assert_eq!(queue.live_count(Lane::Message), 1);
}

#[tokio::test]
async fn test_handoff_keeps_call_order() {
    let backend = ScriptedBackend::new();
    let (queue, _runner) = setup(Arc::clone(&backend), 5, 2);

    queue.enqueue_check("k");
    wait_for_phase(&queue, "k", Lane::Message, LanePhase::Running).await;

    for text in ["first", "second", "third"] {
        assert!(queue.try_handoff("k", Lane::Message, text).await);
    }
    assert_eq!(
        backend.inputs("k", Lane::Message),
        vec!["pending messages", "first", "second", "third"]
    );
}

#[tokio::test]
async fn test_handoff_miss_falls_back() {
    let backend = ScriptedBackend::new();
    let (queue, _runner) = setup(Arc::clone(&backend), 5, 2);
    let mut events = queue.subscribe();

    queue.enqueue_check("k");
    wait_for_phase(&queue, "k", Lane::Message, LanePhase::Running).await;

    backend.drop_input("k", Lane::Message);
    assert!(!queue.try_handoff("k", Lane::Message, "lost").await);

    let missed = async {
        loop {
            if let Ok(event) = events.recv().await {
                if matches!(event.kind, QueueEventKind::HandoffMissed { .. }) {
                    return event;
                }
            }
        }
    };
    let event = tokio::time::timeout(Duration::from_secs(5), missed)
        .await
        .unwrap();
    assert_eq!(event.key.as_ref().map(|k| k.as_str()), Some("k"));
}

#[tokio::test]
async fn test_alias_shares_one_process() {
    let backend = ScriptedBackend::new();
    let (queue, _runner) = setup(Arc::clone(&backend), 5, 2);
    queue.register_alias("slack:C1", "team");
    queue.register_alias("tg:42", "team");

    queue.enqueue_check("slack:C1");
    wait_for_phase(&queue, "team", Lane::Message, LanePhase::Running).await;

    assert!(queue.try_handoff("tg:42", Lane::Message, "hello").await);
    assert_eq!(backend.spawned(), 1);
    assert_eq!(queue.lane_phase("tg:42", Lane::Message), LanePhase::Running);
}

#[tokio::test]
async fn test_fifo_per_key_and_across_waiting_keys() {
    let queue = DispatchQueue::new(settings(5, 1), RetryPolicy::no_retry());
    let order = Arc::new(Mutex::new(Vec::new()));
    let (gate_tx, gate_rx) = oneshot::channel::<()>();

    let mut completions = Vec::new();
    let first_order = Arc::clone(&order);
    completions.push(
        queue
            .enqueue_task("k", "a", "a", move || async move {
                let _ = gate_rx.await;
                first_order.lock().push("k/a");
                Ok(())
            })
            .unwrap()
            .into_completion()
            .unwrap(),
    );

    for (key, id, label) in [("k", "b", "k/b"), ("x", "c", "x/c"), ("k", "d", "k/d"), ("y", "e", "y/e")] {
        let order = Arc::clone(&order);
        completions.push(
            queue
                .enqueue_task(key, id, label, move || async move {
                    order.lock().push(label);
                    Ok(())
                })
                .unwrap()
                .into_completion()
                .unwrap(),
        );
    }

    assert_eq!(queue.pending_count("k", Lane::Task), 2);
    assert_eq!(queue.live_count(Lane::Task), 1);

    gate_tx.send(()).unwrap();
    for completion in completions {
        completion.await.unwrap();
    }

    let order = order.lock().clone();
    let position = |label: &str| order.iter().position(|l| *l == label).unwrap();
    assert_eq!(order.len(), 5);
    assert_eq!(order[0], "k/a");
    assert!(position("k/b") < position("k/d"));
    assert!(position("x/c") < position("y/e"));
}

#[tokio::test]
async fn test_lanes_run_independently() {
    let backend = ScriptedBackend::new();
    let (queue, runner) = setup(Arc::clone(&backend), 1, 1);

    queue.enqueue_check("k");
    let task_runner = runner.clone();
    let completion = queue
        .enqueue_task("k", "nightly", "nightly report", move || async move {
            task_runner
                .run(RunRequest::new("k", Lane::Task, "report"))
                .await
                .map(|_| ())
        })
        .unwrap()
        .into_completion()
        .unwrap();

    wait_for_phase(&queue, "k", Lane::Message, LanePhase::Running).await;
    wait_for_phase(&queue, "k", Lane::Task, LanePhase::Running).await;
    assert_eq!(backend.spawned(), 2);

    let info = queue.get_active_task_info("k").unwrap();
    assert_eq!(info.preview, "nightly report");

    backend.emit_result("k", Lane::Task, "report ready").await;
    backend.exit("k", Lane::Task, Some(0)).await;
    completion.await.unwrap();

    assert!(queue.get_active_task_info("k").is_none());
    assert_eq!(queue.lane_phase("k", Lane::Message), LanePhase::Running);
}

#[tokio::test]
async fn test_global_cap_under_burst() {
    let queue = DispatchQueue::new(settings(5, 2), RetryPolicy::no_retry());
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut completions = Vec::new();
    for i in 0..8 {
        let current = Arc::clone(&current);
        let peak = Arc::clone(&peak);
        let probe = queue.clone();
        let submission = queue
            .enqueue_task(&format!("key-{}", i), "job", "burst", move || async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                assert!(probe.live_count(Lane::Task) <= 2);
                tokio::time::sleep(Duration::from_millis(20)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        completions.push(submission.into_completion().unwrap());
    }

    assert_eq!(queue.live_count(Lane::Task), 2);
    for completion in completions {
        completion.await.unwrap();
    }
    assert_eq!(peak.load(Ordering::SeqCst), 2);
    assert_eq!(queue.live_count(Lane::Task), 0);
}

#[tokio::test]
async fn test_duplicate_task_id_is_noop() {
    let queue = DispatchQueue::new(settings(5, 1), RetryPolicy::no_retry());
    let runs = Arc::new(Mutex::new(Vec::new()));
    let (gate_tx, gate_rx) = oneshot::channel::<()>();

    let first_runs = Arc::clone(&runs);
    let first = queue
        .enqueue_task("k1", "t1", "first", move || async move {
            let _ = gate_rx.await;
            first_runs.lock().push("first");
            Ok(())
        })
        .unwrap();

    let second_runs = Arc::clone(&runs);
    let second = queue
        .enqueue_task("k1", "t1", "second", move || async move {
            second_runs.lock().push("second");
            Ok(())
        })
        .unwrap();

    assert!(second.is_duplicate());
    assert_eq!(queue.pending_count("k1", Lane::Task), 0);

    gate_tx.send(()).unwrap();
    first.into_completion().unwrap().await.unwrap();
    assert_eq!(*runs.lock(), vec!["first"]);
}

#[tokio::test]
async fn test_waiting_task_closes_idle_process() {
    let backend = ScriptedBackend::new();
    let (queue, runner) = setup(Arc::clone(&backend), 5, 1);
    let mut events = queue.subscribe();

    let first_runner = runner.clone();
    let first = queue
        .enqueue_task("k", "t1", "first", move || async move {
            let outcome = first_runner
                .run(RunRequest::new("k", Lane::Task, "first"))
                .await?;
            assert_eq!(outcome.result.as_deref(), Some("done"));
            Ok(())
        })
        .unwrap()
        .into_completion()
        .unwrap();

    wait_for_phase(&queue, "k", Lane::Task, LanePhase::Running).await;
    backend.emit_result("k", Lane::Task, "done").await;

    let idle = async {
        loop {
            if let Ok(event) = events.recv().await {
                if matches!(event.kind, QueueEventKind::LaneIdle { lane: Lane::Task }) {
                    return;
                }
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), idle).await.unwrap();

    let second_runner = runner.clone();
    let second = queue
        .enqueue_task("k", "t2", "second", move || async move {
            second_runner
                .run(RunRequest::new("k", Lane::Task, "second"))
                .await
                .map(|_| ())
        })
        .unwrap()
        .into_completion()
        .unwrap();

    // The idle process is closed so the waiting task can start
    first.await.unwrap();
    wait_until(|| backend.spawned() == 2).await;
    wait_for_phase(&queue, "k", Lane::Task, LanePhase::Running).await;

    backend.emit_result("k", Lane::Task, "second done").await;
    backend.exit("k", Lane::Task, Some(0)).await;
    second.await.unwrap();
}

#[tokio::test]
async fn test_idle_task_process_still_deduplicates() {
    let backend = ScriptedBackend::new();
    let (queue, runner) = setup(Arc::clone(&backend), 5, 1);
    let mut events = queue.subscribe();
    let runs = Arc::new(AtomicUsize::new(0));

    let enqueue = |runs: Arc<AtomicUsize>| {
        let runner = runner.clone();
        queue.enqueue_task("k", "t1", "nightly report", move || async move {
            runs.fetch_add(1, Ordering::SeqCst);
            runner
                .run(RunRequest::new("k", Lane::Task, "report"))
                .await
                .map(|_| ())
        })
    };

    let first = enqueue(Arc::clone(&runs))
        .unwrap()
        .into_completion()
        .unwrap();
    wait_for_phase(&queue, "k", Lane::Task, LanePhase::Running).await;
    backend.emit_result("k", Lane::Task, "report ready").await;

    let idle = async {
        loop {
            if let Ok(event) = events.recv().await {
                if matches!(event.kind, QueueEventKind::LaneIdle { lane: Lane::Task }) {
                    return;
                }
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), idle).await.unwrap();

    // Process idles with its body still running: preview gone, id still held
    assert!(queue.get_active_task_info("k").is_none());
    assert!(enqueue(Arc::clone(&runs)).unwrap().is_duplicate());
    assert_eq!(queue.pending_count("k", Lane::Task), 0);

    backend.exit("k", Lane::Task, Some(0)).await;
    first.await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(backend.spawned(), 1);

    // Finished tasks may be scheduled again
    let again = enqueue(Arc::clone(&runs)).unwrap();
    assert!(!again.is_duplicate());
    wait_for_phase(&queue, "k", Lane::Task, LanePhase::Running).await;
    backend.emit_result("k", Lane::Task, "second report").await;
    backend.exit("k", Lane::Task, Some(0)).await;
    again.into_completion().unwrap().await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_spawn_failure_resolves_task() {
    let backend = ScriptedBackend::new();
    backend.fail_next_spawns(1);
    let (queue, runner) = setup(Arc::clone(&backend), 5, 1);

    let completion = queue
        .enqueue_task("k", "t", "will fail", move || async move {
            runner.run(RunRequest::new("k", Lane::Task, "x")).await.map(|_| ())
        })
        .unwrap()
        .into_completion()
        .unwrap();

    assert!(matches!(completion.await, Err(Error::Spawn(_))));
    assert_eq!(queue.lane_phase("k", Lane::Task), LanePhase::Idle);
    assert_eq!(queue.live_count(Lane::Task), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_checks_back_off_then_give_up() {
    struct FailingHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for FailingHandler {
        async fn process_messages(&self, _key: &DispatchKey) -> Result<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(false)
        }
    }

    let policy = RetryPolicy {
        max_retries: 2,
        initial_delay_ms: 1000,
        backoff_multiplier: 2.0,
        max_delay_ms: 60_000,
        jitter: false,
    };
    let queue = DispatchQueue::new(settings(5, 2), policy);
    let handler = Arc::new(FailingHandler {
        calls: AtomicUsize::new(0),
    });
    queue.set_message_handler(handler.clone());
    let mut events = queue.subscribe();

    queue.enqueue_check("k");

    let mut retries = Vec::new();
    loop {
        let event = events.recv().await.unwrap();
        match event.kind {
            QueueEventKind::RetryScheduled { attempt, delay_ms } => retries.push((attempt, delay_ms)),
            QueueEventKind::RetriesExhausted { attempts } => {
                assert_eq!(attempts, 3);
                break;
            }
            _ => {}
        }
    }

    assert_eq!(retries, vec![(1, 1000), (2, 2000)]);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_shutdown_bounded_by_deadline() {
    let backend = ScriptedBackend::stubborn();
    let (queue, _runner) = setup(Arc::clone(&backend), 5, 2);

    for key in ["a", "b", "c"] {
        queue.enqueue_check(key);
    }
    for key in ["a", "b", "c"] {
        wait_for_phase(&queue, key, Lane::Message, LanePhase::Running).await;
    }

    let deadline = Duration::from_millis(300);
    let started = std::time::Instant::now();
    tokio::join!(queue.shutdown(deadline), queue.shutdown(deadline));
    let elapsed = started.elapsed();

    assert!(elapsed >= deadline, "returned before deadline: {:?}", elapsed);
    assert!(elapsed < deadline + Duration::from_millis(250), "took {:?}", elapsed);

    // Stragglers are killed after the deadline
    wait_until(|| backend.live() == 0).await;
    let kills = backend
        .terminations()
        .into_iter()
        .filter(|(_, signal)| *signal == TerminateSignal::Kill)
        .count();
    assert_eq!(kills, 3);

    assert!(matches!(
        queue.enqueue_task("a", "late", "late", || async { Ok(()) }),
        Err(Error::ShuttingDown)
    ));
}

#[tokio::test]
async fn test_graceful_shutdown_returns_early() {
    let backend = ScriptedBackend::new();
    let (queue, _runner) = setup(Arc::clone(&backend), 5, 2);

    queue.enqueue_check("a");
    wait_for_phase(&queue, "a", Lane::Message, LanePhase::Running).await;

    let started = std::time::Instant::now();
    queue.shutdown(Duration::from_secs(5)).await;

    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(backend.terminations().is_empty());
    assert_eq!(backend.live(), 0);
}
