//! Sandbox runner - one process from spawn to classified result
//!
//! Spawns through the backend, registers the handle with the queue, pumps
//! stdout/stderr into an [`OutputParser`] while watching its deadlines, and
//! escalates a timeout from a graceful stop to a kill after the grace period.

use crate::backend::{spawn_process, SandboxBackend, SpawnContext, TerminateSignal};
use crate::key::{DispatchKey, Lane};
use crate::outcome::{classify, RunOutcome, RunReport};
use crate::parser::{OutputParser, ParserConfig};
use crate::protocol::OutputRecord;
use crate::queue::DispatchQueue;
use corral_foundation::{CorralConfig, Result, RunnerSettings};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// How long to keep reading output after the process exited
const EXIT_DRAIN: Duration = Duration::from_secs(2);

/// One run to perform
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub key: DispatchKey,
    pub lane: Lane,
    pub prompt: String,
    pub session_id: Option<String>,
    /// Receive each record as it completes
    pub stream: Option<mpsc::Sender<OutputRecord>>,
    /// Missing result block is an error
    pub expect_output: bool,
}

impl RunRequest {
    pub fn new(key: impl Into<DispatchKey>, lane: Lane, prompt: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            lane,
            prompt: prompt.into(),
            session_id: None,
            stream: None,
            expect_output: true,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_stream(mut self, stream: mpsc::Sender<OutputRecord>) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn expect_output(mut self, expect: bool) -> Self {
        self.expect_output = expect;
        self
    }
}

/// Runs sandbox processes on behalf of queued work
#[derive(Clone)]
pub struct SandboxRunner {
    queue: DispatchQueue,
    backend: Arc<dyn SandboxBackend>,
    parser: ParserConfig,
    grace_period: Duration,
    read_chunk_size: usize,
}

impl SandboxRunner {
    pub fn new(queue: DispatchQueue, backend: Arc<dyn SandboxBackend>) -> Self {
        Self::with_settings(
            queue,
            backend,
            ParserConfig::default(),
            &RunnerSettings::default(),
        )
    }

    pub fn with_settings(
        queue: DispatchQueue,
        backend: Arc<dyn SandboxBackend>,
        parser: ParserConfig,
        runner: &RunnerSettings,
    ) -> Self {
        Self {
            queue,
            backend,
            parser,
            grace_period: runner.grace_period(),
            read_chunk_size: runner.read_chunk_size.max(1),
        }
    }

    pub fn from_config(
        queue: DispatchQueue,
        backend: Arc<dyn SandboxBackend>,
        config: &CorralConfig,
    ) -> Self {
        Self::with_settings(
            queue,
            backend,
            ParserConfig::from(&config.parser),
            &config.runner,
        )
    }

    pub fn queue(&self) -> &DispatchQueue {
        &self.queue
    }

    /// Run one process to completion
    pub async fn run(&self, request: RunRequest) -> Result<RunOutcome> {
        let RunRequest {
            key,
            lane,
            prompt,
            session_id,
            stream,
            expect_output,
        } = request;

        let ctx = SpawnContext::new(key.clone(), lane, prompt).with_session(session_id);
        let spawned = match spawn_process(&self.backend, &ctx).await {
            Ok(spawned) => spawned,
            Err(e) => {
                warn!("Spawn failed for {}/{}: {}", key, lane, e);
                self.queue.spawn_failed(key.as_str(), lane);
                return Err(e);
            }
        };

        let handle = spawned.handle;
        let mut stdout = spawned.stdout;
        let mut stderr = spawned.stderr;
        let mut exit = spawned.exit;
        self.queue
            .register_process(key.as_str(), handle.clone(), lane)
            .await;

        let streaming = stream.is_some();
        let mut parser = OutputParser::new(self.parser.clone(), handle.name.clone());
        if let Some(sink) = stream {
            parser = parser.with_sink(sink);
        }

        let mut out_buf = vec![0u8; self.read_chunk_size];
        let mut err_buf = vec![0u8; self.read_chunk_size];
        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut exit_status: Option<Result<Option<i32>>> = None;
        let mut kill_at: Option<Instant> = None;
        let mut drain_until: Option<Instant> = None;
        let mut last_record: Option<OutputRecord> = None;

        while stdout_open || stderr_open || exit_status.is_none() {
            let deadline = parser.next_deadline().filter(|_| exit_status.is_none());

            tokio::select! {
                read = stdout.read(&mut out_buf), if stdout_open => match read {
                    Ok(0) => stdout_open = false,
                    Ok(n) => {
                        for record in parser.feed_output(&out_buf[..n]).await {
                            if record.is_terminal_success() {
                                self.queue.notify_lane_idle(key.as_str(), lane).await;
                            }
                            last_record = Some(record);
                        }
                    }
                    Err(e) => {
                        debug!("[{}] stdout read failed: {}", handle.name, e);
                        stdout_open = false;
                    }
                },
                read = stderr.read(&mut err_buf), if stderr_open => match read {
                    Ok(0) => stderr_open = false,
                    Ok(n) => parser.feed_error(&err_buf[..n]),
                    Err(e) => {
                        debug!("[{}] stderr read failed: {}", handle.name, e);
                        stderr_open = false;
                    }
                },
                status = &mut exit, if exit_status.is_none() => {
                    exit_status = Some(status);
                    kill_at = None;
                    drain_until = Some(Instant::now() + EXIT_DRAIN);
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if parser.poll_timeout(Instant::now()).is_some() {
                        if let Err(e) = handle.terminate(TerminateSignal::Graceful).await {
                            warn!("Graceful stop of {} failed: {}", handle.name, e);
                        }
                        kill_at = Some(Instant::now() + self.grace_period);
                    }
                },
                _ = sleep_until(kill_at.unwrap_or_else(Instant::now)), if kill_at.is_some() => {
                    kill_at = None;
                    warn!("{} ignored graceful stop, killing", handle.name);
                    if let Err(e) = handle.terminate(TerminateSignal::Kill).await {
                        warn!("Kill of {} failed: {}", handle.name, e);
                    }
                },
                _ = sleep_until(drain_until.unwrap_or_else(Instant::now)), if drain_until.is_some() => {
                    // Output still held open, e.g. by a leftover grandchild
                    debug!("[{}] output not closed after exit, giving up", handle.name);
                    drain_until = None;
                    stdout_open = false;
                    stderr_open = false;
                },
            }
        }

        parser.finish();
        self.queue.process_exited(key.as_str(), lane, &handle);

        let exit_code = match exit_status {
            Some(Ok(code)) => code,
            Some(Err(e)) => {
                parser.cleanup();
                return Err(e);
            }
            None => None,
        };

        let state = parser.state();
        info!(
            "{} exited with {:?} ({} records, timed out: {})",
            handle.name, exit_code, state.records_emitted, state.timed_out
        );

        let final_output = (!streaming).then(|| parser.parse_final_output());
        parser.cleanup();

        classify(RunReport {
            exit_code,
            state,
            streaming,
            last_record,
            final_output,
            expect_output,
        })
    }
}
