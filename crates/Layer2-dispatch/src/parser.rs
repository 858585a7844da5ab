//! Output parser - turns raw stdout/stderr chunks into result records
//!
//! Features:
//! - Incremental marker scanning over bytes (chunk boundaries may split
//!   markers or multi-byte characters)
//! - Records delivered in order over a bounded channel
//! - Head-preserving truncation of both buffers
//! - Startup / idle timeout tracking via [`TimeoutSupervisor`]

use crate::protocol::{self, decode_record, find_last_block, Markers, OutputRecord, ProtocolError};
use crate::timeout::{TimeoutKind, TimeoutSupervisor};
use corral_foundation::ParserSettings;
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

/// Parser configuration
#[derive(Debug, Clone)]
pub struct ParserConfig {
    pub markers: Markers,
    pub max_output_size: usize,
    /// Largest record body accepted, split or not
    pub max_block_size: usize,
    pub startup_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self::from(&ParserSettings::default())
    }
}

impl From<&ParserSettings> for ParserConfig {
    fn from(settings: &ParserSettings) -> Self {
        Self {
            markers: Markers::new(&settings.protocol),
            max_output_size: settings.max_output_size,
            max_block_size: settings.max_block_size,
            startup_timeout: settings.startup_timeout(),
            idle_timeout: settings.idle_timeout(),
        }
    }
}

impl ParserConfig {
    pub fn with_max_output_size(mut self, size: usize) -> Self {
        self.max_output_size = size;
        self
    }

    pub fn with_max_block_size(mut self, size: usize) -> Self {
        self.max_block_size = size;
        self
    }

    pub fn with_timeouts(mut self, startup: Duration, idle: Duration) -> Self {
        self.startup_timeout = startup;
        self.idle_timeout = idle;
        self
    }
}

/// Byte buffer that keeps the head and drops the tail once full
#[derive(Debug)]
struct CappedBuffer {
    bytes: Vec<u8>,
    cap: usize,
    truncated: bool,
}

impl CappedBuffer {
    fn new(cap: usize) -> Self {
        Self {
            bytes: Vec::new(),
            cap,
            truncated: false,
        }
    }

    /// Returns true the first time bytes are dropped
    fn push(&mut self, chunk: &[u8]) -> bool {
        let room = self.cap.saturating_sub(self.bytes.len());
        if chunk.len() <= room {
            self.bytes.extend_from_slice(chunk);
            return false;
        }

        self.bytes.extend_from_slice(&chunk[..room]);
        let first = !self.truncated;
        self.truncated = true;
        first
    }
}

/// Point-in-time view of a parser
#[derive(Debug, Clone, Default)]
pub struct ParserState {
    pub timed_out: bool,
    pub timeout_kind: Option<TimeoutKind>,
    /// At least one block completed
    pub had_streaming_output: bool,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    /// Latest session id reported by any record
    pub new_session_id: Option<String>,
    pub records_emitted: usize,
    pub decode_failures: usize,
    /// Every decoded record has been handed to the stream
    pub output_complete: bool,
}

/// Receiving end of a streaming parser
#[derive(Debug)]
pub struct RecordStream {
    rx: mpsc::Receiver<OutputRecord>,
}

impl RecordStream {
    pub fn new(rx: mpsc::Receiver<OutputRecord>) -> Self {
        Self { rx }
    }

    pub async fn next_record(&mut self) -> Option<OutputRecord> {
        self.rx.recv().await
    }
}

impl Stream for RecordStream {
    type Item = OutputRecord;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// Output parser for one process
pub struct OutputParser {
    config: ParserConfig,
    label: String,
    stdout: CappedBuffer,
    stderr: CappedBuffer,
    /// Unconsumed stdout still being scanned for blocks
    scan: Vec<u8>,
    sink: Option<mpsc::Sender<OutputRecord>>,
    streaming: bool,
    supervisor: TimeoutSupervisor,
    had_streaming_output: bool,
    new_session_id: Option<String>,
    records_emitted: usize,
    decode_failures: usize,
}

impl OutputParser {
    /// Non-streaming parser; use [`parse_final_output`](Self::parse_final_output)
    pub fn new(config: ParserConfig, label: impl Into<String>) -> Self {
        let now = Instant::now();
        Self {
            supervisor: TimeoutSupervisor::new(config.startup_timeout, config.idle_timeout, now),
            stdout: CappedBuffer::new(config.max_output_size),
            stderr: CappedBuffer::new(config.max_output_size),
            config,
            label: label.into(),
            scan: Vec::new(),
            sink: None,
            streaming: false,
            had_streaming_output: false,
            new_session_id: None,
            records_emitted: 0,
            decode_failures: 0,
        }
    }

    /// Streaming parser delivering records into `sink`
    pub fn with_sink(mut self, sink: mpsc::Sender<OutputRecord>) -> Self {
        self.sink = Some(sink);
        self.streaming = true;
        self
    }

    /// Streaming parser with its own bounded channel
    pub fn streaming(
        config: ParserConfig,
        label: impl Into<String>,
        capacity: usize,
    ) -> (Self, RecordStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(config, label).with_sink(tx), RecordStream::new(rx))
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Append stdout bytes, returning the records completed by this chunk
    ///
    /// Records are sent to the sink before this returns, so awaiting every
    /// `feed_output` call is enough to know all deliveries were dispatched.
    pub async fn feed_output(&mut self, chunk: &[u8]) -> Vec<OutputRecord> {
        if chunk.is_empty() {
            return Vec::new();
        }
        self.supervisor.on_bytes();

        if self.stdout.push(chunk) {
            warn!(
                "[{}] stdout exceeded {} bytes, truncating",
                self.label, self.config.max_output_size
            );
        }

        self.scan.extend_from_slice(chunk);
        let records = self.extract_blocks();

        for record in &records {
            if let Some(sink) = &self.sink {
                if sink.send(record.clone()).await.is_err() {
                    debug!("[{}] record stream closed, dropping record", self.label);
                }
            }
        }
        records
    }

    /// Append stderr bytes
    pub fn feed_error(&mut self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        self.supervisor.on_bytes();

        for line in String::from_utf8_lossy(chunk).lines() {
            let line = line.trim();
            if !line.is_empty() {
                debug!("[{}] stderr: {}", self.label, line);
            }
        }

        if self.stderr.push(chunk) {
            warn!(
                "[{}] stderr exceeded {} bytes, truncating",
                self.label, self.config.max_output_size
            );
        }
    }

    fn extract_blocks(&mut self) -> Vec<OutputRecord> {
        let start = self.config.markers.start().as_bytes().to_vec();
        let end = self.config.markers.end().as_bytes().to_vec();
        let mut records = Vec::new();

        loop {
            let Some(s) = protocol::find(&self.scan, &start) else {
                // Keep a tail long enough to hold a split start marker
                let keep = start.len().saturating_sub(1).min(self.scan.len());
                let cut = self.scan.len() - keep;
                self.scan.drain(..cut);
                break;
            };

            let body_start = s + start.len();
            let Some(e) = protocol::find(&self.scan[body_start..], &end) else {
                self.scan.drain(..s);
                // The body plus a partial end marker can never fit any more
                let limit = start.len() + self.config.max_block_size + end.len();
                if self.scan.len() > limit {
                    warn!(
                        "[{}] output block exceeds {} bytes, discarding",
                        self.label, self.config.max_block_size
                    );
                    self.decode_failures += 1;
                    // Keep a tail that may hold the start of the next block
                    let keep = start.len().saturating_sub(1);
                    let cut = self.scan.len() - keep;
                    self.scan.drain(..cut);
                }
                break;
            };

            let body_end = body_start + e;
            if e > self.config.max_block_size {
                warn!(
                    "[{}] output block exceeds {} bytes, discarding",
                    self.label, self.config.max_block_size
                );
                self.decode_failures += 1;
                self.scan.drain(..body_end + end.len());
                continue;
            }
            match decode_record(&self.scan[body_start..body_end]) {
                Ok(record) => {
                    self.had_streaming_output = true;
                    self.records_emitted += 1;
                    self.supervisor.on_block(Instant::now());
                    if let Some(session) = &record.new_session_id {
                        self.new_session_id = Some(session.clone());
                    }
                    records.push(record);
                }
                Err(e) => {
                    self.decode_failures += 1;
                    warn!("[{}] skipping malformed output block: {}", self.label, e);
                }
            }
            self.scan.drain(..body_end + end.len());
        }

        records
    }

    /// Next instant a timeout may fire, if any timer is armed
    pub fn next_deadline(&self) -> Option<Instant> {
        self.supervisor.deadline()
    }

    /// Check the timers; reports a timeout at most once
    pub fn poll_timeout(&mut self, now: Instant) -> Option<TimeoutKind> {
        let fired = self.supervisor.poll(now);
        if let Some(kind) = fired {
            warn!(
                "[{}] {} timeout (had output: {})",
                self.label, kind, self.had_streaming_output
            );
        }
        fired
    }

    /// Snapshot
    pub fn state(&self) -> ParserState {
        let timeout_kind = self.supervisor.expired();
        ParserState {
            timed_out: timeout_kind.is_some(),
            timeout_kind,
            had_streaming_output: self.had_streaming_output,
            stdout: String::from_utf8_lossy(&self.stdout.bytes).into_owned(),
            stderr: String::from_utf8_lossy(&self.stderr.bytes).into_owned(),
            stdout_truncated: self.stdout.truncated,
            stderr_truncated: self.stderr.truncated,
            new_session_id: self.new_session_id.clone(),
            records_emitted: self.records_emitted,
            decode_failures: self.decode_failures,
            output_complete: self.streaming && self.sink.is_none(),
        }
    }

    /// Retained stdout bytes, exactly as received up to the cap
    pub fn stdout_bytes(&self) -> &[u8] {
        &self.stdout.bytes
    }

    pub fn stderr_bytes(&self) -> &[u8] {
        &self.stderr.bytes
    }

    /// Decode the last complete block in the retained stdout
    pub fn parse_final_output(&self) -> Result<OutputRecord, ProtocolError> {
        let body = find_last_block(&self.stdout.bytes, &self.config.markers)
            .ok_or(ProtocolError::MissingMarkers)?;
        decode_record(body)
    }

    /// Close the record stream once the process output has ended
    pub fn finish(&mut self) {
        self.sink = None;
    }

    /// Disarm timers and close the stream; idempotent
    pub fn cleanup(&mut self) {
        self.supervisor.stop();
        self.finish();
    }
}

impl std::fmt::Debug for OutputParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputParser")
            .field("label", &self.label)
            .field("streaming", &self.streaming)
            .field("records_emitted", &self.records_emitted)
            .field("stdout_len", &self.stdout.bytes.len())
            .finish()
    }
}
