//! # corral-dispatch
//!
//! Orchestration core for sandboxed agent processes.
//! Decides when to start, reuse or queue a process per dispatch key, and
//! decodes the marker-delimited result protocol on its stdout.
//!
//! ## Features
//!
//! - Admission control with global per-lane caps and per-key FIFO
//! - Single live process per (key, lane), with live input handoff
//! - Streaming output parser with startup / idle timeouts and truncation
//! - Container (Docker/Podman) and local subprocess backends
//! - Lifecycle events over a broadcast channel
//! - Bounded graceful shutdown

pub mod backend;
pub mod event;
pub mod handle;
pub mod key;
pub mod outcome;
pub mod parser;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod runner;
pub mod state;
pub mod timeout;

// Keys & state
pub use key::{DispatchKey, Lane, LaneMap};
pub use state::LanePhase;

// Queue
pub use event::{QueueEvent, QueueEventKind};
pub use queue::{DispatchQueue, MessageHandler, TaskCompletion, TaskSubmission};
pub use registry::{ActiveTaskInfo, DispatchRegistry, QueueEntry};
pub use retry::{RetryDecision, RetryPolicy};

// Processes
pub use backend::{
    ContainerBackend, LocalBackend, SandboxBackend, SpawnContext, SpawnedChild, SpawnedProcess,
    TerminateSignal,
};
pub use handle::{ProcessHandle, ProcessId};
pub use outcome::{classify, RunOutcome, RunReport};
pub use runner::{RunRequest, SandboxRunner};

// Output protocol
pub use parser::{OutputParser, ParserConfig, ParserState, RecordStream};
pub use protocol::{Markers, OutputRecord, ProtocolError, RecordStatus};
pub use timeout::{TimeoutKind, TimeoutSupervisor};
