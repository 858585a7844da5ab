//! Run classification - turns exit status plus parser state into a result

use crate::parser::ParserState;
use crate::protocol::{OutputRecord, ProtocolError, RecordStatus};
use corral_foundation::{Error, Result};
use serde::{Deserialize, Serialize};

/// Stderr kept in a `ProcessExit` error
const STDERR_TAIL: usize = 2000;

/// Successful run summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    /// Status of the last record (`Success` when nothing was expected)
    pub status: RecordStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub new_session_id: Option<String>,
    pub exit_code: Option<i32>,
    /// Reclaimed by the idle timer after earlier output
    pub timed_out: bool,
    pub records: usize,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

impl RunOutcome {
    fn empty(exit_code: Option<i32>, state: &ParserState) -> Self {
        Self {
            status: RecordStatus::Success,
            result: None,
            error: None,
            new_session_id: state.new_session_id.clone(),
            exit_code,
            timed_out: state.timed_out,
            records: state.records_emitted,
            stdout_truncated: state.stdout_truncated,
            stderr_truncated: state.stderr_truncated,
        }
    }

    fn from_record(record: OutputRecord, exit_code: Option<i32>, state: &ParserState) -> Self {
        Self {
            status: record.status,
            result: record.result,
            error: record.error,
            new_session_id: record.new_session_id.or_else(|| state.new_session_id.clone()),
            ..Self::empty(exit_code, state)
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RecordStatus::Success
    }
}

/// Everything known about a finished run
#[derive(Debug)]
pub struct RunReport {
    pub exit_code: Option<i32>,
    pub state: ParserState,
    /// Records were consumed as a stream rather than parsed at the end
    pub streaming: bool,
    /// Last record seen while streaming
    pub last_record: Option<OutputRecord>,
    /// `parse_final_output` result for non-streaming runs
    pub final_output: Option<std::result::Result<OutputRecord, ProtocolError>>,
    /// A missing result block is an error
    pub expect_output: bool,
}

/// Classify a finished run
///
/// An idle timeout after at least one completed block counts as success
/// with no result. This is best effort: a final turn that failed without
/// flushing its block looks the same.
pub fn classify(report: RunReport) -> Result<RunOutcome> {
    let RunReport {
        exit_code,
        state,
        streaming,
        last_record,
        final_output,
        expect_output,
    } = report;

    if state.timed_out {
        let kind = state
            .timeout_kind
            .map(|k| k.to_string())
            .unwrap_or_else(|| "run".to_string());
        if state.had_streaming_output {
            return Ok(RunOutcome::empty(exit_code, &state));
        }
        return Err(Error::Timeout(format!("{} timeout with no output", kind)));
    }

    if exit_code != Some(0) {
        return Err(Error::process_exit(exit_code, stderr_tail(&state.stderr)));
    }

    if streaming {
        return match last_record {
            Some(record) => Ok(RunOutcome::from_record(record, exit_code, &state)),
            None if expect_output => Err(Error::NoOutput),
            None => Ok(RunOutcome::empty(exit_code, &state)),
        };
    }

    match final_output {
        Some(Ok(record)) => Ok(RunOutcome::from_record(record, exit_code, &state)),
        Some(Err(ProtocolError::MissingMarkers)) | None if expect_output => Err(Error::NoOutput),
        Some(Err(ProtocolError::MissingMarkers)) | None => Ok(RunOutcome::empty(exit_code, &state)),
        Some(Err(e)) => Err(e.into()),
    }
}

fn stderr_tail(stderr: &str) -> String {
    let trimmed = stderr.trim_end();
    let mut start = trimmed.len().saturating_sub(STDERR_TAIL);
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed[start..].to_string()
}
