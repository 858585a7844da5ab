//! Output protocol - marker-delimited result records on a sandbox's stdout
//!
//! ```text
//! ---CORRAL_OUTPUT_START---
//! {"status":"success","result":"...","newSessionId":"..."}
//! ---CORRAL_OUTPUT_END---
//! ```

use corral_foundation::Error;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Decode failures for a single block
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("no complete output block found")]
    MissingMarkers,

    #[error("output block is not valid UTF-8")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("invalid output record: {0}")]
    InvalidRecord(#[from] serde_json::Error),
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e.to_string())
    }
}

/// Start/end marker literals for one protocol name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Markers {
    start: String,
    end: String,
}

impl Markers {
    pub fn new(protocol: &str) -> Self {
        let protocol = protocol.trim();
        Self {
            start: format!("---{}_OUTPUT_START---", protocol),
            end: format!("---{}_OUTPUT_END---", protocol),
        }
    }

    pub fn start(&self) -> &str {
        &self.start
    }

    pub fn end(&self) -> &str {
        &self.end
    }

    /// Wrap a record the way a sandbox would emit it
    pub fn wrap(&self, record_json: &str) -> String {
        format!("{}\n{}\n{}\n", self.start, record_json, self.end)
    }
}

impl Default for Markers {
    fn default() -> Self {
        Self::new("CORRAL")
    }
}

/// Record status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Success,
    Error,
}

/// One decoded result block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputRecord {
    pub status: RecordStatus,

    #[serde(default)]
    pub result: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_session_id: Option<String>,

    #[serde(default, alias = "resumeMarker", skip_serializing_if = "Option::is_none")]
    pub resume_at: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Non-final streamed chunk
    #[serde(default)]
    pub intermediate: bool,
}

impl OutputRecord {
    pub fn success(result: impl Into<String>) -> Self {
        Self {
            status: RecordStatus::Success,
            result: Some(result.into()),
            new_session_id: None,
            resume_at: None,
            error: None,
            intermediate: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: RecordStatus::Error,
            result: None,
            new_session_id: None,
            resume_at: None,
            error: Some(message.into()),
            intermediate: false,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.new_session_id = Some(session_id.into());
        self
    }

    pub fn intermediate(mut self) -> Self {
        self.intermediate = true;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == RecordStatus::Success
    }

    /// Final, non-erroring result for the current invocation
    pub fn is_terminal_success(&self) -> bool {
        self.is_success() && !self.intermediate
    }
}

/// Decode the bytes between a start and end marker
pub fn decode_record(body: &[u8]) -> Result<OutputRecord, ProtocolError> {
    let text = std::str::from_utf8(body)?;
    Ok(serde_json::from_str(text.trim())?)
}

/// Find the last complete block in `haystack` and return its body
pub fn find_last_block<'a>(haystack: &'a [u8], markers: &Markers) -> Option<&'a [u8]> {
    let end = rfind(haystack, markers.end.as_bytes())?;
    let start = rfind(&haystack[..end], markers.start.as_bytes())?;
    Some(&haystack[start + markers.start.len()..end])
}

pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).rposition(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_markers() {
        let markers = Markers::new("AGENT");
        assert_eq!(markers.start(), "---AGENT_OUTPUT_START---");
        assert_eq!(markers.end(), "---AGENT_OUTPUT_END---");
    }

    #[test]
    fn test_decode_full_record() {
        let body = br#" {"status":"success","result":"hi","newSessionId":"s-1","resumeMarker":"r-9","intermediate":true}
"#;
        let record = decode_record(body).unwrap();
        assert!(record.is_success());
        assert_eq!(record.result.as_deref(), Some("hi"));
        assert_eq!(record.new_session_id.as_deref(), Some("s-1"));
        assert_eq!(record.resume_at.as_deref(), Some("r-9"));
        assert!(record.intermediate);
        assert!(!record.is_terminal_success());
    }

    #[test]
    fn test_decode_null_result() {
        let record = decode_record(br#"{"status":"error","result":null,"error":"boom"}"#).unwrap();
        assert_eq!(record.status, RecordStatus::Error);
        assert!(record.result.is_none());
        assert_eq!(record.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode_record(b"not json"),
            Err(ProtocolError::InvalidRecord(_))
        ));
        assert!(matches!(
            decode_record(&[0xff, 0xfe]),
            Err(ProtocolError::InvalidUtf8(_))
        ));
    }

    #[test]
    fn test_find_last_block() {
        let markers = Markers::default();
        let text = format!(
            "noise\n{}{}tail",
            markers.wrap(r#"{"status":"success","result":"first"}"#),
            markers.wrap(r#"{"status":"success","result":"second"}"#)
        );

        let body = find_last_block(text.as_bytes(), &markers).unwrap();
        let record = decode_record(body).unwrap();
        assert_eq!(record.result.as_deref(), Some("second"));
    }

    #[test]
    fn test_find_last_block_ignores_unclosed() {
        let markers = Markers::default();
        let text = format!("{}\n{{\"status\":\"success\"}}\n", markers.start());
        assert!(find_last_block(text.as_bytes(), &markers).is_none());
    }
}
