//! Error types for corral
//!
//! 모든 에러를 중앙에서 관리

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// corral 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // 설정 관련
    // ========================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    // ========================================================================
    // 프로세스 관련
    // ========================================================================
    #[error("Spawn failed: {0}")]
    Spawn(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Process exited with code {code:?}: {stderr}")]
    ProcessExit { code: Option<i32>, stderr: String },

    #[error("Process produced no output")]
    NoOutput,

    // ========================================================================
    // 프로토콜 관련
    // ========================================================================
    #[error("Protocol error: {0}")]
    Protocol(String),

    // ========================================================================
    // 큐 관련
    // ========================================================================
    #[error("Retries exhausted for {key} after {attempts} attempts")]
    RetriesExhausted { key: String, attempts: u32 },

    #[error("Queue is shutting down")]
    ShuttingDown,

    // ========================================================================
    // 실행 관련
    // ========================================================================
    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Cancelled")]
    Cancelled,

    // ========================================================================
    // 일반
    // ========================================================================
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // ========================================================================
    // 외부 에러 변환
    // ========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ========================================================================
    // 기타
    // ========================================================================
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// 재시도 가능한 에러인지 확인
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Spawn(_) | Error::Backend(_) | Error::Timeout(_) | Error::Io(_)
        )
    }

    /// 프로세스 실행 실패인지 확인 (spawn, exit, timeout, 무출력)
    pub fn is_run_failure(&self) -> bool {
        matches!(
            self,
            Error::Spawn(_)
                | Error::ProcessExit { .. }
                | Error::NoOutput
                | Error::Timeout(_)
        )
    }

    /// Process exit 에러 생성 헬퍼
    pub fn process_exit(code: Option<i32>, stderr: impl Into<String>) -> Self {
        Error::ProcessExit {
            code,
            stderr: stderr.into(),
        }
    }
}

// ============================================================================
// From 구현 (추가 변환)
// ============================================================================

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Internal(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Internal(s.to_string())
    }
}
