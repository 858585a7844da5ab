//! # corral-foundation
//!
//! Foundation layer for corral:
//! - Error: 중앙 에러 타입 (`Error`, `Result`)
//! - Storage: JsonStore (설정 파일)
//! - Config: 통합 설정 (CorralConfig - 큐, 재시도, 파서, 러너, 컨테이너)

pub mod config;
pub mod error;
pub mod storage;

// ============================================================================
// Error
// ============================================================================
pub use error::{Error, Result};

// ============================================================================
// Config (설정)
// ============================================================================
pub use config::{
    ContainerRuntime, ContainerSettings, CorralConfig, ParserSettings, QueueSettings,
    RetrySettings, RunnerSettings, VolumeSetting, CORRAL_CONFIG_ENV, CORRAL_CONFIG_FILE,
};

// ============================================================================
// Storage (저장소)
// ============================================================================
pub use storage::JsonStore;
