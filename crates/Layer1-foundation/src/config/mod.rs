//! Config - 통합 설정 관리
//!
//! - `corral.rs` - CorralConfig 통합 설정 (큐, 재시도, 파서, 러너, 컨테이너)

mod corral;

pub use corral::{
    ContainerRuntime, ContainerSettings, CorralConfig, ParserSettings, QueueSettings,
    RetrySettings, RunnerSettings, VolumeSetting, CORRAL_CONFIG_ENV, CORRAL_CONFIG_FILE,
};
