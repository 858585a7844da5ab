//! Corral Config - 통합 설정
//!
//! 큐, 재시도, 출력 파서, 러너, 컨테이너 설정을 통합 관리

use crate::storage::JsonStore;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// 설정 파일명
pub const CORRAL_CONFIG_FILE: &str = "config.json";

/// 명시적 설정 파일 경로 환경 변수
pub const CORRAL_CONFIG_ENV: &str = "CORRAL_CONFIG";

// ============================================================================
// Corral Config (통합)
// ============================================================================

/// corral 통합 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorralConfig {
    /// 버전 (마이그레이션용)
    #[serde(default = "default_version")]
    pub version: u32,

    /// 큐 / 동시성 제한
    #[serde(default)]
    pub queue: QueueSettings,

    /// 재시도 정책
    #[serde(default)]
    pub retry: RetrySettings,

    /// 출력 파서
    #[serde(default)]
    pub parser: ParserSettings,

    /// 프로세스 러너
    #[serde(default)]
    pub runner: RunnerSettings,

    /// 컨테이너 백엔드
    #[serde(default)]
    pub container: ContainerSettings,
}

impl Default for CorralConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            queue: QueueSettings::default(),
            retry: RetrySettings::default(),
            parser: ParserSettings::default(),
            runner: RunnerSettings::default(),
            container: ContainerSettings::default(),
        }
    }
}

impl CorralConfig {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Load / Save
    // ========================================================================

    /// 설정 로드
    ///
    /// `CORRAL_CONFIG`가 지정되면 해당 파일만 사용하고,
    /// 아니면 글로벌 + 프로젝트 설정을 병합한다.
    pub fn load() -> Result<Self> {
        let config = match std::env::var_os(CORRAL_CONFIG_ENV) {
            Some(path) => {
                debug!("Loading config from {}", Path::new(&path).display());
                Self::load_file(Path::new(&path))?
            }
            None => Self::load_layered()?,
        };
        config.validate()?;
        Ok(config)
    }

    /// 글로벌 + 프로젝트 병합 로드
    pub fn load_layered() -> Result<Self> {
        let mut config = Self::new();

        // 1. 글로벌 설정
        if let Ok(global) = JsonStore::global() {
            if let Some(global_config) = global.load_optional::<CorralConfig>(CORRAL_CONFIG_FILE)? {
                debug!("Merging global config from {}", global.base_dir().display());
                config.merge(global_config);
            }
        }

        // 2. 프로젝트 설정
        if let Ok(project) = JsonStore::current_project() {
            if let Some(project_config) =
                project.load_optional::<CorralConfig>(CORRAL_CONFIG_FILE)?
            {
                debug!("Merging project config from {}", project.base_dir().display());
                config.merge(project_config);
            }
        }

        Ok(config)
    }

    /// 단일 파일 로드
    pub fn load_file(path: &Path) -> Result<Self> {
        let dir = path.parent().map(PathBuf::from).unwrap_or_default();
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Config(format!("Invalid config path: {}", path.display())))?;
        JsonStore::new(dir).load(filename)
    }

    /// 글로벌 설정 저장
    pub fn save_global(&self) -> Result<()> {
        let store = JsonStore::global()?;
        store.save(CORRAL_CONFIG_FILE, self)
    }

    /// 프로젝트 설정 저장
    pub fn save_project(&self) -> Result<()> {
        let store = JsonStore::current_project()?;
        store.save(CORRAL_CONFIG_FILE, self)
    }

    // ========================================================================
    // Merge / Validate
    // ========================================================================

    /// 다른 설정과 병합 (other가 우선)
    pub fn merge(&mut self, other: CorralConfig) {
        if other.version != default_version() {
            self.version = other.version;
        }
        self.queue.merge(other.queue);
        self.retry.merge(other.retry);
        self.parser.merge(other.parser);
        self.runner.merge(other.runner);
        self.container.merge(other.container);
    }

    /// 값 검증
    pub fn validate(&self) -> Result<()> {
        if self.queue.max_message_processes == 0 {
            return Err(Error::Config(
                "queue.maxMessageProcesses must be at least 1".to_string(),
            ));
        }
        if self.queue.max_task_processes == 0 {
            return Err(Error::Config(
                "queue.maxTaskProcesses must be at least 1".to_string(),
            ));
        }
        if self.parser.max_output_size == 0 {
            return Err(Error::Config(
                "parser.maxOutputSize must be greater than 0".to_string(),
            ));
        }
        if self.parser.max_block_size == 0 {
            return Err(Error::Config(
                "parser.maxBlockSize must be greater than 0".to_string(),
            ));
        }
        if self.parser.startup_timeout_ms == 0 || self.parser.idle_timeout_ms == 0 {
            return Err(Error::Config(
                "parser timeouts must be greater than 0".to_string(),
            ));
        }
        if self.parser.protocol.trim().is_empty() {
            return Err(Error::Config("parser.protocol must not be empty".to_string()));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(Error::Config(
                "retry.backoffMultiplier must be >= 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Queue Settings
// ============================================================================

/// 큐 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSettings {
    /// message lane 전역 동시 실행 수
    #[serde(default = "default_max_message_processes")]
    pub max_message_processes: usize,

    /// task lane 전역 동시 실행 수
    #[serde(default = "default_max_task_processes")]
    pub max_task_processes: usize,

    /// shutdown 대기 한도 (ms)
    #[serde(default = "default_shutdown_deadline_ms")]
    pub shutdown_deadline_ms: u64,

    /// 이벤트 broadcast 채널 용량
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_message_processes: default_max_message_processes(),
            max_task_processes: default_max_task_processes(),
            shutdown_deadline_ms: default_shutdown_deadline_ms(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl QueueSettings {
    fn merge(&mut self, other: QueueSettings) {
        if other.max_message_processes != default_max_message_processes() {
            self.max_message_processes = other.max_message_processes;
        }
        if other.max_task_processes != default_max_task_processes() {
            self.max_task_processes = other.max_task_processes;
        }
        if other.shutdown_deadline_ms != default_shutdown_deadline_ms() {
            self.shutdown_deadline_ms = other.shutdown_deadline_ms;
        }
        if other.event_capacity != default_event_capacity() {
            self.event_capacity = other.event_capacity;
        }
    }

    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_millis(self.shutdown_deadline_ms)
    }
}

// ============================================================================
// Retry Settings
// ============================================================================

/// 재시도 설정 (message lane)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrySettings {
    /// 최대 재시도 횟수
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// 첫 재시도 지연 (ms)
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// 지수 백오프 배수
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// 최대 지연 (ms)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// 지연에 ±20% jitter 추가
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            jitter: false,
        }
    }
}

impl RetrySettings {
    fn merge(&mut self, other: RetrySettings) {
        if other.max_retries != default_max_retries() {
            self.max_retries = other.max_retries;
        }
        if other.initial_delay_ms != default_initial_delay_ms() {
            self.initial_delay_ms = other.initial_delay_ms;
        }
        if other.backoff_multiplier != default_backoff_multiplier() {
            self.backoff_multiplier = other.backoff_multiplier;
        }
        if other.max_delay_ms != default_max_delay_ms() {
            self.max_delay_ms = other.max_delay_ms;
        }
        self.jitter = other.jitter;
    }
}

// ============================================================================
// Parser Settings
// ============================================================================

/// 출력 파서 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParserSettings {
    /// 마커 이름 (`---<PROTOCOL>_OUTPUT_START---`)
    #[serde(default = "default_protocol")]
    pub protocol: String,

    /// stdout/stderr 각각의 최대 보존 크기 (bytes)
    #[serde(default = "default_max_output_size")]
    pub max_output_size: usize,

    /// 결과 블록 하나의 최대 크기 (bytes, 보존 한도와 별개)
    #[serde(default = "default_max_block_size")]
    pub max_block_size: usize,

    /// 첫 바이트까지 대기 한도 (ms)
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,

    /// 마지막 블록 이후 무활동 한도 (ms)
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

impl Default for ParserSettings {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            max_output_size: default_max_output_size(),
            max_block_size: default_max_block_size(),
            startup_timeout_ms: default_startup_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
        }
    }
}

impl ParserSettings {
    fn merge(&mut self, other: ParserSettings) {
        if other.protocol != default_protocol() {
            self.protocol = other.protocol;
        }
        if other.max_output_size != default_max_output_size() {
            self.max_output_size = other.max_output_size;
        }
        if other.max_block_size != default_max_block_size() {
            self.max_block_size = other.max_block_size;
        }
        if other.startup_timeout_ms != default_startup_timeout_ms() {
            self.startup_timeout_ms = other.startup_timeout_ms;
        }
        if other.idle_timeout_ms != default_idle_timeout_ms() {
            self.idle_timeout_ms = other.idle_timeout_ms;
        }
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

// ============================================================================
// Runner Settings
// ============================================================================

/// 프로세스 러너 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerSettings {
    /// graceful 종료 후 강제 종료까지 유예 (ms)
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    /// stdout/stderr 읽기 단위 (bytes)
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period_ms(),
            read_chunk_size: default_read_chunk_size(),
        }
    }
}

impl RunnerSettings {
    fn merge(&mut self, other: RunnerSettings) {
        if other.grace_period_ms != default_grace_period_ms() {
            self.grace_period_ms = other.grace_period_ms;
        }
        if other.read_chunk_size != default_read_chunk_size() {
            self.read_chunk_size = other.read_chunk_size;
        }
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

// ============================================================================
// Container Settings
// ============================================================================

/// Container runtime type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerRuntime {
    #[default]
    Docker,
    Podman,
}

impl ContainerRuntime {
    /// Get the CLI command for this runtime
    pub fn command(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Podman => "podman",
        }
    }
}

/// 볼륨 마운트
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSetting {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    #[serde(default)]
    pub read_only: bool,
}

/// 컨테이너 백엔드 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSettings {
    /// docker | podman
    #[serde(default)]
    pub runtime: ContainerRuntime,

    /// 에이전트 이미지
    #[serde(default = "default_image")]
    pub image: String,

    /// 컨테이너 이름 접두사
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,

    /// 추가 라벨 (관리 라벨은 항상 붙음)
    #[serde(default)]
    pub labels: HashMap<String, String>,

    /// 환경 변수
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// 볼륨 마운트
    #[serde(default)]
    pub volumes: Vec<VolumeSetting>,

    /// 네트워크 (None = 런타임 기본값)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,

    /// CPU 제한 (cores)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<f32>,

    /// 메모리 제한 (예: "2g")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,

    /// PID 제한
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pids_limit: Option<u32>,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            runtime: ContainerRuntime::default(),
            image: default_image(),
            name_prefix: default_name_prefix(),
            labels: HashMap::new(),
            env: HashMap::new(),
            volumes: Vec::new(),
            network: None,
            cpus: None,
            memory: None,
            pids_limit: None,
        }
    }
}

impl ContainerSettings {
    fn merge(&mut self, other: ContainerSettings) {
        if other.runtime != ContainerRuntime::default() {
            self.runtime = other.runtime;
        }
        if other.image != default_image() {
            self.image = other.image;
        }
        if other.name_prefix != default_name_prefix() {
            self.name_prefix = other.name_prefix;
        }
        self.labels.extend(other.labels);
        self.env.extend(other.env);
        if !other.volumes.is_empty() {
            self.volumes = other.volumes;
        }
        if other.network.is_some() {
            self.network = other.network;
        }
        if other.cpus.is_some() {
            self.cpus = other.cpus;
        }
        if other.memory.is_some() {
            self.memory = other.memory;
        }
        if other.pids_limit.is_some() {
            self.pids_limit = other.pids_limit;
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn default_version() -> u32 {
    1
}

fn default_max_message_processes() -> usize {
    5
}

fn default_max_task_processes() -> usize {
    2
}

fn default_shutdown_deadline_ms() -> u64 {
    10_000
}

fn default_event_capacity() -> usize {
    256
}

fn default_max_retries() -> u32 {
    5
}

fn default_initial_delay_ms() -> u64 {
    5_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    300_000
}

fn default_protocol() -> String {
    "CORRAL".to_string()
}

fn default_max_output_size() -> usize {
    10 * 1024 * 1024 // 10MB
}

fn default_max_block_size() -> usize {
    4 * 1024 * 1024 // 4MB
}

fn default_startup_timeout_ms() -> u64 {
    120_000
}

fn default_idle_timeout_ms() -> u64 {
    30 * 60 * 1000 // 30 minutes
}

fn default_grace_period_ms() -> u64 {
    15_000
}

fn default_read_chunk_size() -> usize {
    8192
}

fn default_image() -> String {
    "corral-agent:latest".to_string()
}

fn default_name_prefix() -> String {
    "corral".to_string()
}
