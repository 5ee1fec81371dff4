//! Streaming configuration - transport, pipeline, worker and source settings.
//!
//! These are defaults for every transfer the service starts. A transfer
//! captures a copy at creation time; later config reloads do not touch
//! transfers already running.

use serde::{Deserialize, Serialize};

/// Socket-level settings shared by push and pull channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Outbound high-water mark in messages. `send` blocks once this many
    /// messages are queued.
    /// Default: 32
    #[serde(default = "TransportConfig::default_send_buffer")]
    pub send_buffer: i32,

    /// Inbound high-water mark in messages.
    /// Default: 32
    #[serde(default = "TransportConfig::default_recv_buffer")]
    pub recv_buffer: i32,

    /// Pull-side receive timeout in milliseconds.
    /// Default: 5000
    #[serde(default = "TransportConfig::default_recv_timeout_ms")]
    pub recv_timeout_ms: u64,

    /// How long a closing push socket keeps flushing queued messages.
    /// Default: 5000
    #[serde(default = "TransportConfig::default_linger_ms")]
    pub linger_ms: i32,

    /// Number of connections a pipeline dials to its destination.
    /// 0 means the pipeline binds and waits for pullers instead.
    /// Default: 1
    #[serde(default = "TransportConfig::default_ndial")]
    pub ndial: u32,
}

impl TransportConfig {
    fn default_send_buffer() -> i32 {
        32
    }

    fn default_recv_buffer() -> i32 {
        32
    }

    fn default_recv_timeout_ms() -> u64 {
        5000
    }

    fn default_linger_ms() -> i32 {
        5000
    }

    fn default_ndial() -> u32 {
        1
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            send_buffer: Self::default_send_buffer(),
            recv_buffer: Self::default_recv_buffer(),
            recv_timeout_ms: Self::default_recv_timeout_ms(),
            linger_ms: Self::default_linger_ms(),
            ndial: Self::default_ndial(),
        }
    }
}

/// Message encoding used by a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CodecKind {
    /// Batches of frames in a MessagePack container with `data` and `pid`.
    #[default]
    Container,
    /// One zstd-compressed frame per message.
    Compressed,
}

impl CodecKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CodecKind::Container => "container",
            CodecKind::Compressed => "compressed",
        }
    }
}

impl std::str::FromStr for CodecKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "container" => Ok(CodecKind::Container),
            "compressed" => Ok(CodecKind::Compressed),
            other => Err(format!("unknown codec: {}", other)),
        }
    }
}

/// Batching and encoding settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Frames per container message.
    /// Default: 20
    #[serde(default = "PipelineConfig::default_batch_size")]
    pub batch_size: usize,

    /// Emit a short final batch instead of dropping leftover frames.
    /// Default: true
    #[serde(default = "PipelineConfig::default_emit_partial")]
    pub emit_partial: bool,

    #[serde(default)]
    pub codec: CodecKind,

    /// zstd level for the compressed codec.
    /// Default: 3
    #[serde(default = "PipelineConfig::default_compression_level")]
    pub compression_level: i32,

    /// Mantissa bits kept by the lossy float mode. 0 = lossless.
    /// Default: 0
    #[serde(default)]
    pub lossy_keep_bits: u8,

    /// Log throughput every N messages.
    /// Default: 10
    #[serde(default = "PipelineConfig::default_log_every")]
    pub log_every: u64,
}

impl PipelineConfig {
    fn default_batch_size() -> usize {
        20
    }

    fn default_emit_partial() -> bool {
        true
    }

    fn default_compression_level() -> i32 {
        3
    }

    fn default_log_every() -> u64 {
        10
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: Self::default_batch_size(),
            emit_partial: Self::default_emit_partial(),
            codec: CodecKind::default(),
            compression_level: Self::default_compression_level(),
            lossy_keep_bits: 0,
            log_every: Self::default_log_every(),
        }
    }
}

/// Worker pool and external worker process settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkersConfig {
    /// Concurrent encode jobs allowed off the async runtime.
    /// Default: 4
    #[serde(default = "WorkersConfig::default_max_workers")]
    pub max_workers: usize,

    /// Program run for subprocess transfers. Receives `push ...` arguments.
    /// Default: lclstream
    #[serde(default = "WorkersConfig::default_program")]
    pub program: String,

    /// Command prefix for sequential-stream subprocess transfers,
    /// e.g. `["ssh", "psana", "/path/run_psana_push", "1"]`.
    #[serde(default)]
    pub launcher: Vec<String>,
}

impl WorkersConfig {
    fn default_max_workers() -> usize {
        4
    }

    fn default_program() -> String {
        "lclstream".to_string()
    }
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            max_workers: Self::default_max_workers(),
            program: Self::default_program(),
            launcher: Vec::new(),
        }
    }
}

/// Where a transfer's pipeline runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    InProcess,
    Subprocess,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::InProcess => "in_process",
            ExecutionMode::Subprocess => "subprocess",
        }
    }
}

/// Execution mode per access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub indexed: ExecutionMode,
    #[serde(default)]
    pub sequential: ExecutionMode,
}

/// Frame source backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceBackend {
    /// Deterministic smooth-noise frames, no detector access required.
    #[default]
    Synthetic,
}

/// Frame source settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub backend: SourceBackend,

    /// Events per run produced by the synthetic backend.
    /// Default: 20
    #[serde(default = "SourceConfig::default_events")]
    pub events: usize,

    /// Frame shape produced by the synthetic backend.
    /// Default: [1024, 1024]
    #[serde(default = "SourceConfig::default_shape")]
    pub shape: Vec<usize>,

    /// Element type name (u8, u16, i16, u32, i32, f32, f64).
    /// Default: f32
    #[serde(default = "SourceConfig::default_dtype")]
    pub dtype: String,
}

impl SourceConfig {
    fn default_events() -> usize {
        20
    }

    fn default_shape() -> Vec<usize> {
        vec![1024, 1024]
    }

    fn default_dtype() -> String {
        "f32".to_string()
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            backend: SourceBackend::default(),
            events: Self::default_events(),
            shape: Self::default_shape(),
            dtype: Self::default_dtype(),
        }
    }
}
