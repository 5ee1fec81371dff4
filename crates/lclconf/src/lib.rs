//! Minimal configuration loading for lclstream.
//!
//! Imported by every crate in the workspace, so dependencies stay small.
//!
//! # Configuration Philosophy
//!
//! - **Infrastructure** (`BindConfig`, `TelemetryConfig`): fixed for the life
//!   of the process - bind address, telemetry endpoint, log level.
//!
//! - **Streaming** (`TransportConfig`, `PipelineConfig`, `WorkersConfig`,
//!   `ExecutionConfig`, `SourceConfig`): defaults copied into each transfer
//!   when it is created.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/lclstream/config.toml` (system)
//! 2. `~/.config/lclstream/config.toml` (user)
//! 3. `./lclstream.toml` or the `--config` path (local override)
//! 4. Environment variables (`LCLSTREAM_*`)
//!
//! # Example Config
//!
//! ```toml
//! [bind]
//! http_port = 8090
//!
//! [transport]
//! send_buffer = 32
//! recv_timeout_ms = 5000
//!
//! [pipeline]
//! batch_size = 20
//! codec = "container"
//!
//! [execution]
//! sequential = "subprocess"
//!
//! [workers]
//! launcher = ["ssh", "psana", "/sdf/home/run_psana_push", "1"]
//! ```

pub mod infra;
pub mod loader;
pub mod runtime;

pub use infra::{BindConfig, TelemetryConfig};
pub use loader::ConfigSources;
pub use runtime::{
    CodecKind, ExecutionConfig, ExecutionMode, PipelineConfig, SourceBackend, SourceConfig,
    TransportConfig, WorkersConfig,
};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Complete lclstream configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StreamConfig {
    #[serde(default)]
    pub bind: BindConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub workers: WorkersConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub source: SourceConfig,
}

impl StreamConfig {
    /// Load configuration from every source and report where values came from.
    ///
    /// If `config_path` is provided, it replaces the local `./lclstream.toml`
    /// override. System and user configs still load first, then env overrides.
    pub fn load_with_sources_from(
        config_path: Option<&std::path::Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut merged = toml::Table::new();

        for path in loader::discover_config_files_with_override(config_path) {
            let table = loader::read_table(&path)?;
            loader::merge_tables(&mut merged, table);
            sources.files.push(path);
        }

        let origin = sources
            .files
            .last()
            .cloned()
            .unwrap_or_else(|| PathBuf::from("<defaults>"));
        let mut config = loader::from_table(merged, &origin)?;

        loader::apply_env_overrides(&mut config, &mut sources, std::env::vars());
        config.validate()?;

        Ok((config, sources))
    }

    /// Reject values that would make every transfer fail.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.batch_size == 0 {
            return Err(ConfigError::Invalid("pipeline.batch_size must be >= 1".into()));
        }
        if self.workers.max_workers == 0 {
            return Err(ConfigError::Invalid("workers.max_workers must be >= 1".into()));
        }
        if self.transport.send_buffer < 0 || self.transport.recv_buffer < 0 {
            return Err(ConfigError::Invalid(
                "transport buffers must not be negative".into(),
            ));
        }
        if self.source.shape.is_empty() || self.source.shape.contains(&0) {
            return Err(ConfigError::Invalid(
                "source.shape must be non-empty with no zero dimensions".into(),
            ));
        }
        Ok(())
    }

    /// Serialize config to a TOML string.
    pub fn to_toml(&self) -> String {
        let body = toml::to_string_pretty(self).unwrap_or_else(|e| format!("# {}\n", e));
        format!("# lclstream configuration\n\n{}", body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_toml_str(contents: &str) -> Result<StreamConfig, ConfigError> {
        let path = PathBuf::from("<string>");
        let config = loader::from_table(loader::parse_table(contents, &path)?, &path)?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn test_default_config() {
        let config = StreamConfig::default();
        assert_eq!(config.bind.http_port, 8090);
        assert_eq!(config.pipeline.batch_size, 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_to_toml() {
        let toml = StreamConfig::default().to_toml();
        assert!(toml.contains("[bind]"));
        assert!(toml.contains("[transport]"));
        assert!(toml.contains("[pipeline]"));
        assert!(toml.contains("codec = \"container\""));
    }

    #[test]
    fn test_to_toml_reparses() {
        let config = StreamConfig::default();
        let reparsed = from_toml_str(&config.to_toml()).unwrap();
        assert_eq!(config, reparsed);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let err = from_toml_str("[pipeline]\nbatch_size = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_load_from_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "[pipeline]\nbatch_size = 7\n").unwrap();

        let (config, sources) = StreamConfig::load_with_sources_from(Some(&path)).unwrap();
        assert_eq!(config.pipeline.batch_size, 7);
        assert!(sources.files.contains(&path));
    }
}
