//! Config file discovery, loading, and environment variable overlay.

use crate::{ConfigError, StreamConfig};
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local), only those that
/// exist. If `cli_path` is provided and exists, it replaces the local file.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/lclstream/config.toml");
    if system.exists() {
        files.push(system);
    }

    // XDG_CONFIG_HOME or ~/.config
    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("lclstream/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("lclstream.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

pub(crate) fn read_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;
    parse_table(&contents, path)
}

pub(crate) fn parse_table(contents: &str, path: &Path) -> Result<toml::Table, ConfigError> {
    contents
        .parse()
        .map_err(|e: toml::de::Error| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Deserialize a merged table. Missing sections and keys take their defaults.
pub(crate) fn from_table(table: toml::Table, path: &Path) -> Result<StreamConfig, ConfigError> {
    toml::Value::Table(table)
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Merge `overlay` into `base`. Nested tables merge key by key; any other
/// value in the overlay replaces the base value outright.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(base_t)), toml::Value::Table(over_t)) => {
                merge_tables(base_t, over_t);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Apply environment variable overrides to config.
///
/// Takes the variables as an iterator so tests never touch the process env.
pub fn apply_env_overrides<I>(config: &mut StreamConfig, sources: &mut ConfigSources, vars: I)
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut record = |name: &str| sources.env_overrides.push(name.to_string());

    // Ordered so the more general variable is applied last, matching the
    // precedence of OTEL_* and RUST_LOG over our own names.
    let mut vars: Vec<(String, String)> = vars
        .into_iter()
        .filter(|(k, _)| k.starts_with("LCLSTREAM_") || k == "OTEL_EXPORTER_OTLP_ENDPOINT" || k == "RUST_LOG")
        .collect();
    vars.sort_by_key(|(k, _)| !k.starts_with("LCLSTREAM_"));

    for (key, value) in vars {
        match key.as_str() {
            "LCLSTREAM_HOST" => {
                config.bind.host = value;
                record(&key);
            }
            "LCLSTREAM_HTTP_PORT" => {
                if let Ok(port) = value.parse() {
                    config.bind.http_port = port;
                    record(&key);
                }
            }
            "LCLSTREAM_OTLP_ENDPOINT" | "OTEL_EXPORTER_OTLP_ENDPOINT" => {
                config.telemetry.otlp_endpoint = value;
                record(&key);
            }
            "LCLSTREAM_LOG_LEVEL" | "RUST_LOG" => {
                config.telemetry.log_level = value;
                record(&key);
            }
            "LCLSTREAM_BATCH_SIZE" => {
                if let Ok(n) = value.parse() {
                    config.pipeline.batch_size = n;
                    record(&key);
                }
            }
            "LCLSTREAM_CODEC" => {
                if let Ok(codec) = value.parse() {
                    config.pipeline.codec = codec;
                    record(&key);
                }
            }
            "LCLSTREAM_SEND_BUFFER" => {
                if let Ok(n) = value.parse() {
                    config.transport.send_buffer = n;
                    record(&key);
                }
            }
            "LCLSTREAM_RECV_TIMEOUT_MS" => {
                if let Ok(ms) = value.parse() {
                    config.transport.recv_timeout_ms = ms;
                    record(&key);
                }
            }
            "LCLSTREAM_MAX_WORKERS" => {
                if let Ok(n) = value.parse() {
                    config.workers.max_workers = n;
                    record(&key);
                }
            }
            "LCLSTREAM_WORKER_PROGRAM" => {
                config.workers.program = value;
                record(&key);
            }
            _ => {}
        }
    }
}
