//! Infrastructure configuration - things that cannot change at runtime.

use serde::{Deserialize, Serialize};

/// Network bind settings for the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindConfig {
    /// Interface the HTTP control plane binds to.
    /// Default: 127.0.0.1
    #[serde(default = "BindConfig::default_host")]
    pub host: String,

    /// HTTP port for the transfer API and health endpoint.
    /// Default: 8090
    #[serde(default = "BindConfig::default_http_port")]
    pub http_port: u16,
}

impl BindConfig {
    fn default_host() -> String {
        "127.0.0.1".to_string()
    }

    fn default_http_port() -> u16 {
        8090
    }

    /// `host:port` string suitable for a TCP listener.
    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.host, self.http_port)
    }
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            http_port: Self::default_http_port(),
        }
    }
}

/// Telemetry and observability configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// OTLP gRPC endpoint for OpenTelemetry. Empty disables OTLP export.
    /// Default: "" (disabled)
    #[serde(default)]
    pub otlp_endpoint: String,

    /// Log level or full `EnvFilter` directive.
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }

    pub fn otlp_enabled(&self) -> bool {
        !self.otlp_endpoint.trim().is_empty()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: String::new(),
            log_level: Self::default_log_level(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_addr() {
        let bind = BindConfig::default();
        assert_eq!(bind.http_addr(), "127.0.0.1:8090");
    }

    #[test]
    fn test_otlp_disabled_by_default() {
        assert!(!TelemetryConfig::default().otlp_enabled());
        let cfg = TelemetryConfig {
            otlp_endpoint: "127.0.0.1:4317".to_string(),
            ..Default::default()
        };
        assert!(cfg.otlp_enabled());
    }
}
