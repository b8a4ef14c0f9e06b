// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Host configuration.
//!
//! Layers, lowest precedence first: built-in defaults, the TOML file named on
//! the command line (optional), then `RTCBRIDGE_`-prefixed environment
//! variables with `__` between sections.

use std::collections::HashMap;
use std::path::Path;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const ENV_PREFIX: &str = "RTCBRIDGE_";

const fn default_max_line_bytes() -> usize {
    // Room for an SDP blob with many candidates.
    1024 * 1024
}

const fn default_metrics_interval_secs() -> u64 {
    5
}

fn default_log_path() -> String {
    "./rtcbridge.log".to_string()
}

/// Stdio transport settings.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
#[serde(default)]
pub struct HostConfig {
    /// Subscribe to every event stream a command creates (sessions, data
    /// channels, renderers, frame cryptors) and to remote data channels as
    /// they are announced. Without it, events stay buffered until the host
    /// sends `subscribe`.
    pub auto_subscribe: bool,
    /// Longest request line accepted, in bytes.
    pub max_line_bytes: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self { auto_subscribe: false, max_line_bytes: default_max_line_bytes() }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Log outputs. The console output is stderr: stdout carries the protocol.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
#[serde(default)]
pub struct LogConfig {
    pub console_enable: bool,
    pub console_level: LogLevel,
    pub console_format: LogFormat,
    pub file_enable: bool,
    pub file_level: LogLevel,
    pub file_format: LogFormat,
    pub file_path: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            console_enable: true,
            console_level: LogLevel::Info,
            console_format: LogFormat::Text,
            file_enable: false,
            file_level: LogLevel::Info,
            file_format: LogFormat::Text,
            file_path: default_log_path(),
        }
    }
}

/// OpenTelemetry export.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Install a meter provider for the bridge's session, command and event
    /// instruments.
    pub enable: bool,
    /// OTLP/HTTP metrics endpoint, e.g. `http://localhost:4318/v1/metrics`.
    /// Metrics are collected but not exported when unset.
    pub otlp_endpoint: Option<String>,
    pub metrics_interval_secs: u64,
    /// Export spans too. Needs `otlp_traces_endpoint`.
    pub tracing_enable: bool,
    pub otlp_traces_endpoint: Option<String>,
    /// Extra HTTP headers sent with every export request.
    pub otlp_headers: HashMap<String, String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enable: false,
            otlp_endpoint: None,
            metrics_interval_secs: default_metrics_interval_secs(),
            tracing_enable: false,
            otlp_traces_endpoint: None,
            otlp_headers: HashMap::new(),
        }
    }
}

#[derive(Deserialize, Serialize, Default, Debug, Clone, JsonSchema)]
#[serde(default)]
pub struct Config {
    pub host: HostConfig,
    pub log: LogConfig,
    pub telemetry: TelemetryConfig,
}

impl Config {
    fn validate(self) -> Result<Self, figment::Error> {
        if self.host.max_line_bytes == 0 {
            return Err(figment::Error::from("host.max_line_bytes must be positive".to_string()));
        }
        if self.telemetry.metrics_interval_secs == 0 {
            return Err(figment::Error::from(
                "telemetry.metrics_interval_secs must be positive".to_string(),
            ));
        }
        Ok(self)
    }
}

#[derive(Debug)]
pub struct ConfigLoadResult {
    pub config: Config,
    /// Set when the config file did not exist and only defaults and
    /// environment variables were applied.
    pub file_missing: Option<String>,
}

/// Loads the layered configuration, e.g. `RTCBRIDGE_HOST__AUTO_SUBSCRIBE=true`
/// overrides `host.auto_subscribe`.
///
/// # Errors
///
/// Returns an error if the file or an environment variable holds a value of
/// the wrong shape, or a setting is out of range.
pub fn load(config_path: &str) -> Result<ConfigLoadResult, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(Config::default()));

    let file_missing = if Path::new(config_path).exists() {
        figment = figment.merge(Toml::file(config_path));
        None
    } else {
        Some(config_path.to_string())
    };

    let config = figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract::<Config>()
        .and_then(Config::validate)
        .map_err(Box::new)?;

    Ok(ConfigLoadResult { config, file_missing })
}

/// The default configuration as TOML, for `rtcbridge config default`.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn generate_default() -> Result<String, toml::ser::Error> {
    toml::to_string_pretty(&Config::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_sized_lines_are_rejected() {
        let mut config = Config::default();
        config.host.max_line_bytes = 0;
        assert!(config.validate().is_err());
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn levels_map_onto_tracing() {
        assert_eq!(tracing::Level::from(LogLevel::Trace), tracing::Level::TRACE);
        assert_eq!(tracing::Level::from(LogLevel::default()), tracing::Level::INFO);
    }
}
