// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::io::Write;

use rtcbridge_host::config::{self, LogFormat};

#[test]
fn missing_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");
    let path = path.to_str().unwrap();

    let loaded = config::load(path).unwrap();
    assert_eq!(loaded.file_missing.as_deref(), Some(path));
    assert!(!loaded.config.host.auto_subscribe);
    assert_eq!(loaded.config.host.max_line_bytes, 1024 * 1024);
    assert!(loaded.config.log.console_enable);
    assert!(!loaded.config.telemetry.enable);
}

#[test]
fn file_values_override_defaults() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(
        file,
        r#"
[host]
auto_subscribe = true

[log]
file_enable = true
file_format = "json"
file_path = "/tmp/rtcbridge-test.log"
"#
    )
    .unwrap();

    let loaded = config::load(file.path().to_str().unwrap()).unwrap();
    assert!(loaded.file_missing.is_none());
    assert!(loaded.config.host.auto_subscribe);
    // Unset keys keep their defaults.
    assert_eq!(loaded.config.host.max_line_bytes, 1024 * 1024);
    assert!(loaded.config.log.file_enable);
    assert!(matches!(loaded.config.log.file_format, LogFormat::Json));
}

#[test]
fn invalid_values_are_reported() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(file, "[host]\nmax_line_bytes = \"lots\"").unwrap();
    assert!(config::load(file.path().to_str().unwrap()).is_err());
}

#[test]
fn generated_default_parses_back() {
    let generated = config::generate_default().unwrap();
    let parsed: config::Config = toml::from_str(&generated).unwrap();
    assert_eq!(parsed.host.max_line_bytes, 1024 * 1024);
    assert_eq!(parsed.log.file_path, "./rtcbridge.log");
}
