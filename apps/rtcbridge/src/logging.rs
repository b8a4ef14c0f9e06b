// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

use std::error::Error;
use std::path::Path;

use tracing::Level;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::{LogConfig, LogFormat, TelemetryConfig};
use crate::telemetry;

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// `RUST_LOG` wins over the configured level.
fn filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()))
}

fn fmt_layer<W>(writer: W, format: LogFormat, ansi: bool, level: Level) -> BoxedLayer
where
    W: for<'w> tracing_subscriber::fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(ansi);
    match format {
        LogFormat::Text => layer.with_filter(filter(level)).boxed(),
        LogFormat::Json => layer.json().with_filter(filter(level)).boxed(),
    }
}

fn open_log_file(path: &str) -> Result<(NonBlocking, WorkerGuard), Box<dyn Error>> {
    let path = Path::new(path);
    let dir = path.parent().filter(|dir| !dir.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let Some(file_name) = path.file_name() else {
        return Err(format!("log file path {} has no file name", path.display()).into());
    };
    std::fs::create_dir_all(dir)
        .map_err(|e| format!("failed to create log directory {}: {e}", dir.display()))?;
    Ok(tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name)))
}

/// Level for exported spans: the most verbose of the enabled outputs.
fn span_export_level(log: &LogConfig) -> Level {
    let enabled = [
        log.console_enable.then_some(log.console_level),
        log.file_enable.then_some(log.file_level),
    ];
    // More verbose levels compare greater.
    enabled.into_iter().flatten().map(Level::from).max().unwrap_or(Level::INFO)
}

/// Installs the global subscriber: stderr and file outputs per `log`, plus
/// an OTLP span layer when `telemetry` asks for one.
///
/// With both outputs disabled, falls back to stderr at info so failures
/// still surface somewhere.
///
/// # Errors
///
/// Returns an error if the log file cannot be opened or the span exporter
/// cannot be built.
pub fn init_logging(
    log: &LogConfig,
    telemetry_config: &TelemetryConfig,
) -> Result<Option<WorkerGuard>, Box<dyn Error>> {
    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut guard = None;

    if log.console_enable || !log.file_enable {
        let level = if log.console_enable { log.console_level.into() } else { Level::INFO };
        layers.push(fmt_layer(std::io::stderr, log.console_format, true, level));
    }
    if log.file_enable {
        let (writer, file_guard) = open_log_file(&log.file_path)?;
        layers.push(fmt_layer(writer, log.file_format, false, log.file_level.into()));
        guard = Some(file_guard);
    }

    let export_spans = telemetry_config.enable && telemetry_config.tracing_enable;
    let span_endpoint = telemetry_config.otlp_traces_endpoint.as_deref();
    if export_spans && span_endpoint.is_some() {
        let otel = telemetry::init_tracing_with_otlp(telemetry_config)?;
        layers.push(otel.with_filter(filter(span_export_level(log))).boxed());
    }

    tracing_subscriber::registry().with(layers).init();

    if !log.console_enable && !log.file_enable {
        tracing::warn!("all log outputs are disabled, logging to stderr");
    }
    match (export_spans, span_endpoint) {
        (true, Some(endpoint)) => tracing::info!(%endpoint, "exporting spans over OTLP"),
        (true, None) => tracing::warn!("tracing_enable is set without otlp_traces_endpoint"),
        (false, _) => {},
    }

    Ok(guard)
}
