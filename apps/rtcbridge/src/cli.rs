// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

use anyhow::{anyhow, Context};
use clap::{Args, Parser, Subcommand};
use rtcbridge_session::loopback::LoopbackEngine;
use rtcbridge_session::Bridge;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;

use crate::config::{self, Config, LogConfig, TelemetryConfig};

pub type LogInitFn = fn(
    &LogConfig,
    &TelemetryConfig,
) -> Result<
    Option<tracing_appender::non_blocking::WorkerGuard>,
    Box<dyn std::error::Error>,
>;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "rtcbridge.toml")]
    pub config: String,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve JSON-lines requests on stdin, writing replies and events to stdout (default)
    Serve(ServeArgs),
    /// Manage configuration
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Subscribe to every created event stream, overriding `host.auto_subscribe`
    #[arg(long)]
    pub auto_subscribe: bool,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print the default configuration as TOML
    Default,
    /// Print the JSON schema of the configuration
    Schema,
}

fn log_startup(config: &Config) {
    tracing::info!(
        auto_subscribe = config.host.auto_subscribe,
        max_line_bytes = config.host.max_line_bytes,
        console_level = ?config.log.console_level,
        file_enable = config.log.file_enable,
        telemetry = config.telemetry.enable,
        "starting rtcbridge host"
    );
}

/// Cancels the returned token on Ctrl-C.
fn interrupt_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, shutting down");
            on_interrupt.cancel();
        }
    });
    cancel
}

async fn serve(
    config_path: &str,
    args: &ServeArgs,
    init_logging: LogInitFn,
) -> anyhow::Result<()> {
    let loaded = config::load(config_path).context("failed to load configuration")?;
    let mut config = loaded.config;
    config.host.auto_subscribe |= args.auto_subscribe;

    let _log_guard = init_logging(&config.log, &config.telemetry)
        .map_err(|e| anyhow!("failed to initialize logging: {e}"))?;
    if let Some(path) = &loaded.file_missing {
        tracing::warn!(config_path = %path, "config file not found, using defaults");
    }

    // Kept alive until the host stops so the last export still happens.
    let _meter_provider = if config.telemetry.enable {
        crate::telemetry::init_metrics(&config.telemetry)
            .inspect_err(|e| tracing::warn!(error = %e, "metrics disabled"))
            .ok()
    } else {
        None
    };

    log_startup(&config);
    let bridge = Bridge::new(LoopbackEngine::new());
    let input = BufReader::new(tokio::io::stdin());
    crate::host::run(bridge, &config.host, input, tokio::io::stdout(), interrupt_token())
        .await
        .inspect_err(|e| tracing::error!(error = %e, "host stopped"))
}

// CLI output goes to stdout on purpose.
#[allow(clippy::disallowed_macros)]
fn print_default_config() -> anyhow::Result<()> {
    let toml = config::generate_default().context("failed to render default config")?;
    println!("# Default rtcbridge configuration\n{toml}");
    Ok(())
}

#[allow(clippy::disallowed_macros)]
fn print_config_schema() -> anyhow::Result<()> {
    let schema = schemars::schema_for!(Config);
    println!("{}", serde_json::to_string_pretty(&schema).context("failed to render schema")?);
    Ok(())
}

/// Runs the selected command; exits with status 1 on failure.
// Errors before logging is up can only go to stderr.
#[allow(clippy::disallowed_macros)]
pub async fn handle_command(cli: &Cli, init_logging: LogInitFn) {
    let outcome = match &cli.command {
        None => serve(&cli.config, &ServeArgs::default(), init_logging).await,
        Some(Commands::Serve(args)) => serve(&cli.config, args, init_logging).await,
        Some(Commands::Config(ConfigCommands::Default)) => print_default_config(),
        Some(Commands::Config(ConfigCommands::Schema)) => print_config_schema(),
    };
    if let Err(e) = outcome {
        eprintln!("rtcbridge: {e:#}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_is_the_default_command() {
        let cli = Cli::parse_from(["rtcbridge"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.config, "rtcbridge.toml");

        let cli = Cli::parse_from(["rtcbridge", "-c", "other.toml", "serve", "--auto-subscribe"]);
        assert_eq!(cli.config, "other.toml");
        assert!(matches!(cli.command, Some(Commands::Serve(ServeArgs { auto_subscribe: true }))));
    }

    #[test]
    fn config_subcommands_parse() {
        let cli = Cli::parse_from(["rtcbridge", "config", "schema"]);
        assert!(matches!(cli.command, Some(Commands::Config(ConfigCommands::Schema))));
    }
}
