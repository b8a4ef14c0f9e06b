// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

use clap::Parser;
use rtcbridge_host::{cli, logging};

#[tokio::main]
async fn main() {
    let cli = cli::Cli::parse();
    cli::handle_command(&cli, logging::init_logging).await;
}
