// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Host process for the rtcbridge command bridge.
//!
//! Speaks newline-delimited JSON on stdio: requests carry a bridge command or
//! a host control, replies carry the command result, and subscribed event
//! streams are forwarded as event lines. The media engine is the in-memory
//! loopback engine.

pub mod cli;
pub mod config;
pub mod host;
pub mod lines;
pub mod logging;
pub mod telemetry;

pub use config::Config;
