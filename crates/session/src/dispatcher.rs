// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Command Dispatcher.
//!
//! Routes a named command to its handler, records the outcome, and orders the
//! reply behind the session events the command caused. A command that names a
//! live session (`peerConnectionId`) waits for that session's observer to
//! publish every callback queued so far, then sends its result through the
//! session sink's worker. The host therefore sees, for example, the
//! `signalingState` event of `setLocalDescription` before its result.
//!
//! Commands that also name a data channel (`dataChannelId`) flush that
//! channel's sink before replying, so the `closed` state change of
//! `dataChannelClose` is delivered before its result.

use std::sync::Arc;
use std::time::Instant;

use rtcbridge_core::{EventSink, Result, Value};

use crate::commands;
use crate::context::BridgeContext;
use crate::observer::ObserverHandle;

pub async fn dispatch(ctx: &Arc<BridgeContext>, command: &str, args: &Value) -> Result<Value> {
    let started = Instant::now();
    // Resolved up front: dataChannelClose drops the channel it names.
    let channel = channel_sink(ctx, args);
    let result = commands::execute(ctx, command, args).await;
    ctx.metrics.command(command, &result);

    match &result {
        Ok(_) => tracing::debug!(
            command,
            elapsed_us = started.elapsed().as_micros(),
            "command completed"
        ),
        Err(err) => tracing::warn!(
            command,
            kind = %err.kind(),
            handle = err.handle(),
            error = %err,
            "command failed"
        ),
    }

    let route = reply_route(ctx, args);
    if let Some((observer, _)) = &route {
        observer.settle().await;
    }
    if let Some(channel) = channel {
        channel.flush().await;
    }
    match route {
        Some((_, sink)) => sink.reply(result).await,
        None => result,
    }
}

/// The observer and sink of the live session named in `args`, if any.
pub(crate) fn reply_route(
    ctx: &BridgeContext,
    args: &Value,
) -> Option<(ObserverHandle, EventSink)> {
    let session = args.opt_str("peerConnectionId").ok().flatten()?;
    let inner = ctx.registry.lock();
    let entry = inner.sessions.get(session).ok()?;
    Some((entry.observer.clone(), entry.sink.clone()))
}

/// The sink of the data channel named by `peerConnectionId` and
/// `dataChannelId` in `args`, if both resolve.
pub(crate) fn channel_sink(ctx: &BridgeContext, args: &Value) -> Option<EventSink> {
    let session = args.opt_str("peerConnectionId").ok().flatten()?;
    let id = args.opt("dataChannelId")?.as_int_compat().ok()?;
    let id = u32::try_from(id).ok()?;
    let inner = ctx.registry.lock();
    let channel = inner.sessions.get(session).ok()?.data_channels.get(&id).ok()?;
    Some(channel.sink.clone())
}
