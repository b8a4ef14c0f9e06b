// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Data channel commands.
//!
//! Channel ids are scoped to their session. A host-chosen id must lie in the
//! 16-bit wire range; channels the engine numbers itself get the engine's id
//! or, when that is unknown, a synthetic id above the wire range.

use rtcbridge_core::engine::{DataChannelInit, DataChannelMessage};
use rtcbridge_core::{vmap, BridgeError, EventSink, EventStream, ResourceKind, Result, Value};

use super::{bytes_arg, ok, session_arg};
use crate::context::BridgeContext;
use crate::entities::{data_channel_key, DataChannelEntry};

pub fn create(ctx: &BridgeContext, args: &Value) -> Result<Value> {
    let session = session_arg(args)?;
    let label = args.require_str("label")?;
    let init = channel_init(args)?;

    let mut inner = ctx.registry.lock();
    let entry = inner.sessions.get_mut(&session)?;
    if entry.closed {
        return Err(BridgeError::invalid_handle("session is closed", session.as_str()));
    }
    if let Some(id) = init.id {
        if entry.data_channels.contains(&u32::from(id)) {
            return Err(BridgeError::invalid_argument(format!(
                "data channel id {id} is already in use on session {session}"
            )));
        }
    }

    // Registered before the lock is released so the channel's first state
    // callback finds it.
    let channel = entry
        .connection
        .create_data_channel(label, &init)
        .map_err(|e| BridgeError::engine("createDataChannel", e))?;
    let id = match init.id {
        Some(id) => u32::from(id),
        None => entry.assign_data_channel_id(channel.id()),
    };
    let sink = EventSink::spawn(EventStream::DataChannel { session: session.clone(), id }.name());
    entry.data_channels.put(
        id,
        DataChannelEntry { id, label: label.to_string(), channel, sink },
    );
    drop(inner);

    tracing::info!(session_id = %session, id, label, "data channel created");
    Ok(vmap! { "id" => id, "label" => label })
}

fn channel_init(args: &Value) -> Result<DataChannelInit> {
    let Some(dict) = args.opt("dataChannelDict") else {
        return Ok(DataChannelInit::default());
    };
    let defaults = DataChannelInit::default();
    // Negative numbers mean "unset" on the wire.
    let id = match dict.opt_int("id")? {
        Some(id) if id >= 0 => Some(u16::try_from(id).map_err(|_| {
            BridgeError::invalid_argument(format!("data channel id {id} is out of range"))
        })?),
        _ => None,
    };
    Ok(DataChannelInit {
        id,
        ordered: dict.opt_bool("ordered")?.unwrap_or(defaults.ordered),
        max_retransmits: dict.opt_int("maxRetransmits")?.filter(|v| *v >= 0),
        max_retransmit_time: dict.opt_int("maxRetransmitTime")?.filter(|v| *v >= 0),
        protocol: dict.opt_str("protocol")?.unwrap_or_default().to_string(),
        negotiated: dict.opt_bool("negotiated")?.unwrap_or(defaults.negotiated),
    })
}

fn channel_id(args: &Value) -> Result<u32> {
    let id = args.require_int_compat("dataChannelId")?;
    u32::try_from(id).map_err(|_| {
        BridgeError::invalid_argument(format!("field 'dataChannelId' is out of range: {id}"))
    })
}

pub fn send(ctx: &BridgeContext, args: &Value) -> Result<Value> {
    let session = session_arg(args)?;
    let id = channel_id(args)?;
    let message = match args.require_str("type")? {
        "text" => DataChannelMessage::Text(args.require_str("data")?.to_string()),
        "binary" => DataChannelMessage::Binary(bytes_arg(args, "data")?),
        other => {
            return Err(BridgeError::invalid_argument(format!(
                "unknown message type '{other}', expected text or binary"
            )));
        },
    };

    let channel =
        ctx.registry.lock().sessions.get(&session)?.data_channels.get(&id)?.channel.clone();
    channel.send(message).map_err(|e| BridgeError::engine("dataChannelSend", e))?;
    Ok(ok())
}

/// Closes a channel and releases its event stream. Closing a channel that is
/// already gone is a no-op.
pub async fn close(ctx: &BridgeContext, args: &Value) -> Result<Value> {
    let session = session_arg(args)?;
    let id = channel_id(args)?;

    let (channel, observer) = {
        let inner = ctx.registry.lock();
        let entry = inner.sessions.get(&session)?;
        match entry.data_channels.get(&id) {
            Ok(channel) => (channel.channel.clone(), entry.observer.clone()),
            Err(_)
                if inner
                    .retired
                    .contains(ResourceKind::DataChannel, &data_channel_key(&session, id)) =>
            {
                tracing::debug!(session_id = %session, id, "data channel already closed");
                return Ok(ok());
            },
            Err(err) => return Err(err),
        }
    };

    channel.close();
    // The closing/closed callbacks go out on the channel's stream before the
    // stream is shut.
    observer.settle().await;

    let removed = {
        let mut inner = ctx.registry.lock();
        let removed = inner
            .sessions
            .get_mut(&session)
            .ok()
            .and_then(|entry| entry.data_channels.remove(&id).ok());
        if removed.is_some() {
            inner.retired.insert(ResourceKind::DataChannel, data_channel_key(&session, id));
        }
        removed
    };
    if let Some(entry) = removed {
        entry.sink.close();
        ctx.metrics.sink_closed(&entry.sink, "dataChannel");
        tracing::info!(session_id = %session, id, label = %entry.label, "data channel closed");
    }
    Ok(ok())
}
