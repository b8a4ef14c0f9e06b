// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Session commands: open/close/dispose, negotiation pass-throughs, stats and
//! the legacy stream API.

use std::sync::Arc;

use rtcbridge_core::engine::{IceCandidate, SessionDescription, StatsReport};
use rtcbridge_core::{vmap, BridgeError, Result, Value};

use super::{connection, ok, session_arg};
use crate::context::BridgeContext;
use crate::lifecycle;

pub fn create(ctx: &Arc<BridgeContext>, args: &Value) -> Result<Value> {
    let configuration = args.opt("configuration").cloned().unwrap_or_else(Value::map);
    let constraints = args.opt("constraints").cloned().unwrap_or_else(Value::map);
    let handle = lifecycle::open_session(ctx, &configuration, &constraints)?;
    Ok(vmap! { "peerConnectionId" => handle })
}

pub async fn close(ctx: &BridgeContext, args: &Value) -> Result<Value> {
    let session = session_arg(args)?;
    lifecycle::close_session(ctx, &session).await?;
    Ok(ok())
}

pub async fn dispose(ctx: &BridgeContext, args: &Value) -> Result<Value> {
    let session = session_arg(args)?;
    lifecycle::dispose_session(ctx, &session).await?;
    Ok(ok())
}

/// The advisory connection phase last reported by the engine.
pub fn state(ctx: &BridgeContext, args: &Value) -> Result<Value> {
    let session = session_arg(args)?;
    let inner = ctx.registry.lock();
    let entry = inner.sessions.get(&session)?;
    Ok(vmap! { "state" => entry.phase.as_str(), "closed" => entry.closed })
}

pub async fn create_offer(ctx: &BridgeContext, args: &Value) -> Result<Value> {
    let (_, connection) = connection(ctx, args)?;
    let constraints = args.opt("constraints").cloned().unwrap_or_else(Value::map);
    let description = connection
        .create_offer(&constraints)
        .await
        .map_err(|e| BridgeError::engine("createOffer", e))?;
    Ok(description_to_value(&description))
}

pub async fn create_answer(ctx: &BridgeContext, args: &Value) -> Result<Value> {
    let (_, connection) = connection(ctx, args)?;
    let constraints = args.opt("constraints").cloned().unwrap_or_else(Value::map);
    let description = connection
        .create_answer(&constraints)
        .await
        .map_err(|e| BridgeError::engine("createAnswer", e))?;
    Ok(description_to_value(&description))
}

pub async fn set_local_description(ctx: &BridgeContext, args: &Value) -> Result<Value> {
    let (_, connection) = connection(ctx, args)?;
    let description = description_arg(args)?;
    connection
        .set_local_description(description)
        .await
        .map_err(|e| BridgeError::engine("setLocalDescription", e))?;
    Ok(ok())
}

pub async fn set_remote_description(ctx: &BridgeContext, args: &Value) -> Result<Value> {
    let (_, connection) = connection(ctx, args)?;
    let description = description_arg(args)?;
    connection
        .set_remote_description(description)
        .await
        .map_err(|e| BridgeError::engine("setRemoteDescription", e))?;
    Ok(ok())
}

pub fn local_description(ctx: &BridgeContext, args: &Value) -> Result<Value> {
    let (_, connection) = connection(ctx, args)?;
    Ok(connection.local_description().as_ref().map_or(Value::Null, description_to_value))
}

pub fn remote_description(ctx: &BridgeContext, args: &Value) -> Result<Value> {
    let (_, connection) = connection(ctx, args)?;
    Ok(connection.remote_description().as_ref().map_or(Value::Null, description_to_value))
}

pub async fn add_candidate(ctx: &BridgeContext, args: &Value) -> Result<Value> {
    let (_, connection) = connection(ctx, args)?;
    let candidate = args.require("candidate")?;
    let candidate = IceCandidate {
        candidate: candidate.require_str("candidate")?.to_string(),
        sdp_mid: candidate.opt_str("sdpMid")?.map(str::to_string),
        sdp_mline_index: candidate
            .opt("sdpMLineIndex")
            .map(Value::as_int_compat)
            .transpose()
            .map_err(|e| e.for_field("sdpMLineIndex"))?,
    };
    connection
        .add_ice_candidate(candidate)
        .await
        .map_err(|e| BridgeError::engine("addCandidate", e))?;
    Ok(ok())
}

pub fn restart_ice(ctx: &BridgeContext, args: &Value) -> Result<Value> {
    let (_, connection) = connection(ctx, args)?;
    connection.restart_ice();
    Ok(ok())
}

pub fn set_configuration(ctx: &BridgeContext, args: &Value) -> Result<Value> {
    let (_, connection) = connection(ctx, args)?;
    let configuration = args.require("configuration")?;
    connection
        .set_configuration(configuration)
        .map_err(|e| BridgeError::engine("setConfiguration", e))?;
    Ok(ok())
}

/// Stats for the whole connection, or for one track when `trackId` is given.
pub async fn stats(ctx: &BridgeContext, args: &Value) -> Result<Value> {
    let (_, connection) = connection(ctx, args)?;
    let track = match args.opt_str("trackId")? {
        Some(id) => Some(ctx.registry.lock().find_track(id)?.engine_track().clone()),
        None => None,
    };
    let reports =
        connection.get_stats(track).await.map_err(|e| BridgeError::engine("getStats", e))?;
    Ok(vmap! { "stats" => reports.iter().map(report_to_value).collect::<Value>() })
}

/// Adds a local stream to the session (legacy API). A stream may be attached
/// to one session at a time.
pub fn add_stream(ctx: &BridgeContext, args: &Value) -> Result<Value> {
    let session = session_arg(args)?;
    let stream_id = args.require_str("streamId")?;
    let mut inner = ctx.registry.lock();
    let connection = inner.sessions.get(&session)?.connection.clone();
    let entry = inner.local_streams.get_mut(stream_id)?;
    match &entry.attached_to {
        Some(current) if current == &session => return Ok(ok()),
        Some(current) => {
            return Err(BridgeError::invalid_handle(
                format!("stream {stream_id} is already attached to session {current}"),
                stream_id,
            ));
        },
        None => {},
    }
    connection.add_stream(entry.stream.clone()).map_err(|e| BridgeError::engine("addStream", e))?;
    entry.attached_to = Some(session.clone());
    tracing::debug!(session_id = %session, stream = stream_id, "local stream attached");
    Ok(ok())
}

pub fn remove_stream(ctx: &BridgeContext, args: &Value) -> Result<Value> {
    let session = session_arg(args)?;
    let stream_id = args.require_str("streamId")?;
    let mut inner = ctx.registry.lock();
    let connection = inner.sessions.get(&session)?.connection.clone();
    let entry = inner.local_streams.get_mut(stream_id)?;
    if entry.attached_to.as_ref() != Some(&session) {
        return Err(BridgeError::invalid_handle(
            format!("stream {stream_id} is not attached to session {session}"),
            stream_id,
        ));
    }
    connection
        .remove_stream(&entry.stream)
        .map_err(|e| BridgeError::engine("removeStream", e))?;
    entry.attached_to = None;
    Ok(ok())
}

fn description_arg(args: &Value) -> Result<SessionDescription> {
    let description = args.require("description")?;
    Ok(SessionDescription {
        sdp: description.require_str("sdp")?.to_string(),
        sdp_type: description.require_str("type")?.to_string(),
    })
}

fn description_to_value(description: &SessionDescription) -> Value {
    vmap! { "sdp" => description.sdp.as_str(), "type" => description.sdp_type.as_str() }
}

fn report_to_value(report: &StatsReport) -> Value {
    vmap! {
        "id" => report.id.as_str(),
        "type" => report.report_type.as_str(),
        "timestamp" => report.timestamp_us,
        "values" => report.values.clone(),
    }
}
