// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Sender, receiver and transceiver commands.
//!
//! Senders, receivers and transceivers are engine objects addressed by the
//! ids the engine gives them; the registry only remembers which local track
//! each sender carries, so that disposing a track that is still on the wire
//! can be refused. A transceiver is addressed by the id of its sender.

use std::sync::Arc;

use rtcbridge_core::engine::{
    EngineConnection, EngineReceiver, EngineSender, EngineTrack, EngineTransceiver, RtpEncoding,
    RtpParameters, TransceiverInit, TransceiverSource,
};
use rtcbridge_core::state::{MediaKind, TransceiverDirection};
use rtcbridge_core::{vmap, BridgeError, Handle, ResourceKind, Result, TrackInfo, Value};

use super::{local_track_info, ok, session_arg};
use crate::context::BridgeContext;
use crate::entities::TrackRef;
use crate::registry::RegistryInner;

pub fn add_track(ctx: &BridgeContext, args: &Value) -> Result<Value> {
    let session = session_arg(args)?;
    let track_id = args.require_str("trackId")?;
    let stream_ids = args.opt_str_list("streamIds")?;

    let mut inner = ctx.registry.lock();
    let connection = inner.sessions.get(&session)?.connection.clone();
    let track = inner.find_track(track_id)?;
    let sender = connection
        .add_track(track.engine_track().clone(), &stream_ids)
        .map_err(|e| BridgeError::engine("addTrack", e))?;
    record_sender(&mut inner, &session, sender.id(), &track)?;
    tracing::debug!(session_id = %session, track = track_id, sender = %sender.id(), "track added");
    Ok(sender_to_value(&inner, &session, sender.as_ref()))
}

pub fn remove_track(ctx: &BridgeContext, args: &Value) -> Result<Value> {
    let session = session_arg(args)?;
    let sender_id = args.require_str("senderId")?;

    let mut inner = ctx.registry.lock();
    let connection = inner.sessions.get(&session)?.connection.clone();
    let sender = find_sender(connection.as_ref(), sender_id)?;
    connection.remove_track(&sender).map_err(|e| BridgeError::engine("removeTrack", e))?;
    inner.sessions.get_mut(&session)?.sender_tracks.shift_remove(sender_id);
    Ok(ok())
}

pub fn add_transceiver(ctx: &BridgeContext, args: &Value) -> Result<Value> {
    let session = session_arg(args)?;
    let init = transceiver_init(args)?;

    let mut inner = ctx.registry.lock();
    let connection = inner.sessions.get(&session)?.connection.clone();
    let track = args.opt_str("trackId")?.map(|id| inner.find_track(id)).transpose()?;
    let source = match &track {
        Some(track) => TransceiverSource::Track(track.engine_track().clone()),
        None => {
            let media_type = args.require_str("mediaType")?;
            let kind = MediaKind::parse(media_type).ok_or_else(|| {
                BridgeError::invalid_argument(format!("unknown media type '{media_type}'"))
            })?;
            TransceiverSource::Kind(kind)
        },
    };
    let transceiver = connection
        .add_transceiver(source, &init)
        .map_err(|e| BridgeError::engine("addTransceiver", e))?;
    if let Some(track) = &track {
        record_sender(&mut inner, &session, transceiver.sender().id(), track)?;
    }
    Ok(transceiver_to_value(&inner, &session, transceiver.as_ref()))
}

pub fn senders(ctx: &BridgeContext, args: &Value) -> Result<Value> {
    let session = session_arg(args)?;
    let inner = ctx.registry.lock();
    let connection = inner.sessions.get(&session)?.connection.clone();
    let senders: Value = connection
        .senders()
        .iter()
        .map(|s| sender_to_value(&inner, &session, s.as_ref()))
        .collect();
    Ok(vmap! { "senders" => senders })
}

pub fn receivers(ctx: &BridgeContext, args: &Value) -> Result<Value> {
    let session = session_arg(args)?;
    let inner = ctx.registry.lock();
    let connection = inner.sessions.get(&session)?.connection.clone();
    let receivers: Value = connection
        .receivers()
        .iter()
        .map(|r| receiver_to_value(&inner, &session, r.as_ref()))
        .collect();
    Ok(vmap! { "receivers" => receivers })
}

pub fn transceivers(ctx: &BridgeContext, args: &Value) -> Result<Value> {
    let session = session_arg(args)?;
    let inner = ctx.registry.lock();
    let connection = inner.sessions.get(&session)?.connection.clone();
    let transceivers: Value = connection
        .transceivers()
        .iter()
        .map(|t| transceiver_to_value(&inner, &session, t.as_ref()))
        .collect();
    Ok(vmap! { "transceivers" => transceivers })
}

/// Swaps the track a sender carries. A missing `trackId` leaves the sender
/// without a track.
pub fn set_sender_track(ctx: &BridgeContext, args: &Value) -> Result<Value> {
    let session = session_arg(args)?;
    let sender_id = args.require_str("rtpSenderId")?;

    let mut inner = ctx.registry.lock();
    let connection = inner.sessions.get(&session)?.connection.clone();
    let sender = find_sender(connection.as_ref(), sender_id)?;
    let track = args.opt_str("trackId")?.map(|id| inner.find_track(id)).transpose()?;
    sender
        .set_track(track.as_ref().map(|t| t.engine_track().clone()))
        .map_err(|e| BridgeError::engine("rtpSenderSetTrack", e))?;
    match &track {
        Some(track) => record_sender(&mut inner, &session, sender.id(), track)?,
        None => {
            inner.sessions.get_mut(&session)?.sender_tracks.shift_remove(sender_id);
        },
    }
    Ok(ok())
}

/// Releases the bridge's hold on a sender. The engine keeps the sender as
/// long as its connection does; only the record of the track it carries goes,
/// so that track can be disposed.
pub fn dispose_sender(ctx: &BridgeContext, args: &Value) -> Result<Value> {
    let session = session_arg(args)?;
    let sender_id = args.require_str("rtpSenderId")?;

    let mut inner = ctx.registry.lock();
    let connection = inner.sessions.get(&session)?.connection.clone();
    find_sender(connection.as_ref(), sender_id)?;
    let track = inner.sessions.get_mut(&session)?.sender_tracks.shift_remove(sender_id);
    tracing::debug!(session_id = %session, sender = sender_id, ?track, "sender released");
    Ok(ok())
}

/// Applies `parameters.encodings` to the sender's current encodings in
/// order. Fields left out keep their value; extra entries are ignored.
pub fn set_sender_parameters(ctx: &BridgeContext, args: &Value) -> Result<Value> {
    let session = session_arg(args)?;
    let sender_id = args.require_str("rtpSenderId")?;
    let update = args.require("parameters")?;

    let connection = ctx.registry.lock().sessions.get(&session)?.connection.clone();
    let sender = find_sender(connection.as_ref(), sender_id)?;
    let parameters = updated_parameters(sender.parameters(), update)?;
    sender
        .set_parameters(parameters)
        .map_err(|e| BridgeError::engine("rtpSenderSetParameters", e))?;
    Ok(ok())
}

fn updated_parameters(mut parameters: RtpParameters, update: &Value) -> Result<RtpParameters> {
    let encodings = match update.opt("encodings") {
        Some(list) => list.as_list().map_err(|e| e.for_field("encodings"))?,
        None => return Ok(parameters),
    };
    for (encoding, changes) in parameters.encodings.iter_mut().zip(encodings) {
        if let Some(active) = changes.opt_bool("active")? {
            encoding.active = active;
        }
        update_int(&mut encoding.max_bitrate_bps, changes, "maxBitrate")?;
        update_int(&mut encoding.min_bitrate_bps, changes, "minBitrate")?;
        update_int(&mut encoding.max_framerate, changes, "maxFramerate")?;
        update_int(&mut encoding.num_temporal_layers, changes, "numTemporalLayers")?;
        if let Some(scale) = changes.opt("scaleResolutionDownBy") {
            let scale = scale.as_float().map_err(|e| e.for_field("scaleResolutionDownBy"))?;
            encoding.scale_resolution_down_by = Some(scale);
        }
    }
    Ok(parameters)
}

fn update_int(slot: &mut Option<i64>, changes: &Value, field: &str) -> Result<()> {
    if changes.opt(field).is_some() {
        *slot = Some(changes.require_int(field)?);
    }
    Ok(())
}

pub fn set_direction(ctx: &BridgeContext, args: &Value) -> Result<Value> {
    let session = session_arg(args)?;
    let transceiver_id = args.require_str("transceiverId")?;
    let direction = args.require_str("direction")?;
    let direction = TransceiverDirection::parse(direction).ok_or_else(|| {
        BridgeError::invalid_argument(format!("unknown transceiver direction '{direction}'"))
    })?;

    let connection = ctx.registry.lock().sessions.get(&session)?.connection.clone();
    let transceiver = find_transceiver(connection.as_ref(), transceiver_id)?;
    transceiver
        .set_direction(direction)
        .map_err(|e| BridgeError::engine("rtpTransceiverSetDirection", e))?;
    Ok(ok())
}

pub fn stop_transceiver(ctx: &BridgeContext, args: &Value) -> Result<Value> {
    let session = session_arg(args)?;
    let transceiver_id = args.require_str("transceiverId")?;

    let mut inner = ctx.registry.lock();
    let connection = inner.sessions.get(&session)?.connection.clone();
    let transceiver = find_transceiver(connection.as_ref(), transceiver_id)?;
    transceiver.stop().map_err(|e| BridgeError::engine("rtpTransceiverStop", e))?;
    inner.sessions.get_mut(&session)?.sender_tracks.shift_remove(&transceiver.sender().id());
    Ok(ok())
}

pub fn find_sender(connection: &dyn EngineConnection, id: &str) -> Result<Arc<dyn EngineSender>> {
    connection
        .senders()
        .into_iter()
        .find(|s| s.id() == id)
        .ok_or_else(|| BridgeError::not_found(ResourceKind::RtpSender, id))
}

pub fn find_receiver(
    connection: &dyn EngineConnection,
    id: &str,
) -> Result<Arc<dyn EngineReceiver>> {
    connection
        .receivers()
        .into_iter()
        .find(|r| r.id() == id)
        .ok_or_else(|| BridgeError::not_found(ResourceKind::RtpReceiver, id))
}

fn find_transceiver(
    connection: &dyn EngineConnection,
    id: &str,
) -> Result<Arc<dyn EngineTransceiver>> {
    connection
        .transceivers()
        .into_iter()
        .find(|t| t.sender().id() == id)
        .ok_or_else(|| BridgeError::not_found(ResourceKind::Transceiver, id))
}

/// Remembers that `sender` carries `track` when the track is local.
fn record_sender(
    inner: &mut RegistryInner,
    session: &Handle,
    sender: String,
    track: &TrackRef,
) -> Result<()> {
    let senders = &mut inner.sessions.get_mut(session)?.sender_tracks;
    match track {
        TrackRef::Local(entry) => {
            senders.insert(sender, entry.handle.clone());
        },
        TrackRef::Remote { .. } => {
            senders.shift_remove(&sender);
        },
    }
    Ok(())
}

fn transceiver_init(args: &Value) -> Result<TransceiverInit> {
    let Some(init) = args.opt("transceiverInit") else {
        return Ok(TransceiverInit::default());
    };
    let direction = match init.opt_str("direction")? {
        Some(direction) => TransceiverDirection::parse(direction).ok_or_else(|| {
            BridgeError::invalid_argument(format!("unknown transceiver direction '{direction}'"))
        })?,
        None => TransceiverDirection::SendRecv,
    };
    Ok(TransceiverInit { direction, stream_ids: init.opt_str_list("streamIds")? })
}

/// Describes an engine track using its registry handle.
fn track_to_value(inner: &RegistryInner, session: &Handle, track: &dyn EngineTrack) -> Value {
    let engine_id = track.id();
    if let Ok(entry) = inner.local_tracks.get(engine_id.as_str()) {
        return local_track_info(&entry.handle, track).to_value();
    }
    inner
        .sessions
        .get(session)
        .ok()
        .and_then(|s| s.remote_tracks.values().find(|t| t.track.id() == engine_id))
        .map_or_else(
            || TrackInfo::from_engine(track, true).to_value(),
            |entry| TrackInfo::describe(entry.handle.to_string(), track, true).to_value(),
        )
}

fn encoding_to_value(encoding: &RtpEncoding) -> Value {
    vmap! {
        "rid" => encoding.rid.clone(),
        "active" => encoding.active,
        "maxBitrate" => encoding.max_bitrate_bps,
        "minBitrate" => encoding.min_bitrate_bps,
        "maxFramerate" => encoding.max_framerate,
        "numTemporalLayers" => encoding.num_temporal_layers,
        "scaleResolutionDownBy" => encoding.scale_resolution_down_by,
    }
}

fn sender_to_value(inner: &RegistryInner, session: &Handle, sender: &dyn EngineSender) -> Value {
    let encodings: Value = sender.parameters().encodings.iter().map(encoding_to_value).collect();
    vmap! {
        "senderId" => sender.id(),
        "track" => sender
            .track()
            .map_or(Value::Null, |track| track_to_value(inner, session, track.as_ref())),
        "parameters" => vmap! { "encodings" => encodings },
    }
}

fn receiver_to_value(
    inner: &RegistryInner,
    session: &Handle,
    receiver: &dyn EngineReceiver,
) -> Value {
    vmap! {
        "receiverId" => receiver.id(),
        "track" => track_to_value(inner, session, receiver.track().as_ref()),
    }
}

fn transceiver_to_value(
    inner: &RegistryInner,
    session: &Handle,
    transceiver: &dyn EngineTransceiver,
) -> Value {
    let sender = transceiver.sender();
    vmap! {
        "transceiverId" => sender.id(),
        "mid" => transceiver.mid(),
        "direction" => transceiver.direction().as_str(),
        "sender" => sender_to_value(inner, session, sender.as_ref()),
        "receiver" => receiver_to_value(inner, session, transceiver.receiver().as_ref()),
    }
}
