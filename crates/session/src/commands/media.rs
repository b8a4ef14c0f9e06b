// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Local media commands: capture, local streams and per-track controls.

use std::sync::Arc;

use rtcbridge_core::engine::{CaptureSource, EngineStream, LocalMedia, TrackRequest};
use rtcbridge_core::state::MediaKind;
use rtcbridge_core::{vmap, BridgeError, Handle, ResourceKind, Result, TrackInfo, Value};

use super::{local_track_info, ok};
use crate::context::BridgeContext;
use crate::entities::{LocalStreamEntry, LocalTrackEntry, StreamRef, TrackRef};
use crate::lifecycle;
use crate::registry::RegistryInner;

/// One track to open: its kind, its source and the constraints for it.
type CaptureRequest = (MediaKind, CaptureSource, Value);

/// Opens the requested microphone and camera in a new local stream.
pub async fn get_user_media(ctx: &BridgeContext, args: &Value) -> Result<Value> {
    let constraints = args.opt("constraints").cloned().unwrap_or_else(Value::map);
    let mut requests = Vec::with_capacity(2);
    for kind in [MediaKind::Audio, MediaKind::Video] {
        if let Some(track_constraints) = requested(&constraints, kind)? {
            requests.push((kind, CaptureSource::Device, track_constraints));
        }
    }
    if requests.is_empty() {
        return Err(BridgeError::invalid_argument("constraints request neither audio nor video"));
    }
    open_local_media(ctx, "getUserMedia", requests).await
}

/// Captures a screen or a window as a video-only local stream.
///
/// `video.deviceId.exact` names the source: `"0"`, the default, is the whole
/// screen and any other id a window. Audio constraints are ignored.
pub async fn get_display_media(ctx: &BridgeContext, args: &Value) -> Result<Value> {
    let constraints = args.opt("constraints").cloned().unwrap_or_else(Value::map);
    let video = requested(&constraints, MediaKind::Video)?.unwrap_or_else(Value::map);
    let source = display_source(&video)?;
    tracing::debug!(?source, "capturing display");
    open_local_media(ctx, "getDisplayMedia", vec![(MediaKind::Video, source, video)]).await
}

fn display_source(video: &Value) -> Result<CaptureSource> {
    let Some(device) = video.opt("deviceId") else {
        return Ok(CaptureSource::Screen);
    };
    match device.require_str("exact")? {
        "" => Err(BridgeError::invalid_argument("field 'deviceId.exact' must not be empty")),
        "0" => Ok(CaptureSource::Screen),
        window => Ok(CaptureSource::Window(window.to_string())),
    }
}

/// Opens capture tracks and wraps them in a new local stream.
///
/// Handles are reserved before the engine is asked for tracks, so nothing
/// else can claim them while capture is in flight. On failure every track
/// already opened is stopped and the reservations are dropped.
async fn open_local_media(
    ctx: &BridgeContext,
    command: &'static str,
    requests: Vec<CaptureRequest>,
) -> Result<Value> {
    let (stream_handle, track_handles) = reserve(ctx, requests.len())?;
    let captured = capture(ctx, command, &stream_handle, requests, &track_handles).await;
    let (stream, media) = match captured {
        Ok(captured) => captured,
        Err(err) => {
            unreserve(ctx, &stream_handle, &track_handles);
            return Err(err);
        },
    };

    let mut audio_tracks = Vec::new();
    let mut video_tracks = Vec::new();
    {
        let mut inner = ctx.registry.lock();
        inner.unreserve(stream_handle.as_str());
        for handle in &track_handles {
            inner.unreserve(handle.as_str());
        }
        for (handle, local) in &media {
            let info = local_track_info(handle, local.track.as_ref()).to_value();
            match local.track.kind() {
                MediaKind::Audio => audio_tracks.push(info),
                MediaKind::Video => video_tracks.push(info),
            }
            inner.local_tracks.put(
                handle.clone(),
                LocalTrackEntry {
                    handle: handle.clone(),
                    track: local.track.clone(),
                    capturer: local.capturer.clone(),
                },
            );
        }
        inner.local_streams.put(
            stream_handle.clone(),
            LocalStreamEntry {
                handle: stream_handle.clone(),
                stream,
                tracks: media.iter().map(|(handle, _)| handle.clone()).collect(),
                attached_to: None,
            },
        );
    }

    tracing::info!(
        command,
        stream = %stream_handle,
        audio = audio_tracks.len(),
        video = video_tracks.len(),
        "local media captured"
    );
    Ok(vmap! {
        "streamId" => stream_handle,
        "audioTracks" => audio_tracks,
        "videoTracks" => video_tracks,
    })
}

/// Reads the constraint for one media kind: `true` or a map requests it.
fn requested(constraints: &Value, kind: MediaKind) -> Result<Option<Value>> {
    match constraints.opt(kind.as_str()) {
        None | Some(Value::Bool(false)) => Ok(None),
        Some(Value::Bool(true)) => Ok(Some(Value::map())),
        Some(map @ Value::Map(_)) => Ok(Some(map.clone())),
        Some(other) => Err(BridgeError::invalid_argument(format!(
            "field '{kind}' must be bool or map, got {}",
            other.kind()
        ))),
    }
}

/// Reserves a stream handle and `tracks` track handles.
fn reserve(ctx: &BridgeContext, tracks: usize) -> Result<(Handle, Vec<Handle>)> {
    let mut inner = ctx.registry.lock();
    let stream = inner.reserve_handle(ResourceKind::MediaStream)?;
    let mut reserved = Vec::with_capacity(tracks);
    for _ in 0..tracks {
        match inner.reserve_handle(ResourceKind::MediaTrack) {
            Ok(handle) => reserved.push(handle),
            Err(err) => {
                inner.unreserve(stream.as_str());
                for handle in &reserved {
                    inner.unreserve(handle.as_str());
                }
                return Err(err);
            },
        }
    }
    Ok((stream, reserved))
}

fn unreserve(ctx: &BridgeContext, stream: &Handle, tracks: &[Handle]) {
    let mut inner = ctx.registry.lock();
    inner.unreserve(stream.as_str());
    for handle in tracks {
        inner.unreserve(handle.as_str());
    }
}

async fn capture(
    ctx: &BridgeContext,
    command: &'static str,
    stream_handle: &Handle,
    requests: Vec<CaptureRequest>,
    handles: &[Handle],
) -> Result<(Arc<dyn EngineStream>, Vec<(Handle, LocalMedia)>)> {
    let stream = ctx
        .engine
        .create_local_stream(stream_handle.as_str())
        .map_err(|e| BridgeError::engine(command, e))?;

    let mut media: Vec<(Handle, LocalMedia)> = Vec::with_capacity(handles.len());
    for ((kind, source, constraints), handle) in requests.into_iter().zip(handles) {
        let request = TrackRequest { id: handle.to_string(), kind, source, constraints };
        let opened = ctx.engine.create_local_track(request).await.and_then(|local| {
            let added = stream.add_track(local.track.clone());
            media.push((handle.clone(), local));
            added
        });
        match opened {
            Ok(()) => {},
            Err(err) => {
                tracing::warn!(%kind, error = %err, "capture failed, releasing opened tracks");
                for (_, local) in &media {
                    if let Some(capturer) = &local.capturer {
                        capturer.stop();
                    }
                }
                return Err(BridgeError::engine(command, err));
            },
        }
    }
    Ok((stream, media))
}

pub fn create_stream(ctx: &BridgeContext) -> Result<Value> {
    let mut inner = ctx.registry.lock();
    let handle = inner.allocate_handle(ResourceKind::MediaStream)?;
    let stream = ctx
        .engine
        .create_local_stream(handle.as_str())
        .map_err(|e| BridgeError::engine("createLocalMediaStream", e))?;
    inner.local_streams.put(
        handle.clone(),
        LocalStreamEntry { handle: handle.clone(), stream, tracks: Vec::new(), attached_to: None },
    );
    drop(inner);
    tracing::debug!(stream = %handle, "local stream created");
    Ok(vmap! { "streamId" => handle })
}

/// Lists a stream's tracks. Works for local and remote streams.
pub fn stream_tracks(ctx: &BridgeContext, args: &Value) -> Result<Value> {
    let stream_id = args.require_str("streamId")?;
    let inner = ctx.registry.lock();
    let tracks: Vec<TrackInfo> = match inner.find_stream(stream_id, None)? {
        StreamRef::Local(entry) => entry
            .tracks
            .iter()
            .filter_map(|handle| inner.local_tracks.get(handle).ok())
            .map(|track| local_track_info(&track.handle, track.track.as_ref()))
            .collect(),
        StreamRef::Remote { session, entry } => {
            let session = inner.sessions.get(&session)?;
            let stream = &entry.stream;
            stream
                .audio_tracks()
                .into_iter()
                .chain(stream.video_tracks())
                .map(|track| {
                    let engine_id = track.id();
                    let handle = session
                        .remote_tracks
                        .values()
                        .find(|t| t.track.id() == engine_id)
                        .map_or(engine_id, |t| t.handle.to_string());
                    TrackInfo::describe(handle, track.as_ref(), true)
                })
                .collect()
        },
    };
    let (audio, video): (Vec<_>, Vec<_>) =
        tracks.into_iter().partition(|track| track.kind == MediaKind::Audio);
    Ok(vmap! {
        "audioTracks" => audio.iter().map(TrackInfo::to_value).collect::<Value>(),
        "videoTracks" => video.iter().map(TrackInfo::to_value).collect::<Value>(),
    })
}

pub fn stream_add_track(ctx: &BridgeContext, args: &Value) -> Result<Value> {
    let stream_id = args.require_str("streamId")?;
    let track_id = args.require_str("trackId")?;
    let mut inner = ctx.registry.lock();
    let track = inner.find_track(track_id)?;
    let entry = local_stream_mut(&mut inner, stream_id)?;
    entry
        .stream
        .add_track(track.engine_track().clone())
        .map_err(|e| BridgeError::engine("mediaStreamAddTrack", e))?;
    if let TrackRef::Local(track) = track {
        if !entry.tracks.contains(&track.handle) {
            entry.tracks.push(track.handle);
        }
    }
    Ok(ok())
}

pub fn stream_remove_track(ctx: &BridgeContext, args: &Value) -> Result<Value> {
    let stream_id = args.require_str("streamId")?;
    let track_id = args.require_str("trackId")?;
    let mut inner = ctx.registry.lock();
    let track = inner.find_track(track_id)?;
    let entry = local_stream_mut(&mut inner, stream_id)?;
    entry
        .stream
        .remove_track(track.engine_track())
        .map_err(|e| BridgeError::engine("mediaStreamRemoveTrack", e))?;
    entry.tracks.retain(|t| t.as_str() != track_id);
    Ok(ok())
}

/// Local streams are mutable; remote ones belong to their session.
fn local_stream_mut<'a>(
    inner: &'a mut RegistryInner,
    stream_id: &str,
) -> Result<&'a mut LocalStreamEntry> {
    if !inner.local_streams.contains(stream_id) && inner.find_stream(stream_id, None).is_ok() {
        return Err(BridgeError::invalid_handle("remote streams cannot be modified", stream_id));
    }
    inner.local_streams.get_mut(stream_id)
}

pub fn set_enabled(ctx: &BridgeContext, args: &Value) -> Result<Value> {
    let track_id = args.require_str("trackId")?;
    let enabled = args.require_bool("enabled")?;
    let track = ctx.registry.lock().find_track(track_id)?;
    track.engine_track().set_enabled(enabled);
    tracing::debug!(track = track_id, enabled, "track enabled state changed");
    Ok(ok())
}

pub fn set_volume(ctx: &BridgeContext, args: &Value) -> Result<Value> {
    let track_id = args.require_str("trackId")?;
    let volume = args
        .require("volume")?
        .as_float()
        .map_err(|e| e.for_field("volume"))?;
    if !volume.is_finite() || volume < 0.0 {
        return Err(BridgeError::invalid_argument(format!(
            "field 'volume' must be a non-negative number, got {volume}"
        )));
    }
    let track = ctx.registry.lock().find_track(track_id)?;
    if track.engine_track().kind() != MediaKind::Audio {
        return Err(BridgeError::invalid_handle("volume applies to audio tracks only", track_id));
    }
    track
        .engine_track()
        .set_volume(volume)
        .map_err(|e| BridgeError::engine("setVolume", e))?;
    Ok(ok())
}

pub fn dispose_stream(ctx: &BridgeContext, args: &Value) -> Result<Value> {
    lifecycle::dispose_stream(ctx, args.require_str("streamId")?)?;
    Ok(ok())
}

pub fn dispose_track(ctx: &BridgeContext, args: &Value) -> Result<Value> {
    lifecycle::dispose_track(ctx, args.require_str("trackId")?)?;
    Ok(ok())
}
