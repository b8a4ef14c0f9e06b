// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Renderer commands.

use std::sync::Arc;

use rtcbridge_core::engine::{same_object, EngineTrack};
use rtcbridge_core::{vmap, BridgeError, Handle, Result, Value};

use super::ok;
use crate::constants::LOCAL_OWNER_TAG;
use crate::context::BridgeContext;
use crate::entities::{RendererBinding, StreamRef};
use crate::registry::RegistryInner;
use crate::renderer;

pub fn create(ctx: &BridgeContext) -> Result<Value> {
    let renderer = renderer::create(&mut ctx.registry.lock());
    tracing::debug!(renderer = renderer.id(), "video renderer created");
    Ok(vmap! { "textureId" => renderer.id() })
}

/// Points a renderer at a stream's video track.
///
/// `trackId` picks a specific video track of the stream; without it the
/// first video track is used. An empty or missing `streamId` unbinds.
pub fn set_src_object(ctx: &BridgeContext, args: &Value) -> Result<Value> {
    let texture_id = args.require_int_compat("textureId")?;
    let stream_id = args.opt_str("streamId")?.unwrap_or_default();
    let owner_tag = args.opt_str("ownerTag")?;

    let mut inner = ctx.registry.lock();
    inner.renderers.get(&texture_id)?;
    if stream_id.is_empty() {
        renderer::bind(&mut inner, texture_id, None)?;
        return Ok(ok());
    }

    let stream = inner.find_stream(stream_id, owner_tag)?;
    let video_tracks = stream.engine_stream().video_tracks();
    let track: Arc<dyn EngineTrack> = match args.opt_str("trackId")? {
        Some(track_id) if !track_id.is_empty() => {
            let found = inner.find_track(track_id)?;
            if !video_tracks.iter().any(|t| same_object(t, found.engine_track())) {
                return Err(BridgeError::invalid_handle(
                    format!("track {track_id} is not a video track of stream {stream_id}"),
                    track_id,
                ));
            }
            found.engine_track().clone()
        },
        _ => video_tracks.first().cloned().ok_or_else(|| {
            BridgeError::invalid_handle(format!("stream {stream_id} has no video track"), stream_id)
        })?,
    };

    let owner_tag = match &stream {
        StreamRef::Local(_) => LOCAL_OWNER_TAG.to_string(),
        StreamRef::Remote { session, .. } => session.to_string(),
    };
    let binding = RendererBinding {
        stream_id: stream.handle().clone(),
        track_id: track_handle(&inner, &track),
        owner_tag,
        track,
    };
    renderer::bind(&mut inner, texture_id, Some(binding))?;
    Ok(ok())
}

/// The registry handle of an engine track, matched by identity.
fn track_handle(inner: &RegistryInner, track: &Arc<dyn EngineTrack>) -> Handle {
    if let Some(local) = inner.local_tracks.values().find(|t| same_object(&t.track, track)) {
        return local.handle.clone();
    }
    inner
        .sessions
        .values()
        .flat_map(|session| session.remote_tracks.values())
        .find(|t| same_object(&t.track, track))
        .map_or_else(|| Handle::from(track.id()), |t| t.handle.clone())
}

pub fn dispose(ctx: &BridgeContext, args: &Value) -> Result<Value> {
    let texture_id = args.require_int_compat("textureId")?;
    if renderer::dispose(&mut ctx.registry.lock(), texture_id)? {
        tracing::debug!(renderer = texture_id, "video renderer disposed");
    }
    Ok(ok())
}
