// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Lifecycle Coordinator.
//!
//! Opening and tearing down sessions, and the cascades that follow a dispose.
//! Every dispose is idempotent: a retired handle is a no-op, a handle that was
//! never issued is `ResourceNotFound`.
//!
//! Bookkeeping always wins over the engine. When the engine refuses to close,
//! the entries are still removed and the engine error is reported afterwards,
//! so a misbehaving engine can never leave a handle stuck in the registry.
//!
//! Engine calls that may fan out into callbacks (`close`, `remove_sink`,
//! capturer stops) run after the registry lock is released.

use std::sync::Arc;

use rtcbridge_core::engine::{Capturer, EngineConnection, EngineStream};
use rtcbridge_core::{
    BridgeError, EventSink, EventStream, Handle, ResourceKind, Result, Value,
};
use tokio::sync::mpsc;

use crate::constants::LOCAL_OWNER_TAG;
use crate::context::BridgeContext;
use crate::entities::{data_channel_key, FrameCryptorEntry, SessionEntry};
use crate::observer;
use crate::registry::RegistryInner;
use crate::renderer::{self, PendingDetach};

/// Creates an engine connection and registers it as a new session.
pub fn open_session(
    ctx: &Arc<BridgeContext>,
    configuration: &Value,
    constraints: &Value,
) -> Result<Handle> {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let connection = ctx
        .engine
        .create_connection(configuration, constraints, events_tx)
        .map_err(|e| BridgeError::engine("createPeerConnection", e))?;

    let (handle, live) = {
        let mut inner = ctx.registry.lock();
        let handle = match inner.allocate_handle(ResourceKind::Session) {
            Ok(handle) => handle,
            Err(err) => {
                drop(inner);
                let _ = connection.close();
                connection.dispose();
                return Err(err);
            },
        };
        let sink = EventSink::spawn(EventStream::Session(handle.clone()).name());
        // The observer blocks on the registry lock until the entry is in place.
        let observer = observer::spawn(ctx, handle.clone(), events_rx);
        inner
            .sessions
            .put(handle.clone(), SessionEntry::new(handle.clone(), connection, sink, observer));
        inner.audio_routing.acquire();
        (handle, inner.sessions.len())
    };

    ctx.metrics.session_created(live);
    tracing::info!(session_id = %handle, live, "session opened");
    Ok(handle)
}

/// Closes a session's connection and clears everything it discovered.
///
/// The session handle stays valid. Closing twice is a no-op.
pub async fn close_session(ctx: &BridgeContext, session: &Handle) -> Result<()> {
    let (connection, observer) = {
        let mut inner = ctx.registry.lock();
        let entry = inner.sessions.get_mut(session)?;
        if entry.closed {
            return Ok(());
        }
        // Discovery callbacks from here on are ignored.
        entry.closed = true;
        (entry.connection.clone(), entry.observer.clone())
    };

    let closed = connection.close();
    // Let the close callbacks (channel and connection state) reach the host
    // before the channels disappear.
    observer.settle().await;

    let released = {
        let mut inner = ctx.registry.lock();
        // A concurrent dispose may have removed the session, cascade included.
        if !inner.sessions.contains(session) {
            return closed.map_err(|e| BridgeError::engine("peerConnectionClose", e));
        }
        clear_discoveries(&mut inner, session)
    };
    release_discoveries(ctx, released);

    match closed {
        Ok(()) => {
            tracing::info!(session_id = %session, "session closed");
            Ok(())
        },
        Err(err) => {
            tracing::warn!(session_id = %session, error = %err, "engine failed to close session");
            Err(BridgeError::engine("peerConnectionClose", err))
        },
    }
}

/// Data channel sinks to close and renderer detaches to run once the registry
/// lock is released.
type Discoveries = (Vec<EventSink>, Vec<PendingDetach>);

/// Drains the data channels, remote streams and remote tracks of `session`,
/// retiring their handles and unbinding renderers that showed them.
fn clear_discoveries(inner: &mut RegistryInner, session: &Handle) -> Discoveries {
    let Ok(entry) = inner.sessions.get_mut(session) else {
        return (Vec::new(), Vec::new());
    };
    let channels = entry.data_channels.drain();
    let streams = entry.remote_streams.drain();
    let tracks = entry.remote_tracks.drain();
    entry.sender_tracks.clear();

    for (id, _) in &channels {
        inner.retired.insert(ResourceKind::DataChannel, data_channel_key(session, *id));
    }
    for (handle, _) in &streams {
        inner.retired.insert(ResourceKind::MediaStream, handle);
    }
    for (handle, _) in &tracks {
        inner.retired.insert(ResourceKind::MediaTrack, handle);
    }
    for stream in inner.local_streams.values_mut() {
        if stream.attached_to.as_ref() == Some(session) {
            stream.attached_to = None;
        }
    }
    let remote_tracks: Vec<Handle> = tracks.into_iter().map(|(handle, _)| handle).collect();
    let pending = renderer::unbind_where(inner, |binding| {
        binding.owner_tag == session.as_str() || remote_tracks.contains(&binding.track_id)
    });
    let sinks: Vec<EventSink> = channels.into_iter().map(|(_, channel)| channel.sink).collect();
    (sinks, pending)
}

fn release_discoveries(ctx: &BridgeContext, (channel_sinks, pending): Discoveries) {
    run_detaches(pending);
    for sink in channel_sinks {
        sink.close();
        ctx.metrics.sink_closed(&sink, "dataChannel");
    }
}

/// Closes (if needed) and removes a session, releasing its engine
/// connection, its event sink and the frame cryptors bound to it.
///
/// The last session to go releases audio routing.
pub async fn dispose_session(ctx: &BridgeContext, session: &Handle) -> Result<()> {
    {
        let inner = ctx.registry.lock();
        if !inner.sessions.contains(session) {
            return retired_or_missing(&inner, ResourceKind::Session, session.as_str());
        }
    }

    let closed = close_session(ctx, session).await;

    let (entry, released, cryptors, live) = {
        let mut inner = ctx.registry.lock();
        if !inner.sessions.contains(session) {
            // A concurrent dispose won.
            return Ok(());
        }
        // A close still waiting on its observer has not cascaded yet.
        let released = clear_discoveries(&mut inner, session);
        let entry = inner.sessions.remove(session)?;
        inner.retired.insert(ResourceKind::Session, session);
        inner.audio_routing.release();
        let cryptors = take_cryptors(&mut inner, |c| &c.session == session);
        let live = inner.sessions.len();
        (entry, released, cryptors, live)
    };

    release_discoveries(ctx, released);
    for cryptor in cryptors {
        release_cryptor(ctx, &cryptor);
    }
    entry.observer.stop();
    entry.sink.close();
    ctx.metrics.sink_closed(&entry.sink, "session");
    entry.connection.dispose();
    ctx.metrics.session_disposed(live, entry.created_at.elapsed());
    tracing::info!(session_id = %session, live, "session disposed");

    match closed {
        Err(err) if err.kind() == rtcbridge_core::ErrorKind::EngineOperationFailed => Err(err),
        _ => Ok(()),
    }
}

/// Disposes a local stream.
///
/// Every renderer showing the stream is detached. Each of its tracks is
/// disposed too, unless a session still sends it or another local stream
/// still holds it; such tracks stay registered.
pub fn dispose_stream(ctx: &BridgeContext, stream_id: &str) -> Result<()> {
    let mut capturers: Vec<Arc<dyn Capturer>> = Vec::new();
    let (entry, detach_from, pending) = {
        let mut inner = ctx.registry.lock();
        if !inner.local_streams.contains(stream_id) {
            if inner.find_stream(stream_id, None).is_ok() {
                return Err(BridgeError::invalid_handle(
                    "remote streams are released with their session",
                    stream_id,
                ));
            }
            return retired_or_missing(&inner, ResourceKind::MediaStream, stream_id);
        }
        let entry = inner.local_streams.get_mut(stream_id)?;
        // Detach from the legacy session first so its own tracks do not count
        // as being sent.
        let attached = entry.attached_to.take();
        let entry = entry.clone();
        let detach_from: Option<Arc<dyn EngineConnection>> = attached
            .and_then(|session| inner.sessions.get(&session).ok().map(|s| s.connection.clone()));

        let mut released = Vec::new();
        for track in &entry.tracks {
            if !inner.sessions_sending(track.as_str()).is_empty()
                || inner.streams_holding(track.as_str(), stream_id) > 0
            {
                tracing::debug!(stream = stream_id, track = %track, "track is shared, keeping it");
                continue;
            }
            released.push(track.clone());
        }

        let pending = renderer::unbind_where(&mut inner, |binding| {
            released.contains(&binding.track_id)
                || (binding.stream_id == entry.handle && is_local_tag(&binding.owner_tag))
        });
        for track in &released {
            if let Ok(track_entry) = inner.local_tracks.remove(track) {
                track_entry.track.set_enabled(false);
                capturers.extend(track_entry.capturer);
                inner.retired.insert(ResourceKind::MediaTrack, track);
            }
        }
        inner.local_streams.remove(stream_id)?;
        inner.retired.insert(ResourceKind::MediaStream, stream_id);
        (entry, detach_from, pending)
    };

    run_detaches(pending);
    for capturer in capturers {
        capturer.stop();
    }
    if let Some(connection) = detach_from {
        if let Err(err) = connection.remove_stream(&entry.stream) {
            tracing::warn!(
                stream = stream_id,
                error = %err,
                "engine failed to detach disposed stream"
            );
        }
    }
    tracing::info!(stream = stream_id, "local stream disposed");
    Ok(())
}

/// Disposes a local track.
///
/// Rejected with `InvalidArgument` while any session still sends the track.
pub fn dispose_track(ctx: &BridgeContext, track_id: &str) -> Result<()> {
    let (entry, streams, pending) = {
        let mut inner = ctx.registry.lock();
        if !inner.local_tracks.contains(track_id) {
            if inner.find_track(track_id).is_ok() {
                return Err(BridgeError::invalid_handle(
                    "remote tracks are released with their session",
                    track_id,
                ));
            }
            return retired_or_missing(&inner, ResourceKind::MediaTrack, track_id);
        }
        let senders = inner.sessions_sending(track_id);
        if let Some(session) = senders.first() {
            return Err(BridgeError::invalid_handle(
                format!("track {track_id} is still sent by session {session}"),
                track_id,
            ));
        }

        let entry = inner.local_tracks.remove(track_id)?;
        inner.retired.insert(ResourceKind::MediaTrack, track_id);
        let mut streams: Vec<Arc<dyn EngineStream>> = Vec::new();
        for stream in inner.local_streams.values_mut() {
            let before = stream.tracks.len();
            stream.tracks.retain(|t| t.as_str() != track_id);
            if stream.tracks.len() != before {
                streams.push(stream.stream.clone());
            }
        }
        let pending = renderer::unbind_track(&mut inner, &entry.handle);
        (entry, streams, pending)
    };

    entry.track.set_enabled(false);
    run_detaches(pending);
    for stream in streams {
        if let Err(err) = stream.remove_track(&entry.track) {
            tracing::warn!(track = track_id, error = %err, "engine failed to drop track");
        }
    }
    if let Some(capturer) = &entry.capturer {
        capturer.stop();
    }
    tracing::info!(track = track_id, "local track disposed");
    Ok(())
}

/// Disposes a frame cryptor by handle.
pub fn dispose_cryptor(ctx: &BridgeContext, cryptor_id: &str) -> Result<()> {
    let entry = {
        let mut inner = ctx.registry.lock();
        match inner.frame_cryptors.remove(cryptor_id) {
            Ok(entry) => {
                inner.retired.insert(ResourceKind::FrameCryptor, cryptor_id);
                entry
            },
            Err(_) => return retired_or_missing(&inner, ResourceKind::FrameCryptor, cryptor_id),
        }
    };
    release_cryptor(ctx, &entry);
    Ok(())
}

fn release_cryptor(ctx: &BridgeContext, entry: &FrameCryptorEntry) {
    entry.forwarder_shutdown.cancel();
    entry.cryptor.dispose();
    entry.sink.close();
    ctx.metrics.sink_closed(&entry.sink, "frameCryptor");
    tracing::debug!(cryptor = %entry.handle, session_id = %entry.session, "frame cryptor disposed");
}

fn take_cryptors(
    inner: &mut RegistryInner,
    mut matches: impl FnMut(&FrameCryptorEntry) -> bool,
) -> Vec<FrameCryptorEntry> {
    let handles: Vec<Handle> =
        inner.frame_cryptors.values().filter(|c| matches(c)).map(|c| c.handle.clone()).collect();
    let mut taken = Vec::with_capacity(handles.len());
    for handle in handles {
        if let Ok(entry) = inner.frame_cryptors.remove(&handle) {
            inner.retired.insert(ResourceKind::FrameCryptor, &handle);
            taken.push(entry);
        }
    }
    taken
}

/// Tears down every entity: sessions first, then local media, renderers and
/// key providers. Failures are logged and do not stop the teardown.
pub async fn dispose_all(ctx: &BridgeContext) {
    let sessions: Vec<Handle> = ctx.registry.lock().sessions.keys().cloned().collect();
    for session in sessions {
        if let Err(err) = dispose_session(ctx, &session).await {
            tracing::warn!(session_id = %session, error = %err, "session teardown failed");
        }
    }

    let streams: Vec<Handle> = ctx.registry.lock().local_streams.keys().cloned().collect();
    for stream in streams {
        if let Err(err) = dispose_stream(ctx, stream.as_str()) {
            tracing::warn!(stream = %stream, error = %err, "stream teardown reported an error");
        }
    }
    let tracks: Vec<Handle> = ctx.registry.lock().local_tracks.keys().cloned().collect();
    for track in tracks {
        if let Err(err) = dispose_track(ctx, track.as_str()) {
            tracing::warn!(track = %track, error = %err, "track teardown reported an error");
        }
    }

    let leftovers = {
        let mut inner = ctx.registry.lock();
        let cryptors = take_cryptors(&mut inner, |_| true);
        let renderers: Vec<i64> = inner.renderers.keys().copied().collect();
        for id in renderers {
            let _ = renderer::dispose(&mut inner, id);
        }
        for (handle, _) in inner.key_providers.drain() {
            inner.retired.insert(ResourceKind::KeyProvider, handle);
        }
        cryptors
    };
    for cryptor in leftovers {
        release_cryptor(ctx, &cryptor);
    }
    tracing::info!("all entities disposed");
}

/// The outcome of disposing a handle that is not live.
fn retired_or_missing(inner: &RegistryInner, kind: ResourceKind, handle: &str) -> Result<()> {
    if inner.retired.contains(kind, handle) {
        tracing::debug!(%kind, handle, "already disposed");
        Ok(())
    } else {
        Err(BridgeError::not_found(kind, handle))
    }
}

fn is_local_tag(tag: &str) -> bool {
    tag.is_empty() || tag == LOCAL_OWNER_TAG
}

fn run_detaches(pending: Vec<PendingDetach>) {
    for detach in pending {
        detach.run();
    }
}
