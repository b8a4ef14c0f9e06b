// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Session Observer.
//!
//! Engine callbacks for one connection arrive on an unbounded channel from
//! whatever thread the engine uses. A single task per session consumes them,
//! updates the registry and publishes events on the session's sink, so the
//! order the engine reported is the order the host sees.
//!
//! Discovery is registered before the event is published, so a host reacting
//! to `onAddStream` can immediately bind a renderer to it. Removal is applied
//! (and the handle retired) before the removal event is published.
//!
//! The observer also answers settle requests: a settle is answered only once
//! every engine callback queued before it has been published. Command replies
//! wait on a settle, which places them after the events their engine call
//! triggered.

use std::sync::{Arc, Weak};

use rtcbridge_core::engine::{
    ConnectionEvent, ConnectionEventReceiver, EngineDataChannel, EngineStream, EngineTrack,
    EngineTransceiver,
};
use rtcbridge_core::state::SessionPhase;
use rtcbridge_core::{
    DataChannelEvent, EventSink, EventStream, Handle, ResourceKind, Result, SessionEvent,
    StreamInfo, TrackInfo,
};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::constants::DEFAULT_STREAM_ID;
use crate::context::BridgeContext;
use crate::entities::{DataChannelEntry, RemoteStreamEntry, RemoteTrackEntry, SessionEntry};
use crate::registry::RegistryInner;
use crate::renderer::{self, PendingDetach};

/// Control side of a running observer.
#[derive(Debug, Clone)]
pub struct ObserverHandle {
    shutdown: CancellationToken,
    settle: mpsc::UnboundedSender<oneshot::Sender<()>>,
}

impl ObserverHandle {
    /// Stops the observer. Callbacks still queued are discarded.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Waits until every callback queued so far has been published.
    ///
    /// Returns immediately if the observer is gone.
    pub async fn settle(&self) {
        let (tx, rx) = oneshot::channel();
        if self.settle.send(tx).is_ok() {
            let _ = rx.await;
        }
    }

    /// A handle with no task behind it.
    #[cfg(test)]
    pub(crate) fn inert() -> Self {
        let (settle, _) = mpsc::unbounded_channel();
        Self { shutdown: CancellationToken::new(), settle }
    }
}

/// Starts the observer task for `session`.
///
/// The task holds the context weakly: the registry owns the connection, which
/// owns the sending half of `events`.
pub fn spawn(
    ctx: &Arc<BridgeContext>,
    session: Handle,
    mut events: ConnectionEventReceiver,
) -> ObserverHandle {
    let shutdown = CancellationToken::new();
    let (settle_tx, mut settle_rx) = mpsc::unbounded_channel::<oneshot::Sender<()>>();
    let observer = SessionObserver { session, ctx: Arc::downgrade(ctx) };
    let token = shutdown.clone();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                () = token.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => {
                        if !observer.dispatch(event) {
                            break;
                        }
                    },
                    None => break,
                },
                Some(respond_to) = settle_rx.recv() => {
                    while let Ok(event) = events.try_recv() {
                        if !observer.dispatch(event) {
                            break;
                        }
                    }
                    let _ = respond_to.send(());
                },
            }
        }
        tracing::debug!(session_id = %observer.session, "session observer stopped");
    });

    ObserverHandle { shutdown, settle: settle_tx }
}

struct SessionObserver {
    session: Handle,
    ctx: Weak<BridgeContext>,
}

impl SessionObserver {
    /// Handles one callback. Returns false once the bridge is gone.
    fn dispatch(&self, event: ConnectionEvent) -> bool {
        let Some(ctx) = self.ctx.upgrade() else {
            return false;
        };
        if let Err(err) = self.handle(&ctx, event) {
            // The session was disposed while the callback was in flight.
            tracing::debug!(session_id = %self.session, error = %err, "dropping engine callback");
        }
        true
    }

    fn handle(&self, ctx: &BridgeContext, event: ConnectionEvent) -> Result<()> {
        match event {
            ConnectionEvent::SignalingState(state) => {
                self.publish(ctx, SessionEvent::SignalingState(state))
            },
            ConnectionEvent::ConnectionState(state) => {
                let sink = {
                    let mut inner = ctx.registry.lock();
                    let session = inner.sessions.get_mut(&self.session)?;
                    session.phase = SessionPhase::from(state);
                    session.sink.clone()
                };
                tracing::debug!(session_id = %self.session, %state, "connection state changed");
                self.emit(ctx, &sink, SessionEvent::PeerConnectionState(state));
                Ok(())
            },
            ConnectionEvent::IceGatheringState(state) => {
                self.publish(ctx, SessionEvent::IceGatheringState(state))
            },
            ConnectionEvent::IceConnectionState(state) => {
                self.publish(ctx, SessionEvent::IceConnectionState(state))
            },
            ConnectionEvent::IceCandidate(candidate) => {
                self.publish(ctx, SessionEvent::Candidate(candidate))
            },
            ConnectionEvent::AddStream(stream) => self.on_add_stream(ctx, &stream),
            ConnectionEvent::RemoveStream(stream) => self.on_remove_stream(ctx, &stream),
            ConnectionEvent::AddTrack { stream, track } => self.on_add_track(ctx, &stream, &track),
            ConnectionEvent::RemoveTrack { stream, track } => {
                self.on_remove_track(ctx, stream.as_ref(), &track)
            },
            ConnectionEvent::Track { streams, transceiver } => {
                self.on_track(ctx, &streams, &transceiver)
            },
            ConnectionEvent::DataChannel(channel) => self.on_data_channel(ctx, channel),
            ConnectionEvent::DataChannelState { channel, state } => {
                self.on_channel_event(ctx, &channel, |id| DataChannelEvent::StateChanged {
                    id,
                    state,
                })
            },
            ConnectionEvent::DataChannelMessage { channel, message } => {
                self.on_channel_event(ctx, &channel, |id| DataChannelEvent::Message { id, message })
            },
            ConnectionEvent::RenegotiationNeeded => {
                self.publish(ctx, SessionEvent::RenegotiationNeeded)
            },
        }
    }

    fn publish(&self, ctx: &BridgeContext, event: SessionEvent) -> Result<()> {
        let sink = ctx.registry.lock().sessions.get(&self.session)?.sink.clone();
        self.emit(ctx, &sink, event);
        Ok(())
    }

    #[allow(clippy::unused_self)]
    fn emit(&self, ctx: &BridgeContext, sink: &EventSink, event: SessionEvent) {
        ctx.metrics.event_emitted("session");
        sink.publish(event);
    }

    fn on_add_stream(&self, ctx: &BridgeContext, stream: &Arc<dyn EngineStream>) -> Result<()> {
        let (sink, info) = {
            let mut inner = ctx.registry.lock();
            if inner.sessions.get(&self.session)?.closed {
                return Ok(());
            }
            let (handle, is_new) = adopt_stream(&mut inner, &self.session, stream)?;
            if !is_new {
                tracing::debug!(session_id = %self.session, stream = %handle, "stream seen again");
                return Ok(());
            }
            let session = inner.sessions.get(&self.session)?;
            (session.sink.clone(), stream_info(session, &handle, stream.as_ref()))
        };
        tracing::info!(session_id = %self.session, stream = %info.stream_id, "remote stream added");
        self.emit(ctx, &sink, SessionEvent::AddStream(info));
        Ok(())
    }

    fn on_remove_stream(&self, ctx: &BridgeContext, stream: &Arc<dyn EngineStream>) -> Result<()> {
        let (sink, stream_id, pending) = {
            let mut inner = ctx.registry.lock();
            let session = inner.sessions.get_mut(&self.session)?;
            let sink = session.sink.clone();
            match session.remote_stream_handle(stream) {
                Some(handle) => {
                    let pending = remove_remote_stream(&mut inner, &self.session, &handle)?;
                    (sink, handle, pending)
                },
                None => (sink, Handle::from(stream.id()), Vec::new()),
            }
        };
        for detach in pending {
            detach.run();
        }
        tracing::info!(session_id = %self.session, stream = %stream_id, "remote stream removed");
        self.emit(ctx, &sink, SessionEvent::RemoveStream { stream_id });
        Ok(())
    }

    fn on_add_track(
        &self,
        ctx: &BridgeContext,
        stream: &Arc<dyn EngineStream>,
        track: &Arc<dyn EngineTrack>,
    ) -> Result<()> {
        let (sink, stream_id, info) = {
            let mut inner = ctx.registry.lock();
            if inner.sessions.get(&self.session)?.closed {
                return Ok(());
            }
            let (stream_id, new_stream) = adopt_stream(&mut inner, &self.session, stream)?;
            let (track_id, new_track) =
                adopt_track(&mut inner, &self.session, track, Some(&stream_id))?;
            if !new_stream && !new_track {
                return Ok(());
            }
            let sink = inner.sessions.get(&self.session)?.sink.clone();
            (sink, stream_id, track_info(&track_id, track.as_ref()))
        };
        self.emit(ctx, &sink, SessionEvent::AddTrack { stream_id, track: info });
        Ok(())
    }

    fn on_remove_track(
        &self,
        ctx: &BridgeContext,
        stream: Option<&Arc<dyn EngineStream>>,
        track: &Arc<dyn EngineTrack>,
    ) -> Result<()> {
        let (sink, stream_id, info, pending) = {
            let mut inner = ctx.registry.lock();
            let session = inner.sessions.get_mut(&self.session)?;
            let sink = session.sink.clone();
            let engine_id = track.id();
            let known = session
                .remote_tracks
                .values()
                .find(|entry| entry.track.id() == engine_id)
                .map(|entry| (entry.handle.clone(), entry.stream.clone()));
            let reported_stream = stream.and_then(|s| session.remote_stream_handle(s));

            match known {
                Some((handle, discovered_through)) => {
                    session.remote_tracks.remove(&handle)?;
                    inner.retired.insert(ResourceKind::MediaTrack, &handle);
                    let pending = renderer::unbind_track(&mut inner, &handle);
                    let info = track_info(&handle, track.as_ref());
                    (sink, reported_stream.or(discovered_through), info, pending)
                },
                None => {
                    let info = TrackInfo::from_engine(track.as_ref(), true);
                    (sink, reported_stream, info, Vec::new())
                },
            }
        };
        for detach in pending {
            detach.run();
        }
        self.emit(ctx, &sink, SessionEvent::RemoveTrack { stream_id, track: info });
        Ok(())
    }

    fn on_track(
        &self,
        ctx: &BridgeContext,
        streams: &[Arc<dyn EngineStream>],
        transceiver: &Arc<dyn EngineTransceiver>,
    ) -> Result<()> {
        let track = transceiver.receiver().track();
        let (sink, event) = {
            let mut inner = ctx.registry.lock();
            if inner.sessions.get(&self.session)?.closed {
                return Ok(());
            }
            let mut handles = Vec::with_capacity(streams.len());
            for stream in streams {
                handles.push(adopt_stream(&mut inner, &self.session, stream)?.0);
            }
            let (track_id, _) = adopt_track(&mut inner, &self.session, &track, handles.first())?;
            let session = inner.sessions.get(&self.session)?;
            let infos = handles
                .iter()
                .zip(streams)
                .map(|(handle, stream)| stream_info(session, handle, stream.as_ref()))
                .collect();
            let event = SessionEvent::Track {
                streams: infos,
                track: track_info(&track_id, track.as_ref()),
                transceiver_mid: transceiver.mid(),
            };
            (session.sink.clone(), event)
        };
        self.emit(ctx, &sink, event);
        Ok(())
    }

    fn on_data_channel(
        &self,
        ctx: &BridgeContext,
        channel: Arc<dyn EngineDataChannel>,
    ) -> Result<()> {
        let (sink, id, label) = {
            let mut inner = ctx.registry.lock();
            let session = inner.sessions.get_mut(&self.session)?;
            if session.closed || session.data_channel_by_object(&channel).is_some() {
                return Ok(());
            }
            let id = session.assign_data_channel_id(channel.id());
            let label = channel.label();
            let channel_sink = EventSink::spawn(
                EventStream::DataChannel { session: self.session.clone(), id }.name(),
            );
            session.data_channels.put(
                id,
                DataChannelEntry { id, label: label.clone(), channel, sink: channel_sink },
            );
            (session.sink.clone(), id, label)
        };
        tracing::info!(session_id = %self.session, id, %label, "remote data channel opened");
        self.emit(ctx, &sink, SessionEvent::DataChannelOpened { id, label });
        Ok(())
    }

    fn on_channel_event(
        &self,
        ctx: &BridgeContext,
        channel: &Arc<dyn EngineDataChannel>,
        event: impl FnOnce(u32) -> DataChannelEvent,
    ) -> Result<()> {
        let found = {
            let inner = ctx.registry.lock();
            let session = inner.sessions.get(&self.session)?;
            session.data_channel_by_object(channel).map(|entry| (entry.id, entry.sink.clone()))
        };
        match found {
            Some((id, sink)) => {
                ctx.metrics.event_emitted("dataChannel");
                sink.publish(event(id));
            },
            None => {
                tracing::debug!(session_id = %self.session, "callback for unknown data channel");
            },
        }
        Ok(())
    }
}

/// Registers `stream` on `session`, together with its current tracks.
///
/// An engine object already registered keeps its handle. Otherwise the
/// engine id becomes the handle unless it is the shared default id or already
/// names something else, in which case a fresh handle is allocated.
pub fn adopt_stream(
    inner: &mut RegistryInner,
    session: &Handle,
    stream: &Arc<dyn EngineStream>,
) -> Result<(Handle, bool)> {
    if let Some(handle) = inner.sessions.get(session)?.remote_stream_handle(stream) {
        return Ok((handle, false));
    }
    let engine_id = stream.id();
    let handle = if engine_id.is_empty()
        || engine_id == DEFAULT_STREAM_ID
        || inner.handle_in_use(&engine_id)
    {
        inner.allocate_handle(ResourceKind::MediaStream)?
    } else {
        Handle::from(engine_id)
    };
    inner.sessions.get_mut(session)?.remote_streams.put(
        handle.clone(),
        RemoteStreamEntry { handle: handle.clone(), stream: stream.clone() },
    );
    for track in stream.audio_tracks().iter().chain(stream.video_tracks().iter()) {
        adopt_track(inner, session, track, Some(&handle))?;
    }
    Ok((handle, true))
}

/// Registers a remote track, deduplicating on the engine track id.
pub fn adopt_track(
    inner: &mut RegistryInner,
    session: &Handle,
    track: &Arc<dyn EngineTrack>,
    stream: Option<&Handle>,
) -> Result<(Handle, bool)> {
    let engine_id = track.id();
    if let Some(existing) =
        inner.sessions.get(session)?.remote_tracks.values().find(|t| t.track.id() == engine_id)
    {
        return Ok((existing.handle.clone(), false));
    }
    let handle = if engine_id.is_empty() || inner.handle_in_use(&engine_id) {
        inner.allocate_handle(ResourceKind::MediaTrack)?
    } else {
        Handle::from(engine_id)
    };
    inner.sessions.get_mut(session)?.remote_tracks.put(
        handle.clone(),
        RemoteTrackEntry { handle: handle.clone(), track: track.clone(), stream: stream.cloned() },
    );
    Ok((handle, true))
}

/// Removes a remote stream and the tracks discovered through it, retiring
/// their handles. Returns the renderer detaches to run after unlocking.
fn remove_remote_stream(
    inner: &mut RegistryInner,
    session: &Handle,
    stream: &Handle,
) -> Result<Vec<PendingDetach>> {
    let entry = inner.sessions.get_mut(session)?;
    entry.remote_streams.remove(stream)?;
    let tracks: Vec<Handle> = entry
        .remote_tracks
        .values()
        .filter(|t| t.stream.as_ref() == Some(stream))
        .map(|t| t.handle.clone())
        .collect();
    for track in &tracks {
        entry.remote_tracks.remove(track)?;
    }

    inner.retired.insert(ResourceKind::MediaStream, stream);
    for track in &tracks {
        inner.retired.insert(ResourceKind::MediaTrack, track);
    }
    Ok(renderer::unbind_where(inner, |binding| {
        tracks.contains(&binding.track_id)
            || (&binding.stream_id == stream && binding.owner_tag == session.as_str())
    }))
}

fn track_info(handle: &Handle, track: &dyn EngineTrack) -> TrackInfo {
    TrackInfo::describe(handle.to_string(), track, true)
}

/// Describes a remote stream using the handles its tracks are registered under.
fn stream_info(session: &SessionEntry, handle: &Handle, stream: &dyn EngineStream) -> StreamInfo {
    let describe = |tracks: Vec<Arc<dyn EngineTrack>>| -> Vec<TrackInfo> {
        tracks
            .iter()
            .map(|track| {
                let engine_id = track.id();
                session
                    .remote_tracks
                    .values()
                    .find(|entry| entry.track.id() == engine_id)
                    .map_or_else(
                        || TrackInfo::from_engine(track.as_ref(), true),
                        |entry| track_info(&entry.handle, track.as_ref()),
                    )
            })
            .collect()
    };
    StreamInfo {
        stream_id: handle.clone(),
        owner_tag: session.handle.to_string(),
        audio_tracks: describe(stream.audio_tracks()),
        video_tracks: describe(stream.video_tracks()),
    }
}
