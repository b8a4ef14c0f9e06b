// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Registry entry types.
//!
//! Entries hold references to engine objects plus the bookkeeping the bridge
//! needs to find and tear them down. They are cheap to clone (all engine
//! objects are behind `Arc`).

use std::sync::Arc;
use std::time::Instant;

use indexmap::IndexMap;
use rtcbridge_core::engine::{
    Capturer, EngineConnection, EngineDataChannel, EngineFrameCryptor, EngineKeyProvider,
    EngineStream, EngineTrack, VideoSink,
};
use rtcbridge_core::state::SessionPhase;
use rtcbridge_core::{EventSink, Handle, ResourceKind};
use tokio_util::sync::CancellationToken;

use crate::constants::SYNTHETIC_DATA_CHANNEL_ID_BASE;
use crate::observer::ObserverHandle;
use crate::registry::Table;
use crate::renderer::Renderer;

/// One peer connection and everything it owns.
#[derive(Debug)]
pub struct SessionEntry {
    pub handle: Handle,
    pub connection: Arc<dyn EngineConnection>,
    pub sink: EventSink,
    pub phase: SessionPhase,
    /// Set once `peerConnectionClose` (or dispose) has run.
    pub closed: bool,
    pub remote_streams: Table<Handle, RemoteStreamEntry>,
    pub remote_tracks: Table<Handle, RemoteTrackEntry>,
    pub data_channels: Table<u32, DataChannelEntry>,
    /// Local tracks referenced by this session's senders, keyed by sender id.
    pub sender_tracks: IndexMap<String, Handle>,
    pub created_at: Instant,
    next_synthetic_channel_id: u32,
    pub(crate) observer: ObserverHandle,
}

impl SessionEntry {
    pub(crate) fn new(
        handle: Handle,
        connection: Arc<dyn EngineConnection>,
        sink: EventSink,
        observer: ObserverHandle,
    ) -> Self {
        Self {
            handle,
            connection,
            sink,
            phase: SessionPhase::Opening,
            closed: false,
            remote_streams: Table::new(ResourceKind::MediaStream),
            remote_tracks: Table::new(ResourceKind::MediaTrack),
            data_channels: Table::new(ResourceKind::DataChannel),
            sender_tracks: IndexMap::new(),
            created_at: Instant::now(),
            next_synthetic_channel_id: SYNTHETIC_DATA_CHANNEL_ID_BASE,
            observer,
        }
    }

    /// Picks the id for a data channel the engine opened on its own.
    ///
    /// The engine's wire id is used when it is visible and free; otherwise a
    /// fresh id above the 16-bit range is synthesized.
    pub fn assign_data_channel_id(&mut self, engine_id: Option<u16>) -> u32 {
        if let Some(id) = engine_id.map(u32::from) {
            if !self.data_channels.contains(&id) {
                return id;
            }
        }
        loop {
            let id = self.next_synthetic_channel_id;
            self.next_synthetic_channel_id = self.next_synthetic_channel_id.wrapping_add(1).max(
                SYNTHETIC_DATA_CHANNEL_ID_BASE,
            );
            if !self.data_channels.contains(&id) {
                return id;
            }
        }
    }

    /// Finds the registered handle of a remote stream by engine object identity.
    pub fn remote_stream_handle(&self, stream: &Arc<dyn EngineStream>) -> Option<Handle> {
        self.remote_streams
            .values()
            .find(|entry| rtcbridge_core::engine::same_object(&entry.stream, stream))
            .map(|entry| entry.handle.clone())
    }

    /// Finds a data channel by engine object identity.
    pub fn data_channel_by_object(
        &self,
        channel: &Arc<dyn EngineDataChannel>,
    ) -> Option<&DataChannelEntry> {
        self.data_channels
            .values()
            .find(|entry| rtcbridge_core::engine::same_object(&entry.channel, channel))
    }
}

#[derive(Debug, Clone)]
pub struct RemoteStreamEntry {
    pub handle: Handle,
    pub stream: Arc<dyn EngineStream>,
}

#[derive(Debug, Clone)]
pub struct RemoteTrackEntry {
    /// The engine track id. Remote tracks are deduplicated on it.
    pub handle: Handle,
    pub track: Arc<dyn EngineTrack>,
    /// Stream the track was first discovered through, if any.
    pub stream: Option<Handle>,
}

#[derive(Debug, Clone)]
pub struct DataChannelEntry {
    pub id: u32,
    pub label: String,
    pub channel: Arc<dyn EngineDataChannel>,
    pub sink: EventSink,
}

/// Key under which a data channel is retired. Channel ids are only unique
/// within their session.
pub fn data_channel_key(session: &Handle, id: u32) -> String {
    format!("{session}/{id}")
}

#[derive(Debug, Clone)]
pub struct LocalStreamEntry {
    pub handle: Handle,
    pub stream: Arc<dyn EngineStream>,
    /// Ordered set of local track handles.
    pub tracks: Vec<Handle>,
    /// Session the stream was added to through the legacy `addStream` call.
    pub attached_to: Option<Handle>,
}

#[derive(Debug, Clone)]
pub struct LocalTrackEntry {
    pub handle: Handle,
    pub track: Arc<dyn EngineTrack>,
    pub capturer: Option<Arc<dyn Capturer>>,
}

/// What a renderer is currently showing.
#[derive(Debug, Clone)]
pub struct RendererBinding {
    pub stream_id: Handle,
    pub track_id: Handle,
    pub owner_tag: String,
    pub track: Arc<dyn EngineTrack>,
}

#[derive(Debug, Clone)]
pub struct RendererEntry {
    pub id: i64,
    pub renderer: Arc<Renderer>,
    pub binding: Option<RendererBinding>,
}

impl RendererEntry {
    pub fn sink(&self) -> Arc<dyn VideoSink> {
        self.renderer.clone()
    }
}

#[derive(Debug, Clone)]
pub struct KeyProviderEntry {
    pub handle: Handle,
    pub provider: Arc<dyn EngineKeyProvider>,
}

#[derive(Debug, Clone)]
pub struct FrameCryptorEntry {
    pub handle: Handle,
    pub session: Handle,
    pub cryptor: Arc<dyn EngineFrameCryptor>,
    pub sink: EventSink,
    pub(crate) forwarder_shutdown: CancellationToken,
}

/// A stream found by a local-then-remote lookup.
#[derive(Debug, Clone)]
pub enum StreamRef {
    Local(LocalStreamEntry),
    Remote { session: Handle, entry: RemoteStreamEntry },
}

impl StreamRef {
    pub fn engine_stream(&self) -> &Arc<dyn EngineStream> {
        match self {
            Self::Local(entry) => &entry.stream,
            Self::Remote { entry, .. } => &entry.stream,
        }
    }

    pub fn handle(&self) -> &Handle {
        match self {
            Self::Local(entry) => &entry.handle,
            Self::Remote { entry, .. } => &entry.handle,
        }
    }
}

/// A track found by a local-then-remote lookup.
#[derive(Debug, Clone)]
pub enum TrackRef {
    Local(LocalTrackEntry),
    Remote { session: Handle, entry: RemoteTrackEntry },
}

impl TrackRef {
    pub fn engine_track(&self) -> &Arc<dyn EngineTrack> {
        match self {
            Self::Local(entry) => &entry.track,
            Self::Remote { entry, .. } => &entry.track,
        }
    }

    pub const fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackEngine;
    use rtcbridge_core::MediaEngine;
    use rtcbridge_core::Value;

    #[tokio::test]
    #[allow(clippy::unwrap_used)]
    async fn synthesized_channel_ids_stay_above_wire_range() {
        let engine = LoopbackEngine::new();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let connection = engine.create_connection(&Value::Null, &Value::Null, tx).unwrap();
        let mut entry = SessionEntry::new(
            Handle::from("s1"),
            connection,
            EventSink::spawn("test"),
            ObserverHandle::inert(),
        );

        assert_eq!(entry.assign_data_channel_id(Some(5)), 5);
        let synthetic = entry.assign_data_channel_id(None);
        assert!(synthetic >= SYNTHETIC_DATA_CHANNEL_ID_BASE);
        assert_ne!(entry.assign_data_channel_id(None), synthetic);
    }
}
