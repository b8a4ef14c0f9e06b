// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Events delivered to the host.
//!
//! Each entity kind has its own tagged event type. All of them implement
//! [`BridgeEvent`] and render to a flat Value map whose `event` field names
//! the event.

use crate::engine::{DataChannelMessage, EngineStream, EngineTrack, IceCandidate};
use crate::handle::Handle;
use crate::state::{
    DataChannelState, FrameCryptionState, IceConnectionState, IceGatheringState, MediaKind,
    PeerConnectionState, SignalingState, TrackState,
};
use crate::value::Value;
use crate::vmap;

/// An event that can be published through an [`EventSink`](crate::sink::EventSink).
pub trait BridgeEvent {
    /// The wire name placed in the `event` field.
    fn name(&self) -> &'static str;
    fn into_value(self) -> Value;
}

/// Snapshot of a track as reported to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackInfo {
    pub id: String,
    pub label: String,
    pub kind: MediaKind,
    pub enabled: bool,
    pub remote: bool,
    pub state: TrackState,
}

impl TrackInfo {
    /// Describes `track` under the host-facing `id`.
    pub fn describe(id: impl Into<String>, track: &dyn EngineTrack, remote: bool) -> Self {
        Self {
            id: id.into(),
            label: track.label(),
            kind: track.kind(),
            enabled: track.enabled(),
            remote,
            state: track.state(),
        }
    }

    pub fn from_engine(track: &dyn EngineTrack, remote: bool) -> Self {
        Self::describe(track.id(), track, remote)
    }

    pub fn to_value(&self) -> Value {
        vmap! {
            "id" => self.id.as_str(),
            "label" => self.label.as_str(),
            "kind" => self.kind.as_str(),
            "enabled" => self.enabled,
            "remote" => self.remote,
            "readyState" => self.state.as_str(),
        }
    }
}

/// Snapshot of a stream and its tracks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub stream_id: Handle,
    pub owner_tag: String,
    pub audio_tracks: Vec<TrackInfo>,
    pub video_tracks: Vec<TrackInfo>,
}

impl StreamInfo {
    pub fn from_engine(
        stream_id: Handle,
        owner_tag: impl Into<String>,
        stream: &dyn EngineStream,
        remote: bool,
    ) -> Self {
        Self {
            stream_id,
            owner_tag: owner_tag.into(),
            audio_tracks: stream
                .audio_tracks()
                .iter()
                .map(|t| TrackInfo::from_engine(t.as_ref(), remote))
                .collect(),
            video_tracks: stream
                .video_tracks()
                .iter()
                .map(|t| TrackInfo::from_engine(t.as_ref(), remote))
                .collect(),
        }
    }

    pub fn to_value(&self) -> Value {
        vmap! {
            "streamId" => &self.stream_id,
            "ownerTag" => self.owner_tag.as_str(),
            "audioTracks" => self.audio_tracks.iter().map(TrackInfo::to_value).collect::<Value>(),
            "videoTracks" => self.video_tracks.iter().map(TrackInfo::to_value).collect::<Value>(),
        }
    }
}

pub fn candidate_to_value(candidate: &IceCandidate) -> Value {
    vmap! {
        "candidate" => candidate.candidate.as_str(),
        "sdpMid" => candidate.sdp_mid.clone(),
        "sdpMLineIndex" => candidate.sdp_mline_index,
    }
}

/// Events on a session's stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    SignalingState(SignalingState),
    PeerConnectionState(PeerConnectionState),
    IceGatheringState(IceGatheringState),
    IceConnectionState(IceConnectionState),
    Candidate(IceCandidate),
    AddStream(StreamInfo),
    RemoveStream { stream_id: Handle },
    AddTrack { stream_id: Handle, track: TrackInfo },
    RemoveTrack { stream_id: Option<Handle>, track: TrackInfo },
    Track { streams: Vec<StreamInfo>, track: TrackInfo, transceiver_mid: Option<String> },
    DataChannelOpened { id: u32, label: String },
    RenegotiationNeeded,
}

impl BridgeEvent for SessionEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::SignalingState(_) => "signalingState",
            Self::PeerConnectionState(_) => "peerConnectionState",
            Self::IceGatheringState(_) => "iceGatheringState",
            Self::IceConnectionState(_) => "iceConnectionState",
            Self::Candidate(_) => "onCandidate",
            Self::AddStream(_) => "onAddStream",
            Self::RemoveStream { .. } => "onRemoveStream",
            Self::AddTrack { .. } => "onAddTrack",
            Self::RemoveTrack { .. } => "onRemoveTrack",
            Self::Track { .. } => "onTrack",
            Self::DataChannelOpened { .. } => "didOpenDataChannel",
            Self::RenegotiationNeeded => "onRenegotiationNeeded",
        }
    }

    fn into_value(self) -> Value {
        let mut value = vmap! { "event" => self.name() };
        match self {
            Self::SignalingState(s) => value.insert("state", s.as_str()),
            Self::PeerConnectionState(s) => value.insert("state", s.as_str()),
            Self::IceGatheringState(s) => value.insert("state", s.as_str()),
            Self::IceConnectionState(s) => value.insert("state", s.as_str()),
            Self::Candidate(c) => value.insert("candidate", candidate_to_value(&c)),
            Self::AddStream(info) => {
                value.insert("streamId", &info.stream_id);
                value.insert(
                    "audioTracks",
                    info.audio_tracks.iter().map(TrackInfo::to_value).collect::<Value>(),
                );
                value.insert(
                    "videoTracks",
                    info.video_tracks.iter().map(TrackInfo::to_value).collect::<Value>(),
                );
            },
            Self::RemoveStream { stream_id } => value.insert("streamId", stream_id),
            Self::AddTrack { stream_id, track } => {
                value.insert("streamId", stream_id);
                value.insert("trackId", track.id.as_str());
                value.insert("track", track.to_value());
            },
            Self::RemoveTrack { stream_id, track } => {
                if let Some(stream_id) = stream_id {
                    value.insert("streamId", stream_id);
                }
                value.insert("trackId", track.id.as_str());
                value.insert("track", track.to_value());
            },
            Self::Track { streams, track, transceiver_mid } => {
                let streams: Value = streams.iter().map(StreamInfo::to_value).collect();
                value.insert("streams", streams);
                value.insert("track", track.to_value());
                value.insert("transceiverMid", transceiver_mid);
            },
            Self::DataChannelOpened { id, label } => {
                value.insert("id", id);
                value.insert("label", label);
            },
            Self::RenegotiationNeeded => {},
        }
        value
    }
}

/// Events on a data channel's stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataChannelEvent {
    StateChanged { id: u32, state: DataChannelState },
    Message { id: u32, message: DataChannelMessage },
}

impl BridgeEvent for DataChannelEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::StateChanged { .. } => "dataChannelStateChanged",
            Self::Message { .. } => "dataChannelReceiveMessage",
        }
    }

    fn into_value(self) -> Value {
        let name = self.name();
        match self {
            Self::StateChanged { id, state } => {
                vmap! { "event" => name, "id" => id, "state" => state.as_str() }
            },
            Self::Message { id, message } => {
                let (kind, data) = match message {
                    DataChannelMessage::Text(text) => ("text", Value::from(text)),
                    DataChannelMessage::Binary(bytes) => ("binary", Value::from(bytes)),
                };
                vmap! { "event" => name, "id" => id, "type" => kind, "data" => data }
            },
        }
    }
}

/// Events on a renderer's stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendererEvent {
    FirstFrameRendered { id: i64 },
    VideoSizeChanged { id: i64, width: u32, height: u32 },
    RotationChanged { id: i64, rotation: i32 },
}

impl BridgeEvent for RendererEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::FirstFrameRendered { .. } => "didFirstFrameRendered",
            Self::VideoSizeChanged { .. } => "didTextureChangeVideoSize",
            Self::RotationChanged { .. } => "didTextureChangeRotation",
        }
    }

    fn into_value(self) -> Value {
        let name = self.name();
        match self {
            Self::FirstFrameRendered { id } => vmap! { "event" => name, "id" => id },
            Self::VideoSizeChanged { id, width, height } => {
                vmap! { "event" => name, "id" => id, "width" => width, "height" => height }
            },
            Self::RotationChanged { id, rotation } => {
                vmap! { "event" => name, "id" => id, "rotation" => rotation }
            },
        }
    }
}

/// Events on a frame cryptor's stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptorEvent {
    StateChanged { participant_id: String, state: FrameCryptionState },
}

impl BridgeEvent for CryptorEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::StateChanged { .. } => "frameCryptionStateChanged",
        }
    }

    fn into_value(self) -> Value {
        let name = self.name();
        match self {
            Self::StateChanged { participant_id, state } => vmap! {
                "event" => name,
                "participantId" => participant_id,
                "state" => state.as_str(),
            },
        }
    }
}
