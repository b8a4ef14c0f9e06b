// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Media engine collaborator interfaces.
//!
//! The bridge never implements ICE, SDP or media capture. It holds
//! references to engine objects behind these traits and drives their
//! lifecycle. Engine callbacks are not virtual methods on bridge objects;
//! the engine pushes [`ConnectionEvent`]s (and [`CryptorStateChange`]s) into
//! unbounded channels handed to it at creation time. Those senders may be
//! used from any engine thread.
//!
//! Operations that complete asynchronously in a real engine (negotiation,
//! candidate application, stats) are `async`; everything else is a plain call.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::EngineError;
use crate::state::{
    DataChannelState, FrameCryptionState, IceConnectionState, IceGatheringState, MediaKind,
    PeerConnectionState, SignalingState, TrackState, TransceiverDirection,
};
use crate::value::{Value, ValueMap};

/// Result type for engine calls.
pub type EngineResult<T> = Result<T, EngineError>;

/// Compares two engine objects by identity rather than by id.
pub fn same_object<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub sdp: String,
    pub sdp_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<i64>,
}

/// One entry of a stats report.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsReport {
    pub id: String,
    pub report_type: String,
    pub timestamp_us: f64,
    pub values: ValueMap,
}

/// Options for `createDataChannel`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChannelInit {
    /// Negotiated stream id, when the host picked one.
    pub id: Option<u16>,
    pub ordered: bool,
    pub max_retransmits: Option<i64>,
    pub max_retransmit_time: Option<i64>,
    pub protocol: String,
    pub negotiated: bool,
}

impl Default for DataChannelInit {
    fn default() -> Self {
        Self {
            id: None,
            ordered: true,
            max_retransmits: None,
            max_retransmit_time: None,
            protocol: String::new(),
            negotiated: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataChannelMessage {
    Text(String),
    Binary(Bytes),
}

/// Geometry of one decoded frame delivered to a [`VideoSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub rotation: i32,
}

/// Where a local capture track takes its media from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureSource {
    /// The default microphone or camera for the track kind.
    Device,
    /// A whole display.
    Screen,
    /// One application window, by the id the desktop enumerator gave it.
    Window(String),
}

/// Request for a new local capture track.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackRequest {
    pub id: String,
    pub kind: MediaKind,
    pub source: CaptureSource,
    pub constraints: Value,
}

/// Per-layer send settings of an RTP sender.
#[derive(Debug, Clone, PartialEq)]
pub struct RtpEncoding {
    pub rid: Option<String>,
    pub active: bool,
    pub max_bitrate_bps: Option<i64>,
    pub min_bitrate_bps: Option<i64>,
    pub max_framerate: Option<i64>,
    pub num_temporal_layers: Option<i64>,
    pub scale_resolution_down_by: Option<f64>,
}

impl Default for RtpEncoding {
    fn default() -> Self {
        Self {
            rid: None,
            active: true,
            max_bitrate_bps: None,
            min_bitrate_bps: None,
            max_framerate: None,
            num_temporal_layers: None,
            scale_resolution_down_by: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RtpParameters {
    pub encodings: Vec<RtpEncoding>,
}

/// A freshly created local track plus the capturer that feeds it, if any.
#[derive(Debug, Clone)]
pub struct LocalMedia {
    pub track: Arc<dyn EngineTrack>,
    pub capturer: Option<Arc<dyn Capturer>>,
}

/// What a new transceiver is built from.
#[derive(Debug, Clone)]
pub enum TransceiverSource {
    Track(Arc<dyn EngineTrack>),
    Kind(MediaKind),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransceiverInit {
    pub direction: TransceiverDirection,
    pub stream_ids: Vec<String>,
}

impl Default for TransceiverInit {
    fn default() -> Self {
        Self { direction: TransceiverDirection::SendRecv, stream_ids: Vec::new() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptorAlgorithm {
    AesGcm,
    AesCbc,
}

impl CryptorAlgorithm {
    /// Unknown values fall back to AES-GCM.
    pub const fn from_index(index: i64) -> Self {
        match index {
            1 => Self::AesCbc,
            _ => Self::AesGcm,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyProviderOptions {
    pub shared_key: bool,
    pub ratchet_salt: Bytes,
    pub ratchet_window_size: i64,
    pub failure_tolerance: i64,
}

impl Default for KeyProviderOptions {
    fn default() -> Self {
        Self {
            shared_key: true,
            ratchet_salt: Bytes::new(),
            ratchet_window_size: 0,
            failure_tolerance: -1,
        }
    }
}

/// The RTP endpoint a frame cryptor is attached to.
#[derive(Debug, Clone)]
pub enum CryptorTarget {
    Sender(Arc<dyn EngineSender>),
    Receiver(Arc<dyn EngineReceiver>),
}

/// Engine callbacks for one connection.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    SignalingState(SignalingState),
    ConnectionState(PeerConnectionState),
    IceGatheringState(IceGatheringState),
    IceConnectionState(IceConnectionState),
    IceCandidate(IceCandidate),
    AddStream(Arc<dyn EngineStream>),
    RemoveStream(Arc<dyn EngineStream>),
    AddTrack { stream: Arc<dyn EngineStream>, track: Arc<dyn EngineTrack> },
    RemoveTrack { stream: Option<Arc<dyn EngineStream>>, track: Arc<dyn EngineTrack> },
    /// Transceiver-level discovery (unified plan). The track is the receiver's.
    Track { streams: Vec<Arc<dyn EngineStream>>, transceiver: Arc<dyn EngineTransceiver> },
    /// The remote side opened a data channel.
    DataChannel(Arc<dyn EngineDataChannel>),
    DataChannelState { channel: Arc<dyn EngineDataChannel>, state: DataChannelState },
    DataChannelMessage { channel: Arc<dyn EngineDataChannel>, message: DataChannelMessage },
    RenegotiationNeeded,
}

pub type ConnectionEventSender = mpsc::UnboundedSender<ConnectionEvent>;
pub type ConnectionEventReceiver = mpsc::UnboundedReceiver<ConnectionEvent>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptorStateChange {
    pub participant_id: String,
    pub state: FrameCryptionState,
}

pub type CryptorEventSender = mpsc::UnboundedSender<CryptorStateChange>;

/// Root factory for engine objects.
#[async_trait]
pub trait MediaEngine: Send + Sync + fmt::Debug {
    /// Creates a connection. The engine reports callbacks through `events`.
    fn create_connection(
        &self,
        configuration: &Value,
        constraints: &Value,
        events: ConnectionEventSender,
    ) -> EngineResult<Arc<dyn EngineConnection>>;

    fn create_local_stream(&self, id: &str) -> EngineResult<Arc<dyn EngineStream>>;

    /// Opens a capture source and wraps it in a track.
    async fn create_local_track(&self, request: TrackRequest) -> EngineResult<LocalMedia>;

    /// The process-wide audio routing resource.
    fn audio_routing(&self) -> Arc<dyn AudioRouting>;

    fn create_key_provider(
        &self,
        options: &KeyProviderOptions,
    ) -> EngineResult<Arc<dyn EngineKeyProvider>>;

    fn create_frame_cryptor(
        &self,
        target: CryptorTarget,
        participant_id: &str,
        algorithm: CryptorAlgorithm,
        key_provider: Arc<dyn EngineKeyProvider>,
        events: CryptorEventSender,
    ) -> EngineResult<Arc<dyn EngineFrameCryptor>>;
}

#[async_trait]
pub trait EngineConnection: Send + Sync + fmt::Debug {
    async fn create_offer(&self, constraints: &Value) -> EngineResult<SessionDescription>;
    async fn create_answer(&self, constraints: &Value) -> EngineResult<SessionDescription>;
    async fn set_local_description(&self, description: SessionDescription) -> EngineResult<()>;
    async fn set_remote_description(&self, description: SessionDescription) -> EngineResult<()>;
    fn local_description(&self) -> Option<SessionDescription>;
    fn remote_description(&self) -> Option<SessionDescription>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> EngineResult<()>;
    async fn get_stats(&self, track: Option<Arc<dyn EngineTrack>>)
        -> EngineResult<Vec<StatsReport>>;
    fn restart_ice(&self);
    fn set_configuration(&self, configuration: &Value) -> EngineResult<()>;

    /// Stops transport. Data channels are closed as a side effect.
    fn close(&self) -> EngineResult<()>;
    /// Releases the engine object. Called exactly once, after `close`.
    fn dispose(&self);

    fn add_stream(&self, stream: Arc<dyn EngineStream>) -> EngineResult<()>;
    fn remove_stream(&self, stream: &Arc<dyn EngineStream>) -> EngineResult<()>;
    fn create_data_channel(
        &self,
        label: &str,
        init: &DataChannelInit,
    ) -> EngineResult<Arc<dyn EngineDataChannel>>;

    fn add_track(
        &self,
        track: Arc<dyn EngineTrack>,
        stream_ids: &[String],
    ) -> EngineResult<Arc<dyn EngineSender>>;
    fn remove_track(&self, sender: &Arc<dyn EngineSender>) -> EngineResult<()>;
    fn add_transceiver(
        &self,
        source: TransceiverSource,
        init: &TransceiverInit,
    ) -> EngineResult<Arc<dyn EngineTransceiver>>;
    fn senders(&self) -> Vec<Arc<dyn EngineSender>>;
    fn receivers(&self) -> Vec<Arc<dyn EngineReceiver>>;
    fn transceivers(&self) -> Vec<Arc<dyn EngineTransceiver>>;
}

pub trait EngineTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> String;
    /// Human-readable source name, e.g. the capture device.
    fn label(&self) -> String;
    fn kind(&self) -> MediaKind;
    fn state(&self) -> TrackState;
    fn enabled(&self) -> bool;
    fn set_enabled(&self, enabled: bool);
    fn add_sink(&self, sink: Arc<dyn VideoSink>);
    fn remove_sink(&self, sink: &Arc<dyn VideoSink>);
    /// Audio tracks only.
    fn set_volume(&self, volume: f64) -> EngineResult<()>;
}

pub trait EngineStream: Send + Sync + fmt::Debug {
    fn id(&self) -> String;
    fn audio_tracks(&self) -> Vec<Arc<dyn EngineTrack>>;
    fn video_tracks(&self) -> Vec<Arc<dyn EngineTrack>>;
    fn add_track(&self, track: Arc<dyn EngineTrack>) -> EngineResult<()>;
    fn remove_track(&self, track: &Arc<dyn EngineTrack>) -> EngineResult<()>;
}

pub trait EngineDataChannel: Send + Sync + fmt::Debug {
    /// The wire id, when the engine exposes it.
    fn id(&self) -> Option<u16>;
    fn label(&self) -> String;
    fn state(&self) -> DataChannelState;
    fn send(&self, message: DataChannelMessage) -> EngineResult<()>;
    fn close(&self);
}

pub trait EngineSender: Send + Sync + fmt::Debug {
    fn id(&self) -> String;
    fn track(&self) -> Option<Arc<dyn EngineTrack>>;
    fn set_track(&self, track: Option<Arc<dyn EngineTrack>>) -> EngineResult<()>;
    fn parameters(&self) -> RtpParameters;
    fn set_parameters(&self, parameters: RtpParameters) -> EngineResult<()>;
}

pub trait EngineReceiver: Send + Sync + fmt::Debug {
    fn id(&self) -> String;
    fn track(&self) -> Arc<dyn EngineTrack>;
}

pub trait EngineTransceiver: Send + Sync + fmt::Debug {
    fn mid(&self) -> Option<String>;
    fn direction(&self) -> TransceiverDirection;
    fn set_direction(&self, direction: TransceiverDirection) -> EngineResult<()>;
    fn stop(&self) -> EngineResult<()>;
    fn sender(&self) -> Arc<dyn EngineSender>;
    fn receiver(&self) -> Arc<dyn EngineReceiver>;
}

/// Local capture source (camera, screen).
pub trait Capturer: Send + Sync + fmt::Debug {
    fn stop(&self);
}

/// Consumer of decoded video frames. Called on engine threads.
pub trait VideoSink: Send + Sync + fmt::Debug {
    fn on_frame(&self, frame: VideoFrame);
}

/// Process-wide audio routing (speaker/earpiece selection, audio session).
pub trait AudioRouting: Send + Sync + fmt::Debug {
    fn start(&self);
    fn stop(&self);
}

pub trait EngineKeyProvider: Send + Sync + fmt::Debug {
    fn set_shared_key(&self, index: i64, key: Bytes) -> EngineResult<()>;
    fn set_key(&self, participant_id: &str, index: i64, key: Bytes) -> EngineResult<()>;
    fn ratchet_key(&self, participant_id: &str, index: i64) -> EngineResult<Bytes>;
}

pub trait EngineFrameCryptor: Send + Sync + fmt::Debug {
    fn participant_id(&self) -> String;
    fn set_enabled(&self, enabled: bool) -> bool;
    fn enabled(&self) -> bool;
    fn set_key_index(&self, index: i64) -> bool;
    fn key_index(&self) -> i64;
    /// Detaches from the RTP endpoint. Called once on dispose.
    fn dispose(&self);
}
