// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! In-memory media engine.
//!
//! Implements every collaborator trait without any real media. Negotiation
//! produces synthetic SDP, setting descriptions walks the connection through
//! plausible state callbacks, and test hooks let callers inject remote
//! streams, data channels, messages and frames. Every object counts the calls
//! the bridge makes on it so tests can assert on lifecycle effects.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use rtcbridge_core::engine::{
    AudioRouting, CaptureSource, Capturer, ConnectionEvent, ConnectionEventSender, CryptorAlgorithm,
    CryptorEventSender, CryptorStateChange, CryptorTarget, DataChannelInit, DataChannelMessage,
    EngineConnection, EngineDataChannel, EngineFrameCryptor, EngineKeyProvider, EngineReceiver,
    EngineResult, EngineSender, EngineStream, EngineTrack, EngineTransceiver, IceCandidate,
    KeyProviderOptions, LocalMedia, MediaEngine, RtpEncoding, RtpParameters, SessionDescription,
    StatsReport, TrackRequest, TransceiverInit, TransceiverSource, VideoFrame, VideoSink,
};
use rtcbridge_core::state::{
    DataChannelState, FrameCryptionState, IceConnectionState, IceGatheringState, MediaKind,
    PeerConnectionState, SignalingState, TrackState, TransceiverDirection,
};
use rtcbridge_core::{EngineError, Value, ValueMap};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Root of the loopback engine.
#[derive(Debug, Default)]
pub struct LoopbackEngine {
    audio: Arc<LoopbackAudioRouting>,
    connections: Mutex<Vec<Arc<LoopbackConnection>>>,
    cryptors: Mutex<Vec<Arc<LoopbackFrameCryptor>>>,
    tracks: Mutex<Vec<Arc<LoopbackTrack>>>,
    capturers: Mutex<Vec<Arc<LoopbackCapturer>>>,
    fail_capture: AtomicBool,
}

impl LoopbackEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn audio(&self) -> &Arc<LoopbackAudioRouting> {
        &self.audio
    }

    /// Connections in creation order.
    pub fn connections(&self) -> Vec<Arc<LoopbackConnection>> {
        lock(&self.connections).clone()
    }

    pub fn last_connection(&self) -> Option<Arc<LoopbackConnection>> {
        lock(&self.connections).last().cloned()
    }

    pub fn last_cryptor(&self) -> Option<Arc<LoopbackFrameCryptor>> {
        lock(&self.cryptors).last().cloned()
    }

    /// A captured track by engine id.
    pub fn local_track(&self, id: &str) -> Option<Arc<LoopbackTrack>> {
        lock(&self.tracks).iter().find(|t| t.id == id).cloned()
    }

    /// Capturers in creation order.
    pub fn capturers(&self) -> Vec<Arc<LoopbackCapturer>> {
        lock(&self.capturers).clone()
    }

    /// Makes subsequent capture requests fail.
    pub fn set_fail_capture(&self, fail: bool) {
        self.fail_capture.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    fn create_connection(
        &self,
        configuration: &Value,
        _constraints: &Value,
        events: ConnectionEventSender,
    ) -> EngineResult<Arc<dyn EngineConnection>> {
        let connection = Arc::new(LoopbackConnection::new(configuration.clone(), events));
        lock(&self.connections).push(connection.clone());
        Ok(connection)
    }

    fn create_local_stream(&self, id: &str) -> EngineResult<Arc<dyn EngineStream>> {
        Ok(Arc::new(LoopbackStream::new(id)))
    }

    async fn create_local_track(&self, request: TrackRequest) -> EngineResult<LocalMedia> {
        if self.fail_capture.load(Ordering::SeqCst) {
            return Err(EngineError::new(format!("no {} capture device available", request.kind)));
        }
        let label = match (&request.source, request.kind) {
            (CaptureSource::Device, MediaKind::Audio) => "loopback microphone".to_string(),
            (CaptureSource::Device, MediaKind::Video) => "loopback camera".to_string(),
            (CaptureSource::Screen, _) => "loopback screen".to_string(),
            (CaptureSource::Window(id), _) => format!("loopback window {id}"),
        };
        let track = Arc::new(LoopbackTrack::new(&request.id, request.kind).with_label(label));
        lock(&self.tracks).push(track.clone());
        let capturer: Option<Arc<dyn Capturer>> = match request.kind {
            MediaKind::Video => {
                let capturer = Arc::new(LoopbackCapturer::feeding(track.clone()));
                lock(&self.capturers).push(capturer.clone());
                Some(capturer)
            },
            MediaKind::Audio => None,
        };
        Ok(LocalMedia { track, capturer })
    }

    fn audio_routing(&self) -> Arc<dyn AudioRouting> {
        self.audio.clone()
    }

    fn create_key_provider(
        &self,
        options: &KeyProviderOptions,
    ) -> EngineResult<Arc<dyn EngineKeyProvider>> {
        Ok(Arc::new(LoopbackKeyProvider::new(options.clone())))
    }

    fn create_frame_cryptor(
        &self,
        _target: CryptorTarget,
        participant_id: &str,
        _algorithm: CryptorAlgorithm,
        _key_provider: Arc<dyn EngineKeyProvider>,
        events: CryptorEventSender,
    ) -> EngineResult<Arc<dyn EngineFrameCryptor>> {
        let cryptor = Arc::new(LoopbackFrameCryptor::new(participant_id, events));
        lock(&self.cryptors).push(cryptor.clone());
        Ok(cryptor)
    }
}

/// Counts start/stop calls.
#[derive(Debug, Default)]
pub struct LoopbackAudioRouting {
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl LoopbackAudioRouting {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl AudioRouting for LoopbackAudioRouting {
    fn start(&self) {
        self.starts.fetch_add(1, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct LoopbackConnection {
    configuration: Mutex<Value>,
    events: ConnectionEventSender,
    local_description: Mutex<Option<SessionDescription>>,
    remote_description: Mutex<Option<SessionDescription>>,
    candidates: Mutex<Vec<IceCandidate>>,
    streams: Mutex<Vec<Arc<dyn EngineStream>>>,
    transceivers: Mutex<Vec<Arc<LoopbackTransceiver>>>,
    data_channels: Mutex<Vec<Arc<LoopbackDataChannel>>>,
    remote_tracks: Mutex<Vec<Arc<LoopbackTrack>>>,
    next_object_id: AtomicUsize,
    close_calls: AtomicUsize,
    dispose_calls: AtomicUsize,
    ice_restarts: AtomicUsize,
    fail_close: AtomicBool,
}

impl LoopbackConnection {
    fn new(configuration: Value, events: ConnectionEventSender) -> Self {
        Self {
            configuration: Mutex::new(configuration),
            events,
            local_description: Mutex::new(None),
            remote_description: Mutex::new(None),
            candidates: Mutex::new(Vec::new()),
            streams: Mutex::new(Vec::new()),
            transceivers: Mutex::new(Vec::new()),
            data_channels: Mutex::new(Vec::new()),
            remote_tracks: Mutex::new(Vec::new()),
            next_object_id: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
            dispose_calls: AtomicUsize::new(0),
            ice_restarts: AtomicUsize::new(0),
            fail_close: AtomicBool::new(false),
        }
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next_object_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Pushes an engine callback as if it came from an engine thread.
    pub fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    /// Announces a remote stream carrying one track per entry of `kinds`.
    pub fn announce_remote_stream(&self, id: &str, kinds: &[MediaKind]) -> Arc<LoopbackStream> {
        let stream = Arc::new(LoopbackStream::new(id));
        for (i, kind) in kinds.iter().enumerate() {
            let track = Arc::new(LoopbackTrack::new(&format!("{id}-{kind}-{i}"), *kind));
            lock(&self.remote_tracks).push(track.clone());
            let _ = stream.add_track(track);
        }
        self.emit(ConnectionEvent::AddStream(stream.clone()));
        stream
    }

    /// Announces a data channel opened by the remote side.
    pub fn announce_remote_data_channel(
        &self,
        label: &str,
        wire_id: Option<u16>,
    ) -> Arc<LoopbackDataChannel> {
        let channel =
            Arc::new(LoopbackDataChannel::new(label, wire_id, Some(self.events.clone())));
        channel.bind_self();
        lock(&self.data_channels).push(channel.clone());
        self.emit(ConnectionEvent::DataChannel(channel.clone()));
        channel
    }

    /// Announces a transceiver-level remote track.
    pub fn announce_remote_transceiver(
        &self,
        streams: Vec<Arc<dyn EngineStream>>,
        track_id: &str,
        kind: MediaKind,
    ) -> Arc<LoopbackTransceiver> {
        let track = Arc::new(LoopbackTrack::new(track_id, kind));
        lock(&self.remote_tracks).push(track.clone());
        let transceiver = Arc::new(LoopbackTransceiver::new(
            Some(self.next_id("mid")),
            TransceiverDirection::RecvOnly,
            Arc::new(LoopbackSender::new(self.next_id("sender"), None)),
            Arc::new(LoopbackReceiver { id: self.next_id("receiver"), track }),
        ));
        lock(&self.transceivers).push(transceiver.clone());
        self.emit(ConnectionEvent::Track { streams, transceiver: transceiver.clone() });
        transceiver
    }

    /// A track announced by the remote side, by engine id.
    pub fn remote_track(&self, id: &str) -> Option<Arc<LoopbackTrack>> {
        lock(&self.remote_tracks).iter().find(|t| t.id == id).cloned()
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn dispose_calls(&self) -> usize {
        self.dispose_calls.load(Ordering::SeqCst)
    }

    pub fn ice_restarts(&self) -> usize {
        self.ice_restarts.load(Ordering::SeqCst)
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        lock(&self.candidates).clone()
    }

    pub fn configuration(&self) -> Value {
        lock(&self.configuration).clone()
    }

    pub fn data_channels(&self) -> Vec<Arc<LoopbackDataChannel>> {
        lock(&self.data_channels).clone()
    }

    /// Makes `close` report failure (state still changes).
    pub fn set_fail_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::SeqCst);
    }

    fn describe(&self, sdp_type: &str) -> SessionDescription {
        let media: Vec<String> = lock(&self.transceivers)
            .iter()
            .map(|t| format!("m={} 9 UDP/TLS/RTP/SAVPF 0", t.receiver.track.kind()))
            .collect();
        SessionDescription {
            sdp: format!("v=0\r\no=loopback 0 0 IN IP4 127.0.0.1\r\ns=-\r\n{}", media.join("\r\n")),
            sdp_type: sdp_type.to_string(),
        }
    }
}

#[async_trait]
impl EngineConnection for LoopbackConnection {
    async fn create_offer(&self, _constraints: &Value) -> EngineResult<SessionDescription> {
        Ok(self.describe("offer"))
    }

    async fn create_answer(&self, _constraints: &Value) -> EngineResult<SessionDescription> {
        if lock(&self.remote_description).is_none() {
            return Err(EngineError::new("cannot create an answer without a remote offer"));
        }
        Ok(self.describe("answer"))
    }

    async fn set_local_description(&self, description: SessionDescription) -> EngineResult<()> {
        let signaling = match description.sdp_type.as_str() {
            "offer" => SignalingState::HaveLocalOffer,
            "answer" => SignalingState::Stable,
            other => return Err(EngineError::new(format!("unsupported description type {other}"))),
        };
        *lock(&self.local_description) = Some(description);
        self.emit(ConnectionEvent::SignalingState(signaling));
        self.emit(ConnectionEvent::IceGatheringState(IceGatheringState::Gathering));
        self.emit(ConnectionEvent::IceCandidate(IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 127.0.0.1 9 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }));
        self.emit(ConnectionEvent::IceGatheringState(IceGatheringState::Complete));
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> EngineResult<()> {
        let signaling = match description.sdp_type.as_str() {
            "offer" => SignalingState::HaveRemoteOffer,
            "answer" => SignalingState::Stable,
            other => return Err(EngineError::new(format!("unsupported description type {other}"))),
        };
        let completes = signaling == SignalingState::Stable;
        *lock(&self.remote_description) = Some(description);
        self.emit(ConnectionEvent::SignalingState(signaling));
        if completes {
            self.emit(ConnectionEvent::IceConnectionState(IceConnectionState::Checking));
            self.emit(ConnectionEvent::ConnectionState(PeerConnectionState::Connecting));
            self.emit(ConnectionEvent::IceConnectionState(IceConnectionState::Connected));
            self.emit(ConnectionEvent::ConnectionState(PeerConnectionState::Connected));
        }
        Ok(())
    }

    fn local_description(&self) -> Option<SessionDescription> {
        lock(&self.local_description).clone()
    }

    fn remote_description(&self) -> Option<SessionDescription> {
        lock(&self.remote_description).clone()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> EngineResult<()> {
        if lock(&self.remote_description).is_none() {
            return Err(EngineError::new("remote description is not set"));
        }
        lock(&self.candidates).push(candidate);
        Ok(())
    }

    async fn get_stats(
        &self,
        track: Option<Arc<dyn EngineTrack>>,
    ) -> EngineResult<Vec<StatsReport>> {
        let mut values = ValueMap::new();
        values.insert("candidates".to_string(), Value::from(lock(&self.candidates).len() as i64));
        let mut reports = vec![StatsReport {
            id: "transport".to_string(),
            report_type: "transport".to_string(),
            timestamp_us: 0.0,
            values,
        }];
        if let Some(track) = track {
            let mut values = ValueMap::new();
            values.insert("trackIdentifier".to_string(), Value::from(track.id()));
            values.insert("kind".to_string(), Value::from(track.kind().as_str()));
            reports.push(StatsReport {
                id: format!("track-{}", track.id()),
                report_type: "media-source".to_string(),
                timestamp_us: 0.0,
                values,
            });
        }
        Ok(reports)
    }

    fn restart_ice(&self) {
        self.ice_restarts.fetch_add(1, Ordering::SeqCst);
        self.emit(ConnectionEvent::RenegotiationNeeded);
    }

    fn set_configuration(&self, configuration: &Value) -> EngineResult<()> {
        *lock(&self.configuration) = configuration.clone();
        Ok(())
    }

    fn close(&self) -> EngineResult<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        for channel in lock(&self.data_channels).iter() {
            channel.set_state(DataChannelState::Closed);
        }
        for track in lock(&self.remote_tracks).iter() {
            track.end();
        }
        self.emit(ConnectionEvent::SignalingState(SignalingState::Closed));
        self.emit(ConnectionEvent::ConnectionState(PeerConnectionState::Closed));
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(EngineError::new("transport refused to close"));
        }
        Ok(())
    }

    fn dispose(&self) {
        self.dispose_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn add_stream(&self, stream: Arc<dyn EngineStream>) -> EngineResult<()> {
        let mut streams = lock(&self.streams);
        if streams.iter().any(|s| rtcbridge_core::engine::same_object(s, &stream)) {
            return Err(EngineError::new("stream already added"));
        }
        streams.push(stream);
        drop(streams);
        self.emit(ConnectionEvent::RenegotiationNeeded);
        Ok(())
    }

    fn remove_stream(&self, stream: &Arc<dyn EngineStream>) -> EngineResult<()> {
        lock(&self.streams).retain(|s| !rtcbridge_core::engine::same_object(s, stream));
        self.emit(ConnectionEvent::RenegotiationNeeded);
        Ok(())
    }

    fn create_data_channel(
        &self,
        label: &str,
        init: &DataChannelInit,
    ) -> EngineResult<Arc<dyn EngineDataChannel>> {
        let channel = Arc::new(LoopbackDataChannel::new(label, init.id, Some(self.events.clone())));
        channel.bind_self();
        lock(&self.data_channels).push(channel.clone());
        Ok(channel)
    }

    fn add_track(
        &self,
        track: Arc<dyn EngineTrack>,
        stream_ids: &[String],
    ) -> EngineResult<Arc<dyn EngineSender>> {
        let kind = track.kind();
        let sender = Arc::new(LoopbackSender::new(self.next_id("sender"), Some(track.clone())));
        let receiver_track: Arc<dyn EngineTrack> =
            Arc::new(LoopbackTrack::new(&self.next_id("recv"), kind));
        let transceiver = Arc::new(LoopbackTransceiver::new(
            stream_ids.first().cloned(),
            TransceiverDirection::SendRecv,
            sender.clone(),
            Arc::new(LoopbackReceiver { id: self.next_id("receiver"), track: receiver_track }),
        ));
        lock(&self.transceivers).push(transceiver);
        self.emit(ConnectionEvent::RenegotiationNeeded);
        Ok(sender)
    }

    fn remove_track(&self, sender: &Arc<dyn EngineSender>) -> EngineResult<()> {
        let id = sender.id();
        let transceivers = lock(&self.transceivers);
        let transceiver = transceivers
            .iter()
            .find(|t| t.sender.id() == id)
            .ok_or_else(|| EngineError::new(format!("unknown sender {id}")))?;
        transceiver.sender.set_track(None)?;
        drop(transceivers);
        self.emit(ConnectionEvent::RenegotiationNeeded);
        Ok(())
    }

    fn add_transceiver(
        &self,
        source: TransceiverSource,
        init: &TransceiverInit,
    ) -> EngineResult<Arc<dyn EngineTransceiver>> {
        let (kind, track) = match source {
            TransceiverSource::Track(track) => (track.kind(), Some(track)),
            TransceiverSource::Kind(kind) => (kind, None),
        };
        let receiver_track: Arc<dyn EngineTrack> =
            Arc::new(LoopbackTrack::new(&self.next_id("recv"), kind));
        let transceiver = Arc::new(LoopbackTransceiver::new(
            Some(self.next_id("mid")),
            init.direction,
            Arc::new(LoopbackSender::new(self.next_id("sender"), track)),
            Arc::new(LoopbackReceiver { id: self.next_id("receiver"), track: receiver_track }),
        ));
        lock(&self.transceivers).push(transceiver.clone());
        self.emit(ConnectionEvent::RenegotiationNeeded);
        Ok(transceiver)
    }

    fn senders(&self) -> Vec<Arc<dyn EngineSender>> {
        lock(&self.transceivers).iter().map(|t| t.sender.clone() as Arc<dyn EngineSender>).collect()
    }

    fn receivers(&self) -> Vec<Arc<dyn EngineReceiver>> {
        lock(&self.transceivers)
            .iter()
            .map(|t| t.receiver.clone() as Arc<dyn EngineReceiver>)
            .collect()
    }

    fn transceivers(&self) -> Vec<Arc<dyn EngineTransceiver>> {
        lock(&self.transceivers).iter().map(|t| t.clone() as Arc<dyn EngineTransceiver>).collect()
    }
}

#[derive(Debug)]
pub struct LoopbackTrack {
    id: String,
    label: String,
    kind: MediaKind,
    ended: AtomicBool,
    enabled: AtomicBool,
    volume: Mutex<f64>,
    sinks: Mutex<Vec<Arc<dyn VideoSink>>>,
    add_sink_calls: AtomicUsize,
    remove_sink_calls: AtomicUsize,
}

impl LoopbackTrack {
    pub fn new(id: &str, kind: MediaKind) -> Self {
        Self {
            id: id.to_string(),
            label: id.to_string(),
            kind,
            ended: AtomicBool::new(false),
            enabled: AtomicBool::new(true),
            volume: Mutex::new(1.0),
            sinks: Mutex::new(Vec::new()),
            add_sink_calls: AtomicUsize::new(0),
            remove_sink_calls: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn with_label(mut self, label: String) -> Self {
        self.label = label;
        self
    }

    /// Marks the track ended, as when its source goes away.
    pub fn end(&self) {
        self.ended.store(true, Ordering::SeqCst);
    }

    /// Delivers a frame to every attached sink.
    pub fn push_frame(&self, frame: VideoFrame) {
        let sinks = lock(&self.sinks).clone();
        for sink in sinks {
            sink.on_frame(frame);
        }
    }

    pub fn sink_count(&self) -> usize {
        lock(&self.sinks).len()
    }

    pub fn add_sink_calls(&self) -> usize {
        self.add_sink_calls.load(Ordering::SeqCst)
    }

    pub fn remove_sink_calls(&self) -> usize {
        self.remove_sink_calls.load(Ordering::SeqCst)
    }

    pub fn volume(&self) -> f64 {
        *lock(&self.volume)
    }
}

impl EngineTrack for LoopbackTrack {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn label(&self) -> String {
        self.label.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn state(&self) -> TrackState {
        if self.ended.load(Ordering::SeqCst) {
            TrackState::Ended
        } else {
            TrackState::Live
        }
    }

    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn add_sink(&self, sink: Arc<dyn VideoSink>) {
        self.add_sink_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.sinks).push(sink);
    }

    fn remove_sink(&self, sink: &Arc<dyn VideoSink>) {
        self.remove_sink_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.sinks).retain(|s| !rtcbridge_core::engine::same_object(s, sink));
    }

    fn set_volume(&self, volume: f64) -> EngineResult<()> {
        if self.kind != MediaKind::Audio {
            return Err(EngineError::new("volume applies to audio tracks only"));
        }
        *lock(&self.volume) = volume;
        Ok(())
    }
}

#[derive(Debug)]
pub struct LoopbackStream {
    id: String,
    audio: Mutex<Vec<Arc<dyn EngineTrack>>>,
    video: Mutex<Vec<Arc<dyn EngineTrack>>>,
}

impl LoopbackStream {
    pub fn new(id: &str) -> Self {
        Self { id: id.to_string(), audio: Mutex::new(Vec::new()), video: Mutex::new(Vec::new()) }
    }

    fn list(&self, kind: MediaKind) -> &Mutex<Vec<Arc<dyn EngineTrack>>> {
        match kind {
            MediaKind::Audio => &self.audio,
            MediaKind::Video => &self.video,
        }
    }
}

impl EngineStream for LoopbackStream {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn audio_tracks(&self) -> Vec<Arc<dyn EngineTrack>> {
        lock(&self.audio).clone()
    }

    fn video_tracks(&self) -> Vec<Arc<dyn EngineTrack>> {
        lock(&self.video).clone()
    }

    fn add_track(&self, track: Arc<dyn EngineTrack>) -> EngineResult<()> {
        let mut tracks = lock(self.list(track.kind()));
        if !tracks.iter().any(|t| rtcbridge_core::engine::same_object(t, &track)) {
            tracks.push(track);
        }
        Ok(())
    }

    fn remove_track(&self, track: &Arc<dyn EngineTrack>) -> EngineResult<()> {
        lock(self.list(track.kind())).retain(|t| !rtcbridge_core::engine::same_object(t, track));
        Ok(())
    }
}

#[derive(Debug)]
pub struct LoopbackCapturer {
    track: Arc<LoopbackTrack>,
    stops: AtomicUsize,
}

impl LoopbackCapturer {
    fn feeding(track: Arc<LoopbackTrack>) -> Self {
        Self { track, stops: AtomicUsize::new(0) }
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Engine id of the track this capturer feeds.
    pub fn track_id(&self) -> &str {
        &self.track.id
    }
}

impl Capturer for LoopbackCapturer {
    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.track.end();
    }
}

#[derive(Debug)]
pub struct LoopbackDataChannel {
    wire_id: Option<u16>,
    label: String,
    state: Mutex<DataChannelState>,
    sent: Mutex<Vec<DataChannelMessage>>,
    events: Option<ConnectionEventSender>,
    this: Mutex<Option<std::sync::Weak<Self>>>,
}

impl LoopbackDataChannel {
    pub fn new(label: &str, wire_id: Option<u16>, events: Option<ConnectionEventSender>) -> Self {
        Self {
            wire_id,
            label: label.to_string(),
            state: Mutex::new(DataChannelState::Connecting),
            sent: Mutex::new(Vec::new()),
            events,
            this: Mutex::new(None),
        }
    }

    fn self_arc(&self) -> Option<Arc<dyn EngineDataChannel>> {
        let weak = lock(&self.this).clone()?;
        weak.upgrade().map(|arc| arc as Arc<dyn EngineDataChannel>)
    }

    /// Lets the channel report callbacks about itself. Call once after
    /// wrapping it in an `Arc`.
    pub fn bind_self(self: &Arc<Self>) {
        *lock(&self.this) = Some(Arc::downgrade(self));
    }

    /// Changes state and reports it through the connection's callbacks.
    pub fn set_state(&self, state: DataChannelState) {
        let changed = {
            let mut current = lock(&self.state);
            let changed = *current != state;
            *current = state;
            changed
        };
        if changed {
            if let (Some(events), Some(channel)) = (&self.events, self.self_arc()) {
                let _ = events.send(ConnectionEvent::DataChannelState { channel, state });
            }
        }
    }

    /// Simulates an inbound message from the remote peer.
    pub fn receive(&self, message: DataChannelMessage) {
        if let (Some(events), Some(channel)) = (&self.events, self.self_arc()) {
            let _ = events.send(ConnectionEvent::DataChannelMessage { channel, message });
        }
    }

    pub fn sent(&self) -> Vec<DataChannelMessage> {
        lock(&self.sent).clone()
    }
}

impl EngineDataChannel for LoopbackDataChannel {
    fn id(&self) -> Option<u16> {
        self.wire_id
    }

    fn label(&self) -> String {
        self.label.clone()
    }

    fn state(&self) -> DataChannelState {
        *lock(&self.state)
    }

    fn send(&self, message: DataChannelMessage) -> EngineResult<()> {
        if self.state() == DataChannelState::Closed {
            return Err(EngineError::new("data channel is closed"));
        }
        lock(&self.sent).push(message);
        Ok(())
    }

    fn close(&self) {
        self.set_state(DataChannelState::Closing);
        self.set_state(DataChannelState::Closed);
    }
}

#[derive(Debug)]
pub struct LoopbackSender {
    id: String,
    track: Mutex<Option<Arc<dyn EngineTrack>>>,
    parameters: Mutex<RtpParameters>,
}

impl LoopbackSender {
    fn new(id: String, track: Option<Arc<dyn EngineTrack>>) -> Self {
        let parameters = RtpParameters { encodings: vec![RtpEncoding::default()] };
        Self { id, track: Mutex::new(track), parameters: Mutex::new(parameters) }
    }
}

impl EngineSender for LoopbackSender {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn track(&self) -> Option<Arc<dyn EngineTrack>> {
        lock(&self.track).clone()
    }

    fn set_track(&self, track: Option<Arc<dyn EngineTrack>>) -> EngineResult<()> {
        *lock(&self.track) = track;
        Ok(())
    }

    fn parameters(&self) -> RtpParameters {
        lock(&self.parameters).clone()
    }

    fn set_parameters(&self, parameters: RtpParameters) -> EngineResult<()> {
        let upscales = |e: &RtpEncoding| e.scale_resolution_down_by.is_some_and(|s| s < 1.0);
        if parameters.encodings.iter().any(upscales) {
            return Err(EngineError::new("scaleResolutionDownBy must be at least 1"));
        }
        *lock(&self.parameters) = parameters;
        Ok(())
    }
}

#[derive(Debug)]
pub struct LoopbackReceiver {
    id: String,
    track: Arc<dyn EngineTrack>,
}

impl EngineReceiver for LoopbackReceiver {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn track(&self) -> Arc<dyn EngineTrack> {
        self.track.clone()
    }
}

#[derive(Debug)]
pub struct LoopbackTransceiver {
    mid: Option<String>,
    direction: Mutex<TransceiverDirection>,
    sender: Arc<LoopbackSender>,
    receiver: Arc<LoopbackReceiver>,
}

impl LoopbackTransceiver {
    fn new(
        mid: Option<String>,
        direction: TransceiverDirection,
        sender: Arc<LoopbackSender>,
        receiver: Arc<LoopbackReceiver>,
    ) -> Self {
        Self { mid, direction: Mutex::new(direction), sender, receiver }
    }
}

impl EngineTransceiver for LoopbackTransceiver {
    fn mid(&self) -> Option<String> {
        self.mid.clone()
    }

    fn direction(&self) -> TransceiverDirection {
        *lock(&self.direction)
    }

    fn set_direction(&self, direction: TransceiverDirection) -> EngineResult<()> {
        let mut current = lock(&self.direction);
        if *current == TransceiverDirection::Stopped {
            return Err(EngineError::new("transceiver is stopped"));
        }
        *current = direction;
        Ok(())
    }

    fn stop(&self) -> EngineResult<()> {
        *lock(&self.direction) = TransceiverDirection::Stopped;
        self.sender.set_track(None)
    }

    fn sender(&self) -> Arc<dyn EngineSender> {
        self.sender.clone()
    }

    fn receiver(&self) -> Arc<dyn EngineReceiver> {
        self.receiver.clone()
    }
}

#[derive(Debug)]
pub struct LoopbackKeyProvider {
    options: KeyProviderOptions,
    shared: Mutex<HashMap<i64, Bytes>>,
    keys: Mutex<HashMap<(String, i64), Bytes>>,
}

impl LoopbackKeyProvider {
    fn new(options: KeyProviderOptions) -> Self {
        Self { options, shared: Mutex::new(HashMap::new()), keys: Mutex::new(HashMap::new()) }
    }
}

impl EngineKeyProvider for LoopbackKeyProvider {
    fn set_shared_key(&self, index: i64, key: Bytes) -> EngineResult<()> {
        if !self.options.shared_key {
            return Err(EngineError::new("key provider was created without shared keys"));
        }
        lock(&self.shared).insert(index, key);
        Ok(())
    }

    fn set_key(&self, participant_id: &str, index: i64, key: Bytes) -> EngineResult<()> {
        lock(&self.keys).insert((participant_id.to_string(), index), key);
        Ok(())
    }

    fn ratchet_key(&self, participant_id: &str, index: i64) -> EngineResult<Bytes> {
        let mut keys = lock(&self.keys);
        let key = keys
            .get(&(participant_id.to_string(), index))
            .cloned()
            .or_else(|| lock(&self.shared).get(&index).cloned())
            .ok_or_else(|| EngineError::new(format!("no key {index} for {participant_id}")))?;
        let ratcheted: Bytes = key.iter().map(|b| b.wrapping_add(1)).collect::<Vec<u8>>().into();
        keys.insert((participant_id.to_string(), index), ratcheted.clone());
        Ok(ratcheted)
    }
}

#[derive(Debug)]
pub struct LoopbackFrameCryptor {
    participant_id: String,
    enabled: AtomicBool,
    key_index: AtomicI64,
    events: CryptorEventSender,
    disposed: AtomicBool,
}

impl LoopbackFrameCryptor {
    fn new(participant_id: &str, events: CryptorEventSender) -> Self {
        Self {
            participant_id: participant_id.to_string(),
            enabled: AtomicBool::new(false),
            key_index: AtomicI64::new(0),
            events,
            disposed: AtomicBool::new(false),
        }
    }

    /// Reports a state change as the engine would.
    pub fn report(&self, state: FrameCryptionState) {
        let _ = self
            .events
            .send(CryptorStateChange { participant_id: self.participant_id.clone(), state });
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl EngineFrameCryptor for LoopbackFrameCryptor {
    fn participant_id(&self) -> String {
        self.participant_id.clone()
    }

    fn set_enabled(&self, enabled: bool) -> bool {
        self.enabled.store(enabled, Ordering::SeqCst);
        if enabled {
            self.report(FrameCryptionState::Ok);
        }
        true
    }

    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_key_index(&self, index: i64) -> bool {
        if index < 0 {
            return false;
        }
        self.key_index.store(index, Ordering::SeqCst);
        true
    }

    fn key_index(&self) -> i64 {
        self.key_index.load(Ordering::SeqCst)
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }
}
