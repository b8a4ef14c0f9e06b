// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Command handlers, grouped by the entity they operate on.
//!
//! Handlers take the raw argument map and return the result map. Argument
//! errors surface as `InvalidArgument` naming the field; handle misses as
//! `ResourceNotFound` naming the kind and handle.

mod crypto;
mod data_channel;
mod media;
mod peer_connection;
mod render;
mod rtp;

use std::sync::Arc;

use base64::Engine as _;
use bytes::Bytes;
use rtcbridge_core::engine::{EngineConnection, EngineTrack};
use rtcbridge_core::{BridgeError, Handle, Result, TrackInfo, Value};

use crate::context::BridgeContext;

/// Every command name the dispatcher recognizes.
pub const COMMANDS: &[&str] = &[
    "createPeerConnection",
    "peerConnectionClose",
    "peerConnectionDispose",
    "getPeerConnectionState",
    "createOffer",
    "createAnswer",
    "setLocalDescription",
    "setRemoteDescription",
    "getLocalDescription",
    "getRemoteDescription",
    "addCandidate",
    "restartIce",
    "setConfiguration",
    "getStats",
    "addStream",
    "removeStream",
    "addTrack",
    "removeTrack",
    "addTransceiver",
    "getSenders",
    "getReceivers",
    "getTransceivers",
    "rtpSenderReplaceTrack",
    "rtpSenderSetTrack",
    "rtpSenderSetParameters",
    "rtpSenderDispose",
    "rtpTransceiverSetDirection",
    "rtpTransceiverStop",
    "getUserMedia",
    "getDisplayMedia",
    "createLocalMediaStream",
    "mediaStreamGetTracks",
    "mediaStreamAddTrack",
    "mediaStreamRemoveTrack",
    "mediaStreamTrackSetEnable",
    "setVolume",
    "streamDispose",
    "trackDispose",
    "createDataChannel",
    "dataChannelSend",
    "dataChannelClose",
    "createVideoRenderer",
    "videoRendererSetSrcObject",
    "videoRendererDispose",
    "frameCryptorFactoryCreateKeyProvider",
    "keyProviderSetKey",
    "keyProviderSetSharedKey",
    "keyProviderRatchetKey",
    "keyProviderDispose",
    "frameCryptorFactoryCreateFrameCryptor",
    "frameCryptorSetKeyIndex",
    "frameCryptorGetKeyIndex",
    "frameCryptorSetEnabled",
    "frameCryptorGetEnabled",
    "frameCryptorDispose",
];

/// Runs one command against the registry and the engine.
pub async fn execute(ctx: &Arc<BridgeContext>, command: &str, args: &Value) -> Result<Value> {
    match command {
        "createPeerConnection" => peer_connection::create(ctx, args),
        "peerConnectionClose" => peer_connection::close(ctx, args).await,
        "peerConnectionDispose" => peer_connection::dispose(ctx, args).await,
        "getPeerConnectionState" => peer_connection::state(ctx, args),
        "createOffer" => peer_connection::create_offer(ctx, args).await,
        "createAnswer" => peer_connection::create_answer(ctx, args).await,
        "setLocalDescription" => peer_connection::set_local_description(ctx, args).await,
        "setRemoteDescription" => peer_connection::set_remote_description(ctx, args).await,
        "getLocalDescription" => peer_connection::local_description(ctx, args),
        "getRemoteDescription" => peer_connection::remote_description(ctx, args),
        "addCandidate" => peer_connection::add_candidate(ctx, args).await,
        "restartIce" => peer_connection::restart_ice(ctx, args),
        "setConfiguration" => peer_connection::set_configuration(ctx, args),
        "getStats" => peer_connection::stats(ctx, args).await,
        "addStream" => peer_connection::add_stream(ctx, args),
        "removeStream" => peer_connection::remove_stream(ctx, args),

        "addTrack" => rtp::add_track(ctx, args),
        "removeTrack" => rtp::remove_track(ctx, args),
        "addTransceiver" => rtp::add_transceiver(ctx, args),
        "getSenders" => rtp::senders(ctx, args),
        "getReceivers" => rtp::receivers(ctx, args),
        "getTransceivers" => rtp::transceivers(ctx, args),
        "rtpSenderReplaceTrack" | "rtpSenderSetTrack" => rtp::set_sender_track(ctx, args),
        "rtpSenderSetParameters" => rtp::set_sender_parameters(ctx, args),
        "rtpSenderDispose" => rtp::dispose_sender(ctx, args),
        "rtpTransceiverSetDirection" => rtp::set_direction(ctx, args),
        "rtpTransceiverStop" => rtp::stop_transceiver(ctx, args),

        "getUserMedia" => media::get_user_media(ctx, args).await,
        "getDisplayMedia" => media::get_display_media(ctx, args).await,
        "createLocalMediaStream" => media::create_stream(ctx),
        "mediaStreamGetTracks" => media::stream_tracks(ctx, args),
        "mediaStreamAddTrack" => media::stream_add_track(ctx, args),
        "mediaStreamRemoveTrack" => media::stream_remove_track(ctx, args),
        "mediaStreamTrackSetEnable" => media::set_enabled(ctx, args),
        "setVolume" => media::set_volume(ctx, args),
        "streamDispose" => media::dispose_stream(ctx, args),
        "trackDispose" => media::dispose_track(ctx, args),

        "createDataChannel" => data_channel::create(ctx, args),
        "dataChannelSend" => data_channel::send(ctx, args),
        "dataChannelClose" => data_channel::close(ctx, args).await,

        "createVideoRenderer" => render::create(ctx),
        "videoRendererSetSrcObject" => render::set_src_object(ctx, args),
        "videoRendererDispose" => render::dispose(ctx, args),

        "frameCryptorFactoryCreateKeyProvider" => crypto::create_key_provider(ctx, args),
        "keyProviderSetKey" => crypto::set_key(ctx, args),
        "keyProviderSetSharedKey" => crypto::set_shared_key(ctx, args),
        "keyProviderRatchetKey" => crypto::ratchet_key(ctx, args),
        "keyProviderDispose" => crypto::dispose_key_provider(ctx, args),
        "frameCryptorFactoryCreateFrameCryptor" => crypto::create_cryptor(ctx, args),
        "frameCryptorSetKeyIndex" => crypto::set_key_index(ctx, args),
        "frameCryptorGetKeyIndex" => crypto::key_index(ctx, args),
        "frameCryptorSetEnabled" => crypto::set_enabled(ctx, args),
        "frameCryptorGetEnabled" => crypto::enabled(ctx, args),
        "frameCryptorDispose" => crypto::dispose_cryptor(ctx, args),

        other => Err(BridgeError::NotImplemented(other.to_string())),
    }
}

/// The `peerConnectionId` argument.
pub fn session_arg(args: &Value) -> Result<Handle> {
    args.require_str("peerConnectionId").map(Handle::from)
}

/// Looks up the session named by `peerConnectionId` and clones its connection.
fn connection(ctx: &BridgeContext, args: &Value) -> Result<(Handle, Arc<dyn EngineConnection>)> {
    let session = session_arg(args)?;
    let connection = ctx.registry.lock().sessions.get(&session)?.connection.clone();
    Ok((session, connection))
}

/// Reads key material. Hosts without a native byte type send base64 text.
fn bytes_arg(args: &Value, field: &str) -> Result<Bytes> {
    match args.require(field)? {
        Value::Bytes(bytes) => Ok(bytes.clone()),
        Value::String(text) => base64::engine::general_purpose::STANDARD
            .decode(text)
            .map(Bytes::from)
            .map_err(|e| {
                BridgeError::invalid_argument(format!("field '{field}' is not base64: {e}"))
            }),
        other => Err(BridgeError::invalid_argument(format!(
            "field '{field}' must be bytes, got {}",
            other.kind()
        ))),
    }
}

fn local_track_info(handle: &Handle, track: &dyn EngineTrack) -> TrackInfo {
    TrackInfo::describe(handle.to_string(), track, false)
}

fn ok() -> Value {
    Value::Null
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackEngine;

    #[tokio::test]
    #[allow(clippy::unwrap_used)]
    async fn every_listed_command_is_routed() {
        let engine = LoopbackEngine::new();
        let ctx = Arc::new(BridgeContext::new(engine, crate::IdentityAllocator::default()));
        for command in COMMANDS {
            let err = execute(&ctx, command, &Value::map()).await.err();
            assert!(
                !matches!(err, Some(BridgeError::NotImplemented(_))),
                "{command} is not routed"
            );
        }
        let err = execute(&ctx, "startRecordToFile", &Value::map()).await.unwrap_err();
        assert_eq!(err.kind(), rtcbridge_core::ErrorKind::NotImplemented);
    }
}
