// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use bytes::Bytes;
use common::{assert_kind, bridge, capture, event_name, field, first_track, open_session, Events};
use rtcbridge_core::state::FrameCryptionState;
use rtcbridge_core::{vmap, ErrorKind, EventStream, Handle};
use rtcbridge_session::Bridge;

async fn key_provider(bridge: &Bridge, shared_key: bool) -> String {
    let options = vmap! {
        "sharedKey" => shared_key,
        "ratchetSalt" => "c2FsdA==",
        "ratchetWindowSize" => 8,
        "failureTolerance" => -1,
    };
    let args = vmap! { "keyProviderOptions" => options };
    let created =
        bridge.dispatch("frameCryptorFactoryCreateKeyProvider", &args).await.unwrap();
    field(&created, "keyProviderId")
}

#[tokio::test]
async fn shared_keys_ratchet_per_participant() {
    let (bridge, _) = bridge();
    let provider = key_provider(&bridge, true).await;

    let set = vmap! {
        "keyProviderId" => provider.as_str(),
        "index" => 0,
        "key" => Bytes::from_static(&[1, 2, 3]),
    };
    let result = bridge.dispatch("keyProviderSetSharedKey", &set).await.unwrap();
    assert!(result.require_bool("result").unwrap());

    let ratchet = vmap! {
        "keyProviderId" => provider.as_str(),
        "participantId" => "alice",
        "index" => 0,
    };
    let first = bridge.dispatch("keyProviderRatchetKey", &ratchet).await.unwrap();
    assert_eq!(first.require_bytes("result").unwrap().as_ref(), [2, 3, 4]);
    let second = bridge.dispatch("keyProviderRatchetKey", &ratchet).await.unwrap();
    assert_eq!(second.require_bytes("result").unwrap().as_ref(), [3, 4, 5]);

    // Per-participant keys may arrive as base64.
    let per_participant = vmap! {
        "keyProviderId" => provider.as_str(),
        "participantId" => "bob",
        "index" => 1,
        "key" => "CgsM",
    };
    bridge.dispatch("keyProviderSetKey", &per_participant).await.unwrap();
    let ratchet_bob = vmap! {
        "keyProviderId" => provider.as_str(),
        "participantId" => "bob",
        "index" => 1,
    };
    let bob = bridge.dispatch("keyProviderRatchetKey", &ratchet_bob).await.unwrap();
    assert_eq!(bob.require_bytes("result").unwrap().as_ref(), [11, 12, 13]);
}

#[tokio::test]
async fn shared_keys_need_a_shared_provider() {
    let (bridge, _) = bridge();
    let provider = key_provider(&bridge, false).await;
    let set = vmap! { "keyProviderId" => provider.as_str(), "index" => 0, "key" => "AQID" };
    assert_kind(
        bridge.dispatch("keyProviderSetSharedKey", &set).await,
        ErrorKind::EngineOperationFailed,
    );
}

#[tokio::test]
async fn key_provider_dispose_is_idempotent() {
    let (bridge, _) = bridge();
    let provider = key_provider(&bridge, true).await;
    let args = vmap! { "keyProviderId" => provider.as_str() };

    bridge.dispatch("keyProviderDispose", &args).await.unwrap();
    bridge.dispatch("keyProviderDispose", &args).await.unwrap();
    assert_eq!(bridge.snapshot().key_providers, 0);

    let set = vmap! { "keyProviderId" => provider.as_str(), "index" => 0, "key" => "AQID" };
    assert_kind(
        bridge.dispatch("keyProviderSetSharedKey", &set).await,
        ErrorKind::ResourceNotFound,
    );
}

#[tokio::test]
async fn cryptor_state_changes_reach_its_stream() {
    let (bridge, engine) = bridge();
    let (session, _) = open_session(&bridge, &engine).await;
    let media = capture(&bridge, true, false).await;
    let audio = first_track(&media, "audioTracks");
    let add = vmap! { "peerConnectionId" => &session, "trackId" => audio.as_str() };
    let sender = field(&bridge.dispatch("addTrack", &add).await.unwrap(), "senderId");
    let provider = key_provider(&bridge, true).await;

    let create = vmap! {
        "peerConnectionId" => &session,
        "participantId" => "alice",
        "algorithm" => 0,
        "keyProviderId" => provider.as_str(),
        "type" => "sender",
        "rtpSenderId" => sender.as_str(),
    };
    let created =
        bridge.dispatch("frameCryptorFactoryCreateFrameCryptor", &create).await.unwrap();
    let cryptor = field(&created, "frameCryptorId");
    let args = vmap! { "frameCryptorId" => cryptor.as_str() };

    let enable = vmap! { "frameCryptorId" => cryptor.as_str(), "enabled" => true };
    let result = bridge.dispatch("frameCryptorSetEnabled", &enable).await.unwrap();
    assert!(result.require_bool("result").unwrap());
    let state = bridge.dispatch("frameCryptorGetEnabled", &args).await.unwrap();
    assert!(state.require_bool("enabled").unwrap());

    // Reported before anyone listens, delivered once someone does.
    let stream = EventStream::FrameCryptor(Handle::from(cryptor.as_str()));
    let mut events = Events::subscribe(&bridge, stream);
    let changed = events.next().await;
    assert_eq!(event_name(&changed), "frameCryptionStateChanged");
    assert_eq!(field(&changed, "participantId"), "alice");
    assert_eq!(field(&changed, "state"), FrameCryptionState::Ok.as_str());

    engine.last_cryptor().unwrap().report(FrameCryptionState::MissingKey);
    assert_eq!(field(&events.next().await, "state"), FrameCryptionState::MissingKey.as_str());

    let index = vmap! { "frameCryptorId" => cryptor.as_str(), "keyIndex" => 2 };
    bridge.dispatch("frameCryptorSetKeyIndex", &index).await.unwrap();
    let current = bridge.dispatch("frameCryptorGetKeyIndex", &args).await.unwrap();
    assert_eq!(current.require_int("keyIndex").unwrap(), 2);
}

#[tokio::test]
async fn session_dispose_takes_its_cryptors() {
    let (bridge, engine) = bridge();
    let (session, _) = open_session(&bridge, &engine).await;
    let media = capture(&bridge, false, true).await;
    let video = first_track(&media, "videoTracks");
    let add = vmap! { "peerConnectionId" => &session, "trackId" => video.as_str() };
    let sender = field(&bridge.dispatch("addTrack", &add).await.unwrap(), "senderId");
    let provider = key_provider(&bridge, true).await;
    let create = vmap! {
        "peerConnectionId" => &session,
        "participantId" => "alice",
        "keyProviderId" => provider.as_str(),
        "type" => "sender",
        "rtpSenderId" => sender.as_str(),
    };
    let created =
        bridge.dispatch("frameCryptorFactoryCreateFrameCryptor", &create).await.unwrap();
    let args = vmap! { "frameCryptorId" => field(&created, "frameCryptorId") };

    bridge
        .dispatch("peerConnectionDispose", &vmap! { "peerConnectionId" => &session })
        .await
        .unwrap();
    assert!(engine.last_cryptor().unwrap().is_disposed());
    assert_eq!(bridge.snapshot().frame_cryptors, 0);

    assert_kind(
        bridge.dispatch("frameCryptorGetEnabled", &args).await,
        ErrorKind::ResourceNotFound,
    );
    bridge.dispatch("frameCryptorDispose", &args).await.unwrap();
}

#[tokio::test]
async fn cryptor_needs_a_known_target() {
    let (bridge, engine) = bridge();
    let (session, _) = open_session(&bridge, &engine).await;
    let provider = key_provider(&bridge, true).await;
    let create = |kind: &str, sender: &str| {
        vmap! {
            "peerConnectionId" => &session,
            "participantId" => "alice",
            "keyProviderId" => provider.as_str(),
            "type" => kind,
            "rtpSenderId" => sender,
        }
    };

    assert_kind(
        bridge.dispatch("frameCryptorFactoryCreateFrameCryptor", &create("mixer", "x")).await,
        ErrorKind::InvalidArgument,
    );
    assert_kind(
        bridge.dispatch("frameCryptorFactoryCreateFrameCryptor", &create("sender", "x")).await,
        ErrorKind::ResourceNotFound,
    );
    assert_eq!(bridge.snapshot().frame_cryptors, 0);
}
