// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use common::{assert_kind, bridge, capture, field, open_session, settle, Events};
use rtcbridge_core::state::{MediaKind, SignalingState};
use rtcbridge_core::{vmap, ErrorKind, EventStream, FnListener, Handle, Value};
use rtcbridge_session::loopback::LoopbackEngine;
use rtcbridge_session::{Bridge, HandleSource, IdentityAllocator, RegistrySnapshot};

/// Replays queued candidates, then falls back to random handles.
struct Scripted(Mutex<VecDeque<&'static str>>);

impl Scripted {
    fn new(candidates: &[&'static str]) -> Arc<Self> {
        Arc::new(Self(Mutex::new(candidates.iter().copied().collect())))
    }
}

impl HandleSource for Scripted {
    fn next_candidate(&self) -> Handle {
        self.0.lock().unwrap().pop_front().map_or_else(Handle::random, Handle::from)
    }
}

#[tokio::test]
async fn handles_are_unique_across_kinds() {
    let (bridge, engine) = bridge();
    let mut seen = HashSet::new();

    for _ in 0..16 {
        let (session, _) = open_session(&bridge, &engine).await;
        assert!(seen.insert(session.to_string()));
    }
    for _ in 0..8 {
        let created = bridge.dispatch("createLocalMediaStream", &vmap! {}).await.unwrap();
        assert!(seen.insert(field(&created, "streamId")));
    }
    for _ in 0..4 {
        let created =
            bridge.dispatch("frameCryptorFactoryCreateKeyProvider", &vmap! {}).await.unwrap();
        assert!(seen.insert(field(&created, "keyProviderId")));
    }
    assert_eq!(seen.len(), 28);
}

#[tokio::test]
async fn colliding_and_retired_candidates_are_rerolled() {
    common::init_tracing();
    let engine = LoopbackEngine::new();
    let source = Scripted::new(&["first", "first", "second"]);
    let bridge = Bridge::with_allocator(engine.clone(), IdentityAllocator::new(source.clone()));

    let (a, _) = open_session(&bridge, &engine).await;
    let (b, _) = open_session(&bridge, &engine).await;
    assert_eq!(a.as_str(), "first");
    assert_eq!(b.as_str(), "second");

    bridge.dispatch("peerConnectionDispose", &vmap! { "peerConnectionId" => &a }).await.unwrap();
    source.0.lock().unwrap().extend(["first", "third"]);
    let (c, _) = open_session(&bridge, &engine).await;
    assert_eq!(c.as_str(), "third", "a disposed handle must not be reissued");
}

#[tokio::test]
async fn dispose_is_idempotent_and_unknown_handles_are_not_found() {
    let (bridge, engine) = bridge();
    let (session, connection) = open_session(&bridge, &engine).await;
    let args = vmap! { "peerConnectionId" => &session };

    bridge.dispatch("peerConnectionDispose", &args).await.unwrap();
    bridge.dispatch("peerConnectionDispose", &args).await.unwrap();
    assert_eq!(connection.close_calls(), 1);
    assert_eq!(connection.dispose_calls(), 1);

    let err = assert_kind(
        bridge.dispatch("getPeerConnectionState", &args).await,
        ErrorKind::ResourceNotFound,
    );
    assert_eq!(err.handle(), Some(session.as_str()));

    let never = vmap! { "peerConnectionId" => "never-issued" };
    assert_kind(
        bridge.dispatch("peerConnectionDispose", &never).await,
        ErrorKind::ResourceNotFound,
    );
}

#[tokio::test]
async fn unknown_commands_are_not_implemented() {
    let (bridge, _) = bridge();
    assert_kind(bridge.dispatch("startRecordToFile", &vmap! {}).await, ErrorKind::NotImplemented);
    assert!(Bridge::commands().contains(&"createPeerConnection"));
}

#[tokio::test]
async fn reply_follows_the_events_it_caused() {
    let (bridge, engine) = bridge();
    let (session, _) = open_session(&bridge, &engine).await;
    let mut events = Events::subscribe(&bridge, EventStream::Session(session.clone()));

    let offer = bridge
        .dispatch("createOffer", &vmap! { "peerConnectionId" => &session })
        .await
        .unwrap();
    bridge
        .dispatch(
            "setLocalDescription",
            &vmap! { "peerConnectionId" => &session, "description" => offer },
        )
        .await
        .unwrap();

    // Every callback raised by the engine is already with the listener.
    let delivered = events.drain();
    let names: Vec<&str> = delivered.iter().map(common::event_name).collect();
    assert_eq!(names, ["signalingState", "iceGatheringState", "onCandidate", "iceGatheringState"]);
    assert_eq!(field(&delivered[0], "state"), SignalingState::HaveLocalOffer.as_str());
}

#[tokio::test]
async fn events_are_buffered_until_a_listener_attaches() {
    let (bridge, engine) = bridge();
    let (session, _) = open_session(&bridge, &engine).await;

    bridge.dispatch("restartIce", &vmap! { "peerConnectionId" => &session }).await.unwrap();
    bridge.dispatch("restartIce", &vmap! { "peerConnectionId" => &session }).await.unwrap();

    let mut events = Events::subscribe(&bridge, EventStream::Session(session.clone()));
    assert_eq!(events.next().await.require_str("event").unwrap(), "onRenegotiationNeeded");
    assert_eq!(events.next().await.require_str("event").unwrap(), "onRenegotiationNeeded");

    bridge.unsubscribe(&EventStream::Session(session.clone())).unwrap();
    let err = bridge
        .subscribe(&EventStream::Session(Handle::from("nope")), FnListener(|_: Value| {}))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceNotFound);
}

#[tokio::test]
async fn audio_routing_runs_while_any_session_lives() {
    let (bridge, engine) = bridge();
    let (a, _) = open_session(&bridge, &engine).await;
    let (b, _) = open_session(&bridge, &engine).await;
    assert_eq!(engine.audio().starts(), 1);

    bridge.dispatch("peerConnectionDispose", &vmap! { "peerConnectionId" => &a }).await.unwrap();
    assert_eq!(engine.audio().stops(), 0);
    bridge.dispatch("peerConnectionDispose", &vmap! { "peerConnectionId" => &b }).await.unwrap();
    assert_eq!(engine.audio().stops(), 1);

    let _ = open_session(&bridge, &engine).await;
    assert_eq!(engine.audio().starts(), 2);
}

#[tokio::test]
async fn close_clears_discoveries_even_when_the_engine_fails() {
    let (bridge, engine) = bridge();
    let (session, connection) = open_session(&bridge, &engine).await;
    let args = vmap! { "peerConnectionId" => &session };

    connection.announce_remote_stream("remote", &[MediaKind::Audio, MediaKind::Video]);
    connection.announce_remote_data_channel("chat", Some(1));
    settle(&bridge, &session).await;
    let before = bridge.snapshot();
    assert_eq!((before.remote_streams, before.remote_tracks, before.data_channels), (1, 2, 1));

    connection.set_fail_close(true);
    assert_kind(
        bridge.dispatch("peerConnectionClose", &args).await,
        ErrorKind::EngineOperationFailed,
    );

    let after = bridge.snapshot();
    assert_eq!(after.sessions, 1, "close keeps the session handle");
    assert_eq!((after.remote_streams, after.remote_tracks, after.data_channels), (0, 0, 0));

    // Closed sessions ignore late discoveries and a second close is a no-op.
    connection.announce_remote_stream("late", &[MediaKind::Video]);
    bridge.dispatch("peerConnectionClose", &args).await.unwrap();
    assert_eq!(bridge.snapshot().remote_streams, 0);
    assert_eq!(connection.close_calls(), 1);

    bridge.dispatch("peerConnectionDispose", &args).await.unwrap();
    assert_eq!(bridge.snapshot().sessions, 0);
}

#[tokio::test]
async fn dispose_removes_the_session_when_the_engine_fails() {
    let (bridge, engine) = bridge();
    let (session, connection) = open_session(&bridge, &engine).await;
    let args = vmap! { "peerConnectionId" => &session };

    connection.set_fail_close(true);
    assert_kind(
        bridge.dispatch("peerConnectionDispose", &args).await,
        ErrorKind::EngineOperationFailed,
    );
    assert_eq!(bridge.snapshot().sessions, 0);
    assert_eq!(connection.dispose_calls(), 1);
    bridge.dispatch("peerConnectionDispose", &args).await.unwrap();
}

#[tokio::test]
async fn closed_sessions_reject_new_data_channels() {
    let (bridge, engine) = bridge();
    let (session, _) = open_session(&bridge, &engine).await;
    let args = vmap! { "peerConnectionId" => &session };
    bridge.dispatch("peerConnectionClose", &args).await.unwrap();

    let state = bridge.dispatch("getPeerConnectionState", &args).await.unwrap();
    assert!(state.require_bool("closed").unwrap());

    assert_kind(
        bridge
            .dispatch(
                "createDataChannel",
                &vmap! { "peerConnectionId" => &session, "label" => "late" },
            )
            .await,
        ErrorKind::InvalidArgument,
    );
}

#[tokio::test]
async fn shutdown_releases_every_entity() {
    let (bridge, engine) = bridge();
    let (session, connection) = open_session(&bridge, &engine).await;
    let media = capture(&bridge, true, true).await;
    let audio = common::first_track(&media, "audioTracks");
    let add = vmap! { "peerConnectionId" => &session, "trackId" => audio.as_str() };
    bridge.dispatch("addTrack", &add).await.unwrap();
    connection.announce_remote_stream("remote", &[MediaKind::Video]);
    settle(&bridge, &session).await;
    bridge.dispatch("createVideoRenderer", &vmap! {}).await.unwrap();
    bridge.dispatch("frameCryptorFactoryCreateKeyProvider", &vmap! {}).await.unwrap();

    bridge.shutdown().await;

    assert_eq!(bridge.snapshot(), RegistrySnapshot::default());
    assert_eq!(connection.dispose_calls(), 1);
    assert_eq!(engine.capturers()[0].stops(), 1);
    assert_eq!(engine.audio().stops(), 1);
}
