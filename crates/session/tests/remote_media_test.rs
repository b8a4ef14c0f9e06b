// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;

use common::{assert_kind, bridge, event_name, field, open_session, settle, Events};
use rtcbridge_core::engine::{
    ConnectionEvent, EngineStream, EngineTrack, EngineTransceiver, VideoFrame,
};
use rtcbridge_core::state::MediaKind;
use rtcbridge_core::{vmap, ErrorKind, EventStream, FnListener, Handle, Result, Value};
use rtcbridge_session::loopback::LoopbackStream;
use rtcbridge_session::Bridge;
use tokio::sync::mpsc;

fn added_stream(events: &mut Events) -> Value {
    events.drain().into_iter().find(|e| event_name(e) == "onAddStream").unwrap()
}

async fn create_renderer(bridge: &Bridge) -> i64 {
    let created = bridge.dispatch("createVideoRenderer", &vmap! {}).await.unwrap();
    created.require_int("textureId").unwrap()
}

async fn show(bridge: &Bridge, texture: i64, session: &Handle, stream: &str) -> Result<Value> {
    let args = vmap! { "textureId" => texture, "streamId" => stream, "ownerTag" => session };
    bridge.dispatch("videoRendererSetSrcObject", &args).await
}

#[tokio::test]
async fn default_stream_ids_get_distinct_handles() {
    let (bridge, engine) = bridge();
    let (a, conn_a) = open_session(&bridge, &engine).await;
    let (b, conn_b) = open_session(&bridge, &engine).await;
    let mut events_a = Events::subscribe(&bridge, EventStream::Session(a.clone()));
    let mut events_b = Events::subscribe(&bridge, EventStream::Session(b.clone()));

    conn_a.announce_remote_stream("default", &[MediaKind::Audio]);
    conn_b.announce_remote_stream("default", &[MediaKind::Audio]);
    settle(&bridge, &a).await;
    settle(&bridge, &b).await;

    let added_a = added_stream(&mut events_a);
    let added_b = added_stream(&mut events_b);
    let (stream_a, stream_b) = (field(&added_a, "streamId"), field(&added_b, "streamId"));
    assert_ne!(stream_a, "default");
    assert_ne!(stream_b, "default");
    assert_ne!(stream_a, stream_b);
    assert_eq!(field(&added_a, "ownerTag"), a.as_str());

    let track = |added: &Value| common::first_track(added, "audioTracks");
    assert_ne!(track(&added_a), track(&added_b));
    assert_eq!(bridge.snapshot().remote_streams, 2);
    assert_eq!(bridge.snapshot().remote_tracks, 2);
}

#[tokio::test]
async fn removed_stream_is_gone_before_the_host_hears_of_it() {
    let (bridge, engine) = bridge();
    let (session, connection) = open_session(&bridge, &engine).await;
    let stream: Arc<dyn EngineStream> =
        connection.announce_remote_stream("remote", &[MediaKind::Audio, MediaKind::Video]);
    settle(&bridge, &session).await;

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let observer = bridge.clone();
    bridge
        .subscribe(
            &EventStream::Session(session.clone()),
            FnListener(move |event: Value| {
                if event_name(&event) == "onRemoveStream" {
                    let _ = seen_tx.send(observer.snapshot());
                }
            }),
        )
        .unwrap();

    connection.emit(ConnectionEvent::RemoveStream(stream));
    settle(&bridge, &session).await;

    let at_event = seen_rx.recv().await.unwrap();
    assert_eq!((at_event.remote_streams, at_event.remote_tracks), (0, 0));
    assert_kind(
        bridge.dispatch("mediaStreamGetTracks", &vmap! { "streamId" => "remote" }).await,
        ErrorKind::ResourceNotFound,
    );
}

#[tokio::test]
async fn transceiver_tracks_are_announced_with_their_streams() {
    let (bridge, engine) = bridge();
    let (session, connection) = open_session(&bridge, &engine).await;
    let mut events = Events::subscribe(&bridge, EventStream::Session(session.clone()));

    let stream: Arc<dyn EngineStream> = Arc::new(LoopbackStream::new("unified"));
    let transceiver =
        connection.announce_remote_transceiver(vec![stream], "unified-audio", MediaKind::Audio);
    settle(&bridge, &session).await;

    let event = events.drain().into_iter().find(|e| event_name(e) == "onTrack").unwrap();
    assert_eq!(field(event.get("track").unwrap(), "id"), "unified-audio");
    let streams = event.get("streams").unwrap().as_list().unwrap();
    assert_eq!(field(&streams[0], "streamId"), "unified");
    assert_eq!(field(&event, "transceiverMid"), transceiver.mid().unwrap());

    let receivers = bridge
        .dispatch("getReceivers", &vmap! { "peerConnectionId" => &session })
        .await
        .unwrap();
    let receivers = receivers.get("receivers").unwrap().as_list().unwrap().to_vec();
    assert!(receivers.iter().any(|r| field(r.get("track").unwrap(), "id") == "unified-audio"));
}

#[tokio::test]
async fn renderer_moves_between_tracks_exactly_once() {
    let (bridge, engine) = bridge();
    let (session, connection) = open_session(&bridge, &engine).await;
    connection.announce_remote_stream("cam", &[MediaKind::Video]);
    connection.announce_remote_stream("screen", &[MediaKind::Video]);
    settle(&bridge, &session).await;
    let cam = connection.remote_track("cam-video-0").unwrap();
    let screen = connection.remote_track("screen-video-0").unwrap();
    let texture = create_renderer(&bridge).await;

    show(&bridge, texture, &session, "cam").await.unwrap();
    show(&bridge, texture, &session, "cam").await.unwrap();
    assert_eq!((cam.add_sink_calls(), cam.remove_sink_calls()), (1, 0));
    assert_eq!(cam.sink_count(), 1);

    show(&bridge, texture, &session, "screen").await.unwrap();
    assert_eq!((cam.remove_sink_calls(), cam.sink_count()), (1, 0));
    assert_eq!((screen.add_sink_calls(), screen.sink_count()), (1, 1));

    let mut frames = Events::subscribe(&bridge, EventStream::Renderer(texture));
    screen.push_frame(VideoFrame { width: 640, height: 480, rotation: 0 });
    assert_eq!(event_name(&frames.next().await), "didFirstFrameRendered");
    let resized = frames.next().await;
    assert_eq!(event_name(&resized), "didTextureChangeVideoSize");
    assert_eq!(resized.require_int("width").unwrap(), 640);

    show(&bridge, texture, &session, "").await.unwrap();
    assert_eq!((screen.remove_sink_calls(), screen.sink_count()), (1, 0));
}

#[tokio::test]
async fn renderer_rejects_streams_without_a_matching_video_track() {
    let (bridge, engine) = bridge();
    let (session, connection) = open_session(&bridge, &engine).await;
    connection.announce_remote_stream("mic", &[MediaKind::Audio]);
    connection.announce_remote_stream("cam", &[MediaKind::Video]);
    settle(&bridge, &session).await;
    let texture = create_renderer(&bridge).await;

    assert!(show(&bridge, texture, &session, "mic").await.is_err());
    let wrong_track = vmap! {
        "textureId" => texture,
        "streamId" => "cam",
        "trackId" => "mic-audio-0",
        "ownerTag" => &session,
    };
    assert_kind(
        bridge.dispatch("videoRendererSetSrcObject", &wrong_track).await,
        ErrorKind::InvalidArgument,
    );
    assert_kind(
        bridge
            .dispatch(
                "videoRendererSetSrcObject",
                &vmap! { "textureId" => 999, "streamId" => "cam" },
            )
            .await,
        ErrorKind::ResourceNotFound,
    );
}

#[tokio::test]
async fn released_tracks_detach_their_renderers() {
    let (bridge, engine) = bridge();
    let (session, connection) = open_session(&bridge, &engine).await;
    let stream: Arc<dyn EngineStream> =
        connection.announce_remote_stream("cam", &[MediaKind::Video]);
    settle(&bridge, &session).await;
    let cam = connection.remote_track("cam-video-0").unwrap();
    let texture = create_renderer(&bridge).await;
    show(&bridge, texture, &session, "cam").await.unwrap();

    let track: Arc<dyn EngineTrack> = cam.clone();
    connection.emit(ConnectionEvent::RemoveTrack { stream: Some(stream), track });
    settle(&bridge, &session).await;
    assert_eq!(cam.sink_count(), 0);
    assert_eq!(bridge.snapshot().remote_tracks, 0);

    // Rebinding after a session dispose detaches again.
    connection.announce_remote_stream("cam2", &[MediaKind::Video]);
    settle(&bridge, &session).await;
    let cam2 = connection.remote_track("cam2-video-0").unwrap();
    show(&bridge, texture, &session, "cam2").await.unwrap();
    bridge
        .dispatch("peerConnectionDispose", &vmap! { "peerConnectionId" => &session })
        .await
        .unwrap();
    assert_eq!(cam2.sink_count(), 0);

    let dispose = vmap! { "textureId" => texture };
    bridge.dispatch("videoRendererDispose", &dispose).await.unwrap();
    bridge.dispatch("videoRendererDispose", &dispose).await.unwrap();
    assert_eq!(bridge.snapshot().renderers, 0);
}
