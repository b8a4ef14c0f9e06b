// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::collections::HashSet;

use common::{bridge, capture, event_name, field, first_track, open_session, settle, Events};
use rtcbridge_core::engine::{ConnectionEvent, IceCandidate};
use rtcbridge_core::state::MediaKind;
use rtcbridge_core::{vmap, EventStream, Handle};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_allocations_never_share_a_handle() {
    let (bridge, _engine) = bridge();
    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..32 {
        let bridge = bridge.clone();
        tasks.spawn(async move {
            if i % 2 == 0 {
                let created = bridge.dispatch("createPeerConnection", &vmap! {}).await.unwrap();
                vec![field(&created, "peerConnectionId")]
            } else {
                let media = capture(&bridge, true, true).await;
                vec![
                    field(&media, "streamId"),
                    first_track(&media, "audioTracks"),
                    first_track(&media, "videoTracks"),
                ]
            }
        });
    }

    let mut seen = HashSet::new();
    while let Some(handles) = tasks.join_next().await {
        for handle in handles.unwrap() {
            assert!(seen.insert(handle.clone()), "handle {handle} issued twice");
        }
    }
    assert_eq!(seen.len(), 16 + 16 * 3);
    let snapshot = bridge.snapshot();
    assert_eq!((snapshot.sessions, snapshot.local_streams, snapshot.local_tracks), (16, 16, 32));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dispose_racing_a_close_still_cascades() {
    let (bridge, engine) = bridge();
    let (session, connection) = open_session(&bridge, &engine).await;
    connection.announce_remote_stream("remote1", &[MediaKind::Video]);
    settle(&bridge, &session).await;
    let remote = connection.remote_track("remote1-video-0").unwrap();

    let texture = bridge
        .dispatch("createVideoRenderer", &vmap! {})
        .await
        .unwrap()
        .require_int("textureId")
        .unwrap();
    let bind = vmap! { "textureId" => texture, "streamId" => "remote1", "ownerTag" => &session };
    bridge.dispatch("videoRendererSetSrcObject", &bind).await.unwrap();
    bridge
        .dispatch(
            "createDataChannel",
            &vmap! { "peerConnectionId" => &session, "label" => "chat" },
        )
        .await
        .unwrap();
    assert_eq!(remote.sink_count(), 1);

    let args = vmap! { "peerConnectionId" => &session };
    let (closed, disposed) = tokio::join!(
        bridge.dispatch("peerConnectionClose", &args),
        bridge.dispatch("peerConnectionDispose", &args),
    );
    closed.unwrap();
    disposed.unwrap();

    assert_eq!(remote.sink_count(), 0);
    let snapshot = bridge.snapshot();
    assert_eq!(snapshot.sessions, 0);
    assert_eq!(snapshot.remote_streams, 0);
    assert_eq!(snapshot.remote_tracks, 0);
    assert_eq!(snapshot.data_channels, 0);
    assert_eq!(snapshot.renderers, 1);
}

fn candidate(n: usize) -> ConnectionEvent {
    ConnectionEvent::IceCandidate(IceCandidate {
        candidate: format!("candidate:{n}"),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn callbacks_from_engine_threads_keep_their_order() {
    const PER_SESSION: usize = 200;
    let (bridge, engine) = bridge();
    let mut sessions: Vec<(Handle, Events)> = Vec::new();
    let mut threads = Vec::new();
    for _ in 0..3 {
        let (session, connection) = open_session(&bridge, &engine).await;
        let events = Events::subscribe(&bridge, EventStream::Session(session.clone()));
        sessions.push((session, events));
        threads.push(std::thread::spawn(move || {
            for n in 0..PER_SESSION {
                connection.emit(candidate(n));
            }
        }));
    }
    for thread in threads {
        thread.join().unwrap();
    }

    for (session, events) in &mut sessions {
        settle(&bridge, session).await;
        let received: Vec<String> = events
            .drain()
            .iter()
            .filter(|e| event_name(e) == "onCandidate")
            .map(|e| field(e.get("candidate").unwrap(), "candidate"))
            .collect();
        let expected: Vec<String> = (0..PER_SESSION).map(|n| format!("candidate:{n}")).collect();
        assert_eq!(received, expected, "session {session} reordered its callbacks");
    }
}
