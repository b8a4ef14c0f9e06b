// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use bytes::Bytes;
use common::{assert_kind, bridge, event_name, field, open_session, settle, Events};
use rtcbridge_core::engine::DataChannelMessage;
use rtcbridge_core::state::DataChannelState;
use rtcbridge_core::{vmap, ErrorKind, EventStream, Handle, Value};
use rtcbridge_session::Bridge;

async fn create_channel(
    bridge: &Bridge,
    session: &Handle,
    label: &str,
    id: Option<i64>,
) -> Value {
    let mut args = vmap! { "peerConnectionId" => session, "label" => label };
    if let Some(id) = id {
        args.insert("dataChannelDict", vmap! { "id" => id, "ordered" => true });
    }
    bridge.dispatch("createDataChannel", &args).await.unwrap()
}

fn channel_stream(session: &Handle, id: u32) -> EventStream {
    EventStream::DataChannel { session: session.clone(), id }
}

#[tokio::test]
async fn host_ids_and_engine_ids_never_collide() {
    let (bridge, engine) = bridge();
    let (session, connection) = open_session(&bridge, &engine).await;
    let mut events = Events::subscribe(&bridge, EventStream::Session(session.clone()));

    let explicit = create_channel(&bridge, &session, "control", Some(5)).await;
    assert_eq!(explicit.require_int("id").unwrap(), 5);
    assert_eq!(field(&explicit, "label"), "control");

    let unnumbered = create_channel(&bridge, &session, "chat", None).await;
    assert!(unnumbered.require_int("id").unwrap() >= 65_536);
    let unset = create_channel(&bridge, &session, "bulk", Some(-1)).await;
    assert!(unset.require_int("id").unwrap() >= 65_536);
    assert_ne!(unnumbered.require_int("id").unwrap(), unset.require_int("id").unwrap());

    // The remote side reuses wire id 5.
    connection.announce_remote_data_channel("peer", Some(5));
    settle(&bridge, &session).await;
    let opened =
        events.drain().into_iter().find(|e| event_name(e) == "didOpenDataChannel").unwrap();
    assert!(opened.require_int("id").unwrap() >= 65_536);
    assert_eq!(field(&opened, "label"), "peer");
    assert_eq!(bridge.snapshot().data_channels, 4);

    let duplicate = vmap! {
        "peerConnectionId" => &session,
        "label" => "again",
        "dataChannelDict" => vmap! { "id" => 5 },
    };
    assert_kind(
        bridge.dispatch("createDataChannel", &duplicate).await,
        ErrorKind::InvalidArgument,
    );
}

#[tokio::test]
async fn send_accepts_text_and_binary() {
    let (bridge, engine) = bridge();
    let (session, connection) = open_session(&bridge, &engine).await;
    create_channel(&bridge, &session, "chat", Some(1)).await;
    let send = |kind: &str, data: Value| {
        vmap! {
            "peerConnectionId" => &session,
            "dataChannelId" => 1,
            "type" => kind,
            "data" => data,
        }
    };

    bridge.dispatch("dataChannelSend", &send("text", Value::from("hello"))).await.unwrap();
    bridge
        .dispatch("dataChannelSend", &send("binary", Value::from(Bytes::from_static(&[1, 2]))))
        .await
        .unwrap();
    // Hosts without a byte type send base64.
    bridge.dispatch("dataChannelSend", &send("binary", Value::from("AQID"))).await.unwrap();

    assert_eq!(
        connection.data_channels()[0].sent(),
        vec![
            DataChannelMessage::Text("hello".into()),
            DataChannelMessage::Binary(Bytes::from_static(&[1, 2])),
            DataChannelMessage::Binary(Bytes::from_static(&[1, 2, 3])),
        ]
    );
    assert_kind(
        bridge.dispatch("dataChannelSend", &send("json", Value::from("{}"))).await,
        ErrorKind::InvalidArgument,
    );
}

#[tokio::test]
async fn close_reports_final_states_and_is_idempotent() {
    let (bridge, engine) = bridge();
    let (session, _) = open_session(&bridge, &engine).await;
    create_channel(&bridge, &session, "chat", Some(3)).await;
    let mut events = Events::subscribe(&bridge, channel_stream(&session, 3));
    let close = vmap! { "peerConnectionId" => &session, "dataChannelId" => 3 };

    bridge.dispatch("dataChannelClose", &close).await.unwrap();
    let closing = events.next().await;
    assert_eq!(event_name(&closing), "dataChannelStateChanged");
    assert_eq!(field(&closing, "state"), DataChannelState::Closing.as_str());
    assert_eq!(field(&events.next().await, "state"), DataChannelState::Closed.as_str());

    bridge.dispatch("dataChannelClose", &close).await.unwrap();
    assert_eq!(bridge.snapshot().data_channels, 0);
    let (late, _) = tokio::sync::mpsc::unbounded_channel();
    assert_kind(
        bridge.subscribe(&channel_stream(&session, 3), late).map(|()| Value::Null),
        ErrorKind::ResourceNotFound,
    );

    let unknown = vmap! { "peerConnectionId" => &session, "dataChannelId" => 42 };
    assert_kind(
        bridge.dispatch("dataChannelClose", &unknown).await,
        ErrorKind::ResourceNotFound,
    );
}

#[tokio::test]
async fn close_result_follows_the_closed_event() {
    let (bridge, engine) = bridge();
    let (session, _) = open_session(&bridge, &engine).await;
    create_channel(&bridge, &session, "chat", Some(4)).await;
    let mut events = Events::subscribe(&bridge, channel_stream(&session, 4));
    settle(&bridge, &session).await;
    events.drain();

    let close = vmap! { "peerConnectionId" => &session, "dataChannelId" => 4 };
    bridge.dispatch("dataChannelClose", &close).await.unwrap();
    // Nothing awaited between the result and this read.
    let states: Vec<String> = events.drain().iter().map(|e| field(e, "state")).collect();
    assert_eq!(
        states,
        [DataChannelState::Closing.as_str(), DataChannelState::Closed.as_str()]
    );
}

#[tokio::test]
async fn inbound_traffic_reaches_the_channel_stream() {
    let (bridge, engine) = bridge();
    let (session, connection) = open_session(&bridge, &engine).await;
    let remote = connection.announce_remote_data_channel("peer", Some(7));
    // Emitted before anyone listens, so it is buffered.
    remote.set_state(DataChannelState::Open);
    settle(&bridge, &session).await;

    let mut events = Events::subscribe(&bridge, channel_stream(&session, 7));
    let opened = events.next().await;
    assert_eq!(field(&opened, "state"), DataChannelState::Open.as_str());
    assert_eq!(opened.require_int("id").unwrap(), 7);

    remote.receive(DataChannelMessage::Text("ping".into()));
    remote.receive(DataChannelMessage::Binary(Bytes::from_static(b"\x00\x01")));
    let text = events.next_named("dataChannelReceiveMessage").await;
    assert_eq!((field(&text, "type"), field(&text, "data")), ("text".into(), "ping".into()));
    let binary = events.next_named("dataChannelReceiveMessage").await;
    assert_eq!(field(&binary, "type"), "binary");
    assert_eq!(binary.require_bytes("data").unwrap().as_ref(), b"\x00\x01");
}

#[tokio::test]
async fn session_close_releases_its_channels() {
    let (bridge, engine) = bridge();
    let (session, _) = open_session(&bridge, &engine).await;
    create_channel(&bridge, &session, "chat", Some(2)).await;

    let args = vmap! { "peerConnectionId" => &session };
    bridge.dispatch("peerConnectionClose", &args).await.unwrap();
    assert_eq!(bridge.snapshot().data_channels, 0);

    // The channel went with the session; closing it again is a no-op.
    let close = vmap! { "peerConnectionId" => &session, "dataChannelId" => 2 };
    bridge.dispatch("dataChannelClose", &close).await.unwrap();
}
