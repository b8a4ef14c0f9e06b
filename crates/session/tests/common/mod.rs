// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Helpers shared by the session integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use rtcbridge_core::{vmap, BridgeError, ErrorKind, EventStream, Handle, Value};
use rtcbridge_session::loopback::{LoopbackConnection, LoopbackEngine};
use rtcbridge_session::Bridge;
use tokio::sync::mpsc;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("rtcbridge_session=debug")
        .with_test_writer()
        .try_init();
}

pub fn bridge() -> (Bridge, Arc<LoopbackEngine>) {
    init_tracing();
    let engine = LoopbackEngine::new();
    (Bridge::new(engine.clone()), engine)
}

/// Listener end of one event stream.
pub struct Events(mpsc::UnboundedReceiver<Value>);

impl Events {
    pub fn subscribe(bridge: &Bridge, stream: EventStream) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        bridge.subscribe(&stream, tx).expect("subscribe");
        Self(rx)
    }

    /// Everything delivered so far.
    pub fn drain(&mut self) -> Vec<Value> {
        std::iter::from_fn(|| self.0.try_recv().ok()).collect()
    }

    pub fn drain_names(&mut self) -> Vec<String> {
        self.drain().iter().map(|event| event_name(event).to_string()).collect()
    }

    /// Waits for the next event.
    pub async fn next(&mut self) -> Value {
        tokio::time::timeout(Duration::from_secs(2), self.0.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("event stream ended")
    }

    /// Waits for the next event named `name`, skipping others.
    pub async fn next_named(&mut self, name: &str) -> Value {
        loop {
            let event = self.next().await;
            if event_name(&event) == name {
                return event;
            }
        }
    }
}

pub fn event_name(event: &Value) -> &str {
    event.require_str("event").unwrap()
}

pub fn field(value: &Value, name: &str) -> String {
    value.require_str(name).unwrap().to_string()
}

/// Opens a session and returns its handle and the engine connection behind it.
pub async fn open_session(
    bridge: &Bridge,
    engine: &LoopbackEngine,
) -> (Handle, Arc<LoopbackConnection>) {
    let created = bridge.dispatch("createPeerConnection", &vmap! {}).await.unwrap();
    let session = Handle::from(created.require_str("peerConnectionId").unwrap());
    (session, engine.last_connection().unwrap())
}

/// Waits until every engine callback queued for `session` has been handled.
pub async fn settle(bridge: &Bridge, session: &Handle) {
    bridge
        .dispatch("getPeerConnectionState", &vmap! { "peerConnectionId" => session })
        .await
        .unwrap();
}

pub async fn capture(bridge: &Bridge, audio: bool, video: bool) -> Value {
    bridge
        .dispatch(
            "getUserMedia",
            &vmap! { "constraints" => vmap! { "audio" => audio, "video" => video } },
        )
        .await
        .unwrap()
}

/// The `id` of the first track in `list` of a getUserMedia-style result.
pub fn first_track(result: &Value, list: &str) -> String {
    let tracks = result.get(list).unwrap().as_list().unwrap();
    field(&tracks[0], "id")
}

pub fn assert_kind(result: Result<Value, BridgeError>, kind: ErrorKind) -> BridgeError {
    let err = result.expect_err("command should fail");
    assert_eq!(err.kind(), kind, "unexpected error: {err}");
    err
}
