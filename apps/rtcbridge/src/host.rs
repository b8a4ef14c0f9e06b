// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! JSON-lines host transport.
//!
//! Reads one [`Request`] per input line and writes one [`Response`] or
//! [`Event`] per output line. Bridge commands run concurrently; responses are
//! matched to requests by correlation id. Every output line goes through a
//! single writer task, so a response is written after the session events that
//! preceded it.
//!
//! Lines are read as raw bytes. One longer than `max_line_bytes` is skipped
//! as it streams in, and one that is not UTF-8 is answered with an error;
//! either way the host keeps serving.
//!
//! On end of input, on cancellation, or on a `shutdown` request, in-flight
//! commands are awaited and every bridge entity is disposed before [`run`]
//! returns.

use std::sync::Arc;

use rtcbridge_api::{
    Event, EventPayload, HostControl, Message, MessageType, RegistryStats, Request,
    RequestPayload, Response, ResponsePayload,
};
use rtcbridge_core::{EventListener, EventStream, Handle, Value};
use rtcbridge_session::{Bridge, RegistrySnapshot};
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::HostConfig;
use crate::lines::{Line, LineReader};

enum Outgoing {
    Line(String),
    Finish(oneshot::Sender<()>),
}

/// Queue feeding the writer task.
#[derive(Clone)]
struct Outbox(mpsc::UnboundedSender<Outgoing>);

impl Outbox {
    fn send<T: Serialize>(&self, message: &Message<T>) -> bool {
        match serde_json::to_string(message) {
            Ok(line) => self.0.send(Outgoing::Line(line)).is_ok(),
            Err(e) => {
                tracing::error!(error = %e, "failed to encode outgoing message");
                true
            },
        }
    }

    async fn finish(&self) {
        let (ack, done) = oneshot::channel();
        if self.0.send(Outgoing::Finish(ack)).is_ok() {
            let _ = done.await;
        }
    }
}

async fn write_lines<W>(mut output: W, mut queue: mpsc::UnboundedReceiver<Outgoing>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(outgoing) = queue.recv().await {
        let result = match outgoing {
            Outgoing::Line(mut line) => {
                line.push('\n');
                match output.write_all(line.as_bytes()).await {
                    Ok(()) if queue.is_empty() => output.flush().await,
                    other => other,
                }
            },
            Outgoing::Finish(ack) => {
                let _ = output.flush().await;
                let _ = ack.send(());
                return;
            },
        };
        if let Err(e) = result {
            tracing::error!(error = %e, "output closed, dropping further messages");
            return;
        }
    }
}

/// Forwards one event stream to the output.
struct Forwarder {
    stream: String,
    outbox: Outbox,
    /// Set on session streams when remote data channels are followed too.
    follow_channels: Option<(Bridge, Handle)>,
}

impl EventListener for Forwarder {
    fn deliver(&mut self, event: Value) -> bool {
        let delivered =
            self.outbox.send(&Event::event(EventPayload::new(self.stream.as_str(), &event)));
        // Follow after forwarding so the channel's own events come later.
        if let Some((bridge, session)) = &self.follow_channels {
            if event.opt_str("event").ok().flatten() == Some("didOpenDataChannel") {
                if let Some(id) = channel_id(&event) {
                    let stream = EventStream::DataChannel { session: session.clone(), id };
                    let forwarder = Self::new(&stream, self.outbox.clone(), None);
                    if let Err(err) = bridge.subscribe(&stream, forwarder) {
                        tracing::debug!(%stream, error = %err, "remote data channel already gone");
                    }
                }
            }
        }
        delivered
    }
}

impl Forwarder {
    fn new(
        stream: &EventStream,
        outbox: Outbox,
        follow_channels: Option<(Bridge, Handle)>,
    ) -> Self {
        Self { stream: stream.name(), outbox, follow_channels }
    }
}

fn channel_id(value: &Value) -> Option<u32> {
    value.opt_int("id").ok().flatten().and_then(|id| u32::try_from(id).ok())
}

fn stats(snapshot: RegistrySnapshot) -> RegistryStats {
    RegistryStats {
        sessions: snapshot.sessions,
        local_streams: snapshot.local_streams,
        local_tracks: snapshot.local_tracks,
        remote_streams: snapshot.remote_streams,
        remote_tracks: snapshot.remote_tracks,
        data_channels: snapshot.data_channels,
        renderers: snapshot.renderers,
        key_providers: snapshot.key_providers,
        frame_cryptors: snapshot.frame_cryptors,
    }
}

struct Host {
    bridge: Bridge,
    outbox: Outbox,
    auto_subscribe: bool,
}

impl Host {
    fn respond(&self, correlation_id: Option<String>, payload: ResponsePayload) {
        self.outbox.send(&Response::response(correlation_id, payload));
    }

    async fn handle(&self, request: Request) {
        let response = match request.payload {
            RequestPayload::Control(control) => self.control(control),
            RequestPayload::Command(command) => {
                let args = command.args();
                let result = self.bridge.dispatch(&command.command, &args).await;
                if let (true, Ok(created)) = (self.auto_subscribe, &result) {
                    self.follow_created(&command.command, &args, created);
                }
                ResponsePayload::from(result)
            },
        };
        self.respond(request.correlation_id, response);
    }

    fn control(&self, control: HostControl) -> ResponsePayload {
        match control {
            HostControl::Subscribe { stream } => self.with_stream(&stream, |stream| {
                self.bridge.subscribe(stream, Forwarder::new(stream, self.outbox.clone(), None))
            }),
            HostControl::Unsubscribe { stream } => {
                self.with_stream(&stream, |stream| self.bridge.unsubscribe(stream))
            },
            HostControl::Stats => match serde_json::to_value(stats(self.bridge.snapshot())) {
                Ok(result) => ResponsePayload::Ok { result },
                Err(e) => ResponsePayload::invalid(format!("failed to encode stats: {e}")),
            },
            // Handled by the read loop before it gets here.
            HostControl::Shutdown => ResponsePayload::ok(&Value::Null),
        }
    }

    fn with_stream(
        &self,
        name: &str,
        op: impl FnOnce(&EventStream) -> rtcbridge_core::Result<()>,
    ) -> ResponsePayload {
        match EventStream::parse(name) {
            Some(stream) => ResponsePayload::from(op(&stream).map(|()| Value::Null)),
            None => ResponsePayload::invalid(format!("unknown event stream '{name}'")),
        }
    }

    /// Subscribes the stream of an entity a command just created.
    fn follow_created(&self, command: &str, args: &Value, created: &Value) {
        let stream = match command {
            "createPeerConnection" => created
                .opt_str("peerConnectionId")
                .ok()
                .flatten()
                .map(|id| EventStream::Session(Handle::from(id))),
            "createDataChannel" => {
                let session = args.opt_str("peerConnectionId").ok().flatten();
                session.zip(channel_id(created)).map(|(session, id)| EventStream::DataChannel {
                    session: Handle::from(session),
                    id,
                })
            },
            "createVideoRenderer" => {
                created.opt_int("textureId").ok().flatten().map(EventStream::Renderer)
            },
            "frameCryptorFactoryCreateFrameCryptor" => created
                .opt_str("frameCryptorId")
                .ok()
                .flatten()
                .map(|id| EventStream::FrameCryptor(Handle::from(id))),
            _ => None,
        };
        let Some(stream) = stream else {
            return;
        };
        let follow = match &stream {
            EventStream::Session(session) => Some((self.bridge.clone(), session.clone())),
            _ => None,
        };
        let forwarder = Forwarder::new(&stream, self.outbox.clone(), follow);
        if let Err(err) = self.bridge.subscribe(&stream, forwarder) {
            tracing::warn!(%stream, error = %err, "auto-subscribe failed");
        }
    }
}

/// Parses a request line, keeping the correlation id for the error reply
/// when the line is JSON but not a valid request.
fn parse_request(line: &str) -> Result<Request, (Option<String>, String)> {
    let raw: serde_json::Value =
        serde_json::from_str(line).map_err(|e| (None, format!("malformed JSON: {e}")))?;
    let correlation_id =
        raw.get("correlation_id").and_then(serde_json::Value::as_str).map(str::to_string);
    let request: Request = serde_json::from_value(raw)
        .map_err(|e| (correlation_id.clone(), format!("malformed request: {e}")))?;
    if request.message_type != MessageType::Request {
        return Err((correlation_id, "expected a message of type request".to_string()));
    }
    Ok(request)
}

/// Serves requests from `input` until end of input, `shutdown`, or
/// cancellation of `cancel`.
///
/// # Errors
///
/// Returns an error if reading from `input` fails. The bridge is shut down
/// either way.
pub async fn run<R, W>(
    bridge: Bridge,
    config: &HostConfig,
    input: R,
    output: W,
    cancel: CancellationToken,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (queue_tx, queue_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_lines(output, queue_rx));
    let host = Arc::new(Host {
        bridge,
        outbox: Outbox(queue_tx),
        auto_subscribe: config.auto_subscribe,
    });

    let mut in_flight = JoinSet::new();
    let mut shutdown_reply = None;
    let mut lines = LineReader::new(input, config.max_line_bytes);
    let read_result = loop {
        let line = tokio::select! {
            () = cancel.cancelled() => {
                tracing::info!("host cancelled");
                break Ok(());
            },
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(Line::Text(line))) => line,
            Ok(Some(Line::TooLong(len))) => {
                tracing::warn!(len, "request line too long");
                host.respond(None, ResponsePayload::invalid("request line too long"));
                continue;
            },
            Ok(Some(Line::NotUtf8)) => {
                tracing::warn!("request line is not valid UTF-8");
                host.respond(None, ResponsePayload::invalid("request line is not valid UTF-8"));
                continue;
            },
            Ok(None) => {
                tracing::info!("end of input");
                break Ok(());
            },
            Err(e) => break Err(e),
        };
        while in_flight.try_join_next().is_some() {}

        if line.trim().is_empty() {
            continue;
        }
        let request = match parse_request(&line) {
            Ok(request) => request,
            Err((correlation_id, message)) => {
                tracing::warn!(%message, "rejected request");
                host.respond(correlation_id, ResponsePayload::invalid(message));
                continue;
            },
        };
        if request.payload == RequestPayload::Control(HostControl::Shutdown) {
            shutdown_reply = Some(request.correlation_id);
            break Ok(());
        }

        let host = Arc::clone(&host);
        in_flight.spawn(async move { host.handle(request).await });
    };

    while in_flight.join_next().await.is_some() {}
    host.bridge.shutdown().await;
    if let Some(correlation_id) = shutdown_reply {
        host.respond(correlation_id, ResponsePayload::ok(&Value::Null));
    }
    host.outbox.finish().await;
    let _ = writer.await;
    tracing::info!("host stopped");

    read_result.map_err(Into::into)
}
