// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! api: Defines the host wire contract for rtcbridge.
//!
//! A host transport exchanges one JSON message per line. Requests carry a
//! bridge command name and its argument map, or one of the host control
//! commands; responses echo the request's correlation id; events carry the
//! name of the stream they were published on.

use rtcbridge_core::{BridgeError, Value};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

// --- Message Types ---

/// The type of message being sent or received.
///
/// - **Request**: Host sends to the bridge with a correlation_id
/// - **Response**: Bridge replies with the matching correlation_id
/// - **Event**: Bridge forwards a stream event (no correlation_id)
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, TS)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Host-initiated request that expects a response
    Request,
    /// Reply to a specific request (matched by correlation_id)
    Response,
    /// Event published on a subscribed stream
    Event,
}

// --- Base Message ---

/// Generic message container for requests, responses, and events.
///
/// # Example (Request)
/// ```json
/// {
///   "type": "request",
///   "correlation_id": "7",
///   "payload": { "command": "createOffer", "args": { "peerConnectionId": "a1b2" } }
/// }
/// ```
///
/// # Example (Response)
/// ```json
/// {
///   "type": "response",
///   "correlation_id": "7",
///   "payload": { "status": "ok", "result": { "sdp": "v=0...", "type": "offer" } }
/// }
/// ```
///
/// # Example (Event)
/// ```json
/// {
///   "type": "event",
///   "payload": {
///     "stream": "peerConnectionEvent/a1b2",
///     "event": { "event": "signalingState", "state": "have-local-offer" }
///   }
/// }
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Message<T> {
    /// The type of message (Request, Response, or Event)
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Present in Request and Response messages, absent in Event messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub payload: T,
}

impl<T> Message<T> {
    pub const fn request(correlation_id: Option<String>, payload: T) -> Self {
        Self { message_type: MessageType::Request, correlation_id, payload }
    }

    pub const fn response(correlation_id: Option<String>, payload: T) -> Self {
        Self { message_type: MessageType::Response, correlation_id, payload }
    }

    pub const fn event(payload: T) -> Self {
        Self { message_type: MessageType::Event, correlation_id: None, payload }
    }
}

// --- Host-to-Bridge Payloads (Requests) ---

/// Commands handled by the host itself rather than the bridge dispatcher.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
#[ts(export)]
#[serde(tag = "command")]
#[serde(rename_all = "lowercase")]
pub enum HostControl {
    /// Attach the host's listener to an event stream, flushing buffered events
    Subscribe {
        /// Stream name, e.g. `peerConnectionEvent/<handle>`
        stream: String,
    },
    /// Detach the host's listener; later events are buffered again
    Unsubscribe { stream: String },
    /// Report entity counts per kind
    Stats,
    /// Dispose every entity and stop reading requests
    Shutdown,
}

/// A named bridge command with its argument map.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
#[ts(export)]
pub struct CommandRequest {
    pub command: String,
    #[serde(default = "empty_args")]
    #[ts(type = "Record<string, JsonValue>")]
    pub args: serde_json::Value,
}

fn empty_args() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// Host-to-bridge request payload.
///
/// Host control names are reserved: a payload whose `command` is one of
/// them never reaches the dispatcher.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
#[ts(export)]
#[serde(untagged)]
pub enum RequestPayload {
    Control(HostControl),
    Command(CommandRequest),
}

pub type Request = Message<RequestPayload>;

impl CommandRequest {
    /// The arguments as a bridge Value map.
    pub fn args(&self) -> Value {
        match &self.args {
            serde_json::Value::Null => Value::map(),
            other => Value::from(other.clone()),
        }
    }
}

// --- Bridge-to-Host Payloads (Responses & Events) ---

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
#[ts(export)]
#[serde(tag = "status")]
#[serde(rename_all = "lowercase")]
pub enum ResponsePayload {
    Ok {
        #[ts(type = "JsonValue")]
        result: serde_json::Value,
    },
    Error {
        /// One of ResourceNotFound, InvalidArgument, EngineOperationFailed,
        /// NotImplemented, TypeMismatch
        kind: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        handle: Option<String>,
    },
}

impl ResponsePayload {
    pub fn ok(result: &Value) -> Self {
        Self::Ok { result: result.to_json() }
    }

    /// A host-level failure that never reached the dispatcher (bad JSON,
    /// unknown stream name).
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Error { kind: "InvalidArgument".to_string(), message: message.into(), handle: None }
    }

    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }
}

impl From<&BridgeError> for ResponsePayload {
    fn from(err: &BridgeError) -> Self {
        Self::Error {
            kind: err.kind().as_str().to_string(),
            message: err.message(),
            handle: err.handle().map(str::to_string),
        }
    }
}

impl From<rtcbridge_core::Result<Value>> for ResponsePayload {
    fn from(result: rtcbridge_core::Result<Value>) -> Self {
        match result {
            Ok(value) => Self::ok(&value),
            Err(err) => Self::from(&err),
        }
    }
}

pub type Response = Message<ResponsePayload>;

/// An event forwarded from a subscribed stream.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
#[ts(export)]
pub struct EventPayload {
    /// Name of the stream the event was published on
    pub stream: String,
    /// The event map; its `event` field names the event
    #[ts(type = "JsonValue")]
    pub event: serde_json::Value,
}

impl EventPayload {
    pub fn new(stream: impl Into<String>, event: &Value) -> Self {
        Self { stream: stream.into(), event: event.to_json() }
    }
}

pub type Event = Message<EventPayload>;

/// Entity counts reported by the `stats` host command.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, TS)]
#[ts(export)]
pub struct RegistryStats {
    pub sessions: usize,
    pub local_streams: usize,
    pub local_tracks: usize,
    pub remote_streams: usize,
    pub remote_tracks: usize,
    pub data_channels: usize,
    pub renderers: usize,
    pub key_providers: usize,
    pub frame_cryptors: usize,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use rtcbridge_core::{vmap, ResourceKind};
    use serde_json::json;

    #[test]
    fn bridge_commands_and_host_controls_share_the_request_shape() {
        let command: Request = serde_json::from_value(json!({
            "type": "request",
            "correlation_id": "1",
            "payload": { "command": "createOffer", "args": { "peerConnectionId": "abc" } }
        }))
        .unwrap();
        let RequestPayload::Command(request) = command.payload else {
            panic!("expected a bridge command");
        };
        assert_eq!(request.command, "createOffer");
        assert_eq!(request.args().require_str("peerConnectionId").unwrap(), "abc");

        let control: Request = serde_json::from_value(json!({
            "type": "request",
            "payload": { "command": "subscribe", "stream": "peerConnectionEvent/abc" }
        }))
        .unwrap();
        assert_eq!(
            control.payload,
            RequestPayload::Control(HostControl::Subscribe {
                stream: "peerConnectionEvent/abc".into()
            })
        );
        assert_eq!(control.correlation_id, None);
    }

    #[test]
    fn missing_args_read_as_an_empty_map() {
        let request: CommandRequest =
            serde_json::from_value(json!({ "command": "createVideoRenderer" })).unwrap();
        assert!(request.args().as_map().unwrap().is_empty());
        let request: CommandRequest =
            serde_json::from_value(json!({ "command": "getUserMedia", "args": null })).unwrap();
        assert!(request.args().as_map().unwrap().is_empty());
    }

    #[test]
    fn responses_carry_status_and_error_details() {
        let ok = Response::response(Some("9".into()), ResponsePayload::ok(&vmap! { "id" => 5 }));
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({
                "type": "response",
                "correlation_id": "9",
                "payload": { "status": "ok", "result": { "id": 5 } }
            })
        );

        let err = BridgeError::not_found(ResourceKind::Session, "gone");
        let payload = ResponsePayload::from(Err::<Value, _>(err));
        assert!(!payload.is_ok());
        let encoded = serde_json::to_value(&payload).unwrap();
        assert_eq!(encoded["status"], "error");
        assert_eq!(encoded["kind"], "ResourceNotFound");
        assert_eq!(encoded["handle"], "gone");
    }

    #[test]
    fn events_have_no_correlation_id() {
        let event = Event::event(EventPayload::new(
            "peerConnectionEvent/abc",
            &vmap! { "event" => "onRenegotiationNeeded" },
        ));
        let line = serde_json::to_string(&event).unwrap();
        assert!(!line.contains("correlation_id"));
        assert!(line.contains(r#""stream":"peerConnectionEvent/abc""#));
    }
}
