// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! rtcbridge core - data types and collaborator interfaces shared by the
//! session layer and the host transports.
//!
//! ## Core Modules
//!
//! - [`value`]: The Value tree used for every command and event payload
//! - [`error`]: Error taxonomy and its host-facing rendering
//! - [`handle`]: Opaque handles, resource kinds and event stream addresses
//! - [`state`]: Engine-reported states (signaling, ICE, data channel, crypto)
//! - [`event`]: Tagged event types, one per entity kind
//! - [`sink`]: Event Sink Adapter with single-worker delivery
//! - [`engine`]: Media engine traits consumed by the bridge
//!
//! ## Quick Start
//!
//! ```ignore
//! use rtcbridge_core::{vmap, EventSink, SessionEvent};
//! use rtcbridge_core::state::SignalingState;
//!
//! let sink = EventSink::spawn("peerConnectionEvent/abc");
//! sink.publish(SessionEvent::SignalingState(SignalingState::Stable));
//!
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//! sink.attach(tx); // flushes the buffered signalingState event
//! ```

pub use async_trait::async_trait;

pub mod engine;
pub mod error;
pub mod event;
pub mod handle;
pub mod sink;
pub mod state;
pub mod value;

// Error handling
pub use error::{BridgeError, EngineError, ErrorKind, Result};

// Payloads
pub use value::{Number, Value, ValueKind, ValueMap};

// Handles
pub use handle::{EventStream, Handle, ResourceKind};

// Events and delivery
pub use event::{
    BridgeEvent, CryptorEvent, DataChannelEvent, RendererEvent, SessionEvent, StreamInfo,
    TrackInfo,
};
pub use sink::{EventListener, EventSink, FnListener, SinkStats};

// Engine collaborators
pub use engine::{
    ConnectionEvent, ConnectionEventReceiver, ConnectionEventSender, EngineConnection,
    EngineDataChannel, EngineStream, EngineTrack, MediaEngine, VideoSink,
};
