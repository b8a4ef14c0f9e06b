// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! rtcbridge session layer: the registry of sessions, media, data channels,
//! renderers and frame cryptors, and the command surface that drives them.
//!
//! ## Components
//!
//! - [`Bridge`]: entry point; dispatches commands and manages subscriptions
//! - [`registry`]: Entity Registry, one lock over every table
//! - [`allocator`]: Identity Allocator for collision-free handles
//! - [`observer`]: Session Observer, one task per session consuming engine callbacks
//! - [`lifecycle`]: Lifecycle Coordinator (open, close, dispose and cascades)
//! - [`loopback`]: in-memory media engine for tests and demos
//!
//! ## Example
//!
//! ```ignore
//! use rtcbridge_core::{vmap, EventStream, Handle};
//! use rtcbridge_session::{loopback::LoopbackEngine, Bridge};
//!
//! let bridge = Bridge::new(LoopbackEngine::new());
//! let created = bridge.dispatch("createPeerConnection", &vmap! {}).await?;
//! let session = Handle::from(created.require_str("peerConnectionId")?);
//!
//! let (tx, mut events) = tokio::sync::mpsc::unbounded_channel();
//! bridge.subscribe(&EventStream::Session(session.clone()), tx)?;
//! ```

pub mod allocator;
pub mod audio_routing;
pub mod bridge;
mod commands;
pub mod constants;
mod context;
mod dispatcher;
pub mod entities;
pub mod lifecycle;
pub mod loopback;
mod metrics;
pub mod observer;
pub mod registry;
pub mod renderer;

#[cfg(test)]
mod tests;

pub use allocator::{HandleSource, IdentityAllocator, RandomHandles};
pub use bridge::Bridge;
pub use commands::COMMANDS;
pub use context::BridgeContext;
pub use registry::RegistrySnapshot;
