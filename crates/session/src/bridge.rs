// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Public entry point of the session layer.

use std::sync::Arc;

use rtcbridge_core::{EventListener, EventSink, EventStream, MediaEngine, Result, Value};

use crate::allocator::IdentityAllocator;
use crate::context::BridgeContext;
use crate::registry::RegistrySnapshot;
use crate::{commands, dispatcher, lifecycle};

/// A bridge between a host and a media engine.
///
/// Cheap to clone; clones share the registry. Must be used from within a
/// tokio runtime, since sessions spawn their observer and sink tasks.
#[derive(Debug, Clone)]
pub struct Bridge {
    ctx: Arc<BridgeContext>,
}

impl Bridge {
    pub fn new(engine: Arc<dyn MediaEngine>) -> Self {
        Self::with_allocator(engine, IdentityAllocator::default())
    }

    /// Creates a bridge drawing handles from a custom allocator.
    pub fn with_allocator(engine: Arc<dyn MediaEngine>, allocator: IdentityAllocator) -> Self {
        Self { ctx: Arc::new(BridgeContext::new(engine, allocator)) }
    }

    /// Every command name [`Bridge::dispatch`] recognizes.
    pub const fn commands() -> &'static [&'static str] {
        commands::COMMANDS
    }

    /// Runs one command.
    ///
    /// # Errors
    ///
    /// Returns the structured error of the command; see [`rtcbridge_core::ErrorKind`].
    pub async fn dispatch(&self, command: &str, args: &Value) -> Result<Value> {
        dispatcher::dispatch(&self.ctx, command, args).await
    }

    /// Attaches `listener` to an event stream. Events emitted before the first
    /// attach are flushed to it in order.
    ///
    /// # Errors
    ///
    /// `ResourceNotFound` if the entity behind `stream` does not exist.
    pub fn subscribe(&self, stream: &EventStream, listener: impl EventListener) -> Result<()> {
        self.sink(stream)?.attach(listener);
        tracing::debug!(%stream, "listener attached");
        Ok(())
    }

    /// Detaches the listener of an event stream. Later events are dropped.
    ///
    /// # Errors
    ///
    /// `ResourceNotFound` if the entity behind `stream` does not exist.
    pub fn unsubscribe(&self, stream: &EventStream) -> Result<()> {
        self.sink(stream)?.detach();
        tracing::debug!(%stream, "listener detached");
        Ok(())
    }

    /// Entry counts per kind.
    pub fn snapshot(&self) -> RegistrySnapshot {
        self.ctx.registry.snapshot()
    }

    /// Disposes every entity. The bridge stays usable afterwards.
    pub async fn shutdown(&self) {
        lifecycle::dispose_all(&self.ctx).await;
    }

    fn sink(&self, stream: &EventStream) -> Result<EventSink> {
        let inner = self.ctx.registry.lock();
        match stream {
            EventStream::Session(session) => Ok(inner.sessions.get(session)?.sink.clone()),
            EventStream::DataChannel { session, id } => {
                Ok(inner.sessions.get(session)?.data_channels.get(id)?.sink.clone())
            },
            EventStream::Renderer(id) => Ok(inner.renderers.get(id)?.renderer.events().clone()),
            EventStream::FrameCryptor(handle) => {
                Ok(inner.frame_cryptors.get(handle)?.sink.clone())
            },
        }
    }
}
