// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Event Sink Adapter.
//!
//! An [`EventSink`] wraps a listener that may not exist yet. Producers on any
//! thread call [`EventSink::emit`]; delivery happens on a single worker task
//! per sink, so the listener sees a total order.
//!
//! ## Listener state
//!
//! ```text
//!    Pending(buffer) ──attach──▶ Attached ──detach──▶ Detached
//!                                   ▲                    │
//!                                   └──────attach────────┘
//! ```
//!
//! - **Pending**: events are buffered in arrival order and flushed on attach.
//! - **Attached**: events are delivered as they arrive.
//! - **Detached**: events are dropped, never buffered.
//!
//! Command results can be routed through the same worker with
//! [`EventSink::reply`]: the result is released only after every event
//! emitted before it has been handed to the listener.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::error::Result;
use crate::event::BridgeEvent;
use crate::value::Value;

/// Receives events from a sink's worker task.
pub trait EventListener: Send + 'static {
    /// Delivers one event. Returning `false` marks the listener as gone and
    /// the sink switches to the detached state.
    fn deliver(&mut self, event: Value) -> bool;
}

impl EventListener for mpsc::UnboundedSender<Value> {
    fn deliver(&mut self, event: Value) -> bool {
        self.send(event).is_ok()
    }
}

/// Adapts a closure into an [`EventListener`].
pub struct FnListener<F>(pub F);

impl<F> EventListener for FnListener<F>
where
    F: FnMut(Value) + Send + 'static,
{
    fn deliver(&mut self, event: Value) -> bool {
        (self.0)(event);
        true
    }
}

/// Delivery counters for one sink.
#[derive(Debug, Default)]
pub struct SinkStats {
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl SinkStats {
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

enum SinkCommand {
    Emit(Value),
    Attach(Box<dyn EventListener>),
    Detach,
    Reply { result: Result<Value>, respond_to: oneshot::Sender<Result<Value>> },
    Flush(oneshot::Sender<()>),
    Close,
}

enum ListenerState {
    Pending(VecDeque<Value>),
    Attached(Box<dyn EventListener>),
    Detached,
}

/// Handle to one event sink. Clones share the same worker.
#[derive(Clone)]
pub struct EventSink {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<SinkCommand>,
    stats: Arc<SinkStats>,
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("name", &self.name)
            .field("closed", &self.tx.is_closed())
            .finish_non_exhaustive()
    }
}

impl EventSink {
    /// Creates a sink and spawns its delivery worker on the current runtime.
    pub fn spawn(name: impl Into<String>) -> Self {
        let name: Arc<str> = Arc::from(name.into());
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(SinkStats::default());

        let worker = SinkWorker {
            name: name.clone(),
            rx,
            state: ListenerState::Pending(VecDeque::new()),
            stats: stats.clone(),
        };
        tokio::spawn(worker.run());

        Self { name, tx, stats }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> &SinkStats {
        &self.stats
    }

    /// Queues an event. Never blocks; safe to call from engine threads.
    pub fn emit(&self, event: Value) {
        if self.tx.send(SinkCommand::Emit(event)).is_err() {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn publish<E: BridgeEvent>(&self, event: E) {
        self.emit(event.into_value());
    }

    /// Attaches a listener. Buffered events are flushed to it first, in order.
    pub fn attach(&self, listener: impl EventListener) {
        let _ = self.tx.send(SinkCommand::Attach(Box::new(listener)));
    }

    /// Detaches the current listener. Later events are dropped.
    pub fn detach(&self) {
        let _ = self.tx.send(SinkCommand::Detach);
    }

    /// Routes a command result through the delivery worker.
    ///
    /// Resolves once every event emitted before this call has been delivered
    /// (or buffered, when no listener is attached yet). If the worker has
    /// already stopped, the result is returned directly.
    pub async fn reply(&self, result: Result<Value>) -> Result<Value> {
        let (respond_to, response) = oneshot::channel();
        match self.tx.send(SinkCommand::Reply { result, respond_to }) {
            // The worker answers every queued reply, even while shutting down.
            Ok(()) => response.await.unwrap_or(Ok(Value::Null)),
            Err(mpsc::error::SendError(SinkCommand::Reply { result, .. })) => result,
            Err(_) => Ok(Value::Null),
        }
    }

    /// Waits until everything queued before this call has been processed.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(SinkCommand::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Detaches and stops the worker. Events emitted afterwards are dropped.
    pub fn close(&self) {
        let _ = self.tx.send(SinkCommand::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

struct SinkWorker {
    name: Arc<str>,
    rx: mpsc::UnboundedReceiver<SinkCommand>,
    state: ListenerState,
    stats: Arc<SinkStats>,
}

impl SinkWorker {
    async fn run(mut self) {
        tracing::trace!(sink = %self.name, "event sink worker started");
        while let Some(command) = self.rx.recv().await {
            match command {
                SinkCommand::Emit(event) => self.on_emit(event),
                SinkCommand::Attach(listener) => self.on_attach(listener),
                SinkCommand::Detach => self.state = ListenerState::Detached,
                SinkCommand::Reply { result, respond_to } => {
                    let _ = respond_to.send(result);
                },
                SinkCommand::Flush(done) => {
                    let _ = done.send(());
                },
                SinkCommand::Close => break,
            }
        }
        self.rx.close();
        while let Ok(command) = self.rx.try_recv() {
            match command {
                SinkCommand::Reply { result, respond_to } => {
                    let _ = respond_to.send(result);
                },
                SinkCommand::Emit(_) => {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                },
                _ => {},
            }
        }
        if let ListenerState::Pending(buffer) = &self.state {
            if !buffer.is_empty() {
                tracing::debug!(
                    sink = %self.name,
                    discarded = buffer.len(),
                    "event sink closed before a listener attached"
                );
                self.stats.dropped.fetch_add(buffer.len() as u64, Ordering::Relaxed);
            }
        }
        tracing::trace!(sink = %self.name, "event sink worker stopped");
    }

    fn on_emit(&mut self, event: Value) {
        match &mut self.state {
            ListenerState::Pending(buffer) => buffer.push_back(event),
            ListenerState::Attached(listener) => {
                if listener.deliver(event) {
                    self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                } else {
                    tracing::debug!(sink = %self.name, "listener went away, detaching");
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    self.state = ListenerState::Detached;
                }
            },
            ListenerState::Detached => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            },
        }
    }

    fn on_attach(&mut self, listener: Box<dyn EventListener>) {
        let previous = std::mem::replace(&mut self.state, ListenerState::Attached(listener));
        if let ListenerState::Pending(buffer) = previous {
            tracing::trace!(sink = %self.name, buffered = buffer.len(), "flushing buffered events");
            for event in buffer {
                self.on_emit(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmap;

    fn numbered(i: i64) -> Value {
        vmap! { "event" => "n", "i" => i }
    }

    #[tokio::test]
    #[allow(clippy::unwrap_used)]
    async fn buffers_until_attach_then_flushes_in_order() {
        let sink = EventSink::spawn("test");
        for i in 0..5 {
            sink.emit(numbered(i));
        }
        sink.flush().await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        sink.attach(tx);
        sink.emit(numbered(5));
        sink.flush().await;

        for i in 0..6 {
            let event = rx.try_recv().unwrap();
            assert_eq!(event.get("i").unwrap().as_int().unwrap(), i);
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(sink.stats().delivered(), 6);
    }

    #[tokio::test]
    async fn drops_after_detach() {
        let sink = EventSink::spawn("test");
        let (tx, mut rx) = mpsc::unbounded_channel();
        sink.attach(tx);
        sink.detach();
        sink.emit(numbered(1));
        sink.flush().await;

        assert!(rx.try_recv().is_err());
        assert_eq!(sink.stats().dropped(), 1);
    }

    #[tokio::test]
    #[allow(clippy::unwrap_used)]
    async fn reply_follows_earlier_events() {
        let sink = EventSink::spawn("test");
        let (tx, mut rx) = mpsc::unbounded_channel();
        sink.attach(tx);

        sink.emit(numbered(1));
        let result = sink.reply(Ok(Value::from("done"))).await.unwrap();
        assert_eq!(result.as_str().unwrap(), "done");
        // The event emitted before the reply is already delivered.
        assert_eq!(rx.try_recv().unwrap().get("i").unwrap().as_int().unwrap(), 1);
    }

    #[tokio::test]
    #[allow(clippy::unwrap_used)]
    async fn reply_resolves_without_listener_and_after_close() {
        let sink = EventSink::spawn("test");
        sink.emit(numbered(1));
        assert!(sink.reply(Ok(Value::Null)).await.unwrap().is_null());

        sink.close();
        sink.flush().await;
        let err = crate::error::BridgeError::invalid_argument("nope");
        assert_eq!(sink.reply(Err(err.clone())).await, Err(err));
    }

    #[tokio::test]
    #[allow(clippy::unwrap_used)]
    async fn emits_from_plain_threads_keep_order() {
        let sink = EventSink::spawn("test");
        let (tx, mut rx) = mpsc::unbounded_channel();
        sink.attach(tx);

        let producer = sink.clone();
        std::thread::spawn(move || {
            for i in 0..100 {
                producer.emit(numbered(i));
            }
        })
        .join()
        .unwrap();
        sink.flush().await;

        for i in 0..100 {
            assert_eq!(rx.recv().await.unwrap().get("i").unwrap().as_int().unwrap(), i);
        }
    }

    #[tokio::test]
    async fn closed_listener_detaches() {
        let sink = EventSink::spawn("test");
        let (tx, rx) = mpsc::unbounded_channel();
        sink.attach(tx);
        drop(rx);
        sink.emit(numbered(1));
        sink.emit(numbered(2));
        sink.flush().await;
        assert_eq!(sink.stats().dropped(), 2);
    }
}
