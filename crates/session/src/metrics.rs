// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! OpenTelemetry instruments for the bridge.
//!
//! Instruments come from the global meter, so they are no-ops until the host
//! installs a meter provider.

use std::time::Duration;

use opentelemetry::metrics::{Counter, Gauge, Histogram};
use opentelemetry::{global, KeyValue};
use rtcbridge_core::{EventSink, Result};

#[derive(Debug, Clone)]
pub struct BridgeMetrics {
    sessions_active: Gauge<u64>,
    sessions_created: Counter<u64>,
    sessions_disposed: Counter<u64>,
    session_duration: Histogram<f64>,
    commands: Counter<u64>,
    events_emitted: Counter<u64>,
    events_dropped: Counter<u64>,
}

impl Default for BridgeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl BridgeMetrics {
    pub fn new() -> Self {
        let meter = global::meter("rtcbridge");
        Self {
            sessions_active: meter
                .u64_gauge("rtcbridge.sessions.active")
                .with_description("Number of live sessions")
                .build(),
            sessions_created: meter
                .u64_counter("rtcbridge.sessions.created")
                .with_description("Total number of sessions created")
                .build(),
            sessions_disposed: meter
                .u64_counter("rtcbridge.sessions.disposed")
                .with_description("Total number of sessions disposed")
                .build(),
            session_duration: meter
                .f64_histogram("rtcbridge.session.duration")
                .with_description("Session lifetime in seconds")
                .with_unit("s")
                .build(),
            commands: meter
                .u64_counter("rtcbridge.commands")
                .with_description("Commands dispatched, by command and outcome")
                .build(),
            events_emitted: meter
                .u64_counter("rtcbridge.events.emitted")
                .with_description("Events handed to event sinks")
                .build(),
            events_dropped: meter
                .u64_counter("rtcbridge.events.dropped")
                .with_description("Events discarded by detached or closed sinks")
                .build(),
        }
    }

    pub fn session_created(&self, live: usize) {
        self.sessions_created.add(1, &[]);
        self.sessions_active.record(live as u64, &[]);
    }

    pub fn session_disposed(&self, live: usize, lifetime: Duration) {
        self.sessions_disposed.add(1, &[]);
        self.sessions_active.record(live as u64, &[]);
        self.session_duration.record(lifetime.as_secs_f64(), &[]);
    }

    pub fn command(&self, command: &str, outcome: &Result<rtcbridge_core::Value>) {
        let outcome = match outcome {
            Ok(_) => "ok",
            Err(err) => err.kind().as_str(),
        };
        self.commands.add(
            1,
            &[KeyValue::new("command", command.to_string()), KeyValue::new("outcome", outcome)],
        );
    }

    pub fn event_emitted(&self, stream: &'static str) {
        self.events_emitted.add(1, &[KeyValue::new("stream", stream)]);
    }

    /// Records what a sink dropped over its lifetime. Call once, when the sink
    /// is closed.
    pub fn sink_closed(&self, sink: &EventSink, stream: &'static str) {
        let dropped = sink.stats().dropped();
        if dropped > 0 {
            self.events_dropped.add(dropped, &[KeyValue::new("stream", stream)]);
        }
    }
}
