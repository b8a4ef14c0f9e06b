// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Process-wide audio routing, reference-counted by live sessions.
//!
//! Lives inside the registry lock, so "first session opened" and "last
//! session disposed" are decided atomically with the session table change.

use std::sync::Arc;

use rtcbridge_core::engine::AudioRouting;

#[derive(Debug)]
pub struct AudioRoutingRef {
    routing: Arc<dyn AudioRouting>,
    live_sessions: usize,
}

impl AudioRoutingRef {
    pub fn new(routing: Arc<dyn AudioRouting>) -> Self {
        Self { routing, live_sessions: 0 }
    }

    /// Registers one more live session, starting routing on the first.
    pub fn acquire(&mut self) {
        self.live_sessions += 1;
        if self.live_sessions == 1 {
            tracing::info!("starting audio routing");
            self.routing.start();
        }
    }

    /// Drops one live session, stopping routing when none remain.
    pub fn release(&mut self) {
        match self.live_sessions {
            0 => tracing::warn!("audio routing released more often than acquired"),
            1 => {
                self.live_sessions = 0;
                tracing::info!("stopping audio routing");
                self.routing.stop();
            },
            _ => self.live_sessions -= 1,
        }
    }

    pub const fn live_sessions(&self) -> usize {
        self.live_sessions
    }

    pub const fn is_active(&self) -> bool {
        self.live_sessions > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackAudioRouting;

    #[test]
    fn starts_on_first_and_stops_on_last() {
        let routing = Arc::new(LoopbackAudioRouting::default());
        let mut guard = AudioRoutingRef::new(routing.clone());

        guard.acquire();
        guard.acquire();
        assert_eq!(routing.starts(), 1);
        assert!(guard.is_active());

        guard.release();
        assert_eq!(routing.stops(), 0);
        guard.release();
        assert_eq!(routing.stops(), 1);
        assert!(!guard.is_active());

        // Unbalanced release is logged, not counted.
        guard.release();
        assert_eq!(routing.stops(), 1);
    }
}
