// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

use std::sync::Arc;

use rtcbridge_core::MediaEngine;

use crate::allocator::IdentityAllocator;
use crate::audio_routing::AudioRoutingRef;
use crate::metrics::BridgeMetrics;
use crate::registry::Registry;

/// State shared by the dispatcher, the lifecycle coordinator and every
/// session observer.
#[derive(Debug)]
pub struct BridgeContext {
    pub engine: Arc<dyn MediaEngine>,
    pub registry: Registry,
    pub metrics: BridgeMetrics,
}

impl BridgeContext {
    pub fn new(engine: Arc<dyn MediaEngine>, allocator: IdentityAllocator) -> Self {
        let audio_routing = AudioRoutingRef::new(engine.audio_routing());
        Self {
            engine,
            registry: Registry::new(audio_routing, allocator),
            metrics: BridgeMetrics::new(),
        }
    }
}
