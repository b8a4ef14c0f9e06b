// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Identity Allocator.
//!
//! Draws random 128-bit handles and re-rolls until the candidate is unknown
//! to the registry. The lookup runs under the registry lock, and the caller
//! inserts the new entry before releasing it, so two concurrent allocations
//! can never settle on the same handle.

use std::fmt;
use std::sync::Arc;

use rtcbridge_core::{BridgeError, Handle, ResourceKind, Result};

use crate::constants::MAX_HANDLE_ATTEMPTS;

/// Source of candidate handles.
pub trait HandleSource: Send + Sync {
    fn next_candidate(&self) -> Handle;
}

/// Random UUID v4 candidates.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomHandles;

impl HandleSource for RandomHandles {
    fn next_candidate(&self) -> Handle {
        Handle::random()
    }
}

/// Allocates collision-free handles from a [`HandleSource`].
#[derive(Clone)]
pub struct IdentityAllocator {
    source: Arc<dyn HandleSource>,
}

impl fmt::Debug for IdentityAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityAllocator").finish_non_exhaustive()
    }
}

impl Default for IdentityAllocator {
    fn default() -> Self {
        Self::new(Arc::new(RandomHandles))
    }
}

impl IdentityAllocator {
    pub fn new(source: Arc<dyn HandleSource>) -> Self {
        Self { source }
    }

    /// Returns the first candidate for which `in_use` is false.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidArgument` if the source keeps producing live handles.
    pub fn allocate(&self, kind: ResourceKind, in_use: impl Fn(&str) -> bool) -> Result<Handle> {
        for attempt in 0..MAX_HANDLE_ATTEMPTS {
            let candidate = self.source.next_candidate();
            if !in_use(candidate.as_str()) {
                return Ok(candidate);
            }
            tracing::warn!(%kind, handle = %candidate, attempt, "handle collision, re-rolling");
        }
        Err(BridgeError::invalid_argument(format!(
            "could not allocate a unique {kind} handle after {MAX_HANDLE_ATTEMPTS} attempts"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Replays a fixed list of candidates, then falls back to random ones.
    struct Scripted(Mutex<Vec<&'static str>>);

    impl HandleSource for Scripted {
        fn next_candidate(&self) -> Handle {
            let mut queue = self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if queue.is_empty() {
                Handle::random()
            } else {
                Handle::from(queue.remove(0))
            }
        }
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn rerolls_on_collision() {
        let allocator =
            IdentityAllocator::new(Arc::new(Scripted(Mutex::new(vec!["taken", "taken", "free"]))));
        let handle = allocator.allocate(ResourceKind::MediaStream, |h| h == "taken").unwrap();
        assert_eq!(handle.as_str(), "free");
    }

    #[test]
    fn gives_up_on_a_stuck_source() {
        struct Stuck;
        impl HandleSource for Stuck {
            fn next_candidate(&self) -> Handle {
                Handle::from("same")
            }
        }
        let allocator = IdentityAllocator::new(Arc::new(Stuck));
        assert!(allocator.allocate(ResourceKind::Session, |_| true).is_err());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn many_allocations_are_unique() {
        let allocator = IdentityAllocator::default();
        let mut live = HashSet::new();
        for _ in 0..1000 {
            let handle =
                allocator.allocate(ResourceKind::MediaTrack, |h| live.contains(h)).unwrap();
            assert!(live.insert(handle.as_str().to_string()));
        }
    }
}
