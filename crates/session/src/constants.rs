// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Shared constants for the session layer.

// === Identifiers ===

/// Stream id some engines reuse for the first auto-negotiated remote stream
/// of every connection. Never used as a handle directly.
pub const DEFAULT_STREAM_ID: &str = "default";

/// Owner tag selecting process-scoped (local) resources in renderer bindings.
pub const LOCAL_OWNER_TAG: &str = "local";

/// First id handed to data channels whose wire id is not visible to the
/// bridge. Explicit ids live in the 16-bit range below this value, so the two
/// sets can never overlap.
pub const SYNTHETIC_DATA_CHANNEL_ID_BASE: u32 = 65_536;

/// First numeric surface handle assigned to renderers.
pub const FIRST_TEXTURE_ID: i64 = 1;

// === Bookkeeping ===

/// How many disposed handles are remembered so that a repeated dispose is a
/// no-op instead of `ResourceNotFound`.
///
/// Oldest entries are forgotten first. A host that disposes a handle after
/// this many newer disposals gets `ResourceNotFound` instead of a no-op.
pub const RETIRED_HANDLE_CAPACITY: usize = 4096;

/// Maximum number of candidates the identity allocator draws before giving up.
///
/// With 122 random bits per candidate a second draw is already astronomically
/// unlikely; the bound only turns a broken handle source into an error.
pub const MAX_HANDLE_ATTEMPTS: usize = 64;
