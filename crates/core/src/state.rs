// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Engine-reported states for sessions, data channels and frame cryptors.
//!
//! These are advisory: they are forwarded to the host as events and recorded
//! for queries, but the registry lifecycle of a session is driven only by
//! explicit close/dispose commands.
//!
//! ## Session state
//!
//! ```text
//!        New
//!         ↓
//!      Opening        (after createPeerConnection)
//!         ↓
//!    Connecting ←────┐
//!         ↓          │
//!     Connected      │
//!         ↓          │
//!    Disconnected ───┘
//!         ↓
//!   Failed / Closed
//! ```

use std::fmt;

macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident { $($(#[$vmeta:meta])* $variant:ident => $wire:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name { $($(#[$vmeta])* $variant),+ }

        impl $name {
            /// The wire name sent to the host.
            pub const fn as_str(self) -> &'static str {
                match self { $(Self::$variant => $wire),+ }
            }

            /// Parses a wire name.
            pub fn parse(s: &str) -> Option<Self> {
                match s { $($wire => Some(Self::$variant),)+ _ => None }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

wire_enum! {
    /// Whether a track still produces media.
    pub enum TrackState {
        Live => "live",
        Ended => "ended",
    }
}

wire_enum! {
    /// Offer/answer negotiation state.
    pub enum SignalingState {
        Stable => "stable",
        HaveLocalOffer => "have-local-offer",
        HaveLocalPrAnswer => "have-local-pranswer",
        HaveRemoteOffer => "have-remote-offer",
        HaveRemotePrAnswer => "have-remote-pranswer",
        Closed => "closed",
    }
}

wire_enum! {
    /// Aggregate transport state of a connection as reported by the engine.
    pub enum PeerConnectionState {
        New => "new",
        Connecting => "connecting",
        Connected => "connected",
        Disconnected => "disconnected",
        Failed => "failed",
        Closed => "closed",
    }
}

wire_enum! {
    pub enum IceGatheringState {
        New => "new",
        Gathering => "gathering",
        Complete => "complete",
    }
}

wire_enum! {
    pub enum IceConnectionState {
        New => "new",
        Checking => "checking",
        Connected => "connected",
        Completed => "completed",
        Failed => "failed",
        Disconnected => "disconnected",
        Closed => "closed",
    }
}

wire_enum! {
    pub enum DataChannelState {
        Connecting => "connecting",
        Open => "open",
        Closing => "closing",
        Closed => "closed",
    }
}

wire_enum! {
    /// Encryption state of one frame cryptor.
    pub enum FrameCryptionState {
        New => "new",
        Ok => "ok",
        EncryptionFailed => "encryptionFailed",
        DecryptionFailed => "decryptionFailed",
        MissingKey => "missingKey",
        KeyRatcheted => "keyRatcheted",
        InternalError => "internalError",
    }
}

wire_enum! {
    /// Observable state of a session.
    ///
    /// `New` and `Opening` are owned by the bridge; later states mirror the
    /// engine's connection-state callback.
    pub enum SessionPhase {
        New => "new",
        Opening => "opening",
        Connecting => "connecting",
        Connected => "connected",
        Disconnected => "disconnected",
        Failed => "failed",
        Closed => "closed",
    }
}

impl From<PeerConnectionState> for SessionPhase {
    fn from(state: PeerConnectionState) -> Self {
        match state {
            // The engine reports `new` until negotiation starts; the session
            // is already past that point once the command returned.
            PeerConnectionState::New => Self::Opening,
            PeerConnectionState::Connecting => Self::Connecting,
            PeerConnectionState::Connected => Self::Connected,
            PeerConnectionState::Disconnected => Self::Disconnected,
            PeerConnectionState::Failed => Self::Failed,
            PeerConnectionState::Closed => Self::Closed,
        }
    }
}

wire_enum! {
    /// Media kind of a track. Immutable after creation.
    pub enum MediaKind {
        Audio => "audio",
        Video => "video",
    }
}

wire_enum! {
    pub enum TransceiverDirection {
        SendRecv => "sendrecv",
        SendOnly => "sendonly",
        RecvOnly => "recvonly",
        Inactive => "inactive",
        Stopped => "stopped",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_round_trip() {
        assert_eq!(SignalingState::parse("have-local-offer"), Some(SignalingState::HaveLocalOffer));
        assert_eq!(DataChannelState::Closing.as_str(), "closing");
        assert_eq!(FrameCryptionState::parse("missingKey"), Some(FrameCryptionState::MissingKey));
        assert_eq!(MediaKind::parse("screen"), None);
    }

    #[test]
    fn connection_state_maps_onto_phase() {
        assert_eq!(SessionPhase::from(PeerConnectionState::New), SessionPhase::Opening);
        assert_eq!(SessionPhase::from(PeerConnectionState::Failed), SessionPhase::Failed);
    }
}
