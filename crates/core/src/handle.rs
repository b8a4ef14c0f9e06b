// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Opaque handles and the resource kinds they address.

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// The kind of registry entry a handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Session,
    MediaStream,
    MediaTrack,
    DataChannel,
    Renderer,
    FrameCryptor,
    KeyProvider,
    RtpSender,
    RtpReceiver,
    Transceiver,
}

impl ResourceKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::MediaStream => "stream",
            Self::MediaTrack => "track",
            Self::DataChannel => "data channel",
            Self::Renderer => "renderer",
            Self::FrameCryptor => "frame cryptor",
            Self::KeyProvider => "key provider",
            Self::RtpSender => "rtp sender",
            Self::RtpReceiver => "rtp receiver",
            Self::Transceiver => "transceiver",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque string identifier of a registry entry.
///
/// Cheap to clone; borrows as `&str` so maps keyed by `Handle` can be queried
/// with plain string slices.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(Arc<str>);

impl Handle {
    /// A fresh random 128-bit identifier in hyphenated UUID form.
    ///
    /// Uniqueness against live entries is the allocator's job, not this function's.
    pub fn random() -> Self {
        Self(Arc::from(uuid::Uuid::new_v4().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for Handle {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for Handle {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Handle {
    fn from(s: &str) -> Self {
        Self(Arc::from(s))
    }
}

impl From<String> for Handle {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

impl From<Handle> for crate::value::Value {
    fn from(handle: Handle) -> Self {
        Self::String(handle.0.to_string())
    }
}

impl From<&Handle> for crate::value::Value {
    fn from(handle: &Handle) -> Self {
        Self::String(handle.0.to_string())
    }
}

/// Address of one event stream the host can subscribe to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventStream {
    /// Session-level events (negotiation state, discovery, candidates).
    Session(Handle),
    /// Per data channel state and message events.
    DataChannel { session: Handle, id: u32 },
    /// Frame size, rotation and first-frame notifications of one renderer.
    Renderer(i64),
    /// Encryption state changes of one frame cryptor.
    FrameCryptor(Handle),
}

impl EventStream {
    /// Stable textual name, e.g. `peerConnectionEvent/<handle>`.
    pub fn name(&self) -> String {
        match self {
            Self::Session(h) => format!("peerConnectionEvent/{h}"),
            Self::DataChannel { session, id } => format!("dataChannelEvent/{session}/{id}"),
            Self::Renderer(id) => format!("videoRendererEvent/{id}"),
            Self::FrameCryptor(h) => format!("frameCryptorEvent/{h}"),
        }
    }

    /// Parses a name produced by [`EventStream::name`].
    pub fn parse(name: &str) -> Option<Self> {
        let (prefix, rest) = name.split_once('/')?;
        match prefix {
            "peerConnectionEvent" if !rest.is_empty() => Some(Self::Session(Handle::from(rest))),
            "dataChannelEvent" => {
                let (session, id) = rest.rsplit_once('/')?;
                Some(Self::DataChannel { session: Handle::from(session), id: id.parse().ok()? })
            },
            "videoRendererEvent" => rest.parse().ok().map(Self::Renderer),
            "frameCryptorEvent" if !rest.is_empty() => Some(Self::FrameCryptor(Handle::from(rest))),
            _ => None,
        }
    }
}

impl fmt::Display for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_handles_differ() {
        assert_ne!(Handle::random(), Handle::random());
    }

    #[test]
    fn stream_names_parse_back() {
        let streams = [
            EventStream::Session(Handle::from("s1")),
            EventStream::DataChannel { session: Handle::from("s1"), id: 65536 },
            EventStream::Renderer(3),
            EventStream::FrameCryptor(Handle::from("fc")),
        ];
        for stream in streams {
            assert_eq!(EventStream::parse(&stream.name()), Some(stream));
        }
        assert_eq!(EventStream::parse("bogus/1"), None);
        assert_eq!(EventStream::parse("videoRendererEvent/x"), None);
    }
}
