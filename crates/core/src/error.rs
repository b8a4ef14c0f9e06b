// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Structured error types for the bridge.
//!
//! Every command yields either a [`Value`](crate::value::Value) or a
//! [`BridgeError`]. Errors cross the host boundary as a map of the form
//! `{kind, message, handle?}` built by [`BridgeError::to_value`], so hosts can
//! branch on `kind` without parsing messages.

use std::fmt;

use thiserror::Error;

use crate::handle::ResourceKind;
use crate::value::{Value, ValueKind};

/// Machine-readable error category sent to the host in the `kind` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ResourceNotFound,
    InvalidArgument,
    EngineOperationFailed,
    NotImplemented,
    TypeMismatch,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ResourceNotFound => "ResourceNotFound",
            Self::InvalidArgument => "InvalidArgument",
            Self::EngineOperationFailed => "EngineOperationFailed",
            Self::NotImplemented => "NotImplemented",
            Self::TypeMismatch => "TypeMismatch",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for bridge operations.
///
/// None of these represent a crash: the dispatcher turns each of them into a
/// structured result for the host.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BridgeError {
    /// A handle is unknown to every registry that could hold it.
    ///
    /// Examples:
    /// - `peerConnectionId` refers to a disposed session
    /// - `trackId` is neither a local track nor a remote track of any session
    #[error("{kind} not found: {handle}")]
    ResourceNotFound { kind: ResourceKind, handle: String },

    /// A command argument is missing, has the wrong variant, or is out of range.
    ///
    /// Examples:
    /// - `createDataChannel` without a `label`
    /// - explicit data channel id already in use on the session
    /// - `trackDispose` on a track that a sender still references
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String, handle: Option<String> },

    /// The media engine rejected the request. The engine's message is kept verbatim.
    #[error("{operation} failed: {message}")]
    EngineOperationFailed { operation: String, message: String },

    /// The command name is not recognized.
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// A Value accessor was used against the wrong variant.
    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: ValueKind, found: ValueKind },
}

/// Convenience type alias for Results using `BridgeError`.
pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    pub fn not_found(kind: ResourceKind, handle: impl Into<String>) -> Self {
        Self::ResourceNotFound { kind, handle: handle.into() }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument { message: message.into(), handle: None }
    }

    pub fn invalid_handle(message: impl Into<String>, handle: impl Into<String>) -> Self {
        Self::InvalidArgument { message: message.into(), handle: Some(handle.into()) }
    }

    pub fn engine(operation: impl Into<String>, err: EngineError) -> Self {
        Self::EngineOperationFailed { operation: operation.into(), message: err.0 }
    }

    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::ResourceNotFound { .. } => ErrorKind::ResourceNotFound,
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::EngineOperationFailed { .. } => ErrorKind::EngineOperationFailed,
            Self::NotImplemented(_) => ErrorKind::NotImplemented,
            Self::TypeMismatch { .. } => ErrorKind::TypeMismatch,
        }
    }

    /// The offending handle, when the error is about one.
    pub fn handle(&self) -> Option<&str> {
        match self {
            Self::ResourceNotFound { handle, .. } => Some(handle),
            Self::InvalidArgument { handle, .. } => handle.as_deref(),
            _ => None,
        }
    }

    /// Message for the host. Engine failures pass the engine text through unchanged.
    pub fn message(&self) -> String {
        match self {
            Self::EngineOperationFailed { message, .. } | Self::InvalidArgument { message, .. } => {
                message.clone()
            },
            other => other.to_string(),
        }
    }

    /// Renders the error as `{kind, message, handle?}`.
    pub fn to_value(&self) -> Value {
        let mut value = crate::vmap! {
            "kind" => self.kind().as_str(),
            "message" => self.message(),
        };
        if let Some(handle) = self.handle() {
            value.insert("handle", handle);
        }
        value
    }

    /// Re-labels a Value accessor failure as a bad argument for `field`.
    #[must_use]
    pub fn for_field(self, field: &str) -> Self {
        match self {
            Self::TypeMismatch { expected, found } => Self::invalid_argument(format!(
                "field '{field}' must be {expected}, got {found}"
            )),
            other => other,
        }
    }
}

/// Failure reported by a media engine collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct EngineError(pub String);

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<String> for EngineError {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for EngineError {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BridgeError::not_found(ResourceKind::Session, "abc");
        assert_eq!(err.to_string(), "session not found: abc");

        let err = BridgeError::NotImplemented("frobnicate".to_string());
        assert_eq!(err.to_string(), "Not implemented: frobnicate");
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_error_to_value() {
        let value = BridgeError::not_found(ResourceKind::MediaTrack, "t1").to_value();
        assert_eq!(value.get("kind").unwrap().as_str().unwrap(), "ResourceNotFound");
        assert_eq!(value.get("handle").unwrap().as_str().unwrap(), "t1");

        let value = BridgeError::invalid_argument("label is required").to_value();
        assert_eq!(value.get("message").unwrap().as_str().unwrap(), "label is required");
        assert!(value.get("handle").is_none());
    }

    #[test]
    fn test_engine_message_is_verbatim() {
        let err = BridgeError::engine("createOffer", EngineError::new("no transceivers"));
        assert_eq!(err.message(), "no transceivers");
        assert_eq!(err.kind(), ErrorKind::EngineOperationFailed);
        assert_eq!(err.to_string(), "createOffer failed: no transceivers");
    }

    #[test]
    fn test_type_mismatch_relabels_for_field() {
        let err = BridgeError::TypeMismatch { expected: ValueKind::String, found: ValueKind::Int }
            .for_field("label");
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(err.message(), "field 'label' must be string, got int");
    }
}
