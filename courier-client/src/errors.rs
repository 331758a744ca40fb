//! Error types for courier-client.

use std::fmt;

/// What went wrong at the transport level.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransportErrorKind {
    /// The TCP connection could not be established.
    ConnectionFailed,
    /// The established socket reported an I/O failure.
    Io,
    /// The peer sent bytes that do not parse as a frame.
    InvalidFrame,
}

/// A transport-level failure, surfaced through the transport's event stream.
#[derive(Clone, Debug, PartialEq)]
pub struct TransportError {
    pub kind:    TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TransportErrorKind::ConnectionFailed => write!(f, "connection failed: {}", self.message),
            TransportErrorKind::Io               => write!(f, "I/O error: {}", self.message),
            TransportErrorKind::InvalidFrame     => write!(f, "invalid frame: {}", self.message),
        }
    }
}

impl std::error::Error for TransportError {}
