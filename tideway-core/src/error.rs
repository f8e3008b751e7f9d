//! Error taxonomy shared by the protocol handlers.

use std::fmt;

/// A handler failure, either reported to the peer on the paired response or
/// signalling that the transport closed underneath an outbound send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Encoded onto the paired response with an HTTP-like status code.
    Protocol { code: u16, message: String },
    /// The transport is closed. Background tasks treat this as a clean
    /// shutdown; foreground handlers surface it as-is.
    SenderClosed,
}

impl HandlerError {
    #[must_use]
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self::Protocol {
            code,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, message)
    }

    #[must_use]
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(403, message)
    }

    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(404, message)
    }

    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(409, message)
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(500, message)
    }

    /// The wire status code, when this failure is reportable to the peer.
    #[must_use]
    pub fn code(&self) -> Option<u16> {
        match self {
            Self::Protocol { code, .. } => Some(*code),
            Self::SenderClosed => None,
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol { code, message } => write!(f, "{code} {message}"),
            Self::SenderClosed => f.write_str("message sender is closed"),
        }
    }
}

impl std::error::Error for HandlerError {}
