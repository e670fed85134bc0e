//! Error types
//!
//! A single error enum is shared by every component. Link-level failures are
//! reported as state transitions on the affected link, so the variants here
//! only cover failures that a caller has to act on.

use std::fmt;

/// Result type alias using the crate error
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for live-broadcast operations
#[derive(Debug)]
pub enum Error {
    /// Capture permission refused by the user or the platform
    DeviceAccessDenied(String),
    /// The realtime transport could not accept or deliver a message
    SignalingDeliveryFailure(String),
    /// Session description or candidate could not be applied
    NegotiationFailure(String),
    /// Capture-to-file facility missing or failed at start
    RecorderUnavailable(String),
    /// Operation not valid in the component's current state
    InvalidState(String),
    /// Broadcaster already has a live session
    SessionAlreadyLive(String),
    /// Session id not known to the registry
    SessionNotFound(String),
    /// Component has been closed
    Closed,
    /// I/O error
    Io(std::io::Error),
    /// Envelope (de)serialization error
    Serialization(serde_json::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::DeviceAccessDenied(device) => write!(f, "Device access denied: {}", device),
            Error::SignalingDeliveryFailure(msg) => {
                write!(f, "Signaling delivery failure: {}", msg)
            }
            Error::NegotiationFailure(msg) => write!(f, "Negotiation failure: {}", msg),
            Error::RecorderUnavailable(msg) => write!(f, "Recorder unavailable: {}", msg),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::SessionAlreadyLive(broadcaster) => {
                write!(f, "Broadcaster already has a live session: {}", broadcaster)
            }
            Error::SessionNotFound(id) => write!(f, "Session not found: {}", id),
            Error::Closed => write!(f, "Closed"),
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Serialization(e) => write!(f, "Serialization error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Serialization(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = Error::DeviceAccessDenied("camera".into());
        assert_eq!(err.to_string(), "Device access denied: camera");

        let err = Error::SessionAlreadyLive("angler-1".into());
        assert_eq!(
            err.to_string(),
            "Broadcaster already has a live session: angler-1"
        );
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(std::error::Error::source(&err).is_some());
    }
}
