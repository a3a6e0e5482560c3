// src/io/error.rs
//
// Adapter-level error taxonomy shared by every transport.

use thiserror::Error;

/// Errors raised by transport adapters and the receive worker.
///
/// `Open` and `Io` change connection state and are always surfaced to the
/// caller. `Decode` and `Send` are per-unit failures: the offending line or
/// send attempt is dropped and logged, the session carries on.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum IoError {
    /// Device unavailable, misconfigured, or handshake failed
    #[error("{device}: connection failed: {message}")]
    Open { device: String, message: String },

    /// Mid-session read/write failure that ends the session
    #[error("{device}: I/O error: {message}")]
    Io { device: String, message: String },

    /// A single malformed unit from the wire
    #[error("{device}: malformed frame: {message}")]
    Decode { device: String, message: String },

    /// The adapter refused one send attempt
    #[error("{device}: send failed: {message}")]
    Send { device: String, message: String },

    /// Connection settings cannot be honoured
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A send was attempted while no adapter is open
    #[error("not connected")]
    NotConnected,
}

impl IoError {
    pub fn connection(device: impl Into<String>, message: impl Into<String>) -> Self {
        IoError::Open {
            device: device.into(),
            message: message.into(),
        }
    }

    pub fn read(device: impl Into<String>, message: impl Into<String>) -> Self {
        IoError::Io {
            device: device.into(),
            message: message.into(),
        }
    }

    pub fn protocol(device: impl Into<String>, message: impl Into<String>) -> Self {
        IoError::Decode {
            device: device.into(),
            message: message.into(),
        }
    }

    pub fn send(device: impl Into<String>, message: impl Into<String>) -> Self {
        IoError::Send {
            device: device.into(),
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        IoError::Configuration(message.into())
    }

    /// True for errors that end the current session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, IoError::Open { .. } | IoError::Io { .. })
    }
}

impl From<IoError> for String {
    fn from(e: IoError) -> String {
        e.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_device() {
        let e = IoError::connection("serial(/dev/ttyUSB0)", "permission denied");
        assert_eq!(
            e.to_string(),
            "serial(/dev/ttyUSB0): connection failed: permission denied"
        );
    }

    #[test]
    fn test_fatal_classification() {
        assert!(IoError::read("x", "gone").is_fatal());
        assert!(IoError::connection("x", "busy").is_fatal());
        assert!(!IoError::protocol("x", "bad hex").is_fatal());
        assert!(!IoError::send("x", "buffer full").is_fatal());
        assert!(!IoError::NotConnected.is_fatal());
    }
}
