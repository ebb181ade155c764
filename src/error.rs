//! Error types for the monocle library.

use thiserror::Error;

/// The main error type for monocle operations.
#[derive(Debug, Error)]
pub enum Error {
    /// No matching peripheral was seen during the discovery window.
    #[error("device not found: {identity}")]
    DeviceNotFound { identity: String },

    /// A name filter matched more than one peripheral.
    #[error("expected 1 device matching {name}, found {count}")]
    AmbiguousDevice { name: String, count: usize },

    /// The link could not be established or the UART service is missing.
    #[error("connection error: {message}")]
    Connection { message: String },

    /// Operation requires an open session.
    #[error("not connected")]
    NotConnected,

    /// A characteristic write or the link failed mid-operation.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// The connection already has a notification subscriber.
    #[error("notifications already subscribed")]
    AlreadySubscribed,

    /// No matching event arrived in time.
    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Bluetooth platform error.
    #[error("bluetooth error: {0}")]
    Ble(#[from] btleplug::Error),
}

impl Error {
    pub(crate) fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub(crate) fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }
}

/// Result type alias for monocle operations.
pub type Result<T> = std::result::Result<T, Error>;
