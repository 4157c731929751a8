//! Domain-specific error types for the CAN bridging protocol.
//!
//! All fallible operations return `Result<T, CanError>`.
//! "Not enough bytes yet" is never an error: decoders return `Ok(None)`.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for canremote.
#[derive(Debug, Error)]
pub enum CanError {
    // ── Framing Errors (fatal) ───────────────────────────────────
    /// The leading tag byte does not name any known event.
    #[error("{0} is not a valid event id")]
    UnknownEvent(u8),

    /// An event was well-formed but violated protocol rules.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A length-prefixed string was not valid UTF-8.
    #[error("invalid utf-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// The inbound buffer grew past its cap without yielding an event.
    #[error("receive buffer overflow: {size} bytes (max {max})")]
    BufferOverflow { size: usize, max: usize },

    // ── Message Errors ───────────────────────────────────────────
    /// A message violates the id-width or DLC invariants.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// A caller supplied an argument outside its valid range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // ── Connection Errors ────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection or the bus was shut down.
    #[error("disconnected")]
    Disconnected,

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// The handshake did not complete.
    #[error("initialization failed: {0}")]
    Initialization(String),

    // ── Bus Errors ───────────────────────────────────────────────
    /// A fault reported by the far end of a remote connection.
    #[error("{0}")]
    Remote(String),

    /// The remote bus rejected a transmission.
    #[error("transmit failed")]
    TransmitFailed,

    /// A fault reported by the underlying bus backend.
    #[error("bus error: {0}")]
    Bus(String),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl CanError {
    /// Returns `true` for framing faults, which must tear the connection
    /// down instead of being retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CanError::UnknownEvent(_)
                | CanError::Protocol(_)
                | CanError::InvalidUtf8(_)
                | CanError::BufferOverflow { .. }
        )
    }

    /// Returns `true` when the operation may simply be retried.
    pub fn is_timeout(&self) -> bool {
        match self {
            CanError::Timeout(_) => true,
            CanError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for CanError {
    fn from(s: String) -> Self {
        CanError::Other(s)
    }
}

impl From<&str> for CanError {
    fn from(s: &str) -> Self {
        CanError::Other(s.to_string())
    }
}
