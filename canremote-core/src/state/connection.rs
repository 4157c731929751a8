//! Lifecycle of a remote bus link, shared by client and server sessions.
//!
//! Transitions are validated and return `Result` instead of panicking.

use std::time::{Duration, Instant};

use crate::error::CanError;

// ── ConnectionPhase ──────────────────────────────────────────────

/// The current phase of a remote bus link.
///
/// ```text
///  Connecting ──► Handshaking ──► Open
///       │               │           │
///       ▼               ▼           ▼
///       └──────────► Closed ◄───────┘
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionPhase {
    /// Socket not yet established. Initial state.
    #[default]
    Connecting,

    /// Socket is up; BusRequest/FilterConfig/BusResponse exchange pending.
    Handshaking,

    /// Handshake complete; frames flow both ways.
    Open {
        /// When the link entered the `Open` state.
        since: Instant,
    },

    /// Terminal.
    Closed,
}

impl std::fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "Connecting"),
            Self::Handshaking => write!(f, "Handshaking"),
            Self::Open { .. } => write!(f, "Open"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

impl ConnectionPhase {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// How long the link has been open. `None` in any other phase.
    pub fn open_duration(&self) -> Option<Duration> {
        match self {
            Self::Open { since } => Some(since.elapsed()),
            _ => None,
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Transition to `Handshaking`.
    ///
    /// Valid from: `Connecting`.
    pub fn begin_handshake(&mut self) -> Result<(), CanError> {
        match self {
            Self::Connecting => {
                *self = Self::Handshaking;
                Ok(())
            }
            other => Err(CanError::Protocol(format!(
                "cannot handshake: link is {other}"
            ))),
        }
    }

    /// Transition to `Open`.
    ///
    /// Valid from: `Handshaking`.
    pub fn open(&mut self) -> Result<(), CanError> {
        match self {
            Self::Handshaking => {
                *self = Self::Open {
                    since: Instant::now(),
                };
                Ok(())
            }
            other => Err(CanError::Protocol(format!(
                "cannot open: link is {other}"
            ))),
        }
    }

    /// Transition to `Closed`.
    ///
    /// Valid from every phase but `Closed`.
    pub fn close(&mut self) -> Result<(), CanError> {
        match self {
            Self::Closed => Err(CanError::Protocol("link is already closed".into())),
            _ => {
                *self = Self::Closed;
                Ok(())
            }
        }
    }

    /// Move to `Closed` regardless of the current phase.
    pub fn force_close(&mut self) {
        *self = Self::Closed;
    }
}

// ── Tests ────────────────────────────────────────────────────────
