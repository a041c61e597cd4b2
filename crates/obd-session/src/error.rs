//! Session Error Types

use thiserror::Error;

use crate::executor::TaskKind;

/// Errors surfaced by discovery, negotiation, and diagnostic operations.
///
/// Every failure reaches the control thread as one of these values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiagError {
    /// The OS could not list serial endpoints
    #[error("Could not list serial ports: {0}")]
    Enumeration(String),

    /// Every parameter set was tried without a live session
    #[error("No connection detected. Check ignition, adapter, and cable.")]
    NoDeviceFound,

    /// An attempt raised while opening the link
    #[error("Connection failed: {0}")]
    Transport(String),

    /// A read or clear raised on a session believed live
    #[error("Query failed: {0}")]
    Query(String),

    /// A read or clear was requested without a session
    #[error("Not connected to a vehicle")]
    NotConnected,

    /// A task is already in flight
    #[error("Another operation is still running")]
    Busy,
}

/// Message category shown to the user for a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Nothing to talk to yet
    NotConnected,
    /// Port enumeration failed
    NoPorts,
    /// Negotiation failed
    ConnectionFailed,
    /// Reading codes failed
    ReadError,
    /// Clearing codes failed
    ClearError,
    /// Request refused while busy
    Busy,
}

impl DiagError {
    /// Map the error to a user-facing category, using the task tag to tell
    /// read failures from clear failures
    pub fn category(&self, kind: Option<TaskKind>) -> ErrorCategory {
        match self {
            DiagError::Enumeration(_) => ErrorCategory::NoPorts,
            DiagError::NoDeviceFound | DiagError::Transport(_) => ErrorCategory::ConnectionFailed,
            DiagError::Query(_) => match kind {
                Some(TaskKind::Clear) => ErrorCategory::ClearError,
                _ => ErrorCategory::ReadError,
            },
            DiagError::NotConnected => ErrorCategory::NotConnected,
            DiagError::Busy => ErrorCategory::Busy,
        }
    }
}
