//! Failure taxonomy for remote writes and the sync subsystem.

use serde::Serialize;
use shared_types::{EntityId, TicketId};

/// How a failed remote call is handled: retried, rolled back loudly, or silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Network,
    Validation,
    Conflict,
    Auth,
    Unknown,
}

impl FailureKind {
    /// Transient failures get exactly one automatic retry.
    pub fn retries(self) -> bool {
        matches!(self, FailureKind::Network | FailureKind::Unknown)
    }

    /// Auth failures are left to the session-expiry flow; no toast.
    pub fn is_silent(self) -> bool {
        matches!(self, FailureKind::Auth)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Network => write!(f, "network"),
            FailureKind::Validation => write!(f, "validation"),
            FailureKind::Conflict => write!(f, "conflict"),
            FailureKind::Auth => write!(f, "auth"),
            FailureKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// Error returned by the remote data service
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RemoteError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Validation error ({status}): {message}")]
    Validation { status: u16, message: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Auth error ({status})")]
    Auth { status: u16 },

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl RemoteError {
    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => RemoteError::Auth { status },
            409 | 412 => RemoteError::Conflict(message),
            408 | 429 | 502 | 503 | 504 => RemoteError::Network(format!("HTTP {status}: {message}")),
            400..=499 => RemoteError::Validation { status, message },
            _ => RemoteError::Unknown(format!("HTTP {status}: {message}")),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            RemoteError::Network(_) => FailureKind::Network,
            RemoteError::Validation { .. } => FailureKind::Validation,
            RemoteError::Conflict(_) => FailureKind::Conflict,
            RemoteError::Auth { .. } => FailureKind::Auth,
            RemoteError::Unknown(_) => FailureKind::Unknown,
        }
    }
}

/// Errors surfaced by the sync subsystem to view code
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("Unknown ticket: {0}")]
    UnknownTicket(TicketId),

    #[error("Dispatch lane closed for entity {0}")]
    LaneClosed(EntityId),

    #[error("View has been torn down")]
    Detached,

    #[error("Poller error: {0}")]
    Poller(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for SyncError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value.to_string())
    }
}
