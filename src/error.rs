//! Error taxonomy shared by the adapter, the authorization gate and the controller.

use std::time::Duration;

use thiserror::Error;

/// Failure reported by a service-manager adapter. Never retried by the adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("service manager unavailable: {0}")]
    ManagerUnavailable(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("corrupt registration: {0}")]
    Corrupt(String),
}

impl ServiceError {
    pub(crate) fn timed_out(what: &str, after: Duration) -> Self {
        ServiceError::Timeout(format!("{what} did not finish within {after:?}"))
    }
}

/// Failure to obtain an authorization ticket.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("authorization denied")]
    Denied,

    #[error("authorization cancelled by user")]
    Cancelled,

    #[error("authorization provider unavailable: {0}")]
    ProviderUnavailable(String),
}

/// Failure to enumerate the process table.
#[derive(Debug, Error)]
pub enum InspectError {
    #[error("failed to run ps: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("ps exited with {status}: {stderr}")]
    Exit { status: String, stderr: String },
}

/// Error returned to callers of the lifecycle controller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    /// Another start/stop transition is still in flight.
    #[error("another start/stop request is in progress")]
    Busy,

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    /// The caller cancelled; the state reads Unknown until the next poll.
    #[error("request cancelled")]
    Cancelled,
}
