//! Pure transition function for the daemon's recorded state.
//!
//! The controller feeds every event through [`step`]; nothing else writes
//! [`ServiceState`].

use std::fmt;

use serde::Serialize;

/// Recorded state of the managed daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "state", content = "reason")]
pub enum ServiceState {
    Unknown,
    Stopped,
    Starting,
    Running,
    Stopping,
    Error(String),
}

impl ServiceState {
    /// Starting or Stopping: a transition is being settled.
    pub fn is_transitional(&self) -> bool {
        matches!(self, ServiceState::Starting | ServiceState::Stopping)
    }

    pub fn is_running(&self) -> bool {
        *self == ServiceState::Running
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::Unknown => f.write_str("unknown"),
            ServiceState::Stopped => f.write_str("stopped"),
            ServiceState::Starting => f.write_str("starting"),
            ServiceState::Running => f.write_str("running"),
            ServiceState::Stopping => f.write_str("stopping"),
            ServiceState::Error(reason) => write!(f, "error: {reason}"),
        }
    }
}

/// Inputs that may move the state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The adapter accepted a start directive.
    StartIssued,
    /// The adapter accepted a stop directive.
    StopIssued,
    /// An adapter call failed or a transition timed out.
    Failed(String),
    /// The caller gave up waiting.
    Cancelled,
    /// Result of a process-table probe. `running` is `None` when the table
    /// could not be read.
    Observed {
        running: Option<bool>,
        settle_expired: bool,
    },
}

/// Apply `event` to `current`. Returns the new state only when it differs.
pub fn step(current: &ServiceState, event: Event) -> Option<ServiceState> {
    let next = match event {
        Event::StartIssued => ServiceState::Starting,
        Event::StopIssued => ServiceState::Stopping,
        Event::Failed(reason) => ServiceState::Error(reason),
        Event::Cancelled => ServiceState::Unknown,
        Event::Observed {
            running,
            settle_expired,
        } => observe(current, running, settle_expired)?,
    };
    (next != *current).then_some(next)
}

fn observe(
    current: &ServiceState,
    running: Option<bool>,
    settle_expired: bool,
) -> Option<ServiceState> {
    // An unreadable process table counts as "not running", except that it
    // is not evidence enough to leave an error.
    if running.is_none() && matches!(current, ServiceState::Error(_)) {
        return None;
    }
    let running = running.unwrap_or(false);

    let next = match current {
        ServiceState::Starting if running => ServiceState::Running,
        ServiceState::Starting if !settle_expired => return None,
        ServiceState::Starting => {
            ServiceState::Error("daemon did not reach the running state in time".to_string())
        }
        ServiceState::Stopping if !running => ServiceState::Stopped,
        ServiceState::Stopping if !settle_expired => return None,
        ServiceState::Stopping => {
            ServiceState::Error("daemon is still running after the stop request".to_string())
        }
        _ if running => ServiceState::Running,
        _ => ServiceState::Stopped,
    };
    Some(next)
}
