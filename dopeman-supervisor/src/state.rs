use std::fmt;

use serde::Serialize;

/// Lifecycle state of one managed service.
///
/// Transitions only move forward: `NotStarted -> Starting -> Ready`, with
/// `Starting -> Failed` on spawn or readiness failure. `Stopped` is reachable
/// from every state and terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    #[default]
    NotStarted,
    Starting,
    Ready,
    Failed,
    Stopped,
}

impl ServiceState {
    pub fn can_transition_to(self, next: ServiceState) -> bool {
        use ServiceState::*;
        matches!(
            (self, next),
            (NotStarted, Starting)
                | (Starting, Ready)
                | (Starting, Failed)
                | (NotStarted | Starting | Ready | Failed, Stopped)
        )
    }

    /// Whether a process for this service may be alive.
    pub fn is_active(self) -> bool {
        matches!(self, ServiceState::Starting | ServiceState::Ready)
    }

    pub fn is_terminal(self) -> bool {
        self == ServiceState::Stopped
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceState::NotStarted => "not started",
            ServiceState::Starting => "starting",
            ServiceState::Ready => "ready",
            ServiceState::Failed => "failed",
            ServiceState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Phase of the supervisor as a whole.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorPhase {
    #[default]
    Idle,
    Starting,
    Running,
    /// Terminal; a new supervisor must be constructed to start again.
    Stopped,
}
