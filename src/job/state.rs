//! Job lifecycle states.

use serde::Serialize;

/// Lifecycle of one submitted job.
///
/// `Created → Submitted → Running → {Completed | Failed | Cancelled}`.
/// A job may also fail or be cancelled before the agent reports `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Built by the controller, not yet handed to a channel.
    Created,
    /// Handed to a channel.
    Submitted,
    /// The agent started executing.
    Running,
    /// The agent returned a result.
    Completed,
    /// Execution raised an unexpected error or the transport broke.
    Failed,
    /// The cancellation signal fired before completion.
    Cancelled,
}

impl JobState {
    /// Returns true for `Completed`, `Failed` and `Cancelled`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true if `next` is a legal successor of this state.
    #[must_use]
    pub const fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Submitted)
                | (Self::Submitted, Self::Running | Self::Failed | Self::Cancelled)
                | (Self::Running, Self::Completed | Self::Failed | Self::Cancelled)
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Submitted => "submitted",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}
