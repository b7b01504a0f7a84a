//! Scheduler state machine types

use std::fmt;

use kameo_macros::Reply;

/// States of the `SchedulerActor`
///
/// ```text
/// NotStarted -> Running(0) -> Running(i+1) -> Completed
///                    |
///                    +-> Halted | Failed | AwaitingReboot | Paused | Interrupted
/// ```
///
/// Every state except `NotStarted` and `Running` ends the current
/// invocation; the next `RunWorkflow` request starts again from
/// `NotStarted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Reply)]
pub enum SchedulerState {
    NotStarted,
    Running { phase_index: usize },
    AwaitingReboot,
    Paused,
    Interrupted,
    Halted,
    Failed,
    Completed,
}

impl SchedulerState {
    /// Whether a run is in progress
    #[must_use]
    pub fn is_busy(self) -> bool {
        matches!(self, Self::Running { .. })
    }

    /// Whether this state ends the current invocation
    #[must_use]
    pub fn is_final(self) -> bool {
        !matches!(self, Self::NotStarted | Self::Running { .. })
    }

    /// Check whether moving to `next` is legal
    #[must_use]
    pub fn can_transition_to(self, next: SchedulerState) -> bool {
        use SchedulerState::{
            AwaitingReboot, Completed, Failed, Halted, Interrupted, NotStarted, Paused, Running,
        };

        match (self, next) {
            (NotStarted, Running { .. } | Completed | Failed) => true,
            // Phases only move forward, one at a time
            (Running { phase_index: from }, Running { phase_index: to }) => to == from + 1,
            (
                Running { .. },
                AwaitingReboot | Paused | Interrupted | Halted | Failed | Completed,
            ) => true,
            // A new request resets the machine
            (current, NotStarted) => current.is_final(),
            _ => false,
        }
    }
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::Running { phase_index } => write!(f, "running({phase_index})"),
            Self::AwaitingReboot => write!(f, "awaiting_reboot"),
            Self::Paused => write!(f, "paused"),
            Self::Interrupted => write!(f, "interrupted"),
            Self::Halted => write!(f, "halted"),
            Self::Failed => write!(f, "failed"),
            Self::Completed => write!(f, "completed"),
        }
    }
}
