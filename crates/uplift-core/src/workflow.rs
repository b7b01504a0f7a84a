//! Workflow and phase definitions

use std::fmt;

use serde::{Deserialize, Serialize};

/// What happens after a phase that ends with a reboot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RebootBoundary {
    /// Reboot and keep running phases of the same stage
    ContinueStage,
    /// Reboot into the next stage
    NewStage,
}

impl fmt::Display for RebootBoundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RebootBoundary::ContinueStage => write!(f, "continue-stage"),
            RebootBoundary::NewStage => write!(f, "new-stage"),
        }
    }
}

/// An ordered group of actors sharing a phase tag
///
/// The order index of a phase is its position in [`Workflow::phases`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    /// Phase name, matched against actor phase tags
    pub name: String,
    /// Reboot segment the phase belongs to
    pub stage: String,
    /// Evaluate inhibitors after this phase
    #[serde(default)]
    pub checkpoint: bool,
    /// Reboot after this phase completes
    #[serde(default)]
    pub reboot: Option<RebootBoundary>,
}

impl Phase {
    /// Create a plain phase
    pub fn new(name: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stage: stage.into(),
            checkpoint: false,
            reboot: None,
        }
    }

    /// Mark as a report/verify checkpoint
    #[must_use]
    pub fn checkpoint(mut self) -> Self {
        self.checkpoint = true;
        self
    }

    /// Reboot once the phase completes
    #[must_use]
    pub fn reboot_after(mut self, boundary: RebootBoundary) -> Self {
        self.reboot = Some(boundary);
        self
    }
}

/// A totally ordered list of phases
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workflow {
    /// Workflow name, matched against actor workflow tags
    pub name: String,
    /// Phases in execution order
    pub phases: Vec<Phase>,
}

impl Workflow {
    /// Create a workflow without phases
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phases: Vec::new(),
        }
    }

    /// Append a phase
    #[must_use]
    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phases.push(phase);
        self
    }

    /// Order index of a phase
    #[must_use]
    pub fn phase_index(&self, name: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.name == name)
    }

    /// Phase at `index`
    #[must_use]
    pub fn phase(&self, index: usize) -> Option<&Phase> {
        self.phases.get(index)
    }
}
