//! Message types for the scheduler actor
//!
//! Message handlers live in `actor::scheduler`.

use kameo_macros::Reply;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::RunOptions;
use crate::dialog::Question;
use crate::resume::RunStatus;
use crate::workflow::RebootBoundary;

// ============================================================================
// Requests
// ============================================================================

/// Start a new run or resume a persisted one
#[derive(Debug, Default)]
pub struct RunWorkflow {
    /// Run options
    pub options: RunOptions,
}

/// Validate the workflow and return the execution plan without running it
#[derive(Debug, Default)]
pub struct CheckWorkflow {
    /// Experimental actors to include
    pub enable_experimental: std::collections::BTreeSet<String>,
}

/// List persisted runs
#[derive(Debug)]
pub struct ListRuns;

/// Remove a persisted run
#[derive(Debug)]
pub struct DeleteRun {
    /// Run to remove
    pub run_id: String,
}

/// Record a dialog answer for the next invocation of a run
#[derive(Debug)]
pub struct AnswerQuestion {
    /// Run identifier
    pub run_id: String,
    /// Question identifier
    pub question_id: String,
    /// Answer value
    pub value: Value,
}

/// Get the current scheduler state
#[derive(Debug)]
pub struct GetState;

// ============================================================================
// Replies
// ============================================================================

/// How a single actor invocation ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActorOutcome {
    Success,
    SoftSkip { reason: String },
    Error { error: String },
    Fatal { error: String },
}

impl ActorOutcome {
    /// Whether the outcome aborts the run
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }
}

/// One actor invocation of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorRecord {
    /// Actor name
    pub actor: String,
    /// Phase it ran in
    pub phase: String,
    /// Result
    pub outcome: ActorOutcome,
}

/// Result of a `RunWorkflow` request
#[derive(Debug, Clone, Serialize, Deserialize, Reply)]
pub struct RunReport {
    /// Run identifier
    pub run_id: String,
    /// Workflow name
    pub workflow: String,
    /// Status the run ended this invocation with
    pub status: RunStatus,
    /// Actors invoked during this invocation, in execution order
    pub actors: Vec<ActorRecord>,
    /// Questions still waiting for an answer
    pub pending_questions: Vec<Question>,
}

impl RunReport {
    /// Invocations of `actor` during this invocation
    pub fn invocations<'a>(&'a self, actor: &'a str) -> impl Iterator<Item = &'a ActorRecord> {
        self.actors.iter().filter(move |r| r.actor == actor)
    }

    /// Whether `actor` was invoked
    #[must_use]
    pub fn ran(&self, actor: &str) -> bool {
        self.invocations(actor).next().is_some()
    }
}

/// A phase with its validated actor order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedPhase {
    /// Phase name
    pub name: String,
    /// Reboot segment
    pub stage: String,
    /// Inhibitors are evaluated after this phase
    pub checkpoint: bool,
    /// Reboot boundary after this phase
    pub reboot: Option<RebootBoundary>,
    /// Actors in execution order
    pub actors: Vec<String>,
}

/// Result of a `CheckWorkflow` request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Reply)]
pub struct WorkflowPlan {
    /// Workflow name
    pub workflow: String,
    /// Phases in order
    pub phases: Vec<PlannedPhase>,
    /// `(producer, consumer, models)` edges of the dependency graph
    pub edges: Vec<(String, String, Vec<String>)>,
    /// Actors left out of the run
    pub excluded: Vec<String>,
}
