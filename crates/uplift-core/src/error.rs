//! Core error types for uplift-core

use thiserror::Error;

use crate::resume::RunStatus;
use crate::state::SchedulerState;

/// Errors that terminate a scheduler request
///
/// Actor failures never show up here; they are recorded as outcomes. Only
/// engine defects and misuse of the engine surface as `CoreError`.
#[derive(Error, Debug, Clone)]
pub enum CoreError {
    /// The workflow failed static validation
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Persisted state could not be written or read
    #[error(transparent)]
    Persist(#[from] PersistError),

    /// Persisted message log is inconsistent
    #[error(transparent)]
    Bus(#[from] BusError),

    /// Run belongs to a different workflow
    #[error("run {run_id} belongs to workflow '{found}', not '{expected}'")]
    WorkflowMismatch {
        /// Run identifier
        run_id: String,
        /// Workflow being executed
        expected: String,
        /// Workflow recorded in the run
        found: String,
    },

    /// Run already reached a terminal status
    #[error("run {run_id} cannot be resumed: {status}")]
    RunNotResumable {
        /// Run identifier
        run_id: String,
        /// Terminal status of the run
        status: RunStatus,
    },

    /// No run is waiting to be resumed
    #[error("no resumable run found for workflow '{0}'")]
    NothingToResume(String),

    /// `until_phase` names a phase the workflow does not define
    #[error("unknown phase: {0}")]
    UnknownPhase(String),

    /// Invalid state transition attempted
    #[error("invalid state transition from {from} to {to}")]
    InvalidTransition {
        /// Current state
        from: SchedulerState,
        /// Attempted target state
        to: SchedulerState,
    },

    /// Reboot hook failed after state was persisted
    #[error("reboot failed: {0}")]
    RebootFailed(String),
}

/// Errors raised while registering models or actors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Actor name already registered
    #[error("actor already registered: {0}")]
    DuplicateActor(String),

    /// Model name already registered
    #[error("model already registered: {0}")]
    DuplicateModel(String),

    /// Actor has no phase tag
    #[error("actor {0} has no phase tag")]
    MissingPhaseTag(String),

    /// Actor has no workflow tag
    #[error("actor {0} has no workflow tag")]
    MissingWorkflowTag(String),

    /// Actor carries more than one phase or workflow tag
    #[error("actor {actor} has conflicting {kind} tags: {first} and {second}")]
    ConflictingTags {
        /// Actor name
        actor: String,
        /// `phase` or `workflow`
        kind: &'static str,
        /// First tag seen
        first: String,
        /// Second tag seen
        second: String,
    },

    /// Empty actor or model name
    #[error("empty {0} name")]
    EmptyName(&'static str),
}

/// Errors raised by the message bus and actor context
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Actor tried to read a model it does not declare in `consumes`
    #[error("actor {actor} does not consume {model}")]
    UndeclaredConsume {
        /// Actor name
        actor: String,
        /// Model name
        model: String,
    },

    /// Actor tried to write a model it does not declare in `produces`
    #[error("actor {actor} does not produce {model}")]
    UndeclaredProduce {
        /// Actor name
        actor: String,
        /// Model name
        model: String,
    },

    /// Payload could not be serialized or deserialized
    #[error("serialization of {model} failed: {reason}")]
    Serialization {
        /// Model name
        model: String,
        /// Underlying serde error
        reason: String,
    },

    /// Payload does not match the registered schema
    #[error("payload for {model} violates its schema: {reason}")]
    SchemaViolation {
        /// Model name
        model: String,
        /// First mismatch found
        reason: String,
    },

    /// Persisted log is not strictly ordered by `seq`
    #[error("message log out of order: seq {seq} follows {previous}")]
    OutOfOrder {
        /// Offending sequence number
        seq: u64,
        /// Sequence number before it
        previous: u64,
    },
}

/// Errors raised by the resume manager and state stores
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistError {
    /// No persisted state for this run
    #[error("run not found: {0}")]
    NotFound(String),

    /// Persisted state exists but cannot be decoded
    #[error("corrupted state for run {run_id}: {reason}")]
    Corrupted {
        /// Run identifier
        run_id: String,
        /// What went wrong
        reason: String,
    },

    /// Storage backend I/O failure
    #[error("storage I/O error: {0}")]
    Io(String),

    /// State could not be serialized
    #[error("failed to serialize state: {0}")]
    Serialization(String),
}

/// Static validation failure; lists every issue found
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("workflow '{workflow}' failed validation: {}", format_issues(.issues))]
pub struct ValidationError {
    /// Workflow name
    pub workflow: String,
    /// Every problem found
    pub issues: Vec<ValidationIssue>,
}

fn format_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// A single reason a workflow is rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationIssue {
    /// Two phases share a name
    #[error("phase {0} is defined more than once")]
    DuplicatePhase(String),

    /// Stage changes without a `new-stage` reboot in between
    #[error("phase {phase} moves from stage {previous} to {stage} without a new-stage reboot")]
    UnexpectedStageChange {
        /// Phase that starts the new stage
        phase: String,
        /// Stage of the phase before it
        previous: String,
        /// Stage of this phase
        stage: String,
    },

    /// A `new-stage` reboot is followed by a phase of the same stage
    #[error("phase {phase} follows a new-stage reboot but stays in stage {stage}")]
    StageNotAdvanced {
        /// Phase after the reboot
        phase: String,
        /// Stage that did not change
        stage: String,
    },

    /// Actor tagged with a phase the workflow does not define
    #[error("actor {actor} is tagged with unknown phase {phase}")]
    UnknownPhase {
        /// Actor name
        actor: String,
        /// Phase tag
        phase: String,
    },

    /// Actor references a model that is not registered
    #[error("actor {actor} references unregistered model {model}")]
    UnknownModel {
        /// Actor name
        actor: String,
        /// Model name
        model: String,
    },

    /// Consumed model has no producer in the same or an earlier phase
    #[error("{}", describe_missing_producer(.actor, .phase, .model, .later_producers))]
    MissingProducer {
        /// Consuming actor
        actor: String,
        /// Phase of the consumer
        phase: String,
        /// Model without an eligible producer
        model: String,
        /// Producers that only run in later phases
        later_producers: Vec<String>,
    },

    /// Actors of a phase depend on each other in a cycle
    #[error("dependency cycle in phase {phase}: {}", .actors.join(" -> "))]
    Cycle {
        /// Phase name
        phase: String,
        /// Actors in the cycle
        actors: Vec<String>,
    },
}

fn describe_missing_producer(
    actor: &str,
    phase: &str,
    model: &str,
    later_producers: &[String],
) -> String {
    if later_producers.is_empty() {
        format!("actor {actor} (phase {phase}) consumes {model} but nothing produces it")
    } else {
        format!(
            "actor {actor} (phase {phase}) consumes {model} but it is only produced later by {}",
            later_producers.join(", ")
        )
    }
}

/// Error returned by an actor entry point
///
/// `Failed` is isolated to the actor unless the actor is required.
/// `Fatal` always aborts the run.
#[derive(Error, Debug, Clone)]
pub enum ActorError {
    /// The actor could not do its job
    #[error("{0}")]
    Failed(String),

    /// The actor detected a condition that must stop the whole upgrade
    #[error("fatal: {0}")]
    Fatal(String),

    /// Message bus misuse or payload error
    #[error(transparent)]
    Bus(#[from] BusError),

    /// External command failed
    #[error(transparent)]
    Command(#[from] uplift_exec::ExecError),
}

impl ActorError {
    /// Create a non-fatal failure
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }

    /// Create a fatal failure
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal(reason.into())
    }

    /// Whether this error aborts the run regardless of the `required` flag
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}
