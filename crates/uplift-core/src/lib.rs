//! uplift-core: phase-ordered actor orchestration for in-place upgrades
//!
//! Validates that every consumed model has a producer early enough in the
//! workflow, runs actors phase by phase through the `SchedulerActor`,
//! stops at checkpoints when inhibitors were reported and persists enough
//! state to resume after a reboot.

pub mod actor;
pub mod bus;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod dialog;
pub mod error;
pub mod halt;
pub mod message;
pub mod model;
pub mod registry;
pub mod resume;
pub mod state;
pub mod validate;
pub mod workflow;

pub use actor::scheduler::{NoReboot, RebootHook, SchedulerActor, SchedulerActorArgs};
pub use bus::{Message as BusMessage, MessageBus};
pub use config::{ConfigBag, ConfigValue, RunOptions, SchedulerConfig};
pub use context::{ActorContext, PendingMessage};
pub use descriptor::{
    ActorDescriptor, ActorDescriptorBuilder, ActorEntrypoint, ActorTags, EXPERIMENTAL, Outcome,
    Tag,
};
pub use dialog::{Answer, DialogManager, Question};
pub use error::{
    ActorError, BusError, CoreError, PersistError, RegistryError, ValidationError,
    ValidationIssue,
};
pub use halt::{Inhibitor, inhibitors, should_halt};
pub use message::{
    ActorOutcome, ActorRecord, AnswerQuestion, CheckWorkflow, DeleteRun, GetState, ListRuns,
    PlannedPhase, RunReport, RunWorkflow, WorkflowPlan,
};
pub use model::{
    FieldKind, FieldSpec, INHIBITOR_FLAG, Model, ModelRegistry, ModelSchema, REPORT_MODEL, Report,
    Severity,
};
pub use registry::ActorRegistry;
pub use resume::{
    ExecutionState, FileStateStore, MemoryStateStore, ResumeManager, RunStatus, RunSummary,
    STATE_FORMAT_VERSION, StateStore,
};
pub use state::SchedulerState;
pub use validate::{
    DependencyGraph, PhasePlan, ValidatedWorkflow, ValidationOptions, validate, validate_with,
};
pub use workflow::{Phase, RebootBoundary, Workflow};
