//! `SchedulerActor`: runs a workflow phase by phase
//!
//! Handles one request at a time. A `RunWorkflow` request validates the
//! workflow, creates or restores the run state and walks the phases from
//! the persisted position, committing each actor's messages to the bus as
//! the actor returns.
//!
//! Actor code runs in its own task so that panics and timeouts stay on
//! the actor side of the boundary.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use kameo::actor::{ActorRef, WeakActorRef};
use kameo::error::ActorStopReason;
use kameo::message::{Context, Message};
use kameo::prelude::*;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uplift_exec::{CommandExecutor, ExecError, LocalExecutor};

use crate::config::{ConfigBag, RunOptions, SchedulerConfig};
use crate::context::ActorContext;
use crate::descriptor::{ActorDescriptor, Outcome};
use crate::error::{ActorError, CoreError};
use crate::halt;
use crate::message::{
    ActorOutcome, ActorRecord, AnswerQuestion, CheckWorkflow, DeleteRun, GetState, ListRuns,
    PlannedPhase, RunReport, RunWorkflow, WorkflowPlan,
};
use crate::model::ModelRegistry;
use crate::registry::ActorRegistry;
use crate::resume::{ExecutionState, ResumeManager, RunStatus, RunSummary};
use crate::state::SchedulerState;
use crate::validate::{PhasePlan, ValidatedWorkflow, ValidationOptions, validate_with};
use crate::workflow::{RebootBoundary, Workflow};

/// Called once state is persisted at a reboot boundary
#[async_trait]
pub trait RebootHook: Send + Sync {
    /// Request the reboot
    async fn reboot(&self, state: &ExecutionState, boundary: RebootBoundary)
    -> Result<(), ExecError>;
}

/// Hook that only logs; the operator reboots and reruns
pub struct NoReboot;

#[async_trait]
impl RebootHook for NoReboot {
    async fn reboot(
        &self,
        state: &ExecutionState,
        boundary: RebootBoundary,
    ) -> Result<(), ExecError> {
        info!(run_id = %state.run_id, boundary = %boundary, "reboot required, not rebooting");
        Ok(())
    }
}

/// Arguments for spawning a `SchedulerActor`
pub struct SchedulerActorArgs {
    /// Workflow to run
    pub workflow: Workflow,
    /// Registered actors
    pub actors: Arc<ActorRegistry>,
    /// Registered models
    pub models: Arc<ModelRegistry>,
    /// Run persistence
    pub resume: ResumeManager,
    /// Executor handed to actors
    pub executor: Arc<dyn CommandExecutor>,
    /// Configuration bag handed to actors
    pub config_bag: Arc<ConfigBag>,
    /// Scheduler settings
    pub config: SchedulerConfig,
    /// Called at reboot boundaries
    pub reboot_hook: Arc<dyn RebootHook>,
    /// Flips to `true` when the operator aborts
    pub cancel: watch::Receiver<bool>,
}

impl SchedulerActorArgs {
    /// Arguments with an in-memory store, local executor, no reboot and no cancellation
    #[must_use]
    pub fn new(workflow: Workflow, actors: ActorRegistry, models: ModelRegistry) -> Self {
        let (_, cancel) = watch::channel(false);
        Self {
            workflow,
            actors: Arc::new(actors),
            models: Arc::new(models),
            resume: ResumeManager::in_memory(),
            executor: Arc::new(LocalExecutor::new()),
            config_bag: Arc::new(ConfigBag::new()),
            config: SchedulerConfig::default(),
            reboot_hook: Arc::new(NoReboot),
            cancel,
        }
    }

    /// Use another state store
    #[must_use]
    pub fn with_resume(mut self, resume: ResumeManager) -> Self {
        self.resume = resume;
        self
    }

    /// Use another executor
    #[must_use]
    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = executor;
        self
    }

    /// Set the configuration bag
    #[must_use]
    pub fn with_config_bag(mut self, config_bag: ConfigBag) -> Self {
        self.config_bag = Arc::new(config_bag);
        self
    }

    /// Set scheduler settings
    #[must_use]
    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the reboot hook
    #[must_use]
    pub fn with_reboot_hook(mut self, reboot_hook: Arc<dyn RebootHook>) -> Self {
        self.reboot_hook = reboot_hook;
        self
    }

    /// Set the cancellation signal
    #[must_use]
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Phase scheduler
pub struct SchedulerActor {
    workflow: Workflow,
    actors: Arc<ActorRegistry>,
    models: Arc<ModelRegistry>,
    resume: ResumeManager,
    executor: Arc<dyn CommandExecutor>,
    config_bag: Arc<ConfigBag>,
    config: SchedulerConfig,
    reboot_hook: Arc<dyn RebootHook>,
    cancel: watch::Receiver<bool>,
    /// Current state
    state: SchedulerState,
}

/// How a phase ended
enum PhaseEnd {
    Completed,
    Fatal { actor: String, error: String },
    Interrupted,
}

/// Resolve when cancellation is requested; never if the sender is gone
async fn cancelled(mut cancel: watch::Receiver<bool>) {
    if cancel.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

impl SchedulerActor {
    /// Get current state
    #[must_use]
    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Transition to a new state with validation
    fn transition_to(&mut self, new_state: SchedulerState) -> Result<(), CoreError> {
        if !self.state.can_transition_to(new_state) {
            return Err(CoreError::InvalidTransition {
                from: self.state,
                to: new_state,
            });
        }

        let old_state = self.state;
        self.state = new_state;

        debug!(
            workflow = %self.workflow.name,
            from = %old_state,
            to = %new_state,
            "state transition"
        );
        Ok(())
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    fn validate(
        &self,
        enable_experimental: &std::collections::BTreeSet<String>,
    ) -> Result<ValidatedWorkflow, CoreError> {
        let options = ValidationOptions {
            enable_experimental: enable_experimental.clone(),
        };
        Ok(validate_with(
            &self.workflow,
            &self.actors,
            &self.models,
            &options,
        )?)
    }

    /// Restore the requested run or prepare a fresh one (not yet persisted)
    async fn load_or_create(&self, options: &RunOptions) -> Result<ExecutionState, CoreError> {
        let restored = match (&options.run_id, options.resume_latest) {
            (Some(run_id), _) => Some(self.resume.restore(run_id).await?),
            (None, true) => Some(
                self.resume
                    .latest_resumable(&self.workflow.name)
                    .await?
                    .ok_or_else(|| CoreError::NothingToResume(self.workflow.name.clone()))?,
            ),
            (None, false) => None,
        };

        let Some(mut state) = restored else {
            let mut state = ExecutionState::new(self.workflow.name.clone());
            state
                .enabled_experimental
                .clone_from(&options.enable_experimental);
            return Ok(state);
        };

        if state.workflow != self.workflow.name {
            return Err(CoreError::WorkflowMismatch {
                run_id: state.run_id,
                expected: self.workflow.name.clone(),
                found: state.workflow,
            });
        }
        if state.status.is_terminal() {
            return Err(CoreError::RunNotResumable {
                run_id: state.run_id,
                status: state.status,
            });
        }

        state
            .enabled_experimental
            .extend(options.enable_experimental.iter().cloned());
        Ok(state)
    }

    async fn run(&mut self, options: RunOptions) -> Result<RunReport, CoreError> {
        if self.state.is_final() {
            self.transition_to(SchedulerState::NotStarted)?;
        }

        if let Some(phase) = &options.until_phase
            && self.workflow.phase_index(phase).is_none()
        {
            return Err(CoreError::UnknownPhase(phase.clone()));
        }

        let mut state = self.load_or_create(&options).await?;
        let validated = self.validate(&state.enabled_experimental)?;

        for (question_id, value) in &options.answers {
            state.record_answer(question_id.clone(), value.clone());
        }
        let resumed = state.current_phase_index > 0 || !state.messages.is_empty();
        state.status = RunStatus::Running;
        state.touch();
        self.resume.snapshot(&state).await?;

        let start = state.current_phase_index;
        info!(
            run_id = %state.run_id,
            workflow = %self.workflow.name,
            resumed,
            start_phase = validated.phases.get(start).map_or("<end>", |p| p.phase.name.as_str()),
            actors = validated.actor_count(),
            "run started"
        );

        let mut records = Vec::new();
        self.transition_to(SchedulerState::Running { phase_index: start })?;

        for plan in validated.phases.iter().skip(start) {
            if plan.index != start {
                self.transition_to(SchedulerState::Running {
                    phase_index: plan.index,
                })?;
            }

            let phase_start = state.messages.len();
            match self.run_phase(&mut state, plan, &mut records).await {
                PhaseEnd::Completed => {}
                PhaseEnd::Fatal { actor, error } => {
                    error!(
                        run_id = %state.run_id,
                        actor = %actor,
                        phase = %plan.phase.name,
                        error = %error,
                        "run failed"
                    );
                    state.status = RunStatus::Failed {
                        actor: Some(actor),
                        phase: plan.phase.name.clone(),
                        error,
                    };
                    return self.finish(state, records, SchedulerState::Failed).await;
                }
                PhaseEnd::Interrupted => {
                    warn!(run_id = %state.run_id, phase = %plan.phase.name, "run interrupted");
                    // The phase reruns from its start on resume
                    state.messages.truncate(phase_start);
                    state.status = RunStatus::Interrupted {
                        phase: plan.phase.name.clone(),
                    };
                    state.touch();
                    if let Err(e) = self.resume.snapshot(&state).await {
                        warn!(run_id = %state.run_id, error = %e, "failed to save interrupted run");
                    }
                    self.transition_to(SchedulerState::Interrupted)?;
                    return Ok(report(&state, records));
                }
            }

            state.current_phase_index = plan.index + 1;
            let next_phase = validated
                .phases
                .get(plan.index + 1)
                .map(|p| p.phase.name.clone());

            info!(
                run_id = %state.run_id,
                phase = %plan.phase.name,
                messages = state.messages.len(),
                "phase completed"
            );

            if plan.phase.checkpoint && halt::should_halt(&state.messages) {
                let inhibitors = halt::inhibitors(&state.messages);
                for inhibitor in &inhibitors {
                    warn!(
                        run_id = %state.run_id,
                        producer = %inhibitor.producer,
                        title = %inhibitor.title,
                        summary = %inhibitor.summary,
                        "upgrade inhibited"
                    );
                }
                state.status = RunStatus::Halted { inhibitors };
                return self.finish(state, records, SchedulerState::Halted).await;
            }

            if let Some(boundary) = plan.phase.reboot {
                return self.reboot(state, records, boundary, next_phase).await;
            }

            if next_phase.is_some() && options.until_phase.as_deref() == Some(&plan.phase.name) {
                info!(run_id = %state.run_id, phase = %plan.phase.name, "pausing as requested");
                state.status = RunStatus::Paused { next_phase };
                return self.finish(state, records, SchedulerState::Paused).await;
            }

            state.touch();
            self.resume.snapshot(&state).await?;
        }

        info!(run_id = %state.run_id, "run completed");
        state.status = RunStatus::Completed;
        self.finish(state, records, SchedulerState::Completed).await
    }

    /// Persist the final state of this invocation and build the report
    async fn finish(
        &mut self,
        mut state: ExecutionState,
        records: Vec<ActorRecord>,
        scheduler_state: SchedulerState,
    ) -> Result<RunReport, CoreError> {
        state.touch();
        self.resume.snapshot(&state).await?;
        self.transition_to(scheduler_state)?;
        Ok(report(&state, records))
    }

    async fn reboot(
        &mut self,
        mut state: ExecutionState,
        records: Vec<ActorRecord>,
        boundary: RebootBoundary,
        next_phase: Option<String>,
    ) -> Result<RunReport, CoreError> {
        let scheduler_state = if next_phase.is_some() {
            state.status = RunStatus::AwaitingReboot { next_phase };
            SchedulerState::AwaitingReboot
        } else {
            state.status = RunStatus::Completed;
            SchedulerState::Completed
        };

        // State must be on disk before anything that may reboot the machine
        let report = self.finish(state.clone(), records, scheduler_state).await?;

        info!(
            run_id = %state.run_id,
            boundary = %boundary,
            status = %report.status,
            "requesting reboot"
        );
        self.reboot_hook
            .reboot(&state, boundary)
            .await
            .map_err(|e| CoreError::RebootFailed(e.to_string()))?;

        Ok(report)
    }

    async fn run_phase(
        &self,
        state: &mut ExecutionState,
        plan: &PhasePlan,
        records: &mut Vec<ActorRecord>,
    ) -> PhaseEnd {
        info!(
            run_id = %state.run_id,
            phase = %plan.phase.name,
            stage = %plan.phase.stage,
            actors = plan.actors.len(),
            "phase started"
        );

        for actor in &plan.actors {
            if self.is_cancelled() {
                return PhaseEnd::Interrupted;
            }

            let Some(outcome) = self.run_actor(state, actor).await else {
                return PhaseEnd::Interrupted;
            };

            let fatal = match &outcome {
                ActorOutcome::Fatal { error } => Some(error.clone()),
                _ => None,
            };
            records.push(ActorRecord {
                actor: actor.name.clone(),
                phase: plan.phase.name.clone(),
                outcome,
            });

            if let Some(error) = fatal {
                return PhaseEnd::Fatal {
                    actor: actor.name.clone(),
                    error,
                };
            }
        }

        PhaseEnd::Completed
    }

    /// Run one actor; `None` when the run was cancelled meanwhile
    async fn run_actor(
        &self,
        state: &mut ExecutionState,
        actor: &Arc<ActorDescriptor>,
    ) -> Option<ActorOutcome> {
        if let Some(model) = actor
            .mandatory
            .iter()
            .find(|m| state.messages.consume_one(m).is_none())
        {
            let error = ActorError::failed(format!("mandatory model {model} has no messages"));
            return Some(self.log_outcome(actor, classify(actor, Err(error)), None));
        }

        let ctx = ActorContext::for_actor(Arc::clone(actor))
            .with_run_id(state.run_id.clone())
            .with_history(state.messages.snapshot())
            .with_models(Arc::clone(&self.models))
            .with_config(Arc::clone(&self.config_bag))
            .with_answers(Arc::new(state.dialog_answers.clone()))
            .with_executor(Arc::clone(&self.executor));
        let entrypoint = Arc::clone(&actor.entrypoint);

        debug!(actor = %actor.name, phase = %actor.phase(), "actor started");
        let started = Instant::now();

        let mut handle = tokio::spawn(async move {
            let mut ctx = ctx;
            let result = entrypoint.execute(&mut ctx).await;
            (result, ctx.into_parts())
        });

        let joined = tokio::select! {
            joined = tokio::time::timeout(self.config.actor_timeout, &mut handle) => joined,
            () = cancelled(self.cancel.clone()) => {
                handle.abort();
                return None;
            }
        };

        let (result, parts) = match joined {
            Ok(Ok(output)) => output,
            Ok(Err(join_error)) => {
                let error = if join_error.is_panic() {
                    ActorError::failed("actor panicked")
                } else {
                    ActorError::failed(format!("actor task failed: {join_error}"))
                };
                return Some(self.log_outcome(actor, classify(actor, Err(error)), Some(started)));
            }
            Err(_) => {
                handle.abort();
                let error = ActorError::failed(format!(
                    "actor timed out after {:?}",
                    self.config.actor_timeout
                ));
                return Some(self.log_outcome(actor, classify(actor, Err(error)), Some(started)));
            }
        };

        for pending in parts.outbox {
            let seq = state.messages.produce(
                actor.name.clone(),
                actor.phase(),
                pending.model.clone(),
                pending.payload,
            );
            debug!(actor = %actor.name, model = %pending.model, seq, "message committed");
        }
        state.record_questions(parts.unanswered);

        let outcome = match parts.fault {
            Some(fault) => ActorOutcome::Fatal {
                error: fault.to_string(),
            },
            None => classify(actor, result),
        };
        Some(self.log_outcome(actor, outcome, Some(started)))
    }

    fn log_outcome(
        &self,
        actor: &ActorDescriptor,
        outcome: ActorOutcome,
        started: Option<Instant>,
    ) -> ActorOutcome {
        let elapsed_ms = started.map_or(0, |s| {
            u64::try_from(s.elapsed().as_millis()).unwrap_or(u64::MAX)
        });
        match &outcome {
            ActorOutcome::Success => {
                info!(actor = %actor.name, phase = %actor.phase(), elapsed_ms, "actor succeeded");
            }
            ActorOutcome::SoftSkip { reason } => {
                info!(actor = %actor.name, phase = %actor.phase(), reason = %reason, "actor skipped");
            }
            ActorOutcome::Error { error } => {
                warn!(actor = %actor.name, phase = %actor.phase(), error = %error, "actor failed");
            }
            ActorOutcome::Fatal { error } => {
                error!(
                    actor = %actor.name,
                    phase = %actor.phase(),
                    required = actor.required,
                    error = %error,
                    "actor failed fatally"
                );
            }
        }
        outcome
    }
}

/// Map an entry point result to an outcome
fn classify(actor: &ActorDescriptor, result: Result<Outcome, ActorError>) -> ActorOutcome {
    match result {
        Ok(Outcome::Success) => ActorOutcome::Success,
        Ok(Outcome::SoftSkip(reason)) => ActorOutcome::SoftSkip { reason },
        Err(e) if e.is_fatal() || actor.required => ActorOutcome::Fatal {
            error: e.to_string(),
        },
        Err(e) => ActorOutcome::Error {
            error: e.to_string(),
        },
    }
}

fn report(state: &ExecutionState, actors: Vec<ActorRecord>) -> RunReport {
    RunReport {
        run_id: state.run_id.clone(),
        workflow: state.workflow.clone(),
        status: state.status.clone(),
        actors,
        pending_questions: state.pending_questions.clone(),
    }
}

impl Actor for SchedulerActor {
    type Args = SchedulerActorArgs;
    type Error = CoreError;

    async fn on_start(args: Self::Args, actor_ref: ActorRef<Self>) -> Result<Self, Self::Error> {
        info!(
            workflow = %args.workflow.name,
            phases = args.workflow.phases.len(),
            actors = args.actors.len(),
            id = %actor_ref.id(),
            "SchedulerActor starting"
        );

        Ok(Self {
            workflow: args.workflow,
            actors: args.actors,
            models: args.models,
            resume: args.resume,
            executor: args.executor,
            config_bag: args.config_bag,
            config: args.config,
            reboot_hook: args.reboot_hook,
            cancel: args.cancel,
            state: SchedulerState::NotStarted,
        })
    }

    async fn on_stop(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        reason: ActorStopReason,
    ) -> Result<(), Self::Error> {
        info!(
            workflow = %self.workflow.name,
            state = %self.state,
            reason = ?reason,
            "SchedulerActor stopping"
        );
        Ok(())
    }
}

// ============================================================================
// Message Handlers
// ============================================================================

impl Message<RunWorkflow> for SchedulerActor {
    type Reply = Result<RunReport, CoreError>;

    async fn handle(
        &mut self,
        msg: RunWorkflow,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let result = self.run(msg.options).await;

        // Engine errors leave the machine mid-run; reset for the next request
        if result.is_err() && self.state.is_busy() {
            warn!(state = %self.state, "run aborted by engine error");
            self.state = SchedulerState::Failed;
        }
        result
    }
}

impl Message<CheckWorkflow> for SchedulerActor {
    type Reply = Result<WorkflowPlan, CoreError>;

    async fn handle(
        &mut self,
        msg: CheckWorkflow,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let validated = self.validate(&msg.enable_experimental)?;

        Ok(WorkflowPlan {
            workflow: validated.workflow.name.clone(),
            phases: validated
                .phases
                .iter()
                .map(|plan| PlannedPhase {
                    name: plan.phase.name.clone(),
                    stage: plan.phase.stage.clone(),
                    checkpoint: plan.phase.checkpoint,
                    reboot: plan.phase.reboot,
                    actors: plan.actors.iter().map(|a| a.name.clone()).collect(),
                })
                .collect(),
            edges: validated
                .graph
                .edges()
                .map(|(from, to, models)| (from.to_string(), to.to_string(), models.to_vec()))
                .collect(),
            excluded: validated.excluded.clone(),
        })
    }
}

impl Message<ListRuns> for SchedulerActor {
    type Reply = Result<Vec<RunSummary>, CoreError>;

    async fn handle(
        &mut self,
        _msg: ListRuns,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.resume.list_runs().await?)
    }
}

impl Message<DeleteRun> for SchedulerActor {
    type Reply = Result<(), CoreError>;

    async fn handle(
        &mut self,
        msg: DeleteRun,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.resume.delete(&msg.run_id).await?)
    }
}

impl Message<AnswerQuestion> for SchedulerActor {
    type Reply = Result<(), CoreError>;

    async fn handle(
        &mut self,
        msg: AnswerQuestion,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self
            .resume
            .answer(&msg.run_id, &msg.question_id, msg.value)
            .await?)
    }
}

impl Message<GetState> for SchedulerActor {
    type Reply = SchedulerState;

    async fn handle(
        &mut self,
        _msg: GetState,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.state
    }
}
