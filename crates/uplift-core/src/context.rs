//! Per-invocation actor context
//!
//! Every actor call gets its own [`ActorContext`]. It is the only way an
//! actor reaches the message bus, the configuration bag, dialog answers
//! and the command executor.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;
use uplift_exec::{CommandExecutor, LocalExecutor};

use crate::bus::Message;
use crate::config::ConfigBag;
use crate::descriptor::ActorDescriptor;
use crate::dialog::{Answer, DialogManager, Question};
use crate::error::BusError;
use crate::model::{Model, ModelRegistry, Report};

/// A message written by an actor, waiting for its `seq`
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
    /// Model name
    pub model: String,
    /// Checked payload
    pub payload: Value,
}

/// What the scheduler takes back from a finished context
pub(crate) struct ContextParts {
    pub outbox: Vec<PendingMessage>,
    pub unanswered: Vec<Question>,
    pub fault: Option<BusError>,
}

/// Handle given to an actor for one invocation
pub struct ActorContext {
    run_id: String,
    actor: Arc<ActorDescriptor>,
    /// Messages committed before the actor started
    history: Arc<Vec<Message>>,
    outbox: Vec<PendingMessage>,
    models: Arc<ModelRegistry>,
    config: Arc<ConfigBag>,
    dialog: DialogManager,
    executor: Arc<dyn CommandExecutor>,
    /// First serialization or schema failure, fatal for the run
    fault: Option<BusError>,
}

impl ActorContext {
    /// Context with empty history, built-in models and a local executor
    #[must_use]
    pub fn for_actor(actor: Arc<ActorDescriptor>) -> Self {
        Self {
            run_id: String::new(),
            actor,
            history: Arc::new(Vec::new()),
            outbox: Vec::new(),
            models: Arc::new(ModelRegistry::with_builtins()),
            config: Arc::new(ConfigBag::new()),
            dialog: DialogManager::default(),
            executor: Arc::new(LocalExecutor::new()),
            fault: None,
        }
    }

    /// Set the run identifier
    #[must_use]
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    /// Set the messages visible to the actor
    #[must_use]
    pub fn with_history(mut self, history: Arc<Vec<Message>>) -> Self {
        self.history = history;
        self
    }

    /// Set the model registry used to check payloads
    #[must_use]
    pub fn with_models(mut self, models: Arc<ModelRegistry>) -> Self {
        self.models = models;
        self
    }

    /// Set the configuration bag
    #[must_use]
    pub fn with_config(mut self, config: Arc<ConfigBag>) -> Self {
        self.config = config;
        self
    }

    /// Set stored dialog answers
    #[must_use]
    pub fn with_answers(mut self, answers: Arc<BTreeMap<String, Value>>) -> Self {
        self.dialog = DialogManager::new(answers);
        self
    }

    /// Set the command executor
    #[must_use]
    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = executor;
        self
    }

    /// Run identifier
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Name of the running actor
    #[must_use]
    pub fn actor_name(&self) -> &str {
        &self.actor.name
    }

    /// Phase the actor runs in
    #[must_use]
    pub fn phase(&self) -> &str {
        self.actor.phase()
    }

    /// Configuration bag
    #[must_use]
    pub fn config(&self) -> &ConfigBag {
        &self.config
    }

    /// Executor for shelling out
    #[must_use]
    pub fn executor(&self) -> &Arc<dyn CommandExecutor> {
        &self.executor
    }

    /// Models the actor declares in `consumes`
    #[must_use]
    pub fn declared_consumes(&self) -> &BTreeSet<String> {
        &self.actor.consumes
    }

    /// Messages of a consumed model, in `seq` order
    ///
    /// # Errors
    /// Returns `BusError::UndeclaredConsume` if the actor does not consume `model`
    pub fn consume<'a>(
        &'a self,
        model: &'a str,
    ) -> Result<impl Iterator<Item = &'a Message> + 'a, BusError> {
        self.check_consumes(model)?;
        Ok(self.history.iter().filter(move |m| m.model == model))
    }

    /// Earliest message of a consumed model
    ///
    /// # Errors
    /// Returns `BusError::UndeclaredConsume` if the actor does not consume `model`
    pub fn consume_one(&self, model: &str) -> Result<Option<&Message>, BusError> {
        self.check_consumes(model)?;
        Ok(self.history.iter().find(|m| m.model == model))
    }

    /// Decode every message of a typed model
    ///
    /// # Errors
    /// Returns an error if the model is not consumed or a payload does not decode
    pub fn consume_as<T: Model>(&self) -> Result<Vec<T>, BusError> {
        self.consume(T::NAME)?
            .map(|m| {
                serde_json::from_value(m.payload.clone()).map_err(|e| BusError::Serialization {
                    model: T::NAME.to_string(),
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    /// Produce a typed message
    ///
    /// # Errors
    /// Returns an error if the model is not declared or the value does not serialize
    pub fn produce<T: Model>(&mut self, value: &T) -> Result<(), BusError> {
        self.check_produces(T::NAME)?;
        match serde_json::to_value(value) {
            Ok(payload) => self.produce_value(T::NAME, payload),
            Err(e) => Err(self.record_fault(BusError::Serialization {
                model: T::NAME.to_string(),
                reason: e.to_string(),
            })),
        }
    }

    /// Produce an untyped message
    ///
    /// # Errors
    /// Returns an error if the model is not declared or the payload violates its schema
    pub fn produce_value(&mut self, model: &str, payload: Value) -> Result<(), BusError> {
        self.check_produces(model)?;

        let checked = match self.models.get(model) {
            Some(schema) => schema.check(&payload),
            None => Err("model is not registered".to_string()),
        };
        if let Err(reason) = checked {
            return Err(self.record_fault(BusError::SchemaViolation {
                model: model.to_string(),
                reason,
            }));
        }

        self.outbox.push(PendingMessage {
            model: model.to_string(),
            payload,
        });
        Ok(())
    }

    /// Produce a `Report`
    ///
    /// # Errors
    /// Returns an error if the actor does not declare `Report` in `produces`
    pub fn report(&mut self, report: &Report) -> Result<(), BusError> {
        self.produce(report)
    }

    /// Ask a question without blocking
    pub fn ask(&mut self, question_id: &str, prompt: &str) -> Answer {
        self.dialog.ask(&self.actor.name, question_id, prompt)
    }

    /// Messages produced so far by this invocation
    #[must_use]
    pub fn produced(&self) -> &[PendingMessage] {
        &self.outbox
    }

    pub(crate) fn into_parts(self) -> ContextParts {
        ContextParts {
            outbox: self.outbox,
            unanswered: self.dialog.into_unanswered(),
            fault: self.fault,
        }
    }

    fn check_consumes(&self, model: &str) -> Result<(), BusError> {
        if self.actor.consumes.contains(model) {
            Ok(())
        } else {
            Err(BusError::UndeclaredConsume {
                actor: self.actor.name.clone(),
                model: model.to_string(),
            })
        }
    }

    fn check_produces(&self, model: &str) -> Result<(), BusError> {
        if self.actor.produces.contains(model) {
            Ok(())
        } else {
            Err(BusError::UndeclaredProduce {
                actor: self.actor.name.clone(),
                model: model.to_string(),
            })
        }
    }

    fn record_fault(&mut self, error: BusError) -> BusError {
        warn!(actor = %self.actor.name, error = %error, "message rejected");
        if self.fault.is_none() {
            self.fault = Some(error.clone());
        }
        error
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    use super::*;
    use crate::descriptor::{ActorEntrypoint, Outcome};
    use crate::error::ActorError;
    use crate::model::{FieldKind, ModelSchema, REPORT_MODEL};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Kernel {
        version: String,
    }

    impl Model for Kernel {
        const NAME: &'static str = "Kernel";
    }

    struct Noop;

    #[async_trait]
    impl ActorEntrypoint for Noop {
        async fn execute(&self, _ctx: &mut ActorContext) -> Result<Outcome, ActorError> {
            Ok(Outcome::Success)
        }
    }

    fn models() -> Arc<ModelRegistry> {
        let mut models = ModelRegistry::with_builtins();
        models
            .register(ModelSchema::new("Kernel").with_field("version", FieldKind::String))
            .unwrap();
        Arc::new(models)
    }

    fn context(consumes: &[&str], produces: &[&str]) -> ActorContext {
        let mut builder = ActorDescriptor::builder("checker").phase("checks").workflow("w");
        for m in consumes {
            builder = builder.consumes(*m);
        }
        for m in produces {
            builder = builder.produces(*m);
        }
        let actor = Arc::new(builder.build(Arc::new(Noop)).unwrap());
        ActorContext::for_actor(actor).with_models(models())
    }

    fn message(seq: u64, model: &str, payload: Value) -> Message {
        Message {
            seq,
            model: model.into(),
            producer: "scanner".into(),
            phase: "facts".into(),
            payload,
        }
    }

    #[test]
    fn test_consume_only_declared_models() {
        let history = Arc::new(vec![
            message(1, "Kernel", json!({"version": "4.18"})),
            message(2, "Other", json!({})),
            message(3, "Kernel", json!({"version": "5.14"})),
        ]);
        let ctx = context(&["Kernel"], &[]).with_history(history);

        let kernels: Vec<Kernel> = ctx.consume_as().unwrap();
        assert_eq!(kernels.len(), 2);
        assert_eq!(kernels[1].version, "5.14");
        assert_eq!(ctx.consume_one("Kernel").unwrap().unwrap().seq, 1);

        let err = ctx.consume("Other").err().unwrap();
        assert!(matches!(err, BusError::UndeclaredConsume { .. }));
    }

    #[test]
    fn test_produce_checks_declaration_and_schema() {
        let mut ctx = context(&[], &["Kernel", REPORT_MODEL]);

        ctx.produce(&Kernel {
            version: "5.14".into(),
        })
        .unwrap();
        ctx.report(&Report::inhibitor("t", "s")).unwrap();
        assert_eq!(ctx.produced().len(), 2);

        let err = ctx
            .produce_value("Kernel", json!({"version": 5}))
            .unwrap_err();
        assert!(matches!(err, BusError::SchemaViolation { .. }));

        let parts = ctx.into_parts();
        assert_eq!(parts.outbox.len(), 2);
        assert!(parts.fault.is_some());
    }

    #[test]
    fn test_undeclared_produce_is_not_a_fault() {
        let mut ctx = context(&[], &[]);

        let err = ctx.report(&Report::inhibitor("t", "s")).unwrap_err();
        assert!(matches!(err, BusError::UndeclaredProduce { .. }));
        assert!(ctx.into_parts().fault.is_none());
    }

    #[test]
    fn test_ask_records_unanswered_questions() {
        let answers = Arc::new(BTreeMap::from([("known".to_string(), json!(true))]));
        let mut ctx = context(&[], &[]).with_answers(answers);

        assert_eq!(ctx.ask("known", "?").as_bool(), Some(true));
        assert!(ctx.ask("unknown", "Remove pam_pkcs11?").is_pending());

        let parts = ctx.into_parts();
        assert_eq!(parts.unanswered.len(), 1);
        assert_eq!(parts.unanswered[0].asked_by, "checker");
    }
}
