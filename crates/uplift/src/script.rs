//! Actors backed by external commands
//!
//! The command receives a JSON document on stdin:
//!
//! ```json
//! {"run_id": "...", "actor": "...", "phase": "...",
//!  "messages": {"KernelInfo": [{"seq": 1, "producer": "...", "payload": {}}]},
//!  "answers": {"allow_old_kernel": true}}
//! ```
//!
//! Every stdout line of the form `{"model": "...", "payload": {...}}` is
//! produced as a message; other lines are logged. Configuration bag entries
//! are exported as `UPLIFT_<KEY>` and answers as `UPLIFT_ANSWER_<ID>`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;
use uplift_core::{Answer, ActorContext, ActorEntrypoint, ActorError, ConfigValue, Outcome};
use uplift_exec::CommandRequest;

/// A question a script may need answered
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptQuestion {
    pub id: String,
    pub prompt: String,
}

/// Entry point that runs a shell command
#[derive(Debug, Clone)]
pub struct ScriptActor {
    pub command: String,
    pub working_dir: Option<PathBuf>,
    pub questions: Vec<ScriptQuestion>,
    pub skip_exit_code: i32,
    pub fatal_exit_code: i32,
}

#[derive(Deserialize)]
struct Produced {
    model: String,
    payload: Value,
}

fn env_key(prefix: &str, key: &str) -> String {
    let key: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{prefix}{key}")
}

fn env_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn last_line(text: &str) -> Option<&str> {
    text.lines().rev().map(str::trim).find(|l| !l.is_empty())
}

impl ScriptActor {
    fn request(&self, ctx: &mut ActorContext) -> Result<CommandRequest, ActorError> {
        let mut answers = BTreeMap::new();
        for question in &self.questions {
            if let Answer::Value(value) = ctx.ask(&question.id, &question.prompt) {
                answers.insert(question.id.clone(), value);
            }
        }

        let mut messages = serde_json::Map::new();
        let consumed: Vec<String> = ctx.declared_consumes().iter().cloned().collect();
        for model in consumed {
            let entries: Vec<Value> = ctx
                .consume(&model)?
                .map(|m| {
                    json!({
                        "seq": m.seq,
                        "producer": m.producer,
                        "phase": m.phase,
                        "payload": m.payload,
                    })
                })
                .collect();
            messages.insert(model, Value::Array(entries));
        }

        let input = json!({
            "run_id": ctx.run_id(),
            "actor": ctx.actor_name(),
            "phase": ctx.phase(),
            "messages": messages,
            "answers": answers,
        });

        let mut request = CommandRequest::shell(&self.command)
            .with_stdin(input.to_string())
            .with_env("UPLIFT_RUN_ID", ctx.run_id())
            .with_env("UPLIFT_ACTOR", ctx.actor_name())
            .with_env("UPLIFT_PHASE", ctx.phase());

        for (key, value) in ctx.config().iter() {
            let value = match value {
                ConfigValue::Bool(b) => b.to_string(),
                ConfigValue::String(s) => s.clone(),
            };
            request = request.with_env(env_key("UPLIFT_", key), value);
        }
        for (id, value) in &answers {
            request = request.with_env(env_key("UPLIFT_ANSWER_", id), env_value(value));
        }
        if let Some(dir) = &self.working_dir {
            request = request.with_working_dir(dir);
        }

        Ok(request)
    }
}

#[async_trait]
impl ActorEntrypoint for ScriptActor {
    async fn execute(&self, ctx: &mut ActorContext) -> Result<Outcome, ActorError> {
        let request = self.request(ctx)?;
        let result = ctx.executor().run(&request).await?;

        for line in result.stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match serde_json::from_str::<Produced>(line) {
                Ok(produced) => ctx.produce_value(&produced.model, produced.payload)?,
                Err(_) => debug!(actor = %ctx.actor_name(), line, "script output"),
            }
        }

        let reason = || {
            last_line(&result.stderr)
                .map(str::to_string)
                .unwrap_or_else(|| format!("exit status {}", result.status))
        };

        match result.status {
            0 => Ok(Outcome::Success),
            s if s == self.skip_exit_code => Ok(Outcome::SoftSkip(reason())),
            s if s == self.fatal_exit_code => Err(ActorError::fatal(reason())),
            s => Err(ActorError::failed(format!("exit status {s}: {}", reason()))),
        }
    }
}
