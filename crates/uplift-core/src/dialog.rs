//! Non-blocking dialogs
//!
//! Runs are unattended once started, so an actor that needs a decision
//! never waits for input: it gets the stored answer or `Pending`, and the
//! question is recorded so the operator can answer it before a rerun.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Answer to a dialog question
#[derive(Debug, Clone, PartialEq)]
pub enum Answer {
    /// No answer recorded yet
    Pending,
    /// Stored answer
    Value(Value),
}

impl Answer {
    /// Whether an answer is available
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, Answer::Pending)
    }

    /// Interpret the answer as a yes/no decision
    ///
    /// Accepts JSON booleans and the strings `yes`/`no`/`true`/`false`/`1`/`0`.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Answer::Value(Value::Bool(b)) => Some(*b),
            Answer::Value(Value::String(s)) => parse_bool(s),
            _ => None,
        }
    }

    /// Interpret the answer as text
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Answer::Value(Value::String(s)) => Some(s),
            _ => None,
        }
    }
}

pub(crate) fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

/// A question asked by an actor that had no answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    /// Stable question identifier
    pub id: String,
    /// Text shown to the operator
    pub prompt: String,
    /// Actor that asked
    pub asked_by: String,
}

/// Per-actor view of the dialog answers
#[derive(Debug, Clone, Default)]
pub struct DialogManager {
    answers: Arc<BTreeMap<String, Value>>,
    unanswered: Vec<Question>,
}

impl DialogManager {
    /// Create a manager over stored answers
    #[must_use]
    pub fn new(answers: Arc<BTreeMap<String, Value>>) -> Self {
        Self {
            answers,
            unanswered: Vec::new(),
        }
    }

    /// Look up the answer for `question_id`
    ///
    /// A missing answer is recorded as an unanswered question.
    pub fn ask(&mut self, asked_by: &str, question_id: &str, prompt: &str) -> Answer {
        if let Some(value) = self.answers.get(question_id) {
            return Answer::Value(value.clone());
        }

        if !self.unanswered.iter().any(|q| q.id == question_id) {
            self.unanswered.push(Question {
                id: question_id.to_string(),
                prompt: prompt.to_string(),
                asked_by: asked_by.to_string(),
            });
        }
        Answer::Pending
    }

    /// Questions that had no answer
    #[must_use]
    pub fn into_unanswered(self) -> Vec<Question> {
        self.unanswered
    }
}
