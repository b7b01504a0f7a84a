//! Configuration types for the scheduler and for actors

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dialog::parse_bool;

/// Scheduler settings
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound for one actor invocation
    pub actor_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            actor_timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// Options for a single `RunWorkflow` request
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Resume this run instead of starting a new one
    pub run_id: Option<String>,
    /// Resume the most recent resumable run of the workflow
    pub resume_latest: bool,
    /// Stop cleanly after this phase
    pub until_phase: Option<String>,
    /// Experimental actors allowed to run
    pub enable_experimental: BTreeSet<String>,
    /// Dialog answers to add to the run
    pub answers: BTreeMap<String, Value>,
}

/// A named override value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    String(String),
}

/// Named overrides passed unchanged to every actor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigBag {
    values: BTreeMap<String, ConfigValue>,
}

impl ConfigBag {
    /// Create an empty bag
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect variables starting with `prefix`
    ///
    /// Keys lose the prefix and are lowercased: `UPLIFT_SKIP_RHSM=1`
    /// becomes `skip_rhsm`.
    pub fn from_vars(prefix: &str, vars: impl IntoIterator<Item = (String, String)>) -> Self {
        let values = vars
            .into_iter()
            .filter_map(|(key, value)| {
                let name = key.strip_prefix(prefix)?;
                (!name.is_empty()).then(|| (name.to_ascii_lowercase(), ConfigValue::String(value)))
            })
            .collect();
        Self { values }
    }

    /// Set a value, replacing any previous one
    pub fn insert(&mut self, key: impl Into<String>, value: ConfigValue) {
        self.values.insert(key.into(), value);
    }

    /// Overlay `other` on top of this bag
    pub fn merge(&mut self, other: ConfigBag) {
        self.values.extend(other.values);
    }

    /// Raw value
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.values.get(key)
    }

    /// Interpret a value as a boolean flag; absent or unparsable is `false`
    #[must_use]
    pub fn flag(&self, key: &str) -> bool {
        match self.values.get(key) {
            Some(ConfigValue::Bool(b)) => *b,
            Some(ConfigValue::String(s)) => parse_bool(s).unwrap_or(false),
            None => false,
        }
    }

    /// Interpret a value as text
    #[must_use]
    pub fn string(&self, key: &str) -> Option<&str> {
        match self.values.get(key) {
            Some(ConfigValue::String(s)) => Some(s),
            _ => None,
        }
    }

    /// Iterate entries in key order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ConfigValue)> {
        self.values.iter()
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the bag is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
