//! Message models and the model registry
//!
//! A model is a named, versioned schema. The engine only uses schemas to
//! check payloads at produce time and to reject workflows that reference
//! unknown models; business meaning lives in the actors.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RegistryError;

/// Name of the built-in report model
pub const REPORT_MODEL: &str = "Report";

/// Report flag that stops the workflow at the next checkpoint
pub const INHIBITOR_FLAG: &str = "inhibitor";

/// A Rust type that can travel on the message bus
pub trait Model: Serialize + DeserializeOwned {
    /// Registered model name
    const NAME: &'static str;
}

/// Kind of a schema field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Integer,
    Float,
    Boolean,
    List,
    Object,
    Any,
}

impl FieldKind {
    fn matches(self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Integer => value.is_i64() || value.is_u64(),
            FieldKind::Float => value.is_number(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::List => value.is_array(),
            FieldKind::Object => value.is_object(),
            FieldKind::Any => true,
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldKind::String => "string",
            FieldKind::Integer => "integer",
            FieldKind::Float => "float",
            FieldKind::Boolean => "boolean",
            FieldKind::List => "list",
            FieldKind::Object => "object",
            FieldKind::Any => "any",
        };
        f.write_str(name)
    }
}

/// One field of a model schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Field name
    pub name: String,
    /// Expected JSON kind
    pub kind: FieldKind,
    /// Whether the field must be present and non-null
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

/// Schema of a message model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSchema {
    /// Unique model name
    pub name: String,
    /// Schema version
    #[serde(default = "default_version")]
    pub version: u32,
    /// Declared fields
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
}

fn default_version() -> u32 {
    1
}

impl ModelSchema {
    /// Create an empty schema
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            fields: Vec::new(),
        }
    }

    /// Set schema version
    #[must_use]
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Add a required field
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind,
            required: true,
        });
        self
    }

    /// Add an optional field
    #[must_use]
    pub fn with_optional_field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind,
            required: false,
        });
        self
    }

    /// Check a payload against the schema
    ///
    /// Payloads must be JSON objects. Unknown keys are rejected, optional
    /// fields may be absent or null.
    ///
    /// # Errors
    /// Returns a description of the first mismatch
    pub fn check(&self, payload: &Value) -> Result<(), String> {
        let Some(object) = payload.as_object() else {
            return Err("payload is not an object".to_string());
        };

        for field in &self.fields {
            match object.get(&field.name) {
                None | Some(Value::Null) if field.required => {
                    return Err(format!("missing required field '{}'", field.name));
                }
                None | Some(Value::Null) => {}
                Some(value) if !field.kind.matches(value) => {
                    return Err(format!("field '{}' is not of kind {}", field.name, field.kind));
                }
                Some(_) => {}
            }
        }

        let declared: BTreeSet<&str> = self.fields.iter().map(|f| f.name.as_str()).collect();
        if let Some(unknown) = object.keys().find(|k| !declared.contains(k.as_str())) {
            return Err(format!("unknown field '{unknown}'"));
        }

        Ok(())
    }
}

/// Catalogue of registered models
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: BTreeMap<String, ModelSchema>,
}

impl ModelRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the built-in `Report` model
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .models
            .insert(REPORT_MODEL.to_string(), Report::schema());
        registry
    }

    /// Register a model schema
    ///
    /// # Errors
    /// Returns an error if the name is empty or already registered
    pub fn register(&mut self, schema: ModelSchema) -> Result<(), RegistryError> {
        if schema.name.trim().is_empty() {
            return Err(RegistryError::EmptyName("model"));
        }
        if self.models.contains_key(&schema.name) {
            return Err(RegistryError::DuplicateModel(schema.name));
        }
        self.models.insert(schema.name.clone(), schema);
        Ok(())
    }

    /// Look up a schema by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ModelSchema> {
        self.models.get(name)
    }

    /// Whether a model is registered
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    /// Number of registered models
    #[must_use]
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Whether the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Iterate schemas in name order
    pub fn iter(&self) -> impl Iterator<Item = &ModelSchema> {
        self.models.values()
    }
}

/// Report severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
}

/// User-facing finding produced by actors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    /// How serious the finding is
    pub severity: Severity,
    /// Flags such as `inhibitor`
    #[serde(default)]
    pub flags: BTreeSet<String>,
    /// One-line title
    pub title: String,
    /// Longer explanation
    pub summary: String,
    /// Suggested fix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

impl Report {
    /// Create a report without flags
    pub fn new(severity: Severity, title: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            severity,
            flags: BTreeSet::new(),
            title: title.into(),
            summary: summary.into(),
            remediation: None,
        }
    }

    /// Create a high severity report flagged as an inhibitor
    pub fn inhibitor(title: impl Into<String>, summary: impl Into<String>) -> Self {
        Self::new(Severity::High, title, summary).with_flag(INHIBITOR_FLAG)
    }

    /// Add a flag
    #[must_use]
    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        self.flags.insert(flag.into());
        self
    }

    /// Attach remediation advice
    #[must_use]
    pub fn with_remediation(mut self, remediation: impl Into<String>) -> Self {
        self.remediation = Some(remediation.into());
        self
    }

    /// Whether this report blocks the upgrade
    #[must_use]
    pub fn is_inhibitor(&self) -> bool {
        self.flags.contains(INHIBITOR_FLAG)
    }

    /// Schema registered for `Report`
    #[must_use]
    pub fn schema() -> ModelSchema {
        ModelSchema::new(REPORT_MODEL)
            .with_field("severity", FieldKind::String)
            .with_optional_field("flags", FieldKind::List)
            .with_field("title", FieldKind::String)
            .with_field("summary", FieldKind::String)
            .with_optional_field("remediation", FieldKind::String)
    }
}

impl Model for Report {
    const NAME: &'static str = REPORT_MODEL;
}
