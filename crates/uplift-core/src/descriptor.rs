//! Static actor metadata and the actor entry point
//!
//! An [`ActorDescriptor`] is everything the engine knows about an actor:
//! its name, the models it reads and writes, its tags and an entry point.
//! The engine never looks behind the entry point.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::ActorContext;
use crate::error::{ActorError, RegistryError};

/// Capability tag that keeps an actor out of runs unless enabled
pub const EXPERIMENTAL: &str = "experimental";

/// A single tag as found in actor declarations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tag {
    /// Phase the actor runs in
    Phase(String),
    /// Workflow the actor belongs to
    Workflow(String),
    /// Free-form capability such as `experimental`
    Capability(String),
}

/// Typed tag record: one phase, one workflow, any capabilities
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorTags {
    /// Phase tag
    pub phase: String,
    /// Workflow tag
    pub workflow: String,
    /// Capability tags
    pub capabilities: BTreeSet<String>,
}

impl ActorTags {
    /// Build the record from a bag of tags
    ///
    /// # Errors
    /// Returns an error unless exactly one phase and one workflow tag exist
    pub fn from_tags(
        actor: &str,
        tags: impl IntoIterator<Item = Tag>,
    ) -> Result<Self, RegistryError> {
        let mut phase: Option<String> = None;
        let mut workflow: Option<String> = None;
        let mut capabilities = BTreeSet::new();

        for tag in tags {
            match tag {
                Tag::Phase(p) => set_once(actor, "phase", &mut phase, p)?,
                Tag::Workflow(w) => set_once(actor, "workflow", &mut workflow, w)?,
                Tag::Capability(c) => {
                    capabilities.insert(c);
                }
            }
        }

        Ok(Self {
            phase: phase.ok_or_else(|| RegistryError::MissingPhaseTag(actor.to_string()))?,
            workflow: workflow
                .ok_or_else(|| RegistryError::MissingWorkflowTag(actor.to_string()))?,
            capabilities,
        })
    }

    /// Whether the actor is experimental
    #[must_use]
    pub fn is_experimental(&self) -> bool {
        self.capabilities.contains(EXPERIMENTAL)
    }
}

fn set_once(
    actor: &str,
    kind: &'static str,
    slot: &mut Option<String>,
    value: String,
) -> Result<(), RegistryError> {
    match slot {
        Some(first) if *first != value => Err(RegistryError::ConflictingTags {
            actor: actor.to_string(),
            kind,
            first: first.clone(),
            second: value,
        }),
        Some(_) => Ok(()),
        None => {
            *slot = Some(value);
            Ok(())
        }
    }
}

/// What an actor reports back when it returns normally
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Work done
    Success,
    /// Preconditions did not apply; nothing to do
    SoftSkip(String),
}

/// Entry point of an actor
#[async_trait]
pub trait ActorEntrypoint: Send + Sync {
    /// Run the actor against the given context
    async fn execute(&self, ctx: &mut ActorContext) -> Result<Outcome, ActorError>;
}

/// Static declaration of an actor
#[derive(Clone)]
pub struct ActorDescriptor {
    /// Unique actor name
    pub name: String,
    /// Models the actor reads
    pub consumes: BTreeSet<String>,
    /// Consumed models that must have at least one message before the actor runs
    pub mandatory: BTreeSet<String>,
    /// Models the actor writes
    pub produces: BTreeSet<String>,
    /// Phase, workflow and capability tags
    pub tags: ActorTags,
    /// A failure of this actor aborts the run
    pub required: bool,
    /// Code to run
    pub entrypoint: Arc<dyn ActorEntrypoint>,
}

impl ActorDescriptor {
    /// Start declaring an actor
    pub fn builder(name: impl Into<String>) -> ActorDescriptorBuilder {
        ActorDescriptorBuilder {
            name: name.into(),
            consumes: BTreeSet::new(),
            mandatory: BTreeSet::new(),
            produces: BTreeSet::new(),
            tags: Vec::new(),
            required: false,
        }
    }

    /// Phase tag
    #[must_use]
    pub fn phase(&self) -> &str {
        &self.tags.phase
    }

    /// Workflow tag
    #[must_use]
    pub fn workflow(&self) -> &str {
        &self.tags.workflow
    }
}

impl fmt::Debug for ActorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorDescriptor")
            .field("name", &self.name)
            .field("consumes", &self.consumes)
            .field("mandatory", &self.mandatory)
            .field("produces", &self.produces)
            .field("tags", &self.tags)
            .field("required", &self.required)
            .finish_non_exhaustive()
    }
}

/// Builder for [`ActorDescriptor`]
pub struct ActorDescriptorBuilder {
    name: String,
    consumes: BTreeSet<String>,
    mandatory: BTreeSet<String>,
    produces: BTreeSet<String>,
    tags: Vec<Tag>,
    required: bool,
}

impl ActorDescriptorBuilder {
    /// Declare a consumed model
    #[must_use]
    pub fn consumes(mut self, model: impl Into<String>) -> Self {
        self.consumes.insert(model.into());
        self
    }

    /// Declare a consumed model that must be present before the actor runs
    #[must_use]
    pub fn consumes_mandatory(mut self, model: impl Into<String>) -> Self {
        let model = model.into();
        self.consumes.insert(model.clone());
        self.mandatory.insert(model);
        self
    }

    /// Declare a produced model
    #[must_use]
    pub fn produces(mut self, model: impl Into<String>) -> Self {
        self.produces.insert(model.into());
        self
    }

    /// Add a tag
    #[must_use]
    pub fn tag(mut self, tag: Tag) -> Self {
        self.tags.push(tag);
        self
    }

    /// Set the phase tag
    #[must_use]
    pub fn phase(self, phase: impl Into<String>) -> Self {
        self.tag(Tag::Phase(phase.into()))
    }

    /// Set the workflow tag
    #[must_use]
    pub fn workflow(self, workflow: impl Into<String>) -> Self {
        self.tag(Tag::Workflow(workflow.into()))
    }

    /// Add a capability tag
    #[must_use]
    pub fn capability(self, capability: impl Into<String>) -> Self {
        self.tag(Tag::Capability(capability.into()))
    }

    /// Mark the actor as required
    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Finish the declaration
    ///
    /// # Errors
    /// Returns an error for an empty name or a malformed tag set
    pub fn build(
        self,
        entrypoint: Arc<dyn ActorEntrypoint>,
    ) -> Result<ActorDescriptor, RegistryError> {
        if self.name.trim().is_empty() {
            return Err(RegistryError::EmptyName("actor"));
        }
        let tags = ActorTags::from_tags(&self.name, self.tags)?;

        Ok(ActorDescriptor {
            name: self.name,
            consumes: self.consumes,
            mandatory: self.mandatory,
            produces: self.produces,
            tags,
            required: self.required,
            entrypoint,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl ActorEntrypoint for Noop {
        async fn execute(&self, _ctx: &mut ActorContext) -> Result<Outcome, ActorError> {
            Ok(Outcome::Success)
        }
    }

    #[test]
    fn test_builder_collects_tags() {
        let actor = ActorDescriptor::builder("scan_kernel")
            .phase("facts")
            .workflow("in-place-upgrade")
            .capability(EXPERIMENTAL)
            .consumes_mandatory("Rpms")
            .consumes("Config")
            .produces("Kernel")
            .build(Arc::new(Noop))
            .unwrap();

        assert_eq!(actor.phase(), "facts");
        assert_eq!(actor.workflow(), "in-place-upgrade");
        assert!(actor.tags.is_experimental());
        assert!(actor.consumes.contains("Rpms") && actor.consumes.contains("Config"));
        assert_eq!(actor.mandatory.len(), 1);
        assert!(!actor.required);
    }

    #[test]
    fn test_builder_requires_phase_and_workflow() {
        let err = ActorDescriptor::builder("a")
            .workflow("w")
            .build(Arc::new(Noop))
            .unwrap_err();
        assert_eq!(err, RegistryError::MissingPhaseTag("a".into()));

        let err = ActorDescriptor::builder("a")
            .phase("p")
            .build(Arc::new(Noop))
            .unwrap_err();
        assert_eq!(err, RegistryError::MissingWorkflowTag("a".into()));
    }

    #[test]
    fn test_conflicting_phase_tags_rejected() {
        let err = ActorTags::from_tags(
            "a",
            [
                Tag::Phase("p1".into()),
                Tag::Workflow("w".into()),
                Tag::Phase("p2".into()),
            ],
        )
        .unwrap_err();

        assert!(matches!(
            err,
            RegistryError::ConflictingTags { kind: "phase", .. }
        ));

        // Repeating the same tag is harmless
        let tags = ActorTags::from_tags(
            "a",
            [
                Tag::Phase("p1".into()),
                Tag::Phase("p1".into()),
                Tag::Workflow("w".into()),
            ],
        )
        .unwrap();
        assert_eq!(tags.phase, "p1");
    }
}
