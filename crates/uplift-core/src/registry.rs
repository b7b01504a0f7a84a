//! Actor registry
//!
//! In-memory catalogue of actor descriptors. Declaration order is kept and
//! used as the tie breaker when ordering actors inside a phase.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::descriptor::ActorDescriptor;
use crate::error::RegistryError;

/// Catalogue of registered actors
#[derive(Debug, Clone, Default)]
pub struct ActorRegistry {
    /// Actors in declaration order
    actors: Vec<Arc<ActorDescriptor>>,
    /// Position of each actor in `actors`
    index: HashMap<String, usize>,
}

impl ActorRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an actor
    ///
    /// # Errors
    /// Returns `RegistryError::DuplicateActor` if the name is taken
    pub fn register(&mut self, descriptor: ActorDescriptor) -> Result<(), RegistryError> {
        if self.index.contains_key(&descriptor.name) {
            return Err(RegistryError::DuplicateActor(descriptor.name));
        }

        debug!(
            actor = %descriptor.name,
            phase = %descriptor.tags.phase,
            workflow = %descriptor.tags.workflow,
            "registered actor"
        );

        self.index
            .insert(descriptor.name.clone(), self.actors.len());
        self.actors.push(Arc::new(descriptor));
        Ok(())
    }

    /// Actors tagged with `phase`, in declaration order
    #[must_use]
    pub fn actors_for_phase(&self, phase: &str) -> Vec<Arc<ActorDescriptor>> {
        self.actors
            .iter()
            .filter(|a| a.tags.phase == phase)
            .cloned()
            .collect()
    }

    /// All actors in declaration order
    #[must_use]
    pub fn all_actors(&self) -> &[Arc<ActorDescriptor>] {
        &self.actors
    }

    /// Look up an actor by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<ActorDescriptor>> {
        self.index.get(name).and_then(|&i| self.actors.get(i))
    }

    /// Declaration position of an actor
    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Number of registered actors
    #[must_use]
    pub fn len(&self) -> usize {
        self.actors.len()
    }

    /// Whether no actor is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::context::ActorContext;
    use crate::descriptor::{ActorEntrypoint, Outcome};
    use crate::error::ActorError;

    struct Noop;

    #[async_trait]
    impl ActorEntrypoint for Noop {
        async fn execute(&self, _ctx: &mut ActorContext) -> Result<Outcome, ActorError> {
            Ok(Outcome::Success)
        }
    }

    fn actor(name: &str, phase: &str) -> ActorDescriptor {
        ActorDescriptor::builder(name)
            .phase(phase)
            .workflow("w")
            .build(Arc::new(Noop))
            .unwrap()
    }

    #[test]
    fn test_register_and_query() {
        let mut registry = ActorRegistry::new();
        registry.register(actor("b", "facts")).unwrap();
        registry.register(actor("a", "facts")).unwrap();
        registry.register(actor("c", "checks")).unwrap();

        let names: Vec<_> = registry
            .actors_for_phase("facts")
            .iter()
            .map(|a| a.name.clone())
            .collect();
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(registry.all_actors().len(), 3);
        assert_eq!(registry.position("c"), Some(2));
        assert!(registry.get("a").is_some());
        assert!(registry.actors_for_phase("missing").is_empty());
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut registry = ActorRegistry::new();
        registry.register(actor("a", "facts")).unwrap();

        let err = registry.register(actor("a", "checks")).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateActor("a".into()));
        assert_eq!(registry.len(), 1);
    }
}
