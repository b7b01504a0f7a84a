//! Static workflow validation and execution ordering
//!
//! Builds the producer -> consumer graph of a workflow and rejects it when
//! a consumed model can never have been produced by the time its consumer
//! runs, or when actors of one phase depend on each other in a cycle.
//!
//! # Ordering
//!
//! Phases run in workflow order. Inside a phase actors are sorted
//! topologically along intra-phase edges; actors with no path between
//! them keep declaration order, then name order.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::sync::Arc;

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use tracing::{debug, info};

use crate::descriptor::ActorDescriptor;
use crate::error::{ValidationError, ValidationIssue};
use crate::model::ModelRegistry;
use crate::registry::ActorRegistry;
use crate::workflow::{Phase, RebootBoundary, Workflow};

/// Knobs that change which actors take part in a run
#[derive(Debug, Clone, Default)]
pub struct ValidationOptions {
    /// Experimental actors to include
    pub enable_experimental: BTreeSet<String>,
}

/// Producer -> consumer edges of a workflow
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Nodes are actor names, edges carry the shared model names
    graph: DiGraph<String, Vec<String>>,
    /// Map from actor name to node for O(1) lookups
    nodes: HashMap<String, NodeIndex>,
}

impl DependencyGraph {
    fn add_actor(&mut self, name: &str) -> NodeIndex {
        let index = self.graph.add_node(name.to_string());
        self.nodes.insert(name.to_string(), index);
        index
    }

    /// Iterate `(producer, consumer, models)` edges
    pub fn edges(&self) -> impl Iterator<Item = (&str, &str, &[String])> {
        self.graph.edge_references().filter_map(move |edge| {
            let from = self.graph.node_weight(edge.source())?;
            let to = self.graph.node_weight(edge.target())?;
            Some((from.as_str(), to.as_str(), edge.weight().as_slice()))
        })
    }

    /// Actors whose output `actor` consumes
    #[must_use]
    pub fn producers_of(&self, actor: &str) -> Vec<&str> {
        self.neighbors(actor, petgraph::Direction::Incoming)
    }

    /// Actors consuming output of `actor`
    #[must_use]
    pub fn consumers_of(&self, actor: &str) -> Vec<&str> {
        self.neighbors(actor, petgraph::Direction::Outgoing)
    }

    fn neighbors(&self, actor: &str, direction: petgraph::Direction) -> Vec<&str> {
        let Some(&index) = self.nodes.get(actor) else {
            return Vec::new();
        };
        let mut names: Vec<&str> = self
            .graph
            .neighbors_directed(index, direction)
            .filter_map(|n| self.graph.node_weight(n).map(String::as_str))
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    /// Number of actors in the graph
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Number of edges in the graph
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }
}

/// Actors of one phase in execution order
#[derive(Debug, Clone)]
pub struct PhasePlan {
    /// Phase definition
    pub phase: Phase,
    /// Order index of the phase
    pub index: usize,
    /// Actors in validated order
    pub actors: Vec<Arc<ActorDescriptor>>,
}

/// A workflow that passed validation
#[derive(Debug, Clone)]
pub struct ValidatedWorkflow {
    /// Workflow definition
    pub workflow: Workflow,
    /// One plan per phase, in workflow order
    pub phases: Vec<PhasePlan>,
    /// Dependency graph of the effective actor set
    pub graph: DependencyGraph,
    /// Actors left out of the run (experimental, not enabled)
    pub excluded: Vec<String>,
}

impl ValidatedWorkflow {
    /// Total number of actors that will run
    #[must_use]
    pub fn actor_count(&self) -> usize {
        self.phases.iter().map(|p| p.actors.len()).sum()
    }
}

/// Validate with default options
///
/// # Errors
/// Returns every issue found; see [`validate_with`]
pub fn validate(
    workflow: &Workflow,
    registry: &ActorRegistry,
    models: &ModelRegistry,
) -> Result<ValidatedWorkflow, ValidationError> {
    validate_with(workflow, registry, models, &ValidationOptions::default())
}

/// Validate a workflow and compute the execution order
///
/// Only actors tagged with the workflow's name are considered.
///
/// # Errors
/// Returns a `ValidationError` listing every issue when any of these hold:
/// duplicate phases, stage changes without a new-stage reboot, actors on
/// unknown phases, unregistered models, consumed models without an
/// eligible producer, intra-phase cycles.
pub fn validate_with(
    workflow: &Workflow,
    registry: &ActorRegistry,
    models: &ModelRegistry,
    options: &ValidationOptions,
) -> Result<ValidatedWorkflow, ValidationError> {
    let mut issues = check_phases(workflow);

    let phase_order: HashMap<&str, usize> = workflow
        .phases
        .iter()
        .enumerate()
        .map(|(i, p)| (p.name.as_str(), i))
        .collect();

    let mut excluded = Vec::new();
    let mut actors: Vec<(usize, Arc<ActorDescriptor>)> = Vec::new();

    for actor in registry
        .all_actors()
        .iter()
        .filter(|a| a.workflow() == workflow.name)
    {
        if actor.tags.is_experimental() && !options.enable_experimental.contains(&actor.name) {
            debug!(actor = %actor.name, "experimental actor not enabled, excluding");
            excluded.push(actor.name.clone());
            continue;
        }

        for model in actor.consumes.iter().chain(&actor.produces) {
            if !models.contains(model) {
                issues.push(ValidationIssue::UnknownModel {
                    actor: actor.name.clone(),
                    model: model.clone(),
                });
            }
        }

        match phase_order.get(actor.phase()) {
            Some(&order) => actors.push((order, Arc::clone(actor))),
            None => issues.push(ValidationIssue::UnknownPhase {
                actor: actor.name.clone(),
                phase: actor.phase().to_string(),
            }),
        }
    }

    let mut graph = DependencyGraph::default();
    let nodes: Vec<NodeIndex> = actors
        .iter()
        .map(|(_, actor)| graph.add_actor(&actor.name))
        .collect();

    for (consumer_pos, (consumer_order, consumer)) in actors.iter().enumerate() {
        for model in &consumer.consumes {
            let mut satisfied = false;
            let mut later_producers = Vec::new();

            for (producer_pos, (producer_order, producer)) in actors.iter().enumerate() {
                if !producer.produces.contains(model) {
                    continue;
                }
                if producer_order > consumer_order {
                    later_producers.push(producer.name.clone());
                    continue;
                }
                satisfied = true;
                if producer_pos != consumer_pos {
                    add_edge_model(&mut graph, nodes[producer_pos], nodes[consumer_pos], model);
                }
            }

            if !satisfied {
                issues.push(ValidationIssue::MissingProducer {
                    actor: consumer.name.clone(),
                    phase: consumer.phase().to_string(),
                    model: model.clone(),
                    later_producers,
                });
            }
        }
    }

    // Cross-phase edges always point forward, so any cycle is intra-phase
    for component in tarjan_scc(&graph.graph) {
        if component.len() < 2 {
            continue;
        }
        let mut names: Vec<String> = component
            .iter()
            .filter_map(|n| graph.graph.node_weight(*n).cloned())
            .collect();
        names.sort();
        // Every member shares the phase of any one of them
        let phase = names
            .first()
            .and_then(|n| registry.get(n))
            .map(|a| a.phase().to_string())
            .unwrap_or_default();
        issues.push(ValidationIssue::Cycle {
            phase,
            actors: names,
        });
    }

    if !issues.is_empty() {
        return Err(ValidationError {
            workflow: workflow.name.clone(),
            issues,
        });
    }

    let phases = workflow
        .phases
        .iter()
        .enumerate()
        .map(|(index, phase)| PhasePlan {
            phase: phase.clone(),
            index,
            actors: order_phase(&graph, &actors, &nodes, index, registry),
        })
        .collect();

    let validated = ValidatedWorkflow {
        workflow: workflow.clone(),
        phases,
        graph,
        excluded,
    };

    info!(
        workflow = %workflow.name,
        phases = validated.phases.len(),
        actors = validated.actor_count(),
        edges = validated.graph.edge_count(),
        "workflow validated"
    );

    Ok(validated)
}

fn add_edge_model(graph: &mut DependencyGraph, from: NodeIndex, to: NodeIndex, model: &str) {
    match graph.graph.find_edge(from, to) {
        Some(edge) => {
            if let Some(models) = graph.graph.edge_weight_mut(edge) {
                models.push(model.to_string());
            }
        }
        None => {
            graph.graph.add_edge(from, to, vec![model.to_string()]);
        }
    }
}

fn check_phases(workflow: &Workflow) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    let mut seen = BTreeSet::new();

    for phase in &workflow.phases {
        if !seen.insert(phase.name.as_str()) {
            issues.push(ValidationIssue::DuplicatePhase(phase.name.clone()));
        }
    }

    for pair in workflow.phases.windows(2) {
        let [previous, phase] = pair else { continue };
        let new_stage = previous.reboot == Some(RebootBoundary::NewStage);

        if previous.stage != phase.stage && !new_stage {
            issues.push(ValidationIssue::UnexpectedStageChange {
                phase: phase.name.clone(),
                previous: previous.stage.clone(),
                stage: phase.stage.clone(),
            });
        } else if previous.stage == phase.stage && new_stage {
            issues.push(ValidationIssue::StageNotAdvanced {
                phase: phase.name.clone(),
                stage: phase.stage.clone(),
            });
        }
    }

    issues
}

/// Kahn's algorithm over intra-phase edges with a deterministic tie breaker
fn order_phase(
    graph: &DependencyGraph,
    actors: &[(usize, Arc<ActorDescriptor>)],
    nodes: &[NodeIndex],
    phase_index: usize,
    registry: &ActorRegistry,
) -> Vec<Arc<ActorDescriptor>> {
    let members: Vec<usize> = actors
        .iter()
        .enumerate()
        .filter(|(_, (order, _))| *order == phase_index)
        .map(|(pos, _)| pos)
        .collect();

    let position_of: HashMap<NodeIndex, usize> =
        members.iter().map(|&pos| (nodes[pos], pos)).collect();

    let mut in_degree: HashMap<usize, usize> = members.iter().map(|&pos| (pos, 0)).collect();
    for &pos in &members {
        for target in graph.graph.neighbors_directed(nodes[pos], petgraph::Direction::Outgoing) {
            if let Some(target_pos) = position_of.get(&target)
                && let Some(degree) = in_degree.get_mut(target_pos)
            {
                *degree += 1;
            }
        }
    }

    // (declaration position, name, index into `actors`)
    let key = |pos: usize| {
        let actor = &actors[pos].1;
        let declared = registry.position(&actor.name).unwrap_or(usize::MAX);
        Reverse((declared, actor.name.clone(), pos))
    };

    let mut ready: BinaryHeap<_> = members
        .iter()
        .filter(|pos| in_degree.get(pos) == Some(&0))
        .map(|&pos| key(pos))
        .collect();

    let mut ordered = Vec::with_capacity(members.len());
    while let Some(Reverse((_, _, pos))) = ready.pop() {
        ordered.push(Arc::clone(&actors[pos].1));

        for target in graph.graph.neighbors_directed(nodes[pos], petgraph::Direction::Outgoing) {
            let Some(&target_pos) = position_of.get(&target) else {
                continue;
            };
            if let Some(degree) = in_degree.get_mut(&target_pos) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push(key(target_pos));
                }
            }
        }
    }

    ordered
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::context::ActorContext;
    use crate::descriptor::{ActorEntrypoint, EXPERIMENTAL, Outcome};
    use crate::error::ActorError;
    use crate::model::{ModelSchema, REPORT_MODEL};

    struct Noop;

    #[async_trait]
    impl ActorEntrypoint for Noop {
        async fn execute(&self, _ctx: &mut ActorContext) -> Result<Outcome, ActorError> {
            Ok(Outcome::Success)
        }
    }

    fn workflow() -> Workflow {
        Workflow::new("ipu")
            .with_phase(Phase::new("facts", "pre"))
            .with_phase(Phase::new("checks", "pre").checkpoint())
            .with_phase(Phase::new("apply", "pre").reboot_after(RebootBoundary::NewStage))
            .with_phase(Phase::new("finalize", "post"))
    }

    fn models() -> ModelRegistry {
        let mut models = ModelRegistry::with_builtins();
        for name in ["M1", "M2", "M3"] {
            models.register(ModelSchema::new(name)).unwrap();
        }
        models
    }

    fn actor(name: &str, phase: &str, consumes: &[&str], produces: &[&str]) -> ActorDescriptor {
        let mut builder = ActorDescriptor::builder(name).phase(phase).workflow("ipu");
        for m in consumes {
            builder = builder.consumes(*m);
        }
        for m in produces {
            builder = builder.produces(*m);
        }
        builder.build(Arc::new(Noop)).unwrap()
    }

    fn registry(actors: Vec<ActorDescriptor>) -> ActorRegistry {
        let mut registry = ActorRegistry::new();
        for a in actors {
            registry.register(a).unwrap();
        }
        registry
    }

    fn names(plan: &PhasePlan) -> Vec<&str> {
        plan.actors.iter().map(|a| a.name.as_str()).collect()
    }

    #[test]
    fn test_valid_workflow_orders_phases() {
        let registry = registry(vec![
            actor("consumer", "checks", &["M1"], &[REPORT_MODEL]),
            actor("producer", "facts", &[], &["M1"]),
            actor("finalizer", "finalize", &["M1"], &[]),
        ]);

        let validated = validate(&workflow(), &registry, &models()).unwrap();

        assert_eq!(names(&validated.phases[0]), vec!["producer"]);
        assert_eq!(names(&validated.phases[1]), vec!["consumer"]);
        assert!(validated.phases[2].actors.is_empty());
        assert_eq!(names(&validated.phases[3]), vec!["finalizer"]);
        assert_eq!(validated.graph.consumers_of("producer"), vec!["consumer", "finalizer"]);
        assert_eq!(validated.graph.edge_count(), 2);
    }

    #[test]
    fn test_missing_producer_is_rejected() {
        let registry = registry(vec![actor("consumer", "checks", &["M1"], &[])]);

        let err = validate(&workflow(), &registry, &models()).unwrap_err();
        assert_eq!(
            err.issues,
            vec![ValidationIssue::MissingProducer {
                actor: "consumer".into(),
                phase: "checks".into(),
                model: "M1".into(),
                later_producers: vec![],
            }]
        );
    }

    #[test]
    fn test_later_producer_is_not_eligible() {
        let registry = registry(vec![
            actor("consumer", "facts", &["M1"], &[]),
            actor("late", "apply", &[], &["M1"]),
        ]);

        let err = validate(&workflow(), &registry, &models()).unwrap_err();
        assert!(matches!(
            &err.issues[..],
            [ValidationIssue::MissingProducer { later_producers, .. }] if later_producers == &vec!["late".to_string()]
        ));
        assert!(err.to_string().contains("only produced later by late"));
    }

    #[test]
    fn test_intra_phase_topological_order() {
        // Declared in reverse dependency order
        let registry = registry(vec![
            actor("c", "facts", &["M2"], &[]),
            actor("b", "facts", &["M1"], &["M2"]),
            actor("independent", "facts", &[], &["M3"]),
            actor("a", "facts", &[], &["M1"]),
        ]);

        let validated = validate(&workflow(), &registry, &models()).unwrap();
        assert_eq!(
            names(&validated.phases[0]),
            vec!["independent", "a", "b", "c"]
        );
    }

    #[test]
    fn test_self_consumption_is_not_a_cycle() {
        let registry = registry(vec![actor("loop", "facts", &["M1"], &["M1"])]);

        let validated = validate(&workflow(), &registry, &models()).unwrap();
        assert_eq!(names(&validated.phases[0]), vec!["loop"]);
        assert_eq!(validated.graph.edge_count(), 0);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let registry = registry(vec![
            actor("a", "facts", &["M2"], &["M1"]),
            actor("b", "facts", &["M1"], &["M2"]),
        ]);

        let err = validate(&workflow(), &registry, &models()).unwrap_err();
        assert_eq!(
            err.issues,
            vec![ValidationIssue::Cycle {
                phase: "facts".into(),
                actors: vec!["a".into(), "b".into()],
            }]
        );
    }

    #[test]
    fn test_unknown_phase_and_model() {
        let registry = registry(vec![actor("a", "nowhere", &[], &["Unknown"])]);

        let err = validate(&workflow(), &registry, &models()).unwrap_err();
        assert_eq!(err.issues.len(), 2);
        assert!(err.issues.contains(&ValidationIssue::UnknownPhase {
            actor: "a".into(),
            phase: "nowhere".into(),
        }));
    }

    #[test]
    fn test_other_workflows_are_ignored() {
        let other = ActorDescriptor::builder("foreign")
            .phase("facts")
            .workflow("other")
            .consumes("M1")
            .build(Arc::new(Noop))
            .unwrap();
        let registry = registry(vec![other]);

        let validated = validate(&workflow(), &registry, &models()).unwrap();
        assert_eq!(validated.actor_count(), 0);
    }

    #[test]
    fn test_experimental_actors_need_enabling() {
        let experimental = ActorDescriptor::builder("exp")
            .phase("facts")
            .workflow("ipu")
            .capability(EXPERIMENTAL)
            .produces("M1")
            .build(Arc::new(Noop))
            .unwrap();
        let registry = registry(vec![experimental, actor("consumer", "checks", &["M1"], &[])]);

        // Without the experimental producer the consumer is unsatisfiable
        let err = validate(&workflow(), &registry, &models()).unwrap_err();
        assert_eq!(err.issues.len(), 1);

        let options = ValidationOptions {
            enable_experimental: BTreeSet::from(["exp".to_string()]),
        };
        let validated = validate_with(&workflow(), &registry, &models(), &options).unwrap();
        assert_eq!(validated.actor_count(), 2);
        assert!(validated.excluded.is_empty());
    }

    #[test]
    fn test_stage_changes_need_new_stage_reboot() {
        let workflow = Workflow::new("ipu")
            .with_phase(Phase::new("a", "pre"))
            .with_phase(Phase::new("b", "post"))
            .with_phase(Phase::new("c", "post").reboot_after(RebootBoundary::NewStage))
            .with_phase(Phase::new("d", "post"))
            .with_phase(Phase::new("a", "post"));

        let err = validate(&workflow, &ActorRegistry::new(), &models()).unwrap_err();
        assert_eq!(
            err.issues,
            vec![
                ValidationIssue::DuplicatePhase("a".into()),
                ValidationIssue::UnexpectedStageChange {
                    phase: "b".into(),
                    previous: "pre".into(),
                    stage: "post".into(),
                },
                ValidationIssue::StageNotAdvanced {
                    phase: "d".into(),
                    stage: "post".into(),
                },
            ]
        );
    }
}
