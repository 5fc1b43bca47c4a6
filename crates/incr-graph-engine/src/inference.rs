//! Relationship inference: dependency, inheritance and override edges.
//!
//! Derived edges are a pure function of node analysis data and the authored
//! edges of a file. Every run discards them and rebuilds all three stages in
//! order, each stage reading the output of the previous one:
//!
//! 1. **Dependency**: node `Y` depends on a name node `X` defines gives `Y -> X`.
//! 2. **Inheritance**: a class referencing a PascalCase name that a class it
//!    depends on defines gives `Child -> Base`.
//! 3. **Overrides**: `method -> class -> superclass <- method` with a shared bare
//!    method name gives `Child.run -> Base.run`.
//!
//! Output is sorted, so iteration order of the input never shows.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use incr_graph_core::{
    is_class_like, is_code_bearing, is_derived, is_method, petgraph_from, Edge, EdgeId, EdgeKind,
    FileGraph, Node, NodeId,
};
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Counts of derived edges produced by one inference run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceSummary {
    pub dependency: usize,
    pub inheritance: usize,
    pub overrides: usize,
}

impl InferenceSummary {
    pub fn total(&self) -> usize {
        self.dependency + self.inheritance + self.overrides
    }
}

/// Compute every derived edge for `nodes`.
///
/// `existing` may contain anything; derived kinds in it are ignored, the rest
/// (method edges in particular) feed the override stage.
pub fn infer(nodes: &[Node], existing: &[Edge]) -> Vec<Edge> {
    let dependency = infer_dependencies(nodes);
    let inheritance = infer_inheritance(nodes, &dependency);
    let overrides = infer_overrides(nodes, existing, &inheritance);

    let mut derived = dependency;
    derived.extend(inheritance);
    derived.extend(overrides);
    derived
}

/// Replace the derived edges of `graph` with a fresh inference result.
pub fn refresh(graph: &mut FileGraph) -> InferenceSummary {
    let derived = infer(&graph.nodes, &graph.edges);
    let summary = summarize(&derived);

    graph.edges.retain(|e| !is_derived(&e.kind));
    graph.edges.extend(derived);

    debug!(
        nodes = graph.node_count(),
        dependency = summary.dependency,
        inheritance = summary.inheritance,
        overrides = summary.overrides,
        "relationships_inferred"
    );
    summary
}

fn summarize(edges: &[Edge]) -> InferenceSummary {
    let mut summary = InferenceSummary::default();
    for edge in edges {
        match edge.kind {
            EdgeKind::Dependency => summary.dependency += 1,
            EdgeKind::Inheritance => summary.inheritance += 1,
            EdgeKind::Overrides => summary.overrides += 1,
            _ => {}
        }
    }
    summary
}

// =============================================================================
// Dependency stage
// =============================================================================

/// One edge per `(dependent, definer)` pair, labeled with the shared names.
///
/// Self-loops are kept: a node that both uses and defines a name points at itself.
pub fn infer_dependencies(nodes: &[Node]) -> Vec<Edge> {
    let mut dependency_map: BTreeMap<&str, BTreeSet<&NodeId>> = BTreeMap::new();
    let mut definition_map: BTreeMap<&str, BTreeSet<&NodeId>> = BTreeMap::new();

    for node in nodes.iter().filter(|n| is_code_bearing(n.kind)) {
        for name in node.dependencies.names() {
            dependency_map.entry(name).or_default().insert(&node.id);
        }
        for name in node.definitions.names() {
            definition_map.entry(name).or_default().insert(&node.id);
        }
    }

    let mut cells: BTreeMap<(&NodeId, &NodeId), BTreeSet<&str>> = BTreeMap::new();
    for (name, dependents) in &dependency_map {
        let Some(definers) = definition_map.get(name) else {
            continue;
        };
        for &source in dependents {
            for &target in definers {
                cells.entry((source, target)).or_default().insert(*name);
            }
        }
    }

    cells
        .into_iter()
        .map(|((source, target), names)| {
            let label = names.into_iter().collect::<Vec<_>>().join(", ");
            Edge::new(
                EdgeId(format!("dependency:{source}->{target}")),
                source.clone(),
                target.clone(),
                EdgeKind::Dependency,
            )
            .with_label(label)
        })
        .collect()
}

// =============================================================================
// Inheritance stage
// =============================================================================

/// Class-to-class edges for PascalCase references resolved through dependency edges.
pub fn infer_inheritance(nodes: &[Node], dependency: &[Edge]) -> Vec<Edge> {
    let by_id: HashMap<&NodeId, &Node> = nodes.iter().map(|n| (&n.id, n)).collect();
    let mut found: BTreeSet<(&NodeId, &NodeId, &str)> = BTreeSet::new();

    for node in nodes.iter().filter(|n| is_class_like(n.kind)) {
        let targets: Vec<&Node> = dependency
            .iter()
            .filter(|e| e.kind == EdgeKind::Dependency && e.source == node.id)
            .filter_map(|e| by_id.get(&e.target).copied())
            .filter(|t| is_class_like(t.kind))
            .collect();

        for candidate in node.dependencies.type_references() {
            for &target in &targets {
                if target.definitions.classes.contains(candidate) {
                    found.insert((&node.id, &target.id, candidate));
                }
            }
        }
    }

    found
        .into_iter()
        .map(|(source, target, name)| {
            derived_edge(EdgeKind::Inheritance, source, target, name)
        })
        .collect()
}

// =============================================================================
// Overrides stage
// =============================================================================

/// Method-to-method edges along `method -> class -> superclass <- method`.
pub fn infer_overrides(nodes: &[Node], existing: &[Edge], inheritance: &[Edge]) -> Vec<Edge> {
    let structural = existing
        .iter()
        .filter(|e| e.kind == EdgeKind::Method)
        .chain(inheritance.iter().filter(|e| e.kind == EdgeKind::Inheritance));
    let (graph, index) = petgraph_from(nodes, structural);

    let mut found: BTreeSet<(&NodeId, &NodeId, String)> = BTreeSet::new();

    for method in nodes.iter().filter(|n| is_method(n.kind)) {
        let names: BTreeSet<&str> = method.definitions.qualified_methods().collect();
        if names.is_empty() {
            continue;
        }
        let Some(&start) = index.get(&method.id) else {
            continue;
        };

        for class in hop(&graph, start, Direction::Outgoing, &EdgeKind::Method) {
            for parent in hop(&graph, class, Direction::Outgoing, &EdgeKind::Inheritance) {
                for candidate in hop(&graph, parent, Direction::Incoming, &EdgeKind::Method) {
                    let other = &graph[candidate];
                    if !is_method(other.kind) {
                        continue;
                    }
                    for name in other.definitions.qualified_methods() {
                        if names.contains(name) {
                            found.insert((&method.id, &other.id, name.to_string()));
                        }
                    }
                }
            }
        }
    }

    found
        .into_iter()
        .map(|(source, target, name)| derived_edge(EdgeKind::Overrides, source, target, &name))
        .collect()
}

/// Neighbors of `from` across edges of exactly `kind`, in one direction.
fn hop(
    graph: &StableDiGraph<Node, Edge>,
    from: NodeIndex,
    direction: Direction,
    kind: &EdgeKind,
) -> Vec<NodeIndex> {
    graph
        .edges_directed(from, direction)
        .filter(|e| &e.weight().kind == kind)
        .map(|e| match direction {
            Direction::Outgoing => e.target(),
            Direction::Incoming => e.source(),
        })
        .collect()
}

fn derived_edge(kind: EdgeKind, source: &NodeId, target: &NodeId, label: &str) -> Edge {
    Edge::new(
        EdgeId(format!("{kind}:{source}->{target}:{label}")),
        source.clone(),
        target.clone(),
        kind,
    )
    .with_label(label)
}
