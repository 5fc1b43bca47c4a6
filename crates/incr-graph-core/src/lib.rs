//! Core domain types shared across the IncrGraph workspace.
//!
//! A file is modeled as a [`FileGraph`]: a set of [`Node`]s holding code fragments
//! (classes, methods, libraries, ...) and typed [`Edge`]s between them. Nodes carry
//! the dependency/definition sets produced by static analysis, which is what the
//! relationship inference in `incr-graph-engine` consumes.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use serde::{Deserialize, Serialize};

/// Identifier of the synthetic node every execution path starts from.
pub const START_NODE_ID: &str = "start";

// =============================================================================
// Identifiers
// =============================================================================

/// Identifier for nodes within a [`FileGraph`].
///
/// Ids are opaque strings that must stay stable across load/save cycles.
#[derive(Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    /// Create a node id from anything string-like.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The synthetic `start` node id.
    pub fn start() -> Self {
        Self(START_NODE_ID.to_string())
    }

    /// Check if this is the synthetic `start` node.
    pub fn is_start(&self) -> bool {
        self.0 == START_NODE_ID
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier for edges within a [`FileGraph`].
#[derive(Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EdgeId(pub String);

impl EdgeId {
    /// Create an edge id from anything string-like.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EdgeId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// =============================================================================
// Node kinds
// =============================================================================

/// Enumerates the kinds of nodes that can populate a [`FileGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Free-standing snippet of code.
    #[default]
    CodeFragment,
    /// A class definition.
    Class,
    /// An abstract base class.
    AbstractClass,
    /// An interface / protocol declaration.
    Interface,
    /// A method attached to a class through a `method` edge.
    Method,
    /// Library import or setup code.
    Library,
    /// Plain import statements.
    Import,
    /// Markdown documentation attached to other nodes.
    Documentation,
    /// The synthetic entry point of execution paths.
    Start,
    /// Runs the selected session of another file as a single step.
    Graph,
}

/// Coarse category of a [`NodeKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeCategory {
    /// Carries executable code and analysis data.
    Code,
    /// Graph scaffolding with no code of its own.
    Structural,
    /// Prose attached to code nodes.
    Documentation,
}

/// Category a node kind belongs to.
pub fn node_category(kind: NodeKind) -> NodeCategory {
    match kind {
        NodeKind::CodeFragment
        | NodeKind::Class
        | NodeKind::AbstractClass
        | NodeKind::Interface
        | NodeKind::Method
        | NodeKind::Library
        | NodeKind::Import => NodeCategory::Code,
        NodeKind::Start | NodeKind::Graph => NodeCategory::Structural,
        NodeKind::Documentation => NodeCategory::Documentation,
    }
}

/// Whether nodes of this kind hold code and take part in relationship inference.
pub fn is_code_bearing(kind: NodeKind) -> bool {
    node_category(kind) == NodeCategory::Code
}

/// Whether nodes of this kind count as classes for inheritance/override detection.
pub fn is_class_like(kind: NodeKind) -> bool {
    matches!(kind, NodeKind::Class | NodeKind::AbstractClass)
}

/// Whether nodes of this kind are methods.
pub fn is_method(kind: NodeKind) -> bool {
    kind == NodeKind::Method
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeKind::CodeFragment => "code_fragment",
            NodeKind::Class => "class",
            NodeKind::AbstractClass => "abstract_class",
            NodeKind::Interface => "interface",
            NodeKind::Method => "method",
            NodeKind::Library => "library",
            NodeKind::Import => "import",
            NodeKind::Documentation => "documentation",
            NodeKind::Start => "start",
            NodeKind::Graph => "graph",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Analysis data
// =============================================================================

/// Names a node consumes, grouped by kind.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependencies {
    #[serde(default)]
    pub variables: BTreeSet<String>,
    #[serde(default)]
    pub functions: BTreeSet<String>,
    #[serde(default)]
    pub classes: BTreeSet<String>,
    #[serde(default)]
    pub modules: BTreeSet<String>,
}

impl Dependencies {
    /// Iterate over every dependency name, across all groups.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.variables
            .iter()
            .chain(&self.functions)
            .chain(&self.classes)
            .chain(&self.modules)
            .map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.names().next().is_none()
    }

    /// Dependency variables that look like type references (PascalCase).
    pub fn type_references(&self) -> impl Iterator<Item = &str> {
        self.variables
            .iter()
            .filter(|v| v.chars().next().is_some_and(char::is_uppercase))
            .map(String::as_str)
    }
}

/// Names a node introduces, grouped by kind.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Definitions {
    #[serde(default)]
    pub variables: BTreeSet<String>,
    #[serde(default)]
    pub functions: BTreeSet<String>,
    #[serde(default)]
    pub classes: BTreeSet<String>,
}

impl Definitions {
    /// Iterate over every defined name, across all groups.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.variables
            .iter()
            .chain(&self.functions)
            .chain(&self.classes)
            .map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.names().next().is_none()
    }

    /// Bare method names of qualified `Class.method` function definitions.
    pub fn qualified_methods(&self) -> impl Iterator<Item = &str> {
        self.functions
            .iter()
            .filter_map(|f| f.split_once('.').map(|(_, method)| method))
            .map(|method| method.split('.').next().unwrap_or(method))
    }
}

/// Output of the external static analyzer for one node's code.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Analysis {
    #[serde(default)]
    pub dependencies: Dependencies,
    #[serde(default)]
    pub definitions: Definitions,
}

// =============================================================================
// Nodes
// =============================================================================

/// Session of another file that a [`NodeKind::Graph`] node executes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GraphRef {
    /// File whose graph holds the referenced session.
    pub file: String,
    /// Session whose execution path is replayed.
    pub session: String,
}

impl GraphRef {
    pub fn new(file: impl Into<String>, session: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            session: session.into(),
        }
    }
}

/// A graph vertex holding a code fragment or structural element.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier for this node.
    pub id: NodeId,
    /// Category-specific kind.
    pub kind: NodeKind,
    /// Human readable label.
    #[serde(default)]
    pub label: String,
    /// Source code, for code-bearing kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Enclosing class name, set for methods once analysis has placed them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Names this node consumes.
    #[serde(default)]
    pub dependencies: Dependencies,
    /// Names this node introduces.
    #[serde(default)]
    pub definitions: Definitions,
    /// Referenced session, for graph nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph: Option<GraphRef>,
}

impl Node {
    /// Create an empty node of the given kind. The label defaults to the id.
    pub fn new(id: impl Into<NodeId>, kind: NodeKind) -> Self {
        let id = id.into();
        Self {
            label: id.0.clone(),
            id,
            kind,
            ..Default::default()
        }
    }

    /// The synthetic start node.
    pub fn start() -> Self {
        Self::new(NodeId::start(), NodeKind::Start)
    }

    /// A graph node executing `session` of `file`.
    pub fn graph_ref(
        id: impl Into<NodeId>,
        file: impl Into<String>,
        session: impl Into<String>,
    ) -> Self {
        Self {
            graph: Some(GraphRef::new(file, session)),
            ..Self::new(id, NodeKind::Graph)
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Replace analysis data, consuming the builder.
    pub fn with_analysis(mut self, analysis: Analysis) -> Self {
        self.apply_analysis(analysis);
        self
    }

    /// Store fresh static-analysis output on this node.
    ///
    /// Scoped methods get their bare function definitions qualified with the
    /// enclosing class (`run` becomes `Base.run`).
    pub fn apply_analysis(&mut self, analysis: Analysis) {
        let Analysis {
            dependencies,
            mut definitions,
        } = analysis;

        if let (true, Some(scope)) = (is_method(self.kind), self.scope.as_deref()) {
            definitions.functions = definitions
                .functions
                .into_iter()
                .map(|f| {
                    if f.contains('.') {
                        f
                    } else {
                        format!("{scope}.{f}")
                    }
                })
                .collect();
        }

        self.dependencies = dependencies;
        self.definitions = definitions;
    }

    /// Code to hand to the execution runner, if this node has any.
    ///
    /// Scoped methods are wrapped so their definitions land on the class.
    pub fn execution_code(&self) -> Option<String> {
        let code = self.code.as_deref()?;
        match (is_method(self.kind), self.scope.as_deref()) {
            (true, Some(scope)) => Some(scoped_code(code, scope)),
            _ => Some(code.to_string()),
        }
    }

    /// Label shown for this node in execution trees: `"{label} ({id})"`.
    pub fn display_label(&self) -> String {
        format!("{} ({})", self.label, self.id)
    }
}

/// Wrap a method body so everything it defines is attached to `class`.
pub fn scoped_code(code: &str, class: &str) -> String {
    let body: Vec<String> = code
        .lines()
        .map(|line| {
            let trimmed = line.trim_start();
            let indent = line[..line.len() - trimmed.len()].replace('\t', "    ");
            format!("    {indent}{trimmed}")
        })
        .collect();

    format!(
        "def add_code_to_class(cls):\n\
         \x20   # START CODE INJECTION\n\
         {body}\n\
         \x20   # END CODE INJECTION\n\
         \x20   for key, value in locals().items():\n\
         \x20       if key != 'cls':\n\
         \x20           setattr(cls, key, value)\n\
         \n\
         add_code_to_class({class})\n\
         \n\
         del add_code_to_class",
        body = body.join("\n"),
    )
}

// =============================================================================
// Edges
// =============================================================================

/// Kind of relationship an [`Edge`] expresses.
///
/// `Dependency`, `Inheritance` and `Overrides` are derived: they are rebuilt by
/// relationship inference and never edited by hand.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EdgeKind {
    /// Source uses a name the target defines.
    Dependency,
    /// Source class inherits from target class.
    Inheritance,
    /// Source method overrides target method.
    Overrides,
    /// Method node attached to its class.
    Method,
    /// Step of a session's execution path.
    Execution {
        /// Session owning the path.
        session: String,
    },
    /// Documentation attached to a node.
    Documentation,
    /// Any other user-drawn connection.
    Base,
}

/// Whether edges of this kind are produced by relationship inference.
pub fn is_derived(kind: &EdgeKind) -> bool {
    matches!(
        kind,
        EdgeKind::Dependency | EdgeKind::Inheritance | EdgeKind::Overrides
    )
}

/// Whether this is an execution edge of the given session.
pub fn is_execution_of(kind: &EdgeKind, session: &str) -> bool {
    matches!(kind, EdgeKind::Execution { session: s } if s == session)
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EdgeKind::Dependency => write!(f, "dependency"),
            EdgeKind::Inheritance => write!(f, "inheritance"),
            EdgeKind::Overrides => write!(f, "overrides"),
            EdgeKind::Method => write!(f, "method"),
            EdgeKind::Execution { .. } => write!(f, "execution"),
            EdgeKind::Documentation => write!(f, "documentation"),
            EdgeKind::Base => write!(f, "base"),
        }
    }
}

/// A typed, directed relationship between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// Unique identifier for this edge.
    pub id: EdgeId,
    /// Originating node.
    pub source: NodeId,
    /// Destination node.
    pub target: NodeId,
    /// Relationship kind.
    pub kind: EdgeKind,
    /// Free text. Execution edges store their 1-based path position here,
    /// dependency edges the comma-joined satisfied names.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Edge {
    pub fn new(
        id: impl Into<EdgeId>,
        source: impl Into<NodeId>,
        target: impl Into<NodeId>,
        kind: EdgeKind,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            kind,
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Check if either endpoint is `node`.
    pub fn touches(&self, node: &NodeId) -> bool {
        &self.source == node || &self.target == node
    }

    /// Numeric label of an execution edge (its 1-based path position).
    pub fn execution_position(&self) -> Option<usize> {
        match self.kind {
            EdgeKind::Execution { .. } => self.label.as_deref()?.trim().parse().ok(),
            _ => None,
        }
    }
}

impl From<String> for EdgeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// =============================================================================
// File graph
// =============================================================================

/// Nodes and edges of a single IncrGraph file.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct FileGraph {
    /// All nodes of the file.
    pub nodes: Vec<Node>,
    /// All edges of the file.
    pub edges: Vec<Edge>,
    /// Arbitrary metadata about the file.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl FileGraph {
    /// Creates an empty graph with no nodes or edges.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns the number of nodes currently tracked.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Returns the number of edges currently tracked.
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Look up a node by id.
    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    /// Look up a node mutably by id.
    pub fn node_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| &n.id == id)
    }

    pub fn contains_node(&self, id: &NodeId) -> bool {
        self.node(id).is_some()
    }

    /// Add a node, replacing any node with the same id.
    pub fn upsert_node(&mut self, node: Node) {
        match self.node_mut(&node.id) {
            Some(existing) => *existing = node,
            None => self.nodes.push(node),
        }
    }

    /// Remove a node without touching edges. Returns the removed node.
    pub fn take_node(&mut self, id: &NodeId) -> Option<Node> {
        let pos = self.nodes.iter().position(|n| &n.id == id)?;
        Some(self.nodes.remove(pos))
    }

    /// Look up an edge by id.
    pub fn edge(&self, id: &EdgeId) -> Option<&Edge> {
        self.edges.iter().find(|e| &e.id == id)
    }

    /// Add an edge. Its id must be unique, see [`FileGraph::fresh_edge_id`].
    pub fn add_edge(&mut self, edge: Edge) {
        self.edges.push(edge);
    }

    /// Connect `source` to `target` with a fresh id.
    pub fn connect(&mut self, source: &NodeId, target: &NodeId, kind: EdgeKind) -> EdgeId {
        let id = self.fresh_edge_id(source, target);
        self.edges
            .push(Edge::new(id.clone(), source.clone(), target.clone(), kind));
        id
    }

    /// Generate an unused edge id of the form `{source}-{target}[-n]`.
    pub fn fresh_edge_id(&self, source: &NodeId, target: &NodeId) -> EdgeId {
        let base = format!("{source}-{target}");
        if self.edge(&EdgeId::new(base.clone())).is_none() {
            return EdgeId(base);
        }
        (1..)
            .map(|i| EdgeId(format!("{base}-{i}")))
            .find(|id| self.edge(id).is_none())
            .unwrap_or_default()
    }

    /// Edges with either endpoint at `node`.
    pub fn edges_touching<'a>(&'a self, node: &'a NodeId) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.touches(node))
    }

    /// Edges not produced by relationship inference.
    pub fn authored_edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(|e| !is_derived(&e.kind))
    }

    /// Edges produced by relationship inference.
    pub fn derived_edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(|e| is_derived(&e.kind))
    }

    /// Convert to a petgraph `StableDiGraph` for traversal.
    /// Returns the graph and a mapping from `NodeId` to `NodeIndex`.
    ///
    /// Edges with a dangling endpoint are skipped.
    pub fn to_petgraph(&self) -> (StableDiGraph<Node, Edge>, HashMap<NodeId, NodeIndex>) {
        petgraph_from(self.nodes.iter(), self.edges.iter())
    }
}

/// Build a petgraph view over an arbitrary node/edge selection.
pub fn petgraph_from<'a>(
    nodes: impl IntoIterator<Item = &'a Node>,
    edges: impl IntoIterator<Item = &'a Edge>,
) -> (StableDiGraph<Node, Edge>, HashMap<NodeId, NodeIndex>) {
    let mut graph = StableDiGraph::new();
    let mut id_to_index = HashMap::new();

    for node in nodes {
        let idx = graph.add_node(node.clone());
        id_to_index.insert(node.id.clone(), idx);
    }

    for edge in edges {
        if let (Some(&from), Some(&to)) =
            (id_to_index.get(&edge.source), id_to_index.get(&edge.target))
        {
            graph.add_edge(from, to, edge.clone());
        }
    }

    (graph, id_to_index)
}
