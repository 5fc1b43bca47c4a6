//! The graph context: every loaded file with its graph and sessions.
//!
//! There is no global store. Callers own a [`GraphContext`] (usually behind a
//! [`SharedContext`] handle) and pass it into each engine call.

use std::collections::BTreeMap;
use std::sync::Arc;

use incr_graph_core::{Edge, EdgeId, EdgeKind, FileGraph, GraphRef, Node, NodeId};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::inference::{self, InferenceSummary};
use crate::session::{self, Execution, Session, SessionBook};
use crate::tree::ExecutionTree;

/// Handle to a context shared between the caller and spawned executions.
pub type SharedContext = Arc<RwLock<GraphContext>>;

/// Graph and sessions of one file.
#[derive(Debug, Clone, Default)]
pub struct FileState {
    pub graph: FileGraph,
    pub sessions: SessionBook,
}

impl FileState {
    pub fn session(&self, name: &str) -> Option<&Session> {
        self.sessions.get(name)
    }
}

/// Result of removing an edge by id.
#[derive(Debug, Clone, PartialEq)]
pub enum EdgeRemoval {
    /// An execution step was spliced out of a session.
    Execution { session: String, execution: Execution },
    /// A non-execution edge was dropped.
    Plain(Edge),
}

/// All files currently loaded.
#[derive(Debug, Default)]
pub struct GraphContext {
    files: BTreeMap<String, FileState>,
}

impl GraphContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap into a handle usable by the session ledger.
    pub fn into_shared(self) -> SharedContext {
        Arc::new(RwLock::new(self))
    }

    /// Load a file graph with no sessions. Replaces any file under the same key.
    pub fn insert_file(&mut self, file: impl Into<String>, graph: FileGraph) {
        self.insert_file_with_sessions(file, graph, SessionBook::new());
    }

    /// Load a file graph together with previously persisted sessions.
    ///
    /// The synthetic start node is added when missing and the execution edges of
    /// every session are rebuilt from its path.
    pub fn insert_file_with_sessions(
        &mut self,
        file: impl Into<String>,
        mut graph: FileGraph,
        sessions: SessionBook,
    ) {
        let file = file.into();
        if !graph.contains_node(&NodeId::start()) {
            graph.upsert_node(Node::start());
        }
        graph
            .edges
            .retain(|e| !matches!(e.kind, EdgeKind::Execution { .. }));
        for session in sessions.iter() {
            session::rebuild_execution_edges(&mut graph.edges, session);
        }

        info!(
            file = %file,
            nodes = graph.node_count(),
            sessions = sessions.len(),
            "File loaded"
        );
        self.files.insert(file, FileState { graph, sessions });
    }

    pub fn remove_file(&mut self, file: &str) -> Option<FileState> {
        self.files.remove(file)
    }

    pub fn file(&self, file: &str) -> Option<&FileState> {
        self.files.get(file)
    }

    pub fn file_mut(&mut self, file: &str) -> Option<&mut FileState> {
        self.files.get_mut(file)
    }

    /// Keys of every loaded file.
    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn sessions(&self, file: &str) -> Option<&SessionBook> {
        self.file(file).map(|f| &f.sessions)
    }

    pub fn sessions_mut(&mut self, file: &str) -> Option<&mut SessionBook> {
        self.file_mut(file).map(|f| &mut f.sessions)
    }

    pub fn session(&self, file: &str, name: &str) -> Option<&Session> {
        self.file(file)?.session(name)
    }

    /// Create an empty session for `file`.
    pub fn start_session(&mut self, file: &str, name: &str) -> EngineResult<Session> {
        let state = self.file_mut(file).ok_or_else(|| EngineError::FileNotFound {
            file: file.to_string(),
        })?;
        let session = state.sessions.start(file, name)?.clone();
        info!(file, session = name, "Session started");
        Ok(session)
    }

    /// Most recent execution of `node` in a session.
    pub fn last_execution_for(&self, file: &str, session: &str, node: &NodeId) -> Option<&Execution> {
        self.session(file, session)?.last_execution_for(node)
    }

    /// Code the runner executes for `node`, in order.
    ///
    /// A code node yields its own code. A graph node expands to the path of the
    /// session it references, recursively through nested graph nodes, and runs
    /// as one step. `None` when there is nothing to run.
    pub fn execution_steps(&self, file: &str, node: &NodeId) -> Option<Vec<String>> {
        let mut steps = Vec::new();
        let mut visiting = Vec::new();
        self.collect_steps(file, node, &mut visiting, &mut steps);
        (!steps.is_empty()).then_some(steps)
    }

    fn collect_steps(
        &self,
        file: &str,
        node: &NodeId,
        visiting: &mut Vec<GraphRef>,
        steps: &mut Vec<String>,
    ) {
        let Some(node) = self.file(file).and_then(|f| f.graph.node(node)) else {
            return;
        };
        let Some(target) = &node.graph else {
            steps.extend(node.execution_code());
            return;
        };
        if visiting.contains(target) {
            warn!(file, node = %node.id, graph_file = %target.file, session = %target.session, "graph_node_cycle");
            return;
        }
        let Some(session) = self.session(&target.file, &target.session) else {
            debug!(file, node = %node.id, graph_file = %target.file, session = %target.session, "Graph node references no session");
            return;
        };

        visiting.push(target.clone());
        for step in session.path() {
            self.collect_steps(&target.file, &step, visiting, steps);
        }
        visiting.pop();
    }

    // =========================================================================
    // Deletion
    // =========================================================================

    /// Delete a node from a file.
    ///
    /// Every session path running the node is repaired last occurrence first,
    /// then the remaining edges touching the node go, then the node itself.
    /// Derived relationships are recomputed afterwards. Returns the names of
    /// the repaired sessions; unknown files or nodes are a logged no-op.
    pub fn remove_node(&mut self, file: &str, node: &NodeId) -> Vec<String> {
        if node.is_start() {
            warn!(file, "Refusing to remove the start node");
            return Vec::new();
        }
        let Some(state) = self.files.get_mut(file) else {
            warn!(file, node = %node, "remove_node on unknown file");
            return Vec::new();
        };
        if !state.graph.contains_node(node) {
            warn!(file, node = %node, "remove_node on unknown node");
            return Vec::new();
        }

        let FileState { graph, sessions } = state;
        let mut affected = Vec::new();
        for session in sessions.iter_mut().filter(|s| s.contains_node(node)) {
            match session::remove_node_from_session(node, &mut graph.edges, session) {
                Ok(removed) => {
                    debug!(session = %session.id, removed, "Session path repaired");
                    affected.push(session.id.clone());
                }
                Err(e) => warn!(session = %session.id, error = %e, "Session repair failed"),
            }
        }

        graph.edges.retain(|e| !e.touches(node));
        graph.take_node(node);
        sessions.refresh_primary();
        let summary = inference::refresh(graph);

        info!(
            file,
            node = %node,
            sessions = affected.len(),
            derived = summary.total(),
            "Node removed"
        );
        affected
    }

    /// Delete an edge by id.
    ///
    /// Execution edges go through the session repair so the path stays
    /// consistent. `None` means nothing was removed (unknown file or edge, or
    /// an execution edge whose step no longer exists).
    pub fn remove_edge(&mut self, file: &str, edge_id: &EdgeId) -> Option<EdgeRemoval> {
        let Some(state) = self.files.get_mut(file) else {
            warn!(file, edge = %edge_id, "remove_edge on unknown file");
            return None;
        };
        let Some(edge) = state.graph.edge(edge_id).cloned() else {
            let e = EngineError::UnknownEdge {
                edge_id: edge_id.clone(),
            };
            warn!(file, error = %e, "Edge removal skipped");
            return None;
        };

        let owner = match &edge.kind {
            EdgeKind::Execution { session } => Some(session.clone()),
            _ => None,
        };
        let Some(name) = owner else {
            state.graph.edges.retain(|e| &e.id != edge_id);
            debug!(file, edge = %edge_id, kind = %edge.kind, "Edge removed");
            return Some(EdgeRemoval::Plain(edge));
        };

        let FileState { graph, sessions } = state;
        let Some(session) = sessions.get_mut(&name) else {
            // Orphaned execution edge of a session that no longer exists.
            graph.edges.retain(|e| &e.id != edge_id);
            warn!(file, edge = %edge_id, session = %name, "Dropped orphaned execution edge");
            return None;
        };

        match session::remove_execution_edge(edge_id, &mut graph.edges, session) {
            Ok(Some(execution)) => {
                sessions.refresh_primary();
                Some(EdgeRemoval::Execution {
                    session: name,
                    execution,
                })
            }
            Ok(None) => None,
            Err(e) => {
                warn!(file, error = %e, "Edge removal skipped");
                None
            }
        }
    }

    /// Remove a whole session and its execution edges.
    pub fn remove_session(&mut self, file: &str, name: &str) -> Option<Session> {
        let state = self.files.get_mut(file)?;
        let removed = state.sessions.remove(name)?;
        state
            .graph
            .edges
            .retain(|e| !incr_graph_core::is_execution_of(&e.kind, name));
        info!(file, session = name, "Session removed");
        Some(removed)
    }

    // =========================================================================
    // Derived views
    // =========================================================================

    /// Recompute dependency, inheritance and override edges for a file.
    pub fn refresh_relationships(&mut self, file: &str) -> Option<InferenceSummary> {
        let state = self.files.get_mut(file)?;
        let summary = inference::refresh(&mut state.graph);
        info!(
            file,
            dependency = summary.dependency,
            inheritance = summary.inheritance,
            overrides = summary.overrides,
            "Relationships refreshed"
        );
        Some(summary)
    }

    /// Execution tree of every session of a file.
    pub fn execution_tree(&self, file: &str) -> Option<ExecutionTree> {
        let state = self.file(file)?;
        Some(ExecutionTree::from_sessions(&state.graph, &state.sessions))
    }
}
