//! Sessions, executions and the execution-path edge invariant.
//!
//! A session is an ordered list of executions. Its path is drawn in the file
//! graph as a chain of `execution` edges:
//!
//! ```text
//! start --1--> n1 --2--> n2 --3--> n3
//! ```
//!
//! Labels are always exactly `1..=N` in path order. Every mutation of a path goes
//! through [`remove_execution_edge`] or [`append_execution_edge`], which restore
//! that invariant.

use std::time::{Duration, SystemTime};

use incr_graph_core::{is_execution_of, Edge, EdgeId, EdgeKind, NodeId};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::runner::RunResult;
use crate::state::StateSnapshot;

/// One recorded run of a node within a session.
///
/// Its position in the path is the index in [`Session::executions`], not a
/// stored field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    /// Node that ran.
    pub node_id: NodeId,
    /// Captured standard output.
    #[serde(default)]
    pub stdout: String,
    /// Captured standard error.
    #[serde(default)]
    pub stderr: String,
    /// Interpreter state after the run.
    #[serde(default)]
    pub state: StateSnapshot,
    /// Duration of the run.
    #[serde(default)]
    pub execution_time: Duration,
}

impl Execution {
    /// Build an execution record from runner output.
    pub fn from_run(node_id: NodeId, result: RunResult) -> Self {
        Self {
            node_id,
            stdout: result.stdout,
            stderr: result.stderr,
            state: result.new_state,
            execution_time: result.execution_time,
        }
    }

    /// Whether the run produced no error output.
    pub fn succeeded(&self) -> bool {
        self.stderr.is_empty()
    }
}

/// A named, ordered history of executions sharing one interpreter state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Session name, unique per file.
    pub id: String,
    /// Executions in the order they ran.
    #[serde(default)]
    pub executions: Vec<Execution>,
    /// Time of the last mutation.
    pub last_update: SystemTime,
    /// Latest captured state snapshot.
    #[serde(default)]
    pub overall_configuration: StateSnapshot,
}

impl Session {
    /// Create an empty session.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            executions: Vec::new(),
            last_update: SystemTime::now(),
            overall_configuration: StateSnapshot::empty(),
        }
    }

    /// Number of executions in the path.
    pub fn len(&self) -> usize {
        self.executions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }

    /// Node ids in execution order.
    pub fn path(&self) -> Vec<NodeId> {
        self.executions.iter().map(|e| e.node_id.clone()).collect()
    }

    /// Whether `node` appears anywhere in the path.
    pub fn contains_node(&self, node: &NodeId) -> bool {
        self.executions.iter().any(|e| &e.node_id == node)
    }

    /// Append an execution and adopt its state. Returns the 1-based position.
    pub fn push(&mut self, execution: Execution) -> usize {
        self.overall_configuration = execution.state.clone();
        self.executions.push(execution);
        self.last_update = SystemTime::now();
        self.executions.len()
    }

    /// Splice out the execution at a 1-based position.
    ///
    /// The overall configuration falls back to the state of the new last
    /// execution. Later snapshots are not recomputed; replay the session for that.
    pub fn remove_at(&mut self, position: usize) -> Option<Execution> {
        if position == 0 || position > self.executions.len() {
            return None;
        }
        let removed = self.executions.remove(position - 1);
        self.overall_configuration = self
            .executions
            .last()
            .map(|e| e.state.clone())
            .unwrap_or_default();
        self.last_update = SystemTime::now();
        Some(removed)
    }

    /// Drop every execution and start again from an empty state.
    pub fn reset(&mut self) {
        self.executions.clear();
        self.overall_configuration = StateSnapshot::empty();
        self.last_update = SystemTime::now();
    }

    /// Most recent execution of `node`, if it ran in this session.
    pub fn last_execution_for(&self, node: &NodeId) -> Option<&Execution> {
        self.executions.iter().rev().find(|e| &e.node_id == node)
    }

    /// 1-based positions at which `node` ran, in path order.
    pub fn positions_of(&self, node: &NodeId) -> Vec<usize> {
        self.executions
            .iter()
            .enumerate()
            .filter(|(_, e)| &e.node_id == node)
            .map(|(i, _)| i + 1)
            .collect()
    }
}

// =============================================================================
// Execution edges
// =============================================================================

/// Stable id of the execution edge at `position` in `session`.
pub fn execution_edge_id(session: &str, position: usize) -> EdgeId {
    EdgeId(format!("exec:{session}:{position}"))
}

/// Canonical execution edges for a session path.
pub fn execution_edges(session: &Session) -> Vec<Edge> {
    let mut previous = NodeId::start();
    session
        .executions
        .iter()
        .enumerate()
        .map(|(i, execution)| {
            let position = i + 1;
            let source = std::mem::replace(&mut previous, execution.node_id.clone());
            execution_edge(&session.id, position, source, execution.node_id.clone())
        })
        .collect()
}

fn execution_edge(session: &str, position: usize, source: NodeId, target: NodeId) -> Edge {
    Edge::new(
        execution_edge_id(session, position),
        source,
        target,
        EdgeKind::Execution {
            session: session.to_string(),
        },
    )
    .with_label(position.to_string())
}

/// Replace a session's execution edges with the canonical set.
pub fn rebuild_execution_edges(edges: &mut Vec<Edge>, session: &Session) {
    edges.retain(|e| !is_execution_of(&e.kind, &session.id));
    edges.extend(execution_edges(session));
}

/// Add the edge for the last execution of `session`.
pub fn append_execution_edge(edges: &mut Vec<Edge>, session: &Session) {
    let position = session.len();
    let Some(last) = session.executions.last() else {
        return;
    };
    let source = match position {
        1 => NodeId::start(),
        _ => session.executions[position - 2].node_id.clone(),
    };
    edges.push(execution_edge(&session.id, position, source, last.node_id.clone()));
}

/// Remove the execution step an edge stands for and relabel the path.
///
/// Label `L` of an execution edge names the `L`-th execution; that execution is
/// spliced out and the session's execution edges are rebuilt so labels are
/// `1..=N-1` again. Edges of another kind or another session leave both
/// inputs untouched and yield `Ok(None)`.
///
/// This is the only way a path shrinks; node deletion funnels through it too.
pub fn remove_execution_edge(
    edge_id: &EdgeId,
    edges: &mut Vec<Edge>,
    session: &mut Session,
) -> EngineResult<Option<Execution>> {
    let edge = edges
        .iter()
        .find(|e| &e.id == edge_id)
        .ok_or_else(|| EngineError::UnknownEdge {
            edge_id: edge_id.clone(),
        })?;

    if !is_execution_of(&edge.kind, &session.id) {
        debug!(edge = %edge_id, session = %session.id, "not_an_execution_edge_of_session");
        return Ok(None);
    }

    let Some(position) = edge.execution_position() else {
        warn!(edge = %edge_id, label = ?edge.label, "execution_edge_without_position");
        return Ok(None);
    };

    let Some(removed) = session.remove_at(position) else {
        warn!(
            edge = %edge_id,
            position,
            path_len = session.len(),
            "execution_edge_out_of_range"
        );
        return Ok(None);
    };

    rebuild_execution_edges(edges, session);
    debug!(
        session = %session.id,
        position,
        node = %removed.node_id,
        path_len = session.len(),
        "execution_removed"
    );
    Ok(Some(removed))
}

/// Remove every occurrence of `node` from a session's path.
///
/// Occurrences are removed last-first through [`remove_execution_edge`], so the
/// positions still to be removed never shift. Returns how many were removed.
pub fn remove_node_from_session(
    node: &NodeId,
    edges: &mut Vec<Edge>,
    session: &mut Session,
) -> EngineResult<usize> {
    let mut removed = 0;
    for position in session.positions_of(node).into_iter().rev() {
        let edge_id = execution_edge_id(&session.id, position);
        if !edges.iter().any(|e| e.id == edge_id) {
            // Edge set out of sync with the path: restore it before repairing.
            rebuild_execution_edges(edges, session);
        }
        if remove_execution_edge(&edge_id, edges, session)?.is_some() {
            removed += 1;
        }
    }
    Ok(removed)
}

// =============================================================================
// Session book
// =============================================================================

/// All sessions of one file, in creation order, plus the primary one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionBook {
    sessions: Vec<Session>,
    #[serde(default)]
    primary: Option<String>,
}

impl SessionBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new, empty session. The first session becomes primary.
    pub fn start(&mut self, file: &str, name: &str) -> EngineResult<&mut Session> {
        if self.contains(name) {
            return Err(EngineError::DuplicateSession {
                file: file.to_string(),
                session: name.to_string(),
            });
        }
        if self.primary.is_none() {
            self.primary = Some(name.to_string());
        }
        self.sessions.push(Session::new(name));
        let last = self.sessions.len() - 1;
        Ok(&mut self.sessions[last])
    }

    /// Insert an already built session (used when loading from disk).
    pub fn insert(&mut self, session: Session) {
        match self.get_mut(&session.id) {
            Some(existing) => *existing = session,
            None => self.sessions.push(session),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| s.id == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Session names in creation order.
    pub fn names(&self) -> Vec<String> {
        self.sessions.iter().map(|s| s.id.clone()).collect()
    }

    /// Name of the primary session.
    pub fn primary(&self) -> Option<&str> {
        self.primary.as_deref()
    }

    /// Make `name` the primary session. Returns false if it does not exist.
    pub fn set_primary(&mut self, name: &str) -> bool {
        if !self.contains(name) {
            return false;
        }
        self.primary = Some(name.to_string());
        true
    }

    /// Names of sessions whose path contains `node`.
    pub fn sessions_touching(&self, node: &NodeId) -> Vec<String> {
        self.sessions
            .iter()
            .filter(|s| s.contains_node(node))
            .map(|s| s.id.clone())
            .collect()
    }

    /// Remove a session. If it was primary, the most recently updated
    /// remaining session takes over.
    pub fn remove(&mut self, name: &str) -> Option<Session> {
        let pos = self.sessions.iter().position(|s| s.id == name)?;
        let removed = self.sessions.remove(pos);
        if self.primary.as_deref() == Some(name) {
            self.primary = self
                .sessions
                .iter()
                .max_by_key(|s| s.last_update)
                .map(|s| s.id.clone());
        }
        Some(removed)
    }

    /// Move primary off an emptied session onto the most recently updated
    /// non-empty one. Keeps the current primary when nothing better exists.
    pub fn refresh_primary(&mut self) {
        let primary_is_live = self
            .primary
            .as_deref()
            .and_then(|name| self.get(name))
            .is_some_and(|s| !s.is_empty());
        if primary_is_live {
            return;
        }
        if let Some(next) = self
            .sessions
            .iter()
            .filter(|s| !s.is_empty())
            .max_by_key(|s| s.last_update)
        {
            debug!(from = ?self.primary, to = %next.id, "primary_session_moved");
            self.primary = Some(next.id.clone());
        }
    }
}
