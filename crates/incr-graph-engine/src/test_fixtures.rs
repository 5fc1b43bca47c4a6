//! Builders shared by the unit tests of this crate.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use incr_graph_core::{Analysis, Definitions, Edge, Node, NodeKind};
use tokio::sync::Notify;

use crate::runner::{ExecutionRunner, RunResult, RunnerError};
use crate::session::{Execution, Session};
use crate::state::StateSnapshot;

/// Session that already ran `nodes` in order. Execution `i` prints `"{node}#{i}"`
/// and leaves `step = i` in the state.
pub fn executed_session(name: &str, nodes: &[&str]) -> Session {
    let mut session = Session::new(name);
    for (i, node) in nodes.iter().enumerate() {
        let position = i + 1;
        session.push(Execution {
            node_id: (*node).into(),
            stdout: format!("{node}#{position}"),
            stderr: String::new(),
            state: StateSnapshot::empty().with("step", position),
            execution_time: Duration::from_millis(1),
        });
    }
    session
}

/// Labels of the execution edges of `session`, in edge order.
pub fn labels_of(edges: &[Edge], session: &str) -> Vec<String> {
    edges
        .iter()
        .filter(|e| incr_graph_core::is_execution_of(&e.kind, session))
        .filter_map(|e| e.label.clone())
        .collect()
}

pub fn path_of(session: &Session) -> Vec<String> {
    session.path().into_iter().map(|id| id.0).collect()
}

/// Code fragment using `deps` and defining `defs` (both as variables).
pub fn code_node(id: &str, deps: &[&str], defs: &[&str]) -> Node {
    let mut node = Node::new(id, NodeKind::CodeFragment).with_code(format!("# {id}"));
    node.dependencies.variables = deps.iter().map(|s| s.to_string()).collect();
    node.definitions.variables = defs.iter().map(|s| s.to_string()).collect();
    node
}

/// Class node defining class `name` and referencing `deps`.
pub fn class_node(id: &str, name: &str, deps: &[&str]) -> Node {
    let mut node = Node::new(id, NodeKind::Class)
        .with_label(name)
        .with_code(format!("class {name}: pass"));
    node.definitions.classes.insert(name.to_string());
    node.dependencies.variables = deps.iter().map(|s| s.to_string()).collect();
    node
}

/// Method `method` scoped to `class`.
pub fn method_node(id: &str, class: &str, method: &str) -> Node {
    let mut definitions = Definitions::default();
    definitions.functions.insert(method.to_string());
    Node::new(id, NodeKind::Method)
        .with_label(format!("{class}.{method}"))
        .with_code(format!("def {method}(self):\n\treturn '{class}'"))
        .with_scope(class)
        .with_analysis(Analysis {
            definitions,
            ..Default::default()
        })
}

// =============================================================================
// Runners
// =============================================================================

/// Tiny line-based interpreter used as the execution runner in tests.
///
/// Understands `name = <int>`, `name += <int>`, `print name` and `raise`.
/// Unknown names and `raise` end up in stderr, like a traceback would.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    /// Sleep before evaluating, to widen race windows.
    pub delay: Duration,
    /// When set, every run waits for a permit first.
    pub hold: Option<Arc<Notify>>,
    /// Report the interpreter as missing.
    pub unavailable: bool,
    /// Report the interpreter as missing from this 1-based call on.
    pub fail_from: Option<usize>,
    calls: AtomicUsize,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    /// Works for `n - 1` calls, then goes away.
    pub fn failing_from(n: usize) -> Self {
        Self {
            fail_from: Some(n),
            ..Self::default()
        }
    }

    pub fn held(hold: Arc<Notify>) -> Self {
        Self {
            hold: Some(hold),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ExecutionRunner for ScriptedRunner {
    async fn run(&self, code: &str, prior_state: &StateSnapshot) -> Result<RunResult, RunnerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.unavailable || self.fail_from.is_some_and(|n| call >= n) {
            return Err(RunnerError::Unavailable("interpreter not found".into()));
        }
        if let Some(hold) = &self.hold {
            hold.notified().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(evaluate(code, prior_state))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

fn evaluate(code: &str, prior: &StateSnapshot) -> RunResult {
    let mut state = prior.clone();
    let mut stdout = String::new();
    let mut stderr = String::new();

    for line in code.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if line == "raise" {
            stderr.push_str("RuntimeError\n");
        } else if let Some(name) = line.strip_prefix("print ") {
            match state.get(name.trim()) {
                Some(value) => stdout.push_str(&format!("{value}\n")),
                None => stderr.push_str(&format!("NameError: {name}\n")),
            }
        } else if let Some((name, delta)) = line.split_once("+=") {
            let name = name.trim();
            let current = state.get(name).and_then(|v| v.as_i64());
            match (current, delta.trim().parse::<i64>()) {
                (Some(current), Ok(delta)) => state = state.with(name, current + delta),
                _ => stderr.push_str(&format!("NameError: {name}\n")),
            }
        } else if let Some((name, value)) = line.split_once('=') {
            match value.trim().parse::<i64>() {
                Ok(value) => state = state.with(name.trim(), value),
                Err(_) => state = state.with(name.trim(), value.trim()),
            }
        }
    }

    RunResult {
        stdout,
        stderr,
        new_state: state,
        execution_time: Duration::from_millis(1),
    }
}
