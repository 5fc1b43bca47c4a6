//! Session ledger: runs node code through the execution runner and records it.
//!
//! Executions of one session are strictly serialized. Each `(file, session)`
//! pair has a FIFO gate; a call takes its turn at the gate before dispatching,
//! so the state read by execution N+1 is always the one written by execution N.
//! Different sessions never wait on each other.
//!
//! Once dispatched, a step runs on its own task. Dropping the caller's future
//! does not cancel it: the result is committed, or discarded with a warning
//! when its session or node disappeared while the runner was busy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use incr_graph_core::{EdgeId, EdgeKind, NodeId};
use tokio::sync::{Mutex as Gate, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::context::{EdgeRemoval, SharedContext};
use crate::error::{EngineError, EngineResult};
use crate::runner::{self, ExecutionRunner};
use crate::session::{self, Execution, Session};
use crate::state::{StateSnapshot, StateStore};
use crate::tree::Placement;

type GateKey = (String, String);

/// Records executions into sessions of a [`SharedContext`].
pub struct SessionLedger {
    runner: Arc<dyn ExecutionRunner>,
    store: Arc<dyn StateStore>,
    config: EngineConfig,
    gates: Mutex<HashMap<GateKey, Arc<Gate<()>>>>,
}

impl SessionLedger {
    pub fn new(runner: Arc<dyn ExecutionRunner>, store: Arc<dyn StateStore>) -> Self {
        Self::with_config(runner, store, EngineConfig::default())
    }

    pub fn with_config(
        runner: Arc<dyn ExecutionRunner>,
        store: Arc<dyn StateStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            runner,
            store,
            config,
            gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Create an empty session.
    pub async fn start_session(
        &self,
        ctx: &SharedContext,
        file: &str,
        name: &str,
    ) -> EngineResult<Session> {
        let session = ctx.write().await.start_session(file, name)?;
        self.persist(file, name, &session.overall_configuration);
        Ok(session)
    }

    /// Run `code` as the next step of a session.
    ///
    /// The runner gets the session's current state. Failing user code is recorded
    /// with its stderr; only an unavailable runner is an error. `Ok(None)` means
    /// the step was skipped or discarded because its session or node is gone.
    pub async fn record_execution(
        &self,
        ctx: &SharedContext,
        file: &str,
        session: &str,
        node_id: &NodeId,
        code: &str,
    ) -> EngineResult<Option<Execution>> {
        let turn = self.take_turn(file, session).await;
        let worker = self.worker(ctx, file, session);
        let node_id = node_id.clone();
        let code = code.to_string();

        let handle = tokio::spawn(async move {
            let _turn = turn;
            worker.execute(node_id, vec![code]).await
        });
        handle.await?
    }

    /// Run a node of the file as the next step of a session.
    ///
    /// The code is taken from the node itself. A graph node runs the whole
    /// path of the session it references and is recorded as a single
    /// execution. `Ok(None)` when the node has nothing to run.
    pub async fn execute_node(
        &self,
        ctx: &SharedContext,
        file: &str,
        session: &str,
        node_id: &NodeId,
    ) -> EngineResult<Option<Execution>> {
        let turn = self.take_turn(file, session).await;
        let worker = self.worker(ctx, file, session);
        let node_id = node_id.clone();

        let handle = tokio::spawn(async move {
            let _turn = turn;
            let Some(steps) = worker.steps_for(&node_id).await else {
                warn!(session = %worker.session, node = %node_id, "step_skipped_without_code");
                return Ok(None);
            };
            worker.execute(node_id, steps).await
        });
        handle.await?
    }

    /// Most recent execution of `node` in a session.
    pub async fn last_execution_for(
        &self,
        ctx: &SharedContext,
        file: &str,
        session: &str,
        node: &NodeId,
    ) -> Option<Execution> {
        ctx.read()
            .await
            .last_execution_for(file, session, node)
            .cloned()
    }

    /// Re-run a session's whole path from an empty state.
    ///
    /// Steps whose node no longer exists or has no code are dropped. The new
    /// executions replace the old ones only once every step ran; a runner
    /// failure leaves the session as it was. Returns the number of executions
    /// recorded.
    pub async fn replay_session(
        &self,
        ctx: &SharedContext,
        file: &str,
        session: &str,
    ) -> EngineResult<usize> {
        let turn = self.take_turn(file, session).await;
        let worker = self.worker(ctx, file, session);

        let handle = tokio::spawn(async move {
            let _turn = turn;
            worker.replay().await
        });
        handle.await?
    }

    /// Create session `name` and execute `path` in it, in order.
    ///
    /// Steps are committed as they run, so a runner failure part way keeps the
    /// steps that already completed and returns the error.
    pub async fn branch_session(
        &self,
        ctx: &SharedContext,
        file: &str,
        name: &str,
        path: Vec<NodeId>,
    ) -> EngineResult<Session> {
        self.start_session(ctx, file, name).await?;
        let turn = self.take_turn(file, name).await;
        let worker = self.worker(ctx, file, name);

        let handle = tokio::spawn(async move {
            let _turn = turn;
            worker.run_path(path).await
        });
        let recorded = handle.await??;
        debug!(file, session = name, recorded, "Branch executed");

        ctx.read()
            .await
            .session(file, name)
            .cloned()
            .ok_or_else(|| EngineError::SessionNotFound {
                file: file.to_string(),
                session: name.to_string(),
            })
    }

    /// Branch a new session off a node of the execution tree, with `new_node`
    /// inserted before or after it. `Ok(None)` if the tree node is unknown.
    pub async fn branch_from_tree(
        &self,
        ctx: &SharedContext,
        file: &str,
        name: &str,
        tree_node_id: &str,
        new_node: &NodeId,
        placement: Placement,
    ) -> EngineResult<Option<Session>> {
        let path = {
            let guard = ctx.read().await;
            guard
                .execution_tree(file)
                .and_then(|tree| tree.branch_path(tree_node_id, new_node, placement))
        };
        let Some(path) = path else {
            warn!(file, tree_node = tree_node_id, "Tree node not found, branch skipped");
            return Ok(None);
        };
        self.branch_session(ctx, file, name, path).await.map(Some)
    }

    /// Remove an execution edge, splicing its step out of the owning session.
    ///
    /// Unknown edges and edges of any other kind are left alone.
    pub async fn remove_execution_edge(
        &self,
        ctx: &SharedContext,
        file: &str,
        edge_id: &EdgeId,
    ) -> EngineResult<Option<EdgeRemoval>> {
        let owner = {
            let guard = ctx.read().await;
            guard
                .file(file)
                .and_then(|f| f.graph.edge(edge_id))
                .and_then(|e| match &e.kind {
                    EdgeKind::Execution { session } => Some(session.clone()),
                    _ => None,
                })
        };
        let Some(owner) = owner else {
            debug!(file, edge = %edge_id, "not_an_execution_edge");
            return Ok(None);
        };

        let turn = self.take_turn(file, &owner).await;
        let removal = ctx.write().await.remove_edge(file, edge_id);
        if removal.is_some() {
            self.after_repair(ctx, file, vec![(owner, turn)]).await?;
        }
        Ok(removal)
    }

    /// Delete a node, repairing every session that ran it.
    ///
    /// Waits for in-flight steps of the affected sessions first. Returns the
    /// names of the repaired sessions.
    pub async fn remove_node(
        &self,
        ctx: &SharedContext,
        file: &str,
        node: &NodeId,
    ) -> EngineResult<Vec<String>> {
        let mut touching = ctx
            .read()
            .await
            .sessions(file)
            .map(|book| book.sessions_touching(node))
            .unwrap_or_default();
        touching.sort();

        let mut turns = Vec::with_capacity(touching.len());
        for name in touching {
            let turn = self.take_turn(file, &name).await;
            turns.push((name, turn));
        }

        let affected = ctx.write().await.remove_node(file, node);
        turns.retain(|(name, _)| affected.contains(name));
        self.after_repair(ctx, file, turns).await?;
        Ok(affected)
    }

    /// Delete a session together with its execution edges and stored state.
    ///
    /// Waits for the session's in-flight step. `Ok(None)` if it did not exist.
    pub async fn remove_session(
        &self,
        ctx: &SharedContext,
        file: &str,
        name: &str,
    ) -> EngineResult<Option<Session>> {
        let turn = self.take_turn(file, name).await;
        let removed = ctx.write().await.remove_session(file, name);
        if removed.is_some() {
            self.store.remove_session(file, name)?;
        }
        drop(turn);
        self.prune_gates();
        Ok(removed)
    }

    /// Persist repaired sessions, replaying them first when configured to.
    async fn after_repair(
        &self,
        ctx: &SharedContext,
        file: &str,
        sessions: Vec<(String, OwnedMutexGuard<()>)>,
    ) -> EngineResult<()> {
        for (name, turn) in sessions {
            if self.config.replay_on_removal {
                let worker = self.worker(ctx, file, &name);
                let handle = tokio::spawn(async move {
                    let _turn = turn;
                    worker.replay().await
                });
                handle.await??;
                continue;
            }

            let state = ctx
                .read()
                .await
                .session(file, &name)
                .map(|s| s.overall_configuration.clone());
            if let Some(state) = state {
                self.persist(file, &name, &state);
            }
        }
        Ok(())
    }

    async fn take_turn(&self, file: &str, session: &str) -> OwnedMutexGuard<()> {
        let gate = {
            let mut gates = self.gates.lock().unwrap_or_else(|e| e.into_inner());
            retain_busy(&mut gates);
            gates
                .entry((file.to_string(), session.to_string()))
                .or_default()
                .clone()
        };
        gate.lock_owned().await
    }

    fn prune_gates(&self) {
        let mut gates = self.gates.lock().unwrap_or_else(|e| e.into_inner());
        retain_busy(&mut gates);
    }

    #[cfg(test)]
    fn gate_count(&self) -> usize {
        self.gates.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn worker(&self, ctx: &SharedContext, file: &str, session: &str) -> Worker {
        Worker {
            ctx: ctx.clone(),
            runner: self.runner.clone(),
            store: self.store.clone(),
            persist: self.config.persist,
            file: file.to_string(),
            session: session.to_string(),
        }
    }

    fn persist(&self, file: &str, session: &str, state: &StateSnapshot) {
        if !self.config.persist {
            return;
        }
        if let Err(e) = self.store.save_state(file, session, state) {
            warn!(file, session, error = %e, "state_persist_failed");
        }
    }
}

/// Drop gates nobody holds or waits on. A held or awaited gate has a clone
/// outside the map.
fn retain_busy(gates: &mut HashMap<GateKey, Arc<Gate<()>>>) {
    gates.retain(|_, gate| Arc::strong_count(gate) > 1);
}

// =============================================================================
// Worker
// =============================================================================

/// Everything a dispatched step needs, owned so it can outlive the caller.
/// Callers must hold the session's turn while a worker runs.
struct Worker {
    ctx: SharedContext,
    runner: Arc<dyn ExecutionRunner>,
    store: Arc<dyn StateStore>,
    persist: bool,
    file: String,
    session: String,
}

impl Worker {
    /// Run `steps` as one execution of `node_id` and commit it.
    async fn execute(&self, node_id: NodeId, steps: Vec<String>) -> EngineResult<Option<Execution>> {
        let prior = {
            let guard = self.ctx.read().await;
            let Some(state) = guard.file(&self.file) else {
                warn!(file = %self.file, "execution_skipped_unknown_file");
                return Ok(None);
            };
            if !state.graph.contains_node(&node_id) {
                warn!(file = %self.file, node = %node_id, "execution_skipped_unknown_node");
                return Ok(None);
            }
            match state.session(&self.session) {
                Some(session) => session.overall_configuration.clone(),
                None => {
                    warn!(file = %self.file, session = %self.session, "execution_skipped_unknown_session");
                    return Ok(None);
                }
            }
        };

        debug!(
            runner = self.runner.name(),
            session = %self.session,
            node = %node_id,
            prior_keys = prior.len(),
            steps = steps.len(),
            "execution_dispatched"
        );
        let result = runner::run_sequence(self.runner.as_ref(), &steps, &prior).await?;

        let (execution, position, state) = {
            let mut guard = self.ctx.write().await;
            let Some(file_state) = guard.file_mut(&self.file) else {
                warn!(file = %self.file, node = %node_id, "execution_discarded");
                return Ok(None);
            };
            if !file_state.graph.contains_node(&node_id) {
                warn!(session = %self.session, node = %node_id, "execution_discarded_node_removed");
                return Ok(None);
            }
            let Some(session) = file_state.sessions.get_mut(&self.session) else {
                warn!(session = %self.session, node = %node_id, "execution_discarded_session_removed");
                return Ok(None);
            };

            let execution = Execution::from_run(node_id, result);
            let position = session.push(execution.clone());
            session::append_execution_edge(&mut file_state.graph.edges, session);
            let state = session.overall_configuration.clone();
            file_state.sessions.set_primary(&self.session);
            (execution, position, state)
        };

        self.save(&state);

        info!(
            session = %self.session,
            node = %execution.node_id,
            position,
            failed = !execution.succeeded(),
            elapsed_ms = execution.execution_time.as_millis() as u64,
            "execution_committed"
        );
        Ok(Some(execution))
    }

    /// Run the session's current path again into a scratch session and swap
    /// it in once every step succeeded.
    async fn replay(&self) -> EngineResult<usize> {
        let path = self
            .ctx
            .read()
            .await
            .session(&self.file, &self.session)
            .map(Session::path);
        let Some(path) = path else {
            warn!(session = %self.session, "replay_skipped_unknown_session");
            return Ok(0);
        };

        info!(session = %self.session, steps = path.len(), "session_replay_started");
        let mut scratch = Session::new(self.session.as_str());
        for node_id in path {
            let Some(steps) = self.steps_for(&node_id).await else {
                warn!(session = %self.session, node = %node_id, "step_skipped_without_code");
                continue;
            };
            let result =
                runner::run_sequence(self.runner.as_ref(), &steps, &scratch.overall_configuration)
                    .await?;
            scratch.push(Execution::from_run(node_id, result));
        }
        let recorded = scratch.len();

        let state = {
            let mut guard = self.ctx.write().await;
            let Some(file_state) = guard.file_mut(&self.file) else {
                warn!(file = %self.file, "replay_discarded");
                return Ok(0);
            };
            if let Some(gone) = scratch
                .executions
                .iter()
                .find(|e| !file_state.graph.contains_node(&e.node_id))
            {
                warn!(session = %self.session, node = %gone.node_id, "replay_discarded_node_removed");
                return Ok(0);
            }
            let Some(session) = file_state.sessions.get_mut(&self.session) else {
                warn!(session = %self.session, "replay_discarded_session_removed");
                return Ok(0);
            };

            *session = scratch;
            session::rebuild_execution_edges(&mut file_state.graph.edges, session);
            let state = session.overall_configuration.clone();
            file_state.sessions.set_primary(&self.session);
            state
        };
        self.save(&state);

        info!(session = %self.session, recorded, "session_replay_committed");
        Ok(recorded)
    }

    /// Execute `path` step by step, committing each one.
    async fn run_path(&self, path: Vec<NodeId>) -> EngineResult<usize> {
        let mut recorded = 0;
        for node_id in path {
            let Some(steps) = self.steps_for(&node_id).await else {
                warn!(session = %self.session, node = %node_id, "step_skipped_without_code");
                continue;
            };
            if self.execute(node_id, steps).await?.is_some() {
                recorded += 1;
            }
        }
        Ok(recorded)
    }

    async fn steps_for(&self, node_id: &NodeId) -> Option<Vec<String>> {
        self.ctx.read().await.execution_steps(&self.file, node_id)
    }

    fn save(&self, state: &StateSnapshot) {
        if !self.persist {
            return;
        }
        if let Err(e) = self.store.save_state(&self.file, &self.session, state) {
            warn!(session = %self.session, error = %e, "state_persist_failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::GraphContext;
    use crate::session::execution_edge_id;
    use crate::state::MemoryStateStore;
    use crate::test_fixtures::{labels_of, path_of, ScriptedRunner};
    use incr_graph_core::{FileGraph, Node, NodeKind};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::Notify;

    const FILE: &str = "f.igc";

    fn shared_context(nodes: &[(&str, &str)]) -> SharedContext {
        let mut graph = FileGraph::empty();
        for (id, code) in nodes {
            graph.upsert_node(Node::new(*id, NodeKind::CodeFragment).with_code(*code));
        }
        let mut ctx = GraphContext::new();
        ctx.insert_file(FILE, graph);
        ctx.into_shared()
    }

    fn ledger(runner: ScriptedRunner) -> (SessionLedger, Arc<MemoryStateStore>) {
        let store = Arc::new(MemoryStateStore::new());
        (SessionLedger::new(Arc::new(runner), store.clone()), store)
    }

    fn n(id: &str) -> NodeId {
        NodeId::new(id)
    }

    async fn session_of(ctx: &SharedContext, name: &str) -> Session {
        ctx.read().await.session(FILE, name).cloned().unwrap()
    }

    #[tokio::test]
    async fn test_record_execution_threads_state() {
        let ctx = shared_context(&[("n1", "x = 1"), ("n2", "x += 2\nprint x")]);
        let (ledger, store) = ledger(ScriptedRunner::new());
        ledger.start_session(&ctx, FILE, "s1").await.unwrap();

        ledger
            .record_execution(&ctx, FILE, "s1", &n("n1"), "x = 1")
            .await
            .unwrap()
            .unwrap();
        let second = ledger
            .record_execution(&ctx, FILE, "s1", &n("n2"), "x += 2\nprint x")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(second.stdout, "3\n");
        let session = session_of(&ctx, "s1").await;
        assert_eq!(session.overall_configuration.get("x"), Some(&json!(3)));
        assert_eq!(path_of(&session), vec!["n1", "n2"]);

        let guard = ctx.read().await;
        let edges = &guard.file(FILE).unwrap().graph.edges;
        assert_eq!(labels_of(edges, "s1"), vec!["1", "2"]);
        assert_eq!(
            store.load_state(FILE, "s1").unwrap().unwrap().get("x"),
            Some(&json!(3))
        );
    }

    #[tokio::test]
    async fn test_user_code_errors_are_data() {
        let ctx = shared_context(&[("n1", "raise")]);
        let (ledger, _) = ledger(ScriptedRunner::new());
        ledger.start_session(&ctx, FILE, "s1").await.unwrap();

        let execution = ledger
            .record_execution(&ctx, FILE, "s1", &n("n1"), "raise")
            .await
            .unwrap()
            .unwrap();
        assert!(!execution.succeeded());
        assert_eq!(session_of(&ctx, "s1").await.len(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_runner_is_fatal_and_records_nothing() {
        let ctx = shared_context(&[("n1", "x = 1")]);
        let (ledger, _) = ledger(ScriptedRunner::unavailable());
        ledger.start_session(&ctx, FILE, "s1").await.unwrap();

        let err = ledger
            .record_execution(&ctx, FILE, "s1", &n("n1"), "x = 1")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::RunnerUnavailable { .. }));
        assert!(session_of(&ctx, "s1").await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_session_is_rejected() {
        let ctx = shared_context(&[]);
        let (ledger, _) = ledger(ScriptedRunner::new());
        ledger.start_session(&ctx, FILE, "s1").await.unwrap();
        let err = ledger.start_session(&ctx, FILE, "s1").await.unwrap_err();
        assert!(matches!(err, EngineError::DuplicateSession { .. }));
    }

    #[tokio::test]
    async fn test_missing_node_or_session_is_noop() {
        let ctx = shared_context(&[("n1", "x = 1")]);
        let (ledger, _) = ledger(ScriptedRunner::new());
        ledger.start_session(&ctx, FILE, "s1").await.unwrap();

        let ghost = ledger
            .record_execution(&ctx, FILE, "s1", &n("ghost"), "x = 1")
            .await
            .unwrap();
        assert!(ghost.is_none());
        let nowhere = ledger
            .record_execution(&ctx, FILE, "s9", &n("n1"), "x = 1")
            .await
            .unwrap();
        assert!(nowhere.is_none());
    }

    #[tokio::test]
    async fn test_same_session_executions_are_serialized() {
        let ctx = shared_context(&[("n1", "c += 1")]);
        let (ledger, _) = ledger(ScriptedRunner::with_delay(Duration::from_millis(20)));
        ledger.start_session(&ctx, FILE, "s1").await.unwrap();
        ledger
            .record_execution(&ctx, FILE, "s1", &n("n1"), "c = 0")
            .await
            .unwrap();

        let node = n("n1");
        let (a, b, c) = tokio::join!(
            ledger.record_execution(&ctx, FILE, "s1", &node, "c += 1"),
            ledger.record_execution(&ctx, FILE, "s1", &node, "c += 1"),
            ledger.record_execution(&ctx, FILE, "s1", &node, "c += 1"),
        );
        assert!(a.unwrap().is_some() && b.unwrap().is_some() && c.unwrap().is_some());

        let session = session_of(&ctx, "s1").await;
        assert_eq!(session.overall_configuration.get("c"), Some(&json!(3)));
        let steps: Vec<i64> = session
            .executions
            .iter()
            .filter_map(|e| e.state.get("c").and_then(|v| v.as_i64()))
            .collect();
        assert_eq!(steps, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_dropped_caller_still_commits() {
        let hold = Arc::new(Notify::new());
        let ctx = shared_context(&[("n1", "x = 1")]);
        let (ledger, _) = ledger(ScriptedRunner::held(hold.clone()));
        ledger.start_session(&ctx, FILE, "s1").await.unwrap();

        let attempt = tokio::time::timeout(
            Duration::from_millis(20),
            ledger.record_execution(&ctx, FILE, "s1", &n("n1"), "x = 1"),
        )
        .await;
        assert!(attempt.is_err());

        hold.notify_one();
        for _ in 0..100 {
            if !session_of(&ctx, "s1").await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(session_of(&ctx, "s1").await.len(), 1);
    }

    #[tokio::test]
    async fn test_result_discarded_when_node_removed_in_flight() {
        let hold = Arc::new(Notify::new());
        let ctx = shared_context(&[("n1", "x = 1")]);
        let (ledger, _) = ledger(ScriptedRunner::held(hold.clone()));
        ledger.start_session(&ctx, FILE, "s1").await.unwrap();

        let n1 = n("n1");
        let pending = ledger.record_execution(&ctx, FILE, "s1", &n1, "x = 1");
        let remover = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            ctx.write().await.remove_node(FILE, &n1);
            hold.notify_one();
        };
        let (outcome, _) = tokio::join!(pending, remover);

        assert!(outcome.unwrap().is_none());
        assert!(session_of(&ctx, "s1").await.is_empty());
    }

    #[tokio::test]
    async fn test_remove_execution_edge_splices_path() {
        let ctx = shared_context(&[("n1", "a = 1"), ("n2", "b = 2"), ("n3", "c = 3")]);
        let (ledger, _) = ledger(ScriptedRunner::new());
        ledger
            .branch_session(&ctx, FILE, "s1", vec![n("n1"), n("n2"), n("n3")])
            .await
            .unwrap();

        let removal = ledger
            .remove_execution_edge(&ctx, FILE, &execution_edge_id("s1", 2))
            .await
            .unwrap();
        assert!(matches!(removal, Some(EdgeRemoval::Execution { .. })));

        let session = session_of(&ctx, "s1").await;
        assert_eq!(path_of(&session), vec!["n1", "n3"]);
        // Without replay the snapshot of the spliced step survives downstream.
        assert_eq!(session.overall_configuration.get("b"), Some(&json!(2)));

        let missing = ledger
            .remove_execution_edge(&ctx, FILE, &EdgeId::new("nope"))
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_replay_on_removal_recomputes_state() {
        let ctx = shared_context(&[("n1", "a = 1"), ("n2", "b = 2"), ("n3", "c = 3")]);
        let config = EngineConfig {
            replay_on_removal: true,
            ..EngineConfig::default()
        };
        let runner = Arc::new(ScriptedRunner::new());
        let ledger = SessionLedger::with_config(
            runner.clone(),
            Arc::new(MemoryStateStore::new()),
            config,
        );
        ledger
            .branch_session(&ctx, FILE, "s1", vec![n("n1"), n("n2"), n("n3")])
            .await
            .unwrap();

        ledger.remove_node(&ctx, FILE, &n("n2")).await.unwrap();

        let session = session_of(&ctx, "s1").await;
        assert_eq!(path_of(&session), vec!["n1", "n3"]);
        assert!(session.overall_configuration.get("b").is_none());
        assert_eq!(runner.calls(), 5);
    }

    #[tokio::test]
    async fn test_branch_from_tree_inserts_before_target() {
        let ctx = shared_context(&[("n1", "a = 1"), ("n2", "b = 2"), ("n9", "z = 9")]);
        let (ledger, _) = ledger(ScriptedRunner::new());
        ledger
            .branch_session(&ctx, FILE, "s1", vec![n("n1"), n("n2")])
            .await
            .unwrap();

        let target = {
            let guard = ctx.read().await;
            let tree = guard.execution_tree(FILE).unwrap();
            // root -> start -> n1 -> n2
            tree.root.children[0].children[0].children[0].id.clone()
        };
        let branched = ledger
            .branch_from_tree(&ctx, FILE, "s2", &target, &n("n9"), Placement::Before)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(path_of(&branched), vec!["n1", "n9", "n2"]);
        assert_eq!(path_of(&session_of(&ctx, "s1").await), vec!["n1", "n2"]);
        assert!(ledger
            .branch_from_tree(&ctx, FILE, "s3", "node404", &n("n9"), Placement::After)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_failed_replay_keeps_spliced_session() {
        let ctx = shared_context(&[("n1", "a = 1"), ("n2", "b = 2"), ("n3", "c = 3")]);
        let config = EngineConfig {
            replay_on_removal: true,
            ..EngineConfig::default()
        };
        // Three branch steps succeed, the replay dies on its second step.
        let ledger = SessionLedger::with_config(
            Arc::new(ScriptedRunner::failing_from(5)),
            Arc::new(MemoryStateStore::new()),
            config,
        );
        ledger
            .branch_session(&ctx, FILE, "s1", vec![n("n1"), n("n2"), n("n3")])
            .await
            .unwrap();

        let err = ledger
            .remove_execution_edge(&ctx, FILE, &execution_edge_id("s1", 2))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::RunnerUnavailable { .. }));

        let session = session_of(&ctx, "s1").await;
        assert_eq!(path_of(&session), vec!["n1", "n3"]);
        assert_eq!(session.overall_configuration.get("b"), Some(&json!(2)));
        let guard = ctx.read().await;
        assert_eq!(labels_of(&guard.file(FILE).unwrap().graph.edges, "s1"), vec!["1", "2"]);
    }

    #[tokio::test]
    async fn test_failed_replay_session_changes_nothing() {
        let ctx = shared_context(&[("n1", "a = 1"), ("n2", "b = 2")]);
        let (ledger, store) = ledger(ScriptedRunner::failing_from(3));
        ledger
            .branch_session(&ctx, FILE, "s1", vec![n("n1"), n("n2")])
            .await
            .unwrap();
        let before = session_of(&ctx, "s1").await;

        let err = ledger.replay_session(&ctx, FILE, "s1").await.unwrap_err();
        assert!(matches!(err, EngineError::RunnerUnavailable { .. }));
        assert_eq!(session_of(&ctx, "s1").await, before);
        assert_eq!(
            store.load_state(FILE, "s1").unwrap().unwrap().get("b"),
            Some(&json!(2))
        );
    }

    #[tokio::test]
    async fn test_replay_session_recomputes_from_empty_state() {
        let ctx = shared_context(&[("n1", "x = 1"), ("n2", "x += 1")]);
        let (ledger, _) = ledger(ScriptedRunner::new());
        ledger
            .branch_session(&ctx, FILE, "s1", vec![n("n1"), n("n2"), n("n2")])
            .await
            .unwrap();
        ctx.write()
            .await
            .file_mut(FILE)
            .unwrap()
            .graph
            .node_mut(&n("n2"))
            .unwrap()
            .code = Some("x += 10".into());

        assert_eq!(ledger.replay_session(&ctx, FILE, "s1").await.unwrap(), 3);
        let session = session_of(&ctx, "s1").await;
        assert_eq!(session.overall_configuration.get("x"), Some(&json!(21)));
        let guard = ctx.read().await;
        assert_eq!(
            labels_of(&guard.file(FILE).unwrap().graph.edges, "s1"),
            vec!["1", "2", "3"]
        );
    }

    #[tokio::test]
    async fn test_graph_node_runs_referenced_path_as_one_step() {
        let ctx = shared_context(&[("n1", "x = 1"), ("n2", "x += 2\nprint x")]);
        ctx.write()
            .await
            .file_mut(FILE)
            .unwrap()
            .graph
            .upsert_node(Node::graph_ref("g", FILE, "lib"));
        let runner = Arc::new(ScriptedRunner::new());
        let ledger = SessionLedger::new(runner.clone(), Arc::new(MemoryStateStore::new()));
        ledger
            .branch_session(&ctx, FILE, "lib", vec![n("n1"), n("n2")])
            .await
            .unwrap();
        ledger.start_session(&ctx, FILE, "s1").await.unwrap();

        let execution = ledger
            .execute_node(&ctx, FILE, "s1", &n("g"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(execution.node_id, n("g"));
        assert_eq!(execution.stdout, "3\n");
        assert_eq!(execution.execution_time, Duration::from_millis(2));
        assert_eq!(runner.calls(), 4);

        let session = session_of(&ctx, "s1").await;
        assert_eq!(path_of(&session), vec!["g"]);
        assert_eq!(session.overall_configuration.get("x"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn test_execute_node_skips_empty_graph_nodes() {
        let ctx = shared_context(&[("n1", "x = 1")]);
        ctx.write()
            .await
            .file_mut(FILE)
            .unwrap()
            .graph
            .upsert_node(Node::graph_ref("g", FILE, "empty"));
        let (ledger, _) = ledger(ScriptedRunner::new());
        ledger.start_session(&ctx, FILE, "empty").await.unwrap();
        ledger.start_session(&ctx, FILE, "s1").await.unwrap();

        assert!(ledger
            .execute_node(&ctx, FILE, "s1", &n("g"))
            .await
            .unwrap()
            .is_none());
        let code = ledger
            .execute_node(&ctx, FILE, "s1", &n("n1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code.state.get("x"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_remove_session_clears_store_and_edges() {
        let ctx = shared_context(&[("n1", "x = 1")]);
        let (ledger, store) = ledger(ScriptedRunner::new());
        ledger
            .branch_session(&ctx, FILE, "s1", vec![n("n1")])
            .await
            .unwrap();
        assert_eq!(store.len(), 1);

        let removed = ledger.remove_session(&ctx, FILE, "s1").await.unwrap();
        assert_eq!(removed.map(|s| s.len()), Some(1));
        assert!(store.is_empty());
        {
            let guard = ctx.read().await;
            assert!(guard.session(FILE, "s1").is_none());
            assert!(labels_of(&guard.file(FILE).unwrap().graph.edges, "s1").is_empty());
        }
        assert!(ledger
            .remove_session(&ctx, FILE, "s1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_idle_gates_are_pruned() {
        let ctx = shared_context(&[("n1", "x = 1")]);
        let (ledger, _) = ledger(ScriptedRunner::new());
        for name in ["s1", "s2"] {
            ledger.start_session(&ctx, FILE, name).await.unwrap();
        }

        for name in ["s1", "s2", "s9"] {
            ledger
                .record_execution(&ctx, FILE, name, &n("n1"), "x = 1")
                .await
                .unwrap();
        }
        assert_eq!(ledger.gate_count(), 1);

        ledger.remove_session(&ctx, FILE, "s1").await.unwrap();
        assert_eq!(ledger.gate_count(), 0);
    }
}
