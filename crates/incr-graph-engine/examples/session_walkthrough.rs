//! Walkthrough of sessions, execution trees and relationship inference.
//!
//! Run with: cargo run --example session_walkthrough
//! More detail: RUST_LOG=incr_graph_engine=debug cargo run --example session_walkthrough

use std::sync::Arc;

use incr_graph_engine::{
    EdgeKind, FileGraph, FnRunner, GraphContext, Node, NodeId, NodeKind, Placement, RunResult,
    RunnerError, SessionLedger, SessionStore, StateSnapshot, TreeNode,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const FILE: &str = "walkthrough.igc";

/// Toy interpreter: `name = value` assignments, `print name` lookups.
fn toy_interpreter(code: &str, prior: &StateSnapshot) -> Result<RunResult, RunnerError> {
    let mut state = prior.clone();
    let mut result = RunResult::default();

    for line in code.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(name) = line.strip_prefix("print ") {
            match state.get(name) {
                Some(value) => result.stdout.push_str(&format!("{value}\n")),
                None => result.stderr.push_str(&format!("NameError: name '{name}' is not defined\n")),
            }
        } else if let Some((name, value)) = line.split_once('=') {
            state = state.with(name.trim(), value.trim());
        }
    }

    result.new_state = state;
    Ok(result)
}

fn code_node(id: &str, code: &str, uses: &[&str], defines: &[&str]) -> Node {
    let mut node = Node::new(id, NodeKind::CodeFragment).with_code(code);
    node.dependencies.variables = uses.iter().map(|s| s.to_string()).collect();
    node.definitions.variables = defines.iter().map(|s| s.to_string()).collect();
    node
}

fn print_tree(node: &TreeNode, depth: usize) {
    for child in &node.children {
        println!("{}{} [{}]", "  ".repeat(depth), child.label, child.id);
        print_tree(child, depth + 1);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut graph = FileGraph::empty();
    graph.upsert_node(code_node("load", "data = rows", &[], &["data"]));
    graph.upsert_node(code_node("clean", "data = clean_rows", &["data"], &["data"]));
    graph.upsert_node(code_node("report", "print data", &["data"], &[]));
    graph.upsert_node(code_node("debug", "print missing", &["missing"], &[]));

    let mut ctx = GraphContext::new();
    ctx.insert_file(FILE, graph);
    let summary = ctx.refresh_relationships(FILE).unwrap_or_default();
    println!("Inferred {} dependency edges", summary.dependency);
    let ctx = ctx.into_shared();

    let workdir = std::env::temp_dir().join("incr-graph-walkthrough");
    let store = Arc::new(SessionStore::new(&workdir));
    let runner = Arc::new(FnRunner::new("toy", toy_interpreter));
    let ledger = SessionLedger::new(runner, store.clone());

    // Two sessions sharing the `load` prefix.
    let s1 = ledger
        .branch_session(&ctx, FILE, "raw", vec!["load".into(), "report".into()])
        .await?;
    let s2 = ledger
        .branch_session(&ctx, FILE, "cleaned", vec!["load".into(), "clean".into(), "report".into()])
        .await?;
    for session in [&s1, &s2] {
        let output = session.executions.last().map(|e| e.stdout.trim()).unwrap_or("");
        println!("Session {:>8}: {} steps, last output {:?}", session.id, session.len(), output);
    }

    // Failing user code is recorded, not raised.
    let failed = ledger
        .record_execution(&ctx, FILE, "raw", &NodeId::new("debug"), "print missing")
        .await?;
    if let Some(execution) = failed {
        println!("debug step stderr: {}", execution.stderr.trim());
    }

    // Branch a third session off the tree: insert `clean` after `load` of "raw".
    let load_in_tree = {
        let guard = ctx.read().await;
        let tree = guard
            .execution_tree(FILE)
            .ok_or_else(|| anyhow::anyhow!("{FILE} is not loaded"))?;
        println!("\nExecution tree:");
        print_tree(&tree.root, 1);
        tree.root.children.first().and_then(|start| start.children.first()).map(|n| n.id.clone())
    };
    if let Some(target) = load_in_tree {
        let branched = ledger
            .branch_from_tree(&ctx, FILE, "branched", &target, &NodeId::new("clean"), Placement::After)
            .await?;
        if let Some(session) = branched {
            println!("\nBranched session path: {:?}", session.path());
        }
    }

    // Deleting a node repairs every session that ran it.
    let affected = ledger.remove_node(&ctx, FILE, &NodeId::new("clean")).await?;
    println!("Removed `clean`, repaired sessions: {affected:?}");

    let guard = ctx.read().await;
    if let Some(state) = guard.file(FILE) {
        for session in state.sessions.iter() {
            let labels: Vec<String> = state
                .graph
                .edges
                .iter()
                .filter(|e| matches!(&e.kind, EdgeKind::Execution { session: s } if *s == session.id))
                .map(|e| format!("{}->{}#{}", e.source, e.target, e.label.as_deref().unwrap_or("?")))
                .collect();
            println!("  {:>8}: {}", session.id, labels.join("  "));
        }
        store.save_book(FILE, &state.sessions)?;
    }

    let stats = store.stats()?;
    println!(
        "\nPersisted {} sessions ({} files, {} bytes) under {}",
        stats.session_count,
        stats.file_count,
        stats.total_size,
        store.sessions_dir().display()
    );
    store.clean()?;
    Ok(())
}
