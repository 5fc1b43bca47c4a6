//! Incremental execution engine for IncrGraph files.
//!
//! A file is a graph of code fragments. This crate records how those fragments
//! are run, explores the different runs, and infers how the code relates.
//!
//! ## Core Concepts
//!
//! - **Session**: a named, ordered history of executions sharing one interpreter state
//! - **Execution**: one run of a node's code with its output and resulting state
//! - **Execution tree**: every session path of a file merged into one prefix tree
//! - **Derived edges**: dependency, inheritance and override relationships,
//!   recomputed from node analysis data
//!
//! ## Execution Paths
//!
//! ```text
//! session s1:  start --1--> load --2--> clean --3--> plot
//! ```
//!
//! Execution edge labels are always `1..=N` in path order. Removing a step or a
//! node splices the path and relabels it.
//!
//! A graph node ([`NodeKind::Graph`]) runs the selected session of another file
//! as a single step of the current one.
//!
//! ## Wiring
//!
//! The engine never runs code itself. Plug in an [`ExecutionRunner`] and a
//! [`StateStore`], load files into a [`GraphContext`], and drive sessions
//! through a [`SessionLedger`].

pub mod config;
mod context;
mod error;
pub mod inference;
mod ledger;
pub mod persistence;
mod runner;
pub mod session;
mod state;
pub mod tree;

#[cfg(test)]
mod test_fixtures;

pub use context::{EdgeRemoval, FileState, GraphContext, SharedContext};
pub use error::{EngineError, EngineResult};
pub use ledger::SessionLedger;
pub use runner::{run_sequence, ExecutionRunner, FnRunner, RunResult, RunnerError};
pub use state::{load_state_or_empty, MemoryStateStore, StateSnapshot, StateStore};

// Sessions and trees
pub use session::{Execution, Session, SessionBook};
pub use tree::{ExecutionTree, Placement, TreeNode};

// Inference
pub use inference::{infer, InferenceSummary};

// Persistence and configuration
pub use config::EngineConfig;
pub use persistence::{SessionStore, StoreStats, SESSIONS_DIR};

// Re-export the data model
pub use incr_graph_core::{
    Analysis, Definitions, Dependencies, Edge, EdgeId, EdgeKind, FileGraph, GraphRef, Node, NodeId,
    NodeKind,
};
