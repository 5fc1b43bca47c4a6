//! Contract with the external code runner.
//!
//! The engine never spawns interpreters itself. It hands a node's code and the
//! session's prior state to an [`ExecutionRunner`] and records whatever comes back.
//! Errors raised by user code are data (`stderr`), only infrastructure failures
//! are reported through [`RunnerError`].

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::EngineError;
use crate::state::StateSnapshot;

/// Output of one runner invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error, including user-code tracebacks.
    pub stderr: String,
    /// Interpreter state after the code ran.
    pub new_state: StateSnapshot,
    /// Wall-clock duration of the run.
    pub execution_time: Duration,
}

impl RunResult {
    /// Whether the code produced no error output.
    pub fn succeeded(&self) -> bool {
        self.stderr.is_empty()
    }
}

/// Infrastructure failure of a runner.
#[derive(Debug, Clone, Error)]
pub enum RunnerError {
    /// Interpreter missing, process failed to start, runner unreachable.
    #[error("{0}")]
    Unavailable(String),
}

impl From<RunnerError> for EngineError {
    fn from(err: RunnerError) -> Self {
        match err {
            RunnerError::Unavailable(message) => EngineError::RunnerUnavailable { message },
        }
    }
}

/// Executes a code fragment on top of a prior interpreter state.
///
/// Implementations must not fail on user-code errors; those belong in
/// [`RunResult::stderr`]. Every call is independent (one process per call).
#[async_trait::async_trait]
pub trait ExecutionRunner: Send + Sync {
    /// Run `code` starting from `prior_state`.
    async fn run(&self, code: &str, prior_state: &StateSnapshot) -> Result<RunResult, RunnerError>;

    /// Name used in logs.
    fn name(&self) -> &str {
        "runner"
    }
}

/// Run `steps` one after another, each on the state the previous one left.
///
/// The combined result concatenates output, sums execution time and keeps the
/// state of the last step. A single step is passed through unchanged.
pub async fn run_sequence(
    runner: &dyn ExecutionRunner,
    steps: &[String],
    prior_state: &StateSnapshot,
) -> Result<RunResult, RunnerError> {
    let mut combined = RunResult {
        new_state: prior_state.clone(),
        ..Default::default()
    };

    for code in steps {
        let step = runner.run(code, &combined.new_state).await?;
        combined.stdout.push_str(&step.stdout);
        combined.stderr.push_str(&step.stderr);
        combined.execution_time += step.execution_time;
        combined.new_state = step.new_state;
    }

    Ok(combined)
}

/// Runner backed by a synchronous function, timing each call.
///
/// Handy for embedding an in-process evaluator and for tests.
pub struct FnRunner<F> {
    name: String,
    func: F,
}

impl<F> FnRunner<F>
where
    F: Fn(&str, &StateSnapshot) -> Result<RunResult, RunnerError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

#[async_trait::async_trait]
impl<F> ExecutionRunner for FnRunner<F>
where
    F: Fn(&str, &StateSnapshot) -> Result<RunResult, RunnerError> + Send + Sync,
{
    async fn run(&self, code: &str, prior_state: &StateSnapshot) -> Result<RunResult, RunnerError> {
        let started = Instant::now();
        let mut result = (self.func)(code, prior_state)?;
        if result.execution_time.is_zero() {
            result.execution_time = started.elapsed();
        }
        Ok(result)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
