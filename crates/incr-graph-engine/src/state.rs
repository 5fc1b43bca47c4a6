//! Interpreter state snapshots and the stores that persist them.
//!
//! A snapshot is the key/value view of the interpreter globals captured after an
//! execution. Each session keeps the latest one as its overall configuration and
//! feeds it to the runner as the prior state of the next execution.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};

/// Captured interpreter state: variable name to JSON value.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateSnapshot(pub BTreeMap<String, Value>);

impl StateSnapshot {
    /// An empty snapshot (fresh interpreter).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse a persisted snapshot.
    ///
    /// Anything that is not a JSON object is rejected as malformed.
    pub fn parse(session: &str, raw: &str) -> EngineResult<Self> {
        serde_json::from_str(raw).map_err(|e| EngineError::MalformedState {
            session: session.to_string(),
            message: e.to_string(),
        })
    }

    /// Parse a persisted snapshot, falling back to an empty one when it is unreadable.
    pub fn parse_or_empty(session: &str, raw: &str) -> Self {
        match Self::parse(session, raw) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(session, error = %e, "malformed_state_recovered");
                Self::empty()
            }
        }
    }

    /// Insert a value, builder style.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, Value)> for StateSnapshot {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Persistent key/value store of the latest snapshot per session.
pub trait StateStore: Send + Sync {
    /// Load the snapshot of a session, `None` if nothing was stored.
    fn load_state(&self, file: &str, session: &str) -> EngineResult<Option<StateSnapshot>>;

    /// Store the latest snapshot of a session.
    fn save_state(&self, file: &str, session: &str, state: &StateSnapshot) -> EngineResult<()>;

    /// Forget everything stored for a session.
    fn remove_session(&self, file: &str, session: &str) -> EngineResult<()>;
}

/// Load a session's snapshot, treating missing or malformed data as empty.
pub fn load_state_or_empty(store: &dyn StateStore, file: &str, session: &str) -> StateSnapshot {
    match store.load_state(file, session) {
        Ok(Some(state)) => state,
        Ok(None) => StateSnapshot::empty(),
        Err(e @ EngineError::MalformedState { .. }) => {
            warn!(file, session, error = %e, "malformed_state_recovered");
            StateSnapshot::empty()
        }
        Err(e) => {
            warn!(file, session, error = %e, "state_load_failed");
            StateSnapshot::empty()
        }
    }
}

/// In-memory [`StateStore`], storing snapshots in their serialized form.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    entries: Mutex<HashMap<(String, String), String>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store raw serialized state, bypassing validation.
    pub fn put_raw(&self, file: &str, session: &str, raw: impl Into<String>) {
        self.lock()
            .insert((file.to_string(), session.to_string()), raw.into());
    }

    /// Number of sessions with stored state.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(String, String), String>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl StateStore for MemoryStateStore {
    fn load_state(&self, file: &str, session: &str) -> EngineResult<Option<StateSnapshot>> {
        let raw = self
            .lock()
            .get(&(file.to_string(), session.to_string()))
            .cloned();
        raw.map(|raw| StateSnapshot::parse(session, &raw))
            .transpose()
    }

    fn save_state(&self, file: &str, session: &str, state: &StateSnapshot) -> EngineResult<()> {
        let raw = serde_json::to_string(state)?;
        self.put_raw(file, session, raw);
        debug!(file, session, keys = state.len(), "state_saved");
        Ok(())
    }

    fn remove_session(&self, file: &str, session: &str) -> EngineResult<()> {
        self.lock().remove(&(file.to_string(), session.to_string()));
        Ok(())
    }
}
