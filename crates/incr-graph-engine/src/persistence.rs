//! On-disk session store under the `.sessions` folder.
//!
//! ## File Structure
//!
//! ```text
//! .sessions/
//! └── <file>/
//!     ├── session.config.json   # primary session + creation order
//!     ├── <session>/
//!     │   ├── session.json      # executions + last update
//!     │   └── state.json        # latest interpreter snapshot
//!     └── <session>/...
//! ```
//!
//! `state.json` is also what [`StateStore`] reads and writes, so the ledger
//! can persist after every commit without rewriting the whole book.
//!
//! File keys and session names are percent-encoded into directory names
//! (`notebooks/main.igc` becomes `notebooks%2Fmain%2Eigc`), so every name maps
//! to its own directory and can be read back from it.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::session::{Execution, Session, SessionBook};
use crate::state::{StateSnapshot, StateStore};

/// Default name of the persistence folder.
pub const SESSIONS_DIR: &str = ".sessions";

const BOOK_FILE: &str = "session.config.json";
const SESSION_FILE: &str = "session.json";
const STATE_FILE: &str = "state.json";

/// Version of the on-disk format.
const FORMAT_VERSION: u32 = 1;

/// Per-file book metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedBook {
    /// Primary session name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<String>,
    /// Session names in creation order.
    #[serde(default)]
    pub sessions: Vec<String>,
}

/// Persisted execution history of one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedSession {
    pub version: u32,
    pub saved_at: SystemTime,
    pub last_update: SystemTime,
    #[serde(default)]
    pub executions: Vec<Execution>,
}

/// Store manages session persistence within the `.sessions/` folder.
#[derive(Debug, Clone)]
pub struct SessionStore {
    /// Root path of the project.
    root: PathBuf,

    /// Path to the sessions directory.
    sessions_dir: PathBuf,
}

impl SessionStore {
    /// Create a store for the given project root, using `.sessions`.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self::with_dir(root, SESSIONS_DIR)
    }

    /// Create a store using the configured sessions directory.
    pub fn from_config(root: impl AsRef<Path>, config: &EngineConfig) -> Self {
        Self::with_dir(root, &config.sessions_dir)
    }

    fn with_dir(root: impl AsRef<Path>, dir: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        let sessions_dir = root.join(dir);
        Self { root, sessions_dir }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sessions_dir(&self) -> &Path {
        &self.sessions_dir
    }

    /// Check if the sessions directory exists.
    pub fn exists(&self) -> bool {
        self.sessions_dir.exists()
    }

    /// Directory holding every session of `file`.
    pub fn file_dir(&self, file: &str) -> PathBuf {
        self.sessions_dir.join(path_component(file))
    }

    /// Directory of one session.
    pub fn session_dir(&self, file: &str, session: &str) -> PathBuf {
        self.file_dir(file).join(path_component(session))
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Write a session's executions and state.
    pub fn save_session(&self, file: &str, session: &Session) -> EngineResult<PathBuf> {
        let dir = self.session_dir(file, &session.id);
        std::fs::create_dir_all(&dir)?;

        let persisted = PersistedSession {
            version: FORMAT_VERSION,
            saved_at: SystemTime::now(),
            last_update: session.last_update,
            executions: session.executions.clone(),
        };
        let path = dir.join(SESSION_FILE);
        std::fs::write(&path, serde_json::to_string_pretty(&persisted)?)?;
        self.write_state(file, &session.id, &session.overall_configuration)?;

        debug!(
            path = %path.display(),
            executions = session.len(),
            "Saved session"
        );
        Ok(path)
    }

    /// Load one session. A malformed `state.json` is logged and replaced by an
    /// empty snapshot.
    pub fn load_session(&self, file: &str, name: &str) -> EngineResult<Option<Session>> {
        let path = self.session_dir(file, name).join(SESSION_FILE);
        if !path.exists() {
            return Ok(None);
        }

        let json = std::fs::read_to_string(&path)?;
        let persisted: PersistedSession = serde_json::from_str(&json)?;
        if persisted.version != FORMAT_VERSION {
            warn!(path = %path.display(), version = persisted.version, "Unexpected session format version");
        }

        let overall_configuration = crate::state::load_state_or_empty(self, file, name);
        debug!(path = %path.display(), executions = persisted.executions.len(), "Loaded session");

        Ok(Some(Session {
            id: name.to_string(),
            executions: persisted.executions,
            last_update: persisted.last_update,
            overall_configuration,
        }))
    }

    /// Names of sessions stored for `file`, sorted.
    pub fn list_sessions(&self, file: &str) -> EngineResult<Vec<String>> {
        let dir = self.file_dir(file);
        if !dir.exists() {
            return Ok(vec![]);
        }

        let mut names = Vec::new();
        for entry in std::fs::read_dir(&dir)?.filter_map(|e| e.ok()) {
            if !entry.path().join(SESSION_FILE).is_file() {
                continue;
            }
            match entry.file_name().to_str().and_then(name_from_component) {
                Some(name) => names.push(name),
                None => warn!(path = %entry.path().display(), "Skipping session directory with undecodable name"),
            }
        }
        names.sort();
        Ok(names)
    }

    // =========================================================================
    // Books
    // =========================================================================

    /// Write every session of a file plus the book metadata. Sessions on disk
    /// that are no longer in the book are removed.
    pub fn save_book(&self, file: &str, book: &SessionBook) -> EngineResult<()> {
        std::fs::create_dir_all(self.file_dir(file))?;

        for session in book.iter() {
            self.save_session(file, session)?;
        }
        for stale in self.list_sessions(file)? {
            if !book.contains(&stale) {
                self.remove_session(file, &stale)?;
            }
        }

        let meta = PersistedBook {
            current: book.primary().map(str::to_string),
            sessions: book.names(),
        };
        let path = self.file_dir(file).join(BOOK_FILE);
        std::fs::write(&path, serde_json::to_string_pretty(&meta)?)?;

        info!(path = %path.display(), sessions = book.len(), "Saved session book");
        Ok(())
    }

    /// Load every session of a file. Sessions missing from the book metadata
    /// are appended in name order.
    pub fn load_book(&self, file: &str) -> EngineResult<SessionBook> {
        let meta_path = self.file_dir(file).join(BOOK_FILE);
        let meta: PersistedBook = if meta_path.exists() {
            serde_json::from_str(&std::fs::read_to_string(&meta_path)?)?
        } else {
            PersistedBook::default()
        };

        let mut order = meta.sessions.clone();
        for name in self.list_sessions(file)? {
            if !order.contains(&name) {
                order.push(name);
            }
        }

        let mut book = SessionBook::new();
        for name in &order {
            match self.load_session(file, name)? {
                Some(session) => book.insert(session),
                None => warn!(file, session = %name, "Session listed but missing on disk"),
            }
        }
        if let Some(current) = meta.current.as_deref() {
            book.set_primary(current);
        }
        if book.primary().is_none() {
            if let Some(first) = book.names().first() {
                book.set_primary(first);
            }
        }

        info!(file, sessions = book.len(), primary = ?book.primary(), "Loaded session book");
        Ok(book)
    }

    // =========================================================================
    // Cleanup
    // =========================================================================

    /// Remove all persisted sessions.
    pub fn clean(&self) -> EngineResult<()> {
        if self.sessions_dir.exists() {
            std::fs::remove_dir_all(&self.sessions_dir)?;
            info!(path = %self.sessions_dir.display(), "Removed sessions directory");
        }
        Ok(())
    }

    /// Get storage statistics.
    pub fn stats(&self) -> EngineResult<StoreStats> {
        if !self.exists() {
            return Ok(StoreStats::default());
        }

        let mut stats = StoreStats::default();
        for entry in walkdir::WalkDir::new(&self.sessions_dir)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            stats.total_size += entry.metadata().map(|m| m.len()).unwrap_or(0);
            stats.file_count += 1;
            if entry.file_name() == SESSION_FILE {
                stats.session_count += 1;
            }
        }
        Ok(stats)
    }

    fn write_state(&self, file: &str, session: &str, state: &StateSnapshot) -> EngineResult<PathBuf> {
        let dir = self.session_dir(file, session);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(STATE_FILE);
        std::fs::write(&path, serde_json::to_string_pretty(state)?)?;
        Ok(path)
    }
}

impl StateStore for SessionStore {
    fn load_state(&self, file: &str, session: &str) -> EngineResult<Option<StateSnapshot>> {
        let path = self.session_dir(file, session).join(STATE_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)?;
        StateSnapshot::parse(session, &raw).map(Some)
    }

    fn save_state(&self, file: &str, session: &str, state: &StateSnapshot) -> EngineResult<()> {
        let path = self.write_state(file, session, state)?;
        debug!(path = %path.display(), keys = state.len(), "Saved session state");
        Ok(())
    }

    fn remove_session(&self, file: &str, session: &str) -> EngineResult<()> {
        let dir = self.session_dir(file, session);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
            debug!(path = %dir.display(), "Removed session directory");
        }
        Ok(())
    }
}

/// Storage statistics.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    /// Total size of all files in bytes.
    pub total_size: u64,

    /// Number of files.
    pub file_count: usize,

    /// Number of persisted sessions, across files.
    pub session_count: usize,
}

/// Directory name for a file key or session name.
///
/// Bytes outside `[A-Za-z0-9_-]` become `%XX`, so no name resolves to `.`,
/// `..` or the book file. The empty name maps to a lone `%`.
fn path_component(name: &str) -> String {
    if name.is_empty() {
        return "%".to_string();
    }
    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

/// Inverse of [`path_component`]; `None` for anything it does not produce.
fn name_from_component(component: &str) -> Option<String> {
    if component == "%" {
        return Some(String::new());
    }
    let bytes = component.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = component.get(i + 1..i + 3)?;
            decoded.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            decoded.push(bytes[i]);
            i += 1;
        }
    }
    let name = String::from_utf8(decoded).ok()?;
    (path_component(&name) == component).then_some(name)
}
