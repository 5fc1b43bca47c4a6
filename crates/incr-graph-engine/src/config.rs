//! Engine configuration.

use std::path::PathBuf;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Environment override for [`EngineConfig::sessions_dir`].
pub const ENV_SESSIONS_DIR: &str = "INCR_GRAPH_SESSIONS_DIR";
/// Environment override for [`EngineConfig::persist`].
pub const ENV_PERSIST: &str = "INCR_GRAPH_PERSIST";

/// Configuration for the execution engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory, relative to a project root, holding persisted sessions.
    #[serde(default = "default_sessions_dir")]
    pub sessions_dir: PathBuf,

    /// Write each session's state through the state store after every commit.
    #[serde(default = "default_persist")]
    pub persist: bool,

    /// Re-run affected sessions after an execution or node is removed, so the
    /// snapshots after the removed step are recomputed.
    #[serde(default)]
    pub replay_on_removal: bool,
}

fn default_sessions_dir() -> PathBuf {
    PathBuf::from(".sessions")
}

fn default_persist() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sessions_dir: default_sessions_dir(),
            persist: default_persist(),
            replay_on_removal: false,
        }
    }
}

impl EngineConfig {
    /// Load configuration from disk with environment overrides.
    pub fn load() -> EngineResult<Self> {
        let config = match Self::config_file_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        config.with_env_overrides()
    }

    /// Read a configuration file. Missing keys take their defaults.
    pub fn from_file(path: &std::path::Path) -> EngineResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Apply `INCR_GRAPH_*` environment variables on top of `self`.
    pub fn with_env_overrides(mut self) -> EngineResult<Self> {
        if let Ok(dir) = std::env::var(ENV_SESSIONS_DIR) {
            self.set("sessions_dir", &dir)?;
        }
        if let Ok(persist) = std::env::var(ENV_PERSIST) {
            self.set("persist", &persist)?;
        }
        Ok(self)
    }

    /// Save configuration to disk.
    pub fn save(&self) -> EngineResult<()> {
        if let Some(path) = Self::config_file_path() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let contents = serde_json::to_string_pretty(self)?;
            std::fs::write(&path, contents)?;
        }
        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_file_path() -> Option<PathBuf> {
        ProjectDirs::from("dev", "incrgraph", "incr-graph")
            .map(|dirs| dirs.config_dir().join("engine.json"))
    }

    /// Get a configuration value by key.
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "sessions_dir" => Some(self.sessions_dir.display().to_string()),
            "persist" => Some(self.persist.to_string()),
            "replay_on_removal" => Some(self.replay_on_removal.to_string()),
            _ => None,
        }
    }

    /// Set a configuration value by key.
    pub fn set(&mut self, key: &str, value: &str) -> EngineResult<()> {
        match key {
            "sessions_dir" => {
                if value.trim().is_empty() {
                    return Err(EngineError::Config("sessions_dir must not be empty".into()));
                }
                self.sessions_dir = PathBuf::from(value);
            }
            "persist" => self.persist = parse_flag(key, value)?,
            "replay_on_removal" => self.replay_on_removal = parse_flag(key, value)?,
            _ => {
                return Err(EngineError::Config(format!("Unknown config key: {}", key)));
            }
        }
        Ok(())
    }
}

fn parse_flag(key: &str, value: &str) -> EngineResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(EngineError::Config(format!(
            "Invalid boolean for {}: {}",
            key, value
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.sessions_dir, PathBuf::from(".sessions"));
        assert!(config.persist);
        assert!(!config.replay_on_removal);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{ "replay_on_removal": true }"#).unwrap();

        let config = EngineConfig::from_file(&path).unwrap();
        assert!(config.replay_on_removal);
        assert!(config.persist);
        assert_eq!(config.sessions_dir, PathBuf::from(".sessions"));
    }

    #[test]
    fn test_get_set_roundtrip() {
        let mut config = EngineConfig::default();
        config.set("persist", "off").unwrap();
        config.set("sessions_dir", "runs").unwrap();
        assert_eq!(config.get("persist").as_deref(), Some("false"));
        assert_eq!(config.get("sessions_dir").as_deref(), Some("runs"));
        assert!(config.get("nope").is_none());
    }

    #[test]
    fn test_set_rejects_bad_values() {
        let mut config = EngineConfig::default();
        assert!(matches!(
            config.set("persist", "maybe"),
            Err(EngineError::Config(_))
        ));
        assert!(config.set("sessions_dir", " ").is_err());
        assert!(config.set("colour", "red").is_err());
    }
}
