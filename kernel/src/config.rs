// Repository Configuration
//
// Named agent and session settings, loaded from JSON. Repository
// factories resolve the names they are given against this table.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("no agent configuration named `{0}`")]
    UnknownAgent(String),

    #[error("no session configuration named `{0}`")]
    UnknownSession(String),
}

/// Per-session engine settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOptions {
    /// Reject every write made through the session.
    #[serde(default)]
    pub read_only: bool,

    /// Allow reads from replicas where the engine has them.
    #[serde(default)]
    pub secondary_preferred: bool,

    #[serde(default)]
    pub write_timeout_ms: Option<u64>,
}

impl SessionOptions {
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Self::default()
        }
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout_ms.map(Duration::from_millis)
    }
}

/// Identity stamped on every source committed through a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub system: String,

    #[serde(default)]
    pub instance: Option<String>,

    #[serde(default)]
    pub user: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    #[serde(default)]
    pub agents: BTreeMap<String, AgentConfig>,

    #[serde(default)]
    pub sessions: BTreeMap<String, SessionOptions>,
}

pub const DEFAULT_NAME: &str = "default";
pub const READ_ONLY_SESSION: &str = "read-only";

impl RepositoryConfig {
    /// Built-in configuration (used if no config file is provided).
    pub fn default_config() -> Self {
        let mut agents = BTreeMap::new();
        agents.insert(
            DEFAULT_NAME.to_owned(),
            AgentConfig {
                system: env!("CARGO_PKG_NAME").to_owned(),
                instance: None,
                user: None,
            },
        );

        let mut sessions = BTreeMap::new();
        sessions.insert(DEFAULT_NAME.to_owned(), SessionOptions::default());
        sessions.insert(READ_ONLY_SESSION.to_owned(), SessionOptions::read_only());

        Self { agents, sessions }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn agent(&self, name: &str) -> Result<&AgentConfig, ConfigError> {
        self.agents
            .get(name)
            .ok_or_else(|| ConfigError::UnknownAgent(name.to_owned()))
    }

    pub fn session(&self, name: &str) -> Result<&SessionOptions, ConfigError> {
        self.sessions
            .get(name)
            .ok_or_else(|| ConfigError::UnknownSession(name.to_owned()))
    }
}
