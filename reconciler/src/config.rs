use crate::hashing::AuthMode;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("app_name cannot be empty")]
    EmptyAppName,

    #[error("listen_port cannot be 0")]
    InvalidPort,

    #[error("instances cannot be 0")]
    NoInstances,

    #[error("reload_command has no program")]
    EmptyReloadCommand,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PoolMode {
    #[default]
    Session,
    Transaction,
    Statement,
}

impl PoolMode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            PoolMode::Session => "session",
            PoolMode::Transaction => "transaction",
            PoolMode::Statement => "statement",
        }
    }
}

/// Operator controlled pooler settings. Written last-writer-wins.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct PoolSettings {
    pub listen_port: u16,
    pub pool_mode: PoolMode,
    /// Total for the whole unit; 0 means unlimited.
    pub max_db_connections: u32,
    pub auth_type: AuthMode,
}

impl Default for PoolSettings {
    fn default() -> Self {
        PoolSettings {
            listen_port: 6432,
            pool_mode: PoolMode::Session,
            max_db_connections: 100,
            auth_type: AuthMode::Md5,
        }
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum StoreConfig {
    Filesystem { path: PathBuf },
    Memory,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct EngineConfig {
    /// Used to name the pooler's own auth, stats and admin users.
    pub app_name: String,
    /// Where the rendered config and auth files are written.
    pub config_dir: PathBuf,
    /// Number of local pooler workers. Defaults to the CPU count.
    pub instances: Option<usize>,
    /// Whether this process holds the fleet write lease.
    #[serde(default)]
    pub leader: bool,
    pub store: StoreConfig,
    #[serde(default)]
    pub settings: PoolSettings,
    /// Command run once per worker to reload it. `{instance}` is replaced by
    /// the worker index.
    pub reload_command: Option<Vec<String>>,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.app_name.trim().is_empty() {
            return Err(ValidationError::EmptyAppName);
        }

        if self.settings.listen_port == 0 {
            return Err(ValidationError::InvalidPort);
        }

        if self.instances == Some(0) {
            return Err(ValidationError::NoInstances);
        }

        if let Some(command) = &self.reload_command
            && command.first().is_none_or(|program| program.is_empty())
        {
            return Err(ValidationError::EmptyReloadCommand);
        }

        Ok(())
    }
}
