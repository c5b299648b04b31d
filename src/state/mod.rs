//! State Management Module
//!
//! Durable record of which cluster members are active and when each was last
//! synchronized. Persisted state is the source of truth at startup: members
//! not recorded as active stay out of the balancer until synchronized.

mod file;
mod memory;
mod sql;
mod sqlite;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::StateConfig;
use crate::error::{ConfigError, Result};

pub use file::FileStateManager;
pub use memory::MemoryStateManager;
pub use sql::SqlStateManager;
pub use sqlite::SqliteStateManager;

/// Persisted state of one member
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseState {
    pub active: bool,
    pub last_synchronized: Option<DateTime<Utc>>,
}

/// Persisted state of a cluster, keyed by member id
pub type ClusterState = BTreeMap<String, DatabaseState>;

/// Durable store of member activity
#[async_trait]
pub trait StateManager: Send + Sync {
    /// Open the backing store. Nothing is read or written before this.
    async fn start(&self) -> Result<()>;

    /// Every recorded member
    async fn cluster_state(&self) -> Result<ClusterState>;

    /// Ids of members recorded as active
    async fn list_active(&self) -> Result<BTreeSet<String>> {
        Ok(self
            .cluster_state()
            .await?
            .into_iter()
            .filter(|(_, state)| state.active)
            .map(|(id, _)| id)
            .collect())
    }

    async fn record_active(&self, id: &str) -> Result<()>;

    async fn record_inactive(&self, id: &str) -> Result<()>;

    async fn record_synchronized(&self, id: &str, at: DateTime<Utc>) -> Result<()>;

    /// Flush and close the backing store
    async fn stop(&self) -> Result<()>;

    fn kind(&self) -> StateManagerKind;
}

/// State manager implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateManagerKind {
    /// In memory, lost on restart
    Simple,
    /// Table on a MariaDB/MySQL server
    Sql,
    /// Embedded SQLite file
    Sqlite,
    /// Embedded append-only record log
    File,
}

impl StateManagerKind {
    pub fn from_id(id: &str) -> std::result::Result<Self, ConfigError> {
        match id {
            "simple" => Ok(StateManagerKind::Simple),
            "sql" => Ok(StateManagerKind::Sql),
            "sqlite" => Ok(StateManagerKind::Sqlite),
            "file" => Ok(StateManagerKind::File),
            other => Err(ConfigError::UnknownStateManager(other.to_string())),
        }
    }

    pub fn id(&self) -> &'static str {
        match self {
            StateManagerKind::Simple => "simple",
            StateManagerKind::Sql => "sql",
            StateManagerKind::Sqlite => "sqlite",
            StateManagerKind::File => "file",
        }
    }

    /// Check the settings this kind needs are present
    pub fn validate(&self, config: &StateConfig) -> std::result::Result<(), ConfigError> {
        if *self == StateManagerKind::Sql && config.url.is_none() {
            return Err(ConfigError::MissingStateUrl(self.id().to_string()));
        }
        Ok(())
    }

    /// Build the state manager for a cluster. Performs no I/O.
    pub fn build(&self, cluster: &str, config: &StateConfig) -> std::result::Result<Arc<dyn StateManager>, ConfigError> {
        self.validate(config)?;
        let manager: Arc<dyn StateManager> = match self {
            StateManagerKind::Simple => Arc::new(MemoryStateManager::new()),
            StateManagerKind::Sql => {
                let url = config.url.clone().unwrap_or_default();
                Arc::new(SqlStateManager::new(url, cluster))
            }
            StateManagerKind::Sqlite => Arc::new(SqliteStateManager::new(config.dir.join(format!("{}.db", cluster)))),
            StateManagerKind::File => Arc::new(FileStateManager::new(config.dir.join(format!("{}.state", cluster)))),
        };
        Ok(manager)
    }
}

impl fmt::Display for StateManagerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}
