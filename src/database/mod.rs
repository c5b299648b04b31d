//! Database Abstraction Module
//!
//! Member databases are reached through the [`Database`] trait. Each backend
//! knows how to introspect its schema, scan and modify table contents, and
//! export/import a full snapshot for dump/restore synchronization.

mod connector;
mod memory;
mod mysql;
mod snapshot;
mod value;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Error, Result};

pub use connector::{Connector, DefaultConnector};
pub use memory::MemoryDatabase;
pub use mysql::MySqlDatabase;
pub use snapshot::{Snapshot, TableSnapshot};
pub use value::{fingerprint, Row, RowKey, Value};

/// A member database of a cluster, as configured
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseDescriptor {
    /// Unique identifier within the cluster
    pub id: String,
    /// Connection URL (`mysql://host:3306/app`, `mem:orders`)
    pub location: String,
    /// Driver identifier (inferred from the location scheme when absent)
    #[serde(default)]
    pub driver: Option<String>,
    /// User name (overrides credentials in the location)
    #[serde(default)]
    pub user: Option<String>,
    /// Password (overrides credentials in the location)
    #[serde(default)]
    pub password: Option<String>,
    /// Relative weight used by the simple and load balancers
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

impl DatabaseDescriptor {
    /// Create a descriptor with default weight and no credentials
    pub fn new(id: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            location: location.into(),
            driver: None,
            user: None,
            password: None,
            weight: default_weight(),
        }
    }

    /// Set the weight
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Resolve which backend serves this descriptor
    pub fn driver_kind(&self) -> std::result::Result<DriverKind, ConfigError> {
        let unknown = |driver: &str| ConfigError::UnknownDriver {
            database: self.id.clone(),
            driver: driver.to_string(),
        };

        match self.driver.as_deref() {
            Some(driver) => DriverKind::from_id(driver).ok_or_else(|| unknown(driver)),
            None => {
                let scheme = self
                    .location
                    .split_once(':')
                    .map(|(scheme, _)| scheme)
                    .unwrap_or(self.location.as_str());
                DriverKind::from_id(scheme).ok_or_else(|| unknown(scheme))
            }
        }
    }
}

impl fmt::Debug for DatabaseDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseDescriptor")
            .field("id", &self.id)
            .field("location", &self.location)
            .field("driver", &self.driver)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("weight", &self.weight)
            .finish()
    }
}

/// Backend implementation serving a member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriverKind {
    /// In-process database
    Memory,
    /// MariaDB / MySQL over sqlx
    MySql,
}

impl DriverKind {
    pub fn from_id(id: &str) -> Option<Self> {
        match id.to_ascii_lowercase().as_str() {
            "mem" | "memory" => Some(DriverKind::Memory),
            "mysql" | "mariadb" => Some(DriverKind::MySql),
            _ => None,
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverKind::Memory => write!(f, "memory"),
            DriverKind::MySql => write!(f, "mysql"),
        }
    }
}

/// Column schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
        }
    }
}

/// Table schema information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Table name
    pub name: String,
    /// Columns, in storage order
    pub columns: Vec<ColumnSchema>,
    /// Primary key columns
    pub primary_key: Vec<String>,
    /// Auto-increment / identity columns
    pub identity_columns: Vec<String>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnSchema>, primary_key: &[&str]) -> Self {
        Self {
            name: name.into(),
            columns,
            primary_key: primary_key.iter().map(|c| c.to_string()).collect(),
            identity_columns: Vec::new(),
        }
    }

    /// Mark a column as an identity column
    pub fn with_identity(mut self, column: &str) -> Self {
        self.identity_columns.push(column.to_string());
        self
    }

    /// Position of a column
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Check if the table declares a primary key
    pub fn has_primary_key(&self) -> bool {
        !self.primary_key.is_empty()
    }

    /// Positions of the primary key columns. Tables without a primary key
    /// are keyed by the whole row.
    pub fn key_indexes(&self) -> Vec<usize> {
        if self.primary_key.is_empty() {
            return (0..self.columns.len()).collect();
        }
        self.primary_key
            .iter()
            .filter_map(|name| self.column_index(name))
            .collect()
    }

    /// Extract the key of a row
    pub fn key_of(&self, row: &Row) -> RowKey {
        self.key_indexes()
            .into_iter()
            .map(|i| row.get(i).cloned().unwrap_or(Value::Null))
            .collect()
    }

    /// Names of the key columns (see [`TableSchema::key_indexes`])
    pub fn key_columns(&self) -> Vec<String> {
        self.key_indexes()
            .into_iter()
            .map(|i| self.columns[i].name.clone())
            .collect()
    }
}

/// A change to apply to one table row
#[derive(Debug, Clone, PartialEq)]
pub enum RowChange {
    Insert(Row),
    Update(Row),
    Delete(RowKey),
}

/// Database backend operations used by the cluster driver and the
/// synchronization strategies.
#[async_trait]
pub trait Database: Send + Sync {
    /// Check the database is reachable
    async fn ping(&self) -> Result<()>;

    /// Introspect all tables
    async fn tables(&self) -> Result<Vec<TableSchema>>;

    /// Names of all sequences
    async fn sequences(&self) -> Result<Vec<String>>;

    /// Current value of a sequence
    async fn sequence_value(&self, name: &str) -> Result<i64>;

    /// Set the current value of a sequence
    async fn set_sequence_value(&self, name: &str, value: i64) -> Result<()>;

    /// Set the next value an identity column hands out
    async fn set_identity(&self, table: &TableSchema, column: &str, next: i64) -> Result<()>;

    /// Read every row of a table
    async fn scan(&self, table: &TableSchema) -> Result<Vec<Row>>;

    /// Apply a batch of changes atomically, returning affected rows
    async fn apply(&self, table: &TableSchema, changes: &[RowChange]) -> Result<u64>;

    /// Delete every row of a table
    async fn truncate(&self, table: &TableSchema) -> Result<u64>;

    /// Export the whole database as a snapshot
    async fn export(&self) -> Result<Snapshot> {
        let mut snapshot = Snapshot::default();
        for table in self.tables().await? {
            let rows = self.scan(&table).await?;
            snapshot.tables.push(TableSnapshot { schema: table, rows });
        }
        for name in self.sequences().await? {
            let value = self.sequence_value(&name).await?;
            snapshot.sequences.push((name, value));
        }
        Ok(snapshot)
    }

    /// Replace the database contents with a snapshot
    async fn import(&self, snapshot: &Snapshot) -> Result<()> {
        for table in &snapshot.tables {
            self.truncate(&table.schema).await?;
            let inserts: Vec<RowChange> = table.rows.iter().cloned().map(RowChange::Insert).collect();
            for batch in inserts.chunks(IMPORT_BATCH_SIZE) {
                self.apply(&table.schema, batch).await?;
            }
        }
        for (name, value) in &snapshot.sequences {
            self.set_sequence_value(name, *value).await?;
        }
        Ok(())
    }
}

/// Rows per `apply` call during import and full copy
pub const IMPORT_BATCH_SIZE: usize = 500;

pub(crate) fn table_not_found(name: &str) -> Error {
    Error::TableNotFound(name.to_string())
}
