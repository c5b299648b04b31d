//! WolfHA Error Types

use thiserror::Error;

/// Result type alias for WolfHA operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfHA error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Synchronization errors
    #[error("Synchronization error: {0}")]
    Sync(#[from] SyncError),

    // Routing errors
    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Query execution failed: {0}")]
    QueryExecution(String),

    #[error("Database unavailable: {0}")]
    Unavailable(String),

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Duplicate key in table {table}: {key}")]
    DuplicateKey { table: String, key: String },

    // State errors
    #[error("State error: {0}")]
    State(String),

    #[error("State record corrupted: {0}")]
    StateCorrupted(String),

    // Dump errors
    #[error("Dump error: {0}")]
    Dump(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Unavailable(_) | Error::Database(_) => true,
            Error::Sync(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Errors raised while validating or registering a cluster configuration.
///
/// These are fatal: a cluster that fails with one of these is never registered.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no members configured")]
    NoMembers,

    #[error("duplicate member id: {0}")]
    DuplicateMember(String),

    #[error("member {0}: weight must be at least 1")]
    InvalidWeight(String),

    #[error("unknown synchronization strategy: {0}")]
    UnknownStrategy(String),

    #[error("unknown balancer: {0}")]
    UnknownBalancer(String),

    #[error("unknown state manager: {0}")]
    UnknownStateManager(String),

    #[error("unknown metadata cache: {0}")]
    UnknownMetadataCache(String),

    #[error("member {database}: unknown driver {driver}")]
    UnknownDriver { database: String, driver: String },

    #[error("invalid schedule expression '{expression}': {reason}")]
    InvalidSchedule { expression: String, reason: String },

    #[error("state manager {0} requires state.url")]
    MissingStateUrl(String),

    #[error("cluster already registered: {0}")]
    AlreadyRegistered(String),

    #[error("{0}")]
    Invalid(String),
}

/// Errors raised while bringing an inactive member up to date.
///
/// Recoverable: the member stays inactive and is retried on the next sweep.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("source {database} unavailable: {reason}")]
    SourceUnavailable { database: String, reason: String },

    #[error("target {database} unavailable: {reason}")]
    TargetUnavailable { database: String, reason: String },

    #[error("no active member to synchronize {0} from")]
    NoActiveSource(String),

    #[error("table {table} failed: {reason}")]
    Table { table: String, reason: String },

    #[error("{} table(s) failed ({}), {synchronized} synchronized", .failed.len(), failed_names(.failed))]
    PartialFailure {
        failed: Vec<(String, String)>,
        synchronized: usize,
    },

    #[error("export from {database} failed: {reason}")]
    Export { database: String, reason: String },

    #[error("import into {database} failed: {reason}")]
    Import { database: String, reason: String },

    #[error("synchronization of {database} timed out after {seconds}s")]
    Timeout { database: String, seconds: u64 },

    #[error("{0} is already being synchronized")]
    InProgress(String),

    #[error("unknown member: {0}")]
    UnknownMember(String),
}

impl SyncError {
    /// Check if a later attempt may succeed without operator intervention
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SyncError::UnknownMember(_))
    }
}

fn failed_names(failed: &[(String, String)]) -> String {
    failed
        .iter()
        .map(|(table, _)| table.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors surfaced to callers asking for a connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("unknown cluster: {0}")]
    UnknownCluster(String),

    #[error("cluster {0} has no active members")]
    NoActiveMembers(String),
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::State(format!("SQLite error: {}", e))
    }
}
