//! WolfHA Configuration
//!
//! This module provides configuration structures for the WolfHA
//! database clustering driver.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

use crate::cluster::ClusterConfiguration;
use crate::cron::DEFAULT_EXPRESSION;
use crate::database::DatabaseDescriptor;
use crate::error::ConfigError;

/// Main WolfHA configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WolfHaConfig {
    /// Clusters to register at startup
    #[serde(default)]
    pub clusters: Vec<ClusterSettings>,

    /// State manager storage
    #[serde(default)]
    pub state: StateConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Settings of one cluster, as written in the configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSettings {
    /// Cluster name, unique within the process
    #[serde(default = "default_cluster_name")]
    pub name: String,

    /// Register this cluster at startup
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Member databases, in order of preference
    #[serde(default)]
    pub databases: Vec<DatabaseDescriptor>,

    /// Re-activation schedule
    #[serde(default = "default_cron_expression")]
    pub cron_expression: String,

    /// Strategy used by scheduled re-activation
    #[serde(default = "default_strategy")]
    pub default_synchronization_strategy: String,

    /// Detect identity (auto-increment) columns
    #[serde(default = "default_true")]
    pub identity_column_detection: bool,

    /// Detect sequences
    #[serde(default = "default_true")]
    pub sequence_detection: bool,

    /// Balancer (simple, round-robin, random, load)
    #[serde(default = "default_balancer")]
    pub balancer: String,

    /// State manager (simple, sql, sqlite, file)
    #[serde(default = "default_state_manager")]
    pub state_manager: String,

    /// Metadata cache (none, lazy, eager, shared-lazy, shared-eager)
    #[serde(default = "default_metadata_cache")]
    pub metadata_cache: String,

    /// Synchronization timeout in seconds (0 = none)
    #[serde(default = "default_sync_timeout_secs")]
    pub sync_timeout_secs: u64,
}

/// State manager storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Directory for the sqlite and file state managers
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,

    /// Server URL for the sql state manager
    #[serde(default)]
    pub url: Option<String>,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_cluster_name() -> String {
    "default".to_string()
}

fn default_cron_expression() -> String {
    DEFAULT_EXPRESSION.to_string()
}

fn default_strategy() -> String {
    "full".to_string()
}

fn default_balancer() -> String {
    "simple".to_string()
}

fn default_state_manager() -> String {
    "simple".to_string()
}

fn default_metadata_cache() -> String {
    "shared-eager".to_string()
}

fn default_sync_timeout_secs() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/wolfha")
}

fn default_api_address() -> String {
    "127.0.0.1:8090".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            name: default_cluster_name(),
            enabled: true,
            databases: Vec::new(),
            cron_expression: default_cron_expression(),
            default_synchronization_strategy: default_strategy(),
            identity_column_detection: true,
            sequence_detection: true,
            balancer: default_balancer(),
            state_manager: default_state_manager(),
            metadata_cache: default_metadata_cache(),
            sync_timeout_secs: default_sync_timeout_secs(),
        }
    }
}

impl ClusterSettings {
    /// Settings for a named cluster with default choices
    pub fn new(name: impl Into<String>, databases: Vec<DatabaseDescriptor>) -> Self {
        Self {
            name: name.into(),
            databases,
            ..Self::default()
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: default_state_dir(),
            url: None,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl WolfHaConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: WolfHaConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfHaConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration. Every enabled cluster is fully resolved,
    /// so unknown identifiers and bad schedules are reported here.
    pub fn validate(&self) -> crate::Result<()> {
        let mut names = HashSet::new();
        for cluster in &self.clusters {
            if !names.insert(cluster.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate cluster name: {}", cluster.name)).into());
            }
        }

        for cluster in self.enabled_clusters() {
            ClusterConfiguration::resolve(cluster, &self.state)?;
        }
        Ok(())
    }

    /// Clusters to register at startup
    pub fn enabled_clusters(&self) -> impl Iterator<Item = &ClusterSettings> {
        self.clusters.iter().filter(|c| c.enabled)
    }

    /// Look up a cluster by name
    pub fn cluster(&self, name: &str) -> Option<&ClusterSettings> {
        self.clusters.iter().find(|c| c.name == name)
    }

    /// Sample configuration written by `wolfha init`
    pub fn example() -> Self {
        let mut db1 = DatabaseDescriptor::new("db1", "mysql://db1.example.com:3306/app");
        db1.user = Some("wolfha".to_string());
        db1.password = Some("changeme".to_string());
        let mut db2 = DatabaseDescriptor::new("db2", "mysql://db2.example.com:3306/app");
        db2.user = Some("wolfha".to_string());
        db2.password = Some("changeme".to_string());

        let mut cluster = ClusterSettings::new("default", vec![db1, db2]);
        cluster.balancer = "round-robin".to_string();
        cluster.state_manager = "sqlite".to_string();

        Self {
            clusters: vec![cluster],
            ..Self::default()
        }
    }
}
