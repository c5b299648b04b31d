//! Cluster Configuration
//!
//! Resolves raw [`ClusterSettings`] into typed choices. Every identifier is
//! looked up here, before any connection is opened or state is touched.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::balancer::BalancerKind;
use crate::config::{ClusterSettings, StateConfig};
use crate::cron::CronExpression;
use crate::database::DatabaseDescriptor;
use crate::error::ConfigError;
use crate::metadata::MetadataCacheKind;
use crate::state::StateManagerKind;
use crate::sync::SynchronizationStrategy;

/// Resolved, immutable configuration of one cluster
#[derive(Debug, Clone)]
pub struct ClusterConfiguration {
    pub name: String,
    /// Members in configuration order
    pub databases: Vec<Arc<DatabaseDescriptor>>,
    pub default_strategy: SynchronizationStrategy,
    pub schedule: CronExpression,
    pub balancer: BalancerKind,
    pub state_manager: StateManagerKind,
    pub state: StateConfig,
    pub metadata_cache: MetadataCacheKind,
    pub identity_column_detection: bool,
    pub sequence_detection: bool,
    /// Upper bound on one synchronization attempt
    pub sync_timeout: Option<Duration>,
}

impl ClusterConfiguration {
    /// Validate settings and resolve every identifier
    pub fn resolve(settings: &ClusterSettings, state: &StateConfig) -> Result<Self, ConfigError> {
        validate_name(&settings.name)?;

        if settings.databases.is_empty() {
            return Err(ConfigError::NoMembers);
        }

        let mut ids = HashSet::new();
        for db in &settings.databases {
            if db.id.is_empty() {
                return Err(ConfigError::Invalid("member id cannot be empty".into()));
            }
            if !ids.insert(db.id.as_str()) {
                return Err(ConfigError::DuplicateMember(db.id.clone()));
            }
            if db.weight == 0 {
                return Err(ConfigError::InvalidWeight(db.id.clone()));
            }
            db.driver_kind()?;
        }

        let default_strategy = SynchronizationStrategy::resolve(&settings.default_synchronization_strategy)?;
        let balancer = BalancerKind::from_id(&settings.balancer)?;
        let state_manager = StateManagerKind::from_id(&settings.state_manager)?;
        state_manager.validate(state)?;
        let metadata_cache = MetadataCacheKind::from_id(&settings.metadata_cache)?;
        let schedule = CronExpression::parse(&settings.cron_expression)?;

        Ok(Self {
            name: settings.name.clone(),
            databases: settings.databases.iter().cloned().map(Arc::new).collect(),
            default_strategy,
            schedule,
            balancer,
            state_manager,
            state: state.clone(),
            metadata_cache,
            identity_column_detection: settings.identity_column_detection,
            sequence_detection: settings.sequence_detection,
            sync_timeout: match settings.sync_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        })
    }

    /// Position of a member in configuration order
    pub fn position(&self, id: &str) -> Option<usize> {
        self.databases.iter().position(|db| db.id == id)
    }

    /// Look up a member by id
    pub fn database(&self, id: &str) -> Option<&Arc<DatabaseDescriptor>> {
        self.databases.iter().find(|db| db.id == id)
    }
}

/// Cluster names become file names for the embedded state managers
fn validate_name(name: &str) -> Result<(), ConfigError> {
    if name.is_empty() {
        return Err(ConfigError::Invalid("cluster name cannot be empty".into()));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')) || name.starts_with('.') {
        return Err(ConfigError::Invalid(format!(
            "cluster name '{}' may only contain letters, digits, '-', '_' and '.'",
            name
        )));
    }
    Ok(())
}
