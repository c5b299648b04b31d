//! Driver Registry
//!
//! Process-wide table of registered clusters, keyed by name. The registry is
//! an ordinary value: create one at startup, register clusters into it and
//! shut it down on exit.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::RwLock;

use super::{Cluster, ClusterConfiguration, Connection};
use crate::config::{ClusterSettings, StateConfig};
use crate::database::{Connector, DefaultConnector};
use crate::error::{ConfigError, Result, RoutingError};

/// Registry of running clusters
pub struct DriverRegistry {
    connector: Arc<dyn Connector>,
    clusters: RwLock<HashMap<String, Arc<Cluster>>>,
    /// Names of clusters still starting
    starting: StdMutex<HashSet<String>>,
}

/// Holds a cluster name while the cluster starts; released when dropped
struct Reservation<'a> {
    starting: &'a StdMutex<HashSet<String>>,
    name: String,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.starting.lock().unwrap_or_else(|e| e.into_inner()).remove(&self.name);
    }
}

impl DriverRegistry {
    /// Create an empty registry opening members through `connector`
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            clusters: RwLock::new(HashMap::new()),
            starting: StdMutex::new(HashSet::new()),
        }
    }

    /// Register a cluster. Nothing is opened or persisted if the name is
    /// already taken.
    pub async fn register(&self, config: ClusterConfiguration) -> Result<Arc<Cluster>> {
        let name = config.name.clone();
        let _reservation = self.reserve(&name).await?;

        // Lookups of other clusters go on while this one starts
        let cluster = Cluster::start(config, self.connector.as_ref()).await?;
        self.clusters.write().await.insert(name.clone(), Arc::clone(&cluster));
        tracing::info!("Registered cluster {}", name);
        Ok(cluster)
    }

    async fn reserve(&self, name: &str) -> std::result::Result<Reservation<'_>, ConfigError> {
        let clusters = self.clusters.write().await;
        let mut starting = self.starting.lock().unwrap_or_else(|e| e.into_inner());
        if clusters.contains_key(name) || !starting.insert(name.to_string()) {
            return Err(ConfigError::AlreadyRegistered(name.to_string()));
        }
        Ok(Reservation {
            starting: &self.starting,
            name: name.to_string(),
        })
    }

    /// Resolve settings and register the resulting cluster
    pub async fn register_settings(&self, settings: &ClusterSettings, state: &StateConfig) -> Result<Arc<Cluster>> {
        let config = ClusterConfiguration::resolve(settings, state)?;
        self.register(config).await
    }

    /// Get a connection to a member of the named cluster
    pub async fn get_connection(&self, name: &str) -> Result<Connection> {
        self.cluster(name).await?.get_connection().await
    }

    /// Look up a registered cluster
    pub async fn cluster(&self, name: &str) -> std::result::Result<Arc<Cluster>, RoutingError> {
        self.clusters
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| RoutingError::UnknownCluster(name.to_string()))
    }

    /// Every registered cluster, by name
    pub async fn clusters(&self) -> Vec<Arc<Cluster>> {
        let mut clusters: Vec<Arc<Cluster>> = self.clusters.read().await.values().cloned().collect();
        clusters.sort_by(|a, b| a.name().cmp(b.name()));
        clusters
    }

    /// Shut a cluster down and remove it
    pub async fn deregister(&self, name: &str) -> Result<()> {
        let cluster = self
            .clusters
            .write()
            .await
            .remove(name)
            .ok_or_else(|| RoutingError::UnknownCluster(name.to_string()))?;
        cluster.shutdown().await?;
        tracing::info!("Deregistered cluster {}", name);
        Ok(())
    }

    /// Shut down every cluster
    pub async fn shutdown(&self) {
        let clusters: Vec<Arc<Cluster>> = self.clusters.write().await.drain().map(|(_, c)| c).collect();
        for cluster in clusters {
            if let Err(e) = cluster.shutdown().await {
                tracing::error!("Failed to shut down cluster {}: {}", cluster.name(), e);
            }
        }
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new(Arc::new(DefaultConnector::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::tests::{connector, settings};
    use crate::error::Error;

    async fn registry(n: usize) -> DriverRegistry {
        let (connector, _) = connector(n).await;
        DriverRegistry::new(connector)
    }

    #[tokio::test]
    async fn test_register_and_connect() {
        let registry = registry(2).await;
        let cluster = registry
            .register_settings(&settings(2), &StateConfig::default())
            .await
            .unwrap();
        assert_eq!(cluster.name(), "default");

        let conn = registry.get_connection("default").await.unwrap();
        assert_eq!(conn.database_id(), "db1");
        assert_eq!(conn.cluster(), "default");
        assert_eq!(registry.clusters().await.len(), 1);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_default_cluster_scenario() {
        // db1 active, db2 inactive, round-robin, every minute, full strategy
        let registry = registry(2).await;
        let cluster = registry
            .register_settings(&settings(2), &StateConfig::default())
            .await
            .unwrap();
        assert_eq!(cluster.configuration().default_strategy.id(), "full");

        for _ in 0..4 {
            assert_eq!(registry.get_connection("default").await.unwrap().database_id(), "db1");
        }

        cluster.sweep().await;
        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(registry.get_connection("default").await.unwrap().database_id().to_string());
        }
        assert_eq!(ids, vec!["db1", "db2", "db1", "db2"]);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let registry = registry(1).await;
        registry
            .register_settings(&settings(1), &StateConfig::default())
            .await
            .unwrap();
        let err = registry
            .register_settings(&settings(1), &StateConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::AlreadyRegistered(_))));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_starting_cluster_holds_its_name() {
        let registry = registry(1).await;
        let reservation = registry.reserve("default").await.unwrap();

        // Lookups are answered while a cluster starts
        let lookup = tokio::time::timeout(std::time::Duration::from_millis(100), registry.cluster("other"))
            .await
            .unwrap();
        assert!(matches!(lookup, Err(RoutingError::UnknownCluster(_))));

        let err = registry
            .register_settings(&settings(1), &StateConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::AlreadyRegistered(_))));

        drop(reservation);
        registry
            .register_settings(&settings(1), &StateConfig::default())
            .await
            .unwrap();
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_start_releases_name() {
        // The state directory cannot be created below a plain file
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("blocker"), b"").unwrap();
        let state = StateConfig {
            dir: dir.path().join("blocker").join("state"),
            url: None,
        };
        let mut bad = settings(1);
        bad.state_manager = "sqlite".into();

        let registry = registry(1).await;
        assert!(registry.register_settings(&bad, &state).await.is_err());
        assert!(registry.cluster("default").await.is_err());

        registry
            .register_settings(&settings(1), &StateConfig::default())
            .await
            .unwrap();
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_members_rejected() {
        let registry = registry(1).await;
        let err = registry
            .register_settings(&settings(0), &StateConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Configuration error: no members configured");
        assert!(registry.clusters().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_balancer_persists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateConfig {
            dir: dir.path().join("state"),
            url: None,
        };
        let mut settings = settings(2);
        settings.balancer = "nonexistent".into();
        settings.state_manager = "sqlite".into();

        let registry = registry(2).await;
        let err = registry.register_settings(&settings, &state).await.unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::UnknownBalancer(_))));
        assert!(!state.dir.exists());
        assert!(matches!(
            registry.get_connection("default").await,
            Err(Error::Routing(RoutingError::UnknownCluster(_)))
        ));
    }

    #[tokio::test]
    async fn test_deregister() {
        let registry = registry(1).await;
        let cluster = registry
            .register_settings(&settings(1), &StateConfig::default())
            .await
            .unwrap();
        registry.deregister("default").await.unwrap();

        assert!(registry.cluster("default").await.is_err());
        assert!(matches!(cluster.get_connection().await, Err(Error::ShuttingDown)));
        assert!(registry.deregister("default").await.is_err());

        // The name is free again
        registry
            .register_settings(&settings(1), &StateConfig::default())
            .await
            .unwrap();
        registry.shutdown().await;
    }
}
