//! Cluster Driver
//!
//! A registered cluster routes connections to its active members, fans
//! writes out to all of them and brings inactive members back after
//! synchronizing them from the reference member.

mod configuration;
mod registry;
mod scheduler;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::balancer::{Balancer, BalancerStats, Selection};
use crate::database::{Connector, Database, DatabaseDescriptor, RowChange, TableSchema};
use crate::error::{ConfigError, Error, Result, RoutingError, SyncError};
use crate::metadata::MetadataCache;
use crate::state::StateManager;
use crate::sync::{SyncContext, SyncReport, SynchronizationStrategy};

pub use configuration::ClusterConfiguration;
pub use registry::DriverRegistry;

/// A configured member and its backend
struct Member {
    order: usize,
    descriptor: Arc<DatabaseDescriptor>,
    database: Arc<dyn Database>,
}

/// A connection to one active member, chosen by the balancer. The member
/// counts as busy for the load balancer until the connection is dropped.
pub struct Connection {
    cluster: String,
    database: Arc<dyn Database>,
    selection: Selection,
}

impl Connection {
    /// Cluster the connection belongs to
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Id of the member serving this connection
    pub fn database_id(&self) -> &str {
        &self.selection.descriptor().id
    }

    pub fn descriptor(&self) -> &DatabaseDescriptor {
        self.selection.descriptor()
    }

    pub fn database(&self) -> &dyn Database {
        self.database.as_ref()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("cluster", &self.cluster)
            .field("database", &self.database_id())
            .finish()
    }
}

/// Outcome of a write fanned out to the active members
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOutcome {
    /// Rows affected on the members that succeeded
    pub affected: u64,
    /// Members the write was applied to
    pub applied: Vec<String>,
    /// Members deactivated because the write failed on them
    pub deactivated: Vec<String>,
}

/// Outcome of a re-activation sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub activated: Vec<String>,
    /// Members left inactive, with the reason
    pub failed: Vec<(String, String)>,
}

/// Status of one member
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberStatus {
    pub id: String,
    pub location: String,
    pub weight: u32,
    pub active: bool,
    pub synchronizing: bool,
    pub last_synchronized: Option<DateTime<Utc>>,
}

/// Status of a cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub name: String,
    pub balancer: BalancerStats,
    pub state_manager: String,
    pub metadata_cache: String,
    pub default_strategy: String,
    pub schedule: String,
    pub members: Vec<MemberStatus>,
}

/// Removes a member from the synchronizing set when dropped
struct SyncGuard<'a> {
    set: &'a StdMutex<HashSet<String>>,
    id: String,
}

impl<'a> SyncGuard<'a> {
    fn acquire(set: &'a StdMutex<HashSet<String>>, id: &str) -> std::result::Result<Self, SyncError> {
        let mut members = set.lock().unwrap_or_else(|e| e.into_inner());
        if !members.insert(id.to_string()) {
            return Err(SyncError::InProgress(id.to_string()));
        }
        Ok(Self {
            set,
            id: id.to_string(),
        })
    }
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().unwrap_or_else(|e| e.into_inner()).remove(&self.id);
    }
}

/// A registered cluster
pub struct Cluster {
    config: ClusterConfiguration,
    members: Vec<Member>,
    balancer: Balancer,
    state: Arc<dyn StateManager>,
    metadata: MetadataCache,
    /// Serializes changes to the active set so balancer and state agree
    activation: Mutex<()>,
    /// Held shared by writes and exclusively while a synchronized member
    /// catches up and becomes active
    writes: RwLock<()>,
    /// Bumped by every write once it has been applied
    write_epoch: AtomicU64,
    /// Members with a synchronization in progress
    synchronizing: StdMutex<HashSet<String>>,
    shutdown_tx: watch::Sender<bool>,
    scheduler: StdMutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Cluster {
    /// Open the members, load persisted state and start the re-activation
    /// schedule
    pub(crate) async fn start(config: ClusterConfiguration, connector: &dyn Connector) -> Result<Arc<Self>> {
        let state = config.state_manager.build(&config.name, &config.state)?;
        Self::start_with_state(config, connector, state).await
    }

    pub(crate) async fn start_with_state(
        config: ClusterConfiguration,
        connector: &dyn Connector,
        state: Arc<dyn StateManager>,
    ) -> Result<Arc<Self>> {
        let mut members = Vec::with_capacity(config.databases.len());
        for (order, descriptor) in config.databases.iter().enumerate() {
            members.push(Member {
                order,
                descriptor: Arc::clone(descriptor),
                database: connector.connect(descriptor)?,
            });
        }

        state.start().await?;

        let active = match load_active(&config, state.as_ref()).await {
            Ok(active) => active,
            Err(e) => {
                if let Err(stop_err) = state.stop().await {
                    tracing::warn!("Failed to stop state manager of {}: {}", config.name, stop_err);
                }
                return Err(e);
            }
        };

        let balancer = Balancer::new(config.balancer);
        for member in members.iter().filter(|m| active.contains(&m.descriptor.id)) {
            balancer.add(member.order, Arc::clone(&member.descriptor)).await;
        }

        let metadata = MetadataCache::new(
            config.metadata_cache,
            config.identity_column_detection,
            config.sequence_detection,
        );
        let warm: Vec<(&str, &dyn Database)> = members
            .iter()
            .filter(|m| active.contains(&m.descriptor.id))
            .map(|m| (m.descriptor.id.as_str(), m.database.as_ref()))
            .collect();
        metadata.warm(&warm).await;

        tracing::info!("Cluster {} started: {} of {} members active ({} balancer, {} state)",
            config.name, active.len(), members.len(), config.balancer, config.state_manager);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let schedule = config.schedule.clone();
        let cluster = Arc::new(Self {
            config,
            members,
            balancer,
            state,
            metadata,
            activation: Mutex::new(()),
            writes: RwLock::new(()),
            write_epoch: AtomicU64::new(0),
            synchronizing: StdMutex::new(HashSet::new()),
            shutdown_tx,
            scheduler: StdMutex::new(None),
            closed: AtomicBool::new(false),
        });

        let handle = scheduler::spawn(Arc::downgrade(&cluster), schedule, shutdown_rx);
        *cluster.scheduler.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        Ok(cluster)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn configuration(&self) -> &ClusterConfiguration {
        &self.config
    }

    /// Ids of active members, in configuration order
    pub async fn active_members(&self) -> Vec<String> {
        self.balancer.members().await.iter().map(|d| d.id.clone()).collect()
    }

    /// Check if a member is active
    pub async fn is_active(&self, id: &str) -> bool {
        self.balancer.contains(id).await
    }

    /// Get a connection to the member chosen by the balancer
    pub async fn get_connection(&self) -> Result<Connection> {
        self.check_open()?;
        let selection = self
            .balancer
            .next()
            .await
            .ok_or_else(|| RoutingError::NoActiveMembers(self.config.name.clone()))?;
        let member = self.member(&selection.descriptor().id)?;

        Ok(Connection {
            cluster: self.config.name.clone(),
            database: Arc::clone(&member.database),
            selection,
        })
    }

    /// Schema of a table, as reported by the reference member
    pub async fn table_schema(&self, table: &str) -> Result<TableSchema> {
        let reference = self
            .reference()
            .await
            .ok_or_else(|| RoutingError::NoActiveMembers(self.config.name.clone()))?;
        let metadata = self
            .metadata
            .get(&reference.descriptor.id, reference.database.as_ref())
            .await?;
        metadata
            .table(table)
            .cloned()
            .ok_or_else(|| Error::TableNotFound(table.to_string()))
    }

    /// Apply changes to every active member. Members on which the write fails
    /// are deactivated as long as at least one member succeeded; if every
    /// member fails the last error is returned and nobody is deactivated.
    pub async fn write(&self, table: &str, changes: &[RowChange]) -> Result<WriteOutcome> {
        self.check_open()?;
        let _writes = self.writes.read().await;

        let active = self.balancer.members().await;
        if active.is_empty() {
            return Err(RoutingError::NoActiveMembers(self.config.name.clone()).into());
        }
        let schema = self.table_schema(table).await?;

        let targets: Vec<&Member> = active
            .iter()
            .filter_map(|d| self.members.iter().find(|m| m.descriptor.id == d.id))
            .collect();
        let results = join_all(targets.iter().map(|m| m.database.apply(&schema, changes))).await;
        self.write_epoch.fetch_add(1, Ordering::AcqRel);

        let mut outcome = WriteOutcome {
            affected: 0,
            applied: Vec::new(),
            deactivated: Vec::new(),
        };
        let mut failures = Vec::new();
        for (member, result) in targets.iter().zip(results) {
            match result {
                Ok(affected) => {
                    outcome.affected = outcome.affected.max(affected);
                    outcome.applied.push(member.descriptor.id.clone());
                }
                Err(e) => failures.push((member.descriptor.id.clone(), e)),
            }
        }

        if outcome.applied.is_empty() {
            let (id, e) = failures
                .pop()
                .ok_or_else(|| Error::Internal("write reached no members".into()))?;
            tracing::warn!("Write to {} failed on every member, last on {}: {}", table, id, e);
            return Err(e);
        }

        // Every failed member leaves the balancer, even if recording it fails
        let _activation = self.activation.lock().await;
        for (id, e) in failures {
            tracing::warn!("Write to {} failed on {}, deactivating: {}", table, id, e);
            if self.balancer.remove(&id).await {
                outcome.deactivated.push(id);
            }
        }
        for id in &outcome.deactivated {
            if let Err(e) = self.state.record_inactive(id).await {
                tracing::error!("Could not record {} as inactive in cluster {}: {}", id, self.config.name, e);
            }
        }
        Ok(outcome)
    }

    /// Synchronize a member from the reference member and activate it.
    /// Returns `None` if the member was already active.
    pub async fn activate(&self, id: &str, strategy: Option<SynchronizationStrategy>) -> Result<Option<SyncReport>> {
        self.check_open()?;
        let strategy = strategy.unwrap_or(self.config.default_strategy);
        self.activate_member(id, strategy).await
    }

    /// Remove a member from service. Returns false if it was not active.
    pub async fn deactivate(&self, id: &str) -> Result<bool> {
        let member = self.member(id)?;
        let _activation = self.activation.lock().await;
        if !self.balancer.remove(&member.descriptor.id).await {
            return Ok(false);
        }
        self.state.record_inactive(id).await?;
        tracing::warn!("Deactivated {} in cluster {}", id, self.config.name);
        Ok(true)
    }

    /// Try to activate every inactive member with the default strategy.
    /// Failures leave the member inactive until the next sweep.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        if self.closed.load(Ordering::Acquire) {
            return report;
        }

        if self.balancer.members().await.is_empty() {
            self.recover_reference(&mut report).await;
        }

        let mut inactive = Vec::new();
        for member in &self.members {
            if !self.balancer.contains(&member.descriptor.id).await {
                inactive.push(member.descriptor.id.as_str());
            }
        }
        if inactive.is_empty() {
            return report;
        }

        let strategy = self.config.default_strategy;
        let results = join_all(inactive.iter().map(|id| self.activate_member(id, strategy))).await;

        for (id, result) in inactive.into_iter().zip(results) {
            match result {
                Ok(_) => report.activated.push(id.to_string()),
                Err(e) => {
                    tracing::warn!("Could not activate {} in cluster {}: {}", id, self.config.name, e);
                    report.failed.push((id.to_string(), e.to_string()));
                }
            }
        }
        report
    }

    /// Drop cached schema metadata and reload it from the active members.
    /// Returns the number of cached entries afterwards.
    pub async fn reload_metadata(&self) -> Result<usize> {
        self.check_open()?;
        self.metadata.invalidate().await;

        let active: HashSet<String> = self.active_members().await.into_iter().collect();
        let warm: Vec<(&str, &dyn Database)> = self
            .members
            .iter()
            .filter(|m| active.contains(&m.descriptor.id))
            .map(|m| (m.descriptor.id.as_str(), m.database.as_ref()))
            .collect();
        self.metadata.warm(&warm).await;

        let cached = self.metadata.len().await;
        tracing::info!("Reloaded schema metadata of cluster {}: {} cached", self.config.name, cached);
        Ok(cached)
    }

    /// Current status of every member
    pub async fn status(&self) -> Result<ClusterStatus> {
        let persisted = self.state.cluster_state().await?;
        let synchronizing = self.synchronizing.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let active: HashSet<String> = self.active_members().await.into_iter().collect();

        Ok(ClusterStatus {
            name: self.config.name.clone(),
            balancer: self.balancer.stats().await,
            state_manager: self.config.state_manager.to_string(),
            metadata_cache: self.config.metadata_cache.to_string(),
            default_strategy: self.config.default_strategy.to_string(),
            schedule: self.config.schedule.to_string(),
            members: self
                .members
                .iter()
                .map(|m| {
                    let id = &m.descriptor.id;
                    MemberStatus {
                        id: id.clone(),
                        location: m.descriptor.location.clone(),
                        weight: m.descriptor.weight,
                        active: active.contains(id),
                        synchronizing: synchronizing.contains(id),
                        last_synchronized: persisted.get(id).and_then(|s| s.last_synchronized),
                    }
                })
                .collect(),
        })
    }

    /// Stop the schedule and close the state manager
    pub async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let _ = self.shutdown_tx.send(true);
        let handle = self.scheduler.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!("Scheduler of cluster {} ended abnormally: {}", self.config.name, e);
            }
        }

        // Wait for in-flight writes and activations being committed
        let _writes = self.writes.write().await;
        self.state.stop().await?;
        tracing::info!("Cluster {} shut down", self.config.name);
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::ShuttingDown)
        } else {
            Ok(())
        }
    }

    fn member(&self, id: &str) -> std::result::Result<&Member, SyncError> {
        self.members
            .iter()
            .find(|m| m.descriptor.id == id)
            .ok_or_else(|| SyncError::UnknownMember(id.to_string()))
    }

    /// First active member in configuration order
    async fn reference(&self) -> Option<&Member> {
        let active = self.balancer.members().await;
        let first = active.first()?;
        self.members.iter().find(|m| m.descriptor.id == first.id)
    }

    /// Synchronize and activate one member. The bulk copy runs while writes
    /// continue; writes pause only for a catch-up pass and the switch to
    /// active, so the member cannot miss one.
    async fn activate_member(&self, id: &str, strategy: SynchronizationStrategy) -> Result<Option<SyncReport>> {
        let target = self.member(id)?;
        if self.balancer.contains(id).await {
            return Ok(None);
        }
        let _guard = SyncGuard::acquire(&self.synchronizing, id)?;
        let deadline = self.config.sync_timeout.map(|limit| Instant::now() + limit);

        let epoch = self.write_epoch.load(Ordering::Acquire);
        let mut report = self.synchronize_from_reference(target, strategy, deadline).await?;

        let _writes = self.writes.write().await;
        self.check_open()?;
        if strategy != SynchronizationStrategy::Passive && self.write_epoch.load(Ordering::Acquire) != epoch {
            tracing::debug!("Writes arrived while {} was synchronized, catching up", id);
            let catch_up = self
                .synchronize_from_reference(target, SynchronizationStrategy::FastDifferential, deadline)
                .await?;
            report.inserted += catch_up.inserted;
            report.updated += catch_up.updated;
            report.deleted += catch_up.deleted;
        }

        self.state.record_synchronized(id, Utc::now()).await?;
        self.commit_active(target).await?;
        tracing::info!("Activated {} in cluster {}: {} tables, {} rows changed",
            id, self.config.name, report.tables, report.rows_changed());
        Ok(Some(report))
    }

    /// Run one synchronization of `target` from the current reference member
    async fn synchronize_from_reference(
        &self,
        target: &Member,
        strategy: SynchronizationStrategy,
        deadline: Option<Instant>,
    ) -> Result<SyncReport> {
        let id = target.descriptor.id.as_str();
        let source = self
            .reference()
            .await
            .ok_or_else(|| SyncError::NoActiveSource(id.to_string()))?;
        let source_id = source.descriptor.id.as_str();

        let metadata = self
            .metadata
            .get(source_id, source.database.as_ref())
            .await
            .map_err(|e| SyncError::SourceUnavailable {
                database: source_id.to_string(),
                reason: e.to_string(),
            })?;

        let ctx = SyncContext {
            source_id,
            source: source.database.as_ref(),
            target_id: id,
            target: target.database.as_ref(),
            metadata: &metadata,
            identity_detection: self.config.identity_column_detection,
            sequence_detection: self.config.sequence_detection,
        };

        tracing::info!("Synchronizing {} from {} using {} strategy", id, source_id, strategy);
        let sync = strategy.synchronize(&ctx);
        let report = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, sync).await.map_err(|_| SyncError::Timeout {
                database: id.to_string(),
                seconds: self.config.sync_timeout.map_or(0, |limit| limit.as_secs()),
            })??,
            None => sync.await?,
        };
        Ok(report)
    }

    async fn commit_active(&self, member: &Member) -> Result<()> {
        let _activation = self.activation.lock().await;
        self.state.record_active(&member.descriptor.id).await?;
        self.balancer.add(member.order, Arc::clone(&member.descriptor)).await;
        Ok(())
    }

    /// With nothing active there is no source to synchronize from; the first
    /// reachable member in configuration order becomes the reference as is.
    async fn recover_reference(&self, report: &mut SweepReport) {
        for member in &self.members {
            match member.database.ping().await {
                Ok(()) => {
                    if let Err(e) = self.commit_active(member).await {
                        tracing::warn!("Could not record {} as active: {}", member.descriptor.id, e);
                        continue;
                    }
                    tracing::warn!("No active members in cluster {}, using {} as reference",
                        self.config.name, member.descriptor.id);
                    report.activated.push(member.descriptor.id.clone());
                    return;
                }
                Err(e) => {
                    tracing::debug!("Reference candidate {} unreachable: {}", member.descriptor.id, e);
                }
            }
        }
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let members: Vec<&str> = self.members.iter().map(|m| m.descriptor.id.as_str()).collect();
        f.debug_struct("Cluster")
            .field("name", &self.config.name)
            .field("members", &members)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

/// Active members according to persisted state. A fresh state activates the
/// first configured member as the reference.
async fn load_active(config: &ClusterConfiguration, state: &dyn StateManager) -> Result<HashSet<String>> {
    let persisted = state.list_active().await?;
    let mut active = HashSet::new();
    for id in persisted {
        if config.database(&id).is_some() {
            active.insert(id);
        } else {
            tracing::warn!("Ignoring unknown member {} in persisted state of cluster {}", id, config.name);
        }
    }

    if active.is_empty() {
        let first = &config.databases.first().ok_or(ConfigError::NoMembers)?.id;
        let recorded = state.cluster_state().await?;
        if recorded.keys().any(|id| config.database(id).is_some()) {
            tracing::warn!("No member of cluster {} is recorded as active, using {} as reference",
                config.name, first);
        }
        state.record_active(first).await?;
        active.insert(first.clone());
    }
    Ok(active)
}
