//! WolfHA - High-Availability Database Cluster Driver
//!
//! Presents a set of replicated member databases as one logical database.
//! Connections are routed to active members by a balancer, writes are fanned
//! out to every active member, and members that drop out are brought back by
//! synchronizing them from an active member on a cron schedule.
//!
//! # Architecture
//!
//! Each registered cluster owns a balancer holding its active members, a
//! state manager persisting which members are active, and a metadata cache of
//! member schemas. A member that fails a write is deactivated; the scheduled
//! sweep synchronizes it with the configured strategy and activates it again.
//!
//! # Features
//!
//! - Synchronization strategies: full, dump-restore, differential,
//!   fast-differential, per-table and passive
//! - Balancers: simple, round-robin, random and load
//! - State managers: in-memory, MariaDB/MySQL, SQLite and an append-only file log
//! - Quartz-style cron schedules for re-activation
//! - HTTP API for status and manual activation

pub mod api;
pub mod balancer;
pub mod cluster;
pub mod config;
pub mod cron;
pub mod database;
pub mod error;
pub mod metadata;
pub mod state;
pub mod sync;

pub use config::WolfHaConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::balancer::{Balancer, BalancerKind};
    pub use crate::cluster::{Cluster, ClusterConfiguration, Connection, DriverRegistry};
    pub use crate::config::{ClusterSettings, StateConfig, WolfHaConfig};
    pub use crate::cron::CronExpression;
    pub use crate::database::{Database, DatabaseDescriptor, RowChange, Value};
    pub use crate::error::{Error, Result};
    pub use crate::metadata::{MetadataCache, MetadataCacheKind};
    pub use crate::state::{StateManager, StateManagerKind};
    pub use crate::sync::{SyncReport, SynchronizationStrategy};
}
