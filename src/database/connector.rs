//! Member Connectors
//!
//! Turns a configured [`DatabaseDescriptor`] into a live [`Database`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{Database, DatabaseDescriptor, DriverKind, MemoryDatabase, MySqlDatabase};
use crate::error::Result;

/// Opens member databases
pub trait Connector: Send + Sync {
    /// Open (or look up) the database behind a descriptor. Must not perform
    /// network I/O; backends connect lazily.
    fn connect(&self, descriptor: &DatabaseDescriptor) -> Result<Arc<dyn Database>>;
}

/// Connector serving `mem:` locations from an in-process catalog and
/// MariaDB/MySQL locations through sqlx
#[derive(Default)]
pub struct DefaultConnector {
    memory: Mutex<HashMap<String, Arc<MemoryDatabase>>>,
}

impl DefaultConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the in-process database with the given name. The same
    /// instance is returned to every cluster member pointing at `mem:<name>`.
    pub fn memory(&self, name: &str) -> Arc<MemoryDatabase> {
        let mut memory = self.memory.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            memory
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(MemoryDatabase::new(name))),
        )
    }
}

/// Name of an in-process database from its location (`mem:orders`,
/// `memory://orders`)
fn memory_name(location: &str) -> &str {
    let rest = location.split_once(':').map(|(_, rest)| rest).unwrap_or(location);
    rest.trim_start_matches('/')
}

impl Connector for DefaultConnector {
    fn connect(&self, descriptor: &DatabaseDescriptor) -> Result<Arc<dyn Database>> {
        match descriptor.driver_kind()? {
            DriverKind::Memory => {
                let db: Arc<dyn Database> = self.memory(memory_name(&descriptor.location));
                Ok(db)
            }
            DriverKind::MySql => Ok(Arc::new(MySqlDatabase::connect_lazy(descriptor)?)),
        }
    }
}
