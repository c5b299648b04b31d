//! Schema Metadata Cache
//!
//! Caches what each member's schema looks like (tables, identity columns,
//! sequences) so synchronization does not re-introspect on every attempt.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::database::{Database, TableSchema};
use crate::error::{ConfigError, Result};

/// Cache key used by the shared variants
const SHARED_KEY: &str = "*";

/// Schema metadata of one database
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaMetadata {
    /// Tables, with identity columns only when identity detection is enabled
    pub tables: Vec<TableSchema>,
    /// Sequence names, empty when sequence detection is disabled
    pub sequences: Vec<String>,
}

impl SchemaMetadata {
    /// Get schema for a table
    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name == name)
    }
}

/// Metadata cache implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetadataCacheKind {
    /// No caching, introspect on every access
    None,
    /// Per-member, loaded on first access
    Lazy,
    /// Per-member, loaded at registration
    Eager,
    /// One entry for all members, loaded on first access
    SharedLazy,
    /// One entry for all members, loaded at registration
    SharedEager,
}

impl MetadataCacheKind {
    pub fn from_id(id: &str) -> std::result::Result<Self, ConfigError> {
        match id {
            "none" => Ok(MetadataCacheKind::None),
            "lazy" => Ok(MetadataCacheKind::Lazy),
            "eager" => Ok(MetadataCacheKind::Eager),
            "shared-lazy" => Ok(MetadataCacheKind::SharedLazy),
            "shared-eager" => Ok(MetadataCacheKind::SharedEager),
            other => Err(ConfigError::UnknownMetadataCache(other.to_string())),
        }
    }

    pub fn id(&self) -> &'static str {
        match self {
            MetadataCacheKind::None => "none",
            MetadataCacheKind::Lazy => "lazy",
            MetadataCacheKind::Eager => "eager",
            MetadataCacheKind::SharedLazy => "shared-lazy",
            MetadataCacheKind::SharedEager => "shared-eager",
        }
    }

    pub fn is_eager(&self) -> bool {
        matches!(self, MetadataCacheKind::Eager | MetadataCacheKind::SharedEager)
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, MetadataCacheKind::SharedLazy | MetadataCacheKind::SharedEager)
    }
}

impl fmt::Display for MetadataCacheKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Schema metadata cache for the members of one cluster
pub struct MetadataCache {
    kind: MetadataCacheKind,
    identity_detection: bool,
    sequence_detection: bool,
    entries: RwLock<HashMap<String, Arc<SchemaMetadata>>>,
}

impl MetadataCache {
    pub fn new(kind: MetadataCacheKind, identity_detection: bool, sequence_detection: bool) -> Self {
        Self {
            kind,
            identity_detection,
            sequence_detection,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn kind(&self) -> MetadataCacheKind {
        self.kind
    }

    fn cache_key<'a>(&self, member: &'a str) -> &'a str {
        if self.kind.is_shared() {
            SHARED_KEY
        } else {
            member
        }
    }

    /// Get the metadata of a member, loading it if it is not cached
    pub async fn get(&self, member: &str, db: &dyn Database) -> Result<Arc<SchemaMetadata>> {
        if self.kind == MetadataCacheKind::None {
            return Ok(Arc::new(self.load(db).await?));
        }

        let key = self.cache_key(member);
        if let Some(metadata) = self.entries.read().await.get(key) {
            return Ok(Arc::clone(metadata));
        }

        let metadata = Arc::new(self.load(db).await?);
        let mut entries = self.entries.write().await;
        // Another caller may have loaded it meanwhile; keep the first
        let entry = entries.entry(key.to_string()).or_insert(metadata);
        Ok(Arc::clone(entry))
    }

    /// Pre-load entries for eager variants. Members that cannot be introspected
    /// now are loaded on first access instead.
    pub async fn warm(&self, members: &[(&str, &dyn Database)]) {
        if !self.kind.is_eager() {
            return;
        }

        for (member, db) in members {
            match self.get(member, *db).await {
                Ok(metadata) => {
                    tracing::debug!("Loaded schema metadata from {}: {} tables, {} sequences",
                        member, metadata.tables.len(), metadata.sequences.len());
                    if self.kind.is_shared() {
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!("Could not pre-load schema metadata from {}: {}", member, e);
                }
            }
        }
    }

    /// Drop every cached entry
    pub async fn invalidate(&self) {
        self.entries.write().await.clear();
    }

    /// Number of cached entries
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    async fn load(&self, db: &dyn Database) -> Result<SchemaMetadata> {
        let mut tables = db.tables().await?;
        if !self.identity_detection {
            for table in &mut tables {
                table.identity_columns.clear();
            }
        }

        let sequences = if self.sequence_detection {
            db.sequences().await?
        } else {
            Vec::new()
        };

        Ok(SchemaMetadata { tables, sequences })
    }
}
