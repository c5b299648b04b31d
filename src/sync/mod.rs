//! Synchronization Strategies
//!
//! Algorithms that bring an inactive member up to date with an active one
//! before it is re-activated. The catalog is closed; strategies are selected
//! by identifier and carry no state between attempts.

mod copy;
mod differential;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::database::{Database, Row, TableSchema};
use crate::error::{ConfigError, Error, SyncError};
use crate::metadata::SchemaMetadata;

pub use differential::{diff_rows, BUCKET_COUNT};

/// Algorithm applied to a single table by the per-table strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableStrategy {
    Full,
    Differential,
}

/// A synchronization strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SynchronizationStrategy {
    /// Truncate and copy every table
    Full,
    /// Export the source, import into the target
    DumpRestore,
    /// Row fingerprint comparison
    Differential,
    /// Bucketed fingerprint comparison
    FastDifferential,
    /// Run a table strategy table by table, isolating failures
    PerTable(TableStrategy),
    /// Trust the target is already consistent
    Passive,
}

const CATALOG: [SynchronizationStrategy; 7] = [
    SynchronizationStrategy::Full,
    SynchronizationStrategy::DumpRestore,
    SynchronizationStrategy::Differential,
    SynchronizationStrategy::FastDifferential,
    SynchronizationStrategy::PerTable(TableStrategy::Full),
    SynchronizationStrategy::PerTable(TableStrategy::Differential),
    SynchronizationStrategy::Passive,
];

impl SynchronizationStrategy {
    /// Look up a strategy by identifier
    pub fn resolve(id: &str) -> Result<Self, ConfigError> {
        CATALOG
            .iter()
            .copied()
            .find(|s| s.id() == id)
            .ok_or_else(|| ConfigError::UnknownStrategy(id.to_string()))
    }

    /// Every available strategy
    pub fn catalog() -> &'static [SynchronizationStrategy] {
        &CATALOG
    }

    pub fn id(&self) -> &'static str {
        match self {
            SynchronizationStrategy::Full => "full",
            SynchronizationStrategy::DumpRestore => "dump-restore",
            SynchronizationStrategy::Differential => "differential",
            SynchronizationStrategy::FastDifferential => "fast-differential",
            SynchronizationStrategy::PerTable(TableStrategy::Full) => "per-table-full",
            SynchronizationStrategy::PerTable(TableStrategy::Differential) => "per-table-diff",
            SynchronizationStrategy::Passive => "passive",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            SynchronizationStrategy::Full => "truncate each table and copy every row",
            SynchronizationStrategy::DumpRestore => "export a snapshot of the source and import it",
            SynchronizationStrategy::Differential => "copy only rows whose fingerprint differs",
            SynchronizationStrategy::FastDifferential => "compare bucket digests, then diff mismatched buckets",
            SynchronizationStrategy::PerTable(TableStrategy::Full) => "full copy table by table, isolating failures",
            SynchronizationStrategy::PerTable(TableStrategy::Differential) => {
                "differential table by table, isolating failures"
            }
            SynchronizationStrategy::Passive => "no copy, target is kept consistent out of band",
        }
    }

    /// Bring `ctx.target` in line with `ctx.source`
    pub async fn synchronize(&self, ctx: &SyncContext<'_>) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::new(*self);

        ctx.target.ping().await.map_err(|e| SyncError::TargetUnavailable {
            database: ctx.target_id.to_string(),
            reason: e.to_string(),
        })?;
        if *self == SynchronizationStrategy::Passive {
            tracing::debug!("Passive synchronization of {}: nothing to copy", ctx.target_id);
            return Ok(report);
        }
        ctx.source.ping().await.map_err(|e| SyncError::SourceUnavailable {
            database: ctx.source_id.to_string(),
            reason: e.to_string(),
        })?;

        let synchronized = match self {
            SynchronizationStrategy::DumpRestore => {
                copy::dump_restore(ctx, &mut report).await?;
                return Ok(report);
            }
            SynchronizationStrategy::PerTable(inner) => {
                let (synchronized, failed) = self.run_per_table(ctx, *inner, &mut report).await;
                report.failed = failed;
                synchronized
            }
            _ => self.run_all_tables(ctx, &mut report).await?,
        };

        finish(ctx, &synchronized, &mut report).await?;

        if !report.failed.is_empty() {
            return Err(SyncError::PartialFailure {
                failed: report.failed,
                synchronized: report.tables,
            });
        }
        Ok(report)
    }

    /// Synchronize every table, aborting at the first failure
    async fn run_all_tables<'m>(
        &self,
        ctx: &SyncContext<'m>,
        report: &mut SyncReport,
    ) -> Result<Vec<TableOutcome<'m>>, SyncError> {
        let metadata: &'m SchemaMetadata = ctx.metadata;
        let mut outcomes = Vec::with_capacity(metadata.tables.len());
        for table in &metadata.tables {
            let outcome = match self {
                SynchronizationStrategy::Full => copy::copy_table(ctx, table).await,
                SynchronizationStrategy::FastDifferential => differential::sync_table_bucketed(ctx, table).await,
                _ => differential::sync_table(ctx, table).await,
            }
            .map_err(|e| table_error(table, e))?;
            report.record(&outcome);
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Synchronize table by table, collecting failures instead of aborting
    async fn run_per_table<'m>(
        &self,
        ctx: &SyncContext<'m>,
        inner: TableStrategy,
        report: &mut SyncReport,
    ) -> (Vec<TableOutcome<'m>>, Vec<(String, String)>) {
        let metadata: &'m SchemaMetadata = ctx.metadata;
        let mut outcomes = Vec::new();
        let mut failed = Vec::new();
        for table in &metadata.tables {
            let result = match inner {
                TableStrategy::Full => copy::copy_table(ctx, table).await,
                TableStrategy::Differential => differential::sync_table(ctx, table).await,
            };
            match result {
                Ok(outcome) => {
                    report.record(&outcome);
                    outcomes.push(outcome);
                }
                Err(e) => {
                    tracing::warn!("Table {} failed while synchronizing {}: {}", table.name, ctx.target_id, e);
                    failed.push((table.name.clone(), e.to_string()));
                }
            }
        }
        (outcomes, failed)
    }
}

impl fmt::Display for SynchronizationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Inputs of one synchronization attempt
pub struct SyncContext<'a> {
    pub source_id: &'a str,
    pub source: &'a dyn Database,
    pub target_id: &'a str,
    pub target: &'a dyn Database,
    /// Schema of the source
    pub metadata: &'a SchemaMetadata,
    pub identity_detection: bool,
    pub sequence_detection: bool,
}

/// What a synchronization attempt changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub strategy: String,
    /// Tables brought up to date
    pub tables: usize,
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
    /// Sequences copied
    pub sequences: usize,
    /// Tables that failed, with the reason
    pub failed: Vec<(String, String)>,
}

impl SyncReport {
    fn new(strategy: SynchronizationStrategy) -> Self {
        Self {
            strategy: strategy.id().to_string(),
            tables: 0,
            inserted: 0,
            updated: 0,
            deleted: 0,
            sequences: 0,
            failed: Vec::new(),
        }
    }

    /// Rows written to the target
    pub fn rows_changed(&self) -> u64 {
        self.inserted + self.updated + self.deleted
    }

    fn record(&mut self, outcome: &TableOutcome<'_>) {
        self.tables += 1;
        self.inserted += outcome.inserted;
        self.updated += outcome.updated;
        self.deleted += outcome.deleted;
    }
}

/// Result of synchronizing one table
pub(crate) struct TableOutcome<'a> {
    table: &'a TableSchema,
    inserted: u64,
    updated: u64,
    deleted: u64,
    /// Highest value per identity column seen in the source rows
    identity_max: Vec<(String, i64)>,
}

impl<'a> TableOutcome<'a> {
    fn new(table: &'a TableSchema) -> Self {
        Self {
            table,
            inserted: 0,
            updated: 0,
            deleted: 0,
            identity_max: Vec::new(),
        }
    }
}

/// Highest value of each identity column over a set of rows
pub(crate) fn identity_max<'r>(table: &TableSchema, rows: impl Iterator<Item = &'r Row>) -> Vec<(String, i64)> {
    let columns: Vec<(String, usize)> = table
        .identity_columns
        .iter()
        .filter_map(|c| table.column_index(c).map(|idx| (c.clone(), idx)))
        .collect();
    if columns.is_empty() {
        return Vec::new();
    }

    let mut max: Vec<Option<i64>> = vec![None; columns.len()];
    for row in rows {
        for (slot, (_, idx)) in max.iter_mut().zip(&columns) {
            if let Some(v) = row.get(*idx).and_then(|v| v.as_i64()) {
                *slot = Some(slot.map_or(v, |m| m.max(v)));
            }
        }
    }

    columns
        .into_iter()
        .zip(max)
        .filter_map(|((column, _), max)| max.map(|m| (column, m)))
        .collect()
}

/// Identity and sequence adjustments after the table copy
async fn finish(ctx: &SyncContext<'_>, outcomes: &[TableOutcome<'_>], report: &mut SyncReport) -> Result<(), SyncError> {
    if ctx.identity_detection {
        for outcome in outcomes {
            for (column, max) in &outcome.identity_max {
                ctx.target
                    .set_identity(outcome.table, column, max + 1)
                    .await
                    .map_err(|e| table_error(outcome.table, e))?;
            }
        }
    }

    if ctx.sequence_detection {
        for name in &ctx.metadata.sequences {
            let sequence_error = |e: Error| SyncError::Table {
                table: format!("sequence {}", name),
                reason: e.to_string(),
            };
            let value = ctx.source.sequence_value(name).await.map_err(sequence_error)?;
            ctx.target.set_sequence_value(name, value).await.map_err(sequence_error)?;
            report.sequences += 1;
        }
    }
    Ok(())
}

fn table_error(table: &TableSchema, e: Error) -> SyncError {
    SyncError::Table {
        table: table.name.clone(),
        reason: e.to_string(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::database::{ColumnSchema, MemoryDatabase, Value};
    use crate::metadata::{MetadataCache, MetadataCacheKind};

    pub(crate) fn orders_schema() -> TableSchema {
        TableSchema::new(
            "orders",
            vec![ColumnSchema::new("id", "int"), ColumnSchema::new("item", "text")],
            &["id"],
        )
        .with_identity("id")
    }

    pub(crate) fn customers_schema() -> TableSchema {
        TableSchema::new(
            "customers",
            vec![ColumnSchema::new("id", "int"), ColumnSchema::new("name", "text")],
            &["id"],
        )
    }

    pub(crate) fn row(id: i64, text: &str) -> Vec<Value> {
        vec![Value::Int(id), Value::from(text)]
    }

    /// A source with two tables and a sequence, and an empty target with the same schema
    pub(crate) async fn pair() -> (MemoryDatabase, MemoryDatabase) {
        let source = MemoryDatabase::new("source");
        let target = MemoryDatabase::new("target");
        for db in [&source, &target] {
            db.create_table(orders_schema()).await;
            db.create_table(customers_schema()).await;
        }
        for i in 1..=20 {
            source.insert("orders", row(i, &format!("item-{}", i))).await.unwrap();
        }
        source.insert("customers", row(1, "alice")).await.unwrap();
        source.insert("customers", row(2, "bob")).await.unwrap();
        source.create_sequence("invoice_seq", 41).await;
        target.create_sequence("invoice_seq", 1).await;
        (source, target)
    }

    pub(crate) async fn run(
        strategy: SynchronizationStrategy,
        source: &MemoryDatabase,
        target: &MemoryDatabase,
    ) -> Result<SyncReport, SyncError> {
        let cache = MetadataCache::new(MetadataCacheKind::None, true, true);
        let metadata = cache.get("source", source).await.unwrap();
        let ctx = SyncContext {
            source_id: "source",
            source,
            target_id: "target",
            target,
            metadata: &metadata,
            identity_detection: true,
            sequence_detection: true,
        };
        strategy.synchronize(&ctx).await
    }

    #[test]
    fn test_resolve_catalog() {
        for strategy in SynchronizationStrategy::catalog() {
            assert_eq!(SynchronizationStrategy::resolve(strategy.id()).unwrap(), *strategy);
        }
        assert_eq!(SynchronizationStrategy::catalog().len(), 7);
        assert_eq!(
            SynchronizationStrategy::resolve("per-table-diff").unwrap(),
            SynchronizationStrategy::PerTable(TableStrategy::Differential)
        );
    }

    #[test]
    fn test_resolve_unknown() {
        assert_eq!(
            SynchronizationStrategy::resolve("rsync").unwrap_err(),
            ConfigError::UnknownStrategy("rsync".to_string())
        );
    }

    #[tokio::test]
    async fn test_every_strategy_converges() {
        for strategy in SynchronizationStrategy::catalog() {
            if *strategy == SynchronizationStrategy::Passive {
                continue;
            }
            let (source, target) = pair().await;
            target.insert("orders", row(99, "stale")).await.unwrap();

            let report = run(*strategy, &source, &target).await.unwrap();
            assert_eq!(report.strategy, strategy.id());
            assert_eq!(target.rows("orders").await.unwrap(), source.rows("orders").await.unwrap(), "{}", strategy);
            assert_eq!(target.rows("customers").await.unwrap(), source.rows("customers").await.unwrap(), "{}", strategy);
            assert_eq!(target.sequence_value("invoice_seq").await.unwrap(), 41, "{}", strategy);
            assert_eq!(target.identity_value("orders").await.unwrap(), 21, "{}", strategy);
        }
    }

    #[tokio::test]
    async fn test_passive_copies_nothing() {
        let (source, target) = pair().await;
        let report = run(SynchronizationStrategy::Passive, &source, &target).await.unwrap();
        assert_eq!(report.rows_changed(), 0);
        assert!(target.rows("orders").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_target() {
        let (source, target) = pair().await;
        target.set_available(false);
        let err = run(SynchronizationStrategy::Full, &source, &target).await.unwrap_err();
        assert!(matches!(err, SyncError::TargetUnavailable { .. }));

        // Passive still refuses an unreachable target
        let err = run(SynchronizationStrategy::Passive, &source, &target).await.unwrap_err();
        assert!(matches!(err, SyncError::TargetUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_unavailable_source() {
        let (source, target) = pair().await;
        source.set_available(false);
        let err = run(SynchronizationStrategy::Differential, &source, &target).await.unwrap_err();
        assert!(matches!(err, SyncError::SourceUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_full_aborts_at_first_failing_table() {
        let (source, target) = pair().await;
        // Tables are visited in name order: customers, orders
        target.set_table_failing("customers", true).await;

        let err = run(SynchronizationStrategy::Full, &source, &target).await.unwrap_err();
        match err {
            SyncError::Table { table, .. } => assert_eq!(table, "customers"),
            other => panic!("unexpected error: {}", other),
        }
        assert!(target.rows("orders").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_per_table_isolates_failures() {
        for strategy in ["per-table-full", "per-table-diff"] {
            let (source, target) = pair().await;
            target.set_table_failing("customers", true).await;

            let err = run(SynchronizationStrategy::resolve(strategy).unwrap(), &source, &target)
                .await
                .unwrap_err();
            match err {
                SyncError::PartialFailure { failed, synchronized } => {
                    assert_eq!(synchronized, 1);
                    assert_eq!(failed.len(), 1);
                    assert_eq!(failed[0].0, "customers");
                }
                other => panic!("unexpected error: {}", other),
            }

            // The healthy table was synchronized despite the failure
            assert_eq!(target.rows("orders").await.unwrap(), source.rows("orders").await.unwrap());

            target.set_table_failing("customers", false).await;
            run(SynchronizationStrategy::resolve(strategy).unwrap(), &source, &target)
                .await
                .unwrap();
            assert_eq!(target.rows("customers").await.unwrap(), source.rows("customers").await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_detection_disabled() {
        let (source, target) = pair().await;
        let metadata = MetadataCache::new(MetadataCacheKind::None, false, false)
            .get("source", &source)
            .await
            .unwrap();
        let ctx = SyncContext {
            source_id: "source",
            source: &source,
            target_id: "target",
            target: &target,
            metadata: &metadata,
            identity_detection: false,
            sequence_detection: false,
        };
        let report = SynchronizationStrategy::Full.synchronize(&ctx).await.unwrap();
        assert_eq!(report.sequences, 0);
        assert_eq!(target.sequence_value("invoice_seq").await.unwrap(), 1);
    }

    #[test]
    fn test_identity_max() {
        let table = orders_schema();
        let rows = vec![row(3, "a"), row(17, "b"), vec![Value::Null, Value::from("c")]];
        assert_eq!(identity_max(&table, rows.iter()), vec![("id".to_string(), 17)]);
        assert!(identity_max(&table, std::iter::empty()).is_empty());
        assert!(identity_max(&customers_schema(), rows.iter()).is_empty());
    }
}
