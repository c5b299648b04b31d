//! Full copy and dump/restore synchronization

use super::{identity_max, SyncContext, SyncReport, TableOutcome};
use crate::database::{RowChange, Snapshot, TableSchema, IMPORT_BATCH_SIZE};
use crate::error::{Result, SyncError};

/// Truncate the target table and copy every source row in batches
pub(super) async fn copy_table<'m>(ctx: &SyncContext<'_>, table: &'m TableSchema) -> Result<TableOutcome<'m>> {
    let rows = ctx.source.scan(table).await?;
    let mut outcome = TableOutcome::new(table);
    outcome.identity_max = identity_max(table, rows.iter());

    outcome.deleted = ctx.target.truncate(table).await?;
    for batch in rows.chunks(IMPORT_BATCH_SIZE) {
        let inserts: Vec<RowChange> = batch.iter().cloned().map(RowChange::Insert).collect();
        outcome.inserted += ctx.target.apply(table, &inserts).await?;
    }

    tracing::debug!("Copied {} rows of {} into {}", outcome.inserted, table.name, ctx.target_id);
    Ok(outcome)
}

/// Export the whole source through the snapshot codec and import it into the target
pub(super) async fn dump_restore(ctx: &SyncContext<'_>, report: &mut SyncReport) -> std::result::Result<(), SyncError> {
    let export_error = |reason: String| SyncError::Export {
        database: ctx.source_id.to_string(),
        reason,
    };
    let import_error = |reason: String| SyncError::Import {
        database: ctx.target_id.to_string(),
        reason,
    };

    let snapshot = ctx.source.export().await.map_err(|e| export_error(e.to_string()))?;
    let dump = snapshot.encode().map_err(|e| export_error(e.to_string()))?;
    tracing::debug!("Exported {} tables ({} rows, {} bytes) from {}",
        snapshot.tables.len(), snapshot.row_count(), dump.len(), ctx.source_id);

    let restored = Snapshot::decode(&dump).map_err(|e| import_error(e.to_string()))?;
    ctx.target.import(&restored).await.map_err(|e| import_error(e.to_string()))?;

    report.tables = restored.tables.len();
    report.inserted = restored.row_count() as u64;
    report.sequences = restored.sequences.len();
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::database::IMPORT_BATCH_SIZE;
    use crate::error::SyncError;
    use crate::sync::tests::{pair, row, run};
    use crate::sync::SynchronizationStrategy;

    #[tokio::test]
    async fn test_full_copy_replaces_target_rows() {
        let (source, target) = pair().await;
        target.insert("orders", row(500, "only on target")).await.unwrap();

        let report = run(SynchronizationStrategy::Full, &source, &target).await.unwrap();
        assert_eq!(report.tables, 2);
        assert_eq!(report.inserted, 22);
        assert_eq!(report.deleted, 1);
        assert_eq!(report.sequences, 1);
    }

    #[tokio::test]
    async fn test_full_copy_batches_large_tables() {
        let (source, target) = pair().await;
        let total = IMPORT_BATCH_SIZE as i64 * 2 + 7;
        for i in 21..=total {
            source.insert("orders", row(i, "bulk")).await.unwrap();
        }

        let report = run(SynchronizationStrategy::Full, &source, &target).await.unwrap();
        assert_eq!(target.rows("orders").await.unwrap().len() as i64, total);
        assert_eq!(report.inserted, total as u64 + 2);
    }

    #[tokio::test]
    async fn test_dump_restore() {
        let (source, target) = pair().await;
        let report = run(SynchronizationStrategy::DumpRestore, &source, &target).await.unwrap();
        assert_eq!(report.tables, 2);
        assert_eq!(report.inserted, 22);
        assert_eq!(report.sequences, 1);
        assert_eq!(target.rows("customers").await.unwrap(), source.rows("customers").await.unwrap());
    }

    #[tokio::test]
    async fn test_dump_restore_export_failure() {
        let (source, target) = pair().await;
        source.set_table_failing("orders", true).await;
        let err = run(SynchronizationStrategy::DumpRestore, &source, &target).await.unwrap_err();
        assert!(matches!(err, SyncError::Export { .. }));
    }
}
