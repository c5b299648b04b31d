//! Differential synchronization
//!
//! Rows are matched by primary key and compared by SHA-1 fingerprint. The
//! fast variant first groups rows into buckets by key and compares a row
//! count and a sum of fingerprints per bucket, so only buckets that differ
//! are compared row by row. Tables without a primary key are compared as
//! multisets of whole rows.

use std::collections::BTreeMap;

use super::{identity_max, SyncContext, TableOutcome};
use crate::database::{fingerprint, Row, RowChange, RowKey, TableSchema, IMPORT_BATCH_SIZE};
use crate::error::Result;

/// Buckets per table used by the fast variant
pub const BUCKET_COUNT: usize = 64;

/// Changes that turn the `target` rows into the `source` rows: deletes
/// first, then updates, then inserts.
pub fn diff_rows<'r>(
    table: &TableSchema,
    source: impl IntoIterator<Item = &'r Row>,
    target: impl IntoIterator<Item = &'r Row>,
) -> Vec<RowChange> {
    if !table.has_primary_key() {
        return diff_multiset(source, target);
    }

    let mut existing: BTreeMap<RowKey, [u8; 20]> = target
        .into_iter()
        .map(|row| (table.key_of(row), fingerprint(row)))
        .collect();

    let mut updates = Vec::new();
    let mut inserts = Vec::new();
    for row in source {
        match existing.remove(&table.key_of(row)) {
            None => inserts.push(RowChange::Insert(row.clone())),
            Some(digest) if digest != fingerprint(row) => updates.push(RowChange::Update(row.clone())),
            Some(_) => {}
        }
    }

    let mut changes: Vec<RowChange> = existing.into_keys().map(RowChange::Delete).collect();
    changes.extend(updates);
    changes.extend(inserts);
    changes
}

/// One delete per surplus copy on the target, one insert per missing copy
fn diff_multiset<'r>(
    source: impl IntoIterator<Item = &'r Row>,
    target: impl IntoIterator<Item = &'r Row>,
) -> Vec<RowChange> {
    let mut balance: BTreeMap<&'r Row, i64> = BTreeMap::new();
    for row in target {
        *balance.entry(row).or_default() -= 1;
    }
    for row in source {
        *balance.entry(row).or_default() += 1;
    }

    let mut deletes = Vec::new();
    let mut inserts = Vec::new();
    for (row, count) in balance {
        for _ in 0..count.unsigned_abs() {
            if count < 0 {
                deletes.push(RowChange::Delete(row.clone()));
            } else {
                inserts.push(RowChange::Insert(row.clone()));
            }
        }
    }
    deletes.extend(inserts);
    deletes
}

pub(super) async fn sync_table<'m>(ctx: &SyncContext<'_>, table: &'m TableSchema) -> Result<TableOutcome<'m>> {
    let source_rows = ctx.source.scan(table).await?;
    let target_rows = ctx.target.scan(table).await?;

    let changes = diff_rows(table, &source_rows, &target_rows);
    let mut outcome = TableOutcome::new(table);
    outcome.identity_max = identity_max(table, source_rows.iter());
    apply_changes(ctx, table, &changes, &mut outcome).await?;
    Ok(outcome)
}

pub(super) async fn sync_table_bucketed<'m>(ctx: &SyncContext<'_>, table: &'m TableSchema) -> Result<TableOutcome<'m>> {
    let source_rows = ctx.source.scan(table).await?;
    let target_rows = ctx.target.scan(table).await?;

    let source_buckets = buckets(table, &source_rows);
    let target_buckets = buckets(table, &target_rows);

    let mut changes = Vec::new();
    let mut mismatched = 0;
    for (source, target) in source_buckets.iter().zip(&target_buckets) {
        if !source.matches(target) {
            mismatched += 1;
            changes.extend(diff_rows(table, source.rows.iter().copied(), target.rows.iter().copied()));
        }
    }
    tracing::debug!("{}: {} of {} buckets differ on {}", table.name, mismatched, BUCKET_COUNT, ctx.target_id);

    let mut outcome = TableOutcome::new(table);
    outcome.identity_max = identity_max(table, source_rows.iter());
    apply_changes(ctx, table, &changes, &mut outcome).await?;
    Ok(outcome)
}

async fn apply_changes(
    ctx: &SyncContext<'_>,
    table: &TableSchema,
    changes: &[RowChange],
    outcome: &mut TableOutcome<'_>,
) -> Result<()> {
    for batch in changes.chunks(IMPORT_BATCH_SIZE) {
        ctx.target.apply(table, batch).await?;
    }

    for change in changes {
        match change {
            RowChange::Insert(_) => outcome.inserted += 1,
            RowChange::Update(_) => outcome.updated += 1,
            RowChange::Delete(_) => outcome.deleted += 1,
        }
    }
    if !changes.is_empty() {
        tracing::debug!("Applied {} changes to {} on {}", changes.len(), table.name, ctx.target_id);
    }
    Ok(())
}

struct Bucket<'r> {
    /// Wrapping sum of row fingerprints; identical rows add up, never cancel
    sum: u128,
    rows: Vec<&'r Row>,
}

impl Bucket<'_> {
    fn matches(&self, other: &Bucket<'_>) -> bool {
        self.rows.len() == other.rows.len() && self.sum == other.sum
    }
}

fn bucket_of(table: &TableSchema, row: &Row) -> usize {
    let digest = fingerprint(&table.key_of(row));
    u16::from_be_bytes([digest[0], digest[1]]) as usize % BUCKET_COUNT
}

fn buckets<'r>(table: &TableSchema, rows: &'r [Row]) -> Vec<Bucket<'r>> {
    let mut buckets: Vec<Bucket<'r>> = (0..BUCKET_COUNT)
        .map(|_| Bucket {
            sum: 0,
            rows: Vec::new(),
        })
        .collect();

    for row in rows {
        let digest = fingerprint(row);
        let mut head = [0u8; 16];
        head.copy_from_slice(&digest[..16]);

        let bucket = &mut buckets[bucket_of(table, row)];
        bucket.sum = bucket.sum.wrapping_add(u128::from_le_bytes(head));
        bucket.rows.push(row);
    }
    buckets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{ColumnSchema, Database, MemoryDatabase, Value};
    use crate::sync::tests::{orders_schema, pair, row, run};
    use crate::sync::SynchronizationStrategy;

    #[test]
    fn test_diff_rows() {
        let table = orders_schema();
        let source = vec![row(1, "a"), row(2, "b-changed"), row(4, "d")];
        let target = vec![row(1, "a"), row(2, "b"), row(3, "c")];

        let changes = diff_rows(&table, &source, &target);
        assert_eq!(
            changes,
            vec![
                RowChange::Delete(vec![Value::Int(3)]),
                RowChange::Update(row(2, "b-changed")),
                RowChange::Insert(row(4, "d")),
            ]
        );
    }

    #[test]
    fn test_diff_identical_is_empty() {
        let table = orders_schema();
        let rows: Vec<Row> = (1..100).map(|i| row(i, "x")).collect();
        assert!(diff_rows(&table, &rows, &rows).is_empty());
    }

    #[test]
    fn test_bucket_digest_ignores_row_order() {
        let table = orders_schema();
        let rows: Vec<Row> = (1..50).map(|i| row(i, "x")).collect();
        let reversed: Vec<Row> = rows.iter().rev().cloned().collect();

        let a = buckets(&table, &rows);
        let b = buckets(&table, &reversed);
        assert!(a.iter().zip(&b).all(|(a, b)| a.matches(b)));
        assert_eq!(a.iter().map(|b| b.rows.len()).sum::<usize>(), 49);
    }

    fn audit_log() -> TableSchema {
        TableSchema::new(
            "audit_log",
            vec![ColumnSchema::new("event", "text"), ColumnSchema::new("n", "int")],
            &[],
        )
    }

    fn entry(event: &str) -> Row {
        vec![Value::from(event), Value::Int(1)]
    }

    #[test]
    fn test_duplicate_rows_do_not_cancel() {
        let log = audit_log();
        let twice = vec![entry("login"), entry("login")];

        let full = buckets(&log, &twice);
        let empty = buckets(&log, &[]);
        assert!(!full.iter().zip(&empty).all(|(a, b)| a.matches(b)));
    }

    #[test]
    fn test_diff_keyless_counts_copies() {
        let log = audit_log();

        // Surplus copy on the target
        let changes = diff_rows(&log, &vec![entry("login")], &vec![entry("login"), entry("login")]);
        assert_eq!(changes, vec![RowChange::Delete(entry("login"))]);

        // Missing copies on the target
        let source = vec![entry("login"), entry("login"), entry("logout")];
        let changes = diff_rows(&log, &source, &vec![entry("logout"), entry("stale")]);
        assert_eq!(
            changes,
            vec![
                RowChange::Delete(entry("stale")),
                RowChange::Insert(entry("login")),
                RowChange::Insert(entry("login")),
            ]
        );

        assert!(diff_rows(&log, &source, &source).is_empty());
    }

    #[tokio::test]
    async fn test_keyless_duplicates_converge() {
        for strategy in [SynchronizationStrategy::Differential, SynchronizationStrategy::FastDifferential] {
            let source = MemoryDatabase::new("source");
            let target = MemoryDatabase::new("target");
            for db in [&source, &target] {
                db.create_table(audit_log()).await;
            }
            for _ in 0..3 {
                source.insert("audit_log", entry("login")).await.unwrap();
            }
            target.insert("audit_log", entry("logout")).await.unwrap();
            target.insert("audit_log", entry("logout")).await.unwrap();

            let report = run(strategy, &source, &target).await.unwrap();
            assert_eq!(target.rows("audit_log").await.unwrap(), source.rows("audit_log").await.unwrap(), "{}", strategy);
            assert_eq!((report.inserted, report.deleted), (3, 2), "{}", strategy);

            // The opposite drift: one copy too many
            target.insert("audit_log", entry("login")).await.unwrap();
            let report = run(strategy, &source, &target).await.unwrap();
            assert_eq!(report.deleted, 1, "{}", strategy);
            assert_eq!(target.rows("audit_log").await.unwrap().len(), 3, "{}", strategy);
        }
    }

    #[tokio::test]
    async fn test_differential_idempotent() {
        for strategy in [SynchronizationStrategy::Differential, SynchronizationStrategy::FastDifferential] {
            let (source, target) = pair().await;
            run(strategy, &source, &target).await.unwrap();
            let before = target.export().await.unwrap();

            let report = run(strategy, &source, &target).await.unwrap();
            assert_eq!(report.rows_changed(), 0, "{}", strategy);
            assert_eq!(report.tables, 2);
            assert_eq!(target.export().await.unwrap(), before);
        }
    }

    #[tokio::test]
    async fn test_fast_differential_matches_differential() {
        let mut reports = Vec::new();
        for strategy in [SynchronizationStrategy::Differential, SynchronizationStrategy::FastDifferential] {
            let (source, target) = pair().await;
            run(strategy, &source, &target).await.unwrap();

            // Drift: one update, one delete, one insert on the target
            let orders = orders_schema();
            target
                .apply(&orders, &[
                    RowChange::Update(row(5, "drifted")),
                    RowChange::Delete(vec![Value::Int(6)]),
                    RowChange::Insert(row(77, "extra")),
                ])
                .await
                .unwrap();

            let report = run(strategy, &source, &target).await.unwrap();
            assert_eq!(target.rows("orders").await.unwrap(), source.rows("orders").await.unwrap());
            reports.push((report.inserted, report.updated, report.deleted));
        }
        assert_eq!(reports[0], (1, 1, 1));
        assert_eq!(reports[0], reports[1]);
    }
}
