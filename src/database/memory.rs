//! In-Process Database
//!
//! A table store living in the driver's own process, addressed with `mem:`
//! locations. Used for embedded clusters and for exercising the driver
//! without a running MariaDB server.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{table_not_found, Database, Row, RowChange, RowKey, Snapshot, TableSchema, TableSnapshot, Value};
use crate::error::{Error, Result};

/// Rows grouped by key. Keyed tables hold one row per key; tables without
/// a primary key may hold several identical rows.
type RowSet = BTreeMap<RowKey, Vec<Row>>;

struct MemoryTable {
    schema: TableSchema,
    rows: RowSet,
    next_identity: i64,
}

impl MemoryTable {
    fn new(schema: TableSchema) -> Self {
        Self {
            schema,
            rows: BTreeMap::new(),
            next_identity: 1,
        }
    }

    fn assign_identity(&mut self, row: Row) -> Row {
        assign_identity(&self.schema, &mut self.next_identity, row)
    }

    fn all_rows(&self) -> Vec<Row> {
        self.rows.values().flatten().cloned().collect()
    }

    fn row_count(&self) -> usize {
        self.rows.values().map(Vec::len).sum()
    }
}

fn insert_row(schema: &TableSchema, rows: &mut RowSet, row: Row) -> Result<()> {
    let key = schema.key_of(&row);
    let copies = rows.entry(key).or_default();
    if schema.has_primary_key() && !copies.is_empty() {
        return Err(Error::DuplicateKey {
            table: schema.name.clone(),
            key: format_key(&schema.key_of(&row)),
        });
    }
    copies.push(row);
    Ok(())
}

/// Remove one row with the given key
fn delete_row(rows: &mut RowSet, key: &RowKey) -> bool {
    let Some(copies) = rows.get_mut(key) else {
        return false;
    };
    copies.pop();
    if copies.is_empty() {
        rows.remove(key);
    }
    true
}

/// Fill NULL identity columns and advance the identity counter
fn assign_identity(schema: &TableSchema, next_identity: &mut i64, mut row: Row) -> Row {
    for column in &schema.identity_columns {
        if let Some(idx) = schema.column_index(column) {
            match row.get(idx).and_then(Value::as_i64) {
                Some(v) => *next_identity = (*next_identity).max(v + 1),
                None if idx < row.len() => {
                    row[idx] = Value::Int(*next_identity);
                    *next_identity += 1;
                }
                None => {}
            }
        }
    }
    row
}

#[derive(Default)]
struct MemoryStore {
    tables: BTreeMap<String, MemoryTable>,
    sequences: BTreeMap<String, i64>,
    failing_tables: HashSet<String>,
}

impl MemoryStore {
    fn table(&self, name: &str) -> Result<&MemoryTable> {
        if self.failing_tables.contains(name) {
            return Err(Error::QueryExecution(format!("table {} is failing", name)));
        }
        self.tables.get(name).ok_or_else(|| table_not_found(name))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut MemoryTable> {
        if self.failing_tables.contains(name) {
            return Err(Error::QueryExecution(format!("table {} is failing", name)));
        }
        self.tables.get_mut(name).ok_or_else(|| table_not_found(name))
    }
}

/// In-process database
pub struct MemoryDatabase {
    name: String,
    store: RwLock<MemoryStore>,
    available: AtomicBool,
}

impl MemoryDatabase {
    /// Create an empty database
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            store: RwLock::new(MemoryStore::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Database name (the part after `mem:`)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mark the database reachable or unreachable
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make every access to one table fail, or clear that failure
    pub async fn set_table_failing(&self, table: &str, failing: bool) {
        let mut store = self.store.write().await;
        if failing {
            store.failing_tables.insert(table.to_string());
        } else {
            store.failing_tables.remove(table);
        }
    }

    /// Create a table, replacing any existing one with the same name
    pub async fn create_table(&self, schema: TableSchema) {
        let mut store = self.store.write().await;
        store.tables.insert(schema.name.clone(), MemoryTable::new(schema));
    }

    /// Create a sequence
    pub async fn create_sequence(&self, name: &str, value: i64) {
        self.store.write().await.sequences.insert(name.to_string(), value);
    }

    /// Insert a row directly, bypassing the cluster
    pub async fn insert(&self, table: &str, row: Row) -> Result<()> {
        self.apply_named(table, &[RowChange::Insert(row)]).await.map(|_| ())
    }

    /// Rows of a table, ordered by key
    pub async fn rows(&self, table: &str) -> Result<Vec<Row>> {
        let store = self.store.read().await;
        Ok(store.table(table)?.all_rows())
    }

    /// Next value the identity column of a table will hand out
    pub async fn identity_value(&self, table: &str) -> Result<i64> {
        Ok(self.store.read().await.table(table)?.next_identity)
    }

    async fn apply_named(&self, table: &str, changes: &[RowChange]) -> Result<u64> {
        self.check_available()?;
        let mut store = self.store.write().await;
        let table = store.table_mut(table)?;

        // Stage against a copy so the batch is all-or-nothing
        let mut rows = table.rows.clone();
        let mut next_identity = table.next_identity;
        let mut affected = 0;

        for change in changes {
            match change {
                RowChange::Insert(row) => {
                    let row = assign_identity(&table.schema, &mut next_identity, row.clone());
                    insert_row(&table.schema, &mut rows, row)?;
                    affected += 1;
                }
                RowChange::Update(row) => {
                    let key = table.schema.key_of(row);
                    if let Some(existing) = rows.get_mut(&key).and_then(|copies| copies.first_mut()) {
                        *existing = row.clone();
                        affected += 1;
                    }
                }
                RowChange::Delete(key) => {
                    if delete_row(&mut rows, key) {
                        affected += 1;
                    }
                }
            }
        }

        table.rows = rows;
        table.next_identity = next_identity;
        Ok(affected)
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Unavailable(format!("mem:{}", self.name)))
        }
    }
}

fn format_key(key: &RowKey) -> String {
    let parts: Vec<String> = key.iter().map(|v| v.to_string()).collect();
    format!("({})", parts.join(", "))
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn ping(&self) -> Result<()> {
        self.check_available()
    }

    async fn tables(&self) -> Result<Vec<TableSchema>> {
        self.check_available()?;
        let store = self.store.read().await;
        Ok(store.tables.values().map(|t| t.schema.clone()).collect())
    }

    async fn sequences(&self) -> Result<Vec<String>> {
        self.check_available()?;
        Ok(self.store.read().await.sequences.keys().cloned().collect())
    }

    async fn sequence_value(&self, name: &str) -> Result<i64> {
        self.check_available()?;
        self.store
            .read()
            .await
            .sequences
            .get(name)
            .copied()
            .ok_or_else(|| Error::QueryExecution(format!("unknown sequence {}", name)))
    }

    async fn set_sequence_value(&self, name: &str, value: i64) -> Result<()> {
        self.check_available()?;
        self.store.write().await.sequences.insert(name.to_string(), value);
        Ok(())
    }

    async fn set_identity(&self, table: &TableSchema, _column: &str, next: i64) -> Result<()> {
        self.check_available()?;
        let mut store = self.store.write().await;
        store.table_mut(&table.name)?.next_identity = next;
        Ok(())
    }

    async fn scan(&self, table: &TableSchema) -> Result<Vec<Row>> {
        self.check_available()?;
        self.rows(&table.name).await
    }

    async fn apply(&self, table: &TableSchema, changes: &[RowChange]) -> Result<u64> {
        self.apply_named(&table.name, changes).await
    }

    async fn truncate(&self, table: &TableSchema) -> Result<u64> {
        self.check_available()?;
        let mut store = self.store.write().await;
        let table = store.table_mut(&table.name)?;
        let removed = table.row_count() as u64;
        table.rows.clear();
        Ok(removed)
    }

    async fn export(&self) -> Result<Snapshot> {
        self.check_available()?;
        // One read lock for a consistent snapshot
        let store = self.store.read().await;
        if let Some(failing) = store.failing_tables.iter().next() {
            return Err(Error::QueryExecution(format!("table {} is failing", failing)));
        }
        Ok(Snapshot {
            tables: store
                .tables
                .values()
                .map(|t| TableSnapshot {
                    schema: t.schema.clone(),
                    rows: t.all_rows(),
                })
                .collect(),
            sequences: store.sequences.iter().map(|(k, v)| (k.clone(), *v)).collect(),
        })
    }

    async fn import(&self, snapshot: &Snapshot) -> Result<()> {
        self.check_available()?;
        let mut store = self.store.write().await;
        if let Some(failing) = store.failing_tables.iter().next() {
            return Err(Error::QueryExecution(format!("table {} is failing", failing)));
        }

        // Rebuild every table before swapping any in
        let mut restored_tables = Vec::with_capacity(snapshot.tables.len());
        for table in &snapshot.tables {
            let mut restored = MemoryTable::new(table.schema.clone());
            for row in &table.rows {
                let row = restored.assign_identity(row.clone());
                insert_row(&table.schema, &mut restored.rows, row)?;
            }
            restored_tables.push(restored);
        }
        for restored in restored_tables {
            store.tables.insert(restored.schema.name.clone(), restored);
        }
        for (name, value) in &snapshot.sequences {
            store.sequences.insert(name.clone(), *value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::ColumnSchema;

    fn users() -> TableSchema {
        TableSchema::new(
            "users",
            vec![ColumnSchema::new("id", "int"), ColumnSchema::new("name", "text")],
            &["id"],
        )
        .with_identity("id")
    }

    #[tokio::test]
    async fn test_insert_and_scan() {
        let db = MemoryDatabase::new("test");
        db.create_table(users()).await;

        db.insert("users", vec![Value::Int(2), Value::from("Bob")]).await.unwrap();
        db.insert("users", vec![Value::Int(1), Value::from("Alice")]).await.unwrap();

        let rows = db.scan(&users()).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][1], Value::from("Alice"));
        assert_eq!(db.identity_value("users").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_identity_assignment() {
        let db = MemoryDatabase::new("test");
        db.create_table(users()).await;

        db.insert("users", vec![Value::Null, Value::from("Alice")]).await.unwrap();
        db.insert("users", vec![Value::Null, Value::from("Bob")]).await.unwrap();

        let rows = db.rows("users").await.unwrap();
        assert_eq!(rows[0][0], Value::Int(1));
        assert_eq!(rows[1][0], Value::Int(2));
    }

    #[tokio::test]
    async fn test_batch_is_atomic() {
        let db = MemoryDatabase::new("test");
        db.create_table(users()).await;
        db.insert("users", vec![Value::Int(1), Value::from("Alice")]).await.unwrap();

        let result = db
            .apply(
                &users(),
                &[
                    RowChange::Insert(vec![Value::Int(2), Value::from("Bob")]),
                    RowChange::Insert(vec![Value::Int(1), Value::from("Dup")]),
                ],
            )
            .await;
        assert!(matches!(result, Err(Error::DuplicateKey { .. })));
        assert_eq!(db.rows("users").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let db = MemoryDatabase::new("test");
        db.create_table(users()).await;
        db.insert("users", vec![Value::Int(1), Value::from("Alice")]).await.unwrap();

        let affected = db
            .apply(
                &users(),
                &[
                    RowChange::Update(vec![Value::Int(1), Value::from("Alicia")]),
                    RowChange::Update(vec![Value::Int(9), Value::from("Nobody")]),
                ],
            )
            .await
            .unwrap();
        assert_eq!(affected, 1);
        assert_eq!(db.rows("users").await.unwrap()[0][1], Value::from("Alicia"));

        db.apply(&users(), &[RowChange::Delete(vec![Value::Int(1)])]).await.unwrap();
        assert!(db.rows("users").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_keyless_table_keeps_duplicates() {
        let log = TableSchema::new(
            "audit_log",
            vec![ColumnSchema::new("event", "text"), ColumnSchema::new("n", "int")],
            &[],
        );
        let db = MemoryDatabase::new("test");
        db.create_table(log.clone()).await;

        let entry = vec![Value::from("login"), Value::Int(1)];
        db.insert("audit_log", entry.clone()).await.unwrap();
        db.insert("audit_log", entry.clone()).await.unwrap();
        assert_eq!(db.rows("audit_log").await.unwrap(), vec![entry.clone(), entry.clone()]);

        // A delete removes a single copy
        let affected = db.apply(&log, &[RowChange::Delete(entry.clone())]).await.unwrap();
        assert_eq!(affected, 1);
        assert_eq!(db.rows("audit_log").await.unwrap(), vec![entry]);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let db = MemoryDatabase::new("test");
        db.create_table(users()).await;
        db.set_available(false);

        assert!(matches!(db.ping().await, Err(Error::Unavailable(_))));
        assert!(db.scan(&users()).await.is_err());

        db.set_available(true);
        assert!(db.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_export_import() {
        let source = MemoryDatabase::new("source");
        source.create_table(users()).await;
        source.create_sequence("order_seq", 17).await;
        source.insert("users", vec![Value::Int(1), Value::from("Alice")]).await.unwrap();

        let target = MemoryDatabase::new("target");
        target.create_table(users()).await;
        target.insert("users", vec![Value::Int(5), Value::from("Stale")]).await.unwrap();

        let snapshot = source.export().await.unwrap();
        target.import(&snapshot).await.unwrap();

        assert_eq!(target.rows("users").await.unwrap(), source.rows("users").await.unwrap());
        assert_eq!(target.sequence_value("order_seq").await.unwrap(), 17);
    }
}
