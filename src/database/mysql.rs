//! MariaDB / MySQL Backend
//!
//! Reaches a member database over sqlx. Values are read back as integers,
//! bytes or text so every member produces the same canonical rows, which
//! keeps fingerprints comparable across servers.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions, MySqlRow};
use sqlx::{MySqlPool, Row as _};

use super::{ColumnSchema, Database, DatabaseDescriptor, Row, RowChange, RowKey, TableSchema, Value};
use crate::error::{Error, Result};

/// Connection pool size per member
const POOL_SIZE: u32 = 8;

/// Connection acquire timeout
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// MariaDB / MySQL member database
pub struct MySqlDatabase {
    id: String,
    pool: MySqlPool,
}

impl MySqlDatabase {
    /// Create a lazily-connected pool for a member. No I/O happens until the
    /// first query.
    pub fn connect_lazy(descriptor: &DatabaseDescriptor) -> Result<Self> {
        let location = descriptor.location.replacen("mariadb://", "mysql://", 1);
        let mut options = MySqlConnectOptions::from_str(&location)?;
        if let Some(user) = &descriptor.user {
            options = options.username(user);
        }
        if let Some(password) = &descriptor.password {
            options = options.password(password);
        }

        let pool = MySqlPoolOptions::new()
            .max_connections(POOL_SIZE)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_lazy_with(options);

        Ok(Self {
            id: descriptor.id.clone(),
            pool,
        })
    }

    /// Member id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Close the connection pool
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl Database for MySqlDatabase {
    async fn ping(&self) -> Result<()> {
        let result: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        if result.0 == 1 {
            Ok(())
        } else {
            Err(Error::Unavailable(self.id.clone()))
        }
    }

    async fn tables(&self) -> Result<Vec<TableSchema>> {
        let rows = sqlx::query(
            r#"
            SELECT c.TABLE_NAME, c.COLUMN_NAME, c.COLUMN_TYPE, c.IS_NULLABLE, c.COLUMN_KEY, c.EXTRA
            FROM information_schema.COLUMNS c
            JOIN information_schema.TABLES t
                ON t.TABLE_SCHEMA = c.TABLE_SCHEMA AND t.TABLE_NAME = c.TABLE_NAME
            WHERE c.TABLE_SCHEMA = DATABASE() AND t.TABLE_TYPE = 'BASE TABLE'
            ORDER BY c.TABLE_NAME, c.ORDINAL_POSITION
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut tables: Vec<TableSchema> = Vec::new();
        for row in rows {
            let table: String = row.try_get(0)?;
            let column: String = row.try_get(1)?;
            let data_type: String = row.try_get(2)?;
            let nullable: String = row.try_get(3)?;
            let key: String = row.try_get(4)?;
            let extra: String = row.try_get(5)?;

            if tables.last().map(|t| t.name != table).unwrap_or(true) {
                tables.push(TableSchema::new(table, Vec::new(), &[]));
            }
            if let Some(schema) = tables.last_mut() {
                if key == "PRI" {
                    schema.primary_key.push(column.clone());
                }
                if extra.contains("auto_increment") {
                    schema.identity_columns.push(column.clone());
                }
                schema.columns.push(ColumnSchema {
                    name: column,
                    data_type,
                    nullable: nullable == "YES",
                });
            }
        }

        Ok(tables)
    }

    async fn sequences(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT TABLE_NAME FROM information_schema.TABLES \
             WHERE TABLE_SCHEMA = DATABASE() AND TABLE_TYPE = 'SEQUENCE'",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .filter_map(|row| row.try_get::<String, _>(0).ok())
            .collect())
    }

    async fn sequence_value(&self, name: &str) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(&format!(
            "SELECT CAST(next_not_cached_value AS SIGNED) FROM {}",
            quote_ident(name)
        ))
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    async fn set_sequence_value(&self, name: &str, value: i64) -> Result<()> {
        sqlx::query(&format!("SELECT SETVAL({}, {}, 0)", quote_ident(name), value))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_identity(&self, table: &TableSchema, _column: &str, next: i64) -> Result<()> {
        sqlx::query(&format!("ALTER TABLE {} AUTO_INCREMENT = {}", quote_ident(&table.name), next))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn scan(&self, table: &TableSchema) -> Result<Vec<Row>> {
        let kinds: Vec<ColumnKind> = table
            .columns
            .iter()
            .map(|c| ColumnKind::of(&c.data_type))
            .collect();

        let rows = sqlx::query(&select_sql(table))
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| decode_row(row, &kinds))
            .collect()
    }

    async fn apply(&self, table: &TableSchema, changes: &[RowChange]) -> Result<u64> {
        if changes.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query("SET FOREIGN_KEY_CHECKS = 0").execute(&mut *tx).await?;

        let mut affected = 0;
        for change in changes {
            let sql = change_sql(table, change);
            let result = sqlx::query(&sql)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    Error::QueryExecution(format!("Failed to execute '{}...': {}", preview(&sql), e))
                })?;
            affected += result.rows_affected();
        }

        sqlx::query("SET FOREIGN_KEY_CHECKS = 1").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(affected)
    }

    async fn truncate(&self, table: &TableSchema) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET FOREIGN_KEY_CHECKS = 0").execute(&mut *tx).await?;
        let result = sqlx::query(&format!("DELETE FROM {}", quote_ident(&table.name)))
            .execute(&mut *tx)
            .await?;
        sqlx::query("SET FOREIGN_KEY_CHECKS = 1").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }
}

/// How a column is projected and decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Signed,
    Unsigned,
    Binary,
    Text,
}

impl ColumnKind {
    /// Classify a `COLUMN_TYPE` such as `bigint(20) unsigned` or `varbinary(16)`
    fn of(column_type: &str) -> Self {
        let lower = column_type.to_ascii_lowercase();
        let base = lower.split(['(', ' ']).next().unwrap_or("");
        match base {
            "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint" | "bit" | "year" => {
                if lower.contains("unsigned") || base == "bit" {
                    ColumnKind::Unsigned
                } else {
                    ColumnKind::Signed
                }
            }
            "binary" | "varbinary" | "tinyblob" | "blob" | "mediumblob" | "longblob" => ColumnKind::Binary,
            _ => ColumnKind::Text,
        }
    }

    fn projection(&self, column: &str) -> String {
        let ident = quote_ident(column);
        match self {
            ColumnKind::Signed => format!("CAST({} AS SIGNED)", ident),
            ColumnKind::Unsigned => format!("CAST({} AS UNSIGNED)", ident),
            ColumnKind::Binary => ident,
            ColumnKind::Text => format!("CAST({} AS CHAR)", ident),
        }
    }
}

fn decode_row(row: &MySqlRow, kinds: &[ColumnKind]) -> Result<Row> {
    kinds
        .iter()
        .enumerate()
        .map(|(i, kind)| {
            let value = match kind {
                ColumnKind::Signed => row.try_get::<Option<i64>, _>(i)?.map(Value::Int),
                ColumnKind::Unsigned => row.try_get::<Option<u64>, _>(i)?.map(Value::UInt),
                ColumnKind::Binary => row.try_get::<Option<Vec<u8>>, _>(i)?.map(Value::Bytes),
                ColumnKind::Text => row.try_get::<Option<String>, _>(i)?.map(Value::String),
            };
            Ok(value.unwrap_or(Value::Null))
        })
        .collect()
}

/// Quote an identifier with backticks
fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

fn select_sql(table: &TableSchema) -> String {
    let columns: Vec<String> = table
        .columns
        .iter()
        .map(|c| ColumnKind::of(&c.data_type).projection(&c.name))
        .collect();
    format!("SELECT {} FROM {}", columns.join(", "), quote_ident(&table.name))
}

fn where_clause(table: &TableSchema, key: &RowKey) -> String {
    let clauses: Vec<String> = table
        .key_columns()
        .iter()
        .zip(key.iter())
        .map(|(col, val)| match val {
            Value::Null => format!("{} IS NULL", quote_ident(col)),
            _ => format!("{} = {}", quote_ident(col), val.to_sql()),
        })
        .collect();
    clauses.join(" AND ")
}

fn change_sql(table: &TableSchema, change: &RowChange) -> String {
    match change {
        RowChange::Insert(row) => {
            let columns: Vec<String> = table.columns.iter().map(|c| quote_ident(&c.name)).collect();
            let values: Vec<String> = row.iter().map(Value::to_sql).collect();
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote_ident(&table.name),
                columns.join(", "),
                values.join(", ")
            )
        }
        RowChange::Update(row) => {
            let assignments: Vec<String> = table
                .columns
                .iter()
                .zip(row.iter())
                .map(|(c, v)| format!("{} = {}", quote_ident(&c.name), v.to_sql()))
                .collect();
            format!(
                "UPDATE {} SET {} WHERE {}",
                quote_ident(&table.name),
                assignments.join(", "),
                where_clause(table, &table.key_of(row))
            )
        }
        // Without a primary key the key is the whole row; remove one copy
        RowChange::Delete(key) if !table.has_primary_key() => format!(
            "DELETE FROM {} WHERE {} LIMIT 1",
            quote_ident(&table.name),
            where_clause(table, key)
        ),
        RowChange::Delete(key) => format!(
            "DELETE FROM {} WHERE {}",
            quote_ident(&table.name),
            where_clause(table, key)
        ),
    }
}

/// Leading characters of a statement for error messages
fn preview(sql: &str) -> String {
    sql.chars().take(50).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> TableSchema {
        TableSchema::new(
            "users",
            vec![
                ColumnSchema::new("id", "bigint(20) unsigned"),
                ColumnSchema::new("name", "varchar(64)"),
                ColumnSchema::new("avatar", "blob"),
            ],
            &["id"],
        )
    }

    #[test]
    fn test_column_kind() {
        assert_eq!(ColumnKind::of("int(11)"), ColumnKind::Signed);
        assert_eq!(ColumnKind::of("bigint(20) unsigned"), ColumnKind::Unsigned);
        assert_eq!(ColumnKind::of("varbinary(16)"), ColumnKind::Binary);
        assert_eq!(ColumnKind::of("decimal(10,2)"), ColumnKind::Text);
        assert_eq!(ColumnKind::of("datetime(6)"), ColumnKind::Text);
    }

    #[test]
    fn test_select_sql() {
        assert_eq!(
            select_sql(&users()),
            "SELECT CAST(`id` AS UNSIGNED), CAST(`name` AS CHAR), `avatar` FROM `users`"
        );
    }

    #[test]
    fn test_change_sql() {
        let row = vec![Value::UInt(7), Value::from("O'Brien"), Value::Null];

        assert_eq!(
            change_sql(&users(), &RowChange::Insert(row.clone())),
            "INSERT INTO `users` (`id`, `name`, `avatar`) VALUES (7, 'O''Brien', NULL)"
        );
        assert_eq!(
            change_sql(&users(), &RowChange::Update(row)),
            "UPDATE `users` SET `id` = 7, `name` = 'O''Brien', `avatar` = NULL WHERE `id` = 7"
        );
        assert_eq!(
            change_sql(&users(), &RowChange::Delete(vec![Value::UInt(7)])),
            "DELETE FROM `users` WHERE `id` = 7"
        );
    }

    #[test]
    fn test_keyless_delete_removes_one_copy() {
        let log = TableSchema::new(
            "audit_log",
            vec![ColumnSchema::new("event", "varchar(32)"), ColumnSchema::new("n", "int(11)")],
            &[],
        );
        assert_eq!(
            change_sql(&log, &RowChange::Delete(vec![Value::from("login"), Value::Int(1)])),
            "DELETE FROM `audit_log` WHERE `event` = 'login' AND `n` = 1 LIMIT 1"
        );
    }

    #[test]
    fn test_preview_respects_char_boundaries() {
        // 'é' spans bytes 49 and 50
        let sql = format!("INSERT INTO `notes` VALUES ('{}é')", "x".repeat(20));
        assert!(!sql.is_char_boundary(50));

        let head = preview(&sql);
        assert_eq!(head.chars().count(), 50);
        assert!(head.ends_with('é'));
        assert_eq!(preview("SELECT 1"), "SELECT 1");
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("we`ird"), "`we``ird`");
    }

    #[tokio::test]
    async fn test_lazy_pool_needs_no_server() {
        let mut descriptor = DatabaseDescriptor::new("db1", "mariadb://app@127.0.0.1:1/app");
        descriptor.password = Some("secret".to_string());
        let db = MySqlDatabase::connect_lazy(&descriptor);
        assert!(db.is_ok());
    }
}
