//! SQLite state manager
//!
//! Keeps member state in an embedded SQLite file, one file per cluster.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection};
use tokio::sync::Mutex;

use super::{ClusterState, DatabaseState, StateManager, StateManagerKind};
use crate::error::{Error, Result};

/// Persistent state manager backed by SQLite
pub struct SqliteStateManager {
    path: PathBuf,
    /// Open connection, present between `start` and `stop`
    conn: Mutex<Option<Connection>>,
}

impl SqliteStateManager {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            conn: Mutex::new(None),
        }
    }

    /// Run an upsert keyed by member id, with an optional extra integer parameter
    async fn execute(&self, sql: &str, values: &[i64], id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let conn = conn.as_ref().ok_or_else(not_started)?;
        match values {
            [] => conn.execute(sql, params![id])?,
            [value, ..] => conn.execute(sql, params![id, value])?,
        };
        Ok(())
    }
}

fn not_started() -> Error {
    Error::State("SQLite state manager not started".into())
}

#[async_trait]
impl StateManager for SqliteStateManager {
    async fn start(&self) -> Result<()> {
        let mut conn = self.conn.lock().await;
        if conn.is_some() {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Connection::open(&self.path)?;
        db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS cluster_state (
                database_id TEXT PRIMARY KEY,
                active INTEGER NOT NULL DEFAULT 0,
                last_synchronized INTEGER,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )?;

        tracing::debug!("Opened SQLite state at {:?}", self.path);
        *conn = Some(db);
        Ok(())
    }

    async fn cluster_state(&self) -> Result<ClusterState> {
        let conn = self.conn.lock().await;
        let conn = conn.as_ref().ok_or_else(not_started)?;

        let mut stmt = conn.prepare("SELECT database_id, active, last_synchronized FROM cluster_state")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, bool>(1)?,
                row.get::<_, Option<i64>>(2)?,
            ))
        })?;

        let mut state = ClusterState::new();
        for row in rows {
            let (id, active, synced) = row?;
            state.insert(id, DatabaseState {
                active,
                last_synchronized: synced.and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            });
        }
        Ok(state)
    }

    async fn record_active(&self, id: &str) -> Result<()> {
        self.execute(
            r#"
            INSERT INTO cluster_state (database_id, active) VALUES (?1, 1)
            ON CONFLICT(database_id) DO UPDATE SET active = 1, updated_at = CURRENT_TIMESTAMP
            "#,
            &[],
            id,
        )
        .await
    }

    async fn record_inactive(&self, id: &str) -> Result<()> {
        self.execute(
            r#"
            INSERT INTO cluster_state (database_id, active) VALUES (?1, 0)
            ON CONFLICT(database_id) DO UPDATE SET active = 0, updated_at = CURRENT_TIMESTAMP
            "#,
            &[],
            id,
        )
        .await
    }

    async fn record_synchronized(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.execute(
            r#"
            INSERT INTO cluster_state (database_id, last_synchronized) VALUES (?1, ?2)
            ON CONFLICT(database_id) DO UPDATE SET last_synchronized = ?2, updated_at = CURRENT_TIMESTAMP
            "#,
            &[at.timestamp_millis()],
            id,
        )
        .await
    }

    async fn stop(&self) -> Result<()> {
        if let Some(conn) = self.conn.lock().await.take() {
            conn.close().map_err(|(_, e)| Error::from(e))?;
        }
        Ok(())
    }

    fn kind(&self) -> StateManagerKind {
        StateManagerKind::Sqlite
    }
}
