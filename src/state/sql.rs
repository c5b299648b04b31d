//! SQL state manager
//!
//! Keeps member state in a table on a MariaDB/MySQL server shared by every
//! node running the cluster. Rows are keyed by cluster name and member id.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};
use sqlx::MySqlPool;
use tokio::sync::RwLock;

use super::{ClusterState, DatabaseState, StateManager, StateManagerKind};
use crate::error::{Error, Result};

const POOL_SIZE: u32 = 2;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Persistent state manager backed by a MariaDB/MySQL table
pub struct SqlStateManager {
    url: String,
    cluster: String,
    pool: RwLock<Option<MySqlPool>>,
}

impl SqlStateManager {
    pub fn new(url: impl Into<String>, cluster: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            cluster: cluster.into(),
            pool: RwLock::new(None),
        }
    }

    async fn pool(&self) -> Result<MySqlPool> {
        self.pool
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::State("SQL state manager not started".into()))
    }

    async fn upsert_active(&self, id: &str, active: bool) -> Result<()> {
        let pool = self.pool().await?;
        sqlx::query(
            r#"
            INSERT INTO wolfha_cluster_state (cluster, database_id, active) VALUES (?, ?, ?)
            ON DUPLICATE KEY UPDATE active = VALUES(active)
            "#,
        )
        .bind(&self.cluster)
        .bind(id)
        .bind(active)
        .execute(&pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl StateManager for SqlStateManager {
    async fn start(&self) -> Result<()> {
        let mut pool = self.pool.write().await;
        if pool.is_some() {
            return Ok(());
        }

        let options = MySqlConnectOptions::from_str(&self.url.replacen("mariadb://", "mysql://", 1))?;
        let new_pool = MySqlPoolOptions::new()
            .max_connections(POOL_SIZE)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS wolfha_cluster_state (
                cluster VARCHAR(255) NOT NULL,
                database_id VARCHAR(255) NOT NULL,
                active BOOLEAN NOT NULL DEFAULT FALSE,
                last_synchronized BIGINT NULL,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP,
                PRIMARY KEY (cluster, database_id)
            )
            "#,
        )
        .execute(&new_pool)
        .await?;

        tracing::debug!("Opened SQL state for cluster {}", self.cluster);
        *pool = Some(new_pool);
        Ok(())
    }

    async fn cluster_state(&self) -> Result<ClusterState> {
        let pool = self.pool().await?;
        let rows: Vec<(String, bool, Option<i64>)> = sqlx::query_as(
            "SELECT database_id, active, last_synchronized FROM wolfha_cluster_state WHERE cluster = ?",
        )
        .bind(&self.cluster)
        .fetch_all(&pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, active, synced)| {
                (id, DatabaseState {
                    active,
                    last_synchronized: synced.and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
                })
            })
            .collect())
    }

    async fn record_active(&self, id: &str) -> Result<()> {
        self.upsert_active(id, true).await
    }

    async fn record_inactive(&self, id: &str) -> Result<()> {
        self.upsert_active(id, false).await
    }

    async fn record_synchronized(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let pool = self.pool().await?;
        sqlx::query(
            r#"
            INSERT INTO wolfha_cluster_state (cluster, database_id, last_synchronized) VALUES (?, ?, ?)
            ON DUPLICATE KEY UPDATE last_synchronized = VALUES(last_synchronized)
            "#,
        )
        .bind(&self.cluster)
        .bind(id)
        .bind(at.timestamp_millis())
        .execute(&pool)
        .await?;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(pool) = self.pool.write().await.take() {
            pool.close().await;
        }
        Ok(())
    }

    fn kind(&self) -> StateManagerKind {
        StateManagerKind::Sql
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_requires_start() {
        let manager = SqlStateManager::new("mysql://localhost:3306/wolfha", "default");
        assert!(matches!(manager.record_active("db1").await, Err(Error::State(_))));
        assert!(manager.stop().await.is_ok());
    }

    #[cfg(feature = "integration")]
    #[tokio::test]
    async fn test_contract() {
        let url = std::env::var("WOLFHA_TEST_MYSQL_URL")
            .unwrap_or_else(|_| "mysql://root@localhost:3306/wolfha_test".to_string());
        let manager = SqlStateManager::new(url, format!("test-{}", std::process::id()));
        super::super::tests::check_contract(&manager).await;
        manager.stop().await.unwrap();
    }
}
