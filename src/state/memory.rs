//! In-memory state manager

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{ClusterState, StateManager, StateManagerKind};
use crate::error::Result;

/// State manager keeping everything in memory. State is lost on restart, so
/// the first configured member becomes the reference on every start.
#[derive(Default)]
pub struct MemoryStateManager {
    state: RwLock<ClusterState>,
}

impl MemoryStateManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateManager for MemoryStateManager {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn cluster_state(&self) -> Result<ClusterState> {
        Ok(self.state.read().await.clone())
    }

    async fn record_active(&self, id: &str) -> Result<()> {
        self.state.write().await.entry(id.to_string()).or_default().active = true;
        Ok(())
    }

    async fn record_inactive(&self, id: &str) -> Result<()> {
        self.state.write().await.entry(id.to_string()).or_default().active = false;
        Ok(())
    }

    async fn record_synchronized(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.state.write().await.entry(id.to_string()).or_default().last_synchronized = Some(at);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    fn kind(&self) -> StateManagerKind {
        StateManagerKind::Simple
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_contract() {
        super::super::tests::check_contract(&MemoryStateManager::new()).await;
    }
}
