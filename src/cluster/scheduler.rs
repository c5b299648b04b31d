//! Re-activation Scheduler
//!
//! Runs a sweep of the cluster every time its cron schedule fires. The task
//! holds only a weak reference, so a dropped cluster ends it as well.

use std::sync::Weak;

use chrono::Local;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::Cluster;
use crate::cron::CronExpression;

pub(super) fn spawn(cluster: Weak<Cluster>, schedule: CronExpression, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let now = Local::now();
            let Some(next) = schedule.next_local(now) else {
                tracing::info!("Schedule '{}' will not fire again", schedule);
                return;
            };
            let delay = (next - now).to_std().unwrap_or_default();

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                    continue;
                }
            }

            let Some(cluster) = cluster.upgrade() else {
                return;
            };
            let report = cluster.sweep().await;
            if !report.activated.is_empty() {
                tracing::info!("Sweep of cluster {} activated {}", cluster.name(), report.activated.join(", "));
            }
            if !report.failed.is_empty() {
                tracing::debug!("Sweep of cluster {} left {} members inactive", cluster.name(), report.failed.len());
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::cluster::tests::{connector, settings};
    use crate::cluster::{Cluster, ClusterConfiguration};
    use crate::config::StateConfig;

    #[tokio::test]
    async fn test_schedule_activates_inactive_members() {
        let (connector, dbs) = connector(2).await;
        let mut settings = settings(2);
        settings.cron_expression = "* * * * * ?".into();
        let config = ClusterConfiguration::resolve(&settings, &StateConfig::default()).unwrap();
        let cluster = Cluster::start(config, connector.as_ref()).await.unwrap();

        let mut activated = false;
        for _ in 0..50 {
            if cluster.is_active("db2").await {
                activated = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(activated);
        assert_eq!(dbs[1].rows("orders").await.unwrap().len(), 3);
        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_scheduler() {
        let (connector, _) = connector(2).await;
        let config = ClusterConfiguration::resolve(&settings(2), &StateConfig::default()).unwrap();
        let cluster = Cluster::start(config, connector.as_ref()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), cluster.shutdown())
            .await
            .unwrap()
            .unwrap();
        assert!(cluster.scheduler.lock().unwrap().is_none());
    }
}
