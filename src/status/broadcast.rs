use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};

use super::StatusAggregator;
use crate::config::StatusConfig;

/// Publish snapshots on change (coalesced over `coalesce_ms`) and on a heartbeat.
pub fn spawn_broadcaster(
    aggregator: Arc<StatusAggregator>,
    config: &StatusConfig,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let coalesce = Duration::from_millis(config.coalesce_ms);
    let heartbeat_every = Duration::from_secs(config.heartbeat_secs.max(1));

    tokio::spawn(async move {
        let mut heartbeat = interval(heartbeat_every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = aggregator.changed().notified() => {
                    // Let a burst of events settle into one snapshot
                    sleep(coalesce).await;
                    aggregator.publish();
                    heartbeat.reset();
                }
                _ = heartbeat.tick() => {
                    aggregator.publish();
                }
                _ = shutdown.changed() => break,
            }
        }

        aggregator.publish();
        tracing::debug!("Status broadcaster stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Catalog;
    use std::path::Path;

    #[tokio::test]
    async fn test_burst_is_coalesced() {
        let catalog = Arc::new(Catalog::open_in_memory().unwrap());
        let aggregator = Arc::new(StatusAggregator::new(catalog.clone()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = StatusConfig {
            coalesce_ms: 50,
            heartbeat_secs: 60,
        };

        let mut stream = aggregator.subscribe();
        let handle = spawn_broadcaster(aggregator.clone(), &config, shutdown_rx);

        // The first heartbeat tick fires immediately
        stream.next().await.unwrap();

        catalog.insert_root(Path::new("/a")).unwrap();
        for _ in 0..100 {
            aggregator.record_failure("/a/x.jpg", "boom");
        }

        let snap = stream.next().await.unwrap();
        assert_eq!(snap.failed_total, 100);
        assert_eq!(snap.roots_total, 1);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
