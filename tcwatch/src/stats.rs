use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

const REPORT_INTERVAL: Duration = Duration::from_secs(10);

/// Pipeline counters. All monotonically non-decreasing, mutated with
/// relaxed fetch-adds from every stage of the pipeline.
#[derive(Debug, Default)]
pub struct Stats {
    /// Records fully processed and emitted to the sink.
    pub packets_processed: AtomicU64,
    /// Records lost anywhere: kernel lost samples, full dispatch channel,
    /// full worker queues.
    pub packets_dropped: AtomicU64,
    /// Drops caused specifically by a saturated worker queue.
    pub worker_queue_full: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub packets_processed: u64,
    pub packets_dropped: u64,
    pub worker_queue_full: u64,
}

impl Stats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets_processed: self.packets_processed.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            worker_queue_full: self.worker_queue_full.load(Ordering::Relaxed),
        }
    }
}

/// Log a counter snapshot every ten seconds until cancelled.
pub fn spawn_reporter(tracker: &TaskTracker, token: &CancellationToken, stats: Arc<Stats>) {
    let token = token.clone();
    tracker.spawn(async move {
        let mut tick = tokio::time::interval(REPORT_INTERVAL);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tick.tick() => {
                    let snapshot = stats.snapshot();
                    info!(
                        "stats - processed: {}, dropped: {}, queue full: {}",
                        snapshot.packets_processed,
                        snapshot.packets_dropped,
                        snapshot.worker_queue_full
                    );
                }
            }
        }
        debug!("stats reporter stopped");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reads_all_counters() {
        let stats = Stats::default();
        stats.packets_processed.fetch_add(3, Ordering::Relaxed);
        stats.packets_dropped.fetch_add(2, Ordering::Relaxed);
        stats.worker_queue_full.fetch_add(1, Ordering::Relaxed);
        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                packets_processed: 3,
                packets_dropped: 2,
                worker_queue_full: 1,
            }
        );
    }
}
