use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::info;

/// Relay counters, shared by the dispatcher and every worker
#[derive(Debug, Default)]
pub struct RelayStats {
    deliveries: AtomicU64,
    acked: AtomicU64,
    ack_failures: AtomicU64,
    enqueued: AtomicU64,
    dropped: AtomicU64,
    published: AtomicU64,
    publish_failures: AtomicU64,
    discarded_on_cancel: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayStatsSnapshot {
    /// Deliveries received from the master
    pub deliveries: u64,
    pub acked: u64,
    pub ack_failures: u64,
    /// Copies placed in worker mailboxes
    pub enqueued: u64,
    /// Copies lost to backpressure (rejected or evicted)
    pub dropped: u64,
    pub published: u64,
    pub publish_failures: u64,
    /// Copies still queued when a worker was cancelled
    pub discarded_on_cancel: u64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_delivery(&self) {
        self.deliveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ack(&self, ok: bool) {
        if ok {
            self.acked.fetch_add(1, Ordering::Relaxed);
        } else {
            self.ack_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish(&self, ok: bool) {
        if ok {
            self.published.fetch_add(1, Ordering::Relaxed);
        } else {
            self.publish_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_discarded(&self, count: u64) {
        self.discarded_on_cancel.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            deliveries: self.deliveries.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            ack_failures: self.ack_failures.load(Ordering::Relaxed),
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            discarded_on_cancel: self.discarded_on_cancel.load(Ordering::Relaxed),
        }
    }
}

impl RelayStatsSnapshot {
    /// Per-second delivery and publish rates since `earlier`
    pub fn rates_since(&self, earlier: &RelayStatsSnapshot, elapsed: Duration) -> (f64, f64) {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return (0.0, 0.0);
        }
        (
            self.deliveries.saturating_sub(earlier.deliveries) as f64 / secs,
            self.published.saturating_sub(earlier.published) as f64 / secs,
        )
    }

    pub fn log(&self) {
        info!(
            deliveries = self.deliveries,
            acked = self.acked,
            ack_failures = self.ack_failures,
            enqueued = self.enqueued,
            dropped = self.dropped,
            published = self.published,
            publish_failures = self.publish_failures,
            discarded_on_cancel = self.discarded_on_cancel,
            "Relay statistics"
        );
    }
}

/// Log a snapshot and the message rates every `interval`
pub fn spawn_reporter(stats: Arc<RelayStats>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick completes immediately
        ticker.tick().await;

        let mut last = stats.snapshot();
        let mut last_at = Instant::now();

        loop {
            ticker.tick().await;
            let now = Instant::now();
            let snapshot = stats.snapshot();
            let (delivery_rate, publish_rate) = snapshot.rates_since(&last, now - last_at);

            snapshot.log();
            info!(
                "Delivery rate {:.1}/s, publish rate {:.1}/s",
                delivery_rate, publish_rate
            );

            last = snapshot;
            last_at = now;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = RelayStats::new();
        stats.record_delivery();
        stats.record_delivery();
        stats.record_ack(true);
        stats.record_ack(false);
        stats.record_enqueued();
        stats.record_dropped();
        stats.record_publish(true);
        stats.record_publish(false);
        stats.record_discarded(3);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.deliveries, 2);
        assert_eq!(snapshot.acked, 1);
        assert_eq!(snapshot.ack_failures, 1);
        assert_eq!(snapshot.enqueued, 1);
        assert_eq!(snapshot.dropped, 1);
        assert_eq!(snapshot.published, 1);
        assert_eq!(snapshot.publish_failures, 1);
        assert_eq!(snapshot.discarded_on_cancel, 3);
    }

    #[test]
    fn test_rates() {
        let earlier = RelayStatsSnapshot::default();
        let later = RelayStatsSnapshot {
            deliveries: 100,
            published: 50,
            ..Default::default()
        };

        let (delivery_rate, publish_rate) = later.rates_since(&earlier, Duration::from_secs(10));
        assert_eq!(delivery_rate, 10.0);
        assert_eq!(publish_rate, 5.0);
        assert_eq!(later.rates_since(&earlier, Duration::ZERO), (0.0, 0.0));
    }

    #[tokio::test]
    async fn test_reporter_runs_until_aborted() {
        let stats = Arc::new(RelayStats::new());
        let reporter = spawn_reporter(Arc::clone(&stats), Duration::from_millis(10));

        stats.record_delivery();
        tokio::time::sleep(Duration::from_millis(35)).await;
        assert!(!reporter.is_finished());

        reporter.abort();
    }
}
