use std::sync::Arc;
use tracing::{debug, error, warn};

use super::mailbox::SendOutcome;
use super::stats::RelayStats;
use super::worker::WorkerInbox;
use crate::core::RelayResult;
use crate::transport::{Delivery, DeliveryHandler};

/// Acknowledges each master delivery, then hands a copy to every live worker
///
/// The ack is sent before fan-out, so a delivery is never redelivered by the
/// master even if some slave later fails to publish it.
pub struct RelayDispatcher {
    inboxes: Vec<WorkerInbox>,
    stats: Arc<RelayStats>,
}

impl RelayDispatcher {
    pub fn new(inboxes: Vec<WorkerInbox>, stats: Arc<RelayStats>) -> Self {
        Self { inboxes, stats }
    }

    pub fn worker_count(&self) -> usize {
        self.inboxes.len()
    }
}

impl DeliveryHandler for RelayDispatcher {
    async fn handle<D: Delivery>(&self, delivery: D) -> RelayResult<()> {
        self.stats.record_delivery();

        match delivery.ack().await {
            Ok(()) => self.stats.record_ack(true),
            Err(e) => {
                // Fan-out still happens; the master may redeliver
                error!("Error acknowledging message: {}", e);
                self.stats.record_ack(false);
            }
        }

        let message = delivery.message();
        if self.inboxes.is_empty() {
            debug!("No publishers, message of {} bytes dropped", message.len());
            return Ok(());
        }

        for inbox in &self.inboxes {
            match inbox.enqueue(message.clone()).await {
                SendOutcome::Queued => self.stats.record_enqueued(),
                SendOutcome::QueuedDroppedOldest => {
                    debug!("Mailbox of {} full, oldest message dropped", inbox.name());
                    self.stats.record_enqueued();
                    self.stats.record_dropped();
                }
                SendOutcome::Rejected => {
                    debug!("Mailbox of {} full, message dropped", inbox.name());
                    self.stats.record_dropped();
                }
                SendOutcome::Closed => {
                    warn!("Publisher {} is gone, message dropped", inbox.name());
                    self.stats.record_dropped();
                }
            }
        }

        Ok(())
    }
}
