use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::transport::{DeliveryHandler, DeliverySource};

/// Running master consumer loop
///
/// Each delivery is passed to the handler; the handler finishes before the
/// next delivery is requested, so a stop never interrupts an in-flight one.
pub struct ConsumerHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    pub fn spawn<S, H>(source: S, handler: Arc<H>) -> Self
    where
        S: DeliverySource,
        H: DeliveryHandler,
    {
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(consume(source, handler, stop_rx));

        Self {
            stop_tx: Some(stop_tx),
            task,
        }
    }

    /// Stop consuming and wait until the subscription is closed
    pub async fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!("Consumer task ended abnormally: {}", e);
        }
    }

    /// Stop consuming, aborting the task if it has not finished within `timeout`
    ///
    /// A delivery blocked on a full mailbox never observes the stop signal.
    /// Aborting drops the handler and with it the worker inboxes. Returns
    /// `false` when the task had to be aborted.
    pub async fn stop_within(mut self, timeout: Duration) -> bool {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }

        match tokio::time::timeout(timeout, &mut self.task).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!("Consumer task ended abnormally: {}", e);
                true
            }
            Err(_) => {
                warn!("Consumer did not stop within {:?}, aborting", timeout);
                self.task.abort();
                // Wait for the drop so the inboxes are gone before workers are cancelled
                let _ = (&mut self.task).await;
                false
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

async fn consume<S, H>(mut source: S, handler: Arc<H>, mut stop_rx: oneshot::Receiver<()>)
where
    S: DeliverySource,
    H: DeliveryHandler,
{
    info!("Consumer started");

    loop {
        tokio::select! {
            biased;

            _ = &mut stop_rx => {
                debug!("Consumer stop requested");
                break;
            }

            delivery = source.next_delivery() => match delivery {
                Some(delivery) => {
                    if let Err(e) = handler.handle(delivery).await {
                        error!("Delivery handler failed, consumer stopping: {}", e);
                        break;
                    }
                }
                None => {
                    warn!("Master subscription ended");
                    break;
                }
            },
        }
    }

    source.close().await;
    info!("Consumer stopped");
}
