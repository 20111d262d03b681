use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::mailbox::{BackpressurePolicy, MailboxReceiver, MailboxSender, SendOutcome, mailbox};
use super::stats::RelayStats;
use crate::core::{Endpoint, RelayMessage, RelayResult};
use crate::security::SecurityContext;
use crate::transport::{BrokerClient, SlaveLink};

/// What a cancelled worker does with messages still in its mailbox
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CancelPolicy {
    /// Drop them unpublished
    #[default]
    Discard,
    /// Publish them before exiting
    Drain,
}

/// Lifecycle of a publisher worker
///
/// `Ready -> {Publishing -> Ready}* -> Cancelled`. A handle only exists
/// once the link is connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Ready,
    Publishing,
    Cancelled,
}

/// Per-worker settings
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// `None` = unbounded mailbox
    pub capacity: Option<usize>,
    pub backpressure: BackpressurePolicy,
    pub cancel_policy: CancelPolicy,
    pub application_id: String,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            capacity: Some(1000),
            backpressure: BackpressurePolicy::default(),
            cancel_policy: CancelPolicy::default(),
            application_id: "rabbitrelay".to_string(),
        }
    }
}

/// Producer side of a worker's mailbox, owned by the dispatcher
pub struct WorkerInbox {
    name: String,
    sender: MailboxSender<RelayMessage>,
}

impl WorkerInbox {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn enqueue(&self, message: RelayMessage) -> SendOutcome {
        self.sender.send(message).await
    }

    /// Messages waiting to be published
    pub fn pending(&self) -> usize {
        self.sender.len()
    }
}

/// Control side of a worker, owned by the relay context
pub struct WorkerHandle {
    name: String,
    cancel_tx: Option<oneshot::Sender<()>>,
    done_rx: Option<oneshot::Receiver<()>>,
    state: watch::Receiver<WorkerState>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Send the cancellation signal without waiting for the worker
    ///
    /// Returns `false` if the signal was already sent.
    pub fn cancel(&mut self) -> bool {
        match self.cancel_tx.take() {
            Some(tx) => {
                // Err means the worker already exited
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    /// Wait for the worker's completion signal, at most `timeout`
    ///
    /// Returns `true` once the worker has signalled completion.
    pub async fn wait_completed(&mut self, timeout: Duration) -> bool {
        let Some(done_rx) = self.done_rx.as_mut() else {
            return true;
        };

        match tokio::time::timeout(timeout, done_rx).await {
            Ok(Ok(())) => {
                self.done_rx = None;
                true
            }
            // Worker task ended without signalling (panicked or aborted)
            Ok(Err(_)) => {
                self.done_rx = None;
                false
            }
            Err(_) => false,
        }
    }

    /// Force the worker task to stop
    pub fn abort(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Owns one slave link and publishes everything that arrives in its mailbox
pub struct PublisherWorker<L: SlaveLink> {
    name: String,
    link: L,
    mailbox: MailboxReceiver<RelayMessage>,
    cancel_rx: oneshot::Receiver<()>,
    done_tx: oneshot::Sender<()>,
    state: watch::Sender<WorkerState>,
    cancel_policy: CancelPolicy,
    stats: Arc<RelayStats>,
}

impl<L: SlaveLink> PublisherWorker<L> {
    /// Connect to `endpoint` and start its worker
    pub async fn connect<B>(
        client: &B,
        endpoint: &Endpoint,
        security: &SecurityContext,
        options: &WorkerOptions,
        stats: Arc<RelayStats>,
    ) -> RelayResult<(WorkerInbox, WorkerHandle)>
    where
        B: BrokerClient<Link = L>,
    {
        debug!("Connecting publisher for {}", endpoint.label());

        let link = client
            .connect_publisher(endpoint, security, &options.application_id)
            .await?;

        Ok(Self::spawn(endpoint.label(), link, options, stats))
    }

    /// Start a worker on an already connected link
    pub fn spawn(
        name: impl Into<String>,
        link: L,
        options: &WorkerOptions,
        stats: Arc<RelayStats>,
    ) -> (WorkerInbox, WorkerHandle) {
        let name = name.into();
        let (sender, receiver) = mailbox(options.capacity, options.backpressure);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        let (state_tx, state_rx) = watch::channel(WorkerState::Ready);

        let worker = Self {
            name: name.clone(),
            link,
            mailbox: receiver,
            cancel_rx,
            done_tx,
            state: state_tx,
            cancel_policy: options.cancel_policy,
            stats,
        };
        let task = tokio::spawn(worker.run());

        (
            WorkerInbox {
                name: name.clone(),
                sender,
            },
            WorkerHandle {
                name,
                cancel_tx: Some(cancel_tx),
                done_rx: Some(done_rx),
                state: state_rx,
                task,
            },
        )
    }

    async fn run(self) {
        let Self {
            name,
            mut link,
            mut mailbox,
            mut cancel_rx,
            done_tx,
            state,
            cancel_policy,
            stats,
        } = self;

        let mut inbox_open = true;

        loop {
            tokio::select! {
                biased;

                // Cancellation wins when both are ready
                _ = &mut cancel_rx => break,

                message = mailbox.recv(), if inbox_open => match message {
                    Some(message) => {
                        state.send_replace(WorkerState::Publishing);
                        publish(&name, &mut link, &stats, &message).await;
                        state.send_replace(WorkerState::Ready);
                    }
                    None => {
                        debug!("Mailbox of {} closed, waiting for cancellation", name);
                        inbox_open = false;
                    }
                },
            }
        }

        let remaining = mailbox.drain();
        if !remaining.is_empty() {
            match cancel_policy {
                CancelPolicy::Discard => {
                    warn!(
                        "Discarding {} unpublished messages for {}",
                        remaining.len(),
                        name
                    );
                    stats.record_discarded(remaining.len() as u64);
                }
                CancelPolicy::Drain => {
                    info!("Draining {} messages to {}", remaining.len(), name);
                    for message in &remaining {
                        publish(&name, &mut link, &stats, message).await;
                    }
                }
            }
        }

        link.close().await;
        state.send_replace(WorkerState::Cancelled);
        trace!("Shutting down handler for publisher ({})", name);
        let _ = done_tx.send(());
    }
}

async fn publish<L: SlaveLink>(name: &str, link: &mut L, stats: &RelayStats, message: &RelayMessage) {
    match link.publish(message).await {
        Ok(()) => stats.record_publish(true),
        Err(e) => {
            error!("Error publishing message to {}: {}", name, e);
            stats.record_publish(false);
        }
    }
}
