use std::sync::Arc;
use tracing::{error, info};

use super::consumer::ConsumerHandle;
use super::dispatcher::RelayDispatcher;
use super::stats::RelayStats;
use super::worker::{PublisherWorker, WorkerHandle, WorkerInbox, WorkerOptions};
use crate::config::{RelayConfiguration, RelaySettings};
use crate::core::{Endpoint, RelayResult};
use crate::security::SecurityContext;
use crate::transport::{BrokerClient, SubscribeOptions};

/// Everything the running relay owns
///
/// Built once by [`RelayContext::start`] and handed to the shutdown
/// coordinator. The worker set never changes after startup.
#[derive(Default)]
pub struct RelayContext {
    consumer: Option<ConsumerHandle>,
    workers: Vec<WorkerHandle>,
    stats: Arc<RelayStats>,
}

impl RelayContext {
    /// Start one publisher per reachable slave, then the master consumer
    ///
    /// Slaves that fail to set up are logged and skipped. A master that
    /// fails to set up leaves the context without a consumer.
    pub async fn start<B: BrokerClient>(client: &B, config: &RelayConfiguration) -> Self {
        let stats = Arc::new(RelayStats::new());
        let (inboxes, workers) =
            start_publishers(client, &config.slaves, &config.relay, &stats).await;

        info!(
            "{} of {} slave servers connected",
            workers.len(),
            config.slaves.len()
        );

        let dispatcher = Arc::new(RelayDispatcher::new(inboxes, Arc::clone(&stats)));
        let consumer = match start_consumer(client, &config.master, &config.relay, dispatcher).await
        {
            Ok(consumer) => Some(consumer),
            Err(e) => {
                error!(
                    "Error setting up master server {} ({}): {}",
                    config.master.label(),
                    config.master.address(),
                    e
                );
                None
            }
        };

        Self {
            consumer,
            workers,
            stats,
        }
    }

    pub fn stats(&self) -> Arc<RelayStats> {
        Arc::clone(&self.stats)
    }

    pub fn has_consumer(&self) -> bool {
        self.consumer.is_some()
    }

    /// Names of the publishers that started, in configuration order
    pub fn live_workers(&self) -> Vec<&str> {
        self.workers.iter().map(WorkerHandle::name).collect()
    }

    pub fn workers(&self) -> &[WorkerHandle] {
        &self.workers
    }

    pub(crate) fn workers_mut(&mut self) -> &mut [WorkerHandle] {
        &mut self.workers
    }

    pub(crate) fn take_consumer(&mut self) -> Option<ConsumerHandle> {
        self.consumer.take()
    }
}

fn worker_options(settings: &RelaySettings) -> WorkerOptions {
    WorkerOptions {
        capacity: settings.bounded_capacity(),
        backpressure: settings.backpressure,
        cancel_policy: settings.cancel_policy,
        application_id: settings.application_id.clone(),
    }
}

async fn start_publishers<B: BrokerClient>(
    client: &B,
    slaves: &[Endpoint],
    settings: &RelaySettings,
    stats: &Arc<RelayStats>,
) -> (Vec<WorkerInbox>, Vec<WorkerHandle>) {
    let options = worker_options(settings);
    let mut inboxes = Vec::with_capacity(slaves.len());
    let mut workers = Vec::with_capacity(slaves.len());

    for slave in slaves {
        match start_publisher(client, slave, settings, &options, stats).await {
            Ok((inbox, handle)) => {
                info!("Connected to slave server: {}", slave.redacted_url());
                inboxes.push(inbox);
                workers.push(handle);
            }
            Err(e) => {
                error!(
                    "Error setting up slave server {} ({}): {}",
                    slave.label(),
                    slave.address(),
                    e
                );
            }
        }
    }

    (inboxes, workers)
}

async fn start_publisher<B: BrokerClient>(
    client: &B,
    slave: &Endpoint,
    settings: &RelaySettings,
    options: &WorkerOptions,
    stats: &Arc<RelayStats>,
) -> RelayResult<(WorkerInbox, WorkerHandle)> {
    let security = SecurityContext::build(slave, settings.certificate_policy)?;
    PublisherWorker::<B::Link>::connect(client, slave, &security, options, Arc::clone(stats)).await
}

async fn start_consumer<B: BrokerClient>(
    client: &B,
    master: &Endpoint,
    settings: &RelaySettings,
    dispatcher: Arc<RelayDispatcher>,
) -> RelayResult<ConsumerHandle> {
    let security = SecurityContext::build(master, settings.certificate_policy)?;
    let options = SubscribeOptions {
        consumer_tag: settings.consumer_tag.clone(),
        application_id: settings.application_id.clone(),
    };

    let source = client.subscribe(master, &security, &options).await?;
    info!("Connected to master server: {}", master.redacted_url());
    Ok(ConsumerHandle::spawn(source, dispatcher))
}
