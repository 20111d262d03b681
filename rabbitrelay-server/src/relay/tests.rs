use super::*;
use crate::config::{RelayConfiguration, RelaySettings};
use crate::core::{Endpoint, RelayError, RelayMessage, RelayResult};
use crate::security::SecurityContext;
use crate::transport::{
    BrokerClient, Delivery, DeliveryHandler, DeliverySource, SlaveLink, SubscribeOptions,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc, oneshot};
use tracing_test::traced_test;

type EventLog = Arc<Mutex<Vec<String>>>;

struct MemoryDelivery {
    id: u64,
    message: RelayMessage,
    fail_ack: bool,
    acks: Arc<AtomicUsize>,
    /// `enqueued` counter observed at ack time
    enqueued_at_ack: Arc<Mutex<Vec<u64>>>,
    stats: Option<Arc<RelayStats>>,
    events: EventLog,
}

impl MemoryDelivery {
    fn new(id: u64, events: &EventLog) -> Self {
        Self {
            id,
            message: RelayMessage::new(format!("message-{}", id).into_bytes()),
            fail_ack: false,
            acks: Arc::new(AtomicUsize::new(0)),
            enqueued_at_ack: Arc::new(Mutex::new(Vec::new())),
            stats: None,
            events: Arc::clone(events),
        }
    }
}

impl Delivery for MemoryDelivery {
    fn message(&self) -> &RelayMessage {
        &self.message
    }

    async fn ack(&self) -> RelayResult<()> {
        self.acks.fetch_add(1, Ordering::SeqCst);
        if let Some(stats) = &self.stats {
            self.enqueued_at_ack.lock().push(stats.snapshot().enqueued);
        }
        self.events.lock().push(format!("ack {}", self.id));

        if self.fail_ack {
            Err(RelayError::Ack("channel closed".to_string()))
        } else {
            Ok(())
        }
    }
}

struct MemorySource {
    deliveries: mpsc::UnboundedReceiver<MemoryDelivery>,
    events: EventLog,
}

impl DeliverySource for MemorySource {
    type Delivery = MemoryDelivery;

    async fn next_delivery(&mut self) -> Option<MemoryDelivery> {
        self.deliveries.recv().await
    }

    async fn close(self) {
        self.events.lock().push("close master".to_string());
    }
}

struct MemoryLink {
    name: String,
    hang_on_publish: bool,
    hang_on_close: bool,
    published: Arc<Mutex<Vec<(String, String)>>>,
    events: EventLog,
}

impl SlaveLink for MemoryLink {
    async fn publish(&mut self, message: &RelayMessage) -> RelayResult<()> {
        if self.hang_on_publish {
            std::future::pending::<()>().await;
        }
        let payload = String::from_utf8_lossy(&message.payload).to_string();
        self.published.lock().push((self.name.clone(), payload));
        Ok(())
    }

    async fn close(self) {
        if self.hang_on_close {
            std::future::pending::<()>().await;
        }
        self.events.lock().push(format!("close {}", self.name));
    }
}

/// In-memory broker: hosts listed in `unreachable` refuse connections
#[derive(Default)]
struct MemoryBroker {
    unreachable: Vec<String>,
    hang_on_publish: Vec<String>,
    hang_on_close: Vec<String>,
    deliveries: Mutex<Option<mpsc::UnboundedReceiver<MemoryDelivery>>>,
    published: Arc<Mutex<Vec<(String, String)>>>,
    subscriptions: Mutex<Vec<SubscribeOptions>>,
    events: EventLog,
}

impl MemoryBroker {
    fn with_master_stream() -> (Self, mpsc::UnboundedSender<MemoryDelivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let broker = Self {
            deliveries: Mutex::new(Some(rx)),
            ..Default::default()
        };
        (broker, tx)
    }

    fn published_to(&self, name: &str) -> Vec<String> {
        self.published
            .lock()
            .iter()
            .filter(|(slave, _)| slave == name)
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

impl BrokerClient for MemoryBroker {
    type Source = MemorySource;
    type Link = MemoryLink;

    async fn subscribe(
        &self,
        endpoint: &Endpoint,
        _security: &SecurityContext,
        options: &SubscribeOptions,
    ) -> RelayResult<MemorySource> {
        if self.unreachable.contains(&endpoint.host) {
            return Err(RelayError::connection(endpoint.label(), "connection refused"));
        }
        self.subscriptions.lock().push(options.clone());

        let deliveries = self
            .deliveries
            .lock()
            .take()
            .ok_or_else(|| RelayError::connection(endpoint.label(), "already subscribed"))?;
        Ok(MemorySource {
            deliveries,
            events: Arc::clone(&self.events),
        })
    }

    async fn connect_publisher(
        &self,
        endpoint: &Endpoint,
        _security: &SecurityContext,
        _application_id: &str,
    ) -> RelayResult<MemoryLink> {
        if self.unreachable.contains(&endpoint.host) {
            return Err(RelayError::connection(endpoint.label(), "connection refused"));
        }
        Ok(MemoryLink {
            name: endpoint.label(),
            hang_on_publish: self.hang_on_publish.contains(&endpoint.host),
            hang_on_close: self.hang_on_close.contains(&endpoint.host),
            published: Arc::clone(&self.published),
            events: Arc::clone(&self.events),
        })
    }
}

fn configuration(slaves: usize) -> RelayConfiguration {
    RelayConfiguration {
        master: Endpoint::new("master", "master-host", 5672, "guest", "guest"),
        slaves: (1..=slaves)
            .map(|n| {
                Endpoint::new(
                    format!("slave-{}", n),
                    format!("slave-host-{}", n),
                    5672,
                    "guest",
                    "guest",
                )
            })
            .collect(),
        relay: RelaySettings::default(),
    }
}

fn memory_link(name: &str, published: &Arc<Mutex<Vec<(String, String)>>>) -> MemoryLink {
    MemoryLink {
        name: name.to_string(),
        hang_on_publish: false,
        hang_on_close: false,
        published: Arc::clone(published),
        events: EventLog::default(),
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    let result = tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "condition not met in time");
}

#[tokio::test]
#[traced_test]
async fn test_unreachable_slave_is_skipped() {
    let (mut broker, _tx) = MemoryBroker::with_master_stream();
    broker.unreachable.push("slave-host-2".to_string());

    let ctx = RelayContext::start(&broker, &configuration(3)).await;

    assert_eq!(ctx.live_workers(), vec!["slave-1", "slave-3"]);
    assert!(ctx.has_consumer());
    assert!(logs_contain("Error setting up slave server slave-2"));
    assert!(logs_contain("2 of 3 slave servers connected"));
    assert!(!logs_contain("Error setting up slave server slave-1"));

    for handle in ctx.workers() {
        assert_eq!(handle.state(), WorkerState::Ready);
    }
}

#[tokio::test]
async fn test_unreachable_master_leaves_workers_running() {
    let (mut broker, _tx) = MemoryBroker::with_master_stream();
    broker.unreachable.push("master-host".to_string());

    let mut ctx = RelayContext::start(&broker, &configuration(2)).await;
    assert!(!ctx.has_consumer());
    assert_eq!(ctx.live_workers().len(), 2);

    let report = ShutdownCoordinator::new(ShutdownPolicy::AwaitCompletion { timeout_ms: 500 })
        .shutdown(&mut ctx)
        .await;
    assert_eq!(report.completed, 2);
}

#[tokio::test]
async fn test_subscribe_uses_relay_settings() {
    let (broker, _tx) = MemoryBroker::with_master_stream();
    let mut config = configuration(0);
    config.relay.consumer_tag = "relay-1".to_string();
    config.relay.application_id = "relay-app".to_string();

    let _ctx = RelayContext::start(&broker, &config).await;

    let subscriptions = broker.subscriptions.lock();
    assert_eq!(subscriptions.len(), 1);
    assert_eq!(subscriptions[0].consumer_tag, "relay-1");
    assert_eq!(subscriptions[0].application_id, "relay-app");
}

async fn assert_ack_precedes_enqueue(workers: usize) {
    let stats = Arc::new(RelayStats::new());
    let published = Arc::new(Mutex::new(Vec::new()));
    let events = EventLog::default();

    let mut inboxes = Vec::new();
    let mut handles = Vec::new();
    for n in 0..workers {
        let (inbox, handle) = PublisherWorker::spawn(
            format!("slave-{}", n),
            memory_link(&format!("slave-{}", n), &published),
            &WorkerOptions::default(),
            Arc::clone(&stats),
        );
        inboxes.push(inbox);
        handles.push(handle);
    }
    let dispatcher = RelayDispatcher::new(inboxes, Arc::clone(&stats));

    let enqueued_at_ack = Arc::new(Mutex::new(Vec::new()));
    let mut ack_counters = Vec::new();
    for id in 0..5u64 {
        let mut delivery = MemoryDelivery::new(id, &events);
        delivery.stats = Some(Arc::clone(&stats));
        delivery.enqueued_at_ack = Arc::clone(&enqueued_at_ack);
        ack_counters.push(Arc::clone(&delivery.acks));

        dispatcher.handle(delivery).await.unwrap();
    }

    // Each ack saw only the copies of earlier deliveries
    let expected: Vec<u64> = (0..5u64).map(|id| id * workers as u64).collect();
    assert_eq!(*enqueued_at_ack.lock(), expected);
    for acks in &ack_counters {
        assert_eq!(acks.load(Ordering::SeqCst), 1);
    }

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.deliveries, 5);
    assert_eq!(snapshot.acked, 5);
    assert_eq!(snapshot.enqueued, 5 * workers as u64);

    for handle in &mut handles {
        handle.cancel();
        handle.wait_completed(Duration::from_secs(1)).await;
    }
}

#[tokio::test]
async fn test_ack_precedes_enqueue_without_workers() {
    assert_ack_precedes_enqueue(0).await;
}

#[tokio::test]
async fn test_ack_precedes_enqueue_single_worker() {
    assert_ack_precedes_enqueue(1).await;
}

#[tokio::test]
async fn test_ack_precedes_enqueue_many_workers() {
    assert_ack_precedes_enqueue(4).await;
}

#[tokio::test]
async fn test_ack_failure_still_fans_out() {
    let stats = Arc::new(RelayStats::new());
    let published = Arc::new(Mutex::new(Vec::new()));
    let (inbox, mut handle) = PublisherWorker::spawn(
        "slave",
        memory_link("slave", &published),
        &WorkerOptions::default(),
        Arc::clone(&stats),
    );
    let dispatcher = RelayDispatcher::new(vec![inbox], Arc::clone(&stats));

    let mut delivery = MemoryDelivery::new(7, &EventLog::default());
    delivery.fail_ack = true;
    dispatcher.handle(delivery).await.unwrap();

    eventually(|| published.lock().len() == 1).await;
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.ack_failures, 1);
    assert_eq!(snapshot.acked, 0);
    assert_eq!(snapshot.published, 1);

    handle.cancel();
    assert!(handle.wait_completed(Duration::from_secs(1)).await);
}

#[tokio::test]
async fn test_relay_end_to_end() {
    let (broker, tx) = MemoryBroker::with_master_stream();
    let mut ctx = RelayContext::start(&broker, &configuration(2)).await;
    let stats = ctx.stats();

    for id in 0..10 {
        tx.send(MemoryDelivery::new(id, &broker.events)).unwrap();
    }
    eventually(|| stats.snapshot().published == 20).await;

    // Per-slave order equals master order
    let expected: Vec<String> = (0..10).map(|id| format!("message-{}", id)).collect();
    assert_eq!(broker.published_to("slave-1"), expected);
    assert_eq!(broker.published_to("slave-2"), expected);

    let report = ShutdownCoordinator::new(ShutdownPolicy::AwaitCompletion { timeout_ms: 1000 })
        .shutdown(&mut ctx)
        .await;
    assert_eq!(
        report,
        ShutdownReport {
            cancelled: 2,
            completed: 2,
            forced: 0,
            consumer_aborted: false,
        }
    );

    for handle in ctx.workers() {
        assert_eq!(handle.state(), WorkerState::Cancelled);
    }
}

#[tokio::test]
async fn test_shutdown_stops_consumer_before_workers() {
    let (broker, _tx) = MemoryBroker::with_master_stream();
    let mut ctx = RelayContext::start(&broker, &configuration(2)).await;

    ShutdownCoordinator::new(ShutdownPolicy::AwaitCompletion { timeout_ms: 1000 })
        .shutdown(&mut ctx)
        .await;

    let events = broker.events.lock().clone();
    assert_eq!(events[0], "close master");
    assert!(events.contains(&"close slave-1".to_string()));
    assert!(events.contains(&"close slave-2".to_string()));
}

#[tokio::test]
async fn test_best_effort_shutdown_does_not_wait() {
    let (mut broker, _tx) = MemoryBroker::with_master_stream();
    broker.hang_on_close.push("slave-host-1".to_string());
    let mut ctx = RelayContext::start(&broker, &configuration(1)).await;

    let report = ShutdownCoordinator::default().shutdown(&mut ctx).await;

    assert_eq!(report.cancelled, 1);
    assert_eq!(report.completed, 0);
    assert_eq!(report.forced, 0);
}

#[tokio::test]
async fn test_await_completion_aborts_stuck_worker() {
    let (mut broker, _tx) = MemoryBroker::with_master_stream();
    broker.hang_on_close.push("slave-host-2".to_string());
    let mut ctx = RelayContext::start(&broker, &configuration(2)).await;

    let report = ShutdownCoordinator::new(ShutdownPolicy::AwaitCompletion { timeout_ms: 50 })
        .shutdown(&mut ctx)
        .await;

    assert_eq!(
        report,
        ShutdownReport {
            cancelled: 2,
            completed: 1,
            forced: 1,
            consumer_aborted: false,
        }
    );
    eventually(|| ctx.workers()[1].is_finished()).await;
}

#[tokio::test]
async fn test_shutdown_returns_when_consumer_blocks_on_full_mailbox() {
    let (mut broker, tx) = MemoryBroker::with_master_stream();
    broker.hang_on_publish.push("slave-host-1".to_string());
    let mut config = configuration(1);
    config.relay.mailbox_capacity = 1;
    config.relay.backpressure = BackpressurePolicy::Block;

    let mut ctx = RelayContext::start(&broker, &config).await;
    let stats = ctx.stats();

    // One in the stalled publish, one queued, the third blocks the dispatcher
    for id in 0..3 {
        tx.send(MemoryDelivery::new(id, &broker.events)).unwrap();
    }
    eventually(|| stats.snapshot().deliveries == 3).await;

    let coordinator = ShutdownCoordinator::new(ShutdownPolicy::AwaitCompletion { timeout_ms: 100 });
    let report = tokio::time::timeout(Duration::from_secs(3), coordinator.shutdown(&mut ctx))
        .await
        .expect("shutdown hung behind a blocked consumer");

    assert_eq!(
        report,
        ShutdownReport {
            cancelled: 1,
            completed: 0,
            forced: 1,
            consumer_aborted: true,
        }
    );
    assert!(broker.published_to("slave-1").is_empty());
}

#[tokio::test]
async fn test_termination_listener_runs_shutdown() {
    let (broker, _tx) = MemoryBroker::with_master_stream();
    let ctx = RelayContext::start(&broker, &configuration(3)).await;

    let (signal_tx, signal_rx) = oneshot::channel::<()>();
    let done = spawn_termination_listener(
        ctx,
        ShutdownCoordinator::new(ShutdownPolicy::AwaitCompletion { timeout_ms: 1000 }),
        async move {
            let _ = signal_rx.await;
        },
    );

    signal_tx.send(()).unwrap();
    let report = done.await.unwrap();
    assert_eq!(report.cancelled, 3);
    assert_eq!(report.completed, 3);
}

struct SlowHandler {
    started: Arc<Notify>,
    handled: Arc<AtomicUsize>,
}

impl DeliveryHandler for SlowHandler {
    async fn handle<D: Delivery>(&self, delivery: D) -> RelayResult<()> {
        self.started.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;
        delivery.ack().await?;
        self.handled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_consumer_stop_finishes_in_flight_delivery() {
    let events = EventLog::default();
    let (tx, rx) = mpsc::unbounded_channel();
    let source = MemorySource {
        deliveries: rx,
        events: Arc::clone(&events),
    };
    let handler = Arc::new(SlowHandler {
        started: Arc::new(Notify::new()),
        handled: Arc::new(AtomicUsize::new(0)),
    });

    tx.send(MemoryDelivery::new(1, &events)).unwrap();
    tx.send(MemoryDelivery::new(2, &events)).unwrap();

    let consumer = ConsumerHandle::spawn(source, Arc::clone(&handler));
    handler.started.notified().await;
    consumer.stop().await;

    // First delivery completed, second never dispatched
    assert_eq!(handler.handled.load(Ordering::SeqCst), 1);
    assert_eq!(*events.lock(), vec!["ack 1", "close master"]);
}

struct RejectingHandler;

impl DeliveryHandler for RejectingHandler {
    async fn handle<D: Delivery>(&self, _delivery: D) -> RelayResult<()> {
        Err(RelayError::MailboxClosed("rejecting".to_string()))
    }
}

#[tokio::test]
async fn test_handler_error_stops_consumer() {
    let events = EventLog::default();
    let (tx, rx) = mpsc::unbounded_channel();
    let source = MemorySource {
        deliveries: rx,
        events: Arc::clone(&events),
    };

    let consumer = ConsumerHandle::spawn(source, Arc::new(RejectingHandler));
    tx.send(MemoryDelivery::new(1, &events)).unwrap();

    eventually(|| consumer.is_finished()).await;
    assert_eq!(*events.lock(), vec!["close master"]);
}

#[tokio::test]
async fn test_master_stream_end_stops_consumer() {
    let (tx, rx) = mpsc::unbounded_channel::<MemoryDelivery>();
    let source = MemorySource {
        deliveries: rx,
        events: EventLog::default(),
    };

    let consumer = ConsumerHandle::spawn(source, Arc::new(RejectingHandler));
    drop(tx);

    eventually(|| consumer.is_finished()).await;
}
