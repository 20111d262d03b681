//! Seams between the relay core and the wire-level broker clients
//!
//! The relay only needs four capabilities from a broker client: subscribe to
//! the master, receive deliveries, acknowledge them, and publish to a slave.
//! [`amqp::AmqpClient`] implements them over AMQP 0-9-1; tests substitute
//! in-memory doubles.

pub mod amqp;

use std::future::Future;

use crate::core::{Endpoint, RelayMessage, RelayResult};
use crate::security::SecurityContext;

pub use amqp::AmqpClient;

/// One message received from the master together with its acknowledgment
pub trait Delivery: Send + Sync + 'static {
    fn message(&self) -> &RelayMessage;

    /// Acknowledge the delivery to the master
    fn ack(&self) -> impl Future<Output = RelayResult<()>> + Send;
}

/// Stream of deliveries from a master subscription
pub trait DeliverySource: Send + 'static {
    type Delivery: Delivery;

    /// Next delivery, `None` once the subscription has ended
    fn next_delivery(&mut self) -> impl Future<Output = Option<Self::Delivery>> + Send;

    /// Cancel the subscription and close the connection
    fn close(self) -> impl Future<Output = ()> + Send;
}

/// Open connection to one slave, ready to publish
pub trait SlaveLink: Send + 'static {
    /// Publish to the slave's configured exchange and routing key
    fn publish(&mut self, message: &RelayMessage) -> impl Future<Output = RelayResult<()>> + Send;

    fn close(self) -> impl Future<Output = ()> + Send;
}

/// Capability invoked by the consumer loop for every delivery
///
/// An `Err` is terminal: the consumer loop stops.
pub trait DeliveryHandler: Send + Sync + 'static {
    fn handle<D: Delivery>(&self, delivery: D) -> impl Future<Output = RelayResult<()>> + Send;
}

/// Subscription parameters that do not come from the endpoint
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Empty lets the broker generate one
    pub consumer_tag: String,
    pub application_id: String,
}

/// Factory for master subscriptions and slave links
pub trait BrokerClient: Send + Sync + 'static {
    type Source: DeliverySource;
    type Link: SlaveLink;

    /// Connect to the master, declare its topology and start consuming
    fn subscribe(
        &self,
        endpoint: &Endpoint,
        security: &SecurityContext,
        options: &SubscribeOptions,
    ) -> impl Future<Output = RelayResult<Self::Source>> + Send;

    /// Connect to a slave and declare its exchange, queue and binding
    fn connect_publisher(
        &self,
        endpoint: &Endpoint,
        security: &SecurityContext,
        application_id: &str,
    ) -> impl Future<Output = RelayResult<Self::Link>> + Send;
}
