use amqprs::BasicProperties;
use amqprs::callbacks::{DefaultChannelCallback, DefaultConnectionCallback};
use amqprs::channel::{
    BasicAckArguments, BasicCancelArguments, BasicConsumeArguments, BasicPublishArguments,
    Channel, ConsumerMessage, ExchangeDeclareArguments, QueueBindArguments,
    QueueDeclareArguments,
};
use amqprs::connection::{Connection, OpenConnectionArguments};
use amqprs::tls::TlsAdaptor;
use bytes::Bytes;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use super::{BrokerClient, Delivery, DeliverySource, SlaveLink, SubscribeOptions};
use crate::core::{Endpoint, MessageProperties, RelayError, RelayMessage, RelayResult};
use crate::security::SecurityContext;

/// AMQP 0-9-1 broker client (RabbitMQ)
#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpClient;

/// Connection plus the single channel used on it
struct Session {
    connection: Connection,
    channel: Channel,
}

impl Session {
    async fn open(
        endpoint: &Endpoint,
        security: &SecurityContext,
        application_id: &str,
    ) -> RelayResult<Self> {
        let label = endpoint.label();
        let mut args = OpenConnectionArguments::new(
            &endpoint.host,
            endpoint.port,
            &endpoint.username,
            &endpoint.password,
        );
        if !endpoint.virtual_host.is_empty() {
            args.virtual_host(&endpoint.virtual_host);
        }
        if !application_id.is_empty() {
            args.connection_name(application_id);
        }
        if let (Some(config), Some(server_name)) = (security.client_config(), security.server_name())
        {
            args.tls_adaptor(TlsAdaptor::new(
                TlsConnector::from(config),
                server_name.to_string(),
            ));
        }

        debug!("Opening connection to {}", endpoint.redacted_url());
        let connection = Connection::open(&args)
            .await
            .map_err(|e| RelayError::connection(&label, e))?;
        connection
            .register_callback(DefaultConnectionCallback)
            .await
            .map_err(|e| RelayError::connection(&label, e))?;

        let channel = connection
            .open_channel(None)
            .await
            .map_err(|e| RelayError::connection(&label, e))?;
        channel
            .register_callback(DefaultChannelCallback)
            .await
            .map_err(|e| RelayError::connection(&label, e))?;

        let session = Self {
            connection,
            channel,
        };
        session.declare_topology(endpoint).await?;
        Ok(session)
    }

    /// Declare exchange and queue, then bind them with the routing key
    async fn declare_topology(&self, endpoint: &Endpoint) -> RelayResult<()> {
        let label = endpoint.label();

        if !endpoint.exchange.is_empty() && !endpoint.exchange_type.is_empty() {
            let args = ExchangeDeclareArguments::new(&endpoint.exchange, &endpoint.exchange_type)
                .durable(true)
                .finish();
            self.channel
                .exchange_declare(args)
                .await
                .map_err(|e| RelayError::connection(&label, e))?;
        }

        if !endpoint.queue_name.is_empty() {
            self.channel
                .queue_declare(QueueDeclareArguments::durable_client_named(
                    &endpoint.queue_name,
                ))
                .await
                .map_err(|e| RelayError::connection(&label, e))?;

            if !endpoint.exchange.is_empty() {
                self.channel
                    .queue_bind(QueueBindArguments::new(
                        &endpoint.queue_name,
                        &endpoint.exchange,
                        &endpoint.routing_key,
                    ))
                    .await
                    .map_err(|e| RelayError::connection(&label, e))?;
            }
        }

        Ok(())
    }

    async fn close(self, label: &str) {
        if let Err(e) = self.channel.close().await {
            debug!("Closing channel of {}: {}", label, e);
        }
        if let Err(e) = self.connection.close().await {
            debug!("Closing connection of {}: {}", label, e);
        }
    }
}

/// Master subscription
pub struct AmqpSource {
    session: Session,
    consumer_tag: String,
    messages: UnboundedReceiver<ConsumerMessage>,
    label: String,
}

/// Delivery bound to the channel it arrived on
pub struct AmqpDelivery {
    message: RelayMessage,
    channel: Channel,
    delivery_tag: u64,
}

/// Slave connection
pub struct AmqpLink {
    session: Session,
    exchange: String,
    routing_key: String,
    application_id: String,
    label: String,
}

impl BrokerClient for AmqpClient {
    type Source = AmqpSource;
    type Link = AmqpLink;

    async fn subscribe(
        &self,
        endpoint: &Endpoint,
        security: &SecurityContext,
        options: &SubscribeOptions,
    ) -> RelayResult<AmqpSource> {
        let label = endpoint.label();
        let session = Session::open(endpoint, security, &options.application_id).await?;

        let args = BasicConsumeArguments::new(&endpoint.queue_name, &options.consumer_tag);
        let (consumer_tag, messages) = session
            .channel
            .basic_consume_rx(args)
            .await
            .map_err(|e| RelayError::connection(&label, e))?;

        info!("Consuming from {} as {}", label, consumer_tag);
        Ok(AmqpSource {
            session,
            consumer_tag,
            messages,
            label,
        })
    }

    async fn connect_publisher(
        &self,
        endpoint: &Endpoint,
        security: &SecurityContext,
        application_id: &str,
    ) -> RelayResult<AmqpLink> {
        let session = Session::open(endpoint, security, application_id).await?;

        Ok(AmqpLink {
            session,
            exchange: endpoint.exchange.clone(),
            routing_key: endpoint.routing_key.clone(),
            application_id: application_id.to_string(),
            label: endpoint.label(),
        })
    }
}

impl DeliverySource for AmqpSource {
    type Delivery = AmqpDelivery;

    async fn next_delivery(&mut self) -> Option<AmqpDelivery> {
        loop {
            let ConsumerMessage {
                deliver,
                basic_properties,
                content,
                ..
            } = self.messages.recv().await?;

            let Some(deliver) = deliver else {
                warn!("Delivery from {} without deliver frame, skipped", self.label);
                continue;
            };

            let mut message = RelayMessage::new(Bytes::from(content.unwrap_or_default()));
            message.exchange = deliver.exchange().to_string();
            message.routing_key = deliver.routing_key().to_string();
            message.redelivered = deliver.redelivered();
            if let Some(props) = basic_properties.as_ref() {
                message.properties = message_properties(props);
            }

            return Some(AmqpDelivery {
                message,
                channel: self.session.channel.clone(),
                delivery_tag: deliver.delivery_tag(),
            });
        }
    }

    async fn close(self) {
        let args = BasicCancelArguments::new(&self.consumer_tag);
        if let Err(e) = self.session.channel.basic_cancel(args).await {
            debug!("Cancelling consumer on {}: {}", self.label, e);
        }
        self.session.close(&self.label).await;
    }
}

impl Delivery for AmqpDelivery {
    fn message(&self) -> &RelayMessage {
        &self.message
    }

    async fn ack(&self) -> RelayResult<()> {
        self.channel
            .basic_ack(BasicAckArguments::new(self.delivery_tag, false))
            .await
            .map_err(|e| RelayError::Ack(e.to_string()))
    }
}

impl SlaveLink for AmqpLink {
    async fn publish(&mut self, message: &RelayMessage) -> RelayResult<()> {
        let args = BasicPublishArguments::new(&self.exchange, &self.routing_key);
        let props = basic_properties(&message.properties, &self.application_id);

        self.session
            .channel
            .basic_publish(props, message.payload.to_vec(), args)
            .await
            .map_err(|e| RelayError::publish(&self.label, e))
    }

    async fn close(self) {
        self.session.close(&self.label).await;
    }
}

fn message_properties(props: &BasicProperties) -> MessageProperties {
    MessageProperties {
        content_type: props.content_type().cloned(),
        content_encoding: props.content_encoding().cloned(),
        message_id: props.message_id().cloned(),
        correlation_id: props.correlation_id().cloned(),
        delivery_mode: props.delivery_mode(),
        priority: props.priority(),
    }
}

fn basic_properties(properties: &MessageProperties, application_id: &str) -> BasicProperties {
    let mut props = BasicProperties::default();
    if let Some(content_type) = &properties.content_type {
        props.with_content_type(content_type);
    }
    if let Some(content_encoding) = &properties.content_encoding {
        props.with_content_encoding(content_encoding);
    }
    if let Some(message_id) = &properties.message_id {
        props.with_message_id(message_id);
    }
    if let Some(correlation_id) = &properties.correlation_id {
        props.with_correlation_id(correlation_id);
    }
    if let Some(delivery_mode) = properties.delivery_mode {
        props.with_delivery_mode(delivery_mode);
    }
    if let Some(priority) = properties.priority {
        props.with_priority(priority);
    }
    if !application_id.is_empty() {
        props.with_app_id(application_id);
    }
    props
}
