use bytes::Bytes;
use serde::Serialize;

/// Broker message properties carried from the master to every slave
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    /// 1 = transient, 2 = persistent
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
}

/// A message consumed from the master, as fanned out to the slaves
///
/// The payload is reference counted so each worker's copy is a cheap clone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayMessage {
    #[serde(skip)]
    pub payload: Bytes,
    /// Exchange the master delivered the message from
    pub exchange: String,
    /// Routing key the message was published with on the master
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
}

impl RelayMessage {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            exchange: String::new(),
            routing_key: String::new(),
            redelivered: false,
            properties: MessageProperties::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
