//! The capability surface the adapter needs from a broker client.
//!
//! A [`Dialer`] opens one connection plus one channel. Everything after that goes through
//! the channel; the connection is only ever closed.

use std::time::Duration;

use bytes::Bytes;
use futures::stream::BoxStream;

use crate::topology::{ExchangeKind, QueueArguments};
use crate::Result;

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

/// An inbound message as handed out by a broker channel.
#[derive(Debug, Clone)]
pub struct RawDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub data: Bytes,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishProperties {
    pub content_type: Option<String>,
    pub delivery_mode: u8,
    pub expiration: Option<Duration>,
}

/// Ends when the channel or its connection dies.
pub type DeliveryStream = BoxStream<'static, RawDelivery>;

#[async_trait::async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self, uri: &str) -> Result<(Box<dyn BrokerConnection>, Box<dyn BrokerChannel>)>;
}

#[async_trait::async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn close(&self) -> Result<()>;
}

#[async_trait::async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn qos(&self, prefetch_count: u16) -> Result<()>;

    async fn confirm_select(&self) -> Result<()>;

    async fn exchange_declare(&self, name: &str, kind: ExchangeKind, durable: bool, auto_delete: bool)
        -> Result<()>;

    async fn queue_declare(
        &self,
        name: &str,
        durable: bool,
        auto_delete: bool,
        arguments: &QueueArguments,
    ) -> Result<()>;

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Resolves once the broker has taken the message, or confirmed it when confirms are on.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
        props: PublishProperties,
    ) -> Result<()>;

    async fn consume(&self, queue: &str, consumer_tag: &str, auto_ack: bool) -> Result<DeliveryStream>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
