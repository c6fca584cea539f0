//! Broker backed by a real AMQP 0-9-1 connection.

use bytes::Bytes;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};

use super::{BrokerChannel, BrokerConnection, DeliveryStream, Dialer, PublishProperties, RawDelivery};
use crate::topology::{ExchangeKind, QueueArg, QueueArguments};
use crate::{Error, Result};

const REPLY_SUCCESS: u16 = 200;

#[inline]
fn broker_err(e: lapin::Error) -> Error {
    Error::Broker(e.to_string())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpDialer;

#[async_trait::async_trait]
impl Dialer for AmqpDialer {
    async fn dial(&self, uri: &str) -> Result<(Box<dyn BrokerConnection>, Box<dyn BrokerChannel>)> {
        let conn = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
        let channel = match conn.create_channel().await {
            Ok(ch) => ch,
            Err(e) => {
                if let Err(e) = conn.close(REPLY_SUCCESS, "channel open failed").await {
                    log::debug!("close after failed channel open, {e}");
                }
                return Err(Error::Connection(e.to_string()));
            }
        };
        Ok((Box::new(AmqpConnection(conn)), Box::new(AmqpChannel(channel))))
    }
}

struct AmqpConnection(Connection);

#[async_trait::async_trait]
impl BrokerConnection for AmqpConnection {
    async fn close(&self) -> Result<()> {
        self.0.close(REPLY_SUCCESS, "bye").await.map_err(broker_err)
    }
}

struct AmqpChannel(Channel);

fn field_table(args: &QueueArguments) -> FieldTable {
    let mut table = FieldTable::default();
    for (k, v) in args {
        let v = match v {
            QueueArg::Int(n) => AMQPValue::LongLongInt(*n),
            QueueArg::Str(s) => AMQPValue::LongString(s.clone().into()),
        };
        table.insert(k.clone().into(), v);
    }
    table
}

#[inline]
fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
    }
}

#[async_trait::async_trait]
impl BrokerChannel for AmqpChannel {
    async fn qos(&self, prefetch_count: u16) -> Result<()> {
        self.0.basic_qos(prefetch_count, BasicQosOptions::default()).await.map_err(broker_err)
    }

    async fn confirm_select(&self) -> Result<()> {
        self.0.confirm_select(ConfirmSelectOptions::default()).await.map_err(broker_err)
    }

    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
        auto_delete: bool,
    ) -> Result<()> {
        let opts = ExchangeDeclareOptions { durable, auto_delete, ..Default::default() };
        self.0.exchange_declare(name, exchange_kind(kind), opts, FieldTable::default()).await.map_err(broker_err)
    }

    async fn queue_declare(
        &self,
        name: &str,
        durable: bool,
        auto_delete: bool,
        arguments: &QueueArguments,
    ) -> Result<()> {
        let opts = QueueDeclareOptions { durable, auto_delete, ..Default::default() };
        self.0.queue_declare(name, opts, field_table(arguments)).await.map_err(broker_err)?;
        Ok(())
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.0
            .queue_bind(queue, exchange, routing_key, QueueBindOptions::default(), FieldTable::default())
            .await
            .map_err(broker_err)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
        props: PublishProperties,
    ) -> Result<()> {
        let mut properties = BasicProperties::default();
        if let Some(content_type) = props.content_type {
            properties = properties.with_content_type(content_type.into());
        }
        if props.delivery_mode > 0 {
            properties = properties.with_delivery_mode(props.delivery_mode);
        }
        if let Some(ttl) = props.expiration {
            properties = properties.with_expiration(ttl.as_millis().to_string().into());
        }
        let confirm = self
            .0
            .basic_publish(exchange, routing_key, BasicPublishOptions::default(), &payload, properties)
            .await
            .map_err(broker_err)?;
        match confirm.await.map_err(broker_err)? {
            Confirmation::Nack(_) => Err(Error::Broker(format!("publish to {exchange:?} was nacked by the broker"))),
            _ => Ok(()),
        }
    }

    async fn consume(&self, queue: &str, consumer_tag: &str, auto_ack: bool) -> Result<DeliveryStream> {
        let opts = BasicConsumeOptions { no_ack: auto_ack, ..Default::default() };
        let consumer =
            self.0.basic_consume(queue, consumer_tag, opts, FieldTable::default()).await.map_err(broker_err)?;
        let deliveries = consumer
            .take_while(|d| {
                if let Err(e) = d {
                    log::warn!("consumer stream ended, {e}");
                }
                futures::future::ready(d.is_ok())
            })
            .filter_map(|d| futures::future::ready(d.ok()))
            .map(|d| RawDelivery {
                delivery_tag: d.delivery_tag,
                exchange: d.exchange.to_string(),
                routing_key: d.routing_key.to_string(),
                redelivered: d.redelivered,
                data: Bytes::from(d.data),
            });
        Ok(deliveries.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.0.basic_ack(delivery_tag, BasicAckOptions::default()).await.map_err(broker_err)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let opts = BasicNackOptions { requeue, ..Default::default() };
        self.0.basic_nack(delivery_tag, opts).await.map_err(broker_err)
    }

    async fn close(&self) -> Result<()> {
        self.0.close(REPLY_SUCCESS, "bye").await.map_err(broker_err)
    }
}
