//! One connection plus one channel, stamped with the generation that created it.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;

use crate::broker::{BrokerChannel, BrokerConnection, PublishProperties};
use crate::stats::Stats;
use crate::topology::Declaration;
use crate::{Error, Result};

pub type Generation = u64;

pub struct Session {
    generation: Generation,
    conn: Box<dyn BrokerConnection>,
    channel: Box<dyn BrokerChannel>,
    declared: Mutex<HashSet<Declaration>>,
    closed: AtomicBool,
    stats: Arc<Stats>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("generation", &self.generation)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Session {
    pub(crate) fn new(
        generation: Generation,
        conn: Box<dyn BrokerConnection>,
        channel: Box<dyn BrokerChannel>,
        stats: Arc<Stats>,
    ) -> Self {
        Self { generation, conn, channel, declared: Mutex::new(HashSet::new()), closed: AtomicBool::new(false), stats }
    }

    #[inline]
    pub fn generation(&self) -> Generation {
        self.generation
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    #[inline]
    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::channel_closed())
        } else {
            Ok(())
        }
    }

    #[inline]
    pub(crate) fn is_declared(&self, decl: &Declaration) -> bool {
        self.declared.lock().contains(decl)
    }

    pub(crate) async fn qos(&self, prefetch_count: u16) -> Result<()> {
        self.ensure_open()?;
        self.channel.qos(prefetch_count).await
    }

    pub(crate) async fn confirm_select(&self) -> Result<()> {
        self.ensure_open()?;
        self.channel.confirm_select().await
    }

    /// Applies a declaration unless this session already has it.
    pub(crate) async fn declare(&self, decl: &Declaration) -> Result<()> {
        self.ensure_open()?;
        if self.is_declared(decl) {
            return Ok(());
        }
        match decl {
            Declaration::Exchange { name, kind, durable, auto_delete } => {
                self.channel.exchange_declare(name, *kind, *durable, *auto_delete).await?
            }
            Declaration::Queue { name, durable, auto_delete, arguments } => {
                self.channel.queue_declare(name, *durable, *auto_delete, arguments).await?
            }
            Declaration::Binding { queue, exchange, routing_key } => {
                self.channel.queue_bind(queue, exchange, routing_key).await?
            }
        }
        log::debug!("generation {} declared {decl}", self.generation);
        self.declared.lock().insert(decl.clone());
        Ok(())
    }

    pub(crate) async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
        props: PublishProperties,
    ) -> Result<()> {
        self.ensure_open()?;
        self.channel.publish(exchange, routing_key, payload, props).await
    }

    /// Deliveries from this session, each bound to it for acknowledgement.
    pub(crate) async fn consume(
        self: &Arc<Self>,
        topic: &str,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<BoxStream<'static, Delivery>> {
        self.ensure_open()?;
        let raw = self.channel.consume(queue, consumer_tag, auto_ack).await?;
        let session = self.clone();
        let topic = topic.to_string();
        Ok(raw
            .map(move |d| Delivery {
                topic: topic.clone(),
                data: d.data,
                delivery_tag: d.delivery_tag,
                exchange: d.exchange,
                routing_key: d.routing_key,
                redelivered: d.redelivered,
                session: session.clone(),
            })
            .boxed())
    }

    /// Closes the channel, then the connection. Only the first call does anything.
    pub(crate) async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.channel.close().await {
            log::debug!("generation {} channel close, {e}", self.generation);
        }
        self.stats.closes.inc();
        if let Err(e) = self.conn.close().await {
            log::debug!("generation {} connection close, {e}", self.generation);
        }
        self.stats.closes.inc();
    }
}

/// One inbound message, acknowledged against the session that produced it.
pub struct Delivery {
    pub topic: String,
    pub data: Bytes,
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    session: Arc<Session>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("topic", &self.topic)
            .field("delivery_tag", &self.delivery_tag)
            .field("generation", &self.session.generation)
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

impl Delivery {
    #[inline]
    pub fn generation(&self) -> Generation {
        self.session.generation
    }

    /// Whether the session that produced this delivery has been superseded.
    #[inline]
    pub fn is_stale(&self) -> bool {
        self.session.is_closed()
    }

    /// Acknowledging on a superseded session is ignored.
    pub async fn ack(&self) -> Result<()> {
        if self.is_stale() {
            log::debug!("ignore ack of tag {} on closed generation {}", self.delivery_tag, self.generation());
            return Ok(());
        }
        match self.session.channel.ack(self.delivery_tag).await {
            Ok(()) => {
                self.session.stats.acks.inc();
                Ok(())
            }
            Err(_) if self.is_stale() => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn nack(&self, requeue: bool) -> Result<()> {
        if self.is_stale() {
            log::debug!("ignore nack of tag {} on closed generation {}", self.delivery_tag, self.generation());
            return Ok(());
        }
        match self.session.channel.nack(self.delivery_tag, requeue).await {
            Ok(()) => {
                self.session.stats.nacks.inc();
                Ok(())
            }
            Err(_) if self.is_stale() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::broker::Dialer;
    use crate::topology::{ExchangeKind, QueueArguments};

    async fn session(broker: &MemoryBroker, generation: Generation) -> Arc<Session> {
        let (conn, chan) = broker.dial("memory://").await.unwrap();
        Arc::new(Session::new(generation, conn, chan, Arc::new(Stats::default())))
    }

    #[tokio::test]
    async fn close_runs_once_and_counts_two() {
        let broker = MemoryBroker::new();
        let s = session(&broker, 1).await;
        s.close().await;
        s.close().await;
        assert_eq!(broker.close_count(), 2);
        assert_eq!(s.stats.closes.count(), 2);
        let err = s.publish("", "q", Bytes::new(), PublishProperties::default()).await.unwrap_err();
        assert!(err.to_string().contains(crate::ERROR_CHANNEL_CONNECTION));
    }

    #[tokio::test]
    async fn stale_ack_is_ignored() {
        let broker = MemoryBroker::new();
        let s = session(&broker, 7).await;
        let ex = Declaration::exchange("t", ExchangeKind::Fanout, false, true);
        let q = Declaration::queue("c-t", false, true, QueueArguments::new());
        let b = Declaration::binding("c-t", "t", "");
        for d in [&ex, &q, &b, &ex] {
            s.declare(d).await.unwrap();
        }
        assert!(s.is_declared(&b));

        let mut deliveries = s.consume("t", "c-t", "tag", false).await.unwrap();
        s.publish("t", "", Bytes::from_static(b"hello"), PublishProperties::default()).await.unwrap();
        let d = deliveries.next().await.unwrap();
        assert_eq!(d.generation(), 7);
        assert_eq!(d.topic, "t");

        s.close().await;
        assert!(d.is_stale());
        d.ack().await.unwrap();
        d.nack(false).await.unwrap();
        assert_eq!(broker.ack_count(), 0);
        assert_eq!(broker.nack_count(), 0);
    }
}
