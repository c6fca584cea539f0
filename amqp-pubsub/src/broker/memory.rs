//! An in-process broker with exchanges, queues and bindings.
//!
//! Queues outlive sessions, so messages published while a subscriber reconnects are kept
//! and delivered once it consumes again. Closing a channel ends its delivery streams and
//! drops whatever it still held unacknowledged.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::{BrokerChannel, BrokerConnection, DeliveryStream, Dialer, PublishProperties, RawDelivery};
use crate::topology::{ExchangeKind, QueueArguments};
use crate::types::DashMap;
use crate::{Error, Result};

#[derive(Debug, Clone)]
struct Message {
    exchange: String,
    routing_key: String,
    data: Bytes,
    redelivered: bool,
}

struct MemoryQueue {
    tx: mpsc::UnboundedSender<Message>,
    rx: Mutex<mpsc::UnboundedReceiver<Message>>,
    len: AtomicUsize,
}

impl MemoryQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx: Mutex::new(rx), len: AtomicUsize::new(0) }
    }

    #[inline]
    fn push(&self, msg: Message) {
        if self.tx.send(msg).is_ok() {
            self.len.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn pop(&self) -> Option<Message> {
        let msg = self.rx.lock().await.recv().await;
        if msg.is_some() {
            self.len.fetch_sub(1, Ordering::SeqCst);
        }
        msg
    }
}

#[derive(Debug, Clone)]
struct Binding {
    exchange: String,
    queue: String,
    routing_key: String,
}

#[derive(Default)]
struct Inner {
    connects: AtomicUsize,
    closes: AtomicUsize,
    publishes: AtomicUsize,
    acks: AtomicUsize,
    nacks: AtomicUsize,
    exchanges: DashMap<String, ExchangeKind>,
    queues: DashMap<String, Arc<MemoryQueue>>,
    bindings: RwLock<Vec<Binding>>,
    failure_payload: RwLock<Option<Bytes>>,
    refuse_dial: AtomicBool,
}

/// Deterministic stand-in for a real broker, used by tests and local runs.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishing exactly this payload fails as if the channel had died.
    #[inline]
    pub fn with_failure_payload<B: Into<Bytes>>(self, payload: B) -> Self {
        self.set_failure_payload(Some(payload.into()));
        self
    }

    #[inline]
    pub fn set_failure_payload(&self, payload: Option<Bytes>) {
        *self.inner.failure_payload.write() = payload;
    }

    /// While set, every dial fails with a connection error.
    #[inline]
    pub fn refuse_dial(&self, refuse: bool) {
        self.inner.refuse_dial.store(refuse, Ordering::SeqCst);
    }

    #[inline]
    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn close_count(&self) -> usize {
        self.inner.closes.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn publish_count(&self) -> usize {
        self.inner.publishes.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn ack_count(&self) -> usize {
        self.inner.acks.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn nack_count(&self) -> usize {
        self.inner.nacks.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn queue_count(&self) -> usize {
        self.inner.queues.len()
    }

    #[inline]
    pub fn binding_count(&self) -> usize {
        self.inner.bindings.read().len()
    }

    #[inline]
    pub fn exchange_kind(&self, name: &str) -> Option<ExchangeKind> {
        self.inner.exchanges.get(name).map(|e| *e.value())
    }

    /// Messages waiting in a queue, not counting those handed out and unacknowledged.
    #[inline]
    pub fn queue_len(&self, name: &str) -> Option<usize> {
        self.inner.queues.get(name).map(|q| q.len.load(Ordering::SeqCst))
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<Arc<MemoryQueue>>> {
        if exchange.is_empty() {
            return Ok(self.inner.queues.get(routing_key).map(|q| vec![q.value().clone()]).unwrap_or_default());
        }
        let kind = match self.inner.exchanges.get(exchange) {
            Some(k) => *k.value(),
            None => return Err(Error::Broker(format!("NOT_FOUND - no exchange '{exchange}'"))),
        };
        let mut names = self
            .inner
            .bindings
            .read()
            .iter()
            .filter(|b| b.exchange == exchange)
            .filter(|b| match kind {
                ExchangeKind::Fanout | ExchangeKind::Headers => true,
                ExchangeKind::Direct => b.routing_key == routing_key,
                ExchangeKind::Topic => topic_matches(&b.routing_key, routing_key),
            })
            .map(|b| b.queue.clone())
            .collect::<Vec<_>>();
        names.sort();
        names.dedup();
        Ok(names.iter().filter_map(|n| self.inner.queues.get(n).map(|q| q.value().clone())).collect())
    }
}

#[async_trait::async_trait]
impl Dialer for MemoryBroker {
    async fn dial(&self, uri: &str) -> Result<(Box<dyn BrokerConnection>, Box<dyn BrokerChannel>)> {
        if self.inner.refuse_dial.load(Ordering::SeqCst) {
            return Err(Error::Connection(format!("dial {uri}: connection refused")));
        }
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        let conn_token = CancellationToken::new();
        let chan = ChannelInner {
            broker: self.clone(),
            token: conn_token.child_token(),
            next_tag: AtomicU64::new(0),
            unacked: DashMap::default(),
        };
        Ok((
            Box::new(MemoryConnection { broker: self.clone(), token: conn_token }),
            Box::new(MemoryChannel { inner: Arc::new(chan) }),
        ))
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    token: CancellationToken,
}

#[async_trait::async_trait]
impl BrokerConnection for MemoryConnection {
    async fn close(&self) -> Result<()> {
        self.broker.inner.closes.fetch_add(1, Ordering::SeqCst);
        self.token.cancel();
        Ok(())
    }
}

struct ChannelInner {
    broker: MemoryBroker,
    token: CancellationToken,
    next_tag: AtomicU64,
    unacked: DashMap<u64, (Arc<MemoryQueue>, Message)>,
}

impl ChannelInner {
    #[inline]
    fn ensure_open(&self) -> Result<()> {
        if self.token.is_cancelled() {
            Err(Error::channel_closed())
        } else {
            Ok(())
        }
    }
}

pub struct MemoryChannel {
    inner: Arc<ChannelInner>,
}

#[async_trait::async_trait]
impl BrokerChannel for MemoryChannel {
    async fn qos(&self, _prefetch_count: u16) -> Result<()> {
        self.inner.ensure_open()
    }

    async fn confirm_select(&self) -> Result<()> {
        self.inner.ensure_open()
    }

    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        _durable: bool,
        _auto_delete: bool,
    ) -> Result<()> {
        self.inner.ensure_open()?;
        let broker = &self.inner.broker.inner;
        let existing = *broker.exchanges.entry(name.to_string()).or_insert(kind).value();
        if existing != kind {
            return Err(Error::Broker(format!(
                "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{name}', received '{kind}' but current is '{existing}'"
            )));
        }
        Ok(())
    }

    async fn queue_declare(
        &self,
        name: &str,
        _durable: bool,
        _auto_delete: bool,
        _arguments: &QueueArguments,
    ) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.broker.inner.queues.entry(name.to_string()).or_insert_with(|| Arc::new(MemoryQueue::new()));
        Ok(())
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.inner.ensure_open()?;
        let broker = &self.inner.broker.inner;
        if !broker.queues.contains_key(queue) {
            return Err(Error::Broker(format!("NOT_FOUND - no queue '{queue}'")));
        }
        if !broker.exchanges.contains_key(exchange) {
            return Err(Error::Broker(format!("NOT_FOUND - no exchange '{exchange}'")));
        }
        let mut bindings = broker.bindings.write();
        if !bindings.iter().any(|b| b.exchange == exchange && b.queue == queue && b.routing_key == routing_key) {
            bindings.push(Binding {
                exchange: exchange.to_string(),
                queue: queue.to_string(),
                routing_key: routing_key.to_string(),
            });
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
        _props: PublishProperties,
    ) -> Result<()> {
        self.inner.ensure_open()?;
        let broker = &self.inner.broker;
        if broker.inner.failure_payload.read().as_ref().map(|f| *f == payload).unwrap_or(false) {
            return Err(Error::channel_closed());
        }
        let queues = broker.route(exchange, routing_key)?;
        for q in queues {
            q.push(Message {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                data: payload.clone(),
                redelivered: false,
            });
        }
        broker.inner.publishes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str, auto_ack: bool) -> Result<DeliveryStream> {
        self.inner.ensure_open()?;
        let queue = match self.inner.broker.inner.queues.get(queue) {
            Some(q) => q.value().clone(),
            None => return Err(Error::Broker(format!("NOT_FOUND - no queue '{queue}'"))),
        };
        let chan = self.inner.clone();
        let deliveries = futures::stream::unfold((queue, chan), move |(queue, chan)| async move {
            let msg = tokio::select! {
                biased;
                _ = chan.token.cancelled() => return None,
                msg = queue.pop() => msg?,
            };
            let delivery_tag = chan.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
            if !auto_ack {
                chan.unacked.insert(delivery_tag, (queue.clone(), msg.clone()));
            }
            let delivery = RawDelivery {
                delivery_tag,
                exchange: msg.exchange,
                routing_key: msg.routing_key,
                redelivered: msg.redelivered,
                data: msg.data,
            };
            Some((delivery, (queue, chan)))
        });
        Ok(deliveries.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.inner.ensure_open()?;
        if self.inner.unacked.remove(&delivery_tag).is_none() {
            return Err(Error::Broker(format!("PRECONDITION_FAILED - unknown delivery tag {delivery_tag}")));
        }
        self.inner.broker.inner.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.inner.ensure_open()?;
        let (queue, mut msg) = match self.inner.unacked.remove(&delivery_tag) {
            Some((_, entry)) => entry,
            None => {
                return Err(Error::Broker(format!("PRECONDITION_FAILED - unknown delivery tag {delivery_tag}")))
            }
        };
        if requeue {
            msg.redelivered = true;
            queue.push(msg);
        }
        self.inner.broker.inner.nacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.broker.inner.closes.fetch_add(1, Ordering::SeqCst);
        self.inner.token.cancel();
        self.inner.unacked.clear();
        Ok(())
    }
}

/// AMQP topic matching, `*` is exactly one word and `#` is zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(p: &[&str], k: &[&str]) -> bool {
        match (p.first(), k.first()) {
            (None, None) => true,
            (Some(&"#"), _) => matches(&p[1..], k) || (!k.is_empty() && matches(p, &k[1..])),
            (Some(&"*"), Some(_)) => matches(&p[1..], &k[1..]),
            (Some(pw), Some(kw)) if pw == kw => matches(&p[1..], &k[1..]),
            _ => false,
        }
    }
    let p = pattern.split('.').collect::<Vec<_>>();
    let k = if routing_key.is_empty() { Vec::new() } else { routing_key.split('.').collect::<Vec<_>>() };
    let p = if pattern.is_empty() { Vec::new() } else { p };
    matches(&p, &k)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_patterns() {
        assert!(topic_matches("orders.*", "orders.created"));
        assert!(!topic_matches("orders.*", "orders.created.eu"));
        assert!(topic_matches("orders.#", "orders.created.eu"));
        assert!(topic_matches("orders.#", "orders"));
        assert!(topic_matches("#", ""));
        assert!(topic_matches("#.eu", "orders.created.eu"));
        assert!(!topic_matches("orders.created", "orders.deleted"));
        assert!(topic_matches("", ""));
    }

    async fn setup(broker: &MemoryBroker, kind: ExchangeKind) -> Box<dyn BrokerChannel> {
        let (_conn, chan) = broker.dial("memory://").await.unwrap();
        chan.exchange_declare("ex", kind, false, true).await.unwrap();
        chan.queue_declare("q1", false, true, &QueueArguments::new()).await.unwrap();
        chan.queue_declare("q2", false, true, &QueueArguments::new()).await.unwrap();
        chan
    }

    #[tokio::test]
    async fn fanout_and_direct_routing() {
        let broker = MemoryBroker::new();
        let chan = setup(&broker, ExchangeKind::Fanout).await;
        chan.queue_bind("q1", "ex", "").await.unwrap();
        chan.queue_bind("q2", "ex", "").await.unwrap();
        chan.publish("ex", "any", Bytes::from_static(b"m"), PublishProperties::default()).await.unwrap();
        assert_eq!(broker.queue_len("q1"), Some(1));
        assert_eq!(broker.queue_len("q2"), Some(1));

        chan.exchange_declare("dx", ExchangeKind::Direct, false, true).await.unwrap();
        chan.queue_bind("q1", "dx", "red").await.unwrap();
        chan.publish("dx", "blue", Bytes::from_static(b"m"), PublishProperties::default()).await.unwrap();
        assert_eq!(broker.queue_len("q1"), Some(1));
        chan.publish("dx", "red", Bytes::from_static(b"m"), PublishProperties::default()).await.unwrap();
        assert_eq!(broker.queue_len("q1"), Some(2));
    }

    #[tokio::test]
    async fn redeclare_is_idempotent_but_kind_is_checked() {
        let broker = MemoryBroker::new();
        let chan = setup(&broker, ExchangeKind::Topic).await;
        chan.exchange_declare("ex", ExchangeKind::Topic, false, true).await.unwrap();
        chan.queue_declare("q1", false, true, &QueueArguments::new()).await.unwrap();
        chan.queue_bind("q1", "ex", "a.*").await.unwrap();
        chan.queue_bind("q1", "ex", "a.*").await.unwrap();
        assert_eq!(broker.queue_count(), 2);
        assert_eq!(broker.binding_count(), 1);
        let err = chan.exchange_declare("ex", ExchangeKind::Direct, false, true).await.unwrap_err();
        assert!(err.to_string().contains("PRECONDITION_FAILED"));
    }

    #[tokio::test]
    async fn consume_ack_nack_and_close() {
        let broker = MemoryBroker::new();
        let chan = setup(&broker, ExchangeKind::Fanout).await;
        chan.queue_bind("q1", "ex", "").await.unwrap();
        let mut deliveries = chan.consume("q1", "tag", false).await.unwrap();

        chan.publish("ex", "", Bytes::from_static(b"one"), PublishProperties::default()).await.unwrap();
        let d = deliveries.next().await.unwrap();
        assert_eq!(d.data, Bytes::from_static(b"one"));
        assert!(!d.redelivered);
        chan.nack(d.delivery_tag, true).await.unwrap();

        let d = deliveries.next().await.unwrap();
        assert!(d.redelivered);
        chan.ack(d.delivery_tag).await.unwrap();
        assert!(chan.ack(d.delivery_tag).await.is_err());
        assert_eq!((broker.ack_count(), broker.nack_count()), (1, 1));

        chan.close().await.unwrap();
        assert!(deliveries.next().await.is_none());
        assert!(chan.publish("ex", "", Bytes::new(), PublishProperties::default()).await.is_err());
        assert_eq!(broker.close_count(), 1);
    }

    #[tokio::test]
    async fn connection_close_ends_channel() {
        let broker = MemoryBroker::new().with_failure_payload("boom");
        let (conn, chan) = broker.dial("memory://").await.unwrap();
        chan.queue_declare("q", false, true, &QueueArguments::new()).await.unwrap();
        let err = chan.publish("", "q", Bytes::from_static(b"boom"), PublishProperties::default()).await.unwrap_err();
        assert!(err.must_reconnect());
        let mut deliveries = chan.consume("q", "tag", true).await.unwrap();
        conn.close().await.unwrap();
        assert!(deliveries.next().await.is_none());
        assert!(chan.qos(1).await.is_err());

        broker.refuse_dial(true);
        assert!(broker.dial("memory://").await.is_err());
        assert_eq!(broker.connect_count(), 1);
    }
}
