use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use once_cell::sync::OnceCell;

use crate::broker::Dialer;
use crate::manager::ConnectionManager;
use crate::metadata::{Metadata, PubSubConfig};
use crate::publisher::Publisher;
use crate::stats::Stats;
use crate::subscriber::{Subscription, SubscriptionHandle, WorkerState};
use crate::types::{DashMap, DynHandler, Feature, PublishRequest, SubscribeRequest, Topic};
use crate::{Error, Result};

/// The messaging contract the hosting runtime drives.
#[async_trait::async_trait]
pub trait PubSub: Send + Sync {
    async fn init(&self, metadata: Metadata) -> Result<()>;

    fn features(&self) -> Vec<Feature>;

    async fn publish(&self, req: PublishRequest) -> Result<()>;

    /// Registers the handler and returns once its consume loop is running in the background.
    async fn subscribe(&self, req: SubscribeRequest, handler: DynHandler) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

struct Inner {
    cfg: Arc<PubSubConfig>,
    manager: Arc<ConnectionManager>,
    publisher: Publisher,
    subscriptions: DashMap<Topic, SubscriptionHandle>,
}

/// RabbitMQ-backed pub/sub adapter.
pub struct RabbitMq {
    dialer: Arc<dyn Dialer>,
    stats: Arc<Stats>,
    inner: OnceCell<Inner>,
}

impl RabbitMq {
    pub fn new(dialer: Arc<dyn Dialer>) -> Self {
        Self { dialer, stats: Arc::new(Stats::default()), inner: OnceCell::new() }
    }

    #[cfg(feature = "amqp")]
    #[inline]
    pub fn amqp() -> Self {
        Self::new(Arc::new(crate::broker::amqp::AmqpDialer))
    }

    #[inline]
    fn inner(&self) -> Result<&Inner> {
        self.inner.get().ok_or_else(|| Error::validation("pubsub is not initialized"))
    }

    #[inline]
    pub fn config(&self) -> Option<&PubSubConfig> {
        self.inner.get().map(|i| i.cfg.as_ref())
    }

    #[inline]
    pub fn stats(&self) -> serde_json::Value {
        self.stats.to_json()
    }

    /// Stops the worker for `topic`. Its exchange, queue and bindings stay declared.
    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let inner = self.inner()?;
        match inner.subscriptions.remove(topic) {
            Some((_, handle)) => {
                handle.stop();
                self.stats.subscriptions.dec();
                log::info!("unsubscribed from {topic}");
                Ok(())
            }
            None => Err(Error::validation(format!("no subscription for topic {topic:?}"))),
        }
    }

    #[inline]
    pub fn subscription_state(&self, topic: &str) -> Option<WorkerState> {
        self.inner.get()?.subscriptions.get(topic).map(|h| h.state())
    }
}

#[async_trait::async_trait]
impl PubSub for RabbitMq {
    async fn init(&self, metadata: Metadata) -> Result<()> {
        if self.inner.get().is_some() {
            return Err(Error::validation("pubsub is already initialized"));
        }
        let cfg = Arc::new(PubSubConfig::from_metadata(&metadata)?);
        let manager = Arc::new(ConnectionManager::new(cfg.clone(), self.dialer.clone(), self.stats.clone()));
        manager.connect().await?;
        let publisher = Publisher::new(cfg.clone(), manager.clone(), self.stats.clone());
        let inner = Inner { cfg, manager: manager.clone(), publisher, subscriptions: DashMap::default() };
        if self.inner.set(inner).is_err() {
            manager.close().await;
            return Err(Error::validation("pubsub is already initialized"));
        }
        Ok(())
    }

    #[inline]
    fn features(&self) -> Vec<Feature> {
        vec![Feature::MessageTtl]
    }

    async fn publish(&self, req: PublishRequest) -> Result<()> {
        self.inner()?.publisher.publish(&req).await
    }

    async fn subscribe(&self, req: SubscribeRequest, handler: DynHandler) -> Result<()> {
        let inner = self.inner()?;
        let sub = Subscription::new(&inner.cfg, &req, handler)?;
        if inner.manager.is_stopped() {
            return Err(Error::Closed);
        }
        if inner.subscriptions.contains_key(&req.topic) {
            return Err(Error::validation(format!("topic {:?} is already subscribed", req.topic)));
        }

        // Declare now so a publish issued right after subscribe is routed to the queue.
        let declarations = sub.declarations(&inner.cfg);
        match inner.manager.session() {
            Ok(session) => {
                for decl in declarations {
                    if let Err(e) = inner.manager.declare(&session, decl).await {
                        log::warn!("declare for subscription {} failed, {e}", req.topic);
                        return Err(e);
                    }
                }
            }
            // The worker declares on the first session it gets.
            Err(e) => log::warn!("no session to declare subscription {} on, {e}", req.topic),
        }

        match inner.subscriptions.entry(req.topic.clone()) {
            Entry::Occupied(_) => {
                return Err(Error::validation(format!("topic {:?} is already subscribed", req.topic)));
            }
            Entry::Vacant(entry) => {
                log::info!("subscribed to {} with queue {}, mode {}", sub.topic, sub.queue_name, sub.mode);
                let handle =
                    SubscriptionHandle::spawn(inner.cfg.clone(), inner.manager.clone(), self.stats.clone(), sub);
                entry.insert(handle);
            }
        }
        self.stats.subscriptions.inc();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let inner = match self.inner.get() {
            Some(inner) => inner,
            None => return Ok(()),
        };
        for item in inner.subscriptions.iter() {
            item.value().stop();
        }
        inner.manager.close().await;
        Ok(())
    }
}
