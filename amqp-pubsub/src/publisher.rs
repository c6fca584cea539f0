use std::sync::Arc;

use crate::broker::PublishProperties;
use crate::manager::ConnectionManager;
use crate::metadata::{request_ttl, PubSubConfig, ROUTING_KEY};
use crate::session::Session;
use crate::stats::Stats;
use crate::topology::Declaration;
use crate::types::PublishRequest;
use crate::{Error, Result};

const DEFAULT_CONTENT_TYPE: &str = "text/plain";

/// Publishes against the live session, reconnecting and retrying a bounded number of times.
pub struct Publisher {
    cfg: Arc<PubSubConfig>,
    manager: Arc<ConnectionManager>,
    stats: Arc<Stats>,
}

impl Publisher {
    pub fn new(cfg: Arc<PubSubConfig>, manager: Arc<ConnectionManager>, stats: Arc<Stats>) -> Self {
        Self { cfg, manager, stats }
    }

    pub async fn publish(&self, req: &PublishRequest) -> Result<()> {
        if self.manager.is_stopped() {
            return Err(Error::Closed);
        }
        if req.topic.is_empty() {
            return Err(Error::validation("topic is required"));
        }
        let props = PublishProperties {
            content_type: Some(req.content_type.clone().unwrap_or_else(|| DEFAULT_CONTENT_TYPE.into())),
            delivery_mode: self.cfg.delivery_mode,
            expiration: request_ttl(&req.metadata)?.or(self.cfg.default_ttl),
        };

        let mut retries = 0;
        loop {
            let (observed, res) = match self.manager.session_or_observed() {
                Ok(session) => (session.generation(), self.publish_sync(&session, req, props.clone()).await),
                Err((observed, e)) => (observed, Err(e)),
            };
            let err = match res {
                Ok(()) => {
                    self.stats.publishes.inc();
                    return Ok(());
                }
                Err(e) => e,
            };
            if err.is_closed() {
                self.stats.publish_failures.inc();
                return Err(err);
            }
            if retries >= self.cfg.publish_max_retries || !err.must_reconnect() {
                self.stats.publish_failures.inc();
                log::warn!("publish to {} failed after {retries} retries, {err}", req.topic);
                return Err(Error::Publish { topic: req.topic.clone(), reason: err.to_string() });
            }
            retries += 1;
            log::debug!("publish to {} failed on generation {observed}, {err}", req.topic);
            if let Err(e) = self.manager.reconnect(observed, &err).await {
                if e.is_closed() {
                    self.stats.publish_failures.inc();
                    return Err(e);
                }
                log::warn!("reconnect for publish to {} failed, {e}", req.topic);
            }
        }
    }

    async fn publish_sync(
        &self,
        session: &Session,
        req: &PublishRequest,
        props: PublishProperties,
    ) -> Result<()> {
        let exchange =
            Declaration::exchange(&req.topic, self.cfg.exchange_kind, self.cfg.durable, self.cfg.deleted_when_unused);
        self.manager.declare(session, exchange).await?;
        let routing_key = req.metadata.get(ROUTING_KEY).map(String::as_str).unwrap_or_default();
        session.publish(&req.topic, routing_key, req.data.clone(), props).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::metadata::{Metadata, PUBLISH_MAX_RETRIES, RECONNECT_WAIT_SECONDS};
    use crate::ERROR_CHANNEL_CONNECTION;

    async fn publisher(broker: &MemoryBroker, retries: &str) -> (Publisher, Arc<ConnectionManager>, Arc<Stats>) {
        let md = Metadata::new()
            .with("host", "memory://")
            .with(RECONNECT_WAIT_SECONDS, "0")
            .with(PUBLISH_MAX_RETRIES, retries);
        let cfg = Arc::new(PubSubConfig::from_metadata(&md).unwrap());
        let stats = Arc::new(Stats::default());
        let manager = Arc::new(ConnectionManager::new(cfg.clone(), Arc::new(broker.clone()), stats.clone()));
        manager.connect().await.unwrap();
        (Publisher::new(cfg, manager.clone(), stats.clone()), manager, stats)
    }

    #[tokio::test]
    async fn retry_limit_is_configurable() {
        let broker = MemoryBroker::new().with_failure_payload(ERROR_CHANNEL_CONNECTION);
        let (p, _m, stats) = publisher(&broker, "4").await;
        let err = p.publish(&PublishRequest::new("t", ERROR_CHANNEL_CONNECTION)).await.unwrap_err();
        assert!(err.is_publish());
        assert_eq!(broker.connect_count(), 5);
        assert_eq!(broker.close_count(), 8);
        assert_eq!(stats.reconnects.count(), 4);
        assert_eq!(stats.publish_failures.count(), 1);
    }

    #[tokio::test]
    async fn zero_retries_fail_without_reconnect() {
        let broker = MemoryBroker::new().with_failure_payload(ERROR_CHANNEL_CONNECTION);
        let (p, _m, _stats) = publisher(&broker, "0").await;
        assert!(p.publish(&PublishRequest::new("t", ERROR_CHANNEL_CONNECTION)).await.unwrap_err().is_publish());
        assert_eq!((broker.connect_count(), broker.close_count()), (1, 0));
    }

    #[tokio::test]
    async fn recovers_when_session_is_gone() {
        let broker = MemoryBroker::new();
        let (p, m, stats) = publisher(&broker, "2").await;
        m.session().unwrap().close().await;
        p.publish(&PublishRequest::new("t", "hello")).await.unwrap();
        assert_eq!(broker.connect_count(), 2);
        assert_eq!(broker.publish_count(), 1);
        assert_eq!(stats.publishes.count(), 1);
        assert_eq!(m.topology_len(), 1);
    }

    #[tokio::test]
    async fn empty_topic_and_bad_ttl_are_rejected() {
        let broker = MemoryBroker::new();
        let (p, _m, _stats) = publisher(&broker, "2").await;
        assert!(p.publish(&PublishRequest::new("", "x")).await.unwrap_err().is_validation());
        let req = PublishRequest::new("t", "x").metadata(crate::metadata::TTL_IN_SECONDS, "soon");
        assert!(p.publish(&req).await.unwrap_err().is_validation());
        assert_eq!(broker.connect_count(), 1);
    }
}
