//! Subscription workers.
//!
//! Each subscription runs one consume loop that survives session replacement. A handler
//! error or the end of the delivery stream drains the loop, asks the connection manager
//! for a new session and consumes again with the same subscription record.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::manager::ConnectionManager;
use crate::metadata::{ConcurrencyMode, PubSubConfig, ROUTING_KEY};
use crate::session::{Delivery, Generation};
use crate::stats::Stats;
use crate::topology::{
    Declaration, ExchangeKind, QueueArg, QueueArguments, ARG_DEAD_LETTER_EXCHANGE, ARG_MAX_LENGTH,
    ARG_MAX_LENGTH_BYTES,
};
use crate::types::{DynHandler, Message, SubscribeRequest};
use crate::{Error, Result};

/// Pause after a failed redial before the loop tries again.
const FAILED_RECONNECT_PAUSE: Duration = Duration::from_secs(1);

pub struct Subscription {
    pub topic: String,
    pub queue_name: String,
    pub consumer_tag: String,
    pub mode: ConcurrencyMode,
    pub routing_keys: Vec<String>,
    handler: DynHandler,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("queue_name", &self.queue_name)
            .field("mode", &self.mode)
            .field("routing_keys", &self.routing_keys)
            .finish()
    }
}

impl Subscription {
    pub fn new(cfg: &PubSubConfig, req: &SubscribeRequest, handler: DynHandler) -> Result<Self> {
        let consumer_id = cfg.require_consumer_id()?;
        if req.topic.is_empty() {
            return Err(Error::validation("topic is required"));
        }
        let routing_keys = match req.metadata.get(ROUTING_KEY) {
            Some(keys) => keys.split(',').map(|k| k.trim().to_string()).collect::<Vec<_>>(),
            None => vec![String::new()],
        };
        Ok(Self {
            topic: req.topic.clone(),
            queue_name: cfg.queue_name(&req.topic)?,
            consumer_tag: format!("{consumer_id}:{}", req.topic),
            mode: cfg.concurrency_mode,
            routing_keys,
            handler,
        })
    }

    /// Everything that has to exist before this subscription can consume.
    pub fn declarations(&self, cfg: &PubSubConfig) -> Vec<Declaration> {
        let mut decls =
            vec![Declaration::exchange(&self.topic, cfg.exchange_kind, cfg.durable, cfg.deleted_when_unused)];

        let mut args = QueueArguments::new();
        if cfg.enable_dead_letter {
            let dlx = format!("dlx-{}", self.queue_name);
            let dlq = format!("dlq-{}", self.queue_name);
            decls.push(Declaration::exchange(&dlx, ExchangeKind::Fanout, cfg.durable, cfg.deleted_when_unused));
            decls.push(Declaration::queue(&dlq, cfg.durable, cfg.deleted_when_unused, QueueArguments::new()));
            decls.push(Declaration::binding(&dlq, &dlx, ""));
            args.insert(ARG_DEAD_LETTER_EXCHANGE.into(), QueueArg::Str(dlx));
        }
        if cfg.max_len > 0 {
            args.insert(ARG_MAX_LENGTH.into(), QueueArg::Int(cfg.max_len));
        }
        if cfg.max_len_bytes > 0 {
            args.insert(ARG_MAX_LENGTH_BYTES.into(), QueueArg::Int(cfg.max_len_bytes));
        }
        decls.push(Declaration::queue(&self.queue_name, cfg.durable, cfg.deleted_when_unused, args));

        for key in self.routing_keys.iter() {
            decls.push(Declaration::binding(&self.queue_name, &self.topic, key));
        }
        decls
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Consuming,
    Draining,
    Reconnecting,
    Stopped,
}

/// A running subscription, as kept by the adapter.
pub struct SubscriptionHandle {
    sub: Arc<Subscription>,
    state: Arc<RwLock<WorkerState>>,
    stop: CancellationToken,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl SubscriptionHandle {
    pub(crate) fn spawn(
        cfg: Arc<PubSubConfig>,
        manager: Arc<ConnectionManager>,
        stats: Arc<Stats>,
        sub: Subscription,
    ) -> Self {
        let sub = Arc::new(sub);
        let state = Arc::new(RwLock::new(WorkerState::Starting));
        let stop = manager.stopped().child_token();
        let worker = Worker { cfg, manager, stats, sub: sub.clone(), state: state.clone(), stop: stop.clone() };
        let join = tokio::spawn(worker.run());
        Self { sub, state, stop, join: Mutex::new(Some(join)) }
    }

    #[inline]
    pub fn subscription(&self) -> &Subscription {
        &self.sub
    }

    #[inline]
    pub fn state(&self) -> WorkerState {
        *self.state.read()
    }

    /// Signals the worker to stop, without waiting for a handler that is still running.
    #[inline]
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Waits for the worker task to finish.
    pub async fn join(&self) {
        let join = self.join.lock().take();
        if let Some(join) = join {
            if let Err(e) = join.await {
                log::warn!("subscription worker for {} ended abnormally, {e}", self.sub.topic);
            }
        }
    }
}

struct Worker {
    cfg: Arc<PubSubConfig>,
    manager: Arc<ConnectionManager>,
    stats: Arc<Stats>,
    sub: Arc<Subscription>,
    state: Arc<RwLock<WorkerState>>,
    stop: CancellationToken,
}

impl Worker {
    #[inline]
    fn set_state(&self, state: WorkerState) {
        *self.state.write() = state;
    }

    async fn run(self) {
        let topic = self.sub.topic.clone();
        log::debug!("subscription worker for {topic} started, mode {}", self.sub.mode);
        while !self.stop.is_cancelled() {
            let (observed, err) = match self.consume().await {
                Ok(()) => break,
                Err(e) => e,
            };
            if err.is_closed() || self.stop.is_cancelled() {
                break;
            }
            self.set_state(WorkerState::Draining);
            log::warn!("subscription {topic} on generation {observed} interrupted, {err}");

            self.set_state(WorkerState::Reconnecting);
            let res = tokio::select! {
                _ = self.stop.cancelled() => break,
                res = self.manager.reconnect(observed, &err) => res,
            };
            match res {
                Ok(()) => {}
                Err(e) if e.is_closed() => break,
                Err(e) => {
                    log::warn!("subscription {topic} reconnect failed, {e}");
                    tokio::select! {
                        _ = self.stop.cancelled() => break,
                        _ = tokio::time::sleep(self.cfg.reconnect_wait.max(FAILED_RECONNECT_PAUSE)) => {}
                    }
                }
            }
        }
        self.set_state(WorkerState::Stopped);
        log::debug!("subscription worker for {topic} stopped");
    }

    /// Consumes on the live session until stopped or until the session has to be replaced.
    async fn consume(&self) -> std::result::Result<(), (Generation, Error)> {
        let session = self.manager.session_or_observed()?;
        let generation = session.generation();

        for decl in self.sub.declarations(&self.cfg) {
            self.manager.declare(&session, decl).await.map_err(|e| (generation, e))?;
        }
        let mut deliveries = session
            .consume(&self.sub.topic, &self.sub.queue_name, &self.sub.consumer_tag, self.cfg.auto_ack)
            .await
            .map_err(|e| (generation, e))?;
        self.set_state(WorkerState::Consuming);
        log::debug!("consuming {} on generation {generation}", self.sub.queue_name);

        // Fresh per session, so handler errors from an older generation land nowhere.
        let (err_tx, mut err_rx) = mpsc::channel::<Error>(1);
        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => return Ok(()),
                Some(e) = err_rx.recv() => return Err((generation, e)),
                delivery = deliveries.next() => {
                    let delivery = match delivery {
                        Some(d) => d,
                        None => return Err((generation, Error::Broker("delivery stream closed".into()))),
                    };
                    self.stats.deliveries.inc();
                    match self.sub.mode {
                        ConcurrencyMode::Single => {
                            dispatch(&self.cfg, &self.sub, delivery).await.map_err(|e| (generation, e))?;
                        }
                        ConcurrencyMode::Parallel => {
                            let cfg = self.cfg.clone();
                            let sub = self.sub.clone();
                            let err_tx = err_tx.clone();
                            tokio::spawn(async move {
                                if let Err(e) = dispatch(&cfg, &sub, delivery).await {
                                    let _ = err_tx.try_send(e);
                                }
                            });
                        }
                    }
                }
            }
        }
    }
}

/// Runs the handler for one delivery and settles it with the broker.
async fn dispatch(cfg: &PubSubConfig, sub: &Subscription, delivery: Delivery) -> Result<()> {
    let mut metadata = HashMap::new();
    if !delivery.routing_key.is_empty() {
        metadata.insert(ROUTING_KEY.to_string(), delivery.routing_key.clone());
    }
    let msg = Message { topic: sub.topic.clone(), data: delivery.data.clone(), metadata };

    match (sub.handler)(msg).await {
        Ok(()) => {
            if !cfg.auto_ack {
                delivery.ack().await?;
            }
            Ok(())
        }
        Err(e) => {
            log::warn!("handler for {} failed on tag {}, {e}", sub.topic, delivery.delivery_tag);
            if !cfg.auto_ack {
                if let Err(ne) = delivery.nack(cfg.requeue_in_failure).await {
                    log::debug!("nack of tag {} failed, {ne}", delivery.delivery_tag);
                }
            }
            Err(Error::Delivery(e.to_string()))
        }
    }
}
