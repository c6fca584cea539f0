use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};

pub type DashMap<K, V> = dashmap::DashMap<K, V, ahash::RandomState>;

pub type Topic = String;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishRequest {
    pub topic: Topic,
    pub data: Bytes,
    /// Defaults to `text/plain` when unset.
    pub content_type: Option<String>,
    /// Per-request properties, `routingKey` and `ttlInSeconds` are understood.
    pub metadata: HashMap<String, String>,
}

impl PublishRequest {
    #[inline]
    pub fn new<T: Into<Topic>, D: Into<Bytes>>(topic: T, data: D) -> Self {
        Self { topic: topic.into(), data: data.into(), content_type: None, metadata: HashMap::new() }
    }

    #[inline]
    pub fn content_type<C: Into<String>>(mut self, content_type: C) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    #[inline]
    pub fn metadata<K: Into<String>, V: Into<String>>(mut self, key: K, val: V) -> Self {
        self.metadata.insert(key.into(), val.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub topic: Topic,
    /// Per-request properties, `routingKey` holds comma-separated binding keys.
    pub metadata: HashMap<String, String>,
}

impl SubscribeRequest {
    #[inline]
    pub fn new<T: Into<Topic>>(topic: T) -> Self {
        Self { topic: topic.into(), metadata: HashMap::new() }
    }

    #[inline]
    pub fn metadata<K: Into<String>, V: Into<String>>(mut self, key: K, val: V) -> Self {
        self.metadata.insert(key.into(), val.into());
        self
    }
}

/// What a subscription handler receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: Topic,
    pub data: Bytes,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Feature {
    MessageTtl,
}

/// An error return nacks the delivery and recycles the session.
pub type HandlerResult = anyhow::Result<()>;

pub trait HandlerFn: 'static + Sync + Send + Fn(Message) -> BoxFuture<'static, HandlerResult> {}

impl<T> HandlerFn for T where T: 'static + Sync + Send + ?Sized + Fn(Message) -> BoxFuture<'static, HandlerResult> {}

pub type DynHandler = Arc<dyn HandlerFn>;

/// Wraps an async closure into a handler.
///
/// ```
/// use amqp_pubsub::handler_fn;
///
/// let handler = handler_fn(|msg| async move {
///     println!("{} bytes on {}", msg.data.len(), msg.topic);
///     Ok(())
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> DynHandler
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |msg: Message| f(msg).boxed())
}
