//! Init-time properties and the immutable adapter configuration parsed from them.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::topology::ExchangeKind;
use crate::{Error, Result};

pub const HOST: &str = "host";
pub const CONSUMER_ID: &str = "consumerID";
pub const CONCURRENCY_MODE: &str = "concurrencyMode";
pub const RECONNECT_WAIT_SECONDS: &str = "reconnectWaitSeconds";
pub const DURABLE: &str = "durable";
pub const DELETED_WHEN_UNUSED: &str = "deletedWhenUnused";
pub const AUTO_ACK: &str = "autoAck";
pub const REQUEUE_IN_FAILURE: &str = "requeueInFailure";
pub const DELIVERY_MODE: &str = "deliveryMode";
pub const PREFETCH_COUNT: &str = "prefetchCount";
pub const EXCHANGE_KIND: &str = "exchangeKind";
pub const ENABLE_DEAD_LETTER: &str = "enableDeadLetter";
pub const MAX_LEN: &str = "maxLen";
pub const MAX_LEN_BYTES: &str = "maxLenBytes";
pub const TTL_IN_SECONDS: &str = "ttlInSeconds";
pub const PUBLISHER_CONFIRM: &str = "publisherConfirm";
pub const PUBLISH_MAX_RETRIES: &str = "publishMaxRetries";

/// Per-request keys.
pub const ROUTING_KEY: &str = "routingKey";

pub const DEFAULT_RECONNECT_WAIT: Duration = Duration::from_secs(3);
pub const DEFAULT_PUBLISH_MAX_RETRIES: usize = 2;

/// Free-form string properties, as handed over by the hosting runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub properties: HashMap<String, String>,
}

impl Metadata {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn with<K: Into<String>, V: Into<String>>(mut self, key: K, val: V) -> Self {
        self.properties.insert(key.into(), val.into());
        self
    }

    /// Exact key first, then a case-insensitive match.
    pub fn get(&self, key: &str) -> Option<&str> {
        if let Some(v) = self.properties.get(key) {
            return Some(v.as_str());
        }
        self.properties.iter().find(|(k, _)| k.eq_ignore_ascii_case(key)).map(|(_, v)| v.as_str())
    }

    #[inline]
    fn get_nonempty(&self, key: &str) -> Option<&str> {
        self.get(key).map(str::trim).filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>>
    where
        T::Err: fmt::Display,
    {
        match self.get_nonempty(key) {
            None => Ok(None),
            Some(v) => v
                .parse::<T>()
                .map(Some)
                .map_err(|e| Error::validation(format!("invalid {key} value {v:?}, {e}"))),
        }
    }

    fn bool(&self, key: &str, default: bool) -> Result<bool> {
        match self.get_nonempty(key) {
            None => Ok(default),
            Some(v) => amqp_pubsub_utils::parse_bool(v)
                .map_err(|e| Error::validation(format!("invalid {key} value, {e}"))),
        }
    }

    /// Integer seconds or a duration literal such as `1500ms`.
    fn duration(&self, key: &str) -> Result<Option<Duration>> {
        match self.get_nonempty(key) {
            None => Ok(None),
            Some(v) => {
                if let Ok(secs) = v.parse::<u64>() {
                    return Ok(Some(Duration::from_secs(secs)));
                }
                amqp_pubsub_utils::try_to_duration(v)
                    .map(Some)
                    .ok_or_else(|| Error::validation(format!("invalid {key} value {v:?}")))
            }
        }
    }
}

impl From<HashMap<String, String>> for Metadata {
    #[inline]
    fn from(properties: HashMap<String, String>) -> Self {
        Metadata { properties }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Metadata { properties: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConcurrencyMode {
    #[default]
    Parallel,
    Single,
}

impl fmt::Display for ConcurrencyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConcurrencyMode::Parallel => f.write_str("parallel"),
            ConcurrencyMode::Single => f.write_str("single"),
        }
    }
}

impl FromStr for ConcurrencyMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "parallel" => Ok(ConcurrencyMode::Parallel),
            "single" => Ok(ConcurrencyMode::Single),
            _ => Err(Error::validation(format!("invalid concurrencyMode {s:?}, expected parallel or single"))),
        }
    }
}

/// Adapter configuration, fixed at Init.
#[derive(Debug, Clone, Serialize)]
pub struct PubSubConfig {
    pub host: String,
    pub consumer_id: Option<String>,
    pub concurrency_mode: ConcurrencyMode,
    pub reconnect_wait: Duration,
    pub durable: bool,
    pub deleted_when_unused: bool,
    pub auto_ack: bool,
    pub requeue_in_failure: bool,
    pub delivery_mode: u8,
    pub prefetch_count: u16,
    pub exchange_kind: ExchangeKind,
    pub enable_dead_letter: bool,
    pub max_len: i64,
    pub max_len_bytes: i64,
    pub default_ttl: Option<Duration>,
    pub publisher_confirm: bool,
    pub publish_max_retries: usize,
}

impl PubSubConfig {
    pub fn from_metadata(md: &Metadata) -> Result<Self> {
        let host = md.get_nonempty(HOST).ok_or_else(|| Error::validation("missing RabbitMQ host"))?.to_string();
        let consumer_id = md.get_nonempty(CONSUMER_ID).map(ToString::to_string);

        let concurrency_mode = match md.get_nonempty(CONCURRENCY_MODE) {
            None => ConcurrencyMode::default(),
            Some(v) => v.parse()?,
        };
        let exchange_kind = match md.get_nonempty(EXCHANGE_KIND) {
            None => ExchangeKind::default(),
            Some(v) => v.parse()?,
        };

        let delivery_mode = md.parse::<u8>(DELIVERY_MODE)?.unwrap_or(0);
        if delivery_mode > 2 {
            return Err(Error::validation(format!(
                "invalid {DELIVERY_MODE} {delivery_mode}, expected 0, 1 or 2"
            )));
        }

        let max_len = md.parse::<i64>(MAX_LEN)?.unwrap_or(0);
        let max_len_bytes = md.parse::<i64>(MAX_LEN_BYTES)?.unwrap_or(0);
        if max_len < 0 || max_len_bytes < 0 {
            return Err(Error::validation("queue length limits must not be negative"));
        }

        let default_ttl = match md.parse::<u64>(TTL_IN_SECONDS)? {
            Some(0) | None => None,
            Some(secs) => Some(Duration::from_secs(secs)),
        };

        Ok(Self {
            host,
            consumer_id,
            concurrency_mode,
            reconnect_wait: md.duration(RECONNECT_WAIT_SECONDS)?.unwrap_or(DEFAULT_RECONNECT_WAIT),
            durable: md.bool(DURABLE, false)?,
            deleted_when_unused: md.bool(DELETED_WHEN_UNUSED, true)?,
            auto_ack: md.bool(AUTO_ACK, false)?,
            requeue_in_failure: md.bool(REQUEUE_IN_FAILURE, false)?,
            delivery_mode,
            prefetch_count: md.parse::<u16>(PREFETCH_COUNT)?.unwrap_or(0),
            exchange_kind,
            enable_dead_letter: md.bool(ENABLE_DEAD_LETTER, false)?,
            max_len,
            max_len_bytes,
            default_ttl,
            publisher_confirm: md.bool(PUBLISHER_CONFIRM, false)?,
            publish_max_retries: md.parse::<usize>(PUBLISH_MAX_RETRIES)?.unwrap_or(DEFAULT_PUBLISH_MAX_RETRIES),
        })
    }

    /// Subscriptions need a consumer identity to name their queue.
    #[inline]
    pub fn require_consumer_id(&self) -> Result<&str> {
        self.consumer_id.as_deref().ok_or_else(|| Error::validation("consumerID is required for subscriptions"))
    }

    #[inline]
    pub fn queue_name(&self, topic: &str) -> Result<String> {
        Ok(format!("{}-{}", self.require_consumer_id()?, topic))
    }
}

/// Message TTL carried by a single request, overriding the configured default.
pub(crate) fn request_ttl(md: &HashMap<String, String>) -> Result<Option<Duration>> {
    match md.get(TTL_IN_SECONDS).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(v) => v
            .parse::<u64>()
            .map(|secs| Some(Duration::from_secs(secs)))
            .map_err(|e| Error::validation(format!("invalid {TTL_IN_SECONDS} value {v:?}, {e}"))),
    }
}
