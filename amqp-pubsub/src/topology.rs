//! Exchange, queue and binding declarations.
//!
//! Every declaration made through the adapter is recorded once, in the order it was first
//! made, and replayed verbatim on each new session. Declarations are idempotent on the
//! broker, so replaying a recorded topology onto a session that already has it is harmless.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const ARG_MAX_LENGTH: &str = "x-max-length";
pub const ARG_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";
pub const ARG_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Fanout,
    Topic,
    Direct,
    Headers,
}

impl ExchangeKind {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Direct => "direct",
            ExchangeKind::Headers => "headers",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fanout" => Ok(ExchangeKind::Fanout),
            "topic" => Ok(ExchangeKind::Topic),
            "direct" => Ok(ExchangeKind::Direct),
            "headers" => Ok(ExchangeKind::Headers),
            _ => Err(Error::validation(format!("invalid exchange kind {s:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueArg {
    Int(i64),
    Str(String),
}

pub type QueueArguments = BTreeMap<String, QueueArg>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Declaration {
    Exchange { name: String, kind: ExchangeKind, durable: bool, auto_delete: bool },
    Queue { name: String, durable: bool, auto_delete: bool, arguments: QueueArguments },
    Binding { queue: String, exchange: String, routing_key: String },
}

impl Declaration {
    #[inline]
    pub fn exchange<N: Into<String>>(name: N, kind: ExchangeKind, durable: bool, auto_delete: bool) -> Self {
        Declaration::Exchange { name: name.into(), kind, durable, auto_delete }
    }

    #[inline]
    pub fn queue<N: Into<String>>(name: N, durable: bool, auto_delete: bool, arguments: QueueArguments) -> Self {
        Declaration::Queue { name: name.into(), durable, auto_delete, arguments }
    }

    #[inline]
    pub fn binding<Q: Into<String>, E: Into<String>, K: Into<String>>(queue: Q, exchange: E, routing_key: K) -> Self {
        Declaration::Binding { queue: queue.into(), exchange: exchange.into(), routing_key: routing_key.into() }
    }
}

impl fmt::Display for Declaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Declaration::Exchange { name, kind, .. } => write!(f, "exchange {name}({kind})"),
            Declaration::Queue { name, .. } => write!(f, "queue {name}"),
            Declaration::Binding { queue, exchange, routing_key } => {
                write!(f, "binding {exchange} -> {queue} [{routing_key}]")
            }
        }
    }
}

/// Ordered, de-duplicated record of every declaration made so far.
#[derive(Debug, Default, Clone)]
pub struct Topology {
    declarations: Vec<Declaration>,
    seen: HashSet<Declaration>,
}

impl Topology {
    /// Returns false when the declaration was already recorded.
    #[inline]
    pub fn record(&mut self, decl: Declaration) -> bool {
        if self.seen.contains(&decl) {
            return false;
        }
        self.seen.insert(decl.clone());
        self.declarations.push(decl);
        true
    }

    #[inline]
    pub fn declarations(&self) -> Vec<Declaration> {
        self.declarations.clone()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.declarations.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.declarations.is_empty()
    }
}
