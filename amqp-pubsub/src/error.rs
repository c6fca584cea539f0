/// Failure text reported for any operation against a dead channel or connection.
pub const ERROR_CHANNEL_CONNECTION: &str = "channel/connection is not open";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad or missing configuration, reported immediately and never retried
    #[error("validation error, {0}")]
    Validation(String),
    /// Dial or channel-open failure
    #[error("connection error, {0}")]
    Connection(String),
    /// A broker primitive failed on an established session
    #[error("broker error, {0}")]
    Broker(String),
    /// Publish gave up after its last retry, the message is dropped
    #[error("publish to topic {topic:?} failed, {reason}")]
    Publish { topic: String, reason: String },
    /// The application handler rejected a delivery
    #[error("delivery error, {0}")]
    Delivery(String),
    /// Operation attempted after Close
    #[error("pubsub is closed")]
    Closed,
    #[error("{0}")]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    #[inline]
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Error::Validation(msg.into())
    }

    #[inline]
    pub fn channel_closed() -> Self {
        Error::Broker(ERROR_CHANNEL_CONNECTION.into())
    }

    #[inline]
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_))
    }

    #[inline]
    pub fn is_connection(&self) -> bool {
        matches!(self, Error::Connection(_))
    }

    #[inline]
    pub fn is_publish(&self) -> bool {
        matches!(self, Error::Publish { .. })
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed)
    }

    /// Whether the failure points at an unhealthy session that a reconnect can repair.
    #[inline]
    pub fn must_reconnect(&self) -> bool {
        matches!(self, Error::Broker(_) | Error::Connection(_) | Error::Delivery(_))
    }
}

impl From<String> for Error {
    #[inline]
    fn from(e: String) -> Self {
        Error::Anyhow(anyhow::Error::msg(e))
    }
}

impl From<&str> for Error {
    #[inline]
    fn from(e: &str) -> Self {
        Error::Anyhow(anyhow::Error::msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_classification() {
        assert!(Error::channel_closed().must_reconnect());
        assert!(Error::Connection("dial tcp: refused".into()).must_reconnect());
        assert!(Error::Delivery("handler failed".into()).must_reconnect());
        assert!(!Error::validation("missing RabbitMQ host").must_reconnect());
        assert!(!Error::Closed.must_reconnect());
        assert!(!Error::Publish { topic: "t".into(), reason: "r".into() }.must_reconnect());
    }

    #[test]
    fn messages() {
        assert!(Error::channel_closed().to_string().contains(ERROR_CHANNEL_CONNECTION));
        assert_eq!(
            Error::Publish { topic: "orders".into(), reason: "boom".into() }.to_string(),
            r#"publish to topic "orders" failed, boom"#
        );
        assert_eq!(Error::from("plain").to_string(), "plain");
    }
}
