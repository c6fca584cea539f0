//! Instance-scoped counters.

use serde::{Deserialize, Serialize};
use serde_json::json;

use amqp_pubsub_utils::{format_timestamp_millis, timestamp_millis, Counter, TimestampMillis};

#[derive(Serialize, Deserialize, Debug)]
pub struct Stats {
    pub connects: Counter,
    pub closes: Counter,
    pub reconnects: Counter,
    pub publishes: Counter,
    pub publish_failures: Counter,
    pub deliveries: Counter,
    pub acks: Counter,
    pub nacks: Counter,
    pub subscriptions: Counter,
    started_at: TimestampMillis,
}

impl Default for Stats {
    fn default() -> Self {
        Self {
            connects: Counter::new(),
            closes: Counter::new(),
            reconnects: Counter::new(),
            publishes: Counter::new(),
            publish_failures: Counter::new(),
            deliveries: Counter::new(),
            acks: Counter::new(),
            nacks: Counter::new(),
            subscriptions: Counter::new(),
            started_at: timestamp_millis(),
        }
    }
}

impl Stats {
    #[inline]
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "started_at": format_timestamp_millis(self.started_at),
            "connects": self.connects.count(),
            "closes": self.closes.count(),
            "reconnects": self.reconnects.count(),
            "publishes": self.publishes.count(),
            "publish_failures": self.publish_failures.count(),
            "deliveries": self.deliveries.count(),
            "acks": self.acks.count(),
            "nacks": self.nacks.count(),
            "subscriptions": self.subscriptions.to_json(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_counts() {
        let stats = Stats::default();
        stats.connects.inc();
        stats.closes.incs(2);
        stats.subscriptions.inc();
        stats.subscriptions.dec();
        let js = stats.to_json();
        assert_eq!(js["connects"], 1);
        assert_eq!(js["closes"], 2);
        assert_eq!(js["subscriptions"]["count"], 0);
        assert_eq!(js["subscriptions"]["max"], 1);
    }
}
