//! `[log]` settings section.

use std::ops::Deref;
use std::str::FromStr;

use serde::Deserialize;

const DEFAULT_DIR: &str = "/var/log/amqp-pubsub";
const DEFAULT_FILE: &str = "amqp-pubsub.log";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Log {
    pub to: To,
    pub level: Level,
    pub dir: String,
    pub file: String,
}

impl Default for Log {
    fn default() -> Self {
        Self { to: To::Console, level: Level::from(slog::Level::Info), dir: DEFAULT_DIR.into(), file: DEFAULT_FILE.into() }
    }
}

impl Log {
    /// Full path of the log file, empty when no file name is configured.
    pub fn filename(&self) -> String {
        match (self.dir.trim_end_matches(['/', '\\']), self.file.as_str()) {
            (_, "") => String::new(),
            ("", file) => file.to_string(),
            (dir, file) => format!("{dir}/{file}"),
        }
    }
}

/// Log destination. Anything unrecognised logs to both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum To {
    Off,
    File,
    Console,
    Both,
}

impl From<String> for To {
    fn from(s: String) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "off" => To::Off,
            "file" => To::File,
            "console" => To::Console,
            _ => To::Both,
        }
    }
}

impl To {
    #[inline]
    pub fn file(&self) -> bool {
        matches!(self, To::File | To::Both)
    }

    #[inline]
    pub fn console(&self) -> bool {
        matches!(self, To::Console | To::Both)
    }

    #[inline]
    pub fn off(&self) -> bool {
        *self == To::Off
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(try_from = "String")]
pub struct Level {
    inner: slog::Level,
}

impl Level {
    #[inline]
    pub fn inner(&self) -> slog::Level {
        self.inner
    }
}

impl From<slog::Level> for Level {
    #[inline]
    fn from(inner: slog::Level) -> Self {
        Level { inner }
    }
}

impl TryFrom<String> for Level {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        slog::Level::from_str(&s).map(Level::from).map_err(|_| format!("invalid log level, {s}"))
    }
}

impl Deref for Level {
    type Target = slog::Level;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_defaults() {
        let log = Log::default();
        assert_eq!(log.to, To::Console);
        assert_eq!(log.level.inner(), slog::Level::Info);
        assert_eq!(log.filename(), "/var/log/amqp-pubsub/amqp-pubsub.log");
    }

    #[test]
    fn log_deserialize() {
        let log: Log =
            serde_json::from_str(r#"{"to": "BOTH", "level": "debug", "dir": "/tmp/logs/", "file": "a.log"}"#).unwrap();
        assert!(log.to.file() && log.to.console());
        assert_eq!(*log.level, slog::Level::Debug);
        assert_eq!(log.filename(), "/tmp/logs/a.log");

        let log: Log = serde_json::from_str(r#"{"to": "off", "dir": ""}"#).unwrap();
        assert!(log.to.off());
        assert_eq!(log.filename(), "amqp-pubsub.log");

        assert!(serde_json::from_str::<Log>(r#"{"level": "loud"}"#).is_err());
    }
}
