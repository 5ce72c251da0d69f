//! Consumer configuration
//!
//! Built once, either deserialized or through the builder, and handed to
//! [`Consumer`](crate::Consumer) by value.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, DurationSeconds, SerializeDisplay, serde_as};
use smol_str::SmolStr;
use url::Url;

use crate::error::ConfigError;

/// Default Jetstream instance
pub const DEFAULT_JETSTREAM_URL: &str = "wss://jetstream2.us-east.bsky.network";

/// Default firehose relay host
pub const DEFAULT_FIREHOSE_HOST: &str = "bsky.network";

/// Which wire format to subscribe to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, SerializeDisplay, DeserializeFromStr)]
pub enum StreamVariant {
    /// Compact JSON stream with server-side filtering
    #[default]
    Jetstream,
    /// Binary repository event stream
    Firehose,
}

impl StreamVariant {
    /// Canonical name
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamVariant::Jetstream => "jetstream",
            StreamVariant::Firehose => "firehose",
        }
    }
}

impl fmt::Display for StreamVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamVariant {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "a" | "jetstream" => Ok(StreamVariant::Jetstream),
            "b" | "firehose" => Ok(StreamVariant::Firehose),
            _ => Err(ConfigError::UnknownVariant(s.to_string())),
        }
    }
}

/// Cursor storage backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CursorBackend {
    /// Process memory, lost on exit
    #[default]
    Memory,
    /// Local file
    File,
}

/// Cursor storage settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CursorConfig {
    /// Backend to use
    pub backend: CursorBackend,
    /// File path, required by the file backend
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl CursorConfig {
    /// Store the cursor in a file at `path`
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            backend: CursorBackend::File,
            path: Some(path.into()),
        }
    }
}

/// Reconnection pacing
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Attempts allowed after a connection is lost before giving up
    pub max_attempts: u32,
    /// Delay before the first retry
    #[serde_as(as = "DurationSeconds<u64>")]
    pub base_delay: Duration,
    /// Upper bound on any single delay
    #[serde_as(as = "DurationSeconds<u64>")]
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
        }
    }
}

/// In-process deferred dispatch settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeferredConfig {
    /// Queue name, reported in logs
    pub queue: SmolStr,
    /// Handlers allowed to run at once
    pub max_concurrency: usize,
}

impl Default for DeferredConfig {
    fn default() -> Self {
        Self {
            queue: SmolStr::new_static("default"),
            max_concurrency: 16,
        }
    }
}

/// Complete consumer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
#[builder(start_fn = new)]
#[serde(default)]
pub struct Config {
    /// Wire format to consume
    #[builder(default)]
    pub variant: StreamVariant,
    /// Jetstream base URL
    #[builder(default = default_jetstream_url())]
    pub jetstream_url: Url,
    /// Firehose relay hostname
    #[builder(default = SmolStr::new_static(DEFAULT_FIREHOSE_HOST), into)]
    pub firehose_host: SmolStr,
    /// Cursor persistence
    #[builder(default)]
    pub cursor: CursorConfig,
    /// Reconnection pacing
    #[builder(default)]
    pub reconnect: ReconnectConfig,
    /// Deferred dispatch
    #[builder(default)]
    pub deferred: DeferredConfig,
}

fn default_jetstream_url() -> Url {
    Url::parse(DEFAULT_JETSTREAM_URL).expect("valid url")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            variant: StreamVariant::default(),
            jetstream_url: default_jetstream_url(),
            firehose_host: SmolStr::new_static(DEFAULT_FIREHOSE_HOST),
            cursor: CursorConfig::default(),
            reconnect: ReconnectConfig::default(),
            deferred: DeferredConfig::default(),
        }
    }
}

impl Config {
    /// Check the settings before any connection attempt
    pub fn validate(&self) -> Result<(), ConfigError> {
        let reconnect = &self.reconnect;
        if reconnect.base_delay.is_zero() {
            return Err(ConfigError::InvalidReconnect(
                "base_delay must be greater than zero".into(),
            ));
        }
        if reconnect.max_delay < reconnect.base_delay {
            return Err(ConfigError::InvalidReconnect(format!(
                "max_delay ({}s) is shorter than base_delay ({}s)",
                reconnect.max_delay.as_secs_f64(),
                reconnect.base_delay.as_secs_f64()
            )));
        }

        match self.variant {
            StreamVariant::Jetstream => {
                if !matches!(self.jetstream_url.scheme(), "ws" | "wss") {
                    return Err(ConfigError::InvalidEndpoint(self.jetstream_url.to_string()));
                }
            }
            StreamVariant::Firehose => {
                let host = self.firehose_host.trim();
                if host.is_empty() || host.contains('/') || host.contains(char::is_whitespace) {
                    return Err(ConfigError::InvalidEndpoint(self.firehose_host.to_string()));
                }
            }
        }

        if self.cursor.backend == CursorBackend::File && self.cursor.path.is_none() {
            return Err(ConfigError::MissingCursorPath);
        }
        if self.deferred.max_concurrency == 0 {
            return Err(ConfigError::InvalidConcurrency);
        }
        Ok(())
    }
}
