//! Centralized configuration for Conduit.
//!
//! Constant defaults live in unit structs grouped by concern. The `*Settings`
//! structs are the runtime-tunable counterparts; they deserialize from JSON
//! with every field optional, durations expressed in milliseconds.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Channel transport limits.
pub struct ChannelConfig;

impl ChannelConfig {
    /// Largest single message the in-memory host accepts by default.
    pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1_048_576; // 1MB
    /// Capacity of each in-memory sub-channel.
    pub const MEMORY_QUEUE_DEPTH: usize = 256;
    /// Largest data-message header: tag, id length, longest id, chunk index.
    pub const FRAME_OVERHEAD: usize = 1 + 2 + u16::MAX as usize + 4;
    pub const MAX_TCP_CONNECTIONS: usize = 32;
    pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
    /// Partial receptions older than this are discarded.
    pub const PARTIAL_RECEPTION_TTL: Duration = Duration::from_secs(300);
    pub const EVICTION_INTERVAL: Duration = Duration::from_secs(30);
}

/// Frontend request defaults.
pub struct ClientConfig;

impl ClientConfig {
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
}

/// Polling transport defaults.
pub struct PollingConfig;

impl PollingConfig {
    pub const POLL_INTERVAL: Duration = Duration::from_millis(100);
    pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(2);
    pub const BACKOFF_FACTOR: f64 = 1.5;
    /// How long the server waits for a fast operation before answering "pending".
    pub const SUBMIT_GRACE: Duration = Duration::from_millis(50);
    pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
}

/// Backend dispatcher defaults.
pub struct DispatcherConfig;

impl DispatcherConfig {
    /// Fulfillments retained for answering retransmitted requests.
    pub const RETAINED_RESULTS: usize = 1024;
    /// How long a cancel notice for a not-yet-dispatched id is remembered.
    pub const PENDING_CANCEL_TTL: Duration = Duration::from_secs(30);
    pub const MAX_PENDING_CANCELS: usize = 1024;
}

/// HTTP server defaults.
pub struct ServerConfig;

impl ServerConfig {
    pub const DEFAULT_HOST: &'static str = "127.0.0.1";
    pub const CONCURRENCY_LIMIT: usize = 256;
    /// Largest accepted request body. Binary chunks travel base64-encoded.
    pub const MAX_BODY_SIZE: usize = 64 * 1024 * 1024; // 64MB
}

/// Runtime settings for [`RpcClient`](crate::client::RpcClient).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientSettings {
    /// Local timeout measured from submission.
    #[serde(with = "millis")]
    pub request_timeout: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            request_timeout: ClientConfig::REQUEST_TIMEOUT,
        }
    }
}

/// Runtime settings for the polling transport client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PollingSettings {
    #[serde(with = "millis")]
    pub poll_interval: Duration,
    #[serde(with = "millis")]
    pub max_poll_interval: Duration,
    pub backoff_factor: f64,
    #[serde(with = "millis")]
    pub http_timeout: Duration,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            poll_interval: PollingConfig::POLL_INTERVAL,
            max_poll_interval: PollingConfig::MAX_POLL_INTERVAL,
            backoff_factor: PollingConfig::BACKOFF_FACTOR,
            http_timeout: PollingConfig::HTTP_REQUEST_TIMEOUT,
        }
    }
}

impl PollingSettings {
    /// Interval to wait after a poll that used `current`.
    pub fn next_interval(&self, current: Duration) -> Duration {
        let factor = if self.backoff_factor.is_finite() && self.backoff_factor >= 1.0 {
            self.backoff_factor
        } else {
            1.0
        };
        current.mul_f64(factor).min(self.max_poll_interval)
    }
}

/// Runtime settings for the backend dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatcherSettings {
    pub retained_results: usize,
    #[serde(with = "millis")]
    pub submit_grace: Duration,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            retained_results: DispatcherConfig::RETAINED_RESULTS,
            submit_grace: PollingConfig::SUBMIT_GRACE,
        }
    }
}

/// Top-level settings file layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub client: ClientSettings,
    pub polling: PollingSettings,
    pub dispatcher: DispatcherSettings,
    pub max_message_size: Option<usize>,
}

impl Settings {
    /// Parse settings from a JSON document.
    pub fn from_json(text: &str) -> crate::Result<Self> {
        serde_json::from_str(text).map_err(|e| crate::ConduitError::Config {
            message: format!("invalid settings: {}", e),
        })
    }

    /// Effective channel message limit.
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
            .unwrap_or(ChannelConfig::DEFAULT_MAX_MESSAGE_SIZE)
    }
}

/// Serde adapter for durations stored as integer milliseconds.
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeouts_are_reasonable() {
        assert!(ClientConfig::REQUEST_TIMEOUT > Duration::from_secs(1));
        assert!(PollingConfig::POLL_INTERVAL < PollingConfig::MAX_POLL_INTERVAL);
    }

    #[test]
    fn test_settings_partial_json() {
        let settings =
            Settings::from_json(r#"{"client": {"request_timeout": 500}, "max_message_size": 1024}"#)
                .unwrap();
        assert_eq!(settings.client.request_timeout, Duration::from_millis(500));
        assert_eq!(settings.max_message_size(), 1024);
        assert_eq!(settings.polling, PollingSettings::default());
    }

    #[test]
    fn test_settings_invalid_json() {
        let err = Settings::from_json("{\"client\": 5}").unwrap_err();
        assert!(matches!(err, crate::ConduitError::Config { .. }));
    }

    #[test]
    fn test_backoff_caps_at_max() {
        let settings = PollingSettings {
            poll_interval: Duration::from_millis(100),
            max_poll_interval: Duration::from_millis(300),
            backoff_factor: 2.0,
            ..PollingSettings::default()
        };
        let second = settings.next_interval(settings.poll_interval);
        assert_eq!(second, Duration::from_millis(200));
        assert_eq!(settings.next_interval(second), Duration::from_millis(300));
    }

    #[test]
    fn test_backoff_ignores_shrinking_factor() {
        let settings = PollingSettings {
            backoff_factor: 0.5,
            ..PollingSettings::default()
        };
        assert_eq!(
            settings.next_interval(Duration::from_millis(100)),
            Duration::from_millis(100)
        );
    }
}
