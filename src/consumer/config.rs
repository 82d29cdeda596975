//! Consumer settings for the source stage

use crate::consumer::error::{SourceError, SourceResult};
use crate::consumer::supervision::SupervisionStrategy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Extra librdkafka properties callers may set
pub const ALLOWED_CLIENT_PROPS: &[&str] = &[
    // Fetch settings
    "fetch.min.bytes",
    "fetch.wait.max.ms",
    "fetch.max.bytes",
    "max.partition.fetch.bytes",
    "fetch.error.backoff.ms",
    "fetch.message.max.bytes",
    // Queue settings
    "queued.min.messages",
    "queued.max.messages.kbytes",
    // Connection settings
    "client.id",
    "socket.keepalive.enable",
    "reconnect.backoff.ms",
    "reconnect.backoff.max.ms",
    "connections.max.idle.ms",
    "metadata.max.age.ms",
    "heartbeat.interval.ms",
    "partition.assignment.strategy",
    // Security
    "security.protocol",
    "sasl.mechanisms",
    "sasl.username",
    "sasl.password",
    "ssl.ca.location",
    // Monitoring
    "statistics.interval.ms",
];

const AUTO_OFFSET_RESET_VALUES: &[&str] = &["earliest", "latest", "none"];

/// Settings the source stage is constructed with; immutable afterwards
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerSettings {
    /// Broker addresses (comma-separated)
    pub bootstrap_servers: String,

    /// Consumer group ID
    pub group_id: String,

    /// Interval of the scheduled poll timer
    pub poll_interval: Duration,

    /// Upper bound for a single poll
    pub poll_timeout: Duration,

    /// Records buffered before the client is paused
    pub buffer_size: usize,

    /// Records drained from the client in one poll
    pub max_poll_records: usize,

    /// Offset reset policy (earliest, latest, none)
    pub auto_offset_reset: String,

    /// Session timeout in milliseconds
    pub session_timeout_ms: u32,

    /// Serve buffered records before completing on shutdown
    pub drain_on_shutdown: bool,

    /// Additional client properties, restricted to [`ALLOWED_CLIENT_PROPS`]
    pub properties: HashMap<String, String>,

    /// Error policy
    #[serde(skip)]
    pub supervision: SupervisionStrategy,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            group_id: "kafka-pull-source".to_string(),
            poll_interval: Duration::from_millis(50),
            poll_timeout: Duration::from_millis(50),
            buffer_size: 128,
            max_poll_records: 500,
            auto_offset_reset: "latest".to_string(),
            session_timeout_ms: 30000,
            drain_on_shutdown: false,
            properties: HashMap::new(),
            supervision: SupervisionStrategy::default(),
        }
    }
}

/// Builder for ConsumerSettings
pub struct ConsumerSettingsBuilder {
    settings: ConsumerSettings,
}

impl ConsumerSettingsBuilder {
    /// Create a new builder with default settings
    pub fn new() -> Self {
        Self {
            settings: ConsumerSettings::default(),
        }
    }

    /// Set the broker addresses
    pub fn bootstrap_servers(mut self, servers: impl Into<String>) -> Self {
        self.settings.bootstrap_servers = servers.into();
        self
    }

    /// Set the consumer group ID
    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.settings.group_id = group_id.into();
        self
    }

    /// Set the poll timer interval
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.settings.poll_interval = interval;
        self
    }

    /// Set the upper bound of a single poll
    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.settings.poll_timeout = timeout;
        self
    }

    /// Set the buffer capacity
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.settings.buffer_size = size;
        self
    }

    /// Set the records drained per poll
    pub fn max_poll_records(mut self, max: usize) -> Self {
        self.settings.max_poll_records = max;
        self
    }

    /// Set the offset reset policy
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.settings.auto_offset_reset = policy.into();
        self
    }

    /// Set the group session timeout
    pub fn session_timeout_ms(mut self, timeout: u32) -> Self {
        self.settings.session_timeout_ms = timeout;
        self
    }

    /// Serve buffered records before completing on shutdown
    pub fn drain_on_shutdown(mut self, drain: bool) -> Self {
        self.settings.drain_on_shutdown = drain;
        self
    }

    /// Add a custom client property
    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.properties.insert(key.into(), value.into());
        self
    }

    /// Set the supervision strategy
    pub fn supervision(mut self, strategy: SupervisionStrategy) -> Self {
        self.settings.supervision = strategy;
        self
    }

    /// Build the settings
    pub fn build(self) -> ConsumerSettings {
        self.settings
    }
}

impl Default for ConsumerSettingsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsumerSettings {
    /// Create a new settings builder
    pub fn builder() -> ConsumerSettingsBuilder {
        ConsumerSettingsBuilder::new()
    }

    /// Load settings from a YAML or JSON file, chosen by extension
    pub fn from_file(path: impl AsRef<Path>) -> SourceResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SourceError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let settings: ConsumerSettings = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&raw)
                .map_err(|e| SourceError::Config(format!("invalid JSON settings: {}", e)))?,
            _ => serde_yaml::from_str(&raw)
                .map_err(|e| SourceError::Config(format!("invalid YAML settings: {}", e)))?,
        };
        debug!("Loaded consumer settings from {}", path.display());
        Ok(settings)
    }

    /// Override broker addresses and group id from `KAFKA_BOOTSTRAP_SERVERS`
    /// and `KAFKA_GROUP_ID`
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(servers) = std::env::var("KAFKA_BOOTSTRAP_SERVERS") {
            self.bootstrap_servers = servers;
        }
        if let Ok(group_id) = std::env::var("KAFKA_GROUP_ID") {
            self.group_id = group_id;
        }
        self
    }

    /// Validate the settings
    pub fn validate(&self) -> SourceResult<()> {
        if self.bootstrap_servers.trim().is_empty() {
            return Err(SourceError::Config("Bootstrap servers cannot be empty".to_string()));
        }

        if self.group_id.trim().is_empty() {
            return Err(SourceError::Config("Group ID cannot be empty".to_string()));
        }

        if self.buffer_size == 0 {
            return Err(SourceError::Config("Buffer size must be greater than 0".to_string()));
        }

        if self.max_poll_records == 0 {
            return Err(SourceError::Config(
                "Max poll records must be greater than 0".to_string(),
            ));
        }

        if self.poll_interval.is_zero() {
            return Err(SourceError::Config("Poll interval must be greater than 0".to_string()));
        }

        if self.poll_timeout.is_zero() {
            return Err(SourceError::Config("Poll timeout must be greater than 0".to_string()));
        }

        if !AUTO_OFFSET_RESET_VALUES.contains(&self.auto_offset_reset.as_str()) {
            return Err(SourceError::Config(format!(
                "Invalid auto.offset.reset '{}', expected one of {:?}",
                self.auto_offset_reset, AUTO_OFFSET_RESET_VALUES
            )));
        }

        for key in self.properties.keys() {
            if !ALLOWED_CLIENT_PROPS.contains(&key.as_str()) {
                return Err(SourceError::Config(format!(
                    "Disallowed client property '{}'. Allowed properties: {:?}",
                    key, ALLOWED_CLIENT_PROPS
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_default_settings_are_valid() {
        assert!(ConsumerSettings::default().validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let settings = ConsumerSettings::builder()
            .bootstrap_servers("broker-1:9092,broker-2:9092")
            .group_id("alerts")
            .buffer_size(2)
            .poll_interval(Duration::from_millis(10))
            .property("client.id", "tail")
            .build();

        assert_eq!(settings.bootstrap_servers, "broker-1:9092,broker-2:9092");
        assert_eq!(settings.group_id, "alerts");
        assert_eq!(settings.buffer_size, 2);
        assert_eq!(settings.poll_interval, Duration::from_millis(10));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validation_errors() {
        let settings = ConsumerSettings::builder().group_id("").build();
        assert!(settings.validate().is_err());

        let settings = ConsumerSettings::builder().buffer_size(0).build();
        assert!(settings.validate().is_err());

        let settings = ConsumerSettings::builder().auto_offset_reset("middle").build();
        assert!(settings.validate().is_err());

        let settings = ConsumerSettings::builder()
            .property("enable.auto.commit", "true")
            .build();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("enable.auto.commit"));
    }

    #[test]
    fn test_load_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "bootstrap_servers: kafka:9092\ngroup_id: toast\nbuffer_size: 16\nauto_offset_reset: earliest"
        )
        .unwrap();

        let settings = ConsumerSettings::from_file(file.path()).unwrap();
        assert_eq!(settings.bootstrap_servers, "kafka:9092");
        assert_eq!(settings.group_id, "toast");
        assert_eq!(settings.buffer_size, 16);
        assert_eq!(settings.auto_offset_reset, "earliest");
        // untouched fields keep defaults
        assert_eq!(settings.max_poll_records, 500);
    }

    #[test]
    fn test_load_json_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{"group_id": "json-group", "poll_timeout": {{"secs": 1, "nanos": 0}}}}"#
        )
        .unwrap();

        let settings = ConsumerSettings::from_file(file.path()).unwrap();
        assert_eq!(settings.group_id, "json-group");
        assert_eq!(settings.poll_timeout, Duration::from_secs(1));
    }
}
