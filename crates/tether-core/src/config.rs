//! Config - YAML 設定の読み込みと検証
//!
//! すべての項目にデフォルトがあるので、空のファイルも有効な設定になる。
//! 検証エラーは起動時に致命的（Fail-fast）。

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::domain::topic::{MULTI_LEVEL, SEPARATOR, SINGLE_LEVEL, TopicFilter, TopicScheme};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing yaml: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MirrorConfig {
    pub mqtt: MqttSettings,
    pub replication: ReplicationSettings,
    pub reconciler: ReconcilerSettings,
    pub dispatch: DispatchSettings,
    pub consumers: ConsumerSettings,
}

/// Broker connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    /// Fixed identity; the broker keys the persistent session on it.
    pub client_id: String,
    pub clean_start: bool,
    pub keep_alive_secs: u64,
    /// How long the broker keeps the session after a disconnect.
    pub session_expiry_secs: u32,
    pub connect_timeout_secs: u64,
    pub reconnect_delay_ms: u64,
    pub publish_timeout_secs: u64,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "tether-monitor".to_string(),
            clean_start: false,
            keep_alive_secs: 30,
            session_expiry_secs: 86_400,
            connect_timeout_secs: 10,
            reconnect_delay_ms: 1_000,
            publish_timeout_secs: 10,
            username: None,
            password: None,
        }
    }
}

impl MqttSettings {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }
}

/// Topic naming and retention of replicated instances.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReplicationSettings {
    pub namespace: String,
    pub reference_prefix_len: usize,
    pub active_ttl_secs: u64,
    pub final_ttl_secs: u64,
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            namespace: TopicScheme::DEFAULT_NAMESPACE.to_string(),
            reference_prefix_len: TopicScheme::DEFAULT_PREFIX_LEN,
            active_ttl_secs: 4 * 60 * 60,
            final_ttl_secs: 4 * 24 * 60 * 60,
        }
    }
}

impl ReplicationSettings {
    pub fn scheme(&self) -> TopicScheme {
        TopicScheme::new(self.namespace.clone(), self.reference_prefix_len)
    }

    pub fn active_ttl(&self) -> Duration {
        Duration::from_secs(self.active_ttl_secs)
    }

    pub fn final_ttl(&self) -> Duration {
        Duration::from_secs(self.final_ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconcilerSettings {
    pub interval_ms: u64,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self { interval_ms: 1_000 }
    }
}

impl ReconcilerSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchSettings {
    /// How long stop waits for in-flight handlers before abandoning them.
    pub shutdown_grace_ms: u64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            shutdown_grace_ms: 5_000,
        }
    }
}

impl DispatchSettings {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConsumerSettings {
    /// Adopt instances other processes publish to the active topics.
    pub adopt_published_instances: bool,
    /// Overrides `<namespace>/+/active/+/instance`.
    pub adoption_filter: Option<String>,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            adopt_published_instances: true,
            adoption_filter: None,
        }
    }
}

fn invalid(msg: String) -> Result<(), ConfigError> {
    Err(ConfigError::Invalid(msg))
}

impl MirrorConfig {
    /// Load and validate a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// Parse and validate YAML text. Blank text yields the defaults.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: MirrorConfig = if yaml.trim().is_empty() {
            MirrorConfig::default()
        } else {
            serde_yaml::from_str(yaml)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let ns = &self.replication.namespace;

        if ns.is_empty() {
            return invalid("replication.namespace must not be empty".into());
        }
        if ns.contains(SEPARATOR) || ns.contains(SINGLE_LEVEL) || ns.contains(MULTI_LEVEL) {
            return invalid(format!(
                "replication.namespace '{ns}' must be a single segment without wildcards"
            ));
        }
        if self.replication.reference_prefix_len == 0 {
            return invalid("replication.reference_prefix_len must be at least 1".into());
        }
        if self.replication.active_ttl_secs >= self.replication.final_ttl_secs {
            return invalid(format!(
                "replication.active_ttl_secs ({}) must be shorter than final_ttl_secs ({})",
                self.replication.active_ttl_secs, self.replication.final_ttl_secs
            ));
        }
        if self.reconciler.interval_ms == 0 {
            return invalid("reconciler.interval_ms must be positive".into());
        }
        if self.mqtt.client_id.is_empty() {
            return invalid("mqtt.client_id must not be empty".into());
        }
        if self.mqtt.keep_alive_secs < 5 {
            return invalid("mqtt.keep_alive_secs must be at least 5".into());
        }
        if self.mqtt.publish_timeout_secs == 0 || self.mqtt.connect_timeout_secs == 0 {
            return invalid("mqtt timeouts must be positive".into());
        }
        if self.mqtt.username.is_some() != self.mqtt.password.is_some() {
            return invalid("mqtt.username and mqtt.password must be set together".into());
        }
        if let Some(filter) = &self.consumers.adoption_filter {
            TopicFilter::new(filter.as_str())
                .map_err(|e| ConfigError::Invalid(format!("consumers.adoption_filter: {e}")))?;
        }
        Ok(())
    }

    /// The filter the instance adopter listens on.
    pub fn adoption_filter(&self) -> String {
        match &self.consumers.adoption_filter {
            Some(filter) => filter.clone(),
            None => self
                .replication
                .scheme()
                .family_filter(crate::domain::topic::StatusSegment::Active)
                .to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn empty_file_gives_defaults() {
        let config = MirrorConfig::from_yaml("").unwrap();
        assert_eq!(config, MirrorConfig::default());
        assert_eq!(config.mqtt.client_id, "tether-monitor");
        assert!(!config.mqtt.clean_start);
        assert_eq!(config.replication.active_ttl(), Duration::from_secs(14_400));
        assert_eq!(config.adoption_filter(), "workflows-core/+/active/+/instance");
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = MirrorConfig::from_yaml(
            r#"
mqtt:
  host: broker.plant.local
  port: 8883
replication:
  namespace: plant
"#,
        )
        .unwrap();

        assert_eq!(config.mqtt.host, "broker.plant.local");
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.mqtt.keep_alive_secs, 30);
        assert_eq!(config.replication.scheme().namespace(), "plant");
        assert_eq!(config.reconciler.interval(), Duration::from_secs(1));
    }

    #[rstest]
    #[case::empty_namespace("replication:\n  namespace: \"\"")]
    #[case::wildcard_namespace("replication:\n  namespace: \"a+\"")]
    #[case::nested_namespace("replication:\n  namespace: a/b")]
    #[case::zero_prefix("replication:\n  reference_prefix_len: 0")]
    #[case::ttl_order("replication:\n  active_ttl_secs: 100\n  final_ttl_secs: 100")]
    #[case::zero_interval("reconciler:\n  interval_ms: 0")]
    #[case::half_credentials("mqtt:\n  username: monitor")]
    #[case::bad_filter("consumers:\n  adoption_filter: \"a/#/b\"")]
    fn rejects_invalid_settings(#[case] yaml: &str) {
        assert!(matches!(
            MirrorConfig::from_yaml(yaml),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn unknown_keys_are_parse_errors() {
        assert!(matches!(
            MirrorConfig::from_yaml("mqtt:\n  hots: typo"),
            Err(ConfigError::Parse(_))
        ));
    }
}
