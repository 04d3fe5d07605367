//! The typed configuration record shared by the engine binaries.
//!
//! Each engine process is started with the path to a single YAML file; the
//! channel-specific subsections under `notification_types` are kept as raw
//! values and deserialised by the dispatcher that owns them.
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed configuration file: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Loads and parses the configuration file at `path`.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&text)?)
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub kafka: KafkaConfig,
    pub mysql: MysqlConfig,
    #[serde(default)]
    pub processors: ProcessorsConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub notification_types: NotificationTypesConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct KafkaConfig {
    /// Broker list, `host:port[,host:port...]`.
    pub url: String,
    /// Consumer group shared by all instances of one engine kind.
    pub group: String,
    pub alarm_topic: String,
    pub notification_topic: String,
    pub notification_retry_topic: String,
    /// Period name to topic, one entry per periodic engine instance.
    #[serde(default)]
    pub periodic: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct MysqlConfig {
    pub host: String,
    #[serde(default = "default_mysql_port")]
    pub port: u16,
    pub user: String,
    pub passwd: String,
    pub db: String,
    #[serde(default)]
    pub ssl: Option<MysqlSslConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct MysqlSslConfig {
    /// Path to the CA bundle to verify the server against.
    pub ca: Option<PathBuf>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ProcessorsConfig {
    #[serde(default)]
    pub alarm: AlarmProcessorConfig,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct AlarmProcessorConfig {
    /// Alarms older than this many seconds are dropped. Absent disables the check.
    #[serde(default)]
    pub ttl: Option<u64>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RetryConfig {
    /// Seconds between dispatch attempts of one notification.
    #[serde(default = "default_retry_interval")]
    pub interval: u64,
    /// Attempts after the initial one before giving up.
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            interval: default_retry_interval(),
            max_attempts: default_retry_max_attempts(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct NotificationTypesConfig {
    /// Names of non-built-in dispatchers to enable, e.g. `slack`.
    #[serde(default)]
    pub plugins: Vec<String>,
    /// Channel-specific sections, keyed by dispatcher kind.
    #[serde(flatten)]
    pub channels: BTreeMap<String, serde_yaml::Value>,
}

fn default_mysql_port() -> u16 {
    3306
}

fn default_retry_interval() -> u64 {
    30
}

fn default_retry_max_attempts() -> u32 {
    5
}

#[cfg(test)]
mod test {
    use super::*;

    const EXAMPLE: &str = r#"
kafka:
  url: "kafka:9092"
  group: alarm-relay
  alarm_topic: alarm-state-transitions
  notification_topic: alarm-notifications
  notification_retry_topic: retry-notifications
  periodic:
    "60": 60-seconds-notifications
mysql:
  host: mysql
  user: notification
  passwd: password
  db: mon
processors:
  alarm:
    ttl: 14400
retry:
  interval: 30
  max_attempts: 5
notification_types:
  plugins:
    - slack
  email:
    server: smtp.example.org
    port: 25
    from_addr: alarms@example.org
  webhook:
    timeout: 5
"#;

    #[test]
    fn parses_full_config() {
        let config: Config = serde_yaml::from_str(EXAMPLE).unwrap();
        assert_eq!(config.kafka.group, "alarm-relay");
        assert_eq!(
            config.kafka.periodic.get("60").map(String::as_str),
            Some("60-seconds-notifications")
        );
        assert_eq!(config.mysql.port, 3306);
        assert_eq!(config.processors.alarm.ttl, Some(14400));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.notification_types.plugins, vec!["slack"]);
        assert!(config.notification_types.channels.contains_key("email"));
        assert!(config.notification_types.channels.contains_key("webhook"));
        assert!(!config.notification_types.channels.contains_key("slack"));
    }

    #[test]
    fn retry_and_ttl_defaults() {
        let minimal = r#"
kafka:
  url: "kafka:9092"
  group: g
  alarm_topic: a
  notification_topic: n
  notification_retry_topic: r
mysql:
  host: mysql
  user: u
  passwd: p
  db: mon
"#;
        let config: Config = serde_yaml::from_str(minimal).unwrap();
        assert_eq!(config.retry.interval, 30);
        assert_eq!(config.retry.max_attempts, 5);
        assert!(config.processors.alarm.ttl.is_none());
        assert!(config.kafka.periodic.is_empty());
        assert!(config.notification_types.plugins.is_empty());
    }
}
