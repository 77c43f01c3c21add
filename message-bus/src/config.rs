use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;
use serde::Deserialize;
use tracing::debug;

use crate::error::ConfigError;

/// Start from the log end when the group has no committed offset.
pub const OFFSET_NEWEST: i64 = -1;
/// Start from the log start when the group has no committed offset.
pub const OFFSET_OLDEST: i64 = -2;

pub const DEFAULT_BOOTSTRAP_SERVER: &str = "localhost:9092";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityProtocol {
    #[default]
    Plaintext,
    #[serde(alias = "ssl")]
    Tls,
}

impl FromStr for SecurityProtocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "plaintext" => Ok(SecurityProtocol::Plaintext),
            "tls" | "ssl" => Ok(SecurityProtocol::Tls),
            other => Err(ConfigError::UnsupportedSecurityProtocol(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TlsProperties {
    pub cert_file_location: Option<String>,
    pub key_file_location: Option<String>,
    pub ca_file_location: Option<String>,
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum CommitMode {
    /// Marked offsets are committed periodically by the client.
    #[default]
    #[serde(rename = "AUTO_COMMIT_INTERVAL", alias = "auto-interval")]
    AutoCommitInterval,
    /// Auto-commit is off and every handled record is committed before the next one is pulled.
    #[serde(rename = "AUTO_COMMIT_IMMEDIATELY", alias = "auto-immediate")]
    AutoCommitImmediately,
}

impl CommitMode {
    pub fn is_auto_commit(self) -> bool {
        matches!(self, CommitMode::AutoCommitInterval)
    }
}

impl FromStr for CommitMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "AUTO_COMMIT_INTERVAL" | "auto-interval" => Ok(CommitMode::AutoCommitInterval),
            "AUTO_COMMIT_IMMEDIATELY" | "auto-immediate" => Ok(CommitMode::AutoCommitImmediately),
            other => Err(ConfigError::UnsupportedCommitMode(other.to_string())),
        }
    }
}

/// Connection settings shared by the client, admin, producer and consumer sections.
/// Empty values in a section inherit from the client level, see [`ClientProperties::normalize`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionProperties {
    pub bootstrap_servers: Vec<String>,
    pub client_id: Option<String>,
    pub security_protocol: Option<SecurityProtocol>,
    pub tls: Option<TlsProperties>,
    pub debug: Option<bool>,
}

impl ConnectionProperties {
    fn inherit(&mut self, parent: &ConnectionProperties) {
        self.bootstrap_servers = trimmed(&self.bootstrap_servers);
        if self.bootstrap_servers.is_empty() {
            self.bootstrap_servers = parent.bootstrap_servers.clone();
        }
        if self.client_id.as_deref().map_or(true, |id| id.trim().is_empty()) {
            self.client_id = parent.client_id.clone();
        }
        if self.security_protocol.is_none() {
            self.security_protocol = parent.security_protocol;
        }
        if self.tls.is_none() {
            self.tls = parent.tls.clone();
        }
        if self.debug.is_none() {
            self.debug = parent.debug;
        }
    }

    fn validate(&self, role: &'static str) -> Result<(), ConfigError> {
        if self.bootstrap_servers.is_empty() {
            return Err(ConfigError::MissingBootstrapServers { role });
        }
        if self.uses_tls() && self.tls.is_none() {
            return Err(ConfigError::MissingTlsProperties { role });
        }
        Ok(())
    }

    pub fn uses_tls(&self) -> bool {
        self.security_protocol == Some(SecurityProtocol::Tls)
    }

    pub fn debug_enabled(&self) -> bool {
        self.debug.unwrap_or(false)
    }

    pub fn bootstrap_servers_list(&self) -> String {
        self.bootstrap_servers.join(",")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TopicConfiguration {
    pub name: String,
    pub partitions: i32,
    pub replica_factor: i32,
    /// Retention in milliseconds, sent as `retention.ms`.
    pub retention: Option<u64>,
}

impl Default for TopicConfiguration {
    fn default() -> Self {
        Self {
            name: String::new(),
            partitions: 1,
            replica_factor: 1,
            retention: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdminProperties {
    #[serde(flatten)]
    pub connection: ConnectionProperties,
    pub create_topic_timeout_ms: u64,
    pub topics: Vec<TopicConfiguration>,
}

impl Default for AdminProperties {
    fn default() -> Self {
        Self {
            connection: ConnectionProperties::default(),
            create_topic_timeout_ms: 15_000,
            topics: Vec::new(),
        }
    }
}

impl AdminProperties {
    pub fn create_topic_timeout(&self) -> Duration {
        Duration::from_millis(self.create_topic_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProducerProperties {
    #[serde(flatten)]
    pub connection: ConnectionProperties,
    /// Maximum number of records per batch.
    pub flush_messages: u32,
    /// Upper bound on how long a record waits in the local buffer before a batch is sent.
    pub flush_frequency_ms: u64,
    pub message_timeout_ms: u32,
    /// Maximum number of records buffered by the client before sends start to wait.
    pub queue_buffering_max_messages: u32,
    /// Capacity of each async producer outcome stream.
    pub buffer_size: usize,
    /// Events whose payload is left out of delivery logs.
    pub not_log_payload_for_events: Vec<String>,
}

impl Default for ProducerProperties {
    fn default() -> Self {
        Self {
            connection: ConnectionProperties::default(),
            flush_messages: 1,
            flush_frequency_ms: 1_000,
            message_timeout_ms: 20_000,
            queue_buffering_max_messages: 100_000,
            buffer_size: 256,
            not_log_payload_for_events: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TopicConsumerConfig {
    pub enable: bool,
    pub topic: Option<String>,
    pub topics: Vec<String>,
    pub group_id: String,
    /// Reserved. Records of one consumer are always handled one at a time.
    pub concurrency: Option<u32>,
}

impl TopicConsumerConfig {
    /// `topic` wins over `topics` when it is set to a non-blank value.
    pub fn resolved_topics(&self) -> Vec<String> {
        match self.topic.as_deref().map(str::trim) {
            Some(topic) if !topic.is_empty() => vec![topic.to_string()],
            _ => trimmed(&self.topics),
        }
    }

    pub fn resolved_group_id(&self) -> String {
        self.group_id.trim().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConsumerProperties {
    #[serde(flatten)]
    pub connection: ConnectionProperties,
    pub initial_offset: i64,
    pub commit_mode: CommitMode,
    pub auto_commit_interval_ms: u32,
    pub session_timeout_ms: u32,
    pub handler_mappings: HashMap<String, TopicConsumerConfig>,
}

impl Default for ConsumerProperties {
    fn default() -> Self {
        Self {
            connection: ConnectionProperties::default(),
            initial_offset: OFFSET_NEWEST,
            commit_mode: CommitMode::default(),
            auto_commit_interval_ms: 1_000,
            session_timeout_ms: 10_000,
            handler_mappings: HashMap::new(),
        }
    }
}

impl ConsumerProperties {
    /// Maps the initial offset onto librdkafka's `auto.offset.reset` policy.
    pub fn offset_reset_policy(&self) -> Result<&'static str, ConfigError> {
        match self.initial_offset {
            OFFSET_NEWEST => Ok("latest"),
            OFFSET_OLDEST => Ok("earliest"),
            other => Err(ConfigError::UnsupportedInitialOffset(other)),
        }
    }
}

/// Root of the message bus configuration tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientProperties {
    #[serde(flatten)]
    pub connection: ConnectionProperties,
    pub admin: AdminProperties,
    pub producer: ProducerProperties,
    pub consumer: ConsumerProperties,
}

impl ClientProperties {
    /// Parses, normalizes and validates a JSON properties document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str::<ClientProperties>(json)?.finalize()
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::read_file(path)?.finalize()
    }

    fn read_file(path: &str) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn finalize(mut self) -> Result<Self, ConfigError> {
        self.normalize();
        self.validate()?;
        Ok(self)
    }

    /// Copies client-level connection settings into every section that leaves them empty.
    pub fn normalize(&mut self) {
        self.connection.bootstrap_servers = trimmed(&self.connection.bootstrap_servers);
        if self.connection.bootstrap_servers.is_empty() {
            self.connection.bootstrap_servers = vec![DEFAULT_BOOTSTRAP_SERVER.to_string()];
        }
        self.admin.connection.inherit(&self.connection);
        self.producer.connection.inherit(&self.connection);
        self.consumer.connection.inherit(&self.connection);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.connection.validate("client")?;
        self.admin.connection.validate("admin")?;
        self.producer.connection.validate("producer")?;
        self.consumer.connection.validate("consumer")?;
        self.consumer.offset_reset_policy()?;
        Ok(())
    }
}

/// Checks that a bootstrap server is written as `host:port`.
pub fn validate_bootstrap_server(server: &str) -> Result<(), ConfigError> {
    let invalid = || ConfigError::InvalidBootstrapServer(server.to_string());
    let (host, port) = server.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(invalid());
    }
    Ok(())
}

fn trimmed(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

/// Process-level settings read from the environment. Values set here take precedence over
/// the properties file.
#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    pub kafka_hosts: Option<String>,

    pub kafka_client_id: Option<String>,

    pub kafka_tls: Option<bool>,

    pub kafka_tls_cert_file: Option<String>,

    pub kafka_tls_key_file: Option<String>,

    pub kafka_tls_ca_file: Option<String>,

    #[envconfig(default = "false")]
    pub kafka_tls_insecure_skip_verify: bool,

    pub kafka_debug: Option<bool>,

    pub kafka_consumer_commit_mode: Option<CommitMode>,

    pub kafka_consumer_initial_offset: Option<i64>,

    pub message_bus_properties_file: Option<String>,

    #[envconfig(default = "30")]
    pub ready_timeout_secs: u64,
}

impl Config {
    pub fn to_properties(&self) -> Result<ClientProperties, ConfigError> {
        let mut props = match &self.message_bus_properties_file {
            Some(path) => {
                debug!("loading message bus properties from {}", path);
                ClientProperties::read_file(path)?
            }
            None => ClientProperties::default(),
        };

        if let Some(hosts) = &self.kafka_hosts {
            props.connection.bootstrap_servers =
                hosts.split(',').map(str::to_string).collect();
        }
        if let Some(client_id) = &self.kafka_client_id {
            props.connection.client_id = Some(client_id.clone());
        }
        if let Some(tls) = self.kafka_tls {
            props.connection.security_protocol = Some(if tls {
                SecurityProtocol::Tls
            } else {
                SecurityProtocol::Plaintext
            });
        }
        if self.kafka_tls_cert_file.is_some()
            || self.kafka_tls_key_file.is_some()
            || self.kafka_tls_ca_file.is_some()
            || self.kafka_tls_insecure_skip_verify
        {
            props.connection.tls = Some(TlsProperties {
                cert_file_location: self.kafka_tls_cert_file.clone(),
                key_file_location: self.kafka_tls_key_file.clone(),
                ca_file_location: self.kafka_tls_ca_file.clone(),
                insecure_skip_verify: self.kafka_tls_insecure_skip_verify,
            });
        }
        if let Some(debug) = self.kafka_debug {
            props.connection.debug = Some(debug);
        }
        if let Some(mode) = self.kafka_consumer_commit_mode {
            props.consumer.commit_mode = mode;
        }
        if let Some(offset) = self.kafka_consumer_initial_offset {
            props.consumer.initial_offset = offset;
        }

        props.finalize()
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }
}
