use rdkafka::ClientConfig;

use crate::config::{
    AdminProperties, ConnectionProperties, ConsumerProperties, ProducerProperties, TlsProperties,
};
use crate::error::ConfigError;

/// Builds rdkafka client configurations from the message bus properties.
///
/// Each `for_*` entry point applies the connection section of the matching properties block
/// (bootstrap servers, client id, TLS, debug contexts) plus the defaults for that client role.
/// The `with_*` and `set` methods tweak individual settings before [`build`](Self::build).
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    fn from_connection(connection: &ConnectionProperties, debug_contexts: &str) -> Self {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", connection.bootstrap_servers_list());

        if let Some(client_id) = connection.client_id.as_deref() {
            config.set("client.id", client_id);
        }
        if connection.debug_enabled() {
            config.set("debug", debug_contexts);
        }

        let builder = Self { config };
        if connection.uses_tls() {
            builder.with_tls(connection.tls.as_ref())
        } else {
            builder
        }
    }

    /// Group consumer with offsets stored only for handled records.
    pub fn for_consumer(props: &ConsumerProperties, group_id: &str) -> Result<Self, ConfigError> {
        let auto_commit = props.commit_mode.is_auto_commit();
        let builder = Self::from_connection(&props.connection, "consumer,cgrp,topic,fetch")
            .set("group.id", group_id)
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", if auto_commit { "true" } else { "false" })
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", &props.session_timeout_ms.to_string())
            .with_offset_reset(props.offset_reset_policy()?);

        Ok(if auto_commit {
            builder.set(
                "auto.commit.interval.ms",
                &props.auto_commit_interval_ms.to_string(),
            )
        } else {
            builder
        })
    }

    pub fn for_producer(props: &ProducerProperties) -> Self {
        Self::from_connection(&props.connection, "broker,topic,msg")
            .set("statistics.interval.ms", "10000")
            .set("partitioner", "murmur2_random")
            .set("batch.num.messages", &props.flush_messages.max(1).to_string())
            .set("linger.ms", &props.flush_frequency_ms.to_string())
            .set("message.timeout.ms", &props.message_timeout_ms.to_string())
            .set(
                "queue.buffering.max.messages",
                &props.queue_buffering_max_messages.to_string(),
            )
    }

    /// Admin client talking to a single bootstrap server.
    pub fn for_admin(props: &AdminProperties, server: &str) -> Self {
        Self::from_connection(&props.connection, "admin,broker").set("bootstrap.servers", server)
    }

    /// Enable TLS for the connection, loading certificates from the given locations.
    pub fn with_tls(mut self, tls: Option<&TlsProperties>) -> Self {
        self.config.set("security.protocol", "ssl");
        let Some(tls) = tls else {
            return self;
        };

        if let Some(cert) = tls.cert_file_location.as_deref() {
            self.config.set("ssl.certificate.location", cert);
        }
        if let Some(key) = tls.key_file_location.as_deref() {
            self.config.set("ssl.key.location", key);
        }
        if let Some(ca) = tls.ca_file_location.as_deref() {
            self.config.set("ssl.ca.location", ca);
        }
        if tls.insecure_skip_verify {
            self.config
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    pub fn with_offset_reset(mut self, policy: &str) -> Self {
        self.config.set("auto.offset.reset", policy);
        self
    }

    /// Add any custom configuration
    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientProperties, CommitMode, OFFSET_OLDEST};

    fn props(json: &str) -> ClientProperties {
        ClientProperties::from_json(json).unwrap()
    }

    #[test]
    fn test_consumer_interval_commit() {
        let props = props(r#"{"bootstrapServers": ["a:9092", "b:9092"], "clientId": "svc"}"#);
        let config = ClientConfigBuilder::for_consumer(&props.consumer, "billing")
            .unwrap()
            .build();

        assert_eq!(config.get("bootstrap.servers"), Some("a:9092,b:9092"));
        assert_eq!(config.get("client.id"), Some("svc"));
        assert_eq!(config.get("group.id"), Some("billing"));
        assert_eq!(config.get("enable.auto.commit"), Some("true"));
        assert_eq!(config.get("enable.auto.offset.store"), Some("false"));
        assert_eq!(config.get("auto.offset.reset"), Some("latest"));
        assert_eq!(config.get("auto.commit.interval.ms"), Some("1000"));
        assert_eq!(config.get("security.protocol"), None);
        assert_eq!(config.get("debug"), None);
    }

    #[test]
    fn test_consumer_immediate_commit_from_oldest() {
        let mut props = props("{}");
        props.consumer.commit_mode = CommitMode::AutoCommitImmediately;
        props.consumer.initial_offset = OFFSET_OLDEST;

        let config = ClientConfigBuilder::for_consumer(&props.consumer, "g")
            .unwrap()
            .build();
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("auto.offset.reset"), Some("earliest"));
        assert_eq!(config.get("auto.commit.interval.ms"), None);
    }

    #[test]
    fn test_tls_and_debug() {
        let props = props(
            r#"{
                "securityProtocol": "tls",
                "debug": true,
                "tls": {
                    "certFileLocation": "/certs/client.pem",
                    "keyFileLocation": "/certs/client.key",
                    "caFileLocation": "/certs/ca.pem",
                    "insecureSkipVerify": true
                }
            }"#,
        );
        let config = ClientConfigBuilder::for_producer(&props.producer).build();

        assert_eq!(config.get("security.protocol"), Some("ssl"));
        assert_eq!(config.get("ssl.certificate.location"), Some("/certs/client.pem"));
        assert_eq!(config.get("ssl.key.location"), Some("/certs/client.key"));
        assert_eq!(config.get("ssl.ca.location"), Some("/certs/ca.pem"));
        assert_eq!(
            config.get("enable.ssl.certificate.verification"),
            Some("false")
        );
        assert_eq!(config.get("debug"), Some("broker,topic,msg"));
    }

    #[test]
    fn test_producer_flush_settings() {
        let props = props(r#"{"producer": {"flushMessages": 0, "flushFrequencyMs": 5}}"#);
        let config = ClientConfigBuilder::for_producer(&props.producer).build();

        assert_eq!(config.get("batch.num.messages"), Some("1"));
        assert_eq!(config.get("linger.ms"), Some("5"));
    }

    #[test]
    fn test_admin_targets_one_server() {
        let props = props(r#"{"bootstrapServers": ["a:9092", "b:9092"]}"#);
        let config = ClientConfigBuilder::for_admin(&props.admin, "b:9092").build();
        assert_eq!(config.get("bootstrap.servers"), Some("b:9092"));
    }
}
