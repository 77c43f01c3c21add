use std::time::Duration;

use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::error::KafkaError;
use rdkafka::types::RDKafkaErrorCode;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::client_config::ClientConfigBuilder;
use crate::config::{validate_bootstrap_server, AdminProperties, TopicConfiguration};
use crate::error::ConfigError;

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum AdminError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("kafka admin request failed: {0}")]
    Kafka(#[from] KafkaError),
    #[error("admin request for [{name}] failed on {server}: {code}")]
    Request {
        server: String,
        name: String,
        code: RDKafkaErrorCode,
    },
    #[error("topic [{0}] does not exist")]
    UnknownTopic(String),
}

/// Topic and consumer group administration.
#[async_trait]
pub trait Admin: Send + Sync {
    async fn create_topics(&self, topics: &[TopicConfiguration]) -> Result<(), AdminError>;

    async fn delete_topics(&self, topics: &[String]) -> Result<(), AdminError>;

    async fn delete_groups(&self, groups: &[String]) -> Result<(), AdminError>;

    async fn count_partitions(&self, topic: &str) -> Result<usize, AdminError>;
}

struct ServerAdmin {
    server: String,
    client: AdminClient<DefaultClientContext>,
}

/// Runs admin requests against each configured bootstrap server in turn. The first server
/// that fails aborts the request for the remaining ones.
pub struct KafkaAdmin {
    servers: Vec<ServerAdmin>,
    options: AdminOptions,
    topics: Vec<TopicConfiguration>,
}

impl KafkaAdmin {
    pub fn new(props: &AdminProperties) -> Result<Self, AdminError> {
        let mut servers = Vec::with_capacity(props.connection.bootstrap_servers.len());
        for server in &props.connection.bootstrap_servers {
            validate_bootstrap_server(server)?;
            let client = ClientConfigBuilder::for_admin(props, server)
                .build()
                .create()?;
            servers.push(ServerAdmin {
                server: server.clone(),
                client,
            });
        }

        let options = AdminOptions::new().operation_timeout(Some(props.create_topic_timeout()));
        Ok(Self {
            servers,
            options,
            topics: props.topics.clone(),
        })
    }

    /// Creates the topics listed in the admin properties.
    pub async fn create_configured_topics(&self) -> Result<(), AdminError> {
        if self.topics.is_empty() {
            info!("Skip create Kafka topics. No topics are defined");
            return Ok(());
        }
        self.create_topics(&self.topics).await
    }
}

fn new_topics<'a>(
    topics: &'a [TopicConfiguration],
    retentions: &'a [Option<String>],
) -> Vec<NewTopic<'a>> {
    topics
        .iter()
        .zip(retentions)
        .map(|(topic, retention)| {
            let new_topic = NewTopic::new(
                &topic.name,
                topic.partitions,
                TopicReplication::Fixed(topic.replica_factor),
            );
            match retention {
                Some(retention) => new_topic.set("retention.ms", retention),
                None => new_topic,
            }
        })
        .collect()
}

#[async_trait]
impl Admin for KafkaAdmin {
    async fn create_topics(&self, topics: &[TopicConfiguration]) -> Result<(), AdminError> {
        let retentions: Vec<Option<String>> = topics
            .iter()
            .map(|t| t.retention.map(|ms| ms.to_string()))
            .collect();

        for admin in &self.servers {
            let results = admin
                .client
                .create_topics(&new_topics(topics, &retentions), &self.options)
                .await?;
            for result in results {
                match result {
                    Ok(name) => info!("created topic {} on {}", name, admin.server),
                    Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                        debug!("topic {} already exists on {}", name, admin.server)
                    }
                    Err((name, code)) => {
                        return Err(AdminError::Request {
                            server: admin.server.clone(),
                            name,
                            code,
                        })
                    }
                }
            }
        }
        Ok(())
    }

    async fn delete_topics(&self, topics: &[String]) -> Result<(), AdminError> {
        let names: Vec<&str> = topics.iter().map(String::as_str).collect();
        for admin in &self.servers {
            let results = admin.client.delete_topics(&names, &self.options).await?;
            for result in results {
                match result {
                    Ok(name) => info!("deleted topic {} on {}", name, admin.server),
                    Err((name, RDKafkaErrorCode::UnknownTopicOrPartition)) => {
                        warn!("topic {} does not exist on {}", name, admin.server)
                    }
                    Err((name, code)) => {
                        return Err(AdminError::Request {
                            server: admin.server.clone(),
                            name,
                            code,
                        })
                    }
                }
            }
        }
        Ok(())
    }

    async fn delete_groups(&self, groups: &[String]) -> Result<(), AdminError> {
        let names: Vec<&str> = groups.iter().map(String::as_str).collect();
        for admin in &self.servers {
            let results = admin.client.delete_groups(&names, &self.options).await?;
            for result in results {
                match result {
                    Ok(name) => info!("deleted consumer group {} on {}", name, admin.server),
                    Err((name, RDKafkaErrorCode::GroupIdNotFound)) => {
                        warn!("consumer group {} does not exist on {}", name, admin.server)
                    }
                    Err((name, code)) => {
                        return Err(AdminError::Request {
                            server: admin.server.clone(),
                            name,
                            code,
                        })
                    }
                }
            }
        }
        Ok(())
    }

    /// Partition count as reported by the first configured server.
    async fn count_partitions(&self, topic: &str) -> Result<usize, AdminError> {
        let Some(admin) = self.servers.first() else {
            return Err(AdminError::UnknownTopic(topic.to_string()));
        };
        let metadata = admin
            .client
            .inner()
            .fetch_metadata(Some(topic), METADATA_TIMEOUT)?;

        let Some(found) = metadata.topics().iter().find(|t| t.name() == topic) else {
            return Err(AdminError::UnknownTopic(topic.to_string()));
        };
        if let Some(code) = found.error() {
            return Err(AdminError::Request {
                server: admin.server.clone(),
                name: topic.to_string(),
                code: code.into(),
            });
        }
        Ok(found.partitions().len())
    }
}
