use std::time::Duration;

use rdkafka::client::Client;
use rdkafka::error::KafkaError;
use rdkafka::{ClientConfig, ClientContext, Statistics};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::client_config::ClientConfigBuilder;
use crate::config::ProducerProperties;
use crate::metrics_consts::PRODUCER_QUEUE_DEPTH;

mod async_producer;
mod logging;
mod sync_producer;

pub use async_producer::{AsyncProducer, DeliveryContext};
pub use logging::{describe_message, spawn_error_logger, spawn_success_logger};
pub use sync_producer::SyncProducer;

const METADATA_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Error, Debug)]
pub enum ProduceError {
    #[error("failed to produce to kafka: {0}")]
    Kafka(#[from] KafkaError),
    #[error("producer is closed")]
    Closed,
    #[error("delivery was canceled before an acknowledgement arrived")]
    Canceled,
}

/// Shared settings for every producer created from the same properties.
///
/// Each producer still owns its own librdkafka handle; this only carries the resolved client
/// configuration so sync and async producers talk to the cluster the same way.
#[derive(Clone)]
pub struct ProducerClient {
    props: ProducerProperties,
    config: ClientConfig,
}

impl ProducerClient {
    pub fn new(props: &ProducerProperties) -> Self {
        let config = ClientConfigBuilder::for_producer(props).build();
        debug!("rdkafka producer configuration: {:?}", config);
        Self {
            props: props.clone(),
            config,
        }
    }

    pub fn properties(&self) -> &ProducerProperties {
        &self.props
    }

    pub(crate) fn client_config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn flush_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.props.message_timeout_ms))
    }
}

/// Reports the local queue depth from librdkafka statistics.
#[derive(Clone, Copy, Default)]
pub struct StatsContext;

impl ClientContext for StatsContext {
    fn stats(&self, stats: Statistics) {
        metrics::gauge!(PRODUCER_QUEUE_DEPTH).set(stats.msg_cnt as f64);
    }
}

/// "Ping" the Kafka brokers by requesting metadata
pub(crate) fn ping_brokers<C: ClientContext>(client: &Client<C>) -> Result<(), KafkaError> {
    match client.fetch_metadata(None, METADATA_TIMEOUT) {
        Ok(metadata) => {
            info!(
                "Successfully connected to Kafka brokers. Found {} topics.",
                metadata.topics().len()
            );
            Ok(())
        }
        Err(error) => {
            error!("Failed to fetch metadata from Kafka brokers: {:?}", error);
            Err(error)
        }
    }
}
