use std::sync::Mutex;

use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, Producer};
use rdkafka::util::Timeout;
use tracing::{debug, info};

use super::{ping_brokers, ProduceError, ProducerClient, StatsContext};
use crate::mapper::to_future_record;
use crate::message::Message;

/// Producer that waits for the broker acknowledgement of every record.
pub struct SyncProducer {
    producer: Mutex<Option<FutureProducer<StatsContext>>>,
    flush_timeout: std::time::Duration,
}

impl SyncProducer {
    pub fn new(client: &ProducerClient) -> Result<Self, KafkaError> {
        let producer: FutureProducer<StatsContext> = client
            .client_config()
            .create_with_context(StatsContext)?;
        ping_brokers(producer.client())?;

        Ok(Self {
            producer: Mutex::new(Some(producer)),
            flush_timeout: client.flush_timeout(),
        })
    }

    /// Sends one record and returns the partition and offset it was written to.
    pub async fn send(&self, message: &Message) -> Result<(i32, i64), ProduceError> {
        let producer = self.current().ok_or(ProduceError::Closed)?;

        match producer
            .send(to_future_record(message), Timeout::Never)
            .await
        {
            Ok((partition, offset)) => {
                debug!(
                    topic = %message.topic,
                    partition, offset, "message acknowledged"
                );
                Ok((partition, offset))
            }
            Err((KafkaError::Canceled, _)) => Err(ProduceError::Canceled),
            Err((e, _)) => Err(ProduceError::Kafka(e)),
        }
    }

    /// Flushes outstanding records and releases the connection. Later calls do nothing.
    pub fn close(&self) -> Result<(), KafkaError> {
        let producer = match self.producer.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(producer) = producer else {
            return Ok(());
        };

        info!("closing sync producer");
        producer.flush(self.flush_timeout)
    }

    fn current(&self) -> Option<FutureProducer<StatsContext>> {
        match self.producer.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}
