use std::sync::{Arc, Mutex};
use std::time::Duration;

use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{DeliveryResult, Producer, ProducerContext, ThreadedProducer};
use rdkafka::{ClientContext, Statistics};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::{ping_brokers, ProduceError, ProducerClient};
use crate::mapper::to_base_record;
use crate::message::{Message, ProducerError};
use crate::metrics_consts::{PRODUCER_DELIVERIES, PRODUCER_QUEUE_DEPTH, PRODUCER_QUEUE_FULL};

const QUEUE_FULL_BACKOFF: Duration = Duration::from_millis(50);

/// Routes librdkafka delivery reports into the success and error streams.
///
/// Delivery reports arrive on the producer's polling thread, or on the thread that flushes the
/// producer during close. A full stream blocks that thread until the application drains it.
pub struct DeliveryContext {
    successes: mpsc::Sender<Message>,
    errors: mpsc::Sender<ProducerError>,
}

impl ClientContext for DeliveryContext {
    fn stats(&self, stats: Statistics) {
        metrics::gauge!(PRODUCER_QUEUE_DEPTH).set(stats.msg_cnt as f64);
    }
}

impl ProducerContext for DeliveryContext {
    type DeliveryOpaque = Arc<Message>;

    fn delivery(&self, result: &DeliveryResult<'_>, opaque: Self::DeliveryOpaque) {
        let message = into_message(opaque);
        match result {
            Ok(_) => {
                metrics::counter!(PRODUCER_DELIVERIES, &[("status", "success")]).increment(1);
                if futures::executor::block_on(self.successes.send(message)).is_err() {
                    debug!("success stream is closed, dropping delivery report");
                }
            }
            Err((e, _)) => {
                metrics::counter!(PRODUCER_DELIVERIES, &[("status", "error")]).increment(1);
                let failure = ProducerError::new(message, ProduceError::Kafka(e.clone()));
                if futures::executor::block_on(self.errors.send(failure)).is_err() {
                    debug!("error stream is closed, dropping delivery report");
                }
            }
        }
    }
}

struct Inner {
    producer: ThreadedProducer<DeliveryContext>,
    errors: mpsc::Sender<ProducerError>,
}

/// Fire-and-forget producer. Outcomes are reported on two streams, see [`successes`](Self::successes)
/// and [`errors`](Self::errors).
///
/// Every record accepted by `send` yields exactly one outcome, and both streams end after
/// [`close`](Self::close) once their outcomes are drained. Applications must keep draining
/// both streams; an undrained stream eventually stalls delivery and then `send`.
pub struct AsyncProducer {
    inner: Mutex<Option<Arc<Inner>>>,
    successes: Mutex<Option<mpsc::Receiver<Message>>>,
    errors: Mutex<Option<mpsc::Receiver<ProducerError>>>,
    flush_timeout: Duration,
}

impl AsyncProducer {
    pub fn new(client: &ProducerClient) -> Result<Self, KafkaError> {
        let buffer_size = client.properties().buffer_size.max(1);

        let (delivered_tx, delivered_rx) = mpsc::channel(buffer_size);
        let (failed_tx, failed_rx) = mpsc::channel(buffer_size);
        let (successes_tx, successes_rx) = mpsc::channel(buffer_size);
        let (errors_tx, errors_rx) = mpsc::channel(buffer_size);

        let context = DeliveryContext {
            successes: delivered_tx,
            errors: failed_tx.clone(),
        };
        let producer: ThreadedProducer<DeliveryContext> =
            client.client_config().create_with_context(context)?;
        ping_brokers(producer.client())?;

        forward(delivered_rx, successes_tx);
        forward(failed_rx, errors_tx);

        Ok(Self {
            inner: Mutex::new(Some(Arc::new(Inner {
                producer,
                errors: failed_tx,
            }))),
            successes: Mutex::new(Some(successes_rx)),
            errors: Mutex::new(Some(errors_rx)),
            flush_timeout: client.flush_timeout(),
        })
    }

    /// Enqueues a record. Waits while the client buffer is full.
    ///
    /// Broker and enqueue failures are reported on the error stream. The only error returned
    /// here is [`ProduceError::Closed`], handing the message back to the caller.
    pub async fn send(&self, message: Message) -> Result<(), ProducerError> {
        let Some(inner) = self.current() else {
            return Err(ProducerError::new(message, ProduceError::Closed));
        };

        let shared = Arc::new(message);
        loop {
            let result = inner
                .producer
                .send(to_base_record(&shared, Arc::clone(&shared)))
                .map_err(|(e, _)| e);

            match result {
                Ok(()) => return Ok(()),
                Err(KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull)) => {
                    metrics::counter!(PRODUCER_QUEUE_FULL).increment(1);
                    sleep(QUEUE_FULL_BACKOFF).await;
                }
                Err(e) => {
                    let failure = ProducerError::new(into_message(shared), ProduceError::Kafka(e));
                    if let Err(mpsc::error::SendError(failure)) = inner.errors.send(failure).await {
                        warn!("error stream is closed: {}", failure);
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Acknowledged records, in acknowledgement order. Can be taken once.
    pub fn successes(&self) -> Option<mpsc::Receiver<Message>> {
        take(&self.successes)
    }

    /// Records that could not be delivered. Can be taken once.
    pub fn errors(&self) -> Option<mpsc::Receiver<ProducerError>> {
        take(&self.errors)
    }

    /// Flushes every accepted record and releases the client. Both streams end once the
    /// remaining outcomes have been read. Later calls do nothing.
    pub async fn close(&self) -> Result<(), KafkaError> {
        let inner = match self.inner.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(inner) = inner else {
            return Ok(());
        };

        info!("closing async producer");
        let timeout = self.flush_timeout;
        tokio::task::spawn_blocking(move || {
            let flushed = inner.producer.flush(timeout);
            drop(inner);
            flushed
        })
        .await
        .map_err(|_| KafkaError::Canceled)?
    }

    fn current(&self) -> Option<Arc<Inner>> {
        match self.inner.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

fn take<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    match slot.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    }
}

fn into_message(shared: Arc<Message>) -> Message {
    Arc::try_unwrap(shared).unwrap_or_else(|shared| (*shared).clone())
}

/// Republishes outcomes to the application-facing stream. Keeps draining after the
/// application drops its receiver so delivery reports never stall.
fn forward<T: Send + 'static>(mut from: mpsc::Receiver<T>, to: mpsc::Sender<T>) {
    tokio::spawn(async move {
        let mut receiver_gone = false;
        while let Some(item) = from.recv().await {
            if receiver_gone {
                continue;
            }
            if to.send(item).await.is_err() {
                debug!("outcome stream receiver dropped");
                receiver_gone = true;
            }
        }
    });
}
