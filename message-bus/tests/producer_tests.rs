use std::time::Duration;

use message_bus::config::ClientProperties;
use message_bus::message::{Message, METADATA_EVENT_ID};
use message_bus::producer::{AsyncProducer, ProduceError, ProducerClient, SyncProducer};
use rdkafka::mocking::MockCluster;
use rdkafka::types::RDKafkaErrorCode;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

fn producer_client(bootstrap_servers: &str) -> ProducerClient {
    let json = format!(
        r#"{{"bootstrapServers": ["{bootstrap_servers}"], "producer": {{"flushFrequencyMs": 0, "bufferSize": 8}}}}"#
    );
    let props = ClientProperties::from_json(&json).expect("valid properties");
    ProducerClient::new(&props.producer)
}

#[tokio::test]
async fn test_sync_producer_returns_partition_and_offset() {
    let cluster = MockCluster::new(1).expect("failed to create mock brokers");
    cluster.create_topic("orders", 1, 1).expect("topic created");

    let producer = SyncProducer::new(&producer_client(&cluster.bootstrap_servers())).unwrap();

    let first = producer
        .send(&Message::new("orders").with_key("a").with_value("one"))
        .await
        .unwrap();
    let second = producer
        .send(&Message::new("orders").with_value("two"))
        .await
        .unwrap();

    assert_eq!(first.0, 0);
    assert_eq!(second.0, 0);
    assert!(second.1 > first.1);

    producer.close().unwrap();
    producer.close().unwrap();
    assert!(matches!(
        producer.send(&Message::new("orders")).await,
        Err(ProduceError::Closed)
    ));
}

#[tokio::test]
async fn test_async_producer_reports_successes_until_closed() {
    let cluster = MockCluster::new(1).expect("failed to create mock brokers");
    cluster.create_topic("orders", 1, 1).expect("topic created");

    let producer = AsyncProducer::new(&producer_client(&cluster.bootstrap_servers())).unwrap();
    let mut successes = producer.successes().expect("success stream");
    let mut errors = producer.errors().expect("error stream");
    assert!(producer.successes().is_none());

    for i in 0..3 {
        producer
            .send(
                Message::new("orders")
                    .with_value(format!("payload-{i}"))
                    .with_metadata(METADATA_EVENT_ID, i.to_string()),
            )
            .await
            .unwrap();
    }

    let mut delivered = Vec::new();
    for _ in 0..3 {
        let message = timeout(WAIT, successes.recv())
            .await
            .expect("delivery report in time")
            .expect("stream is open");
        delivered.push(message.metadata_value(METADATA_EVENT_ID).map(str::to_string));
    }
    delivered.sort();
    assert_eq!(
        delivered,
        vec![
            Some("0".to_string()),
            Some("1".to_string()),
            Some("2".to_string())
        ]
    );

    timeout(WAIT, producer.close()).await.unwrap().unwrap();
    assert!(timeout(WAIT, successes.recv()).await.unwrap().is_none());
    assert!(timeout(WAIT, errors.recv()).await.unwrap().is_none());

    let rejected = producer
        .send(Message::new("orders").with_value("late"))
        .await
        .unwrap_err();
    assert!(matches!(rejected.cause, ProduceError::Closed));
    assert_eq!(rejected.message.value.as_deref(), Some(&b"late"[..]));
}

#[tokio::test]
async fn test_async_producer_reports_failures_with_original_message() {
    let cluster = MockCluster::new(1).expect("failed to create mock brokers");
    cluster.create_topic("orders", 1, 1).expect("topic created");

    let producer = AsyncProducer::new(&producer_client(&cluster.bootstrap_servers())).unwrap();
    let mut successes = producer.successes().expect("success stream");
    let mut errors = producer.errors().expect("error stream");

    // Larger than the default message.max.bytes of 1000000.
    let payload = vec![b'x'; 2_000_000];
    producer
        .send(
            Message::new("orders")
                .with_key("oversized")
                .with_value(payload.clone()),
        )
        .await
        .unwrap();

    let failure = timeout(WAIT, errors.recv())
        .await
        .expect("failure reported in time")
        .expect("stream is open");
    assert!(matches!(
        &failure.cause,
        ProduceError::Kafka(e) if e.rdkafka_error_code() == Some(RDKafkaErrorCode::MessageSizeTooLarge)
    ));
    assert_eq!(failure.message.topic, "orders");
    assert_eq!(failure.message.key.as_deref(), Some(&b"oversized"[..]));
    assert_eq!(failure.message.value, Some(payload));
    assert!(failure.to_string().starts_with("failed to produce message to topic orders"));

    producer
        .send(Message::new("orders").with_value("small"))
        .await
        .unwrap();
    let delivered = timeout(WAIT, successes.recv())
        .await
        .expect("delivery report in time")
        .expect("stream is open");
    assert_eq!(delivered.value.as_deref(), Some(&b"small"[..]));

    timeout(WAIT, producer.close()).await.unwrap().unwrap();
}
