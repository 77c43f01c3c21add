use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{
    BaseConsumer, CommitMode as KafkaCommitMode, Consumer, ConsumerContext, Rebalance,
    StreamConsumer,
};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::group::{
    ConsumerGroup, ConsumerGroupFactory, GroupClaim, GroupError, GroupHandler, GroupSession,
};
use crate::client_config::ClientConfigBuilder;
use crate::config::ConsumerProperties;
use crate::mapper::to_consumer_message;
use crate::message::ConsumerMessage;
use crate::metrics_consts::{CONSUMER_ERRORS, REBALANCE_EMPTY};

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

type PartitionKey = (String, i32);

/// Rebalance notifications forwarded from librdkafka callbacks to the consume loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupEvent {
    Assigned,
    Revoked,
}

pub struct GroupContext {
    group_id: String,
    events: mpsc::UnboundedSender<GroupEvent>,
    errors: mpsc::UnboundedSender<GroupError>,
}

impl GroupContext {
    fn notify(&self, event: GroupEvent) {
        if self.events.send(event).is_err() {
            debug!(group_id = %self.group_id, "consume loop is gone, dropping {:?}", event);
        }
    }
}

impl ClientContext for GroupContext {
    fn error(&self, error: KafkaError, reason: &str) {
        warn!(group_id = %self.group_id, "librdkafka error: {}: {}", error, reason);
        if self.errors.send(GroupError::Kafka(error)).is_err() {
            debug!(group_id = %self.group_id, "error stream is closed");
        }
    }
}

impl ConsumerContext for GroupContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                if partitions.count() == 0 {
                    debug!(group_id = %self.group_id, "revoke event without partitions");
                    metrics::counter!(REBALANCE_EMPTY, "event_type" => "revoke")
                        .increment(1);
                }
                info!(
                    group_id = %self.group_id,
                    "revoking {} partitions",
                    partitions.count()
                );
                self.notify(GroupEvent::Revoked);
            }
            Rebalance::Assign(_) => {}
            Rebalance::Error(e) => {
                error!(group_id = %self.group_id, "rebalance error: {}", e);
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        if let Rebalance::Assign(partitions) = rebalance {
            // An empty assignment still starts a session so the consumer reports ready.
            if partitions.count() == 0 {
                metrics::counter!(REBALANCE_EMPTY, "event_type" => "assign")
                    .increment(1);
            }
            info!(
                group_id = %self.group_id,
                "assigned {} partitions",
                partitions.count()
            );
            self.notify(GroupEvent::Assigned);
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, _offsets: &TopicPartitionList) {
        if let Err(e) = result {
            warn!(group_id = %self.group_id, "offset commit failed: {}", e);
        }
    }
}

type GroupConsumer = StreamConsumer<GroupContext>;

struct GroupState {
    events: mpsc::UnboundedReceiver<GroupEvent>,
    subscription: Vec<String>,
    assigned: bool,
    /// Records read while waiting for an assignment, handed out first in the next session.
    pending: VecDeque<ConsumerMessage>,
}

impl GroupState {
    fn apply(&mut self, event: GroupEvent) {
        match event {
            GroupEvent::Assigned => self.assigned = true,
            GroupEvent::Revoked => {
                self.assigned = false;
                self.pending.clear();
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Classifies a consumption error. Returns the error back when the session cannot go on.
async fn handle_consume_error(
    group_id: &str,
    errors: &mpsc::UnboundedSender<GroupError>,
    e: KafkaError,
    consecutive: u64,
) -> Option<KafkaError> {
    match &e {
        KafkaError::MessageConsumptionFatal(code) => {
            error!(group_id = %group_id, "fatal Kafka consumer error: {:?}", code);
            metrics::counter!(CONSUMER_ERRORS, &[("level", "fatal"), ("error", "consumer")])
                .increment(1);
            Some(e)
        }
        KafkaError::Canceled => {
            info!(group_id = %group_id, "consumer canceled");
            Some(e)
        }
        KafkaError::MessageConsumption(RDKafkaErrorCode::PartitionEOF) => None,
        _ => {
            warn!(group_id = %group_id, "Kafka consumer error: {}", e);
            metrics::counter!(CONSUMER_ERRORS, &[("level", "warn"), ("error", "consumer")])
                .increment(1);
            if errors.send(GroupError::Kafka(e)).is_err() {
                debug!(group_id = %group_id, "error stream is closed");
            }
            sleep(Duration::from_millis(100 * consecutive.min(10))).await;
            None
        }
    }
}

struct KafkaSession {
    consumer: Arc<GroupConsumer>,
    token: CancellationToken,
    /// Next offset to read per partition, for every record marked in this session.
    positions: Mutex<HashMap<PartitionKey, i64>>,
    uncommitted: Mutex<HashMap<PartitionKey, i64>>,
}

impl GroupSession for KafkaSession {
    fn cancellation(&self) -> &CancellationToken {
        &self.token
    }

    fn mark_message(&self, message: &ConsumerMessage) -> Result<(), GroupError> {
        let next = message.offset + 1;
        self.consumer
            .store_offset(&message.topic, message.partition, next)?;

        let key = (message.topic.clone(), message.partition);
        lock(&self.positions).insert(key.clone(), next);
        lock(&self.uncommitted).insert(key, next);
        Ok(())
    }

    fn commit(&self) -> Result<(), GroupError> {
        let offsets = std::mem::take(&mut *lock(&self.uncommitted));
        if offsets.is_empty() {
            return Ok(());
        }

        let mut list = TopicPartitionList::new();
        for ((topic, partition), offset) in &offsets {
            list.add_partition_offset(topic, *partition, Offset::Offset(*offset))?;
        }
        self.consumer.commit(&list, KafkaCommitMode::Sync)?;
        Ok(())
    }
}

struct KafkaClaim<'a> {
    group_id: &'a str,
    consumer: &'a GroupConsumer,
    state: &'a mut GroupState,
    session: CancellationToken,
    closed: CancellationToken,
    errors: &'a mpsc::UnboundedSender<GroupError>,
    /// Offset of the last record handed out per partition.
    delivered: HashMap<PartitionKey, i64>,
    consecutive_errors: u64,
    fatal: Option<KafkaError>,
}

impl KafkaClaim<'_> {
    fn deliver(&mut self, message: ConsumerMessage) -> Option<ConsumerMessage> {
        self.delivered
            .insert((message.topic.clone(), message.partition), message.offset);
        Some(message)
    }
}

#[async_trait]
impl GroupClaim for KafkaClaim<'_> {
    async fn next(&mut self) -> Option<ConsumerMessage> {
        if let Some(message) = self.state.pending.pop_front() {
            return self.deliver(message);
        }

        loop {
            tokio::select! {
                biased;
                _ = self.closed.cancelled() => return None,
                _ = self.session.cancelled() => return None,
                event = self.state.events.recv() => {
                    let Some(event) = event else {
                        return None;
                    };
                    // Any membership change ends the session; the next one picks up the
                    // new assignment.
                    self.state.apply(event);
                    self.session.cancel();
                    return None;
                }
                received = self.consumer.recv() => match received {
                    Ok(message) => {
                        self.consecutive_errors = 0;
                        let message = to_consumer_message(&message);
                        return self.deliver(message);
                    }
                    Err(e) => {
                        self.consecutive_errors += 1;
                        let fatal = handle_consume_error(
                            self.group_id,
                            self.errors,
                            e,
                            self.consecutive_errors,
                        )
                        .await;
                        if let Some(fatal) = fatal {
                            self.fatal = Some(fatal);
                            self.session.cancel();
                            return None;
                        }
                    }
                },
            }
        }
    }
}

/// Consumer group membership backed by an rdkafka [`StreamConsumer`].
///
/// One session spans one generation of the group. All partitions assigned to this member are
/// served by a single claim; records of a partition keep their order. When a session ends
/// with an error, partitions with an unmarked record are rewound to it so the record is read
/// again in the next session.
pub struct KafkaConsumerGroup {
    group_id: String,
    consumer: Mutex<Option<Arc<GroupConsumer>>>,
    state: tokio::sync::Mutex<GroupState>,
    closed: CancellationToken,
    errors_tx: mpsc::UnboundedSender<GroupError>,
    errors_rx: Mutex<Option<mpsc::UnboundedReceiver<GroupError>>>,
}

impl KafkaConsumerGroup {
    pub fn new(props: &ConsumerProperties, group_id: &str) -> Result<Self, GroupError> {
        let config = ClientConfigBuilder::for_consumer(props, group_id)?.build();
        debug!("rdkafka consumer configuration: {:?}", config);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let context = GroupContext {
            group_id: group_id.to_string(),
            events: events_tx,
            errors: errors_tx.clone(),
        };
        let consumer: GroupConsumer = config.create_with_context(context)?;

        Ok(Self {
            group_id: group_id.to_string(),
            consumer: Mutex::new(Some(Arc::new(consumer))),
            state: tokio::sync::Mutex::new(GroupState {
                events: events_rx,
                subscription: Vec::new(),
                assigned: false,
                pending: VecDeque::new(),
            }),
            closed: CancellationToken::new(),
            errors_tx,
            errors_rx: Mutex::new(Some(errors_rx)),
        })
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    fn consumer(&self) -> Option<Arc<GroupConsumer>> {
        lock(&self.consumer).clone()
    }

    /// Waits until the group hands this member an assignment. Records that arrive in the
    /// same poll as the assignment are kept for the session.
    async fn await_assignment(
        &self,
        consumer: &GroupConsumer,
        state: &mut GroupState,
        cancel: &CancellationToken,
    ) -> Result<bool, GroupError> {
        let mut consecutive_errors = 0;
        while !state.assigned {
            tokio::select! {
                biased;
                _ = self.closed.cancelled() => return Err(GroupError::Closed),
                _ = cancel.cancelled() => return Ok(false),
                event = state.events.recv() => match event {
                    Some(event) => state.apply(event),
                    None => return Err(GroupError::Closed),
                },
                received = consumer.recv() => match received {
                    Ok(message) => {
                        consecutive_errors = 0;
                        state.pending.push_back(to_consumer_message(&message));
                    }
                    Err(e) => {
                        consecutive_errors += 1;
                        let fatal = handle_consume_error(
                            &self.group_id,
                            &self.errors_tx,
                            e,
                            consecutive_errors,
                        )
                        .await;
                        if let Some(fatal) = fatal {
                            return Err(GroupError::Kafka(fatal));
                        }
                    }
                },
            }
        }
        Ok(true)
    }

    /// Seeks every partition with an unhandled record back to the earliest such record.
    async fn rewind(
        &self,
        consumer: Arc<GroupConsumer>,
        state: &mut GroupState,
        delivered: HashMap<PartitionKey, i64>,
        positions: &HashMap<PartitionKey, i64>,
    ) {
        let mut replay: HashMap<PartitionKey, i64> = delivered
            .into_iter()
            .filter(|(key, offset)| positions.get(key).map_or(true, |next| next <= offset))
            .collect();
        for message in state.pending.drain(..) {
            let entry = replay
                .entry((message.topic, message.partition))
                .or_insert(message.offset);
            *entry = (*entry).min(message.offset);
        }
        if replay.is_empty() {
            return;
        }

        // seek blocks until the fetcher acknowledges, keep it off the runtime threads
        let group_id = self.group_id.clone();
        let seeks = tokio::task::spawn_blocking(move || {
            for ((topic, partition), offset) in replay {
                match consumer.seek(&topic, partition, Offset::Offset(offset), SEEK_TIMEOUT) {
                    Ok(()) => info!(
                        group_id = %group_id,
                        "rewound {}[{}] to offset {}", topic, partition, offset
                    ),
                    Err(e) => warn!(
                        group_id = %group_id,
                        "failed to rewind {}[{}] to offset {}: {}", topic, partition, offset, e
                    ),
                }
            }
        });
        if let Err(e) = seeks.await {
            error!(group_id = %self.group_id, "rewind task failed: {}", e);
        }
    }
}

#[async_trait]
impl ConsumerGroup for KafkaConsumerGroup {
    async fn consume(
        &self,
        cancel: &CancellationToken,
        topics: &[String],
        handler: &dyn GroupHandler,
    ) -> Result<(), GroupError> {
        if self.closed.is_cancelled() {
            return Err(GroupError::Closed);
        }
        let mut state = self.state.lock().await;
        let consumer = match self.consumer() {
            Some(consumer) if !self.closed.is_cancelled() => consumer,
            _ => return Err(GroupError::Closed),
        };

        if state.subscription != topics {
            let names: Vec<&str> = topics.iter().map(String::as_str).collect();
            consumer.subscribe(&names)?;
            info!(group_id = %self.group_id, topics = ?topics, "subscribed to topics");
            state.subscription = topics.to_vec();
            state.assigned = false;
            state.pending.clear();
        }

        if !self.await_assignment(&consumer, &mut state, cancel).await? {
            return Ok(());
        }

        let session = KafkaSession {
            consumer: consumer.clone(),
            token: cancel.child_token(),
            positions: Mutex::new(HashMap::new()),
            uncommitted: Mutex::new(HashMap::new()),
        };
        handler.setup(&session).await?;

        let mut claim = KafkaClaim {
            group_id: &self.group_id,
            consumer: &consumer,
            state: &mut state,
            session: session.token.clone(),
            closed: self.closed.clone(),
            errors: &self.errors_tx,
            delivered: HashMap::new(),
            consecutive_errors: 0,
            fatal: None,
        };
        let result = handler.consume_claim(&session, &mut claim).await;
        let fatal = claim.fatal.take();
        let delivered = std::mem::take(&mut claim.delivered);

        session.token.cancel();
        let cleanup = handler.cleanup(&session).await;

        if result.is_err() || fatal.is_some() {
            let positions = lock(&session.positions).clone();
            self.rewind(consumer.clone(), &mut state, delivered, &positions)
                .await;
        }
        if let Some(e) = fatal {
            return Err(GroupError::Kafka(e));
        }
        result?;
        cleanup
    }

    fn errors(&self) -> Option<mpsc::UnboundedReceiver<GroupError>> {
        lock(&self.errors_rx).take()
    }

    async fn close(&self) -> Result<(), GroupError> {
        self.closed.cancel();
        let mut state = self.state.lock().await;
        if let Some(consumer) = self.consumer() {
            consumer.unsubscribe();
        }
        state.subscription.clear();
        state.assigned = false;
        state.pending.clear();
        info!(group_id = %self.group_id, "left consumer group");
        Ok(())
    }

    /// Drops the client on a blocking thread, librdkafka's consumer close waits for the
    /// broker.
    async fn close_client(&self) -> Result<(), GroupError> {
        let consumer = lock(&self.consumer).take();
        let Some(consumer) = consumer else {
            return Ok(());
        };
        info!(group_id = %self.group_id, "closing consumer client");
        tokio::task::spawn_blocking(move || drop(consumer))
            .await
            .map_err(|_| GroupError::Kafka(KafkaError::Canceled))
    }
}

/// Creates one [`KafkaConsumerGroup`] per group id, each with its own connection.
pub struct KafkaConsumerGroupFactory {
    props: ConsumerProperties,
}

impl KafkaConsumerGroupFactory {
    pub fn new(props: &ConsumerProperties) -> Self {
        Self {
            props: props.clone(),
        }
    }
}

impl ConsumerGroupFactory for KafkaConsumerGroupFactory {
    fn create(&self, group_id: &str) -> Result<Arc<dyn ConsumerGroup>, GroupError> {
        Ok(Arc::new(KafkaConsumerGroup::new(&self.props, group_id)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientProperties, OFFSET_OLDEST};

    #[test]
    fn test_group_state_events() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let mut state = GroupState {
            events: rx,
            subscription: vec![],
            assigned: false,
            pending: VecDeque::from(vec![crate::test_utils::consumer_message("t", 0, 1)]),
        };

        state.apply(GroupEvent::Assigned);
        assert!(state.assigned);
        assert_eq!(state.pending.len(), 1);

        state.apply(GroupEvent::Revoked);
        assert!(!state.assigned);
        assert!(state.pending.is_empty());
    }

    #[tokio::test]
    async fn test_fatal_errors_end_the_session() {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let fatal = handle_consume_error(
            "g",
            &tx,
            KafkaError::MessageConsumptionFatal(RDKafkaErrorCode::Fatal),
            1,
        )
        .await;
        assert!(fatal.is_some());
        assert!(rx.try_recv().is_err());

        let transient = handle_consume_error(
            "g",
            &tx,
            KafkaError::MessageConsumption(RDKafkaErrorCode::BrokerTransportFailure),
            1,
        )
        .await;
        assert!(transient.is_none());
        assert!(matches!(rx.try_recv(), Ok(GroupError::Kafka(_))));
    }

    #[tokio::test]
    async fn test_unsupported_initial_offset_fails_creation() {
        let mut props = ClientProperties::default();
        props.normalize();
        props.consumer.initial_offset = 12;

        let result = KafkaConsumerGroupFactory::new(&props.consumer).create("g");
        assert!(matches!(result, Err(GroupError::Config(_))));

        props.consumer.initial_offset = OFFSET_OLDEST;
        let group = KafkaConsumerGroup::new(&props.consumer, "billing").unwrap();
        assert_eq!(group.group_id(), "billing");
        assert!(group.errors().is_some());
        assert!(group.errors().is_none());
        group.close_client().await.unwrap();
        assert!(matches!(
            group
                .consume(
                    &CancellationToken::new(),
                    &["orders".to_string()],
                    &NoopHandler
                )
                .await,
            Err(GroupError::Closed)
        ));
    }

    struct NoopHandler;

    #[async_trait]
    impl GroupHandler for NoopHandler {
        async fn setup(&self, _session: &dyn GroupSession) -> Result<(), GroupError> {
            Ok(())
        }

        async fn cleanup(&self, _session: &dyn GroupSession) -> Result<(), GroupError> {
            Ok(())
        }

        async fn consume_claim(
            &self,
            _session: &dyn GroupSession,
            _claim: &mut dyn GroupClaim,
        ) -> Result<(), GroupError> {
            Ok(())
        }
    }
}
