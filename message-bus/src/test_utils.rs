//! In-memory stand-ins for the consumer group seam, plus handlers that record what they see.
//!
//! [`FakeConsumerGroup`] runs sessions the same way the Kafka-backed group does: it waits for
//! an assignment, calls `setup`, feeds records to `consume_claim` and calls `cleanup` when the
//! session is revoked, cancelled or closed. Tests drive it through a [`FakeGroupController`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use rdkafka::error::KafkaError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::consumer::{
    ConsumerGroup, ConsumerGroupFactory, ConsumerHandler, GroupClaim, GroupError, GroupHandler,
    GroupSession,
};
use crate::message::ConsumerMessage;

/// Ordered log of calls shared between fakes, so tests can assert on interleavings.
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn record(&self, call: impl Into<String>) {
        lock(&self.0).push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.0).clone()
    }

    pub fn count(&self, call: &str) -> usize {
        lock(&self.0).iter().filter(|c| c.as_str() == call).count()
    }

    pub fn position(&self, call: &str) -> Option<usize> {
        lock(&self.0).iter().position(|c| c == call)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub fn consumer_message(topic: &str, partition: i32, offset: i64) -> ConsumerMessage {
    ConsumerMessage {
        topic: topic.to_string(),
        key: None,
        value: Some(format!("value-{offset}").into_bytes()),
        headers: None,
        partition,
        offset,
        timestamp: None,
    }
}

fn describe(message: &ConsumerMessage) -> String {
    format!("{}:{}:{}", message.topic, message.partition, message.offset)
}

/// Session that logs marks and commits.
pub struct RecordingSession {
    token: CancellationToken,
    log: CallLog,
}

impl RecordingSession {
    pub fn new(log: CallLog) -> Self {
        Self::with_token(CancellationToken::new(), log)
    }

    pub fn with_token(token: CancellationToken, log: CallLog) -> Self {
        Self { token, log }
    }
}

impl GroupSession for RecordingSession {
    fn cancellation(&self) -> &CancellationToken {
        &self.token
    }

    fn mark_message(&self, message: &ConsumerMessage) -> Result<(), GroupError> {
        self.log.record(format!("mark:{}", describe(message)));
        Ok(())
    }

    fn commit(&self) -> Result<(), GroupError> {
        self.log.record("commit");
        Ok(())
    }
}

/// Claim fed from a channel. Ends when the sender is dropped.
pub struct ChannelClaim {
    rx: mpsc::UnboundedReceiver<ConsumerMessage>,
}

impl ChannelClaim {
    pub fn new() -> (Self, mpsc::UnboundedSender<ConsumerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { rx }, tx)
    }
}

#[async_trait]
impl GroupClaim for ChannelClaim {
    async fn next(&mut self) -> Option<ConsumerMessage> {
        self.rx.recv().await
    }
}

/// Handler that logs every call. Can be told to fail once on given offsets.
pub struct RecordingHandler {
    log: CallLog,
    fail_once_at: Mutex<HashSet<i64>>,
    handled: AtomicUsize,
    closed: AtomicUsize,
}

impl RecordingHandler {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            fail_once_at: Mutex::new(HashSet::new()),
            handled: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        }
    }

    pub fn failing_at(self, offset: i64) -> Self {
        lock(&self.fail_once_at).insert(offset);
        self
    }

    pub fn handled(&self) -> usize {
        self.handled.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConsumerHandler for RecordingHandler {
    async fn handle(&self, message: &ConsumerMessage) -> anyhow::Result<()> {
        self.log.record(format!("handle:{}", describe(message)));
        if lock(&self.fail_once_at).remove(&message.offset) {
            return Err(anyhow!("failed to handle offset {}", message.offset));
        }
        self.handled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.log.record("handler_close");
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

pub enum FakeEvent {
    Assign,
    Deliver(ConsumerMessage),
    Revoke,
    Fail(GroupError),
}

/// Drives a [`FakeConsumerGroup`].
#[derive(Clone)]
pub struct FakeGroupController {
    events: mpsc::UnboundedSender<FakeEvent>,
    errors: mpsc::UnboundedSender<GroupError>,
    consume_calls: Arc<AtomicUsize>,
    close_error: Arc<Mutex<Option<GroupError>>>,
}

impl FakeGroupController {
    pub fn assign(&self) {
        self.push(FakeEvent::Assign);
    }

    pub fn deliver(&self, message: ConsumerMessage) {
        self.push(FakeEvent::Deliver(message));
    }

    pub fn revoke(&self) {
        self.push(FakeEvent::Revoke);
    }

    /// Ends the current session, or the wait for one, with `error`.
    pub fn fail(&self, error: GroupError) {
        self.push(FakeEvent::Fail(error));
    }

    /// Reports an asynchronous client error on the group's error stream.
    pub fn report_error(&self, error: GroupError) {
        if self.errors.send(error).is_err() {
            tracing::debug!("fake group error stream is closed");
        }
    }

    /// The next `consume` interrupted by `close` returns `error` instead of
    /// [`GroupError::Closed`], the way a real client can surface a broker error mid-shutdown.
    pub fn fail_on_close(&self, error: GroupError) {
        *lock(&self.close_error) = Some(error);
    }

    pub fn consume_calls(&self) -> usize {
        self.consume_calls.load(Ordering::SeqCst)
    }

    fn push(&self, event: FakeEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("fake group is gone");
        }
    }
}

pub struct FakeConsumerGroup {
    group_id: String,
    log: CallLog,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<FakeEvent>>,
    closed: CancellationToken,
    errors: Mutex<Option<mpsc::UnboundedReceiver<GroupError>>>,
    consume_calls: Arc<AtomicUsize>,
    close_error: Arc<Mutex<Option<GroupError>>>,
}

impl FakeConsumerGroup {
    pub fn new(group_id: &str, log: CallLog) -> (Self, FakeGroupController) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let consume_calls = Arc::new(AtomicUsize::new(0));
        let close_error = Arc::new(Mutex::new(None));

        let group = Self {
            group_id: group_id.to_string(),
            log,
            events: tokio::sync::Mutex::new(events_rx),
            closed: CancellationToken::new(),
            errors: Mutex::new(Some(errors_rx)),
            consume_calls: consume_calls.clone(),
            close_error: close_error.clone(),
        };
        let controller = FakeGroupController {
            events: events_tx,
            errors: errors_tx,
            consume_calls,
            close_error,
        };
        (group, controller)
    }

    fn closed_error(&self) -> GroupError {
        lock(&self.close_error).take().unwrap_or(GroupError::Closed)
    }
}

struct FakeClaim<'a> {
    events: &'a mut mpsc::UnboundedReceiver<FakeEvent>,
    session: CancellationToken,
    closed: CancellationToken,
    failure: Option<GroupError>,
}

#[async_trait]
impl GroupClaim for FakeClaim<'_> {
    async fn next(&mut self) -> Option<ConsumerMessage> {
        loop {
            tokio::select! {
                biased;
                _ = self.closed.cancelled() => return None,
                _ = self.session.cancelled() => return None,
                event = self.events.recv() => match event {
                    Some(FakeEvent::Deliver(message)) => return Some(message),
                    Some(FakeEvent::Assign) => continue,
                    Some(FakeEvent::Revoke) => {
                        self.session.cancel();
                        return None;
                    }
                    Some(FakeEvent::Fail(error)) => {
                        self.failure = Some(error);
                        self.session.cancel();
                        return None;
                    }
                    None => return None,
                },
            }
        }
    }
}

#[async_trait]
impl ConsumerGroup for FakeConsumerGroup {
    async fn consume(
        &self,
        cancel: &CancellationToken,
        _topics: &[String],
        handler: &dyn GroupHandler,
    ) -> Result<(), GroupError> {
        self.consume_calls.fetch_add(1, Ordering::SeqCst);
        if self.closed.is_cancelled() {
            return Err(self.closed_error());
        }

        let mut events = self.events.lock().await;
        loop {
            tokio::select! {
                biased;
                _ = self.closed.cancelled() => return Err(self.closed_error()),
                _ = cancel.cancelled() => return Ok(()),
                event = events.recv() => match event {
                    Some(FakeEvent::Assign) => break,
                    Some(FakeEvent::Fail(error)) => return Err(error),
                    Some(FakeEvent::Deliver(_)) | Some(FakeEvent::Revoke) => continue,
                    None => return Err(GroupError::Closed),
                },
            }
        }

        let session = RecordingSession::with_token(cancel.child_token(), self.log.clone());
        handler.setup(&session).await?;

        let mut claim = FakeClaim {
            events: &mut events,
            session: session.cancellation().clone(),
            closed: self.closed.clone(),
            failure: None,
        };
        let result = handler.consume_claim(&session, &mut claim).await;
        let failure = claim.failure.take();

        session.cancellation().cancel();
        let cleanup = handler.cleanup(&session).await;

        if let Some(error) = failure {
            return Err(error);
        }
        result?;
        cleanup
    }

    fn errors(&self) -> Option<mpsc::UnboundedReceiver<GroupError>> {
        lock(&self.errors).take()
    }

    async fn close(&self) -> Result<(), GroupError> {
        self.closed.cancel();
        let _events = self.events.lock().await;
        self.log.record("group_close");
        Ok(())
    }

    async fn close_client(&self) -> Result<(), GroupError> {
        self.log.record(format!("client_close:{}", self.group_id));
        Ok(())
    }
}

/// Hands out [`FakeConsumerGroup`]s and keeps their controllers by group id.
#[derive(Default)]
pub struct FakeGroupFactory {
    log: CallLog,
    controllers: Mutex<HashMap<String, FakeGroupController>>,
    created: Mutex<Vec<String>>,
    fail_for: Option<String>,
}

impl FakeGroupFactory {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            ..Default::default()
        }
    }

    /// Makes `create` fail for `group_id`.
    pub fn failing_for(mut self, group_id: &str) -> Self {
        self.fail_for = Some(group_id.to_string());
        self
    }

    pub fn controller(&self, group_id: &str) -> Option<FakeGroupController> {
        lock(&self.controllers).get(group_id).cloned()
    }

    /// Group ids passed to `create`, in call order.
    pub fn created(&self) -> Vec<String> {
        lock(&self.created).clone()
    }
}

impl ConsumerGroupFactory for FakeGroupFactory {
    fn create(&self, group_id: &str) -> Result<Arc<dyn ConsumerGroup>, GroupError> {
        lock(&self.created).push(group_id.to_string());
        if self.fail_for.as_deref() == Some(group_id) {
            return Err(GroupError::Kafka(KafkaError::ClientCreation(format!(
                "cannot create group {group_id}"
            ))));
        }

        let (group, controller) = FakeConsumerGroup::new(group_id, self.log.clone());
        lock(&self.controllers).insert(group_id.to_string(), controller);
        Ok(Arc::new(group))
    }
}

/// Collects consumed records per topic.
#[derive(Default)]
pub struct MessageCollector {
    messages: RwLock<HashMap<String, Vec<ConsumerMessage>>>,
}

impl MessageCollector {
    pub fn push(&self, message: ConsumerMessage) {
        let mut messages = match self.messages.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        messages
            .entry(message.topic.clone())
            .or_default()
            .push(message);
    }

    pub fn messages(&self, topic: &str) -> Vec<ConsumerMessage> {
        let messages = match self.messages.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        messages.get(topic).cloned().unwrap_or_default()
    }

    pub fn count(&self, topic: &str) -> usize {
        self.messages(topic).len()
    }

    pub fn clear(&self) {
        match self.messages.write() {
            Ok(mut guard) => guard.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }

    /// Polls until `topic` holds at least `count` records or `timeout` passes.
    pub async fn wait_for(&self, topic: &str, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.count(topic) >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

/// Handler storing every record in a [`MessageCollector`].
pub struct MessageCollectorHandler {
    collector: Arc<MessageCollector>,
}

impl MessageCollectorHandler {
    pub fn new(collector: Arc<MessageCollector>) -> Self {
        Self { collector }
    }
}

#[async_trait]
impl ConsumerHandler for MessageCollectorHandler {
    async fn handle(&self, message: &ConsumerMessage) -> anyhow::Result<()> {
        self.collector.push(message.clone());
        Ok(())
    }
}
