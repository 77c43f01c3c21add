use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::group::{ConsumerGroup, GroupError};
use super::handler::ConsumerHandler;
use super::readiness::{ReadySignal, Readiness};
use super::session::SessionHandler;
use super::Consumer;
use crate::metrics_consts::CONSUMER_ERRORS;

/// Runs one [`ConsumerHandler`] in one consumer group.
///
/// `start` spawns a loop that keeps re-entering the group after every rebalance and retries
/// after errors, until the group is closed, the consumer is stopped or the token passed to
/// `start` is cancelled.
pub struct HandlerConsumer {
    name: String,
    topics: Vec<String>,
    group_id: String,
    group: Arc<dyn ConsumerGroup>,
    handler: Arc<dyn ConsumerHandler>,
    session: Arc<SessionHandler>,
    readiness: Arc<Readiness>,
    running: Arc<AtomicBool>,
    consume_task: Mutex<Option<JoinHandle<()>>>,
    error_logger: Mutex<Option<JoinHandle<()>>>,
}

impl HandlerConsumer {
    pub fn new(
        name: impl Into<String>,
        handler: Arc<dyn ConsumerHandler>,
        group: Arc<dyn ConsumerGroup>,
        topics: Vec<String>,
        group_id: impl Into<String>,
        auto_commit: bool,
    ) -> Self {
        let name = name.into();
        let readiness = Arc::new(Readiness::new());
        let session = Arc::new(SessionHandler::new(
            name.clone(),
            handler.clone(),
            auto_commit,
            readiness.clone(),
        ));

        Self {
            name,
            topics,
            group_id: group_id.into(),
            group,
            handler,
            session,
            readiness,
            running: Arc::new(AtomicBool::new(false)),
            consume_task: Mutex::new(None),
            error_logger: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn spawn_error_logger(&self) -> Option<JoinHandle<()>> {
        let mut errors = self.group.errors()?;
        let name = self.name.clone();
        Some(tokio::spawn(async move {
            while let Some(e) = errors.recv().await {
                error!(consumer = %name, "consumer group error: {}", e);
                metrics::counter!(CONSUMER_ERRORS, &[("level", "error"), ("error", "group")])
                    .increment(1);
            }
        }))
    }
}

fn take_task(slot: &Mutex<Option<JoinHandle<()>>>) -> Option<JoinHandle<()>> {
    match slot.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    }
}

fn store_task(slot: &Mutex<Option<JoinHandle<()>>>, task: Option<JoinHandle<()>>) {
    match slot.lock() {
        Ok(mut guard) => *guard = task,
        Err(poisoned) => *poisoned.into_inner() = task,
    }
}

struct ConsumeLoop {
    name: String,
    topics: Vec<String>,
    group: Arc<dyn ConsumerGroup>,
    session: Arc<SessionHandler>,
    readiness: Arc<Readiness>,
    running: Arc<AtomicBool>,
}

impl ConsumeLoop {
    async fn run(self, cancel: CancellationToken) {
        let mut consecutive_failures: u64 = 0;

        loop {
            let result = self
                .group
                .consume(&cancel, &self.topics, self.session.as_ref())
                .await;
            self.readiness.arm();

            match result {
                Ok(()) => consecutive_failures = 0,
                Err(GroupError::Closed) => {
                    info!(consumer = %self.name, "consumer group is closed");
                    break;
                }
                Err(e) if !self.running.load(Ordering::SeqCst) => {
                    info!(consumer = %self.name, "consumer is stopping: {}", e);
                    break;
                }
                Err(e) => {
                    consecutive_failures += 1;
                    error!(
                        consumer = %self.name,
                        attempt = consecutive_failures,
                        "error from consumer: {}", e
                    );
                    metrics::counter!(
                        CONSUMER_ERRORS,
                        &[("level", "error"), ("error", "consume")]
                    )
                    .increment(1);

                    let backoff = Duration::from_millis(100 * consecutive_failures.min(10));
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = sleep(backoff) => {}
                    }
                }
            }

            if cancel.is_cancelled() {
                info!(consumer = %self.name, "consumer context is cancelled");
                break;
            }
            if !self.running.load(Ordering::SeqCst) {
                info!(consumer = %self.name, "consumer is not running");
                break;
            }
        }

        self.readiness.arm();
    }
}

#[async_trait]
impl Consumer for HandlerConsumer {
    fn start(&self, cancel: CancellationToken) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!(consumer = %self.name, "consumer is already running");
            return;
        }
        info!(
            consumer = %self.name,
            group_id = %self.group_id,
            topics = ?self.topics,
            "starting consumer"
        );

        let error_logger = self.spawn_error_logger();
        let consume = ConsumeLoop {
            name: self.name.clone(),
            topics: self.topics.clone(),
            group: self.group.clone(),
            session: self.session.clone(),
            readiness: self.readiness.clone(),
            running: self.running.clone(),
        };
        store_task(&self.consume_task, Some(tokio::spawn(consume.run(cancel))));
        store_task(&self.error_logger, error_logger);
    }

    fn wait_for_ready(&self) -> ReadySignal {
        self.readiness.signal()
    }

    async fn stop(&self) {
        info!(consumer = %self.name, "stopping consumer");
        self.running.store(false, Ordering::SeqCst);

        if let Err(e) = self.group.close().await {
            error!(consumer = %self.name, "failed to close consumer group: {}", e);
        }
        self.handler.close().await;
        if let Err(e) = self.group.close_client().await {
            error!(consumer = %self.name, "failed to close consumer client: {}", e);
        }

        if let Some(task) = take_task(&self.consume_task) {
            if let Err(e) = task.await {
                error!(consumer = %self.name, "consumer task failed: {}", e);
            }
        }
        if let Some(logger) = take_task(&self.error_logger) {
            logger.abort();
        }
        info!(consumer = %self.name, "consumer stopped");
    }
}
