use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::group::ConsumerGroupFactory;
use super::handler::ConsumerHandler;
use super::handler_consumer::HandlerConsumer;
use super::readiness::{ReadySignal, Readiness};
use super::Consumer;
use crate::config::ConsumerProperties;
use crate::error::RegistryError;

/// Mapping keys and handler names are matched ignoring case and surrounding whitespace.
fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase()
}

/// Collects named handlers before they are matched against the configured handler mappings.
#[derive(Default)]
pub struct ConsumerRegistryBuilder {
    handlers: HashMap<String, (String, Arc<dyn ConsumerHandler>)>,
}

impl ConsumerRegistryBuilder {
    pub fn handler(mut self, name: impl Into<String>, handler: Arc<dyn ConsumerHandler>) -> Self {
        let name = name.into();
        if self
            .handlers
            .insert(normalize_key(&name), (name.clone(), handler))
            .is_some()
        {
            warn!("handler {} is registered twice, keeping the last one", name);
        }
        self
    }

    /// Creates one consumer per enabled mapping whose key names a registered handler.
    ///
    /// Fails when no mappings are configured, and on the first consumer that cannot be created.
    pub fn build(
        self,
        props: &ConsumerProperties,
        factory: &dyn ConsumerGroupFactory,
    ) -> Result<ConsumerRegistry, RegistryError> {
        if props.handler_mappings.is_empty() {
            return Err(RegistryError::MissingHandlerMappings);
        }

        let auto_commit = props.commit_mode.is_auto_commit();
        let mappings: BTreeMap<_, _> = props.handler_mappings.iter().collect();
        let mut consumers: BTreeMap<String, Arc<HandlerConsumer>> = BTreeMap::new();

        for (key, mapping) in mappings {
            if !mapping.enable {
                debug!("handler mapping {} is disabled", key);
                continue;
            }
            let normalized = normalize_key(key);
            let Some((name, handler)) = self.handlers.get(&normalized) else {
                debug!("no handler is registered for mapping {}", key);
                continue;
            };
            if consumers.contains_key(&normalized) {
                warn!("handler mapping {} duplicates another mapping, skipping", key);
                continue;
            }

            let topics = mapping.resolved_topics();
            let group_id = mapping.resolved_group_id();
            if mapping.concurrency.is_some() {
                debug!("concurrency of mapping {} is ignored", key);
            }

            let group = factory
                .create(&group_id)
                .map_err(|source| RegistryError::Consumer {
                    key: key.clone(),
                    source,
                })?;

            info!(
                handler = %name,
                group_id = %group_id,
                topics = ?topics,
                "registered consumer"
            );
            consumers.insert(
                normalized,
                Arc::new(HandlerConsumer::new(
                    name.clone(),
                    handler.clone(),
                    group,
                    topics,
                    group_id,
                    auto_commit,
                )),
            );
        }

        Ok(ConsumerRegistry {
            consumers,
            readiness: Arc::new(Readiness::new()),
            shutdown: CancellationToken::new(),
            fan_in: Mutex::new(None),
        })
    }
}

/// Runs every configured handler consumer and reports when all of them are ready.
pub struct ConsumerRegistry {
    consumers: BTreeMap<String, Arc<HandlerConsumer>>,
    readiness: Arc<Readiness>,
    shutdown: CancellationToken,
    fan_in: Mutex<Option<JoinHandle<()>>>,
}

impl ConsumerRegistry {
    pub fn builder() -> ConsumerRegistryBuilder {
        ConsumerRegistryBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    /// Looks a consumer up by its mapping key, ignoring case and surrounding whitespace.
    pub fn consumer(&self, key: &str) -> Option<&Arc<HandlerConsumer>> {
        self.consumers.get(&normalize_key(key))
    }

    pub fn consumers(&self) -> impl Iterator<Item = &Arc<HandlerConsumer>> {
        self.consumers.values()
    }

    fn fan_in(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        match self.fan_in.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl Consumer for ConsumerRegistry {
    fn start(&self, cancel: CancellationToken) {
        // Taken before starting so a consumer that becomes ready and re-arms quickly still counts.
        let signals: Vec<ReadySignal> = self
            .consumers
            .values()
            .map(|consumer| consumer.wait_for_ready())
            .collect();

        for consumer in self.consumers.values() {
            consumer.start(cancel.clone());
        }

        if signals.is_empty() {
            info!("no consumers are registered");
            self.readiness.fire();
            return;
        }

        let readiness = self.readiness.clone();
        let shutdown = self.shutdown.clone();
        let task = tokio::spawn(async move {
            let total = signals.len();
            tokio::select! {
                _ = join_all(signals.iter().map(ReadySignal::wait)) => {
                    info!("all {} consumers are ready", total);
                    readiness.fire();
                }
                _ = shutdown.cancelled() => {
                    debug!("consumers stopped before all of them were ready");
                }
                _ = cancel.cancelled() => {
                    debug!("consumer context cancelled before all consumers were ready");
                }
            }
        });
        *self.fan_in() = Some(task);
    }

    fn wait_for_ready(&self) -> ReadySignal {
        self.readiness.signal()
    }

    async fn stop(&self) {
        info!("stopping {} consumers", self.consumers.len());
        self.shutdown.cancel();

        join_all(self.consumers.values().map(|consumer| consumer.stop())).await;

        let fan_in = self.fan_in().take();
        if let Some(task) = fan_in {
            if let Err(e) = task.await {
                warn!("readiness task failed: {}", e);
            }
        }
        info!("all consumers stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CommitMode, TopicConsumerConfig};
    use crate::consumer::GroupError;
    use crate::test_utils::{consumer_message, CallLog, FakeGroupFactory, RecordingHandler};
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn mapping(enable: bool, topic: &str, group_id: &str) -> TopicConsumerConfig {
        TopicConsumerConfig {
            enable,
            topic: Some(topic.to_string()),
            group_id: group_id.to_string(),
            ..Default::default()
        }
    }

    fn props(mappings: Vec<(&str, TopicConsumerConfig)>) -> ConsumerProperties {
        ConsumerProperties {
            handler_mappings: mappings
                .into_iter()
                .map(|(key, mapping)| (key.to_string(), mapping))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_missing_mappings_is_an_error() {
        let factory = FakeGroupFactory::default();
        let result = ConsumerRegistry::builder()
            .handler("Orders", Arc::new(RecordingHandler::new(CallLog::default())))
            .build(&props(vec![]), &factory);

        assert!(matches!(result, Err(RegistryError::MissingHandlerMappings)));
    }

    #[test]
    fn test_disabled_and_unmatched_mappings_are_skipped() {
        let factory = FakeGroupFactory::default();
        let registry = ConsumerRegistry::builder()
            .handler("Orders", Arc::new(RecordingHandler::new(CallLog::default())))
            .handler("Audit", Arc::new(RecordingHandler::new(CallLog::default())))
            .build(
                &props(vec![
                    ("Orders", mapping(true, "orders", "billing")),
                    ("Audit", mapping(false, "audit", "audit")),
                    ("Payments", mapping(true, "payments", "payments")),
                ]),
                &factory,
            )
            .unwrap();

        assert_eq!(registry.len(), 1);
        assert!(registry.consumer("orders").is_some());
        assert!(registry.consumer("audit").is_none());
        assert_eq!(factory.created(), vec!["billing"]);
    }

    #[test]
    fn test_keys_match_ignoring_case_and_whitespace() {
        let factory = FakeGroupFactory::default();
        let registry = ConsumerRegistry::builder()
            .handler("OrdersHandler", Arc::new(RecordingHandler::new(CallLog::default())))
            .build(
                &props(vec![(
                    "  ordershandler ",
                    TopicConsumerConfig {
                        enable: true,
                        topic: Some(" orders ".to_string()),
                        group_id: " billing ".to_string(),
                        ..Default::default()
                    },
                )]),
                &factory,
            )
            .unwrap();

        let consumer = registry.consumer("OrdersHandler").unwrap();
        assert_eq!(consumer.name(), "OrdersHandler");
        assert_eq!(consumer.topics(), ["orders"]);
        assert_eq!(consumer.group_id(), "billing");
    }

    #[test]
    fn test_duplicate_normalized_keys_create_one_consumer() {
        let factory = FakeGroupFactory::default();
        let registry = ConsumerRegistry::builder()
            .handler("Orders", Arc::new(RecordingHandler::new(CallLog::default())))
            .build(
                &props(vec![
                    ("Orders", mapping(true, "orders", "billing")),
                    ("orders", mapping(true, "orders", "billing-2")),
                ]),
                &factory,
            )
            .unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(factory.created().len(), 1);
    }

    #[test]
    fn test_consumer_creation_failure_aborts_build() {
        let factory = FakeGroupFactory::default().failing_for("broken");
        let result = ConsumerRegistry::builder()
            .handler("Orders", Arc::new(RecordingHandler::new(CallLog::default())))
            .build(&props(vec![("Orders", mapping(true, "orders", "broken"))]), &factory);

        match result {
            Err(RegistryError::Consumer { key, source }) => {
                assert_eq!(key, "Orders");
                assert!(matches!(source, GroupError::Kafka(_)));
            }
            _ => panic!("expected consumer creation to fail"),
        }
    }

    #[tokio::test]
    async fn test_zero_consumers_ready_immediately() {
        let factory = FakeGroupFactory::default();
        let registry = ConsumerRegistry::builder()
            .build(&props(vec![("Orders", mapping(true, "orders", "billing"))]), &factory)
            .unwrap();
        assert!(registry.is_empty());

        registry.start(CancellationToken::new());
        assert!(registry.wait_for_ready().is_ready());
        registry.stop().await;
    }

    #[tokio::test]
    async fn test_ready_only_after_every_consumer() {
        let log = CallLog::default();
        let factory = FakeGroupFactory::new(log.clone());
        let registry = ConsumerRegistry::builder()
            .handler("Orders", Arc::new(RecordingHandler::new(log.clone())))
            .handler("Audit", Arc::new(RecordingHandler::new(log.clone())))
            .build(
                &props(vec![
                    ("Orders", mapping(true, "orders", "billing")),
                    ("Audit", mapping(true, "audit", "audit")),
                ]),
                &factory,
            )
            .unwrap();

        let ready = registry.wait_for_ready();
        registry.start(CancellationToken::new());

        factory.controller("billing").unwrap().assign();
        timeout(WAIT, registry.consumer("orders").unwrap().wait_for_ready().wait())
            .await
            .unwrap();
        assert!(timeout(Duration::from_millis(100), ready.wait()).await.is_err());

        factory.controller("audit").unwrap().assign();
        timeout(WAIT, ready.wait()).await.unwrap();

        timeout(WAIT, registry.stop()).await.unwrap();
        assert_eq!(log.count("handler_close"), 2);
    }

    #[tokio::test]
    async fn test_orders_scenario() {
        let log = CallLog::default();
        let factory = FakeGroupFactory::new(log.clone());
        let handler = Arc::new(RecordingHandler::new(log.clone()));
        let mut props = props(vec![("OrdersHandler", mapping(true, "orders", "billing"))]);
        props.commit_mode = CommitMode::AutoCommitImmediately;

        let registry = ConsumerRegistry::builder()
            .handler("OrdersHandler", handler.clone())
            .build(&props, &factory)
            .unwrap();
        registry.start(CancellationToken::new());

        let controller = factory.controller("billing").unwrap();
        controller.assign();
        timeout(WAIT, registry.wait_for_ready().wait()).await.unwrap();

        controller.deliver(consumer_message("orders", 0, 0));
        timeout(WAIT, async {
            while log.count("commit") < 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        timeout(WAIT, registry.stop()).await.unwrap();

        assert_eq!(handler.handled(), 1);
        assert_eq!(handler.closed(), 1);
        assert_eq!(log.count("handle:orders:0:0"), 1);
        assert!(log.position("group_close").unwrap() < log.position("handler_close").unwrap());
    }
}
