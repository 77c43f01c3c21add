use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

mod group;
mod handler;
mod handler_consumer;
mod kafka_group;
mod readiness;
mod registry;
mod session;

pub use group::{
    ConsumerGroup, ConsumerGroupFactory, GroupClaim, GroupError, GroupHandler, GroupSession,
};
pub use handler::ConsumerHandler;
pub use handler_consumer::HandlerConsumer;
pub use kafka_group::{GroupContext, KafkaConsumerGroup, KafkaConsumerGroupFactory};
pub use readiness::{ReadySignal, Readiness};
pub use registry::{ConsumerRegistry, ConsumerRegistryBuilder};
pub use session::SessionHandler;

/// Lifecycle shared by a single handler consumer and the registry of all of them.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Starts consuming in the background and returns immediately.
    fn start(&self, cancel: CancellationToken);

    /// Resolves once ready. Callers that need a deadline wrap it in `tokio::time::timeout`.
    fn wait_for_ready(&self) -> ReadySignal;

    /// Stops consuming and waits for background work to finish. Call once.
    async fn stop(&self);
}
