use std::sync::Arc;

use async_trait::async_trait;
use envconfig::Envconfig;
use message_bus::admin::KafkaAdmin;
use message_bus::config::Config;
use message_bus::consumer::{
    Consumer, ConsumerHandler, ConsumerRegistry, KafkaConsumerGroupFactory,
};
use message_bus::message::ConsumerMessage;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Logs every record it receives. Enable it with a `log` handler mapping.
struct LogHandler;

#[async_trait]
impl ConsumerHandler for LogHandler {
    async fn handle(&self, message: &ConsumerMessage) -> anyhow::Result<()> {
        info!(
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            "{}",
            message.value_str().unwrap_or_default()
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "message_bus=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::init_from_env()?;
    let props = config.to_properties()?;
    info!(
        "message bus starting with bootstrap servers {}",
        props.connection.bootstrap_servers_list()
    );

    KafkaAdmin::new(&props.admin)?
        .create_configured_topics()
        .await?;

    let factory = KafkaConsumerGroupFactory::new(&props.consumer);
    let registry = ConsumerRegistry::builder()
        .handler("log", Arc::new(LogHandler))
        .build(&props.consumer, &factory)?;

    let cancel = CancellationToken::new();
    registry.start(cancel.clone());
    match timeout(config.ready_timeout(), registry.wait_for_ready().wait()).await {
        Ok(()) => info!("{} consumers are ready", registry.len()),
        Err(_) => warn!(
            "consumers are not ready after {:?}, continuing",
            config.ready_timeout()
        ),
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    cancel.cancel();
    registry.stop().await;
    info!("message bus stopped");
    Ok(())
}
