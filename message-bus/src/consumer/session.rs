use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::group::{GroupClaim, GroupError, GroupHandler, GroupSession};
use super::handler::ConsumerHandler;
use super::readiness::Readiness;
use crate::metrics_consts::{
    CONSUMER_HANDLER_ERRORS, CONSUMER_MESSAGES_HANDLED, CONSUMER_READY, CONSUMER_SESSIONS,
};

/// Drives a [`ConsumerHandler`] through group sessions.
///
/// Setup fires the consumer's readiness and cleanup re-arms it. In between, records are
/// handled one at a time and marked; with auto-commit off each mark is committed before the
/// next record is pulled.
pub struct SessionHandler {
    name: String,
    handler: Arc<dyn ConsumerHandler>,
    auto_commit: bool,
    readiness: Arc<Readiness>,
}

impl SessionHandler {
    pub fn new(
        name: impl Into<String>,
        handler: Arc<dyn ConsumerHandler>,
        auto_commit: bool,
        readiness: Arc<Readiness>,
    ) -> Self {
        Self {
            name: name.into(),
            handler,
            auto_commit,
            readiness,
        }
    }
}

#[async_trait]
impl GroupHandler for SessionHandler {
    async fn setup(&self, _session: &dyn GroupSession) -> Result<(), GroupError> {
        debug!(handler = %self.name, "consumer group session is set up");
        metrics::counter!(CONSUMER_SESSIONS, "handler" => self.name.clone()).increment(1);
        metrics::gauge!(CONSUMER_READY, "handler" => self.name.clone()).set(1.0);
        self.readiness.fire();
        Ok(())
    }

    async fn cleanup(&self, session: &dyn GroupSession) -> Result<(), GroupError> {
        if session.cancellation().is_cancelled() {
            debug!(handler = %self.name, "consumer group session is cleaned up");
        }
        metrics::gauge!(CONSUMER_READY, "handler" => self.name.clone()).set(0.0);
        self.readiness.arm();
        Ok(())
    }

    async fn consume_claim(
        &self,
        session: &dyn GroupSession,
        claim: &mut dyn GroupClaim,
    ) -> Result<(), GroupError> {
        loop {
            let message = tokio::select! {
                biased;
                _ = session.cancellation().cancelled() => {
                    info!(handler = %self.name, "session is done, stops taking new messages");
                    return Ok(());
                }
                next = claim.next() => match next {
                    Some(message) => message,
                    None => return Ok(()),
                },
            };

            if let Err(source) = self.handler.handle(&message).await {
                metrics::counter!(CONSUMER_HANDLER_ERRORS, "handler" => self.name.clone())
                    .increment(1);
                return Err(GroupError::Handler {
                    handler: self.name.clone(),
                    source,
                });
            }
            metrics::counter!(CONSUMER_MESSAGES_HANDLED, "handler" => self.name.clone())
                .increment(1);

            session.mark_message(&message)?;
            if !self.auto_commit {
                session.commit()?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        consumer_message, CallLog, ChannelClaim, RecordingHandler, RecordingSession,
    };
    use std::time::Duration;
    use tokio::time::timeout;

    fn session_handler(
        handler: Arc<RecordingHandler>,
        auto_commit: bool,
    ) -> (SessionHandler, Arc<Readiness>) {
        let readiness = Arc::new(Readiness::new());
        (
            SessionHandler::new("orders", handler, auto_commit, readiness.clone()),
            readiness,
        )
    }

    #[tokio::test]
    async fn test_manual_commit_precedes_next_record() {
        let log = CallLog::default();
        let handler = Arc::new(RecordingHandler::new(log.clone()));
        let (session_handler, _) = session_handler(handler, false);
        let session = RecordingSession::new(log.clone());
        let (mut claim, tx) = ChannelClaim::new();

        tx.send(consumer_message("orders", 0, 10)).unwrap();
        tx.send(consumer_message("orders", 0, 11)).unwrap();
        drop(tx);

        session_handler
            .consume_claim(&session, &mut claim)
            .await
            .unwrap();

        assert_eq!(
            log.calls(),
            vec![
                "handle:orders:0:10",
                "mark:orders:0:10",
                "commit",
                "handle:orders:0:11",
                "mark:orders:0:11",
                "commit",
            ]
        );
    }

    #[tokio::test]
    async fn test_auto_commit_only_marks() {
        let log = CallLog::default();
        let handler = Arc::new(RecordingHandler::new(log.clone()));
        let (session_handler, _) = session_handler(handler, true);
        let session = RecordingSession::new(log.clone());
        let (mut claim, tx) = ChannelClaim::new();

        tx.send(consumer_message("orders", 1, 5)).unwrap();
        drop(tx);

        session_handler
            .consume_claim(&session, &mut claim)
            .await
            .unwrap();

        assert_eq!(
            log.calls(),
            vec!["handle:orders:1:5", "mark:orders:1:5"]
        );
    }

    #[tokio::test]
    async fn test_handler_error_ends_claim_without_mark() {
        let log = CallLog::default();
        let handler = Arc::new(RecordingHandler::new(log.clone()).failing_at(7));
        let (session_handler, _) = session_handler(handler, false);
        let session = RecordingSession::new(log.clone());
        let (mut claim, tx) = ChannelClaim::new();

        tx.send(consumer_message("orders", 0, 6)).unwrap();
        tx.send(consumer_message("orders", 0, 7)).unwrap();
        tx.send(consumer_message("orders", 0, 8)).unwrap();

        let err = session_handler
            .consume_claim(&session, &mut claim)
            .await
            .unwrap_err();

        assert!(matches!(err, GroupError::Handler { ref handler, .. } if handler == "orders"));
        assert_eq!(
            log.calls(),
            vec![
                "handle:orders:0:6",
                "mark:orders:0:6",
                "commit",
                "handle:orders:0:7",
            ]
        );
    }

    #[tokio::test]
    async fn test_cancellation_stops_pulling() {
        let log = CallLog::default();
        let handler = Arc::new(RecordingHandler::new(log.clone()));
        let (session_handler, _) = session_handler(handler, true);
        let session = RecordingSession::new(log.clone());
        let (mut claim, tx) = ChannelClaim::new();

        session.cancellation().cancel();
        tx.send(consumer_message("orders", 0, 1)).unwrap();

        timeout(
            Duration::from_secs(1),
            session_handler.consume_claim(&session, &mut claim),
        )
        .await
        .unwrap()
        .unwrap();

        assert!(log.calls().is_empty());
    }

    #[tokio::test]
    async fn test_setup_fires_and_cleanup_rearms_readiness() {
        let log = CallLog::default();
        let handler = Arc::new(RecordingHandler::new(log.clone()));
        let (session_handler, readiness) = session_handler(handler, true);
        let session = RecordingSession::new(log);
        let first_epoch = readiness.signal();

        session_handler.setup(&session).await.unwrap();
        assert!(first_epoch.is_ready());
        assert!(readiness.is_ready());

        session.cancellation().cancel();
        session_handler.cleanup(&session).await.unwrap();
        assert!(!readiness.is_ready());
        assert!(!readiness.signal().is_ready());
        assert!(first_epoch.is_ready());
    }
}
