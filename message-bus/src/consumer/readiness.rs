use std::sync::{Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;

/// Handle on one readiness epoch. Resolves once that epoch has been fired.
#[derive(Clone, Debug)]
pub struct ReadySignal(CancellationToken);

impl ReadySignal {
    pub async fn wait(&self) {
        self.0.cancelled().await
    }

    pub fn is_ready(&self) -> bool {
        self.0.is_cancelled()
    }
}

/// Re-armable one-shot readiness broadcast.
///
/// `fire` releases everyone waiting on the current epoch. `arm` starts a new unfired epoch,
/// but only once the current one has fired, so a waiter never misses a pending fire.
#[derive(Debug, Default)]
pub struct Readiness {
    current: Mutex<CancellationToken>,
}

impl Readiness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle on the current epoch.
    pub fn signal(&self) -> ReadySignal {
        ReadySignal(self.lock().clone())
    }

    pub fn fire(&self) {
        self.lock().cancel();
    }

    /// Starts a fresh epoch if the current one has already fired.
    pub fn arm(&self) {
        let mut current = self.lock();
        if current.is_cancelled() {
            *current = CancellationToken::new();
        }
    }

    pub fn is_ready(&self) -> bool {
        self.lock().is_cancelled()
    }

    fn lock(&self) -> MutexGuard<'_, CancellationToken> {
        match self.current.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_fire_releases_all_waiters() {
        let readiness = Readiness::new();
        let first = readiness.signal();
        let second = readiness.signal();
        assert!(!first.is_ready());

        readiness.fire();

        timeout(Duration::from_secs(1), first.wait()).await.unwrap();
        timeout(Duration::from_secs(1), second.wait()).await.unwrap();
        assert!(readiness.is_ready());
    }

    #[tokio::test]
    async fn test_arm_starts_fresh_epoch() {
        let readiness = Readiness::new();
        readiness.fire();
        let fired = readiness.signal();

        readiness.arm();
        let next = readiness.signal();

        assert!(fired.is_ready());
        assert!(!next.is_ready());
        assert!(!readiness.is_ready());
        assert!(timeout(Duration::from_millis(50), next.wait()).await.is_err());

        readiness.fire();
        timeout(Duration::from_secs(1), next.wait()).await.unwrap();
    }

    #[test]
    fn test_arm_before_fire_keeps_epoch() {
        let readiness = Readiness::new();
        let pending = readiness.signal();

        readiness.arm();
        readiness.fire();

        assert!(pending.is_ready());
    }

    #[tokio::test]
    async fn test_waiter_from_old_epoch_resolves_after_rearm() {
        let readiness = std::sync::Arc::new(Readiness::new());
        let early = readiness.signal();

        let waiter = tokio::spawn(async move { early.wait().await });
        readiness.fire();
        readiness.arm();

        timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }
}
