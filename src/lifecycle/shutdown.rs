//! Shutdown coordination.

use tokio_util::sync::{CancellationToken, DropGuard};

/// Coordinator for graceful shutdown.
///
/// Clones share one signal.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trigger the shutdown signal.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once shutdown has been triggered.
    pub async fn wait(&self) {
        self.token.cancelled().await
    }

    /// Trigger shutdown when the returned guard is dropped.
    pub fn trigger_on_drop(&self) -> DropGuard {
        self.token.clone().drop_guard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clones_share_the_signal() {
        let shutdown = Shutdown::new();
        let waiter = shutdown.clone();
        shutdown.trigger();
        waiter.wait().await;
        assert!(waiter.is_triggered());
    }

    #[test]
    fn drop_guard_triggers() {
        let shutdown = Shutdown::new();
        let guard = shutdown.trigger_on_drop();
        assert!(!shutdown.is_triggered());
        drop(guard);
        assert!(shutdown.is_triggered());
    }
}
