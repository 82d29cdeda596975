//! Cooperative shutdown of the source stage

use tokio_util::sync::CancellationToken;
use tracing::info;

/// Cancellation handle owned by whoever supervises the stage
///
/// The stage checks it at the top of every poll cycle. An in-flight poll is
/// never interrupted.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle {
    token: CancellationToken,
}

impl ShutdownHandle {
    /// Create a new handle
    pub fn new() -> Self {
        Self::default()
    }

    /// Request the stage to stop
    pub fn shutdown(&self) {
        if !self.token.is_cancelled() {
            info!("Shutdown requested for source stage");
        }
        self.token.cancel();
    }

    /// Whether shutdown was requested
    pub fn is_shutdown_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once shutdown is requested
    pub async fn requested(&self) {
        self.token.cancelled().await
    }

    /// Handle that is cancelled with this one but can also be cancelled alone
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_shutdown_handle() {
        let handle = ShutdownHandle::new();
        let clone = handle.clone();
        assert!(!clone.is_shutdown_requested());

        let waiter = tokio::spawn(async move { clone.requested().await });
        handle.shutdown();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(handle.is_shutdown_requested());
    }

    #[test]
    fn test_child_follows_parent_only() {
        let parent = ShutdownHandle::new();
        let child = parent.child();
        child.shutdown();
        assert!(!parent.is_shutdown_requested());

        let other = parent.child();
        parent.shutdown();
        assert!(other.is_shutdown_requested());
    }
}
