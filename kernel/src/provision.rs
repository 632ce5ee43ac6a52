// Provisioning Guard
//
// Engines provision indexes (notably the lease uniqueness index) the
// first time a session is opened. The guard is created by application
// startup and handed to every connector, so the "already provisioned"
// flag lives with the application and not in a process-wide static.

use std::future::Future;

use tokio::sync::OnceCell;

#[derive(Debug, Default)]
pub struct ProvisionGuard {
    done: OnceCell<()>,
}

impl ProvisionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `provision` unless it already succeeded through this guard.
    ///
    /// Concurrent callers wait for the first attempt; a failed attempt
    /// leaves the guard unset so the next caller retries.
    pub async fn ensure<F, Fut, E>(&self, provision: F) -> Result<(), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        self.done.get_or_try_init(provision).await.map(|_| ())
    }

    pub fn is_provisioned(&self) -> bool {
        self.done.initialized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn provisions_once() {
        let guard = ProvisionGuard::new();
        let runs = AtomicUsize::new(0);

        for _ in 0..3 {
            guard
                .ensure(|| async {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, std::io::Error>(())
                })
                .await
                .unwrap();
        }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(guard.is_provisioned());
    }

    #[tokio::test]
    async fn failed_provisioning_is_retried() {
        let guard = ProvisionGuard::new();

        let err = guard.ensure(|| async { Err("index build failed") }).await;
        assert_eq!(err, Err("index build failed"));
        assert!(!guard.is_provisioned());

        guard.ensure(|| async { Ok::<_, &str>(()) }).await.unwrap();
        assert!(guard.is_provisioned());
    }
}
