// Retry Decorator
//
// Retries commits that failed for a transient reason, with exponential
// backoff. Rejections (`Ok(false)`) are final and never retried.

use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::envelope::Envelope;
use crate::log::{
    DeltaRecord, Id, LeaseRecord, RecordStream, RepositoryError, Source, SourceRepository,
    StatePointer, TagRecord,
};
use crate::query::Query;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.initial_backoff)
            .with_max_delay(self.max_backoff)
            .with_max_times(self.max_attempts.saturating_sub(1) as usize)
    }
}

pub struct RetrySourceRepository<R> {
    inner: R,
    policy: RetryPolicy,
}

impl<R> RetrySourceRepository<R> {
    pub fn new(inner: R, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl<R: SourceRepository> SourceRepository for RetrySourceRepository<R> {
    fn enumerate_source_ids<Q: Query>(
        &self,
        query: &Q,
        cancel: &CancellationToken,
    ) -> RecordStream<'_, Id> {
        self.inner.enumerate_source_ids(query, cancel)
    }

    fn enumerate_state_pointers<Q: Query>(
        &self,
        query: &Q,
        cancel: &CancellationToken,
    ) -> RecordStream<'_, StatePointer> {
        self.inner.enumerate_state_pointers(query, cancel)
    }

    fn enumerate_agent_signatures<Q: Query>(
        &self,
        query: &Q,
        cancel: &CancellationToken,
    ) -> RecordStream<'_, Envelope> {
        self.inner.enumerate_agent_signatures(query, cancel)
    }

    fn enumerate_deltas<Q: Query>(
        &self,
        query: &Q,
        cancel: &CancellationToken,
    ) -> RecordStream<'_, DeltaRecord> {
        self.inner.enumerate_deltas(query, cancel)
    }

    fn enumerate_leases<Q: Query>(
        &self,
        query: &Q,
        cancel: &CancellationToken,
    ) -> RecordStream<'_, LeaseRecord> {
        self.inner.enumerate_leases(query, cancel)
    }

    fn enumerate_tags<Q: Query>(
        &self,
        query: &Q,
        cancel: &CancellationToken,
    ) -> RecordStream<'_, TagRecord> {
        self.inner.enumerate_tags(query, cancel)
    }

    async fn commit(
        &self,
        source: &Source,
        cancel: &CancellationToken,
    ) -> Result<bool, RepositoryError> {
        if cancel.is_cancelled() {
            return Err(RepositoryError::Cancelled);
        }

        let attempts = (|| self.inner.commit(source, cancel))
            .retry(self.policy.backoff())
            .sleep(tokio::time::sleep)
            .when(|err: &RepositoryError| err.is_transient())
            .notify(|err: &RepositoryError, delay: Duration| {
                tracing::debug!(
                    source_id = %source.id,
                    backoff_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying commit after backoff"
                );
            });

        tokio::select! {
            _ = cancel.cancelled() => Err(RepositoryError::Cancelled),
            outcome = attempts => outcome,
        }
    }

    async fn dispose(&self) -> Result<(), RepositoryError> {
        self.inner.dispose().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::MemoryEngine;
    use crate::config::SessionOptions;
    use crate::decorators::testing::Flaky;
    use crate::envelope::DataType;
    use crate::log::{Message, Version};
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn source(id: Id, version: u64) -> Source {
        Source::new(
            Envelope::from_parts(DataType::rust("test.agent"), json!({})),
            vec![Message::builder(
                StatePointer::new(id, Version(version)),
                Envelope::from_parts(DataType::rust("test.delta"), json!({})),
            )
            .build()],
        )
    }

    fn quick(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        }
    }

    fn flaky(engine: &MemoryEngine, failures: usize) -> Flaky {
        Flaky::new(engine.session(SessionOptions::default()), failures)
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let engine = MemoryEngine::new();
        let repo = RetrySourceRepository::new(flaky(&engine, 2), quick(3));

        assert!(repo
            .commit(&source(Id::new(), 1), &CancellationToken::new())
            .await
            .unwrap());
        assert_eq!(repo.inner().attempts.load(Ordering::SeqCst), 3);
        assert_eq!(engine.sources().await.len(), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let engine = MemoryEngine::new();
        let repo = RetrySourceRepository::new(flaky(&engine, 5), quick(2));

        let err = repo
            .commit(&source(Id::new(), 1), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, RepositoryError::Backend(_)));
        assert_eq!(repo.inner().attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rejections_are_not_retried() {
        let engine = MemoryEngine::new();
        let repo = RetrySourceRepository::new(flaky(&engine, 0), quick(3));

        // Version 2 of an entity that never had version 1.
        assert!(!repo
            .commit(&source(Id::new(), 2), &CancellationToken::new())
            .await
            .unwrap());
        assert_eq!(repo.inner().attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let engine = MemoryEngine::new();
        let slow = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(60),
        };
        let repo = RetrySourceRepository::new(flaky(&engine, 10), slow);
        let cancel = CancellationToken::new();
        tokio::spawn({
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                cancel.cancel();
            }
        });

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            repo.commit(&source(Id::new(), 1), &cancel),
        )
        .await
        .unwrap();

        assert!(matches!(outcome, Err(RepositoryError::Cancelled)));
        assert_eq!(repo.inner().attempts.load(Ordering::SeqCst), 1);
        assert!(engine.sources().await.is_empty());
    }

    #[tokio::test]
    async fn cancelled_commit_is_not_attempted() {
        let engine = MemoryEngine::new();
        let repo = RetrySourceRepository::new(flaky(&engine, 0), RetryPolicy::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = repo.commit(&source(Id::new(), 1), &cancel).await.unwrap_err();

        assert!(matches!(err, RepositoryError::Cancelled));
        assert_eq!(repo.inner().attempts.load(Ordering::SeqCst), 0);
    }
}
