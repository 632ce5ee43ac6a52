// Repository Decorators
//
// Wrappers that hold an inner source repository and add one policy to
// it. They compose: `Logging<Retry<Memory>>` retries first and only
// swallows what is left over.

pub mod logging;
pub mod retry;
pub mod staging;

pub use logging::LoggingSourceRepository;
pub use retry::{RetryPolicy, RetrySourceRepository};
pub use staging::{CommitTicket, StagingSourceRepository};

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use futures::{stream, StreamExt};
    use tokio_util::sync::CancellationToken;

    use crate::adapters::memory::MemorySourceRepository;
    use crate::envelope::Envelope;
    use crate::log::{
        DeltaRecord, Id, LeaseRecord, RecordStream, RepositoryError, Source, SourceRepository,
        StatePointer, TagRecord,
    };
    use crate::query::Query;

    fn connection_reset() -> RepositoryError {
        RepositoryError::Backend("connection reset".into())
    }

    /// Memory session whose first `failures` commits and reads fail.
    pub struct Flaky {
        pub inner: MemorySourceRepository,
        pub failures: AtomicUsize,
        pub attempts: AtomicUsize,
        failure: fn() -> RepositoryError,
    }

    impl Flaky {
        pub fn new(inner: MemorySourceRepository, failures: usize) -> Self {
            Self {
                inner,
                failures: AtomicUsize::new(failures),
                attempts: AtomicUsize::new(0),
                failure: connection_reset,
            }
        }

        /// Fail with `failure` instead of a backend error.
        pub fn failing_with(mut self, failure: fn() -> RepositoryError) -> Self {
            self.failure = failure;
            self
        }

        fn trip(&self) -> bool {
            self.failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }

        fn broken<'a, T: Send + 'a>(&self, records: RecordStream<'a, T>) -> RecordStream<'a, T> {
            if self.trip() {
                records
                    .take(1)
                    .chain(stream::iter([Err((self.failure)())]))
                    .boxed()
            } else {
                records
            }
        }
    }

    #[async_trait]
    impl SourceRepository for Flaky {
        fn enumerate_source_ids<Q: Query>(
            &self,
            query: &Q,
            cancel: &CancellationToken,
        ) -> RecordStream<'_, Id> {
            self.broken(self.inner.enumerate_source_ids(query, cancel))
        }

        fn enumerate_state_pointers<Q: Query>(
            &self,
            query: &Q,
            cancel: &CancellationToken,
        ) -> RecordStream<'_, StatePointer> {
            self.broken(self.inner.enumerate_state_pointers(query, cancel))
        }

        fn enumerate_agent_signatures<Q: Query>(
            &self,
            query: &Q,
            cancel: &CancellationToken,
        ) -> RecordStream<'_, Envelope> {
            self.broken(self.inner.enumerate_agent_signatures(query, cancel))
        }

        fn enumerate_deltas<Q: Query>(
            &self,
            query: &Q,
            cancel: &CancellationToken,
        ) -> RecordStream<'_, DeltaRecord> {
            self.broken(self.inner.enumerate_deltas(query, cancel))
        }

        fn enumerate_leases<Q: Query>(
            &self,
            query: &Q,
            cancel: &CancellationToken,
        ) -> RecordStream<'_, LeaseRecord> {
            self.broken(self.inner.enumerate_leases(query, cancel))
        }

        fn enumerate_tags<Q: Query>(
            &self,
            query: &Q,
            cancel: &CancellationToken,
        ) -> RecordStream<'_, TagRecord> {
            self.broken(self.inner.enumerate_tags(query, cancel))
        }

        async fn commit(
            &self,
            source: &Source,
            cancel: &CancellationToken,
        ) -> Result<bool, RepositoryError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.trip() {
                return Err((self.failure)());
            }
            self.inner.commit(source, cancel).await
        }
    }
}
