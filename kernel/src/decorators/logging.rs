// Log-and-Swallow Decorator
//
// Trades strict failure visibility for resilience: infrastructure
// failures are logged and turned into an early end of stream (reads) or
// a rejected commit (writes). Usage errors still surface.

use async_trait::async_trait;
use futures::{future, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::envelope::Envelope;
use crate::log::{
    DeltaRecord, Id, LeaseRecord, RecordStream, RepositoryError, Source, SourceRepository,
    StatePointer, TagRecord,
};
use crate::query::Query;

/// Infrastructure failures the decorator absorbs.
fn swallowed(err: &RepositoryError) -> bool {
    err.is_transient() || matches!(err, RepositoryError::Envelope(_))
}

fn end_on_failure<'a, T: Send + 'a>(
    records: RecordStream<'a, T>,
    operation: &'static str,
) -> RecordStream<'a, T> {
    records
        .take_while(move |item| {
            let keep = match item {
                Err(err) if swallowed(err) => {
                    tracing::error!(operation, error = %err, "enumeration failed, ending early");
                    false
                }
                _ => true,
            };
            future::ready(keep)
        })
        .boxed()
}

pub struct LoggingSourceRepository<R> {
    inner: R,
}

impl<R> LoggingSourceRepository<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

#[async_trait]
impl<R: SourceRepository> SourceRepository for LoggingSourceRepository<R> {
    fn enumerate_source_ids<Q: Query>(
        &self,
        query: &Q,
        cancel: &CancellationToken,
    ) -> RecordStream<'_, Id> {
        end_on_failure(self.inner.enumerate_source_ids(query, cancel), "source_ids")
    }

    fn enumerate_state_pointers<Q: Query>(
        &self,
        query: &Q,
        cancel: &CancellationToken,
    ) -> RecordStream<'_, StatePointer> {
        end_on_failure(
            self.inner.enumerate_state_pointers(query, cancel),
            "state_pointers",
        )
    }

    fn enumerate_agent_signatures<Q: Query>(
        &self,
        query: &Q,
        cancel: &CancellationToken,
    ) -> RecordStream<'_, Envelope> {
        end_on_failure(
            self.inner.enumerate_agent_signatures(query, cancel),
            "agent_signatures",
        )
    }

    fn enumerate_deltas<Q: Query>(
        &self,
        query: &Q,
        cancel: &CancellationToken,
    ) -> RecordStream<'_, DeltaRecord> {
        end_on_failure(self.inner.enumerate_deltas(query, cancel), "deltas")
    }

    fn enumerate_leases<Q: Query>(
        &self,
        query: &Q,
        cancel: &CancellationToken,
    ) -> RecordStream<'_, LeaseRecord> {
        end_on_failure(self.inner.enumerate_leases(query, cancel), "leases")
    }

    fn enumerate_tags<Q: Query>(
        &self,
        query: &Q,
        cancel: &CancellationToken,
    ) -> RecordStream<'_, TagRecord> {
        end_on_failure(self.inner.enumerate_tags(query, cancel), "tags")
    }

    async fn commit(
        &self,
        source: &Source,
        cancel: &CancellationToken,
    ) -> Result<bool, RepositoryError> {
        match self.inner.commit(source, cancel).await {
            Err(err) if swallowed(&err) => {
                tracing::error!(
                    source_id = %source.id,
                    error = %err,
                    "commit failed, reporting rejection"
                );
                Ok(false)
            }
            outcome => outcome,
        }
    }

    async fn dispose(&self) -> Result<(), RepositoryError> {
        self.inner.dispose().await
    }
}
