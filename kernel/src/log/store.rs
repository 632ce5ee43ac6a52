// Source Repository Contract
//
// The seam every storage engine plugs into. Engines enumerate
// committed data through the query abstraction and accept whole
// sources atomically.
//
// This module defines *interfaces only*.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use super::{DeltaRecord, Id, LeaseRecord, Source, StatePointer, TagRecord};
use crate::config::SessionOptions;
use crate::envelope::{Envelope, EnvelopeError};
use crate::provision::ProvisionGuard;
use crate::query::Query;

/// Lazy, forward-only, non-restartable sequence of query results.
pub type RecordStream<'a, T> = BoxStream<'a, Result<T, RepositoryError>>;

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("operation cancelled")]
    Cancelled,

    #[error("session is read-only")]
    ReadOnly,

    #[error("session has been disposed")]
    Closed,

    #[error("write timed out after {0} ms")]
    Timeout(u64),

    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("storage backend failure: {0}")]
    Backend(String),
}

impl RepositoryError {
    /// Infrastructure failures that a retry might get past.
    pub fn is_transient(&self) -> bool {
        matches!(self, RepositoryError::Backend(_) | RepositoryError::Timeout(_))
    }
}

/// Storage engine session over the source log.
///
/// Properties required from implementations:
/// - `commit` applies every message of a source or none of them
/// - a message targeting version N+1 is rejected unless the stored
///   version is N
/// - at most one entity holds a given lease triple at any time
///
/// `commit` returns `Ok(false)` for expected rejections (version
/// conflict, lease collision) and `Err` for everything else.
#[async_trait]
pub trait SourceRepository: Send + Sync {
    fn enumerate_source_ids<Q: Query>(
        &self,
        query: &Q,
        cancel: &CancellationToken,
    ) -> RecordStream<'_, Id>;

    fn enumerate_state_pointers<Q: Query>(
        &self,
        query: &Q,
        cancel: &CancellationToken,
    ) -> RecordStream<'_, StatePointer>;

    fn enumerate_agent_signatures<Q: Query>(
        &self,
        query: &Q,
        cancel: &CancellationToken,
    ) -> RecordStream<'_, Envelope>;

    fn enumerate_deltas<Q: Query>(
        &self,
        query: &Q,
        cancel: &CancellationToken,
    ) -> RecordStream<'_, DeltaRecord>;

    fn enumerate_leases<Q: Query>(
        &self,
        query: &Q,
        cancel: &CancellationToken,
    ) -> RecordStream<'_, LeaseRecord>;

    fn enumerate_tags<Q: Query>(
        &self,
        query: &Q,
        cancel: &CancellationToken,
    ) -> RecordStream<'_, TagRecord>;

    async fn commit(
        &self,
        source: &Source,
        cancel: &CancellationToken,
    ) -> Result<bool, RepositoryError>;

    /// Release the session. Unfinished engine transactions are aborted.
    async fn dispose(&self) -> Result<(), RepositoryError> {
        Ok(())
    }
}

/// Shared sessions, e.g. a decorator that is also inspected directly.
#[async_trait]
impl<R: SourceRepository> SourceRepository for Arc<R> {
    fn enumerate_source_ids<Q: Query>(
        &self,
        query: &Q,
        cancel: &CancellationToken,
    ) -> RecordStream<'_, Id> {
        (**self).enumerate_source_ids(query, cancel)
    }

    fn enumerate_state_pointers<Q: Query>(
        &self,
        query: &Q,
        cancel: &CancellationToken,
    ) -> RecordStream<'_, StatePointer> {
        (**self).enumerate_state_pointers(query, cancel)
    }

    fn enumerate_agent_signatures<Q: Query>(
        &self,
        query: &Q,
        cancel: &CancellationToken,
    ) -> RecordStream<'_, Envelope> {
        (**self).enumerate_agent_signatures(query, cancel)
    }

    fn enumerate_deltas<Q: Query>(
        &self,
        query: &Q,
        cancel: &CancellationToken,
    ) -> RecordStream<'_, DeltaRecord> {
        (**self).enumerate_deltas(query, cancel)
    }

    fn enumerate_leases<Q: Query>(
        &self,
        query: &Q,
        cancel: &CancellationToken,
    ) -> RecordStream<'_, LeaseRecord> {
        (**self).enumerate_leases(query, cancel)
    }

    fn enumerate_tags<Q: Query>(
        &self,
        query: &Q,
        cancel: &CancellationToken,
    ) -> RecordStream<'_, TagRecord> {
        (**self).enumerate_tags(query, cancel)
    }

    async fn commit(
        &self,
        source: &Source,
        cancel: &CancellationToken,
    ) -> Result<bool, RepositoryError> {
        (**self).commit(source, cancel).await
    }

    async fn dispose(&self) -> Result<(), RepositoryError> {
        (**self).dispose().await
    }
}

/// Engines that can remove a committed source again.
///
/// Only meant for test-mode cleanup.
#[async_trait]
pub trait PurgeSourceRepository: SourceRepository {
    async fn purge(&self, source_id: Id) -> Result<(), RepositoryError>;
}

/// Opens sessions against one storage engine.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    type Repository: SourceRepository;

    async fn connect(
        &self,
        options: &SessionOptions,
        guard: &ProvisionGuard,
    ) -> Result<Self::Repository, RepositoryError>;
}
