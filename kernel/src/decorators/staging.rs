// Test-Mode Staging
//
// Remembers every source committed through it so a test run can remove
// its own writes afterwards. Commits are tracked in an arena and handed
// out as tickets; a released ticket keeps its slot so later tickets stay
// valid.

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::envelope::Envelope;
use crate::log::{
    DeltaRecord, Id, LeaseRecord, PurgeSourceRepository, RecordStream, RepositoryError, Source,
    SourceRepository, StatePointer, TagRecord,
};
use crate::query::Query;

/// Handle to one commit recorded by a [`StagingSourceRepository`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommitTicket(usize);

pub struct StagingSourceRepository<R> {
    inner: R,
    ledger: Mutex<Vec<Option<Id>>>,
}

impl<R: PurgeSourceRepository> StagingSourceRepository<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            ledger: Mutex::new(Vec::new()),
        }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    fn ledger(&self) -> MutexGuard<'_, Vec<Option<Id>>> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Commit and, on success, record the source for later rollback.
    pub async fn commit_tracked(
        &self,
        source: &Source,
        cancel: &CancellationToken,
    ) -> Result<Option<CommitTicket>, RepositoryError> {
        if !self.inner.commit(source, cancel).await? {
            return Ok(None);
        }
        let mut ledger = self.ledger();
        ledger.push(Some(source.id));
        Ok(Some(CommitTicket(ledger.len() - 1)))
    }

    /// Tickets of commits that would still be rolled back.
    pub fn tickets(&self) -> Vec<CommitTicket> {
        self.ledger()
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(index, _)| CommitTicket(index))
            .collect()
    }

    pub fn source_id(&self, ticket: CommitTicket) -> Option<Id> {
        self.ledger().get(ticket.0).copied().flatten()
    }

    /// Keep the ticket's source on rollback. Returns its id if it was
    /// still tracked.
    pub fn release(&self, ticket: CommitTicket) -> Option<Id> {
        self.ledger().get_mut(ticket.0).and_then(Option::take)
    }

    /// Purge every tracked source, newest first. Returns how many were
    /// removed.
    pub async fn rollback(&self, cancel: &CancellationToken) -> Result<usize, RepositoryError> {
        let mut purged = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(RepositoryError::Cancelled);
            }
            let next = {
                let ledger = self.ledger();
                ledger
                    .iter()
                    .enumerate()
                    .rev()
                    .find_map(|(index, slot)| slot.map(|id| (index, id)))
            };
            let Some((index, source_id)) = next else {
                break;
            };

            self.inner.purge(source_id).await?;
            self.ledger()[index] = None;
            purged += 1;
        }

        tracing::info!(purged, "staged commits rolled back");
        Ok(purged)
    }
}

#[async_trait]
impl<R: PurgeSourceRepository> SourceRepository for StagingSourceRepository<R> {
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
        Ok(self.commit_tracked(source, cancel).await?.is_some())
    }

    async fn dispose(&self) -> Result<(), RepositoryError> {
        let pending = self.tickets().len();
        if pending > 0 {
            tracing::warn!(pending, "disposing staging repository without rollback");
        }
        self.inner.dispose().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{MemoryEngine, MemorySourceRepository};
    use crate::config::SessionOptions;
    use crate::envelope::DataType;
    use crate::invariants::InvariantEngine;
    use crate::log::{Lease, Message, Version};
    use crate::replay::replay_sources;
    use crate::state::StateView;
    use serde_json::json;

    fn source(id: Id, version: u64, lease: &Lease) -> Source {
        Source::new(
            Envelope::from_parts(DataType::rust("test.agent"), json!({})),
            vec![Message::builder(
                StatePointer::new(id, Version(version)),
                Envelope::from_parts(DataType::rust("test.delta"), json!({})),
            )
            .add_lease(lease.clone())
            .build()],
        )
    }

    fn staging(engine: &MemoryEngine) -> StagingSourceRepository<MemorySourceRepository> {
        StagingSourceRepository::new(engine.session(SessionOptions::default()))
    }

    #[tokio::test]
    async fn rejected_commits_are_not_tracked() {
        let engine = MemoryEngine::new();
        let repo = staging(&engine);
        let cancel = CancellationToken::new();
        let lease = Lease::new("test", "slot", "a");

        let ticket = repo
            .commit_tracked(&source(Id::new(), 1, &lease), &cancel)
            .await
            .unwrap();
        assert!(ticket.is_some());
        // Same lease on a different entity collides.
        assert!(!repo
            .commit(&source(Id::new(), 1, &lease), &cancel)
            .await
            .unwrap());
        assert_eq!(repo.tickets().len(), 1);
    }

    #[tokio::test]
    async fn rollback_purges_newest_first() {
        let engine = MemoryEngine::new();
        let repo = staging(&engine);
        let cancel = CancellationToken::new();
        let id = Id::new();
        let lease = Lease::new("test", "slot", "b");

        let first = source(id, 1, &lease);
        let second = source(id, 2, &lease);
        repo.commit(&first, &cancel).await.unwrap();
        repo.commit(&second, &cancel).await.unwrap();

        assert_eq!(repo.rollback(&cancel).await.unwrap(), 2);
        assert!(engine.sources().await.is_empty());
        assert!(repo.tickets().is_empty());
    }

    #[tokio::test]
    async fn released_tickets_survive_rollback() {
        let engine = MemoryEngine::new();
        let repo = staging(&engine);
        let cancel = CancellationToken::new();
        let kept = Id::new();
        let lease = Lease::new("test", "slot", "c");

        let ticket = repo
            .commit_tracked(&source(kept, 1, &lease), &cancel)
            .await
            .unwrap()
            .unwrap();
        repo.commit(&source(Id::new(), 1, &Lease::new("test", "slot", "d")), &cancel)
            .await
            .unwrap();

        let kept_source = repo.source_id(ticket);
        assert_eq!(repo.release(ticket), kept_source);
        assert_eq!(repo.release(ticket), None);
        assert_eq!(repo.rollback(&cancel).await.unwrap(), 1);

        let sources = engine.sources().await;
        assert_eq!(sources.len(), 1);
        assert_eq!(Some(sources[0].id), kept_source);

        let state = replay_sources(sources, &InvariantEngine::standard()).unwrap();
        assert_eq!(state.lease_holder(&lease), Some(kept));
    }
}
