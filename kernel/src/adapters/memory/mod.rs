// In-Memory Storage Engine
//
// Reference implementation of the source repository contract. All
// sessions opened from one engine share a single log; each session
// carries its own options. Commits are serialized by the engine lock,
// which is where version and lease checks become atomic with the write.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::{future, stream, StreamExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::SessionOptions;
use crate::envelope::Envelope;
use crate::invariants::InvariantEngine;
use crate::log::{
    DeltaRecord, Id, LeaseRecord, PurgeSourceRepository, RecordStream, RepositoryError, Source,
    SourceConnector, SourceRepository, StatePointer, TagRecord,
};
use crate::provision::ProvisionGuard;
use crate::query::memory::{Plan, Row};
use crate::query::Query;
use crate::replay::{replay_sources, ReplayError};
use crate::state::LogState;

struct Shared {
    state: Mutex<LogState>,
    invariants: InvariantEngine,
    provisions: AtomicUsize,
}

/// Handle to one in-memory log. Clones share the same log.
#[derive(Clone)]
pub struct MemoryEngine {
    shared: Arc<Shared>,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    /// Empty log guarded by the standard commit invariants.
    pub fn new() -> Self {
        Self::with_state(LogState::new(), InvariantEngine::standard())
    }

    fn with_state(state: LogState, invariants: InvariantEngine) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                invariants,
                provisions: AtomicUsize::new(0),
            }),
        }
    }

    /// Bootstrap from previously committed sources.
    pub fn from_sources(sources: Vec<Source>) -> Result<Self, ReplayError> {
        let invariants = InvariantEngine::standard();
        let state = replay_sources(sources, &invariants)?;
        Ok(Self::with_state(state, invariants))
    }

    /// Every committed source, in commit order.
    pub async fn sources(&self) -> Vec<Source> {
        self.shared.state.lock().await.sources().to_vec()
    }

    /// Open a session without going through provisioning.
    pub fn session(&self, options: SessionOptions) -> MemorySourceRepository {
        MemorySourceRepository {
            shared: Arc::clone(&self.shared),
            options,
            closed: AtomicBool::new(false),
        }
    }

    /// How many times index provisioning has run against this engine.
    pub fn provision_count(&self) -> usize {
        self.shared.provisions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceConnector for MemoryEngine {
    type Repository = MemorySourceRepository;

    async fn connect(
        &self,
        options: &SessionOptions,
        guard: &ProvisionGuard,
    ) -> Result<MemorySourceRepository, RepositoryError> {
        guard
            .ensure(|| async {
                self.shared.provisions.fetch_add(1, Ordering::SeqCst);
                tracing::debug!("provisioned in-memory lease index");
                Ok::<_, RepositoryError>(())
            })
            .await?;
        Ok(self.session(options.clone()))
    }
}

/// One session against a [`MemoryEngine`].
pub struct MemorySourceRepository {
    shared: Arc<Shared>,
    options: SessionOptions,
    closed: AtomicBool,
}

fn source_row(source: &Source) -> Row<'_> {
    let mut data_types = vec![&source.agent.data_type];
    data_types.extend(source.messages.iter().map(|m| &m.delta.data_type));
    Row {
        source_ids: vec![source.id],
        timestamp: Some(source.timestamp),
        data_types,
        states: source.messages.iter().map(|m| m.state).collect(),
        leases: source.messages.iter().flat_map(|m| &m.add_leases).collect(),
        tags: source.messages.iter().flat_map(|m| &m.add_tags).collect(),
    }
}

fn source_rows(state: &LogState) -> impl Iterator<Item = (Row<'_>, &Source)> {
    state.sources().iter().map(|source| (source_row(source), source))
}

fn pointer_rows(state: &LogState) -> impl Iterator<Item = (Row<'_>, StatePointer)> {
    state.entities().map(|(id, entity)| {
        let pointer = StatePointer::new(id, entity.version);
        let row = Row {
            source_ids: vec![entity.last_source],
            timestamp: Some(entity.updated_at),
            data_types: Vec::new(),
            states: vec![pointer],
            leases: entity.leases.iter().collect(),
            tags: entity.tags.iter().collect(),
        };
        (row, pointer)
    })
}

fn delta_rows(state: &LogState) -> impl Iterator<Item = (Row<'_>, DeltaRecord)> {
    state.sources().iter().flat_map(|source| {
        source.messages.iter().map(move |message| {
            let row = Row {
                source_ids: vec![source.id],
                timestamp: Some(source.timestamp),
                data_types: vec![&message.delta.data_type],
                states: vec![message.state],
                leases: message.add_leases.iter().collect(),
                tags: message.add_tags.iter().collect(),
            };
            let record = DeltaRecord {
                source_id: source.id,
                state: message.state,
                delta: message.delta.clone(),
            };
            (row, record)
        })
    })
}

fn lease_rows(state: &LogState) -> impl Iterator<Item = (Row<'_>, LeaseRecord)> {
    state.leases().filter_map(move |(lease, holder)| {
        let entity = state.entity(holder)?;
        let pointer = StatePointer::new(holder, entity.version);
        let row = Row {
            source_ids: vec![entity.last_source],
            timestamp: Some(entity.updated_at),
            data_types: Vec::new(),
            states: vec![pointer],
            leases: vec![lease],
            tags: Vec::new(),
        };
        let record = LeaseRecord {
            lease: lease.clone(),
            state: pointer,
        };
        Some((row, record))
    })
}

fn tag_rows(state: &LogState) -> impl Iterator<Item = (Row<'_>, TagRecord)> {
    state.entities().flat_map(|(id, entity)| {
        let pointer = StatePointer::new(id, entity.version);
        entity.tags.iter().map(move |tag| {
            let row = Row {
                source_ids: vec![entity.last_source],
                timestamp: Some(entity.updated_at),
                data_types: Vec::new(),
                states: vec![pointer],
                leases: Vec::new(),
                tags: vec![tag],
            };
            let record = TagRecord {
                tag: tag.clone(),
                state: pointer,
            };
            (row, record)
        })
    })
}

impl MemorySourceRepository {
    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    fn ensure_open(&self) -> Result<(), RepositoryError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(RepositoryError::Closed)
        } else {
            Ok(())
        }
    }

    fn ensure_writable(&self) -> Result<(), RepositoryError> {
        self.ensure_open()?;
        if self.options.read_only {
            return Err(RepositoryError::ReadOnly);
        }
        Ok(())
    }

    /// Lock the log for writing, honoring cancellation and the write timeout.
    async fn lock_for_write(
        &self,
        cancel: &CancellationToken,
    ) -> Result<tokio::sync::MutexGuard<'_, LogState>, RepositoryError> {
        let lock = self.shared.state.lock();
        let timed = async {
            match self.options.write_timeout() {
                Some(limit) => tokio::time::timeout(limit, lock).await.map_err(|_| {
                    RepositoryError::Timeout(self.options.write_timeout_ms.unwrap_or_default())
                }),
                None => Ok(lock.await),
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => Err(RepositoryError::Cancelled),
            guard = timed => guard,
        }
    }

    /// Run a query against a snapshot taken when the stream is first polled.
    fn enumerate<Q, T, F>(
        &self,
        query: &Q,
        cancel: &CancellationToken,
        rows: F,
    ) -> RecordStream<'static, T>
    where
        Q: Query,
        T: Send + 'static,
        F: FnOnce(&LogState, &Plan) -> Vec<T> + Send + 'static,
    {
        let plan = Plan::of(query);
        let shared = Arc::clone(&self.shared);
        let open = self.ensure_open();
        let cancel = cancel.clone();

        tracing::trace!(filter = %plan.filter, "enumerating in-memory log");

        stream::once(async move {
            open?;
            let state = shared.state.lock().await;
            Ok::<_, RepositoryError>(rows(&state, &plan))
        })
        .flat_map(|snapshot: Result<Vec<T>, RepositoryError>| match snapshot {
            Ok(items) => stream::iter(items.into_iter().map(Ok)).boxed(),
            Err(err) => stream::iter([Err(err)]).boxed(),
        })
        .map(move |item| {
            if cancel.is_cancelled() {
                Err(RepositoryError::Cancelled)
            } else {
                item
            }
        })
        .scan(false, |failed, item| {
            if *failed {
                return future::ready(None);
            }
            *failed = item.is_err();
            future::ready(Some(item))
        })
        .boxed()
    }
}

#[async_trait]
impl SourceRepository for MemorySourceRepository {
    fn enumerate_source_ids<Q: Query>(
        &self,
        query: &Q,
        cancel: &CancellationToken,
    ) -> RecordStream<'_, Id> {
        self.enumerate(query, cancel, |state, plan| {
            plan.select(source_rows(state).map(|(row, source)| (row, source.id)))
        })
    }

    fn enumerate_state_pointers<Q: Query>(
        &self,
        query: &Q,
        cancel: &CancellationToken,
    ) -> RecordStream<'_, StatePointer> {
        self.enumerate(query, cancel, |state, plan| plan.select(pointer_rows(state)))
    }

    fn enumerate_agent_signatures<Q: Query>(
        &self,
        query: &Q,
        cancel: &CancellationToken,
    ) -> RecordStream<'_, Envelope> {
        self.enumerate(query, cancel, |state, plan| {
            plan.select(source_rows(state).map(|(row, source)| (row, source.agent.clone())))
        })
    }

    fn enumerate_deltas<Q: Query>(
        &self,
        query: &Q,
        cancel: &CancellationToken,
    ) -> RecordStream<'_, DeltaRecord> {
        self.enumerate(query, cancel, |state, plan| plan.select(delta_rows(state)))
    }

    fn enumerate_leases<Q: Query>(
        &self,
        query: &Q,
        cancel: &CancellationToken,
    ) -> RecordStream<'_, LeaseRecord> {
        self.enumerate(query, cancel, |state, plan| plan.select(lease_rows(state)))
    }

    fn enumerate_tags<Q: Query>(
        &self,
        query: &Q,
        cancel: &CancellationToken,
    ) -> RecordStream<'_, TagRecord> {
        self.enumerate(query, cancel, |state, plan| plan.select(tag_rows(state)))
    }

    async fn commit(
        &self,
        source: &Source,
        cancel: &CancellationToken,
    ) -> Result<bool, RepositoryError> {
        self.ensure_writable()?;
        let mut state = self.lock_for_write(cancel).await?;

        match state.apply_source(source.clone(), &self.shared.invariants) {
            Ok(()) => {
                tracing::debug!(
                    source_id = %source.id,
                    messages = source.messages.len(),
                    "source committed"
                );
                Ok(true)
            }
            Err(violation) => {
                tracing::debug!(source_id = %source.id, %violation, "source rejected");
                Ok(false)
            }
        }
    }

    async fn dispose(&self) -> Result<(), RepositoryError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl PurgeSourceRepository for MemorySourceRepository {
    async fn purge(&self, source_id: Id) -> Result<(), RepositoryError> {
        self.ensure_writable()?;
        let mut state = self.shared.state.lock().await;

        if !state.sources().iter().any(|s| s.id == source_id) {
            return Ok(());
        }
        let remaining: Vec<Source> = state
            .sources()
            .iter()
            .filter(|s| s.id != source_id)
            .cloned()
            .collect();

        *state = replay_sources(remaining, &self.shared.invariants)
            .map_err(|err| RepositoryError::Backend(err.to_string()))?;
        tracing::debug!(%source_id, "source purged");
        Ok(())
    }
}
