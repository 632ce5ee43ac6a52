// Stream Repositories
//
// Streams are ordered, idempotent event sequences layered on the source
// log. A stream has no record of its own: it is discovered through the
// lease its key derives, which every message of the stream carries.
//
// Duplicate suppression checks for an existing message-key lease before
// staging. That check and the eventual write are not atomic; concurrent
// writers racing on one message key are separated by the engine's lease
// uniqueness, which makes the losing commit return `false`.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::agent::AgentSignatureProvider;
use crate::config::ConfigError;
use crate::envelope::{Delta, Envelope, EnvelopeError};
use crate::log::{
    Id, Lease, Message, RepositoryError, Source, SourceRepository, StatePointer, Tag, Version,
    VersionError,
};
use crate::query::LeaseLookup;

pub mod factory;
pub mod single;

pub use factory::StreamRepositoryFactory;
pub use single::SingleStreamRepository;

/// Lease scope identifying a stream by its key.
pub const STREAM_SCOPE: &str = "stream";
pub const STREAM_LABEL: &str = "key";
/// Lease scope of per-stream message keys; the label is the stream key.
pub const MESSAGE_SCOPE: &str = "stream-message";

pub fn stream_lease(stream_key: &str) -> Lease {
    Lease::new(STREAM_SCOPE, STREAM_LABEL, stream_key)
}

pub fn message_lease(stream_key: &str, message_key: &str) -> Lease {
    Lease::new(MESSAGE_SCOPE, stream_key, message_key)
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("stream `{0}` is already loaded")]
    AlreadyLoaded(String),

    #[error("stream `{0}` has not been loaded")]
    NotLoaded(String),

    #[error("unknown stream key `{0}`")]
    UnknownStreamKey(String),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("version error: {0}")]
    Version(#[from] VersionError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// Arena index of a stream inside one [`MultipleStreamRepository`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(usize);

/// A stream known to one repository instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stream {
    key: String,
    id: Id,
    is_new: bool,
    version: Version,
}

impl Stream {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn id(&self) -> Id {
        self.id
    }

    /// No message of this stream existed when it was resolved.
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    /// Version of the latest committed or staged message.
    pub fn version(&self) -> Version {
        self.version
    }

    pub fn pointer(&self) -> StatePointer {
        StatePointer::new(self.id, self.version)
    }
}

/// Extra leases and tags attached to a staged stream message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageExtras {
    pub add_leases: Vec<Lease>,
    pub remove_leases: Vec<Lease>,
    pub add_tags: Vec<Tag>,
    pub remove_tags: Vec<Tag>,
}

impl MessageExtras {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_lease(mut self, lease: Lease) -> Self {
        self.add_leases.push(lease);
        self
    }

    pub fn remove_lease(mut self, lease: Lease) -> Self {
        self.remove_leases.push(lease);
        self
    }

    pub fn add_tag(mut self, tag: Tag) -> Self {
        self.add_tags.push(tag);
        self
    }

    pub fn remove_tag(mut self, tag: Tag) -> Self {
        self.remove_tags.push(tag);
        self
    }
}

/// One unit of work over any number of streams.
///
/// Not meant for concurrent use: staging state is plain mutable data
/// and every mutating call takes `&mut self`.
pub struct MultipleStreamRepository<R> {
    repository: R,
    agent: Arc<dyn AgentSignatureProvider>,
    streams: Vec<Stream>,
    handles: HashMap<String, StreamHandle>,
    staged: Vec<Message>,
}

impl<R: SourceRepository> MultipleStreamRepository<R> {
    pub fn new(repository: R, agent: Arc<dyn AgentSignatureProvider>) -> Self {
        Self {
            repository,
            agent,
            streams: Vec::new(),
            handles: HashMap::new(),
            staged: Vec::new(),
        }
    }

    /// The underlying source repository, for ad hoc reads.
    pub fn repository(&self) -> &R {
        &self.repository
    }

    pub fn handle(&self, key: &str) -> Option<StreamHandle> {
        self.handles.get(key).copied()
    }

    /// `None` for handles issued by another repository instance.
    pub fn get(&self, handle: StreamHandle) -> Option<&Stream> {
        self.streams.get(handle.0)
    }

    pub fn stream(&self, key: &str) -> Option<&Stream> {
        self.handle(key).and_then(|handle| self.get(handle))
    }

    /// Handles held by the facade always come from this instance.
    pub(crate) fn stream_at(&self, handle: StreamHandle) -> &Stream {
        &self.streams[handle.0]
    }

    /// Messages waiting for the next commit, in staging order.
    pub fn staged(&self) -> &[Message] {
        &self.staged
    }

    /// Resolve `key`, creating the stream if no message carries its lease.
    pub async fn load_or_create(
        &mut self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<StreamHandle, StreamError> {
        self.ensure_unknown(key)?;
        let stream = match self.find_pointer(&stream_lease(key), cancel).await? {
            Some(pointer) => Stream {
                key: key.to_owned(),
                id: pointer.id,
                is_new: false,
                version: pointer.version,
            },
            None => Self::fresh(key),
        };
        Ok(self.track(stream))
    }

    /// Resolve `key`, failing if the stream does not exist yet.
    pub async fn load(
        &mut self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<StreamHandle, StreamError> {
        self.ensure_unknown(key)?;
        let pointer = self
            .find_pointer(&stream_lease(key), cancel)
            .await?
            .ok_or_else(|| StreamError::UnknownStreamKey(key.to_owned()))?;
        Ok(self.track(Stream {
            key: key.to_owned(),
            id: pointer.id,
            is_new: false,
            version: pointer.version,
        }))
    }

    /// Start a new stream for `key` without looking for an existing one.
    pub fn create(&mut self, key: &str) -> Result<StreamHandle, StreamError> {
        self.ensure_unknown(key)?;
        Ok(self.track(Self::fresh(key)))
    }

    /// Stage `delta` as the next message of stream `key`.
    pub fn append<D: Delta + ?Sized>(
        &mut self,
        key: &str,
        delta: &D,
    ) -> Result<StatePointer, StreamError> {
        let handle = self.known(key)?;
        let envelope = Envelope::seal(delta)?;
        self.stage(handle, envelope, None, MessageExtras::default())
    }

    /// Stage `delta` unless its message key was already appended.
    ///
    /// Returns `false` without staging anything when a committed or
    /// staged message of this stream carries the same message key.
    pub async fn append_keyed<D: Delta + ?Sized>(
        &mut self,
        key: &str,
        delta: &D,
        cancel: &CancellationToken,
    ) -> Result<bool, StreamError> {
        self.append_with(key, delta, MessageExtras::default(), cancel)
            .await
    }

    /// Keyed append that also attaches caller supplied leases and tags.
    pub async fn append_with<D: Delta + ?Sized>(
        &mut self,
        key: &str,
        delta: &D,
        extras: MessageExtras,
        cancel: &CancellationToken,
    ) -> Result<bool, StreamError> {
        let handle = self.known(key)?;
        let envelope = Envelope::seal(delta)?;

        let dedup = match delta.message_key() {
            Some(message_key) => {
                let lease = message_lease(key, &message_key);
                if self.is_staged(&lease) || self.find_pointer(&lease, cancel).await?.is_some() {
                    tracing::debug!(stream = %key, %message_key, "duplicate message key, skipped");
                    return Ok(false);
                }
                Some(lease)
            }
            None => None,
        };

        self.stage(handle, envelope, dedup, extras)?;
        Ok(true)
    }

    /// Commit every staged message as one source.
    ///
    /// The staged buffer is cleared only if the engine accepts the
    /// source; otherwise it is kept for a retry.
    pub async fn commit(&mut self, cancel: &CancellationToken) -> Result<bool, StreamError> {
        if self.staged.is_empty() {
            return Ok(true);
        }

        let agent = self.agent.sign()?;
        let source = Source::new(agent, std::mem::take(&mut self.staged));

        match self.repository.commit(&source, cancel).await {
            Ok(true) => {
                tracing::info!(
                    source_id = %source.id,
                    messages = source.messages.len(),
                    "streams committed"
                );
                Ok(true)
            }
            Ok(false) => {
                tracing::warn!(source_id = %source.id, "commit rejected by storage engine");
                self.staged = source.messages;
                Ok(false)
            }
            Err(err) => {
                self.staged = source.messages;
                Err(err.into())
            }
        }
    }

    /// Release the underlying repository; anything still staged is dropped.
    pub async fn dispose(self) -> Result<(), StreamError> {
        if !self.staged.is_empty() {
            tracing::debug!(
                staged = self.staged.len(),
                "disposing repository with uncommitted messages"
            );
        }
        self.repository.dispose().await?;
        Ok(())
    }

    fn fresh(key: &str) -> Stream {
        Stream {
            key: key.to_owned(),
            id: Id::new(),
            is_new: true,
            version: Version::ZERO,
        }
    }

    fn ensure_unknown(&self, key: &str) -> Result<(), StreamError> {
        if self.handles.contains_key(key) {
            return Err(StreamError::AlreadyLoaded(key.to_owned()));
        }
        Ok(())
    }

    fn known(&self, key: &str) -> Result<StreamHandle, StreamError> {
        self.handle(key)
            .ok_or_else(|| StreamError::NotLoaded(key.to_owned()))
    }

    fn track(&mut self, stream: Stream) -> StreamHandle {
        let handle = StreamHandle(self.streams.len());
        tracing::debug!(
            stream = %stream.key,
            id = %stream.id,
            version = %stream.version,
            is_new = stream.is_new,
            "stream resolved"
        );
        self.handles.insert(stream.key.clone(), handle);
        self.streams.push(stream);
        handle
    }

    fn is_staged(&self, lease: &Lease) -> bool {
        self.staged.iter().any(|m| m.add_leases.contains(lease))
    }

    async fn find_pointer(
        &self,
        lease: &Lease,
        cancel: &CancellationToken,
    ) -> Result<Option<StatePointer>, RepositoryError> {
        let mut pointers = self
            .repository
            .enumerate_state_pointers(&LeaseLookup::new(lease.clone()), cancel);
        pointers.next().await.transpose()
    }

    fn stage(
        &mut self,
        handle: StreamHandle,
        delta: Envelope,
        dedup: Option<Lease>,
        extras: MessageExtras,
    ) -> Result<StatePointer, StreamError> {
        let stream = &mut self.streams[handle.0];
        stream.version = stream.version.next()?;
        let pointer = stream.pointer();

        let mut builder = Message::builder(pointer, delta);
        for lease in extras.remove_leases {
            builder = builder.remove_lease(lease);
        }
        builder = builder.add_lease(stream_lease(&stream.key));
        if let Some(lease) = dedup {
            builder = builder.add_lease(lease);
        }
        for lease in extras.add_leases {
            builder = builder.add_lease(lease);
        }
        for tag in extras.remove_tags {
            builder = builder.remove_tag(tag);
        }
        for tag in extras.add_tags {
            builder = builder.add_tag(tag);
        }

        tracing::trace!(stream = %stream.key, state = %pointer, "message staged");
        self.staged.push(builder.build());
        Ok(pointer)
    }
}
