// Single Stream Repository
//
// A per-key facade over a multi-stream repository, for units of work
// that only ever touch one stream.

use tokio_util::sync::CancellationToken;

use super::{MessageExtras, MultipleStreamRepository, Stream, StreamError, StreamHandle};
use crate::envelope::Delta;
use crate::log::{SourceRepository, StatePointer};

pub struct SingleStreamRepository<R> {
    inner: MultipleStreamRepository<R>,
    handle: StreamHandle,
}

impl<R: SourceRepository> SingleStreamRepository<R> {
    /// Wrap `inner`, which must already have resolved `key`.
    pub fn new(inner: MultipleStreamRepository<R>, key: &str) -> Result<Self, StreamError> {
        let handle = inner
            .handle(key)
            .ok_or_else(|| StreamError::NotLoaded(key.to_owned()))?;
        Ok(Self { inner, handle })
    }

    pub fn stream(&self) -> &Stream {
        self.inner.stream_at(self.handle)
    }

    pub fn key(&self) -> &str {
        self.stream().key()
    }

    pub fn is_new(&self) -> bool {
        self.stream().is_new()
    }

    /// The underlying source repository, for reads scoped to this stream.
    pub fn repository(&self) -> &R {
        self.inner.repository()
    }

    pub fn append<D: Delta + ?Sized>(&mut self, delta: &D) -> Result<StatePointer, StreamError> {
        let key = self.stream().key().to_owned();
        self.inner.append(&key, delta)
    }

    pub async fn append_keyed<D: Delta + ?Sized>(
        &mut self,
        delta: &D,
        cancel: &CancellationToken,
    ) -> Result<bool, StreamError> {
        let key = self.stream().key().to_owned();
        self.inner.append_keyed(&key, delta, cancel).await
    }

    pub async fn append_with<D: Delta + ?Sized>(
        &mut self,
        delta: &D,
        extras: MessageExtras,
        cancel: &CancellationToken,
    ) -> Result<bool, StreamError> {
        let key = self.stream().key().to_owned();
        self.inner.append_with(&key, delta, extras, cancel).await
    }

    pub async fn commit(&mut self, cancel: &CancellationToken) -> Result<bool, StreamError> {
        self.inner.commit(cancel).await
    }

    pub async fn dispose(self) -> Result<(), StreamError> {
        self.inner.dispose().await
    }
}
