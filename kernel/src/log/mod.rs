// Source Log Data Model
//
// Immutable values describing the append-only log: identifiers,
// versions, pointers, leases, tags, messages and sources.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::envelope::Envelope;

pub mod store;

pub use store::{
    PurgeSourceRepository, RecordStream, RepositoryError, SourceConnector, SourceRepository,
};

/// Opaque 128-bit identifier for entities and sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub Uuid);

impl Id {
    /// Allocate a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for Id {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Id)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum VersionError {
    #[error("version zero has no previous version")]
    Underflow,

    #[error("version {0} has no next version")]
    Overflow(u64),
}

/// Monotonic state counter of an entity.
///
/// `Version::ZERO` means "not yet created" for an entity and
/// "latest known" inside a [`StatePointer`] used as a query target.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(pub u64);

impl Version {
    pub const ZERO: Version = Version(0);

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn next(self) -> Result<Version, VersionError> {
        self.0
            .checked_add(1)
            .map(Version)
            .ok_or(VersionError::Overflow(self.0))
    }

    pub fn previous(self) -> Result<Version, VersionError> {
        self.0.checked_sub(1).map(Version).ok_or(VersionError::Underflow)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One state of one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatePointer {
    pub id: Id,
    pub version: Version,
}

impl StatePointer {
    pub fn new(id: Id, version: Version) -> Self {
        Self { id, version }
    }

    /// Pointer to whatever the latest state of `id` is.
    pub fn latest(id: Id) -> Self {
        Self::new(id, Version::ZERO)
    }

    /// Pointer to the state following this one.
    pub fn next(&self) -> Result<Self, VersionError> {
        Ok(Self::new(self.id, self.version.next()?))
    }

    /// Whether `candidate` is the state this pointer asks for.
    ///
    /// A zero-version pointer accepts any existing version of the same
    /// entity; otherwise the versions must match exactly.
    pub fn is_satisfied_by(&self, candidate: &StatePointer) -> bool {
        if self.id != candidate.id {
            return false;
        }
        if self.version.is_zero() {
            !candidate.version.is_zero()
        } else {
            self.version == candidate.version
        }
    }
}

impl fmt::Display for StatePointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.version)
    }
}

/// Uniquely constrained `(scope, label, value)` binding.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lease {
    pub scope: String,
    pub label: String,
    pub value: String,
}

impl Lease {
    pub fn new(
        scope: impl Into<String>,
        label: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            scope: scope.into(),
            label: label.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}={}", self.scope, self.label, self.value)
    }
}

/// Non-unique `(label, value)` metadata.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub label: String,
    pub value: String,
}

impl Tag {
    pub fn new(label: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            value: value.into(),
        }
    }
}

/// One delta applied to one entity.
///
/// `state` is the version being written. Lease removals are applied
/// before lease additions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub state: StatePointer,
    pub delta: Envelope,
    #[serde(default)]
    pub add_leases: Vec<Lease>,
    #[serde(default)]
    pub remove_leases: Vec<Lease>,
    #[serde(default)]
    pub add_tags: Vec<Tag>,
    #[serde(default)]
    pub remove_tags: Vec<Tag>,
}

impl Message {
    pub fn builder(state: StatePointer, delta: Envelope) -> MessageBuilder {
        MessageBuilder {
            message: Message {
                state,
                delta,
                add_leases: Vec::new(),
                remove_leases: Vec::new(),
                add_tags: Vec::new(),
                remove_tags: Vec::new(),
            },
        }
    }
}

/// Builder for [`Message`]. Repeated entries within a set are collapsed.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    message: Message,
}

fn push_unique<T: PartialEq>(items: &mut Vec<T>, item: T) {
    if !items.contains(&item) {
        items.push(item);
    }
}

impl MessageBuilder {
    pub fn add_lease(mut self, lease: Lease) -> Self {
        push_unique(&mut self.message.add_leases, lease);
        self
    }

    pub fn remove_lease(mut self, lease: Lease) -> Self {
        push_unique(&mut self.message.remove_leases, lease);
        self
    }

    pub fn add_tag(mut self, tag: Tag) -> Self {
        push_unique(&mut self.message.add_tags, tag);
        self
    }

    pub fn remove_tag(mut self, tag: Tag) -> Self {
        push_unique(&mut self.message.remove_tags, tag);
        self
    }

    pub fn build(self) -> Message {
        self.message
    }
}

/// Atomic unit of commit: all messages apply in order, or none do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: Id,
    pub timestamp: DateTime<Utc>,
    pub agent: Envelope,
    pub messages: Vec<Message>,
}

impl Source {
    /// Stamp a new source with a fresh id and the current time.
    pub fn new(agent: Envelope, messages: Vec<Message>) -> Self {
        Self {
            id: Id::new(),
            timestamp: Utc::now(),
            agent,
            messages,
        }
    }
}

/// A committed delta together with the state it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaRecord {
    pub source_id: Id,
    pub state: StatePointer,
    pub delta: Envelope,
}

/// A live lease and the current state of its holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub lease: Lease,
    pub state: StatePointer,
}

/// A live tag and the current state of the entity carrying it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagRecord {
    pub tag: Tag,
    pub state: StatePointer,
}
