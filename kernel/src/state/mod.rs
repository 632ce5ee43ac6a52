// Derived Log State
//
// Folds committed sources into per-entity state: current version,
// live leases and live tags, plus the global lease index. A source
// is applied through a transition overlay so that the live state only
// changes once every message of the source has been accepted.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use crate::invariants::{InvariantEngine, InvariantViolation};
use crate::log::{Id, Lease, Message, Source, Tag, Version};

/// Read access to the state a message is validated against.
pub trait StateView {
    /// Stored version of `id`, `Version::ZERO` if it does not exist.
    fn version_of(&self, id: Id) -> Version;

    fn lease_holder(&self, lease: &Lease) -> Option<Id>;
}

/// Current state of one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityState {
    pub version: Version,
    pub leases: BTreeSet<Lease>,
    pub tags: BTreeSet<Tag>,
    pub last_source: Id,
    pub updated_at: DateTime<Utc>,
}

impl EntityState {
    fn empty(source: &Source) -> Self {
        Self {
            version: Version::ZERO,
            leases: BTreeSet::new(),
            tags: BTreeSet::new(),
            last_source: source.id,
            updated_at: source.timestamp,
        }
    }
}

/// State derived from an ordered list of committed sources.
#[derive(Debug, Clone, Default)]
pub struct LogState {
    entities: HashMap<Id, EntityState>,
    creation_order: Vec<Id>,
    leases: BTreeMap<Lease, Id>,
    sources: Vec<Source>,
}

impl LogState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity(&self, id: Id) -> Option<&EntityState> {
        self.entities.get(&id)
    }

    /// Entities in the order they were first written.
    pub fn entities(&self) -> impl Iterator<Item = (Id, &EntityState)> {
        self.creation_order
            .iter()
            .filter_map(|id| self.entities.get(id).map(|entity| (*id, entity)))
    }

    /// Live leases ordered by `(scope, label, value)`.
    pub fn leases(&self) -> impl Iterator<Item = (&Lease, Id)> {
        self.leases.iter().map(|(lease, id)| (lease, *id))
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    /// Apply one source atomically.
    ///
    /// Every message is checked against the state left by the messages
    /// before it. On the first violation nothing is applied.
    pub fn apply_source(
        &mut self,
        source: Source,
        invariants: &InvariantEngine,
    ) -> Result<(), InvariantViolation> {
        let mut transition = Transition::new(self);
        for message in &source.messages {
            invariants.evaluate(&transition, message)?;
            transition.apply(message, &source);
        }

        let Transition {
            entities,
            leases,
            created,
            ..
        } = transition;

        self.creation_order.extend(created);
        self.entities.extend(entities);
        for (lease, holder) in leases {
            match holder {
                Some(id) => self.leases.insert(lease, id),
                None => self.leases.remove(&lease),
            };
        }
        self.sources.push(source);
        Ok(())
    }
}

impl StateView for LogState {
    fn version_of(&self, id: Id) -> Version {
        self.entities
            .get(&id)
            .map(|entity| entity.version)
            .unwrap_or(Version::ZERO)
    }

    fn lease_holder(&self, lease: &Lease) -> Option<Id> {
        self.leases.get(lease).copied()
    }
}

/// Pending changes of one source, layered over the live state.
struct Transition<'a> {
    base: &'a LogState,
    entities: HashMap<Id, EntityState>,
    leases: HashMap<Lease, Option<Id>>,
    created: Vec<Id>,
}

impl<'a> Transition<'a> {
    fn new(base: &'a LogState) -> Self {
        Self {
            base,
            entities: HashMap::new(),
            leases: HashMap::new(),
            created: Vec::new(),
        }
    }

    fn apply(&mut self, message: &Message, source: &Source) {
        let id = message.state.id;
        let mut entity = match self.entities.remove(&id) {
            Some(entity) => entity,
            None => match self.base.entity(id) {
                Some(entity) => entity.clone(),
                None => {
                    self.created.push(id);
                    EntityState::empty(source)
                }
            },
        };

        // Removals first so a lease can move within one source.
        for lease in &message.remove_leases {
            if self.lease_holder(lease) == Some(id) {
                self.leases.insert(lease.clone(), None);
                entity.leases.remove(lease);
            }
        }
        for lease in &message.add_leases {
            self.leases.insert(lease.clone(), Some(id));
            entity.leases.insert(lease.clone());
        }
        for tag in &message.remove_tags {
            entity.tags.remove(tag);
        }
        for tag in &message.add_tags {
            entity.tags.insert(tag.clone());
        }

        entity.version = message.state.version;
        entity.last_source = source.id;
        entity.updated_at = source.timestamp;
        self.entities.insert(id, entity);
    }
}

impl StateView for Transition<'_> {
    fn version_of(&self, id: Id) -> Version {
        match self.entities.get(&id) {
            Some(entity) => entity.version,
            None => self.base.version_of(id),
        }
    }

    fn lease_holder(&self, lease: &Lease) -> Option<Id> {
        match self.leases.get(lease) {
            Some(holder) => *holder,
            None => self.base.lease_holder(lease),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{DataType, Envelope};
    use crate::log::StatePointer;
    use serde_json::json;

    fn delta() -> Envelope {
        Envelope::from_parts(DataType::rust("test.delta"), json!({}))
    }

    fn agent() -> Envelope {
        Envelope::from_parts(DataType::rust("test.agent"), json!({}))
    }

    #[test]
    fn versions_advance_and_leases_are_indexed() {
        let mut state = LogState::new();
        let invariants = InvariantEngine::standard();
        let id = Id::new();
        let lease = Lease::new("stream", "key", "cart-1");

        let first = Message::builder(StatePointer::new(id, Version(1)), delta())
            .add_lease(lease.clone())
            .add_tag(Tag::new("kind", "cart"))
            .build();
        let second = Message::builder(StatePointer::new(id, Version(2)), delta()).build();

        state
            .apply_source(Source::new(agent(), vec![first, second]), &invariants)
            .unwrap();

        assert_eq!(state.version_of(id), Version(2));
        assert_eq!(state.lease_holder(&lease), Some(id));
        assert!(state.entity(id).unwrap().tags.contains(&Tag::new("kind", "cart")));
        assert_eq!(state.sources().len(), 1);
    }

    #[test]
    fn rejected_source_leaves_state_untouched() {
        let mut state = LogState::new();
        let invariants = InvariantEngine::standard();
        let id = Id::new();

        let good = Message::builder(StatePointer::new(id, Version(1)), delta()).build();
        let gap = Message::builder(StatePointer::new(id, Version(3)), delta()).build();

        let err = state
            .apply_source(Source::new(agent(), vec![good, gap]), &invariants)
            .unwrap_err();

        assert_eq!(err.invariant, "contiguous-version");
        assert_eq!(state.version_of(id), Version::ZERO);
        assert!(state.entity(id).is_none());
        assert!(state.sources().is_empty());
    }

    #[test]
    fn lease_moves_between_entities_within_one_source() {
        let mut state = LogState::new();
        let invariants = InvariantEngine::standard();
        let (a, b) = (Id::new(), Id::new());
        let lease = Lease::new("user", "email", "a@example.com");

        let claim = Message::builder(StatePointer::new(a, Version(1)), delta())
            .add_lease(lease.clone())
            .build();
        state
            .apply_source(Source::new(agent(), vec![claim]), &invariants)
            .unwrap();

        let release = Message::builder(StatePointer::new(a, Version(2)), delta())
            .remove_lease(lease.clone())
            .build();
        let take = Message::builder(StatePointer::new(b, Version(1)), delta())
            .add_lease(lease.clone())
            .build();
        state
            .apply_source(Source::new(agent(), vec![release, take]), &invariants)
            .unwrap();

        assert_eq!(state.lease_holder(&lease), Some(b));
        assert!(state.entity(a).unwrap().leases.is_empty());
    }

    #[test]
    fn entities_enumerate_in_creation_order() {
        let mut state = LogState::new();
        let invariants = InvariantEngine::standard();
        let ids: Vec<Id> = (0..4).map(|_| Id::new()).collect();

        for id in &ids {
            let message = Message::builder(StatePointer::new(*id, Version(1)), delta()).build();
            state
                .apply_source(Source::new(agent(), vec![message]), &invariants)
                .unwrap();
        }

        let seen: Vec<Id> = state.entities().map(|(id, _)| id).collect();
        assert_eq!(seen, ids);
    }
}
