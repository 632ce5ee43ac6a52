// Commit Invariants
//
// Invariants are pure rules checked against every message before it
// is applied. A violation rejects the whole source it belongs to.

use crate::log::Message;
use crate::state::StateView;

/// Result of invariant evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantResult {
    Pass,
    Fail(String),
}

/// Trait implemented by all commit invariants.
///
/// Invariants must be:
/// - Pure
/// - Deterministic
/// - Side-effect free
pub trait CommitInvariant: Send + Sync {
    fn name(&self) -> &'static str;

    fn validate(&self, state: &dyn StateView, message: &Message) -> InvariantResult;
}

/// Evaluates a set of invariants in registration order.
#[derive(Default)]
pub struct InvariantEngine {
    invariants: Vec<Box<dyn CommitInvariant>>,
}

impl InvariantEngine {
    /// Create an engine with no invariants.
    pub fn new() -> Self {
        Self {
            invariants: Vec::new(),
        }
    }

    /// Optimistic concurrency plus lease uniqueness.
    pub fn standard() -> Self {
        let mut engine = Self::new();
        engine.register(ContiguousVersion);
        engine.register(UniqueLease);
        engine
    }

    /// Register an invariant.
    pub fn register<I: CommitInvariant + 'static>(&mut self, invariant: I) {
        self.invariants.push(Box::new(invariant));
    }

    /// Evaluate all invariants.
    ///
    /// Stops at the first failure.
    pub fn evaluate(
        &self,
        state: &dyn StateView,
        message: &Message,
    ) -> Result<(), InvariantViolation> {
        for invariant in &self.invariants {
            match invariant.validate(state, message) {
                InvariantResult::Pass => continue,
                InvariantResult::Fail(reason) => {
                    return Err(InvariantViolation {
                        invariant: invariant.name(),
                        reason,
                    })
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for InvariantEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.invariants.iter().map(|i| i.name()))
            .finish()
    }
}

/// Returned when an invariant is violated.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("invariant `{invariant}` violated: {reason}")]
pub struct InvariantViolation {
    pub invariant: &'static str,
    pub reason: String,
}

/// A message must target exactly the version after the stored one.
pub struct ContiguousVersion;

impl CommitInvariant for ContiguousVersion {
    fn name(&self) -> &'static str {
        "contiguous-version"
    }

    fn validate(&self, state: &dyn StateView, message: &Message) -> InvariantResult {
        let current = state.version_of(message.state.id);
        let expected = match current.next() {
            Ok(expected) => expected,
            Err(err) => return InvariantResult::Fail(format!("{}: {err}", message.state.id)),
        };
        if message.state.version == expected {
            InvariantResult::Pass
        } else {
            InvariantResult::Fail(format!(
                "{} is at version {current}, expected write of {expected}, got {}",
                message.state.id, message.state.version
            ))
        }
    }
}

/// No two entities may hold the same lease.
pub struct UniqueLease;

impl CommitInvariant for UniqueLease {
    fn name(&self) -> &'static str {
        "unique-lease"
    }

    fn validate(&self, state: &dyn StateView, message: &Message) -> InvariantResult {
        let id = message.state.id;
        // Re-adding a lease this entity already holds is fine.
        for lease in &message.add_leases {
            if let Some(holder) = state.lease_holder(lease) {
                if holder != id {
                    return InvariantResult::Fail(format!("{lease} is held by {holder}"));
                }
            }
        }
        InvariantResult::Pass
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{DataType, Envelope};
    use crate::log::{Id, Lease, StatePointer, Version};
    use std::collections::HashMap;

    #[derive(Default)]
    struct FixedState {
        versions: HashMap<Id, Version>,
        leases: HashMap<Lease, Id>,
    }

    impl StateView for FixedState {
        fn version_of(&self, id: Id) -> Version {
            self.versions.get(&id).copied().unwrap_or(Version::ZERO)
        }

        fn lease_holder(&self, lease: &Lease) -> Option<Id> {
            self.leases.get(lease).copied()
        }
    }

    fn message(id: Id, version: u64) -> crate::log::MessageBuilder {
        Message::builder(
            StatePointer::new(id, Version(version)),
            Envelope::from_parts(DataType::rust("test.delta"), serde_json::Value::Null),
        )
    }

    #[test]
    fn stale_write_is_rejected() {
        let id = Id::new();
        let mut state = FixedState::default();
        state.versions.insert(id, Version(2));

        let engine = InvariantEngine::standard();

        assert!(engine.evaluate(&state, &message(id, 3).build()).is_ok());
        let err = engine.evaluate(&state, &message(id, 2).build()).unwrap_err();
        assert_eq!(err.invariant, "contiguous-version");
        assert!(err.to_string().contains("contiguous-version"));
    }

    #[test]
    fn zero_version_is_never_a_valid_target() {
        let engine = InvariantEngine::standard();
        let err = engine
            .evaluate(&FixedState::default(), &message(Id::new(), 0).build())
            .unwrap_err();
        assert_eq!(err.invariant, "contiguous-version");
    }

    #[test]
    fn exhausted_version_counter_is_rejected() {
        let id = Id::new();
        let mut state = FixedState::default();
        state.versions.insert(id, Version(u64::MAX));

        let err = InvariantEngine::standard()
            .evaluate(&state, &message(id, 0).build())
            .unwrap_err();

        assert_eq!(err.invariant, "contiguous-version");
        assert!(err.reason.contains("no next version"));
    }

    #[test]
    fn lease_held_elsewhere_is_rejected() {
        let (owner, intruder) = (Id::new(), Id::new());
        let lease = Lease::new("user", "email", "a@example.com");
        let mut state = FixedState::default();
        state.leases.insert(lease.clone(), owner);

        let engine = InvariantEngine::standard();

        let err = engine
            .evaluate(&state, &message(intruder, 1).add_lease(lease.clone()).build())
            .unwrap_err();
        assert_eq!(err.invariant, "unique-lease");

        // The holder may re-assert its own lease.
        state.versions.insert(owner, Version(1));
        assert!(engine
            .evaluate(&state, &message(owner, 2).add_lease(lease).build())
            .is_ok());
    }

    #[test]
    fn empty_engine_passes_everything() {
        let engine = InvariantEngine::new();
        assert!(engine
            .evaluate(&FixedState::default(), &message(Id::new(), 7).build())
            .is_ok());
    }
}
