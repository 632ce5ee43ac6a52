// Deterministic Replay
//
// Rebuilds log state from an ordered list of committed sources while
// enforcing the same invariants a live commit would.

use crate::invariants::{InvariantEngine, InvariantViolation};
use crate::log::{Id, Source};
use crate::state::LogState;

/// Errors that can occur during replay.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("source {source_id} rejected during replay: {violation}")]
    Rejected {
        source_id: Id,
        #[source]
        violation: InvariantViolation,
    },
}

/// Replay sources in order and derive the resulting state.
pub fn replay_sources<I>(sources: I, invariants: &InvariantEngine) -> Result<LogState, ReplayError>
where
    I: IntoIterator<Item = Source>,
{
    let mut state = LogState::new();

    for source in sources {
        let source_id = source.id;
        state
            .apply_source(source, invariants)
            .map_err(|violation| ReplayError::Rejected {
                source_id,
                violation,
            })?;
    }

    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{DataType, Envelope};
    use crate::log::{Lease, Message, StatePointer, Version};
    use crate::state::StateView;
    use serde_json::json;

    fn source(id: Id, version: u64, lease: Option<Lease>) -> Source {
        let mut builder = Message::builder(
            StatePointer::new(id, Version(version)),
            Envelope::from_parts(DataType::rust("test.delta"), json!({ "v": version })),
        );
        if let Some(lease) = lease {
            builder = builder.add_lease(lease);
        }
        Source::new(
            Envelope::from_parts(DataType::rust("test.agent"), json!({})),
            vec![builder.build()],
        )
    }

    #[test]
    fn replay_rebuilds_versions_and_leases() {
        let id = Id::new();
        let lease = Lease::new("stream", "key", "orders");
        let sources = vec![
            source(id, 1, Some(lease.clone())),
            source(id, 2, None),
            source(id, 3, None),
        ];

        let state = replay_sources(sources, &InvariantEngine::standard()).unwrap();

        assert_eq!(state.version_of(id), Version(3));
        assert_eq!(state.lease_holder(&lease), Some(id));
        assert_eq!(state.sources().len(), 3);
    }

    #[test]
    fn replay_fails_on_version_gap() {
        let id = Id::new();
        let gap = source(id, 3, None);
        let gap_id = gap.id;

        let err = replay_sources(vec![source(id, 1, None), gap], &InvariantEngine::standard())
            .unwrap_err();

        let ReplayError::Rejected { source_id, violation } = err;
        assert_eq!(source_id, gap_id);
        assert_eq!(violation.invariant, "contiguous-version");
    }
}
