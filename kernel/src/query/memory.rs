// In-Memory Query Translation
//
// Walks the engine-neutral filter and sort trees against rows held in
// memory. Multi-valued row fields match when any of their values does.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use super::{ExprBuilder, Filter, Query, Sort, SortKey};
use crate::envelope::DataType;
use crate::log::{Id, Lease, StatePointer, Tag};

/// The view of one stored record that filters are evaluated on.
#[derive(Debug, Clone, Default)]
pub struct Row<'a> {
    pub source_ids: Vec<Id>,
    pub timestamp: Option<DateTime<Utc>>,
    pub data_types: Vec<&'a DataType>,
    pub states: Vec<StatePointer>,
    pub leases: Vec<&'a Lease>,
    pub tags: Vec<&'a Tag>,
}

pub fn matches(filter: &Filter, row: &Row<'_>) -> bool {
    match filter {
        Filter::All => true,
        Filter::Not(inner) => !matches(inner, row),
        Filter::And(parts) => parts.iter().all(|part| matches(part, row)),
        Filter::Or(parts) => parts.iter().any(|part| matches(part, row)),
        Filter::SourceIdIn(ids) => row.source_ids.iter().any(|id| ids.contains(id)),
        Filter::Timestamp(op, at) => row.timestamp.is_some_and(|ts| op.holds(&ts, at)),
        Filter::DataTypeIn(types) => row.data_types.iter().any(|t| types.contains(*t)),
        Filter::StateIdIn(ids) => row.states.iter().any(|state| ids.contains(&state.id)),
        Filter::StateVersion(op, version) => {
            row.states.iter().any(|state| op.holds(&state.version, version))
        }
        Filter::LeaseEq(lease) => row.leases.iter().any(|l| *l == lease),
        Filter::LeaseScopeEq(scope) => row.leases.iter().any(|l| &l.scope == scope),
        Filter::LeaseLabelEq(label) => row.leases.iter().any(|l| &l.label == label),
        Filter::LeaseValueEq(value) => row.leases.iter().any(|l| &l.value == value),
        Filter::TagEq(tag) => row.tags.iter().any(|t| *t == tag),
        Filter::TagLabelEq(label) => row.tags.iter().any(|t| &t.label == label),
        Filter::TagValueEq(value) => row.tags.iter().any(|t| &t.value == value),
    }
}

fn compare_key(key: SortKey, a: &Row<'_>, b: &Row<'_>) -> Ordering {
    match key {
        SortKey::Timestamp => a.timestamp.cmp(&b.timestamp),
        SortKey::SourceId => a.source_ids.first().cmp(&b.source_ids.first()),
        SortKey::StateId => a
            .states
            .first()
            .map(|s| s.id)
            .cmp(&b.states.first().map(|s| s.id)),
        SortKey::StateVersion => a
            .states
            .first()
            .map(|s| s.version)
            .cmp(&b.states.first().map(|s| s.version)),
    }
}

pub fn compare(sort: &Sort, a: &Row<'_>, b: &Row<'_>) -> Ordering {
    for (key, ascending) in &sort.keys {
        let ordering = compare_key(*key, a, b);
        let ordering = if *ascending {
            ordering
        } else {
            ordering.reverse()
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// A query translated for in-memory evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub filter: Filter,
    pub sort: Option<Sort>,
    pub skip: usize,
    pub take: Option<usize>,
}

impl Plan {
    pub fn of<Q: Query>(query: &Q) -> Self {
        Self {
            filter: query.filter(&ExprBuilder),
            sort: query.sort(&ExprBuilder),
            skip: query.skip().unwrap_or(0),
            take: query.take(),
        }
    }

    /// Filter, order (stable), then page the candidate rows.
    pub fn select<'a, T>(&self, rows: impl IntoIterator<Item = (Row<'a>, T)>) -> Vec<T> {
        let mut selected: Vec<(Row<'a>, T)> = rows
            .into_iter()
            .filter(|(row, _)| matches(&self.filter, row))
            .collect();

        if let Some(sort) = &self.sort {
            selected.sort_by(|(a, _), (b, _)| compare(sort, a, b));
        }

        selected
            .into_iter()
            .skip(self.skip)
            .take(self.take.unwrap_or(usize::MAX))
            .map(|(_, item)| item)
            .collect()
    }
}
