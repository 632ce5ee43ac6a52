// Query Abstraction
//
// A query describes its predicate and ordering once, through the
// builder vocabulary below. Each storage engine supplies a builder
// (or translates the expression tree produced by `ExprBuilder`) and
// never exposes its internals to the query.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};

use crate::envelope::DataType;
use crate::log::{Id, Lease, Tag, Version};

pub mod memory;

/// Fixed filter vocabulary shared by every engine.
pub trait FilterBuilder {
    type Filter;

    /// Matches everything.
    fn all(&self) -> Self::Filter;
    fn not(&self, filter: Self::Filter) -> Self::Filter;
    fn and(&self, filters: Vec<Self::Filter>) -> Self::Filter;
    fn or(&self, filters: Vec<Self::Filter>) -> Self::Filter;

    fn source_id_in(&self, ids: &[Id]) -> Self::Filter;
    fn timestamp_cmp(&self, op: Comparison, at: DateTime<Utc>) -> Self::Filter;
    fn data_type_in(&self, types: &[DataType]) -> Self::Filter;

    fn state_id_in(&self, ids: &[Id]) -> Self::Filter;
    fn state_version_cmp(&self, op: Comparison, version: Version) -> Self::Filter;

    fn lease_eq(&self, lease: &Lease) -> Self::Filter;
    fn lease_scope_eq(&self, scope: &str) -> Self::Filter;
    fn lease_label_eq(&self, label: &str) -> Self::Filter;
    fn lease_value_eq(&self, value: &str) -> Self::Filter;

    fn tag_eq(&self, tag: &Tag) -> Self::Filter;
    fn tag_label_eq(&self, label: &str) -> Self::Filter;
    fn tag_value_eq(&self, value: &str) -> Self::Filter;

    fn source_id_eq(&self, id: Id) -> Self::Filter {
        self.source_id_in(&[id])
    }

    fn state_version_gte(&self, version: Version) -> Self::Filter {
        self.state_version_cmp(Comparison::Gte, version)
    }

    fn state_version_lte(&self, version: Version) -> Self::Filter {
        self.state_version_cmp(Comparison::Lte, version)
    }
}

/// Fixed ordering vocabulary shared by every engine.
pub trait SortBuilder {
    type Sort;

    fn timestamp(&self, ascending: bool) -> Self::Sort;
    fn source_id(&self, ascending: bool) -> Self::Sort;
    fn state_id(&self, ascending: bool) -> Self::Sort;
    fn state_version(&self, ascending: bool) -> Self::Sort;

    /// Order by `first`, breaking ties with `next`.
    fn then(&self, first: Self::Sort, next: Self::Sort) -> Self::Sort;
}

/// Wraps a sort builder and flips every direction passed through it.
#[derive(Debug, Clone, Copy)]
pub struct ReverseSortBuilder<'a, B> {
    inner: &'a B,
}

impl<'a, B: SortBuilder> ReverseSortBuilder<'a, B> {
    pub fn new(inner: &'a B) -> Self {
        Self { inner }
    }
}

impl<B: SortBuilder> SortBuilder for ReverseSortBuilder<'_, B> {
    type Sort = B::Sort;

    fn timestamp(&self, ascending: bool) -> Self::Sort {
        self.inner.timestamp(!ascending)
    }

    fn source_id(&self, ascending: bool) -> Self::Sort {
        self.inner.source_id(!ascending)
    }

    fn state_id(&self, ascending: bool) -> Self::Sort {
        self.inner.state_id(!ascending)
    }

    fn state_version(&self, ascending: bool) -> Self::Sort {
        self.inner.state_version(!ascending)
    }

    fn then(&self, first: Self::Sort, next: Self::Sort) -> Self::Sort {
        self.inner.then(first, next)
    }
}

/// Opaque engine hints carried with a query.
pub type QueryOptions = BTreeMap<String, serde_json::Value>;

/// A logical query, independent of any engine.
pub trait Query: Send + Sync {
    fn filter<B: FilterBuilder>(&self, builder: &B) -> B::Filter;

    fn sort<B: SortBuilder>(&self, _builder: &B) -> Option<B::Sort> {
        None
    }

    fn skip(&self) -> Option<usize> {
        None
    }

    fn take(&self) -> Option<usize> {
        None
    }

    fn options(&self) -> Option<&QueryOptions> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Gte,
    Lte,
}

impl Comparison {
    pub fn holds<T: Ord>(self, actual: &T, expected: &T) -> bool {
        match self {
            Comparison::Eq => actual == expected,
            Comparison::Gte => actual >= expected,
            Comparison::Lte => actual <= expected,
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Comparison::Eq => "=",
            Comparison::Gte => ">=",
            Comparison::Lte => "<=",
        })
    }
}

/// Engine-neutral filter expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    Not(Box<Filter>),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    SourceIdIn(Vec<Id>),
    Timestamp(Comparison, DateTime<Utc>),
    DataTypeIn(Vec<DataType>),
    StateIdIn(Vec<Id>),
    StateVersion(Comparison, Version),
    LeaseEq(Lease),
    LeaseScopeEq(String),
    LeaseLabelEq(String),
    LeaseValueEq(String),
    TagEq(Tag),
    TagLabelEq(String),
    TagValueEq(String),
}

fn write_joined(f: &mut fmt::Formatter<'_>, items: &[impl fmt::Display], sep: &str) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::All => f.write_str("*"),
            Filter::Not(inner) => write!(f, "not({inner})"),
            Filter::And(parts) => {
                f.write_str("(")?;
                write_joined(f, parts, " and ")?;
                f.write_str(")")
            }
            Filter::Or(parts) => {
                f.write_str("(")?;
                write_joined(f, parts, " or ")?;
                f.write_str(")")
            }
            Filter::SourceIdIn(ids) => {
                f.write_str("source_id in [")?;
                write_joined(f, ids, ", ")?;
                f.write_str("]")
            }
            Filter::Timestamp(op, at) => write!(f, "timestamp {op} {}", at.to_rfc3339()),
            Filter::DataTypeIn(types) => {
                f.write_str("data_type in [")?;
                write_joined(f, types, ", ")?;
                f.write_str("]")
            }
            Filter::StateIdIn(ids) => {
                f.write_str("state_id in [")?;
                write_joined(f, ids, ", ")?;
                f.write_str("]")
            }
            Filter::StateVersion(op, version) => write!(f, "state_version {op} {version}"),
            Filter::LeaseEq(lease) => write!(f, "lease = {lease}"),
            Filter::LeaseScopeEq(scope) => write!(f, "lease.scope = {scope}"),
            Filter::LeaseLabelEq(label) => write!(f, "lease.label = {label}"),
            Filter::LeaseValueEq(value) => write!(f, "lease.value = {value}"),
            Filter::TagEq(tag) => write!(f, "tag = {}={}", tag.label, tag.value),
            Filter::TagLabelEq(label) => write!(f, "tag.label = {label}"),
            Filter::TagValueEq(value) => write!(f, "tag.value = {value}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Timestamp,
    SourceId,
    StateId,
    StateVersion,
}

/// Engine-neutral ordering: keys in priority order with their direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sort {
    pub keys: Vec<(SortKey, bool)>,
}

impl Sort {
    fn single(key: SortKey, ascending: bool) -> Self {
        Self {
            keys: vec![(key, ascending)],
        }
    }
}

/// Builds the engine-neutral [`Filter`] and [`Sort`] trees.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExprBuilder;

impl FilterBuilder for ExprBuilder {
    type Filter = Filter;

    fn all(&self) -> Filter {
        Filter::All
    }

    fn not(&self, filter: Filter) -> Filter {
        match filter {
            Filter::Not(inner) => *inner,
            other => Filter::Not(Box::new(other)),
        }
    }

    fn and(&self, filters: Vec<Filter>) -> Filter {
        let mut parts: Vec<Filter> = filters.into_iter().filter(|f| *f != Filter::All).collect();
        match parts.len() {
            0 => Filter::All,
            1 => parts.remove(0),
            _ => Filter::And(parts),
        }
    }

    fn or(&self, filters: Vec<Filter>) -> Filter {
        if filters.iter().any(|f| *f == Filter::All) {
            return Filter::All;
        }
        let mut parts = filters;
        match parts.len() {
            1 => parts.remove(0),
            _ => Filter::Or(parts),
        }
    }

    fn source_id_in(&self, ids: &[Id]) -> Filter {
        Filter::SourceIdIn(ids.to_vec())
    }

    fn timestamp_cmp(&self, op: Comparison, at: DateTime<Utc>) -> Filter {
        Filter::Timestamp(op, at)
    }

    fn data_type_in(&self, types: &[DataType]) -> Filter {
        Filter::DataTypeIn(types.to_vec())
    }

    fn state_id_in(&self, ids: &[Id]) -> Filter {
        Filter::StateIdIn(ids.to_vec())
    }

    fn state_version_cmp(&self, op: Comparison, version: Version) -> Filter {
        Filter::StateVersion(op, version)
    }

    fn lease_eq(&self, lease: &Lease) -> Filter {
        Filter::LeaseEq(lease.clone())
    }

    fn lease_scope_eq(&self, scope: &str) -> Filter {
        Filter::LeaseScopeEq(scope.to_owned())
    }

    fn lease_label_eq(&self, label: &str) -> Filter {
        Filter::LeaseLabelEq(label.to_owned())
    }

    fn lease_value_eq(&self, value: &str) -> Filter {
        Filter::LeaseValueEq(value.to_owned())
    }

    fn tag_eq(&self, tag: &Tag) -> Filter {
        Filter::TagEq(tag.clone())
    }

    fn tag_label_eq(&self, label: &str) -> Filter {
        Filter::TagLabelEq(label.to_owned())
    }

    fn tag_value_eq(&self, value: &str) -> Filter {
        Filter::TagValueEq(value.to_owned())
    }
}

impl SortBuilder for ExprBuilder {
    type Sort = Sort;

    fn timestamp(&self, ascending: bool) -> Sort {
        Sort::single(SortKey::Timestamp, ascending)
    }

    fn source_id(&self, ascending: bool) -> Sort {
        Sort::single(SortKey::SourceId, ascending)
    }

    fn state_id(&self, ascending: bool) -> Sort {
        Sort::single(SortKey::StateId, ascending)
    }

    fn state_version(&self, ascending: bool) -> Sort {
        Sort::single(SortKey::StateVersion, ascending)
    }

    fn then(&self, mut first: Sort, next: Sort) -> Sort {
        first.keys.extend(next.keys);
        first
    }
}

/// Finds whatever currently holds one lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseLookup {
    pub lease: Lease,
}

impl LeaseLookup {
    pub fn new(lease: Lease) -> Self {
        Self { lease }
    }
}

impl Query for LeaseLookup {
    fn filter<B: FilterBuilder>(&self, builder: &B) -> B::Filter {
        builder.lease_eq(&self.lease)
    }

    fn take(&self) -> Option<usize> {
        Some(1)
    }
}

/// General purpose query; every populated field narrows the result.
///
/// Results are ordered oldest-first, then by state version.
#[derive(Debug, Clone, Default)]
pub struct StateQuery {
    pub source_ids: Vec<Id>,
    pub state_ids: Vec<Id>,
    pub min_version: Option<Version>,
    pub max_version: Option<Version>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub data_types: Vec<DataType>,
    pub lease_scope: Option<String>,
    pub lease_label: Option<String>,
    pub tags: Vec<Tag>,
    pub skip: Option<usize>,
    pub take: Option<usize>,
    pub options: QueryOptions,
}

impl StateQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state_id(mut self, id: Id) -> Self {
        self.state_ids.push(id);
        self
    }

    pub fn source_id(mut self, id: Id) -> Self {
        self.source_ids.push(id);
        self
    }

    pub fn min_version(mut self, version: Version) -> Self {
        self.min_version = Some(version);
        self
    }

    pub fn max_version(mut self, version: Version) -> Self {
        self.max_version = Some(version);
        self
    }

    pub fn since(mut self, at: DateTime<Utc>) -> Self {
        self.since = Some(at);
        self
    }

    pub fn until(mut self, at: DateTime<Utc>) -> Self {
        self.until = Some(at);
        self
    }

    pub fn data_type(mut self, data_type: DataType) -> Self {
        self.data_types.push(data_type);
        self
    }

    pub fn lease_scope(mut self, scope: impl Into<String>) -> Self {
        self.lease_scope = Some(scope.into());
        self
    }

    pub fn lease_label(mut self, label: impl Into<String>) -> Self {
        self.lease_label = Some(label.into());
        self
    }

    pub fn tag(mut self, tag: Tag) -> Self {
        self.tags.push(tag);
        self
    }

    pub fn skip(mut self, count: usize) -> Self {
        self.skip = Some(count);
        self
    }

    pub fn take(mut self, count: usize) -> Self {
        self.take = Some(count);
        self
    }

    pub fn option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    /// Same query, newest first.
    pub fn reversed(self) -> Reversed<Self> {
        Reversed(self)
    }
}

impl Query for StateQuery {
    fn filter<B: FilterBuilder>(&self, builder: &B) -> B::Filter {
        let mut parts = Vec::new();

        if !self.source_ids.is_empty() {
            parts.push(builder.source_id_in(&self.source_ids));
        }
        if !self.state_ids.is_empty() {
            parts.push(builder.state_id_in(&self.state_ids));
        }
        if let Some(version) = self.min_version {
            parts.push(builder.state_version_gte(version));
        }
        if let Some(version) = self.max_version {
            parts.push(builder.state_version_lte(version));
        }
        if let Some(at) = self.since {
            parts.push(builder.timestamp_cmp(Comparison::Gte, at));
        }
        if let Some(at) = self.until {
            parts.push(builder.timestamp_cmp(Comparison::Lte, at));
        }
        if !self.data_types.is_empty() {
            parts.push(builder.data_type_in(&self.data_types));
        }
        if let Some(scope) = &self.lease_scope {
            parts.push(builder.lease_scope_eq(scope));
        }
        if let Some(label) = &self.lease_label {
            parts.push(builder.lease_label_eq(label));
        }
        for tag in &self.tags {
            parts.push(builder.tag_eq(tag));
        }

        builder.and(parts)
    }

    fn sort<B: SortBuilder>(&self, builder: &B) -> Option<B::Sort> {
        Some(builder.then(builder.timestamp(true), builder.state_version(true)))
    }

    fn skip(&self) -> Option<usize> {
        self.skip
    }

    fn take(&self) -> Option<usize> {
        self.take
    }

    fn options(&self) -> Option<&QueryOptions> {
        Some(&self.options)
    }
}

/// Runs the inner query with every sort direction flipped.
#[derive(Debug, Clone)]
pub struct Reversed<Q>(pub Q);

impl<Q: Query> Query for Reversed<Q> {
    fn filter<B: FilterBuilder>(&self, builder: &B) -> B::Filter {
        self.0.filter(builder)
    }

    fn sort<B: SortBuilder>(&self, builder: &B) -> Option<B::Sort> {
        self.0.sort(&ReverseSortBuilder::new(builder))
    }

    fn skip(&self) -> Option<usize> {
        self.0.skip()
    }

    fn take(&self) -> Option<usize> {
        self.0.take()
    }

    fn options(&self) -> Option<&QueryOptions> {
        self.0.options()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_state_query_matches_everything() {
        assert_eq!(StateQuery::new().filter(&ExprBuilder), Filter::All);
    }

    #[test]
    fn populated_fields_are_conjoined() {
        let id = Id::new();
        let filter = StateQuery::new()
            .state_id(id)
            .min_version(Version(2))
            .lease_scope("stream")
            .filter(&ExprBuilder);

        assert_eq!(
            filter,
            Filter::And(vec![
                Filter::StateIdIn(vec![id]),
                Filter::StateVersion(Comparison::Gte, Version(2)),
                Filter::LeaseScopeEq("stream".into()),
            ])
        );
    }

    #[test]
    fn reversed_query_flips_every_direction() {
        let forward = StateQuery::new().sort(&ExprBuilder).unwrap();
        let backward = StateQuery::new().reversed().sort(&ExprBuilder).unwrap();

        assert_eq!(
            forward.keys,
            vec![(SortKey::Timestamp, true), (SortKey::StateVersion, true)]
        );
        assert_eq!(
            backward.keys,
            vec![(SortKey::Timestamp, false), (SortKey::StateVersion, false)]
        );
    }

    #[test]
    fn double_negation_collapses() {
        let b = ExprBuilder;
        let filter = b.not(b.not(b.tag_label_eq("color")));
        assert_eq!(filter, Filter::TagLabelEq("color".into()));
    }

    #[test]
    fn lease_lookup_takes_one() {
        let lookup = LeaseLookup::new(Lease::new("stream", "key", "cart-1"));
        assert_eq!(lookup.take(), Some(1));
        assert_eq!(
            lookup.filter(&ExprBuilder).to_string(),
            "lease = stream/key=cart-1"
        );
    }
}
