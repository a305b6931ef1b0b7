//! The fact bag: values already known to a query.
//!
//! Facts are partitioned by fact-set id so a query can request
//! resolution scoped to exactly the sets it is entitled to see:
//! caller-supplied values live apart from globally-known ones.
//! The bag lives for exactly one query execution; cloning it is how
//! projection branches get an isolated copy with the parent's facts.

use serde::{Deserialize, Serialize};

use crate::instance::TypedInstance;
use crate::schema::{ActiveSchema, QualifiedName};

/// Identifies a partition of the fact bag.
///
/// `All` and `None` are selectors: they are meaningful when choosing
/// which sets a lookup may see, and degenerate as storage targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactSetId {
    /// Selector: every fact in the bag, regardless of set.
    All,
    /// Selector: no facts at all.
    None,
    /// The default set for facts with no explicit partition.
    Default,
    /// Facts describing the caller (identity, entitlements).
    Caller,
    /// An arbitrary caller-defined partition.
    Named(String),
}

/// A multimap from fact-set id to known typed values.
#[derive(Debug, Clone, Default)]
pub struct FactBag {
    entries: Vec<(FactSetId, TypedInstance)>,
}

impl FactBag {
    /// Creates an empty bag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a fact to the given set.
    pub fn add(&mut self, set: FactSetId, fact: TypedInstance) {
        self.entries.push((set, fact));
    }

    /// Adds a fact to the default set.
    pub fn add_default(&mut self, fact: TypedInstance) {
        self.add(FactSetId::Default, fact);
    }

    /// Number of facts across all sets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when no facts are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All facts visible through the given selectors, in insertion
    /// order. `All` sees every fact ever added; `None` sees none.
    pub fn facts_for<'a>(
        &'a self,
        sets: &'a [FactSetId],
    ) -> impl Iterator<Item = &'a TypedInstance> {
        self.entries.iter().filter_map(move |(set, fact)| {
            if Self::visible(set, sets) {
                Some(fact)
            } else {
                None
            }
        })
    }

    /// Facts of (or alias-equivalent to) the requested type, visible
    /// through the given selectors. The requested name is resolved to
    /// its base type up front, so it need not outlive the iterator.
    pub fn find_by_type<'a>(
        &'a self,
        schema: &'a ActiveSchema,
        type_name: &QualifiedName,
        sets: &'a [FactSetId],
    ) -> impl Iterator<Item = &'a TypedInstance> {
        let target = schema.base_type(type_name);
        self.facts_for(sets)
            .filter(move |fact| schema.base_type(&fact.type_name) == target)
    }

    fn visible(set: &FactSetId, selectors: &[FactSetId]) -> bool {
        if selectors.contains(&FactSetId::All) {
            return true;
        }
        selectors
            .iter()
            .any(|s| s != &FactSetId::None && s == set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::Provenance;
    use crate::schema::{Schema, TypeDef};
    use std::sync::Arc;

    fn schema() -> ActiveSchema {
        let base = Schema::builder()
            .with_type(TypeDef::scalar("t.DeskId"))
            .with_type(TypeDef::alias("t.ClientDeskId", "t.DeskId"))
            .with_type(TypeDef::scalar("t.UserId"))
            .build();
        ActiveSchema::new(Arc::new(base))
    }

    fn desk_fact(value: &str) -> TypedInstance {
        TypedInstance::scalar("t.DeskId", value, Provenance::Provided)
    }

    #[test]
    fn all_selector_sees_every_fact() {
        let mut bag = FactBag::new();
        bag.add(FactSetId::Caller, desk_fact("desk1"));
        bag.add(FactSetId::Default, desk_fact("desk2"));
        bag.add(FactSetId::Named("other".to_string()), desk_fact("desk3"));

        let all: Vec<_> = bag.facts_for(&[FactSetId::All]).collect();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn none_selector_sees_nothing() {
        let mut bag = FactBag::new();
        bag.add(FactSetId::Caller, desk_fact("desk1"));
        assert_eq!(bag.facts_for(&[FactSetId::None]).count(), 0);
    }

    #[test]
    fn named_sets_are_isolated() {
        let mut bag = FactBag::new();
        bag.add(FactSetId::Caller, desk_fact("desk1"));
        bag.add(FactSetId::Named("upstream".to_string()), desk_fact("desk2"));

        let caller: Vec<_> = bag.facts_for(&[FactSetId::Caller]).collect();
        assert_eq!(caller.len(), 1);
        assert_eq!(
            caller[0].as_scalar().and_then(|s| s.as_string()),
            Some("desk1")
        );
    }

    #[test]
    fn find_by_type_honors_alias_equivalence() {
        let schema = schema();
        let mut bag = FactBag::new();
        bag.add(
            FactSetId::Default,
            TypedInstance::scalar("t.ClientDeskId", "desk1", Provenance::Provided),
        );

        let found: Vec<_> = bag
            .find_by_type(&schema, &"t.DeskId".into(), &[FactSetId::Default])
            .collect();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn find_by_type_skips_other_types() {
        let schema = schema();
        let mut bag = FactBag::new();
        bag.add(
            FactSetId::Default,
            TypedInstance::scalar("t.UserId", "u1", Provenance::Provided),
        );
        assert_eq!(
            bag.find_by_type(&schema, &"t.DeskId".into(), &[FactSetId::Default])
                .count(),
            0
        );
    }
}
