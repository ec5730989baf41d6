//! Typed listing filters.
//!
//! An [`EntityFilter`] is what a caller asks for. Before any SQL is built it
//! is compiled into a [`ValidatedFilter`]: supplied tag and collection ids
//! are intersected with the ids that actually exist, date ranges are checked
//! and the total number of ids is bounded. Only validated predicates reach
//! the query builder in `conceptlib-db`.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::defaults;
use crate::error::{Result, ValidationErrors};
use crate::models::{EntityFields, EntityType, TagId, UserId};

/// Half-open interval `[start, end)`; either bound may be absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
}

impl DateRange {
    pub fn new(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        Self { start, end }
    }

    pub fn is_unbounded(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start.map_or(true, |s| at >= s) && self.end.map_or(true, |e| at < e)
    }

    fn is_inverted(&self) -> bool {
        matches!((self.start, self.end), (Some(s), Some(e)) if s >= e)
    }
}

/// Listing request as supplied by a caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityFilter {
    pub entity_type: Option<EntityType>,
    /// Match entities carrying at least one of these plain tags.
    #[serde(default)]
    pub any_tags: Vec<TagId>,
    /// Match entities in at least one of these collections.
    #[serde(default)]
    pub any_collections: Vec<TagId>,
    #[serde(default)]
    pub owner_id: Option<UserId>,
    #[serde(default)]
    pub created: DateRange,
    #[serde(default)]
    pub updated: DateRange,
    #[serde(default)]
    pub include_deleted: bool,
}

impl EntityFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn of_type(mut self, entity_type: EntityType) -> Self {
        self.entity_type = Some(entity_type);
        self
    }

    pub fn with_any_tags(mut self, tags: impl IntoIterator<Item = TagId>) -> Self {
        self.any_tags.extend(tags);
        self
    }

    pub fn with_any_collections(mut self, collections: impl IntoIterator<Item = TagId>) -> Self {
        self.any_collections.extend(collections);
        self
    }

    pub fn owned_by(mut self, owner_id: UserId) -> Self {
        self.owner_id = Some(owner_id);
        self
    }

    pub fn created_within(mut self, range: DateRange) -> Self {
        self.created = range;
        self
    }

    pub fn updated_within(mut self, range: DateRange) -> Self {
        self.updated = range;
        self
    }

    pub fn including_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    /// Validate against the tag and collection ids that exist.
    ///
    /// Unknown ids are dropped. When every requested id of a dimension is
    /// unknown the filter matches nothing rather than widening to
    /// everything.
    pub fn compile(
        &self,
        known_tags: &BTreeSet<TagId>,
        known_collections: &BTreeSet<TagId>,
    ) -> Result<ValidatedFilter> {
        let mut errors = ValidationErrors::new();
        if self.any_tags.len() + self.any_collections.len() > defaults::MAX_FILTER_ELEMENTS {
            errors.add(
                ValidationErrors::NON_FIELD,
                format!(
                    "Too many filter ids (limit {})",
                    defaults::MAX_FILTER_ELEMENTS
                ),
            );
        }
        if self.created.is_inverted() {
            errors.add("created", "Start must be before end");
        }
        if self.updated.is_inverted() {
            errors.add("updated", "Start must be before end");
        }
        errors.into_result()?;

        let mut matches_nothing = false;
        let mut predicates = Vec::new();

        let mut intersect = |requested: &[TagId], known: &BTreeSet<TagId>| -> Option<BTreeSet<TagId>> {
            if requested.is_empty() {
                return None;
            }
            let valid: BTreeSet<TagId> = requested.iter().copied().filter(|id| known.contains(id)).collect();
            if valid.is_empty() {
                matches_nothing = true;
            }
            Some(valid)
        };

        if let Some(tags) = intersect(&self.any_tags, known_tags) {
            predicates.push(Predicate::TagIn(tags));
        }
        if let Some(collections) = intersect(&self.any_collections, known_collections) {
            predicates.push(Predicate::CollectionIn(collections));
        }
        if let Some(owner_id) = self.owner_id {
            predicates.push(Predicate::OwnerEquals(owner_id));
        }
        if !self.created.is_unbounded() {
            predicates.push(Predicate::CreatedWithin(self.created));
        }
        if !self.updated.is_unbounded() {
            predicates.push(Predicate::UpdatedWithin(self.updated));
        }

        Ok(ValidatedFilter {
            entity_type: self.entity_type,
            predicates,
            include_deleted: self.include_deleted,
            matches_nothing,
        })
    }
}

/// One typed predicate over the live entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    TagIn(BTreeSet<TagId>),
    CollectionIn(BTreeSet<TagId>),
    OwnerEquals(UserId),
    CreatedWithin(DateRange),
    UpdatedWithin(DateRange),
}

impl Predicate {
    /// In-memory evaluation. Tag maps of legacy working sets are not visible
    /// here; the SQL form consults them.
    pub fn matches(&self, fields: &EntityFields) -> bool {
        match self {
            Self::TagIn(ids) => fields.tags.iter().any(|t| ids.contains(t)),
            Self::CollectionIn(ids) => fields.collections.iter().any(|t| ids.contains(t)),
            Self::OwnerEquals(owner) => fields.owner_id == *owner,
            Self::CreatedWithin(range) => range.contains(fields.created_at),
            Self::UpdatedWithin(range) => fields.updated_at.map_or(false, |at| range.contains(at)),
        }
    }
}

/// Filter whose ids have been checked against existing rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedFilter {
    pub entity_type: Option<EntityType>,
    pub predicates: Vec<Predicate>,
    pub include_deleted: bool,
    pub matches_nothing: bool,
}

impl ValidatedFilter {
    pub fn matches(&self, fields: &EntityFields) -> bool {
        if self.matches_nothing {
            return false;
        }
        if let Some(entity_type) = self.entity_type {
            if fields.entity_type() != entity_type {
                return false;
            }
        }
        if fields.is_deleted && !self.include_deleted {
            return false;
        }
        self.predicates.iter().all(|p| p.matches(fields))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::models::EntityBody;
    use chrono::Duration;

    fn known(ids: &[TagId]) -> BTreeSet<TagId> {
        ids.iter().copied().collect()
    }

    fn phenotype(tags: Vec<TagId>) -> EntityFields {
        let mut fields = EntityFields::new(EntityBody::empty(EntityType::Phenotype), "P", 1, Utc::now());
        fields.tags = tags;
        fields
    }

    #[test]
    fn test_empty_filter_matches_live_rows() {
        let compiled = EntityFilter::new().compile(&known(&[]), &known(&[])).unwrap();
        assert!(compiled.predicates.is_empty());
        assert!(compiled.matches(&phenotype(vec![])));

        let mut deleted = phenotype(vec![]);
        deleted.is_deleted = true;
        assert!(!compiled.matches(&deleted));
    }

    #[test]
    fn test_unknown_tag_ids_dropped() {
        let compiled = EntityFilter::new()
            .with_any_tags([1, 99])
            .compile(&known(&[1, 2]), &known(&[]))
            .unwrap();
        assert_eq!(compiled.predicates, vec![Predicate::TagIn(known(&[1]))]);
        assert!(!compiled.matches_nothing);
        assert!(compiled.matches(&phenotype(vec![1])));
        assert!(!compiled.matches(&phenotype(vec![2])));
    }

    #[test]
    fn test_all_unknown_ids_match_nothing() {
        let compiled = EntityFilter::new()
            .with_any_collections([77])
            .compile(&known(&[]), &known(&[42]))
            .unwrap();
        assert!(compiled.matches_nothing);
        assert!(!compiled.matches(&phenotype(vec![77])));
    }

    #[test]
    fn test_inverted_range_rejected() {
        let now = Utc::now();
        let err = EntityFilter::new()
            .created_within(DateRange::new(Some(now), Some(now - Duration::days(1))))
            .compile(&known(&[]), &known(&[]))
            .unwrap_err();
        match err {
            Error::Validation(errors) => assert!(errors.get("created").is_some()),
            other => panic!("Expected Validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_too_many_ids_rejected() {
        let ids: Vec<TagId> = (0..(defaults::MAX_FILTER_ELEMENTS as i64 + 1)).collect();
        let result = EntityFilter::new()
            .with_any_tags(ids)
            .compile(&known(&[]), &known(&[]));
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_owner_and_type_predicates() {
        let compiled = EntityFilter::new()
            .of_type(EntityType::Concept)
            .owned_by(1)
            .compile(&known(&[]), &known(&[]))
            .unwrap();
        assert!(!compiled.matches(&phenotype(vec![])));

        let concept = EntityFields::new(EntityBody::empty(EntityType::Concept), "C", 1, Utc::now());
        assert!(compiled.matches(&concept));
    }

    #[test]
    fn test_date_range_half_open() {
        let now = Utc::now();
        let range = DateRange::new(Some(now), Some(now + Duration::hours(1)));
        assert!(range.contains(now));
        assert!(!range.contains(now + Duration::hours(1)));
        assert!(!range.contains(now - Duration::seconds(1)));
    }
}
