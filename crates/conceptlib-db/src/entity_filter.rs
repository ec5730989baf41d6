//! SQL generation for validated entity listing filters.
//!
//! Only a [`ValidatedFilter`] can be turned into SQL, so every id reaching
//! a query has already been checked against the tag table. Values are
//! always bound as parameters.

use chrono::{DateTime, Utc};

use conceptlib_core::{DateRange, Predicate, ValidatedFilter};

/// Type-safe parameter binding for SQL queries.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryParam {
    BigInt(i64),
    BigIntArray(Vec<i64>),
    Timestamp(DateTime<Utc>),
    String(String),
}

/// Generates the WHERE clause for an entity listing. The entity table is
/// expected under the alias `e`.
pub struct EntityFilterQueryBuilder<'a> {
    filter: &'a ValidatedFilter,
    param_offset: usize,
}

impl<'a> EntityFilterQueryBuilder<'a> {
    /// `param_offset` is the number of parameters already in the query.
    pub fn new(filter: &'a ValidatedFilter, param_offset: usize) -> Self {
        Self {
            filter,
            param_offset,
        }
    }

    /// SQL fragment and its parameters in placeholder order.
    pub fn build(&self) -> (String, Vec<QueryParam>) {
        if self.filter.matches_nothing {
            return ("FALSE".to_string(), vec![]);
        }

        let mut clauses = Vec::new();
        let mut params = Vec::new();
        let mut idx = self.param_offset;

        if let Some(entity_type) = self.filter.entity_type {
            idx += 1;
            clauses.push(format!("e.entity_type = ${}", idx));
            params.push(QueryParam::String(entity_type.as_str().to_string()));
        }

        if !self.filter.include_deleted {
            clauses.push("e.is_deleted = FALSE".to_string());
        }

        for predicate in &self.filter.predicates {
            match predicate {
                Predicate::TagIn(ids) => {
                    idx += 1;
                    // Legacy working sets keep their tags only in the tag map.
                    clauses.push(format!(
                        "(e.tags && ${idx}::bigint[] OR EXISTS (SELECT 1 FROM entity_tag_map m \
                         WHERE m.entity_type = e.entity_type AND m.entity_id = e.id \
                         AND m.tag_id = ANY(${idx}::bigint[])))",
                        idx = idx
                    ));
                    params.push(QueryParam::BigIntArray(ids.iter().copied().collect()));
                }
                Predicate::CollectionIn(ids) => {
                    idx += 1;
                    clauses.push(format!(
                        "(e.collections && ${idx}::bigint[] OR e.tags && ${idx}::bigint[])",
                        idx = idx
                    ));
                    params.push(QueryParam::BigIntArray(ids.iter().copied().collect()));
                }
                Predicate::OwnerEquals(owner) => {
                    idx += 1;
                    clauses.push(format!("e.owner_id = ${}", idx));
                    params.push(QueryParam::BigInt(*owner));
                }
                Predicate::CreatedWithin(range) => {
                    push_range("e.created_at", range, &mut idx, &mut clauses, &mut params);
                }
                Predicate::UpdatedWithin(range) => {
                    push_range("e.updated_at", range, &mut idx, &mut clauses, &mut params);
                }
            }
        }

        if clauses.is_empty() {
            ("TRUE".to_string(), params)
        } else {
            (clauses.join(" AND "), params)
        }
    }
}

fn push_range(
    column: &str,
    range: &DateRange,
    idx: &mut usize,
    clauses: &mut Vec<String>,
    params: &mut Vec<QueryParam>,
) {
    if let Some(start) = range.start {
        *idx += 1;
        clauses.push(format!("{} >= ${}", column, idx));
        params.push(QueryParam::Timestamp(start));
    }
    if let Some(end) = range.end {
        *idx += 1;
        clauses.push(format!("{} < ${}", column, idx));
        params.push(QueryParam::Timestamp(end));
    }
}
