//! Point-in-time selection of owned child rows.
//!
//! Given every history row of a parent's children, pick the state each child
//! had at a moment: take the latest revision per child id at or before the
//! moment, then drop any child id with a deletion revision at or before the
//! same moment. The order of the two steps matters; filtering deletions
//! first would resurrect the last pre-deletion state of deleted children.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

use crate::error::Result;
use crate::models::{ChildRevision, RevisionType};

/// Children alive at `as_of`, one revision each, ordered by child id.
pub fn select_as_of(revisions: &[ChildRevision], as_of: DateTime<Utc>) -> Vec<&ChildRevision> {
    let mut latest: BTreeMap<i64, &ChildRevision> = BTreeMap::new();
    for rev in revisions.iter().filter(|r| r.revision_date <= as_of) {
        match latest.get(&rev.child_id) {
            Some(current) if current.revision_id >= rev.revision_id => {}
            _ => {
                latest.insert(rev.child_id, rev);
            }
        }
    }

    let deleted: HashSet<i64> = revisions
        .iter()
        .filter(|r| r.revision_date <= as_of && r.revision_type == RevisionType::Deleted)
        .map(|r| r.child_id)
        .collect();

    latest
        .into_iter()
        .filter(|(child_id, _)| !deleted.contains(child_id))
        .map(|(_, rev)| rev)
        .collect()
}

/// Decode the payload of a child revision.
pub fn decode<T: DeserializeOwned>(rev: &ChildRevision) -> Result<T> {
    Ok(serde_json::from_value(rev.payload.clone())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChildKind, TagMapRecord};
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn rev(revision_id: i64, child_id: i64, secs: i64, revision_type: RevisionType, tag: i64) -> ChildRevision {
        ChildRevision {
            revision_id,
            child_kind: ChildKind::TagMap,
            child_id,
            parent_id: 1,
            revision_date: at(secs),
            revision_type,
            payload: serde_json::json!({ "tag_id": tag }),
        }
    }

    #[test]
    fn test_latest_revision_wins() {
        let revisions = vec![
            rev(1, 10, 0, RevisionType::Created, 1),
            rev(2, 10, 10, RevisionType::Modified, 2),
        ];
        let selected = select_as_of(&revisions, at(20));
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].revision_id, 2);

        let earlier = select_as_of(&revisions, at(5));
        assert_eq!(earlier[0].revision_id, 1);
    }

    #[test]
    fn test_deleted_child_is_not_resurrected() {
        let revisions = vec![
            rev(1, 10, 0, RevisionType::Created, 1),
            rev(2, 10, 10, RevisionType::Modified, 2),
            rev(3, 10, 20, RevisionType::Deleted, 2),
        ];
        assert!(select_as_of(&revisions, at(30)).is_empty());

        let before_delete = select_as_of(&revisions, at(15));
        assert_eq!(before_delete.len(), 1);
        assert_eq!(before_delete[0].revision_id, 2);
    }

    #[test]
    fn test_boundary_is_inclusive() {
        let revisions = vec![rev(1, 10, 10, RevisionType::Created, 1)];
        assert_eq!(select_as_of(&revisions, at(10)).len(), 1);
        assert!(select_as_of(&revisions, at(9)).is_empty());
    }

    #[test]
    fn test_deletion_at_same_instant_excludes() {
        let revisions = vec![
            rev(1, 10, 0, RevisionType::Created, 1),
            rev(2, 10, 10, RevisionType::Deleted, 1),
        ];
        assert!(select_as_of(&revisions, at(10)).is_empty());
    }

    #[test]
    fn test_children_ordered_by_id() {
        let revisions = vec![
            rev(5, 30, 0, RevisionType::Created, 3),
            rev(4, 20, 0, RevisionType::Created, 2),
            rev(6, 10, 0, RevisionType::Created, 1),
        ];
        let ids: Vec<i64> = select_as_of(&revisions, at(1)).iter().map(|r| r.child_id).collect();
        assert_eq!(ids, vec![10, 20, 30]);
    }

    #[test]
    fn test_decode_payload() {
        let r = rev(1, 10, 0, RevisionType::Created, 42);
        let record: TagMapRecord = decode(&r).unwrap();
        assert_eq!(record.tag_id, 42);
    }
}
