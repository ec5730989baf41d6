//! Owned child rows and their append-only history.
//!
//! Components, code lists, codes and the tag/data-source maps are plain
//! mutable rows. Every insert or delete also writes a `child_revision` row
//! stamped with the transaction's `now`, which is what point-in-time
//! reconstruction reads back.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx::PgConnection;
use tracing::trace;

use conceptlib_core::as_of::{decode, select_as_of};
use conceptlib_core::{
    ChildKind, ChildRevision, ChildSet, Code, CodeListRecord, CodeListSnapshot, ComponentRecord, ComponentType,
    ComponentSnapshot, ConceptVersionKey, DataSourceMapRecord, EntityId, EntityRef, EntityType, Error,
    LogicalType, NewComponent, Result, RevisionType, TagId, TagMapRecord, UserId,
};

const COMPONENT_PARENT: &str = "component";
const CODE_LIST_PARENT: &str = "code_list";

/// Append one history row for an owned child.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn record_child<T: Serialize>(
    conn: &mut PgConnection,
    kind: ChildKind,
    child_id: i64,
    parent_type: &str,
    parent_id: i64,
    revision_type: RevisionType,
    payload: &T,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO child_revision
            (child_kind, child_id, parent_type, parent_id, revision_date, revision_type, payload)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(kind.as_str())
    .bind(child_id)
    .bind(parent_type)
    .bind(parent_id)
    .bind(now)
    .bind(revision_type.as_str())
    .bind(serde_json::to_value(payload)?)
    .execute(&mut *conn)
    .await
    .map_err(Error::Database)?;

    trace!(
        subsystem = "db",
        component = "children",
        op = "record",
        child_kind = kind.as_str(),
        child_id,
        parent_id,
        revision_type = revision_type.as_str(),
        "Child revision recorded"
    );
    Ok(())
}

// =============================================================================
// COMPONENTS
// =============================================================================

/// Insert a component with its code lists and codes.
pub(crate) async fn insert_component(
    conn: &mut PgConnection,
    concept_id: EntityId,
    component: &NewComponent,
    user_id: Option<UserId>,
    now: DateTime<Utc>,
) -> Result<i64> {
    let (ref_id, ref_history_id) = match component.concept_ref {
        Some(key) => (Some(key.concept_id), Some(key.revision_id)),
        None => (None, None),
    };

    let (component_id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO component
            (concept_id, name, component_type, logical_type, concept_ref_id, concept_ref_history_id,
             created_by, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING id
        "#,
    )
    .bind(concept_id)
    .bind(&component.name)
    .bind(component.component_type.as_i16())
    .bind(component.logical_type.as_i16())
    .bind(ref_id)
    .bind(ref_history_id)
    .bind(user_id)
    .bind(now)
    .fetch_one(&mut *conn)
    .await
    .map_err(Error::Database)?;

    let record = ComponentRecord {
        name: component.name.clone(),
        component_type: component.component_type,
        logical_type: component.logical_type,
        concept_ref_id: ref_id,
        concept_ref_history_id: ref_history_id,
    };
    record_child(
        conn,
        ChildKind::Component,
        component_id,
        EntityType::Concept.as_str(),
        concept_id,
        RevisionType::Created,
        &record,
        now,
    )
    .await?;

    for list in &component.code_lists {
        let (code_list_id,): (i64,) =
            sqlx::query_as("INSERT INTO code_list (component_id, description) VALUES ($1, $2) RETURNING id")
                .bind(component_id)
                .bind(&list.description)
                .fetch_one(&mut *conn)
                .await
                .map_err(Error::Database)?;
        let list_record = CodeListRecord {
            description: list.description.clone(),
        };
        record_child(
            conn,
            ChildKind::CodeList,
            code_list_id,
            COMPONENT_PARENT,
            component_id,
            RevisionType::Created,
            &list_record,
            now,
        )
        .await?;

        for code in &list.codes {
            let (code_id,): (i64,) = sqlx::query_as(
                "INSERT INTO code (code_list_id, code, description) VALUES ($1, $2, $3) RETURNING id",
            )
            .bind(code_list_id)
            .bind(&code.code)
            .bind(&code.description)
            .fetch_one(&mut *conn)
            .await
            .map_err(Error::Database)?;
            record_child(
                conn,
                ChildKind::Code,
                code_id,
                CODE_LIST_PARENT,
                code_list_id,
                RevisionType::Created,
                code,
                now,
            )
            .await?;
        }
    }
    Ok(component_id)
}

#[derive(sqlx::FromRow)]
struct ComponentRow {
    id: i64,
    name: String,
    component_type: i16,
    logical_type: i16,
    concept_ref_id: Option<i64>,
    concept_ref_history_id: Option<i64>,
}

impl ComponentRow {
    fn record(&self) -> Result<ComponentRecord> {
        Ok(ComponentRecord {
            name: self.name.clone(),
            component_type: ComponentType::from_i16(self.component_type)?,
            logical_type: LogicalType::from_i16(self.logical_type)?,
            concept_ref_id: self.concept_ref_id,
            concept_ref_history_id: self.concept_ref_history_id,
        })
    }
}

/// Delete one component of `concept_id`, recording deletions for the
/// component and everything under it.
pub(crate) async fn delete_component(
    conn: &mut PgConnection,
    concept_id: EntityId,
    component_id: i64,
    now: DateTime<Utc>,
) -> Result<()> {
    let row: Option<ComponentRow> = sqlx::query_as(
        "SELECT id, name, component_type, logical_type, concept_ref_id, concept_ref_history_id \
         FROM component WHERE id = $1 AND concept_id = $2",
    )
    .bind(component_id)
    .bind(concept_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(Error::Database)?;
    let row = row.ok_or_else(|| {
        Error::NotFound(format!("Component {} of concept C{}", component_id, concept_id))
    })?;

    let lists: Vec<(i64, Option<String>)> =
        sqlx::query_as("SELECT id, description FROM code_list WHERE component_id = $1 ORDER BY id")
            .bind(component_id)
            .fetch_all(&mut *conn)
            .await
            .map_err(Error::Database)?;

    for (code_list_id, description) in &lists {
        let codes: Vec<(i64, String, String)> =
            sqlx::query_as("SELECT id, code, description FROM code WHERE code_list_id = $1 ORDER BY id")
                .bind(code_list_id)
                .fetch_all(&mut *conn)
                .await
                .map_err(Error::Database)?;
        for (code_id, code, code_description) in codes {
            record_child(
                conn,
                ChildKind::Code,
                code_id,
                CODE_LIST_PARENT,
                *code_list_id,
                RevisionType::Deleted,
                &Code::new(code, code_description),
                now,
            )
            .await?;
        }
        let list_record = CodeListRecord {
            description: description.clone(),
        };
        record_child(
            conn,
            ChildKind::CodeList,
            *code_list_id,
            COMPONENT_PARENT,
            component_id,
            RevisionType::Deleted,
            &list_record,
            now,
        )
        .await?;
    }

    record_child(
        conn,
        ChildKind::Component,
        component_id,
        EntityType::Concept.as_str(),
        concept_id,
        RevisionType::Deleted,
        &row.record()?,
        now,
    )
    .await?;

    // Code lists and codes go with the component.
    sqlx::query("DELETE FROM component WHERE id = $1")
        .bind(row.id)
        .execute(&mut *conn)
        .await
        .map_err(Error::Database)?;
    Ok(())
}

/// Delete every live component of a concept.
pub(crate) async fn delete_all_components(
    conn: &mut PgConnection,
    concept_id: EntityId,
    now: DateTime<Utc>,
) -> Result<usize> {
    let ids: Vec<(i64,)> = sqlx::query_as("SELECT id FROM component WHERE concept_id = $1 ORDER BY id")
        .bind(concept_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(Error::Database)?;
    for (component_id,) in &ids {
        delete_component(conn, concept_id, *component_id, now).await?;
    }
    Ok(ids.len())
}

// =============================================================================
// TAG AND DATA SOURCE MAPS
// =============================================================================

/// Make the tag map of `entity` equal to `tags`.
pub(crate) async fn replace_tag_map(
    conn: &mut PgConnection,
    entity: EntityRef,
    tags: &BTreeSet<TagId>,
    user_id: Option<UserId>,
    now: DateTime<Utc>,
) -> Result<()> {
    let existing: Vec<(i64, i64)> =
        sqlx::query_as("SELECT id, tag_id FROM entity_tag_map WHERE entity_type = $1 AND entity_id = $2")
            .bind(entity.entity_type.as_str())
            .bind(entity.id)
            .fetch_all(&mut *conn)
            .await
            .map_err(Error::Database)?;

    for (row_id, tag_id) in &existing {
        if tags.contains(tag_id) {
            continue;
        }
        sqlx::query("DELETE FROM entity_tag_map WHERE id = $1")
            .bind(row_id)
            .execute(&mut *conn)
            .await
            .map_err(Error::Database)?;
        record_child(
            conn,
            ChildKind::TagMap,
            *row_id,
            entity.entity_type.as_str(),
            entity.id,
            RevisionType::Deleted,
            &TagMapRecord { tag_id: *tag_id },
            now,
        )
        .await?;
    }

    for tag_id in tags {
        if existing.iter().any(|(_, t)| t == tag_id) {
            continue;
        }
        let (row_id,): (i64,) = sqlx::query_as(
            "INSERT INTO entity_tag_map (entity_type, entity_id, tag_id, created_by, created_at) \
             VALUES ($1, $2, $3, $4, $5) RETURNING id",
        )
        .bind(entity.entity_type.as_str())
        .bind(entity.id)
        .bind(tag_id)
        .bind(user_id)
        .bind(now)
        .fetch_one(&mut *conn)
        .await
        .map_err(Error::Database)?;
        record_child(
            conn,
            ChildKind::TagMap,
            row_id,
            entity.entity_type.as_str(),
            entity.id,
            RevisionType::Created,
            &TagMapRecord { tag_id: *tag_id },
            now,
        )
        .await?;
    }
    Ok(())
}

/// Make the data source map of `entity` equal to `sources`.
pub(crate) async fn replace_data_sources(
    conn: &mut PgConnection,
    entity: EntityRef,
    sources: &BTreeSet<EntityId>,
    user_id: Option<UserId>,
    now: DateTime<Utc>,
) -> Result<()> {
    let existing: Vec<(i64, i64)> = sqlx::query_as(
        "SELECT id, data_source_id FROM entity_data_source_map WHERE entity_type = $1 AND entity_id = $2",
    )
    .bind(entity.entity_type.as_str())
    .bind(entity.id)
    .fetch_all(&mut *conn)
    .await
    .map_err(Error::Database)?;

    for (row_id, data_source_id) in &existing {
        if sources.contains(data_source_id) {
            continue;
        }
        sqlx::query("DELETE FROM entity_data_source_map WHERE id = $1")
            .bind(row_id)
            .execute(&mut *conn)
            .await
            .map_err(Error::Database)?;
        record_child(
            conn,
            ChildKind::DataSourceMap,
            *row_id,
            entity.entity_type.as_str(),
            entity.id,
            RevisionType::Deleted,
            &DataSourceMapRecord {
                data_source_id: *data_source_id,
            },
            now,
        )
        .await?;
    }

    for data_source_id in sources {
        if existing.iter().any(|(_, d)| d == data_source_id) {
            continue;
        }
        let (row_id,): (i64,) = sqlx::query_as(
            "INSERT INTO entity_data_source_map (entity_type, entity_id, data_source_id, created_by, created_at) \
             VALUES ($1, $2, $3, $4, $5) RETURNING id",
        )
        .bind(entity.entity_type.as_str())
        .bind(entity.id)
        .bind(data_source_id)
        .bind(user_id)
        .bind(now)
        .fetch_one(&mut *conn)
        .await
        .map_err(Error::Database)?;
        record_child(
            conn,
            ChildKind::DataSourceMap,
            row_id,
            entity.entity_type.as_str(),
            entity.id,
            RevisionType::Created,
            &DataSourceMapRecord {
                data_source_id: *data_source_id,
            },
            now,
        )
        .await?;
    }
    Ok(())
}

// =============================================================================
// POINT-IN-TIME READS
// =============================================================================

#[derive(sqlx::FromRow)]
struct ChildRevisionRow {
    revision_id: i64,
    child_kind: String,
    child_id: i64,
    parent_id: i64,
    revision_date: DateTime<Utc>,
    revision_type: String,
    payload: JsonValue,
}

impl TryFrom<ChildRevisionRow> for ChildRevision {
    type Error = Error;

    fn try_from(row: ChildRevisionRow) -> Result<Self> {
        Ok(ChildRevision {
            revision_id: row.revision_id,
            child_kind: row.child_kind.parse()?,
            child_id: row.child_id,
            parent_id: row.parent_id,
            revision_date: row.revision_date,
            revision_type: row.revision_type.parse()?,
            payload: row.payload,
        })
    }
}

/// History rows of one child kind under the given parents, up to `at`.
pub(crate) async fn load_child_revisions(
    conn: &mut PgConnection,
    kind: ChildKind,
    parent_type: &str,
    parent_ids: &[i64],
    at: DateTime<Utc>,
) -> Result<Vec<ChildRevision>> {
    if parent_ids.is_empty() {
        return Ok(Vec::new());
    }
    let rows: Vec<ChildRevisionRow> = sqlx::query_as(
        r#"
        SELECT revision_id, child_kind, child_id, parent_id, revision_date, revision_type, payload
        FROM child_revision
        WHERE child_kind = $1 AND parent_type = $2 AND parent_id = ANY($3) AND revision_date <= $4
        ORDER BY revision_id
        "#,
    )
    .bind(kind.as_str())
    .bind(parent_type)
    .bind(parent_ids)
    .bind(at)
    .fetch_all(&mut *conn)
    .await
    .map_err(Error::Database)?;
    rows.into_iter().map(ChildRevision::try_from).collect()
}

/// Components of a concept as they stood at `at`, ordered by component id.
pub(crate) async fn load_components(
    conn: &mut PgConnection,
    concept_id: EntityId,
    at: DateTime<Utc>,
) -> Result<Vec<ComponentSnapshot>> {
    let component_revs =
        load_child_revisions(conn, ChildKind::Component, EntityType::Concept.as_str(), &[concept_id], at).await?;
    let alive_components = select_as_of(&component_revs, at);
    if alive_components.is_empty() {
        return Ok(Vec::new());
    }

    let component_ids: Vec<i64> = alive_components.iter().map(|r| r.child_id).collect();
    let list_revs = load_child_revisions(conn, ChildKind::CodeList, COMPONENT_PARENT, &component_ids, at).await?;
    let alive_lists = select_as_of(&list_revs, at);

    let list_ids: Vec<i64> = alive_lists.iter().map(|r| r.child_id).collect();
    let code_revs = load_child_revisions(conn, ChildKind::Code, CODE_LIST_PARENT, &list_ids, at).await?;

    let mut codes_by_list: BTreeMap<i64, Vec<Code>> = BTreeMap::new();
    for rev in select_as_of(&code_revs, at) {
        codes_by_list.entry(rev.parent_id).or_default().push(decode::<Code>(rev)?);
    }

    let mut lists_by_component: BTreeMap<i64, Vec<CodeListSnapshot>> = BTreeMap::new();
    for rev in alive_lists {
        let record: CodeListRecord = decode(rev)?;
        lists_by_component.entry(rev.parent_id).or_default().push(CodeListSnapshot {
            code_list_id: rev.child_id,
            description: record.description,
            codes: codes_by_list.remove(&rev.child_id).unwrap_or_default(),
        });
    }

    let mut components = Vec::with_capacity(alive_components.len());
    for rev in alive_components {
        let record: ComponentRecord = decode(rev)?;
        let concept_ref = match (record.concept_ref_id, record.concept_ref_history_id) {
            (Some(concept_id), Some(revision_id)) => Some(ConceptVersionKey::new(concept_id, revision_id)),
            _ => None,
        };
        components.push(ComponentSnapshot {
            component_id: rev.child_id,
            name: record.name,
            component_type: record.component_type,
            logical_type: record.logical_type,
            concept_ref,
            code_lists: lists_by_component.remove(&rev.child_id).unwrap_or_default(),
        });
    }
    Ok(components)
}

/// Every owned child structure of `entity` as it stood at `at`.
pub(crate) async fn load_child_set(conn: &mut PgConnection, entity: EntityRef, at: DateTime<Utc>) -> Result<ChildSet> {
    let mut children = ChildSet::default();
    let parent_type = entity.entity_type.as_str();

    if entity.entity_type == EntityType::Concept {
        children.components = load_components(conn, entity.id, at).await?;
    }

    if crate::entities::has_tag_map(entity.entity_type) {
        let revs = load_child_revisions(conn, ChildKind::TagMap, parent_type, &[entity.id], at).await?;
        let mut tag_ids = select_as_of(&revs, at)
            .into_iter()
            .map(|rev| decode::<TagMapRecord>(rev).map(|r| r.tag_id))
            .collect::<Result<Vec<_>>>()?;
        tag_ids.sort_unstable();
        children.tag_ids = tag_ids;
    }

    if entity.entity_type == EntityType::Phenotype {
        let revs = load_child_revisions(conn, ChildKind::DataSourceMap, parent_type, &[entity.id], at).await?;
        let mut ids = select_as_of(&revs, at)
            .into_iter()
            .map(|rev| decode::<DataSourceMapRecord>(rev).map(|r| r.data_source_id))
            .collect::<Result<Vec<_>>>()?;
        ids.sort_unstable();
        children.data_source_ids = ids;
    }
    Ok(children)
}
