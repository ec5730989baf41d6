//! Append-only revision store.
//!
//! Every save of a live entity appends one `entity_revision` row carrying
//! the full field snapshot. Rows are never updated except for
//! `change_reason`, which may be corrected in place.

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{PgConnection, PgPool};
use tracing::{debug, info};

use conceptlib_core::{
    ApprovalStatus, EntityFields, EntityRef, Error, Result, Revision, RevisionId, RevisionMeta,
    RevisionStore, RevisionSummary, RevisionType, UserId,
};

#[derive(Debug, sqlx::FromRow)]
struct RevisionRow {
    revision_id: i64,
    entity_type: String,
    entity_id: i64,
    revision_date: DateTime<Utc>,
    revision_user_id: Option<i64>,
    change_reason: Option<String>,
    revision_type: String,
    snapshot: JsonValue,
}

impl RevisionRow {
    fn meta(&self) -> Result<RevisionMeta> {
        Ok(RevisionMeta {
            entity: EntityRef::new(self.entity_type.parse()?, self.entity_id),
            revision_id: self.revision_id,
            revision_date: self.revision_date,
            revision_user_id: self.revision_user_id,
            change_reason: self.change_reason.clone(),
            revision_type: self.revision_type.parse()?,
        })
    }

    fn into_revision(self) -> Result<Revision> {
        let meta = self.meta()?;
        let fields: EntityFields = serde_json::from_value(self.snapshot)?;
        Ok(Revision { meta, fields })
    }
}

const REVISION_COLUMNS: &str = "revision_id, entity_type, entity_id, revision_date, \
     revision_user_id, change_reason, revision_type, snapshot";

/// Append one revision. `now` must be the timestamp shared by every row the
/// surrounding transaction writes.
pub(crate) async fn append_revision(
    conn: &mut PgConnection,
    entity: EntityRef,
    fields: &EntityFields,
    user_id: Option<UserId>,
    reason: Option<&str>,
    revision_type: RevisionType,
    now: DateTime<Utc>,
) -> Result<RevisionId> {
    let snapshot = serde_json::to_value(fields)?;
    let (revision_id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO entity_revision
            (entity_type, entity_id, revision_date, revision_user_id, change_reason, revision_type, snapshot)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING revision_id
        "#,
    )
    .bind(entity.entity_type.as_str())
    .bind(entity.id)
    .bind(now)
    .bind(user_id)
    .bind(reason)
    .bind(revision_type.as_str())
    .bind(snapshot)
    .fetch_one(&mut *conn)
    .await
    .map_err(Error::Database)?;

    debug!(
        subsystem = "db",
        component = "revisions",
        op = "append",
        entity_type = entity.entity_type.as_str(),
        entity_id = entity.id,
        revision_id,
        revision_type = revision_type.as_str(),
        "Revision appended"
    );
    Ok(revision_id)
}

/// Latest revision id of an entity, if it has any.
pub(crate) async fn latest_revision_id(conn: &mut PgConnection, entity: EntityRef) -> Result<Option<RevisionId>> {
    let row: Option<(Option<i64>,)> = sqlx::query_as(
        "SELECT MAX(revision_id) FROM entity_revision WHERE entity_type = $1 AND entity_id = $2",
    )
    .bind(entity.entity_type.as_str())
    .bind(entity.id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(Error::Database)?;
    Ok(row.and_then(|(id,)| id))
}

/// Latest revision id, failing with NotFound when the entity has none.
pub(crate) async fn require_latest_revision_id(conn: &mut PgConnection, entity: EntityRef) -> Result<RevisionId> {
    latest_revision_id(conn, entity)
        .await?
        .ok_or_else(|| Error::NotFound(format!("No revisions for {}", entity)))
}

/// One revision of an entity.
///
/// Distinguishes an unknown entity (NotFound) from an unknown revision of a
/// known entity (RevisionNotFound).
pub(crate) async fn fetch_revision(
    conn: &mut PgConnection,
    entity: EntityRef,
    revision_id: RevisionId,
) -> Result<Revision> {
    let sql = format!(
        "SELECT {} FROM entity_revision WHERE entity_type = $1 AND entity_id = $2 AND revision_id = $3",
        REVISION_COLUMNS
    );
    let row: Option<RevisionRow> = sqlx::query_as(&sql)
        .bind(entity.entity_type.as_str())
        .bind(entity.id)
        .bind(revision_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(Error::Database)?;

    match row {
        Some(row) => row.into_revision(),
        None => {
            if latest_revision_id(conn, entity).await?.is_none() {
                Err(Error::NotFound(format!("Entity {}", entity)))
            } else {
                Err(Error::RevisionNotFound {
                    entity,
                    revision_id,
                })
            }
        }
    }
}

/// Latest revision of an entity.
pub(crate) async fn fetch_latest_revision(conn: &mut PgConnection, entity: EntityRef) -> Result<Revision> {
    let revision_id = require_latest_revision_id(conn, entity).await?;
    fetch_revision(conn, entity, revision_id).await
}

/// Repository over the revision store.
#[derive(Clone)]
pub struct PgRevisionStore {
    pool: PgPool,
}

impl PgRevisionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl RevisionStore for PgRevisionStore {
    async fn list_revisions(&self, entity: EntityRef) -> Result<Vec<RevisionSummary>> {
        let sql = format!(
            "SELECT {} FROM entity_revision WHERE entity_type = $1 AND entity_id = $2 \
             ORDER BY revision_id DESC",
            REVISION_COLUMNS
        );
        let rows: Vec<RevisionRow> = sqlx::query_as(&sql)
            .bind(entity.entity_type.as_str())
            .bind(entity.id)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;

        if rows.is_empty() {
            return Err(Error::NotFound(format!("Entity {}", entity)));
        }

        let statuses: Vec<(i64, i16)> = sqlx::query_as(
            "SELECT revision_id, status FROM publication WHERE entity_type = $1 AND entity_id = $2",
        )
        .bind(entity.entity_type.as_str())
        .bind(entity.id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let latest = rows[0].revision_id;
        let mut summaries = Vec::with_capacity(rows.len());
        for row in rows {
            let approval_status = match statuses.iter().find(|(id, _)| *id == row.revision_id) {
                Some((_, status)) => Some(ApprovalStatus::from_i16(*status)?),
                None => None,
            };
            let is_latest = row.revision_id == latest;
            let revision = row.into_revision()?;
            summaries.push(RevisionSummary {
                meta: revision.meta,
                name: revision.fields.name,
                is_latest,
                approval_status,
            });
        }
        Ok(summaries)
    }

    async fn get_revision(&self, entity: EntityRef, revision_id: RevisionId) -> Result<Revision> {
        let mut conn = self.pool.acquire().await.map_err(Error::Database)?;
        fetch_revision(&mut conn, entity, revision_id).await
    }

    async fn latest_revision_id(&self, entity: EntityRef) -> Result<RevisionId> {
        let mut conn = self.pool.acquire().await.map_err(Error::Database)?;
        require_latest_revision_id(&mut conn, entity).await
    }

    async fn update_change_reason(
        &self,
        entity: EntityRef,
        revision_id: RevisionId,
        reason: &str,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE entity_revision SET change_reason = $4 \
             WHERE entity_type = $1 AND entity_id = $2 AND revision_id = $3",
        )
        .bind(entity.entity_type.as_str())
        .bind(entity.id)
        .bind(revision_id)
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::RevisionNotFound {
                entity,
                revision_id,
            });
        }

        info!(
            subsystem = "db",
            component = "revisions",
            op = "update_change_reason",
            entity_type = entity.entity_type.as_str(),
            entity_id = entity.id,
            revision_id,
            "Change reason corrected"
        );
        Ok(())
    }

    async fn diff_revisions(&self, entity: EntityRef, from: RevisionId, to: RevisionId) -> Result<String> {
        let mut conn = self.pool.acquire().await.map_err(Error::Database)?;
        let from_rev = fetch_revision(&mut conn, entity, from).await?;
        let to_rev = fetch_revision(&mut conn, entity, to).await?;
        render_diff(&from_rev, &to_rev)
    }
}

/// Unified diff of two revisions' pretty-printed field snapshots.
pub fn render_diff(from: &Revision, to: &Revision) -> Result<String> {
    let from_text = serde_json::to_string_pretty(&from.fields)? + "\n";
    let to_text = serde_json::to_string_pretty(&to.fields)? + "\n";

    let diff = similar::TextDiff::from_lines(&from_text, &to_text);
    let mut output = String::new();
    output.push_str(&format!("--- revision {}\n", from.meta.revision_id));
    output.push_str(&format!("+++ revision {}\n", to.meta.revision_id));

    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            similar::ChangeTag::Delete => "-",
            similar::ChangeTag::Insert => "+",
            similar::ChangeTag::Equal => " ",
        };
        output.push_str(&format!("{}{}", sign, change));
    }
    Ok(output)
}
