//! Snapshot reconstruction.
//!
//! A snapshot is the revision's field set plus every owned child as it
//! stood at the revision's timestamp. Display names are looked up against
//! current rows; they are cosmetic and not part of the revision.

use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use tracing::debug;

use conceptlib_core::{
    ChildSet, EntityBody, EntityRef, Error, Result, RevisionId, Snapshot, SnapshotReconstructor,
};

use crate::children;
use crate::entities;
use crate::revisions;

async fn lookup_name(conn: &mut PgConnection, sql: &str, id: Option<i64>) -> Result<Option<String>> {
    let Some(id) = id else {
        return Ok(None);
    };
    let row: Option<(String,)> = sqlx::query_as(sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(Error::Database)?;
    Ok(row.map(|(name,)| name))
}

/// Full snapshot of one revision, on an existing connection.
pub(crate) async fn reconstruct_on(
    conn: &mut PgConnection,
    entity: EntityRef,
    revision_id: RevisionId,
) -> Result<Snapshot> {
    let live = entities::fetch_live(conn, entity).await?;
    let revision = revisions::fetch_revision(conn, entity, revision_id).await?;
    let latest = revisions::require_latest_revision_id(conn, entity).await?;
    let children = children::load_child_set(conn, entity, revision.meta.revision_date).await?;

    let fields = &revision.fields;
    let owner_name = lookup_name(conn, "SELECT username FROM app_user WHERE id = $1", Some(fields.owner_id)).await?;
    let group_name = lookup_name(conn, "SELECT name FROM user_group WHERE id = $1", fields.group_id).await?;
    let revision_user_name = lookup_name(
        conn,
        "SELECT username FROM app_user WHERE id = $1",
        revision.meta.revision_user_id,
    )
    .await?;
    let coding_system_id = match fields.body {
        EntityBody::Concept { coding_system_id } => coding_system_id,
        _ => None,
    };
    let coding_system_name =
        lookup_name(conn, "SELECT name FROM coding_system WHERE id = $1", coding_system_id).await?;

    Ok(Snapshot {
        entity,
        entity_code: live.entity_code,
        is_latest: revision.meta.revision_id == latest,
        revision: revision.meta,
        fields: revision.fields,
        owner_name,
        group_name,
        revision_user_name,
        coding_system_name,
        children,
    })
}

/// PostgreSQL implementation of SnapshotReconstructor.
#[derive(Clone)]
pub struct PgSnapshotReconstructor {
    pool: PgPool,
}

impl PgSnapshotReconstructor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SnapshotReconstructor for PgSnapshotReconstructor {
    async fn reconstruct(&self, entity: EntityRef, revision_id: RevisionId) -> Result<Snapshot> {
        let start = Instant::now();
        let mut conn = self.pool.acquire().await.map_err(Error::Database)?;
        let snapshot = reconstruct_on(&mut conn, entity, revision_id).await?;

        debug!(
            subsystem = "db",
            component = "snapshots",
            op = "reconstruct",
            entity_type = entity.entity_type.as_str(),
            entity_id = entity.id,
            revision_id,
            component_count = snapshot.children.components.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Snapshot reconstructed"
        );
        Ok(snapshot)
    }

    async fn reconstruct_as_of(&self, entity: EntityRef, at: DateTime<Utc>) -> Result<ChildSet> {
        let mut conn = self.pool.acquire().await.map_err(Error::Database)?;
        // Unknown entities are NotFound, not an empty child set.
        entities::fetch_live(&mut conn, entity).await?;
        children::load_child_set(&mut conn, entity, at).await
    }
}
