//! Live entity rows and the entity lifecycle.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{PgConnection, PgPool};
use tracing::{debug, info};

use conceptlib_core::{
    entity_code, AccessContext, AccessLevel, CoreConfig, Entity, EntityBody, EntityFields,
    EntityFilter, EntityId, EntityRef, EntityRepository, EntityType, Error, Result, RevisionId,
    RevisionType, SaveOptions, TagId, TagType, UserId,
};

use crate::children;
use crate::entity_filter::{EntityFilterQueryBuilder, QueryParam};
use crate::permissions::PgPermissionResolver;
use crate::revisions;

/// Candidate rows fetched per round while filling a listing page.
const LIST_BATCH_SIZE: i64 = 100;

// =============================================================================
// ROW MAPPING
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct EntityRow {
    entity_type: String,
    id: i64,
    entity_code: String,
    name: String,
    author: String,
    description: Option<String>,
    metadata: JsonValue,
    owner_id: i64,
    group_id: Option<i64>,
    owner_access: i16,
    group_access: i16,
    world_access: i16,
    is_deleted: bool,
    deleted_by: Option<i64>,
    deleted_at: Option<DateTime<Utc>>,
    tags: Vec<i64>,
    collections: Vec<i64>,
    created_by: Option<i64>,
    created_at: DateTime<Utc>,
    updated_by: Option<i64>,
    updated_at: Option<DateTime<Utc>>,
    body: JsonValue,
}

impl TryFrom<EntityRow> for Entity {
    type Error = Error;

    fn try_from(row: EntityRow) -> Result<Self> {
        let entity_type: EntityType = row.entity_type.parse()?;
        let body: EntityBody = serde_json::from_value(row.body)?;
        if body.entity_type() != entity_type {
            return Err(Error::Internal(format!(
                "Body of {}{} holds a {}",
                entity_type,
                row.id,
                body.entity_type()
            )));
        }
        Ok(Entity {
            entity: EntityRef::new(entity_type, row.id),
            entity_code: row.entity_code,
            fields: EntityFields {
                name: row.name,
                author: row.author,
                description: row.description,
                metadata: row.metadata,
                owner_id: row.owner_id,
                group_id: row.group_id,
                owner_access: AccessLevel::from_i16(row.owner_access)?,
                group_access: AccessLevel::from_i16(row.group_access)?,
                world_access: AccessLevel::from_i16(row.world_access)?,
                is_deleted: row.is_deleted,
                deleted_by: row.deleted_by,
                deleted_at: row.deleted_at,
                tags: row.tags,
                collections: row.collections,
                created_by: row.created_by,
                created_at: row.created_at,
                updated_by: row.updated_by,
                updated_at: row.updated_at,
                body,
            },
        })
    }
}

pub(crate) const ENTITY_COLUMNS: &str = "e.entity_type, e.id, e.entity_code, e.name, e.author, \
     e.description, e.metadata, e.owner_id, e.group_id, e.owner_access, e.group_access, \
     e.world_access, e.is_deleted, e.deleted_by, e.deleted_at, e.tags, e.collections, \
     e.created_by, e.created_at, e.updated_by, e.updated_at, e.body";

async fn fetch_row(conn: &mut PgConnection, entity: EntityRef, for_update: bool) -> Result<Entity> {
    let sql = format!(
        "SELECT {} FROM entity e WHERE e.entity_type = $1 AND e.id = $2{}",
        ENTITY_COLUMNS,
        if for_update { " FOR UPDATE" } else { "" }
    );
    let row: Option<EntityRow> = sqlx::query_as(&sql)
        .bind(entity.entity_type.as_str())
        .bind(entity.id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(Error::Database)?;
    row.ok_or_else(|| Error::NotFound(format!("Entity {}", entity)))?
        .try_into()
}

/// The live row of an entity.
pub(crate) async fn fetch_live(conn: &mut PgConnection, entity: EntityRef) -> Result<Entity> {
    fetch_row(conn, entity, false).await
}

/// The live row, locked until the transaction ends.
pub(crate) async fn lock_live(conn: &mut PgConnection, entity: EntityRef) -> Result<Entity> {
    fetch_row(conn, entity, true).await
}

/// Allocate the next id from the type's sequence.
pub(crate) async fn allocate_id(conn: &mut PgConnection, entity_type: EntityType) -> Result<EntityId> {
    let (id,): (i64,) = sqlx::query_as("SELECT nextval($1::regclass)")
        .bind(entity_type.id_sequence())
        .fetch_one(&mut *conn)
        .await
        .map_err(Error::Database)?;
    Ok(id)
}

pub(crate) async fn insert_live(conn: &mut PgConnection, entity: EntityRef, fields: &EntityFields) -> Result<String> {
    let code = entity_code(entity.entity_type, entity.id);
    sqlx::query(
        r#"
        INSERT INTO entity (
            entity_type, id, entity_code, name, author, description, metadata,
            owner_id, group_id, owner_access, group_access, world_access,
            is_deleted, deleted_by, deleted_at, tags, collections,
            created_by, created_at, updated_by, updated_at, body
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                $13, $14, $15, $16, $17, $18, $19, $20, $21, $22)
        "#,
    )
    .bind(entity.entity_type.as_str())
    .bind(entity.id)
    .bind(&code)
    .bind(&fields.name)
    .bind(&fields.author)
    .bind(&fields.description)
    .bind(&fields.metadata)
    .bind(fields.owner_id)
    .bind(fields.group_id)
    .bind(fields.owner_access.as_i16())
    .bind(fields.group_access.as_i16())
    .bind(fields.world_access.as_i16())
    .bind(fields.is_deleted)
    .bind(fields.deleted_by)
    .bind(fields.deleted_at)
    .bind(&fields.tags)
    .bind(&fields.collections)
    .bind(fields.created_by)
    .bind(fields.created_at)
    .bind(fields.updated_by)
    .bind(fields.updated_at)
    .bind(serde_json::to_value(&fields.body)?)
    .execute(&mut *conn)
    .await
    .map_err(Error::Database)?;
    Ok(code)
}

pub(crate) async fn update_live(conn: &mut PgConnection, entity: EntityRef, fields: &EntityFields) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE entity SET
            name = $3, author = $4, description = $5, metadata = $6,
            owner_id = $7, group_id = $8, owner_access = $9, group_access = $10, world_access = $11,
            is_deleted = $12, deleted_by = $13, deleted_at = $14, tags = $15, collections = $16,
            created_by = $17, created_at = $18, updated_by = $19, updated_at = $20, body = $21
        WHERE entity_type = $1 AND id = $2
        "#,
    )
    .bind(entity.entity_type.as_str())
    .bind(entity.id)
    .bind(&fields.name)
    .bind(&fields.author)
    .bind(&fields.description)
    .bind(&fields.metadata)
    .bind(fields.owner_id)
    .bind(fields.group_id)
    .bind(fields.owner_access.as_i16())
    .bind(fields.group_access.as_i16())
    .bind(fields.world_access.as_i16())
    .bind(fields.is_deleted)
    .bind(fields.deleted_by)
    .bind(fields.deleted_at)
    .bind(&fields.tags)
    .bind(&fields.collections)
    .bind(fields.created_by)
    .bind(fields.created_at)
    .bind(fields.updated_by)
    .bind(fields.updated_at)
    .bind(serde_json::to_value(&fields.body)?)
    .execute(&mut *conn)
    .await
    .map_err(Error::Database)?;

    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("Entity {}", entity)));
    }
    Ok(())
}

/// Whether the type keeps a relational tag map next to its `tags` field.
pub(crate) fn has_tag_map(entity_type: EntityType) -> bool {
    matches!(entity_type, EntityType::Phenotype | EntityType::WorkingSet)
}

/// Tags of the given type among `ids`.
async fn existing_tags(conn: &mut PgConnection, ids: &[TagId], tag_type: Option<TagType>) -> Result<BTreeSet<TagId>> {
    let rows: Vec<(i64, i16)> = sqlx::query_as("SELECT id, tag_type FROM tag WHERE id = ANY($1)")
        .bind(ids)
        .fetch_all(&mut *conn)
        .await
        .map_err(Error::Database)?;
    let mut found = BTreeSet::new();
    for (id, raw_type) in rows {
        if tag_type.map_or(true, |t| TagType::from_i16(raw_type).map_or(false, |rt| rt == t)) {
            found.insert(id);
        }
    }
    Ok(found)
}

fn authenticated(ctx: &AccessContext) -> Result<UserId> {
    ctx.actor
        .user_id()
        .ok_or_else(|| Error::PermissionDenied("Sign in to change entries".to_string()))
}

// =============================================================================
// REPOSITORY
// =============================================================================

/// PostgreSQL implementation of EntityRepository.
#[derive(Clone)]
pub struct PgEntityRepository {
    pool: PgPool,
    config: Arc<CoreConfig>,
    permissions: PgPermissionResolver,
}

impl PgEntityRepository {
    pub fn new(pool: PgPool, config: Arc<CoreConfig>, permissions: PgPermissionResolver) -> Self {
        Self {
            pool,
            config,
            permissions,
        }
    }

    /// Lock the live row and check that the actor may change it.
    async fn lock_for_edit(&self, conn: &mut PgConnection, ctx: &AccessContext, entity: EntityRef) -> Result<Entity> {
        let live = lock_live(conn, entity).await?;
        self.permissions.require_edit(conn, ctx, &live).await?;
        Ok(live)
    }

    /// Apply a field change under lock and record one revision.
    async fn commit_change(
        &self,
        ctx: &AccessContext,
        entity: EntityRef,
        reason: Option<&str>,
        revision_type: RevisionType,
        change: impl FnOnce(&mut EntityFields, UserId, DateTime<Utc>) -> Result<()> + Send,
    ) -> Result<RevisionId> {
        let user_id = authenticated(ctx)?;
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let live = self.lock_for_edit(&mut tx, ctx, entity).await?;
        let now = Utc::now();

        let mut fields = live.fields;
        change(&mut fields, user_id, now)?;
        fields.updated_by = Some(user_id);
        fields.updated_at = Some(now);

        update_live(&mut tx, entity, &fields).await?;
        let revision_id =
            revisions::append_revision(&mut tx, entity, &fields, Some(user_id), reason, revision_type, now).await?;
        tx.commit().await.map_err(Error::Database)?;
        Ok(revision_id)
    }
}

#[async_trait]
impl EntityRepository for PgEntityRepository {
    async fn create(&self, ctx: &AccessContext, mut fields: EntityFields, reason: Option<&str>) -> Result<Entity> {
        let user_id = authenticated(ctx)?;
        if self.config.read_only {
            return Err(Error::PermissionDenied("The library is in read-only mode".to_string()));
        }
        fields.validate()?;

        let entity_type = fields.entity_type();
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let now = Utc::now();
        let id = allocate_id(&mut tx, entity_type).await?;
        let entity = EntityRef::new(entity_type, id);

        fields.owner_id = user_id;
        fields.created_by = Some(user_id);
        fields.created_at = now;
        fields.updated_by = None;
        fields.updated_at = None;
        fields.is_deleted = false;
        fields.deleted_by = None;
        fields.deleted_at = None;

        let code = insert_live(&mut tx, entity, &fields).await?;
        if has_tag_map(entity_type) && !fields.tags.is_empty() {
            let tags: BTreeSet<TagId> = fields.tags.iter().copied().collect();
            children::replace_tag_map(&mut tx, entity, &tags, Some(user_id), now).await?;
        }
        let revision_id =
            revisions::append_revision(&mut tx, entity, &fields, Some(user_id), reason, RevisionType::Created, now)
                .await?;
        tx.commit().await.map_err(Error::Database)?;

        info!(
            subsystem = "db",
            component = "entities",
            op = "create",
            entity_type = entity_type.as_str(),
            entity_id = id,
            revision_id,
            actor_id = user_id,
            "Entity created"
        );
        Ok(Entity {
            entity,
            entity_code: code,
            fields,
        })
    }

    async fn fetch(&self, entity: EntityRef) -> Result<Entity> {
        let mut conn = self.pool.acquire().await.map_err(Error::Database)?;
        fetch_live(&mut conn, entity).await
    }

    async fn save(
        &self,
        ctx: &AccessContext,
        entity: EntityRef,
        mut fields: EntityFields,
        options: SaveOptions,
    ) -> Result<Option<RevisionId>> {
        let user_id = authenticated(ctx)?;
        if fields.entity_type() != entity.entity_type {
            return Err(Error::InvalidInput(format!(
                "Cannot save {} fields onto {}",
                fields.entity_type(),
                entity
            )));
        }
        fields.validate()?;

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let live = self.lock_for_edit(&mut tx, ctx, entity).await?;
        if live.fields.is_deleted {
            return Err(Error::PermissionDenied(format!("{} is deleted", entity)));
        }

        let latest = revisions::require_latest_revision_id(&mut tx, entity).await?;
        options.check_stale(self.config.concurrency_policy, latest)?;

        if fields.owner_id != live.fields.owner_id
            && !ctx.actor.is_superuser()
            && ctx.actor.user_id() != Some(live.fields.owner_id)
        {
            return Err(Error::validation("owner_id", "Only the owner can transfer ownership"));
        }

        let now = Utc::now();
        fields.created_by = live.fields.created_by;
        fields.created_at = live.fields.created_at;
        fields.is_deleted = live.fields.is_deleted;
        fields.deleted_by = live.fields.deleted_by;
        fields.deleted_at = live.fields.deleted_at;
        fields.updated_by = Some(user_id);
        fields.updated_at = Some(now);

        if has_tag_map(entity.entity_type) && fields.tags != live.fields.tags {
            let tags: BTreeSet<TagId> = fields.tags.iter().copied().collect();
            children::replace_tag_map(&mut tx, entity, &tags, Some(user_id), now).await?;
        }

        update_live(&mut tx, entity, &fields).await?;
        let revision_id = if options.record_history {
            Some(
                revisions::append_revision(
                    &mut tx,
                    entity,
                    &fields,
                    Some(user_id),
                    options.reason.as_deref(),
                    RevisionType::Modified,
                    now,
                )
                .await?,
            )
        } else {
            None
        };
        tx.commit().await.map_err(Error::Database)?;

        info!(
            subsystem = "db",
            component = "entities",
            op = "save",
            entity_type = entity.entity_type.as_str(),
            entity_id = entity.id,
            revision_id = ?revision_id,
            actor_id = user_id,
            "Entity saved"
        );
        Ok(revision_id)
    }

    async fn soft_delete(&self, ctx: &AccessContext, entity: EntityRef, reason: Option<&str>) -> Result<RevisionId> {
        let revision_id = self
            .commit_change(ctx, entity, reason, RevisionType::Deleted, |fields, user_id, now| {
                if fields.is_deleted {
                    return Err(Error::InvalidInput("Entity is already deleted".to_string()));
                }
                fields.is_deleted = true;
                fields.deleted_by = Some(user_id);
                fields.deleted_at = Some(now);
                Ok(())
            })
            .await?;

        info!(
            subsystem = "db",
            component = "entities",
            op = "soft_delete",
            entity_type = entity.entity_type.as_str(),
            entity_id = entity.id,
            revision_id,
            "Entity deleted"
        );
        Ok(revision_id)
    }

    async fn restore(&self, ctx: &AccessContext, entity: EntityRef, reason: Option<&str>) -> Result<RevisionId> {
        let revision_id = self
            .commit_change(ctx, entity, reason, RevisionType::Modified, |fields, _, _| {
                if !fields.is_deleted {
                    return Err(Error::InvalidInput("Entity is not deleted".to_string()));
                }
                fields.is_deleted = false;
                fields.deleted_by = None;
                fields.deleted_at = None;
                Ok(())
            })
            .await?;

        info!(
            subsystem = "db",
            component = "entities",
            op = "restore",
            entity_type = entity.entity_type.as_str(),
            entity_id = entity.id,
            revision_id,
            "Entity restored"
        );
        Ok(revision_id)
    }

    async fn set_tag_map(
        &self,
        ctx: &AccessContext,
        entity: EntityRef,
        tag_ids: &[TagId],
        reason: Option<&str>,
    ) -> Result<RevisionId> {
        if !has_tag_map(entity.entity_type) {
            return Err(Error::InvalidInput(format!("{} has no tag map", entity.entity_type)));
        }
        let user_id = authenticated(ctx)?;
        let requested: BTreeSet<TagId> = tag_ids.iter().copied().collect();

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let known = existing_tags(&mut tx, tag_ids, None).await?;
        if let Some(missing) = requested.iter().find(|id| !known.contains(id)) {
            return Err(Error::validation("tags", format!("Unknown tag {}", missing)));
        }

        let live = self.lock_for_edit(&mut tx, ctx, entity).await?;
        if live.fields.is_deleted {
            return Err(Error::PermissionDenied(format!("{} is deleted", entity)));
        }
        let now = Utc::now();
        children::replace_tag_map(&mut tx, entity, &requested, Some(user_id), now).await?;

        let mut fields = live.fields;
        fields.tags = requested.into_iter().collect();
        fields.updated_by = Some(user_id);
        fields.updated_at = Some(now);
        update_live(&mut tx, entity, &fields).await?;
        let revision_id =
            revisions::append_revision(&mut tx, entity, &fields, Some(user_id), reason, RevisionType::Modified, now)
                .await?;
        tx.commit().await.map_err(Error::Database)?;

        debug!(
            subsystem = "db",
            component = "entities",
            op = "set_tag_map",
            entity_id = entity.id,
            revision_id,
            tag_count = fields.tags.len(),
            "Tag map replaced"
        );
        Ok(revision_id)
    }

    async fn set_data_sources(
        &self,
        ctx: &AccessContext,
        entity: EntityRef,
        data_source_ids: &[EntityId],
        reason: Option<&str>,
    ) -> Result<RevisionId> {
        if entity.entity_type != EntityType::Phenotype {
            return Err(Error::InvalidInput("Only phenotypes link data sources".to_string()));
        }
        let user_id = authenticated(ctx)?;
        let requested: BTreeSet<EntityId> = data_source_ids.iter().copied().collect();

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let known: Vec<(i64,)> =
            sqlx::query_as("SELECT id FROM entity WHERE entity_type = 'data_source' AND id = ANY($1)")
                .bind(data_source_ids)
                .fetch_all(&mut *tx)
                .await
                .map_err(Error::Database)?;
        if let Some(missing) = requested.iter().find(|id| !known.iter().any(|(k,)| k == *id)) {
            return Err(Error::validation("data_sources", format!("Unknown data source {}", missing)));
        }

        let live = self.lock_for_edit(&mut tx, ctx, entity).await?;
        if live.fields.is_deleted {
            return Err(Error::PermissionDenied(format!("{} is deleted", entity)));
        }
        let now = Utc::now();
        children::replace_data_sources(&mut tx, entity, &requested, Some(user_id), now).await?;

        let mut fields = live.fields;
        fields.updated_by = Some(user_id);
        fields.updated_at = Some(now);
        update_live(&mut tx, entity, &fields).await?;
        let revision_id =
            revisions::append_revision(&mut tx, entity, &fields, Some(user_id), reason, RevisionType::Modified, now)
                .await?;
        tx.commit().await.map_err(Error::Database)?;
        Ok(revision_id)
    }

    async fn list(
        &self,
        ctx: &AccessContext,
        filter: &EntityFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Entity>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.pool.acquire().await.map_err(Error::Database)?;
        let known_tags = existing_tags(&mut conn, &filter.any_tags, Some(TagType::Tag)).await?;
        let known_collections =
            existing_tags(&mut conn, &filter.any_collections, Some(TagType::Collection)).await?;
        let compiled = filter.compile(&known_tags, &known_collections)?;

        let (where_clause, params) = EntityFilterQueryBuilder::new(&compiled, 0).build();
        let sql = format!(
            "SELECT {} FROM entity e WHERE {} ORDER BY e.created_at DESC, e.id DESC LIMIT ${} OFFSET ${}",
            ENTITY_COLUMNS,
            where_clause,
            params.len() + 1,
            params.len() + 2
        );

        // `limit` and `offset` count visible rows, so candidates are scanned
        // in batches until the page is full or the filter is exhausted.
        let batch = limit.max(LIST_BATCH_SIZE);
        let mut visible = Vec::new();
        let mut skipped = 0i64;
        let mut scanned = 0i64;
        'scan: loop {
            let mut q = sqlx::query_as::<_, EntityRow>(&sql);
            for param in &params {
                q = match param {
                    QueryParam::BigInt(v) => q.bind(v),
                    QueryParam::BigIntArray(v) => q.bind(v),
                    QueryParam::Timestamp(v) => q.bind(v),
                    QueryParam::String(v) => q.bind(v),
                };
            }
            let rows = q
                .bind(batch)
                .bind(scanned)
                .fetch_all(&mut *conn)
                .await
                .map_err(Error::Database)?;
            let exhausted = (rows.len() as i64) < batch;
            scanned += rows.len() as i64;

            for row in rows {
                let entity = Entity::try_from(row)?;
                let allowed = match self.permissions.view_decision(&mut conn, ctx, entity.entity, None).await {
                    Ok(decision) => decision.is_allowed(),
                    Err(e) if e.is_not_found() => false,
                    Err(e) => return Err(e),
                };
                if !allowed {
                    continue;
                }
                if skipped < offset {
                    skipped += 1;
                    continue;
                }
                visible.push(entity);
                if visible.len() as i64 >= limit {
                    break 'scan;
                }
            }
            if exhausted {
                break;
            }
        }

        debug!(
            subsystem = "db",
            component = "entities",
            op = "list",
            actor_id = ?ctx.actor.user_id(),
            scanned,
            result_count = visible.len(),
            "Entities listed"
        );
        Ok(visible)
    }
}
