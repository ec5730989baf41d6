//! Publication workflow persistence.
//!
//! Each transition runs in one transaction holding a lock on the live
//! entity row and on the affected publication records. Owners are
//! notified only after the transaction commits; a failed dispatch is
//! logged and never undoes the transition.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use tracing::{info, warn};

use conceptlib_core::publication::{authorize, authorize_review_queue, ensure_publishable_content, next_status};
use conceptlib_core::{
    AccessContext, ApprovalStatus, ConceptVersionKey, CoreConfig, Entity, EntityId, EntityRef, EntityType, Error,
    Notification, Notifier, PublicationRecord, PublicationRepository, PublishAction, Result, Revision, RevisionId,
    UserId,
};

use crate::entities;
use crate::graph;
use crate::permissions::{self, PgPermissionResolver};
use crate::revisions;

#[derive(Debug, sqlx::FromRow)]
struct PublicationRow {
    id: i64,
    entity_type: String,
    entity_id: i64,
    revision_id: i64,
    status: i16,
    moderator_id: Option<i64>,
    created_by: Option<i64>,
    created_at: DateTime<Utc>,
    modified_at: Option<DateTime<Utc>>,
    code_count: Option<i64>,
    message: Option<String>,
}

impl TryFrom<PublicationRow> for PublicationRecord {
    type Error = Error;

    fn try_from(row: PublicationRow) -> Result<Self> {
        Ok(PublicationRecord {
            id: row.id,
            entity: EntityRef::new(row.entity_type.parse()?, row.entity_id),
            revision_id: row.revision_id,
            status: ApprovalStatus::from_i16(row.status)?,
            moderator_id: row.moderator_id,
            created_by: row.created_by,
            created_at: row.created_at,
            modified_at: row.modified_at,
            code_count: row.code_count,
            message: row.message,
        })
    }
}

const PUBLICATION_COLUMNS: &str = "id, entity_type, entity_id, revision_id, status, moderator_id, \
     created_by, created_at, modified_at, code_count, message";

/// The publication record of one revision, optionally locked.
async fn fetch_record(
    conn: &mut PgConnection,
    entity: EntityRef,
    revision_id: RevisionId,
    for_update: bool,
) -> Result<Option<PublicationRecord>> {
    let sql = format!(
        "SELECT {} FROM publication WHERE entity_type = $1 AND entity_id = $2 AND revision_id = $3{}",
        PUBLICATION_COLUMNS,
        if for_update { " FOR UPDATE" } else { "" }
    );
    let row: Option<PublicationRow> = sqlx::query_as(&sql)
        .bind(entity.entity_type.as_str())
        .bind(entity.id)
        .bind(revision_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(Error::Database)?;
    row.map(PublicationRecord::try_from).transpose()
}

async fn set_status(
    conn: &mut PgConnection,
    record_id: i64,
    status: ApprovalStatus,
    moderator_id: Option<UserId>,
    message: Option<&str>,
    now: DateTime<Utc>,
) -> Result<PublicationRecord> {
    let sql = format!(
        "UPDATE publication SET status = $2, moderator_id = $3, message = $4, modified_at = $5 \
         WHERE id = $1 RETURNING {}",
        PUBLICATION_COLUMNS
    );
    let row: PublicationRow = sqlx::query_as(&sql)
        .bind(record_id)
        .bind(status.as_i16())
        .bind(moderator_id)
        .bind(message)
        .bind(now)
        .fetch_one(&mut *conn)
        .await
        .map_err(Error::Database)?;
    row.try_into()
}

/// PostgreSQL implementation of PublicationRepository.
#[derive(Clone)]
pub struct PgPublicationRepository {
    pool: PgPool,
    config: Arc<CoreConfig>,
    permissions: PgPermissionResolver,
    notifier: Arc<dyn Notifier>,
}

impl PgPublicationRepository {
    pub fn new(
        pool: PgPool,
        config: Arc<CoreConfig>,
        permissions: PgPermissionResolver,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            pool,
            config,
            permissions,
            notifier,
        }
    }

    /// Number of codes (concepts) or resolvable concept references (other
    /// types) in a revision.
    async fn resolvable_content(&self, conn: &mut PgConnection, revision: &Revision) -> Result<usize> {
        let entity = revision.meta.entity;
        if entity.entity_type == EntityType::Concept {
            let key = ConceptVersionKey::new(entity.id, revision.meta.revision_id);
            return Ok(graph::collect_codes_on(conn, key, self.config.max_graph_depth).await?.len());
        }

        let mut resolvable = 0;
        for key in revision.fields.body.concept_keys() {
            match revisions::fetch_revision(conn, EntityRef::concept(key.concept_id), key.revision_id).await {
                Ok(_) => resolvable += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(resolvable)
    }

    /// Tell the owner about a finished transition. Never fails.
    async fn notify_owner(&self, live: &Entity, record: &PublicationRecord) {
        let email: Option<String> = match sqlx::query_as::<_, (Option<String>,)>(
            "SELECT email FROM app_user WHERE id = $1",
        )
        .bind(live.fields.owner_id)
        .fetch_optional(&self.pool)
        .await
        {
            Ok(row) => row.and_then(|(email,)| email),
            Err(e) => {
                warn!(
                    subsystem = "db",
                    component = "publication",
                    op = "notify",
                    entity_id = live.entity.id,
                    error = %e,
                    "Owner email lookup failed, notifying without address"
                );
                None
            }
        };

        self.notifier.send_notification(Notification::publication(
            live.fields.owner_id,
            email,
            live.entity,
            &live.fields.name,
            record.revision_id,
            record.status,
            record.message.as_deref(),
        ));
    }

    fn actor_id(ctx: &AccessContext) -> Result<UserId> {
        ctx.actor
            .user_id()
            .ok_or_else(|| Error::PermissionDenied("Sign in to change publication state".to_string()))
    }
}

#[async_trait]
impl PublicationRepository for PgPublicationRepository {
    async fn is_published(&self, entity: EntityRef, revision_id: RevisionId) -> Result<bool> {
        let status = self.approval_status(entity, revision_id).await?;
        Ok(permissions::status_is_published(entity.entity_type, status))
    }

    async fn approval_status(&self, entity: EntityRef, revision_id: RevisionId) -> Result<Option<ApprovalStatus>> {
        let mut conn = self.pool.acquire().await.map_err(Error::Database)?;
        revisions::fetch_revision(&mut conn, entity, revision_id).await?;
        permissions::revision_status(&mut conn, entity, revision_id).await
    }

    async fn request_publication(
        &self,
        ctx: &AccessContext,
        entity: EntityRef,
        revision_id: RevisionId,
    ) -> Result<PublicationRecord> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let live = entities::lock_live(&mut tx, entity).await?;
        let can_edit = self.permissions.edit_decision(&mut tx, ctx, &live).await?.is_allowed();
        authorize(PublishAction::Request, &ctx.actor, can_edit, live.fields.is_deleted)?;
        let user_id = Self::actor_id(ctx)?;

        let revision = revisions::fetch_revision(&mut tx, entity, revision_id).await?;
        let current = fetch_record(&mut tx, entity, revision_id, true).await?;
        let status = next_status(entity.entity_type, current.as_ref().map(|r| r.status), PublishAction::Request)?;

        let resolvable = self.resolvable_content(&mut tx, &revision).await?;
        ensure_publishable_content(entity.entity_type, resolvable)?;

        let now = Utc::now();
        let record = match current {
            Some(existing) => set_status(&mut tx, existing.id, status, None, None, now).await?,
            None => {
                let code_count = (entity.entity_type == EntityType::Concept).then_some(resolvable as i64);
                let sql = format!(
                    "INSERT INTO publication \
                     (entity_type, entity_id, revision_id, status, created_by, created_at, code_count) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING {}",
                    PUBLICATION_COLUMNS
                );
                let row: PublicationRow = sqlx::query_as(&sql)
                    .bind(entity.entity_type.as_str())
                    .bind(entity.id)
                    .bind(revision_id)
                    .bind(status.as_i16())
                    .bind(user_id)
                    .bind(now)
                    .bind(code_count)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(Error::Database)?;
                row.try_into()?
            }
        };
        tx.commit().await.map_err(Error::Database)?;

        info!(
            subsystem = "db",
            component = "publication",
            op = "request",
            entity_type = entity.entity_type.as_str(),
            entity_id = entity.id,
            revision_id,
            status = ?record.status,
            actor_id = user_id,
            "Publication requested"
        );
        Ok(record)
    }

    async fn approve(
        &self,
        ctx: &AccessContext,
        entity: EntityRef,
        revision_id: RevisionId,
        message: Option<&str>,
    ) -> Result<Vec<PublicationRecord>> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let live = entities::lock_live(&mut tx, entity).await?;
        authorize(PublishAction::Approve, &ctx.actor, false, live.fields.is_deleted)?;
        let moderator_id = Self::actor_id(ctx)?;

        let current = fetch_record(&mut tx, entity, revision_id, true).await?;
        let status = next_status(entity.entity_type, current.as_ref().map(|r| r.status), PublishAction::Approve)?;
        let current = current.ok_or_else(|| Error::Internal("Approval without a publication record".to_string()))?;

        let now = Utc::now();
        let mut approved = vec![set_status(&mut tx, current.id, status, Some(moderator_id), message, now).await?];

        // Any other outstanding request for the same entity is resolved the same way.
        let sql = format!(
            "UPDATE publication SET status = $4, moderator_id = $5, modified_at = $6 \
             WHERE entity_type = $1 AND entity_id = $2 AND revision_id <> $3 AND status IN ($7, $8) \
             RETURNING {}",
            PUBLICATION_COLUMNS
        );
        let rows: Vec<PublicationRow> = sqlx::query_as(&sql)
            .bind(entity.entity_type.as_str())
            .bind(entity.id)
            .bind(revision_id)
            .bind(ApprovalStatus::Approved.as_i16())
            .bind(moderator_id)
            .bind(now)
            .bind(ApprovalStatus::Requested.as_i16())
            .bind(ApprovalStatus::Pending.as_i16())
            .fetch_all(&mut *tx)
            .await
            .map_err(Error::Database)?;
        for row in rows {
            approved.push(row.try_into()?);
        }
        tx.commit().await.map_err(Error::Database)?;

        info!(
            subsystem = "db",
            component = "publication",
            op = "approve",
            entity_type = entity.entity_type.as_str(),
            entity_id = entity.id,
            revision_id,
            result_count = approved.len(),
            actor_id = moderator_id,
            "Publication approved"
        );
        for record in &approved {
            self.notify_owner(&live, record).await;
        }
        Ok(approved)
    }

    async fn reject(
        &self,
        ctx: &AccessContext,
        entity: EntityRef,
        revision_id: RevisionId,
        message: Option<&str>,
    ) -> Result<PublicationRecord> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let live = entities::lock_live(&mut tx, entity).await?;
        authorize(PublishAction::Reject, &ctx.actor, false, live.fields.is_deleted)?;
        let moderator_id = Self::actor_id(ctx)?;

        let current = fetch_record(&mut tx, entity, revision_id, true).await?;
        let status = next_status(entity.entity_type, current.as_ref().map(|r| r.status), PublishAction::Reject)?;
        let current = current.ok_or_else(|| Error::Internal("Rejection without a publication record".to_string()))?;

        let record = set_status(&mut tx, current.id, status, Some(moderator_id), message, Utc::now()).await?;
        tx.commit().await.map_err(Error::Database)?;

        info!(
            subsystem = "db",
            component = "publication",
            op = "reject",
            entity_type = entity.entity_type.as_str(),
            entity_id = entity.id,
            revision_id,
            actor_id = moderator_id,
            "Publication rejected"
        );
        self.notify_owner(&live, &record).await;
        Ok(record)
    }

    async fn list_publications(&self, entity: EntityRef) -> Result<Vec<PublicationRecord>> {
        let sql = format!(
            "SELECT {} FROM publication WHERE entity_type = $1 AND entity_id = $2 ORDER BY revision_id DESC",
            PUBLICATION_COLUMNS
        );
        let rows: Vec<PublicationRow> = sqlx::query_as(&sql)
            .bind(entity.entity_type.as_str())
            .bind(entity.id)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        rows.into_iter().map(PublicationRecord::try_from).collect()
    }

    async fn pending_reviews(
        &self,
        ctx: &AccessContext,
        entity_type: Option<EntityType>,
    ) -> Result<Vec<PublicationRecord>> {
        authorize_review_queue(&ctx.actor)?;
        let sql = format!(
            "SELECT {} FROM publication WHERE status IN ($1, $2) \
             AND ($3::text IS NULL OR entity_type = $3) ORDER BY created_at, id",
            PUBLICATION_COLUMNS
        );
        let rows: Vec<PublicationRow> = sqlx::query_as(&sql)
            .bind(ApprovalStatus::Requested.as_i16())
            .bind(ApprovalStatus::Pending.as_i16())
            .bind(entity_type.map(|t| t.as_str()))
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        rows.into_iter().map(PublicationRecord::try_from).collect()
    }

    async fn published_code_count(&self, concept_id: EntityId, revision_id: RevisionId) -> Result<i64> {
        let entity = EntityRef::concept(concept_id);
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let record = fetch_record(&mut tx, entity, revision_id, true)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Publication of {} revision {}", entity, revision_id)))?;

        // A stored count is final.
        if let Some(count) = record.code_count {
            return Ok(count);
        }

        let key = ConceptVersionKey::new(concept_id, revision_id);
        let count = graph::collect_codes_on(&mut tx, key, self.config.max_graph_depth).await?.len() as i64;
        sqlx::query("UPDATE publication SET code_count = $2 WHERE id = $1")
            .bind(record.id)
            .bind(count)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        tx.commit().await.map_err(Error::Database)?;

        info!(
            subsystem = "db",
            component = "publication",
            op = "code_count",
            entity_id = concept_id,
            revision_id,
            code_count = count,
            "Published code count cached"
        );
        Ok(count)
    }
}
