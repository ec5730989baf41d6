//! Permission resolver backed by the live entity, revision and publication
//! tables.
//!
//! Gathers [`AccessFacts`] and hands them to the pure decision functions in
//! `conceptlib_core::permissions`. Nothing here writes.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use tracing::debug;

use conceptlib_core::permissions::{decide_edit, decide_view};
use conceptlib_core::{
    AccessContext, AccessDecision, AccessFacts, ActorDirectory, ApprovalStatus, BrandScope, BrandScopeProvider,
    CoreConfig, Entity, EntityFields, EntityRef, EntityType, Error, PermissionResolver, Result, RevisionId, TagId,
};

use crate::children;
use crate::entities;
use crate::revisions;

/// Publication status of one revision, if it has a record.
pub(crate) async fn revision_status(
    conn: &mut PgConnection,
    entity: EntityRef,
    revision_id: RevisionId,
) -> Result<Option<ApprovalStatus>> {
    let row: Option<(i16,)> = sqlx::query_as(
        "SELECT status FROM publication WHERE entity_type = $1 AND entity_id = $2 AND revision_id = $3",
    )
    .bind(entity.entity_type.as_str())
    .bind(entity.id)
    .bind(revision_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(Error::Database)?;
    row.map(|(status,)| ApprovalStatus::from_i16(status)).transpose()
}

/// Whether a status makes its revision public for the given type.
pub(crate) fn status_is_published(entity_type: EntityType, status: Option<ApprovalStatus>) -> bool {
    match (entity_type, status) {
        (_, None) => false,
        (EntityType::Concept, Some(_)) => true,
        (_, Some(status)) => status == ApprovalStatus::Approved,
    }
}

/// PostgreSQL implementation of PermissionResolver.
#[derive(Clone)]
pub struct PgPermissionResolver {
    pool: PgPool,
    config: Arc<CoreConfig>,
    directory: Arc<dyn ActorDirectory>,
    brands: Arc<dyn BrandScopeProvider>,
}

impl PgPermissionResolver {
    pub fn new(
        pool: PgPool,
        config: Arc<CoreConfig>,
        directory: Arc<dyn ActorDirectory>,
        brands: Arc<dyn BrandScopeProvider>,
    ) -> Self {
        Self {
            pool,
            config,
            directory,
            brands,
        }
    }

    async fn brand_scope(&self, ctx: &AccessContext) -> Result<BrandScope> {
        match &ctx.brand {
            Some(brand) => Ok(BrandScope::from_collections(
                self.brands.brand_collection_scope(brand).await?,
            )),
            None => Ok(BrandScope::Unrestricted),
        }
    }

    /// Collection tags of `fields` as they stood at `at`. Loaded only when
    /// the scope actually restricts.
    async fn collections(
        conn: &mut PgConnection,
        scope: &BrandScope,
        entity: EntityRef,
        fields: &EntityFields,
        at: DateTime<Utc>,
    ) -> Result<Vec<TagId>> {
        if matches!(scope, BrandScope::Unrestricted) {
            return Ok(Vec::new());
        }
        match fields.brand_collections() {
            Some(tags) => Ok(tags.to_vec()),
            None if entity.entity_type == EntityType::WorkingSet => {
                Ok(children::load_child_set(conn, entity, at).await?.tag_ids)
            }
            None => Ok(Vec::new()),
        }
    }

    /// Data sources carry no collection tags and are never brand-filtered.
    fn scope_for(entity: EntityRef, scope: BrandScope) -> BrandScope {
        if entity.entity_type == EntityType::DataSource {
            BrandScope::Unrestricted
        } else {
            scope
        }
    }

    /// View decision for one revision (the latest when `revision_id` is
    /// `None`).
    pub(crate) async fn view_decision(
        &self,
        conn: &mut PgConnection,
        ctx: &AccessContext,
        entity: EntityRef,
        revision_id: Option<RevisionId>,
    ) -> Result<AccessDecision> {
        let live = entities::fetch_live(conn, entity).await?;
        let revision = match revision_id {
            Some(id) => revisions::fetch_revision(conn, entity, id).await?,
            None => revisions::fetch_latest_revision(conn, entity).await?,
        };
        let status = revision_status(conn, entity, revision.meta.revision_id).await?;

        let scope = Self::scope_for(entity, self.brand_scope(ctx).await?);
        let collections =
            Self::collections(conn, &scope, entity, &revision.fields, revision.meta.revision_date).await?;
        let groups = self.groups(ctx).await?;

        let facts = AccessFacts {
            owner_id: live.fields.owner_id,
            group_id: live.fields.group_id,
            group_access: live.fields.group_access,
            world_access: live.fields.world_access,
            revision_status: status,
            revision_published: status_is_published(entity.entity_type, status),
            collections,
        };
        let decision = decide_view(&ctx.actor, &groups, &facts, &scope);

        debug!(
            subsystem = "db",
            component = "permissions",
            op = "can_view",
            entity_type = entity.entity_type.as_str(),
            entity_id = entity.id,
            revision_id = revision.meta.revision_id,
            actor_id = ?ctx.actor.user_id(),
            brand = ?ctx.brand,
            decision = ?decision,
            "View decision"
        );
        Ok(decision)
    }

    /// Edit decision against an already loaded live row.
    pub(crate) async fn edit_decision(
        &self,
        conn: &mut PgConnection,
        ctx: &AccessContext,
        live: &Entity,
    ) -> Result<AccessDecision> {
        let scope = Self::scope_for(live.entity, self.brand_scope(ctx).await?);
        let collections = Self::collections(conn, &scope, live.entity, &live.fields, Utc::now()).await?;
        let groups = self.groups(ctx).await?;

        let facts = AccessFacts {
            owner_id: live.fields.owner_id,
            group_id: live.fields.group_id,
            group_access: live.fields.group_access,
            world_access: live.fields.world_access,
            revision_status: None,
            revision_published: false,
            collections,
        };
        let decision = decide_edit(&ctx.actor, &groups, &facts, &scope, self.config.read_only);

        debug!(
            subsystem = "db",
            component = "permissions",
            op = "can_edit",
            entity_type = live.entity.entity_type.as_str(),
            entity_id = live.entity.id,
            actor_id = ?ctx.actor.user_id(),
            brand = ?ctx.brand,
            decision = ?decision,
            "Edit decision"
        );
        Ok(decision)
    }

    /// Fail with PermissionDenied unless the actor may edit `live`.
    pub(crate) async fn require_edit(&self, conn: &mut PgConnection, ctx: &AccessContext, live: &Entity) -> Result<()> {
        match self.edit_decision(conn, ctx, live).await? {
            AccessDecision::Granted(_) => Ok(()),
            AccessDecision::Denied(denial) => Err(Error::PermissionDenied(format!(
                "Cannot edit {}: {:?}",
                live.entity, denial
            ))),
        }
    }

    /// Fail with PermissionDenied unless the actor may view the revision.
    pub(crate) async fn require_view(
        &self,
        conn: &mut PgConnection,
        ctx: &AccessContext,
        entity: EntityRef,
        revision_id: Option<RevisionId>,
    ) -> Result<()> {
        match self.view_decision(conn, ctx, entity, revision_id).await? {
            AccessDecision::Granted(_) => Ok(()),
            AccessDecision::Denied(denial) => Err(Error::PermissionDenied(format!(
                "Cannot view {}: {:?}",
                entity, denial
            ))),
        }
    }

    async fn groups(&self, ctx: &AccessContext) -> Result<BTreeSet<i64>> {
        if ctx.actor.user().is_none() {
            return Ok(BTreeSet::new());
        }
        self.directory.current_actor_groups(&ctx.actor).await
    }
}

#[async_trait]
impl PermissionResolver for PgPermissionResolver {
    async fn can_view(&self, ctx: &AccessContext, entity: EntityRef, revision_id: Option<RevisionId>) -> Result<bool> {
        let mut conn = self.pool.acquire().await.map_err(Error::Database)?;
        Ok(self.view_decision(&mut conn, ctx, entity, revision_id).await?.is_allowed())
    }

    async fn can_edit(&self, ctx: &AccessContext, entity: EntityRef) -> Result<bool> {
        let mut conn = self.pool.acquire().await.map_err(Error::Database)?;
        let live = entities::fetch_live(&mut conn, entity).await?;
        Ok(self.edit_decision(&mut conn, ctx, &live).await?.is_allowed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concept_record_is_publication() {
        assert!(status_is_published(EntityType::Concept, Some(ApprovalStatus::Approved)));
        assert!(status_is_published(EntityType::Concept, Some(ApprovalStatus::Pending)));
        assert!(!status_is_published(EntityType::Concept, None));
    }

    #[test]
    fn test_moderated_types_need_approval() {
        assert!(status_is_published(EntityType::Phenotype, Some(ApprovalStatus::Approved)));
        assert!(!status_is_published(EntityType::Phenotype, Some(ApprovalStatus::Pending)));
        assert!(!status_is_published(EntityType::WorkingSet, Some(ApprovalStatus::Rejected)));
        assert!(!status_is_published(EntityType::PhenotypeWorkingset, None));
    }
}
