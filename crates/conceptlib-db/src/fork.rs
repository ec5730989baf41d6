//! Fork and revert.
//!
//! Both operations rebuild the full owned graph (components, code lists,
//! codes, tag and data source maps) from a historical revision inside a
//! single transaction. Any failure rolls back everything, including the
//! live row.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use tracing::info;

use conceptlib_core::{
    AccessContext, ChildSet, CoreConfig, EntityId, EntityRef, EntityType, Error, ForkRevertOperator, NewComponent,
    Result, RevisionId, RevisionType, SaveOptions, UserId,
};

use crate::children;
use crate::entities;
use crate::graph;
use crate::permissions::PgPermissionResolver;
use crate::revisions;

/// Recreate the owned children of `target` from a reconstructed child set.
async fn rebuild_children(
    conn: &mut PgConnection,
    target: EntityRef,
    source: &ChildSet,
    user_id: UserId,
    now: DateTime<Utc>,
) -> Result<()> {
    if target.entity_type == EntityType::Concept {
        if source.components.iter().any(|c| c.concept_ref.is_some()) {
            graph::lock_reference_graph(conn).await?;
        }
        for component in &source.components {
            if let Some(pin) = component.concept_ref {
                if graph::detect_cycle_on(conn, target.id, pin.concept_id).await? {
                    return Err(Error::validation(
                        "concept_ref",
                        format!("Restoring the reference to {} would create a cycle", pin),
                    ));
                }
            }
            children::insert_component(conn, target.id, &NewComponent::from(component), Some(user_id), now).await?;
        }
    }
    if entities::has_tag_map(target.entity_type) {
        let tags: BTreeSet<_> = source.tag_ids.iter().copied().collect();
        children::replace_tag_map(conn, target, &tags, Some(user_id), now).await?;
    }
    if target.entity_type == EntityType::Phenotype {
        let sources: BTreeSet<EntityId> = source.data_source_ids.iter().copied().collect();
        children::replace_data_sources(conn, target, &sources, Some(user_id), now).await?;
    }
    Ok(())
}

/// PostgreSQL implementation of ForkRevertOperator.
#[derive(Clone)]
pub struct PgForkRevert {
    pool: PgPool,
    config: Arc<CoreConfig>,
    permissions: PgPermissionResolver,
}

impl PgForkRevert {
    pub fn new(pool: PgPool, config: Arc<CoreConfig>, permissions: PgPermissionResolver) -> Self {
        Self {
            pool,
            config,
            permissions,
        }
    }
}

#[async_trait]
impl ForkRevertOperator for PgForkRevert {
    async fn fork(&self, ctx: &AccessContext, entity: EntityRef, revision_id: RevisionId) -> Result<EntityRef> {
        let user_id = ctx
            .actor
            .user_id()
            .ok_or_else(|| Error::PermissionDenied("Sign in to fork entries".to_string()))?;
        if self.config.read_only {
            return Err(Error::PermissionDenied("The library is in read-only mode".to_string()));
        }

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        self.permissions.require_view(&mut tx, ctx, entity, Some(revision_id)).await?;
        let source = entities::fetch_live(&mut tx, entity).await?;
        let revision = revisions::fetch_revision(&mut tx, entity, revision_id).await?;
        let source_children = children::load_child_set(&mut tx, entity, revision.meta.revision_date).await?;

        let now = Utc::now();
        let id = entities::allocate_id(&mut tx, entity.entity_type).await?;
        let forked = EntityRef::new(entity.entity_type, id);

        let mut fields = revision.fields;
        fields.owner_id = user_id;
        fields.created_by = Some(user_id);
        fields.created_at = now;
        fields.updated_by = None;
        fields.updated_at = None;
        fields.is_deleted = false;
        fields.deleted_by = None;
        fields.deleted_at = None;

        entities::insert_live(&mut tx, forked, &fields).await?;
        rebuild_children(&mut tx, forked, &source_children, user_id, now).await?;
        let reason = format!("Forked from {}/{}", source.entity_code, revision_id);
        let new_revision =
            revisions::append_revision(&mut tx, forked, &fields, Some(user_id), Some(&reason), RevisionType::Created, now)
                .await?;
        tx.commit().await.map_err(Error::Database)?;

        info!(
            subsystem = "db",
            component = "fork",
            op = "fork",
            entity_type = entity.entity_type.as_str(),
            entity_id = entity.id,
            revision_id,
            forked_id = id,
            forked_revision_id = new_revision,
            component_count = source_children.components.len(),
            actor_id = user_id,
            "Entity forked"
        );
        Ok(forked)
    }

    async fn revert(
        &self,
        ctx: &AccessContext,
        entity: EntityRef,
        revision_id: RevisionId,
        expected_revision: Option<RevisionId>,
    ) -> Result<RevisionId> {
        let user_id = ctx
            .actor
            .user_id()
            .ok_or_else(|| Error::PermissionDenied("Sign in to revert entries".to_string()))?;

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let live = entities::lock_live(&mut tx, entity).await?;
        if live.fields.is_deleted {
            return Err(Error::PermissionDenied(format!("{} is deleted and cannot be reverted", entity)));
        }
        self.permissions.require_edit(&mut tx, ctx, &live).await?;

        let latest = revisions::require_latest_revision_id(&mut tx, entity).await?;
        SaveOptions {
            expected_revision,
            ..SaveOptions::default()
        }
        .check_stale(self.config.concurrency_policy, latest)?;

        let revision = revisions::fetch_revision(&mut tx, entity, revision_id).await?;
        let target_children = children::load_child_set(&mut tx, entity, revision.meta.revision_date).await?;

        let now = Utc::now();
        // Owner comes from the snapshot; audit and delete state stay live.
        let mut fields = revision.fields;
        fields.created_by = live.fields.created_by;
        fields.created_at = live.fields.created_at;
        fields.is_deleted = false;
        fields.deleted_by = None;
        fields.deleted_at = None;
        fields.updated_by = Some(user_id);
        fields.updated_at = Some(now);

        if entity.entity_type == EntityType::Concept {
            children::delete_all_components(&mut tx, entity.id, now).await?;
        }
        rebuild_children(&mut tx, entity, &target_children, user_id, now).await?;
        entities::update_live(&mut tx, entity, &fields).await?;

        let reason = format!("Reverted from revision {}", revision_id);
        let new_revision = revisions::append_revision(
            &mut tx,
            entity,
            &fields,
            Some(user_id),
            Some(&reason),
            RevisionType::Modified,
            now,
        )
        .await?;
        tx.commit().await.map_err(Error::Database)?;

        info!(
            subsystem = "db",
            component = "fork",
            op = "revert",
            entity_type = entity.entity_type.as_str(),
            entity_id = entity.id,
            revision_id,
            new_revision_id = new_revision,
            actor_id = user_id,
            "Entity reverted"
        );
        Ok(new_revision)
    }
}
