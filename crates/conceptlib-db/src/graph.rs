//! Concept reference graph persistence.
//!
//! Cycle checks run over the live `component` table. Code collection loads
//! every concept revision reachable from the root into a
//! [`ConceptArena`], each with its components as of its own revision
//! date, and evaluates it in memory.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgConnection, PgPool};
use tracing::{debug, info};

use conceptlib_core::{
    AccessContext, CodeSet, ConceptArena, ConceptGraphRepository, ConceptNode, ConceptVersionKey, CoreConfig,
    EntityId, EntityRef, Error, NewComponent, ReferenceIndex, Result, RevisionId, RevisionType, ValidationErrors,
};

use crate::children;
use crate::entities;
use crate::permissions::PgPermissionResolver;
use crate::revisions;

/// Advisory lock key taken while a reference edge is checked and inserted.
const REFERENCE_LOCK_KEY: i64 = 0x636f_6e63_6570_7400;

/// Serialize reference-edge writers for the rest of the transaction.
///
/// Must be held across the cycle check and the insert that follows it, by
/// every path that adds a concept reference.
pub(crate) async fn lock_reference_graph(conn: &mut PgConnection) -> Result<()> {
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(REFERENCE_LOCK_KEY)
        .execute(&mut *conn)
        .await
        .map_err(Error::Database)?;
    Ok(())
}

/// Whether `parent -> proposed_child` would close a cycle in the live graph.
pub(crate) async fn detect_cycle_on(
    conn: &mut PgConnection,
    parent: EntityId,
    proposed_child: EntityId,
) -> Result<bool> {
    if parent == proposed_child {
        return Ok(true);
    }
    // Every edge on a path that ends at `parent`.
    let edges: Vec<(i64, i64)> = sqlx::query_as(
        r#"
        WITH RECURSIVE chain(concept_id, concept_ref_id) AS (
            SELECT concept_id, concept_ref_id FROM component WHERE concept_ref_id = $1
            UNION
            SELECT c.concept_id, c.concept_ref_id
            FROM component c
            JOIN chain ON c.concept_ref_id = chain.concept_id
        )
        SELECT concept_id, concept_ref_id FROM chain
        "#,
    )
    .bind(parent)
    .fetch_all(&mut *conn)
    .await
    .map_err(Error::Database)?;

    let index = ReferenceIndex::from_edges(edges);
    Ok(index.detect_cycle(parent, proposed_child))
}

/// Load every concept revision reachable from `root` into an arena.
pub(crate) async fn load_arena(conn: &mut PgConnection, root: ConceptVersionKey) -> Result<ConceptArena> {
    let mut arena = ConceptArena::new();
    let mut queue = VecDeque::from([root]);

    while let Some(key) = queue.pop_front() {
        if arena.contains(&key) {
            continue;
        }
        let revision = revisions::fetch_revision(conn, EntityRef::concept(key.concept_id), key.revision_id).await?;
        let components = children::load_components(conn, key.concept_id, revision.meta.revision_date).await?;
        let node = ConceptNode::from_components(key, &components);
        for next in node.references() {
            if !arena.contains(&next) {
                queue.push_back(next);
            }
        }
        arena.insert(node);
    }
    Ok(arena)
}

/// Codes implied by one concept revision.
pub(crate) async fn collect_codes_on(
    conn: &mut PgConnection,
    root: ConceptVersionKey,
    max_depth: usize,
) -> Result<CodeSet> {
    let start = Instant::now();
    let arena = load_arena(conn, root).await?;
    let codes = arena.collect_codes(root, max_depth)?;

    debug!(
        subsystem = "db",
        component = "graph",
        op = "collect_codes",
        entity_id = root.concept_id,
        revision_id = root.revision_id,
        node_count = arena.len(),
        result_count = codes.len(),
        duration_ms = start.elapsed().as_millis() as u64,
        "Codes collected"
    );
    Ok(codes)
}

/// PostgreSQL implementation of ConceptGraphRepository.
#[derive(Clone)]
pub struct PgConceptGraph {
    pool: PgPool,
    config: Arc<CoreConfig>,
    permissions: PgPermissionResolver,
}

impl PgConceptGraph {
    pub fn new(pool: PgPool, config: Arc<CoreConfig>, permissions: PgPermissionResolver) -> Self {
        Self {
            pool,
            config,
            permissions,
        }
    }

    /// Shape checks that need no database access.
    fn check_shape(component: &NewComponent) -> Result<()> {
        let mut errors = ValidationErrors::new();
        if component.name.trim().is_empty() {
            errors.add("name", "Component name is required");
        }
        match (component.component_type.is_reference(), component.concept_ref) {
            (true, None) => errors.add("concept_ref", "A concept component must pin a concept revision"),
            (false, Some(_)) => errors.add("concept_ref", "Only concept components reference other concepts"),
            _ => {}
        }
        if component.concept_ref.is_some() && !component.code_lists.is_empty() {
            errors.add("code_lists", "A concept reference cannot own code lists");
        }
        let blank_code = component
            .code_lists
            .iter()
            .flat_map(|l| l.codes.iter())
            .any(|c| c.code.trim().is_empty());
        if blank_code {
            errors.add("codes", "Codes must be non-empty");
        }
        errors.into_result()
    }
}

#[async_trait]
impl ConceptGraphRepository for PgConceptGraph {
    async fn detect_cycle(&self, parent: EntityId, proposed_child: EntityId) -> Result<bool> {
        let mut conn = self.pool.acquire().await.map_err(Error::Database)?;
        detect_cycle_on(&mut conn, parent, proposed_child).await
    }

    async fn collect_codes_as_of(&self, concept_id: EntityId, revision_id: RevisionId) -> Result<CodeSet> {
        let mut conn = self.pool.acquire().await.map_err(Error::Database)?;
        collect_codes_on(
            &mut conn,
            ConceptVersionKey::new(concept_id, revision_id),
            self.config.max_graph_depth,
        )
        .await
    }

    async fn add_component(
        &self,
        ctx: &AccessContext,
        concept_id: EntityId,
        component: NewComponent,
        reason: Option<&str>,
    ) -> Result<RevisionId> {
        Self::check_shape(&component)?;
        let user_id = ctx
            .actor
            .user_id()
            .ok_or_else(|| Error::PermissionDenied("Sign in to change entries".to_string()))?;
        let entity = EntityRef::concept(concept_id);

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let live = entities::lock_live(&mut tx, entity).await?;
        self.permissions.require_edit(&mut tx, ctx, &live).await?;
        if live.fields.is_deleted {
            return Err(Error::PermissionDenied(format!("{} is deleted", entity)));
        }

        if let Some(target) = component.concept_ref {
            lock_reference_graph(&mut tx).await?;

            match revisions::fetch_revision(&mut tx, EntityRef::concept(target.concept_id), target.revision_id).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    return Err(Error::validation("concept_ref", format!("Unknown concept revision {}", target)));
                }
                Err(e) => return Err(e),
            }
            if detect_cycle_on(&mut tx, concept_id, target.concept_id).await? {
                return Err(Error::validation(
                    "concept_ref",
                    format!("Referencing C{} from C{} would create a cycle", target.concept_id, concept_id),
                ));
            }
        }

        let now = Utc::now();
        let component_id = children::insert_component(&mut tx, concept_id, &component, Some(user_id), now).await?;

        let mut fields = live.fields;
        fields.updated_by = Some(user_id);
        fields.updated_at = Some(now);
        entities::update_live(&mut tx, entity, &fields).await?;
        let revision_id =
            revisions::append_revision(&mut tx, entity, &fields, Some(user_id), reason, RevisionType::Modified, now)
                .await?;
        tx.commit().await.map_err(Error::Database)?;

        info!(
            subsystem = "db",
            component = "graph",
            op = "add_component",
            entity_id = concept_id,
            component_id,
            revision_id,
            reference = component.concept_ref.is_some(),
            "Component added"
        );
        Ok(revision_id)
    }

    async fn remove_component(
        &self,
        ctx: &AccessContext,
        concept_id: EntityId,
        component_id: i64,
        reason: Option<&str>,
    ) -> Result<RevisionId> {
        let user_id = ctx
            .actor
            .user_id()
            .ok_or_else(|| Error::PermissionDenied("Sign in to change entries".to_string()))?;
        let entity = EntityRef::concept(concept_id);

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let live = entities::lock_live(&mut tx, entity).await?;
        self.permissions.require_edit(&mut tx, ctx, &live).await?;
        if live.fields.is_deleted {
            return Err(Error::PermissionDenied(format!("{} is deleted", entity)));
        }

        let now = Utc::now();
        children::delete_component(&mut tx, concept_id, component_id, now).await?;

        let mut fields = live.fields;
        fields.updated_by = Some(user_id);
        fields.updated_at = Some(now);
        entities::update_live(&mut tx, entity, &fields).await?;
        let revision_id =
            revisions::append_revision(&mut tx, entity, &fields, Some(user_id), reason, RevisionType::Modified, now)
                .await?;
        tx.commit().await.map_err(Error::Database)?;

        info!(
            subsystem = "db",
            component = "graph",
            op = "remove_component",
            entity_id = concept_id,
            component_id,
            revision_id,
            "Component removed"
        );
        Ok(revision_id)
    }
}
