//! Core traits for the concept library.
//!
//! Collaborator traits are implemented outside the core (identity, brand
//! configuration). Repository traits are implemented by `conceptlib-db`.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::aggregate::ExportRow;
use crate::config::{ConcurrencyPolicy, CoreConfig};
use crate::error::{Error, Result};
use crate::filter::EntityFilter;
use crate::graph::CodeSet;
use crate::models::*;

// =============================================================================
// COLLABORATORS
// =============================================================================

/// Group membership lookup.
#[async_trait]
pub trait ActorDirectory: Send + Sync {
    /// Groups the actor belongs to. Anonymous actors belong to none.
    async fn current_actor_groups(&self, actor: &Actor) -> Result<BTreeSet<GroupId>>;
}

/// Brand to collection scope lookup.
#[async_trait]
pub trait BrandScopeProvider: Send + Sync {
    /// Collection ids the brand restricts visibility to, or `None` when the
    /// brand imposes no restriction.
    async fn brand_collection_scope(&self, brand: &str) -> Result<Option<BTreeSet<TagId>>>;
}

/// Brand scopes fixed in configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticBrandScopes {
    scopes: BTreeMap<String, BTreeSet<TagId>>,
}

impl StaticBrandScopes {
    pub fn new(scopes: BTreeMap<String, BTreeSet<TagId>>) -> Self {
        Self { scopes }
    }

    pub fn from_config(config: &CoreConfig) -> Self {
        Self::new(config.brand_scopes.clone())
    }

    pub fn get(&self, brand: &str) -> Option<&BTreeSet<TagId>> {
        self.scopes.get(brand)
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }
}

#[async_trait]
impl BrandScopeProvider for StaticBrandScopes {
    async fn brand_collection_scope(&self, brand: &str) -> Result<Option<BTreeSet<TagId>>> {
        Ok(self.scopes.get(brand).cloned())
    }
}

// =============================================================================
// ENTITY REPOSITORY
// =============================================================================

/// Options for one save of a live entity.
#[derive(Debug, Clone)]
pub struct SaveOptions {
    /// Append a revision for this save. `false` updates the live row only.
    pub record_history: bool,
    pub reason: Option<String>,
    /// Latest revision id the editor saw.
    pub expected_revision: Option<RevisionId>,
    /// Overrides the configured concurrency policy.
    pub policy: Option<ConcurrencyPolicy>,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            record_history: true,
            reason: None,
            expected_revision: None,
            policy: None,
        }
    }
}

impl SaveOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn expecting(mut self, revision_id: RevisionId) -> Self {
        self.expected_revision = Some(revision_id);
        self
    }

    pub fn with_policy(mut self, policy: ConcurrencyPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn without_history(mut self) -> Self {
        self.record_history = false;
        self
    }

    /// Compare the editor's last-seen revision with the current latest.
    pub fn check_stale(&self, default_policy: ConcurrencyPolicy, latest: RevisionId) -> Result<()> {
        let policy = self.policy.unwrap_or(default_policy);
        match (policy, self.expected_revision) {
            (ConcurrencyPolicy::Enforce, Some(expected)) if expected != latest => Err(Error::StaleEdit {
                expected,
                actual: latest,
            }),
            _ => Ok(()),
        }
    }
}

/// Live entity lifecycle. Every mutation checks edit permission and
/// appends exactly one revision.
#[async_trait]
pub trait EntityRepository: Send + Sync {
    /// Create an entity owned by the acting user (revision type `created`).
    async fn create(&self, ctx: &AccessContext, fields: EntityFields, reason: Option<&str>) -> Result<Entity>;

    /// Fetch the live row.
    async fn fetch(&self, entity: EntityRef) -> Result<Entity>;

    /// Replace the live fields. Returns the new revision id, or `None` when
    /// history recording was switched off for this save.
    async fn save(
        &self,
        ctx: &AccessContext,
        entity: EntityRef,
        fields: EntityFields,
        options: SaveOptions,
    ) -> Result<Option<RevisionId>>;

    async fn soft_delete(&self, ctx: &AccessContext, entity: EntityRef, reason: Option<&str>) -> Result<RevisionId>;

    async fn restore(&self, ctx: &AccessContext, entity: EntityRef, reason: Option<&str>) -> Result<RevisionId>;

    /// Replace the tag map of a phenotype or working set.
    async fn set_tag_map(
        &self,
        ctx: &AccessContext,
        entity: EntityRef,
        tag_ids: &[TagId],
        reason: Option<&str>,
    ) -> Result<RevisionId>;

    /// Replace the data sources linked to a phenotype.
    async fn set_data_sources(
        &self,
        ctx: &AccessContext,
        entity: EntityRef,
        data_source_ids: &[EntityId],
        reason: Option<&str>,
    ) -> Result<RevisionId>;

    /// Live rows matching a filter that the caller may view (latest
    /// revision, brand scope applied), newest first. `limit` and `offset`
    /// count visible rows.
    async fn list(
        &self,
        ctx: &AccessContext,
        filter: &EntityFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Entity>>;
}

// =============================================================================
// REVISIONS AND SNAPSHOTS
// =============================================================================

#[async_trait]
pub trait RevisionStore: Send + Sync {
    /// Revisions of an entity, newest first.
    async fn list_revisions(&self, entity: EntityRef) -> Result<Vec<RevisionSummary>>;

    async fn get_revision(&self, entity: EntityRef, revision_id: RevisionId) -> Result<Revision>;

    async fn latest_revision_id(&self, entity: EntityRef) -> Result<RevisionId>;

    /// Correct the change reason of an existing revision in place.
    async fn update_change_reason(
        &self,
        entity: EntityRef,
        revision_id: RevisionId,
        reason: &str,
    ) -> Result<()>;

    /// Unified diff of two revisions' field snapshots.
    async fn diff_revisions(&self, entity: EntityRef, from: RevisionId, to: RevisionId) -> Result<String>;
}

#[async_trait]
pub trait SnapshotReconstructor: Send + Sync {
    /// Full denormalized state of `entity` at `revision_id`.
    async fn reconstruct(&self, entity: EntityRef, revision_id: RevisionId) -> Result<Snapshot>;

    /// Owned children of `entity` as they were at `at`.
    async fn reconstruct_as_of(&self, entity: EntityRef, at: DateTime<Utc>) -> Result<ChildSet>;
}

// =============================================================================
// PERMISSIONS
// =============================================================================

#[async_trait]
pub trait PermissionResolver: Send + Sync {
    /// Whether the caller may view `revision_id` (or the latest revision).
    async fn can_view(
        &self,
        ctx: &AccessContext,
        entity: EntityRef,
        revision_id: Option<RevisionId>,
    ) -> Result<bool>;

    async fn can_edit(&self, ctx: &AccessContext, entity: EntityRef) -> Result<bool>;

    async fn ensure_view(
        &self,
        ctx: &AccessContext,
        entity: EntityRef,
        revision_id: Option<RevisionId>,
    ) -> Result<()> {
        if self.can_view(ctx, entity, revision_id).await? {
            Ok(())
        } else {
            Err(Error::PermissionDenied(format!("Cannot view {}", entity)))
        }
    }

    async fn ensure_edit(&self, ctx: &AccessContext, entity: EntityRef) -> Result<()> {
        if self.can_edit(ctx, entity).await? {
            Ok(())
        } else {
            Err(Error::PermissionDenied(format!("Cannot edit {}", entity)))
        }
    }
}

// =============================================================================
// PUBLICATION
// =============================================================================

#[async_trait]
pub trait PublicationRepository: Send + Sync {
    async fn is_published(&self, entity: EntityRef, revision_id: RevisionId) -> Result<bool>;

    async fn approval_status(&self, entity: EntityRef, revision_id: RevisionId) -> Result<Option<ApprovalStatus>>;

    /// Submit a revision for publication (concepts publish immediately).
    async fn request_publication(
        &self,
        ctx: &AccessContext,
        entity: EntityRef,
        revision_id: RevisionId,
    ) -> Result<PublicationRecord>;

    /// Approve a revision; other revisions of the entity awaiting review
    /// are approved with it.
    async fn approve(
        &self,
        ctx: &AccessContext,
        entity: EntityRef,
        revision_id: RevisionId,
        message: Option<&str>,
    ) -> Result<Vec<PublicationRecord>>;

    async fn reject(
        &self,
        ctx: &AccessContext,
        entity: EntityRef,
        revision_id: RevisionId,
        message: Option<&str>,
    ) -> Result<PublicationRecord>;

    /// Publication records of an entity, newest revision first.
    async fn list_publications(&self, entity: EntityRef) -> Result<Vec<PublicationRecord>>;

    /// Records awaiting moderation, oldest first. Moderators only.
    async fn pending_reviews(
        &self,
        ctx: &AccessContext,
        entity_type: Option<EntityType>,
    ) -> Result<Vec<PublicationRecord>>;

    /// Code count of a published concept revision, computed once and
    /// cached on its publication record.
    async fn published_code_count(&self, concept_id: EntityId, revision_id: RevisionId) -> Result<i64>;
}

// =============================================================================
// CONCEPT GRAPH AND EXPORT
// =============================================================================

#[async_trait]
pub trait ConceptGraphRepository: Send + Sync {
    /// Whether adding `parent -> proposed_child` would close a cycle.
    async fn detect_cycle(&self, parent: EntityId, proposed_child: EntityId) -> Result<bool>;

    /// Codes implied by a concept revision, following pinned references.
    async fn collect_codes_as_of(&self, concept_id: EntityId, revision_id: RevisionId) -> Result<CodeSet>;

    /// Add a component to a concept. Returns the new concept revision id.
    async fn add_component(
        &self,
        ctx: &AccessContext,
        concept_id: EntityId,
        component: NewComponent,
        reason: Option<&str>,
    ) -> Result<RevisionId>;

    async fn remove_component(
        &self,
        ctx: &AccessContext,
        concept_id: EntityId,
        component_id: i64,
        reason: Option<&str>,
    ) -> Result<RevisionId>;
}

#[async_trait]
pub trait CodeAggregator: Send + Sync {
    /// Canonical export rows for one revision.
    async fn aggregate(&self, entity: EntityRef, revision_id: RevisionId) -> Result<Vec<ExportRow>>;
}

// =============================================================================
// FORK / REVERT
// =============================================================================

#[async_trait]
pub trait ForkRevertOperator: Send + Sync {
    /// Clone a historical revision into a new entity owned by the actor.
    async fn fork(&self, ctx: &AccessContext, entity: EntityRef, revision_id: RevisionId) -> Result<EntityRef>;

    /// Overwrite the live entity with a historical revision.
    ///
    /// `expected_revision` is checked against the latest revision under the
    /// configured concurrency policy, as for [`EntityRepository::save`].
    async fn revert(
        &self,
        ctx: &AccessContext,
        entity: EntityRef,
        revision_id: RevisionId,
        expected_revision: Option<RevisionId>,
    ) -> Result<RevisionId>;
}
