//! Core data models for the concept library.
//!
//! These types are shared by every crate in the workspace and describe the
//! versionable entities, their revisions, their owned child structures and
//! the publication records that track approval per revision.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{Error, Result, ValidationErrors};

pub type EntityId = i64;
pub type RevisionId = i64;
pub type UserId = i64;
pub type GroupId = i64;
pub type TagId = i64;

// =============================================================================
// ENTITY TYPES
// =============================================================================

/// The versionable entity variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Concept,
    Phenotype,
    WorkingSet,
    PhenotypeWorkingset,
    DataSource,
}

impl EntityType {
    pub const ALL: [EntityType; 5] = [
        EntityType::Concept,
        EntityType::Phenotype,
        EntityType::WorkingSet,
        EntityType::PhenotypeWorkingset,
        EntityType::DataSource,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Concept => "concept",
            Self::Phenotype => "phenotype",
            Self::WorkingSet => "working_set",
            Self::PhenotypeWorkingset => "phenotype_workingset",
            Self::DataSource => "data_source",
        }
    }

    /// Display prefix of the human-readable id. Data sources have none.
    pub fn code_prefix(&self) -> Option<&'static str> {
        match self {
            Self::Concept => Some("C"),
            Self::Phenotype => Some("PH"),
            Self::WorkingSet | Self::PhenotypeWorkingset => Some("WS"),
            Self::DataSource => None,
        }
    }

    /// Postgres sequence that allocates ids for this type.
    pub fn id_sequence(&self) -> &'static str {
        match self {
            Self::Concept => "concept_id_seq",
            Self::Phenotype => "phenotype_id_seq",
            Self::WorkingSet => "working_set_id_seq",
            Self::PhenotypeWorkingset => "phenotype_workingset_id_seq",
            Self::DataSource => "data_source_id_seq",
        }
    }

    /// Whether the type takes part in the publication workflow.
    pub fn is_publishable(&self) -> bool {
        !matches!(self, Self::DataSource)
    }

    /// Whether publication requests go through moderation.
    ///
    /// Concepts are published directly; their record is created Approved.
    pub fn requires_moderation(&self) -> bool {
        matches!(
            self,
            Self::Phenotype | Self::WorkingSet | Self::PhenotypeWorkingset
        )
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "concept" => Ok(Self::Concept),
            "phenotype" => Ok(Self::Phenotype),
            "working_set" | "workingset" => Ok(Self::WorkingSet),
            "phenotype_workingset" => Ok(Self::PhenotypeWorkingset),
            "data_source" | "datasource" => Ok(Self::DataSource),
            other => Err(Error::InvalidInput(format!("Unknown entity type: {}", other))),
        }
    }
}

/// Identity of one live entity: type plus numeric id.
///
/// The prefixed display code is cosmetic; comparisons always use this pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: EntityType,
    pub id: EntityId,
}

impl EntityRef {
    pub fn new(entity_type: EntityType, id: EntityId) -> Self {
        Self { entity_type, id }
    }

    pub fn concept(id: EntityId) -> Self {
        Self::new(EntityType::Concept, id)
    }

    pub fn phenotype(id: EntityId) -> Self {
        Self::new(EntityType::Phenotype, id)
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.entity_type.code_prefix() {
            Some(prefix) => write!(f, "{}{}", prefix, self.id),
            None => write!(f, "{}:{}", self.entity_type, self.id),
        }
    }
}

// =============================================================================
// ACCESS LEVELS
// =============================================================================

/// Owner/group/world access level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    NoAccess = 1,
    View = 2,
    Edit = 3,
}

impl AccessLevel {
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    pub fn from_i16(value: i16) -> Result<Self> {
        match value {
            1 => Ok(Self::NoAccess),
            2 => Ok(Self::View),
            3 => Ok(Self::Edit),
            other => Err(Error::InvalidInput(format!("Unknown access level: {}", other))),
        }
    }

    pub fn allows_view(self) -> bool {
        matches!(self, Self::View | Self::Edit)
    }

    pub fn allows_edit(self) -> bool {
        matches!(self, Self::Edit)
    }
}

// =============================================================================
// REVISIONS
// =============================================================================

/// Kind of save event that produced a revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevisionType {
    Created,
    Modified,
    Deleted,
}

impl RevisionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Modified => "modified",
            Self::Deleted => "deleted",
        }
    }
}

impl FromStr for RevisionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(Self::Created),
            "modified" => Ok(Self::Modified),
            "deleted" => Ok(Self::Deleted),
            other => Err(Error::InvalidInput(format!("Unknown revision type: {}", other))),
        }
    }
}

/// Audit metadata of one revision (without the field snapshot).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionMeta {
    pub entity: EntityRef,
    pub revision_id: RevisionId,
    pub revision_date: DateTime<Utc>,
    pub revision_user_id: Option<UserId>,
    pub change_reason: Option<String>,
    pub revision_type: RevisionType,
}

/// One immutable historical snapshot of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    pub meta: RevisionMeta,
    pub fields: EntityFields,
}

/// Revision listing entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionSummary {
    pub meta: RevisionMeta,
    pub name: String,
    pub is_latest: bool,
    pub approval_status: Option<ApprovalStatus>,
}

// =============================================================================
// ENTITY FIELDS
// =============================================================================

/// A pinned reference from a phenotype or working set to one concept revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConceptReference {
    pub concept_id: EntityId,
    pub concept_version_id: RevisionId,
    #[serde(default)]
    pub attributes: Vec<String>,
}

impl ConceptReference {
    pub fn key(&self) -> ConceptVersionKey {
        ConceptVersionKey::new(self.concept_id, self.concept_version_id)
    }
}

/// Entry of a phenotype working set: a concept revision reached via a
/// phenotype revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhenotypeConceptReference {
    pub phenotype_id: EntityId,
    pub phenotype_version_id: RevisionId,
    pub concept_id: EntityId,
    pub concept_version_id: RevisionId,
    #[serde(default, rename = "Attributes")]
    pub attributes: Vec<String>,
}

impl PhenotypeConceptReference {
    pub fn key(&self) -> ConceptVersionKey {
        ConceptVersionKey::new(self.concept_id, self.concept_version_id)
    }
}

/// Type-specific fields, stored as JSON next to the shared columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityBody {
    Concept {
        coding_system_id: Option<i64>,
    },
    Phenotype {
        #[serde(default)]
        concepts: Vec<ConceptReference>,
        #[serde(default)]
        phenotype_type: Option<String>,
    },
    WorkingSet {
        #[serde(default)]
        concepts: Vec<ConceptReference>,
    },
    PhenotypeWorkingset {
        #[serde(default)]
        phenotypes_concepts: Vec<PhenotypeConceptReference>,
    },
    DataSource {
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        source: Option<String>,
    },
}

impl EntityBody {
    pub fn entity_type(&self) -> EntityType {
        match self {
            Self::Concept { .. } => EntityType::Concept,
            Self::Phenotype { .. } => EntityType::Phenotype,
            Self::WorkingSet { .. } => EntityType::WorkingSet,
            Self::PhenotypeWorkingset { .. } => EntityType::PhenotypeWorkingset,
            Self::DataSource { .. } => EntityType::DataSource,
        }
    }

    /// Empty body for the given type.
    pub fn empty(entity_type: EntityType) -> Self {
        match entity_type {
            EntityType::Concept => Self::Concept {
                coding_system_id: None,
            },
            EntityType::Phenotype => Self::Phenotype {
                concepts: Vec::new(),
                phenotype_type: None,
            },
            EntityType::WorkingSet => Self::WorkingSet {
                concepts: Vec::new(),
            },
            EntityType::PhenotypeWorkingset => Self::PhenotypeWorkingset {
                phenotypes_concepts: Vec::new(),
            },
            EntityType::DataSource => Self::DataSource {
                url: None,
                source: None,
            },
        }
    }

    /// Concept revisions referenced from this body, in stored order.
    pub fn concept_keys(&self) -> Vec<ConceptVersionKey> {
        match self {
            Self::Phenotype { concepts, .. } | Self::WorkingSet { concepts } => {
                concepts.iter().map(ConceptReference::key).collect()
            }
            Self::PhenotypeWorkingset {
                phenotypes_concepts,
            } => phenotypes_concepts
                .iter()
                .map(PhenotypeConceptReference::key)
                .collect(),
            Self::Concept { .. } | Self::DataSource { .. } => Vec::new(),
        }
    }
}

/// Every scalar field of a versionable entity.
///
/// This is exactly what a revision snapshots. Display names (owner
/// username, group name, coding system name) are not part of it and are
/// resolved against current rows at reconstruction time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityFields {
    pub name: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "empty_object")]
    pub metadata: JsonValue,
    pub owner_id: UserId,
    #[serde(default)]
    pub group_id: Option<GroupId>,
    pub owner_access: AccessLevel,
    pub group_access: AccessLevel,
    pub world_access: AccessLevel,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub deleted_by: Option<UserId>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: Vec<TagId>,
    #[serde(default)]
    pub collections: Vec<TagId>,
    pub created_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_by: Option<UserId>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    pub body: EntityBody,
}

fn empty_object() -> JsonValue {
    serde_json::json!({})
}

impl EntityFields {
    /// New field set with the usual defaults: owner edits, group and world
    /// have no access.
    pub fn new(body: EntityBody, name: impl Into<String>, owner_id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            author: String::new(),
            description: None,
            metadata: empty_object(),
            owner_id,
            group_id: None,
            owner_access: AccessLevel::Edit,
            group_access: AccessLevel::NoAccess,
            world_access: AccessLevel::NoAccess,
            is_deleted: false,
            deleted_by: None,
            deleted_at: None,
            tags: Vec::new(),
            collections: Vec::new(),
            created_by: Some(owner_id),
            created_at: now,
            updated_by: None,
            updated_at: None,
            body,
        }
    }

    pub fn entity_type(&self) -> EntityType {
        self.body.entity_type()
    }

    /// Check the field rules every save must satisfy, collecting all
    /// failures.
    pub fn validate(&self) -> Result<()> {
        let mut errors = ValidationErrors::new();
        if self.name.trim().is_empty() {
            errors.add("name", "Name is required");
        }
        if self.world_access == AccessLevel::Edit {
            errors.add("world_access", "World access is limited to view");
        }
        if self.group_id.is_none() && self.group_access != AccessLevel::NoAccess {
            errors.add("group_access", "Group access requires a group");
        }
        let blank_attribute = match &self.body {
            EntityBody::Phenotype { concepts, .. } | EntityBody::WorkingSet { concepts } => concepts
                .iter()
                .any(|c| c.attributes.iter().any(|a| a.trim().is_empty())),
            EntityBody::PhenotypeWorkingset {
                phenotypes_concepts,
            } => phenotypes_concepts
                .iter()
                .any(|c| c.attributes.iter().any(|a| a.trim().is_empty())),
            EntityBody::Concept { .. } | EntityBody::DataSource { .. } => false,
        };
        if blank_attribute {
            errors.add("concepts", "Attributes must be non-empty strings");
        }
        errors.into_result()
    }

    /// Collection tags consulted by brand scoping, per entity type.
    ///
    /// Legacy working sets keep theirs in the tag map and return `None`
    /// here; the resolver derives them from the map instead.
    pub fn brand_collections(&self) -> Option<&[TagId]> {
        match self.body {
            EntityBody::Concept { .. } | EntityBody::Phenotype { .. } => Some(&self.tags),
            EntityBody::PhenotypeWorkingset { .. } => Some(&self.collections),
            EntityBody::WorkingSet { .. } | EntityBody::DataSource { .. } => None,
        }
    }
}

/// The current, mutable row of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub entity: EntityRef,
    pub entity_code: String,
    pub fields: EntityFields,
}

// =============================================================================
// CONCEPT COMPONENTS AND CODES
// =============================================================================

/// A (concept id, revision id) pair; the node key of the concept graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConceptVersionKey {
    pub concept_id: EntityId,
    pub revision_id: RevisionId,
}

impl ConceptVersionKey {
    pub fn new(concept_id: EntityId, revision_id: RevisionId) -> Self {
        Self {
            concept_id,
            revision_id,
        }
    }
}

impl fmt::Display for ConceptVersionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C{}/{}", self.concept_id, self.revision_id)
    }
}

/// Inclusion or exclusion of a component's codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalType {
    Include = 1,
    Exclude = 2,
}

impl LogicalType {
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    pub fn from_i16(value: i16) -> Result<Self> {
        match value {
            1 => Ok(Self::Include),
            2 => Ok(Self::Exclude),
            other => Err(Error::InvalidInput(format!("Unknown logical type: {}", other))),
        }
    }
}

/// How a component was authored. Only `Concept` references another concept;
/// every other kind owns a code list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentType {
    Concept = 1,
    QueryBuilder = 2,
    Expression = 3,
    ExpressionSelect = 4,
}

impl ComponentType {
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    pub fn from_i16(value: i16) -> Result<Self> {
        match value {
            1 => Ok(Self::Concept),
            2 => Ok(Self::QueryBuilder),
            3 => Ok(Self::Expression),
            4 => Ok(Self::ExpressionSelect),
            other => Err(Error::InvalidInput(format!("Unknown component type: {}", other))),
        }
    }

    pub fn is_reference(self) -> bool {
        matches!(self, Self::Concept)
    }
}

/// A clinical code with its description.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Code {
    pub code: String,
    pub description: String,
}

impl Code {
    pub fn new(code: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            description: description.into(),
        }
    }
}

/// Code list of a leaf component, as of some moment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeListSnapshot {
    pub code_list_id: i64,
    pub description: Option<String>,
    pub codes: Vec<Code>,
}

/// Component of a concept, as of some moment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentSnapshot {
    pub component_id: i64,
    pub name: String,
    pub component_type: ComponentType,
    pub logical_type: LogicalType,
    pub concept_ref: Option<ConceptVersionKey>,
    pub code_lists: Vec<CodeListSnapshot>,
}

/// Code list to attach to a new leaf component.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewCodeList {
    pub description: Option<String>,
    pub codes: Vec<Code>,
}

/// Component to create on a concept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewComponent {
    pub name: String,
    pub component_type: ComponentType,
    pub logical_type: LogicalType,
    pub concept_ref: Option<ConceptVersionKey>,
    #[serde(default)]
    pub code_lists: Vec<NewCodeList>,
}

impl NewComponent {
    /// Leaf component holding one code list.
    pub fn code_list(
        name: impl Into<String>,
        component_type: ComponentType,
        logical_type: LogicalType,
        codes: Vec<Code>,
    ) -> Self {
        Self {
            name: name.into(),
            component_type,
            logical_type,
            concept_ref: None,
            code_lists: vec![NewCodeList {
                description: None,
                codes,
            }],
        }
    }

    /// Component pinning another concept revision.
    pub fn concept_reference(
        name: impl Into<String>,
        logical_type: LogicalType,
        target: ConceptVersionKey,
    ) -> Self {
        Self {
            name: name.into(),
            component_type: ComponentType::Concept,
            logical_type,
            concept_ref: Some(target),
            code_lists: Vec::new(),
        }
    }
}

impl From<&ComponentSnapshot> for NewComponent {
    fn from(snapshot: &ComponentSnapshot) -> Self {
        Self {
            name: snapshot.name.clone(),
            component_type: snapshot.component_type,
            logical_type: snapshot.logical_type,
            concept_ref: snapshot.concept_ref,
            code_lists: snapshot
                .code_lists
                .iter()
                .map(|list| NewCodeList {
                    description: list.description.clone(),
                    codes: list.codes.clone(),
                })
                .collect(),
        }
    }
}

/// Owned child structures of an entity, as of some moment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChildSet {
    pub components: Vec<ComponentSnapshot>,
    pub tag_ids: Vec<TagId>,
    pub data_source_ids: Vec<EntityId>,
}

// =============================================================================
// CHILD REVISIONS
// =============================================================================

/// Kind of owned child row tracked in the child revision store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildKind {
    Component,
    CodeList,
    Code,
    TagMap,
    DataSourceMap,
}

impl ChildKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Component => "component",
            Self::CodeList => "code_list",
            Self::Code => "code",
            Self::TagMap => "tag_map",
            Self::DataSourceMap => "data_source_map",
        }
    }
}

impl FromStr for ChildKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "component" => Ok(Self::Component),
            "code_list" => Ok(Self::CodeList),
            "code" => Ok(Self::Code),
            "tag_map" => Ok(Self::TagMap),
            "data_source_map" => Ok(Self::DataSourceMap),
            other => Err(Error::InvalidInput(format!("Unknown child kind: {}", other))),
        }
    }
}

/// One history row of an owned child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildRevision {
    pub revision_id: i64,
    pub child_kind: ChildKind,
    pub child_id: i64,
    pub parent_id: i64,
    pub revision_date: DateTime<Utc>,
    pub revision_type: RevisionType,
    pub payload: JsonValue,
}

/// Payload of a component child revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentRecord {
    pub name: String,
    pub component_type: ComponentType,
    pub logical_type: LogicalType,
    pub concept_ref_id: Option<EntityId>,
    pub concept_ref_history_id: Option<RevisionId>,
}

/// Payload of a code list child revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeListRecord {
    pub description: Option<String>,
}

/// Payload of a tag map child revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagMapRecord {
    pub tag_id: TagId,
}

/// Payload of a data source map child revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSourceMapRecord {
    pub data_source_id: EntityId,
}

// =============================================================================
// SNAPSHOTS
// =============================================================================

/// Denormalized state of an entity at one revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub entity: EntityRef,
    pub entity_code: String,
    pub revision: RevisionMeta,
    pub is_latest: bool,
    pub fields: EntityFields,
    pub owner_name: Option<String>,
    pub group_name: Option<String>,
    pub revision_user_name: Option<String>,
    pub coding_system_name: Option<String>,
    pub children: ChildSet,
}

// =============================================================================
// TAGS
// =============================================================================

/// Tag discriminator: plain tag or brand collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagType {
    Tag = 1,
    Collection = 2,
}

impl TagType {
    pub fn from_i16(value: i16) -> Result<Self> {
        match value {
            1 => Ok(Self::Tag),
            2 => Ok(Self::Collection),
            other => Err(Error::InvalidInput(format!("Unknown tag type: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub id: TagId,
    pub description: String,
    pub tag_type: TagType,
}

// =============================================================================
// PUBLICATION
// =============================================================================

/// Approval status of one (entity, revision) publication record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Requested = 0,
    Pending = 1,
    Approved = 2,
    Rejected = 3,
}

impl ApprovalStatus {
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    pub fn from_i16(value: i16) -> Result<Self> {
        match value {
            0 => Ok(Self::Requested),
            1 => Ok(Self::Pending),
            2 => Ok(Self::Approved),
            3 => Ok(Self::Rejected),
            other => Err(Error::InvalidInput(format!("Unknown approval status: {}", other))),
        }
    }

    /// Awaiting a moderator decision.
    pub fn is_awaiting_review(self) -> bool {
        matches!(self, Self::Requested | Self::Pending)
    }
}

/// Publication record for one (entity, revision).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicationRecord {
    pub id: i64,
    pub entity: EntityRef,
    pub revision_id: RevisionId,
    pub status: ApprovalStatus,
    pub moderator_id: Option<UserId>,
    pub created_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub modified_at: Option<DateTime<Utc>>,
    pub code_count: Option<i64>,
    pub message: Option<String>,
}

impl PublicationRecord {
    /// Whether this record makes its revision publicly visible.
    ///
    /// Concept records exist only once published; other types need an
    /// Approved status.
    pub fn is_published(&self) -> bool {
        match self.entity.entity_type {
            EntityType::Concept => true,
            _ => self.status == ApprovalStatus::Approved,
        }
    }
}

// =============================================================================
// ACTORS
// =============================================================================

/// An authenticated user as seen by the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    pub id: UserId,
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub is_superuser: bool,
    #[serde(default)]
    pub is_moderator: bool,
}

/// The caller of a core operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Actor {
    Anonymous,
    User(AuthenticatedUser),
}

impl Actor {
    pub fn user(&self) -> Option<&AuthenticatedUser> {
        match self {
            Self::Anonymous => None,
            Self::User(user) => Some(user),
        }
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.user().map(|u| u.id)
    }

    pub fn is_superuser(&self) -> bool {
        self.user().map(|u| u.is_superuser).unwrap_or(false)
    }

    pub fn is_moderator(&self) -> bool {
        self.user().map(|u| u.is_moderator).unwrap_or(false)
    }
}

/// Actor plus the brand the request runs under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessContext {
    pub actor: Actor,
    pub brand: Option<String>,
}

impl AccessContext {
    pub fn new(actor: Actor) -> Self {
        Self { actor, brand: None }
    }

    pub fn anonymous() -> Self {
        Self::new(Actor::Anonymous)
    }

    pub fn with_brand(mut self, brand: impl Into<String>) -> Self {
        self.brand = Some(brand.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_ref_display_uses_prefix() {
        assert_eq!(EntityRef::concept(123).to_string(), "C123");
        assert_eq!(EntityRef::phenotype(45).to_string(), "PH45");
        assert_eq!(
            EntityRef::new(EntityType::PhenotypeWorkingset, 7).to_string(),
            "WS7"
        );
        assert_eq!(
            EntityRef::new(EntityType::DataSource, 3).to_string(),
            "data_source:3"
        );
    }

    #[test]
    fn test_entity_type_parse() {
        assert_eq!("concept".parse::<EntityType>().unwrap(), EntityType::Concept);
        assert_eq!(
            "working-set".parse::<EntityType>().unwrap(),
            EntityType::WorkingSet
        );
        assert!("widget".parse::<EntityType>().is_err());
    }

    #[test]
    fn test_access_level_roundtrip_and_rules() {
        for level in [AccessLevel::NoAccess, AccessLevel::View, AccessLevel::Edit] {
            assert_eq!(AccessLevel::from_i16(level.as_i16()).unwrap(), level);
        }
        assert!(!AccessLevel::NoAccess.allows_view());
        assert!(AccessLevel::View.allows_view());
        assert!(!AccessLevel::View.allows_edit());
        assert!(AccessLevel::Edit.allows_view());
        assert!(AccessLevel::from_i16(0).is_err());
    }

    #[test]
    fn test_approval_status_values() {
        assert_eq!(ApprovalStatus::Requested.as_i16(), 0);
        assert_eq!(ApprovalStatus::Rejected.as_i16(), 3);
        assert!(ApprovalStatus::Pending.is_awaiting_review());
        assert!(!ApprovalStatus::Rejected.is_awaiting_review());
    }

    #[test]
    fn test_body_concept_keys_keep_stored_order() {
        let body = EntityBody::Phenotype {
            concepts: vec![
                ConceptReference {
                    concept_id: 9,
                    concept_version_id: 90,
                    attributes: vec![],
                },
                ConceptReference {
                    concept_id: 2,
                    concept_version_id: 20,
                    attributes: vec![],
                },
            ],
            phenotype_type: None,
        };
        assert_eq!(
            body.concept_keys(),
            vec![ConceptVersionKey::new(9, 90), ConceptVersionKey::new(2, 20)]
        );
    }

    #[test]
    fn test_phenotype_workingset_attributes_field_name() {
        let json = serde_json::json!({
            "phenotype_id": 1,
            "phenotype_version_id": 2,
            "concept_id": 3,
            "concept_version_id": 4,
            "Attributes": ["a"]
        });
        let parsed: PhenotypeConceptReference = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.attributes, vec!["a".to_string()]);
    }

    #[test]
    fn test_fields_snapshot_roundtrip() {
        let now = Utc::now();
        let fields = EntityFields::new(
            EntityBody::Concept {
                coding_system_id: Some(4),
            },
            "Asthma",
            7,
            now,
        );
        let json = serde_json::to_value(&fields).unwrap();
        let back: EntityFields = serde_json::from_value(json).unwrap();
        assert_eq!(back, fields);
        assert_eq!(back.entity_type(), EntityType::Concept);
    }

    #[test]
    fn test_brand_collections_by_type() {
        let now = Utc::now();
        let mut pw = EntityFields::new(EntityBody::empty(EntityType::PhenotypeWorkingset), "x", 1, now);
        pw.tags = vec![1];
        pw.collections = vec![42];
        assert_eq!(pw.brand_collections(), Some(&[42][..]));

        let mut ph = EntityFields::new(EntityBody::empty(EntityType::Phenotype), "x", 1, now);
        ph.tags = vec![42];
        assert_eq!(ph.brand_collections(), Some(&[42][..]));

        let ws = EntityFields::new(EntityBody::empty(EntityType::WorkingSet), "x", 1, now);
        assert_eq!(ws.brand_collections(), None);
    }

    #[test]
    fn test_validate_accumulates_field_errors() {
        let mut fields = EntityFields::new(
            EntityBody::Phenotype {
                concepts: vec![ConceptReference {
                    concept_id: 1,
                    concept_version_id: 2,
                    attributes: vec!["".to_string()],
                }],
                phenotype_type: None,
            },
            " ",
            1,
            Utc::now(),
        );
        fields.world_access = AccessLevel::Edit;
        fields.group_access = AccessLevel::View;

        match fields.validate().unwrap_err() {
            Error::Validation(errors) => {
                assert!(errors.get("name").is_some());
                assert!(errors.get("world_access").is_some());
                assert!(errors.get("group_access").is_some());
                assert!(errors.get("concepts").is_some());
            }
            other => panic!("Expected Validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_accepts_defaults() {
        let fields = EntityFields::new(EntityBody::empty(EntityType::Concept), "Asthma", 1, Utc::now());
        assert!(fields.validate().is_ok());
    }

    #[test]
    fn test_new_component_from_snapshot_keeps_pin() {
        let snapshot = ComponentSnapshot {
            component_id: 9,
            name: "Child".to_string(),
            component_type: ComponentType::Concept,
            logical_type: LogicalType::Exclude,
            concept_ref: Some(ConceptVersionKey::new(3, 11)),
            code_lists: vec![],
        };
        let component = NewComponent::from(&snapshot);
        assert_eq!(component.concept_ref, Some(ConceptVersionKey::new(3, 11)));
        assert_eq!(component.logical_type, LogicalType::Exclude);
    }

    #[test]
    fn test_concept_record_published_on_existence() {
        let record = PublicationRecord {
            id: 1,
            entity: EntityRef::concept(1),
            revision_id: 3,
            status: ApprovalStatus::Pending,
            moderator_id: None,
            created_by: Some(1),
            created_at: Utc::now(),
            modified_at: None,
            code_count: None,
            message: None,
        };
        assert!(record.is_published());

        let phenotype = PublicationRecord {
            entity: EntityRef::phenotype(1),
            ..record
        };
        assert!(!phenotype.is_published());
    }
}
