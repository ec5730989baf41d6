//! View/edit decision rules.
//!
//! The functions here are pure: the database layer gathers the facts
//! (live entity access fields, the publication record of the resolved
//! revision, the actor's groups, the brand scope) and asks for a decision.
//! Nothing here touches state.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::models::{AccessLevel, Actor, ApprovalStatus, GroupId, TagId, UserId};

/// Why access was granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Grant {
    Superuser,
    Published,
    Owner,
    WorldAccess,
    GroupAccess,
    ModeratorReview,
}

/// Why access was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Denial {
    /// No rule granted access.
    NoMatchingRule,
    /// Anonymous caller and the revision is not published.
    NotPublished,
    /// A rule granted access but the entity is outside the brand's collections.
    OutsideBrandScope,
    /// The deployment is read-only.
    ReadOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessDecision {
    Granted(Grant),
    Denied(Denial),
}

impl AccessDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Granted(_))
    }
}

/// Brand restriction on visible collections.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BrandScope {
    #[default]
    Unrestricted,
    Collections(BTreeSet<TagId>),
}

impl BrandScope {
    /// Scope from the collaborator's answer. No configured set, or an empty
    /// one, means no restriction.
    pub fn from_collections(collections: Option<BTreeSet<TagId>>) -> Self {
        match collections {
            Some(set) if !set.is_empty() => Self::Collections(set),
            _ => Self::Unrestricted,
        }
    }

    /// Whether an entity carrying `collections` is visible under this scope.
    pub fn admits(&self, collections: &[TagId]) -> bool {
        match self {
            Self::Unrestricted => true,
            Self::Collections(allowed) => collections.iter().any(|c| allowed.contains(c)),
        }
    }
}

/// Facts about the entity (and resolved revision) needed for a decision.
///
/// Access fields come from the live entity; `revision_status` and
/// `revision_published` describe the specific revision being viewed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessFacts {
    pub owner_id: UserId,
    pub group_id: Option<GroupId>,
    pub group_access: AccessLevel,
    pub world_access: AccessLevel,
    pub revision_status: Option<ApprovalStatus>,
    pub revision_published: bool,
    pub collections: Vec<TagId>,
}

fn in_group_with(facts: &AccessFacts, groups: &BTreeSet<GroupId>, pred: fn(AccessLevel) -> bool) -> bool {
    match facts.group_id {
        Some(group) => groups.contains(&group) && pred(facts.group_access),
        None => false,
    }
}

fn view_grant(actor: &Actor, groups: &BTreeSet<GroupId>, facts: &AccessFacts) -> Result<Grant, Denial> {
    let user = match actor.user() {
        Some(user) => user,
        None if facts.revision_published => return Ok(Grant::Published),
        None => return Err(Denial::NotPublished),
    };

    if user.is_superuser {
        return Ok(Grant::Superuser);
    }
    if facts.revision_published {
        return Ok(Grant::Published);
    }
    if user.id == facts.owner_id {
        return Ok(Grant::Owner);
    }
    if facts.world_access.allows_view() {
        return Ok(Grant::WorldAccess);
    }
    if in_group_with(facts, groups, AccessLevel::allows_view) {
        return Ok(Grant::GroupAccess);
    }
    if user.is_moderator
        && matches!(
            facts.revision_status,
            Some(ApprovalStatus::Pending) | Some(ApprovalStatus::Rejected)
        )
    {
        return Ok(Grant::ModeratorReview);
    }
    Err(Denial::NoMatchingRule)
}

/// Decide whether `actor` may view the entity revision described by `facts`.
pub fn decide_view(
    actor: &Actor,
    groups: &BTreeSet<GroupId>,
    facts: &AccessFacts,
    scope: &BrandScope,
) -> AccessDecision {
    match view_grant(actor, groups, facts) {
        Ok(_) if !scope.admits(&facts.collections) => {
            AccessDecision::Denied(Denial::OutsideBrandScope)
        }
        Ok(grant) => AccessDecision::Granted(grant),
        Err(denial) => AccessDecision::Denied(denial),
    }
}

/// Decide whether `actor` may edit the live entity described by `facts`.
pub fn decide_edit(
    actor: &Actor,
    groups: &BTreeSet<GroupId>,
    facts: &AccessFacts,
    scope: &BrandScope,
    read_only: bool,
) -> AccessDecision {
    if read_only {
        return AccessDecision::Denied(Denial::ReadOnly);
    }
    let user = match actor.user() {
        Some(user) => user,
        None => return AccessDecision::Denied(Denial::NoMatchingRule),
    };

    let grant = if user.is_superuser {
        Grant::Superuser
    } else if user.id == facts.owner_id {
        Grant::Owner
    } else if facts.world_access.allows_edit() {
        Grant::WorldAccess
    } else if in_group_with(facts, groups, AccessLevel::allows_edit) {
        Grant::GroupAccess
    } else {
        return AccessDecision::Denied(Denial::NoMatchingRule);
    };

    if !scope.admits(&facts.collections) {
        return AccessDecision::Denied(Denial::OutsideBrandScope);
    }
    AccessDecision::Granted(grant)
}
