//! Publication workflow rules.
//!
//! Each (entity, revision) pair has at most one publication record. The
//! lifecycle is:
//!
//! ```text
//! Unpublished --request--> Pending --approve--> Approved (terminal)
//!                             |                    ^
//!                             +--reject--> Rejected+
//!                                            |
//!                                            +--request--> Pending
//! ```
//!
//! Concepts skip moderation: a request writes the record Approved.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{Actor, ApprovalStatus, EntityType};

/// Workflow actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishAction {
    Request,
    Approve,
    Reject,
}

impl PublishAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Approve => "approve",
            Self::Reject => "reject",
        }
    }
}

/// Status after applying `action` to a record currently in `current`
/// (`None` = unpublished).
pub fn next_status(
    entity_type: EntityType,
    current: Option<ApprovalStatus>,
    action: PublishAction,
) -> Result<ApprovalStatus> {
    if !entity_type.is_publishable() {
        return Err(Error::InvalidInput(format!("{} cannot be published", entity_type)));
    }

    if !entity_type.requires_moderation() {
        return match (current, action) {
            (None, PublishAction::Request) => Ok(ApprovalStatus::Approved),
            (Some(_), PublishAction::Request) => Err(invalid("This revision is already published")),
            (_, _) => Err(invalid("Concepts are published without moderation")),
        };
    }

    use ApprovalStatus::*;
    match (current, action) {
        (Some(Approved), _) => Err(invalid("This revision is already published")),

        (None, PublishAction::Request) | (Some(Rejected), PublishAction::Request) => Ok(Pending),
        (Some(Requested), PublishAction::Request) | (Some(Pending), PublishAction::Request) => {
            Err(invalid("This revision is already awaiting review"))
        }

        (Some(Requested), PublishAction::Approve)
        | (Some(Pending), PublishAction::Approve)
        | (Some(Rejected), PublishAction::Approve) => Ok(Approved),

        (Some(Requested), PublishAction::Reject) | (Some(Pending), PublishAction::Reject) => {
            Ok(Rejected)
        }
        (Some(Rejected), PublishAction::Reject) => Err(invalid("This revision is already rejected")),

        (None, PublishAction::Approve) | (None, PublishAction::Reject) => {
            Err(invalid("This revision has not been submitted for publication"))
        }
    }
}

fn invalid(message: &str) -> Error {
    Error::validation("approval_status", message)
}

/// Check that `actor` may perform `action`.
///
/// `can_edit` is the edit decision for the live entity; `live_deleted`
/// reflects the live row's soft-delete flag.
pub fn authorize(
    action: PublishAction,
    actor: &Actor,
    can_edit: bool,
    live_deleted: bool,
) -> Result<()> {
    if live_deleted {
        return Err(Error::PermissionDenied(
            "Deleted entities cannot change publication state".to_string(),
        ));
    }
    match action {
        PublishAction::Request if can_edit => Ok(()),
        PublishAction::Request => Err(Error::PermissionDenied(
            "Only the owner or an editor can request publication".to_string(),
        )),
        PublishAction::Approve | PublishAction::Reject if actor.is_moderator() => Ok(()),
        PublishAction::Approve | PublishAction::Reject => Err(Error::PermissionDenied(format!(
            "Only moderators can {} publication requests",
            action.as_str()
        ))),
    }
}

/// Only moderators may see the review queue.
pub fn authorize_review_queue(actor: &Actor) -> Result<()> {
    if actor.is_moderator() {
        Ok(())
    } else {
        Err(Error::PermissionDenied(
            "Only moderators can list publication requests".to_string(),
        ))
    }
}

/// Reject publication of a definition with nothing in it.
///
/// `resolvable` is the number of codes (concepts) or concept references
/// (phenotypes and working sets) in the revision.
pub fn ensure_publishable_content(entity_type: EntityType, resolvable: usize) -> Result<()> {
    if resolvable > 0 {
        return Ok(());
    }
    match entity_type {
        EntityType::Concept => Err(Error::validation(
            "codes",
            "A concept with no codes cannot be published",
        )),
        _ => Err(Error::validation(
            "concepts",
            format!("A {} with no concepts cannot be published", entity_type),
        )),
    }
}
