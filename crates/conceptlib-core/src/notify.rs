//! Notifications for publication workflow transitions.
//!
//! Delivery belongs to an external collaborator. The core only hands a
//! [`Notification`] to a [`Notifier`] after the transition has committed;
//! nothing it returns is consulted and a failed hand-off is logged, never
//! retried.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{ApprovalStatus, EntityRef, RevisionId, UserId};

/// One message for one recipient.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub event_id: Uuid,
    pub recipient_id: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient_email: Option<String>,
    pub subject: String,
    pub body: String,
    pub entity: EntityRef,
    pub revision_id: RevisionId,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    /// Notice about a publication record reaching `status`.
    ///
    /// `message` is the moderator's feedback, if any.
    pub fn publication(
        recipient_id: UserId,
        recipient_email: Option<String>,
        entity: EntityRef,
        entity_name: &str,
        revision_id: RevisionId,
        status: ApprovalStatus,
        message: Option<&str>,
    ) -> Self {
        let (subject, mut body) = match status {
            ApprovalStatus::Approved => (
                format!("{} - {} published", entity, entity_name),
                format!("Revision {} of {} has been approved and is now public.", revision_id, entity),
            ),
            ApprovalStatus::Rejected => (
                format!("{} - {} declined", entity, entity_name),
                format!("Revision {} of {} was declined by a moderator.", revision_id, entity),
            ),
            ApprovalStatus::Requested | ApprovalStatus::Pending => (
                format!("{} - {} submitted for review", entity, entity_name),
                format!("Revision {} of {} is awaiting moderation.", revision_id, entity),
            ),
        };
        if let Some(message) = message.filter(|m| !m.trim().is_empty()) {
            body.push_str("\n\n");
            body.push_str(message);
        }
        Self {
            event_id: Uuid::now_v7(),
            recipient_id,
            recipient_email,
            subject,
            body,
            entity,
            revision_id,
            status,
            created_at: Utc::now(),
        }
    }
}

/// Fire-and-forget notification sink.
pub trait Notifier: Send + Sync {
    fn send_notification(&self, notification: Notification);
}

/// Logs notifications and drops them. Used when no delivery is wired up.
#[derive(Debug, Clone, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn send_notification(&self, notification: Notification) {
        info!(
            subsystem = "core",
            component = "notify",
            event_id = %notification.event_id,
            recipient_id = notification.recipient_id,
            entity = %notification.entity,
            revision_id = notification.revision_id,
            status = ?notification.status,
            "Notification: {}",
            notification.subject
        );
    }
}

/// Hands notifications to a bounded channel without waiting.
///
/// A full or closed channel drops the notification with a warning.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::Sender<Notification>,
}

impl ChannelNotifier {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn send_notification(&self, notification: Notification) {
        let event_id = notification.event_id;
        if let Err(e) = self.tx.try_send(notification) {
            warn!(
                subsystem = "core",
                component = "notify",
                event_id = %event_id,
                error = %e,
                "Notification dropped"
            );
        }
    }
}
