//! Events surfaced to the application.
//!
//! Conflicts and faults share one channel ([`SyncEvent::Error`]) so callers can
//! decide in one place whether to retry or abandon.

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{ErrorKind, SyncError};
use crate::ids::{CollectionId, ObjectId};
use crate::schema::PropertyValue;

/// The entry an event is about.
#[derive(Debug, Clone, PartialEq)]
pub struct Subject {
    pub id: Uuid,
    pub name: Option<String>,
}

impl Subject {
    pub fn object(id: ObjectId, name: Option<&str>) -> Self {
        Self {
            id: id.as_uuid(),
            name: name.map(str::to_string),
        }
    }

    pub fn collection(id: CollectionId, name: &str) -> Self {
        Self {
            id: id.as_uuid(),
            name: Some(name.to_string()),
        }
    }
}

/// Values involved in a rejected concurrent write.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictDetails {
    pub property: String,
    /// Value the server settled on.
    pub accepted: PropertyValue,
    /// Local writes discarded, oldest first.
    pub rejected: Vec<PropertyValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorEvent {
    pub kind: ErrorKind,
    pub description: String,
    pub subject: Option<Subject>,
    pub conflict: Option<ConflictDetails>,
}

impl ErrorEvent {
    pub fn from_error(error: &SyncError, subject: Option<Subject>) -> Self {
        Self {
            kind: error.kind(),
            description: error.to_string(),
            subject,
            conflict: None,
        }
    }

    pub fn conflict(subject: Subject, details: ConflictDetails) -> Self {
        Self {
            kind: ErrorKind::Conflict,
            description: format!(
                "{} local write(s) to '{}' rejected by a concurrent update",
                details.rejected.len(),
                details.property
            ),
            subject: Some(subject),
            conflict: Some(details),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    /// Conflict or fault.
    Error(ErrorEvent),
    ObjectDeleted {
        id: ObjectId,
        name: Option<String>,
    },
    CollectionDeleted {
        id: CollectionId,
        name: String,
    },
}

/// Sending half of the event channel, shared by both managers.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<SyncEvent>,
}

impl EventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SyncEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: SyncEvent) {
        // The application may have dropped its receiver; events are advisory.
        let _ = self.tx.send(event);
    }

    pub fn fault(&self, error: &SyncError, subject: Option<Subject>) {
        self.emit(SyncEvent::Error(ErrorEvent::from_error(error, subject)));
    }
}
