//! Error taxonomy for the reconciliation engine.
//!
//! Every fallible call returns [`SyncError`]. Faults detected while reconciling
//! incoming payloads are additionally surfaced on the event channel, classified
//! by [`ErrorKind`].

use thiserror::Error;
use uuid::Uuid;

use crate::ids::{ClientId, CollectionId, ObjectId};

/// Coarse classification used by the event channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Server ordering or acknowledgement invariant broken.
    Protocol,
    /// Ordered collection checksum disagrees with the server.
    Desynchronized,
    /// Concurrent write rejected under `RejectAndNotify`.
    Conflict,
    /// Mutation attempted without a live server relationship.
    NotConnected,
    /// Call made off the dispatcher thread.
    AccessViolation,
    /// Reopen with a different declared type.
    TypeMismatch,
    /// Caller misuse (unknown property, server-applied write, limits).
    Argument,
    /// Envelope could not be encoded or decoded.
    Codec,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SyncError {
    #[error("not connected: {0}")]
    NotConnected(String),

    #[error("access violation: called from a thread that does not own the dispatcher")]
    AccessViolation,

    #[error("'{name}' is already being opened")]
    AlreadyOpening { name: String },

    #[error("'{name}' is open as {existing}, requested {requested}")]
    TypeMismatch {
        name: String,
        existing: String,
        requested: String,
    },

    #[error("unknown property '{property}' on {type_name}")]
    UnknownProperty { type_name: String, property: String },

    #[error("property '{property}' is applied by the server and cannot be written")]
    ServerAppliedProperty { property: String },

    #[error("value for '{property}' has kind {actual}, expected {expected}")]
    ValueKindMismatch {
        property: String,
        expected: String,
        actual: String,
    },

    #[error("object {0} is not tracked")]
    UnknownObject(ObjectId),

    #[error("collection {0} is not tracked")]
    UnknownCollection(CollectionId),

    #[error("nothing named '{0}' is open")]
    UnknownName(String),

    #[error("object {object} is already a member of collection {collection}")]
    DuplicateMember {
        collection: CollectionId,
        object: ObjectId,
    },

    #[error("object {object} is not a member of collection {collection}")]
    MissingMember {
        collection: CollectionId,
        object: ObjectId,
    },

    #[error("index {index} out of bounds for collection {collection} of length {len}")]
    IndexOutOfBounds {
        collection: CollectionId,
        index: usize,
        len: usize,
    },

    #[error("index {index} out of bounds for a container of length {len}")]
    InvalidIndex { index: usize, len: usize },

    #[error("the instance is already in this container")]
    DuplicateInstance,

    #[error("the instance is not tracked by this client")]
    UntrackedInstance,

    #[error("collection {collection}: expected operation sequence {expected}, received {received}")]
    SequenceGap {
        collection: CollectionId,
        expected: u64,
        received: u64,
    },

    #[error("acknowledgement on {subject} does not match the oldest pending local change: {detail}")]
    UnexpectedAck { subject: Uuid, detail: String },

    #[error("collection {collection} diverged from the server at sequence {sequence}")]
    Desynchronized { collection: CollectionId, sequence: u64 },

    #[error("{what} exceeds the limit of {limit} pending changes")]
    Backpressure { what: String, limit: usize },

    #[error("entry {0} is faulted and must be resynchronized")]
    Faulted(Uuid),

    #[error("request {0} was abandoned before completion")]
    RequestAbandoned(u32),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("client {0} sent a payload this client cannot interpret")]
    UnexpectedPayload(ClientId),
}

impl SyncError {
    /// Classify this error for the event channel.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotConnected(_) | Self::Faulted(_) | Self::RequestAbandoned(_) => {
                ErrorKind::NotConnected
            }
            Self::AccessViolation => ErrorKind::AccessViolation,
            Self::TypeMismatch { .. } => ErrorKind::TypeMismatch,
            Self::AlreadyOpening { .. }
            | Self::UnknownProperty { .. }
            | Self::ServerAppliedProperty { .. }
            | Self::ValueKindMismatch { .. }
            | Self::UnknownObject(_)
            | Self::UnknownCollection(_)
            | Self::UnknownName(_)
            | Self::InvalidIndex { .. }
            | Self::DuplicateInstance
            | Self::UntrackedInstance
            | Self::Backpressure { .. }
            | Self::Config(_) => ErrorKind::Argument,
            Self::DuplicateMember { .. }
            | Self::MissingMember { .. }
            | Self::IndexOutOfBounds { .. }
            | Self::SequenceGap { .. }
            | Self::UnexpectedAck { .. }
            | Self::UnexpectedPayload(_) => ErrorKind::Protocol,
            Self::Desynchronized { .. } => ErrorKind::Desynchronized,
            Self::Serialization(_) | Self::Deserialization(_) => ErrorKind::Codec,
        }
    }

    /// Whether this error means the server and client disagree about history.
    pub fn is_protocol_fault(&self) -> bool {
        matches!(self.kind(), ErrorKind::Protocol | ErrorKind::Desynchronized)
    }
}
