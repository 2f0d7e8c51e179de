//! Payloads exchanged with the server.
//!
//! Envelope layout (bincode-encoded):
//! ```text
//! ┌───────────┬─────────────┬──────────────────────────────┐
//! │ client    │ correlation │ payload (tagged by kind)     │
//! │ 16 bytes  │ varint u32  │ variable                     │
//! └───────────┴─────────────┴──────────────────────────────┘
//! ```
//!
//! The same payload kinds flow in both directions: a client publishes
//! `PropertyChanged` / `ObjectInserted` / `ObjectRemoved` / `Heartbeat`, and the
//! server broadcasts them back (to the sender as an acknowledgement). Open,
//! close and delete requests only flow client → server; opened, connected and
//! deleted notifications only flow server → client.

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::ids::{ClientId, CollectionId, ETag, ObjectId};
use crate::schema::{CollectionKind, PropertyValue, TypeDescriptor};

/// Logical channel a payload travels on. Delivery is ordered per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Channel {
    Objects = 1,
    Collections = 2,
}

/// One property of an object as known by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySnapshot {
    pub name: String,
    pub value: PropertyValue,
    pub etag: ETag,
}

/// Full description of a shared object, sent on open and on insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectState {
    pub id: ObjectId,
    pub name: Option<String>,
    pub owner: ClientId,
    pub descriptor: TypeDescriptor,
    pub properties: Vec<PropertySnapshot>,
}

impl ObjectState {
    pub fn property(&self, name: &str) -> Option<&PropertySnapshot> {
        self.properties.iter().find(|p| p.name == name)
    }
}

/// Full description of a shared collection, sent in reply to an open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionState {
    pub id: CollectionId,
    pub name: String,
    pub owner: ClientId,
    pub kind: CollectionKind,
    /// Last operation sequence applied by the server (ordered only).
    pub sequence: u64,
    pub members: Vec<ObjectState>,
}

/// Addresses a property: by ordinal for fixed types, by name for dynamic ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyKey {
    Index(u32),
    Name(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyUpdate {
    pub object: ObjectId,
    pub property: PropertyKey,
    /// ETag the writer last saw; the server uses it to detect stale writes.
    pub previous_etag: ETag,
    /// ETag assigned by the server. Clients send `previous_etag` here.
    pub etag: ETag,
    pub value: PropertyValue,
    /// Client-local sequence used to match acknowledgements.
    pub update_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CollectionAction {
    Insert,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationPayload {
    pub collection: CollectionId,
    pub action: CollectionAction,
    pub object: ObjectId,
    pub index: u32,
    /// Outgoing: the last sequence the client applied. Incoming: the sequence
    /// the server assigned. Unused by unordered collections.
    pub sequence: u64,
    /// Object description carried by inserts so receivers can materialize it.
    pub state: Option<ObjectState>,
    /// False when the server sequenced the operation without changing the
    /// collection. Always true on outgoing operations.
    pub applied: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    OpenObject { name: String, state: ObjectState },
    CloseObject { id: ObjectId },
    DeleteObject { id: ObjectId },
    OpenCollection {
        name: String,
        id: CollectionId,
        kind: CollectionKind,
    },
    CloseCollection { id: CollectionId },
    DeleteCollection { id: CollectionId },

    ObjectOpened { state: ObjectState },
    ObjectConnected { id: ObjectId },
    ObjectDeleted { id: ObjectId },
    PropertyChanged(PropertyUpdate),

    CollectionOpened { state: CollectionState },
    CollectionConnected { id: CollectionId },
    CollectionDeleted { id: CollectionId },
    ObjectInserted(OperationPayload),
    ObjectRemoved(OperationPayload),
    Heartbeat {
        collection: CollectionId,
        sequence: u64,
        checksum: u32,
    },
}

/// Payload discriminant, used to split batches into runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    OpenObject,
    CloseObject,
    DeleteObject,
    OpenCollection,
    CloseCollection,
    DeleteCollection,
    ObjectOpened,
    ObjectConnected,
    ObjectDeleted,
    PropertyChanged,
    CollectionOpened,
    CollectionConnected,
    CollectionDeleted,
    ObjectInserted,
    ObjectRemoved,
    Heartbeat,
}

impl Payload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Self::OpenObject { .. } => PayloadKind::OpenObject,
            Self::CloseObject { .. } => PayloadKind::CloseObject,
            Self::DeleteObject { .. } => PayloadKind::DeleteObject,
            Self::OpenCollection { .. } => PayloadKind::OpenCollection,
            Self::CloseCollection { .. } => PayloadKind::CloseCollection,
            Self::DeleteCollection { .. } => PayloadKind::DeleteCollection,
            Self::ObjectOpened { .. } => PayloadKind::ObjectOpened,
            Self::ObjectConnected { .. } => PayloadKind::ObjectConnected,
            Self::ObjectDeleted { .. } => PayloadKind::ObjectDeleted,
            Self::PropertyChanged(_) => PayloadKind::PropertyChanged,
            Self::CollectionOpened { .. } => PayloadKind::CollectionOpened,
            Self::CollectionConnected { .. } => PayloadKind::CollectionConnected,
            Self::CollectionDeleted { .. } => PayloadKind::CollectionDeleted,
            Self::ObjectInserted(_) => PayloadKind::ObjectInserted,
            Self::ObjectRemoved(_) => PayloadKind::ObjectRemoved,
            Self::Heartbeat { .. } => PayloadKind::Heartbeat,
        }
    }

    /// Channel this payload travels on.
    pub fn channel(&self) -> Channel {
        match self {
            Self::OpenObject { .. }
            | Self::CloseObject { .. }
            | Self::DeleteObject { .. }
            | Self::ObjectOpened { .. }
            | Self::ObjectConnected { .. }
            | Self::ObjectDeleted { .. }
            | Self::PropertyChanged(_) => Channel::Objects,
            _ => Channel::Collections,
        }
    }
}

/// Top-level message: who sent it, which request it answers, and what it says.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub client: ClientId,
    /// Request correlation id; 0 when the payload answers nothing.
    pub correlation: u32,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(client: ClientId, payload: Payload) -> Self {
        Self {
            client,
            correlation: 0,
            payload,
        }
    }

    pub fn correlated(client: ClientId, correlation: u32, payload: Payload) -> Self {
        Self {
            client,
            correlation,
            payload,
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, SyncError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| SyncError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, SyncError> {
        let (envelope, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| SyncError::Deserialization(e.to_string()))?;
        Ok(envelope)
    }
}

/// Serialize a whole batch as one frame.
pub fn encode_batch(batch: &[Envelope]) -> Result<Vec<u8>, SyncError> {
    bincode::serde::encode_to_vec(batch, bincode::config::standard())
        .map_err(|e| SyncError::Serialization(e.to_string()))
}

pub fn decode_batch(bytes: &[u8]) -> Result<Vec<Envelope>, SyncError> {
    let (batch, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| SyncError::Deserialization(e.to_string()))?;
    Ok(batch)
}

/// Split a batch into maximal runs of the same payload kind, keeping order.
pub fn split_runs(batch: Vec<Envelope>) -> Vec<(PayloadKind, Vec<Envelope>)> {
    let mut runs: Vec<(PayloadKind, Vec<Envelope>)> = Vec::new();
    for envelope in batch {
        let kind = envelope.payload.kind();
        match runs.last_mut() {
            Some((last, run)) if *last == kind => run.push(envelope),
            _ => runs.push((kind, vec![envelope])),
        }
    }
    runs
}
