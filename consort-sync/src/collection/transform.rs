//! Index-based list transform for ordered collections.
//!
//! `transform(remote, local)` adjusts an incoming operation and one pending
//! local operation so that applying them in either order yields the same list:
//!
//! ```text
//!  remote \ local │ Insert(j)                       │ Remove(j)
//!  ───────────────┼─────────────────────────────────┼──────────────────────────
//!  Insert(i)      │ i<j or (i=j, remote client      │ i<=j → local j+1
//!                 │ lower) → local j+1, else i+1    │ else  → remote i-1
//!  Remove(i)      │ i<j  → local j-1                │ i<j → local j-1
//!                 │ else → remote i+1               │ i>j → remote i-1
//!                 │                                 │ i=j → both dead
//! ```
//!
//! Dead operations are kept (the local one still has to be acknowledged) but
//! never applied and never shift anything.

use crate::ids::{ClientId, CollectionId, ObjectId};
use crate::wire::{CollectionAction, ObjectState, OperationPayload};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionOperation {
    pub action: CollectionAction,
    pub object: ObjectId,
    pub index: usize,
    pub sequence: u64,
    pub client: ClientId,
    /// Cleared when a concurrent operation made this one redundant.
    pub live: bool,
}

impl CollectionOperation {
    pub fn insert(object: ObjectId, index: usize, sequence: u64, client: ClientId) -> Self {
        Self {
            action: CollectionAction::Insert,
            object,
            index,
            sequence,
            client,
            live: true,
        }
    }

    pub fn remove(object: ObjectId, index: usize, sequence: u64, client: ClientId) -> Self {
        Self {
            action: CollectionAction::Remove,
            object,
            index,
            sequence,
            client,
            live: true,
        }
    }

    pub fn from_payload(client: ClientId, payload: &OperationPayload) -> Self {
        Self {
            action: payload.action,
            object: payload.object,
            index: payload.index as usize,
            sequence: payload.sequence,
            client,
            live: true,
        }
    }

    pub fn to_payload(&self, collection: CollectionId, state: Option<ObjectState>) -> OperationPayload {
        OperationPayload {
            collection,
            action: self.action,
            object: self.object,
            index: self.index as u32,
            sequence: self.sequence,
            state,
            applied: true,
        }
    }

    pub fn is_insert(&self) -> bool {
        self.action == CollectionAction::Insert
    }

    pub fn is_remove(&self) -> bool {
        self.action == CollectionAction::Remove
    }
}

/// Make `remote` and `local` commute. Both are adjusted in place.
pub fn transform(remote: &mut CollectionOperation, local: &mut CollectionOperation) {
    if !remote.live || !local.live {
        return;
    }
    let (i, j) = (remote.index, local.index);
    match (remote.action, local.action) {
        (CollectionAction::Insert, CollectionAction::Insert) => {
            if i < j || (i == j && remote.client < local.client) {
                local.index += 1;
            } else {
                remote.index += 1;
            }
        }
        (CollectionAction::Insert, CollectionAction::Remove) => {
            if i <= j {
                local.index += 1;
            } else {
                remote.index -= 1;
            }
        }
        (CollectionAction::Remove, CollectionAction::Insert) => {
            if i < j {
                local.index -= 1;
            } else {
                remote.index += 1;
            }
        }
        (CollectionAction::Remove, CollectionAction::Remove) => {
            if i < j {
                local.index -= 1;
            } else if i > j {
                remote.index -= 1;
            } else {
                remote.live = false;
                local.live = false;
            }
        }
    }
}

/// Transform `remote` against every pending operation, oldest first.
pub fn transform_all<'a>(
    remote: &mut CollectionOperation,
    pending: impl IntoIterator<Item = &'a mut CollectionOperation>,
) {
    for local in pending {
        transform(remote, local);
    }
}

/// CRC-32 over the member order, compared by heartbeats.
pub fn checksum(indices: &[ObjectId]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for id in indices {
        hasher.update(id.as_uuid().as_bytes());
    }
    hasher.finalize()
}
