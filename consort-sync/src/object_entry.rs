//! Bookkeeping for one shared object.
//!
//! ```text
//!            local set                         server echo / remote write
//!               │                                        │
//!               ▼                                        ▼
//!   apply_local_property_change            apply_incoming_property_change
//!     push LocalUpdate (FIFO)                ack?  → pop head, reapply if flagged
//!     publish PropertyChanged                remote + pending + RejectAndNotify
//!                                                  → drop pending, conflict event
//!                                            remote + pending + Overwrite
//!                                                  → flag pending for reapply
//!                                            ETag always advances
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::context::ClientContext;
use crate::entry_map::{Entry, EntryState};
use crate::error::SyncError;
use crate::events::ConflictDetails;
use crate::ids::{ClientId, ETag, ObjectId, ParentId};
use crate::observable::{ChangeFeed, ObjectRef, Origin, SharedObject, Subscription};
use crate::schema::{ConcurrencyPolicy, PropertyDescriptor, PropertyValue, TypeDescriptor, ValueKind};
use crate::wire::{ObjectState, Payload, PropertyKey, PropertySnapshot, PropertyUpdate};

/// A local write awaiting its echo from the server.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalUpdate {
    pub update_id: u32,
    pub value: PropertyValue,
    pub previous_etag: ETag,
    /// A remote write landed while this one was in flight; reassert it on ack.
    pub reapply: bool,
}

#[derive(Debug, Clone)]
pub struct SharedProperty {
    index: u32,
    name: String,
    kind: ValueKind,
    server_applied: bool,
    policy: ConcurrencyPolicy,
    value: PropertyValue,
    etag: ETag,
    pending: VecDeque<LocalUpdate>,
}

impl SharedProperty {
    fn declared(index: usize, descriptor: &PropertyDescriptor) -> Self {
        Self {
            index: index as u32,
            name: descriptor.name.clone(),
            kind: descriptor.kind,
            server_applied: descriptor.server_applied,
            policy: descriptor.policy,
            value: PropertyValue::Null,
            etag: ETag::INITIAL,
            pending: VecDeque::new(),
        }
    }

    fn dynamic(index: usize, name: &str) -> Self {
        Self {
            index: index as u32,
            name: name.to_string(),
            kind: ValueKind::Any,
            server_applied: false,
            policy: ConcurrencyPolicy::Overwrite,
            value: PropertyValue::Null,
            etag: ETag::INITIAL,
            pending: VecDeque::new(),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    pub fn is_server_applied(&self) -> bool {
        self.server_applied
    }

    pub fn policy(&self) -> ConcurrencyPolicy {
        self.policy
    }

    pub fn value(&self) -> &PropertyValue {
        &self.value
    }

    pub fn etag(&self) -> ETag {
        self.etag
    }

    pub fn pending(&self) -> impl Iterator<Item = &LocalUpdate> {
        self.pending.iter()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Where an object sits: which container, and at what index for ordered ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentRef {
    pub container: ParentId,
    pub position: Option<usize>,
}

impl ParentRef {
    pub fn root() -> Self {
        Self {
            container: ParentId::Root,
            position: None,
        }
    }

    pub fn unordered(container: ParentId) -> Self {
        Self {
            container,
            position: None,
        }
    }

    pub fn ordered(container: ParentId, position: usize) -> Self {
        Self {
            container,
            position: Some(position),
        }
    }
}

pub struct ObjectEntry {
    id: ObjectId,
    name: Option<String>,
    owner: ClientId,
    descriptor: Arc<TypeDescriptor>,
    object: ObjectRef,
    properties: Vec<SharedProperty>,
    slots: HashMap<String, usize>,
    parents: HashMap<ParentId, ParentRef>,
    state: EntryState,
    open_count: usize,
    subscription: Option<Subscription>,
}

impl ObjectEntry {
    /// Start tracking a local instance the server has not seen yet.
    pub fn outgoing(
        id: ObjectId,
        name: Option<String>,
        owner: ClientId,
        object: ObjectRef,
        feed: &ChangeFeed,
    ) -> Self {
        let descriptor = object.borrow().descriptor().clone();
        let mut entry = Self::empty(id, name, owner, descriptor, object, feed);
        let current: Vec<(String, PropertyValue)> = entry
            .object
            .borrow()
            .values()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        for (name, value) in current {
            if let Some(slot) = entry.slot_or_insert(&name) {
                entry.properties[slot].value = value;
            }
        }
        entry
    }

    /// Track an object described by the server, reusing `object` when the
    /// application supplied the instance (named open).
    pub fn incoming(
        state: &ObjectState,
        object: Option<ObjectRef>,
        feed: &ChangeFeed,
    ) -> Result<Self, SyncError> {
        let object = object
            .unwrap_or_else(|| SharedObject::with_descriptor(Arc::new(state.descriptor.clone())));
        let descriptor = object.borrow().descriptor().clone();
        let mut entry = Self::empty(
            state.id,
            state.name.clone(),
            state.owner,
            descriptor,
            object,
            feed,
        );
        entry.sync_from_state(state)?;
        Ok(entry)
    }

    fn empty(
        id: ObjectId,
        name: Option<String>,
        owner: ClientId,
        descriptor: Arc<TypeDescriptor>,
        object: ObjectRef,
        feed: &ChangeFeed,
    ) -> Self {
        let properties: Vec<SharedProperty> = descriptor
            .properties
            .iter()
            .enumerate()
            .map(|(index, p)| SharedProperty::declared(index, p))
            .collect();
        let slots = properties
            .iter()
            .enumerate()
            .map(|(slot, p)| (p.name.clone(), slot))
            .collect();
        let subscription = Subscription::to_object(&object, feed);
        Self {
            id,
            name,
            owner,
            descriptor,
            object,
            properties,
            slots,
            parents: HashMap::new(),
            state: EntryState::Pending,
            open_count: 0,
            subscription: Some(subscription),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub(crate) fn set_name(&mut self, name: Option<String>) {
        self.name = name;
    }

    pub fn owner(&self) -> ClientId {
        self.owner
    }

    pub fn descriptor(&self) -> &Arc<TypeDescriptor> {
        &self.descriptor
    }

    pub fn object(&self) -> &ObjectRef {
        &self.object
    }

    pub fn state(&self) -> EntryState {
        self.state
    }

    pub fn property(&self, name: &str) -> Option<&SharedProperty> {
        self.slots.get(name).map(|slot| &self.properties[*slot])
    }

    pub fn parents(&self) -> impl Iterator<Item = &ParentRef> {
        self.parents.values()
    }

    pub fn parent_count(&self) -> usize {
        self.parents.len()
    }

    pub fn has_parent(&self, container: ParentId) -> bool {
        self.parents.contains_key(&container)
    }

    pub fn open_count(&self) -> usize {
        self.open_count
    }

    pub(crate) fn retain_open(&mut self) -> usize {
        self.open_count += 1;
        self.open_count
    }

    pub(crate) fn release_open(&mut self) -> usize {
        self.open_count = self.open_count.saturating_sub(1);
        self.open_count
    }

    /// Any property still has unacknowledged writes.
    pub fn waiting_for_acks(&self) -> bool {
        self.properties.iter().any(|p| !p.pending.is_empty())
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_some()
    }

    /// Snapshot sent to the server when this object is opened or inserted.
    pub fn to_state(&self) -> ObjectState {
        ObjectState {
            id: self.id,
            name: self.name.clone(),
            owner: self.owner,
            descriptor: (*self.descriptor).clone(),
            properties: self
                .properties
                .iter()
                .map(|p| PropertySnapshot {
                    name: p.name.clone(),
                    value: p.value.clone(),
                    etag: p.etag,
                })
                .collect(),
        }
    }

    /// Adopt the server's values. Properties with writes in flight keep the
    /// local value; their echoes will settle them.
    pub fn sync_from_state(&mut self, state: &ObjectState) -> Result<(), SyncError> {
        for snapshot in &state.properties {
            let Some(slot) = self.slot_or_insert(&snapshot.name) else {
                log::warn!(
                    "object {}: server knows property '{}' missing from {}",
                    self.id,
                    snapshot.name,
                    self.descriptor.name
                );
                continue;
            };
            let property = &mut self.properties[slot];
            property.etag = snapshot.etag;
            if property.pending.is_empty() {
                self.object
                    .borrow_mut()
                    .write(&property.name, snapshot.value.clone(), Origin::Remote)?;
                property.value = snapshot.value.clone();
            }
        }
        self.state = EntryState::Connected;
        Ok(())
    }

    pub(crate) fn mark_connected(&mut self) {
        if self.state == EntryState::Pending {
            self.state = EntryState::Connected;
        }
    }

    /// Pending writes are dropped; a resynchronization settles the values.
    pub(crate) fn mark_faulted(&mut self) {
        if self.state == EntryState::Disposed {
            return;
        }
        for property in &mut self.properties {
            property.pending.clear();
        }
        self.state = EntryState::Faulted;
    }

    fn slot_or_insert(&mut self, name: &str) -> Option<usize> {
        if let Some(slot) = self.slots.get(name) {
            return Some(*slot);
        }
        if !self.descriptor.dynamic {
            return None;
        }
        let slot = self.properties.len();
        self.properties.push(SharedProperty::dynamic(slot, name));
        self.slots.insert(name.to_string(), slot);
        Some(slot)
    }

    fn key_for(&self, slot: usize) -> PropertyKey {
        let property = &self.properties[slot];
        if self.descriptor.dynamic {
            PropertyKey::Name(property.name.clone())
        } else {
            PropertyKey::Index(property.index)
        }
    }

    fn require_live(&self, what: &str) -> Result<(), SyncError> {
        match self.state {
            EntryState::Faulted => Err(SyncError::Faulted(self.id.as_uuid())),
            state if !state.is_live() => Err(SyncError::NotConnected(format!(
                "{what} on object {} ({state:?})",
                self.id
            ))),
            _ if self.parents.is_empty() => Err(SyncError::NotConnected(format!(
                "{what} on object {} which has no parent",
                self.id
            ))),
            _ => Ok(()),
        }
    }

    /// Record and publish a write the application made to the instance.
    pub fn apply_local_property_change(
        &mut self,
        name: &str,
        value: PropertyValue,
        ctx: &ClientContext,
    ) -> Result<(), SyncError> {
        self.require_live(&format!("set '{name}'"))?;
        ctx.require_connected(&format!("set '{name}' on object {}", self.id))?;

        let slot = self.slot_or_insert(name).ok_or_else(|| SyncError::UnknownProperty {
            type_name: self.descriptor.name.clone(),
            property: name.to_string(),
        })?;
        let key = self.key_for(slot);
        let limit = ctx.config().max_pending_updates;
        let property = &mut self.properties[slot];

        if property.server_applied {
            return Err(SyncError::ServerAppliedProperty {
                property: name.to_string(),
            });
        }
        if !property.kind.accepts(&value) {
            return Err(SyncError::ValueKindMismatch {
                property: name.to_string(),
                expected: property.kind.to_string(),
                actual: value.kind().to_string(),
            });
        }
        if property.pending.len() >= limit {
            return Err(SyncError::Backpressure {
                what: format!("property '{name}' of object {}", self.id),
                limit,
            });
        }

        let update_id = ctx.next_update_id();
        property.value = value.clone();
        property.pending.push_back(LocalUpdate {
            update_id,
            value: value.clone(),
            previous_etag: property.etag,
            reapply: false,
        });
        log::debug!(
            "object {}: local '{}' update {update_id} ({} pending)",
            self.id,
            name,
            property.pending.len()
        );
        ctx.publish(Payload::PropertyChanged(PropertyUpdate {
            object: self.id,
            property: key,
            previous_etag: property.etag,
            etag: property.etag,
            value,
            update_id,
        }));
        Ok(())
    }

    /// Put the last reconciled value back on the instance after a rejected
    /// local write.
    pub(crate) fn restore_property(&mut self, name: &str) {
        let Some(slot) = self.slots.get(name) else {
            return;
        };
        let value = self.properties[*slot].value.clone();
        if let Err(error) = self.object.borrow_mut().write(name, value, Origin::Remote) {
            log::warn!("object {}: could not restore '{name}': {error}", self.id);
        }
    }

    /// Reconcile a server-delivered write. Returns conflict details when
    /// pending local writes were rejected.
    pub fn apply_incoming_property_change(
        &mut self,
        sender: ClientId,
        update: &PropertyUpdate,
        ctx: &ClientContext,
    ) -> Result<Option<ConflictDetails>, SyncError> {
        let slot = match &update.property {
            PropertyKey::Index(index) => {
                let index = *index as usize;
                if index >= self.descriptor.properties.len() {
                    return Err(SyncError::UnexpectedPayload(sender));
                }
                index
            }
            PropertyKey::Name(name) => self
                .slot_or_insert(name)
                .ok_or(SyncError::UnexpectedPayload(sender))?,
        };
        let from_self = sender == ctx.client_id();
        let property = &mut self.properties[slot];

        let mut apply = true;
        if from_self {
            match property.pending.front() {
                Some(head) if head.update_id == update.update_id => {
                    apply = head.reapply;
                    property.pending.pop_front();
                }
                Some(head) => {
                    return Err(SyncError::UnexpectedAck {
                        subject: self.id.as_uuid(),
                        detail: format!(
                            "'{}' expected update {}, received {}",
                            property.name, head.update_id, update.update_id
                        ),
                    });
                }
                // Echo of a write abandoned locally; it is server state now.
                None => {}
            }
        }

        let conflict = !from_self
            && !property.pending.is_empty()
            && !property.server_applied
            && property.policy != ConcurrencyPolicy::Overwrite;

        if !from_self && !conflict {
            for pending in property.pending.iter_mut() {
                pending.reapply = true;
            }
        }

        if apply {
            self.object
                .borrow_mut()
                .write(&property.name, update.value.clone(), Origin::Remote)?;
            property.value = update.value.clone();
        }
        property.etag = update.etag;

        if !conflict {
            return Ok(None);
        }
        let rejected: Vec<PropertyValue> = property.pending.drain(..).map(|u| u.value).collect();
        log::warn!(
            "object {}: {} local write(s) to '{}' rejected by client {sender}",
            self.id,
            rejected.len(),
            property.name
        );
        Ok(Some(ConflictDetails {
            property: property.name.clone(),
            accepted: update.value.clone(),
            rejected,
        }))
    }

    pub fn add_parent(&mut self, parent: ParentRef) {
        self.parents.insert(parent.container, parent);
    }

    pub fn set_position(&mut self, container: ParentId, position: usize) {
        if let Some(parent) = self.parents.get_mut(&container) {
            parent.position = Some(position);
        }
    }

    /// Drop one parent reference. Returns true when that was the last one and
    /// the entry is now disposed.
    pub fn remove_parent(&mut self, container: ParentId) -> bool {
        self.parents.remove(&container);
        if self.parents.is_empty() {
            self.dispose();
            return true;
        }
        false
    }

    /// Release the subscription and forget pending writes.
    pub fn dispose(&mut self) {
        self.subscription.take();
        for property in &mut self.properties {
            property.pending.clear();
        }
        self.parents.clear();
        self.state = EntryState::Disposed;
    }

    /// Channel lost: in-flight writes are abandoned.
    pub fn on_disconnect(&mut self) {
        for property in &mut self.properties {
            property.pending.clear();
        }
        if self.state != EntryState::Disposed {
            self.state = EntryState::Disconnected;
        }
    }
}

impl Entry for ObjectEntry {
    type Id = ObjectId;

    fn id(&self) -> ObjectId {
        self.id
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}
