//! Lifecycle and routing for shared objects.
//!
//! Named objects are opened through the root (`ParentId::Root`) and are
//! reference counted per open. Unnamed objects become tracked when a
//! collection inserts them and live as long as some container refers to them.

use std::collections::HashMap;
use std::rc::Rc;

use crate::context::ClientContext;
use crate::entry_map::{Entry, EntryMap, EntryState};
use crate::error::SyncError;
use crate::events::{ErrorEvent, Subject, SyncEvent};
use crate::ids::{ClientId, ObjectId, ParentId};
use crate::object_entry::{ObjectEntry, ParentRef};
use crate::observable::{InstanceKey, ObjectRef};
use crate::request::{OpenRequest, PendingRequests};
use crate::schema::PropertyValue;
use crate::wire::{Envelope, ObjectState, Payload, PayloadKind, PropertyUpdate};

pub struct ObjectsManager {
    ctx: Rc<ClientContext>,
    entries: EntryMap<ObjectEntry>,
    by_instance: HashMap<InstanceKey, ObjectId>,
    /// Names with an open request in flight, and its correlation id.
    opening: HashMap<String, u32>,
    requests: PendingRequests<ObjectRef>,
}

impl ObjectsManager {
    pub fn new(ctx: Rc<ClientContext>) -> Self {
        Self {
            ctx,
            entries: EntryMap::new(),
            by_instance: HashMap::new(),
            opening: HashMap::new(),
            requests: PendingRequests::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &ObjectId) -> Option<&ObjectEntry> {
        self.entries.get(id)
    }

    pub fn by_name(&self, name: &str) -> Option<&ObjectEntry> {
        self.entries.by_name(name)
    }

    pub fn entries(&self) -> impl Iterator<Item = &ObjectEntry> {
        self.entries.iter()
    }

    pub fn is_opening(&self, name: &str) -> bool {
        self.opening.contains_key(name)
    }

    /// Id of a tracked instance.
    pub fn id_of(&self, object: &ObjectRef) -> Option<ObjectId> {
        self.by_instance.get(&object.borrow().key()).copied()
    }

    pub fn object_ref(&self, id: ObjectId) -> Option<ObjectRef> {
        self.entries.get(&id).map(|entry| entry.object().clone())
    }

    pub fn state_of(&self, id: ObjectId) -> Option<ObjectState> {
        self.entries.get(&id).map(ObjectEntry::to_state)
    }

    pub fn waiting_for_acks(&self) -> bool {
        self.entries.iter().any(ObjectEntry::waiting_for_acks)
    }

    /// Open (creating on the server if missing) the object called `name`,
    /// backed by `object`.
    ///
    /// Re-opening a connected name with the same type bumps its reference
    /// count and completes immediately with the instance already tracked.
    pub fn open_object(
        &mut self,
        name: &str,
        object: ObjectRef,
    ) -> Result<OpenRequest<ObjectRef>, SyncError> {
        self.ctx.require_connected(&format!("open object '{name}'"))?;
        if self.opening.contains_key(name) {
            return Err(SyncError::AlreadyOpening { name: name.into() });
        }
        if let Some(entry) = self.entries.by_name_mut(name) {
            let requested = object.borrow().descriptor().clone();
            if !entry.descriptor().same_type(&requested) {
                return Err(SyncError::TypeMismatch {
                    name: name.into(),
                    existing: entry.descriptor().name.clone(),
                    requested: requested.name.clone(),
                });
            }
            let count = entry.retain_open();
            log::debug!("object '{name}' reopened ({count} opens)");
            return Ok(OpenRequest::ready(Ok(entry.object().clone())));
        }

        let key = object.borrow().key();
        if self.by_instance.contains_key(&key) {
            return Err(SyncError::DuplicateInstance);
        }
        let mut entry = ObjectEntry::outgoing(
            ObjectId::new(),
            Some(name.to_string()),
            self.ctx.client_id(),
            object,
            self.ctx.feed(),
        );
        entry.add_parent(ParentRef::root());

        let request = self.requests.register();
        self.ctx.publish_correlated(
            request.correlation(),
            Payload::OpenObject {
                name: name.to_string(),
                state: entry.to_state(),
            },
        );
        log::info!("opening object '{name}' as {}", entry.id());
        self.opening.insert(name.to_string(), request.correlation());
        self.by_instance.insert(key, entry.id());
        self.entries.insert(entry);
        Ok(request)
    }

    /// Release one open. The last close detaches the object from the root.
    pub fn close_object(&mut self, name: &str) -> Result<(), SyncError> {
        if self.opening.contains_key(name) {
            return Err(SyncError::AlreadyOpening { name: name.into() });
        }
        let entry = self
            .entries
            .by_name_mut(name)
            .ok_or_else(|| SyncError::UnknownName(name.into()))?;
        let id = entry.id();
        if entry.release_open() > 0 {
            return Ok(());
        }
        if self.ctx.is_connected() {
            self.ctx.publish(Payload::CloseObject { id });
        }
        log::info!("object '{name}' closed");
        self.remove_parent(id, ParentId::Root);
        Ok(())
    }

    /// Ask the server to delete the named object. The entry goes away when
    /// the deletion is broadcast back.
    pub fn delete_object(&mut self, name: &str) -> Result<(), SyncError> {
        self.ctx.require_connected(&format!("delete object '{name}'"))?;
        let id = self
            .entries
            .id_for_name(name)
            .ok_or_else(|| SyncError::UnknownName(name.into()))?;
        self.ctx.publish(Payload::DeleteObject { id });
        Ok(())
    }

    /// Track `object` under `parent`, reusing the entry if the instance is
    /// already tracked.
    pub fn track(&mut self, object: &ObjectRef, parent: ParentRef) -> ObjectId {
        let key = object.borrow().key();
        if let Some(id) = self.by_instance.get(&key).copied() {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.add_parent(parent);
                return id;
            }
        }
        let id = ObjectId::new();
        let mut entry = ObjectEntry::outgoing(id, None, self.ctx.client_id(), object.clone(), self.ctx.feed());
        entry.add_parent(parent);
        log::debug!("tracking new object {id} under {}", parent.container);
        self.by_instance.insert(key, id);
        self.entries.insert(entry);
        id
    }

    /// Attach a server-described object under `parent`, materializing an
    /// instance when the object is not tracked yet.
    pub fn attach(
        &mut self,
        id: ObjectId,
        state: Option<&ObjectState>,
        parent: ParentRef,
    ) -> Result<ObjectRef, SyncError> {
        if let Some(entry) = self.entries.get_mut(&id) {
            if let Some(state) = state {
                entry.sync_from_state(state)?;
            }
            entry.add_parent(parent);
            return Ok(entry.object().clone());
        }
        let state = state.ok_or(SyncError::UnknownObject(id))?;
        let mut entry = ObjectEntry::incoming(state, None, self.ctx.feed())?;
        entry.add_parent(parent);
        let object = entry.object().clone();
        self.by_instance.insert(object.borrow().key(), id);
        self.entries.insert(entry);
        log::debug!("materialized object {id} under {}", parent.container);
        Ok(object)
    }

    /// Drop one parent reference; disposes the entry when it was the last.
    /// Returns true when the entry was disposed.
    pub fn remove_parent(&mut self, id: ObjectId, container: ParentId) -> bool {
        let Some(entry) = self.entries.get_mut(&id) else {
            return false;
        };
        if !entry.remove_parent(container) {
            return false;
        }
        if let Some(entry) = self.entries.remove(&id) {
            self.by_instance.remove(&entry.object().borrow().key());
        }
        log::debug!("object {id} disposed");
        true
    }

    pub fn set_position(&mut self, id: ObjectId, container: ParentId, position: usize) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.set_position(container, position);
        }
    }

    pub fn mark_connected(&mut self, id: ObjectId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.mark_connected();
        }
    }

    /// Turn an application write into an outgoing update. A rejected write
    /// is rolled back on the instance.
    pub fn apply_local_property_change(
        &mut self,
        key: InstanceKey,
        name: &str,
        value: PropertyValue,
    ) -> Result<(), SyncError> {
        let Some(id) = self.by_instance.get(&key).copied() else {
            log::trace!("ignoring change to untracked instance {key:?}");
            return Ok(());
        };
        let entry = self.entries.get_mut(&id).ok_or(SyncError::UnknownObject(id))?;
        // Until the open reply arrives the server may know this name under
        // another id, so nothing written now could be applied.
        let result = match entry.name() {
            Some(object_name) if self.opening.contains_key(object_name) => Err(SyncError::NotConnected(format!(
                "set '{name}' on object '{object_name}' before its open completed"
            ))),
            _ => entry.apply_local_property_change(name, value, &self.ctx),
        };
        if let Err(error) = result {
            entry.restore_property(name);
            return Err(error);
        }
        Ok(())
    }

    /// Reconcile one run of object-channel payloads.
    pub fn handle_run(&mut self, kind: PayloadKind, run: Vec<Envelope>) {
        log::debug!("objects: {} x {kind:?}", run.len());
        for envelope in run {
            let sender = envelope.client;
            match envelope.payload {
                Payload::PropertyChanged(update) => self.property_changed(sender, &update),
                Payload::ObjectOpened { state } => self.object_opened(envelope.correlation, state),
                Payload::ObjectConnected { id } => self.mark_connected(id),
                Payload::ObjectDeleted { id } => self.object_deleted(id),
                other => {
                    let error = SyncError::UnexpectedPayload(sender);
                    log::error!("objects: {error} ({:?})", other.kind());
                    self.ctx.events().fault(&error, None);
                }
            }
        }
    }

    fn property_changed(&mut self, sender: ClientId, update: &PropertyUpdate) {
        let Some(entry) = self.entries.get_mut(&update.object) else {
            log::trace!("update for untracked object {}", update.object);
            return;
        };
        if entry.state() == EntryState::Faulted {
            log::debug!("object {} is faulted, dropping update", update.object);
            return;
        }
        match entry.apply_incoming_property_change(sender, update, &self.ctx) {
            Ok(Some(conflict)) => {
                let subject = Subject::object(entry.id(), entry.name());
                self.ctx
                    .events()
                    .emit(SyncEvent::Error(ErrorEvent::conflict(subject, conflict)));
            }
            Ok(None) => {}
            Err(error) => self.fault(update.object, error),
        }
    }

    fn object_opened(&mut self, correlation: u32, state: ObjectState) {
        let Some(name) = state.name.clone() else {
            let error = SyncError::UnexpectedPayload(state.owner);
            log::error!("objects: opened reply without a name for {}", state.id);
            self.ctx.events().fault(&error, None);
            return;
        };
        if let Some(waiting) = self.opening.remove(&name) {
            if waiting != correlation {
                log::debug!("object '{name}': reply {correlation} completes request {waiting}");
            }
            let result = self.complete_open(&name, &state);
            if let Err(error) = &result {
                log::warn!("object '{name}': open failed: {error}");
            }
            self.requests.complete(waiting, result);
            return;
        }
        match self.entries.id_for_name(&name) {
            Some(id) => self.resynchronize(id, &state),
            None => log::debug!("object '{name}' opened with no local interest"),
        }
    }

    fn complete_open(&mut self, name: &str, state: &ObjectState) -> Result<ObjectRef, SyncError> {
        let pending = self
            .entries
            .id_for_name(name)
            .and_then(|id| self.entries.remove(&id))
            .ok_or_else(|| SyncError::UnknownName(name.into()))?;
        let object = pending.object().clone();
        self.by_instance.remove(&object.borrow().key());
        drop(pending);

        let requested = object.borrow().descriptor().clone();
        if !requested.same_type(&state.descriptor) {
            return Err(SyncError::TypeMismatch {
                name: name.into(),
                existing: state.descriptor.name.clone(),
                requested: requested.name.clone(),
            });
        }

        // Already reachable through a collection: name the existing entry.
        if let Some(mut existing) = self.entries.remove(&state.id) {
            existing.set_name(Some(name.to_string()));
            existing.add_parent(ParentRef::root());
            existing.retain_open();
            let synced = existing.sync_from_state(state);
            let object = existing.object().clone();
            self.entries.insert(existing);
            synced?;
            return Ok(object);
        }

        let mut entry = ObjectEntry::incoming(state, Some(object.clone()), self.ctx.feed())?;
        entry.add_parent(ParentRef::root());
        entry.retain_open();
        self.by_instance.insert(object.borrow().key(), state.id);
        self.entries.insert(entry);
        log::info!("object '{name}' opened as {}", state.id);
        Ok(object)
    }

    fn resynchronize(&mut self, id: ObjectId, state: &ObjectState) {
        if id != state.id {
            log::warn!("object {id} was replaced by {} on the server", state.id);
            let Some(old) = self.entries.remove(&id) else {
                return;
            };
            let object = old.object().clone();
            let opens = old.open_count();
            drop(old);
            match ObjectEntry::incoming(state, Some(object.clone()), self.ctx.feed()) {
                Ok(mut entry) => {
                    entry.add_parent(ParentRef::root());
                    for _ in 0..opens.max(1) {
                        entry.retain_open();
                    }
                    self.by_instance.insert(object.borrow().key(), state.id);
                    self.entries.insert(entry);
                }
                Err(error) => {
                    self.by_instance.remove(&object.borrow().key());
                    log::error!("object {}: {error}", state.id);
                    self.ctx.events().fault(&error, Some(Subject::object(state.id, state.name.as_deref())));
                }
            }
            return;
        }
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        match entry.sync_from_state(state) {
            Ok(()) => log::info!("object {id} resynchronized"),
            Err(error) => self.fault(id, error),
        }
    }

    fn object_deleted(&mut self, id: ObjectId) {
        let Some(mut entry) = self.entries.remove(&id) else {
            log::trace!("deletion of untracked object {id}");
            return;
        };
        self.by_instance.remove(&entry.object().borrow().key());
        let name = entry.name().map(str::to_string);
        entry.dispose();
        log::info!("object {id} deleted");
        self.ctx.events().emit(SyncEvent::ObjectDeleted { id, name });
    }

    /// Protocol fault on one object: mark it, surface it, and ask the server
    /// for a fresh copy when the object is named.
    pub(crate) fn fault(&mut self, id: ObjectId, error: SyncError) {
        log::error!("object {id}: {error}");
        let Some(entry) = self.entries.get_mut(&id) else {
            self.ctx.events().fault(&error, None);
            return;
        };
        entry.mark_faulted();
        self.ctx
            .events()
            .fault(&error, Some(Subject::object(id, entry.name())));
        if let (Some(name), true) = (entry.name(), self.ctx.is_connected()) {
            let correlation = self.requests.allocate();
            log::info!("object '{name}': requesting resynchronization");
            self.ctx.publish_correlated(
                correlation,
                Payload::OpenObject {
                    name: name.to_string(),
                    state: entry.to_state(),
                },
            );
        }
    }

    /// Channel lost: fail pending opens and abandon in-flight writes.
    pub fn on_disconnect(&mut self) {
        let error = SyncError::NotConnected("channel lost".into());
        let failed = self.requests.fail_all(&error);
        for (name, _) in self.opening.drain() {
            if let Some(id) = self.entries.id_for_name(&name) {
                if let Some(entry) = self.entries.remove(&id) {
                    self.by_instance.remove(&entry.object().borrow().key());
                }
            }
        }
        for entry in self.entries.iter_mut() {
            entry.on_disconnect();
        }
        log::info!(
            "objects: disconnected ({} tracked, {failed} open requests failed)",
            self.entries.len()
        );
    }

    /// Re-open every named object; the replies resynchronize them.
    pub fn on_reconnect(&mut self) {
        let mut reopened = 0;
        for entry in self.entries.iter() {
            let Some(name) = entry.name() else {
                continue;
            };
            let correlation = self.requests.allocate();
            self.ctx.publish_correlated(
                correlation,
                Payload::OpenObject {
                    name: name.to_string(),
                    state: entry.to_state(),
                },
            );
            reopened += 1;
        }
        log::info!("objects: reopened {reopened} named objects");
    }
}
