//! Lifecycle, routing and heartbeat scheduling for shared collections.

use std::collections::HashMap;
use std::rc::Rc;
use std::time::Instant;

use crate::collection::CollectionEntry;
use crate::context::ClientContext;
use crate::entry_map::{Entry, EntryMap, EntryState};
use crate::error::SyncError;
use crate::events::{Subject, SyncEvent};
use crate::ids::{ClientId, CollectionId};
use crate::objects::ObjectsManager;
use crate::observable::{CollectionRef, InstanceKey, ObjectRef, Origin, SharedCollection};
use crate::request::{OpenRequest, PendingRequests};
use crate::schema::CollectionKind;
use crate::wire::{CollectionState, Envelope, OperationPayload, Payload, PayloadKind};

struct Opening {
    correlation: u32,
    kind: CollectionKind,
}

pub struct CollectionsManager {
    ctx: Rc<ClientContext>,
    entries: EntryMap<CollectionEntry>,
    by_instance: HashMap<InstanceKey, CollectionId>,
    opening: HashMap<String, Opening>,
    requests: PendingRequests<CollectionRef>,
}

impl CollectionsManager {
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

    pub fn get(&self, id: &CollectionId) -> Option<&CollectionEntry> {
        self.entries.get(id)
    }

    pub fn by_name(&self, name: &str) -> Option<&CollectionEntry> {
        self.entries.by_name(name)
    }

    pub fn entries(&self) -> impl Iterator<Item = &CollectionEntry> {
        self.entries.iter()
    }

    pub fn is_opening(&self, name: &str) -> bool {
        self.opening.contains_key(name)
    }

    pub fn waiting_for_acks(&self) -> bool {
        self.entries.iter().any(CollectionEntry::waiting_for_acks)
    }

    /// Open (creating on the server if missing) the collection called `name`.
    pub fn open_collection(
        &mut self,
        name: &str,
        kind: CollectionKind,
    ) -> Result<OpenRequest<CollectionRef>, SyncError> {
        self.ctx.require_connected(&format!("open collection '{name}'"))?;
        if self.opening.contains_key(name) {
            return Err(SyncError::AlreadyOpening { name: name.into() });
        }
        if let Some(entry) = self.entries.by_name_mut(name) {
            if entry.kind() != kind {
                return Err(SyncError::TypeMismatch {
                    name: name.into(),
                    existing: entry.kind().to_string(),
                    requested: kind.to_string(),
                });
            }
            let count = entry.retain_open();
            log::debug!("collection '{name}' reopened ({count} opens)");
            return Ok(OpenRequest::ready(Ok(entry.collection().clone())));
        }

        let request = self.requests.register();
        let id = CollectionId::new();
        self.ctx.publish_correlated(
            request.correlation(),
            Payload::OpenCollection {
                name: name.to_string(),
                id,
                kind,
            },
        );
        log::info!("opening {kind} '{name}'");
        self.opening.insert(
            name.to_string(),
            Opening {
                correlation: request.correlation(),
                kind,
            },
        );
        Ok(request)
    }

    /// Release one open; the last close drops every member reference.
    pub fn close_collection(&mut self, name: &str, objects: &mut ObjectsManager) -> Result<(), SyncError> {
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
            self.ctx.publish(Payload::CloseCollection { id });
        }
        self.discard(id, objects);
        log::info!("collection '{name}' closed");
        Ok(())
    }

    /// Ask the server to delete the collection; the broadcast disposes it.
    pub fn delete_collection(&mut self, name: &str) -> Result<(), SyncError> {
        self.ctx.require_connected(&format!("delete collection '{name}'"))?;
        let id = self
            .entries
            .id_for_name(name)
            .ok_or_else(|| SyncError::UnknownName(name.into()))?;
        self.ctx.publish(Payload::DeleteCollection { id });
        Ok(())
    }

    fn discard(&mut self, id: CollectionId, objects: &mut ObjectsManager) -> Option<CollectionEntry> {
        let mut entry = self.entries.remove(&id)?;
        self.by_instance.remove(&entry.collection().borrow().key());
        entry.dispose(objects);
        Some(entry)
    }

    /// Turn an application insert into an outgoing operation. A rejected
    /// insert is rolled back on the container.
    pub fn apply_local_insert(
        &mut self,
        key: InstanceKey,
        index: usize,
        object: &ObjectRef,
        objects: &mut ObjectsManager,
    ) -> Result<(), SyncError> {
        let Some(entry) = self.tracked(key).and_then(|id| self.entries.get_mut(&id)) else {
            return Ok(());
        };
        let result = entry.apply_local_insert(index, object, &self.ctx, objects);
        if result.is_err() {
            let mut collection = entry.collection().borrow_mut();
            if collection.position(object) == Some(index) {
                if let Err(error) = collection.remove_with(index, Origin::Remote) {
                    log::warn!("collection {}: rollback failed: {error}", entry.id());
                }
            }
        }
        result
    }

    /// Turn an application remove into an outgoing operation. A rejected
    /// remove is rolled back on the container.
    pub fn apply_local_remove(
        &mut self,
        key: InstanceKey,
        index: usize,
        object: &ObjectRef,
        objects: &mut ObjectsManager,
    ) -> Result<(), SyncError> {
        let Some(entry) = self.tracked(key).and_then(|id| self.entries.get_mut(&id)) else {
            return Ok(());
        };
        let result = entry.apply_local_remove(index, object, &self.ctx, objects);
        if result.is_err() {
            let mut collection = entry.collection().borrow_mut();
            if !collection.contains(object) {
                let index = index.min(collection.len());
                if let Err(error) = collection.insert_with(index, object.clone(), Origin::Remote) {
                    log::warn!("collection {}: rollback failed: {error}", entry.id());
                }
            }
        }
        result
    }

    fn tracked(&self, key: InstanceKey) -> Option<CollectionId> {
        let id = self.by_instance.get(&key).copied();
        if id.is_none() {
            log::trace!("ignoring change to untracked collection {key:?}");
        }
        id
    }

    /// Reconcile one run of collection-channel payloads.
    pub fn handle_run(&mut self, kind: PayloadKind, run: Vec<Envelope>, objects: &mut ObjectsManager) {
        log::debug!("collections: {} x {kind:?}", run.len());
        for envelope in run {
            let sender = envelope.client;
            match envelope.payload {
                Payload::CollectionOpened { state } => {
                    self.collection_opened(envelope.correlation, state, objects)
                }
                Payload::CollectionConnected { id } => {
                    if let Some(entry) = self.entries.get_mut(&id) {
                        entry.mark_connected();
                    }
                }
                Payload::CollectionDeleted { id } => self.collection_deleted(id, objects),
                Payload::ObjectInserted(op) | Payload::ObjectRemoved(op) => {
                    self.operation(sender, &op, objects)
                }
                Payload::Heartbeat {
                    collection,
                    sequence,
                    checksum,
                } => self.heartbeat_received(collection, sequence, checksum),
                other => {
                    let error = SyncError::UnexpectedPayload(sender);
                    log::error!("collections: {error} ({:?})", other.kind());
                    self.ctx.events().fault(&error, None);
                }
            }
        }
    }

    fn operation(&mut self, sender: ClientId, op: &OperationPayload, objects: &mut ObjectsManager) {
        let Some(entry) = self.entries.get_mut(&op.collection) else {
            log::trace!("operation for untracked collection {}", op.collection);
            return;
        };
        if entry.state() == EntryState::Faulted {
            log::debug!("collection {} is faulted, dropping operation", op.collection);
            return;
        }
        if let Err(error) = entry.apply_incoming(sender, op, &self.ctx, objects) {
            self.fault(op.collection, error);
        }
    }

    fn heartbeat_received(&mut self, id: CollectionId, sequence: u64, checksum: u32) {
        let Some(entry) = self.entries.get(&id) else {
            return;
        };
        if entry.state() != EntryState::Connected {
            return;
        }
        if let Err(error) = entry.check_heartbeat(sequence, checksum, &self.ctx) {
            self.fault(id, error);
        }
    }

    fn collection_opened(&mut self, correlation: u32, state: CollectionState, objects: &mut ObjectsManager) {
        let name = state.name.clone();
        if let Some(opening) = self.opening.remove(&name) {
            if opening.correlation != correlation {
                log::debug!(
                    "collection '{name}': reply {correlation} completes request {}",
                    opening.correlation
                );
            }
            let result = self.complete_open(opening.kind, &state, objects);
            if let Err(error) = &result {
                log::warn!("collection '{name}': open failed: {error}");
            }
            self.requests.complete(opening.correlation, result);
            return;
        }
        let Some(id) = self.entries.id_for_name(&name) else {
            log::debug!("collection '{name}' opened with no local interest");
            return;
        };
        if id != state.id {
            log::warn!("collection '{name}' was replaced by {} on the server", state.id);
            let Some(old) = self.discard(id, objects) else {
                return;
            };
            let opens = old.open_count().max(1);
            let events = self.ctx.events().clone();
            match self.install(&state, old.collection().clone(), objects) {
                Ok(entry) => {
                    for _ in 1..opens {
                        entry.retain_open();
                    }
                }
                Err(error) => events.fault(&error, Some(Subject::collection(state.id, &name))),
            }
            return;
        }
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        match entry.resync(&state, objects) {
            Ok(()) => log::info!("collection '{name}' resynchronized at {}", state.sequence),
            Err(error) => {
                log::error!("collection '{name}': resynchronization failed: {error}");
                entry.mark_faulted();
                self.ctx
                    .events()
                    .fault(&error, Some(Subject::collection(id, &name)));
            }
        }
    }

    fn complete_open(
        &mut self,
        requested: CollectionKind,
        state: &CollectionState,
        objects: &mut ObjectsManager,
    ) -> Result<CollectionRef, SyncError> {
        if state.kind != requested {
            return Err(SyncError::TypeMismatch {
                name: state.name.clone(),
                existing: state.kind.to_string(),
                requested: requested.to_string(),
            });
        }
        let collection = SharedCollection::new(state.kind);
        self.install(state, collection.clone(), objects)?;
        log::info!(
            "{} '{}' opened as {} with {} members",
            state.kind,
            state.name,
            state.id,
            state.members.len()
        );
        Ok(collection)
    }

    fn install(
        &mut self,
        state: &CollectionState,
        collection: CollectionRef,
        objects: &mut ObjectsManager,
    ) -> Result<&mut CollectionEntry, SyncError> {
        let mut entry = CollectionEntry::from_state(state, collection, &self.ctx, objects)?;
        entry.retain_open();
        self.by_instance.insert(entry.collection().borrow().key(), state.id);
        self.entries.insert(entry);
        self.entries
            .get_mut(&state.id)
            .ok_or(SyncError::UnknownCollection(state.id))
    }

    fn collection_deleted(&mut self, id: CollectionId, objects: &mut ObjectsManager) {
        let Some(entry) = self.discard(id, objects) else {
            log::trace!("deletion of untracked collection {id}");
            return;
        };
        let name = entry.name().unwrap_or_default().to_string();
        log::info!("collection '{name}' deleted");
        self.ctx.events().emit(SyncEvent::CollectionDeleted { id, name });
    }

    /// Protocol fault on one collection: mark it, surface it, and ask the
    /// server for a fresh copy.
    pub(crate) fn fault(&mut self, id: CollectionId, error: SyncError) {
        log::error!("collection {id}: {error}");
        let Some(entry) = self.entries.get_mut(&id) else {
            self.ctx.events().fault(&error, None);
            return;
        };
        entry.mark_faulted();
        let name = entry.name().unwrap_or_default().to_string();
        self.ctx
            .events()
            .fault(&error, Some(Subject::collection(id, &name)));
        if self.ctx.is_connected() {
            let correlation = self.requests.allocate();
            log::info!("collection '{name}': requesting resynchronization");
            self.ctx.publish_correlated(
                correlation,
                Payload::OpenCollection {
                    name,
                    id,
                    kind: entry.kind(),
                },
            );
        }
    }

    /// Publish heartbeats for every ordered collection that is due one.
    pub fn heartbeat(&mut self, now: Instant) -> usize {
        let ctx = &self.ctx;
        self.entries
            .iter_mut()
            .map(|entry| entry.heartbeat(now, ctx))
            .filter(|sent| *sent)
            .count()
    }

    pub fn on_disconnect(&mut self) {
        let error = SyncError::NotConnected("channel lost".into());
        let failed = self.requests.fail_all(&error);
        self.opening.clear();
        for entry in self.entries.iter_mut() {
            entry.on_disconnect();
        }
        log::info!(
            "collections: disconnected ({} tracked, {failed} open requests failed)",
            self.entries.len()
        );
    }

    /// Re-open every collection; the replies resynchronize them.
    pub fn on_reconnect(&mut self) {
        for entry in self.entries.iter() {
            let correlation = self.requests.allocate();
            self.ctx.publish_correlated(
                correlation,
                Payload::OpenCollection {
                    name: entry.name().unwrap_or_default().to_string(),
                    id: entry.id(),
                    kind: entry.kind(),
                },
            );
        }
        log::info!("collections: reopened {}", self.entries.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::context;
    use crate::error::ErrorKind;
    use crate::ids::ObjectId;
    use crate::observable::SharedObject;
    use crate::schema::{TypeDescriptor, ValueKind};
    use crate::transport::MemoryTransport;
    use crate::wire::{CollectionAction, ObjectState};

    fn card_state(owner: ClientId) -> ObjectState {
        ObjectState {
            id: ObjectId::new(),
            name: None,
            owner,
            descriptor: TypeDescriptor::new("Card").property("title", ValueKind::Text),
            properties: Vec::new(),
        }
    }

    /// Reply to the last open request as a server holding `members`.
    fn answer_open(
        collections: &mut CollectionsManager,
        objects: &mut ObjectsManager,
        transport: &MemoryTransport,
        members: Vec<ObjectState>,
        sequence: u64,
    ) -> CollectionState {
        let (correlation, name, id, kind) = transport
            .take()
            .into_iter()
            .rev()
            .find_map(|(_, envelope)| match envelope.payload {
                Payload::OpenCollection { name, id, kind } => Some((envelope.correlation, name, id, kind)),
                _ => None,
            })
            .expect("open request");
        let state = CollectionState {
            id,
            name,
            owner: ClientId::new(),
            kind,
            sequence,
            members,
        };
        collections.handle_run(
            PayloadKind::CollectionOpened,
            vec![Envelope::correlated(
                ClientId::new(),
                correlation,
                Payload::CollectionOpened { state: state.clone() },
            )],
            objects,
        );
        state
    }

    #[test]
    fn test_open_and_reopen() {
        let (ctx, transport, _rx) = context();
        let mut objects = ObjectsManager::new(ctx.clone());
        let mut collections = CollectionsManager::new(ctx);

        let mut request = collections
            .open_collection("board", CollectionKind::Ordered)
            .unwrap();
        assert!(matches!(
            collections.open_collection("board", CollectionKind::Ordered),
            Err(SyncError::AlreadyOpening { .. })
        ));
        let owner = ClientId::new();
        let state = answer_open(
            &mut collections,
            &mut objects,
            &transport,
            vec![card_state(owner), card_state(owner)],
            3,
        );
        let collection = request.try_take().unwrap().unwrap();
        assert_eq!(collection.borrow().len(), 2);
        assert_eq!(objects.len(), 2);

        let entry = collections.by_name("board").unwrap();
        assert_eq!(entry.id(), state.id);
        assert_eq!(entry.sequence(), Some(3));

        let mut again = collections
            .open_collection("board", CollectionKind::Ordered)
            .unwrap();
        assert!(Rc::ptr_eq(&again.try_take().unwrap().unwrap(), &collection));
        let error = collections
            .open_collection("board", CollectionKind::Unordered)
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::TypeMismatch);
    }

    #[test]
    fn test_kind_mismatch_from_server() {
        let (ctx, transport, _rx) = context();
        let mut objects = ObjectsManager::new(ctx.clone());
        let mut collections = CollectionsManager::new(ctx);
        let mut request = collections
            .open_collection("tags", CollectionKind::Unordered)
            .unwrap();
        let correlation = request.correlation();
        transport.take();

        let state = CollectionState {
            id: CollectionId::new(),
            name: "tags".into(),
            owner: ClientId::new(),
            kind: CollectionKind::Ordered,
            sequence: 0,
            members: Vec::new(),
        };
        collections.handle_run(
            PayloadKind::CollectionOpened,
            vec![Envelope::correlated(ClientId::new(), correlation, Payload::CollectionOpened { state })],
            &mut objects,
        );
        assert!(matches!(
            request.try_take(),
            Some(Err(SyncError::TypeMismatch { .. }))
        ));
        assert!(collections.is_empty());
    }

    #[test]
    fn test_close_releases_members() {
        let (ctx, transport, _rx) = context();
        let mut objects = ObjectsManager::new(ctx.clone());
        let mut collections = CollectionsManager::new(ctx);
        collections
            .open_collection("board", CollectionKind::Unordered)
            .unwrap();
        answer_open(
            &mut collections,
            &mut objects,
            &transport,
            vec![card_state(ClientId::new())],
            0,
        );

        collections.close_collection("board", &mut objects).unwrap();
        assert!(matches!(
            transport.take()[0].1.payload,
            Payload::CloseCollection { .. }
        ));
        assert!(collections.is_empty());
        assert!(objects.is_empty());
    }

    #[test]
    fn test_deleted_broadcast_emits_event() {
        let (ctx, transport, mut rx) = context();
        let mut objects = ObjectsManager::new(ctx.clone());
        let mut collections = CollectionsManager::new(ctx);
        collections
            .open_collection("board", CollectionKind::Ordered)
            .unwrap();
        let state = answer_open(&mut collections, &mut objects, &transport, Vec::new(), 0);

        collections.delete_collection("board").unwrap();
        collections.handle_run(
            PayloadKind::CollectionDeleted,
            vec![Envelope::new(ClientId::new(), Payload::CollectionDeleted { id: state.id })],
            &mut objects,
        );
        assert!(collections.is_empty());
        assert_eq!(
            rx.try_recv().unwrap(),
            SyncEvent::CollectionDeleted {
                id: state.id,
                name: "board".into()
            }
        );
    }

    #[test]
    fn test_rejected_insert_is_rolled_back() {
        let (ctx, transport, _rx) = context();
        let mut objects = ObjectsManager::new(ctx.clone());
        let mut collections = CollectionsManager::new(ctx.clone());
        let mut request = collections
            .open_collection("board", CollectionKind::Ordered)
            .unwrap();
        answer_open(&mut collections, &mut objects, &transport, Vec::new(), 0);
        let collection = request.try_take().unwrap().unwrap();

        ctx.set_connected(false);
        let card = SharedObject::new(TypeDescriptor::new("Card"));
        collection.borrow_mut().push(card.clone()).unwrap();
        let key = collection.borrow().key();
        let error = collections
            .apply_local_insert(key, 0, &card, &mut objects)
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::NotConnected);
        assert!(collection.borrow().is_empty());
        assert!(objects.is_empty());
    }

    #[test]
    fn test_desync_heartbeat_faults_and_resyncs() {
        let (ctx, transport, mut rx) = context();
        let mut objects = ObjectsManager::new(ctx.clone());
        let mut collections = CollectionsManager::new(ctx);
        collections
            .open_collection("board", CollectionKind::Ordered)
            .unwrap();
        let owner = ClientId::new();
        let state = answer_open(
            &mut collections,
            &mut objects,
            &transport,
            vec![card_state(owner)],
            5,
        );

        collections.handle_run(
            PayloadKind::Heartbeat,
            vec![Envelope::new(
                ClientId::new(),
                Payload::Heartbeat {
                    collection: state.id,
                    sequence: 5,
                    checksum: 0xDEAD_BEEF,
                },
            )],
            &mut objects,
        );
        assert_eq!(
            collections.get(&state.id).unwrap().state(),
            EntryState::Faulted
        );
        match rx.try_recv().unwrap() {
            SyncEvent::Error(event) => assert_eq!(event.kind, ErrorKind::Desynchronized),
            other => panic!("unexpected event {other:?}"),
        }

        // Operations are ignored until the server's copy arrives.
        let stray = OperationPayload {
            collection: state.id,
            action: CollectionAction::Remove,
            object: state.members[0].id,
            index: 0,
            sequence: 6,
            state: None,
            applied: true,
        };
        collections.handle_run(
            PayloadKind::ObjectRemoved,
            vec![Envelope::new(ClientId::new(), Payload::ObjectRemoved(stray))],
            &mut objects,
        );

        let fresh = card_state(owner);
        answer_open(&mut collections, &mut objects, &transport, vec![fresh.clone()], 6);
        let entry = collections.get(&state.id).unwrap();
        assert_eq!(entry.state(), EntryState::Connected);
        assert_eq!(entry.indices().unwrap(), &[fresh.id]);
        assert_eq!(objects.len(), 1);
    }

    #[test]
    fn test_reconnect_reopens_every_collection() {
        let (ctx, transport, _rx) = context();
        let mut objects = ObjectsManager::new(ctx.clone());
        let mut collections = CollectionsManager::new(ctx.clone());
        collections
            .open_collection("board", CollectionKind::Ordered)
            .unwrap();
        answer_open(&mut collections, &mut objects, &transport, Vec::new(), 0);

        collections.on_disconnect();
        assert_eq!(
            collections.by_name("board").unwrap().state(),
            EntryState::Disconnected
        );
        collections.on_reconnect();
        let published = transport.take();
        assert_eq!(published.len(), 1);
        assert!(matches!(
            &published[0].1.payload,
            Payload::OpenCollection { name, .. } if name == "board"
        ));
    }
}
