//! Collection entries.
//!
//! One entry per shared container. The shared contract (local insert/remove,
//! incoming operations, acks, disconnect, resynchronization) lives on
//! [`CollectionEntry`]; the ordering machinery lives only on the ordered
//! variant.
//!
//! ```text
//!            ┌──────────────────── CollectionEntry ───────────────────┐
//!            │ id, name, owner, state, open count, subscription       │
//!            │                                                        │
//!            │   CollectionVariant::Unordered   CollectionVariant::Ordered
//!            │   members + in-flight acks       sequence + indices    │
//!            │                                  + pending local ops  │
//!            └────────────────────────────────────────────────────────┘
//! ```

pub mod ordered;
pub mod transform;
pub mod unordered;

use std::time::Instant;

use crate::context::ClientContext;
use crate::entry_map::{Entry, EntryState};
use crate::error::SyncError;
use crate::ids::{ClientId, CollectionId, ObjectId, ParentId};
use crate::object_entry::ParentRef;
use crate::objects::ObjectsManager;
use crate::observable::{CollectionRef, ObjectRef, Subscription};
use crate::schema::CollectionKind;
use crate::wire::{CollectionState, OperationPayload};

pub use ordered::OrderedState;
pub use transform::CollectionOperation;
pub use unordered::UnorderedState;

/// What a variant needs to know about the entry it belongs to.
pub struct Scope<'a> {
    pub id: CollectionId,
    pub ctx: &'a ClientContext,
    pub collection: &'a CollectionRef,
}

#[derive(Debug)]
pub enum CollectionVariant {
    Unordered(UnorderedState),
    Ordered(OrderedState),
}

pub struct CollectionEntry {
    id: CollectionId,
    name: String,
    owner: ClientId,
    collection: CollectionRef,
    state: EntryState,
    open_count: usize,
    subscription: Option<Subscription>,
    variant: CollectionVariant,
}

impl CollectionEntry {
    /// Build an entry from the server's description, attaching every member.
    pub fn from_state(
        state: &CollectionState,
        collection: CollectionRef,
        ctx: &ClientContext,
        objects: &mut ObjectsManager,
    ) -> Result<Self, SyncError> {
        let variant = match state.kind {
            CollectionKind::Unordered => CollectionVariant::Unordered(UnorderedState::default()),
            CollectionKind::Ordered => CollectionVariant::Ordered(OrderedState::new(0, Vec::new())),
        };
        let subscription = Subscription::to_collection(&collection, ctx.feed());
        let mut entry = Self {
            id: state.id,
            name: state.name.clone(),
            owner: state.owner,
            collection,
            state: EntryState::Pending,
            open_count: 0,
            subscription: Some(subscription),
            variant,
        };
        entry.resync(state, objects)?;
        Ok(entry)
    }

    pub fn id(&self) -> CollectionId {
        self.id
    }

    pub fn owner(&self) -> ClientId {
        self.owner
    }

    pub fn kind(&self) -> CollectionKind {
        match self.variant {
            CollectionVariant::Unordered(_) => CollectionKind::Unordered,
            CollectionVariant::Ordered(_) => CollectionKind::Ordered,
        }
    }

    pub fn collection(&self) -> &CollectionRef {
        &self.collection
    }

    pub fn variant(&self) -> &CollectionVariant {
        &self.variant
    }

    pub fn state(&self) -> EntryState {
        self.state
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

    /// Ordered member ids, or `None` for unordered collections.
    pub fn indices(&self) -> Option<&[ObjectId]> {
        match &self.variant {
            CollectionVariant::Ordered(ordered) => Some(ordered.indices()),
            CollectionVariant::Unordered(_) => None,
        }
    }

    /// Last applied server sequence, or `None` for unordered collections.
    pub fn sequence(&self) -> Option<u64> {
        match &self.variant {
            CollectionVariant::Ordered(ordered) => Some(ordered.sequence()),
            CollectionVariant::Unordered(_) => None,
        }
    }

    pub fn member_ids(&self) -> Vec<ObjectId> {
        match &self.variant {
            CollectionVariant::Ordered(ordered) => ordered.indices().to_vec(),
            CollectionVariant::Unordered(unordered) => unordered.members().copied().collect(),
        }
    }

    pub fn waiting_for_acks(&self) -> bool {
        match &self.variant {
            CollectionVariant::Unordered(unordered) => unordered.waiting_for_acks(),
            CollectionVariant::Ordered(ordered) => ordered.waiting_for_acks(),
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_some()
    }

    fn require_live(&self, ctx: &ClientContext, what: &str) -> Result<(), SyncError> {
        match self.state {
            EntryState::Faulted => Err(SyncError::Faulted(self.id.as_uuid())),
            state if !state.is_live() => Err(SyncError::NotConnected(format!(
                "{what} on collection '{}' ({state:?})",
                self.name
            ))),
            _ => ctx.require_connected(&format!("{what} on collection '{}'", self.name)),
        }
    }

    /// The application inserted `object` at `index`.
    pub fn apply_local_insert(
        &mut self,
        index: usize,
        object: &ObjectRef,
        ctx: &ClientContext,
        objects: &mut ObjectsManager,
    ) -> Result<(), SyncError> {
        self.require_live(ctx, "insert")?;
        let scope = Scope {
            id: self.id,
            ctx,
            collection: &self.collection,
        };
        match &mut self.variant {
            CollectionVariant::Unordered(unordered) => unordered.local_insert(&scope, object, objects),
            CollectionVariant::Ordered(ordered) => ordered.local_insert(&scope, index, object, objects),
        }
    }

    /// The application removed `object`, which sat at `index`.
    pub fn apply_local_remove(
        &mut self,
        index: usize,
        object: &ObjectRef,
        ctx: &ClientContext,
        objects: &mut ObjectsManager,
    ) -> Result<(), SyncError> {
        self.require_live(ctx, "remove")?;
        let scope = Scope {
            id: self.id,
            ctx,
            collection: &self.collection,
        };
        match &mut self.variant {
            CollectionVariant::Unordered(unordered) => unordered.local_remove(&scope, object, objects),
            CollectionVariant::Ordered(ordered) => ordered.local_remove(&scope, index, object, objects),
        }
    }

    /// Reconcile an insert or remove broadcast by the server.
    pub fn apply_incoming(
        &mut self,
        sender: ClientId,
        payload: &OperationPayload,
        ctx: &ClientContext,
        objects: &mut ObjectsManager,
    ) -> Result<(), SyncError> {
        let scope = Scope {
            id: self.id,
            ctx,
            collection: &self.collection,
        };
        match &mut self.variant {
            CollectionVariant::Unordered(unordered) => {
                unordered.apply_incoming(&scope, sender, payload, objects)
            }
            CollectionVariant::Ordered(ordered) => {
                ordered.apply_incoming(&scope, sender, payload, objects)
            }
        }
    }

    /// Publish a heartbeat if one is due. Returns true when one was sent.
    pub fn heartbeat(&mut self, now: Instant, ctx: &ClientContext) -> bool {
        let config = ctx.config();
        if !config.heartbeats_enabled || !ctx.is_connected() || self.state != EntryState::Connected {
            return false;
        }
        let scope = Scope {
            id: self.id,
            ctx,
            collection: &self.collection,
        };
        match &mut self.variant {
            CollectionVariant::Ordered(ordered) if ordered.heartbeat_due(now, config.heartbeat_interval()) => {
                ordered.publish_heartbeat(&scope, now);
                true
            }
            _ => false,
        }
    }

    pub fn check_heartbeat(
        &self,
        sequence: u64,
        checksum: u32,
        ctx: &ClientContext,
    ) -> Result<(), SyncError> {
        let scope = Scope {
            id: self.id,
            ctx,
            collection: &self.collection,
        };
        match &self.variant {
            CollectionVariant::Ordered(ordered) => ordered.check_heartbeat(&scope, sequence, checksum),
            CollectionVariant::Unordered(_) => Ok(()),
        }
    }

    /// Replace membership and ordering with the server's and mark connected.
    pub fn resync(&mut self, state: &CollectionState, objects: &mut ObjectsManager) -> Result<(), SyncError> {
        let container = ParentId::Collection(self.id);
        let incoming: Vec<ObjectId> = state.members.iter().map(|m| m.id).collect();
        for stale in self.member_ids() {
            if !incoming.contains(&stale) {
                objects.remove_parent(stale, container);
            }
        }

        let mut items = Vec::with_capacity(state.members.len());
        for (position, member) in state.members.iter().enumerate() {
            let parent = match state.kind {
                CollectionKind::Ordered => ParentRef::ordered(container, position),
                CollectionKind::Unordered => ParentRef::unordered(container),
            };
            items.push(objects.attach(member.id, Some(member), parent)?);
        }
        self.collection.borrow_mut().replace_remote(items);

        match &mut self.variant {
            CollectionVariant::Unordered(unordered) => unordered.reset(incoming),
            CollectionVariant::Ordered(ordered) => ordered.reset(state.sequence, incoming),
        }
        self.state = EntryState::Connected;
        Ok(())
    }

    pub(crate) fn mark_faulted(&mut self) {
        if self.state != EntryState::Disposed {
            self.state = EntryState::Faulted;
        }
    }

    pub(crate) fn mark_connected(&mut self) {
        if self.state == EntryState::Pending {
            self.state = EntryState::Connected;
        }
    }

    /// Channel lost: abandon every in-flight operation.
    pub fn on_disconnect(&mut self) {
        match &mut self.variant {
            CollectionVariant::Unordered(unordered) => unordered.on_disconnect(),
            CollectionVariant::Ordered(ordered) => ordered.on_disconnect(),
        }
        if self.state != EntryState::Disposed {
            self.state = EntryState::Disconnected;
        }
    }

    /// Release every member and the subscription.
    pub fn dispose(&mut self, objects: &mut ObjectsManager) {
        let container = ParentId::Collection(self.id);
        for member in self.member_ids() {
            objects.remove_parent(member, container);
        }
        self.on_disconnect();
        self.subscription.take();
        self.state = EntryState::Disposed;
    }
}

impl Entry for CollectionEntry {
    type Id = CollectionId;

    fn id(&self) -> CollectionId {
        self.id
    }

    fn name(&self) -> Option<&str> {
        Some(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::context;
    use crate::observable::{SharedCollection, SharedObject};
    use crate::schema::{TypeDescriptor, ValueKind};
    use crate::transport::MemoryTransport;
    use crate::wire::{CollectionAction, ObjectState, Payload};
    use std::rc::Rc;
    use std::time::Duration;

    fn card_type() -> TypeDescriptor {
        TypeDescriptor::new("Card").property("title", ValueKind::Text)
    }

    fn member(owner: ClientId) -> ObjectState {
        ObjectState {
            id: ObjectId::new(),
            name: None,
            owner,
            descriptor: card_type(),
            properties: Vec::new(),
        }
    }

    fn opened(kind: CollectionKind, members: Vec<ObjectState>, sequence: u64) -> CollectionState {
        CollectionState {
            id: CollectionId::new(),
            name: "board".into(),
            owner: ClientId::new(),
            kind,
            sequence,
            members,
        }
    }

    struct Fixture {
        ctx: Rc<ClientContext>,
        transport: Rc<MemoryTransport>,
        objects: ObjectsManager,
        entry: CollectionEntry,
    }

    fn fixture(kind: CollectionKind, members: Vec<ObjectState>, sequence: u64) -> Fixture {
        let (ctx, transport, _rx) = context();
        let mut objects = ObjectsManager::new(ctx.clone());
        let state = opened(kind, members, sequence);
        let entry =
            CollectionEntry::from_state(&state, SharedCollection::new(kind), &ctx, &mut objects).unwrap();
        Fixture {
            ctx,
            transport,
            objects,
            entry,
        }
    }

    fn remote_op(
        fx: &Fixture,
        action: CollectionAction,
        object: ObjectId,
        index: u32,
        sequence: u64,
        state: Option<ObjectState>,
    ) -> OperationPayload {
        OperationPayload {
            collection: fx.entry.id(),
            action,
            object,
            index,
            sequence,
            state,
            applied: true,
        }
    }

    fn published_ops(transport: &MemoryTransport) -> Vec<OperationPayload> {
        transport
            .take()
            .into_iter()
            .filter_map(|(_, envelope)| match envelope.payload {
                Payload::ObjectInserted(op) | Payload::ObjectRemoved(op) => Some(op),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_from_state_attaches_members_in_order() {
        let owner = ClientId::new();
        let members = vec![member(owner), member(owner)];
        let ids: Vec<ObjectId> = members.iter().map(|m| m.id).collect();
        let fx = fixture(CollectionKind::Ordered, members, 4);

        assert_eq!(fx.entry.state(), EntryState::Connected);
        assert_eq!(fx.entry.indices().unwrap(), ids.as_slice());
        assert_eq!(fx.entry.sequence(), Some(4));
        assert_eq!(fx.entry.collection().borrow().len(), 2);
        let second = fx.objects.get(&ids[1]).unwrap();
        let parent = second.parents().next().unwrap();
        assert_eq!(parent.position, Some(1));
    }

    #[test]
    fn test_remove_then_remote_insert_lands_between() {
        let owner = ClientId::new();
        let members = vec![member(owner), member(owner), member(owner)];
        let (x, y, z) = (members[0].id, members[1].id, members[2].id);
        let mut fx = fixture(CollectionKind::Ordered, members, 0);

        let y_ref = fx.objects.object_ref(y).unwrap();
        fx.entry
            .collection()
            .borrow_mut()
            .remove_with(1, crate::observable::Origin::Remote)
            .unwrap();
        fx.entry
            .apply_local_remove(1, &y_ref, &fx.ctx, &mut fx.objects)
            .unwrap();
        assert_eq!(fx.entry.indices().unwrap(), &[x, z]);

        let w = member(ClientId::new());
        let w_id = w.id;
        let insert = remote_op(&fx, CollectionAction::Insert, w_id, 2, 1, Some(w));
        fx.entry
            .apply_incoming(ClientId::new(), &insert, &fx.ctx, &mut fx.objects)
            .unwrap();
        assert_eq!(fx.entry.indices().unwrap(), &[x, w_id, z]);
        assert!(fx.entry.waiting_for_acks());

        let sent = published_ops(&fx.transport);
        let ack = remote_op(&fx, sent[0].action, sent[0].object, sent[0].index, 2, None);
        let client = fx.ctx.client_id();
        fx.entry
            .apply_incoming(client, &ack, &fx.ctx, &mut fx.objects)
            .unwrap();
        assert!(!fx.entry.waiting_for_acks());
        assert_eq!(fx.entry.indices().unwrap(), &[x, w_id, z]);
        assert_eq!(fx.entry.collection().borrow().len(), 3);
        assert!(fx.objects.get(&y).is_none());
    }

    #[test]
    fn test_acks_must_arrive_in_order() {
        let mut fx = fixture(CollectionKind::Ordered, Vec::new(), 0);
        let first = SharedObject::new(card_type());
        let second = SharedObject::new(card_type());
        fx.entry
            .apply_local_insert(0, &first, &fx.ctx, &mut fx.objects)
            .unwrap();
        fx.entry
            .apply_local_insert(1, &second, &fx.ctx, &mut fx.objects)
            .unwrap();
        let sent = published_ops(&fx.transport);
        assert_eq!(sent[0].sequence, 0);
        assert_eq!(sent[1].sequence, 0);
        assert!(sent[0].state.is_some());

        let client = fx.ctx.client_id();
        let out_of_order = remote_op(&fx, CollectionAction::Insert, sent[1].object, 1, 1, None);
        let error = fx
            .entry
            .apply_incoming(client, &out_of_order, &fx.ctx, &mut fx.objects)
            .unwrap_err();
        assert!(matches!(error, SyncError::UnexpectedAck { .. }));
    }

    #[test]
    fn test_replayed_self_ack_does_not_mutate() {
        let mut fx = fixture(CollectionKind::Ordered, Vec::new(), 0);
        let card = SharedObject::new(card_type());
        fx.entry
            .collection()
            .borrow_mut()
            .insert_with(0, card.clone(), crate::observable::Origin::Remote)
            .unwrap();
        fx.entry
            .apply_local_insert(0, &card, &fx.ctx, &mut fx.objects)
            .unwrap();
        let sent = published_ops(&fx.transport);
        let client = fx.ctx.client_id();
        let ack = remote_op(&fx, CollectionAction::Insert, sent[0].object, 0, 1, None);

        fx.entry
            .apply_incoming(client, &ack, &fx.ctx, &mut fx.objects)
            .unwrap();
        let before = fx.entry.indices().unwrap().to_vec();
        assert!(fx
            .entry
            .apply_incoming(client, &ack, &fx.ctx, &mut fx.objects)
            .unwrap_err()
            .is_protocol_fault());
        assert_eq!(fx.entry.indices().unwrap(), before.as_slice());
        assert_eq!(fx.entry.collection().borrow().len(), 1);
        assert_eq!(
            fx.objects.get(&sent[0].object).unwrap().state(),
            EntryState::Connected
        );
    }

    #[test]
    fn test_sequence_gap_is_a_fault() {
        let mut fx = fixture(CollectionKind::Ordered, Vec::new(), 3);
        let w = member(ClientId::new());
        let op = remote_op(&fx, CollectionAction::Insert, w.id, 0, 5, Some(w));
        assert!(matches!(
            fx.entry.apply_incoming(ClientId::new(), &op, &fx.ctx, &mut fx.objects),
            Err(SyncError::SequenceGap {
                expected: 4,
                received: 5,
                ..
            })
        ));
    }

    #[test]
    fn test_concurrent_remove_of_same_member() {
        let owner = ClientId::new();
        let members = vec![member(owner), member(owner)];
        let (a, b) = (members[0].id, members[1].id);
        let mut fx = fixture(CollectionKind::Ordered, members, 0);
        let a_ref = fx.objects.object_ref(a).unwrap();
        fx.entry
            .collection()
            .borrow_mut()
            .remove_with(0, crate::observable::Origin::Remote)
            .unwrap();
        fx.entry
            .apply_local_remove(0, &a_ref, &fx.ctx, &mut fx.objects)
            .unwrap();

        // Another client's remove of the same slot was sequenced first.
        let theirs = remote_op(&fx, CollectionAction::Remove, a, 0, 1, None);
        fx.entry
            .apply_incoming(ClientId::new(), &theirs, &fx.ctx, &mut fx.objects)
            .unwrap();
        assert_eq!(fx.entry.indices().unwrap(), &[b]);

        let ours = remote_op(&fx, CollectionAction::Remove, a, 0, 2, None);
        let client = fx.ctx.client_id();
        fx.entry
            .apply_incoming(client, &ours, &fx.ctx, &mut fx.objects)
            .unwrap();
        assert_eq!(fx.entry.indices().unwrap(), &[b]);
        assert!(!fx.entry.waiting_for_acks());
    }

    #[test]
    fn test_no_op_from_another_client_is_skipped() {
        let members = vec![member(ClientId::new())];
        let existing = members[0].id;
        let mut fx = fixture(CollectionKind::Ordered, members, 0);

        let duplicate = OperationPayload {
            applied: false,
            ..remote_op(&fx, CollectionAction::Insert, existing, 0, 1, None)
        };
        fx.entry
            .apply_incoming(ClientId::new(), &duplicate, &fx.ctx, &mut fx.objects)
            .unwrap();
        assert_eq!(fx.entry.indices().unwrap(), &[existing]);
        assert_eq!(fx.entry.sequence(), Some(1));
        assert_eq!(fx.entry.collection().borrow().len(), 1);
    }

    #[test]
    fn test_concurrent_insert_of_same_object_yields_to_sequenced_one() {
        let owner = ClientId::new();
        let members = vec![member(owner), member(owner)];
        let (m0, m1) = (members[0].id, members[1].id);
        let mut fx = fixture(CollectionKind::Ordered, members, 0);

        let shared = SharedObject::new(card_type());
        let later = SharedObject::new(card_type());
        for (index, object) in [(0, &shared), (1, &later)] {
            fx.entry
                .collection()
                .borrow_mut()
                .insert_with(index, object.clone(), crate::observable::Origin::Remote)
                .unwrap();
            fx.entry
                .apply_local_insert(index, object, &fx.ctx, &mut fx.objects)
                .unwrap();
        }
        let x = fx.objects.id_of(&shared).unwrap();
        let y = fx.objects.id_of(&later).unwrap();
        assert_eq!(fx.entry.indices().unwrap(), &[x, y, m0, m1]);

        // Another client's insert of the same object was sequenced first.
        let theirs = remote_op(&fx, CollectionAction::Insert, x, 2, 1, None);
        fx.entry
            .apply_incoming(ClientId::new(), &theirs, &fx.ctx, &mut fx.objects)
            .unwrap();
        assert_eq!(fx.entry.indices().unwrap(), &[y, m0, m1, x]);
        let items = fx.entry.collection().borrow().items().to_vec();
        assert!(Rc::ptr_eq(&items[0], &later));
        assert!(Rc::ptr_eq(&items[3], &shared));
        assert!(fx.entry.waiting_for_acks());

        let client = fx.ctx.client_id();
        let ours = OperationPayload {
            applied: false,
            ..remote_op(&fx, CollectionAction::Insert, x, 0, 2, None)
        };
        fx.entry
            .apply_incoming(client, &ours, &fx.ctx, &mut fx.objects)
            .unwrap();
        let later_ack = remote_op(&fx, CollectionAction::Insert, y, 0, 3, None);
        fx.entry
            .apply_incoming(client, &later_ack, &fx.ctx, &mut fx.objects)
            .unwrap();
        assert!(!fx.entry.waiting_for_acks());
        assert_eq!(fx.entry.indices().unwrap(), &[y, m0, m1, x]);
        assert_eq!(fx.entry.collection().borrow().len(), 4);
    }

    #[test]
    fn test_heartbeat_only_when_settled() {
        let mut fx = fixture(CollectionKind::Ordered, vec![member(ClientId::new())], 2);
        let now = Instant::now();
        assert!(fx.entry.heartbeat(now, &fx.ctx));
        let published = fx.transport.take();
        let checksum = match &published[0].1.payload {
            Payload::Heartbeat { sequence, checksum, .. } => {
                assert_eq!(*sequence, 2);
                *checksum
            }
            other => panic!("unexpected payload {other:?}"),
        };
        assert!(!fx.entry.heartbeat(now + Duration::from_secs(1), &fx.ctx));

        assert!(fx.entry.check_heartbeat(2, checksum, &fx.ctx).is_ok());
        assert!(fx.entry.check_heartbeat(1, checksum ^ 1, &fx.ctx).is_ok());
        assert!(matches!(
            fx.entry.check_heartbeat(2, checksum ^ 1, &fx.ctx),
            Err(SyncError::Desynchronized { sequence: 2, .. })
        ));

        let card = SharedObject::new(card_type());
        fx.entry
            .apply_local_insert(1, &card, &fx.ctx, &mut fx.objects)
            .unwrap();
        let later = now + fx.ctx.config().heartbeat_interval();
        assert!(!fx.entry.heartbeat(later, &fx.ctx));
        assert!(fx.entry.check_heartbeat(2, checksum ^ 1, &fx.ctx).is_ok());
    }

    #[test]
    fn test_unordered_membership() {
        let owner = ClientId::new();
        let existing = member(owner);
        let existing_id = existing.id;
        let mut fx = fixture(CollectionKind::Unordered, vec![existing], 0);

        let card = SharedObject::new(card_type());
        fx.entry
            .apply_local_insert(1, &card, &fx.ctx, &mut fx.objects)
            .unwrap();
        assert!(fx.entry.waiting_for_acks());
        let sent = published_ops(&fx.transport);
        let client = fx.ctx.client_id();
        fx.entry
            .apply_incoming(client, &sent[0], &fx.ctx, &mut fx.objects)
            .unwrap();
        assert!(!fx.entry.waiting_for_acks());

        let duplicate = remote_op(&fx, CollectionAction::Insert, existing_id, 0, 0, None);
        assert!(matches!(
            fx.entry
                .apply_incoming(ClientId::new(), &duplicate, &fx.ctx, &mut fx.objects),
            Err(SyncError::DuplicateMember { .. })
        ));

        let removal = remote_op(&fx, CollectionAction::Remove, existing_id, 0, 0, None);
        fx.entry
            .apply_incoming(ClientId::new(), &removal, &fx.ctx, &mut fx.objects)
            .unwrap();
        assert!(fx.objects.get(&existing_id).is_none());
        assert_eq!(fx.entry.collection().borrow().len(), 0);
        assert!(matches!(
            fx.entry
                .apply_incoming(ClientId::new(), &removal, &fx.ctx, &mut fx.objects),
            Err(SyncError::MissingMember { .. })
        ));
    }

    #[test]
    fn test_disconnect_clears_pending_operations() {
        let mut fx = fixture(CollectionKind::Ordered, Vec::new(), 0);
        let card = SharedObject::new(card_type());
        fx.entry
            .apply_local_insert(0, &card, &fx.ctx, &mut fx.objects)
            .unwrap();
        assert!(fx.entry.waiting_for_acks());

        fx.entry.on_disconnect();
        assert!(!fx.entry.waiting_for_acks());
        assert_eq!(fx.entry.state(), EntryState::Disconnected);
        match fx.entry.variant() {
            CollectionVariant::Ordered(ordered) => assert_eq!(ordered.local_ops().count(), 0),
            other => panic!("unexpected variant {other:?}"),
        }
        assert!(matches!(
            fx.entry
                .apply_local_insert(1, &SharedObject::new(card_type()), &fx.ctx, &mut fx.objects),
            Err(SyncError::NotConnected(_))
        ));
    }

    #[test]
    fn test_dispose_releases_members() {
        let owner = ClientId::new();
        let mut fx = fixture(CollectionKind::Ordered, vec![member(owner), member(owner)], 0);
        assert_eq!(fx.objects.len(), 2);
        fx.entry.dispose(&mut fx.objects);
        assert!(fx.objects.is_empty());
        assert!(!fx.entry.is_subscribed());
        assert_eq!(fx.entry.state(), EntryState::Disposed);
    }

    #[test]
    fn test_resync_replaces_membership() {
        let owner = ClientId::new();
        let members = vec![member(owner), member(owner)];
        let keep = members[1].clone();
        let mut fx = fixture(CollectionKind::Ordered, members.clone(), 1);
        let fresh = member(owner);

        let state = CollectionState {
            id: fx.entry.id(),
            name: "board".into(),
            owner,
            kind: CollectionKind::Ordered,
            sequence: 7,
            members: vec![fresh.clone(), keep.clone()],
        };
        fx.entry.mark_faulted();
        fx.entry.resync(&state, &mut fx.objects).unwrap();

        assert_eq!(fx.entry.state(), EntryState::Connected);
        assert_eq!(fx.entry.indices().unwrap(), &[fresh.id, keep.id]);
        assert_eq!(fx.entry.sequence(), Some(7));
        assert!(fx.objects.get(&members[0].id).is_none());
        assert_eq!(fx.objects.len(), 2);
    }
}
