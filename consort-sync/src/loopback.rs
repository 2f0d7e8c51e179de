//! In-process server for tests, demos and offline tooling.
//!
//! Architecture:
//! ```text
//! SyncClient A ──publish──► LoopbackTransport ──┐
//!                                                ├─► LoopbackServer ─┬─► mailbox A ──deliver──► SyncClient A
//! SyncClient B ──publish──► LoopbackTransport ──┘    (registry)      └─► mailbox B ──deliver──► SyncClient B
//! ```
//!
//! The server keeps:
//! - a registry of named objects and collections, created on first open
//! - a global write version used for property ETags
//! - for each ordered collection, an operation log and one mirror per client
//!   of that client's unacknowledged operations, so incoming operations can
//!   be transformed against everything the client had not yet seen
//!
//! Nothing is delivered until [`LoopbackServer::deliver`] is called, so tests
//! decide exactly how client traffic interleaves.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};

use crate::client::SyncClient;
use crate::collection::transform::{self, CollectionOperation};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::ids::{ClientId, CollectionId, ETag, ObjectId};
use crate::schema::{CollectionKind, ConcurrencyPolicy, PropertyValue};
use crate::transport::Transport;
use crate::wire::{
    decode_batch, encode_batch, Channel, CollectionAction, CollectionState, Envelope, ObjectState,
    OperationPayload, Payload, PropertyKey, PropertySnapshot, PropertyUpdate,
};

#[derive(Debug, Default)]
struct Mailbox {
    connected: bool,
    queue: VecDeque<(Channel, Envelope)>,
}

#[derive(Debug)]
struct HostedObject {
    state: ObjectState,
    /// Accepted writes per property, oldest first.
    history: HashMap<String, Vec<ETag>>,
}

#[derive(Debug, Clone)]
struct LogEntry {
    op: CollectionOperation,
    /// Sequenced but not applied.
    noop: bool,
}

/// What one client has sent but not yet seen sequenced.
#[derive(Debug, Clone, Default)]
struct Mirror {
    sequence: u64,
    pending: VecDeque<CollectionOperation>,
}

impl Mirror {
    fn at(sequence: u64) -> Self {
        Self {
            sequence,
            pending: VecDeque::new(),
        }
    }

    /// Replay log entries up to `to` the way the client will see them.
    fn advance(&mut self, client: ClientId, log: &[LogEntry], to: u64) {
        while self.sequence < to {
            let Some(entry) = log.get(self.sequence as usize) else {
                break;
            };
            self.sequence += 1;
            if entry.op.client == client {
                let Some(own) = self.pending.pop_front() else {
                    continue;
                };
                if entry.noop && own.live && own.is_insert() {
                    // Someone else's insert of the same object came first;
                    // the client's later operations no longer see this one.
                    let mut undo = CollectionOperation::remove(own.object, own.index, own.sequence, client);
                    transform::transform_all(&mut undo, self.pending.iter_mut());
                }
            } else if !entry.noop {
                let mut remote = entry.op.clone();
                transform::transform_all(&mut remote, self.pending.iter_mut());
            }
        }
    }
}

#[derive(Debug)]
struct HostedCollection {
    id: CollectionId,
    name: String,
    owner: ClientId,
    kind: CollectionKind,
    items: Vec<ObjectId>,
    log: Vec<LogEntry>,
    mirrors: HashMap<ClientId, Mirror>,
}

impl HostedCollection {
    fn sequence(&self) -> u64 {
        self.log.len() as u64
    }

    fn valid(&self, op: &CollectionOperation) -> bool {
        match op.action {
            CollectionAction::Insert => op.index <= self.items.len() && !self.items.contains(&op.object),
            CollectionAction::Remove => self.items.get(op.index) == Some(&op.object),
        }
    }

    /// Sequence an operation from `client`. Returns the payload to broadcast
    /// and whether it changed the list.
    fn sequence_ordered(&mut self, client: ClientId, payload: &OperationPayload) -> (OperationPayload, bool) {
        let end = self.sequence();
        let base = payload.sequence.min(end);
        let mirror = self
            .mirrors
            .entry(client)
            .or_insert_with(|| Mirror::at(base));
        if base < mirror.sequence {
            log::warn!(
                "server: {client} sent base {base} behind its mirror at {} in '{}'",
                mirror.sequence,
                self.name
            );
        }
        mirror.advance(client, &self.log, base);
        mirror
            .pending
            .push_back(CollectionOperation::from_payload(client, payload));

        let mut view = mirror.clone();
        view.advance(client, &self.log, end);
        let transformed = view
            .pending
            .pop_back()
            .unwrap_or_else(|| CollectionOperation::from_payload(client, payload));

        let applied = transformed.live && self.valid(&transformed);
        if applied {
            match transformed.action {
                CollectionAction::Insert => self.items.insert(transformed.index, transformed.object),
                CollectionAction::Remove => {
                    self.items.remove(transformed.index);
                }
            }
        } else {
            log::debug!(
                "server: {:?} of {} in '{}' sequenced as a no-op",
                transformed.action,
                transformed.object,
                self.name
            );
        }
        self.log.push(LogEntry {
            op: transformed.clone(),
            noop: !applied,
        });
        let mut outgoing = transformed.to_payload(self.id, payload.state.clone());
        outgoing.sequence = self.sequence();
        outgoing.applied = applied;
        (outgoing, applied)
    }

    fn apply_unordered(&mut self, payload: &OperationPayload) -> bool {
        let position = self.items.iter().position(|id| *id == payload.object);
        match (payload.action, position) {
            (CollectionAction::Insert, None) => {
                self.items.push(payload.object);
                true
            }
            (CollectionAction::Remove, Some(position)) => {
                self.items.remove(position);
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug)]
struct ServerState {
    id: ClientId,
    version: u64,
    objects: HashMap<ObjectId, HostedObject>,
    object_names: HashMap<String, ObjectId>,
    collections: HashMap<CollectionId, HostedCollection>,
    collection_names: HashMap<String, CollectionId>,
    mailboxes: HashMap<ClientId, Mailbox>,
}

impl ServerState {
    fn new() -> Self {
        Self {
            id: ClientId::new(),
            version: 0,
            objects: HashMap::new(),
            object_names: HashMap::new(),
            collections: HashMap::new(),
            collection_names: HashMap::new(),
            mailboxes: HashMap::new(),
        }
    }

    fn is_connected(&self, client: ClientId) -> bool {
        self.mailboxes.get(&client).is_some_and(|m| m.connected)
    }

    fn send(&mut self, to: ClientId, envelope: Envelope) {
        if let Some(mailbox) = self.mailboxes.get_mut(&to).filter(|m| m.connected) {
            mailbox.queue.push_back((envelope.payload.channel(), envelope));
        }
    }

    fn reply(&mut self, to: ClientId, correlation: u32, payload: Payload) {
        let envelope = Envelope::correlated(self.id, correlation, payload);
        self.send(to, envelope);
    }

    /// Fan out to every connected client, the sender included.
    fn broadcast(&mut self, sender: ClientId, payload: Payload) {
        let channel = payload.channel();
        for mailbox in self.mailboxes.values_mut().filter(|m| m.connected) {
            mailbox
                .queue
                .push_back((channel, Envelope::new(sender, payload.clone())));
        }
    }

    fn receive(&mut self, client: ClientId, channel: Channel, batch: Vec<Envelope>) {
        if !self.is_connected(client) {
            log::debug!("server: dropping {} payloads from disconnected {client}", batch.len());
            return;
        }
        for envelope in batch {
            if envelope.client != client {
                log::warn!("server: {client} sent a payload stamped {}", envelope.client);
            }
            if envelope.payload.channel() != channel {
                log::warn!("server: {:?} arrived on {channel:?}", envelope.payload.kind());
            }
            self.handle(client, envelope.correlation, envelope.payload);
        }
    }

    fn handle(&mut self, client: ClientId, correlation: u32, payload: Payload) {
        match payload {
            Payload::OpenObject { name, state } => self.open_object(client, correlation, name, state),
            Payload::CloseObject { id } => log::debug!("server: {client} closed object {id}"),
            Payload::DeleteObject { id } => self.delete_object(id),
            Payload::PropertyChanged(update) => self.property_changed(client, update),
            Payload::OpenCollection { name, id, kind } => {
                self.open_collection(client, correlation, name, id, kind)
            }
            Payload::CloseCollection { id } => {
                if let Some(collection) = self.collections.get_mut(&id) {
                    collection.mirrors.remove(&client);
                }
            }
            Payload::DeleteCollection { id } => self.delete_collection(id),
            Payload::ObjectInserted(op) | Payload::ObjectRemoved(op) => self.operation(client, op),
            Payload::Heartbeat {
                collection,
                sequence,
                checksum,
            } => self.heartbeat(client, collection, sequence, checksum),
            other => log::warn!("server: ignoring {:?} from {client}", other.kind()),
        }
    }

    fn register_object(&mut self, state: ObjectState) {
        self.objects.entry(state.id).or_insert_with(|| HostedObject {
            state,
            history: HashMap::new(),
        });
    }

    fn open_object(&mut self, client: ClientId, correlation: u32, name: String, mut state: ObjectState) {
        let id = match self.object_names.get(&name) {
            Some(id) => *id,
            None => {
                let id = state.id;
                state.name = Some(name.clone());
                state.owner = client;
                match self.objects.get_mut(&id) {
                    Some(existing) => existing.state.name = Some(name.clone()),
                    None => self.register_object(state),
                }
                log::info!("server: created object '{name}' ({id})");
                self.object_names.insert(name, id);
                id
            }
        };
        if let Some(hosted) = self.objects.get(&id) {
            let state = hosted.state.clone();
            self.reply(client, correlation, Payload::ObjectOpened { state });
        }
    }

    fn delete_object(&mut self, id: ObjectId) {
        let Some(hosted) = self.objects.remove(&id) else {
            return;
        };
        if let Some(name) = hosted.state.name {
            self.object_names.remove(&name);
        }
        log::info!("server: deleted object {id}");
        let sender = self.id;
        self.broadcast(sender, Payload::ObjectDeleted { id });
    }

    fn property_changed(&mut self, client: ClientId, mut update: PropertyUpdate) {
        let Some(hosted) = self.objects.get_mut(&update.object) else {
            log::debug!("server: update for unknown object {}", update.object);
            return;
        };
        let descriptor = &hosted.state.descriptor;
        let name = match &update.property {
            PropertyKey::Index(index) => match descriptor.properties.get(*index as usize) {
                Some(property) => property.name.clone(),
                None => {
                    log::warn!("server: {client} wrote unknown property #{index}");
                    return;
                }
            },
            PropertyKey::Name(name) => name.clone(),
        };
        let (policy, server_applied) = descriptor
            .find(&name)
            .map(|(_, p)| (p.policy, p.server_applied))
            .unwrap_or((ConcurrencyPolicy::Overwrite, false));
        if server_applied {
            log::warn!("server: {client} wrote server-applied '{name}'");
            return;
        }

        let history = hosted.history.entry(name.clone()).or_default();
        if policy == ConcurrencyPolicy::RejectAndNotify {
            let seen = update.previous_etag.version;
            if history
                .iter()
                .any(|etag| etag.writer != client && etag.version > seen)
            {
                log::debug!("server: stale write to '{name}' from {client} rejected");
                return;
            }
        }

        self.version += 1;
        let etag = ETag::new(client, self.version);
        history.push(etag);
        set_snapshot(&mut hosted.state, &name, update.value.clone(), etag);
        update.etag = etag;
        self.broadcast(client, Payload::PropertyChanged(update));
    }

    fn open_collection(
        &mut self,
        client: ClientId,
        correlation: u32,
        name: String,
        id: CollectionId,
        kind: CollectionKind,
    ) {
        let id = match self.collection_names.get(&name) {
            Some(existing) => *existing,
            None => {
                log::info!("server: created {kind} '{name}' ({id})");
                self.collections.insert(
                    id,
                    HostedCollection {
                        id,
                        name: name.clone(),
                        owner: client,
                        kind,
                        items: Vec::new(),
                        log: Vec::new(),
                        mirrors: HashMap::new(),
                    },
                );
                self.collection_names.insert(name, id);
                id
            }
        };
        let Some(collection) = self.collections.get_mut(&id) else {
            return;
        };
        let sequence = collection.sequence();
        collection.mirrors.insert(client, Mirror::at(sequence));
        let members = collection
            .items
            .iter()
            .filter_map(|member| self.objects.get(member).map(|hosted| hosted.state.clone()))
            .collect();
        let state = CollectionState {
            id,
            name: collection.name.clone(),
            owner: collection.owner,
            kind: collection.kind,
            sequence,
            members,
        };
        self.reply(client, correlation, Payload::CollectionOpened { state });
    }

    fn delete_collection(&mut self, id: CollectionId) {
        let Some(collection) = self.collections.remove(&id) else {
            return;
        };
        self.collection_names.remove(&collection.name);
        log::info!("server: deleted collection '{}'", collection.name);
        let sender = self.id;
        self.broadcast(sender, Payload::CollectionDeleted { id });
    }

    fn operation(&mut self, client: ClientId, payload: OperationPayload) {
        let Some(collection) = self.collections.get_mut(&payload.collection) else {
            log::debug!("server: operation for unknown collection {}", payload.collection);
            return;
        };
        let fresh = payload
            .state
            .as_ref()
            .filter(|state| !self.objects.contains_key(&state.id))
            .cloned();

        let (outgoing, applied) = match collection.kind {
            CollectionKind::Ordered => collection.sequence_ordered(client, &payload),
            CollectionKind::Unordered => {
                let applied = collection.apply_unordered(&payload);
                (OperationPayload { applied, ..payload.clone() }, applied)
            }
        };
        let kind = collection.kind;

        let wrap = |op: OperationPayload| match op.action {
            CollectionAction::Insert => Payload::ObjectInserted(op),
            CollectionAction::Remove => Payload::ObjectRemoved(op),
        };
        if !applied && kind == CollectionKind::Unordered {
            // The sender still needs its acknowledgement.
            let envelope = Envelope::new(client, wrap(outgoing));
            self.send(client, envelope);
            return;
        }
        self.broadcast(client, wrap(outgoing));

        if let (Some(state), true) = (fresh, applied) {
            let id = state.id;
            self.register_object(state);
            self.reply(client, 0, Payload::ObjectConnected { id });
        }
    }

    fn heartbeat(&mut self, client: ClientId, id: CollectionId, sequence: u64, _checksum: u32) {
        let Some(collection) = self.collections.get(&id) else {
            return;
        };
        if collection.kind != CollectionKind::Ordered || sequence != collection.sequence() {
            return;
        }
        let checksum = transform::checksum(&collection.items);
        self.reply(
            client,
            0,
            Payload::Heartbeat {
                collection: id,
                sequence,
                checksum,
            },
        );
    }
}

fn set_snapshot(state: &mut ObjectState, name: &str, value: PropertyValue, etag: ETag) {
    match state.properties.iter_mut().find(|p| p.name == name) {
        Some(snapshot) => {
            snapshot.value = value;
            snapshot.etag = etag;
        }
        None => state.properties.push(PropertySnapshot {
            name: name.to_string(),
            value,
            etag,
        }),
    }
}

/// An in-process server shared by any number of clients on one thread.
#[derive(Debug, Clone)]
pub struct LoopbackServer {
    state: Rc<RefCell<ServerState>>,
}

impl LoopbackServer {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(ServerState::new())),
        }
    }

    /// Client id the server stamps on payloads it originates.
    pub fn id(&self) -> ClientId {
        self.state.borrow().id
    }

    /// Register `client` and return the transport it publishes through.
    pub fn transport(&self, client: ClientId) -> Rc<LoopbackTransport> {
        self.state.borrow_mut().mailboxes.insert(
            client,
            Mailbox {
                connected: true,
                queue: VecDeque::new(),
            },
        );
        Rc::new(LoopbackTransport {
            server: Rc::downgrade(&self.state),
            client,
        })
    }

    /// Create and connect a client wired to this server.
    pub fn client(&self, config: SyncConfig) -> Result<SyncClient, SyncError> {
        let id = ClientId::new();
        let transport = self.transport(id);
        let mut client = SyncClient::new(id, transport, config)?;
        client.connect()?;
        Ok(client)
    }

    /// Payloads waiting for `client`.
    pub fn pending(&self, client: ClientId) -> usize {
        self.state
            .borrow()
            .mailboxes
            .get(&client)
            .map_or(0, |m| m.queue.len())
    }

    /// Deliver everything queued for `client`, one batch per run of
    /// payloads on the same channel. Returns the number of payloads.
    pub fn deliver(&self, client: &mut SyncClient) -> Result<usize, SyncError> {
        let queued: Vec<(Channel, Envelope)> = self
            .state
            .borrow_mut()
            .mailboxes
            .get_mut(&client.client_id())
            .map(|m| m.queue.drain(..).collect())
            .unwrap_or_default();
        let count = queued.len();

        let mut current: Option<Channel> = None;
        let mut batch = Vec::new();
        for (channel, envelope) in queued {
            if let Some(previous) = current.filter(|previous| *previous != channel) {
                client.receive_batch(previous, std::mem::take(&mut batch))?;
            }
            current = Some(channel);
            batch.push(envelope);
        }
        if let Some(channel) = current {
            client.receive_batch(channel, batch)?;
        }
        Ok(count)
    }

    /// Flush and deliver round-robin until no client has anything queued.
    pub fn settle(&self, clients: &mut [&mut SyncClient]) -> Result<usize, SyncError> {
        let mut total = 0;
        loop {
            let mut round = 0;
            for client in clients.iter_mut() {
                client.flush_local_changes()?;
                round += self.deliver(client)?;
            }
            if round == 0 {
                return Ok(total);
            }
            total += round;
        }
    }

    /// Cut `client` off: queued payloads are lost and its publishes dropped.
    pub fn disconnect(&self, client: ClientId) {
        if let Some(mailbox) = self.state.borrow_mut().mailboxes.get_mut(&client) {
            mailbox.connected = false;
            mailbox.queue.clear();
        }
        for collection in self.state.borrow_mut().collections.values_mut() {
            collection.mirrors.remove(&client);
        }
    }

    pub fn reconnect(&self, client: ClientId) {
        if let Some(mailbox) = self.state.borrow_mut().mailboxes.get_mut(&client) {
            mailbox.connected = true;
        }
    }

    /// Server copy of a named object's property.
    pub fn object_value(&self, name: &str, property: &str) -> Option<PropertyValue> {
        let state = self.state.borrow();
        let id = state.object_names.get(name)?;
        let hosted = state.objects.get(id)?;
        hosted.state.property(property).map(|p| p.value.clone())
    }

    /// Server order of a named collection.
    pub fn collection_items(&self, name: &str) -> Option<Vec<ObjectId>> {
        let state = self.state.borrow();
        let id = state.collection_names.get(name)?;
        state.collections.get(id).map(|c| c.items.clone())
    }

    /// Operations sequenced so far in a named collection.
    pub fn collection_sequence(&self, name: &str) -> Option<u64> {
        let state = self.state.borrow();
        let id = state.collection_names.get(name)?;
        state.collections.get(id).map(HostedCollection::sequence)
    }
}

impl Default for LoopbackServer {
    fn default() -> Self {
        Self::new()
    }
}

/// Publishes into a [`LoopbackServer`] through the binary codec.
#[derive(Debug)]
pub struct LoopbackTransport {
    server: Weak<RefCell<ServerState>>,
    client: ClientId,
}

impl Transport for LoopbackTransport {
    fn publish(&self, channel: Channel, batch: Vec<Envelope>) {
        let Some(server) = self.server.upgrade() else {
            log::warn!("server gone, dropping {} payloads", batch.len());
            return;
        };
        let batch = match encode_batch(&batch).and_then(|frame| decode_batch(&frame)) {
            Ok(batch) => batch,
            Err(e) => {
                log::error!("failed to encode outgoing batch: {e}");
                return;
            }
        };
        match server.try_borrow_mut() {
            Ok(mut state) => state.receive(self.client, channel, batch),
            Err(_) => log::error!("server re-entered, dropping {} payloads", batch.len()),
        };
    }
}
