//! The synchronization client.
//!
//! Owns both managers and the dispatcher, turns local changes queued on the
//! [`ChangeFeed`](crate::observable::ChangeFeed) into outgoing payloads, and
//! routes inbound batches:
//!
//! ```text
//!  transport ─► receive_batch ─► split into runs ─┬─► ObjectsManager
//!                                                 └─► CollectionsManager
//!  other thread ─► DispatcherHandle::invoke ─► inbox ─► pump
//! ```

use std::rc::Rc;
use std::time::Instant;

use tokio::sync::mpsc;

use crate::collections::CollectionsManager;
use crate::config::SyncConfig;
use crate::context::ClientContext;
use crate::dispatcher::{Dispatcher, DispatcherHandle, Job};
use crate::error::SyncError;
use crate::events::{EventSink, SyncEvent};
use crate::ids::ClientId;
use crate::objects::ObjectsManager;
use crate::observable::{CollectionRef, LocalChange, ObjectRef, Origin};
use crate::request::OpenRequest;
use crate::schema::{CollectionKind, PropertyValue};
use crate::transport::Transport;
use crate::wire::{split_runs, Channel, Envelope, PayloadKind};

pub struct SyncClient {
    ctx: Rc<ClientContext>,
    objects: ObjectsManager,
    collections: CollectionsManager,
    dispatcher: Dispatcher,
    /// Event receiver for the application
    event_rx: Option<mpsc::UnboundedReceiver<SyncEvent>>,
}

impl SyncClient {
    /// Create a disconnected client owned by the calling thread.
    pub fn new(
        client_id: ClientId,
        transport: Rc<dyn Transport>,
        config: SyncConfig,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        let (events, event_rx) = EventSink::new();
        let ctx = Rc::new(ClientContext::new(client_id, transport, events, config));
        Ok(Self {
            objects: ObjectsManager::new(ctx.clone()),
            collections: CollectionsManager::new(ctx.clone()),
            ctx,
            dispatcher: Dispatcher::new(),
            event_rx: Some(event_rx),
        })
    }

    pub fn client_id(&self) -> ClientId {
        self.ctx.client_id()
    }

    pub fn config(&self) -> &SyncConfig {
        self.ctx.config()
    }

    pub fn is_connected(&self) -> bool {
        self.ctx.is_connected()
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Handle for posting work from other threads.
    pub fn handle(&self) -> DispatcherHandle {
        self.dispatcher.handle()
    }

    pub fn check_access(&self) -> bool {
        self.dispatcher.check_access()
    }

    pub fn objects(&self) -> &ObjectsManager {
        &self.objects
    }

    pub fn collections(&self) -> &CollectionsManager {
        &self.collections
    }

    /// True while any local change is unacknowledged.
    pub fn waiting_for_acks(&self) -> bool {
        self.objects.waiting_for_acks() || self.collections.waiting_for_acks()
    }

    /// The channel came (back) up. Every known entry is reopened so the
    /// server's replies resynchronize it.
    pub fn connect(&mut self) -> Result<(), SyncError> {
        self.dispatcher.verify_access()?;
        if self.ctx.is_connected() {
            return Ok(());
        }
        self.ctx.set_connected(true);
        log::info!("client {} connected", self.ctx.client_id());
        self.ctx.events().emit(SyncEvent::Connected);
        self.objects.on_reconnect();
        self.collections.on_reconnect();
        Ok(())
    }

    /// The channel was lost. In-flight changes and open requests are dropped.
    pub fn disconnect(&mut self) -> Result<(), SyncError> {
        self.dispatcher.verify_access()?;
        if !self.ctx.is_connected() {
            return Ok(());
        }
        self.ctx.set_connected(false);
        self.objects.on_disconnect();
        self.collections.on_disconnect();
        log::info!("client {} disconnected", self.ctx.client_id());
        self.ctx.events().emit(SyncEvent::Disconnected);
        Ok(())
    }

    /// Process one inbound batch. Only an access violation is returned;
    /// protocol faults surface as events.
    pub fn receive_batch(&mut self, channel: Channel, batch: Vec<Envelope>) -> Result<(), SyncError> {
        self.dispatcher.verify_access()?;
        if !self.ctx.is_connected() {
            log::debug!("dropping {} payloads received while disconnected", batch.len());
            return Ok(());
        }
        // Local edits made before this batch arrived must be sequenced first.
        self.drain_local_changes();

        log::trace!("received {} payloads on {channel:?}", batch.len());
        for (kind, run) in split_runs(batch) {
            match kind {
                PayloadKind::ObjectOpened
                | PayloadKind::ObjectConnected
                | PayloadKind::ObjectDeleted
                | PayloadKind::PropertyChanged => self.objects.handle_run(kind, run),
                PayloadKind::CollectionOpened
                | PayloadKind::CollectionConnected
                | PayloadKind::CollectionDeleted
                | PayloadKind::ObjectInserted
                | PayloadKind::ObjectRemoved
                | PayloadKind::Heartbeat => self.collections.handle_run(kind, run, &mut self.objects),
                _ => {
                    for envelope in run {
                        let error = SyncError::UnexpectedPayload(envelope.client);
                        log::error!("{error} ({kind:?})");
                        self.ctx.events().fault(&error, None);
                    }
                }
            }
        }
        Ok(())
    }

    /// Run every job posted through a [`DispatcherHandle`].
    pub fn pump(&mut self) -> Result<usize, SyncError> {
        self.dispatcher.verify_access()?;
        let mut processed = 0;
        while let Some(job) = self.dispatcher.next_job() {
            match job {
                Job::Deliver { channel, batch } => self.receive_batch(channel, batch)?,
                Job::Connect => self.connect()?,
                Job::Disconnect => self.disconnect()?,
            }
            processed += 1;
        }
        Ok(processed)
    }

    /// Publish every queued local change. Stops at the first rejected change,
    /// which has been rolled back on its instance; later changes stay queued.
    pub fn flush_local_changes(&mut self) -> Result<usize, SyncError> {
        self.dispatcher.verify_access()?;
        let mut flushed = 0;
        while let Some(change) = self.ctx.feed().pop() {
            self.apply_local_change(change)?;
            flushed += 1;
        }
        Ok(flushed)
    }

    fn drain_local_changes(&mut self) {
        while let Some(change) = self.ctx.feed().pop() {
            if let Err(error) = self.apply_local_change(change) {
                log::warn!("local change rejected: {error}");
                self.ctx.events().fault(&error, None);
            }
        }
    }

    fn apply_local_change(&mut self, change: LocalChange) -> Result<(), SyncError> {
        match change {
            LocalChange::Property { object, name, value } => {
                self.objects.apply_local_property_change(object, &name, value)
            }
            LocalChange::Inserted {
                collection,
                index,
                object,
            } => self
                .collections
                .apply_local_insert(collection, index, &object, &mut self.objects),
            LocalChange::Removed {
                collection,
                index,
                object,
            } => self
                .collections
                .apply_local_remove(collection, index, &object, &mut self.objects),
        }
    }

    /// Flush local changes and publish due heartbeats.
    pub fn tick(&mut self, now: Instant) -> Result<usize, SyncError> {
        self.flush_local_changes()?;
        Ok(self.collections.heartbeat(now))
    }

    pub fn open_object(&mut self, name: &str, object: ObjectRef) -> Result<OpenRequest<ObjectRef>, SyncError> {
        self.dispatcher.verify_access()?;
        self.objects.open_object(name, object)
    }

    pub fn close_object(&mut self, name: &str) -> Result<(), SyncError> {
        self.dispatcher.verify_access()?;
        self.objects.close_object(name)
    }

    pub fn delete_object(&mut self, name: &str) -> Result<(), SyncError> {
        self.dispatcher.verify_access()?;
        self.objects.delete_object(name)
    }

    pub fn open_collection(
        &mut self,
        name: &str,
        kind: CollectionKind,
    ) -> Result<OpenRequest<CollectionRef>, SyncError> {
        self.dispatcher.verify_access()?;
        self.collections.open_collection(name, kind)
    }

    pub fn close_collection(&mut self, name: &str) -> Result<(), SyncError> {
        self.dispatcher.verify_access()?;
        self.collections.close_collection(name, &mut self.objects)
    }

    pub fn delete_collection(&mut self, name: &str) -> Result<(), SyncError> {
        self.dispatcher.verify_access()?;
        self.collections.delete_collection(name)
    }

    /// Write a property and publish it.
    pub fn set_property(
        &mut self,
        object: &ObjectRef,
        name: &str,
        value: impl Into<PropertyValue>,
    ) -> Result<(), SyncError> {
        self.dispatcher.verify_access()?;
        object.borrow_mut().set(name, value)?;
        self.flush_local_changes().map(|_| ())
    }

    /// Insert into a collection and publish the operation.
    pub fn insert(&mut self, collection: &CollectionRef, index: usize, object: ObjectRef) -> Result<(), SyncError> {
        self.dispatcher.verify_access()?;
        collection.borrow_mut().insert(index, object)?;
        self.flush_local_changes().map(|_| ())
    }

    pub fn push(&mut self, collection: &CollectionRef, object: ObjectRef) -> Result<(), SyncError> {
        let index = collection.borrow().len();
        self.insert(collection, index, object)
    }

    /// Remove from a collection and publish the operation. Returns false if
    /// the object was not a member.
    pub fn remove(&mut self, collection: &CollectionRef, object: &ObjectRef) -> Result<bool, SyncError> {
        self.dispatcher.verify_access()?;
        let removed = collection.borrow_mut().remove(object)?;
        if removed {
            self.flush_local_changes()?;
        }
        Ok(removed)
    }

    /// Remove the member at `index` and publish the operation.
    pub fn remove_at(&mut self, collection: &CollectionRef, index: usize) -> Result<ObjectRef, SyncError> {
        self.dispatcher.verify_access()?;
        let object = collection
            .borrow_mut()
            .remove_with(index, Origin::Local)?;
        self.flush_local_changes()?;
        Ok(object)
    }
}
