//! Application-facing shared instances and their change notifications.
//!
//! ```text
//!  application                          engine
//!  ───────────                          ──────
//!  object.set("title", ..)  ──Local──►  ChangeFeed ──► SyncClient::flush_local_changes
//!                                                            │
//!  object (value updated)   ◄─Remote──  entry.apply_incoming ◄┘ (never re-queued)
//! ```
//!
//! Every write names its [`Origin`]. Only `Origin::Local` writes are pushed to
//! subscribed feeds, so the engine applying a server change can never be
//! mistaken for a new local mutation.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::SyncError;
use crate::schema::{CollectionKind, PropertyValue, TypeDescriptor};

pub type ObjectRef = Rc<RefCell<SharedObject>>;
pub type CollectionRef = Rc<RefCell<SharedCollection>>;

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one in-memory instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceKey(u64);

impl InstanceKey {
    fn next() -> Self {
        Self(NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed))
    }
}

/// Who is performing a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Application code; observers are notified.
    Local,
    /// The engine applying a server-delivered change; observers are not notified.
    Remote,
}

/// A local-origin mutation waiting to be turned into an outgoing payload.
#[derive(Debug, Clone)]
pub enum LocalChange {
    Property {
        object: InstanceKey,
        name: String,
        value: PropertyValue,
    },
    Inserted {
        collection: InstanceKey,
        index: usize,
        object: ObjectRef,
    },
    Removed {
        collection: InstanceKey,
        index: usize,
        object: ObjectRef,
    },
}

type FeedQueue = RefCell<VecDeque<LocalChange>>;

/// FIFO of local changes shared by every instance a client tracks.
#[derive(Debug, Clone, Default)]
pub struct ChangeFeed {
    queue: Rc<FeedQueue>,
}

impl ChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pop(&self) -> Option<LocalChange> {
        self.queue.borrow_mut().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.borrow().is_empty()
    }

    fn downgrade(&self) -> Weak<FeedQueue> {
        Rc::downgrade(&self.queue)
    }
}

#[derive(Debug, Default)]
struct Observers {
    next_id: u64,
    feeds: Vec<(u64, Weak<FeedQueue>)>,
}

impl Observers {
    fn subscribe(&mut self, feed: &ChangeFeed) -> u64 {
        self.next_id += 1;
        self.feeds.push((self.next_id, feed.downgrade()));
        self.next_id
    }

    fn unsubscribe(&mut self, id: u64) {
        self.feeds.retain(|(existing, _)| *existing != id);
    }

    fn notify(&mut self, change: LocalChange) {
        self.feeds.retain(|(_, feed)| feed.strong_count() > 0);
        for (_, feed) in &self.feeds {
            if let Some(queue) = feed.upgrade() {
                queue.borrow_mut().push_back(change.clone());
            }
        }
    }

    fn len(&self) -> usize {
        self.feeds.len()
    }
}

enum Target {
    Object(Weak<RefCell<SharedObject>>),
    Collection(Weak<RefCell<SharedCollection>>),
}

/// Change-notification capability held by an entry.
///
/// Acquired when the entry starts tracking an instance; dropping it detaches
/// the feed from the instance.
pub struct Subscription {
    target: Target,
    id: u64,
}

impl Subscription {
    pub fn to_object(object: &ObjectRef, feed: &ChangeFeed) -> Self {
        let id = object.borrow_mut().observers.subscribe(feed);
        Self {
            target: Target::Object(Rc::downgrade(object)),
            id,
        }
    }

    pub fn to_collection(collection: &CollectionRef, feed: &ChangeFeed) -> Self {
        let id = collection.borrow_mut().observers.subscribe(feed);
        Self {
            target: Target::Collection(Rc::downgrade(collection)),
            id,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        match &self.target {
            Target::Object(weak) => {
                if let Some(object) = weak.upgrade() {
                    if let Ok(mut object) = object.try_borrow_mut() {
                        object.observers.unsubscribe(self.id);
                    }
                }
            }
            Target::Collection(weak) => {
                if let Some(collection) = weak.upgrade() {
                    if let Ok(mut collection) = collection.try_borrow_mut() {
                        collection.observers.unsubscribe(self.id);
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// A mutable, property-change-notifying object shared with other clients.
#[derive(Debug)]
pub struct SharedObject {
    key: InstanceKey,
    descriptor: Arc<TypeDescriptor>,
    values: BTreeMap<String, PropertyValue>,
    observers: Observers,
}

impl SharedObject {
    /// Create an instance with every declared property set to null.
    pub fn new(descriptor: TypeDescriptor) -> ObjectRef {
        Self::with_descriptor(Arc::new(descriptor))
    }

    pub fn with_descriptor(descriptor: Arc<TypeDescriptor>) -> ObjectRef {
        let values = descriptor
            .properties
            .iter()
            .map(|p| (p.name.clone(), PropertyValue::Null))
            .collect();
        Rc::new(RefCell::new(Self {
            key: InstanceKey::next(),
            descriptor,
            values,
            observers: Observers::default(),
        }))
    }

    /// Create an empty key/value instance.
    pub fn dynamic(type_name: impl Into<String>) -> ObjectRef {
        Self::new(TypeDescriptor::dynamic(type_name))
    }

    pub fn key(&self) -> InstanceKey {
        self.key
    }

    pub fn descriptor(&self) -> &Arc<TypeDescriptor> {
        &self.descriptor
    }

    pub fn is_dynamic(&self) -> bool {
        self.descriptor.dynamic
    }

    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.values.get(name)
    }

    /// Key/value view over current values.
    pub fn values(&self) -> impl Iterator<Item = (&str, &PropertyValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Set a property as the application. Subscribed feeds are notified.
    pub fn set(
        &mut self,
        name: impl Into<String>,
        value: impl Into<PropertyValue>,
    ) -> Result<(), SyncError> {
        self.write(&name.into(), value.into(), Origin::Local)
    }

    pub fn write(
        &mut self,
        name: &str,
        value: PropertyValue,
        origin: Origin,
    ) -> Result<(), SyncError> {
        if let Some((_, property)) = self.descriptor.find(name) {
            if !property.kind.accepts(&value) {
                return Err(SyncError::ValueKindMismatch {
                    property: name.to_string(),
                    expected: property.kind.to_string(),
                    actual: value.kind().to_string(),
                });
            }
            if origin == Origin::Local && property.server_applied {
                return Err(SyncError::ServerAppliedProperty {
                    property: name.to_string(),
                });
            }
        } else if !self.descriptor.dynamic {
            return Err(SyncError::UnknownProperty {
                type_name: self.descriptor.name.clone(),
                property: name.to_string(),
            });
        }

        let previous = self.values.insert(name.to_string(), value.clone());
        if origin == Origin::Local && previous.as_ref() != Some(&value) {
            self.observers.notify(LocalChange::Property {
                object: self.key,
                name: name.to_string(),
                value,
            });
        }
        Ok(())
    }
}

/// A shared container of objects, ordered or unordered.
#[derive(Debug)]
pub struct SharedCollection {
    key: InstanceKey,
    kind: CollectionKind,
    items: Vec<ObjectRef>,
    observers: Observers,
}

impl SharedCollection {
    pub fn new(kind: CollectionKind) -> CollectionRef {
        Rc::new(RefCell::new(Self {
            key: InstanceKey::next(),
            kind,
            items: Vec::new(),
            observers: Observers::default(),
        }))
    }

    pub fn key(&self) -> InstanceKey {
        self.key
    }

    pub fn kind(&self) -> CollectionKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[ObjectRef] {
        &self.items
    }

    pub fn get(&self, index: usize) -> Option<&ObjectRef> {
        self.items.get(index)
    }

    pub fn position(&self, object: &ObjectRef) -> Option<usize> {
        let key = object.borrow().key();
        self.items.iter().position(|item| item.borrow().key() == key)
    }

    pub fn contains(&self, object: &ObjectRef) -> bool {
        self.position(object).is_some()
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Insert as the application. Unordered collections ignore positions on
    /// the wire but keep insertion order locally.
    pub fn insert(&mut self, index: usize, object: ObjectRef) -> Result<(), SyncError> {
        self.insert_with(index, object, Origin::Local)
    }

    /// Append as the application.
    pub fn push(&mut self, object: ObjectRef) -> Result<(), SyncError> {
        let index = self.items.len();
        self.insert_with(index, object, Origin::Local)
    }

    /// Remove as the application. Returns false if the object is absent.
    pub fn remove(&mut self, object: &ObjectRef) -> Result<bool, SyncError> {
        match self.position(object) {
            Some(index) => {
                self.remove_with(index, Origin::Local)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn insert_with(
        &mut self,
        index: usize,
        object: ObjectRef,
        origin: Origin,
    ) -> Result<(), SyncError> {
        if index > self.items.len() {
            return Err(SyncError::InvalidIndex {
                index,
                len: self.items.len(),
            });
        }
        if self.contains(&object) {
            return Err(SyncError::DuplicateInstance);
        }
        self.items.insert(index, object.clone());
        if origin == Origin::Local {
            self.observers.notify(LocalChange::Inserted {
                collection: self.key,
                index,
                object,
            });
        }
        Ok(())
    }

    pub fn remove_with(&mut self, index: usize, origin: Origin) -> Result<ObjectRef, SyncError> {
        if index >= self.items.len() {
            return Err(SyncError::InvalidIndex {
                index,
                len: self.items.len(),
            });
        }
        let object = self.items.remove(index);
        if origin == Origin::Local {
            self.observers.notify(LocalChange::Removed {
                collection: self.key,
                index,
                object: object.clone(),
            });
        }
        Ok(object)
    }

    /// Replace every item with the server's membership. Never notifies.
    pub(crate) fn replace_remote(&mut self, items: Vec<ObjectRef>) {
        self.items = items;
    }
}
