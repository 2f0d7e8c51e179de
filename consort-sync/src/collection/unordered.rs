//! Unordered collection state: membership plus in-flight local operations.

use std::collections::{HashSet, VecDeque};

use super::Scope;
use crate::error::SyncError;
use crate::ids::{ClientId, ObjectId, ParentId};
use crate::object_entry::ParentRef;
use crate::objects::ObjectsManager;
use crate::observable::{ObjectRef, Origin};
use crate::wire::{CollectionAction, OperationPayload, Payload};

#[derive(Debug, Default)]
pub struct UnorderedState {
    members: HashSet<ObjectId>,
    /// Sent and not yet echoed, oldest first.
    in_flight: VecDeque<(CollectionAction, ObjectId)>,
}

impl UnorderedState {
    pub fn new(members: impl IntoIterator<Item = ObjectId>) -> Self {
        Self {
            members: members.into_iter().collect(),
            in_flight: VecDeque::new(),
        }
    }

    pub fn contains(&self, object: &ObjectId) -> bool {
        self.members.contains(object)
    }

    pub fn members(&self) -> impl Iterator<Item = &ObjectId> {
        self.members.iter()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Unacknowledged local operations.
    pub fn pending_acks(&self) -> usize {
        self.in_flight.len()
    }

    pub fn waiting_for_acks(&self) -> bool {
        !self.in_flight.is_empty()
    }

    fn check_backpressure(&self, scope: &Scope<'_>) -> Result<(), SyncError> {
        let limit = scope.ctx.config().max_pending_operations;
        if self.in_flight.len() >= limit {
            return Err(SyncError::Backpressure {
                what: format!("collection {}", scope.id),
                limit,
            });
        }
        Ok(())
    }

    pub fn local_insert(
        &mut self,
        scope: &Scope<'_>,
        object: &ObjectRef,
        objects: &mut ObjectsManager,
    ) -> Result<(), SyncError> {
        self.check_backpressure(scope)?;
        let container = ParentId::Collection(scope.id);
        if let Some(id) = objects.id_of(object) {
            if self.members.contains(&id) {
                return Err(SyncError::DuplicateMember {
                    collection: scope.id,
                    object: id,
                });
            }
        }
        let id = objects.track(object, ParentRef::unordered(container));
        self.members.insert(id);
        scope.ctx.publish(Payload::ObjectInserted(OperationPayload {
            collection: scope.id,
            action: CollectionAction::Insert,
            object: id,
            index: 0,
            sequence: 0,
            state: objects.state_of(id),
            applied: true,
        }));
        self.in_flight.push_back((CollectionAction::Insert, id));
        Ok(())
    }

    pub fn local_remove(
        &mut self,
        scope: &Scope<'_>,
        object: &ObjectRef,
        objects: &mut ObjectsManager,
    ) -> Result<(), SyncError> {
        self.check_backpressure(scope)?;
        let id = match objects.id_of(object) {
            Some(id) if self.members.contains(&id) => id,
            Some(id) => {
                return Err(SyncError::MissingMember {
                    collection: scope.id,
                    object: id,
                })
            }
            None => return Err(SyncError::UntrackedInstance),
        };
        self.members.remove(&id);
        scope.ctx.publish(Payload::ObjectRemoved(OperationPayload {
            collection: scope.id,
            action: CollectionAction::Remove,
            object: id,
            index: 0,
            sequence: 0,
            state: None,
            applied: true,
        }));
        self.in_flight.push_back((CollectionAction::Remove, id));
        objects.remove_parent(id, ParentId::Collection(scope.id));
        Ok(())
    }

    pub fn apply_incoming(
        &mut self,
        scope: &Scope<'_>,
        sender: ClientId,
        payload: &OperationPayload,
        objects: &mut ObjectsManager,
    ) -> Result<(), SyncError> {
        let id = payload.object;
        if sender == scope.ctx.client_id() {
            return match self.in_flight.front() {
                Some((action, object)) if *action == payload.action && *object == id => {
                    self.in_flight.pop_front();
                    if payload.action == CollectionAction::Insert {
                        objects.mark_connected(id);
                    }
                    Ok(())
                }
                head => Err(SyncError::UnexpectedAck {
                    subject: scope.id.as_uuid(),
                    detail: format!("expected {head:?}, received {:?} of {id}", payload.action),
                }),
            };
        }

        let container = ParentId::Collection(scope.id);
        match payload.action {
            CollectionAction::Insert => {
                if self.members.contains(&id) {
                    if self.in_flight(CollectionAction::Insert, id) {
                        log::debug!("collection {}: concurrent insert of {id}", scope.id);
                        return Ok(());
                    }
                    return Err(SyncError::DuplicateMember {
                        collection: scope.id,
                        object: id,
                    });
                }
                let object = objects.attach(id, payload.state.as_ref(), ParentRef::unordered(container))?;
                self.members.insert(id);
                let mut collection = scope.collection.borrow_mut();
                let end = collection.len();
                collection.insert_with(end, object, Origin::Remote)?;
            }
            CollectionAction::Remove => {
                if !self.members.contains(&id) {
                    if self.in_flight(CollectionAction::Remove, id) {
                        log::debug!("collection {}: concurrent remove of {id}", scope.id);
                        return Ok(());
                    }
                    return Err(SyncError::MissingMember {
                        collection: scope.id,
                        object: id,
                    });
                }
                let position = objects
                    .object_ref(id)
                    .and_then(|object| scope.collection.borrow().position(&object));
                if let Some(position) = position {
                    scope
                        .collection
                        .borrow_mut()
                        .remove_with(position, Origin::Remote)?;
                }
                self.members.remove(&id);
                objects.remove_parent(id, container);
            }
        }
        Ok(())
    }

    fn in_flight(&self, action: CollectionAction, object: ObjectId) -> bool {
        self.in_flight.iter().any(|pending| *pending == (action, object))
    }

    pub fn on_disconnect(&mut self) {
        self.in_flight.clear();
    }

    pub fn reset(&mut self, members: impl IntoIterator<Item = ObjectId>) {
        self.members = members.into_iter().collect();
        self.in_flight.clear();
    }
}
