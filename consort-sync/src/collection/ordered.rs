//! Ordered collection state: operation sequence, id order, pending local ops.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::transform::{self, CollectionOperation};
use super::Scope;
use crate::error::SyncError;
use crate::ids::{ClientId, ObjectId, ParentId};
use crate::object_entry::ParentRef;
use crate::objects::ObjectsManager;
use crate::observable::{ObjectRef, Origin};
use crate::wire::{CollectionAction, OperationPayload, Payload};

#[derive(Debug)]
pub struct OrderedState {
    /// Last server sequence applied.
    sequence: u64,
    /// Mirrors the container order.
    indices: Vec<ObjectId>,
    local_ops: VecDeque<CollectionOperation>,
    last_heartbeat: Option<Instant>,
}

impl OrderedState {
    pub fn new(sequence: u64, indices: Vec<ObjectId>) -> Self {
        Self {
            sequence,
            indices,
            local_ops: VecDeque::new(),
            last_heartbeat: None,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn indices(&self) -> &[ObjectId] {
        &self.indices
    }

    pub fn local_ops(&self) -> impl Iterator<Item = &CollectionOperation> {
        self.local_ops.iter()
    }

    pub fn waiting_for_acks(&self) -> bool {
        !self.local_ops.is_empty()
    }

    pub fn checksum(&self) -> u32 {
        transform::checksum(&self.indices)
    }

    fn check_backpressure(&self, scope: &Scope<'_>) -> Result<(), SyncError> {
        let limit = scope.ctx.config().max_pending_operations;
        if self.local_ops.len() >= limit {
            return Err(SyncError::Backpressure {
                what: format!("collection {}", scope.id),
                limit,
            });
        }
        Ok(())
    }

    /// The application inserted `object` at `index` in the container.
    pub fn local_insert(
        &mut self,
        scope: &Scope<'_>,
        index: usize,
        object: &ObjectRef,
        objects: &mut ObjectsManager,
    ) -> Result<(), SyncError> {
        self.check_backpressure(scope)?;
        if index > self.indices.len() {
            return Err(SyncError::IndexOutOfBounds {
                collection: scope.id,
                index,
                len: self.indices.len(),
            });
        }
        let container = ParentId::Collection(scope.id);
        let object_id = objects.track(object, ParentRef::ordered(container, index));
        self.indices.insert(index, object_id);

        let op = CollectionOperation::insert(object_id, index, self.sequence, scope.ctx.client_id());
        let state = objects.state_of(object_id);
        scope
            .ctx
            .publish(Payload::ObjectInserted(op.to_payload(scope.id, state)));
        self.local_ops.push_back(op);
        self.refresh_positions(container, objects);
        Ok(())
    }

    /// The application removed `object` from `index` in the container.
    pub fn local_remove(
        &mut self,
        scope: &Scope<'_>,
        index: usize,
        object: &ObjectRef,
        objects: &mut ObjectsManager,
    ) -> Result<(), SyncError> {
        self.check_backpressure(scope)?;
        let object_id = match (self.indices.get(index), objects.id_of(object)) {
            (Some(at_index), Some(id)) if *at_index == id => id,
            (_, Some(id)) => {
                return Err(SyncError::MissingMember {
                    collection: scope.id,
                    object: id,
                })
            }
            (_, None) => {
                return Err(SyncError::IndexOutOfBounds {
                    collection: scope.id,
                    index,
                    len: self.indices.len(),
                })
            }
        };
        self.indices.remove(index);

        let op = CollectionOperation::remove(object_id, index, self.sequence, scope.ctx.client_id());
        scope
            .ctx
            .publish(Payload::ObjectRemoved(op.to_payload(scope.id, None)));
        self.local_ops.push_back(op);

        let container = ParentId::Collection(scope.id);
        objects.remove_parent(object_id, container);
        self.refresh_positions(container, objects);
        Ok(())
    }

    /// Reconcile an operation broadcast by the server.
    pub fn apply_incoming(
        &mut self,
        scope: &Scope<'_>,
        sender: ClientId,
        payload: &OperationPayload,
        objects: &mut ObjectsManager,
    ) -> Result<(), SyncError> {
        let expected = self.sequence + 1;
        if payload.sequence != expected {
            return Err(SyncError::SequenceGap {
                collection: scope.id,
                expected,
                received: payload.sequence,
            });
        }

        if sender == scope.ctx.client_id() {
            return self.acknowledge(scope, payload, objects);
        }
        self.sequence = payload.sequence;

        if !payload.applied {
            log::debug!(
                "collection {}: skipping no-op {:?} of {} at {}",
                scope.id,
                payload.action,
                payload.object,
                payload.sequence
            );
            return Ok(());
        }

        let mut op = CollectionOperation::from_payload(sender, payload);
        if op.is_insert() {
            self.yield_local_inserts(scope, op.object)?;
        }
        transform::transform_all(&mut op, self.local_ops.iter_mut());
        if !op.live {
            log::debug!(
                "collection {}: remote {:?} of {} superseded by a local operation",
                scope.id,
                op.action,
                op.object
            );
            return Ok(());
        }

        let container = ParentId::Collection(scope.id);
        match op.action {
            CollectionAction::Insert => {
                if op.index > self.indices.len() {
                    return Err(SyncError::IndexOutOfBounds {
                        collection: scope.id,
                        index: op.index,
                        len: self.indices.len(),
                    });
                }
                if self.indices.contains(&op.object) {
                    return Err(SyncError::DuplicateMember {
                        collection: scope.id,
                        object: op.object,
                    });
                }
                let object = objects.attach(
                    op.object,
                    payload.state.as_ref(),
                    ParentRef::ordered(container, op.index),
                )?;
                self.indices.insert(op.index, op.object);
                scope
                    .collection
                    .borrow_mut()
                    .insert_with(op.index, object, Origin::Remote)?;
            }
            CollectionAction::Remove => {
                if self.indices.get(op.index) != Some(&op.object) {
                    return Err(SyncError::MissingMember {
                        collection: scope.id,
                        object: op.object,
                    });
                }
                self.indices.remove(op.index);
                scope
                    .collection
                    .borrow_mut()
                    .remove_with(op.index, Origin::Remote)?;
                objects.remove_parent(op.object, container);
            }
        }
        self.refresh_positions(container, objects);
        Ok(())
    }

    fn acknowledge(
        &mut self,
        scope: &Scope<'_>,
        payload: &OperationPayload,
        objects: &mut ObjectsManager,
    ) -> Result<(), SyncError> {
        match self.local_ops.front() {
            Some(head) if head.action == payload.action && head.object == payload.object => {
                self.local_ops.pop_front();
            }
            head => {
                return Err(SyncError::UnexpectedAck {
                    subject: scope.id.as_uuid(),
                    detail: format!(
                        "expected {:?}, received {:?} of {}",
                        head.map(|op| (op.action, op.object)),
                        payload.action,
                        payload.object
                    ),
                });
            }
        }
        self.sequence = payload.sequence;
        if payload.action == CollectionAction::Insert {
            objects.mark_connected(payload.object);
        }
        Ok(())
    }

    /// Another client's insert of `object` was sequenced ahead of ours, so
    /// the server will sequence ours as a no-op. Take ours back out of the
    /// view and rebase the later local operations onto its absence.
    fn yield_local_inserts(&mut self, scope: &Scope<'_>, object: ObjectId) -> Result<(), SyncError> {
        while let Some(at) = self
            .local_ops
            .iter()
            .position(|op| op.live && op.is_insert() && op.object == object)
        {
            let ours = &mut self.local_ops[at];
            ours.live = false;
            let mut undo = CollectionOperation::remove(object, ours.index, ours.sequence, ours.client);
            transform::transform_all(&mut undo, self.local_ops.iter_mut().skip(at + 1));
            if !undo.live {
                // A later local remove already took it out.
                continue;
            }
            if self.indices.get(undo.index) != Some(&object) {
                return Err(SyncError::MissingMember {
                    collection: scope.id,
                    object,
                });
            }
            self.indices.remove(undo.index);
            scope
                .collection
                .borrow_mut()
                .remove_with(undo.index, Origin::Remote)?;
            log::debug!(
                "collection {}: yielded local insert of {object} to a concurrent one",
                scope.id
            );
        }
        Ok(())
    }

    fn refresh_positions(&self, container: ParentId, objects: &mut ObjectsManager) {
        for (position, id) in self.indices.iter().enumerate() {
            objects.set_position(*id, container, position);
        }
    }

    pub fn heartbeat_due(&self, now: Instant, interval: Duration) -> bool {
        if self.waiting_for_acks() {
            return false;
        }
        match self.last_heartbeat {
            Some(last) => now.saturating_duration_since(last) >= interval,
            None => true,
        }
    }

    pub fn publish_heartbeat(&mut self, scope: &Scope<'_>, now: Instant) {
        self.last_heartbeat = Some(now);
        scope.ctx.publish(Payload::Heartbeat {
            collection: scope.id,
            sequence: self.sequence,
            checksum: self.checksum(),
        });
    }

    /// Compare against the server's checksum at the same sequence.
    pub fn check_heartbeat(&self, scope: &Scope<'_>, sequence: u64, checksum: u32) -> Result<(), SyncError> {
        if sequence != self.sequence || self.waiting_for_acks() {
            return Ok(());
        }
        if checksum != self.checksum() {
            return Err(SyncError::Desynchronized {
                collection: scope.id,
                sequence,
            });
        }
        Ok(())
    }

    pub fn on_disconnect(&mut self) {
        self.local_ops.clear();
        self.last_heartbeat = None;
    }

    /// Adopt the server's order and sequence wholesale.
    pub fn reset(&mut self, sequence: u64, indices: Vec<ObjectId>) {
        self.sequence = sequence;
        self.indices = indices;
        self.local_ops.clear();
        self.last_heartbeat = None;
    }
}
