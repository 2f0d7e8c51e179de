//! Outbound side of the server connection.
//!
//! Publishing is fire-and-forget: acknowledgement arrives later as an echoed
//! payload in an inbound batch.

use std::cell::RefCell;

use tokio::sync::mpsc;

use crate::wire::{encode_batch, Channel, Envelope};

pub trait Transport {
    /// Hand a batch to the channel. Must preserve order per channel.
    fn publish(&self, channel: Channel, batch: Vec<Envelope>);
}

/// Records everything published. Used by tests and for offline inspection.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    published: RefCell<Vec<(Channel, Envelope)>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<(Channel, Envelope)> {
        std::mem::take(&mut *self.published.borrow_mut())
    }

    pub fn len(&self) -> usize {
        self.published.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.published.borrow().is_empty()
    }
}

impl Transport for MemoryTransport {
    fn publish(&self, channel: Channel, batch: Vec<Envelope>) {
        self.published
            .borrow_mut()
            .extend(batch.into_iter().map(|envelope| (channel, envelope)));
    }
}

/// Encodes each batch and forwards the frame to a writer task.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    outgoing_tx: mpsc::UnboundedSender<(Channel, Vec<u8>)>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(Channel, Vec<u8>)>) {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        (Self { outgoing_tx }, outgoing_rx)
    }
}

impl Transport for ChannelTransport {
    fn publish(&self, channel: Channel, batch: Vec<Envelope>) {
        match encode_batch(&batch) {
            Ok(frame) => {
                if self.outgoing_tx.send((channel, frame)).is_err() {
                    log::warn!("writer task gone, dropping {} payloads", batch.len());
                }
            }
            Err(e) => log::error!("failed to encode outgoing batch: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{ClientId, ObjectId};
    use crate::wire::{decode_batch, Payload};

    #[test]
    fn test_memory_transport_records_in_order() {
        let transport = MemoryTransport::new();
        let client = ClientId::new();
        let first = Envelope::new(client, Payload::ObjectConnected { id: ObjectId::new() });
        let second = Envelope::new(client, Payload::ObjectDeleted { id: ObjectId::new() });

        transport.publish(Channel::Objects, vec![first.clone(), second.clone()]);
        assert_eq!(transport.len(), 2);
        let published = transport.take();
        assert_eq!(published[0].1, first);
        assert_eq!(published[1].1, second);
        assert!(transport.is_empty());
    }

    #[test]
    fn test_channel_transport_frames_decode() {
        let (transport, mut frames) = ChannelTransport::new();
        let envelope = Envelope::new(ClientId::new(), Payload::CloseObject { id: ObjectId::new() });

        transport.publish(Channel::Objects, vec![envelope.clone()]);
        let (channel, frame) = frames.try_recv().unwrap();
        assert_eq!(channel, Channel::Objects);
        assert_eq!(decode_batch(&frame).unwrap(), vec![envelope]);
    }
}
