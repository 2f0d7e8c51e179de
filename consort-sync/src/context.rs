//! Per-connection state shared by both managers.
//!
//! Built once by the client and handed to each manager at construction; there
//! is no process-global state.

use std::cell::Cell;
use std::rc::Rc;

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::events::EventSink;
use crate::ids::ClientId;
use crate::observable::ChangeFeed;
use crate::transport::Transport;
use crate::wire::{Envelope, Payload};

pub struct ClientContext {
    client_id: ClientId,
    transport: Rc<dyn Transport>,
    events: EventSink,
    config: SyncConfig,
    feed: ChangeFeed,
    connected: Cell<bool>,
    next_update_id: Cell<u32>,
}

impl ClientContext {
    pub fn new(
        client_id: ClientId,
        transport: Rc<dyn Transport>,
        events: EventSink,
        config: SyncConfig,
    ) -> Self {
        Self {
            client_id,
            transport,
            events,
            config,
            feed: ChangeFeed::new(),
            connected: Cell::new(false),
            next_update_id: Cell::new(0),
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    /// Feed every tracked instance reports local changes to.
    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    pub fn is_connected(&self) -> bool {
        self.connected.get()
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.set(connected);
    }

    /// Fail with `NotConnected` unless the channel is up.
    pub fn require_connected(&self, what: &str) -> Result<(), SyncError> {
        if self.connected.get() {
            Ok(())
        } else {
            Err(SyncError::NotConnected(what.to_string()))
        }
    }

    /// Allocate the id used to match a property write with its echo.
    pub fn next_update_id(&self) -> u32 {
        let id = self.next_update_id.get().wrapping_add(1);
        self.next_update_id.set(id);
        id
    }

    pub fn publish(&self, payload: Payload) {
        self.publish_correlated(0, payload);
    }

    pub fn publish_correlated(&self, correlation: u32, payload: Payload) {
        let channel = payload.channel();
        log::trace!("publish {:?} on {channel:?}", payload.kind());
        self.transport.publish(
            channel,
            vec![Envelope::correlated(self.client_id, correlation, payload)],
        );
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::events::SyncEvent;
    use crate::transport::MemoryTransport;
    use tokio::sync::mpsc;

    /// Connected context over a recording transport.
    pub fn context() -> (
        Rc<ClientContext>,
        Rc<MemoryTransport>,
        mpsc::UnboundedReceiver<SyncEvent>,
    ) {
        let transport = Rc::new(MemoryTransport::new());
        let (events, rx) = EventSink::new();
        let ctx = Rc::new(ClientContext::new(
            ClientId::new(),
            transport.clone(),
            events,
            SyncConfig::default(),
        ));
        ctx.set_connected(true);
        (ctx, transport, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::context;
    use super::*;
    use crate::ids::ObjectId;
    use crate::wire::Channel;

    #[test]
    fn test_publish_stamps_client_and_channel() {
        let (ctx, transport, _rx) = context();
        ctx.publish(Payload::CloseObject { id: ObjectId::new() });
        let published = transport.take();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, Channel::Objects);
        assert_eq!(published[0].1.client, ctx.client_id());
        assert_eq!(published[0].1.correlation, 0);
    }

    #[test]
    fn test_update_ids_increase() {
        let (ctx, _transport, _rx) = context();
        let first = ctx.next_update_id();
        assert_eq!(ctx.next_update_id(), first + 1);
    }

    #[test]
    fn test_require_connected() {
        let (ctx, _transport, _rx) = context();
        assert!(ctx.require_connected("write").is_ok());
        ctx.set_connected(false);
        assert!(matches!(
            ctx.require_connected("write"),
            Err(SyncError::NotConnected(_))
        ));
    }
}
