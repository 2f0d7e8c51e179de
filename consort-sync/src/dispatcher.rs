//! Single execution context for all reconciliation.
//!
//! The thread that creates a [`Dispatcher`] owns it. Entry mutation must run
//! there; calls made elsewhere fail with [`SyncError::AccessViolation`].
//! Transports running on other threads hop onto the owner by posting a
//! [`Job`] through a cloneable [`DispatcherHandle`]; the owner drains the inbox
//! with `SyncClient::pump`.

use std::thread::{self, ThreadId};

use tokio::sync::mpsc;

use crate::error::SyncError;
use crate::wire::{Channel, Envelope};

/// Work posted to the dispatcher from another thread.
#[derive(Debug)]
pub enum Job {
    /// An inbound batch received by the transport.
    Deliver {
        channel: Channel,
        batch: Vec<Envelope>,
    },
    /// The channel to the server came (back) up.
    Connect,
    /// The channel to the server was lost.
    Disconnect,
}

pub struct Dispatcher {
    owner: ThreadId,
    sender: mpsc::UnboundedSender<Job>,
    inbox: mpsc::UnboundedReceiver<Job>,
}

impl Dispatcher {
    /// Create a dispatcher owned by the calling thread.
    pub fn new() -> Self {
        let (sender, inbox) = mpsc::unbounded_channel();
        Self {
            owner: thread::current().id(),
            sender,
            inbox,
        }
    }

    pub fn handle(&self) -> DispatcherHandle {
        DispatcherHandle {
            owner: self.owner,
            sender: self.sender.clone(),
        }
    }

    /// True when called on the owning thread.
    pub fn check_access(&self) -> bool {
        thread::current().id() == self.owner
    }

    pub fn verify_access(&self) -> Result<(), SyncError> {
        if self.check_access() {
            Ok(())
        } else {
            Err(SyncError::AccessViolation)
        }
    }

    /// Take the next posted job, if any.
    pub(crate) fn next_job(&mut self) -> Option<Job> {
        self.inbox.try_recv().ok()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe handle used to post jobs onto the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    owner: ThreadId,
    sender: mpsc::UnboundedSender<Job>,
}

impl DispatcherHandle {
    pub fn check_access(&self) -> bool {
        thread::current().id() == self.owner
    }

    pub fn verify_access(&self) -> Result<(), SyncError> {
        if self.check_access() {
            Ok(())
        } else {
            Err(SyncError::AccessViolation)
        }
    }

    /// Queue a job for the owning thread. Never runs it inline.
    pub fn invoke(&self, job: Job) -> Result<(), SyncError> {
        self.sender
            .send(job)
            .map_err(|_| SyncError::NotConnected("dispatcher has shut down".into()))
    }
}
