//! Correlated requests awaiting a server reply.
//!
//! Each outstanding request is a correlation id mapped to the sending half of
//! a oneshot; completing it is an explicit transition that consumes the
//! sender. Disconnect fails every outstanding request.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::SyncError;

type Completion<T> = oneshot::Sender<Result<T, SyncError>>;

/// Result of an open call: either already known or waiting for the server.
///
/// Poll it with [`OpenRequest::try_take`] from synchronous code or `.await` it.
#[derive(Debug)]
pub struct OpenRequest<T> {
    correlation: u32,
    state: RequestState<T>,
}

#[derive(Debug)]
enum RequestState<T> {
    Ready(Option<Result<T, SyncError>>),
    Waiting(oneshot::Receiver<Result<T, SyncError>>),
}

impl<T> OpenRequest<T> {
    /// A request satisfied without a round trip (entry already open).
    pub fn ready(result: Result<T, SyncError>) -> Self {
        Self {
            correlation: 0,
            state: RequestState::Ready(Some(result)),
        }
    }

    pub fn correlation(&self) -> u32 {
        self.correlation
    }

    /// Take the outcome if the server has answered. Returns `None` while
    /// pending and after the outcome was already taken.
    pub fn try_take(&mut self) -> Option<Result<T, SyncError>> {
        match &mut self.state {
            RequestState::Ready(result) => result.take(),
            RequestState::Waiting(receiver) => match receiver.try_recv() {
                Ok(result) => {
                    self.state = RequestState::Ready(None);
                    Some(result)
                }
                Err(oneshot::error::TryRecvError::Empty) => None,
                Err(oneshot::error::TryRecvError::Closed) => {
                    self.state = RequestState::Ready(None);
                    Some(Err(SyncError::RequestAbandoned(self.correlation)))
                }
            },
        }
    }
}

impl<T: Unpin> Future for OpenRequest<T> {
    type Output = Result<T, SyncError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let correlation = this.correlation;
        match &mut this.state {
            RequestState::Ready(result) => Poll::Ready(
                result
                    .take()
                    .unwrap_or(Err(SyncError::RequestAbandoned(correlation))),
            ),
            RequestState::Waiting(receiver) => match Pin::new(receiver).poll(cx) {
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                Poll::Ready(Err(_)) => Poll::Ready(Err(SyncError::RequestAbandoned(correlation))),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

/// Outstanding requests keyed by correlation id.
#[derive(Debug)]
pub struct PendingRequests<T> {
    next_correlation: u32,
    waiting: HashMap<u32, Completion<T>>,
}

impl<T> PendingRequests<T> {
    pub fn new() -> Self {
        Self {
            next_correlation: 0,
            waiting: HashMap::new(),
        }
    }

    /// Allocate a correlation id and the request the caller will poll.
    pub fn register(&mut self) -> OpenRequest<T> {
        let correlation = self.allocate();
        let (sender, receiver) = oneshot::channel();
        self.waiting.insert(correlation, sender);
        OpenRequest {
            correlation,
            state: RequestState::Waiting(receiver),
        }
    }

    /// Allocate a correlation id nobody waits on (resynchronization opens).
    pub fn allocate(&mut self) -> u32 {
        self.next_correlation = self.next_correlation.wrapping_add(1).max(1);
        self.next_correlation
    }

    /// Complete a request. Returns false if nobody was waiting on it.
    pub fn complete(&mut self, correlation: u32, result: Result<T, SyncError>) -> bool {
        match self.waiting.remove(&correlation) {
            // The caller may have dropped its OpenRequest; that is not an error.
            Some(sender) => {
                let _ = sender.send(result);
                true
            }
            None => false,
        }
    }

    /// Fail every outstanding request.
    pub fn fail_all(&mut self, error: &SyncError) -> usize {
        let count = self.waiting.len();
        for (_, sender) in self.waiting.drain() {
            let _ = sender.send(Err(error.clone()));
        }
        count
    }

    pub fn is_waiting(&self, correlation: u32) -> bool {
        self.waiting.contains_key(&correlation)
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }
}

impl<T> Default for PendingRequests<T> {
    fn default() -> Self {
        Self::new()
    }
}
