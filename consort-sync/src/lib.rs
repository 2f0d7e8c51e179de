//! # consort-sync: client-side shared-state reconciliation
//!
//! Keeps application objects and collections consistent with a central server
//! that sequences every change. Local edits are applied immediately and
//! published; the server broadcasts each accepted change to every client,
//! the author included, and the echo is the acknowledgement.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐   publish    ┌─────────────┐
//! │ SharedObject /       │ ──Local──►   │             │
//! │ SharedCollection     │  ChangeFeed  │ SyncClient  │ ──Transport──► server
//! │ (application state)  │ ◄──Remote──  │             │ ◄─receive_batch──┘
//! └──────────────────────┘              └──────┬──────┘
//!                                              │
//!                              ┌───────────────┴───────────────┐
//!                              ▼                               ▼
//!                      ┌───────────────┐               ┌──────────────────┐
//!                      │ObjectsManager │               │CollectionsManager│
//!                      │ ETag / policy │               │ OT + heartbeats  │
//!                      └───────────────┘               └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`client`]: connection lifecycle, batch routing, local change flushing
//! - [`objects`] / [`object_entry`]: property reconciliation
//! - [`collections`] / [`collection`]: membership and ordering reconciliation
//! - [`wire`]: bincode-encoded envelopes and payloads
//! - [`loopback`]: in-process server for tests and demos

pub mod client;
pub mod collection;
pub mod collections;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod entry_map;
pub mod error;
pub mod events;
pub mod ids;
pub mod loopback;
pub mod object_entry;
pub mod objects;
pub mod observable;
pub mod request;
pub mod schema;
pub mod transport;
pub mod wire;

// Re-exports for convenience
pub use client::SyncClient;
pub use collection::{CollectionEntry, CollectionOperation, CollectionVariant};
pub use collections::CollectionsManager;
pub use config::SyncConfig;
pub use dispatcher::{Dispatcher, DispatcherHandle, Job};
pub use entry_map::EntryState;
pub use error::{ErrorKind, SyncError};
pub use events::{ConflictDetails, ErrorEvent, Subject, SyncEvent};
pub use ids::{ClientId, CollectionId, ETag, ObjectId, ParentId};
pub use loopback::{LoopbackServer, LoopbackTransport};
pub use objects::ObjectsManager;
pub use observable::{CollectionRef, ObjectRef, Origin, SharedCollection, SharedObject};
pub use request::OpenRequest;
pub use schema::{CollectionKind, ConcurrencyPolicy, PropertyValue, TypeDescriptor, ValueKind};
pub use transport::{ChannelTransport, MemoryTransport, Transport};
pub use wire::{Channel, Envelope, Payload};
