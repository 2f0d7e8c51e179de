//! Identifiers shared between clients and the server.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh random id.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

uuid_id!(
    /// Identity of one connected client. Ordering breaks insert/insert ties.
    ClientId
);
uuid_id!(
    /// Unique id of a shared object, stable across clients.
    ObjectId
);
uuid_id!(
    /// Unique id of a shared collection.
    CollectionId
);

/// Container an object is reachable from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParentId {
    /// The client's own named-object root (opened by name).
    Root,
    Collection(CollectionId),
}

impl fmt::Display for ParentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Root => f.write_str("root"),
            Self::Collection(id) => write!(f, "collection {id}"),
        }
    }
}

/// Entity tag: the writer and server version that last set a property.
///
/// The server assigns versions; clients only carry the tag they last saw and
/// echo it as `previous_etag` on writes so stale writes can be detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ETag {
    pub writer: ClientId,
    pub version: u64,
}

impl ETag {
    /// Tag of a property nobody has written through the server yet.
    pub const INITIAL: ETag = ETag {
        writer: ClientId(Uuid::nil()),
        version: 0,
    };

    pub fn new(writer: ClientId, version: u64) -> Self {
        Self { writer, version }
    }
}

impl Default for ETag {
    fn default() -> Self {
        Self::INITIAL
    }
}

impl fmt::Display for ETag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.writer, self.version)
    }
}
