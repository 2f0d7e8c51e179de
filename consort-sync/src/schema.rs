//! Property values and type descriptors for shared objects.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::ObjectId;

/// A property value as carried on the wire.
///
/// Closed on purpose so envelopes encode with a non self-describing codec.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum PropertyValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    /// Reference to another shared object.
    Object(ObjectId),
    List(Vec<PropertyValue>),
}

impl PropertyValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Null => ValueKind::Any,
            Self::Bool(_) => ValueKind::Bool,
            Self::Int(_) => ValueKind::Int,
            Self::Float(_) => ValueKind::Float,
            Self::Text(_) => ValueKind::Text,
            Self::Bytes(_) => ValueKind::Bytes,
            Self::Object(_) => ValueKind::Object,
            Self::List(_) => ValueKind::List,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// Declared type of a property. `Any` accepts every value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    Any,
    Bool,
    Int,
    Float,
    Text,
    Bytes,
    Object,
    List,
}

impl ValueKind {
    /// Null is assignable to every kind.
    pub fn accepts(&self, value: &PropertyValue) -> bool {
        *self == ValueKind::Any || value.is_null() || value.kind() == *self
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How concurrent writes to one property are reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConcurrencyPolicy {
    /// Last writer at the server wins; local intent is reasserted on ack.
    #[default]
    Overwrite,
    /// A concurrent remote write discards pending local writes and raises a
    /// conflict event with the rejected values.
    RejectAndNotify,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDescriptor {
    pub name: String,
    pub kind: ValueKind,
    /// Computed by the server; clients never write it.
    pub server_applied: bool,
    pub policy: ConcurrencyPolicy,
}

impl PropertyDescriptor {
    pub fn new(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            server_applied: false,
            policy: ConcurrencyPolicy::Overwrite,
        }
    }
}

/// Schema of a shared object type.
///
/// Fixed types list their properties up front and address them by ordinal;
/// dynamic types grow properties on first write and address them by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDescriptor {
    pub name: String,
    pub dynamic: bool,
    pub properties: Vec<PropertyDescriptor>,
}

impl TypeDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dynamic: false,
            properties: Vec::new(),
        }
    }

    /// A key/value type whose property set is decided at runtime.
    pub fn dynamic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dynamic: true,
            properties: Vec::new(),
        }
    }

    pub fn property(mut self, name: impl Into<String>, kind: ValueKind) -> Self {
        self.properties.push(PropertyDescriptor::new(name, kind));
        self
    }

    pub fn property_with_policy(
        mut self,
        name: impl Into<String>,
        kind: ValueKind,
        policy: ConcurrencyPolicy,
    ) -> Self {
        let mut descriptor = PropertyDescriptor::new(name, kind);
        descriptor.policy = policy;
        self.properties.push(descriptor);
        self
    }

    pub fn server_applied(mut self, name: impl Into<String>, kind: ValueKind) -> Self {
        let mut descriptor = PropertyDescriptor::new(name, kind);
        descriptor.server_applied = true;
        self.properties.push(descriptor);
        self
    }

    pub fn find(&self, name: &str) -> Option<(usize, &PropertyDescriptor)> {
        self.properties
            .iter()
            .enumerate()
            .find(|(_, p)| p.name == name)
    }

    /// Two descriptors describe the same shared type.
    pub fn same_type(&self, other: &TypeDescriptor) -> bool {
        self.name == other.name && self.dynamic == other.dynamic
    }
}

/// Whether a collection keeps positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CollectionKind {
    /// Bag semantics: membership only.
    Unordered,
    /// List semantics: membership and position, reconciled by OT.
    Ordered,
}

impl fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unordered => f.write_str("unordered collection"),
            Self::Ordered => f.write_str("ordered collection"),
        }
    }
}
