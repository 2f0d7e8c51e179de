//! Entries indexed by unique id and, when named, by name.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

/// Lifecycle of an object or collection entry.
///
/// ```text
///  Pending ──server confirms──► Connected ──channel lost──► Disconnected
///     │                            │                             │
///     └──────── protocol fault ────┴──► Faulted ◄── reopen resets ┘
///  any state ── last parent removed / deleted ──► Disposed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryState {
    /// Created locally, not yet confirmed by the server.
    Pending,
    Connected,
    /// Channel lost; waits for a reopen to resynchronize.
    Disconnected,
    /// Hit a protocol fault; rejects local changes until resynchronized.
    Faulted,
    Disposed,
}

impl EntryState {
    /// Local changes are accepted in this state.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Pending | Self::Connected)
    }
}

/// Anything stored in an [`EntryMap`].
pub trait Entry {
    type Id: Copy + Eq + Hash + Debug;

    fn id(&self) -> Self::Id;

    fn name(&self) -> Option<&str>;
}

#[derive(Debug)]
pub struct EntryMap<E: Entry> {
    by_id: HashMap<E::Id, E>,
    by_name: HashMap<String, E::Id>,
}

impl<E: Entry> EntryMap<E> {
    pub fn new() -> Self {
        Self {
            by_id: HashMap::new(),
            by_name: HashMap::new(),
        }
    }

    /// Insert or replace an entry. Returns the entry previously stored under
    /// the same id.
    pub fn insert(&mut self, entry: E) -> Option<E> {
        let id = entry.id();
        if let Some(name) = entry.name() {
            self.by_name.insert(name.to_string(), id);
        }
        let previous = self.by_id.insert(id, entry);
        if let Some(previous_name) = previous.as_ref().and_then(|p| p.name()) {
            let renamed = self.by_id.get(&id).and_then(|e| e.name()) != Some(previous_name);
            if renamed && self.by_name.get(previous_name) == Some(&id) {
                self.by_name.remove(previous_name);
            }
        }
        previous
    }

    pub fn get(&self, id: &E::Id) -> Option<&E> {
        self.by_id.get(id)
    }

    pub fn get_mut(&mut self, id: &E::Id) -> Option<&mut E> {
        self.by_id.get_mut(id)
    }

    pub fn id_for_name(&self, name: &str) -> Option<E::Id> {
        self.by_name.get(name).copied()
    }

    pub fn by_name(&self, name: &str) -> Option<&E> {
        self.by_name.get(name).and_then(|id| self.by_id.get(id))
    }

    pub fn by_name_mut(&mut self, name: &str) -> Option<&mut E> {
        match self.by_name.get(name) {
            Some(id) => self.by_id.get_mut(id),
            None => None,
        }
    }

    pub fn contains(&self, id: &E::Id) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn remove(&mut self, id: &E::Id) -> Option<E> {
        let entry = self.by_id.remove(id)?;
        if let Some(name) = entry.name() {
            if self.by_name.get(name) == Some(id) {
                self.by_name.remove(name);
            }
        }
        Some(entry)
    }

    pub fn ids(&self) -> Vec<E::Id> {
        self.by_id.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &E> {
        self.by_id.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut E> {
        self.by_id.values_mut()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl<E: Entry> Default for EntryMap<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Named {
        id: u32,
        name: Option<String>,
    }

    impl Entry for Named {
        type Id = u32;

        fn id(&self) -> u32 {
            self.id
        }

        fn name(&self) -> Option<&str> {
            self.name.as_deref()
        }
    }

    fn named(id: u32, name: &str) -> Named {
        Named {
            id,
            name: Some(name.to_string()),
        }
    }

    #[test]
    fn test_live_states() {
        assert!(EntryState::Pending.is_live());
        assert!(EntryState::Connected.is_live());
        assert!(!EntryState::Disconnected.is_live());
        assert!(!EntryState::Faulted.is_live());
        assert!(!EntryState::Disposed.is_live());
    }

    #[test]
    fn test_lookup_by_id_and_name() {
        let mut map = EntryMap::new();
        map.insert(named(1, "board"));
        map.insert(Named { id: 2, name: None });

        assert_eq!(map.len(), 2);
        assert_eq!(map.by_name("board").unwrap().id, 1);
        assert_eq!(map.id_for_name("board"), Some(1));
        assert!(map.get(&2).unwrap().name.is_none());
    }

    #[test]
    fn test_remove_clears_name() {
        let mut map = EntryMap::new();
        map.insert(named(1, "board"));
        assert!(map.remove(&1).is_some());
        assert!(map.by_name("board").is_none());
        assert!(map.is_empty());
        assert!(map.remove(&1).is_none());
    }

    #[test]
    fn test_rename_on_replace() {
        let mut map = EntryMap::new();
        map.insert(named(1, "old"));
        let previous = map.insert(named(1, "new"));
        assert_eq!(previous, Some(named(1, "old")));
        assert!(map.by_name("old").is_none());
        assert_eq!(map.by_name("new").unwrap().id, 1);
    }

    #[test]
    fn test_name_moves_to_new_id() {
        let mut map = EntryMap::new();
        map.insert(named(1, "board"));
        map.insert(named(2, "board"));
        assert_eq!(map.id_for_name("board"), Some(2));
        map.remove(&1);
        assert_eq!(map.id_for_name("board"), Some(2));
    }
}
