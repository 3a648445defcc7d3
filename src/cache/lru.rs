//! Recency-ordered map backing the entry table.
//!
//! Entries live in an [`IndexMap`] ordered from least to most recently used. Touching an entry
//! moves it to the back; eviction scans from the front and skips entries the caller pins.

use std::hash::Hash;
use indexmap::map::Entry;
use indexmap::IndexMap;

pub(crate) struct LruMap<K, V> {
    map: IndexMap<K, V>,
}

impl<K: Hash + Eq, V> LruMap<K, V> {
    pub(crate) fn new() -> Self {
        LruMap { map: IndexMap::new() }
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    /// Lookup without changing recency
    pub(crate) fn peek(&self, key: &K) -> Option<&V> {
        self.map.get(key)
    }

    /// Mutable lookup without changing recency
    pub(crate) fn peek_mut(&mut self, key: &K) -> Option<&mut V> {
        self.map.get_mut(key)
    }

    /// Mutable lookup that marks the entry as most recently used
    pub(crate) fn touch(&mut self, key: &K) -> Option<&mut V> {
        let index = self.map.get_index_of(key)?;
        let last = self.map.len() - 1;
        self.map.move_index(index, last);
        self.map.get_index_mut(last).map(|(_, v)| v)
    }

    /// Returns the entry for `key` as most recently used, inserting `make()` if absent
    pub(crate) fn get_or_insert_with(&mut self, key: K, make: impl FnOnce(&K) -> V) -> &mut V {
        let index = match self.map.entry(key) {
            Entry::Occupied(occupied) => occupied.index(),
            Entry::Vacant(vacant) => {
                let value = make(vacant.key());
                let index = vacant.index();
                vacant.insert(value);
                index
            }
        };
        let last = self.map.len() - 1;
        self.map.move_index(index, last);
        &mut self.map[last]
    }

    pub(crate) fn remove(&mut self, key: &K) -> Option<V> {
        self.map.shift_remove(key)
    }

    /// Evict least recently used entries until at most `capacity` remain.
    ///
    /// Pinned entries are never evicted, so the map may stay above capacity when every
    /// remaining entry is pinned. A `capacity` of zero means unbounded.
    pub(crate) fn evict_excess(&mut self, capacity: usize, is_pinned: impl Fn(&K, &V) -> bool) -> Vec<(K, V)> {
        let mut evicted = Vec::new();
        if capacity == 0 {
            return evicted;
        }
        let mut index = 0;
        while self.map.len() > capacity && index < self.map.len() {
            let pinned = self.map.get_index(index).map(|(k, v)| is_pinned(k, v)).unwrap_or(true);
            if pinned {
                index += 1;
                continue;
            }
            if let Some(pair) = self.map.shift_remove_index(index) {
                evicted.push(pair);
            }
        }
        evicted
    }

    pub(crate) fn keys(&self) -> impl Iterator<Item = &K> {
        self.map.keys()
    }
}
