//! Symbol tables mapping interned strings to values.
//!
//! An open-addressing, linear-probe hash table. Keys are heap ids of interned
//! strings; because interning guarantees one string object per byte sequence,
//! key comparison is plain identity. Each entry stores the key's FNV-1a hash
//! so probing (and resizing) never needs heap access.
//!
//! Deletion uses tombstones: `key: None, value: Bool(true)`, distinguished
//! from truly empty slots (`key: None, value: Nil`) by the non-nil value.

use crate::heap::HeapId;
use crate::value::Value;

/// Table load factor: resize once three quarters of the slots are in use.
const MAX_LOAD_NUM: usize = 3;
const MAX_LOAD_DEN: usize = 4;

const MIN_CAPACITY: usize = 8;

#[derive(Debug, Clone, Copy)]
struct Entry {
    key: Option<HeapId>,
    hash: u32,
    value: Value,
}

impl Entry {
    const EMPTY: Self = Self {
        key: None,
        hash: 0,
        value: Value::Nil,
    };

    const TOMBSTONE: Self = Self {
        key: None,
        hash: 0,
        value: Value::Bool(true),
    };

    fn is_tombstone(&self) -> bool {
        self.key.is_none() && !self.value.is_nil()
    }
}

/// A map from interned string to [`Value`].
#[derive(Debug, Default)]
pub struct SymbolTable {
    entries: Vec<Entry>,
    /// Occupied slots, tombstones included.
    count: usize,
}

impl SymbolTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes held by the entry array, for the heap's allocation accounting.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.entries.len() * std::mem::size_of::<Entry>()
    }

    /// Looks up `key`. `hash` must be the key string's stored hash.
    #[must_use]
    pub fn get(&self, key: HeapId, hash: u32) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        let entry = &self.entries[self.find_slot(key, hash)];
        entry.key.map(|_| entry.value)
    }

    /// Inserts or updates `key`. Returns true if the key was not present.
    pub fn set(&mut self, key: HeapId, hash: u32, value: Value) -> bool {
        if (self.count + 1) * MAX_LOAD_DEN > self.entries.len() * MAX_LOAD_NUM {
            self.grow();
        }
        let slot = self.find_slot(key, hash);
        let entry = &mut self.entries[slot];
        let is_new = entry.key.is_none();
        // Tombstone slots are already counted.
        if is_new && !entry.is_tombstone() {
            self.count += 1;
        }
        *entry = Entry {
            key: Some(key),
            hash,
            value,
        };
        is_new
    }

    /// Removes `key`, leaving a tombstone. Returns true if it was present.
    pub fn delete(&mut self, key: HeapId, hash: u32) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let slot = self.find_slot(key, hash);
        if self.entries[slot].key.is_none() {
            return false;
        }
        self.entries[slot] = Entry::TOMBSTONE;
        true
    }

    /// Finds an interned key by content before the string object exists.
    ///
    /// Probes with `hash`; `eq` is called for candidate keys with a matching
    /// hash to compare the actual bytes.
    pub fn find_string(&self, hash: u32, mut eq: impl FnMut(HeapId) -> bool) -> Option<HeapId> {
        if self.entries.is_empty() {
            return None;
        }
        let mask = self.entries.len() - 1;
        let mut index = hash as usize & mask;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None if !entry.is_tombstone() => return None,
                Some(key) if entry.hash == hash && eq(key) => return Some(key),
                _ => {}
            }
            index = (index + 1) & mask;
        }
    }

    /// Iterates over live `(key, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (HeapId, Value)> + '_ {
        self.entries
            .iter()
            .filter_map(|entry| entry.key.map(|key| (key, entry.value)))
    }

    /// Evicts every entry whose key fails `is_marked`.
    ///
    /// Called on the intern set between mark and sweep so dead strings are
    /// out of the table before their slots are freed.
    pub fn remove_unmarked(&mut self, is_marked: impl Fn(HeapId) -> bool) {
        for entry in &mut self.entries {
            if let Some(key) = entry.key
                && !is_marked(key)
            {
                *entry = Entry::TOMBSTONE;
            }
        }
    }

    /// Returns the slot holding `key`, or the slot where it would be
    /// inserted (reusing the first tombstone passed on the probe).
    fn find_slot(&self, key: HeapId, hash: u32) -> usize {
        let mask = self.entries.len() - 1;
        let mut index = hash as usize & mask;
        let mut tombstone: Option<usize> = None;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None => {
                    if entry.is_tombstone() {
                        tombstone.get_or_insert(index);
                    } else {
                        return tombstone.unwrap_or(index);
                    }
                }
                Some(existing) if existing == key => return index,
                Some(_) => {}
            }
            index = (index + 1) & mask;
        }
    }

    fn grow(&mut self) {
        let capacity = (self.entries.len() * 2).max(MIN_CAPACITY);
        let old = std::mem::replace(&mut self.entries, vec![Entry::EMPTY; capacity]);
        // Tombstones are dropped by the rebuild.
        self.count = 0;
        for entry in old {
            if let Some(key) = entry.key {
                let slot = self.find_slot(key, entry.hash);
                self.entries[slot] = entry;
                self.count += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{hash_string, Heap, Obj, ObjStr};

    fn intern(heap: &mut Heap, text: &str) -> (HeapId, u32) {
        let hash = hash_string(text.as_bytes());
        let id = heap.allocate(Obj::Str(ObjStr {
            chars: text.to_string(),
            hash,
        }));
        (id, hash)
    }

    #[test]
    fn test_set_and_get() {
        let mut heap = Heap::new();
        let mut table = SymbolTable::new();
        let (key, hash) = intern(&mut heap, "answer");

        assert!(table.set(key, hash, Value::Number(42.0)));
        assert_eq!(table.get(key, hash).and_then(Value::as_number), Some(42.0));

        // Updating does not report a new key.
        assert!(!table.set(key, hash, Value::Number(7.0)));
        assert_eq!(table.get(key, hash).and_then(Value::as_number), Some(7.0));
    }

    #[test]
    fn test_get_missing() {
        let mut heap = Heap::new();
        let table = SymbolTable::new();
        let (key, hash) = intern(&mut heap, "missing");
        assert!(table.get(key, hash).is_none());
    }

    #[test]
    fn test_delete_leaves_probe_chain_intact() {
        let mut heap = Heap::new();
        let mut table = SymbolTable::new();
        let keys: Vec<(HeapId, u32)> = (0..16)
            .map(|i| intern(&mut heap, &format!("key{i}")))
            .collect();
        for (i, &(key, hash)) in keys.iter().enumerate() {
            table.set(key, hash, Value::Number(i as f64));
        }

        let (gone, gone_hash) = keys[3];
        assert!(table.delete(gone, gone_hash));
        assert!(!table.delete(gone, gone_hash));
        assert!(table.get(gone, gone_hash).is_none());

        // Everything else must still be reachable through any tombstones.
        for (i, &(key, hash)) in keys.iter().enumerate() {
            if i == 3 {
                continue;
            }
            assert_eq!(table.get(key, hash).and_then(Value::as_number), Some(i as f64));
        }
    }

    #[test]
    fn test_growth_preserves_entries() {
        let mut heap = Heap::new();
        let mut table = SymbolTable::new();
        let keys: Vec<(HeapId, u32)> = (0..100)
            .map(|i| intern(&mut heap, &format!("entry{i}")))
            .collect();
        for (i, &(key, hash)) in keys.iter().enumerate() {
            table.set(key, hash, Value::Number(i as f64));
        }
        for (i, &(key, hash)) in keys.iter().enumerate() {
            assert_eq!(table.get(key, hash).and_then(Value::as_number), Some(i as f64));
        }
    }

    #[test]
    fn test_find_string() {
        let mut heap = Heap::new();
        let mut table = SymbolTable::new();
        let (key, hash) = intern(&mut heap, "needle");
        table.set(key, hash, Value::Nil);

        let found = table.find_string(hash, |id| heap.str(id).chars == "needle");
        assert_eq!(found, Some(key));

        let missing_hash = hash_string(b"haystack");
        assert!(table
            .find_string(missing_hash, |id| heap.str(id).chars == "haystack")
            .is_none());
    }

    #[test]
    fn test_remove_unmarked() {
        let mut heap = Heap::new();
        let mut table = SymbolTable::new();
        let (kept, kept_hash) = intern(&mut heap, "kept");
        let (dead, dead_hash) = intern(&mut heap, "dead");
        table.set(kept, kept_hash, Value::Nil);
        table.set(dead, dead_hash, Value::Nil);

        table.remove_unmarked(|id| id == kept);

        assert!(table.get(kept, kept_hash).is_some());
        assert!(table.get(dead, dead_hash).is_none());
    }
}
