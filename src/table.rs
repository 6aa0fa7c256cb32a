// File: src/table.rs
//
// Open-addressed hash table keyed by interned strings, used for the VM's
// globals and the heap's intern set. Linear probing over a power-of-two
// capacity; deletions leave tombstones so probe chains stay intact.
//
// Because keys are interned, identity comparison on the handle is enough to
// match a key. The key's hash is passed in (and cached per entry) so the
// table never needs to reach back into the heap.

use crate::object::ObjRef;
use crate::value::Value;

const MAX_LOAD: f64 = 0.75;

#[derive(Debug, Clone, Copy)]
struct Entry {
    key: Option<ObjRef>,
    hash: u32,
    value: Value,
}

impl Entry {
    const EMPTY: Entry = Entry { key: None, hash: 0, value: Value::Nil };

    /// A tombstone is a vacated entry: no key, but a `true` value so probes
    /// scanning for a key do not stop early.
    fn is_tombstone(&self) -> bool {
        self.key.is_none() && self.value == Value::Bool(true)
    }
}

#[derive(Debug, Default)]
pub struct Table {
    /// Live entries plus tombstones. Tombstones only disappear on rehash.
    count: usize,
    entries: Vec<Entry>,
}

impl Table {
    pub fn new() -> Self {
        Table::default()
    }

    pub fn get(&self, key: ObjRef, hash: u32) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let entry = &self.entries[self.find_index(key, hash)];
        entry.key.map(|_| entry.value)
    }

    /// Inserts or updates. Returns true when `key` was not present before.
    pub fn set(&mut self, key: ObjRef, hash: u32, value: Value) -> bool {
        if (self.count + 1) as f64 > self.entries.len() as f64 * MAX_LOAD {
            self.grow();
        }

        let index = self.find_index(key, hash);
        let entry = &mut self.entries[index];
        let is_new_key = entry.key.is_none();
        // Filling a tombstone reuses a slot the count already paid for.
        if is_new_key && !entry.is_tombstone() {
            self.count += 1;
        }

        self.entries[index] = Entry { key: Some(key), hash, value };
        is_new_key
    }

    /// Removes `key`, leaving a tombstone. Returns whether it was present.
    pub fn delete(&mut self, key: ObjRef, hash: u32) -> bool {
        if self.count == 0 {
            return false;
        }
        let index = self.find_index(key, hash);
        if self.entries[index].key.is_none() {
            return false;
        }
        self.entries[index] = Entry { key: None, hash: 0, value: Value::Bool(true) };
        true
    }

    /// Probes for a key the table might hold under a different handle. Used
    /// by the intern set, which must compare contents before a string is
    /// interned; `eq` decides whether a candidate key's referent matches.
    pub fn find_key(&self, hash: u32, eq: impl Fn(ObjRef) -> bool) -> Option<ObjRef> {
        if self.count == 0 {
            return None;
        }
        let mask = self.entries.len() - 1;
        let mut index = hash as usize & mask;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None => {
                    if !entry.is_tombstone() {
                        return None;
                    }
                }
                Some(key) => {
                    if entry.hash == hash && eq(key) {
                        return Some(key);
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    /// Live (key, value) pairs, tombstones skipped.
    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.entries.iter().filter_map(|e| e.key.map(|k| (k, e.value)))
    }

    /// Deletes every entry whose key fails `is_marked`. Run during garbage
    /// collection, before the sweep frees the unmarked keys.
    pub fn remove_unmarked(&mut self, is_marked: impl Fn(ObjRef) -> bool) {
        for entry in &mut self.entries {
            if let Some(key) = entry.key {
                if !is_marked(key) {
                    *entry = Entry { key: None, hash: 0, value: Value::Bool(true) };
                }
            }
        }
    }

    /// Index of `key`'s entry if present; otherwise the index where an
    /// insert should land: the first tombstone passed, or the empty slot
    /// that terminated the probe. Capacity must be nonzero.
    fn find_index(&self, key: ObjRef, hash: u32) -> usize {
        let mask = self.entries.len() - 1;
        let mut index = hash as usize & mask;
        let mut tombstone: Option<usize> = None;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None => {
                    if entry.is_tombstone() {
                        if tombstone.is_none() {
                            tombstone = Some(index);
                        }
                    } else {
                        return tombstone.unwrap_or(index);
                    }
                }
                Some(existing) => {
                    if existing == key {
                        return index;
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    fn grow(&mut self) {
        let capacity = if self.entries.len() < 8 { 8 } else { self.entries.len() * 2 };
        let old = std::mem::replace(&mut self.entries, vec![Entry::EMPTY; capacity]);

        // Tombstones are dropped on the floor here, so recount.
        self.count = 0;
        for entry in old {
            if let Some(key) = entry.key {
                let index = self.find_index(key, entry.hash);
                self.entries[index] = Entry { key: Some(key), hash: entry.hash, value: entry.value };
                self.count += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u32) -> ObjRef {
        ObjRef(n)
    }

    #[test]
    fn set_get_update() {
        let mut table = Table::new();
        assert!(table.set(key(1), 10, Value::Number(1.0)));
        assert!(!table.set(key(1), 10, Value::Number(2.0)));
        assert_eq!(table.get(key(1), 10), Some(Value::Number(2.0)));
        assert_eq!(table.get(key(2), 10), None);
    }

    #[test]
    fn delete_leaves_probe_chains_intact() {
        let mut table = Table::new();
        // Same hash forces all three keys onto one probe chain.
        table.set(key(1), 7, Value::Number(1.0));
        table.set(key(2), 7, Value::Number(2.0));
        table.set(key(3), 7, Value::Number(3.0));

        assert!(table.delete(key(2), 7));
        assert!(!table.delete(key(2), 7));
        // The key past the tombstone must still be reachable.
        assert_eq!(table.get(key(3), 7), Some(Value::Number(3.0)));

        // Reinserting reuses the tombstone without growing the count.
        table.set(key(2), 7, Value::Number(4.0));
        assert_eq!(table.get(key(2), 7), Some(Value::Number(4.0)));
    }

    #[test]
    fn grows_past_load_factor() {
        let mut table = Table::new();
        for i in 0..64 {
            table.set(key(i), i, Value::Number(i as f64));
        }
        for i in 0..64 {
            assert_eq!(table.get(key(i), i), Some(Value::Number(i as f64)));
        }
    }

    #[test]
    fn find_key_sees_through_tombstones_but_stops_at_empty() {
        let mut table = Table::new();
        table.set(key(1), 5, Value::Nil);
        table.set(key(2), 5, Value::Nil);
        table.delete(key(1), 5);
        assert_eq!(table.find_key(5, |k| k == key(2)), Some(key(2)));
        assert_eq!(table.find_key(5, |k| k == key(9)), None);
    }

    #[test]
    fn iter_skips_tombstones() {
        let mut table = Table::new();
        table.set(key(1), 1, Value::Nil);
        table.set(key(2), 2, Value::Nil);
        table.delete(key(1), 1);
        let keys: Vec<ObjRef> = table.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![key(2)]);
    }

    #[test]
    fn remove_unmarked_tombstones_entries() {
        let mut table = Table::new();
        table.set(key(1), 1, Value::Nil);
        table.set(key(2), 2, Value::Nil);
        table.remove_unmarked(|k| k == key(2));
        assert_eq!(table.get(key(1), 1), None);
        assert_eq!(table.get(key(2), 2), Some(Value::Nil));
    }
}
