//! §4.5 Intern table — open addressing with linear probing, reused for
//! globals, instance fields, and class methods (same `Table` type, since
//! in every role the key is an interned string `ObjRef` and the value is
//! a `Value`; only the intern table itself also calls `find_string`,
//! which is the one lookup that cannot assume its key is already
//! canonical).

use super::object::ObjRef;
use super::value::Value;

const MAX_LOAD: f64 = 0.75;
const MIN_CAPACITY: usize = 8;

#[derive(Clone, Copy)]
struct Entry {
    key: Option<ObjRef>,
    value: Value,
}

impl Entry {
    fn empty() -> Self {
        Self {
            key: None,
            value: Value::Nil,
        }
    }

    fn is_tombstone(&self) -> bool {
        self.key.is_none() && matches!(self.value, Value::Bool(true))
    }
}

pub struct Table {
    entries: Vec<Entry>,
    count: usize,
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

impl Table {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    fn find_entry_index(entries: &[Entry], capacity: usize, key: ObjRef) -> usize {
        let mut index = (key.as_string().hash as usize) % capacity;
        let mut first_tombstone: Option<usize> = None;
        loop {
            let entry = &entries[index];
            match entry.key {
                Some(k) if k == key => return index,
                None if entry.is_tombstone() => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(index);
                    }
                }
                None => return first_tombstone.unwrap_or(index),
                Some(_) => {}
            }
            index = (index + 1) % capacity;
        }
    }

    fn grow(&mut self, new_capacity: usize) {
        let mut new_entries = vec![Entry::empty(); new_capacity];
        self.count = 0;
        for entry in self.entries.iter() {
            if let Some(key) = entry.key {
                let idx = Self::find_entry_index(&new_entries, new_capacity, key);
                new_entries[idx] = *entry;
                self.count += 1;
            }
        }
        self.entries = new_entries;
    }

    pub fn get(&self, key: ObjRef) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let index = Self::find_entry_index(&self.entries, self.capacity(), key);
        self.entries[index].key.map(|_| self.entries[index].value)
    }

    /// Returns `true` if this created a brand new key.
    pub fn set(&mut self, key: ObjRef, value: Value) -> bool {
        if (self.count + 1) as f64 > self.capacity() as f64 * MAX_LOAD {
            let new_capacity = (self.capacity() * 2).max(MIN_CAPACITY);
            self.grow(new_capacity);
        }
        let index = Self::find_entry_index(&self.entries, self.capacity(), key);
        let entry = &mut self.entries[index];
        let is_new_key = entry.key.is_none();
        if is_new_key && !entry.is_tombstone() {
            self.count += 1;
        }
        entry.key = Some(key);
        entry.value = value;
        is_new_key
    }

    pub fn delete(&mut self, key: ObjRef) -> bool {
        if self.count == 0 {
            return false;
        }
        let index = Self::find_entry_index(&self.entries, self.capacity(), key);
        let entry = &mut self.entries[index];
        if entry.key.is_none() {
            return false;
        }
        entry.key = None;
        entry.value = Value::Bool(true);
        true
    }

    pub fn add_all(&mut self, from: &Table) {
        for entry in from.entries.iter() {
            if let Some(key) = entry.key {
                self.set(key, entry.value);
            }
        }
    }

    /// The one lookup that cannot use `find_entry_index`, since the
    /// string we're looking for may not be allocated yet — it compares
    /// raw bytes rather than `ObjRef` identity.
    pub fn find_string(&self, bytes: &[u8], hash: u32) -> Option<ObjRef> {
        if self.count == 0 {
            return None;
        }
        let capacity = self.capacity();
        let mut index = (hash as usize) % capacity;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None if !entry.is_tombstone() => return None,
                Some(key) => {
                    let s = key.as_string();
                    if s.hash == hash && s.bytes.as_ref() == bytes {
                        return Some(key);
                    }
                }
                None => {}
            }
            index = (index + 1) % capacity;
        }
    }

    /// Weak-ref fixup run just before a sweep (§4.4): any interned string
    /// the mark phase did not reach is no longer referenced by anything
    /// but this table, so it is removed here rather than kept alive.
    pub fn remove_unmarked_keys(&mut self) {
        let dead: Vec<ObjRef> = self
            .entries
            .iter()
            .filter_map(|e| e.key.filter(|k| !k.marked()))
            .collect();
        for key in dead {
            self.delete(key);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.entries.iter().filter_map(|e| e.key.map(|k| (k, e.value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::Heap;

    fn intern(heap: &mut Heap, s: &str) -> ObjRef {
        let hash = crate::gc::hash_bytes(s.as_bytes());
        heap.alloc_string_raw(s.as_bytes().to_vec().into_boxed_slice(), hash)
    }

    #[test]
    fn set_then_get_round_trips() {
        let mut heap = Heap::new();
        let key = intern(&mut heap, "answer");
        let mut table = Table::new();
        assert!(table.set(key, Value::Number(42.0)));
        assert_eq!(table.get(key), Some(Value::Number(42.0)));
    }

    #[test]
    fn delete_leaves_a_tombstone_that_does_not_break_further_probing() {
        let mut heap = Heap::new();
        let a = intern(&mut heap, "a");
        let b = intern(&mut heap, "b");
        let mut table = Table::new();
        table.set(a, Value::Bool(true));
        table.set(b, Value::Bool(false));
        assert!(table.delete(a));
        // `b` must still be reachable even though probing may pass through
        // `a`'s now-tombstoned slot.
        assert_eq!(table.get(b), Some(Value::Bool(false)));
        assert_eq!(table.get(a), None);
    }

    #[test]
    fn growth_rehashes_every_live_entry() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let mut keys = Vec::new();
        for i in 0..64 {
            let key = intern(&mut heap, &format!("key{i}"));
            table.set(key, Value::Number(i as f64));
            keys.push(key);
        }
        for (i, key) in keys.iter().enumerate() {
            assert_eq!(table.get(*key), Some(Value::Number(i as f64)));
        }
    }

    #[test]
    fn find_string_matches_by_bytes_before_the_object_is_canonical() {
        let mut heap = Heap::new();
        let key = intern(&mut heap, "needle");
        let hash = crate::gc::hash_bytes(b"needle");
        let mut table = Table::new();
        table.set(key, Value::Nil);
        assert_eq!(table.find_string(b"needle", hash), Some(key));
        assert_eq!(table.find_string(b"haystack", crate::gc::hash_bytes(b"haystack")), None);
    }
}
