// Open-addressed hash table with linear probing and tombstone deletion.
// Grounded directly on original_source/Loxcpp/HashTable.cpp: 0.75 max load
// factor, grow-to-8-or-double, tombstone = null key + `Bool(true)` value,
// `find_string` for content-based interning lookups that bypass identity
// equality (the one place this VM compares string contents instead of
// pointers, since the string being looked up hasn't been interned yet).

use crate::object::ObjRef;
use crate::value::{values_equal, Value};

const TABLE_MAX_LOAD: f64 = 0.75;

#[derive(Clone, Copy)]
struct Entry {
    key: Option<ObjRef>,
    value: Value,
}

pub struct Table {
    entries: Vec<Entry>,
    count: usize, // live entries + tombstones
}

impl Default for Table {
    fn default() -> Self {
        Table::new()
    }
}

impl Table {
    pub fn new() -> Self {
        Table { entries: Vec::new(), count: 0 }
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.key.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    fn find_entry(entries: &[Entry], capacity: usize, key: ObjRef) -> usize {
        let mut index = (key.as_string().hash as usize) & (capacity - 1);
        let mut tombstone: Option<usize> = None;
        loop {
            let entry = &entries[index];
            match entry.key {
                None => {
                    if matches!(entry.value, Value::Nil) {
                        return tombstone.unwrap_or(index);
                    } else if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Some(k) if k.ptr_eq(key) => return index,
                Some(_) => {}
            }
            index = (index + 1) & (capacity - 1);
        }
    }

    fn adjust_capacity(&mut self, capacity: usize) {
        let mut new_entries = vec![Entry { key: None, value: Value::Nil }; capacity];
        let mut new_count = 0;
        for entry in &self.entries {
            if let Some(key) = entry.key {
                let dest = Self::find_entry(&new_entries, capacity, key);
                new_entries[dest] = Entry { key: Some(key), value: entry.value };
                new_count += 1;
            }
        }
        self.entries = new_entries;
        self.count = new_count;
    }

    /// Returns true if this created a new key.
    pub fn set(&mut self, key: ObjRef, value: Value) -> bool {
        if self.count + 1 > ((self.capacity() as f64) * TABLE_MAX_LOAD) as usize {
            let capacity = if self.capacity() < 8 { 8 } else { self.capacity() * 2 };
            self.adjust_capacity(capacity);
        }

        let index = Self::find_entry(&self.entries, self.capacity(), key);
        let entry = &mut self.entries[index];
        let is_new_key = entry.key.is_none();
        if is_new_key && matches!(entry.value, Value::Nil) {
            self.count += 1;
        }
        entry.key = Some(key);
        entry.value = value;
        is_new_key
    }

    pub fn get(&self, key: ObjRef) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        let index = Self::find_entry(&self.entries, self.capacity(), key);
        self.entries[index].key.map(|_| self.entries[index].value)
    }

    pub fn delete(&mut self, key: ObjRef) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let index = Self::find_entry(&self.entries, self.capacity(), key);
        if self.entries[index].key.is_none() {
            return false;
        }
        // Tombstone: null key, non-nil marker value.
        self.entries[index] = Entry { key: None, value: Value::Bool(true) };
        true
    }

    pub fn copy_to(&self, dest: &mut Table) {
        for entry in &self.entries {
            if let Some(key) = entry.key {
                dest.set(key, entry.value);
            }
        }
    }

    /// Finds an interned string with the given content without allocating a
    /// new one. Unlike `get`, this compares string *contents*, since the
    /// candidate being searched for has not been interned yet.
    pub fn find_string(&self, bytes: &[u8], hash: u32) -> Option<ObjRef> {
        if self.entries.is_empty() {
            return None;
        }
        let capacity = self.capacity();
        let mut index = (hash as usize) & (capacity - 1);
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None => {
                    if matches!(entry.value, Value::Nil) {
                        return None;
                    }
                }
                Some(key) => {
                    let s = key.as_string();
                    if s.hash == hash && s.bytes == bytes {
                        return Some(key);
                    }
                }
            }
            index = (index + 1) & (capacity - 1);
        }
    }

    /// Drops entries whose key object did not survive the current GC cycle's
    /// mark phase. Used only for the string-intern table: the intern table
    /// holds a *weak* reference to each string, so a string with no other
    /// referrer must be allowed to die.
    pub fn remove_white(&mut self) {
        for entry in &mut self.entries {
            if let Some(key) = entry.key {
                if !key.is_marked() {
                    entry.key = None;
                    entry.value = Value::Bool(true);
                }
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.entries.iter().filter_map(|e| e.key.map(|k| (k, e.value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;

    #[test]
    fn set_get_delete_roundtrip() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let key = heap.intern_str("hello");
        assert!(table.set(key, Value::Number(1.0)));
        assert!(values_equal(&table.get(key).unwrap(), &Value::Number(1.0)));
        assert!(table.delete(key));
        assert!(table.get(key).is_none());
    }

    #[test]
    fn overwriting_existing_key_returns_false() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let key = heap.intern_str("x");
        assert!(table.set(key, Value::Number(1.0)));
        assert!(!table.set(key, Value::Number(2.0)));
        assert!(values_equal(&table.get(key).unwrap(), &Value::Number(2.0)));
    }

    #[test]
    fn find_string_matches_by_content() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let key = heap.intern_str("needle");
        table.set(key, Value::Nil);
        let hash = crate::object::hash_bytes(b"needle");
        assert!(table.find_string(b"needle", hash).is_some());
        assert!(table.find_string(b"haystack", crate::object::hash_bytes(b"haystack")).is_none());
    }

    #[test]
    fn grows_past_load_factor() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        for i in 0..64 {
            let key = heap.intern_str(&format!("k{i}"));
            table.set(key, Value::Number(i as f64));
        }
        assert_eq!(table.len(), 64);
    }
}
