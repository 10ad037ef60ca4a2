//! Open-addressed, string-keyed hash table.
//!
//! Linear probing over a power-of-two capacity, max load factor 3/4, with
//! tombstones to keep probe chains intact after deletion. Keys are interned
//! strings, so lookup compares pointers; `find_string` is the by-content
//! probe the interner itself uses.

use crate::objects::object_string::ObjectString;
use crate::value::{is_bool, make_bool_value, make_null_value, Value, NULL_VALUE};

const TABLE_MAX_LOAD_NUM: usize = 3;
const TABLE_MAX_LOAD_DEN: usize = 4;

#[derive(Clone, Copy)]
struct Entry {
    key: *mut ObjectString,
    value: Value,
}

const EMPTY_ENTRY: Entry = Entry {
    key: std::ptr::null_mut(),
    value: NULL_VALUE,
};

impl Entry {
    fn is_empty(&self) -> bool {
        self.key.is_null() && !is_bool(&self.value)
    }

    fn is_tombstone(&self) -> bool {
        self.key.is_null() && is_bool(&self.value)
    }
}

pub struct Table {
    // Live entries, not counting tombstones.
    count: usize,
    // Live entries plus tombstones; this is what the load factor bounds.
    used: usize,
    entries: Box<[Entry]>,
}

impl Table {
    pub fn new() -> Table {
        Table {
            count: 0,
            used: 0,
            entries: Box::new([]),
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Bytes of backing storage, for the allocator's accounting.
    pub fn heap_size(&self) -> usize {
        self.entries.len() * std::mem::size_of::<Entry>()
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Slot for `key`: its current entry, or the first reusable slot in its
    /// probe chain. Only called with a non-zero capacity.
    fn find_slot(entries: &[Entry], key: *mut ObjectString) -> usize {
        let mask = entries.len() - 1;
        let mut index = unsafe { (*key).hash } as usize & mask;
        let mut tombstone: Option<usize> = None;
        loop {
            let entry = &entries[index];
            if entry.key == key {
                return index;
            }
            if entry.is_empty() {
                return tombstone.unwrap_or(index);
            }
            if entry.is_tombstone() && tombstone.is_none() {
                tombstone = Some(index);
            }
            index = (index + 1) & mask;
        }
    }

    fn grow(&mut self) {
        let new_capacity = if self.capacity() < 8 {
            8
        } else {
            self.capacity() * 2
        };
        let mut new_entries = vec![EMPTY_ENTRY; new_capacity].into_boxed_slice();
        let mut count = 0;
        for entry in self.entries.iter() {
            if entry.key.is_null() {
                continue;
            }
            let index = Table::find_slot(&new_entries, entry.key);
            new_entries[index] = *entry;
            count += 1;
        }
        self.entries = new_entries;
        self.count = count;
        self.used = count;
    }

    /// Insert or update. Returns true when the key was not present before.
    pub fn insert(&mut self, key: *mut ObjectString, value: Value) -> bool {
        debug_assert!(!key.is_null());
        if (self.used + 1) * TABLE_MAX_LOAD_DEN > self.capacity() * TABLE_MAX_LOAD_NUM {
            self.grow();
        }
        let index = Table::find_slot(&self.entries, key);
        let entry = &mut self.entries[index];
        let is_new = entry.key.is_null();
        if is_new {
            if entry.is_empty() {
                self.used += 1;
            }
            self.count += 1;
        }
        entry.key = key;
        entry.value = value;
        is_new
    }

    pub fn get(&self, key: *mut ObjectString) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let index = Table::find_slot(&self.entries, key);
        let entry = &self.entries[index];
        if entry.key.is_null() {
            None
        } else {
            Some(entry.value)
        }
    }

    pub fn contains_key(&self, key: *mut ObjectString) -> bool {
        self.get(key).is_some()
    }

    /// Delete by leaving a tombstone. Returns true when the key was present.
    pub fn delete(&mut self, key: *mut ObjectString) -> bool {
        if self.count == 0 {
            return false;
        }
        let index = Table::find_slot(&self.entries, key);
        let entry = &mut self.entries[index];
        if entry.key.is_null() {
            return false;
        }
        entry.key = std::ptr::null_mut();
        entry.value = make_bool_value(true);
        self.count -= 1;
        true
    }

    /// The by-content probe used for interning: find an existing key equal
    /// to `content` without requiring it to be an object yet.
    pub fn find_string(&self, content: &str, hash: u32) -> Option<*mut ObjectString> {
        if self.count == 0 {
            return None;
        }
        let mask = self.capacity() - 1;
        let mut index = hash as usize & mask;
        loop {
            let entry = &self.entries[index];
            if entry.is_empty() {
                return None;
            }
            if !entry.key.is_null() {
                let key = unsafe { &*entry.key };
                if key.hash == hash && key.content == content {
                    return Some(entry.key);
                }
            }
            index = (index + 1) & mask;
        }
    }

    /// Copy every entry of `other` into `self` (superclass method tables,
    /// core-globals seeding).
    pub fn merge_from(&mut self, other: &Table) {
        for (key, value) in other.iter() {
            self.insert(key, value);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (*mut ObjectString, Value)> + '_ {
        self.entries
            .iter()
            .filter(|entry| !entry.key.is_null())
            .map(|entry| (entry.key, entry.value))
    }

    /// Weak-table sweep: drop entries whose key string was not marked.
    /// Must run before the main sweep frees the strings.
    pub fn remove_unmarked_keys(&mut self) {
        for index in 0..self.entries.len() {
            let entry = &mut self.entries[index];
            if entry.key.is_null() {
                continue;
            }
            if unsafe { !(*entry.key).object.marked } {
                entry.key = std::ptr::null_mut();
                entry.value = make_bool_value(true);
                self.count -= 1;
            }
        }
    }

    pub fn clear(&mut self) {
        for entry in self.entries.iter_mut() {
            entry.key = std::ptr::null_mut();
            entry.value = make_null_value();
        }
        self.count = 0;
        self.used = 0;
    }
}

impl Default for Table {
    fn default() -> Table {
        Table::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{as_number, make_number_value};

    fn key(content: &str) -> *mut ObjectString {
        // Leaked on purpose; tests do not run a collector.
        Box::into_raw(ObjectString::new(content))
    }

    #[test]
    fn insert_get_roundtrip() {
        let mut table = Table::new();
        let a = key("a");
        let b = key("b");
        assert!(table.insert(a, make_number_value(1.0)));
        assert!(table.insert(b, make_number_value(2.0)));
        assert!(!table.insert(a, make_number_value(3.0)));
        assert_eq!(as_number(&table.get(a).unwrap()), 3.0);
        assert_eq!(as_number(&table.get(b).unwrap()), 2.0);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn missing_key_is_none() {
        let mut table = Table::new();
        let a = key("a");
        let missing = key("missing");
        table.insert(a, make_number_value(1.0));
        assert!(table.get(missing).is_none());
    }

    #[test]
    fn delete_leaves_probe_chain_intact() {
        let mut table = Table::new();
        let keys: Vec<_> = (0..32).map(|i| key(&format!("key{}", i))).collect();
        for (i, &k) in keys.iter().enumerate() {
            table.insert(k, make_number_value(i as f64));
        }
        for &k in keys.iter().take(16) {
            assert!(table.delete(k));
        }
        assert_eq!(table.len(), 16);
        for (i, &k) in keys.iter().enumerate().skip(16) {
            assert_eq!(as_number(&table.get(k).unwrap()), i as f64);
        }
        // Deleted slots are reusable.
        let fresh = key("fresh");
        table.insert(fresh, make_number_value(99.0));
        assert_eq!(as_number(&table.get(fresh).unwrap()), 99.0);
    }

    #[test]
    fn growth_preserves_entries() {
        let mut table = Table::new();
        let keys: Vec<_> = (0..100).map(|i| key(&format!("entry{}", i))).collect();
        for (i, &k) in keys.iter().enumerate() {
            table.insert(k, make_number_value(i as f64));
        }
        assert_eq!(table.len(), 100);
        for (i, &k) in keys.iter().enumerate() {
            assert_eq!(as_number(&table.get(k).unwrap()), i as f64);
        }
    }

    #[test]
    fn find_string_matches_by_content() {
        let mut table = Table::new();
        let a = key("shared");
        table.insert(a, make_null_value());
        let hash = unsafe { (*a).hash };
        assert_eq!(table.find_string("shared", hash), Some(a));
        assert_eq!(table.find_string("other", hash), None);
    }

    #[test]
    fn merge_copies_all_entries() {
        let mut base = Table::new();
        let a = key("a");
        let b = key("b");
        base.insert(a, make_number_value(1.0));
        base.insert(b, make_number_value(2.0));
        let mut derived = Table::new();
        derived.merge_from(&base);
        derived.insert(b, make_number_value(20.0));
        assert_eq!(as_number(&derived.get(a).unwrap()), 1.0);
        assert_eq!(as_number(&derived.get(b).unwrap()), 20.0);
        // The source table is untouched.
        assert_eq!(as_number(&base.get(b).unwrap()), 2.0);
    }

    #[test]
    fn remove_unmarked_keys_prunes_weak_entries() {
        let mut table = Table::new();
        let kept = key("kept");
        let dropped = key("dropped");
        table.insert(kept, make_null_value());
        table.insert(dropped, make_null_value());
        unsafe { (*kept).object.marked = true };
        table.remove_unmarked_keys();
        assert_eq!(table.len(), 1);
        assert!(table.get(kept).is_some());
        assert!(table.get(dropped).is_none());
    }
}
