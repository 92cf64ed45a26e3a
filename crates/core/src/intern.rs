//! String interning table.
//!
//! An open-addressed hash table (linear probing, tombstone deletion) over
//! raw byte strings, kept below a 0.75 load factor by doubling on growth —
//! the shape spec.md prescribes for the string table, distinct from the
//! general-purpose `Map` object, which uses `std::collections::HashMap`
//! since the spec only constrains the intern table's implementation.

use std::ptr;

use crate::object::{Obj, ObjKind, ObjString};

const MAX_LOAD: f64 = 0.75;

#[derive(Clone, Copy)]
enum Slot {
    Empty,
    Tombstone,
    Occupied(*mut Obj),
}

/// Owns no `Obj`s itself (the GC's allocation list does); this is purely
/// an index from byte content to the single canonical allocation for it.
pub struct InternTable {
    slots: Vec<Slot>,
    count: usize,
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

fn obj_string(ptr: *mut Obj) -> &'static ObjString {
    match unsafe { &(*ptr).kind } {
        ObjKind::String(s) => s,
        _ => unreachable!("intern table holds only strings"),
    }
}

impl InternTable {
    pub fn new() -> Self {
        InternTable { slots: vec![Slot::Empty; 0], count: 0 }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Finds the slot `bytes`/`hash` belongs in: either the existing
    /// occupant (for lookup) or the first empty/tombstone slot the probe
    /// sequence passes (for insertion).
    fn find_slot(&self, bytes: &[u8], hash: u64) -> usize {
        let cap = self.capacity() as u64;
        let mut index = (hash % cap) as usize;
        let mut first_tombstone: Option<usize> = None;
        loop {
            match &self.slots[index] {
                Slot::Empty => return first_tombstone.unwrap_or(index),
                Slot::Tombstone => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(index);
                    }
                }
                Slot::Occupied(ptr) => {
                    let s = obj_string(*ptr);
                    if s.hash == hash && s.bytes.as_ref() == bytes {
                        return index;
                    }
                }
            }
            index = (index + 1) % self.capacity();
        }
    }

    fn grow(&mut self, new_cap: usize) {
        let mut new_slots = vec![Slot::Empty; new_cap];
        for slot in &self.slots {
            if let Slot::Occupied(ptr) = slot {
                let s = obj_string(*ptr);
                let cap = new_cap as u64;
                let mut index = (s.hash % cap) as usize;
                loop {
                    if matches!(new_slots[index], Slot::Empty) {
                        new_slots[index] = Slot::Occupied(*ptr);
                        break;
                    }
                    index = (index + 1) % new_cap;
                }
            }
        }
        self.slots = new_slots;
    }

    /// Returns the canonical interned `Obj*` for `bytes`, if already present.
    pub fn find(&self, bytes: &[u8]) -> Option<*mut Obj> {
        if self.capacity() == 0 {
            return None;
        }
        let hash = fnv1a(bytes);
        let index = self.find_slot(bytes, hash);
        match self.slots[index] {
            Slot::Occupied(ptr) => Some(ptr),
            _ => None,
        }
    }

    /// Inserts a freshly-allocated string object as the canonical
    /// representative for its bytes. Callers must only do this after
    /// `find` has returned `None`.
    pub fn insert(&mut self, ptr: *mut Obj) {
        if self.capacity() == 0 || (self.count + 1) as f64 / self.capacity() as f64 > MAX_LOAD {
            let new_cap = if self.capacity() == 0 { 8 } else { self.capacity() * 2 };
            self.grow(new_cap);
        }
        let s = obj_string(ptr);
        let index = self.find_slot(&s.bytes, s.hash);
        if !matches!(self.slots[index], Slot::Occupied(_)) {
            self.count += 1;
        }
        self.slots[index] = Slot::Occupied(ptr);
    }

    /// Removes every entry whose backing object has not been marked by the
    /// current collection cycle, called between the mark and sweep phases
    /// so the table never keeps a string's only reference alive.
    pub fn remove_unmarked(&mut self) {
        for slot in &mut self.slots {
            if let Slot::Occupied(ptr) = slot {
                let marked = unsafe { (**ptr).mark };
                if !marked {
                    *slot = Slot::Tombstone;
                    self.count -= 1;
                }
            }
        }
    }
}

impl Default for InternTable {
    fn default() -> Self {
        Self::new()
    }
}

pub fn hash_bytes(bytes: &[u8]) -> u64 {
    fnv1a(bytes)
}

#[allow(dead_code)]
fn is_null(ptr: *mut Obj) -> bool {
    ptr::eq(ptr, ptr::null_mut())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_string(bytes: &[u8]) -> *mut Obj {
        let hash = fnv1a(bytes);
        let obj = Box::new(Obj {
            mark: false,
            next: ptr::null_mut(),
            kind: ObjKind::String(ObjString { bytes: bytes.into(), hash }),
        });
        Box::into_raw(obj)
    }

    #[test]
    fn insert_then_find_round_trips() {
        let mut table = InternTable::new();
        let s = make_string(b"hello");
        assert!(table.find(b"hello").is_none());
        table.insert(s);
        assert_eq!(table.find(b"hello"), Some(s));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn grows_past_load_factor() {
        let mut table = InternTable::new();
        let mut ptrs = Vec::new();
        for i in 0..100 {
            let bytes = format!("key-{i}").into_bytes();
            let s = make_string(&bytes);
            table.insert(s);
            ptrs.push((bytes, s));
        }
        for (bytes, ptr) in &ptrs {
            assert_eq!(table.find(bytes), Some(*ptr));
        }
    }
}
