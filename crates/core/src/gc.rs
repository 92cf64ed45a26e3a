//! Precise, non-moving tri-color mark-sweep collector.
//!
//! Objects are allocated onto an intrusive linked list (`Obj::next`); a
//! collection cycle marks every object reachable from a caller-supplied set
//! of roots, traces through the mark so heap-to-heap edges get gray-ed too,
//! drops string-table entries that didn't survive the mark, then sweeps the
//! allocation list freeing anything still white. The allocation threshold
//! doubles after each cycle, matching `examples/original_source/src/gc.c`.

use std::collections::HashMap;

use crate::intern::InternTable;
use crate::object::{
    IterSource, Obj, ObjArray, ObjBoundMethod, ObjClass, ObjClosure, ObjCoroutine, ObjFunction,
    ObjInstance, ObjIterator, ObjKind, ObjList, ObjMap, ObjModule, ObjNative, ObjString,
    ObjUpvalue, UpvalueState,
};
use crate::value::Value;

const INITIAL_THRESHOLD: usize = 1024 * 1024;
const GROWTH_FACTOR: usize = 2;

pub struct Gc {
    head: *mut Obj,
    gray: Vec<*mut Obj>,
    bytes_allocated: usize,
    next_collection: usize,
    pub stress: bool,
    pub strings: InternTable,
    /// Extra roots pushed by the compiler (functions under construction,
    /// not yet reachable from any VM stack) and by natives that allocate
    /// more than one object before returning, so a collection triggered
    /// mid-construction can't free the first allocation.
    extra_roots: Vec<Value>,
}

impl Gc {
    pub fn new() -> Self {
        Gc {
            head: std::ptr::null_mut(),
            gray: Vec::new(),
            bytes_allocated: 0,
            next_collection: INITIAL_THRESHOLD,
            stress: false,
            strings: InternTable::new(),
            extra_roots: Vec::new(),
        }
    }

    /// Builds a collector whose first cycle triggers at `initial_threshold`
    /// bytes rather than the hard-coded 1 MiB default (`ember-cli`'s
    /// `gc_initial_threshold_bytes` config option, spec.md §4.5).
    pub fn with_threshold(initial_threshold: usize) -> Self {
        let mut gc = Self::new();
        gc.next_collection = initial_threshold;
        gc
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn next_collection(&self) -> usize {
        self.next_collection
    }

    pub fn should_collect(&self) -> bool {
        self.stress || self.bytes_allocated > self.next_collection
    }

    pub fn push_root(&mut self, v: Value) {
        self.extra_roots.push(v);
    }

    pub fn pop_root(&mut self) {
        self.extra_roots.pop();
    }

    fn link(&mut self, kind: ObjKind, size_hint: usize) -> *mut Obj {
        let boxed = Box::new(Obj { mark: false, next: self.head, kind });
        let ptr = Box::into_raw(boxed);
        self.head = ptr;
        self.bytes_allocated += size_hint + std::mem::size_of::<Obj>();
        ptr
    }

    /// Interns `bytes`, allocating a new `ObjString` only if an equal one
    /// isn't already in the table.
    pub fn intern(&mut self, bytes: &[u8]) -> *mut Obj {
        if let Some(existing) = self.strings.find(bytes) {
            return existing;
        }
        let hash = crate::intern::hash_bytes(bytes);
        let len = bytes.len();
        let ptr = self.link(
            ObjKind::String(ObjString { bytes: bytes.into(), hash }),
            len,
        );
        self.strings.insert(ptr);
        ptr
    }

    pub fn alloc_function(&mut self, f: ObjFunction) -> *mut Obj {
        self.link(ObjKind::Function(f), 64)
    }

    pub fn alloc_closure(&mut self, c: ObjClosure) -> *mut Obj {
        let size = c.upvalues.len() * 8;
        self.link(ObjKind::Closure(c), size)
    }

    pub fn alloc_upvalue(&mut self, state: UpvalueState) -> *mut Obj {
        self.link(ObjKind::Upvalue(ObjUpvalue { state }), 16)
    }

    pub fn alloc_native(&mut self, n: ObjNative) -> *mut Obj {
        self.link(ObjKind::Native(n), 16)
    }

    pub fn alloc_class(&mut self, c: ObjClass) -> *mut Obj {
        self.link(ObjKind::Class(c), 64)
    }

    pub fn alloc_instance(&mut self, i: ObjInstance) -> *mut Obj {
        self.link(ObjKind::Instance(i), 32)
    }

    pub fn alloc_bound_method(&mut self, b: ObjBoundMethod) -> *mut Obj {
        self.link(ObjKind::BoundMethod(b), 16)
    }

    pub fn alloc_list(&mut self, items: Vec<Value>) -> *mut Obj {
        let size = items.len() * 8;
        self.link(ObjKind::List(ObjList { items }), size)
    }

    pub fn alloc_map(&mut self) -> *mut Obj {
        self.link(ObjKind::Map(ObjMap { entries: HashMap::new() }), 32)
    }

    pub fn alloc_array(&mut self, items: Box<[Value]>) -> *mut Obj {
        let size = items.len() * 8;
        self.link(ObjKind::Array(ObjArray { items }), size)
    }

    pub fn alloc_module(&mut self, m: ObjModule) -> *mut Obj {
        self.link(ObjKind::Module(m), 32)
    }

    pub fn alloc_iterator(&mut self, source: IterSource, snapshot: Option<Vec<Value>>) -> *mut Obj {
        self.link(ObjKind::Iterator(ObjIterator { source, index: 0, snapshot }), 24)
    }

    pub fn alloc_coroutine(&mut self, c: ObjCoroutine) -> *mut Obj {
        self.link(ObjKind::Coroutine(c), 256)
    }

    #[inline]
    pub fn mark_value(&mut self, v: Value) {
        if v.is_object() {
            self.mark_object(v.as_object());
        }
    }

    pub fn mark_object(&mut self, ptr: *mut Obj) {
        if ptr.is_null() {
            return;
        }
        let already_marked = unsafe { (*ptr).mark };
        if already_marked {
            return;
        }
        unsafe {
            (*ptr).mark = true;
        }
        self.gray.push(ptr);
    }

    fn mark_extra_roots(&mut self) {
        let roots = std::mem::take(&mut self.extra_roots);
        for v in &roots {
            self.mark_value(*v);
        }
        self.extra_roots = roots;
    }

    /// Pops objects off the gray worklist one at a time, marking whatever
    /// each one points to, until the worklist runs dry.
    fn trace_references(&mut self) {
        while let Some(ptr) = self.gray.pop() {
            self.blacken(ptr);
        }
    }

    fn blacken(&mut self, ptr: *mut Obj) {
        // Safety: `ptr` was pushed onto `gray` by `mark_object`, which only
        // ever receives live, allocated pointers reachable from a root.
        let kind_ptr: *mut ObjKind = unsafe { &mut (*ptr).kind };
        match unsafe { &mut *kind_ptr } {
            ObjKind::String(_) | ObjKind::Native(_) => {}
            ObjKind::Function(f) => {
                if let Some(name) = f.name {
                    self.mark_object(name);
                }
                for c in &f.chunk.constants {
                    self.mark_value(*c);
                }
            }
            ObjKind::Closure(c) => {
                self.mark_object(c.function);
                for u in c.upvalues.clone() {
                    self.mark_object(u);
                }
            }
            ObjKind::Upvalue(u) => {
                if let UpvalueState::Closed(v) = u.state {
                    self.mark_value(v);
                }
            }
            ObjKind::Class(c) => {
                self.mark_object(c.name);
                if let Some(sup) = c.superclass {
                    self.mark_object(sup);
                }
                for (k, v) in c.methods.clone() {
                    self.mark_object(k);
                    self.mark_value(v);
                }
                for (k, v) in c.statics.clone() {
                    self.mark_object(k);
                    self.mark_value(v);
                }
            }
            ObjKind::Instance(i) => {
                self.mark_object(i.class);
                for (k, v) in i.fields.clone() {
                    self.mark_object(k);
                    self.mark_value(v);
                }
            }
            ObjKind::BoundMethod(b) => {
                self.mark_value(b.receiver);
                self.mark_object(b.method);
            }
            ObjKind::List(l) => {
                for v in l.items.clone() {
                    self.mark_value(v);
                }
            }
            ObjKind::Map(m) => {
                for (k, v) in m.entries.clone() {
                    self.mark_value(k.to_value());
                    self.mark_value(v);
                }
            }
            ObjKind::Array(a) => {
                for v in a.items.iter().copied() {
                    self.mark_value(v);
                }
            }
            ObjKind::Module(m) => {
                self.mark_object(m.name);
                for (k, v) in m.fields.clone() {
                    self.mark_object(k);
                    self.mark_value(v);
                }
            }
            ObjKind::Iterator(it) => {
                let source = match it.source {
                    IterSource::List(p) | IterSource::Array(p) | IterSource::Map(p) => p,
                };
                self.mark_object(source);
                if let Some(snap) = &it.snapshot {
                    for v in snap.clone() {
                        self.mark_value(v);
                    }
                }
            }
            ObjKind::Coroutine(co) => {
                self.mark_object(co.closure);
                for v in co.stack.clone() {
                    self.mark_value(v);
                }
                for fr in co.frames.clone() {
                    self.mark_object(fr.closure);
                }
                for up in co.open_upvalues.clone() {
                    self.mark_object(up);
                }
            }
        }
    }

    fn sweep(&mut self) {
        let mut prev: *mut Obj = std::ptr::null_mut();
        let mut current = self.head;
        while !current.is_null() {
            let marked = unsafe { (*current).mark };
            let next = unsafe { (*current).next };
            if marked {
                unsafe {
                    (*current).mark = false;
                }
                prev = current;
                current = next;
            } else {
                if prev.is_null() {
                    self.head = next;
                } else {
                    unsafe {
                        (*prev).next = next;
                    }
                }
                let freed = unsafe { Box::from_raw(current) };
                self.bytes_allocated = self
                    .bytes_allocated
                    .saturating_sub(std::mem::size_of::<Obj>() + approx_size(&freed));
                drop(freed);
                current = next;
            }
        }
    }

    /// Runs one full collection cycle. `mark_roots` is called first so the
    /// owner (the interpreter) can mark its value stack, call frames, open
    /// upvalues, and globals without this crate needing to know their
    /// shapes.
    pub fn collect(&mut self, mut mark_roots: impl FnMut(&mut Gc)) {
        tracing::debug!(bytes_allocated = self.bytes_allocated, "gc: cycle start");
        mark_roots(self);
        self.mark_extra_roots();
        self.trace_references();
        self.strings.remove_unmarked();
        self.sweep();
        self.next_collection = self.bytes_allocated * GROWTH_FACTOR;
        if self.next_collection < INITIAL_THRESHOLD {
            self.next_collection = INITIAL_THRESHOLD;
        }
        tracing::debug!(
            bytes_allocated = self.bytes_allocated,
            next_collection = self.next_collection,
            "gc: cycle end"
        );
    }
}

fn approx_size(obj: &Obj) -> usize {
    match &obj.kind {
        ObjKind::String(s) => s.bytes.len(),
        ObjKind::List(l) => l.items.len() * 8,
        ObjKind::Array(a) => a.items.len() * 8,
        ObjKind::Map(m) => m.entries.len() * 16,
        _ => 0,
    }
}

impl Default for Gc {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Gc {
    fn drop(&mut self) {
        let mut current = self.head;
        while !current.is_null() {
            let next = unsafe { (*current).next };
            drop(unsafe { Box::from_raw(current) });
            current = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreferenced_string_is_collected() {
        let mut gc = Gc::new();
        gc.intern(b"transient");
        assert_eq!(gc.strings.len(), 1);
        gc.collect(|_| {});
        assert_eq!(gc.strings.len(), 0);
    }

    #[test]
    fn rooted_value_survives_collection() {
        let mut gc = Gc::new();
        let s = gc.intern(b"kept");
        let v = Value::object(s);
        gc.collect(|g| g.mark_value(v));
        assert_eq!(gc.strings.len(), 1);
    }

    #[test]
    fn interning_same_bytes_twice_returns_same_pointer() {
        let mut gc = Gc::new();
        let a = gc.intern(b"same");
        let b = gc.intern(b"same");
        assert_eq!(a, b);
    }

    #[test]
    fn threshold_doubles_after_collection() {
        let mut gc = Gc::new();
        let before = gc.next_collection();
        gc.intern(b"x");
        gc.collect(|_| {});
        assert!(gc.next_collection() <= before.max(INITIAL_THRESHOLD));
    }
}
