//! Heap object model.
//!
//! Every heap entity is an [`Obj`]: a common header (mark bit, next-pointer
//! threading the allocated-object list) plus a [`ObjKind`] payload. Rather
//! than a C-style `Obj*` with a function-pointer vtable, capabilities
//! (`to_string`, `hash`, `traverse`, ...) are realized as `match` arms over
//! `ObjKind` — a tagged variant dispatches on the value alone just as well
//! as a vtable would, without unsafe function pointers.

use std::collections::HashMap;

use crate::chunk::Chunk;
use crate::value::Value;

/// A saved activation record: the closure being run, its instruction
/// pointer, and the base of its window on a value stack. Shared between
/// the interpreter's live call-frame stack and a suspended [`ObjCoroutine`]'s
/// saved frames, since both are "a slice of the value stack plus metadata
/// for a single active function invocation."
#[derive(Debug, Clone, Copy)]
pub struct Frame {
    pub closure: *mut Obj,
    pub ip: usize,
    pub base: usize,
}

pub struct ObjString {
    pub bytes: Box<[u8]>,
    pub hash: u64,
}

impl ObjString {
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes).unwrap_or("<invalid utf8>")
    }
}

pub struct ObjFunction {
    pub name: Option<*mut Obj>,
    pub arity: u8,
    pub upvalue_count: u8,
    pub chunk: Chunk,
}

pub struct ObjClosure {
    pub function: *mut Obj,
    pub upvalues: Vec<*mut Obj>,
}

pub enum UpvalueState {
    /// Points at a live slot on some stack (the VM's or a coroutine's).
    Open(*mut Value),
    Closed(Value),
}

pub struct ObjUpvalue {
    pub state: UpvalueState,
}

pub type NativeFn = fn(&mut crate::gc::Gc, &[Value]) -> Result<Value, String>;

pub struct ObjNative {
    pub name: Box<str>,
    pub arity: u8,
    pub function: NativeFn,
}

pub struct ObjClass {
    pub name: *mut Obj,
    pub superclass: Option<*mut Obj>,
    pub methods: HashMap<*mut Obj, Value>,
    pub statics: HashMap<*mut Obj, Value>,
}

pub struct ObjInstance {
    pub class: *mut Obj,
    pub fields: HashMap<*mut Obj, Value>,
}

pub struct ObjBoundMethod {
    pub receiver: Value,
    pub method: *mut Obj,
}

pub struct ObjList {
    pub items: Vec<Value>,
}

/// Keyed by the raw bit pattern of a [`Value`] rather than its value
/// semantics: numbers compare/hash by bits (equivalent to IEEE equality
/// for every non-NaN key) and objects by pointer identity (equivalent to
/// interned identity for strings). A script that uses a NaN as a map key
/// gets unspecified, but never unsound, behavior.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MapKey(u64);

impl From<Value> for MapKey {
    fn from(v: Value) -> Self {
        MapKey(v.raw_bits())
    }
}

impl MapKey {
    pub fn to_value(self) -> Value {
        Value::from_raw_bits(self.0)
    }
}

pub struct ObjMap {
    pub entries: HashMap<MapKey, Value>,
}

pub struct ObjArray {
    pub items: Box<[Value]>,
}

pub struct ObjModule {
    pub name: *mut Obj,
    pub fields: HashMap<*mut Obj, Value>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum IterSource {
    List(*mut Obj),
    Array(*mut Obj),
    /// Entries are materialized into `ObjIterator::snapshot` up front (as
    /// two-element `[key, value]` lists) since `HashMap` has no stable
    /// cursor; this tag only anchors the source map as a GC root.
    Map(*mut Obj),
}

pub struct ObjIterator {
    pub source: IterSource,
    pub index: usize,
    /// Snapshot used for map iteration (entries materialized at creation
    /// time, since `HashMap` has no stable cursor to resume from).
    pub snapshot: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoroutineStatus {
    NotStarted,
    Running,
    Suspended,
    Done,
}

pub struct ObjCoroutine {
    pub closure: *mut Obj,
    pub status: CoroutineStatus,
    /// Saved value stack and call-frame stack while suspended; swapped
    /// with the VM's live stacks on `resume`/`yield` rather than copied.
    pub stack: Vec<Value>,
    pub frames: Vec<Frame>,
    /// Open upvalues captured from this coroutine's own stack, saved and
    /// restored alongside `stack`/`frames` for the same reason.
    pub open_upvalues: Vec<*mut Obj>,
}

pub enum ObjKind {
    String(ObjString),
    Function(ObjFunction),
    Closure(ObjClosure),
    Upvalue(ObjUpvalue),
    Native(ObjNative),
    Class(ObjClass),
    Instance(ObjInstance),
    BoundMethod(ObjBoundMethod),
    List(ObjList),
    Map(ObjMap),
    Array(ObjArray),
    Module(ObjModule),
    Iterator(ObjIterator),
    Coroutine(ObjCoroutine),
}

impl ObjKind {
    pub fn name(&self) -> &'static str {
        match self {
            ObjKind::String(_) => "String",
            ObjKind::Function(_) => "Function",
            ObjKind::Closure(_) => "Closure",
            ObjKind::Upvalue(_) => "Upvalue",
            ObjKind::Native(_) => "Native",
            ObjKind::Class(_) => "Class",
            ObjKind::Instance(_) => "Instance",
            ObjKind::BoundMethod(_) => "BoundMethod",
            ObjKind::List(_) => "List",
            ObjKind::Map(_) => "Map",
            ObjKind::Array(_) => "Array",
            ObjKind::Module(_) => "Module",
            ObjKind::Iterator(_) => "Iterator",
            ObjKind::Coroutine(_) => "Coroutine",
        }
    }
}

/// The common object header plus its payload. `mark` and `next` are only
/// ever touched by the collector; everything else goes through `kind`.
pub struct Obj {
    pub mark: bool,
    pub next: *mut Obj,
    pub kind: ObjKind,
}

/// # Safety
/// Callers must only dereference pointers that the GC still considers
/// live (i.e. between allocation and the sweep that frees them).
pub unsafe fn obj_string_bytes(ptr: *mut Obj) -> &'static str {
    match unsafe { &(*ptr).kind } {
        ObjKind::String(s) => s.as_str(),
        _ => panic!("not a string"),
    }
}

impl Obj {
    pub fn print_string(&self) -> String {
        match &self.kind {
            ObjKind::String(s) => s.as_str().to_string(),
            ObjKind::Function(f) => match f.name {
                Some(name) => format!("<fn {}>", unsafe { obj_string_bytes(name) }),
                None => "<script>".to_string(),
            },
            ObjKind::Closure(c) => {
                let f = unsafe { &(*c.function).kind };
                match f {
                    ObjKind::Function(f) => match f.name {
                        Some(name) => format!("<fn {}>", unsafe { obj_string_bytes(name) }),
                        None => "<script>".to_string(),
                    },
                    _ => "<closure>".to_string(),
                }
            }
            ObjKind::Upvalue(_) => "<upvalue>".to_string(),
            ObjKind::Native(n) => format!("<native {}>", n.name),
            ObjKind::Class(c) => format!("<class {}>", unsafe { obj_string_bytes(c.name) }),
            ObjKind::Instance(i) => {
                let class = unsafe { &(*i.class).kind };
                match class {
                    ObjKind::Class(c) => format!("<instance {}>", unsafe { obj_string_bytes(c.name) }),
                    _ => "<instance>".to_string(),
                }
            }
            ObjKind::BoundMethod(_) => "<bound method>".to_string(),
            // Matches `examples/original_source/src/objmap.c`'s `map_print`: a
            // bare one-line tag rather than a recursive content dump (spec.md
            // §6 only requires "<kind>" or "<kind name>" for object values).
            ObjKind::List(l) => format!("<list[{}]>", l.items.len()),
            ObjKind::Map(m) => format!("<map[{}]>", m.entries.len()),
            ObjKind::Array(a) => format!("<array[{}]>", a.items.len()),
            ObjKind::Module(m) => format!("<module {}>", unsafe { obj_string_bytes(m.name) }),
            ObjKind::Iterator(_) => "<iterator>".to_string(),
            ObjKind::Coroutine(_) => "<coroutine>".to_string(),
        }
    }
}
