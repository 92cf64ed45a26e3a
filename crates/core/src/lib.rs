//! Value representation, heap object model, and garbage collector shared by
//! the compiler and the runtime: the execution substrate spec.md §1 scopes
//! as "the parts where the real engineering density lives."
//!
//! This crate knows nothing about bytecode semantics or AST shapes; it
//! exposes `Value`, `Obj`/`ObjKind`, `Chunk`, and `Gc` as a substrate that
//! `ember-compiler` and `ember-runtime` build meaning on top of.

pub mod chunk;
pub mod gc;
pub mod intern;
pub mod object;
pub mod value;

pub use chunk::{Chunk, OpCode, MAX_JUMP};
pub use gc::Gc;
pub use object::{
    CoroutineStatus, Frame, IterSource, MapKey, NativeFn, Obj, ObjArray, ObjBoundMethod, ObjClass,
    ObjClosure, ObjCoroutine, ObjFunction, ObjInstance, ObjIterator, ObjKind, ObjList, ObjMap,
    ObjModule, ObjNative, ObjString, ObjUpvalue, UpvalueState,
};
pub use value::{format_value, Value};
