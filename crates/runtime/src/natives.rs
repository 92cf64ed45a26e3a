//! The native standard library: the global functions `Library_Init`
//! registers in `examples/original_source/src/library.c` (`clock`, `abs`,
//! `pow`, `typeof`, plus the `String`/`Array` global constructors) and the
//! built-in instance methods spec.md §4.6 describes for `Map` and says
//! "other container types follow the same pattern" for (grounded on
//! `examples/original_source/src/objmap.c`'s `Map_PrepareType`).
//!
//! Container methods are *not* `ObjNative`s: `ObjNative`'s `NativeFn` has
//! no receiver parameter, so `Vm::invoke` dispatches them here directly by
//! matching the receiver's `ObjKind`, the way the interpreter already
//! special-cases `Coroutine` receivers for `resume`/`status`.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use ember_core::{
    format_value, CoroutineStatus, Gc, IterSource, MapKey, Obj, ObjArray, ObjCoroutine,
    ObjIterator, ObjKind, ObjList, ObjMap, ObjNative, Value,
};

/// Registers the fixed set of top-level natives into `globals`, matching
/// `Library_Init`'s `define_native` calls, plus the two natives
/// SPEC_FULL.md §10 adds for coroutines: a `Coroutine` constructor and the
/// `yield` sentinel `Vm::call_value` special-cases.
pub fn register_globals(gc: &mut Gc, globals: &mut HashMap<*mut Obj, Value>) {
    define_native(gc, globals, "clock", 0, clock_native);
    define_native(gc, globals, "abs", 1, abs_native);
    define_native(gc, globals, "pow", 2, pow_native);
    define_native(gc, globals, "typeof", 1, typeof_native);
    define_native(gc, globals, "String", 1, string_ctor_native);
    define_native(gc, globals, "Array", 1, array_ctor_native);
    define_native(gc, globals, "Coroutine", 1, coroutine_ctor_native);
    define_native(gc, globals, "yield", 1, yield_sentinel);
}

fn define_native(
    gc: &mut Gc,
    globals: &mut HashMap<*mut Obj, Value>,
    name: &str,
    arity: u8,
    function: ember_core::NativeFn,
) {
    let name_ptr = gc.intern(name.as_bytes());
    let native_ptr = gc.alloc_native(ObjNative { name: name.into(), arity, function });
    globals.insert(name_ptr, Value::object(native_ptr));
}

fn clock_native(_gc: &mut Gc, _args: &[Value]) -> Result<Value, String> {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    Ok(Value::number(secs))
}

fn abs_native(_gc: &mut Gc, args: &[Value]) -> Result<Value, String> {
    if !args[0].is_number() {
        return Err("Expected a numeric value.".to_string());
    }
    Ok(Value::number(args[0].as_number().abs()))
}

fn pow_native(_gc: &mut Gc, args: &[Value]) -> Result<Value, String> {
    if !args[0].is_number() || !args[1].is_number() {
        return Err("Expected numeric values.".to_string());
    }
    Ok(Value::number(args[0].as_number().powf(args[1].as_number())))
}

/// The original returns the receiver's type-descriptor object (so scripts
/// can write `typeof(x) == String`); a tagged-enum `ObjKind` has no such
/// descriptor to return, so this returns an interned name string instead
/// (`"Number"`, `"List"`, `"Instance"`, ...), reusing `Value::kind_name`.
fn typeof_native(gc: &mut Gc, args: &[Value]) -> Result<Value, String> {
    let name = args[0].kind_name();
    Ok(Value::object(gc.intern(name.as_bytes())))
}

/// `String(v)` converts any value to its display string (the same
/// conversion `print` and string interpolation use).
fn string_ctor_native(gc: &mut Gc, args: &[Value]) -> Result<Value, String> {
    let text = format_value(args[0]);
    Ok(Value::object(gc.intern(text.as_bytes())))
}

/// `Array(n)` allocates a fixed-size array of `n` `nil`s.
fn array_ctor_native(gc: &mut Gc, args: &[Value]) -> Result<Value, String> {
    if !args[0].is_number() {
        return Err("Expected a numeric length.".to_string());
    }
    let n = args[0].as_number();
    if n < 0.0 || n.fract() != 0.0 {
        return Err("Array length must be a non-negative integer.".to_string());
    }
    let items = vec![Value::nil(); n as usize].into_boxed_slice();
    Ok(Value::object(gc.alloc_array(items)))
}

/// `Coroutine(fn)` wraps a zero-or-more-arg closure in a not-yet-started
/// coroutine; `Vm::resume_coroutine` supplies the first call's arguments.
fn coroutine_ctor_native(gc: &mut Gc, args: &[Value]) -> Result<Value, String> {
    if !args[0].is_object() {
        return Err("Expected a function.".to_string());
    }
    let ptr = args[0].as_object();
    if !matches!(unsafe { &(*ptr).kind }, ObjKind::Closure(_)) {
        return Err("Expected a function.".to_string());
    }
    let co = gc.alloc_coroutine(ObjCoroutine {
        closure: ptr,
        status: CoroutineStatus::NotStarted,
        stack: Vec::new(),
        frames: Vec::new(),
        open_upvalues: Vec::new(),
    });
    Ok(Value::object(co))
}

/// Never actually called: `Vm::call_value` recognizes this function
/// pointer and diverts to `Signal::Yield` before a real call would happen.
/// Reached only if `yield` is invoked outside of any coroutine.
pub fn yield_sentinel(_gc: &mut Gc, _args: &[Value]) -> Result<Value, String> {
    Err("`yield` can only be called from within a running coroutine.".to_string())
}

/// # Safety
/// `ptr` must point to a live `Obj` whose kind is `String`.
unsafe fn as_string(ptr: *mut Obj) -> &'static str {
    match unsafe { &(*ptr).kind } {
        ObjKind::String(s) => s.as_str(),
        _ => unreachable!("receiver kind checked by caller"),
    }
}

/// # Safety
/// `ptr` must point to a live `Obj` whose kind is `List`.
unsafe fn as_list_mut(ptr: *mut Obj) -> &'static mut ObjList {
    match unsafe { &mut (*ptr).kind } {
        ObjKind::List(l) => l,
        _ => unreachable!("receiver kind checked by caller"),
    }
}

/// # Safety
/// `ptr` must point to a live `Obj` whose kind is `Map`.
unsafe fn as_map_mut(ptr: *mut Obj) -> &'static mut ObjMap {
    match unsafe { &mut (*ptr).kind } {
        ObjKind::Map(m) => m,
        _ => unreachable!("receiver kind checked by caller"),
    }
}

/// # Safety
/// `ptr` must point to a live `Obj` whose kind is `Array`.
unsafe fn as_array(ptr: *mut Obj) -> &'static ObjArray {
    match unsafe { &(*ptr).kind } {
        ObjKind::Array(a) => a,
        _ => unreachable!("receiver kind checked by caller"),
    }
}

/// # Safety
/// `ptr` must point to a live `Obj` whose kind is `Iterator`.
unsafe fn as_iterator_mut(ptr: *mut Obj) -> &'static mut ObjIterator {
    match unsafe { &mut (*ptr).kind } {
        ObjKind::Iterator(it) => it,
        _ => unreachable!("receiver kind checked by caller"),
    }
}

fn require_number(v: Value, what: &str) -> Result<f64, String> {
    if v.is_number() { Ok(v.as_number()) } else { Err(format!("Expected a numeric {what}.")) }
}

fn require_string(v: Value) -> Result<&'static str, String> {
    if v.is_object() {
        if let ObjKind::String(_) = unsafe { &(*v.as_object()).kind } {
            return Ok(unsafe { as_string(v.as_object()) });
        }
    }
    Err("Expected a string argument.".to_string())
}

/// Dispatches a built-in instance method call for any non-`Instance`,
/// non-`Coroutine` receiver (`Coroutine`'s `resume`/`status` need direct VM
/// access to swap stacks, so `Vm::invoke` handles those itself). Returns
/// `None` when `receiver`'s kind has no such method, so the caller can
/// raise the ordinary "Undefined property" error.
pub fn invoke_builtin(
    gc: &mut Gc,
    receiver: Value,
    method: &str,
    args: &[Value],
) -> Option<Result<Value, String>> {
    if !receiver.is_object() {
        return None;
    }
    let ptr = receiver.as_object();
    match unsafe { &(*ptr).kind } {
        ObjKind::String(_) => string_method(gc, ptr, method, args),
        ObjKind::List(_) => list_method(gc, ptr, method, args),
        ObjKind::Map(_) => map_method(gc, ptr, method, args),
        ObjKind::Array(_) => array_method(gc, ptr, method, args),
        ObjKind::Iterator(_) => iterator_method(gc, ptr, method, args),
        _ => None,
    }
}

fn string_method(
    gc: &mut Gc,
    ptr: *mut Obj,
    method: &str,
    args: &[Value],
) -> Option<Result<Value, String>> {
    let s = unsafe { as_string(ptr) };
    let owned: Result<String, String> = match method {
        "length" => return Some(Ok(Value::number(s.len() as f64))),
        "isEmpty" => return Some(Ok(Value::bool(s.is_empty()))),
        "contains" => return Some(require_string(args[0]).map(|sub| Value::bool(s.contains(sub)))),
        "indexOf" => {
            return Some(require_string(args[0]).map(|sub| match s.find(sub) {
                Some(i) => Value::number(i as f64),
                None => Value::number(-1.0),
            }))
        }
        "substring" => (|| {
            let start = require_number(args[0], "start index")? as usize;
            let end = require_number(args[1], "end index")? as usize;
            if start > end || end > s.len() {
                return Err("String index out of bounds.".to_string());
            }
            Ok(s[start..end].to_string())
        })(),
        "trim" => Ok(s.trim().to_string()),
        "toUpperCase" => Ok(s.to_ascii_uppercase()),
        "toLowerCase" => Ok(s.to_ascii_lowercase()),
        _ => return None,
    };
    Some(owned.map(|text| Value::object(gc.intern(text.as_bytes()))))
}

fn list_method(
    gc: &mut Gc,
    ptr: *mut Obj,
    method: &str,
    args: &[Value],
) -> Option<Result<Value, String>> {
    let list = unsafe { as_list_mut(ptr) };
    Some(match method {
        "length" => Ok(Value::number(list.items.len() as f64)),
        "isEmpty" => Ok(Value::bool(list.items.is_empty())),
        "add" => {
            list.items.push(args[0]);
            Ok(Value::nil())
        }
        "insert" => (|| {
            let index = require_number(args[0], "index")? as usize;
            if index > list.items.len() {
                return Err("List index out of bounds.".to_string());
            }
            list.items.insert(index, args[1]);
            Ok(Value::nil())
        })(),
        "removeAt" => (|| {
            let index = require_number(args[0], "index")? as usize;
            if index >= list.items.len() {
                return Err("List index out of bounds.".to_string());
            }
            Ok(list.items.remove(index))
        })(),
        "remove" => {
            if let Some(pos) = list.items.iter().position(|v| *v == args[0]) {
                list.items.remove(pos);
                Ok(Value::bool(true))
            } else {
                Ok(Value::bool(false))
            }
        }
        "contains" => Ok(Value::bool(list.items.iter().any(|v| *v == args[0]))),
        "clear" => {
            list.items.clear();
            Ok(Value::nil())
        }
        "iterator" => {
            let it_ptr = gc.alloc_iterator(IterSource::List(ptr), None);
            Ok(Value::object(it_ptr))
        }
        _ => return None,
    })
}

fn map_method(
    gc: &mut Gc,
    ptr: *mut Obj,
    method: &str,
    args: &[Value],
) -> Option<Result<Value, String>> {
    let map = unsafe { as_map_mut(ptr) };
    Some(match method {
        "length" => Ok(Value::number(map.entries.len() as f64)),
        "isEmpty" => Ok(Value::bool(map.entries.is_empty())),
        "containsKey" => Ok(Value::bool(map.entries.contains_key(&MapKey::from(args[0])))),
        "getOrDefault" => {
            Ok(map.entries.get(&MapKey::from(args[0])).copied().unwrap_or(args[1]))
        }
        "putIfAbsent" => {
            let key = MapKey::from(args[0]);
            if let Some(existing) = map.entries.get(&key).copied() {
                Ok(existing)
            } else {
                map.entries.insert(key, args[1]);
                Ok(Value::nil())
            }
        }
        "putAll" => {
            if !args[0].is_object() {
                return Some(Err("Expected a map.".to_string()));
            }
            let other_ptr = args[0].as_object();
            if other_ptr == ptr {
                // Self-merge is a no-op; also avoids aliasing `map` (held
                // mutably for this whole match) against the same object.
                return Some(Ok(Value::nil()));
            }
            let other = match unsafe { &(*other_ptr).kind } {
                ObjKind::Map(m) => m,
                _ => return Some(Err("Expected a map.".to_string())),
            };
            let entries: Vec<(MapKey, Value)> =
                other.entries.iter().map(|(k, v)| (*k, *v)).collect();
            for (k, v) in entries {
                map.entries.insert(k, v);
            }
            Ok(Value::nil())
        }
        "remove" => {
            map.entries.remove(&MapKey::from(args[0]));
            Ok(Value::nil())
        }
        "clear" => {
            map.entries.clear();
            Ok(Value::nil())
        }
        "iterator" => {
            let snapshot: Vec<Value> = map
                .entries
                .iter()
                .map(|(k, v)| {
                    let pair = gc.alloc_list(vec![k.to_value(), *v]);
                    Value::object(pair)
                })
                .collect();
            let it_ptr = gc.alloc_iterator(IterSource::Map(ptr), Some(snapshot));
            Ok(Value::object(it_ptr))
        }
        _ => return None,
    })
}

fn array_method(
    gc: &mut Gc,
    ptr: *mut Obj,
    method: &str,
    _args: &[Value],
) -> Option<Result<Value, String>> {
    let array = unsafe { as_array(ptr) };
    Some(match method {
        "length" => Ok(Value::number(array.items.len() as f64)),
        "iterator" => {
            let it_ptr = gc.alloc_iterator(IterSource::Array(ptr), None);
            Ok(Value::object(it_ptr))
        }
        _ => return None,
    })
}

fn iterator_method(
    gc: &mut Gc,
    ptr: *mut Obj,
    method: &str,
    _args: &[Value],
) -> Option<Result<Value, String>> {
    if method != "next" {
        return None;
    }
    Some(Ok(iterator_next(gc, ptr)))
}

/// Advances `ptr`'s iterator and returns a two-element `[value, hasNext]`
/// list, the shape the compiler's `for`-in lowering expects.
fn iterator_next(gc: &mut Gc, ptr: *mut Obj) -> Value {
    let it = unsafe { as_iterator_mut(ptr) };
    if let Some(snapshot) = it.snapshot.clone() {
        return if it.index < snapshot.len() {
            let v = snapshot[it.index];
            it.index += 1;
            let pair = gc.alloc_list(vec![v, Value::bool(true)]);
            Value::object(pair)
        } else {
            let pair = gc.alloc_list(vec![Value::nil(), Value::bool(false)]);
            Value::object(pair)
        };
    }
    let (has_next, value) = match it.source {
        IterSource::List(src) => {
            let list = unsafe { as_list_mut(src) };
            if it.index < list.items.len() {
                (true, list.items[it.index])
            } else {
                (false, Value::nil())
            }
        }
        IterSource::Array(src) => {
            let array = unsafe { as_array(src) };
            if it.index < array.items.len() {
                (true, array.items[it.index])
            } else {
                (false, Value::nil())
            }
        }
        IterSource::Map(_) => (false, Value::nil()),
    };
    let it = unsafe { as_iterator_mut(ptr) };
    if has_next {
        it.index += 1;
    }
    let pair = gc.alloc_list(vec![value, Value::bool(has_next)]);
    Value::object(pair)
}
