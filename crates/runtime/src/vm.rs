//! The bytecode interpreter: dispatch loop, value stack, call-frame stack
//! (spec.md §4.4), plus the coroutine and module-import machinery
//! SPEC_FULL.md §10 adds on top of it.
//!
//! The value stack and frame stack are preallocated to their maximum size
//! (`STACK_MAX`/`FRAMES_MAX`) and never reallocated afterward — every push
//! is guarded by an explicit bounds check that raises "Stack overflow."
//! instead of growing the backing `Vec`. This is load-bearing, not an
//! optimization: open upvalues hold raw pointers into the stack's buffer
//! (spec.md §3's "an open upvalue's pointer aims at a live stack slot"),
//! and a `Vec` reallocation would leave them dangling.
//!
//! The collector is only ever consulted once per opcode, at the top of
//! the dispatch loop (`maybe_collect`). Every allocation an opcode handler
//! performs therefore happens between two such checkpoints, with its
//! inputs already rooted on the stack — satisfying spec.md §4.4's
//! "register intermediate results as GC roots before triggering any
//! subsequent allocation" without needing `push_root`/`pop_root`
//! gymnastics in the VM itself (the compiler, which allocates *across*
//! multiple opcodes worth of construction, still needs those).

use std::collections::HashMap;
use std::io::Write as _;
use std::path::PathBuf;

use ember_core::{
    format_value, CoroutineStatus, Frame, Gc, MapKey, Obj, ObjArray, ObjBoundMethod, ObjClass,
    ObjClosure, ObjCoroutine, ObjFunction, ObjInstance, ObjKind, ObjMap, ObjModule, ObjUpvalue,
    OpCode, UpvalueState, Value,
};

use crate::error::{FrameInfo, RuntimeError};
use crate::natives;

/// Call-frame stack bound (spec.md §4.4).
const FRAMES_MAX: usize = 64;
/// Value stack bound: `FRAMES_MAX` frames at a generous 256 slots apiece.
/// Fixed and never exceeded so that stack addresses handed out to open
/// upvalues stay valid for as long as those upvalues are open.
const STACK_MAX: usize = FRAMES_MAX * 256;

/// What unwinds out of [`Vm::run`]: either a genuine failure, or a
/// cooperative `yield` suspending the active coroutine. Both are represented
/// the same way (an early return carrying a payload) since the dispatch
/// loop has to stop executing either way; only the caller's response
/// differs (`Vm::interpret`/`Vm::import_module` treat a stray `Yield` as an
/// error, `Vm::resume_coroutine` treats it as the expected outcome).
pub enum Signal {
    Error(RuntimeError),
    Yield(Value),
}

pub type VmResult<T> = Result<T, Signal>;

pub enum InterpretResult {
    Ok,
    CompileError(Vec<crate::CompileError>),
    RuntimeError(RuntimeError),
}

/// The virtual machine: heap, value/frame stacks, globals, and the
/// bookkeeping needed for modules and coroutines.
pub struct Vm {
    gc: Gc,
    stack: Vec<Value>,
    frames: Vec<Frame>,
    open_upvalues: Vec<*mut Obj>,
    globals: HashMap<*mut Obj, Value>,
    modules: HashMap<PathBuf, Value>,
    importing: std::collections::HashSet<PathBuf>,
    init_string: *mut Obj,
    /// Where `PRINT` and string interpolation failures... no — just
    /// `PRINT` — write their output. Defaults to stdout; tests substitute
    /// an in-memory buffer via [`Vm::with_writer`] so `print`ed output is
    /// assertable without shelling out to a child process.
    stdout: Box<dyn std::io::Write>,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_gc(Gc::new(), Box::new(std::io::stdout()))
    }

    pub fn with_config(config: crate::config::GcConfig) -> Self {
        let mut gc = Gc::with_threshold(config.gc_initial_threshold_bytes);
        gc.stress = config.stress_gc;
        Self::with_gc(gc, Box::new(std::io::stdout()))
    }

    /// Builds a `Vm` that writes `PRINT` output to `writer` instead of
    /// stdout — the seam `ember-runtime/tests/` uses to assert on
    /// `print`ed output.
    pub fn with_writer(config: crate::config::GcConfig, writer: Box<dyn std::io::Write>) -> Self {
        let mut gc = Gc::with_threshold(config.gc_initial_threshold_bytes);
        gc.stress = config.stress_gc;
        Self::with_gc(gc, writer)
    }

    fn with_gc(mut gc: Gc, stdout: Box<dyn std::io::Write>) -> Self {
        let mut globals = HashMap::new();
        natives::register_globals(&mut gc, &mut globals);
        let init_string = gc.intern(b"init");
        Vm {
            gc,
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            open_upvalues: Vec::new(),
            globals,
            modules: HashMap::new(),
            importing: std::collections::HashSet::new(),
            init_string,
            stdout,
        }
    }

    /// Compiles and runs `source` to completion, matching spec.md §6's
    /// `interpret` entry point.
    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        let function_ptr = match ember_compiler::compile(source, &mut self.gc) {
            Ok(f) => f,
            Err(errors) => return InterpretResult::CompileError(errors),
        };
        let closure_ptr = self.gc.alloc_closure(ObjClosure { function: function_ptr, upvalues: Vec::new() });
        let closure_val = Value::object(closure_ptr);
        if self.push(closure_val).is_err() {
            // Cannot happen on a freshly reset stack, but handled for uniformity.
            return InterpretResult::RuntimeError(RuntimeError::new("Stack overflow.", 0));
        }
        if let Err(signal) = self.call_value(closure_val, 0) {
            return self.finish(Err(signal));
        }
        let result = self.run();
        self.finish(result)
    }

    fn finish(&mut self, result: VmResult<Value>) -> InterpretResult {
        match result {
            Ok(_) => InterpretResult::Ok,
            Err(Signal::Error(e)) => {
                report_error(&e);
                self.reset();
                InterpretResult::RuntimeError(e)
            }
            Err(Signal::Yield(_)) => {
                let e = RuntimeError::new("Cannot yield outside of a coroutine.", self.current_line());
                report_error(&e);
                self.reset();
                InterpretResult::RuntimeError(e)
            }
        }
    }

    /// Resets the value and frame stacks after a runtime error, matching
    /// spec.md §7's "the VM then resets its stacks."
    fn reset(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }

    // ---- stack primitives ----

    fn push(&mut self, value: Value) -> VmResult<()> {
        if self.stack.len() >= STACK_MAX {
            return Err(self.error("Stack overflow."));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow: compiler emitted unbalanced opcodes")
    }

    fn pop_n(&mut self, n: usize) {
        let len = self.stack.len();
        self.stack.truncate(len - n);
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn collect_args(&self, argc: u8) -> Vec<Value> {
        let start = self.stack.len() - argc as usize;
        self.stack[start..].to_vec()
    }

    // ---- bytecode reading ----

    fn read_byte(&mut self) -> u8 {
        let idx = self.frames.len() - 1;
        let ip = self.frames[idx].ip;
        let function_ptr = unsafe { as_closure(self.frames[idx].closure) }.function;
        let byte = unsafe { as_function(function_ptr) }.chunk.code[ip];
        self.frames[idx].ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let lo = self.read_byte() as u16;
        let hi = self.read_byte() as u16;
        lo | (hi << 8)
    }

    fn read_op(&mut self) -> VmResult<OpCode> {
        let byte = self.read_byte();
        OpCode::from_u8(byte).ok_or_else(|| self.error("Invalid opcode encountered."))
    }

    fn read_constant(&self, idx: usize) -> Value {
        let frame = self.frames.last().unwrap();
        let function_ptr = unsafe { as_closure(frame.closure) }.function;
        unsafe { as_function(function_ptr) }.chunk.constants[idx]
    }

    fn current_line(&self) -> u32 {
        match self.frames.last() {
            Some(frame) => {
                let function_ptr = unsafe { as_closure(frame.closure) }.function;
                unsafe { as_function(function_ptr) }.chunk.get_line(frame.ip.saturating_sub(1))
            }
            None => 0,
        }
    }

    /// Builds a [`Signal::Error`] carrying the active line and a
    /// top-to-bottom traceback of every live frame (spec.md §7).
    fn error(&self, message: impl Into<String>) -> Signal {
        let line = self.current_line();
        let mut err = RuntimeError::new(message, line);
        for frame in self.frames.iter().rev() {
            let function_ptr = unsafe { as_closure(frame.closure) }.function;
            let f = unsafe { as_function(function_ptr) };
            let frame_line = f.chunk.get_line(frame.ip.saturating_sub(1));
            let name = f.name.map(|n| unsafe { str_bytes(n) }.to_string());
            err.trace.push(FrameInfo { line: frame_line, function_name: name });
        }
        Signal::Error(err)
    }

    // ---- GC ----

    fn maybe_collect(&mut self) {
        if self.gc.should_collect() {
            self.collect_garbage();
        }
    }

    fn collect_garbage(&mut self) {
        let stack = &self.stack;
        let frames = &self.frames;
        let open_upvalues = &self.open_upvalues;
        let globals = &self.globals;
        let modules = &self.modules;
        let init_string = self.init_string;
        self.gc.collect(|g| {
            for v in stack.iter() {
                g.mark_value(*v);
            }
            for f in frames.iter() {
                g.mark_object(f.closure);
            }
            for &u in open_upvalues.iter() {
                g.mark_object(u);
            }
            for (&k, &v) in globals.iter() {
                g.mark_object(k);
                g.mark_value(v);
            }
            for (_, &v) in modules.iter() {
                g.mark_value(v);
            }
            g.mark_object(init_string);
        });
    }

    // ---- upvalues ----

    fn capture_upvalue(&mut self, stack_slot: usize) -> *mut Obj {
        let slot_addr = (&self.stack[stack_slot] as *const Value) as usize;
        for &up_ptr in &self.open_upvalues {
            if let UpvalueState::Open(p) = unsafe { &(*up_ptr).kind_as_upvalue().state } {
                if *p as usize == slot_addr {
                    return up_ptr;
                }
            }
        }
        let ptr: *mut Value = &mut self.stack[stack_slot];
        let new_up = self.gc.alloc_upvalue(UpvalueState::Open(ptr));
        let pos = self
            .open_upvalues
            .iter()
            .position(|&u| {
                let addr = match unsafe { &(*u).kind_as_upvalue().state } {
                    UpvalueState::Open(p) => *p as usize,
                    UpvalueState::Closed(_) => 0,
                };
                addr < ptr as usize
            })
            .unwrap_or(self.open_upvalues.len());
        self.open_upvalues.insert(pos, new_up);
        new_up
    }

    /// Closes every open upvalue pointing at or above `from_slot`, copying
    /// its slot's current value into its own storage (spec.md §4.4's
    /// "CLOSE_UPVALUE / frame return" contract). `open_upvalues` is kept
    /// sorted descending by stack address so this terminates at the first
    /// entry below the boundary (spec.md §9's "structural invariant").
    fn close_upvalues(&mut self, from_slot: usize) {
        let boundary = unsafe { self.stack.as_ptr().add(from_slot) } as usize;
        while let Some(&up_ptr) = self.open_upvalues.first() {
            let slot_ptr = match unsafe { &(*up_ptr).kind_as_upvalue().state } {
                UpvalueState::Open(p) => *p,
                UpvalueState::Closed(_) => break,
            };
            if (slot_ptr as usize) < boundary {
                break;
            }
            let value = unsafe { *slot_ptr };
            if let ObjKind::Upvalue(u) = unsafe { &mut (*up_ptr).kind } {
                u.state = UpvalueState::Closed(value);
            }
            self.open_upvalues.remove(0);
        }
    }

    // ---- calls ----

    fn call_value(&mut self, callee: Value, argc: u8) -> VmResult<()> {
        if !callee.is_object() {
            return Err(self.error("Can only call functions and classes."));
        }
        let callee_ptr = callee.as_object();
        match unsafe { &(*callee_ptr).kind } {
            ObjKind::Closure(c) => {
                let function_ptr = c.function;
                let arity = unsafe { as_function(function_ptr) }.arity;
                if argc != arity {
                    return Err(self.error(format!("Expected {arity} arguments but got {argc}.")));
                }
                if self.frames.len() >= FRAMES_MAX {
                    return Err(self.error("Stack overflow."));
                }
                let base = self.stack.len() - argc as usize - 1;
                self.frames.push(Frame { closure: callee_ptr, ip: 0, base });
                Ok(())
            }
            ObjKind::Native(n) => {
                if argc != n.arity {
                    return Err(self.error(format!("Expected {} arguments but got {}.", n.arity, argc)));
                }
                let function = n.function;
                if function == natives::yield_sentinel {
                    let value = self.pop();
                    self.pop_n(argc as usize);
                    return Err(Signal::Yield(value));
                }
                let args = self.collect_args(argc);
                match function(&mut self.gc, &args) {
                    Ok(v) => {
                        self.pop_n(argc as usize + 1);
                        self.push(v)
                    }
                    Err(msg) => Err(self.error(msg)),
                }
            }
            ObjKind::Class(_) => {
                let instance_ptr =
                    self.gc.alloc_instance(ObjInstance { class: callee_ptr, fields: HashMap::new() });
                let slot = self.stack.len() - argc as usize - 1;
                self.stack[slot] = Value::object(instance_ptr);
                let init = unsafe { as_class(callee_ptr) }.methods.get(&self.init_string).copied();
                match init {
                    Some(initializer) => self.call_value(initializer, argc),
                    None => {
                        if argc != 0 {
                            return Err(self.error("Expected 0 arguments but got more."));
                        }
                        Ok(())
                    }
                }
            }
            ObjKind::BoundMethod(b) => {
                let receiver = b.receiver;
                let method = b.method;
                let slot = self.stack.len() - argc as usize - 1;
                self.stack[slot] = receiver;
                self.call_value(Value::object(method), argc)
            }
            _ => Err(self.error("Can only call functions and classes.")),
        }
    }

    fn invoke(&mut self, name_ptr: *mut Obj, argc: u8, safe: bool) -> VmResult<()> {
        let receiver = self.peek(argc as usize);
        if safe && receiver.is_nil() {
            self.pop_n(argc as usize + 1);
            return self.push(Value::nil());
        }
        if !receiver.is_object() {
            return Err(self.error("Only instances and built-in objects have methods."));
        }
        let recv_ptr = receiver.as_object();
        match unsafe { &(*recv_ptr).kind } {
            ObjKind::Instance(i) => {
                if let Some(field_val) = i.fields.get(&name_ptr).copied() {
                    let slot = self.stack.len() - argc as usize - 1;
                    self.stack[slot] = field_val;
                    return self.call_value(field_val, argc);
                }
                let class_ptr = i.class;
                let method = unsafe { as_class(class_ptr) }.methods.get(&name_ptr).copied();
                match method {
                    Some(m) => self.call_value(m, argc),
                    None => Err(self.error(format!("Undefined property '{}'.", unsafe { str_bytes(name_ptr) }))),
                }
            }
            ObjKind::Class(c) => match c.statics.get(&name_ptr).copied() {
                Some(m) => self.call_value(m, argc),
                None => Err(self.error(format!("Undefined property '{}'.", unsafe { str_bytes(name_ptr) }))),
            },
            ObjKind::Module(m) => match m.fields.get(&name_ptr).copied() {
                Some(v) => {
                    let slot = self.stack.len() - argc as usize - 1;
                    self.stack[slot] = v;
                    self.call_value(v, argc)
                }
                None => Err(self.error(format!("Undefined property '{}'.", unsafe { str_bytes(name_ptr) }))),
            },
            ObjKind::Coroutine(_) => self.invoke_coroutine(recv_ptr, name_ptr, argc),
            _ => {
                let args = self.collect_args(argc);
                let name_str = unsafe { str_bytes(name_ptr) };
                match natives::invoke_builtin(&mut self.gc, receiver, name_str, &args) {
                    Some(Ok(v)) => {
                        self.pop_n(argc as usize + 1);
                        self.push(v)
                    }
                    Some(Err(msg)) => Err(self.error(msg)),
                    None => Err(self.error(format!("Undefined property '{name_str}'."))),
                }
            }
        }
    }

    fn get_super(&mut self, name_ptr: *mut Obj) -> VmResult<()> {
        let super_val = self.pop();
        let this_val = self.pop();
        let super_ptr = super_val.as_object();
        let method = unsafe { as_class(super_ptr) }.methods.get(&name_ptr).copied();
        match method {
            Some(m) => {
                let bm = self.gc.alloc_bound_method(ObjBoundMethod { receiver: this_val, method: m.as_object() });
                self.push(Value::object(bm))
            }
            None => Err(self.error(format!("Undefined property '{}'.", unsafe { str_bytes(name_ptr) }))),
        }
    }

    fn super_invoke(&mut self, name_ptr: *mut Obj, argc: u8) -> VmResult<()> {
        let super_val = self.pop();
        let super_ptr = super_val.as_object();
        let method = unsafe { as_class(super_ptr) }.methods.get(&name_ptr).copied();
        match method {
            Some(m) => self.call_value(m, argc),
            None => Err(self.error(format!("Undefined property '{}'.", unsafe { str_bytes(name_ptr) }))),
        }
    }

    // ---- properties / subscripts ----

    fn load_property(&mut self, name_ptr: *mut Obj, safe: bool) -> VmResult<()> {
        let receiver = self.pop();
        if safe && receiver.is_nil() {
            return self.push(Value::nil());
        }
        if !receiver.is_object() {
            return Err(self.error("Only instances, classes, and modules have properties."));
        }
        let ptr = receiver.as_object();
        match unsafe { &(*ptr).kind } {
            ObjKind::Instance(i) => {
                if let Some(v) = i.fields.get(&name_ptr).copied() {
                    return self.push(v);
                }
                let class = unsafe { as_class(i.class) };
                match class.methods.get(&name_ptr).copied() {
                    Some(m) => {
                        let bm =
                            self.gc.alloc_bound_method(ObjBoundMethod { receiver, method: m.as_object() });
                        self.push(Value::object(bm))
                    }
                    None => Err(self.error(format!("Undefined property '{}'.", unsafe { str_bytes(name_ptr) }))),
                }
            }
            ObjKind::Class(c) => match c.statics.get(&name_ptr).copied() {
                Some(v) => self.push(v),
                None => Err(self.error(format!("Undefined property '{}'.", unsafe { str_bytes(name_ptr) }))),
            },
            ObjKind::Module(m) => match m.fields.get(&name_ptr).copied() {
                Some(v) => self.push(v),
                None => Err(self.error(format!("Undefined property '{}'.", unsafe { str_bytes(name_ptr) }))),
            },
            _ => Err(self.error("Only instances, classes, and modules have properties.")),
        }
    }

    fn store_property(&mut self, name_ptr: *mut Obj, safe: bool) -> VmResult<()> {
        let value = self.pop();
        let receiver = self.pop();
        if safe && receiver.is_nil() {
            return self.push(Value::nil());
        }
        if !receiver.is_object() {
            return Err(self.error("Only instances have settable properties."));
        }
        let ptr = receiver.as_object();
        match unsafe { &mut (*ptr).kind } {
            ObjKind::Instance(i) => {
                i.fields.insert(name_ptr, value);
            }
            ObjKind::Module(m) => {
                m.fields.insert(name_ptr, value);
            }
            _ => return Err(self.error("Only instances have settable properties.")),
        }
        self.push(value)
    }

    fn index_for(&self, index: Value, len: usize) -> VmResult<usize> {
        if !index.is_number() {
            return Err(self.error("Subscript index must be a number."));
        }
        let i = index.as_number();
        if i < 0.0 || i.fract() != 0.0 || i as usize >= len {
            return Err(self.error("Index out of bounds."));
        }
        Ok(i as usize)
    }

    fn load_subscript(&mut self, safe: bool) -> VmResult<()> {
        let index = self.pop();
        let receiver = self.pop();
        if safe && receiver.is_nil() {
            return self.push(Value::nil());
        }
        if !receiver.is_object() {
            return Err(self.error("Only lists, maps, and arrays support subscript access."));
        }
        let ptr = receiver.as_object();
        match unsafe { &(*ptr).kind } {
            ObjKind::List(l) => {
                let i = self.index_for(index, l.items.len())?;
                self.push(l.items[i])
            }
            ObjKind::Array(a) => {
                let i = self.index_for(index, a.items.len())?;
                self.push(a.items[i])
            }
            ObjKind::Map(m) => match m.entries.get(&MapKey::from(index)).copied() {
                Some(v) => self.push(v),
                None => Err(self.error("Key not found.")),
            },
            _ => Err(self.error("Only lists, maps, and arrays support subscript access.")),
        }
    }

    fn store_subscript(&mut self, safe: bool) -> VmResult<()> {
        let value = self.pop();
        let index = self.pop();
        let receiver = self.pop();
        if safe && receiver.is_nil() {
            return self.push(Value::nil());
        }
        if !receiver.is_object() {
            return Err(self.error("Only lists, maps, and arrays support subscript assignment."));
        }
        let ptr = receiver.as_object();
        match unsafe { &mut (*ptr).kind } {
            ObjKind::List(l) => {
                let len = l.items.len();
                let i = self.index_for(index, len)?;
                l.items[i] = value;
            }
            ObjKind::Array(a) => {
                let len = a.items.len();
                let i = self.index_for(index, len)?;
                a.items[i] = value;
            }
            ObjKind::Map(m) => {
                m.entries.insert(MapKey::from(index), value);
            }
            _ => return Err(self.error("Only lists, maps, and arrays support subscript assignment.")),
        }
        self.push(value)
    }

    // ---- arithmetic helpers ----

    fn number_binary(&mut self, f: impl Fn(f64, f64) -> f64) -> VmResult<()> {
        let b = self.peek(0);
        let a = self.peek(1);
        if !a.is_number() || !b.is_number() {
            return Err(self.error("Operands must be numbers"));
        }
        let bv = self.pop();
        let av = self.pop();
        self.push(Value::number(f(av.as_number(), bv.as_number())))
    }

    fn number_compare(&mut self, f: impl Fn(f64, f64) -> bool) -> VmResult<()> {
        let b = self.peek(0);
        let a = self.peek(1);
        if !a.is_number() || !b.is_number() {
            return Err(self.error("Operands must be numbers"));
        }
        let bv = self.pop();
        let av = self.pop();
        self.push(Value::bool(f(av.as_number(), bv.as_number())))
    }

    fn bitwise_binary(&mut self, f: impl Fn(i64, i64) -> i64) -> VmResult<()> {
        let b = self.peek(0);
        let a = self.peek(1);
        if !a.is_number() || !b.is_number() {
            return Err(self.error("Operands must be numbers"));
        }
        let bv = self.pop();
        let av = self.pop();
        self.push(Value::number(f(av.as_number() as i64, bv.as_number() as i64) as f64))
    }

    /// `ADD` specializes on strings before falling back to numeric
    /// addition (spec.md §4.4). The source's `IS_NUMBER(peek(0)) ||
    /// IS_NUMBER(peek(1))` short-circuit is a known bug (spec.md §9); this
    /// requires both operands to be numbers, as the spec mandates.
    fn add_op(&mut self) -> VmResult<()> {
        let b = self.peek(0);
        let a = self.peek(1);
        if a.is_number() && b.is_number() {
            let bv = self.pop();
            let av = self.pop();
            return self.push(Value::number(av.as_number() + bv.as_number()));
        }
        if is_string(a) && is_string(b) {
            let bv = self.pop();
            let av = self.pop();
            let sa = unsafe { str_bytes(av.as_object()) };
            let sb = unsafe { str_bytes(bv.as_object()) };
            let mut combined = String::with_capacity(sa.len() + sb.len());
            combined.push_str(sa);
            combined.push_str(sb);
            let interned = self.gc.intern(combined.as_bytes());
            return self.push(Value::object(interned));
        }
        Err(self.error("Operands must be numbers"))
    }

    // ---- modules ----

    fn import_module(&mut self, path: &str) -> VmResult<Value> {
        let key = std::fs::canonicalize(path).unwrap_or_else(|_| PathBuf::from(path));
        if let Some(v) = self.modules.get(&key).copied() {
            return Ok(v);
        }
        if self.importing.contains(&key) {
            return Err(self.error(format!("Circular import of '{path}'.")));
        }
        let source = match std::fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) => return Err(self.error(format!("Cannot read module '{path}': {e}"))),
        };

        self.importing.insert(key.clone());
        let compiled = ember_compiler::compile(&source, &mut self.gc);
        let function_ptr = match compiled {
            Ok(f) => f,
            Err(errors) => {
                self.importing.remove(&key);
                let msg =
                    errors.first().map(|e| e.message.clone()).unwrap_or_else(|| "Failed to compile module.".to_string());
                return Err(self.error(msg));
            }
        };
        let closure_ptr = self.gc.alloc_closure(ObjClosure { function: function_ptr, upvalues: Vec::new() });

        let outer_globals = std::mem::take(&mut self.globals);
        natives::register_globals(&mut self.gc, &mut self.globals);

        self.push(Value::object(closure_ptr))?;
        if let Err(signal) = self.call_value(Value::object(closure_ptr), 0) {
            self.importing.remove(&key);
            self.globals = outer_globals;
            return Err(signal);
        }
        let result = self.run();
        self.importing.remove(&key);
        let module_globals = std::mem::replace(&mut self.globals, outer_globals);

        match result {
            Ok(_) => {
                let name_ptr = self.gc.intern(path.as_bytes());
                let module_ptr = self.gc.alloc_module(ObjModule { name: name_ptr, fields: module_globals });
                let module_val = Value::object(module_ptr);
                self.modules.insert(key, module_val);
                Ok(module_val)
            }
            Err(Signal::Error(e)) => Err(Signal::Error(e)),
            Err(Signal::Yield(_)) => Err(self.error("Cannot yield outside of a coroutine.")),
        }
    }

    // ---- coroutines ----

    fn invoke_coroutine(&mut self, co_ptr: *mut Obj, name_ptr: *mut Obj, argc: u8) -> VmResult<()> {
        let name = unsafe { str_bytes(name_ptr) };
        match name {
            "resume" => {
                let args = self.collect_args(argc);
                let start = self.stack.len() - argc as usize - 1;
                self.stack.truncate(start);
                let result = self.resume_coroutine(co_ptr, args)?;
                self.push(result)
            }
            "status" => {
                if argc != 0 {
                    return Err(self.error("Expected 0 arguments but got more."));
                }
                self.pop();
                let status = unsafe { as_coroutine(co_ptr) }.status;
                let s = match status {
                    CoroutineStatus::NotStarted => "not_started",
                    CoroutineStatus::Running => "running",
                    CoroutineStatus::Suspended => "suspended",
                    CoroutineStatus::Done => "done",
                };
                let interned = self.gc.intern(s.as_bytes());
                self.push(Value::object(interned))
            }
            _ => Err(self.error(format!("Undefined property '{name}'."))),
        }
    }

    /// Swaps the VM's live stack/frame/open-upvalue state with the
    /// coroutine's saved state, runs it until it either returns, yields, or
    /// errors, then swaps the state back — the "nested `run()`" approach
    /// to cooperative suspension described in DESIGN.md.
    fn resume_coroutine(&mut self, co_ptr: *mut Obj, args: Vec<Value>) -> VmResult<Value> {
        let status = unsafe { as_coroutine(co_ptr) }.status;
        match status {
            CoroutineStatus::Done => return Err(self.error("Cannot resume a finished coroutine.")),
            CoroutineStatus::Running => return Err(self.error("Coroutine is already running.")),
            _ => {}
        }

        let outer_stack = std::mem::replace(&mut self.stack, Vec::new());
        let outer_frames = std::mem::replace(&mut self.frames, Vec::new());
        let outer_open = std::mem::replace(&mut self.open_upvalues, Vec::new());

        {
            let co = unsafe { as_coroutine_mut(co_ptr) };
            self.stack = std::mem::take(&mut co.stack);
            self.frames = std::mem::take(&mut co.frames);
            self.open_upvalues = std::mem::take(&mut co.open_upvalues);
            co.status = CoroutineStatus::Running;
        }
        if self.stack.capacity() < STACK_MAX {
            self.stack.reserve(STACK_MAX - self.stack.capacity());
        }

        let start_fresh = status == CoroutineStatus::NotStarted;
        let outcome: VmResult<Value> = (|| {
            if start_fresh {
                let closure_val = Value::object(unsafe { as_coroutine(co_ptr) }.closure);
                self.push(closure_val)?;
                for a in &args {
                    self.push(*a)?;
                }
                self.call_value(closure_val, args.len() as u8)?;
            } else {
                let v = args.into_iter().next().unwrap_or(Value::nil());
                self.push(v)?;
            }
            self.run()
        })();

        let co_stack = std::mem::replace(&mut self.stack, outer_stack);
        let co_frames = std::mem::replace(&mut self.frames, outer_frames);
        let co_open = std::mem::replace(&mut self.open_upvalues, outer_open);

        let co = unsafe { as_coroutine_mut(co_ptr) };
        match outcome {
            Ok(value) => {
                co.status = CoroutineStatus::Done;
                co.stack = co_stack;
                co.frames = co_frames;
                co.open_upvalues = co_open;
                Ok(value)
            }
            Err(Signal::Yield(value)) => {
                co.status = CoroutineStatus::Suspended;
                co.stack = co_stack;
                co.frames = co_frames;
                co.open_upvalues = co_open;
                Ok(value)
            }
            Err(err @ Signal::Error(_)) => {
                co.status = CoroutineStatus::Done;
                co.stack = Vec::new();
                co.frames = Vec::new();
                co.open_upvalues = Vec::new();
                Err(err)
            }
        }
    }

    // ---- dispatch loop ----

    /// Runs opcodes until the frame active when this call started returns
    /// (or the whole program errors/yields). `entry_depth` is captured
    /// *after* the caller has already pushed that frame via `call_value`,
    /// so `RETURN` compares against it to decide whether to return out of
    /// Rust (a genuinely nested invocation: top-level script, a coroutine
    /// resume, or a module import) or just keep looping (an ordinary
    /// in-script `CALL`, which never leaves this Rust stack frame).
    fn run(&mut self) -> VmResult<Value> {
        let entry_depth = self.frames.len();
        loop {
            self.maybe_collect();
            let op = self.read_op()?;
            match op {
                OpCode::LoadConstant => {
                    let idx = self.read_byte();
                    let v = self.read_constant(idx as usize);
                    self.push(v)?;
                }
                OpCode::LoadTrue => self.push(Value::bool(true))?,
                OpCode::LoadFalse => self.push(Value::bool(false))?,
                OpCode::LoadNil => self.push(Value::nil())?,

                OpCode::NotEqual => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::bool(a != b))?;
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::bool(a == b))?;
                }
                OpCode::Greater => self.number_compare(|a, b| a > b)?,
                OpCode::GreaterEqual => self.number_compare(|a, b| a >= b)?,
                OpCode::Less => self.number_compare(|a, b| a < b)?,
                OpCode::LessEqual => self.number_compare(|a, b| a <= b)?,

                OpCode::Not => {
                    let v = self.pop();
                    self.push(Value::bool(v.is_falsey()))?;
                }
                OpCode::Negate => {
                    let v = self.pop();
                    if !v.is_number() {
                        return Err(self.error("Operand must be a number"));
                    }
                    self.push(Value::number(-v.as_number()))?;
                }
                OpCode::Inc => {
                    let v = self.pop();
                    if !v.is_number() {
                        return Err(self.error("Operand must be a number"));
                    }
                    self.push(Value::number(v.as_number() + 1.0))?;
                }
                OpCode::Dec => {
                    let v = self.pop();
                    if !v.is_number() {
                        return Err(self.error("Operand must be a number"));
                    }
                    self.push(Value::number(v.as_number() - 1.0))?;
                }
                OpCode::Add => self.add_op()?,
                OpCode::Subtract => self.number_binary(|a, b| a - b)?,
                OpCode::Multiply => self.number_binary(|a, b| a * b)?,
                OpCode::Divide => self.number_binary(|a, b| a / b)?,
                OpCode::Modulo => self.number_binary(|a, b| a % b)?,
                OpCode::Power => self.number_binary(|a, b| a.powf(b))?,

                OpCode::BitwiseNot => {
                    let v = self.pop();
                    if !v.is_number() {
                        return Err(self.error("Operand must be a number"));
                    }
                    self.push(Value::number(!(v.as_number() as i64) as f64))?;
                }
                OpCode::BitwiseAnd => self.bitwise_binary(|a, b| a & b)?,
                OpCode::BitwiseOr => self.bitwise_binary(|a, b| a | b)?,
                OpCode::BitwiseXor => self.bitwise_binary(|a, b| a ^ b)?,
                OpCode::BitwiseLeftShift => self.bitwise_binary(|a, b| a.wrapping_shl((b & 63) as u32))?,
                OpCode::BitwiseRightShift => self.bitwise_binary(|a, b| a.wrapping_shr((b & 63) as u32))?,

                OpCode::Jump => {
                    let off = self.read_u16();
                    self.frames.last_mut().unwrap().ip += off as usize;
                }
                OpCode::JumpIfFalse => {
                    let off = self.read_u16();
                    if self.peek(0).is_falsey() {
                        self.frames.last_mut().unwrap().ip += off as usize;
                    }
                }
                OpCode::PopJumpIfFalse => {
                    let off = self.read_u16();
                    let v = self.pop();
                    if v.is_falsey() {
                        self.frames.last_mut().unwrap().ip += off as usize;
                    }
                }
                OpCode::PopJumpIfEqual => {
                    let off = self.read_u16();
                    let b = self.pop();
                    let a = self.pop();
                    if a == b {
                        self.frames.last_mut().unwrap().ip += off as usize;
                    }
                }
                OpCode::JumpIfNotNil => {
                    let off = self.read_u16();
                    if !self.peek(0).is_nil() {
                        self.frames.last_mut().unwrap().ip += off as usize;
                    }
                }
                OpCode::Loop => {
                    let off = self.read_u16();
                    self.frames.last_mut().unwrap().ip -= off as usize;
                }

                OpCode::DefineGlobal => {
                    let idx = self.read_byte();
                    let name_ptr = self.read_constant(idx as usize).as_object();
                    let v = self.pop();
                    self.globals.insert(name_ptr, v);
                }
                OpCode::LoadGlobal => {
                    let idx = self.read_byte();
                    let name_ptr = self.read_constant(idx as usize).as_object();
                    match self.globals.get(&name_ptr).copied() {
                        Some(v) => self.push(v)?,
                        None => {
                            return Err(self.error(format!("Undefined variable '{}'.", unsafe {
                                str_bytes(name_ptr)
                            })))
                        }
                    }
                }
                OpCode::StoreGlobal => {
                    let idx = self.read_byte();
                    let name_ptr = self.read_constant(idx as usize).as_object();
                    if !self.globals.contains_key(&name_ptr) {
                        return Err(self.error(format!("Undefined variable '{}'.", unsafe {
                            str_bytes(name_ptr)
                        })));
                    }
                    let v = self.peek(0);
                    self.globals.insert(name_ptr, v);
                }

                OpCode::LoadLocal => {
                    let slot = self.read_byte();
                    let base = self.frames.last().unwrap().base;
                    self.push(self.stack[base + slot as usize])?;
                }
                OpCode::StoreLocal => {
                    let slot = self.read_byte();
                    let base = self.frames.last().unwrap().base;
                    let v = self.peek(0);
                    self.stack[base + slot as usize] = v;
                }

                OpCode::Call => {
                    let argc = self.read_byte();
                    let callee = self.peek(argc as usize);
                    self.call_value(callee, argc)?;
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().unwrap();
                    self.close_upvalues(frame.base);
                    self.stack.truncate(frame.base);
                    if self.frames.len() < entry_depth {
                        return Ok(result);
                    }
                    self.push(result)?;
                }
                OpCode::Closure => {
                    let idx = self.read_byte();
                    let fn_val = self.read_constant(idx as usize);
                    let function_ptr = fn_val.as_object();
                    let upvalue_count = unsafe { as_function(function_ptr) }.upvalue_count;
                    let mut upvalues = Vec::with_capacity(upvalue_count as usize);
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte();
                        if is_local {
                            let base = self.frames.last().unwrap().base;
                            upvalues.push(self.capture_upvalue(base + index as usize));
                        } else {
                            let enclosing = self.frames.last().unwrap().closure;
                            upvalues.push(unsafe { as_closure(enclosing) }.upvalues[index as usize]);
                        }
                    }
                    let closure_ptr = self.gc.alloc_closure(ObjClosure { function: function_ptr, upvalues });
                    self.push(Value::object(closure_ptr))?;
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::LoadUpvalue => {
                    let slot = self.read_byte();
                    let closure_ptr = self.frames.last().unwrap().closure;
                    let up_ptr = unsafe { as_closure(closure_ptr) }.upvalues[slot as usize];
                    let v = match unsafe { &(*up_ptr).kind } {
                        ObjKind::Upvalue(u) => match u.state {
                            UpvalueState::Open(p) => unsafe { *p },
                            UpvalueState::Closed(v) => v,
                        },
                        _ => unreachable!("upvalue slot did not hold an Upvalue"),
                    };
                    self.push(v)?;
                }
                OpCode::StoreUpvalue => {
                    let slot = self.read_byte();
                    let closure_ptr = self.frames.last().unwrap().closure;
                    let up_ptr = unsafe { as_closure(closure_ptr) }.upvalues[slot as usize];
                    let v = self.peek(0);
                    match unsafe { &mut (*up_ptr).kind } {
                        ObjKind::Upvalue(u) => match &mut u.state {
                            UpvalueState::Open(p) => unsafe { **p = v },
                            UpvalueState::Closed(cv) => *cv = v,
                        },
                        _ => unreachable!("upvalue slot did not hold an Upvalue"),
                    }
                }

                OpCode::Import => {
                    let idx = self.read_byte();
                    let path_ptr = self.read_constant(idx as usize).as_object();
                    let path = unsafe { str_bytes(path_ptr) }.to_string();
                    let module_val = self.import_module(&path)?;
                    self.push(module_val)?;
                }

                OpCode::Class => {
                    let idx = self.read_byte();
                    let name_ptr = self.read_constant(idx as usize).as_object();
                    let class_ptr = self.gc.alloc_class(ObjClass {
                        name: name_ptr,
                        superclass: None,
                        methods: HashMap::new(),
                        statics: HashMap::new(),
                    });
                    self.push(Value::object(class_ptr))?;
                }
                OpCode::Inherit => {
                    let subclass_val = self.pop();
                    let superclass_val = self.pop();
                    if !superclass_val.is_object()
                        || !matches!(unsafe { &(*superclass_val.as_object()).kind }, ObjKind::Class(_))
                    {
                        return Err(self.error("Superclass must be a class."));
                    }
                    let super_ptr = superclass_val.as_object();
                    let sub_ptr = subclass_val.as_object();
                    let methods: Vec<(*mut Obj, Value)> =
                        unsafe { as_class(super_ptr) }.methods.iter().map(|(k, v)| (*k, *v)).collect();
                    let sub = unsafe { as_class_mut(sub_ptr) };
                    for (k, v) in methods {
                        sub.methods.insert(k, v);
                    }
                    sub.superclass = Some(super_ptr);
                }
                OpCode::LoadProperty | OpCode::LoadPropertySafe => {
                    let idx = self.read_byte();
                    let name_ptr = self.read_constant(idx as usize).as_object();
                    self.load_property(name_ptr, op == OpCode::LoadPropertySafe)?;
                }
                OpCode::StoreProperty | OpCode::StorePropertySafe => {
                    let idx = self.read_byte();
                    let name_ptr = self.read_constant(idx as usize).as_object();
                    self.store_property(name_ptr, op == OpCode::StorePropertySafe)?;
                }
                OpCode::Method => {
                    let idx = self.read_byte();
                    let name_ptr = self.read_constant(idx as usize).as_object();
                    let closure_val = self.pop();
                    let class_ptr = self.peek(0).as_object();
                    unsafe { as_class_mut(class_ptr) }.methods.insert(name_ptr, closure_val);
                }
                OpCode::StaticMethod => {
                    let idx = self.read_byte();
                    let name_ptr = self.read_constant(idx as usize).as_object();
                    let closure_val = self.pop();
                    let class_ptr = self.peek(0).as_object();
                    unsafe { as_class_mut(class_ptr) }.statics.insert(name_ptr, closure_val);
                }
                OpCode::Invoke | OpCode::InvokeSafe => {
                    let idx = self.read_byte();
                    let argc = self.read_byte();
                    let name_ptr = self.read_constant(idx as usize).as_object();
                    self.invoke(name_ptr, argc, op == OpCode::InvokeSafe)?;
                }
                OpCode::GetSuper => {
                    let idx = self.read_byte();
                    let name_ptr = self.read_constant(idx as usize).as_object();
                    self.get_super(name_ptr)?;
                }
                OpCode::SuperInvoke => {
                    let idx = self.read_byte();
                    let name_ptr = self.read_constant(idx as usize).as_object();
                    let argc = self.read_byte();
                    self.super_invoke(name_ptr, argc)?;
                }
                OpCode::EndClass => {
                    self.pop();
                }

                OpCode::LoadSubscript | OpCode::LoadSubscriptSafe => {
                    self.load_subscript(op == OpCode::LoadSubscriptSafe)?;
                }
                OpCode::StoreSubscript | OpCode::StoreSubscriptSafe => {
                    self.store_subscript(op == OpCode::StoreSubscriptSafe)?;
                }
                OpCode::List => {
                    let count = self.read_byte() as usize;
                    let start = self.stack.len() - count;
                    let items = self.stack.split_off(start);
                    let list_ptr = self.gc.alloc_list(items);
                    self.push(Value::object(list_ptr))?;
                }
                OpCode::Map => {
                    let count = self.read_byte() as usize;
                    let start = self.stack.len() - count * 2;
                    let entries = self.stack.split_off(start);
                    let map_ptr = self.gc.alloc_map();
                    if let ObjKind::Map(m) = unsafe { &mut (*map_ptr).kind } {
                        for pair in entries.chunks(2) {
                            m.entries.insert(MapKey::from(pair[0]), pair[1]);
                        }
                    }
                    self.push(Value::object(map_ptr))?;
                }

                OpCode::Pop => {
                    self.pop();
                }
                OpCode::Dup => {
                    let v = self.peek(0);
                    self.push(v)?;
                }
                OpCode::DupTwo => {
                    let a = self.peek(1);
                    let b = self.peek(0);
                    self.push(a)?;
                    self.push(b)?;
                }
                OpCode::Swap => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(b)?;
                    self.push(a)?;
                }
                OpCode::SwapThree => {
                    let c = self.pop();
                    let b = self.pop();
                    let a = self.pop();
                    self.push(b)?;
                    self.push(a)?;
                    self.push(c)?;
                }
                OpCode::SwapFour => {
                    let d = self.pop();
                    let c = self.pop();
                    let b = self.pop();
                    let a = self.pop();
                    self.push(c)?;
                    self.push(a)?;
                    self.push(b)?;
                    self.push(d)?;
                }

                OpCode::Print => {
                    let v = self.pop();
                    let _ = writeln!(self.stdout, "{}", format_value(v));
                }
                OpCode::BuildString => {
                    let count = self.read_byte() as usize;
                    let start = self.stack.len() - count;
                    let parts = self.stack.split_off(start);
                    let mut s = String::new();
                    for p in parts {
                        s.push_str(&format_value(p));
                    }
                    let interned = self.gc.intern(s.as_bytes());
                    self.push(Value::object(interned))?;
                }
            }
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes a failed `interpret`'s diagnostic to stderr, in the
/// `EMBER_REPORT=json` structured form when that env var is set and the
/// crate was built with the `report-json` feature, otherwise in the plain
/// `[Line n] ...` traceback form spec.md §7 prescribes.
fn report_error(e: &RuntimeError) {
    #[cfg(feature = "report-json")]
    {
        if std::env::var("EMBER_REPORT").as_deref() == Ok("json") {
            eprintln!("{}", e.to_json());
            return;
        }
    }
    eprint!("{}", e.render());
}

fn is_string(v: Value) -> bool {
    v.is_object() && matches!(unsafe { &(*v.as_object()).kind }, ObjKind::String(_))
}

/// # Safety
/// `ptr` must point to a live `Obj` whose kind is `Closure`.
unsafe fn as_closure(ptr: *mut Obj) -> &'static ObjClosure {
    match unsafe { &(*ptr).kind } {
        ObjKind::Closure(c) => c,
        _ => unreachable!("expected a closure"),
    }
}

/// # Safety
/// `ptr` must point to a live `Obj` whose kind is `Function`.
unsafe fn as_function(ptr: *mut Obj) -> &'static ObjFunction {
    match unsafe { &(*ptr).kind } {
        ObjKind::Function(f) => f,
        _ => unreachable!("expected a function"),
    }
}

/// # Safety
/// `ptr` must point to a live `Obj` whose kind is `Class`.
unsafe fn as_class(ptr: *mut Obj) -> &'static ObjClass {
    match unsafe { &(*ptr).kind } {
        ObjKind::Class(c) => c,
        _ => unreachable!("expected a class"),
    }
}

/// # Safety
/// `ptr` must point to a live `Obj` whose kind is `Class`.
unsafe fn as_class_mut(ptr: *mut Obj) -> &'static mut ObjClass {
    match unsafe { &mut (*ptr).kind } {
        ObjKind::Class(c) => c,
        _ => unreachable!("expected a class"),
    }
}

/// # Safety
/// `ptr` must point to a live `Obj` whose kind is `Coroutine`.
unsafe fn as_coroutine(ptr: *mut Obj) -> &'static ObjCoroutine {
    match unsafe { &(*ptr).kind } {
        ObjKind::Coroutine(c) => c,
        _ => unreachable!("expected a coroutine"),
    }
}

/// # Safety
/// `ptr` must point to a live `Obj` whose kind is `Coroutine`.
unsafe fn as_coroutine_mut(ptr: *mut Obj) -> &'static mut ObjCoroutine {
    match unsafe { &mut (*ptr).kind } {
        ObjKind::Coroutine(c) => c,
        _ => unreachable!("expected a coroutine"),
    }
}

/// # Safety
/// `ptr` must point to a live `Obj` whose kind is `String`.
unsafe fn str_bytes(ptr: *mut Obj) -> &'static str {
    match unsafe { &(*ptr).kind } {
        ObjKind::String(s) => s.as_str(),
        _ => unreachable!("expected a string"),
    }
}

/// A small helper trait so `capture_upvalue`/`close_upvalues` can pattern
/// match an upvalue's state without repeating the "not an Upvalue" panic
/// arm inline at every call site.
trait AsUpvalue {
    /// # Safety
    /// `self` must be a live `Obj` whose kind is `Upvalue`.
    unsafe fn kind_as_upvalue(&self) -> &ObjUpvalue;
}

impl AsUpvalue for Obj {
    unsafe fn kind_as_upvalue(&self) -> &ObjUpvalue {
        match &self.kind {
            ObjKind::Upvalue(u) => u,
            _ => unreachable!("expected an upvalue"),
        }
    }
}
