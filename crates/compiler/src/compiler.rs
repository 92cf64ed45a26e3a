//! Single-pass AST-to-bytecode lowering: the engineering core of this
//! crate (spec.md §4.2). Scope resolution, upvalue capture, jump
//! patching, and class/closure lowering all live here; the scanner,
//! parser and AST are comparatively thin collaborators feeding it.
//!
//! Mirrors `examples/navicore-cem3/crates/compiler/src/resolver.rs`'s
//! shape (a stack of nested scope contexts walked top-down to resolve
//! names) adapted from module-path resolution to local/upvalue/global
//! resolution, and its `codegen.rs`'s "one context per function being
//! emitted" structure for the function-nesting stack.

use ember_core::{Chunk, Gc, Obj, ObjFunction, OpCode, Value};

use crate::ast::{
    Ast, BinaryOp, Decl, Expr, FunctionBody, FunctionNode, IncDecOp, InterpPart, Literal,
    LogicalOp, NamedFunction, Stmt, UnaryOp,
};
use crate::error::CompileError;

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;
const MAX_ARGS: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FnKind {
    Script,
    Function,
    Lambda,
    Method,
    Initializer,
}

struct Local {
    name: String,
    /// `-1` while the initializer is still being compiled, preventing a
    /// local's own initializer from resolving to itself.
    depth: i32,
    is_captured: bool,
}

#[derive(Clone, Copy)]
struct UpvalueRef {
    index: u8,
    is_local: bool,
}

struct LoopCtx {
    continue_target: usize,
    scope_depth: i32,
    break_jumps: Vec<usize>,
}

struct ClassCtx {
    has_superclass: bool,
}

struct FnState {
    kind: FnKind,
    name: Option<String>,
    arity: u8,
    chunk: Chunk,
    locals: Vec<Local>,
    scope_depth: i32,
    upvalues: Vec<UpvalueRef>,
    loops: Vec<LoopCtx>,
}

impl FnState {
    fn new(kind: FnKind, name: Option<String>) -> Self {
        // Slot 0 is reserved for the receiver (`this`) in methods/initializers
        // and for the closure's own callee slot otherwise (spec.md §4.2,
        // §4.4's "CALL ... validate arity" contract).
        let slot0_name = if matches!(kind, FnKind::Method | FnKind::Initializer) {
            "this"
        } else {
            ""
        };
        FnState {
            kind,
            name,
            arity: 0,
            chunk: Chunk::new(),
            locals: vec![Local { name: slot0_name.to_string(), depth: 0, is_captured: false }],
            scope_depth: 0,
            upvalues: Vec::new(),
            loops: Vec::new(),
        }
    }
}

enum VarLoc {
    Local(u8),
    Upvalue(u8),
    Global(u8),
}

pub struct Compiler<'gc> {
    gc: &'gc mut Gc,
    stack: Vec<FnState>,
    classes: Vec<ClassCtx>,
    errors: Vec<CompileError>,
}

type CResult = Result<(), ()>;

/// Lowers a parsed program into a top-level script function. Errors
/// accumulate rather than aborting at the first one, matching the
/// parser's synchronize-and-continue discipline (spec.md §7).
pub fn compile(ast: &Ast, gc: &mut Gc) -> Result<*mut Obj, Vec<CompileError>> {
    let mut compiler = Compiler { gc, stack: vec![FnState::new(FnKind::Script, None)], classes: Vec::new(), errors: Vec::new() };

    for decl in &ast.body {
        let _ = compiler.declaration(decl);
    }

    let script = compiler.stack.pop().unwrap();
    if !compiler.errors.is_empty() {
        return Err(compiler.errors);
    }

    let mut chunk = script.chunk;
    chunk.write_op(OpCode::LoadNil, 0);
    chunk.write_op(OpCode::Return, 0);

    let function = ObjFunction { name: None, arity: 0, upvalue_count: 0, chunk };
    Ok(compiler.gc.alloc_function(function))
}

impl<'gc> Compiler<'gc> {
    // ---- small helpers over the current function state ----

    fn current(&self) -> &FnState {
        self.stack.last().unwrap()
    }

    fn current_mut(&mut self) -> &mut FnState {
        self.stack.last_mut().unwrap()
    }

    fn chunk_mut(&mut self) -> &mut Chunk {
        &mut self.current_mut().chunk
    }

    fn emit_op(&mut self, op: OpCode, line: u32) {
        self.chunk_mut().write_op(op, line);
    }

    fn emit_byte(&mut self, byte: u8, line: u32) {
        self.chunk_mut().write_byte(byte, line);
    }

    fn emit_op_byte(&mut self, op: OpCode, byte: u8, line: u32) {
        self.emit_op(op, line);
        self.emit_byte(byte, line);
    }

    fn error(&mut self, line: u32, message: impl Into<String>) {
        self.errors.push(CompileError::new(message, line));
    }

    fn intern_name(&mut self, name: &str) -> *mut Obj {
        self.gc.intern(name.as_bytes())
    }

    /// Interns `name` and adds it to the current chunk's constant pool,
    /// returning its index (the operand byte every global/property/method
    /// opcode carries).
    fn identifier_constant(&mut self, name: &str) -> u8 {
        let ptr = self.intern_name(name);
        let value = Value::object(ptr);
        let idx = self.chunk_mut().add_constant(value);
        if idx > u8::MAX as usize {
            self.error(0, "Too many constants in one chunk.");
            return 0;
        }
        idx as u8
    }

    fn emit_constant(&mut self, value: Value, line: u32) {
        let idx = self.chunk_mut().add_constant(value);
        if idx > u8::MAX as usize {
            self.error(line, "Too many constants in one chunk.");
            return;
        }
        self.emit_op_byte(OpCode::LoadConstant, idx as u8, line);
    }

    // ---- scope management ----

    fn begin_scope(&mut self) {
        self.current_mut().scope_depth += 1;
    }

    /// Pops every local declared at or below the scope being left,
    /// emitting `CLOSE_UPVALUE` for captured locals and a plain `POP`
    /// otherwise (spec.md §4.4's "frame return" contract, applied at
    /// block exit rather than only at function return).
    fn end_scope(&mut self, line: u32) {
        let closing_depth = self.current().scope_depth;
        self.current_mut().scope_depth -= 1;
        while let Some(local) = self.current().locals.last() {
            if local.depth < closing_depth {
                break;
            }
            let captured = local.is_captured;
            if captured {
                self.emit_op(OpCode::CloseUpvalue, line);
            } else {
                self.emit_op(OpCode::Pop, line);
            }
            self.current_mut().locals.pop();
        }
    }

    /// Unwinds the operand stack down to `target_depth` without actually
    /// removing the locals bookkeeping entries, for `break`/`continue`
    /// jumps that leave a scope early but don't end it.
    fn discard_locals_to(&mut self, target_depth: i32, line: u32) {
        let locals: Vec<bool> =
            self.current().locals.iter().rev().take_while(|l| l.depth > target_depth).map(|l| l.is_captured).collect();
        for captured in locals {
            if captured {
                self.emit_op(OpCode::CloseUpvalue, line);
            } else {
                self.emit_op(OpCode::Pop, line);
            }
        }
    }

    // ---- locals / upvalues / globals ----

    fn add_local(&mut self, name: String, line: u32) {
        if self.current().locals.len() >= MAX_LOCALS {
            self.error(line, "Too many local variables in function.");
            return;
        }
        let depth = self.current().scope_depth;
        for local in self.current().locals.iter().rev() {
            if local.depth != -1 && local.depth < depth {
                break;
            }
            if local.name == name {
                self.error(line, format!("Already a variable with this name ('{name}') in this scope."));
                return;
            }
        }
        self.current_mut().locals.push(Local { name, depth: -1, is_captured: false });
    }

    fn mark_initialized(&mut self) {
        if self.current().scope_depth == 0 {
            return;
        }
        let depth = self.current().scope_depth;
        if let Some(local) = self.current_mut().locals.last_mut() {
            local.depth = depth;
        }
    }

    /// Declares `name` as a local if inside a scope, otherwise leaves it
    /// for `define_variable` to register as a global.
    fn declare_variable(&mut self, name: &str, line: u32) {
        if self.current().scope_depth == 0 {
            return;
        }
        self.add_local(name.to_string(), line);
    }

    fn define_variable(&mut self, name_const: u8, line: u32) {
        if self.current().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op_byte(OpCode::DefineGlobal, name_const, line);
    }

    fn resolve_local_at(&mut self, idx: usize, name: &str, line: u32) -> Option<u8> {
        let locals = &self.stack[idx].locals;
        for (i, local) in locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    self.error(line, "Can't read local variable in its own initializer.");
                    return None;
                }
                return Some(i as u8);
            }
        }
        None
    }

    fn add_upvalue(&mut self, idx: usize, index: u8, is_local: bool) -> u8 {
        let upvalues = &self.stack[idx].upvalues;
        for (i, up) in upvalues.iter().enumerate() {
            if up.index == index && up.is_local == is_local {
                return i as u8;
            }
        }
        if upvalues.len() >= MAX_UPVALUES {
            self.error(0, "Too many closure variables in function.");
            return 0;
        }
        self.stack[idx].upvalues.push(UpvalueRef { index, is_local });
        (self.stack[idx].upvalues.len() - 1) as u8
    }

    fn resolve_upvalue(&mut self, idx: usize, name: &str, line: u32) -> Option<u8> {
        if idx == 0 {
            return None;
        }
        let enclosing = idx - 1;
        if let Some(slot) = self.resolve_local_at(enclosing, name, line) {
            self.stack[enclosing].locals[slot as usize].is_captured = true;
            return Some(self.add_upvalue(idx, slot, true));
        }
        if let Some(up) = self.resolve_upvalue(enclosing, name, line) {
            return Some(self.add_upvalue(idx, up, false));
        }
        None
    }

    fn resolve_variable(&mut self, name: &str, line: u32) -> VarLoc {
        let idx = self.stack.len() - 1;
        if let Some(slot) = self.resolve_local_at(idx, name, line) {
            return VarLoc::Local(slot);
        }
        if let Some(up) = self.resolve_upvalue(idx, name, line) {
            return VarLoc::Upvalue(up);
        }
        VarLoc::Global(self.identifier_constant(name))
    }

    fn load_named(&mut self, name: &str, line: u32) {
        match self.resolve_variable(name, line) {
            VarLoc::Local(slot) => self.emit_op_byte(OpCode::LoadLocal, slot, line),
            VarLoc::Upvalue(slot) => self.emit_op_byte(OpCode::LoadUpvalue, slot, line),
            VarLoc::Global(name_const) => self.emit_op_byte(OpCode::LoadGlobal, name_const, line),
        }
    }

    fn store_named(&mut self, name: &str, line: u32) {
        match self.resolve_variable(name, line) {
            VarLoc::Local(slot) => self.emit_op_byte(OpCode::StoreLocal, slot, line),
            VarLoc::Upvalue(slot) => self.emit_op_byte(OpCode::StoreUpvalue, slot, line),
            VarLoc::Global(name_const) => self.emit_op_byte(OpCode::StoreGlobal, name_const, line),
        }
    }

    // ---- declarations ----

    fn declaration(&mut self, decl: &Decl) -> CResult {
        match decl {
            Decl::Class { name, superclass, methods, line } => self.class_declaration(name, superclass, methods, *line),
            Decl::Function(f) => self.function_declaration(f),
            Decl::Variable { name, value, line } => self.var_declaration(name, value, *line),
            Decl::Import { path, alias, line } => self.import_declaration(path, alias, *line),
            Decl::Statement(s) => self.statement(s),
        }
    }

    fn var_declaration(&mut self, name: &str, value: &Option<Expr>, line: u32) -> CResult {
        self.declare_variable(name, line);
        match value {
            Some(expr) => self.expression(expr)?,
            None => self.emit_op(OpCode::LoadNil, line),
        }
        let name_const = if self.current().scope_depth == 0 { self.identifier_constant(name) } else { 0 };
        self.define_variable(name_const, line);
        Ok(())
    }

    fn function_declaration(&mut self, f: &NamedFunction) -> CResult {
        self.declare_variable(&f.name, f.line);
        if self.current().scope_depth > 0 {
            self.mark_initialized();
        }
        let name_const = self.identifier_constant(&f.name);
        self.function(&f.function, FnKind::Function, Some(f.name.clone()))?;
        self.define_variable(name_const, f.line);
        Ok(())
    }

    fn import_declaration(&mut self, path: &str, alias: &str, line: u32) -> CResult {
        self.declare_variable(alias, line);
        let path_value = {
            let ptr = self.intern_name(path);
            Value::object(ptr)
        };
        let path_const = self.chunk_mut().add_constant(path_value);
        if path_const > u8::MAX as usize {
            self.error(line, "Too many constants in one chunk.");
            return Err(());
        }
        self.emit_op_byte(OpCode::Import, path_const as u8, line);
        let name_const = if self.current().scope_depth == 0 { self.identifier_constant(alias) } else { 0 };
        self.define_variable(name_const, line);
        Ok(())
    }

    fn class_declaration(&mut self, name: &str, superclass: &Option<String>, methods: &[NamedFunction], line: u32) -> CResult {
        let name_const = self.identifier_constant(name);
        self.declare_variable(name, line);
        self.emit_op_byte(OpCode::Class, name_const, line);
        self.define_variable(name_const, line);

        let mut has_superclass = false;
        if let Some(super_name) = superclass {
            self.load_named(super_name, line);
            if super_name == name {
                self.error(line, "A class can't inherit from itself.");
            }
            self.begin_scope();
            self.add_local("super".to_string(), line);
            self.mark_initialized();
            self.load_named(name, line);
            self.emit_op(OpCode::Inherit, line);
            has_superclass = true;
        }

        self.load_named(name, line);
        self.classes.push(ClassCtx { has_superclass });

        for method in methods {
            self.method(method)?;
        }

        self.emit_op(OpCode::EndClass, line);
        self.classes.pop();

        if has_superclass {
            self.end_scope(line);
        }
        Ok(())
    }

    fn method(&mut self, m: &NamedFunction) -> CResult {
        let name_const = self.identifier_constant(&m.name);
        let kind = if m.name == "init" && !m.is_static { FnKind::Initializer } else { FnKind::Method };
        self.function(&m.function, kind, Some(m.name.clone()))?;
        if m.is_static {
            self.emit_op_byte(OpCode::StaticMethod, name_const, m.line);
        } else {
            self.emit_op_byte(OpCode::Method, name_const, m.line);
        }
        Ok(())
    }

    /// Compiles a nested function body in a fresh [`FnState`], then emits
    /// a `CLOSURE` in the *enclosing* chunk referencing it as a constant,
    /// followed by one `(is_local, index)` byte pair per captured upvalue
    /// (spec.md §4.4's `CLOSURE` contract).
    fn function(&mut self, node: &FunctionNode, kind: FnKind, name: Option<String>) -> CResult {
        self.stack.push(FnState::new(kind, name.clone()));
        self.begin_scope();

        for param in &node.params {
            if self.current().arity as usize >= MAX_ARGS {
                self.error(node.line, "Can't have more than 255 parameters.");
            }
            self.add_local(param.clone(), node.line);
            self.mark_initialized();
            self.current_mut().arity += 1;
        }

        match &node.body {
            FunctionBody::Block(decls) => {
                for d in decls {
                    let _ = self.declaration(d);
                }
                self.emit_return_epilogue(kind, node.line);
            }
            FunctionBody::Expression(expr) => {
                self.expression(expr)?;
                self.emit_op(OpCode::Return, node.line);
            }
        }

        let finished = self.stack.pop().unwrap();
        let name_ptr = finished.name.as_deref().map(|n| self.intern_name(n));
        let function = ObjFunction {
            name: name_ptr,
            arity: finished.arity,
            upvalue_count: finished.upvalues.len() as u8,
            chunk: finished.chunk,
        };
        let fn_ptr = self.gc.alloc_function(function);
        self.gc.push_root(Value::object(fn_ptr));

        let const_idx = self.chunk_mut().add_constant(Value::object(fn_ptr));
        if const_idx > u8::MAX as usize {
            self.error(node.line, "Too many constants in one chunk.");
        } else {
            self.emit_op_byte(OpCode::Closure, const_idx as u8, node.line);
            for up in &finished.upvalues {
                self.emit_byte(if up.is_local { 1 } else { 0 }, node.line);
                self.emit_byte(up.index, node.line);
            }
        }
        self.gc.pop_root();
        Ok(())
    }

    fn emit_return_epilogue(&mut self, kind: FnKind, line: u32) {
        if kind == FnKind::Initializer {
            self.emit_op_byte(OpCode::LoadLocal, 0, line);
        } else {
            self.emit_op(OpCode::LoadNil, line);
        }
        self.emit_op(OpCode::Return, line);
    }

    // ---- statements ----

    fn statement(&mut self, stmt: &Stmt) -> CResult {
        match stmt {
            Stmt::For { initializer, condition, increment, body } => self.for_statement(initializer, condition, increment, body),
            Stmt::ForIn { binding, iterable, body, line } => self.for_in_statement(binding, iterable, body, *line),
            Stmt::While { condition, body } => self.while_statement(condition, body),
            Stmt::Break { line } => self.break_statement(*line),
            Stmt::Continue { line } => self.continue_statement(*line),
            Stmt::When { control, entries, else_branch } => self.when_statement(control, entries, else_branch),
            Stmt::If { condition, then_branch, else_branch } => self.if_statement(condition, then_branch, else_branch),
            Stmt::Return { value, line } => self.return_statement(value, *line),
            Stmt::Print { value } => {
                let line = value.line();
                self.expression(value)?;
                self.emit_op(OpCode::Print, line);
                Ok(())
            }
            Stmt::Block(decls) => {
                self.begin_scope();
                for d in decls {
                    let _ = self.declaration(d);
                }
                self.end_scope(0);
                Ok(())
            }
            Stmt::Expression(expr) => {
                let line = expr.line();
                self.expression(expr)?;
                self.emit_op(OpCode::Pop, line);
                Ok(())
            }
        }
    }

    fn return_statement(&mut self, value: &Option<Expr>, line: u32) -> CResult {
        if self.stack.len() == 1 && self.current().kind == FnKind::Script {
            self.error(line, "Can't return from top-level code.");
        }
        match value {
            Some(expr) => {
                if self.current().kind == FnKind::Initializer {
                    self.error(line, "Can't return a value from an initializer.");
                }
                self.expression(expr)?;
                self.emit_op(OpCode::Return, line);
            }
            None => self.emit_return_epilogue(self.current().kind, line),
        }
        Ok(())
    }

    fn if_statement(&mut self, condition: &Expr, then_branch: &Stmt, else_branch: &Option<Box<Stmt>>) -> CResult {
        let line = condition.line();
        self.expression(condition)?;
        let then_jump = self.chunk_mut().emit_jump(OpCode::PopJumpIfFalse, line);
        self.statement(then_branch)?;
        if let Some(else_stmt) = else_branch {
            let else_jump = self.chunk_mut().emit_jump(OpCode::Jump, line);
            self.patch_jump(then_jump, line);
            self.statement(else_stmt)?;
            self.patch_jump(else_jump, line);
        } else {
            self.patch_jump(then_jump, line);
        }
        Ok(())
    }

    fn while_statement(&mut self, condition: &Expr, body: &Stmt) -> CResult {
        let line = condition.line();
        let loop_start = self.current().chunk.code.len();
        self.current_mut().loops.push(LoopCtx { continue_target: loop_start, scope_depth: self.current().scope_depth, break_jumps: Vec::new() });

        self.expression(condition)?;
        let exit_jump = self.chunk_mut().emit_jump(OpCode::PopJumpIfFalse, line);
        self.statement(body)?;
        self.emit_loop(loop_start, line);
        self.patch_jump(exit_jump, line);

        let ctx = self.current_mut().loops.pop().unwrap();
        for j in ctx.break_jumps {
            self.patch_jump(j, line);
        }
        Ok(())
    }

    fn for_statement(&mut self, initializer: &Option<Box<Decl>>, condition: &Option<Expr>, increment: &Option<Expr>, body: &Stmt) -> CResult {
        let line = body_line(body);
        self.begin_scope();
        if let Some(init) = initializer {
            self.declaration(init)?;
        }

        let mut loop_start = self.current().chunk.code.len();
        let exit_jump = match condition {
            Some(cond) => {
                self.expression(cond)?;
                Some(self.chunk_mut().emit_jump(OpCode::PopJumpIfFalse, cond.line()))
            }
            None => None,
        };

        if let Some(inc) = increment {
            let body_jump = self.chunk_mut().emit_jump(OpCode::Jump, line);
            let increment_start = self.current().chunk.code.len();
            self.expression(inc)?;
            self.emit_op(OpCode::Pop, inc.line());
            self.emit_loop(loop_start, line);
            loop_start = increment_start;
            self.patch_jump(body_jump, line);
        }

        self.current_mut().loops.push(LoopCtx { continue_target: loop_start, scope_depth: self.current().scope_depth, break_jumps: Vec::new() });
        self.statement(body)?;
        self.emit_loop(loop_start, line);

        if let Some(ej) = exit_jump {
            self.patch_jump(ej, line);
        }
        let ctx = self.current_mut().loops.pop().unwrap();
        for j in ctx.break_jumps {
            self.patch_jump(j, line);
        }
        self.end_scope(line);
        Ok(())
    }

    /// `for (x : iterable) body` desugars to the native iterator protocol
    /// SPEC_FULL.md §10 adds: call `.iterator()` once, then each pass of
    /// the loop calls `.next()` exactly once and destructures its
    /// two-element `[value, hasNext]` result, so a side-effecting iterator
    /// (a generator, a stream) only ever advances once per element.
    fn for_in_statement(&mut self, binding: &str, iterable: &Expr, body: &Stmt, line: u32) -> CResult {
        self.begin_scope();
        self.expression(iterable)?;
        let iterator_const = self.identifier_constant("iterator");
        self.emit_op_byte(OpCode::Invoke, iterator_const, line);
        self.emit_byte(0, line);
        self.add_local("@iter".to_string(), line);
        self.mark_initialized();
        let iter_slot = (self.current().locals.len() - 1) as u8;

        let loop_start = self.current().chunk.code.len();
        self.current_mut().loops.push(LoopCtx { continue_target: loop_start, scope_depth: self.current().scope_depth, break_jumps: Vec::new() });

        self.emit_op_byte(OpCode::LoadLocal, iter_slot, line);
        let next_const = self.identifier_constant("next");
        self.emit_op_byte(OpCode::Invoke, next_const, line);
        self.emit_byte(0, line);
        // stack: [pair]  (pair == [value, hasNext])
        self.emit_op(OpCode::Dup, line);
        self.emit_constant(Value::number(1.0), line);
        self.emit_op(OpCode::LoadSubscript, line);
        // stack: [pair, hasNext]
        let exit_jump = self.chunk_mut().emit_jump(OpCode::PopJumpIfFalse, line);
        // stack: [pair]
        self.emit_constant(Value::number(0.0), line);
        self.emit_op(OpCode::LoadSubscript, line);
        // stack: [value]

        self.begin_scope();
        self.add_local(binding.to_string(), line);
        self.mark_initialized();

        self.statement(body)?;
        self.end_scope(line);
        self.emit_loop(loop_start, line);
        self.patch_jump(exit_jump, line);
        // the exit jump lands here with `pair` still on the stack.
        self.emit_op(OpCode::Pop, line);

        let ctx = self.current_mut().loops.pop().unwrap();
        for j in ctx.break_jumps {
            self.patch_jump(j, line);
        }
        self.end_scope(line);
        Ok(())
    }

    fn break_statement(&mut self, line: u32) -> CResult {
        if self.current().loops.is_empty() {
            self.error(line, "Can't use 'break' outside of a loop.");
            return Err(());
        }
        let target_depth = self.current().loops.last().unwrap().scope_depth;
        self.discard_locals_to(target_depth, line);
        let jump = self.chunk_mut().emit_jump(OpCode::Jump, line);
        self.current_mut().loops.last_mut().unwrap().break_jumps.push(jump);
        Ok(())
    }

    fn continue_statement(&mut self, line: u32) -> CResult {
        if self.current().loops.is_empty() {
            self.error(line, "Can't use 'continue' outside of a loop.");
            return Err(());
        }
        let (target_depth, continue_target) = {
            let ctx = self.current().loops.last().unwrap();
            (ctx.scope_depth, ctx.continue_target)
        };
        self.discard_locals_to(target_depth, line);
        self.emit_loop(continue_target, line);
        Ok(())
    }

    /// `when (control) { is a, b: ... is c: ... else: ... }` lowers to a
    /// chain of `DUP`/compare/`POP_JUMP_IF_EQUAL` triads per case (spec.md
    /// §4.2, §4.3): the control value is duplicated for every comparison
    /// so the original survives until the final cleanup `POP`.
    fn when_statement(&mut self, control: &Expr, entries: &[crate::ast::WhenEntry], else_branch: &Option<Box<Stmt>>) -> CResult {
        let line = control.line();
        self.expression(control)?;

        let mut end_jumps = Vec::new();
        for entry in entries {
            let mut case_jumps = Vec::new();
            for case in &entry.cases {
                let cline = case.line();
                self.emit_op(OpCode::Dup, cline);
                self.expression(case)?;
                let jump = self.chunk_mut().emit_jump(OpCode::PopJumpIfEqual, cline);
                case_jumps.push(jump);
            }
            let skip_body = self.chunk_mut().emit_jump(OpCode::Jump, line);
            for j in case_jumps {
                self.patch_jump(j, line);
            }
            self.statement(&entry.body)?;
            end_jumps.push(self.chunk_mut().emit_jump(OpCode::Jump, line));
            self.patch_jump(skip_body, line);
        }

        if let Some(else_stmt) = else_branch {
            self.statement(else_stmt)?;
        }
        for j in end_jumps {
            self.patch_jump(j, line);
        }
        self.emit_op(OpCode::Pop, line);
        Ok(())
    }

    fn patch_jump(&mut self, offset: usize, line: u32) {
        if let Err(msg) = self.chunk_mut().patch_jump(offset) {
            self.error(line, msg);
        }
    }

    fn emit_loop(&mut self, loop_start: usize, line: u32) {
        if let Err(msg) = self.chunk_mut().emit_loop(loop_start, line) {
            self.error(line, msg);
        }
    }

    // ---- expressions ----

    fn expression(&mut self, expr: &Expr) -> CResult {
        match expr {
            Expr::Literal(lit) => self.literal(lit, expr.line()),
            Expr::Identifier { name, line, .. } => {
                self.load_named(name, *line);
                Ok(())
            }
            Expr::Property { object, name, safe, line, .. } => {
                self.expression(object)?;
                let name_const = self.identifier_constant(name);
                let op = if *safe { OpCode::LoadPropertySafe } else { OpCode::LoadProperty };
                self.emit_op_byte(op, name_const, *line);
                Ok(())
            }
            Expr::Subscript { object, index, safe, line, .. } => {
                self.expression(object)?;
                self.expression(index)?;
                let op = if *safe { OpCode::LoadSubscriptSafe } else { OpCode::LoadSubscript };
                self.emit_op(op, *line);
                Ok(())
            }
            Expr::Super { method, line } => self.super_get(method, *line),
            Expr::Call { callee, args, line } => self.call_expr(callee, args, *line),
            Expr::Assignment { target, value, line } => self.assignment(target, value, *line),
            Expr::CompoundAssignment { target, op, value, line } => self.compound_assignment(target, *op, value, *line),
            Expr::Logical { left, op, right, line } => self.logical(left, *op, right, *line),
            Expr::Conditional { condition, then_branch, else_branch, line } => self.conditional(condition, then_branch, else_branch, *line),
            Expr::Binary { left, op, right, line } => self.binary(left, *op, right, *line),
            Expr::Unary { op, operand, line } => self.unary(*op, operand, *line),
            Expr::PrefixIncDec { op, target, line } => self.prefix_inc_dec(*op, target, *line),
            Expr::PostfixIncDec { op, target, line } => self.postfix_inc_dec(*op, target, *line),
            Expr::Lambda { function, .. } => self.function(function, FnKind::Lambda, None),
            Expr::ListLiteral { items, line } => self.list_literal(items, *line),
            Expr::MapLiteral { entries, line } => self.map_literal(entries, *line),
            Expr::Interpolated { parts, line } => self.interpolated(parts, *line),
        }
    }

    fn literal(&mut self, lit: &Literal, line: u32) -> CResult {
        match lit {
            Literal::Number(n) => self.emit_constant(Value::number(*n), line),
            Literal::String(bytes) => {
                let ptr = self.gc.intern(bytes);
                self.emit_constant(Value::object(ptr), line);
            }
            Literal::True => self.emit_op(OpCode::LoadTrue, line),
            Literal::False => self.emit_op(OpCode::LoadFalse, line),
            Literal::Nil => self.emit_op(OpCode::LoadNil, line),
        }
        Ok(())
    }

    fn interpolated(&mut self, parts: &[InterpPart], line: u32) -> CResult {
        for part in parts {
            match part {
                InterpPart::Literal(bytes) => {
                    let ptr = self.gc.intern(bytes);
                    self.emit_constant(Value::object(ptr), line);
                }
                InterpPart::Expr(expr) => self.expression(expr)?,
            }
        }
        if parts.len() > u8::MAX as usize {
            self.error(line, "String interpolation has too many parts.");
            return Err(());
        }
        self.emit_op_byte(OpCode::BuildString, parts.len() as u8, line);
        Ok(())
    }

    fn list_literal(&mut self, items: &[Expr], line: u32) -> CResult {
        for item in items {
            self.expression(item)?;
        }
        if items.len() > u8::MAX as usize {
            self.error(line, "List literal has too many elements.");
            return Err(());
        }
        self.emit_op_byte(OpCode::List, items.len() as u8, line);
        Ok(())
    }

    fn map_literal(&mut self, entries: &[(Expr, Expr)], line: u32) -> CResult {
        for (key, value) in entries {
            self.expression(key)?;
            self.expression(value)?;
        }
        if entries.len() > u8::MAX as usize {
            self.error(line, "Map literal has too many entries.");
            return Err(());
        }
        self.emit_op_byte(OpCode::Map, entries.len() as u8, line);
        Ok(())
    }

    fn logical(&mut self, left: &Expr, op: LogicalOp, right: &Expr, line: u32) -> CResult {
        self.expression(left)?;
        match op {
            LogicalOp::And => {
                let end_jump = self.chunk_mut().emit_jump(OpCode::JumpIfFalse, line);
                self.emit_op(OpCode::Pop, line);
                self.expression(right)?;
                self.patch_jump(end_jump, line);
            }
            LogicalOp::Or => {
                let else_jump = self.chunk_mut().emit_jump(OpCode::JumpIfFalse, line);
                let end_jump = self.chunk_mut().emit_jump(OpCode::Jump, line);
                self.patch_jump(else_jump, line);
                self.emit_op(OpCode::Pop, line);
                self.expression(right)?;
                self.patch_jump(end_jump, line);
            }
        }
        Ok(())
    }

    fn conditional(&mut self, condition: &Expr, then_branch: &Expr, else_branch: &Expr, line: u32) -> CResult {
        self.expression(condition)?;
        let then_jump = self.chunk_mut().emit_jump(OpCode::PopJumpIfFalse, line);
        self.expression(then_branch)?;
        let end_jump = self.chunk_mut().emit_jump(OpCode::Jump, line);
        self.patch_jump(then_jump, line);
        self.expression(else_branch)?;
        self.patch_jump(end_jump, line);
        Ok(())
    }

    fn binary(&mut self, left: &Expr, op: BinaryOp, right: &Expr, line: u32) -> CResult {
        self.expression(left)?;
        self.expression(right)?;
        self.emit_op(binary_opcode(op), line);
        Ok(())
    }

    fn unary(&mut self, op: UnaryOp, operand: &Expr, line: u32) -> CResult {
        self.expression(operand)?;
        let opcode = match op {
            UnaryOp::Negate => OpCode::Negate,
            UnaryOp::Not => OpCode::Not,
            UnaryOp::BitwiseNot => OpCode::BitwiseNot,
        };
        self.emit_op(opcode, line);
        Ok(())
    }

    fn super_get(&mut self, method: &str, line: u32) -> CResult {
        if self.classes.is_empty() {
            self.error(line, "Can't use 'super' outside of a class.");
            return Err(());
        }
        if !self.classes.last().unwrap().has_superclass {
            self.error(line, "Can't use 'super' in a class with no superclass.");
            return Err(());
        }
        self.load_named("this", line);
        self.load_named("super", line);
        let name_const = self.identifier_constant(method);
        self.emit_op_byte(OpCode::GetSuper, name_const, line);
        Ok(())
    }

    fn call_expr(&mut self, callee: &Expr, args: &[Expr], line: u32) -> CResult {
        if args.len() > MAX_ARGS {
            self.error(line, "Can't have more than 255 arguments.");
            return Err(());
        }
        match callee {
            Expr::Property { object, name, safe, .. } => {
                self.expression(object)?;
                for arg in args {
                    self.expression(arg)?;
                }
                let name_const = self.identifier_constant(name);
                let op = if *safe { OpCode::InvokeSafe } else { OpCode::Invoke };
                self.emit_op_byte(op, name_const, line);
                self.emit_byte(args.len() as u8, line);
            }
            Expr::Super { method, .. } => {
                if self.classes.is_empty() {
                    self.error(line, "Can't use 'super' outside of a class.");
                    return Err(());
                }
                if !self.classes.last().unwrap().has_superclass {
                    self.error(line, "Can't use 'super' in a class with no superclass.");
                    return Err(());
                }
                self.load_named("this", line);
                for arg in args {
                    self.expression(arg)?;
                }
                self.load_named("super", line);
                let name_const = self.identifier_constant(method);
                self.emit_op_byte(OpCode::SuperInvoke, name_const, line);
                self.emit_byte(args.len() as u8, line);
            }
            _ => {
                self.expression(callee)?;
                for arg in args {
                    self.expression(arg)?;
                }
                self.emit_op_byte(OpCode::Call, args.len() as u8, line);
            }
        }
        Ok(())
    }

    fn assignment(&mut self, target: &Expr, value: &Expr, line: u32) -> CResult {
        match target {
            Expr::Identifier { name, .. } => {
                self.expression(value)?;
                self.store_named(name, line);
            }
            Expr::Property { object, name, safe, .. } => {
                self.expression(object)?;
                self.expression(value)?;
                let name_const = self.identifier_constant(name);
                let op = if *safe { OpCode::StorePropertySafe } else { OpCode::StoreProperty };
                self.emit_op_byte(op, name_const, line);
            }
            Expr::Subscript { object, index, safe, .. } => {
                self.expression(object)?;
                self.expression(index)?;
                self.expression(value)?;
                let op = if *safe { OpCode::StoreSubscriptSafe } else { OpCode::StoreSubscript };
                self.emit_op(op, line);
            }
            _ => {
                self.error(line, "Invalid assignment target.");
                return Err(());
            }
        }
        Ok(())
    }

    /// `target op= value` desugars to `target = target op value`, reading
    /// the receiver (and index, for subscripts) exactly once via `DUP`/
    /// `DUP_TWO` so a side-effecting receiver expression isn't evaluated
    /// twice (spec.md §4.3's stack-manipulation opcodes exist for exactly
    /// this).
    fn compound_assignment(&mut self, target: &Expr, op: BinaryOp, value: &Expr, line: u32) -> CResult {
        match target {
            Expr::Identifier { name, .. } => {
                self.load_named(name, line);
                self.expression(value)?;
                self.emit_op(binary_opcode(op), line);
                self.store_named(name, line);
            }
            Expr::Property { object, name, safe, .. } => {
                self.expression(object)?;
                self.emit_op(OpCode::Dup, line);
                let name_const = self.identifier_constant(name);
                let load_op = if *safe { OpCode::LoadPropertySafe } else { OpCode::LoadProperty };
                self.emit_op_byte(load_op, name_const, line);
                self.expression(value)?;
                self.emit_op(binary_opcode(op), line);
                let store_op = if *safe { OpCode::StorePropertySafe } else { OpCode::StoreProperty };
                self.emit_op_byte(store_op, name_const, line);
            }
            Expr::Subscript { object, index, safe, .. } => {
                self.expression(object)?;
                self.expression(index)?;
                self.emit_op(OpCode::DupTwo, line);
                let load_op = if *safe { OpCode::LoadSubscriptSafe } else { OpCode::LoadSubscript };
                self.emit_op(load_op, line);
                self.expression(value)?;
                self.emit_op(binary_opcode(op), line);
                let store_op = if *safe { OpCode::StoreSubscriptSafe } else { OpCode::StoreSubscript };
                self.emit_op(store_op, line);
            }
            _ => {
                self.error(line, "Invalid assignment target.");
                return Err(());
            }
        }
        Ok(())
    }

    /// `++target`/`--target`: load, bump in place, store — the stored
    /// (new) value is the expression's result.
    fn prefix_inc_dec(&mut self, op: IncDecOp, target: &Expr, line: u32) -> CResult {
        let bump = inc_dec_opcode(op);
        match target {
            Expr::Identifier { name, .. } => {
                self.load_named(name, line);
                self.emit_op(bump, line);
                self.store_named(name, line);
            }
            Expr::Property { object, name, safe, .. } => {
                self.expression(object)?;
                self.emit_op(OpCode::Dup, line);
                let name_const = self.identifier_constant(name);
                let load_op = if *safe { OpCode::LoadPropertySafe } else { OpCode::LoadProperty };
                self.emit_op_byte(load_op, name_const, line);
                self.emit_op(bump, line);
                let store_op = if *safe { OpCode::StorePropertySafe } else { OpCode::StoreProperty };
                self.emit_op_byte(store_op, name_const, line);
            }
            Expr::Subscript { object, index, safe, .. } => {
                self.expression(object)?;
                self.expression(index)?;
                self.emit_op(OpCode::DupTwo, line);
                let load_op = if *safe { OpCode::LoadSubscriptSafe } else { OpCode::LoadSubscript };
                self.emit_op(load_op, line);
                self.emit_op(bump, line);
                let store_op = if *safe { OpCode::StoreSubscriptSafe } else { OpCode::StoreSubscript };
                self.emit_op(store_op, line);
            }
            _ => {
                self.error(line, "Invalid increment/decrement target.");
                return Err(());
            }
        }
        Ok(())
    }

    /// `target++`/`target--`: the expression's result is the value
    /// *before* mutation, so a copy of it has to survive under the
    /// store operands. `SWAP_THREE`/`SWAP_FOUR` reorder the stack so the
    /// old value ends up buried beneath the store's operands rather than
    /// consumed by it (see compiler design notes in DESIGN.md).
    fn postfix_inc_dec(&mut self, op: IncDecOp, target: &Expr, line: u32) -> CResult {
        let bump = inc_dec_opcode(op);
        match target {
            Expr::Identifier { name, .. } => {
                self.load_named(name, line);
                self.emit_op(OpCode::Dup, line);
                self.emit_op(bump, line);
                self.store_named(name, line);
                self.emit_op(OpCode::Pop, line);
            }
            Expr::Property { object, name, safe, .. } => {
                self.expression(object)?;
                self.emit_op(OpCode::Dup, line);
                let name_const = self.identifier_constant(name);
                let load_op = if *safe { OpCode::LoadPropertySafe } else { OpCode::LoadProperty };
                self.emit_op_byte(load_op, name_const, line);
                self.emit_op(OpCode::Dup, line);
                self.emit_op(bump, line);
                // stack: [obj, old, new] -> [old, obj, new]
                self.emit_op(OpCode::SwapThree, line);
                let store_op = if *safe { OpCode::StorePropertySafe } else { OpCode::StoreProperty };
                self.emit_op_byte(store_op, name_const, line);
                self.emit_op(OpCode::Pop, line);
            }
            Expr::Subscript { object, index, safe, .. } => {
                self.expression(object)?;
                self.expression(index)?;
                self.emit_op(OpCode::DupTwo, line);
                let load_op = if *safe { OpCode::LoadSubscriptSafe } else { OpCode::LoadSubscript };
                self.emit_op(load_op, line);
                self.emit_op(OpCode::Dup, line);
                self.emit_op(bump, line);
                // stack: [obj, idx, old, new] -> [old, obj, idx, new]
                self.emit_op(OpCode::SwapFour, line);
                let store_op = if *safe { OpCode::StoreSubscriptSafe } else { OpCode::StoreSubscript };
                self.emit_op(store_op, line);
                self.emit_op(OpCode::Pop, line);
            }
            _ => {
                self.error(line, "Invalid increment/decrement target.");
                return Err(());
            }
        }
        Ok(())
    }
}

fn binary_opcode(op: BinaryOp) -> OpCode {
    match op {
        BinaryOp::Add => OpCode::Add,
        BinaryOp::Subtract => OpCode::Subtract,
        BinaryOp::Multiply => OpCode::Multiply,
        BinaryOp::Divide => OpCode::Divide,
        BinaryOp::Modulo => OpCode::Modulo,
        BinaryOp::Power => OpCode::Power,
        BinaryOp::Equal => OpCode::Equal,
        BinaryOp::NotEqual => OpCode::NotEqual,
        BinaryOp::Greater => OpCode::Greater,
        BinaryOp::GreaterEqual => OpCode::GreaterEqual,
        BinaryOp::Less => OpCode::Less,
        BinaryOp::LessEqual => OpCode::LessEqual,
        BinaryOp::BitwiseAnd => OpCode::BitwiseAnd,
        BinaryOp::BitwiseOr => OpCode::BitwiseOr,
        BinaryOp::BitwiseXor => OpCode::BitwiseXor,
        BinaryOp::ShiftLeft => OpCode::BitwiseLeftShift,
        BinaryOp::ShiftRight => OpCode::BitwiseRightShift,
    }
}

fn inc_dec_opcode(op: IncDecOp) -> OpCode {
    match op {
        IncDecOp::Increment => OpCode::Inc,
        IncDecOp::Decrement => OpCode::Dec,
    }
}

fn body_line(stmt: &Stmt) -> u32 {
    match stmt {
        Stmt::Expression(e) => e.line(),
        Stmt::Print { value } => value.line(),
        _ => 0,
    }
}
