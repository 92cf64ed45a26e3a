//! Compile-time diagnostics.
//!
//! One [`CompileError`] per reported lexical/syntactic/semantic problem
//! (spec.md §7); the parser and compiler both accumulate these into a
//! `Vec` rather than stopping at the first, synchronizing at the next
//! statement boundary. Hand-rolled `enum` + `Display`, matching
//! `examples/navicore-cem3/crates/compiler/src/codegen/error.rs`'s
//! `CodeGenError` rather than reaching for `thiserror`.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    pub message: String,
    pub line: u32,
}

impl CompileError {
    pub fn new(message: impl Into<String>, line: u32) -> Self {
        CompileError { message: message.into(), line }
    }
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[Line {}] Error: {}", self.line, self.message)
    }
}

impl std::error::Error for CompileError {}
