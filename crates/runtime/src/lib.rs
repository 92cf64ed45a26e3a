//! Ember Runtime: the bytecode VM loop, its native standard library,
//! runtime diagnostics, and the GC tuning knobs `ember-cli` exposes
//! (spec.md §4.4-§4.6, §10).

pub mod config;
pub mod error;
pub mod natives;
pub mod vm;

pub use config::GcConfig;
pub use ember_compiler::error::CompileError;
pub use error::{FrameInfo, RuntimeError};
pub use vm::{InterpretResult, Signal, Vm, VmResult};

/// Compiles and runs `source` with default GC settings, the shorthand
/// `ember-cli`'s one-shot file mode calls.
pub fn interpret(source: &str) -> InterpretResult {
    Vm::new().interpret(source)
}
