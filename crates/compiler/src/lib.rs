//! Scanner, parser, and single-pass bytecode compiler for Ember
//! (spec.md §1, §4.2). Ties `scanner` -> `parser` -> `compiler` into one
//! [`compile`] entry point that the runtime and CLI call; nothing outside
//! this crate needs to see tokens or the AST.

pub mod ast;
pub mod compiler;
pub mod error;
pub mod parser;
pub mod scanner;
pub mod token;

use ember_core::{Gc, Obj};
use error::CompileError;

/// Scans, parses, and compiles `source` into a top-level script function
/// ready for `ember-runtime` to call. All diagnostics from every stage are
/// collected before returning rather than stopping at the first.
pub fn compile(source: &str, gc: &mut Gc) -> Result<*mut Obj, Vec<CompileError>> {
    let ast = parser::parse(source)?;
    compiler::compile(&ast, gc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_a_trivial_script() {
        let mut gc = Gc::new();
        let result = compile("print 1 + 2;", &mut gc);
        assert!(result.is_ok());
    }

    #[test]
    fn reports_parse_errors_without_panicking() {
        let mut gc = Gc::new();
        let result = compile("var = ;", &mut gc);
        assert!(result.is_err());
    }

    #[test]
    fn reports_top_level_return_as_a_compile_error() {
        let mut gc = Gc::new();
        let result = compile("return 1;", &mut gc);
        assert!(result.is_err());
    }
}
