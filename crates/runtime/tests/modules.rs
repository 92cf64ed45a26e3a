//! `import "path" as Name;` module semantics (SPEC_FULL.md §10): a module's
//! top-level globals become the fields of the bound alias, repeated imports
//! of the same path are cached, and import cycles are rejected.

use std::io::Write as _;

use ember_runtime::{GcConfig, InterpretResult, Vm};

struct SharedWriter(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);
impl std::io::Write for SharedWriter {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(data);
        Ok(data.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn run(source: &str) -> (InterpretResult, String) {
    let buf = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut vm = Vm::with_writer(GcConfig::default(), Box::new(SharedWriter(buf.clone())));
    let result = vm.interpret(source);
    let output = String::from_utf8(buf.lock().unwrap().clone()).unwrap();
    (result, output)
}

fn write_module(dir: &tempfile::TempDir, name: &str, source: &str) -> String {
    let path = dir.path().join(name);
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(source.as_bytes()).unwrap();
    path.to_str().unwrap().replace('\\', "/")
}

#[test]
fn imported_globals_become_fields_of_the_alias() {
    let dir = tempfile::tempdir().unwrap();
    let math_path = write_module(
        &dir,
        "math.ember",
        r#"
        fun square(n) { return n * n; }
        var PI = 3;
        "#,
    );
    let (result, out) = run(&format!(
        r#"
        import "{math_path}" as Math;
        print Math.square(4);
        print Math.PI;
        "#
    ));
    assert!(matches!(result, InterpretResult::Ok), "expected OK");
    assert_eq!(out, "16\n3\n");
}

#[test]
fn importing_the_same_path_twice_reuses_the_cached_module() {
    let dir = tempfile::tempdir().unwrap();
    let counter_path = write_module(
        &dir,
        "counter.ember",
        r#"
        var calls = 0;
        fun bump() { calls = calls + 1; return calls; }
        "#,
    );
    let (result, out) = run(&format!(
        r#"
        import "{counter_path}" as A;
        import "{counter_path}" as B;
        print A.bump();
        print B.bump();
        "#
    ));
    assert!(matches!(result, InterpretResult::Ok), "expected OK");
    // A and B are the same cached module, so its `calls` state is shared.
    assert_eq!(out, "1\n2\n");
}

#[test]
fn circular_imports_are_a_runtime_error() {
    let dir = tempfile::tempdir().unwrap();
    let a_path = dir.path().join("a.ember").to_str().unwrap().replace('\\', "/");
    let b_path = dir.path().join("b.ember").to_str().unwrap().replace('\\', "/");
    std::fs::write(&a_path, format!(r#"import "{b_path}" as B;"#)).unwrap();
    std::fs::write(&b_path, format!(r#"import "{a_path}" as A;"#)).unwrap();

    let (result, _) = run(&format!(r#"import "{a_path}" as A;"#));
    match result {
        InterpretResult::RuntimeError(e) => assert!(e.message.contains("Circular import")),
        InterpretResult::Ok => panic!("expected a circular import error, got Ok"),
        InterpretResult::CompileError(errors) => {
            panic!("expected a circular import error, got compile errors: {errors:?}")
        }
    }
}

#[test]
fn importing_a_missing_file_is_a_runtime_error() {
    let (result, _) = run(r#"import "/no/such/path/does/not/exist.ember" as X;"#);
    match result {
        InterpretResult::RuntimeError(e) => assert!(e.message.contains("Cannot read module")),
        InterpretResult::Ok => panic!("expected a runtime error, got Ok"),
        InterpretResult::CompileError(errors) => {
            panic!("expected a runtime error, got compile errors: {errors:?}")
        }
    }
}
