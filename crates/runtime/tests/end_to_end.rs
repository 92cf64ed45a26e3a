//! Concrete end-to-end scenarios, checking both stdout and exit status.

use ember_runtime::{GcConfig, InterpretResult, Vm};

fn run(source: &str) -> (InterpretResult, String) {
    let buf = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
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
    let mut vm = Vm::with_writer(GcConfig::default(), Box::new(SharedWriter(buf.clone())));
    let result = vm.interpret(source);
    let output = String::from_utf8(buf.lock().unwrap().clone()).unwrap();
    (result, output)
}

fn assert_stdout(source: &str, expected: &str) {
    let (result, output) = run(source);
    assert!(matches!(result, InterpretResult::Ok), "expected OK, got error for: {source}");
    assert_eq!(output, expected);
}

#[test]
fn arithmetic_precedence() {
    assert_stdout("print 1 + 2 * 3;", "7\n");
}

#[test]
fn string_concatenation_in_a_loop() {
    assert_stdout(
        r#"var s = "a"; for (var i=0;i<3;i=i+1) s = s + "b"; print s;"#,
        "abbb\n",
    );
}

#[test]
fn recursive_fibonacci() {
    assert_stdout(
        "fun fib(n){ if (n<2) return n; return fib(n-1)+fib(n-2);} print fib(10);",
        "55\n",
    );
}

#[test]
fn class_init_and_method() {
    assert_stdout(
        r#"class Greeter{ init(w){ this.w=w; } hi(){ return "hi "+this.w;} } print Greeter("world").hi();"#,
        "hi world\n",
    );
}

#[test]
fn closure_over_local_counter() {
    assert_stdout(
        "var c = 0; fun inc(){ c = c+1; return c;} print inc(); print inc(); print inc();",
        "1\n2\n3\n",
    );
}

#[test]
fn list_add_and_length() {
    assert_stdout("var a = []; a.add(1); a.add(2); print a.length();", "2\n");
}

#[test]
fn runtime_error_reports_line_and_exits_70() {
    let (result, _) = run(r#"print "x" - 1;"#);
    match result {
        InterpretResult::RuntimeError(e) => {
            assert_eq!(e.line, 1);
            assert_eq!(e.message, "Operands must be numbers");
        }
        _ => panic!("expected a runtime error"),
    }
}

#[test]
fn falsiness_matches_spec() {
    assert_stdout(
        r#"
        print !nil;
        print !false;
        print !0;
        print !"";
        print ![];
        print !{};
        "#,
        "true\ntrue\nfalse\nfalse\nfalse\nfalse\n",
    );
}
