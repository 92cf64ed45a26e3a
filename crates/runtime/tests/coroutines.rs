//! `Coroutine`/`yield`/`resume`/`status` semantics (SPEC_FULL.md §10).

use ember_runtime::{GcConfig, InterpretResult, Vm};

fn stdout_of(source: &str) -> String {
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
    assert!(matches!(result, InterpretResult::Ok), "expected OK for: {source}");
    String::from_utf8(buf.lock().unwrap().clone()).unwrap()
}

#[test]
fn resume_runs_up_to_the_first_yield_and_back() {
    let out = stdout_of(
        r#"
        fun gen() {
            print "start";
            yield(1);
            print "middle";
            yield(2);
            print "end";
            return 3;
        }
        var co = Coroutine(gen);
        print co.resume();
        print co.resume();
        print co.resume();
        "#,
    );
    assert_eq!(out, "start\n1\nmiddle\n2\nend\n3\n");
}

#[test]
fn status_reports_lifecycle() {
    let out = stdout_of(
        r#"
        fun gen() { yield(1); return 2; }
        var co = Coroutine(gen);
        print co.status();
        co.resume();
        print co.status();
        co.resume();
        print co.status();
        "#,
    );
    assert_eq!(out, "not_started\nsuspended\ndone\n");
}

#[test]
fn resume_argument_becomes_the_yield_expressions_value() {
    let out = stdout_of(
        r#"
        fun echo() {
            var first = yield(nil);
            print first;
            var second = yield(nil);
            print second;
        }
        var co = Coroutine(echo);
        co.resume();
        co.resume("a");
        co.resume("b");
        "#,
    );
    assert_eq!(out, "a\nb\n");
}

#[test]
fn resuming_a_finished_coroutine_is_a_runtime_error() {
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
    let mut vm = Vm::with_writer(GcConfig::default(), Box::new(SharedWriter(buf)));
    let result = vm.interpret(
        r#"
        fun gen() { return 1; }
        var co = Coroutine(gen);
        co.resume();
        co.resume();
        "#,
    );
    match result {
        InterpretResult::RuntimeError(e) => {
            assert!(e.message.contains("finished"));
        }
        InterpretResult::Ok => panic!("expected a runtime error, got Ok"),
        InterpretResult::CompileError(errors) => {
            panic!("expected a runtime error, got compile errors: {errors:?}")
        }
    }
}

#[test]
fn independent_coroutines_keep_independent_suspended_state() {
    let out = stdout_of(
        r#"
        fun counter() {
            var i = 0;
            while (true) {
                yield(i);
                i = i + 1;
            }
        }
        var a = Coroutine(counter);
        var b = Coroutine(counter);
        print a.resume();
        print a.resume();
        print b.resume();
        print a.resume();
        print b.resume();
        "#,
    );
    assert_eq!(out, "0\n1\n0\n2\n1\n");
}
