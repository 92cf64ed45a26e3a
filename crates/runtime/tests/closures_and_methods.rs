//! Closure capture, upvalue closing, and method-resolution-order
//! invariants (spec.md §8 items 2-4).

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
fn independent_closures_have_independent_state() {
    let out = stdout_of(
        r#"
        fun make(){ var c=0; fun inc(){ c=c+1; return c;} return inc;}
        var a = make();
        var b = make();
        print a();
        print a();
        print b();
        print a();
        "#,
    );
    assert_eq!(out, "1\n2\n1\n3\n");
}

#[test]
fn upvalue_survives_enclosing_frame_reclamation() {
    let out = stdout_of(
        r#"
        fun make(){
            var x = "kept";
            fun get(){ return x; }
            return get;
        }
        var g = make();
        // make()'s frame has long since returned and been reclaimed by here.
        print g();
        print g();
        "#,
    );
    assert_eq!(out, "kept\nkept\n");
}

#[test]
fn subclass_overrides_but_inherits_and_super_reaches_parent() {
    let out = stdout_of(
        r#"
        class A {
            m() { return "A.m"; }
            n() { return "A.n"; }
        }
        class B < A {
            m() { return "B.m"; }
            callSuper() { return super.m(); }
        }
        var b = B();
        print b.m();
        print b.n();
        print b.callSuper();
        "#,
    );
    assert_eq!(out, "B.m\nA.n\nA.m\n");
}

#[test]
fn string_equality_is_interned_identity() {
    let out = stdout_of(
        r#"
        var a = "hello" + "";
        var b = "hel" + "lo";
        print a == b;
        "#,
    );
    assert_eq!(out, "true\n");
}
