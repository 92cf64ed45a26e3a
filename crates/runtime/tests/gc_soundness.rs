//! GC soundness under stress collection (spec.md §8 item 5):
//! reachable values keep reading and calling correctly no matter how
//! often a collection interleaves their construction.

use ember_runtime::GcConfig;
use serial_test::serial;

fn run_ok(source: &str, config: GcConfig) {
    let mut vm = ember_runtime::Vm::with_config(config);
    match vm.interpret(source) {
        ember_runtime::InterpretResult::Ok => {}
        ember_runtime::InterpretResult::CompileError(errors) => {
            panic!("compile error: {errors:?}")
        }
        ember_runtime::InterpretResult::RuntimeError(e) => panic!("runtime error: {e}"),
    }
}

#[test]
#[serial]
fn stress_gc_survives_nested_allocation() {
    let config = GcConfig { stress_gc: true, gc_initial_threshold_bytes: 1 };
    run_ok(
        r#"
        class Node {
            init(v) { this.value = v; this.children = []; }
            addChild(c) { this.children.add(c); }
        }
        fun buildTree(depth) {
            var n = Node(depth);
            if (depth > 0) {
                n.addChild(buildTree(depth - 1));
                n.addChild(buildTree(depth - 1));
            }
            return n;
        }
        var root = buildTree(8);
        print root.value;

        var m = {};
        for (var i = 0; i < 200; i = i + 1) {
            m["key" + String(i)] = [i, i * 2, "val" + String(i)];
        }
        print m.length();

        var closures = [];
        fun makeCounter(start) {
            var c = start;
            fun bump() { c = c + 1; return c; }
            return bump;
        }
        for (var i = 0; i < 50; i = i + 1) {
            closures.add(makeCounter(i));
        }
        var total = 0;
        for (c : closures) {
            total = total + c();
        }
        print total;
        "#,
        config,
    );
}

#[test]
#[serial]
fn stress_gc_via_env_var() {
    std::env::set_var("EMBER_STRESS_GC", "1");
    std::env::set_var("EMBER_GC_THRESHOLD", "1");
    let config = GcConfig::default().apply_env(|k| std::env::var(k).ok());
    assert!(config.stress_gc);
    run_ok(r#"var xs = []; for (var i=0;i<100;i=i+1) xs.add("s" + String(i)); print xs.length();"#, config);
    std::env::remove_var("EMBER_STRESS_GC");
    std::env::remove_var("EMBER_GC_THRESHOLD");
}

#[test]
#[serial]
fn unreferenced_intermediate_strings_do_not_corrupt_later_reads() {
    let config = GcConfig { stress_gc: true, gc_initial_threshold_bytes: 1 };
    run_ok(
        r#"
        fun scratch() {
            var i = 0;
            while (i < 500) {
                var throwaway = "temp" + String(i);
                i = i + 1;
            }
        }
        scratch();
        var kept = "still here";
        scratch();
        print kept;
        "#,
        config,
    );
}
