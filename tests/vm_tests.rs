// End-to-end scenario tests driving the compiler and VM as a black box,
// one source string in, one printed transcript and result code out.

use ruffvm::vm::{InterpretResult, VM};
use std::io::Write;
use std::sync::{Arc, Mutex};

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn run(src: &str) -> (InterpretResult, String) {
    let shared = SharedBuf::default();
    let mut vm = VM::with_output(Box::new(shared.clone()));
    let result = vm.interpret(src);
    let out = String::from_utf8(shared.0.lock().unwrap().clone()).unwrap();
    (result, out)
}

#[test]
fn closure_counter() {
    let (result, out) = run(
        r#"
        fun makeCounter() { var i = 0; fun c() { i = i + 1; return i; } return c; }
        var c = makeCounter(); print c(); print c(); print c();
    "#,
    );
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(out, "1\n2\n3\n");
}

#[test]
fn class_with_init_and_method() {
    let (result, out) = run(
        r#"
        class Greeter { init(n) { this.name = n; } hello() { print "hi " + this.name; } }
        Greeter("world").hello();
    "#,
    );
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(out, "hi world\n");
}

#[test]
fn string_concat_with_integer_coercion() {
    let (result, out) = run(r#"print "n=" + 42;"#);
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(out, "n=42\n");
}

#[test]
fn match_with_range_pattern() {
    let (result, out) = run(r#"match (7) { 1..5 => print "lo"; 6..10 => print "hi"; _ => print "?"; }"#);
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(out, "hi\n");
}

#[test]
fn fib() {
    let (result, out) = run(r#"fun fib(n){ if (n<2) return n; return fib(n-1)+fib(n-2); } print fib(10);"#);
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(out, "55\n");
}

#[test]
fn runtime_arity_error_aborts_with_runtime_error() {
    let (result, out) = run(r#"fun f(a,b){} f(1);"#);
    assert_eq!(result, InterpretResult::RuntimeError);
    // The arity mismatch is a compile-time argument-count check for a known
    // function; the diagnostic itself goes to stderr (see errors.rs), not
    // the `print` transcript captured here.
    assert_eq!(out, "");
}

#[test]
fn and_or_short_circuit_skips_the_right_operand() {
    let (result, out) = run(
        r#"
        fun boom() { print "evaluated"; return true; }
        print false and boom();
        print true or boom();
    "#,
    );
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(out, "false\ntrue\n");
}

#[test]
fn for_while_and_if_agree_on_a_running_total() {
    let (result, out) = run(
        r#"
        var total = 0;
        for (var i = 0; i < 5; i = i + 1) { total = total + i; }
        var j = 0;
        while (j < 5) { if (j == 2) { total = total + 10; } j = j + 1; }
        print total;
    "#,
    );
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(out, "20\n");
}
