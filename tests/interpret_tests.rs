// Integration tests for the Cinder interpreter.
//
// Each test feeds a complete program through Vm::interpret and checks what
// `print` wrote, or which error class came back. The VM writes program
// output through a swappable sink, so the tests capture it without touching
// the process's real stdout.

use std::io::Write;
use std::sync::{Arc, Mutex};

use cinder::errors::InterpretError;
use cinder::scanner::Dialect;
use cinder::vm::Vm;

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).expect("program output was not UTF-8")
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn run_configured(
    source: &str,
    dialect: Dialect,
    stress: bool,
) -> (String, Result<(), InterpretError>) {
    let buf = SharedBuf::default();
    let mut vm = Vm::with_output(dialect, Box::new(buf.clone()));
    if stress {
        vm.heap_mut().set_stress(true);
    }
    let result = vm.interpret(source);
    (buf.contents(), result)
}

fn run(source: &str) -> (String, Result<(), InterpretError>) {
    run_configured(source, Dialect::Standard, false)
}

fn output_of(source: &str) -> String {
    let (output, result) = run(source);
    assert_eq!(result, Ok(()), "program failed: {:?}\nsource: {}", result, source);
    output
}

// === Expressions and printing ===

#[test]
fn arithmetic_precedence() {
    assert_eq!(output_of("print 1 + 2 * 3;"), "7\n");
    assert_eq!(output_of("print (1 + 2) * 3;"), "9\n");
    assert_eq!(output_of("print 10 / 4;"), "2.5\n");
    assert_eq!(output_of("print -(3 - 5);"), "2\n");
}

#[test]
fn literals_print_as_keywords() {
    assert_eq!(output_of("print nil; print true; print false;"), "nil\ntrue\nfalse\n");
}

#[test]
fn truthiness_follows_nil_and_false_only() {
    assert_eq!(output_of("print !nil;"), "true\n");
    assert_eq!(output_of("print !0;"), "false\n");
    assert_eq!(output_of("print !\"\";"), "false\n");
}

#[test]
fn comparisons_and_equality() {
    let source = "print 1 < 2; print 2 <= 2; print 3 > 4; print 1 >= 1; \
                  print 1 == 1.0; print nil == nil; print nil == false;";
    assert_eq!(output_of(source), "true\ntrue\nfalse\ntrue\ntrue\ntrue\nfalse\n");
}

#[test]
fn interned_strings_compare_equal_by_content() {
    assert_eq!(output_of("var a = \"foo\"; var b = \"foo\"; print a == b;"), "true\n");
    assert_eq!(output_of("print \"foo\" == \"bar\";"), "false\n");
    // Built at runtime from different pieces, still the same string.
    assert_eq!(output_of("print \"ab\" + \"c\" == \"a\" + \"bc\";"), "true\n");
}

#[test]
fn string_concatenation() {
    assert_eq!(output_of("print \"foo\" + \"bar\";"), "foobar\n");
    let (_, result) = run("print \"foo\" + 1;");
    assert_eq!(result, Err(InterpretError::Runtime));
}

#[test]
fn logical_operators_short_circuit_to_operand_values() {
    assert_eq!(output_of("print true and 1;"), "1\n");
    assert_eq!(output_of("print false and 1;"), "false\n");
    assert_eq!(output_of("print nil or \"fallback\";"), "fallback\n");
    assert_eq!(output_of("print 2 or 3;"), "2\n");
}

// === Statements, scoping, control flow ===

#[test]
fn var_without_initializer_is_nil() {
    assert_eq!(output_of("var a; print a;"), "nil\n");
}

#[test]
fn locals_shadow_and_unwind() {
    let source = "var a = \"global\"; { var a = \"local\"; print a; } print a;";
    assert_eq!(output_of(source), "local\nglobal\n");
}

#[test]
fn if_else_branches() {
    assert_eq!(output_of("if (1 < 2) print \"yes\"; else print \"no\";"), "yes\n");
    assert_eq!(output_of("if (1 > 2) print \"yes\"; else print \"no\";"), "no\n");
    assert_eq!(output_of("if (false) print \"skipped\";"), "");
}

#[test]
fn while_loop_accumulates() {
    let source = "var sum = 0; var i = 1; while (i <= 4) { sum = sum + i; i = i + 1; } print sum;";
    assert_eq!(output_of(source), "10\n");
}

#[test]
fn for_loop_with_all_clauses() {
    let source = "var s = \"\"; for (var i = 0; i < 3; i = i + 1) s = s + \"x\"; print s;";
    assert_eq!(output_of(source), "xxx\n");
}

#[test]
fn for_loop_clauses_are_optional() {
    // No increment clause.
    let source = "for (var i = 0; i < 2;) { i = i + 1; } print \"ok\";";
    assert_eq!(output_of(source), "ok\n");
    // No initializer.
    let source = "var i = 3; for (; i > 0; i = i - 1) print i;";
    assert_eq!(output_of(source), "3\n2\n1\n");
}

// === Functions and closures ===

#[test]
fn function_calls_and_returns() {
    let source = "fun add(a, b) { return a + b; } print add(add(1, 2), 3);";
    assert_eq!(output_of(source), "6\n");
}

#[test]
fn function_without_return_yields_nil() {
    assert_eq!(output_of("fun noop() {} print noop();"), "nil\n");
}

#[test]
fn functions_print_by_name() {
    assert_eq!(output_of("fun f() {} print f;"), "<fn f>\n");
    assert_eq!(output_of("print clock;"), "<native fn>\n");
}

#[test]
fn recursion_by_name_works_inside_own_body() {
    let source = "fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); } print fib(10);";
    assert_eq!(output_of(source), "55\n");
}

#[test]
fn closure_captures_argument() {
    let source = "fun make(x) { fun inner() { return x; } return inner; } \
                  var f = make(42); print f();";
    assert_eq!(output_of(source), "42\n");
}

#[test]
fn shared_upvalue_survives_return() {
    let source = "fun counter() { var n = 0; fun inc() { n = n + 1; return n; } return inc; } \
                  var c = counter(); print c(); print c(); print c();";
    assert_eq!(output_of(source), "1\n2\n3\n");
}

#[test]
fn two_closures_share_one_upvalue() {
    let source = "fun pair() { var n = 0; fun bump() { n = n + 1; } fun read() { return n; } \
                  bump(); bump(); print read(); }
                  pair();";
    assert_eq!(output_of(source), "2\n");
}

#[test]
fn closed_upvalue_sees_last_write_before_scope_exit() {
    let source = "var f; { var i = 1; fun g() { print i; } f = g; i = 2; } f();";
    assert_eq!(output_of(source), "2\n");
}

// === Natives ===

#[test]
fn clock_returns_nonnegative_seconds() {
    assert_eq!(output_of("print clock() >= 0;"), "true\n");
}

#[test]
fn combine_concatenates_strings() {
    assert_eq!(output_of("print combine(\"a\", \"b\", \"c\");"), "abc\n");
    let (_, result) = run("combine(1);");
    assert_eq!(result, Err(InterpretError::Runtime));
}

// === Errors ===

#[test]
fn compile_errors_return_no_output() {
    for source in [
        "print 1",               // missing semicolon
        "var 1 = 2;",            // bad variable name
        "a + b = c;",            // invalid assignment target
        "return 1;",             // return at top level
        "{ var a = a; }",        // read in own initializer
        "fun f(a, a) {}",        // duplicate parameter in one scope
    ] {
        let (output, result) = run(source);
        assert_eq!(result, Err(InterpretError::Compile), "expected compile error: {}", source);
        assert_eq!(output, "");
    }
}

#[test]
fn runtime_type_errors() {
    for source in [
        "print -\"s\";",
        "print 1 < \"s\";",
        "print nil + 1;",
        "var x = 1; x();",
        "print missing;",
        "missing = 1;",
    ] {
        let (_, result) = run(source);
        assert_eq!(result, Err(InterpretError::Runtime), "expected runtime error: {}", source);
    }
}

#[test]
fn wrong_arity_is_a_runtime_error() {
    let (_, result) = run("fun f(a) { return a; } f(1, 2);");
    assert_eq!(result, Err(InterpretError::Runtime));
}

#[test]
fn unbounded_recursion_overflows_the_frame_stack() {
    let (output, result) = run("fun f() { return f(); } f();");
    assert_eq!(result, Err(InterpretError::Runtime));
    assert_eq!(output, "");
}

#[test]
fn output_before_a_runtime_error_is_kept() {
    let (output, result) = run("print \"before\"; print missing;");
    assert_eq!(result, Err(InterpretError::Runtime));
    assert_eq!(output, "before\n");
}

// === Dialects ===

#[test]
fn natural_dialect_runs_end_to_end() {
    let source = "action double(n) { give n * 2; } store x is double(21); say x; say x matches 42;";
    let (output, result) = run_configured(source, Dialect::Natural, false);
    assert_eq!(result, Ok(()));
    assert_eq!(output, "42\ntrue\n");
}

#[test]
fn casual_dialect_runs_end_to_end() {
    let source = "var i = 0; do (i < 3) { print i; i = i + 1; } print 6 divide 2 issameas 3;";
    let (output, result) = run_configured(source, Dialect::Casual, false);
    assert_eq!(result, Ok(()));
    assert_eq!(output, "0\n1\n2\ntrue\n");
}

#[test]
fn dialect_spellings_are_plain_identifiers_elsewhere() {
    // In the standard dialect the natural spellings are ordinary names.
    let source = "var say = 1; var give = 2; print say + give;";
    assert_eq!(output_of(source), "3\n");
}

#[test]
fn reserved_howbig_is_rejected() {
    let (_, result) = run_configured("print howbig(1);", Dialect::Casual, false);
    assert_eq!(result, Err(InterpretError::Compile));
}

// === Garbage collector ===

#[test]
fn stress_collection_does_not_change_output() {
    let source = "fun counter() { var n = 0; fun inc() { n = n + 1; return n; } return inc; } \
                  var c = counter(); \
                  var s = \"\"; \
                  for (var i = 0; i < 20; i = i + 1) { s = s + \"x\"; c(); } \
                  print s; print c();";
    let (normal, normal_result) = run_configured(source, Dialect::Standard, false);
    let (stressed, stressed_result) = run_configured(source, Dialect::Standard, true);
    assert_eq!(normal_result, Ok(()));
    assert_eq!(stressed_result, Ok(()));
    assert_eq!(normal, stressed);
    assert_eq!(normal, "xxxxxxxxxxxxxxxxxxxx\n21\n");
}

#[test]
fn stress_collection_preserves_closure_graphs() {
    let source = "fun adder(a) { fun add(b) { fun apply(c) { return a + b + c; } return apply; } \
                  return add; } \
                  print adder(1)(2)(3);";
    let (output, result) = run_configured(source, Dialect::Standard, true);
    assert_eq!(result, Ok(()));
    assert_eq!(output, "6\n");
}

#[test]
fn globals_survive_across_interpret_calls() {
    let buf = SharedBuf::default();
    let mut vm = Vm::with_output(Dialect::Standard, Box::new(buf.clone()));
    assert_eq!(vm.interpret("var greeting = \"hi\";"), Ok(()));
    assert_eq!(vm.interpret("print greeting;"), Ok(()));
    assert_eq!(buf.contents(), "hi\n");
}

#[test]
fn stack_resets_after_runtime_error() {
    let buf = SharedBuf::default();
    let mut vm = Vm::with_output(Dialect::Standard, Box::new(buf.clone()));
    assert_eq!(vm.interpret("print missing;"), Err(InterpretError::Runtime));
    // The session keeps working afterwards.
    assert_eq!(vm.interpret("print 1 + 1;"), Ok(()));
    assert_eq!(buf.contents(), "2\n");
}
