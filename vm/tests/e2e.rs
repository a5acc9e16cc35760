//! End-to-end tests: compile Malang source, run it on a fresh VM, and
//! check what it printed (or how it trapped).

use malang_heap::GcConfig;
use malang_vm::{
    compile, interpreter, run_capture, CompileError, SharedOutput, Trap,
    TrapKind, Vm,
};

fn run_ok(source: &str) -> String {
    let (result, output) = run_capture(source).expect("program compiles");
    if let Err(trap) = result {
        panic!("program trapped:\n{trap}");
    }
    output
}

fn run_trap(source: &str) -> Trap {
    let (result, _) = run_capture(source).expect("program compiles");
    result.expect_err("program should trap")
}

fn compile_err(source: &str) -> CompileError {
    compile(source, "<test>").expect_err("program should not compile")
}

fn assert_codegen_err(source: &str, needle: &str) {
    match compile_err(source) {
        CompileError::Codegen(err) => assert!(
            err.message.contains(needle),
            "expected error containing {needle:?}, got {:?}",
            err.message
        ),
        CompileError::Parse(err) => {
            panic!("expected codegen error, got parse error: {err}")
        }
    }
}

// ── arithmetic and printing ───────────────────────────────────────────

#[test]
fn prints_a_sum() {
    assert_eq!(run_ok("println(1 + 2)"), "3\n");
}

#[test]
fn modulo_of_locals() {
    assert_eq!(run_ok("a := 10; b := 3; println(a % b)"), "1\n");
}

#[test]
fn integer_division_truncates() {
    assert_eq!(run_ok("println(10 / 3)"), "3\n");
    assert_eq!(run_ok("println(-7 / 2)"), "-3\n");
}

#[test]
fn shifts_and_bitwise() {
    assert_eq!(run_ok("println(1 << 4)"), "16\n");
    assert_eq!(run_ok("println(32 >> 2)"), "8\n");
    assert_eq!(run_ok("println(6 & 3)"), "2\n");
    assert_eq!(run_ok("println(6 | 3)"), "7\n");
    assert_eq!(run_ok("println(6 ^ 3)"), "5\n");
    assert_eq!(run_ok("println(~0)"), "-1\n");
}

#[test]
fn unary_operators() {
    assert_eq!(run_ok("println(-5)"), "-5\n");
    assert_eq!(run_ok("x := 5 println(+x)"), "5\n");
    assert_eq!(run_ok("println(!true)"), "false\n");
    assert_eq!(run_ok("println(-2.5)"), "-2.5\n");
}

#[test]
fn double_arithmetic() {
    assert_eq!(run_ok("println(1.5 + 2.25)"), "3.75\n");
    assert_eq!(run_ok("println(1.5 * 2.0)"), "3\n");
    assert_eq!(run_ok("println(0.5 < 0.75)"), "true\n");
}

#[test]
fn mixed_int_double_arithmetic_dispatches_to_methods() {
    assert_eq!(run_ok("println(2.5 + 1)"), "3.5\n");
    assert_eq!(run_ok("println(1 + 2.5)"), "3.5\n");
    assert_eq!(run_ok("println(2.5 > 2)"), "true\n");
    assert_eq!(run_ok("println(1 < 0.5)"), "false\n");
}

#[test]
fn comparisons() {
    assert_eq!(run_ok("println(3 < 4)"), "true\n");
    assert_eq!(run_ok("println(4 <= 3)"), "false\n");
    assert_eq!(run_ok("println(4 == 4)"), "true\n");
    assert_eq!(run_ok("println(4 != 4)"), "false\n");
}

#[test]
fn prints_chars_and_bools() {
    assert_eq!(run_ok("c := 'x' println(c)"), "x\n");
    assert_eq!(run_ok("println(true)"), "true\n");
}

// ── control flow ──────────────────────────────────────────────────────

#[test]
fn if_else_chain() {
    let source = "
        score := 85
        if score >= 90 { println(1) }
        else if score >= 80 { println(2) }
        else { println(3) }
    ";
    assert_eq!(run_ok(source), "2\n");
}

#[test]
fn while_loop_sums() {
    let source = "
        i := 0
        total := 0
        while i < 5 {
            total = total + i
            i = i + 1
        }
        println(total)
    ";
    assert_eq!(run_ok(source), "10\n");
}

#[test]
fn logical_operators_short_circuit() {
    let source = "
        fn loud() -> bool { println(99) return true }
        a := false && loud()
        b := true || loud()
        println(a)
        println(b)
    ";
    assert_eq!(run_ok(source), "false\ntrue\n");
}

#[test]
fn logical_operators_evaluate_rhs_when_needed() {
    let source = "
        fn loud() -> bool { println(99) return true }
        a := true && loud()
        println(a)
    ";
    assert_eq!(run_ok(source), "99\ntrue\n");
}

// ── functions ─────────────────────────────────────────────────────────

#[test]
fn fib_ten_is_55() {
    let source = "
        fn fib(n: int) -> int {
            if n < 2 { return n }
            return fib(n - 1) + fib(n - 2)
        }
        println(fib(10))
    ";
    assert_eq!(run_ok(source), "55\n");
}

#[test]
fn recursion_depth_shows_in_stack_trace() {
    // Ten nested calls plus the entry frame: eleven trace lines.
    let source = "
        fn down(n: int) {
            if n == 0 {
                stack_trace()
                return
            }
            down(n - 1)
        }
        down(9)
    ";
    let output = run_ok(source);
    let lines: Vec<&str> = output.lines().collect();
    assert_eq!(lines.len(), 11);
    assert!(lines[0].contains("at down"));
    assert!(lines[10].contains("at <main>"));
}

#[test]
fn function_overloading_by_parameter_types() {
    let source = "
        fn pick(a: int) -> int { return 1 }
        fn pick(a: double) -> int { return 2 }
        println(pick(0))
        println(pick(0.5))
    ";
    assert_eq!(run_ok(source), "1\n2\n");
}

#[test]
fn overloads_prefer_the_most_specific_parameter() {
    // The general overload is declared first; resolution must pick the
    // nearest ancestor, not the first registration that fits.
    let source = "
        class Animal { }
        class Dog : Animal { }
        class Puppy : Dog { }
        fn describe(a: Animal) -> int { return 1 }
        fn describe(d: Dog) -> int { return 2 }
        println(describe(Animal()))
        println(describe(Dog()))
        println(describe(Puppy()))
    ";
    assert_eq!(run_ok(source), "1\n2\n2\n");
}

#[test]
fn equally_specific_overloads_are_ambiguous() {
    let source = "
        class Animal { }
        class Dog : Animal { }
        fn pair(a: Animal, b: Dog) -> int { return 1 }
        fn pair(a: Dog, b: Animal) -> int { return 2 }
        println(pair(Dog(), Dog()))
    ";
    assert_codegen_err(source, "unresolved function");
}

#[test]
fn void_function_returns_early() {
    let source = "
        fn shout(n: int) {
            if n > 3 { return }
            println(n)
        }
        shout(1)
        shout(9)
    ";
    assert_eq!(run_ok(source), "1\n");
}

#[test]
fn constants_are_readable() {
    assert_eq!(run_ok("limit :: 100 println(limit + 1)"), "101\n");
}

// ── strings ───────────────────────────────────────────────────────────

#[test]
fn prints_a_string_variable() {
    assert_eq!(run_ok("s := \"hello\" println(s)"), "hello\n");
}

#[test]
fn string_length_reads_the_field() {
    assert_eq!(run_ok("s := \"hello\" println(s.length)"), "5\n");
}

#[test]
fn equal_string_literals_share_one_constant() {
    let program = compile(
        "println(\"dup\") println(\"dup\") println(\"other\")",
        "<test>",
    )
    .expect("compiles");
    let strings = program
        .constants
        .iter()
        .filter(|c| matches!(c, malang_vm::Constant::Str(_)))
        .count();
    assert_eq!(strings, 2);
}

#[test]
fn equal_int_literals_share_one_constant() {
    let program =
        compile("a := 7 b := 7 println(a + b)", "<test>").expect("compiles");
    let sevens = program
        .constants
        .iter()
        .filter(|c| matches!(c, malang_vm::Constant::Fixnum(7)))
        .count();
    assert_eq!(sevens, 1);
}

// ── arrays and buffers ────────────────────────────────────────────────

#[test]
fn array_literal_indexing() {
    assert_eq!(run_ok("xs := [1, 2, 3] println(xs[1])"), "2\n");
}

#[test]
fn array_store_and_length() {
    let source = "
        xs := [1, 2, 3]
        xs[0] = 9
        println(xs[0])
        println(xs.length)
    ";
    assert_eq!(run_ok(source), "9\n3\n");
}

#[test]
fn new_array_is_zeroed() {
    let source = "
        ys := [4]int
        println(ys.length)
        println(ys[3])
        ys[3] = 7
        println(ys[3])
    ";
    assert_eq!(run_ok(source), "4\n0\n7\n");
}

#[test]
fn nested_arrays() {
    let source = "
        grid := [[1, 2], [3, 4]]
        println(grid[1][0])
    ";
    assert_eq!(run_ok(source), "3\n");
}

#[test]
fn buffers_store_bytes() {
    let source = "
        b := buffer(5)
        b[0] = 72
        b[1] = 105
        println(b.length)
        println(b[1])
    ";
    assert_eq!(run_ok(source), "5\n105\n");
}

// ── classes, methods, dispatch ────────────────────────────────────────

#[test]
fn extend_int_with_a_method() {
    let source = "
        extend int {
            fn double() -> int { return @ * 2 }
        }
        println(21.double())
    ";
    assert_eq!(run_ok(source), "42\n");
}

#[test]
fn class_fields_and_init() {
    let source = "
        class Point {
            x : int
            y : int
            fn init(x: int, y: int) {
                @.x = x
                @.y = y
            }
        }
        p := Point(3, 4)
        println(p.x * p.x + p.y * p.y)
    ";
    assert_eq!(run_ok(source), "25\n");
}

#[test]
fn class_without_init_zeroes_fields() {
    let source = "
        class Pair { a : int b : bool }
        p := Pair()
        println(p.a)
        println(p.b)
    ";
    assert_eq!(run_ok(source), "0\nfalse\n");
}

#[test]
fn virtual_dispatch_picks_the_override() {
    let source = "
        class Shape {
            fn area() -> int { return 0 }
        }
        class Square : Shape {
            side : int
            fn init(n: int) { @.side = n }
            fn area() -> int { return @.side * @.side }
        }
        s : Shape = Square(5)
        println(s.area())
    ";
    assert_eq!(run_ok(source), "25\n");
}

#[test]
fn subclasses_inherit_fields_and_methods() {
    let source = "
        class A {
            x : int
            fn base() -> int { return @.x }
        }
        class B : A {
            y : int
        }
        b := B()
        b.x = 1
        b.y = 2
        println(b.x + b.y)
        println(b.base())
    ";
    assert_eq!(run_ok(source), "3\n1\n");
}

#[test]
fn operator_methods_on_classes() {
    let source = "
        class Vec2 {
            x : int
            y : int
            fn init(x: int, y: int) { @.x = x @.y = y }
        }
        extend Vec2 {
            fn +(o: Vec2) -> Vec2 { return Vec2(@.x + o.x, @.y + o.y) }
        }
        a := Vec2(1, 2)
        b := Vec2(3, 4)
        c := a + b
        println(c.x)
        println(c.y)
    ";
    assert_eq!(run_ok(source), "4\n6\n");
}

#[test]
fn println_accepts_any_object() {
    let source = "
        class Widget { n : int }
        w := Widget()
        println(w)
    ";
    assert_eq!(run_ok(source), "Widget\n");
}

// ── garbage collection ────────────────────────────────────────────────

#[test]
fn transient_objects_return_to_baseline() {
    let source = "
        class Junk { a : int b : int }
        i := 0
        while i < 10000 {
            j := Junk()
            i = i + 1
        }
        gc_run()
    ";
    let program = compile(source, "<test>").expect("compiles");
    let output = SharedOutput::new();
    let mut vm = Vm::with_output(program, Box::new(output.clone()));
    interpreter::run(&mut vm).expect("program runs");
    // Automatic collections fired during the loop.
    assert!(vm.gc().stats().collections > 1);
    // Nothing is rooted once the program finishes.
    vm.collect_garbage();
    assert_eq!(vm.gc().stats().live_objects, 0);
}

#[test]
fn gc_pause_stops_automatic_collection() {
    let source = "
        class Junk { a : int b : int }
        gc_pause()
        i := 0
        while i < 5000 {
            j := Junk()
            i = i + 1
        }
    ";
    let program = compile(source, "<test>").expect("compiles");
    let mut vm = Vm::with_gc_config(
        program,
        Box::new(SharedOutput::new()),
        GcConfig {
            min_threshold: 1024,
            growth_factor: 2.0,
            auto_enabled: true,
        },
    );
    interpreter::run(&mut vm).expect("program runs");
    assert_eq!(vm.gc().stats().collections, 0);
    assert!(vm.gc().stats().live_objects >= 5000);
}

#[test]
fn objects_reachable_through_arrays_survive_collection() {
    let source = "
        class Node { value : int fn init(v: int) { @.value = v } }
        nodes := [Node(1), Node(2), Node(3)]
        gc_run()
        println(nodes[1].value)
    ";
    assert_eq!(run_ok(source), "2\n");
}

#[test]
fn deallocate_is_advisory() {
    let source = "
        class Junk { a : int }
        j := Junk()
        deallocate(j)
        println(1)
    ";
    assert_eq!(run_ok(source), "1\n");
}

#[test]
fn string_constants_survive_collection() {
    let source = "
        s := \"keep me\"
        gc_run()
        gc_run()
        println(s)
    ";
    assert_eq!(run_ok(source), "keep me\n");
}

// ── traps ─────────────────────────────────────────────────────────────

#[test]
fn division_by_zero_traps() {
    let trap = run_trap("a := 0 println(1 / a)");
    assert_eq!(trap.kind, TrapKind::DivisionByZero);
    assert!(!trap.trace.is_empty());
}

#[test]
fn modulo_by_zero_traps() {
    let trap = run_trap("a := 0 println(1 % a)");
    assert_eq!(trap.kind, TrapKind::DivisionByZero);
}

#[test]
fn index_at_length_traps() {
    let trap = run_trap("xs := [3]int println(xs[3])");
    assert_eq!(
        trap.kind,
        TrapKind::IndexOutOfBounds {
            index: 3,
            length: 3
        }
    );
}

#[test]
fn negative_index_traps() {
    let trap = run_trap("xs := [3]int println(xs[0 - 1])");
    assert_eq!(
        trap.kind,
        TrapKind::IndexOutOfBounds {
            index: -1,
            length: 3
        }
    );
}

#[test]
fn negative_array_length_traps() {
    let trap = run_trap("n := 0 - 4 xs := [n]int println(xs.length)");
    assert_eq!(trap.kind, TrapKind::InvalidArrayLength { length: -4 });
}

#[test]
fn runaway_recursion_exhausts_call_stack() {
    let source = "
        fn spin(n: int) -> int { return spin(n + 1) }
        println(spin(0))
    ";
    let trap = run_trap(source);
    assert_eq!(trap.kind, TrapKind::CallDepthExceeded);
    assert!(trap.trace.len() > 100);
    assert!(trap.trace[0].function == "spin");
}

#[test]
fn method_call_on_null_receiver_traps() {
    let source = "
        class P { fn f() -> int { return 1 } }
        p : P
        println(p.f())
    ";
    let trap = run_trap(source);
    assert_eq!(trap.kind, TrapKind::NullReceiver);
}

#[test]
fn trap_messages_carry_source_positions() {
    let trap = run_trap("a := 0\nprintln(10 / a)");
    let frame = &trap.trace[0];
    assert_eq!(frame.function, "<main>");
    assert_eq!(frame.line, 2);
}

// ── codegen errors ────────────────────────────────────────────────────

#[test]
fn wrong_arity_never_reaches_the_runtime() {
    assert_codegen_err("println(1, 2)", "unresolved function");
}

#[test]
fn unresolved_name_is_a_codegen_error() {
    assert_codegen_err("println(missing)", "unresolved name");
}

#[test]
fn assigning_a_constant_is_rejected() {
    assert_codegen_err("limit :: 5 limit = 6", "constant");
}

#[test]
fn type_mismatch_is_rejected() {
    assert_codegen_err("a := 1 a = true", "type mismatch");
}

#[test]
fn missing_return_is_rejected() {
    assert_codegen_err(
        "fn f(n: int) -> int { if n > 0 { return 1 } }",
        "without returning",
    );
}

#[test]
fn receiver_outside_method_is_rejected() {
    assert_codegen_err("println(@)", "inside a method");
}

#[test]
fn non_bool_condition_is_rejected() {
    assert_codegen_err("if 1 { println(2) }", "must be a bool");
}

#[test]
fn nested_functions_are_rejected() {
    assert_codegen_err(
        "fn outer() { fn inner() { } }",
        "nested function",
    );
}

#[test]
fn duplicate_fields_are_rejected() {
    assert_codegen_err("class C { x : int x : int }", "duplicate field");
}

#[test]
fn redeclaration_in_scope_is_rejected() {
    assert_codegen_err("a := 1 a := 2", "already declared");
}

#[test]
fn fixnum_overflow_in_literal_is_rejected() {
    assert_codegen_err("a := 5000000000", "does not fit");
}

// ── odds and ends ─────────────────────────────────────────────────────

#[test]
fn breakpoint_flips_the_vm_into_tracing_mode() {
    let program =
        compile("breakpoint() println(1)", "<test>").expect("compiles");
    let output = SharedOutput::new();
    let mut vm = Vm::with_output(program, Box::new(output.clone()));
    interpreter::run(&mut vm).expect("program runs");
    assert!(vm.breaking());
    assert_eq!(output.take_string(), "1\n");
}

#[test]
fn entry_result_is_nothing() {
    let (result, _) = run_capture("x := 1").expect("compiles");
    assert!(result.expect("runs").is_nothing());
}

#[test]
fn semicolons_are_optional_everywhere() {
    assert_eq!(run_ok("a := 1; b := 2\nprintln(a + b);"), "3\n");
}
