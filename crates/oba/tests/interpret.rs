//! End-to-end programs run through the public embedding API, asserting on
//! captured output and structured errors.

use oba::{Builtin, CollectStringPrint, NoPrint, ObaError, Value, Vm};

fn run(source: &str) -> String {
    let output = CollectStringPrint::default();
    let mut vm = Vm::new(&[]);
    vm.set_print_writer(Box::new(output.clone()));
    vm.interpret(source).expect("program should run");
    output.contents()
}

fn runtime_error(source: &str) -> oba::RuntimeError {
    let mut vm = Vm::new(&[]);
    vm.set_print_writer(Box::new(NoPrint));
    match vm.interpret(source) {
        Err(ObaError::Runtime(error)) => error,
        Err(ObaError::Compile(errors)) => panic!("unexpected compile error: {errors:?}"),
        Ok(()) => panic!("expected a runtime error"),
    }
}

#[test]
fn test_arithmetic() {
    assert_eq!(run("let x = 1 + 2 * 3\ndebug x"), "7\n");
}

#[test]
fn test_function_call() {
    assert_eq!(run("fn add a b = a + b\ndebug add(2, 3)"), "5\n");
}

#[test]
fn test_match_on_data() {
    let source = "data Shape = Point | Circle r\n\
                  fn m o = match o | Point = 0 | Circle x = x;\n\
                  debug m(Circle(42))\n\
                  debug m(Point())";
    assert_eq!(run(source), "42\n0\n");
}

#[test]
fn test_list_module() {
    let source = "import \"list\"\n\
                  let xs = Cons(1, Cons(2, Cons(3, Empty())))\n\
                  debug length(xs)";
    assert_eq!(run(source), "3\n");
}

#[test]
fn test_string_interpolation() {
    let source = "let a = 2\nlet b = 3\ndebug \"a + b = %(a + b)\"";
    assert_eq!(run(source), "a + b = 5\n");
}

#[test]
fn test_recursion() {
    assert_eq!(run("fn f n = if n == 0 0 else n + f(n - 1)\ndebug f(5)"), "15\n");
}

#[test]
fn test_interpolation_with_calls_and_tails() {
    let source = "fn double x = x * 2\ndebug \"got %(double(4)) and %(1 + 1)!\"";
    assert_eq!(run(source), "got 8 and 2!\n");
}

#[test]
fn test_concatenated_strings_compare_equal() {
    assert_eq!(run("debug \"ab\" == \"a\" + \"b\""), "true\n");
}

#[test]
fn test_value_rendering() {
    assert_eq!(run("debug true"), "true\n");
    assert_eq!(run("debug 2.5"), "2.5\n");
    assert_eq!(run("fn foo = 1\ndebug foo"), "<fn main::foo>\n");
    assert_eq!(run("debug str"), "<native fn>\n");
    assert_eq!(run("debug Some"), "Option::Some\n");
    assert_eq!(run("debug Some(42)"), "(Option::Some,42)\n");
    assert_eq!(run("debug Empty()"), "(List::Empty)\n");
    assert_eq!(run("import \"list\"\ndebug list"), "<module list>\n");
}

#[test]
fn test_str_native() {
    assert_eq!(run("debug str(42) + \"!\""), "42!\n");
}

#[test]
fn test_shared_upvalue_cell() {
    // Two closures over the same local observe each other's writes, before
    // and after the enclosing frame returns.
    let source = "data Pair = P a b\n\
                  fn makeCounter {\n\
                  let n = 0\n\
                  fn bump = n = n + 1\n\
                  fn get = n\n\
                  P(bump, get)\n\
                  }\n\
                  fn fst p = match p | P a _ = a;\n\
                  fn snd p = match p | P _ b = b;\n\
                  let c = makeCounter()\n\
                  let bump = fst(c)\n\
                  let get = snd(c)\n\
                  bump()\n\
                  bump()\n\
                  debug get()";
    assert_eq!(run(source), "2\n");
}

#[test]
fn test_counters_are_independent() {
    let source = "data Pair = P a b\n\
                  fn makeCounter {\n\
                  let n = 0\n\
                  fn bump = n = n + 1\n\
                  fn get = n\n\
                  P(bump, get)\n\
                  }\n\
                  fn fst p = match p | P a _ = a;\n\
                  fn snd p = match p | P _ b = b;\n\
                  let one = makeCounter()\n\
                  let two = makeCounter()\n\
                  let bumpOne = fst(one)\n\
                  let getOne = snd(one)\n\
                  let getTwo = snd(two)\n\
                  bumpOne()\n\
                  debug getOne()\n\
                  debug getTwo()";
    assert_eq!(run(source), "1\n0\n");
}

#[test]
fn test_captured_block_local_closes_at_scope_exit() {
    assert_eq!(run("{\nlet x = 42\nfn get = x\ndebug get()\n}"), "42\n");
}

#[test]
fn test_user_data_shadows_promoted_globals() {
    // A main-module Option family wins over the bootstrap's promoted one.
    let source = "data Option = None | Some v\n\
                  fn m o = match o | None = 0 | Some x = x;\n\
                  debug m(Some(42))\n\
                  debug m(None())";
    assert_eq!(run(source), "42\n0\n");
}

#[test]
fn test_block_scope_ends() {
    let error = runtime_error("{\nlet a = 1\ndebug a\n}\ndebug a");
    assert!(error.message.contains("Undefined variable: a"));
}

#[test]
fn test_while_accumulates() {
    let source = "fn sum limit {\n\
                  let total = 0\n\
                  let i = 0\n\
                  while i < limit {\n\
                  i = i + 1\n\
                  total = total + i\n\
                  }\n\
                  total\n\
                  }\n\
                  debug sum(4)";
    assert_eq!(run(source), "10\n");
}

#[test]
fn test_unmatched_pattern_raises() {
    let error = runtime_error("fn m o = match o | 1 = true;\ndebug m(2)");
    assert_eq!(error.message, "Match expression evaluated to nothing");
}

#[test]
fn test_panic_with_value() {
    let error = runtime_error("panic(42)");
    assert_eq!(error.message, "42");
}

#[test]
fn test_panic_without_value() {
    let error = runtime_error("panic()");
    assert_eq!(error.message, "panic");
}

#[test]
fn test_option_module_must() {
    assert_eq!(run("debug must(Some(7))"), "7\n");
    let error = runtime_error("debug must(None())");
    assert_eq!(error.message, "expected a value");
}

#[test]
fn test_list_operations() {
    let source = "let xs = Cons(3, Cons(1, Cons(2, Empty())))\n\
                  debug format(sort(xs))\n\
                  debug format(reverse(xs))\n\
                  debug length(append(9, xs))";
    assert_eq!(run(source), "1,2,3\n2,1,3\n4\n");
}

#[test]
fn test_list_higher_order_functions() {
    let source = "let xs = Cons(1, Cons(2, Cons(3, Empty())))\n\
                  fn dbl x = x * 2\n\
                  fn big x = x > 1\n\
                  debug format(map(dbl, xs))\n\
                  debug format(where(big, xs))";
    assert_eq!(run(source), "2,4,6\n2,3\n");
}

#[test]
fn test_imported_module_is_self_consistent() {
    // A fresh import's own constructors and functions work together.
    let source = "import \"list\"\n\
                  let xs = list::Cons(1, list::Cons(2, list::Empty()))\n\
                  debug list::format(xs)\n\
                  debug list::length(xs)";
    assert_eq!(run(source), "1,2\n2\n");
}

#[test]
fn test_strings_module() {
    assert_eq!(run("import \"strings\"\ndebug strings::trim(\"  hi  \")"), "hi\n");
}

#[test]
fn test_system_module() {
    let source = "import \"system\"\n\
                  system::println(\"out\")\n\
                  debug system::isNil(1)\n\
                  debug system::frameDepth() > 0";
    assert_eq!(run(source), "out\nfalse\ntrue\n");
}

#[test]
fn test_time_module() {
    assert_eq!(run("import \"time\"\ndebug time::now() >= 0"), "true\n");
}

#[test]
fn test_host_builtin_override_and_custom() {
    fn double(_vm: &mut Vm, args: &[Value]) -> Value {
        match args.first().and_then(|v| v.as_number()) {
            Some(n) => Value::Number(n * 2.0),
            None => Value::Nil,
        }
    }

    let output = CollectStringPrint::default();
    let mut vm = Vm::new(&[Builtin { name: "double", function: double }]);
    vm.set_print_writer(Box::new(output.clone()));
    vm.interpret("debug double(21)").expect("program should run");
    assert_eq!(output.contents(), "42\n");
}

#[test]
fn test_native_nil_roundtrip() {
    fn give_nil(_vm: &mut Vm, _args: &[Value]) -> Value {
        Value::Nil
    }

    let output = CollectStringPrint::default();
    let mut vm = Vm::new(&[Builtin { name: "give_nil", function: give_nil }]);
    vm.set_print_writer(Box::new(output.clone()));
    vm.interpret("import \"system\"\ndebug system::isNil(give_nil())\ndebug give_nil()")
        .expect("program should run");
    assert_eq!(output.contents(), "true\nnil\n");
}

#[test]
fn test_native_global_is_privileged() {
    let error = runtime_error("__native_global(\"evil\", 1)");
    assert!(error.message.contains("reserved for the bootstrap module"));
}

#[test]
fn test_deep_recursion_overflows_frames() {
    let error = runtime_error("fn f n = if n == 0 0 else f(n - 1)\nf(5000)");
    assert_eq!(error.message, "Too many nested function calls");
}

#[test]
fn test_runtime_error_trace_is_innermost_first() {
    let error = runtime_error("fn inner = 1 + true\nfn outer = inner()\nouter()");
    let functions: Vec<&str> = error.trace.iter().map(|f| f.function.as_str()).collect();
    assert_eq!(functions, vec!["inner", "outer", "(script)"]);
}

#[test]
fn test_compile_error_result() {
    let mut vm = Vm::new(&[]);
    let errors = match vm.interpret("let x = 1\nx = 2") {
        Err(ObaError::Compile(errors)) => errors,
        other => panic!("expected a compile error, got {other:?}"),
    };
    assert!(errors[0].message.contains("Cannot reassign global variable"));
}

#[test]
fn test_vm_survives_errors() {
    let mut vm = Vm::new(&[]);
    let output = CollectStringPrint::default();
    vm.set_print_writer(Box::new(output.clone()));

    assert!(vm.interpret("debug missing").is_err());
    vm.interpret("debug 1 + 1").expect("VM should recover after an error");
    assert_eq!(output.contents(), "2\n");
}
