//! Garbage collector properties observed through the public API.
//!
//! The central invariant: a program's observable output is identical whether
//! the collector runs on every allocation (stress mode) or only when the
//! byte budget triggers it. Any divergence means a reachable object was
//! missing from the root set.

use oba::{CollectStringPrint, Vm};

fn run_with_stress(source: &str, stress: bool) -> String {
    let output = CollectStringPrint::default();
    let mut vm = Vm::new(&[]);
    vm.set_gc_stress(stress);
    vm.set_print_writer(Box::new(output.clone()));
    vm.interpret(source).expect("program should run");
    output.contents()
}

fn assert_stress_equivalent(source: &str) {
    let normal = run_with_stress(source, false);
    let stressed = run_with_stress(source, true);
    assert_eq!(normal, stressed, "stress GC changed output for: {source}");
}

#[test]
fn test_stress_equivalence_arithmetic() {
    assert_stress_equivalent("let x = 1 + 2 * 3\ndebug x");
}

#[test]
fn test_stress_equivalence_strings() {
    assert_stress_equivalent(
        "let a = \"foo\"\nlet b = \"bar\"\ndebug a + b\ndebug \"%(a)-%(b)\"",
    );
}

#[test]
fn test_stress_equivalence_functions_and_closures() {
    assert_stress_equivalent(
        "data Pair = P a b\n\
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
         debug get()",
    );
}

#[test]
fn test_stress_equivalence_match() {
    assert_stress_equivalent(
        "data Shape = Point | Circle r\n\
         fn m o = match o | Point = 0 | Circle x = x;\n\
         debug m(Circle(42))\n\
         debug m(Point())",
    );
}

#[test]
fn test_stress_equivalence_imports() {
    assert_stress_equivalent(
        "import \"list\"\n\
         let xs = Cons(3, Cons(1, Cons(2, Empty())))\n\
         debug format(sort(xs))\n\
         debug length(xs)",
    );
}

#[test]
fn test_stress_equivalence_recursion() {
    assert_stress_equivalent("fn f n = if n == 0 0 else n + f(n - 1)\ndebug f(20)");
}

#[test]
fn test_collect_on_demand_keeps_globals_alive() {
    let output = CollectStringPrint::default();
    let mut vm = Vm::new(&[]);
    vm.set_print_writer(Box::new(output.clone()));

    vm.interpret("debug \"warmup\"").expect("program should run");
    vm.collect_garbage();
    vm.collect_garbage();

    // The bootstrap globals (list constructors and helpers) must survive.
    vm.interpret("debug length(Cons(1, Empty()))")
        .expect("globals survive collection");
    assert_eq!(output.contents(), "warmup\n1\n");
}

#[test]
fn test_garbage_heavy_program() {
    // Builds and drops many short-lived strings and instances; enough to
    // cross the first collection threshold more than once.
    let source = "import \"list\"\n\
                  fn build n = if n == 0 Empty() else Cons(\"item %(n)\", build(n - 1))\n\
                  fn churn k {\n\
                  while k > 0 {\n\
                  length(build(50))\n\
                  k = k - 1\n\
                  }\n\
                  }\n\
                  churn(40)\n\
                  debug \"done\"";
    let output = CollectStringPrint::default();
    let mut vm = Vm::new(&[]);
    vm.set_print_writer(Box::new(output.clone()));
    vm.interpret(source).expect("program should run");
    assert_eq!(output.contents(), "done\n");
}
