//! Module loading: bundled and host-registered sources, caching, and
//! circular import detection.

use oba::{CollectStringPrint, NoPrint, ObaError, Vm};

fn vm_with_output() -> (Vm, CollectStringPrint) {
    let output = CollectStringPrint::default();
    let mut vm = Vm::new(&[]);
    vm.set_print_writer(Box::new(output.clone()));
    (vm, output)
}

#[test]
fn test_host_registered_module() {
    let (mut vm, output) = vm_with_output();
    vm.add_module_source("tools", "fn twice x = x * 2");
    vm.interpret("import \"tools\"\ndebug tools::twice(21)")
        .expect("program should run");
    assert_eq!(output.contents(), "42\n");
}

#[test]
fn test_module_variables_are_shared_state() {
    let (mut vm, output) = vm_with_output();
    vm.add_module_source("config", "let limit = 10\nfn cap x = if x > limit limit else x");
    vm.interpret("import \"config\"\ndebug config::cap(99)\ndebug config::limit")
        .expect("program should run");
    assert_eq!(output.contents(), "10\n10\n");
}

#[test]
fn test_import_reruns_module_body() {
    // Each import recompiles and re-executes the module source.
    let (mut vm, output) = vm_with_output();
    vm.add_module_source("announce", "debug \"loaded\"\nlet value = 42");
    vm.interpret("import \"announce\"\nimport \"announce\"\ndebug announce::value")
        .expect("program should run");
    assert_eq!(output.contents(), "loaded\nloaded\n42\n");
}

#[test]
fn test_reimport_across_interprets_reruns_body() {
    let (mut vm, output) = vm_with_output();
    vm.add_module_source("announce", "debug \"loaded\"\nlet value = 42");
    vm.interpret("import \"announce\"").expect("first import");
    vm.interpret("import \"announce\"\ndebug announce::value")
        .expect("second import");
    assert_eq!(output.contents(), "loaded\nloaded\n42\n");
}

#[test]
fn test_reimport_rebinds_the_module_variable() {
    // The importer's binding is refreshed on every import; each run gets a
    // distinct module object.
    let (mut vm, output) = vm_with_output();
    vm.add_module_source("counter", "let n = 1");
    vm.interpret(
        "import \"counter\"\nlet first = counter\nimport \"counter\"\ndebug first == counter",
    )
    .expect("program should run");
    assert_eq!(output.contents(), "false\n");
}

#[test]
fn test_circular_import_is_an_error() {
    let mut vm = Vm::new(&[]);
    vm.set_print_writer(Box::new(NoPrint));
    vm.add_module_source("alpha", "import \"beta\"");
    vm.add_module_source("beta", "import \"alpha\"");
    match vm.interpret("import \"alpha\"") {
        Err(ObaError::Runtime(error)) => {
            assert!(error.message.contains("Circular import of module 'alpha'"));
        }
        other => panic!("expected a circular import error, got {other:?}"),
    }
}

#[test]
fn test_missing_module_is_an_error() {
    let mut vm = Vm::new(&[]);
    match vm.interpret("import \"no_such_module\"") {
        Err(ObaError::Runtime(error)) => {
            assert!(error.message.contains("Could not import module 'no_such_module'"));
        }
        other => panic!("expected an import error, got {other:?}"),
    }
}

#[test]
fn test_broken_module_reports_compile_failure() {
    let mut vm = Vm::new(&[]);
    vm.add_module_source("broken", "let = 1");
    match vm.interpret("import \"broken\"") {
        Err(ObaError::Runtime(error)) => {
            assert!(error.message.contains("Could not compile module 'broken'"));
        }
        other => panic!("expected an import failure, got {other:?}"),
    }
}

#[test]
fn test_host_module_shadows_bundled() {
    let (mut vm, output) = vm_with_output();
    vm.add_module_source("time", "let frozen = true");
    vm.interpret("import \"time\"\ndebug time::frozen")
        .expect("program should run");
    assert_eq!(output.contents(), "true\n");
}

#[test]
fn test_diamond_imports() {
    let (mut vm, output) = vm_with_output();
    vm.add_module_source("base", "debug \"base\"\nlet n = 1");
    vm.add_module_source("left", "import \"base\"\nlet n = base::n + 1");
    vm.add_module_source("right", "import \"base\"\nlet n = base::n + 10");
    vm.interpret(
        "import \"left\"\nimport \"right\"\ndebug left::n + right::n",
    )
    .expect("program should run");
    // `base` announces itself once per import that executes it.
    assert_eq!(output.contents(), "base\nbase\n13\n");
}

#[test]
fn test_member_access_requires_module() {
    let mut vm = Vm::new(&[]);
    match vm.interpret("let x = 1\ndebug x::field") {
        Err(ObaError::Runtime(error)) => {
            assert!(error.message.contains("expected a module value"));
        }
        other => panic!("expected a type error, got {other:?}"),
    }
}

#[test]
fn test_missing_module_variable() {
    let mut vm = Vm::new(&[]);
    vm.add_module_source("tools", "fn twice x = x * 2");
    match vm.interpret("import \"tools\"\ndebug tools::missing") {
        Err(ObaError::Runtime(error)) => {
            assert!(error
                .message
                .contains("Variable 'missing' not found in module 'tools'"));
        }
        other => panic!("expected a lookup error, got {other:?}"),
    }
}
