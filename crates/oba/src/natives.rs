//! Baseline native functions.
//!
//! Every VM starts with these; host builtins registered afterwards may
//! override them by name. Natives check their own arity and report failures
//! by setting the VM error slot and returning nil.

use std::io::{BufRead, Read};

use crate::value::Value;
use crate::vm::{Builtin, Vm};

pub(crate) static BUILTINS: &[Builtin] = &[
    Builtin { name: "__native_sleep", function: sleep },
    Builtin { name: "__native_now", function: now },
    Builtin { name: "__native_read_byte", function: read_byte },
    Builtin { name: "__native_read_line", function: read_line },
    Builtin { name: "__native_print", function: print },
    Builtin { name: "__native_println", function: println },
    Builtin { name: "__native_global", function: global },
    Builtin { name: "__native_is_nil", function: is_nil },
    Builtin { name: "__native_frame_depth", function: frame_depth },
    Builtin { name: "__native_string_trim", function: string_trim },
    Builtin { name: "str", function: str_native },
    Builtin { name: "panic", function: panic_native },
];

fn sleep(vm: &mut Vm, args: &[Value]) -> Value {
    if args.len() != 1 {
        vm.arity_error(1, args.len());
        return Value::Nil;
    }
    let Some(seconds) = args[0].as_number() else {
        vm.type_error("number");
        return Value::Nil;
    };
    if seconds.is_finite() && seconds > 0.0 {
        std::thread::sleep(std::time::Duration::from_secs_f64(seconds));
    }
    Value::Number(0.0)
}

fn now(vm: &mut Vm, _args: &[Value]) -> Value {
    Value::Number(vm.elapsed_seconds())
}

fn read_byte(vm: &mut Vm, _args: &[Value]) -> Value {
    let mut byte = [0u8; 1];
    match std::io::stdin().lock().read_exact(&mut byte) {
        Ok(()) => vm.new_string(&String::from_utf8_lossy(&byte)),
        Err(_) => Value::Nil,
    }
}

fn read_line(vm: &mut Vm, _args: &[Value]) -> Value {
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(0) | Err(_) => Value::Nil,
        Ok(_) => vm.new_string(&line),
    }
}

fn print(vm: &mut Vm, args: &[Value]) -> Value {
    if let Some(value) = args.first() {
        let text = vm.display_value(*value);
        vm.print(&text);
    }
    Value::Nil
}

fn println(vm: &mut Vm, args: &[Value]) -> Value {
    if let Some(value) = args.first() {
        let text = vm.display_value(*value);
        vm.print(&text);
    }
    vm.print("\n");
    Value::Nil
}

/// Installs a VM-wide global binding. Refused outside the bootstrap module,
/// so user code cannot touch the shared globals table.
fn global(vm: &mut Vm, args: &[Value]) -> Value {
    if !vm.in_privileged_module() {
        vm.set_error_message("__native_global is reserved for the bootstrap module");
        return Value::Nil;
    }
    if args.len() != 2 {
        vm.arity_error(2, args.len());
        return Value::Nil;
    }
    let Some(name) = args[0].as_obj().filter(|_| vm.string_contents(args[0]).is_some()) else {
        vm.type_error("string");
        return Value::Nil;
    };
    vm.define_vm_global(name, args[1]);
    Value::Nil
}

fn is_nil(_vm: &mut Vm, args: &[Value]) -> Value {
    if args.len() != 1 {
        return Value::Bool(false);
    }
    Value::Bool(args[0].is_nil())
}

fn frame_depth(vm: &mut Vm, _args: &[Value]) -> Value {
    #[allow(clippy::cast_precision_loss)]
    Value::Number(vm.frame_depth() as f64)
}

fn string_trim(vm: &mut Vm, args: &[Value]) -> Value {
    if args.len() != 1 {
        vm.arity_error(1, args.len());
        return Value::Nil;
    }
    let Some(text) = vm.string_contents(args[0]) else {
        vm.type_error("string");
        return Value::Nil;
    };
    let trimmed = text.trim().to_string();
    vm.new_string(&trimmed)
}

fn str_native(vm: &mut Vm, args: &[Value]) -> Value {
    if args.len() != 1 {
        vm.arity_error(1, args.len());
        return Value::Nil;
    }
    let text = vm.display_value(args[0]);
    vm.new_string(&text)
}

/// Aborts execution with the given value, or the string "panic".
fn panic_native(vm: &mut Vm, args: &[Value]) -> Value {
    match args.first() {
        Some(value) => vm.set_error(*value),
        None => vm.set_error_message("panic"),
    }
    Value::Nil
}
