//! The virtual machine: dispatch loop, call frames, upvalues, modules, and
//! the embedding surface.
//!
//! The VM owns the heap and drives collection: every allocation goes through
//! [`Vm::allocate`], which first marks the VM's roots and collects if the
//! byte budget demands it. Execution is a plain fetch-decode loop over the
//! current frame's chunk; a pending error value (anything non-nil in the
//! error slot) aborts the loop at the next dispatch boundary with a stack
//! trace.

use std::time::Instant;

use ahash::AHashMap;

use crate::bytecode::Opcode;
use crate::compiler::compile;
use crate::error::{ObaError, RuntimeError, TraceFrame};
use crate::heap::{
    hash_string, Heap, HeapId, Obj, ObjClosure, ObjInstance, ObjModule, ObjNative, ObjStr,
    ObjUpvalue, UpvalueState,
};
use crate::io::{PrintWriter, StdPrint};
use crate::modules::{core_module_source, GLOBALS_MODULE};
use crate::natives;
use crate::table::SymbolTable;
use crate::value::Value;

/// The maximum call depth.
const FRAMES_MAX: usize = 1024;

/// A host function callable from Oba code.
///
/// Arguments are passed by value and remain rooted on the VM stack for the
/// duration of the call. A native reports failure by setting the VM's error
/// slot (see [`Vm::set_error`] and friends) and returning nil; it must not
/// retain heap values beyond its invocation unless it anchors them with
/// [`Vm::push_temp_root`].
pub type NativeFn = fn(&mut Vm, &[Value]) -> Value;

/// A named native function, registered at VM creation.
#[derive(Clone, Copy)]
pub struct Builtin {
    pub name: &'static str,
    pub function: NativeFn,
}

/// One call in progress.
#[derive(Debug, Clone, Copy)]
struct CallFrame {
    closure: HeapId,
    /// The closure's function, cached to save a hop per fetch.
    function: HeapId,
    /// Offset of the next instruction in the function's chunk.
    ip: usize,
    /// Stack index of the frame's first argument slot. The callee itself
    /// sits just below.
    slots: usize,
}

/// A single Oba virtual machine.
pub struct Vm {
    frames: Vec<CallFrame>,
    stack: Vec<Value>,
    pub(crate) heap: Heap,
    /// VM-wide globals: natives, plus names promoted by the privileged
    /// bootstrap module. Consulted after the current module's table.
    globals: SymbolTable,
    /// The intern set. Weak: unmarked strings are evicted before each sweep.
    strings: SymbolTable,
    /// Names of modules whose bodies are currently executing, for circular
    /// import detection.
    loading: Vec<HeapId>,
    /// Head of the open-upvalue list, sorted by descending stack slot.
    open_upvalues: Option<HeapId>,
    /// Pending error; nil means none.
    error: Value,
    /// Functions under construction by the compiler chain, marked as roots.
    pub(crate) compiler_roots: Vec<HeapId>,
    /// Host-registered module sources, consulted after the bundled ones.
    module_sources: AHashMap<String, String>,
    writer: Box<dyn PrintWriter>,
    start: Instant,
}

impl Vm {
    /// Creates a VM, registers the baseline natives and then `builtins`
    /// (later registrations override earlier ones), and runs the privileged
    /// bootstrap module.
    #[must_use]
    pub fn new(builtins: &[Builtin]) -> Self {
        let mut vm = Self {
            frames: Vec::new(),
            stack: Vec::new(),
            heap: Heap::new(),
            globals: SymbolTable::new(),
            strings: SymbolTable::new(),
            loading: Vec::new(),
            open_upvalues: None,
            error: Value::Nil,
            compiler_roots: Vec::new(),
            module_sources: AHashMap::new(),
            writer: Box::new(StdPrint),
            start: Instant::now(),
        };
        for builtin in natives::BUILTINS {
            vm.define_native(builtin.name, builtin.function);
        }
        for builtin in builtins {
            vm.define_native(builtin.name, builtin.function);
        }
        vm.load_globals_module();
        vm
    }

    /// Compiles and runs `source` as the `main` module.
    pub fn interpret(&mut self, source: &str) -> Result<(), ObaError> {
        let name = self.intern("main");
        self.heap.push_temp_root(Value::Obj(name));
        let module = self.allocate(Obj::Module(ObjModule {
            name,
            variables: SymbolTable::new(),
        }));
        self.heap.pop_temp_root();

        let function = compile(self, module, source).map_err(ObaError::Compile)?;

        self.heap.push_temp_root(Value::Obj(function));
        let closure = self.allocate(Obj::Closure(ObjClosure {
            function,
            upvalues: Vec::new(),
        }));
        self.heap.pop_temp_root();

        self.push(Value::Obj(closure));
        self.call_closure(closure, 0).map_err(ObaError::Runtime)?;
        let result = self.run().map_err(ObaError::Runtime);
        self.frames.clear();
        result
    }

    // Embedding surface -------------------------------------------------

    /// Registers a module source the import mechanism can resolve, shadowing
    /// a bundled module of the same name.
    pub fn add_module_source(&mut self, name: impl Into<String>, source: impl Into<String>) {
        self.module_sources.insert(name.into(), source.into());
    }

    /// Replaces the output sink used by `debug` and the print natives.
    pub fn set_print_writer(&mut self, writer: Box<dyn PrintWriter>) {
        self.writer = writer;
    }

    /// Forces a collection on every allocation. See the GC equivalence
    /// property: output must not change under stress.
    pub fn set_gc_stress(&mut self, stress: bool) {
        self.heap.set_stress(stress);
    }

    /// Sets the error slot to an arbitrary value, as `panic` does.
    pub fn set_error(&mut self, value: Value) {
        self.error = value;
    }

    /// Sets the error slot to an interned message string.
    pub fn set_error_message(&mut self, message: &str) {
        let text = self.intern(message);
        self.error = Value::Obj(text);
    }

    /// Raises "expected N argument(s) but got M".
    pub fn arity_error(&mut self, want: usize, got: usize) {
        let noun = if want > 1 { "arguments" } else { "argument" };
        self.set_error_message(&format!("expected {want} {noun} but got {got}"));
    }

    /// Raises "expected a NAME value".
    pub fn type_error(&mut self, expected: &str) {
        self.set_error_message(&format!("expected a {expected} value"));
    }

    /// True if an error is pending.
    #[must_use]
    pub fn has_error(&self) -> bool {
        !self.error.is_nil()
    }

    /// Creates (or reuses) the interned string for `text`.
    pub fn new_string(&mut self, text: &str) -> Value {
        Value::Obj(self.intern(text))
    }

    /// The bytes of a string value, if it is one.
    #[must_use]
    pub fn string_contents(&self, value: Value) -> Option<&str> {
        match value {
            Value::Obj(id) => match self.heap.obj(id) {
                Obj::Str(s) => Some(s.chars.as_str()),
                _ => None,
            },
            _ => None,
        }
    }

    /// Renders any value the way `debug` would.
    #[must_use]
    pub fn display_value(&self, value: Value) -> String {
        value.display(&self.heap)
    }

    /// Anchors a value against collection until the matching
    /// [`Vm::pop_temp_root`]. For native authors holding fresh objects
    /// across allocations.
    pub fn push_temp_root(&mut self, value: Value) {
        self.heap.push_temp_root(value);
    }

    pub fn pop_temp_root(&mut self) {
        self.heap.pop_temp_root();
    }

    /// Marks every root and collects unreachable objects immediately.
    pub fn collect_garbage(&mut self) {
        for i in 0..self.stack.len() {
            let value = self.stack[i];
            self.heap.mark_value(value);
        }
        for i in 0..self.frames.len() {
            let frame = self.frames[i];
            self.heap.mark_object(frame.closure);
            self.heap.mark_object(frame.function);
        }
        let mut open = self.open_upvalues;
        while let Some(id) = open {
            self.heap.mark_object(id);
            open = self.heap.upvalue(id).next;
        }
        for (key, value) in self.globals.iter() {
            self.heap.mark_object(key);
            self.heap.mark_value(value);
        }
        for i in 0..self.loading.len() {
            let id = self.loading[i];
            self.heap.mark_object(id);
        }
        for i in 0..self.compiler_roots.len() {
            let id = self.compiler_roots[i];
            self.heap.mark_object(id);
        }
        let error = self.error;
        self.heap.mark_value(error);
        self.heap.mark_temp_roots();

        self.heap.trace_references();

        // Interned strings are weak references: evict the dead before the
        // sweep frees them.
        let heap = &self.heap;
        self.strings.remove_unmarked(|id| heap.is_marked(id));

        self.heap.sweep();
    }

    // Allocation and interning ------------------------------------------

    /// The allocator. Collects first when the byte budget (or stress mode)
    /// says so, while the roots still cover everything `obj` refers to.
    pub(crate) fn allocate(&mut self, obj: Obj) -> HeapId {
        if self.heap.should_collect(obj.size_estimate()) {
            self.collect_garbage();
        }
        self.heap.allocate(obj)
    }

    /// Interns `text`, returning the one string object for those bytes.
    pub(crate) fn intern(&mut self, text: &str) -> HeapId {
        let hash = hash_string(text.as_bytes());
        let heap = &self.heap;
        if let Some(existing) = self.strings.find_string(hash, |id| heap.str(id).chars == text) {
            return existing;
        }
        self.intern_new(text.to_string(), hash)
    }

    /// Interning entry point for strings built at runtime.
    pub(crate) fn intern_owned(&mut self, text: String) -> HeapId {
        let hash = hash_string(text.as_bytes());
        let heap = &self.heap;
        if let Some(existing) = self.strings.find_string(hash, |id| heap.str(id).chars == text) {
            return existing;
        }
        self.intern_new(text, hash)
    }

    fn intern_new(&mut self, text: String, hash: u32) -> HeapId {
        let id = self.allocate(Obj::Str(ObjStr { chars: text, hash }));
        let before = self.strings.byte_size();
        self.strings.set(id, hash, Value::Nil);
        let grown = self.strings.byte_size().saturating_sub(before);
        self.heap.charge(grown);
        id
    }

    fn define_native(&mut self, name: &str, function: NativeFn) {
        let name = self.intern(name);
        self.heap.push_temp_root(Value::Obj(name));
        let native = self.allocate(Obj::Native(ObjNative { function }));
        self.heap.pop_temp_root();
        let hash = self.heap.str(name).hash;
        let before = self.globals.byte_size();
        self.globals.set(name, hash, Value::Obj(native));
        let grown = self.globals.byte_size().saturating_sub(before);
        self.heap.charge(grown);
    }

    /// Installs a VM-wide global. Only the bootstrap module may reach this,
    /// via the `__native_global` native.
    pub(crate) fn define_vm_global(&mut self, name: HeapId, value: Value) {
        let hash = self.heap.str(name).hash;
        let before = self.globals.byte_size();
        self.globals.set(name, hash, value);
        let grown = self.globals.byte_size().saturating_sub(before);
        self.heap.charge(grown);
    }

    /// True when the currently executing function belongs to the privileged
    /// bootstrap module.
    pub(crate) fn in_privileged_module(&self) -> bool {
        let Some(frame) = self.frames.last() else {
            return false;
        };
        let module = self.heap.function(frame.function).module;
        self.heap.str(self.heap.module(module).name).chars == GLOBALS_MODULE
    }

    pub(crate) fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    pub(crate) fn elapsed_seconds(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    pub(crate) fn print(&mut self, text: &str) {
        self.writer.print(text);
    }

    /// Compiles and runs the bootstrap module. Its natives fill the VM-wide
    /// globals table; everything it does is bundled source, so failure is a
    /// bug in this crate rather than in user code.
    fn load_globals_module(&mut self) {
        let source = core_module_source(GLOBALS_MODULE).expect("bootstrap module is bundled");
        let name = self.intern(GLOBALS_MODULE);
        self.heap.push_temp_root(Value::Obj(name));
        let module = self.allocate(Obj::Module(ObjModule {
            name,
            variables: SymbolTable::new(),
        }));
        self.heap.pop_temp_root();

        let function = match compile(self, module, source) {
            Ok(function) => function,
            Err(errors) => panic!("bootstrap module failed to compile: {errors:?}"),
        };
        self.heap.push_temp_root(Value::Obj(function));
        let closure = self.allocate(Obj::Closure(ObjClosure {
            function,
            upvalues: Vec::new(),
        }));
        self.heap.pop_temp_root();

        self.push(Value::Obj(closure));
        let result = self.call_closure(closure, 0).and_then(|()| self.run());
        if let Err(error) = result {
            panic!("bootstrap module failed to initialize: {error}");
        }
        self.frames.clear();
    }

    // Stack and frames ---------------------------------------------------

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("no active call frame")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("no active call frame")
    }

    #[cfg(test)]
    pub(crate) fn stack_len(&self) -> usize {
        self.stack.len()
    }

    fn current_module(&self) -> HeapId {
        self.heap.function(self.frame().function).module
    }

    // Instruction decoding ----------------------------------------------

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("no active call frame");
        let byte = self.heap.function(frame.function).chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_short(&mut self) -> usize {
        let hi = self.read_byte() as usize;
        let lo = self.read_byte() as usize;
        (hi << 8) | lo
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        let frame = self.frame();
        self.heap.function(frame.function).chunk.constants[index]
    }

    fn read_string_constant(&mut self) -> HeapId {
        match self.read_constant() {
            Value::Obj(id) if matches!(self.heap.obj(id), Obj::Str(_)) => id,
            other => panic!("expected a string constant, found {other:?}"),
        }
    }

    // Errors -------------------------------------------------------------

    /// Sets the error slot to `message` and raises.
    fn fail(&mut self, message: String) -> RuntimeError {
        self.set_error_message(&message);
        self.raise()
    }

    /// Converts the pending error into a [`RuntimeError`] with a stack
    /// trace, then resets all execution state.
    fn raise(&mut self) -> RuntimeError {
        let message = self.error.display(&self.heap);
        let mut trace = Vec::new();
        for frame in self.frames.iter().rev() {
            let function = self.heap.function(frame.function);
            let module = self.heap.module(function.module);
            let function_name = match function.name {
                Some(name) => self.heap.str(name).chars.clone(),
                None => "(script)".to_string(),
            };
            trace.push(TraceFrame {
                module: self.heap.str(module.name).chars.clone(),
                function: function_name,
                line: function.chunk.line_at(frame.ip.saturating_sub(1)),
            });
        }

        self.stack.clear();
        self.frames.clear();
        self.open_upvalues = None;
        self.loading.clear();
        self.error = Value::Nil;

        RuntimeError { message, trace }
    }

    // The dispatch loop --------------------------------------------------

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            // Natives report errors by setting the error slot; raise at the
            // next boundary.
            if self.has_error() {
                return Err(self.raise());
            }

            let byte = self.read_byte();
            let op = Opcode::from_repr(byte).expect("invalid opcode byte");
            match op {
                Opcode::Constant => {
                    let value = self.read_constant();
                    self.push(value);
                }

                Opcode::Error => {
                    let value = self.read_constant();
                    self.error = value;
                    return Err(self.raise());
                }

                Opcode::Add => self.add()?,
                Opcode::Minus => self.arithmetic(op)?,
                Opcode::Multiply => self.arithmetic(op)?,
                Opcode::Divide => self.arithmetic(op)?,
                Opcode::Modulo => self.modulo()?,

                Opcode::Not => {
                    let value = self.pop();
                    let Some(b) = value.as_bool() else {
                        return Err(self.fail("expected a boolean value".to_string()));
                    };
                    self.push(Value::Bool(!b));
                }

                Opcode::Gt | Opcode::Lt | Opcode::Gte | Opcode::Lte => self.comparison(op)?,

                Opcode::Eq => {
                    let b = self.pop();
                    let a = self.pop();
                    let equal = a.equals(b, &self.heap);
                    self.push(Value::Bool(equal));
                }

                Opcode::Neq => {
                    let b = self.pop();
                    let a = self.pop();
                    let equal = a.equals(b, &self.heap);
                    self.push(Value::Bool(!equal));
                }

                Opcode::True => self.push(Value::Bool(true)),
                Opcode::False => self.push(Value::Bool(false)),

                Opcode::Jump => {
                    let offset = self.read_short();
                    self.frame_mut().ip += offset;
                }

                Opcode::JumpIfFalse => {
                    let offset = self.read_short();
                    let value = self.pop();
                    let Some(condition) = value.as_bool() else {
                        return Err(self.fail("expected a boolean value".to_string()));
                    };
                    if !condition {
                        self.frame_mut().ip += offset;
                    }
                }

                Opcode::JumpIfTrue => {
                    let offset = self.read_short();
                    let value = self.pop();
                    let Some(condition) = value.as_bool() else {
                        return Err(self.fail("expected a boolean value".to_string()));
                    };
                    if condition {
                        self.frame_mut().ip += offset;
                    }
                }

                Opcode::JumpIfNotMatch => {
                    let offset = self.read_short();
                    let lambda = self.pop();
                    let pattern = self.pop();
                    let value = self.peek(0);

                    if self.values_match(pattern, value) {
                        self.pop();
                        self.push(lambda);
                        self.destructure(pattern, value);
                    } else {
                        self.frame_mut().ip += offset;
                    }
                }

                Opcode::Loop => {
                    let target = self.read_short();
                    self.frame_mut().ip = target;
                }

                Opcode::DefineGlobal => {
                    let name = self.read_string_constant();
                    let value = self.peek(0);
                    let module = self.current_module();
                    let hash = self.heap.str(name).hash;
                    let before = self.heap.module(module).variables.byte_size();
                    self.heap.module_mut(module).variables.set(name, hash, value);
                    let grown = self
                        .heap
                        .module(module)
                        .variables
                        .byte_size()
                        .saturating_sub(before);
                    self.heap.charge(grown);
                    self.pop();
                }

                Opcode::GetGlobal => {
                    let name = self.read_string_constant();
                    let hash = self.heap.str(name).hash;
                    let module = self.current_module();
                    let value = self
                        .heap
                        .module(module)
                        .variables
                        .get(name, hash)
                        .or_else(|| self.globals.get(name, hash));
                    match value {
                        Some(value) => self.push(value),
                        None => {
                            let text = self.heap.str(name).chars.clone();
                            return Err(self.fail(format!("Undefined variable: {text}")));
                        }
                    }
                }

                Opcode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().slots;
                    let old = self.stack[base + slot];
                    let new = self.peek(0);
                    if !old.assignable_from(new, &self.heap) {
                        let message = format!(
                            "Cannot assign '{}' to variable of type '{}'",
                            new.type_name(&self.heap),
                            old.type_name(&self.heap)
                        );
                        return Err(self.fail(message));
                    }
                    self.stack[base + slot] = new;
                }

                Opcode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().slots;
                    let value = self.stack[base + slot];
                    self.push(value);
                }

                Opcode::SetUpvalue => {
                    let index = self.read_byte() as usize;
                    let upvalue = self.heap.closure(self.frame().closure).upvalues[index];
                    let value = self.peek(0);
                    match self.heap.upvalue(upvalue).state {
                        UpvalueState::Open(slot) => self.stack[slot] = value,
                        UpvalueState::Closed(_) => {
                            self.heap.upvalue_mut(upvalue).state = UpvalueState::Closed(value);
                        }
                    }
                }

                Opcode::GetUpvalue => {
                    let index = self.read_byte() as usize;
                    let upvalue = self.heap.closure(self.frame().closure).upvalues[index];
                    let value = match self.heap.upvalue(upvalue).state {
                        UpvalueState::Open(slot) => self.stack[slot],
                        UpvalueState::Closed(value) => value,
                    };
                    self.push(value);
                }

                Opcode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }

                Opcode::GetImportedVariable => {
                    let name = self.read_string_constant();
                    let receiver = self.pop();
                    let module = match receiver {
                        Value::Obj(id) if matches!(self.heap.obj(id), Obj::Module(_)) => id,
                        _ => return Err(self.fail("expected a module value".to_string())),
                    };
                    let hash = self.heap.str(name).hash;
                    match self.heap.module(module).variables.get(name, hash) {
                        Some(value) => self.push(value),
                        None => {
                            let variable = self.heap.str(name).chars.clone();
                            let module_name =
                                self.heap.str(self.heap.module(module).name).chars.clone();
                            return Err(self.fail(format!(
                                "Variable '{variable}' not found in module '{module_name}'"
                            )));
                        }
                    }
                }

                Opcode::String => {
                    let value = self.pop();
                    let text = value.display(&self.heap);
                    let id = self.intern_owned(text);
                    self.push(Value::Obj(id));
                }

                Opcode::Call => {
                    let argc = self.read_byte() as usize;
                    let callee = self.peek(argc);
                    self.call_value(callee, argc)?;
                }

                Opcode::Closure => {
                    let function = match self.read_constant() {
                        Value::Obj(id) if matches!(self.heap.obj(id), Obj::Function(_)) => id,
                        other => panic!("expected a function constant, found {other:?}"),
                    };
                    let upvalue_count = self.heap.function(function).upvalue_count;
                    let closure = self.allocate(Obj::Closure(ObjClosure {
                        function,
                        upvalues: Vec::with_capacity(upvalue_count),
                    }));
                    // Push before capturing: captures can allocate, and the
                    // closure must be reachable throughout.
                    self.push(Value::Obj(closure));

                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        let upvalue = if is_local {
                            let slot = self.frame().slots + index;
                            self.capture_upvalue(slot)
                        } else {
                            self.heap.closure(self.frame().closure).upvalues[index]
                        };
                        self.heap.closure_mut(closure).upvalues.push(upvalue);
                    }
                }

                Opcode::Return => self.do_return(),

                Opcode::Pop => {
                    self.pop();
                }

                Opcode::Debug => {
                    let value = self.pop();
                    let text = value.display(&self.heap);
                    self.print(&text);
                    self.print("\n");
                }

                Opcode::ImportModule => {
                    let name = self.read_string_constant();
                    self.import_module(name)?;
                }

                Opcode::EndModule => {
                    self.push(Value::Nil);
                    if self.frames.len() > 1 {
                        // An imported module finished: return to the
                        // importer and discard the module body's result.
                        self.do_return();
                        self.pop();
                        self.loading.pop();
                    }
                }

                Opcode::Exit => {
                    self.pop(); // the nil pushed by EndModule
                    self.pop(); // the root closure
                    return Ok(());
                }
            }
        }
    }

    // Arithmetic ---------------------------------------------------------

    fn add(&mut self) -> Result<(), RuntimeError> {
        if self.peek(0).is_string(&self.heap) && self.peek(1).is_string(&self.heap) {
            self.concatenate();
            return Ok(());
        }
        self.arithmetic(Opcode::Add)
    }

    fn concatenate(&mut self) {
        let b = self.peek(0);
        let a = self.peek(1);
        let mut text = self
            .string_contents(a)
            .expect("concatenate called on non-strings")
            .to_string();
        text.push_str(
            self.string_contents(b)
                .expect("concatenate called on non-strings"),
        );
        // Operands stay on the stack while the result is interned, so a
        // collection here cannot free them.
        let id = self.intern_owned(text);
        self.pop();
        self.pop();
        self.push(Value::Obj(id));
    }

    fn binary_operands(&mut self) -> Result<(f64, f64), RuntimeError> {
        let (Some(b), Some(a)) = (self.peek(0).as_number(), self.peek(1).as_number()) else {
            return Err(self.fail("Expected numeric or string operands".to_string()));
        };
        self.pop();
        self.pop();
        Ok((a, b))
    }

    fn arithmetic(&mut self, op: Opcode) -> Result<(), RuntimeError> {
        let (a, b) = self.binary_operands()?;
        let result = match op {
            Opcode::Add => a + b,
            Opcode::Minus => a - b,
            Opcode::Multiply => a * b,
            // IEEE-754: division by zero yields an infinity.
            Opcode::Divide => a / b,
            _ => unreachable!("not an arithmetic opcode: {op}"),
        };
        self.push(Value::Number(result));
        Ok(())
    }

    fn modulo(&mut self) -> Result<(), RuntimeError> {
        let (a, b) = self.binary_operands()?;
        // Modulo truncates both operands toward zero.
        #[allow(clippy::cast_possible_truncation)]
        let (a, b) = (a.trunc() as i64, b.trunc() as i64);
        if b == 0 {
            return Err(self.fail("Cannot take modulo by zero".to_string()));
        }
        #[allow(clippy::cast_precision_loss)]
        self.push(Value::Number((a % b) as f64));
        Ok(())
    }

    fn comparison(&mut self, op: Opcode) -> Result<(), RuntimeError> {
        let (a, b) = self.binary_operands()?;
        let result = match op {
            Opcode::Gt => a > b,
            Opcode::Lt => a < b,
            Opcode::Gte => a >= b,
            Opcode::Lte => a <= b,
            _ => unreachable!("not a comparison opcode: {op}"),
        };
        self.push(Value::Bool(result));
        Ok(())
    }

    // Calls --------------------------------------------------------------

    fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), RuntimeError> {
        enum Kind {
            Closure,
            Native(NativeFn),
            Ctor,
            NotCallable,
        }

        let kind = match callee {
            Value::Obj(id) => match self.heap.obj(id) {
                Obj::Closure(_) => Kind::Closure,
                Obj::Native(native) => Kind::Native(native.function),
                Obj::Ctor(_) => Kind::Ctor,
                _ => Kind::NotCallable,
            },
            _ => Kind::NotCallable,
        };

        match kind {
            Kind::Closure => {
                let id = callee.as_obj().expect("closure callee is a heap value");
                self.call_closure(id, argc)
            }
            Kind::Native(function) => self.call_native(function, argc),
            Kind::Ctor => {
                let id = callee.as_obj().expect("ctor callee is a heap value");
                self.call_ctor(id, argc)
            }
            Kind::NotCallable => Err(self.fail("Can only call functions".to_string())),
        }
    }

    fn call_closure(&mut self, closure: HeapId, argc: usize) -> Result<(), RuntimeError> {
        let function = self.heap.closure(closure).function;
        let arity = self.heap.function(function).arity;
        if argc != arity {
            self.arity_error(arity, argc);
            return Err(self.raise());
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err(self.fail("Too many nested function calls".to_string()));
        }
        self.frames.push(CallFrame {
            closure,
            function,
            ip: 0,
            slots: self.stack.len() - argc,
        });
        Ok(())
    }

    fn call_native(&mut self, function: NativeFn, argc: usize) -> Result<(), RuntimeError> {
        let args_start = self.stack.len() - argc;
        // The copies are cheap (`Value` is `Copy`); the originals stay on
        // the stack as roots for the duration of the call.
        let args: Vec<Value> = self.stack[args_start..].to_vec();
        let result = function(self, &args);
        self.stack.truncate(args_start - 1); // arguments and the native
        self.push(result);
        if self.has_error() {
            return Err(self.raise());
        }
        Ok(())
    }

    fn call_ctor(&mut self, ctor: HeapId, argc: usize) -> Result<(), RuntimeError> {
        let arity = self.heap.ctor(ctor).arity;
        if argc != arity {
            self.arity_error(arity, argc);
            return Err(self.raise());
        }
        // Allocate first, while the fields are still rooted on the stack.
        let instance = self.allocate(Obj::Instance(ObjInstance {
            ctor,
            fields: vec![Value::Nil; arity],
        }));
        for i in 0..arity {
            let value = self.pop();
            self.heap.instance_mut(instance).fields[arity - 1 - i] = value;
        }
        self.pop(); // the constructor itself
        self.push(Value::Obj(instance));
        Ok(())
    }

    /// Tears down the current frame: the return value replaces the callee
    /// and its argument window, and any upvalues over that window close.
    fn do_return(&mut self) {
        let value = self.peek(0);
        let frame = self.frames.pop().expect("return without a call frame");
        self.close_upvalues(frame.slots);
        self.stack.truncate(frame.slots - 1);
        self.push(value);
    }

    // Pattern matching ---------------------------------------------------

    /// True if `pattern` matches `value`: constructor patterns match any
    /// instance of the same constructor, everything else is structural
    /// equality.
    fn values_match(&self, pattern: Value, value: Value) -> bool {
        if let (Value::Obj(p), Value::Obj(v)) = (pattern, value)
            && matches!(self.heap.obj(p), Obj::Ctor(_))
            && matches!(self.heap.obj(v), Obj::Instance(_))
        {
            return self.heap.instance(v).ctor == p;
        }
        pattern.equals(value, &self.heap)
    }

    /// Pushes an instance's fields in source order, so the equation
    /// lambda's parameters bind them naturally. Literal patterns have
    /// nothing to destructure.
    fn destructure(&mut self, pattern: Value, value: Value) {
        let Value::Obj(p) = pattern else { return };
        if !matches!(self.heap.obj(p), Obj::Ctor(_)) {
            return;
        }
        let instance = value.as_obj().expect("ctor patterns only match instances");
        let arity = self.heap.instance(instance).fields.len();
        for i in 0..arity {
            let field = self.heap.instance(instance).fields[i];
            self.push(field);
        }
    }

    // Upvalues -----------------------------------------------------------

    /// Finds or creates the open upvalue for `slot`, keeping the open list
    /// sorted by strictly descending slot.
    fn capture_upvalue(&mut self, slot: usize) -> HeapId {
        let mut prev: Option<HeapId> = None;
        let mut current = self.open_upvalues;
        while let Some(id) = current {
            let upvalue = self.heap.upvalue(id);
            match upvalue.open_slot() {
                Some(s) if s > slot => {
                    prev = Some(id);
                    current = upvalue.next;
                }
                Some(s) if s == slot => return id,
                _ => break,
            }
        }

        let created = self.allocate(Obj::Upvalue(ObjUpvalue {
            state: UpvalueState::Open(slot),
            next: current,
        }));
        match prev {
            None => self.open_upvalues = Some(created),
            Some(prev) => self.heap.upvalue_mut(prev).next = Some(created),
        }
        created
    }

    /// Closes every open upvalue at or above `floor`, moving the stack
    /// value into the upvalue's own cell.
    fn close_upvalues(&mut self, floor: usize) {
        while let Some(id) = self.open_upvalues {
            let Some(slot) = self.heap.upvalue(id).open_slot() else {
                break;
            };
            if slot < floor {
                break;
            }
            let value = self.stack[slot];
            let next = self.heap.upvalue(id).next;
            let upvalue = self.heap.upvalue_mut(id);
            upvalue.state = UpvalueState::Closed(value);
            upvalue.next = None;
            self.open_upvalues = next;
        }
    }

    // Modules ------------------------------------------------------------

    /// `IMPORT_MODULE`: resolve, compile and execute a module. Installs the
    /// module object as a variable of the importing module under the
    /// imported name.
    ///
    /// Every import recompiles and re-executes the module source against a
    /// fresh module object, rebinding the importer's variable each time.
    fn import_module(&mut self, name: HeapId) -> Result<(), RuntimeError> {
        let hash = self.heap.str(name).hash;

        if self.loading.contains(&name) {
            let text = self.heap.str(name).chars.clone();
            return Err(self.fail(format!("Circular import of module '{text}'")));
        }

        let text = self.heap.str(name).chars.clone();
        let source: String = match self.module_sources.get(&text) {
            Some(source) => source.clone(),
            None => match core_module_source(&text) {
                Some(source) => source.to_string(),
                None => return Err(self.fail(format!("Could not import module '{text}'"))),
            },
        };

        self.heap.push_temp_root(Value::Obj(name));
        let module = self.allocate(Obj::Module(ObjModule {
            name,
            variables: SymbolTable::new(),
        }));
        self.heap.pop_temp_root();

        self.heap.push_temp_root(Value::Obj(module));
        let compiled = compile(self, module, &source);
        self.heap.pop_temp_root();
        let function = match compiled {
            Ok(function) => function,
            Err(errors) => {
                let details: Vec<String> = errors.iter().map(ToString::to_string).collect();
                return Err(self.fail(format!(
                    "Could not compile module '{text}':\n{}",
                    details.join("\n")
                )));
            }
        };

        // Install before executing so the module is visible while its body
        // runs.
        self.install_import(name, hash, Value::Obj(module));

        self.heap.push_temp_root(Value::Obj(function));
        let closure = self.allocate(Obj::Closure(ObjClosure {
            function,
            upvalues: Vec::new(),
        }));
        self.heap.pop_temp_root();

        self.loading.push(name);
        self.push(Value::Obj(closure));
        self.call_closure(closure, 0)
    }

    /// Binds `module` under `name` in the importing module's table.
    fn install_import(&mut self, name: HeapId, hash: u32, module: Value) {
        let importer = self.current_module();
        let before = self.heap.module(importer).variables.byte_size();
        self.heap
            .module_mut(importer)
            .variables
            .set(name, hash, module);
        let grown = self
            .heap
            .module(importer)
            .variables
            .byte_size()
            .saturating_sub(before);
        self.heap.charge(grown);
    }
}
