//! The heap arena and garbage collector.
//!
//! Every non-scalar value lives in a slot of the [`Heap`]. Slots are
//! addressed by [`HeapId`], so references stay valid across collections and
//! across reallocation of the VM's value stack. Collection is precise
//! mark-and-sweep: the VM marks its roots, [`Heap::trace_references`] drains
//! the gray work list, and [`Heap::sweep`] frees everything unmarked.
//!
//! Allocation is charged against a byte budget; the VM consults
//! [`Heap::should_collect`] before every allocation so a collection can run
//! while the object graph is still consistent. Objects that are built in
//! several steps (a module and its name, a closure and its upvalues) are
//! protected in between with the temporary-root stack.

use crate::bytecode::Chunk;
use crate::table::SymbolTable;
use crate::value::Value;
use crate::vm::NativeFn;

/// Index of a heap slot. The sole form of reference between heap objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapId(u32);

impl HeapId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// An interned string: UTF-8 bytes plus their precomputed FNV-1a hash.
#[derive(Debug)]
pub struct ObjStr {
    pub chars: String,
    pub hash: u32,
}

/// A compiled function: its owning module, arity, upvalue count and chunk.
///
/// `name` is `None` while the function is being compiled and for module
/// top-level bodies.
#[derive(Debug)]
pub struct ObjFunction {
    pub module: HeapId,
    pub arity: usize,
    pub upvalue_count: usize,
    pub chunk: Chunk,
    pub name: Option<HeapId>,
}

/// A function bundled with the upvalues it closed over.
///
/// `upvalues` is filled by the `CLOSURE` instruction immediately after
/// allocation; it reaches `function.upvalue_count` entries before any user
/// code can observe the closure.
#[derive(Debug)]
pub struct ObjClosure {
    pub function: HeapId,
    pub upvalues: Vec<HeapId>,
}

/// Where an upvalue's value currently lives.
#[derive(Debug, Clone, Copy)]
pub enum UpvalueState {
    /// The captured local is still on the stack at this slot index.
    Open(usize),
    /// The frame returned; the upvalue owns the value now.
    Closed(Value),
}

/// A heap cell that lets closures share a local beyond its frame's lifetime.
///
/// Open upvalues form a per-VM list through `next`, sorted by strictly
/// descending stack slot.
#[derive(Debug)]
pub struct ObjUpvalue {
    pub state: UpvalueState,
    pub next: Option<HeapId>,
}

impl ObjUpvalue {
    /// The stack slot this upvalue watches, if still open.
    pub fn open_slot(&self) -> Option<usize> {
        match self.state {
            UpvalueState::Open(slot) => Some(slot),
            UpvalueState::Closed(_) => None,
        }
    }
}

/// A host function callable from Oba code.
pub struct ObjNative {
    pub function: NativeFn,
}

impl std::fmt::Debug for ObjNative {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<native fn>")
    }
}

/// A named compilation unit with its own table of top-level variables.
#[derive(Debug)]
pub struct ObjModule {
    pub name: HeapId,
    pub variables: SymbolTable,
}

/// A data constructor declared by a `data` definition.
#[derive(Debug)]
pub struct ObjCtor {
    pub family: HeapId,
    pub name: HeapId,
    pub arity: usize,
}

/// A value produced by calling a constructor.
///
/// `fields` always has length `ctor.arity` and is fully initialized before
/// the instance is pushed onto the stack.
#[derive(Debug)]
pub struct ObjInstance {
    pub ctor: HeapId,
    pub fields: Vec<Value>,
}

/// The sum of every heap object variant.
#[derive(Debug)]
pub enum Obj {
    Str(ObjStr),
    Function(ObjFunction),
    Closure(ObjClosure),
    Upvalue(ObjUpvalue),
    Native(ObjNative),
    Module(ObjModule),
    Ctor(ObjCtor),
    Instance(ObjInstance),
}

impl Obj {
    /// Estimated byte footprint, used for the collection trigger.
    pub(crate) fn size_estimate(&self) -> usize {
        let payload = match self {
            Self::Str(s) => s.chars.capacity(),
            Self::Function(f) => f.chunk.byte_size(),
            Self::Closure(c) => c.upvalues.capacity() * std::mem::size_of::<HeapId>(),
            Self::Upvalue(_) | Self::Native(_) | Self::Ctor(_) => 0,
            Self::Module(m) => m.variables.byte_size(),
            Self::Instance(i) => i.fields.capacity() * std::mem::size_of::<Value>(),
        };
        std::mem::size_of::<Self>() + payload
    }
}

#[derive(Debug)]
struct HeapSlot {
    marked: bool,
    obj: Obj,
}

/// Heap growth factor: the next collection triggers at twice the bytes that
/// survived the previous one.
const HEAP_GROW_FACTOR: usize = 2;

/// Bytes allocated before the very first collection.
const FIRST_GC: usize = 1024 * 1024;

/// Arena of all heap objects plus the collector's bookkeeping.
#[derive(Debug)]
pub struct Heap {
    slots: Vec<Option<HeapSlot>>,
    free_list: Vec<u32>,
    bytes_allocated: usize,
    next_gc: usize,
    stress: bool,
    gray: Vec<HeapId>,
    temp_roots: Vec<Value>,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            bytes_allocated: 0,
            next_gc: FIRST_GC,
            stress: false,
            gray: Vec::new(),
            temp_roots: Vec::new(),
        }
    }

    /// When set, every allocation triggers a collection first. Used to shake
    /// out missing roots.
    pub fn set_stress(&mut self, stress: bool) {
        self.stress = stress;
    }

    /// Whether allocating `incoming` more bytes should collect first.
    pub(crate) fn should_collect(&self, incoming: usize) -> bool {
        self.stress || self.bytes_allocated + incoming > self.next_gc
    }

    pub(crate) fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Charges bytes for growth of an array embedded in a live object
    /// (symbol-table resizes, chiefly). The debt is observed by the next
    /// allocation's collection check.
    pub(crate) fn charge(&mut self, bytes: usize) {
        self.bytes_allocated += bytes;
    }

    /// Places `obj` in a slot and charges its footprint.
    ///
    /// This is the raw entry point: the caller (the VM) decides whether to
    /// collect first, while its roots still anchor everything `obj` refers
    /// to.
    pub(crate) fn allocate(&mut self, obj: Obj) -> HeapId {
        self.bytes_allocated += obj.size_estimate();
        let slot = HeapSlot { marked: false, obj };
        match self.free_list.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(slot);
                HeapId(index)
            }
            None => {
                let index = u32::try_from(self.slots.len()).expect("heap exhausted");
                self.slots.push(Some(slot));
                HeapId(index)
            }
        }
    }

    /// True if `id` refers to a live object.
    #[cfg(test)]
    pub(crate) fn contains(&self, id: HeapId) -> bool {
        self.slots
            .get(id.index())
            .is_some_and(|slot| slot.is_some())
    }

    // Accessors ---------------------------------------------------------

    pub(crate) fn obj(&self, id: HeapId) -> &Obj {
        &self.slots[id.index()]
            .as_ref()
            .expect("heap slot already freed")
            .obj
    }

    pub(crate) fn obj_mut(&mut self, id: HeapId) -> &mut Obj {
        &mut self.slots[id.index()]
            .as_mut()
            .expect("heap slot already freed")
            .obj
    }

    pub(crate) fn str(&self, id: HeapId) -> &ObjStr {
        match self.obj(id) {
            Obj::Str(s) => s,
            other => panic!("expected a string object, found {other:?}"),
        }
    }

    pub(crate) fn function(&self, id: HeapId) -> &ObjFunction {
        match self.obj(id) {
            Obj::Function(f) => f,
            other => panic!("expected a function object, found {other:?}"),
        }
    }

    pub(crate) fn function_mut(&mut self, id: HeapId) -> &mut ObjFunction {
        match self.obj_mut(id) {
            Obj::Function(f) => f,
            other => panic!("expected a function object, found {other:?}"),
        }
    }

    pub(crate) fn closure(&self, id: HeapId) -> &ObjClosure {
        match self.obj(id) {
            Obj::Closure(c) => c,
            other => panic!("expected a closure object, found {other:?}"),
        }
    }

    pub(crate) fn closure_mut(&mut self, id: HeapId) -> &mut ObjClosure {
        match self.obj_mut(id) {
            Obj::Closure(c) => c,
            other => panic!("expected a closure object, found {other:?}"),
        }
    }

    pub(crate) fn upvalue(&self, id: HeapId) -> &ObjUpvalue {
        match self.obj(id) {
            Obj::Upvalue(u) => u,
            other => panic!("expected an upvalue object, found {other:?}"),
        }
    }

    pub(crate) fn upvalue_mut(&mut self, id: HeapId) -> &mut ObjUpvalue {
        match self.obj_mut(id) {
            Obj::Upvalue(u) => u,
            other => panic!("expected an upvalue object, found {other:?}"),
        }
    }

    pub(crate) fn module(&self, id: HeapId) -> &ObjModule {
        match self.obj(id) {
            Obj::Module(m) => m,
            other => panic!("expected a module object, found {other:?}"),
        }
    }

    pub(crate) fn module_mut(&mut self, id: HeapId) -> &mut ObjModule {
        match self.obj_mut(id) {
            Obj::Module(m) => m,
            other => panic!("expected a module object, found {other:?}"),
        }
    }

    pub(crate) fn ctor(&self, id: HeapId) -> &ObjCtor {
        match self.obj(id) {
            Obj::Ctor(c) => c,
            other => panic!("expected a constructor object, found {other:?}"),
        }
    }

    pub(crate) fn instance(&self, id: HeapId) -> &ObjInstance {
        match self.obj(id) {
            Obj::Instance(i) => i,
            other => panic!("expected an instance object, found {other:?}"),
        }
    }

    pub(crate) fn instance_mut(&mut self, id: HeapId) -> &mut ObjInstance {
        match self.obj_mut(id) {
            Obj::Instance(i) => i,
            other => panic!("expected an instance object, found {other:?}"),
        }
    }

    // Temporary roots ---------------------------------------------------

    /// Anchors a value across the next allocations, protecting a freshly
    /// built object that nothing long-lived refers to yet.
    pub(crate) fn push_temp_root(&mut self, value: Value) {
        self.temp_roots.push(value);
    }

    pub(crate) fn pop_temp_root(&mut self) {
        self.temp_roots.pop().expect("temporary root stack underflow");
    }

    // Collection --------------------------------------------------------

    pub(crate) fn is_marked(&self, id: HeapId) -> bool {
        self.slots[id.index()]
            .as_ref()
            .is_some_and(|slot| slot.marked)
    }

    pub(crate) fn mark_value(&mut self, value: Value) {
        if let Value::Obj(id) = value {
            self.mark_object(id);
        }
    }

    /// Grays `id` if it hasn't been reached yet this collection.
    pub(crate) fn mark_object(&mut self, id: HeapId) {
        let slot = self.slots[id.index()]
            .as_mut()
            .expect("marked a freed heap slot");
        if slot.marked {
            return;
        }
        slot.marked = true;
        self.gray.push(id);
    }

    pub(crate) fn mark_temp_roots(&mut self) {
        for i in 0..self.temp_roots.len() {
            let value = self.temp_roots[i];
            self.mark_value(value);
        }
    }

    /// Drains the gray list, marking every object reachable from the roots
    /// marked so far.
    pub(crate) fn trace_references(&mut self) {
        while let Some(id) = self.gray.pop() {
            self.blacken(id);
        }
    }

    fn blacken(&mut self, id: HeapId) {
        let mut objs: Vec<HeapId> = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        match self.obj(id) {
            Obj::Str(_) | Obj::Native(_) => {}
            Obj::Function(function) => {
                objs.push(function.module);
                if let Some(name) = function.name {
                    objs.push(name);
                }
                values.extend_from_slice(&function.chunk.constants);
            }
            Obj::Closure(closure) => {
                objs.push(closure.function);
                objs.extend_from_slice(&closure.upvalues);
            }
            Obj::Upvalue(upvalue) => {
                if let Some(next) = upvalue.next {
                    objs.push(next);
                }
                if let UpvalueState::Closed(value) = upvalue.state {
                    values.push(value);
                }
            }
            Obj::Module(module) => {
                objs.push(module.name);
                for (key, value) in module.variables.iter() {
                    objs.push(key);
                    values.push(value);
                }
            }
            Obj::Ctor(ctor) => {
                objs.push(ctor.family);
                objs.push(ctor.name);
            }
            Obj::Instance(instance) => {
                objs.push(instance.ctor);
                values.extend_from_slice(&instance.fields);
            }
        }
        for obj in objs {
            self.mark_object(obj);
        }
        for value in values {
            self.mark_value(value);
        }
    }

    /// Frees everything unmarked, clears surviving marks, and resets the
    /// collection threshold.
    pub(crate) fn sweep(&mut self) {
        for (index, entry) in self.slots.iter_mut().enumerate() {
            match entry {
                Some(slot) if slot.marked => slot.marked = false,
                Some(slot) => {
                    self.bytes_allocated = self
                        .bytes_allocated
                        .saturating_sub(slot.obj.size_estimate());
                    *entry = None;
                    self.free_list
                        .push(u32::try_from(index).expect("heap exhausted"));
                }
                None => {}
            }
        }
        self.next_gc = self.bytes_allocated.max(FIRST_GC / 16) * HEAP_GROW_FACTOR;
    }
}

/// FNV-1a, the hash stored on every interned string and used by the symbol
/// tables.
#[must_use]
pub fn hash_string(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2_166_136_261;
    for &byte in bytes {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(16_777_619);
    }
    hash
}
