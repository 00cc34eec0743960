// Tri-color mark-sweep garbage collector and the sole owner of every heap
// allocation. Grounded on original_source/Loxcpp/Vm.cpp's collectGarbage /
// markRoots / traceReferences / sweep / blackenObject: mark roots, walk a
// gray worklist to blacken them (pushing the objects *they* reference), weep
// the string-intern table of anything left white, then free every unmarked
// object. `bytes_allocated` / `next_gc` and `GROW_FACTOR` reproduce the same
// trigger heuristic.

use std::cell::Cell;

use crate::chunk::Chunk;
use crate::object::{
    hash_bytes, Obj, ObjBoundMethod, ObjClass, ObjClosure, ObjFunction, ObjInstance, ObjKind, ObjList,
    ObjNative, ObjRange, ObjRef, ObjString, ObjUpvalue,
};
use crate::table::Table;
use crate::value::Value;

const GROW_FACTOR: usize = 2;
const INITIAL_NEXT_GC: usize = 1024 * 1024;

fn log_gc() -> bool {
    env_flag("RUFF_LOG_GC")
}

pub fn stress_gc() -> bool {
    env_flag("RUFF_STRESS_GC")
}

fn env_flag(name: &str) -> bool {
    use std::sync::OnceLock;
    use std::collections::HashMap;
    use std::sync::Mutex;
    static CACHE: OnceLock<Mutex<HashMap<String, bool>>> = OnceLock::new();
    let cache = CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = cache.lock().unwrap();
    *guard.entry(name.to_string()).or_insert_with(|| std::env::var(name).is_ok())
}

/// Anything the collector needs to treat as a GC root but that doesn't live
/// inside the `Heap` itself. The VM and compiler populate this each cycle.
pub struct Roots<'a> {
    pub stack: &'a [Value],
    pub frames: &'a [ObjRef], // closures currently executing
    pub open_upvalues: &'a [ObjRef],
    pub globals: &'a Table,
    pub compiler_functions: &'a [ObjRef], // functions mid-compilation
}

pub struct Heap {
    objects: Vec<*mut Obj>,
    pub strings: Table,
    bytes_allocated: usize,
    next_gc: usize,
    gray_stack: Vec<ObjRef>,
}

impl Default for Heap {
    fn default() -> Self {
        Heap::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            objects: Vec::new(),
            strings: Table::new(),
            bytes_allocated: 0,
            next_gc: INITIAL_NEXT_GC,
            gray_stack: Vec::new(),
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn should_collect(&self) -> bool {
        stress_gc() || self.bytes_allocated > self.next_gc
    }

    fn alloc(&mut self, kind: ObjKind, size: usize) -> ObjRef {
        self.bytes_allocated += size;
        let boxed = Box::new(Obj { marked: Cell::new(false), kind });
        let ptr = Box::into_raw(boxed);
        self.objects.push(ptr);
        ObjRef::from_raw(ptr)
    }

    /// Interns (or reuses) a string. Strings are allocated and pushed onto
    /// the caller-supplied `protect` stack *before* the intern-table insert,
    /// so a GC triggered by the intern table's own growth cannot collect a
    /// string that exists nowhere else yet.
    pub fn take_string(&mut self, bytes: Vec<u8>, protect: &mut Vec<Value>) -> ObjRef {
        let hash = hash_bytes(&bytes);
        if let Some(existing) = self.strings.find_string(&bytes, hash) {
            return existing;
        }
        let size = bytes.len() + std::mem::size_of::<ObjString>();
        let obj = self.alloc(ObjKind::Str(ObjString::new(bytes)), size);
        protect.push(Value::Obj(obj));
        self.strings.set(obj, Value::Nil);
        protect.pop();
        obj
    }

    pub fn copy_string(&mut self, s: &str, protect: &mut Vec<Value>) -> ObjRef {
        self.take_string(s.as_bytes().to_vec(), protect)
    }

    /// Convenience for contexts (tests, native registration) with no live VM
    /// stack to protect against a reentrant GC.
    pub fn intern_str(&mut self, s: &str) -> ObjRef {
        let mut protect = Vec::new();
        self.copy_string(s, &mut protect)
    }

    pub fn new_function(&mut self) -> ObjRef {
        self.alloc(
            ObjKind::Function(ObjFunction { arity: 0, upvalue_count: 0, chunk: Chunk::new(), name: None }),
            std::mem::size_of::<ObjFunction>(),
        )
    }

    pub fn new_native(&mut self, native: ObjNative) -> ObjRef {
        self.alloc(ObjKind::Native(native), std::mem::size_of::<ObjNative>())
    }

    pub fn new_upvalue(&mut self, location: *mut Value) -> ObjRef {
        self.alloc(
            ObjKind::Upvalue(ObjUpvalue { location, closed: Value::Nil, is_closed: false, next_open: None }),
            std::mem::size_of::<ObjUpvalue>(),
        )
    }

    pub fn new_closure(&mut self, function: ObjRef) -> ObjRef {
        let upvalue_count = function.as_function().upvalue_count;
        self.alloc(
            ObjKind::Closure(ObjClosure { function, upvalues: Vec::with_capacity(upvalue_count) }),
            std::mem::size_of::<ObjClosure>(),
        )
    }

    pub fn new_class(&mut self, name: ObjRef) -> ObjRef {
        self.alloc(
            ObjKind::Class(ObjClass { name, methods: Table::new(), initializer: Value::Nil }),
            std::mem::size_of::<ObjClass>(),
        )
    }

    pub fn new_instance(&mut self, class: ObjRef) -> ObjRef {
        self.alloc(
            ObjKind::Instance(ObjInstance { class, fields: Table::new() }),
            std::mem::size_of::<ObjInstance>(),
        )
    }

    pub fn new_bound_method(&mut self, receiver: Value, method: ObjRef) -> ObjRef {
        self.alloc(
            ObjKind::BoundMethod(ObjBoundMethod { receiver, method }),
            std::mem::size_of::<ObjBoundMethod>(),
        )
    }

    pub fn new_range(&mut self, lower: f64, upper: f64) -> ObjRef {
        self.alloc(ObjKind::Range(ObjRange { lower, upper }), std::mem::size_of::<ObjRange>())
    }

    pub fn new_list(&mut self, items: Vec<Value>) -> ObjRef {
        let size = std::mem::size_of::<ObjList>() + items.len() * std::mem::size_of::<Value>();
        self.alloc(ObjKind::List(ObjList { items }), size)
    }

    fn mark_object(&mut self, obj: ObjRef) {
        if obj.is_marked() {
            return;
        }
        obj.mark();
        self.gray_stack.push(obj);
    }

    fn blacken_object(&mut self, obj: ObjRef) {
        let obj_ref = obj.as_ref();
        match &obj_ref.kind {
            ObjKind::Str(_) | ObjKind::Native(_) | ObjKind::Range(_) => {}
            ObjKind::Function(f) => {
                if let Some(name) = f.name {
                    self.mark_object(name);
                }
                for constant in &f.chunk.constants {
                    if let Value::Obj(o) = constant {
                        self.mark_object(*o);
                    }
                }
            }
            ObjKind::Upvalue(u) => {
                self.mark_value(u.closed);
            }
            ObjKind::Closure(c) => {
                self.mark_object(c.function);
                for up in &c.upvalues {
                    self.mark_object(*up);
                }
            }
            ObjKind::Class(c) => {
                self.mark_object(c.name);
                self.mark_value(c.initializer);
                for (k, v) in c.methods.iter() {
                    self.mark_object(k);
                    self.mark_value(v);
                }
            }
            ObjKind::Instance(i) => {
                self.mark_object(i.class);
                for (k, v) in i.fields.iter() {
                    self.mark_object(k);
                    self.mark_value(v);
                }
            }
            ObjKind::BoundMethod(b) => {
                self.mark_value(b.receiver);
                self.mark_object(b.method);
            }
            ObjKind::List(l) => {
                for v in &l.items {
                    self.mark_value(*v);
                }
            }
        }
    }

    fn mark_value(&mut self, value: Value) {
        if let Value::Obj(o) = value {
            self.mark_object(o);
        }
    }

    pub fn collect(&mut self, roots: Roots) {
        let before = self.bytes_allocated;
        if log_gc() {
            eprintln!("-- gc begin");
        }

        for v in roots.stack {
            self.mark_value(*v);
        }
        for closure in roots.frames {
            self.mark_object(*closure);
        }
        for up in roots.open_upvalues {
            self.mark_object(*up);
        }
        for func in roots.compiler_functions {
            self.mark_object(*func);
        }
        // globals is borrowed immutably by roots but mark_object needs &mut
        // self; collect its objects first without mutating the table.
        let mut pending = Vec::new();
        for (k, v) in roots.globals.iter() {
            pending.push(k);
            if let Value::Obj(o) = v {
                pending.push(o);
            }
        }
        for obj in pending {
            self.mark_object(obj);
        }

        while let Some(obj) = self.gray_stack.pop() {
            self.blacken_object(obj);
        }

        self.strings.remove_white();
        self.sweep();

        self.next_gc = self.bytes_allocated * GROW_FACTOR;
        if self.next_gc < INITIAL_NEXT_GC {
            self.next_gc = INITIAL_NEXT_GC;
        }

        if log_gc() {
            eprintln!(
                "-- gc end, collected {} bytes (from {} to {}), next at {}",
                before.saturating_sub(self.bytes_allocated),
                before,
                self.bytes_allocated,
                self.next_gc
            );
        }
    }

    fn sweep(&mut self) {
        let mut survivors = Vec::with_capacity(self.objects.len());
        for &ptr in &self.objects {
            let obj_ref = ObjRef::from_raw(ptr);
            if obj_ref.is_marked() {
                obj_ref.unmark();
                survivors.push(ptr);
            } else {
                let size = object_size(unsafe { &*ptr });
                self.bytes_allocated = self.bytes_allocated.saturating_sub(size);
                drop(unsafe { Box::from_raw(ptr) });
            }
        }
        self.objects = survivors;
    }
}

fn object_size(obj: &Obj) -> usize {
    match &obj.kind {
        ObjKind::Str(s) => s.bytes.len() + std::mem::size_of::<ObjString>(),
        ObjKind::Function(_) => std::mem::size_of::<ObjFunction>(),
        ObjKind::Native(_) => std::mem::size_of::<ObjNative>(),
        ObjKind::Upvalue(_) => std::mem::size_of::<ObjUpvalue>(),
        ObjKind::Closure(_) => std::mem::size_of::<ObjClosure>(),
        ObjKind::Class(_) => std::mem::size_of::<ObjClass>(),
        ObjKind::Instance(_) => std::mem::size_of::<ObjInstance>(),
        ObjKind::BoundMethod(_) => std::mem::size_of::<ObjBoundMethod>(),
        ObjKind::Range(_) => std::mem::size_of::<ObjRange>(),
        ObjKind::List(l) => std::mem::size_of::<ObjList>() + l.items.len() * std::mem::size_of::<Value>(),
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        for &ptr in &self.objects {
            drop(unsafe { Box::from_raw(ptr) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_same_content_returns_same_object() {
        let mut heap = Heap::new();
        let a = heap.intern_str("same");
        let b = heap.intern_str("same");
        assert!(a.ptr_eq(b));
    }

    #[test]
    fn collect_with_no_roots_frees_unreferenced_strings() {
        let mut heap = Heap::new();
        let _ = heap.intern_str("garbage");
        let globals = Table::new();
        heap.collect(Roots {
            stack: &[],
            frames: &[],
            open_upvalues: &[],
            globals: &globals,
            compiler_functions: &[],
        });
        assert_eq!(heap.strings.len(), 0);
    }

    #[test]
    fn collect_keeps_rooted_values_alive() {
        let mut heap = Heap::new();
        let s = heap.intern_str("keepme");
        let globals = Table::new();
        let stack = [Value::Obj(s)];
        heap.collect(Roots {
            stack: &stack,
            frames: &[],
            open_upvalues: &[],
            globals: &globals,
            compiler_functions: &[],
        });
        assert_eq!(heap.strings.len(), 1);
    }
}
